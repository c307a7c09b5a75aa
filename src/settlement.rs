use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CommissionSchedule;
use crate::error::{DispatchError, Result};
use crate::model::{
    Account, EntryKind, JobRequest, JobStatus, SettlementRecord, WalletLedgerEntry,
};
use crate::store::JobStore;

/// Metered fare components supplied at completion, integer cents. Absent a
/// breakdown, the declared price stands in for the subtotal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FareInputs {
    pub base_cents: i64,
    pub distance_cents: i64,
    pub time_cents: i64,
}

/// Computes the money side of terminal transitions: the booking hold at
/// creation, the commission split at completion, the refund at
/// cancellation, and the post-hoc tip.
///
/// All arithmetic is integer cents, so `commission + worker_net == gross`
/// holds exactly, and every group it emits nets to zero. The engine only
/// computes; atomicity belongs to the store call that applies the group
/// together with the status flip.
pub struct SettlementEngine {
    store: Arc<dyn JobStore>,
    commissions: CommissionSchedule,
    tip_window: Duration,
}

impl SettlementEngine {
    pub fn new(store: Arc<dyn JobStore>, commissions: CommissionSchedule, tip_window_mins: i64) -> Self {
        Self {
            store,
            commissions,
            tip_window: Duration::minutes(tip_window_mins),
        }
    }

    /// Gross fare: subtotal plus the surge adjustment, where the adjustment
    /// is `subtotal * (multiplier - 1)` rounded to whole cents. The
    /// multiplier is applied, never discovered here.
    pub fn gross_fare(job: &JobRequest, fare: Option<&FareInputs>) -> i64 {
        let subtotal = match fare {
            Some(f) => f.base_cents + f.distance_cents + f.time_cents,
            None => job.price_cents,
        };
        let surge = (subtotal as f64 * (job.surge_multiplier - 1.0)).round() as i64;
        subtotal + surge
    }

    /// Insert a new job together with its booking hold: the declared price
    /// moves from the requester's wallet into escrow, atomically with the
    /// insert. An uncovered hold fails with InsufficientBalance and the job
    /// is never created.
    pub async fn book(&self, job: JobRequest) -> Result<JobRequest> {
        if job.price_cents <= 0 {
            return Err(DispatchError::InvalidRequest(format!(
                "declared price must be positive, got {} cents",
                job.price_cents
            )));
        }
        let hold = vec![
            WalletLedgerEntry::new(
                Account::Requester(job.requester_id),
                -job.price_cents,
                EntryKind::Hold,
                Some(job.id),
            ),
            WalletLedgerEntry::new(Account::Escrow, job.price_cents, EntryKind::Hold, Some(job.id)),
        ];
        let job = self.store.insert_job(job, hold).await?;
        tracing::info!(
            job_id = %job.id,
            requester_id = %job.requester_id,
            price_cents = job.price_cents,
            "Job booked, hold placed"
        );
        Ok(job)
    }

    /// Amount currently held in escrow for a job, from the ledger itself.
    async fn held_amount(&self, job_id: Uuid) -> Result<i64> {
        let entries = self.store.entries_for_job(job_id).await?;
        let held: i64 = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Hold && e.account == Account::Escrow)
            .map(|e| e.amount_cents)
            .sum();
        Ok(held)
    }

    /// Settle a job that is in progress: capture the hold, split gross into
    /// commission and worker net, and complete the job, all in one
    /// conditional store application.
    ///
    /// The commission rate is looked up by service category now and
    /// snapshotted into the record; later schedule changes never alter it.
    /// When gross exceeds the hold the difference is debited from the
    /// requester in the same group; an uncovered difference fails with
    /// InsufficientBalance and the job stays in progress.
    pub async fn settle(
        &self,
        job: &JobRequest,
        fare: Option<FareInputs>,
    ) -> Result<(JobRequest, SettlementRecord)> {
        if job.status != JobStatus::InProgress {
            return Err(DispatchError::InvalidTransition {
                job_id: job.id,
                from: job.status,
                to: JobStatus::Completed,
            });
        }
        let provider_id = job.provider_id.ok_or_else(|| {
            DispatchError::LedgerCorruption(format!(
                "job {} is in progress without an assigned provider",
                job.id
            ))
        })?;

        let held = self.held_amount(job.id).await?;
        if held <= 0 {
            // A job cannot legally reach settlement without its booking
            // hold. Raise loudly, never auto-correct.
            return Err(DispatchError::LedgerCorruption(format!(
                "job {} reached settlement with no booking hold",
                job.id
            )));
        }

        let gross = Self::gross_fare(job, fare.as_ref());
        if gross <= 0 {
            return Err(DispatchError::InvalidRequest(format!(
                "gross fare must be positive, got {} cents",
                gross
            )));
        }
        let rate = self.commissions.rate_for(job.service);
        let commission = (gross as f64 * rate).round() as i64;
        let worker_net = gross - commission;

        let mut entries = vec![
            WalletLedgerEntry::new(Account::Escrow, -held, EntryKind::Capture, Some(job.id)),
            WalletLedgerEntry::new(
                Account::Provider(provider_id),
                worker_net,
                EntryKind::Payout,
                Some(job.id),
            ),
            WalletLedgerEntry::new(
                Account::Platform,
                commission,
                EntryKind::Commission,
                Some(job.id),
            ),
        ];
        // Fare above the hold debits the requester; below it, the unused
        // part of the hold flows back. Either way the group nets to zero.
        if held != gross {
            entries.push(WalletLedgerEntry::new(
                Account::Requester(job.requester_id),
                held - gross,
                EntryKind::Capture,
                Some(job.id),
            ));
        }

        let now = Utc::now();
        let record = SettlementRecord {
            job_id: job.id,
            requester_id: job.requester_id,
            provider_id,
            gross_cents: gross,
            commission_rate: rate,
            commission_cents: commission,
            worker_net_cents: worker_net,
            tip_cents: None,
            settled_at: now,
        };

        let rows = self
            .store
            .apply_settlement(job.id, JobStatus::InProgress, record.clone(), entries, now)
            .await?;
        if rows == 0 {
            // Somebody moved the job first. A concurrent identical settle
            // is a win; anything else is a conflict.
            let current = self.store.job(job.id).await?;
            if current.status == JobStatus::Completed {
                let record = self.store.settlement(job.id).await?;
                return Ok((current, record));
            }
            return Err(DispatchError::InvalidTransition {
                job_id: job.id,
                from: current.status,
                to: JobStatus::Completed,
            });
        }

        let job = self.store.job(job.id).await?;
        tracing::info!(
            job_id = %job.id,
            gross_cents = record.gross_cents,
            commission_cents = record.commission_cents,
            worker_net_cents = record.worker_net_cents,
            rate = record.commission_rate,
            "Job settled"
        );
        Ok((job, record))
    }

    /// The refund group for a cancellation: the original hold returns to
    /// the requester, nothing else. No commission on a job never performed.
    pub async fn refund_group(&self, job: &JobRequest) -> Result<Vec<WalletLedgerEntry>> {
        let held = self.held_amount(job.id).await?;
        if held <= 0 {
            return Err(DispatchError::LedgerCorruption(format!(
                "job {} owes a refund but has no booking hold",
                job.id
            )));
        }
        Ok(vec![
            WalletLedgerEntry::new(Account::Escrow, -held, EntryKind::Refund, Some(job.id)),
            WalletLedgerEntry::new(
                Account::Requester(job.requester_id),
                held,
                EntryKind::Refund,
                Some(job.id),
            ),
        ])
    }

    /// Post-completion tip: a separate ledger group credited to the
    /// provider, applied at most once within the tip window. Never merged
    /// into the original split.
    pub async fn tip(&self, job_id: Uuid, amount_cents: i64) -> Result<SettlementRecord> {
        if amount_cents <= 0 {
            return Err(DispatchError::InvalidRequest(format!(
                "tip must be positive, got {} cents",
                amount_cents
            )));
        }

        let job = self.store.job(job_id).await?;
        if job.status != JobStatus::Completed {
            return Err(DispatchError::TipRejected {
                job_id,
                reason: format!("job is {}, tips apply to completed jobs", job.status),
            });
        }
        let now = Utc::now();
        if let Some(terminal_at) = job.terminal_at {
            if now > terminal_at + self.tip_window {
                return Err(DispatchError::TipRejected {
                    job_id,
                    reason: "tip window has closed".to_string(),
                });
            }
        }
        let record = self.store.settlement(job_id).await?;
        if record.tip_cents.is_some() {
            return Err(DispatchError::TipRejected {
                job_id,
                reason: "tip already recorded".to_string(),
            });
        }

        let entries = vec![
            WalletLedgerEntry::new(
                Account::Requester(job.requester_id),
                -amount_cents,
                EntryKind::Tip,
                Some(job_id),
            ),
            WalletLedgerEntry::new(
                Account::Provider(record.provider_id),
                amount_cents,
                EntryKind::Tip,
                Some(job_id),
            ),
        ];

        let rows = self.store.apply_tip(job_id, entries, amount_cents).await?;
        if rows == 0 {
            return Err(DispatchError::TipRejected {
                job_id,
                reason: "tip no longer applicable".to_string(),
            });
        }
        let record = self.store.settlement(job_id).await?;
        tracing::info!(job_id = %job_id, tip_cents = amount_cents, "Tip recorded");
        Ok(record)
    }
}
