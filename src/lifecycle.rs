use std::sync::Arc;

use uuid::Uuid;

use crate::config::CancelPolicy;
use crate::error::{DispatchError, Result};
use crate::model::{CancelParty, JobRequest, JobStatus};
use crate::notify::Notifier;
use crate::settlement::{FareInputs, SettlementEngine};
use crate::store::JobStore;

/// What the policy matrix says about a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundDecision {
    pub refund: bool,
    pub escalate: bool,
}

const FULL_REFUND: RefundDecision = RefundDecision {
    refund: true,
    escalate: false,
};
const NO_REFUND_ESCALATE: RefundDecision = RefundDecision {
    refund: false,
    escalate: true,
};

/// Refund policy matrix, keyed by who cancelled and the phase the job was
/// in. Before pickup nobody has rendered service, so the hold always goes
/// back. After pickup partial service exists; the default keeps the hold
/// and flags the job for manual review, unless the operator opted into
/// post-pickup refunds. System cancellations always make the requester
/// whole.
pub fn refund_decision(
    party: CancelParty,
    phase: JobStatus,
    policy: &CancelPolicy,
) -> RefundDecision {
    match (party, phase) {
        (CancelParty::System, _) => FULL_REFUND,
        (_, JobStatus::Pending | JobStatus::Matched | JobStatus::Arriving) => FULL_REFUND,
        (_, JobStatus::PickedUp | JobStatus::InProgress) => {
            if policy.refund_after_pickup {
                FULL_REFUND
            } else {
                NO_REFUND_ESCALATE
            }
        }
        // Terminal phases never reach the matrix; no refund either way.
        (_, JobStatus::Completed | JobStatus::Cancelled) => RefundDecision {
            refund: false,
            escalate: false,
        },
    }
}

/// Drives jobs along pending -> matched -> arriving -> picked_up ->
/// in_progress -> completed, with cancellation reachable from every
/// non-terminal state.
///
/// Every transition is a conditional update against the expected current
/// status; the machine never writes unconditionally. Idempotency key is
/// (job id, target state): a retry whose target equals the current status
/// reports success without a second write.
pub struct Lifecycle {
    store: Arc<dyn JobStore>,
    settlement: Arc<SettlementEngine>,
    notifier: Arc<dyn Notifier>,
    policy: CancelPolicy,
}

impl Lifecycle {
    pub fn new(
        store: Arc<dyn JobStore>,
        settlement: Arc<SettlementEngine>,
        notifier: Arc<dyn Notifier>,
        policy: CancelPolicy,
    ) -> Self {
        Self {
            store,
            settlement,
            notifier,
            policy,
        }
    }

    /// Advance a job one step along the happy path. `fare` is only
    /// meaningful for the completed transition, where it feeds settlement.
    pub async fn advance(
        &self,
        job_id: Uuid,
        target: JobStatus,
        fare: Option<FareInputs>,
    ) -> Result<JobRequest> {
        let job = self.store.job(job_id).await?;

        if job.status == target {
            // Duplicate of an applied transition: success, no second write.
            return Ok(job);
        }
        if target == JobStatus::Matched {
            // Matching happens through claims, never through advance.
            return Err(DispatchError::InvalidTransition {
                job_id,
                from: job.status,
                to: target,
            });
        }
        if target == JobStatus::Cancelled {
            return Err(DispatchError::InvalidRequest(
                "cancellation is a dedicated operation with a party and a reason".to_string(),
            ));
        }
        if job.status.next() != Some(target) {
            return Err(DispatchError::InvalidTransition {
                job_id,
                from: job.status,
                to: target,
            });
        }

        if target == JobStatus::Completed {
            return self.complete(job, fare).await;
        }

        let rows = self.store.advance_job(job_id, job.status, target).await?;
        if rows == 0 {
            // The row moved underneath us; one re-read names the outcome.
            let current = self.store.job(job_id).await?;
            if current.status == target {
                return Ok(current);
            }
            return Err(DispatchError::InvalidTransition {
                job_id,
                from: current.status,
                to: target,
            });
        }

        let job = self.store.job(job_id).await?;
        self.notifier.job_transitioned(&job).await;
        Ok(job)
    }

    /// The completed transition runs through settlement: money applies
    /// atomically with the status flip. A settlement the requester cannot
    /// cover leaves the job in progress and triggers the compensating
    /// cancellation before the error surfaces.
    async fn complete(&self, job: JobRequest, fare: Option<FareInputs>) -> Result<JobRequest> {
        match self.settlement.settle(&job, fare).await {
            Ok((job, _record)) => {
                self.notifier.job_transitioned(&job).await;
                Ok(job)
            }
            Err(err @ DispatchError::InsufficientBalance { .. }) => {
                tracing::warn!(
                    job_id = %job.id,
                    error = %err,
                    "Settlement uncovered, cancelling job"
                );
                self.cancel(
                    job.id,
                    CancelParty::System,
                    "settlement failed: fare not covered".to_string(),
                )
                .await?;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel from any non-terminal state, recording who and why. Runs the
    /// refund policy matrix for the phase the job is actually in at the
    /// store, retrying the conditional write when the phase moves
    /// underneath it.
    pub async fn cancel(
        &self,
        job_id: Uuid,
        party: CancelParty,
        reason: String,
    ) -> Result<JobRequest> {
        for _attempt in 0..3 {
            let job = self.store.job(job_id).await?;

            match job.status {
                JobStatus::Cancelled => return Ok(job),
                JobStatus::Completed => {
                    return Err(DispatchError::InvalidTransition {
                        job_id,
                        from: JobStatus::Completed,
                        to: JobStatus::Cancelled,
                    })
                }
                _ => {}
            }

            let decision = refund_decision(party, job.status, &self.policy);
            let refund = if decision.refund {
                self.settlement.refund_group(&job).await?
            } else {
                Vec::new()
            };
            if decision.escalate {
                tracing::warn!(
                    job_id = %job_id,
                    phase = %job.status,
                    party = %party,
                    "Post-pickup cancellation held for manual review"
                );
            }

            let rows = self
                .store
                .apply_cancellation(
                    job_id,
                    job.status,
                    party,
                    reason.clone(),
                    refund,
                    decision.escalate,
                    chrono::Utc::now(),
                )
                .await?;
            if rows > 0 {
                let job = self.store.job(job_id).await?;
                tracing::info!(
                    job_id = %job_id,
                    party = %party,
                    refund = decision.refund,
                    "Job cancelled"
                );
                self.notifier.job_transitioned(&job).await;
                return Ok(job);
            }
            // Phase moved between read and write; re-evaluate the matrix
            // against the new phase.
        }

        Err(DispatchError::Internal(format!(
            "cancellation of job {} kept racing with concurrent transitions",
            job_id
        )))
    }
}
