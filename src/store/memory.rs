use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::matching::geo::Coordinate;
use crate::model::{
    Account, CancelParty, JobRequest, JobStatus, Provider, SettlementRecord, WalletLedgerEntry,
};
use crate::store::{ChangeEvent, JobStore};

const DEFAULT_FEED_CAPACITY: usize = 1_024;

/// Reference implementation of [`JobStore`], and the serialization point
/// for single-node deployments and tests.
///
/// Every mutating call takes the write lock once, so each call is atomic
/// with respect to every other: conditional checks, ledger appends, and the
/// feed publish all happen under the same guard, which is exactly the
/// transaction a SQL-backed store would use.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    feed: broadcast::Sender<ChangeEvent>,
}

struct Inner {
    jobs: HashMap<Uuid, JobRequest>,
    providers: HashMap<Uuid, Provider>,
    settlements: HashMap<Uuid, SettlementRecord>,
    ledger: Vec<WalletLedgerEntry>,
    balances: HashMap<Account, i64>,
    seq: u64,
}

impl Inner {
    /// Append a zero-sum ledger group or nothing at all. Overdraft applies
    /// to requester and provider wallets only.
    fn append_group(&mut self, entries: Vec<WalletLedgerEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let net: i64 = entries.iter().map(|e| e.amount_cents).sum();
        if net != 0 {
            return Err(DispatchError::LedgerCorruption(format!(
                "refusing unbalanced ledger group netting {} cents",
                net
            )));
        }

        let mut deltas: HashMap<&Account, i64> = HashMap::new();
        for entry in &entries {
            *deltas.entry(&entry.account).or_insert(0) += entry.amount_cents;
        }
        for (account, delta) in deltas {
            if delta < 0 && account.overdraft_protected() {
                let available = self.balances.get(account).copied().unwrap_or(0);
                if available + delta < 0 {
                    return Err(DispatchError::InsufficientBalance {
                        account: account.to_string(),
                        needed_cents: -delta,
                        available_cents: available,
                    });
                }
            }
        }

        for entry in entries {
            *self.balances.entry(entry.account.clone()).or_insert(0) += entry.amount_cents;
            self.ledger.push(entry);
        }
        Ok(())
    }

    fn publish(&mut self, feed: &broadcast::Sender<ChangeEvent>, job: &JobRequest) {
        self.seq += 1;
        // Send fails only when nobody is subscribed, which is fine.
        let _ = feed.send(ChangeEvent {
            seq: self.seq,
            job: job.clone(),
        });
    }

    fn release_provider(&mut self, job: &JobRequest) {
        if let Some(provider_id) = job.provider_id {
            if let Some(provider) = self.providers.get_mut(&provider_id) {
                if provider.current_job == Some(job.id) {
                    provider.current_job = None;
                }
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_feed_capacity(DEFAULT_FEED_CAPACITY)
    }

    pub fn with_feed_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity);
        Self {
            inner: RwLock::new(Inner {
                jobs: HashMap::new(),
                providers: HashMap::new(),
                settlements: HashMap::new(),
                ledger: Vec::new(),
                balances: HashMap::new(),
                seq: 0,
            }),
            feed,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_job(
        &self,
        mut job: JobRequest,
        hold: Vec<WalletLedgerEntry>,
    ) -> Result<JobRequest> {
        let mut inner = self.inner.write().await;
        if inner.jobs.contains_key(&job.id) {
            return Err(DispatchError::InvalidRequest(format!(
                "job {} already exists",
                job.id
            )));
        }
        inner.append_group(hold)?;
        job.version = 1;
        inner.jobs.insert(job.id, job.clone());
        inner.publish(&self.feed, &job);
        Ok(job)
    }

    async fn job(&self, id: Uuid) -> Result<JobRequest> {
        let inner = self.inner.read().await;
        inner
            .jobs
            .get(&id)
            .cloned()
            .ok_or(DispatchError::JobNotFound(id))
    }

    async fn jobs_page(&self, offset: usize, limit: usize) -> Result<(Vec<JobRequest>, usize)> {
        let inner = self.inner.read().await;
        let mut all: Vec<&JobRequest> = inner.jobs.values().collect();
        all.sort_by_key(|j| j.created_at);
        let total = all.len();
        let page = all.into_iter().skip(offset).take(limit).cloned().collect();
        Ok((page, total))
    }

    async fn pending_jobs(&self) -> Result<Vec<JobRequest>> {
        let inner = self.inner.read().await;
        let mut pending: Vec<JobRequest> = inner
            .jobs
            .values()
            .filter(|j| j.is_claimable())
            .cloned()
            .collect();
        pending.sort_by_key(|j| j.created_at);
        Ok(pending)
    }

    async fn counts_by_status(&self) -> Result<HashMap<JobStatus, usize>> {
        let inner = self.inner.read().await;
        let mut counts = HashMap::new();
        for job in inner.jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn claim_job(&self, job_id: Uuid, provider_id: Uuid, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.write().await;

        if !inner.providers.contains_key(&provider_id) {
            return Err(DispatchError::ProviderNotFound(provider_id));
        }

        // The winner-take-all condition. Anything else is zero rows and the
        // caller classifies from a re-read.
        let claimable = inner.jobs.get(&job_id).is_some_and(|j| j.is_claimable());
        if !claimable {
            return Ok(0);
        }

        // One job at a time per provider, enforced at the same
        // serialization point as the claim itself.
        let provider = &inner.providers[&provider_id];
        if let Some(current_job) = provider.current_job {
            return Err(DispatchError::WorkerBusy {
                provider_id,
                current_job,
            });
        }

        let job = {
            let job = inner
                .jobs
                .get_mut(&job_id)
                .ok_or(DispatchError::JobNotFound(job_id))?;
            job.provider_id = Some(provider_id);
            job.status = JobStatus::Matched;
            job.claimed_at = Some(now);
            job.version += 1;
            job.clone()
        };
        if let Some(provider) = inner.providers.get_mut(&provider_id) {
            provider.current_job = Some(job_id);
        }
        inner.publish(&self.feed, &job);
        Ok(1)
    }

    async fn advance_job(&self, job_id: Uuid, expected: JobStatus, next: JobStatus) -> Result<u64> {
        let mut inner = self.inner.write().await;
        let job = match inner.jobs.get_mut(&job_id) {
            Some(job) if job.status == expected => {
                job.status = next;
                job.version += 1;
                job.clone()
            }
            _ => return Ok(0),
        };
        inner.publish(&self.feed, &job);
        Ok(1)
    }

    async fn apply_settlement(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        record: SettlementRecord,
        entries: Vec<WalletLedgerEntry>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;

        let holds = inner.jobs.get(&job_id).map(|j| j.status == expected);
        if holds != Some(true) {
            return Ok(0);
        }

        // Money first: if the group cannot apply, the status is untouched.
        inner.append_group(entries)?;

        let job = {
            let job = inner
                .jobs
                .get_mut(&job_id)
                .ok_or(DispatchError::JobNotFound(job_id))?;
            job.status = JobStatus::Completed;
            job.final_price_cents = Some(record.gross_cents);
            job.terminal_at = Some(now);
            job.version += 1;
            job.clone()
        };
        inner.release_provider(&job);
        inner.settlements.insert(job_id, record);
        inner.publish(&self.feed, &job);
        Ok(1)
    }

    async fn apply_cancellation(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        cancelled_by: CancelParty,
        reason: String,
        refund: Vec<WalletLedgerEntry>,
        manual_review: bool,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;

        let holds = inner.jobs.get(&job_id).map(|j| j.status == expected);
        if holds != Some(true) {
            return Ok(0);
        }

        inner.append_group(refund)?;

        let job = {
            let job = inner
                .jobs
                .get_mut(&job_id)
                .ok_or(DispatchError::JobNotFound(job_id))?;
            job.status = JobStatus::Cancelled;
            job.cancelled_by = Some(cancelled_by);
            job.cancel_reason = Some(reason);
            job.manual_review = manual_review;
            job.terminal_at = Some(now);
            job.version += 1;
            job.clone()
        };
        inner.release_provider(&job);
        inner.publish(&self.feed, &job);
        Ok(1)
    }

    async fn apply_tip(
        &self,
        job_id: Uuid,
        entries: Vec<WalletLedgerEntry>,
        tip_cents: i64,
    ) -> Result<u64> {
        let mut inner = self.inner.write().await;

        let completed = inner
            .jobs
            .get(&job_id)
            .is_some_and(|j| j.status == JobStatus::Completed);
        if !completed {
            return Ok(0);
        }
        let record = inner.settlements.get(&job_id).ok_or_else(|| {
            DispatchError::LedgerCorruption(format!(
                "job {} is completed but has no settlement record",
                job_id
            ))
        })?;
        // At most one tip: the conditional part of the update.
        if record.tip_cents.is_some() {
            return Ok(0);
        }

        inner.append_group(entries)?;
        if let Some(record) = inner.settlements.get_mut(&job_id) {
            record.tip_cents = Some(tip_cents);
        }
        Ok(1)
    }

    async fn settlement(&self, job_id: Uuid) -> Result<SettlementRecord> {
        let inner = self.inner.read().await;
        inner
            .settlements
            .get(&job_id)
            .cloned()
            .ok_or(DispatchError::JobNotFound(job_id))
    }

    async fn upsert_provider(&self, provider: Provider) -> Result<Provider> {
        let mut inner = self.inner.write().await;
        inner.providers.insert(provider.id, provider.clone());
        Ok(provider)
    }

    async fn provider(&self, id: Uuid) -> Result<Provider> {
        let inner = self.inner.read().await;
        inner
            .providers
            .get(&id)
            .cloned()
            .ok_or(DispatchError::ProviderNotFound(id))
    }

    async fn providers(&self) -> Result<Vec<Provider>> {
        let inner = self.inner.read().await;
        let mut all: Vec<Provider> = inner.providers.values().cloned().collect();
        all.sort_by_key(|p| p.id);
        Ok(all)
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        location: Option<Coordinate>,
        online: bool,
        now: DateTime<Utc>,
    ) -> Result<Provider> {
        let mut inner = self.inner.write().await;
        let provider = inner
            .providers
            .entry(id)
            .or_insert_with(|| Provider::auto_registered(id));
        if let Some(location) = location {
            provider.location = Some(location);
        }
        provider.online = online;
        provider.last_seen = now;
        Ok(provider.clone())
    }

    async fn sweep_stale_providers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut inner = self.inner.write().await;
        let mut swept = Vec::new();
        for provider in inner.providers.values_mut() {
            if provider.online && provider.last_seen < cutoff {
                provider.online = false;
                swept.push(provider.id);
            }
        }
        Ok(swept)
    }

    async fn append_entries(&self, entries: Vec<WalletLedgerEntry>) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.append_group(entries)
    }

    async fn balance(&self, account: &Account) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner.balances.get(account).copied().unwrap_or(0))
    }

    async fn entries_for_account(&self, account: &Account) -> Result<Vec<WalletLedgerEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .ledger
            .iter()
            .filter(|e| &e.account == account)
            .cloned()
            .collect())
    }

    async fn entries_for_job(&self, job_id: Uuid) -> Result<Vec<WalletLedgerEntry>> {
        let inner = self.inner.read().await;
        Ok(inner
            .ledger
            .iter()
            .filter(|e| e.job_id == Some(job_id))
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.feed.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntryKind, ServiceKind};

    fn pending_job() -> JobRequest {
        JobRequest::new(Uuid::new_v4(), ServiceKind::Ride, None, None, 10_000)
    }

    async fn provider(store: &MemoryStore) -> Provider {
        let p = Provider::new(Uuid::new_v4(), vec![ServiceKind::Ride], 10.0);
        store.upsert_provider(p.clone()).await.unwrap();
        p
    }

    #[tokio::test]
    async fn claim_is_first_writer_wins() {
        let store = MemoryStore::new();
        let job = store.insert_job(pending_job(), Vec::new()).await.unwrap();
        let a = provider(&store).await;
        let b = provider(&store).await;
        let now = Utc::now();

        assert_eq!(store.claim_job(job.id, a.id, now).await.unwrap(), 1);
        assert_eq!(store.claim_job(job.id, b.id, now).await.unwrap(), 0);

        let job = store.job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Matched);
        assert_eq!(job.provider_id, Some(a.id));
        assert_eq!(
            store.provider(a.id).await.unwrap().current_job,
            Some(job.id)
        );
    }

    #[tokio::test]
    async fn busy_provider_cannot_claim_second_job() {
        let store = MemoryStore::new();
        let first = store.insert_job(pending_job(), Vec::new()).await.unwrap();
        let second = store.insert_job(pending_job(), Vec::new()).await.unwrap();
        let p = provider(&store).await;
        let now = Utc::now();

        assert_eq!(store.claim_job(first.id, p.id, now).await.unwrap(), 1);
        let err = store.claim_job(second.id, p.id, now).await.unwrap_err();
        assert!(matches!(err, DispatchError::WorkerBusy { .. }));
    }

    #[tokio::test]
    async fn every_mutation_bumps_version_and_publishes() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        let job = store.insert_job(pending_job(), Vec::new()).await.unwrap();
        assert_eq!(job.version, 1);

        let p = provider(&store).await;
        store.claim_job(job.id, p.id, Utc::now()).await.unwrap();

        let insert_event = rx.recv().await.unwrap();
        let claim_event = rx.recv().await.unwrap();
        assert_eq!(insert_event.job.version, 1);
        assert_eq!(claim_event.job.version, 2);
        assert!(claim_event.seq > insert_event.seq);
    }

    #[tokio::test]
    async fn unbalanced_group_is_rejected_whole() {
        let store = MemoryStore::new();
        let requester = Account::Requester(Uuid::new_v4());
        let entries = vec![WalletLedgerEntry::new(
            requester.clone(),
            500,
            EntryKind::Deposit,
            None,
        )];
        let err = store.append_entries(entries).await.unwrap_err();
        assert!(matches!(err, DispatchError::LedgerCorruption(_)));
        assert_eq!(store.balance(&requester).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn overdraft_is_rejected_without_partial_application() {
        let store = MemoryStore::new();
        let requester = Account::Requester(Uuid::new_v4());
        let entries = vec![
            WalletLedgerEntry::new(requester.clone(), -10_000, EntryKind::Hold, None),
            WalletLedgerEntry::new(Account::Escrow, 10_000, EntryKind::Hold, None),
        ];
        let err = store.append_entries(entries).await.unwrap_err();
        assert!(matches!(err, DispatchError::InsufficientBalance { .. }));
        assert_eq!(store.balance(&requester).await.unwrap(), 0);
        assert_eq!(store.balance(&Account::Escrow).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_settlement_precondition_moves_no_money() {
        let store = MemoryStore::new();
        let job = store.insert_job(pending_job(), Vec::new()).await.unwrap();
        let record = SettlementRecord {
            job_id: job.id,
            requester_id: job.requester_id,
            provider_id: Uuid::new_v4(),
            gross_cents: 10_000,
            commission_rate: 0.2,
            commission_cents: 2_000,
            worker_net_cents: 8_000,
            tip_cents: None,
            settled_at: Utc::now(),
        };
        let entries = vec![
            WalletLedgerEntry::new(Account::Escrow, -10_000, EntryKind::Capture, Some(job.id)),
            WalletLedgerEntry::new(Account::Platform, 10_000, EntryKind::Commission, Some(job.id)),
        ];

        // Job is pending, not in progress: zero rows, untouched ledger.
        let rows = store
            .apply_settlement(job.id, JobStatus::InProgress, record, entries, Utc::now())
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert_eq!(store.balance(&Account::Platform).await.unwrap(), 0);
        assert_eq!(store.job(job.id).await.unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn heartbeat_auto_registers_and_sweep_flips_offline() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let t0 = Utc::now();
        let p = store.record_heartbeat(id, None, true, t0).await.unwrap();
        assert!(p.online);
        assert!(p.accepts(ServiceKind::Shopping));

        let swept = store
            .sweep_stale_providers(t0 + chrono::Duration::seconds(30))
            .await
            .unwrap();
        assert_eq!(swept, vec![id]);
        assert!(!store.provider(id).await.unwrap().online);
    }
}
