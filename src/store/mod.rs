//! The durable store port.
//!
//! Everything that mutates a job row goes through a conditional update that
//! reports how many rows it touched; callers never assume success without
//! checking the count. Ledger groups append atomically or not at all. The
//! change feed is at-least-once with a global sequence, and consumers
//! de-duplicate by row version.

pub mod memory;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::matching::geo::Coordinate;
use crate::model::{
    Account, CancelParty, JobRequest, JobStatus, Provider, SettlementRecord, WalletLedgerEntry,
};

pub use memory::MemoryStore;

/// One change-feed event: a full row snapshot plus the global sequence
/// number it was published under. The snapshot carries the row version used
/// for de-duplication.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub seq: u64,
    pub job: JobRequest,
}

/// Store port for jobs, providers, and the wallet ledger.
///
/// The in-memory implementation in [`memory`] is the reference for the
/// semantics; SQL-backed stores implement the same contract with row
/// `UPDATE ... WHERE` conditions and transactions.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new pending job together with its booking hold, atomically.
    /// Fails with InsufficientBalance when the requester cannot cover the
    /// hold, in which case nothing is written.
    async fn insert_job(&self, job: JobRequest, hold: Vec<WalletLedgerEntry>)
        -> Result<JobRequest>;

    async fn job(&self, id: Uuid) -> Result<JobRequest>;

    /// Jobs ordered by creation time, newest page math left to the caller.
    /// Returns the page plus the total count.
    async fn jobs_page(&self, offset: usize, limit: usize) -> Result<(Vec<JobRequest>, usize)>;

    /// Pending, unassigned jobs (the claimable set).
    async fn pending_jobs(&self) -> Result<Vec<JobRequest>>;

    async fn counts_by_status(&self) -> Result<HashMap<JobStatus, usize>>;

    /// Winner-take-all claim: set the provider and flip pending -> matched,
    /// only where the job is still pending and unassigned. Returns the
    /// affected-row count (0 means somebody else won or the job is gone).
    /// The provider's current-job is set in the same transaction; a busy
    /// provider fails with WorkerBusy before any write.
    async fn claim_job(&self, job_id: Uuid, provider_id: Uuid, now: DateTime<Utc>) -> Result<u64>;

    /// Conditional status advance: `WHERE status = expected`. Returns the
    /// affected-row count; 0 means the precondition no longer held.
    async fn advance_job(&self, job_id: Uuid, expected: JobStatus, next: JobStatus) -> Result<u64>;

    /// Terminal completion: flip `expected` -> completed, write the final
    /// price, release the provider, store the settlement record and append
    /// its ledger group, all atomically. 0 rows means the status
    /// precondition failed and no money moved.
    async fn apply_settlement(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        record: SettlementRecord,
        entries: Vec<WalletLedgerEntry>,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Terminal cancellation: flip `expected` -> cancelled, record the
    /// cancelling party and reason, release the provider, and append the
    /// refund group (possibly empty), all atomically.
    async fn apply_cancellation(
        &self,
        job_id: Uuid,
        expected: JobStatus,
        cancelled_by: CancelParty,
        reason: String,
        refund: Vec<WalletLedgerEntry>,
        manual_review: bool,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Post-hoc tip: append the tip group and set the record's tip amount,
    /// only where the job is completed and no tip has been recorded yet.
    async fn apply_tip(
        &self,
        job_id: Uuid,
        entries: Vec<WalletLedgerEntry>,
        tip_cents: i64,
    ) -> Result<u64>;

    async fn settlement(&self, job_id: Uuid) -> Result<SettlementRecord>;

    async fn upsert_provider(&self, provider: Provider) -> Result<Provider>;

    async fn provider(&self, id: Uuid) -> Result<Provider>;

    async fn providers(&self) -> Result<Vec<Provider>>;

    /// Record a heartbeat, auto-registering unknown providers.
    async fn record_heartbeat(
        &self,
        id: Uuid,
        location: Option<Coordinate>,
        online: bool,
        now: DateTime<Utc>,
    ) -> Result<Provider>;

    /// Mark providers whose last heartbeat predates `cutoff` as offline.
    /// Returns the ids that were flipped.
    async fn sweep_stale_providers(&self, cutoff: DateTime<Utc>) -> Result<Vec<Uuid>>;

    /// Append a free-standing ledger group (deposits). Same atomicity and
    /// overdraft rules as the job-bound groups.
    async fn append_entries(&self, entries: Vec<WalletLedgerEntry>) -> Result<()>;

    async fn balance(&self, account: &Account) -> Result<i64>;

    async fn entries_for_account(&self, account: &Account) -> Result<Vec<WalletLedgerEntry>>;

    async fn entries_for_job(&self, job_id: Uuid) -> Result<Vec<WalletLedgerEntry>>;

    /// Subscribe to the change feed. Receivers that fall behind see a
    /// lagged error and must resync from a snapshot.
    fn subscribe(&self) -> broadcast::Receiver<ChangeEvent>;
}
