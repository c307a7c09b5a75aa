use uuid::Uuid;

use thiserror::Error;

use crate::model::JobStatus;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Provider not found: {0}")]
    ProviderNotFound(Uuid),

    #[error("Job {job_id} already claimed by provider {winner:?}")]
    AlreadyClaimed {
        job_id: Uuid,
        winner: Option<Uuid>,
    },

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Provider {provider_id} is busy with job {current_job}")]
    WorkerBusy {
        provider_id: Uuid,
        current_job: Uuid,
    },

    #[error("Tip rejected for job {job_id}: {reason}")]
    TipRejected { job_id: Uuid, reason: String },

    #[error("Insufficient balance on {account}: need {needed_cents} cents, have {available_cents}")]
    InsufficientBalance {
        account: String,
        needed_cents: i64,
        available_cents: i64,
    },

    #[error("Ledger corruption: {0}")]
    LedgerCorruption(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Operation timed out after {0} ms, outcome unknown")]
    Timeout(u64),

    #[error("Node is draining, not accepting new work")]
    Draining,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
