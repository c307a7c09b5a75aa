use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::model::{JobRequest, JobStatus};
use crate::store::JobStore;

/// Resolves concurrent claim attempts with an at-most-one-winner guarantee.
///
/// The decision is a single conditional update at the store: assign the
/// provider and flip pending to matched only where the job is still pending
/// and unassigned. The coordinator never decides from an application-side
/// read; a re-read happens only after a zero-row result, purely to name the
/// failure.
pub struct ClaimCoordinator {
    store: Arc<dyn JobStore>,
    timeout_ms: u64,
}

impl ClaimCoordinator {
    pub fn new(store: Arc<dyn JobStore>, timeout_ms: u64) -> Self {
        Self { store, timeout_ms }
    }

    /// Attempt to take ownership of a pending job for `provider_id`.
    ///
    /// Returns the claimed job on a win. A claim that times out against the
    /// store surfaces as [`DispatchError::Timeout`]: the outcome is unknown
    /// and the caller should retry, which is safe because a retry that
    /// finds the job already assigned to this provider reports a win.
    pub async fn claim(&self, job_id: Uuid, provider_id: Uuid) -> Result<JobRequest> {
        // Local busy check before touching the job row. An optimization
        // only; the store enforces the same rule at the serialization
        // point. A provider holding this very job falls through so the
        // idempotent-win path below can answer.
        let provider = self.store.provider(provider_id).await?;
        if let Some(current_job) = provider.current_job {
            if current_job != job_id {
                return Err(DispatchError::WorkerBusy {
                    provider_id,
                    current_job,
                });
            }
        }

        let attempt = self.store.claim_job(job_id, provider_id, Utc::now());
        let rows = match tokio::time::timeout(Duration::from_millis(self.timeout_ms), attempt).await
        {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(
                    job_id = %job_id,
                    provider_id = %provider_id,
                    timeout_ms = self.timeout_ms,
                    "Claim timed out, outcome unknown until re-read"
                );
                return Err(DispatchError::Timeout(self.timeout_ms));
            }
        };

        if rows > 0 {
            let job = self.store.job(job_id).await?;
            tracing::info!(job_id = %job_id, provider_id = %provider_id, "Claim won");
            return Ok(job);
        }

        self.classify_loss(job_id, provider_id).await
    }

    /// Zero rows affected: read the row once and name what happened. The
    /// read is descriptive, never part of the decision.
    async fn classify_loss(&self, job_id: Uuid, provider_id: Uuid) -> Result<JobRequest> {
        let job = self.store.job(job_id).await?;

        if job.provider_id == Some(provider_id) {
            // An earlier attempt (typically one that timed out) already
            // won; report the win instead of a conflict.
            tracing::info!(job_id = %job_id, provider_id = %provider_id, "Claim retry found earlier win");
            return Ok(job);
        }

        match job.status {
            JobStatus::Cancelled => Err(DispatchError::InvalidTransition {
                job_id,
                from: JobStatus::Cancelled,
                to: JobStatus::Matched,
            }),
            JobStatus::Pending if job.provider_id.is_none() => {
                // The conditional update reported no effect on a row that
                // still looks claimable. Only a store misbehaving can get
                // here.
                Err(DispatchError::Internal(format!(
                    "claim on job {} affected no rows but the job is still claimable",
                    job_id
                )))
            }
            _ => Err(DispatchError::AlreadyClaimed {
                job_id,
                winner: job.provider_id,
            }),
        }
    }
}
