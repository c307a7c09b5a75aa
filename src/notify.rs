use async_trait::async_trait;

use crate::model::JobRequest;

/// Fire-and-forget sink for post-transition notifications. Failures inside
/// a sink never roll back the transition that triggered them, so the
/// methods return nothing.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn job_transitioned(&self, job: &JobRequest);
}

/// Default sink: structured log lines. Push delivery mechanics live behind
/// this trait in deployments that have them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn job_transitioned(&self, job: &JobRequest) {
        tracing::info!(
            job_id = %job.id,
            status = %job.status,
            phase = job.phase_label(),
            provider_id = ?job.provider_id,
            "Job transitioned"
        );
    }
}
