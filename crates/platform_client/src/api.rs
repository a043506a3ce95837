use crate::error::PlatformResult;
use crate::types::{JobId, JobSpec, JobStatus};
use async_trait::async_trait;

/// Operations offered by the remote cluster-management service.
///
/// Implemented by [`crate::HttpPlatformClient`] for the real service and by test doubles.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    async fn submit_job(&self, spec: &JobSpec) -> PlatformResult<JobId>;

    async fn poll_job(&self, job_id: &JobId) -> PlatformResult<JobStatus>;

    /// Requests cancellation. `force` skips the job's graceful shutdown.
    async fn cancel_job(&self, job_id: &JobId, force: bool) -> PlatformResult<()>;

    async fn fetch_logs(&self, job_id: &JobId) -> PlatformResult<Vec<String>>;
}
