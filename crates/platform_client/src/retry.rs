//! Bounded exponential backoff for transient platform failures.

use crate::api::PlatformApi;
use crate::error::PlatformResult;
use crate::types::{JobId, JobSpec, JobStatus};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `2^attempt * base_delay`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }

    /// Runs `op`, retrying transient errors. Other errors are returned immediately.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> PlatformResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PlatformResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        operation,
                        attempt,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient platform error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Wraps a [`PlatformApi`] and retries its transient failures.
pub struct RetryingClient<A> {
    inner: A,
    policy: RetryPolicy,
}

impl<A: PlatformApi> RetryingClient<A> {
    pub fn new(inner: A, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: PlatformApi> PlatformApi for RetryingClient<A> {
    async fn submit_job(&self, spec: &JobSpec) -> PlatformResult<JobId> {
        self.policy.run("submit_job", || self.inner.submit_job(spec)).await
    }

    async fn poll_job(&self, job_id: &JobId) -> PlatformResult<JobStatus> {
        self.policy.run("poll_job", || self.inner.poll_job(job_id)).await
    }

    async fn cancel_job(&self, job_id: &JobId, force: bool) -> PlatformResult<()> {
        self.policy
            .run("cancel_job", || self.inner.cancel_job(job_id, force))
            .await
    }

    async fn fetch_logs(&self, job_id: &JobId) -> PlatformResult<Vec<String>> {
        self.policy.run("fetch_logs", || self.inner.fetch_logs(job_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    /// Fails each call with the queued errors, then succeeds.
    struct FlakyApi {
        calls: AtomicU32,
        failures: Mutex<Vec<PlatformError>>,
        request_ids: Mutex<Vec<String>>,
    }

    impl FlakyApi {
        fn new(failures: Vec<PlatformError>) -> Self {
            Self {
                calls: AtomicU32::new(0),
                failures: Mutex::new(failures),
                request_ids: Mutex::new(Vec::new()),
            }
        }

        fn next(&self) -> PlatformResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock().unwrap();
            if failures.is_empty() {
                Ok(())
            } else {
                Err(failures.remove(0))
            }
        }
    }

    #[async_trait]
    impl PlatformApi for FlakyApi {
        async fn submit_job(&self, spec: &JobSpec) -> PlatformResult<JobId> {
            self.request_ids.lock().unwrap().push(spec.request_id.clone());
            self.next().map(|_| JobId::from("job-1"))
        }

        async fn poll_job(&self, _job_id: &JobId) -> PlatformResult<JobStatus> {
            self.next().map(|_| JobStatus::Running)
        }

        async fn cancel_job(&self, _job_id: &JobId, _force: bool) -> PlatformResult<()> {
            self.next()
        }

        async fn fetch_logs(&self, _job_id: &JobId) -> PlatformResult<Vec<String>> {
            self.next().map(|_| Vec::new())
        }
    }

    fn unavailable() -> PlatformError {
        PlatformError::ServiceUnavailable("503".into())
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: 5,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let client = RetryingClient::new(FlakyApi::new(vec![unavailable(), unavailable()]), RetryPolicy::default());
        let started = Instant::now();

        let status = client.poll_job(&JobId::from("job-1")).await.unwrap();

        assert_eq!(status, JobStatus::Running);
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let failures = (0..10).map(|_| unavailable()).collect();
        let client = RetryingClient::new(FlakyApi::new(failures), RetryPolicy::default());

        let err = client.cancel_job(&JobId::from("job-1"), false).await.unwrap_err();

        assert!(err.is_transient());
        assert_eq!(client.inner().calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_and_quota_not_retried() {
        for err in [PlatformError::Auth("expired".into()), PlatformError::QuotaExceeded("cores".into())] {
            let client = RetryingClient::new(FlakyApi::new(vec![err]), RetryPolicy::default());
            let started = Instant::now();
            assert!(client.fetch_logs(&JobId::from("job-1")).await.is_err());
            assert_eq!(client.inner().calls.load(Ordering::SeqCst), 1);
            assert_eq!(started.elapsed(), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubmits_reuse_the_request_id() {
        let client = RetryingClient::new(FlakyApi::new(vec![unavailable(), unavailable()]), RetryPolicy::default());
        let spec = JobSpec {
            project: "proj".to_string(),
            deployment: "local1".to_string(),
            worker_type: "sim".to_string(),
            worker_id: "local1-sim-0".to_string(),
            schema_uri: "schema.json".to_string(),
            snapshot_uri: "start.snapshot".to_string(),
            schema_hash: "abc".to_string(),
            args: Vec::new(),
            labels: Default::default(),
            request_id: "req-1".to_string(),
        };

        assert_eq!(client.submit_job(&spec).await.unwrap(), JobId::from("job-1"));
        let request_ids = client.inner().request_ids.lock().unwrap().clone();
        assert_eq!(request_ids, vec!["req-1".to_string(); 3]);
    }
}
