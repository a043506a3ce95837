//! Worker handles.
//!
//! A [`WorkerHandle`] is either a local child process or a remote platform job. Both
//! offer the same capabilities: poll liveness, terminate, fetch logs.

use crate::error::{DeploymentError, DeploymentResult};
use platform_client::{JobId, JobStatus, PlatformApi, PlatformError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Exit code reported for a remote job that was cancelled (SIGTERM convention).
pub const CANCELLED_EXIT_CODE: i32 = 143;

/// Number of trailing log lines returned by `fetch_logs`.
const LOG_TAIL_LINES: usize = 200;

/// Identifier of one worker instance, `<deployment>-<worker type>-<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(deployment: &str, worker_type: &str, index: u32) -> Self {
        WorkerId(format!("{deployment}-{worker_type}-{index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(value: &str) -> Self {
        WorkerId(value.to_string())
    }
}

/// Observed health of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "code", rename_all = "snake_case")]
pub enum WorkerHealth {
    Alive,
    /// Accepted but not running yet, e.g. a queued remote job.
    Pending,
    Exited(i32),
    Unreachable,
}

impl WorkerHealth {
    pub fn is_alive(self) -> bool {
        matches!(self, WorkerHealth::Alive)
    }

    pub fn is_gone(self) -> bool {
        matches!(self, WorkerHealth::Exited(_) | WorkerHealth::Unreachable)
    }
}

impl fmt::Display for WorkerHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerHealth::Alive => f.write_str("alive"),
            WorkerHealth::Pending => f.write_str("pending"),
            WorkerHealth::Exited(code) => write!(f, "exited({code})"),
            WorkerHealth::Unreachable => f.write_str("unreachable"),
        }
    }
}

/// Exit code of a finished process; signal deaths map to `128 + signal`.
pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// A worker running as a child process of the orchestrator.
#[derive(Debug, Clone)]
pub struct LocalProcessHandle {
    id: WorkerId,
    pid: u32,
    child: Arc<Mutex<Child>>,
    log_path: PathBuf,
}

impl LocalProcessHandle {
    pub fn new(id: WorkerId, child: Child, log_path: PathBuf) -> DeploymentResult<Self> {
        let pid = child
            .id()
            .ok_or_else(|| DeploymentError::Internal(format!("worker {id} has no pid")))?;
        Ok(Self {
            id,
            pid,
            child: Arc::new(Mutex::new(child)),
            log_path,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub async fn poll(&self) -> WorkerHealth {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(None) => WorkerHealth::Alive,
            Ok(Some(status)) => WorkerHealth::Exited(exit_code(status)),
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "Failed to query worker process");
                WorkerHealth::Unreachable
            }
        }
    }

    /// Sends SIGTERM, waits up to `grace`, then kills. Returns the exit code.
    pub async fn terminate(&self, grace: Duration) -> DeploymentResult<i32> {
        let mut child = self.child.lock().await;
        if let Some(status) = child.try_wait()? {
            return Ok(exit_code(status));
        }

        #[cfg(unix)]
        {
            // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
            let rc = unsafe { libc::kill(self.pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(worker_id = %self.id, "SIGTERM delivery failed, process likely exiting");
            }
        }
        #[cfg(not(unix))]
        {
            child.start_kill()?;
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => Ok(exit_code(status?)),
            Err(_) => {
                warn!(worker_id = %self.id, grace_ms = grace.as_millis() as u64, "Worker ignored termination, killing");
                child.kill().await?;
                Ok(exit_code(child.wait().await?))
            }
        }
    }

    pub async fn fetch_logs(&self) -> DeploymentResult<Vec<String>> {
        let content = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let lines: Vec<&str> = content.lines().collect();
        let start = lines.len().saturating_sub(LOG_TAIL_LINES);
        Ok(lines[start..].iter().map(|l| l.to_string()).collect())
    }
}

/// A worker running as a job on the remote platform.
#[derive(Clone)]
pub struct RemoteJobHandle {
    id: WorkerId,
    job_id: JobId,
    api: Arc<dyn PlatformApi>,
    poll_interval: Duration,
}

impl fmt::Debug for RemoteJobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteJobHandle")
            .field("id", &self.id)
            .field("job_id", &self.job_id)
            .finish()
    }
}

impl RemoteJobHandle {
    pub fn new(id: WorkerId, job_id: JobId, api: Arc<dyn PlatformApi>, poll_interval: Duration) -> Self {
        Self {
            id,
            job_id,
            api,
            poll_interval,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub async fn poll(&self) -> WorkerHealth {
        match self.api.poll_job(&self.job_id).await {
            Ok(status) => health_for_job(status),
            Err(e) => {
                warn!(worker_id = %self.id, job_id = %self.job_id, error = %e, "Failed to poll platform job");
                WorkerHealth::Unreachable
            }
        }
    }

    /// Requests cancellation, waits up to `grace`, then forces it.
    pub async fn terminate(&self, grace: Duration) -> DeploymentResult<i32> {
        match self.api.cancel_job(&self.job_id, false).await {
            Ok(()) => {}
            Err(PlatformError::JobNotFound(_)) => return Ok(CANCELLED_EXIT_CODE),
            Err(e) => return Err(e.into()),
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if let Ok(status) = self.api.poll_job(&self.job_id).await {
                if let Some(code) = exit_code_for_job(status) {
                    return Ok(code);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        warn!(worker_id = %self.id, job_id = %self.job_id, "Job still running after grace period, forcing cancellation");
        self.api.cancel_job(&self.job_id, true).await?;
        Ok(CANCELLED_EXIT_CODE)
    }

    pub async fn fetch_logs(&self) -> DeploymentResult<Vec<String>> {
        Ok(self.api.fetch_logs(&self.job_id).await?)
    }
}

fn health_for_job(status: JobStatus) -> WorkerHealth {
    match status {
        JobStatus::Queued => WorkerHealth::Pending,
        JobStatus::Running => WorkerHealth::Alive,
        JobStatus::Exited { code } => WorkerHealth::Exited(code),
        JobStatus::Cancelled => WorkerHealth::Exited(CANCELLED_EXIT_CODE),
        JobStatus::Lost => WorkerHealth::Unreachable,
    }
}

fn exit_code_for_job(status: JobStatus) -> Option<i32> {
    match status {
        JobStatus::Exited { code } => Some(code),
        JobStatus::Cancelled | JobStatus::Lost => Some(CANCELLED_EXIT_CODE),
        JobStatus::Queued | JobStatus::Running => None,
    }
}

/// Handle to one launched worker.
#[derive(Debug, Clone)]
pub enum WorkerHandle {
    Local(LocalProcessHandle),
    Remote(RemoteJobHandle),
}

impl WorkerHandle {
    pub fn id(&self) -> &WorkerId {
        match self {
            WorkerHandle::Local(h) => &h.id,
            WorkerHandle::Remote(h) => &h.id,
        }
    }

    /// OS process id, for local workers.
    pub fn pid(&self) -> Option<u32> {
        match self {
            WorkerHandle::Local(h) => Some(h.pid),
            WorkerHandle::Remote(_) => None,
        }
    }

    pub async fn poll(&self) -> WorkerHealth {
        match self {
            WorkerHandle::Local(h) => h.poll().await,
            WorkerHandle::Remote(h) => h.poll().await,
        }
    }

    pub async fn is_alive(&self) -> bool {
        self.poll().await.is_alive()
    }

    pub async fn terminate(&self, grace: Duration) -> DeploymentResult<i32> {
        match self {
            WorkerHandle::Local(h) => h.terminate(grace).await,
            WorkerHandle::Remote(h) => h.terminate(grace).await,
        }
    }

    pub async fn fetch_logs(&self) -> DeploymentResult<Vec<String>> {
        match self {
            WorkerHandle::Local(h) => h.fetch_logs().await,
            WorkerHandle::Remote(h) => h.fetch_logs().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id_format() {
        assert_eq!(WorkerId::new("local1", "sim", 1).as_str(), "local1-sim-1");
    }

    #[test]
    fn test_job_status_mapping() {
        assert_eq!(health_for_job(JobStatus::Queued), WorkerHealth::Pending);
        assert_eq!(health_for_job(JobStatus::Running), WorkerHealth::Alive);
        assert_eq!(health_for_job(JobStatus::Exited { code: 2 }), WorkerHealth::Exited(2));
        assert_eq!(health_for_job(JobStatus::Cancelled), WorkerHealth::Exited(CANCELLED_EXIT_CODE));
        assert_eq!(health_for_job(JobStatus::Lost), WorkerHealth::Unreachable);
    }

    #[test]
    fn test_health_serialization() {
        assert_eq!(
            serde_json::to_string(&WorkerHealth::Exited(3)).unwrap(),
            r#"{"status":"exited","code":3}"#
        );
        assert_eq!(serde_json::to_string(&WorkerHealth::Alive).unwrap(), r#"{"status":"alive"}"#);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_handle_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("w.log");
        let log = std::fs::File::create(&log_path).unwrap();
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("echo started; trap 'exit 0' TERM; while true; do sleep 0.05; done")
            .stdout(log)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let handle = LocalProcessHandle::new(WorkerId::from("t-sim-0"), child, log_path).unwrap();

        assert_eq!(handle.poll().await, WorkerHealth::Alive);
        let code = handle.terminate(Duration::from_secs(5)).await.unwrap();
        assert_eq!(code, 0);
        assert_eq!(handle.poll().await, WorkerHealth::Exited(0));
        assert_eq!(handle.fetch_logs().await.unwrap(), vec!["started".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_handle_kills_after_grace() {
        let dir = tempfile::tempdir().unwrap();
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("trap '' TERM; while true; do sleep 0.05; done")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let handle = LocalProcessHandle::new(WorkerId::from("t-sim-0"), child, dir.path().join("none.log")).unwrap();

        let code = handle.terminate(Duration::from_millis(200)).await.unwrap();
        assert_eq!(code, 128 + libc::SIGKILL);
        assert!(handle.fetch_logs().await.unwrap().is_empty());
    }
}
