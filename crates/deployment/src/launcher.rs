//! Worker launching.
//!
//! Workers are started one instance at a time. When an instance fails to start, every
//! instance already started for the same spec is torn down before the error is returned,
//! so a failed launch never leaves processes or jobs behind.

use crate::config::WorkerSpec;
use crate::error::{DeploymentError, DeploymentResult, Phase};
use crate::handle::{exit_code, LocalProcessHandle, RemoteJobHandle, WorkerHandle, WorkerHealth, WorkerId};
use futures::future::join_all;
use platform_client::{JobSpec, PlatformApi};
use schema_gen::SchemaArtifact;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Where a worker runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchStrategy {
    #[default]
    Local,
    Cloud,
}

/// Settings for workers spawned on this machine.
#[derive(Debug, Clone)]
pub struct LocalLaunchConfig {
    /// Binary used for worker types without an entry in `binaries`
    pub default_binary: PathBuf,
    pub binaries: HashMap<String, PathBuf>,
    /// Appended after the `--schema`, `--snapshot` and `--worker-id` arguments
    pub extra_args: Vec<String>,
    /// Each worker's stdout and stderr go to `<log_dir>/<worker id>.log`
    pub log_dir: PathBuf,
    /// How long to wait after spawning before checking for an immediate exit
    pub spawn_check_delay: Duration,
}

impl Default for LocalLaunchConfig {
    fn default() -> Self {
        Self {
            default_binary: PathBuf::from("worker"),
            binaries: HashMap::new(),
            extra_args: Vec::new(),
            log_dir: PathBuf::from("logs"),
            spawn_check_delay: Duration::from_millis(100),
        }
    }
}

/// Artifacts shared by every worker of one deployment.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub deployment: &'a str,
    pub schema: &'a SchemaArtifact,
    /// Schema manifest path passed to workers
    pub schema_path: &'a Path,
    pub snapshot_path: &'a Path,
}

/// The startup arguments every worker receives.
pub fn contract_args(ctx: &LaunchContext<'_>, id: &WorkerId) -> Vec<String> {
    vec![
        format!("--schema={}", ctx.schema_path.display()),
        format!("--snapshot={}", ctx.snapshot_path.display()),
        format!("--worker-id={id}"),
    ]
}

#[derive(Debug, Clone)]
pub struct LocalLauncher {
    config: LocalLaunchConfig,
}

impl LocalLauncher {
    pub fn new(config: LocalLaunchConfig) -> Self {
        Self { config }
    }

    pub fn binary_for(&self, worker_type: &str) -> &Path {
        self.config
            .binaries
            .get(worker_type)
            .unwrap_or(&self.config.default_binary)
    }

    async fn spawn(&self, spec: &WorkerSpec, id: &WorkerId, ctx: &LaunchContext<'_>) -> DeploymentResult<LocalProcessHandle> {
        tokio::fs::create_dir_all(&self.config.log_dir).await?;
        let log_path = self.config.log_dir.join(format!("{id}.log"));
        let log = std::fs::File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let binary = self.binary_for(&spec.worker_type);
        let mut child = Command::new(binary)
            .args(contract_args(ctx, id))
            .args(&self.config.extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DeploymentError::Io(std::io::Error::new(
                    e.kind(),
                    format!("cannot spawn {}: {e}", binary.display()),
                ))
            })?;

        tokio::time::sleep(self.config.spawn_check_delay).await;

        if let Ok(Some(status)) = child.try_wait() {
            return Err(DeploymentError::WorkerExited {
                worker: id.clone(),
                code: exit_code(status),
            });
        }

        LocalProcessHandle::new(id.clone(), child, log_path)
    }
}

/// Submits workers as jobs on the remote platform.
#[derive(Clone)]
pub struct CloudLauncher {
    api: Arc<dyn PlatformApi>,
    project: String,
    poll_interval: Duration,
}

impl CloudLauncher {
    pub fn new(api: Arc<dyn PlatformApi>, project: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            api,
            project: project.into(),
            poll_interval,
        }
    }

    async fn submit(&self, spec: &WorkerSpec, id: &WorkerId, ctx: &LaunchContext<'_>) -> DeploymentResult<RemoteJobHandle> {
        let mut labels = BTreeMap::new();
        labels.insert("deployment".to_string(), ctx.deployment.to_string());
        labels.insert("worker_type".to_string(), spec.worker_type.clone());

        let job = JobSpec {
            project: self.project.clone(),
            deployment: ctx.deployment.to_string(),
            worker_type: spec.worker_type.clone(),
            worker_id: id.to_string(),
            schema_uri: ctx.schema_path.display().to_string(),
            snapshot_uri: ctx.snapshot_path.display().to_string(),
            schema_hash: ctx.schema.hash.clone(),
            args: contract_args(ctx, id),
            labels,
            request_id: Uuid::new_v4().to_string(),
        };
        let job_id = self.api.submit_job(&job).await?;
        Ok(RemoteJobHandle::new(id.clone(), job_id, self.api.clone(), self.poll_interval))
    }
}

/// Starts, polls and stops workers for either strategy.
pub struct WorkerLauncher {
    local: LocalLauncher,
    cloud: Option<CloudLauncher>,
    shutdown_grace: Duration,
}

impl WorkerLauncher {
    pub fn new(local: LocalLaunchConfig, shutdown_grace: Duration) -> Self {
        Self {
            local: LocalLauncher::new(local),
            cloud: None,
            shutdown_grace,
        }
    }

    pub fn with_cloud(mut self, cloud: CloudLauncher) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn supports(&self, strategy: LaunchStrategy) -> bool {
        match strategy {
            LaunchStrategy::Local => true,
            LaunchStrategy::Cloud => self.cloud.is_some(),
        }
    }

    /// Launches every instance of `spec`.
    ///
    /// On failure of instance k, instances started before it are stopped and the call
    /// returns [`DeploymentError::PartialLaunchFailure`].
    pub async fn launch(
        &self,
        spec: &WorkerSpec,
        ctx: &LaunchContext<'_>,
        cancel: &CancellationToken,
    ) -> DeploymentResult<Vec<WorkerHandle>> {
        if !self.supports(spec.strategy) {
            return Err(DeploymentError::Config(format!(
                "worker type '{}' requests cloud launch but no platform client is configured",
                spec.worker_type
            )));
        }

        let mut started: Vec<WorkerHandle> = Vec::new();
        for index in 0..spec.count {
            if cancel.is_cancelled() {
                break;
            }
            let id = WorkerId::new(ctx.deployment, &spec.worker_type, index);
            let attempt = match spec.strategy {
                // Dropping a spawn kills the child, so a local launch can be abandoned midway.
                LaunchStrategy::Local => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = self.launch_one(spec, &id, ctx) => Some(result),
                },
                // A submit the platform accepted is a live job; wait for its id so the
                // rollback below can cancel it.
                LaunchStrategy::Cloud => Some(self.launch_one(spec, &id, ctx).await),
            };

            match attempt {
                Some(Ok(handle)) => {
                    info!(deployment = %ctx.deployment, worker_id = %id, pid = ?handle.pid(), "Worker started");
                    started.push(handle);
                }
                Some(Err(e)) => {
                    error!(deployment = %ctx.deployment, worker_id = %id, error = %e, "Worker failed to start, rolling back");
                    let rolled_back = self.rollback(&started).await;
                    return Err(DeploymentError::PartialLaunchFailure {
                        worker_type: spec.worker_type.clone(),
                        succeeded: started.len(),
                        failed: 1,
                        failed_worker: id,
                        not_attempted: (spec.count - index - 1) as usize,
                        rolled_back,
                        cause: e.to_string(),
                    });
                }
                None => break,
            }
        }

        if cancel.is_cancelled() {
            warn!(deployment = %ctx.deployment, worker_type = %spec.worker_type, started = started.len(), "Launch cancelled, rolling back");
            self.rollback(&started).await;
            return Err(DeploymentError::Cancelled { phase: Phase::Launch });
        }
        Ok(started)
    }

    async fn launch_one(&self, spec: &WorkerSpec, id: &WorkerId, ctx: &LaunchContext<'_>) -> DeploymentResult<WorkerHandle> {
        match spec.strategy {
            LaunchStrategy::Local => Ok(WorkerHandle::Local(self.local.spawn(spec, id, ctx).await?)),
            LaunchStrategy::Cloud => match &self.cloud {
                Some(cloud) => Ok(WorkerHandle::Remote(cloud.submit(spec, id, ctx).await?)),
                None => Err(DeploymentError::Config("no platform client configured".to_string())),
            },
        }
    }

    pub async fn poll(&self, handle: &WorkerHandle) -> WorkerHealth {
        handle.poll().await
    }

    /// Graceful termination, forced after the shutdown grace period.
    pub async fn stop(&self, handle: &WorkerHandle) -> DeploymentResult<i32> {
        handle.terminate(self.shutdown_grace).await
    }

    /// Stops all `handles` concurrently.
    pub async fn stop_all(&self, handles: &[WorkerHandle]) -> Vec<(WorkerId, DeploymentResult<i32>)> {
        let results = join_all(handles.iter().map(|h| self.stop(h))).await;
        handles.iter().map(|h| h.id().clone()).zip(results).collect()
    }

    /// Stops `handles` and returns their ids. Failures are logged, not returned.
    pub async fn rollback(&self, handles: &[WorkerHandle]) -> Vec<WorkerId> {
        let mut ids = Vec::with_capacity(handles.len());
        for (id, result) in self.stop_all(handles).await {
            if let Err(e) = result {
                warn!(worker_id = %id, error = %e, "Failed to stop worker during rollback");
            }
            ids.push(id);
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use platform_client::{JobId, JobStatus, PlatformError, PlatformResult};
    use schema_gen::{generate, IdRegistry, ReflectedType, WireType};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakePlatform {
        submitted: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<(String, bool)>>,
        request_ids: Mutex<Vec<String>>,
        fail_on: Option<usize>,
        submit_delay: Duration,
    }

    #[async_trait]
    impl PlatformApi for FakePlatform {
        async fn submit_job(&self, spec: &JobSpec) -> PlatformResult<JobId> {
            if !self.submit_delay.is_zero() {
                tokio::time::sleep(self.submit_delay).await;
            }
            self.request_ids.lock().unwrap().push(spec.request_id.clone());
            let mut submitted = self.submitted.lock().unwrap();
            if Some(submitted.len()) == self.fail_on {
                return Err(PlatformError::QuotaExceeded("no cores left".into()));
            }
            submitted.push(spec.worker_id.clone());
            Ok(JobId(format!("job-{}", spec.worker_id)))
        }

        async fn poll_job(&self, job_id: &JobId) -> PlatformResult<JobStatus> {
            let cancelled = self.cancelled.lock().unwrap();
            if cancelled.iter().any(|(id, _)| *id == job_id.0) {
                Ok(JobStatus::Cancelled)
            } else {
                Ok(JobStatus::Running)
            }
        }

        async fn cancel_job(&self, job_id: &JobId, force: bool) -> PlatformResult<()> {
            self.cancelled.lock().unwrap().push((job_id.0.clone(), force));
            Ok(())
        }

        async fn fetch_logs(&self, _job_id: &JobId) -> PlatformResult<Vec<String>> {
            Ok(vec!["booted".to_string()])
        }
    }

    fn schema() -> SchemaArtifact {
        let types = vec![ReflectedType::new("/Script/Game.Door").with_field("Open", WireType::Bool)];
        generate(&types, &IdRegistry::default()).unwrap().artifact
    }

    fn cloud_launcher(api: Arc<FakePlatform>) -> WorkerLauncher {
        WorkerLauncher::new(LocalLaunchConfig::default(), Duration::from_secs(1))
            .with_cloud(CloudLauncher::new(api, "proj", Duration::from_millis(10)))
    }

    #[test]
    fn test_contract_args() {
        let schema = schema();
        let ctx = LaunchContext {
            deployment: "local1",
            schema: &schema,
            schema_path: Path::new("/tmp/schema/schema.json"),
            snapshot_path: Path::new("/tmp/start.snapshot"),
        };
        assert_eq!(
            contract_args(&ctx, &WorkerId::new("local1", "sim", 0)),
            vec![
                "--schema=/tmp/schema/schema.json".to_string(),
                "--snapshot=/tmp/start.snapshot".to_string(),
                "--worker-id=local1-sim-0".to_string(),
            ]
        );
    }

    #[test]
    fn test_binary_lookup_falls_back_to_default() {
        let mut config = LocalLaunchConfig::default();
        config.binaries.insert("ai".to_string(), PathBuf::from("/opt/ai-worker"));
        let launcher = LocalLauncher::new(config);
        assert_eq!(launcher.binary_for("ai"), Path::new("/opt/ai-worker"));
        assert_eq!(launcher.binary_for("sim"), Path::new("worker"));
    }

    #[tokio::test]
    async fn test_cloud_launch_and_stop() {
        let api = Arc::new(FakePlatform::default());
        let launcher = cloud_launcher(api.clone());
        let schema = schema();
        let ctx = LaunchContext {
            deployment: "cloud1",
            schema: &schema,
            schema_path: Path::new("schema.json"),
            snapshot_path: Path::new("start.snapshot"),
        };

        let spec = WorkerSpec::new("sim", 2, LaunchStrategy::Cloud);
        let handles = launcher.launch(&spec, &ctx, &CancellationToken::new()).await.unwrap();
        assert_eq!(handles.len(), 2);
        assert_eq!(launcher.poll(&handles[0]).await, WorkerHealth::Alive);
        assert_eq!(handles[1].fetch_logs().await.unwrap(), vec!["booted".to_string()]);

        let request_ids = api.request_ids.lock().unwrap().clone();
        assert_eq!(request_ids.len(), 2);
        assert!(!request_ids[0].is_empty());
        assert_ne!(request_ids[0], request_ids[1]);

        let code = launcher.stop(&handles[0]).await.unwrap();
        assert_eq!(code, crate::handle::CANCELLED_EXIT_CODE);
        assert_eq!(launcher.poll(&handles[0]).await, WorkerHealth::Exited(crate::handle::CANCELLED_EXIT_CODE));
    }

    #[tokio::test]
    async fn test_cloud_partial_failure_rolls_back() {
        let api = Arc::new(FakePlatform {
            fail_on: Some(1),
            ..FakePlatform::default()
        });
        let launcher = cloud_launcher(api.clone());
        let schema = schema();
        let ctx = LaunchContext {
            deployment: "cloud1",
            schema: &schema,
            schema_path: Path::new("schema.json"),
            snapshot_path: Path::new("start.snapshot"),
        };

        let spec = WorkerSpec::new("sim", 3, LaunchStrategy::Cloud);
        match launcher.launch(&spec, &ctx, &CancellationToken::new()).await {
            Err(DeploymentError::PartialLaunchFailure {
                succeeded,
                failed,
                failed_worker,
                not_attempted,
                rolled_back,
                cause,
                ..
            }) => {
                assert_eq!(succeeded, 1);
                assert_eq!(failed, 1);
                assert_eq!(failed_worker, WorkerId::from("cloud1-sim-1"));
                assert_eq!(not_attempted, 1);
                assert_eq!(rolled_back, vec![WorkerId::from("cloud1-sim-0")]);
                assert!(cause.contains("Quota"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let cancelled = api.cancelled.lock().unwrap().clone();
        assert_eq!(cancelled, vec![("job-cloud1-sim-0".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_cloud_requires_platform() {
        let launcher = WorkerLauncher::new(LocalLaunchConfig::default(), Duration::from_secs(1));
        let schema = schema();
        let ctx = LaunchContext {
            deployment: "d",
            schema: &schema,
            schema_path: Path::new("s"),
            snapshot_path: Path::new("p"),
        };
        let spec = WorkerSpec::new("sim", 1, LaunchStrategy::Cloud);
        assert!(matches!(
            launcher.launch(&spec, &ctx, &CancellationToken::new()).await,
            Err(DeploymentError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_launch() {
        let api = Arc::new(FakePlatform::default());
        let launcher = cloud_launcher(api.clone());
        let schema = schema();
        let ctx = LaunchContext {
            deployment: "d",
            schema: &schema,
            schema_path: Path::new("s"),
            snapshot_path: Path::new("p"),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let spec = WorkerSpec::new("sim", 2, LaunchStrategy::Cloud);
        assert!(matches!(
            launcher.launch(&spec, &ctx, &cancel).await,
            Err(DeploymentError::Cancelled { phase: Phase::Launch })
        ));
        assert!(api.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_submit_cancels_accepted_job() {
        let api = Arc::new(FakePlatform {
            submit_delay: Duration::from_millis(100),
            ..FakePlatform::default()
        });
        let launcher = cloud_launcher(api.clone());
        let schema = schema();
        let ctx = LaunchContext {
            deployment: "d",
            schema: &schema,
            schema_path: Path::new("s"),
            snapshot_path: Path::new("p"),
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let spec = WorkerSpec::new("sim", 3, LaunchStrategy::Cloud);
        assert!(matches!(
            launcher.launch(&spec, &ctx, &cancel).await,
            Err(DeploymentError::Cancelled { phase: Phase::Launch })
        ));
        assert_eq!(*api.submitted.lock().unwrap(), vec!["d-sim-0".to_string()]);
        let cancelled = api.cancelled.lock().unwrap().clone();
        assert_eq!(cancelled, vec![("job-d-sim-0".to_string(), false)]);
    }
}
