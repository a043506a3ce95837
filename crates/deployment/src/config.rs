//! Deployment and controller configuration.

use crate::error::{DeploymentError, DeploymentResult};
use crate::launcher::LaunchStrategy;
use crate::snapshot::SnapshotArtifact;
use schema_gen::SchemaArtifact;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on instances of one worker type in a single deployment.
pub const MAX_WORKERS_PER_TYPE: u32 = 1024;

/// How many processes of one worker type a deployment needs, and where they run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub worker_type: String,
    pub count: u32,
    #[serde(default)]
    pub strategy: LaunchStrategy,
}

impl WorkerSpec {
    pub fn new(worker_type: impl Into<String>, count: u32, strategy: LaunchStrategy) -> Self {
        Self {
            worker_type: worker_type.into(),
            count,
            strategy,
        }
    }
}

/// Where a deployment's initial world comes from.
#[derive(Debug, Clone, Default)]
pub enum SnapshotSource {
    /// Empty world
    #[default]
    Fresh,
    /// Snapshot file, validated against the deployment's schema
    Path(PathBuf),
    Artifact(Arc<SnapshotArtifact>),
}

/// Input to one deployment run. Never mutated once submitted.
#[derive(Debug, Clone)]
pub struct DeploymentConfig {
    pub name: String,
    /// Pre-generated schema; when absent or invalid the controller generates one
    pub schema: Option<Arc<SchemaArtifact>>,
    pub snapshot: SnapshotSource,
    pub worker_specs: Vec<WorkerSpec>,
}

impl DeploymentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            snapshot: SnapshotSource::Fresh,
            worker_specs: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: Arc<SchemaArtifact>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotSource) -> Self {
        self.snapshot = snapshot;
        self
    }

    pub fn with_workers(mut self, spec: WorkerSpec) -> Self {
        self.worker_specs.push(spec);
        self
    }

    pub fn total_workers(&self) -> u64 {
        self.worker_specs.iter().map(|s| u64::from(s.count)).sum()
    }

    /// Names end up in worker ids and file names, so they are restricted to a safe alphabet.
    pub fn validate(&self) -> DeploymentResult<()> {
        if self.name.is_empty() {
            return Err(DeploymentError::Config("deployment name must not be empty".to_string()));
        }
        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(DeploymentError::Config(format!(
                "deployment name '{}' may only contain letters, digits, '-' and '_'",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for spec in &self.worker_specs {
            if spec.worker_type.is_empty() {
                return Err(DeploymentError::Config("worker type must not be empty".to_string()));
            }
            if spec.count > MAX_WORKERS_PER_TYPE {
                return Err(DeploymentError::Config(format!(
                    "worker type '{}' asks for {} instances, the limit is {}",
                    spec.worker_type, spec.count, MAX_WORKERS_PER_TYPE
                )));
            }
            if !seen.insert(spec.worker_type.as_str()) {
                return Err(DeploymentError::Config(format!(
                    "worker type '{}' listed more than once",
                    spec.worker_type
                )));
            }
        }
        Ok(())
    }
}

/// Tunables for the deployment controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Per-deployment scratch space: schema output and the working snapshot copy
    pub work_dir: PathBuf,
    /// Where captured snapshots are written
    pub snapshot_dir: PathBuf,
    pub fresh_world_version: u32,
    pub schema_timeout: Duration,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
    pub poll_interval: Duration,
    pub health_interval: Duration,
    /// Resident memory above which a worker is reported as degraded
    pub memory_warning_mb: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("deployments"),
            snapshot_dir: PathBuf::from("snapshots"),
            fresh_world_version: 1,
            schema_timeout: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            health_interval: Duration::from_secs(2),
            memory_warning_mb: 2048,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_validation() {
        let config = DeploymentConfig::new("local1")
            .with_workers(WorkerSpec::new("sim", 2, LaunchStrategy::Local))
            .with_workers(WorkerSpec::new("ai", 1, LaunchStrategy::Cloud));
        assert_eq!(config.total_workers(), 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        assert!(DeploymentConfig::new("").validate().is_err());
        assert!(DeploymentConfig::new("../etc").validate().is_err());
        let dup = DeploymentConfig::new("demo")
            .with_workers(WorkerSpec::new("sim", 1, LaunchStrategy::Local))
            .with_workers(WorkerSpec::new("sim", 1, LaunchStrategy::Local));
        assert!(matches!(dup.validate(), Err(DeploymentError::Config(_))));
    }

    #[test]
    fn test_huge_worker_counts() {
        let config = DeploymentConfig::new("big")
            .with_workers(WorkerSpec::new("sim", u32::MAX, LaunchStrategy::Local))
            .with_workers(WorkerSpec::new("ai", 1, LaunchStrategy::Local));
        assert_eq!(config.total_workers(), u64::from(u32::MAX) + 1);
        assert!(matches!(config.validate(), Err(DeploymentError::Config(_))));

        let at_limit = DeploymentConfig::new("big")
            .with_workers(WorkerSpec::new("sim", MAX_WORKERS_PER_TYPE, LaunchStrategy::Local));
        assert!(at_limit.validate().is_ok());
    }

    #[test]
    fn test_worker_spec_strategy_defaults_to_local() {
        let spec: WorkerSpec = serde_json::from_str(r#"{"worker_type":"sim","count":2}"#).unwrap();
        assert_eq!(spec.strategy, LaunchStrategy::Local);
    }
}
