//! Launch configuration files.
//!
//! A launch configuration describes a deployment in a form the remote platform and
//! other tooling understand: a template name, world settings and one entry per worker
//! type. The toolbar writes a default one from its deployment settings.

use crate::config::{DeploymentConfig, SnapshotSource, WorkerSpec};
use crate::error::{DeploymentError, DeploymentResult};
use crate::launcher::LaunchStrategy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEFAULT_TEMPLATE: &str = "small";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSettings {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<PathBuf>,
    pub world_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerLaunchEntry {
    pub worker_type: String,
    pub count: u32,
    #[serde(default)]
    pub strategy: LaunchStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfigFile {
    pub template: String,
    pub world: WorldSettings,
    pub workers: Vec<WorkerLaunchEntry>,
}

impl LaunchConfigFile {
    pub fn from_deployment(config: &DeploymentConfig, world_version: u32) -> Self {
        let snapshot = match &config.snapshot {
            SnapshotSource::Path(path) => Some(path.clone()),
            SnapshotSource::Artifact(artifact) => artifact.path.clone(),
            SnapshotSource::Fresh => None,
        };
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            world: WorldSettings {
                name: config.name.clone(),
                snapshot,
                world_version,
                schema_hash: config.schema.as_ref().map(|s| s.hash.clone()),
            },
            workers: config
                .worker_specs
                .iter()
                .map(|spec| WorkerLaunchEntry {
                    worker_type: spec.worker_type.clone(),
                    count: spec.count,
                    strategy: spec.strategy,
                })
                .collect(),
        }
    }

    pub fn worker_specs(&self) -> Vec<WorkerSpec> {
        self.workers
            .iter()
            .map(|w| WorkerSpec::new(w.worker_type.clone(), w.count, w.strategy))
            .collect()
    }

    /// Rebuilds the deployment this file describes. The schema is resolved at start.
    pub fn to_deployment(&self) -> DeploymentConfig {
        let snapshot = match &self.world.snapshot {
            Some(path) => SnapshotSource::Path(path.clone()),
            None => SnapshotSource::Fresh,
        };
        let mut config = DeploymentConfig::new(self.world.name.clone()).with_snapshot(snapshot);
        config.worker_specs = self.worker_specs();
        config
    }

    pub fn write(&self, path: &Path) -> DeploymentResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        info!(path = %path.display(), workers = self.workers.len(), "Wrote launch configuration");
        Ok(())
    }

    pub fn load(path: &Path) -> DeploymentResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DeploymentError::Config(format!("cannot read launch configuration {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&content)?)
    }
}
