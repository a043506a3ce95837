//! Entry point used by the editor command surface.

use crate::config::{ControllerConfig, DeploymentConfig};
use crate::controller::{DeploymentController, DeploymentStatus, StartTicket, StopTicket};
use crate::error::{DeploymentError, DeploymentResult};
use crate::launcher::WorkerLauncher;
use crate::snapshot::SnapshotArtifact;
use schema_gen::{SchemaArtifact, SchemaGenerator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Owns a controller and the collaborators injected into it.
///
/// Starts issued through the orchestrator are children of its shutdown token, so
/// [`Orchestrator::shutdown`] cancels in-flight starts before stopping running
/// deployments.
pub struct Orchestrator {
    controller: DeploymentController,
    schema_generator: Option<Arc<SchemaGenerator>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: ControllerConfig,
        launcher: WorkerLauncher,
        schema_generator: Option<Arc<SchemaGenerator>>,
    ) -> Self {
        Self {
            controller: DeploymentController::new(config, launcher, schema_generator.clone()),
            schema_generator,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn controller(&self) -> &DeploymentController {
        &self.controller
    }

    pub fn start_deployment(&self, name: &str, mut config: DeploymentConfig) -> DeploymentResult<StartTicket> {
        config.name = name.to_string();
        self.controller.start(config, &self.shutdown)
    }

    pub fn stop_deployment(&self, name: &str) -> DeploymentResult<StopTicket> {
        self.controller.stop(name)
    }

    pub fn get_status(&self, name: &str) -> DeploymentStatus {
        self.controller.status(name)
    }

    /// Regenerates the schema from the type feed and persists the id registry.
    pub async fn generate_schema(&self) -> DeploymentResult<Arc<SchemaArtifact>> {
        let generator = self.schema_generator.clone().ok_or_else(|| {
            DeploymentError::Config("no type feed configured".to_string())
        })?;
        let generation = tokio::task::spawn_blocking(move || generator.generate())
            .await
            .map_err(|e| DeploymentError::Internal(format!("schema generation task failed: {e}")))??;
        Ok(Arc::new(generation.artifact))
    }

    pub async fn capture_snapshot(&self, name: &str, cancel: &CancellationToken) -> DeploymentResult<SnapshotArtifact> {
        self.controller.capture(name, cancel).await
    }

    /// Cancels pending starts and stops every running deployment.
    pub async fn shutdown(&self) -> Vec<(String, DeploymentResult<DeploymentStatus>)> {
        self.shutdown.cancel();
        let results = self.controller.shutdown_all().await;
        info!(deployments = results.len(), "Orchestrator shut down");
        results
    }
}
