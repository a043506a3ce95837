//! # Deployment
//!
//! Turns a schema, a snapshot and a list of worker specs into a running set of worker
//! processes, and supervises them until they are stopped.
//!
//! - [`SnapshotManager`] loads, validates, saves and captures world snapshots
//! - [`WorkerLauncher`] starts workers locally or as jobs on the remote platform, rolling
//!   back partially started worker types
//! - [`DeploymentController`] owns the lifecycle state machine of every deployment
//! - [`Orchestrator`] bundles the above for the editor command surface
//!
//! ```no_run
//! use deployment::{ControllerConfig, DeploymentConfig, LaunchStrategy, LocalLaunchConfig,
//!     Orchestrator, WorkerLauncher, WorkerSpec};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), deployment::DeploymentError> {
//! let launcher = WorkerLauncher::new(LocalLaunchConfig::default(), Duration::from_secs(10));
//! let orchestrator = Orchestrator::new(ControllerConfig::default(), launcher, None);
//!
//! let config = DeploymentConfig::new("local1")
//!     .with_workers(WorkerSpec::new("sim", 2, LaunchStrategy::Local));
//! let status = orchestrator.start_deployment("local1", config)?.wait().await?;
//! println!("{} workers alive", status.alive_workers());
//!
//! orchestrator.stop_deployment("local1")?.wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod handle;
pub mod health;
pub mod launch_config;
pub mod launcher;
pub mod orchestrator;
pub mod snapshot;
pub mod state;
pub mod world;

pub use config::{ControllerConfig, DeploymentConfig, SnapshotSource, WorkerSpec};
pub use controller::{DeploymentController, DeploymentId, DeploymentStatus, StartTicket, StopTicket, WorkerStatus};
pub use error::{DeploymentError, DeploymentResult, FailureReport, Phase};
pub use handle::{WorkerHandle, WorkerHealth, WorkerId};
pub use health::{HealthMonitor, HealthReport, HealthStatus};
pub use launch_config::LaunchConfigFile;
pub use launcher::{CloudLauncher, LaunchContext, LaunchStrategy, LocalLaunchConfig, WorkerLauncher};
pub use orchestrator::Orchestrator;
pub use snapshot::{SnapshotArtifact, SnapshotEntity, SnapshotManager, SnapshotSummary};
pub use state::DeploymentState;
pub use world::WorldState;
