//! Error types for deployment orchestration.
//!
//! Every failure that reaches a caller carries the phase it happened in and the worker
//! ids it concerns, so the editor can show a diagnostic without poking at controller
//! internals.

use crate::handle::WorkerId;
use crate::state::DeploymentState;
use chrono::{DateTime, Utc};
use platform_client::PlatformError;
use schema_gen::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub type DeploymentResult<T> = Result<T, DeploymentError>;

/// Step of the deployment lifecycle an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Schema,
    Snapshot,
    Launch,
    Startup,
    Running,
    Stop,
    Capture,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Schema => "schema generation",
            Phase::Snapshot => "snapshot",
            Phase::Launch => "worker launch",
            Phase::Startup => "startup",
            Phase::Running => "running",
            Phase::Stop => "stop",
            Phase::Capture => "snapshot capture",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    /// Schema generation failed, including id conflicts between fields.
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Corrupt snapshot {path}: {reason}")]
    CorruptSnapshot { path: String, reason: String },

    /// Some instances of a worker type could not be started. Instances that did start
    /// have already been torn down when this is returned.
    #[error(
        "Launch of '{worker_type}' failed at {failed_worker}: {succeeded} started, {failed} failed, \
         {not_attempted} not attempted ({cause})"
    )]
    PartialLaunchFailure {
        worker_type: String,
        succeeded: usize,
        failed: usize,
        failed_worker: WorkerId,
        not_attempted: usize,
        rolled_back: Vec<WorkerId>,
        cause: String,
    },

    #[error("Workers not alive after {timeout:?}: {pending:?}")]
    StartupTimeout { timeout: Duration, pending: Vec<WorkerId> },

    #[error("Worker {worker} exited with code {code}")]
    WorkerExited { worker: WorkerId, code: i32 },

    #[error("Worker {worker} is unreachable")]
    Unreachable { worker: WorkerId },

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Deployment '{name}' is already active")]
    AlreadyActive { name: String },

    #[error("Deployment not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: cannot go from {from} to {to}")]
    InvalidTransition {
        from: DeploymentState,
        to: DeploymentState,
    },

    #[error("Deployment '{name}' is {state}, not running")]
    NotRunning { name: String, state: DeploymentState },

    #[error("{phase} timed out after {timeout:?}")]
    Timeout { phase: Phase, timeout: Duration },

    #[error("{phase} cancelled")]
    Cancelled { phase: Phase },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DeploymentError {
    pub fn corrupt_snapshot(path: impl fmt::Display, reason: impl Into<String>) -> Self {
        DeploymentError::CorruptSnapshot {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Worker ids this error concerns, if any.
    pub fn affected_workers(&self) -> Vec<WorkerId> {
        match self {
            DeploymentError::PartialLaunchFailure {
                failed_worker,
                rolled_back,
                ..
            } => {
                let mut workers = vec![failed_worker.clone()];
                workers.extend(rolled_back.iter().cloned());
                workers
            }
            DeploymentError::StartupTimeout { pending, .. } => pending.clone(),
            DeploymentError::WorkerExited { worker, .. } | DeploymentError::Unreachable { worker } => {
                vec![worker.clone()]
            }
            _ => Vec::new(),
        }
    }

    /// Two fields claiming one id: the user has to resolve the naming collision.
    pub fn is_schema_conflict(&self) -> bool {
        matches!(
            self,
            DeploymentError::Schema(SchemaError::Conflict { .. } | SchemaError::IdReassigned { .. })
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeploymentError::Cancelled { .. })
    }
}

/// Cloneable failure summary kept on a failed deployment for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub phase: Phase,
    pub message: String,
    pub workers: Vec<WorkerId>,
    pub at: DateTime<Utc>,
}

impl FailureReport {
    pub fn new(phase: Phase, error: &DeploymentError) -> Self {
        Self {
            phase,
            message: error.to_string(),
            workers: error.affected_workers(),
            at: Utc::now(),
        }
    }
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.phase, self.message)?;
        if !self.workers.is_empty() {
            let ids: Vec<&str> = self.workers.iter().map(|w| w.as_str()).collect();
            write!(f, " (workers: {})", ids.join(", "))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_launch_failure_reports_workers() {
        let err = DeploymentError::PartialLaunchFailure {
            worker_type: "sim".to_string(),
            succeeded: 1,
            failed: 1,
            failed_worker: WorkerId::from("demo-sim-1"),
            not_attempted: 1,
            rolled_back: vec![WorkerId::from("demo-sim-0")],
            cause: "exited with code 3".to_string(),
        };
        let report = FailureReport::new(Phase::Launch, &err);
        assert_eq!(report.workers, vec![WorkerId::from("demo-sim-1"), WorkerId::from("demo-sim-0")]);
        assert!(report.to_string().starts_with("[worker launch]"));
        assert!(report.to_string().contains("demo-sim-1"));
    }

    #[test]
    fn test_sub_second_timeouts_display() {
        let err = DeploymentError::StartupTimeout {
            timeout: Duration::from_millis(200),
            pending: vec![WorkerId::from("demo-sim-0")],
        };
        assert!(err.to_string().starts_with("Workers not alive after 200ms"));
        assert_eq!(err.affected_workers(), vec![WorkerId::from("demo-sim-0")]);

        let err = DeploymentError::Timeout {
            phase: Phase::Schema,
            timeout: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "schema generation timed out after 1.5s");
    }

    #[test]
    fn test_schema_conflict_detection() {
        let err = DeploymentError::from(SchemaError::Conflict {
            type_name: "Door".to_string(),
            id: 2,
            first: "Open".to_string(),
            second: "Locked".to_string(),
        });
        assert!(err.is_schema_conflict());
        assert!(!DeploymentError::NotFound("x".into()).is_schema_conflict());
    }
}
