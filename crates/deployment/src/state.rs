//! Deployment lifecycle states.

use crate::error::{DeploymentError, DeploymentResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one deployment.
///
/// ```text
/// Idle -> Starting -> Running -> Stopping -> Stopped
///            |           |
///            +-> Failed <+
/// ```
///
/// A cancelled start rolls back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl DeploymentState {
    pub fn name(self) -> &'static str {
        match self {
            DeploymentState::Idle => "idle",
            DeploymentState::Starting => "starting",
            DeploymentState::Running => "running",
            DeploymentState::Stopping => "stopping",
            DeploymentState::Stopped => "stopped",
            DeploymentState::Failed => "failed",
        }
    }

    /// Starting, Running and Stopping hold resources; at most one such deployment may exist per name.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            DeploymentState::Starting | DeploymentState::Running | DeploymentState::Stopping
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeploymentState::Stopped | DeploymentState::Failed)
    }

    pub fn can_transition_to(self, next: DeploymentState) -> bool {
        use DeploymentState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Starting, Idle)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
        )
    }

    /// Validates a transition and returns the new state.
    pub fn transition(self, next: DeploymentState) -> DeploymentResult<DeploymentState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(DeploymentError::InvalidTransition { from: self, to: next })
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
