//! Finite State Machine for the deployment lifecycle

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    /// Created, not yet accepted
    Pending,

    /// Stages are being dispatched
    InProgress,

    /// Every host succeeded (per-host: at least one host succeeded)
    Succeeded,

    /// Halting policy triggered, every host failed, or aborted
    Failed,

    /// Failed, then every rollback hook succeeded
    RolledBack,
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Request validated and accepted
    Accept,

    /// Terminal stage finished with a successful outcome
    Complete,

    /// Halting policy triggered
    Fail(String),

    /// External abort request
    Abort,

    /// Rollback finished without any failed hook
    RollbackSucceeded,
}

/// Deployment FSM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentFsm {
    #[serde(rename = "status")]
    state: DeploymentStatus,
    #[serde(default)]
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in pending state
    pub fn new() -> Self {
        Self {
            state: DeploymentStatus::Pending,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentStatus {
        self.state
    }

    /// Get the failure reason if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// No further forward stage will be dispatched
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.state,
            DeploymentStatus::Succeeded | DeploymentStatus::Failed | DeploymentStatus::RolledBack
        )
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), PipelineError> {
        let new_state = match (&self.state, &event) {
            (DeploymentStatus::Pending, DeploymentEvent::Accept) => DeploymentStatus::InProgress,

            (DeploymentStatus::InProgress, DeploymentEvent::Complete) => DeploymentStatus::Succeeded,
            (DeploymentStatus::InProgress, DeploymentEvent::Fail(reason)) => {
                self.error = Some(reason.clone());
                DeploymentStatus::Failed
            }
            (DeploymentStatus::InProgress, DeploymentEvent::Abort) => {
                self.error = Some("aborted".to_string());
                DeploymentStatus::Failed
            }

            (DeploymentStatus::Failed, DeploymentEvent::RollbackSucceeded) => {
                DeploymentStatus::RolledBack
            }

            (state, event) => {
                return Err(PipelineError::InvalidTransition(format!(
                    "{:?} -> {:?}",
                    state, event
                )));
            }
        };

        self.state = new_state;
        Ok(())
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
