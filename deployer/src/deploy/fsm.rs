//! Finite State Machine for a deployment run

use serde::{Deserialize, Serialize};

use crate::models::deployment::DeploymentStatus;

/// Deployment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// Lease held, nothing checked yet
    Init,

    /// Credentials, store and distribution verified
    PreflightChecked,

    /// Build output present
    Built,

    /// Every changed file uploaded
    Published,

    /// Version committed and invalidation submitted (or not needed)
    Invalidated,

    /// Post-deploy checks ran
    Verified,

    Succeeded,

    Failed,

    RolledBack,
}

impl DeploymentState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Succeeded | DeploymentState::RolledBack
        )
    }

    /// Record status for this state
    pub fn status(&self) -> DeploymentStatus {
        match self {
            DeploymentState::Succeeded => DeploymentStatus::Success,
            DeploymentState::Failed => DeploymentStatus::Failed,
            DeploymentState::RolledBack => DeploymentStatus::RolledBack,
            _ => DeploymentStatus::InProgress,
        }
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    PreflightPassed,

    /// Build ran, or was skipped with existing output
    BuildFinished,

    PublishSucceeded,

    /// Version captured and invalidation handled
    InvalidationHandled,

    VerificationFinished,

    /// Close a verified run
    Complete,

    /// Close a dry run after the build
    DryRunComplete,

    /// A phase failed
    Fail(String),

    /// The site store was restored to a prior version
    RollbackCompleted,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    state: DeploymentState,
    error: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in the init state
    pub fn new() -> Self {
        Self {
            state: DeploymentState::Init,
            error: None,
        }
    }

    /// Get current state
    pub fn state(&self) -> DeploymentState {
        self.state
    }

    /// Get error message if any
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<(), String> {
        let new_state = match (&self.state, &event) {
            (DeploymentState::Init, DeploymentEvent::PreflightPassed) => {
                DeploymentState::PreflightChecked
            }
            (DeploymentState::PreflightChecked, DeploymentEvent::BuildFinished) => {
                DeploymentState::Built
            }
            (DeploymentState::Built, DeploymentEvent::PublishSucceeded) => {
                DeploymentState::Published
            }
            (DeploymentState::Built, DeploymentEvent::DryRunComplete) => DeploymentState::Succeeded,
            (DeploymentState::Published, DeploymentEvent::InvalidationHandled) => {
                DeploymentState::Invalidated
            }
            (DeploymentState::Invalidated, DeploymentEvent::VerificationFinished) => {
                DeploymentState::Verified
            }
            (DeploymentState::Verified, DeploymentEvent::Complete) => DeploymentState::Succeeded,

            // Any non-terminal state can fail
            (state, DeploymentEvent::Fail(err))
                if !state.is_terminal() && *state != DeploymentState::Failed =>
            {
                self.error = Some(err.clone());
                DeploymentState::Failed
            }

            // Recovery after a failure, or an on-demand rollback run
            (DeploymentState::Failed, DeploymentEvent::RollbackCompleted)
            | (DeploymentState::Init, DeploymentEvent::RollbackCompleted) => {
                DeploymentState::RolledBack
            }

            // Invalid transitions
            (state, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
            }
        };

        self.state = new_state;
        Ok(())
    }

    /// Whether a failed publish may still be rolled back
    pub fn can_roll_back(&self) -> bool {
        self.state == DeploymentState::Failed
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
