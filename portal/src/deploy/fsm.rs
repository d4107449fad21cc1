//! Finite State Machine for deployment lifecycle

use serde::{Deserialize, Serialize};

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Accepted, waiting for the target's lane and lock
    Queued,

    /// Holding the target lock, executing remotely
    Running,

    /// Every step exited successfully
    Success,

    /// A step, the connection or the wait for the lock failed
    Failed,
}

impl DeploymentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeploymentStatus::Success | DeploymentStatus::Failed)
    }
}

/// Deployment event
#[derive(Debug, Clone)]
pub enum DeploymentEvent {
    /// Lock acquired, execution starts
    Start,

    /// Plan completed
    Succeed(String),

    /// Plan, connection, lock wait or cancellation failed
    Fail(String),
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeploymentFsm {
    status: DeploymentStatus,
    message: Option<String>,
}

impl DeploymentFsm {
    /// Create a new FSM in queued state
    pub fn new() -> Self {
        Self {
            status: DeploymentStatus::Queued,
            message: None,
        }
    }

    /// Get current status
    pub fn status(&self) -> DeploymentStatus {
        self.status
    }

    /// Terminal message, if any
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: DeploymentEvent) -> Result<DeploymentStatus, String> {
        let new_status = match (&self.status, event) {
            (DeploymentStatus::Queued, DeploymentEvent::Start) => DeploymentStatus::Running,

            // Lock timeout or cancellation before the lock was obtained
            (DeploymentStatus::Queued, DeploymentEvent::Fail(err)) => {
                self.message = Some(err);
                DeploymentStatus::Failed
            }

            (DeploymentStatus::Running, DeploymentEvent::Succeed(msg)) => {
                self.message = Some(msg);
                DeploymentStatus::Success
            }
            (DeploymentStatus::Running, DeploymentEvent::Fail(err)) => {
                self.message = Some(err);
                DeploymentStatus::Failed
            }

            (status, event) => {
                return Err(format!("Invalid transition: {:?} -> {:?}", status, event));
            }
        };

        self.status = new_status;
        Ok(new_status)
    }
}

impl Default for DeploymentFsm {
    fn default() -> Self {
        Self::new()
    }
}
