//! Step lifecycle state machine with validated transitions.
//!
//! Every action the orchestrator attempts becomes a [`RunStep`]:
//! Pending -> Running -> Succeeded/Failed/Cancelled
//! Failed -> Running (retry after cleanup)
//! Failed -> Skipped/Substituted/Replanned

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StepError;

/// Lifecycle states of a run step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    /// Failed non-critical action left out of the run.
    Skipped,
    /// Failed action replaced by an alternative providing the same effects.
    Substituted,
    /// Failed action handed to the replanner.
    Replanned,
}

impl StepStatus {
    /// True once no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded
                | StepStatus::Cancelled
                | StepStatus::Skipped
                | StepStatus::Substituted
                | StepStatus::Replanned
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::Running => write!(f, "running"),
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Cancelled => write!(f, "cancelled"),
            StepStatus::Skipped => write!(f, "skipped"),
            StepStatus::Substituted => write!(f, "substituted"),
            StepStatus::Replanned => write!(f, "replanned"),
        }
    }
}

/// Validate that a status transition is allowed.
///
/// Valid transitions:
/// - Pending -> Running
/// - Running -> Succeeded
/// - Running -> Failed
/// - Running -> Cancelled
/// - Failed -> Running (retry after conflict cleanup)
/// - Failed -> Skipped
/// - Failed -> Substituted
/// - Failed -> Replanned
pub fn validate_transition(from: StepStatus, to: StepStatus) -> Result<(), StepError> {
    let valid = matches!(
        (from, to),
        (StepStatus::Pending, StepStatus::Running)
            | (StepStatus::Running, StepStatus::Succeeded)
            | (StepStatus::Running, StepStatus::Failed)
            | (StepStatus::Running, StepStatus::Cancelled)
            | (StepStatus::Failed, StepStatus::Running)
            | (StepStatus::Failed, StepStatus::Skipped)
            | (StepStatus::Failed, StepStatus::Substituted)
            | (StepStatus::Failed, StepStatus::Replanned)
    );

    if valid {
        Ok(())
    } else {
        Err(StepError::InvalidTransition(from, to))
    }
}

/// One attempted action within a run, with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStep {
    pub id: Uuid,
    pub action: String,
    pub status: StepStatus,
    /// Handler invocations, retries included.
    pub attempts: u32,
    pub error: Option<String>,
    pub output: Option<serde_json::Value>,
}

impl RunStep {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action: action.into(),
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
            output: None,
        }
    }

    /// Move to `to`, rejecting transitions the lifecycle does not allow.
    pub fn transition(&mut self, to: StepStatus) -> Result<(), StepError> {
        validate_transition(self.status, to)?;
        tracing::trace!(step = %self.action, from = %self.status, to = %to, "Step transition");
        self.status = to;
        Ok(())
    }
}
