//! Error types for the orchestration engine.

use uuid::Uuid;
use waypoint_core::ActionError;

use crate::monitor::ExecutionRecord;
use crate::step::{RunStep, StepStatus};

/// Terminal orchestration failures.
///
/// Retryable handler errors and open circuits are absorbed by the replanner
/// and never surface here.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestrationError {
    #[error("Precondition violation for {action}: unmet {missing:?}")]
    PreconditionViolation { action: String, missing: Vec<String> },
    #[error("Replanning exhausted after {attempts} attempts (last failure: {last_failure})")]
    ReplanExhausted { attempts: u32, last_failure: String },
    #[error("Action {action} failed: {source}")]
    ActionFailed { action: String, source: ActionError },
    #[error("No handler registered for action {action} (handler {handler})")]
    UnknownHandler { action: String, handler: String },
    #[error("Run cancelled")]
    Cancelled,
    #[error(transparent)]
    Step(#[from] StepError),
}

/// Errors from step lifecycle management.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepError {
    #[error("Invalid step transition: {0} -> {1}")]
    InvalidTransition(StepStatus, StepStatus),
}

/// A failed run: the terminal error plus everything that happened before it.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Run {run_id} failed: {error}")]
pub struct RunFailure {
    pub run_id: Uuid,
    #[source]
    pub error: OrchestrationError,
    pub steps: Vec<RunStep>,
    pub records: Vec<ExecutionRecord>,
    /// Calls into the planner, the initial plan included.
    pub planning_invocations: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestration_error_display() {
        let err = OrchestrationError::PreconditionViolation {
            action: "createDataset".into(),
            missing: vec!["hasAuth".into()],
        };
        assert_eq!(
            err.to_string(),
            r#"Precondition violation for createDataset: unmet ["hasAuth"]"#
        );

        let err = OrchestrationError::ReplanExhausted {
            attempts: 3,
            last_failure: "addFiles".into(),
        };
        assert_eq!(
            err.to_string(),
            "Replanning exhausted after 3 attempts (last failure: addFiles)"
        );
    }

    #[test]
    fn test_step_error_conversion() {
        let err: OrchestrationError =
            StepError::InvalidTransition(StepStatus::Pending, StepStatus::Succeeded).into();
        assert_eq!(err.to_string(), "Invalid step transition: pending -> succeeded");
    }

    #[test]
    fn test_run_failure_source() {
        use std::error::Error;
        let failure = RunFailure {
            run_id: Uuid::nil(),
            error: OrchestrationError::Cancelled,
            steps: Vec::new(),
            records: Vec::new(),
            planning_invocations: 1,
        };
        assert!(failure.to_string().ends_with("failed: Run cancelled"));
        assert!(failure.source().is_some());
    }
}
