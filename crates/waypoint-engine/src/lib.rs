//! Execution engine for Waypoint.
//!
//! Runs plans produced by the planner: monitors every handler call, isolates
//! failing actions behind circuit breakers, retries, recovers locally and
//! replans with learned costs.

pub mod batch;
pub mod binder;
pub mod circuit_breaker;
pub mod error;
pub mod executor;
pub mod learning;
pub mod monitor;
pub mod orchestrator;
pub mod recovery;
pub mod resources;
pub mod retry;
pub mod step;

pub use binder::{ParameterBinder, RunContext, TemplateBinder};
pub use circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
pub use error::{OrchestrationError, RunFailure, StepError};
pub use executor::{ActionOutcome, Executor};
pub use learning::{LearningCostModel, LearningModel, LearningStats};
pub use monitor::{
    ActOutcome, ActionMetrics, Analysis, Decision, ExecutionGuard, ExecutionMonitor, ExecutionRecord,
    ExecutionStatus,
};
pub use orchestrator::{GoalSource, Orchestrator, OrchestratorBuilder, RunOutcome, RunReport};
pub use recovery::Recovery;
pub use resources::{NullProbe, ProcStatusProbe, ResourceProbe, ResourceSnapshot};
pub use retry::{ErrorClass, RetryPolicy};
pub use step::{RunStep, StepStatus};
