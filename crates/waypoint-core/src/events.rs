use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Observable events emitted by the engine.
///
/// Events are published on an [`EventBus`] and consumed by:
/// - logging and metrics exporters
/// - tests asserting on engine behaviour
///
/// The engine keeps no long-term record of them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TelemetryEvent {
    // =========================================================================
    // Execution Events
    // =========================================================================
    /// A handler invocation started.
    ExecutionStarted {
        run_id: Uuid,
        execution_id: Uuid,
        action: String,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A handler invocation finished, successfully or not.
    ExecutionCompleted {
        run_id: Uuid,
        execution_id: Uuid,
        action: String,
        success: bool,
        duration_ms: u64,
        error: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// An execution ran past the slow threshold without timing out.
    ExecutionWarned {
        execution_id: Uuid,
        action: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// An execution was cancelled (timeout or run cancellation).
    ExecutionCancelled {
        execution_id: Uuid,
        action: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// The monitor flagged a statistical outlier.
    AnomalyDetected {
        execution_id: Uuid,
        action: String,
        metric: String,
        value: f64,
        z_score: f64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Circuit Breaker Events
    // =========================================================================
    CircuitOpened {
        action: String,
        consecutive_failures: u32,
        timestamp: DateTime<Utc>,
    },

    CircuitHalfOpened {
        action: String,
        timestamp: DateTime<Utc>,
    },

    CircuitClosed {
        action: String,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Planning Events
    // =========================================================================
    /// A plan was produced, initially or by replanning.
    PlanCreated {
        run_id: Uuid,
        actions: Vec<String>,
        total_cost: f64,
        timestamp: DateTime<Utc>,
    },

    /// The replanner is computing a new plan.
    ReplanTriggered {
        run_id: Uuid,
        attempt: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A run ended.
    RunFinished {
        run_id: Uuid,
        success: bool,
        executed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl TelemetryEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TelemetryEvent::ExecutionStarted { timestamp, .. }
            | TelemetryEvent::ExecutionCompleted { timestamp, .. }
            | TelemetryEvent::ExecutionWarned { timestamp, .. }
            | TelemetryEvent::ExecutionCancelled { timestamp, .. }
            | TelemetryEvent::AnomalyDetected { timestamp, .. }
            | TelemetryEvent::CircuitOpened { timestamp, .. }
            | TelemetryEvent::CircuitHalfOpened { timestamp, .. }
            | TelemetryEvent::CircuitClosed { timestamp, .. }
            | TelemetryEvent::PlanCreated { timestamp, .. }
            | TelemetryEvent::ReplanTriggered { timestamp, .. }
            | TelemetryEvent::RunFinished { timestamp, .. } => *timestamp,
        }
    }

    /// Stable snake_case event name for sinks that key on it.
    pub fn event_name(&self) -> &'static str {
        match self {
            TelemetryEvent::ExecutionStarted { .. } => "execution_started",
            TelemetryEvent::ExecutionCompleted { .. } => "execution_completed",
            TelemetryEvent::ExecutionWarned { .. } => "execution_warned",
            TelemetryEvent::ExecutionCancelled { .. } => "execution_cancelled",
            TelemetryEvent::AnomalyDetected { .. } => "anomaly_detected",
            TelemetryEvent::CircuitOpened { .. } => "circuit_opened",
            TelemetryEvent::CircuitHalfOpened { .. } => "circuit_half_opened",
            TelemetryEvent::CircuitClosed { .. } => "circuit_closed",
            TelemetryEvent::PlanCreated { .. } => "plan_created",
            TelemetryEvent::ReplanTriggered { .. } => "replan_triggered",
            TelemetryEvent::RunFinished { .. } => "run_finished",
        }
    }
}

/// Broadcast channel for [`TelemetryEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// dropped, and slow subscribers observe `Lagged` rather than stalling runs.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: TelemetryEvent) {
        tracing::trace!(event = event.event_name(), "Telemetry event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
