//! Execution monitor: an observe / orient / decide / act loop per execution.
//!
//! The executor drives the phases explicitly:
//! 1. `observe` registers the execution and arms its deadline
//! 2. `orient` analyses it against the action's history
//! 3. `decide` turns the analysis into ordered decisions
//! 4. `act` applies them (cancel, warn, trip the breaker, log anomalies)
//! 5. `complete` records the result and updates metrics

pub mod analysis;
pub mod history;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypoint_core::config::MonitorConfig;
use waypoint_core::{Action, EventBus, TelemetryEvent};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::resources::{NullProbe, ResourceProbe, ResourceSnapshot};

pub use analysis::{Analysis, Anomaly, Decision, Pattern};
pub use history::{ActionMetrics, ExecutionHistory, ExecutionRecord, ExecutionStatus};

/// Reason attached to executions the monitor cancels for overrunning.
pub const TIMEOUT_REASON: &str = "cancelled: timeout";

/// Handle returned by `observe` for one in-flight execution.
#[derive(Debug, Clone)]
pub struct ExecutionGuard {
    pub execution_id: Uuid,
    /// Cancelled on timeout; handlers select on it.
    pub cancel: CancellationToken,
    pub deadline: Instant,
    pub timeout: Duration,
}

/// What `act` did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActOutcome {
    pub cancelled: bool,
    pub warned: bool,
    pub circuit_tripped: bool,
    pub anomalies_logged: usize,
    pub retry_requested: bool,
}

struct ActiveExecution {
    run_id: Uuid,
    action_name: String,
    attempt: u32,
    idempotent: bool,
    started: Instant,
    started_at: DateTime<Utc>,
    start_resources: ResourceSnapshot,
    timeout: Duration,
    cancel: CancellationToken,
    cancel_reason: Option<String>,
}

struct MonitorState {
    active: HashMap<Uuid, ActiveExecution>,
    history: ExecutionHistory,
    metrics: HashMap<String, ActionMetrics>,
}

pub struct ExecutionMonitor {
    config: MonitorConfig,
    probe: Arc<dyn ResourceProbe>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    events: Option<EventBus>,
    state: Mutex<MonitorState>,
}

impl ExecutionMonitor {
    pub fn new(config: MonitorConfig, history_capacity: usize) -> Self {
        Self {
            config,
            probe: Arc::new(NullProbe),
            breakers: None,
            events: None,
            state: Mutex::new(MonitorState {
                active: HashMap::new(),
                history: ExecutionHistory::new(history_capacity),
                metrics: HashMap::new(),
            }),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Breaker that `CircuitBreak` decisions record failures on.
    pub fn with_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start tracking an execution.
    ///
    /// `cancel` should be a child of the run's token so that run cancellation
    /// also reaches the handler.
    pub fn observe(
        &self,
        run_id: Uuid,
        execution_id: Uuid,
        action: &Action,
        attempt: u32,
        cancel: CancellationToken,
    ) -> ExecutionGuard {
        let timeout = action.timeout().unwrap_or_else(|| self.config.timeout());
        let start_resources = self.probe.sample();
        let started = Instant::now();
        let guard = ExecutionGuard {
            execution_id,
            cancel: cancel.clone(),
            deadline: started + timeout,
            timeout,
        };

        self.lock().active.insert(
            execution_id,
            ActiveExecution {
                run_id,
                action_name: action.name.clone(),
                attempt,
                idempotent: action.idempotent,
                started,
                started_at: Utc::now(),
                start_resources,
                timeout,
                cancel,
                cancel_reason: None,
            },
        );

        tracing::debug!(
            action = %action.name,
            execution_id = %execution_id,
            attempt,
            timeout_ms = timeout.as_millis() as u64,
            "Observing execution"
        );
        self.publish(TelemetryEvent::ExecutionStarted {
            run_id,
            execution_id,
            action: action.name.clone(),
            attempt,
            timestamp: Utc::now(),
        });
        guard
    }

    /// Analyse an execution against its action's history. `None` when the
    /// execution is not being observed.
    pub fn orient(&self, execution_id: Uuid) -> Option<Analysis> {
        let now_resources = self.probe.sample();
        let state = self.lock();
        let active = state.active.get(&execution_id)?;
        let duration = active.started.elapsed();
        let name = active.action_name.as_str();

        let records: Vec<&ExecutionRecord> = state.history.for_action(name).collect();
        let (error_rate, error_samples) =
            analysis::error_rate(records.iter().copied(), Utc::now(), self.config.error_window());
        let patterns = analysis::detect_patterns(&records);

        let mut anomalies = Vec::new();
        let durations: Vec<f64> = records
            .iter()
            .filter(|r| r.status != ExecutionStatus::Cancelled)
            .map(|r| r.duration_ms())
            .collect();
        anomalies.extend(analysis::z_score_anomaly(
            "duration_ms",
            &durations,
            duration.as_secs_f64() * 1000.0,
            self.config.anomaly_z_threshold,
            self.config.anomaly_min_samples,
        ));
        if let Some(memory) = now_resources.memory_bytes {
            let memory_samples: Vec<f64> = records
                .iter()
                .filter_map(|r| r.resources.memory_bytes)
                .map(|m| m as f64)
                .collect();
            anomalies.extend(analysis::z_score_anomaly(
                "memory_bytes",
                &memory_samples,
                memory as f64,
                self.config.anomaly_z_threshold,
                self.config.anomaly_min_samples,
            ));
        }

        Some(Analysis {
            action_name: name.to_string(),
            duration,
            is_slow: analysis::exceeds(duration, self.config.slow_threshold()),
            is_timeout: analysis::exceeds(duration, active.timeout),
            idempotent: active.idempotent,
            error_rate,
            error_samples,
            patterns,
            anomalies,
        })
    }

    pub fn decide(&self, analysis: &Analysis) -> Vec<Decision> {
        analysis::decide(
            analysis,
            self.config.error_rate_threshold,
            self.config.error_rate_min_samples,
        )
    }

    /// Apply decisions to an observed execution.
    pub fn act(&self, execution_id: Uuid, decisions: &[Decision]) -> ActOutcome {
        let mut outcome = ActOutcome::default();
        let action_name = {
            let mut state = self.lock();
            let Some(active) = state.active.get_mut(&execution_id) else {
                return outcome;
            };
            if decisions.contains(&Decision::Cancel) {
                active.cancel.cancel();
                active.cancel_reason = Some(TIMEOUT_REASON.to_string());
            }
            active.action_name.clone()
        };

        for decision in decisions {
            match decision {
                Decision::Cancel => {
                    outcome.cancelled = true;
                    tracing::warn!(action = %action_name, execution_id = %execution_id, "Execution timed out, cancelled");
                    self.publish(TelemetryEvent::ExecutionCancelled {
                        execution_id,
                        action: action_name.clone(),
                        reason: TIMEOUT_REASON.to_string(),
                        timestamp: Utc::now(),
                    });
                }
                Decision::Warn => {
                    outcome.warned = true;
                    self.publish(TelemetryEvent::ExecutionWarned {
                        execution_id,
                        action: action_name.clone(),
                        reason: "slow".to_string(),
                        timestamp: Utc::now(),
                    });
                }
                Decision::CircuitBreak => {
                    if let Some(breakers) = &self.breakers {
                        breakers.record_failure(&action_name);
                        outcome.circuit_tripped = true;
                    }
                    tracing::warn!(action = %action_name, "Error rate above threshold");
                }
                Decision::Investigate(anomalies) => {
                    for anomaly in anomalies {
                        tracing::warn!(
                            action = %action_name,
                            execution_id = %execution_id,
                            metric = %anomaly.metric,
                            value = anomaly.value,
                            mean = anomaly.mean,
                            std_dev = anomaly.std_dev,
                            z_score = anomaly.z_score,
                            "Anomaly detected"
                        );
                        self.publish(TelemetryEvent::AnomalyDetected {
                            execution_id,
                            action: action_name.clone(),
                            metric: anomaly.metric.clone(),
                            value: anomaly.value,
                            z_score: anomaly.z_score,
                            timestamp: Utc::now(),
                        });
                        outcome.anomalies_logged += 1;
                    }
                }
                Decision::Retry => outcome.retry_requested = true,
            }
        }
        outcome
    }

    /// Stop tracking an execution and record how it ended.
    ///
    /// A failure after a monitor cancel carries the timeout reason.
    pub fn complete(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
    ) -> Option<ExecutionRecord> {
        let resources = self.probe.sample();
        let (record, memory_delta) = {
            let mut state = self.lock();
            let active = state.active.remove(&execution_id)?;
            let memory_delta = resources
                .memory_bytes
                .zip(active.start_resources.memory_bytes)
                .map(|(end, start)| end as i64 - start as i64);
            let error = match (&active.cancel_reason, status) {
                (Some(reason), ExecutionStatus::Failed) => Some(reason.clone()),
                _ => error,
            };
            let record = ExecutionRecord {
                execution_id,
                run_id: active.run_id,
                action_name: active.action_name,
                started_at: active.started_at,
                finished_at: Utc::now(),
                duration: active.started.elapsed(),
                status,
                error,
                attempt: active.attempt,
                resources,
            };
            state
                .metrics
                .entry(record.action_name.clone())
                .or_default()
                .update(&record);
            state.history.push(record.clone());
            (record, memory_delta)
        };

        tracing::debug!(
            action = %record.action_name,
            execution_id = %execution_id,
            status = %record.status,
            duration_ms = record.duration.as_millis() as u64,
            memory_delta = ?memory_delta,
            "Execution complete"
        );
        self.publish(TelemetryEvent::ExecutionCompleted {
            run_id: record.run_id,
            execution_id,
            action: record.action_name.clone(),
            success: record.status == ExecutionStatus::Succeeded,
            duration_ms: record.duration.as_millis() as u64,
            error: record.error.clone(),
            timestamp: Utc::now(),
        });
        Some(record)
    }

    pub fn metrics(&self, action_name: &str) -> Option<ActionMetrics> {
        self.lock().metrics.get(action_name).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    /// Copy of the retained history, oldest first.
    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.lock().history.iter().cloned().collect()
    }

    fn publish(&self, event: TelemetryEvent) {
        if let Some(events) = &self.events {
            events.publish(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
