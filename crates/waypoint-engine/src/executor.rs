//! Runs a single action: breaker pre-flight, parameter binding, the monitored
//! handler call, bookkeeping and retries.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypoint_core::{Action, ActionError, ExecutionContext, HandlerOutput, HandlerRegistry, WorldState};

use crate::binder::{ParameterBinder, RunContext};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::learning::LearningModel;
use crate::monitor::{Decision, ExecutionMonitor, ExecutionRecord, ExecutionStatus};
use crate::retry::RetryPolicy;

const RUN_CANCELLED_REASON: &str = "cancelled: run";

/// Result of running one action, retries included.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub result: Result<HandlerOutput, ActionError>,
    /// Attempts made; zero when the handler was never reached.
    pub attempts: u32,
    pub records: Vec<ExecutionRecord>,
}

impl ActionOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.result, Err(ActionError::Cancelled))
    }
}

/// Shared services for executing actions. Cheap to share across runs.
pub struct Executor {
    handlers: Arc<HandlerRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    monitor: Arc<ExecutionMonitor>,
    learning: Arc<LearningModel>,
    retry: RetryPolicy,
    binder: Arc<dyn ParameterBinder>,
}

impl Executor {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        monitor: Arc<ExecutionMonitor>,
        learning: Arc<LearningModel>,
        retry: RetryPolicy,
        binder: Arc<dyn ParameterBinder>,
    ) -> Self {
        Self {
            handlers,
            breakers,
            monitor,
            learning,
            retry,
            binder,
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Execute `action` from `state`, retrying retryable failures per the
    /// retry policy. Never panics and never returns early without an outcome.
    pub async fn execute(
        &self,
        action: &Action,
        state: &WorldState,
        ctx: &RunContext,
        run_cancel: &CancellationToken,
    ) -> ActionOutcome {
        let mut records = Vec::new();
        let mut attempt = 0u32;

        loop {
            if run_cancel.is_cancelled() {
                return ActionOutcome {
                    result: Err(ActionError::Cancelled),
                    attempts: attempt,
                    records,
                };
            }
            if !self.breakers.allows(&action.name) {
                tracing::info!(action = %action.name, "Circuit open, handler not invoked");
                return ActionOutcome {
                    result: Err(ActionError::CircuitOpen(action.name.clone())),
                    attempts: attempt,
                    records,
                };
            }

            let (result, record) = self.attempt(action, state, ctx, run_cancel, attempt).await;
            records.extend(record);
            attempt += 1;

            let error = match result {
                Ok(output) => {
                    return ActionOutcome {
                        result: Ok(output),
                        attempts: attempt,
                        records,
                    }
                }
                Err(error) => error,
            };

            let Some(delay) = self.retry.next_delay(&error, action.idempotent, attempt - 1) else {
                return ActionOutcome {
                    result: Err(error),
                    attempts: attempt,
                    records,
                };
            };

            tracing::info!(
                action = %action.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying action"
            );
            if !sleep_or_cancel(delay, run_cancel).await {
                return ActionOutcome {
                    result: Err(ActionError::Cancelled),
                    attempts: attempt,
                    records,
                };
            }
        }
    }

    /// One monitored handler invocation.
    async fn attempt(
        &self,
        action: &Action,
        state: &WorldState,
        ctx: &RunContext,
        run_cancel: &CancellationToken,
        attempt: u32,
    ) -> (Result<HandlerOutput, ActionError>, Option<ExecutionRecord>) {
        let Some(handler) = self.handlers.get(&action.handler) else {
            let err = ActionError::HandlerFailed(format!("no handler registered as '{}'", action.handler));
            return (Err(err), None);
        };
        let params = match self.binder.bind(action, state, ctx) {
            Ok(params) => params,
            Err(err) => {
                tracing::warn!(action = %action.name, error = %err, "Parameter binding failed");
                return (Err(err), None);
            }
        };

        let execution_id = Uuid::new_v4();
        let token = run_cancel.child_token();
        let guard = self
            .monitor
            .observe(ctx.run_id, execution_id, action, attempt, token.clone());
        let exec_ctx = ExecutionContext {
            run_id: ctx.run_id,
            execution_id,
            action_name: action.name.clone(),
            attempt,
            cancel: token.clone(),
        };

        let deadline = tokio::time::Instant::from_std(guard.deadline);
        let mut result = tokio::select! {
            biased;
            _ = run_cancel.cancelled() => Err(ActionError::Cancelled),
            res = handler.execute(&exec_ctx, &params) => res,
            _ = tokio::time::sleep_until(deadline) => Err(ActionError::Timeout(guard.timeout)),
        };

        if run_cancel.is_cancelled() {
            token.cancel();
            let record = self.monitor.complete(
                execution_id,
                ExecutionStatus::Cancelled,
                Some(RUN_CANCELLED_REASON.to_string()),
            );
            return (Err(ActionError::Cancelled), record);
        }

        let mut breaker_recorded = false;
        if let Some(analysis) = self.monitor.orient(execution_id) {
            let mut decisions = self.monitor.decide(&analysis);
            // A succeeded execution never counts against its breaker.
            if result.is_ok() && !decisions.contains(&Decision::Cancel) {
                decisions.retain(|d| *d != Decision::CircuitBreak);
            }
            let outcome = self.monitor.act(execution_id, &decisions);
            if outcome.cancelled && result.is_ok() {
                // Finished on the deadline; the monitor already cancelled it.
                result = Err(ActionError::Timeout(guard.timeout));
            }
            breaker_recorded = outcome.circuit_tripped;
        }
        token.cancel();

        let (status, error) = match &result {
            Ok(_) => (ExecutionStatus::Succeeded, None),
            Err(err) => (ExecutionStatus::Failed, Some(err.to_string())),
        };
        let record = self.monitor.complete(execution_id, status, error);
        let duration = record.as_ref().map_or(Duration::ZERO, |r| r.duration);

        match &result {
            Ok(_) => self.breakers.record_success(&action.name),
            Err(_) if !breaker_recorded => self.breakers.record_failure(&action.name),
            Err(_) => {}
        }
        self.learning.record(&action.name, state, result.is_ok(), duration);

        if let Err(err) = &result {
            tracing::warn!(
                action = %action.name,
                execution_id = %execution_id,
                attempt,
                kind = err.kind(),
                error = %err,
                "Action failed"
            );
        }
        (result, record)
    }
}

/// Sleep for `delay`; false if the run was cancelled first.
async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use waypoint_core::config::{CircuitBreakerConfig, MonitorConfig, RetryConfig, RetryStrategy};
    use waypoint_core::{ActionHandler, EventBus, TelemetryEvent};

    use crate::binder::TemplateBinder;
    use crate::circuit_breaker::CircuitState;

    /// Fails with `error` for the first `failures` calls, then succeeds.
    struct Flaky {
        failures: u32,
        error: ActionError,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ActionHandler for Flaky {
        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            params: &serde_json::Value,
        ) -> Result<HandlerOutput, ActionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(self.error.clone())
            } else {
                Ok(HandlerOutput::new(params.clone()))
            }
        }
    }

    struct Hang;

    #[async_trait]
    impl ActionHandler for Hang {
        async fn execute(
            &self,
            ctx: &ExecutionContext,
            _params: &serde_json::Value,
        ) -> Result<HandlerOutput, ActionError> {
            ctx.cancel.cancelled().await;
            Err(ActionError::Cancelled)
        }
    }

    fn executor(handlers: HandlerRegistry) -> (Executor, Arc<CircuitBreakerRegistry>, Arc<LearningModel>) {
        let breakers = Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 3,
            ..CircuitBreakerConfig::default()
        }));
        let learning = Arc::new(LearningModel::default());
        let monitor = Arc::new(ExecutionMonitor::new(
            MonitorConfig {
                timeout_ms: 50,
                ..MonitorConfig::default()
            },
            100,
        ));
        let retry = RetryPolicy::new(RetryConfig {
            strategy: RetryStrategy::Immediate,
            max_attempts: 3,
            ..RetryConfig::default()
        });
        let executor = Executor::new(
            Arc::new(handlers),
            Arc::clone(&breakers),
            monitor,
            Arc::clone(&learning),
            retry,
            Arc::new(TemplateBinder),
        );
        (executor, breakers, learning)
    }

    fn flaky(failures: u32, error: ActionError) -> Flaky {
        Flaky {
            failures,
            error,
            calls: AtomicU32::new(0),
        }
    }

    fn ctx() -> RunContext {
        RunContext::new(Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("a", flaky(0, ActionError::Transient("x".into())));
        let (exec, _, learning) = executor(handlers);
        let action = Action::new("a", 1.0).with_params(serde_json::json!({"k": 1}));

        let outcome = exec
            .execute(&action, &WorldState::new(), &ctx(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.result.unwrap().output["k"], 1);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(learning.stats("a").unwrap().successes, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("a", flaky(1, ActionError::Transient("blip".into())));
        let (exec, breakers, _) = executor(handlers);

        let outcome = exec
            .execute(&Action::new("a", 1.0), &WorldState::new(), &ctx(), &CancellationToken::new())
            .await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.records[0].status, ExecutionStatus::Failed);
        assert_eq!(breakers.state("a"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_non_retryable_not_retried() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("a", flaky(5, ActionError::PermissionDenied("no".into())));
        let (exec, _, _) = executor(handlers);

        let outcome = exec
            .execute(&Action::new("a", 1.0), &WorldState::new(), &ctx(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome.result, Err(ActionError::PermissionDenied(_))));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_last_error() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("a", flaky(10, ActionError::RateLimited { retry_after: None }));
        let (exec, breakers, _) = executor(handlers);

        let outcome = exec
            .execute(&Action::new("a", 1.0), &WorldState::new(), &ctx(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome.result, Err(ActionError::RateLimited { .. })));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(breakers.state("a"), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_handler() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("a", flaky(0, ActionError::Transient("x".into())));
        let (exec, breakers, _) = executor(handlers);
        for _ in 0..3 {
            breakers.record_failure("a");
        }

        let outcome = exec
            .execute(&Action::new("a", 1.0), &WorldState::new(), &ctx(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.result.unwrap_err(), ActionError::CircuitOpen("a".into()));
        assert_eq!(outcome.attempts, 0);
        assert!(outcome.records.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_cancels_handler() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("slow", Hang);
        let (exec, _, _) = executor(handlers);
        let action = Action::new("slow", 1.0).non_idempotent();

        let outcome = exec
            .execute(&action, &WorldState::new(), &ctx(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome.result, Err(ActionError::Timeout(_))));
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.records[0].error.as_deref(), Some("cancelled: timeout"));
    }

    #[tokio::test]
    async fn test_run_cancellation_recorded_as_cancelled() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("slow", Hang);
        let (exec, breakers, learning) = executor(handlers);
        let action = Action::new("slow", 1.0).with_timeout(Duration::from_secs(10));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let outcome = exec.execute(&action, &WorldState::new(), &ctx(), &cancel).await;
        assert!(outcome.is_cancelled());
        assert_eq!(outcome.records[0].status, ExecutionStatus::Cancelled);
        assert_eq!(breakers.snapshot().len(), 0);
        assert!(learning.stats("slow").is_none());
    }

    #[tokio::test]
    async fn test_binding_failure_is_not_executed() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("a", flaky(0, ActionError::Transient("x".into())));
        let (exec, _, _) = executor(handlers);
        let action = Action::new("a", 1.0).with_params(serde_json::json!("$state.missing"));

        let outcome = exec
            .execute(&action, &WorldState::new(), &ctx(), &CancellationToken::new())
            .await;
        assert!(matches!(outcome.result, Err(ActionError::Binding(_))));
        assert!(outcome.records.is_empty());
    }

    /// Sleeps for `params.sleep_ms`, then succeeds.
    struct Sleeper;

    #[async_trait]
    impl ActionHandler for Sleeper {
        async fn execute(
            &self,
            _ctx: &ExecutionContext,
            params: &serde_json::Value,
        ) -> Result<HandlerOutput, ActionError> {
            let ms = params["sleep_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(HandlerOutput::default())
        }
    }

    /// Executor whose monitor trips the same breakers it uses.
    fn wired_executor(
        handlers: HandlerRegistry,
        breaker_config: CircuitBreakerConfig,
        events: EventBus,
    ) -> (Executor, Arc<CircuitBreakerRegistry>, Arc<ExecutionMonitor>) {
        let breakers = Arc::new(CircuitBreakerRegistry::new(breaker_config));
        let monitor = Arc::new(
            ExecutionMonitor::new(MonitorConfig::default(), 100)
                .with_breakers(Arc::clone(&breakers))
                .with_events(events),
        );
        let retry = RetryPolicy::new(RetryConfig {
            strategy: RetryStrategy::Immediate,
            max_attempts: 1,
            ..RetryConfig::default()
        });
        let executor = Executor::new(
            Arc::new(handlers),
            Arc::clone(&breakers),
            Arc::clone(&monitor),
            Arc::new(LearningModel::default()),
            retry,
            Arc::new(TemplateBinder),
        );
        (executor, breakers, monitor)
    }

    #[tokio::test]
    async fn test_half_open_breaker_closes_after_successful_executions() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("a", flaky(5, ActionError::Validation("bad".into())));
        let config = CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown_ms: 20,
            success_threshold: 3,
        };
        let (exec, breakers, _) = wired_executor(handlers, config, EventBus::default());
        let action = Action::new("a", 1.0);
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let outcome = exec.execute(&action, &WorldState::new(), &ctx(), &cancel).await;
            assert!(outcome.result.is_err());
        }
        assert_eq!(breakers.state("a"), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        for i in 0..3 {
            assert_ne!(breakers.state("a"), CircuitState::Open, "execution {i}");
            let outcome = exec.execute(&action, &WorldState::new(), &ctx(), &cancel).await;
            assert!(outcome.result.is_ok());
        }
        // The window error rate is still 5/8, yet successes must not reopen it.
        assert_eq!(breakers.state("a"), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failure_counted_once_when_monitor_trips_breaker() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("a", flaky(100, ActionError::Validation("bad".into())));
        let config = CircuitBreakerConfig {
            failure_threshold: 10,
            ..CircuitBreakerConfig::default()
        };
        let (exec, breakers, _) = wired_executor(handlers, config, EventBus::default());
        let action = Action::new("a", 1.0);

        // From the sixth execution on, the error rate decision fires as well.
        for _ in 0..7 {
            exec.execute(&action, &WorldState::new(), &ctx(), &CancellationToken::new())
                .await;
        }
        let snapshot = breakers.snapshot();
        assert_eq!(snapshot[0].consecutive_failures, 7);
        assert_eq!(snapshot[0].state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_slow_execution_flagged_as_anomaly() {
        let mut handlers = HandlerRegistry::new();
        handlers.register("a", Sleeper);
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let (exec, _, monitor) = wired_executor(handlers, CircuitBreakerConfig::default(), events);
        let steady = Action::new("a", 1.0).with_params(serde_json::json!({"sleep_ms": 10}));
        let slow = Action::new("a", 1.0).with_params(serde_json::json!({"sleep_ms": 150}));
        let cancel = CancellationToken::new();

        // Exactly enough history for anomaly detection to start.
        for _ in 0..5 {
            exec.execute(&steady, &WorldState::new(), &ctx(), &cancel).await;
        }

        // A slow in-flight execution is oriented against that history.
        let inflight_id = Uuid::new_v4();
        monitor.observe(Uuid::nil(), inflight_id, &slow, 0, CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(150)).await;
        let analysis = monitor.orient(inflight_id).unwrap();
        let decisions = monitor.decide(&analysis);
        assert!(decisions
            .iter()
            .any(|d| matches!(d, Decision::Investigate(a) if a[0].metric == "duration_ms")));
        monitor.complete(inflight_id, ExecutionStatus::Cancelled, None);

        let outcome = exec.execute(&slow, &WorldState::new(), &ctx(), &cancel).await;
        assert!(outcome.result.is_ok());
        let slow_id = outcome.records[0].execution_id;

        let mut flagged = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let TelemetryEvent::AnomalyDetected {
                execution_id,
                metric,
                z_score,
                ..
            } = event
            {
                flagged.push((execution_id, metric, z_score));
            }
        }
        assert_eq!(flagged.len(), 1, "{flagged:?}");
        assert_eq!(flagged[0].0, slow_id);
        assert_eq!(flagged[0].1, "duration_ms");
        assert!(flagged[0].2 > 2.0);
    }
}
