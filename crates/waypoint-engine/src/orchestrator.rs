//! Run driver: plans towards a goal, executes the plan step by step, recovers
//! locally from failures and replans within a fixed budget.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waypoint_core::{
    Action, ActionError, ActionLibrary, EventBus, HandlerOutput, HandlerRegistry, Plan, TelemetryEvent,
    WaypointConfig, WorldState,
};
use waypoint_planner::{ActionGate, PlanRequest, Planner};

use crate::batch::{merge_effects, next_batch_len};
use crate::binder::{ParameterBinder, RunContext, TemplateBinder};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::error::{OrchestrationError, RunFailure};
use crate::executor::{ActionOutcome, Executor};
use crate::learning::{LearningCostModel, LearningModel};
use crate::monitor::{ExecutionMonitor, ExecutionRecord};
use crate::recovery::{choose_recovery, Recovery};
use crate::resources::{ProcStatusProbe, ResourceProbe};
use crate::retry::RetryPolicy;
use crate::step::{RunStep, StepStatus};

/// External source of goal updates, polled before every action.
pub trait GoalSource: Send + Sync {
    /// The goal `run_id` should now pursue, or `None` to keep the current one.
    fn current_goal(&self, run_id: Uuid) -> Option<WorldState>;
}

/// How a run that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    GoalReached,
    /// No plan reaches the goal from the start state. Nothing was executed.
    NoPlanFound,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcome: RunOutcome,
    pub goal: WorldState,
    pub final_state: WorldState,
    pub steps: Vec<RunStep>,
    pub records: Vec<ExecutionRecord>,
    /// Calls into the planner, the initial plan included.
    pub planning_invocations: u32,
    pub replans: u32,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == RunOutcome::GoalReached
    }

    /// Names of actions that ran to success, in order.
    pub fn executed(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .map(|s| s.action.as_str())
            .collect()
    }
}

/// Per-run mutable state. Never shared between runs.
struct RunState {
    run_id: Uuid,
    state: WorldState,
    goal: WorldState,
    ctx: RunContext,
    queue: VecDeque<Arc<Action>>,
    steps: Vec<RunStep>,
    records: Vec<ExecutionRecord>,
    planning_invocations: u32,
    replans: u32,
    /// Most recent failure not yet followed by a success.
    last_failure: Option<Arc<Action>>,
    /// Everything that failed during this run; never chosen as a substitute.
    failed: HashSet<String>,
}

impl RunState {
    fn new(start: WorldState, goal: WorldState) -> Self {
        let run_id = Uuid::new_v4();
        Self {
            run_id,
            state: start,
            goal,
            ctx: RunContext::new(run_id),
            queue: VecDeque::new(),
            steps: Vec::new(),
            records: Vec::new(),
            planning_invocations: 0,
            replans: 0,
            last_failure: None,
            failed: HashSet::new(),
        }
    }

    fn absorb(&mut self, step: &mut RunStep, outcome: &mut ActionOutcome) {
        step.attempts += outcome.attempts;
        self.records.append(&mut outcome.records);
    }

    fn into_report(self, outcome: RunOutcome) -> RunReport {
        RunReport {
            run_id: self.run_id,
            outcome,
            goal: self.goal,
            final_state: self.state,
            steps: self.steps,
            records: self.records,
            planning_invocations: self.planning_invocations,
            replans: self.replans,
        }
    }

    fn into_failure(self, error: OrchestrationError) -> RunFailure {
        RunFailure {
            run_id: self.run_id,
            error,
            steps: self.steps,
            records: self.records,
            planning_invocations: self.planning_invocations,
        }
    }
}

/// What the run loop should do after an action settles.
#[derive(Debug, Clone, PartialEq)]
enum Resolution {
    Continue,
    Replan(String),
}

/// Breaker gate that also rejects actions already failed in this run.
struct ExcludingGate<'a> {
    inner: &'a dyn ActionGate,
    excluded: &'a HashSet<String>,
}

impl ActionGate for ExcludingGate<'_> {
    fn is_available(&self, action: &Action) -> bool {
        !self.excluded.contains(&action.name) && self.inner.is_available(action)
    }
}

/// Shared orchestration services. Wrap in an `Arc` to drive concurrent runs.
pub struct Orchestrator {
    config: WaypointConfig,
    library: Arc<ActionLibrary>,
    planner: Planner,
    executor: Executor,
    breakers: Arc<CircuitBreakerRegistry>,
    learning: Arc<LearningModel>,
    monitor: Arc<ExecutionMonitor>,
    events: EventBus,
    goal_source: Option<Arc<dyn GoalSource>>,
}

impl Orchestrator {
    pub fn builder(
        config: WaypointConfig,
        library: Arc<ActionLibrary>,
        handlers: Arc<HandlerRegistry>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config, library, handlers)
    }

    pub fn config(&self) -> &WaypointConfig {
        &self.config
    }

    pub fn library(&self) -> &ActionLibrary {
        &self.library
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn learning(&self) -> &Arc<LearningModel> {
        &self.learning
    }

    pub fn monitor(&self) -> &Arc<ExecutionMonitor> {
        &self.monitor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Drive one run from `start` until the goal holds, no plan exists, or a
    /// terminal error occurs.
    pub async fn run(
        &self,
        start: WorldState,
        goal: WorldState,
        cancel: CancellationToken,
    ) -> Result<RunReport, RunFailure> {
        let mut run = RunState::new(start, goal);
        tracing::info!(run_id = %run.run_id, start = %run.state, goal = %run.goal, "Run started");

        let result = self.drive(&mut run, &cancel).await;
        let executed = run
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .count();
        self.events.publish(TelemetryEvent::RunFinished {
            run_id: run.run_id,
            success: matches!(result, Ok(RunOutcome::GoalReached)),
            executed,
            timestamp: Utc::now(),
        });

        match result {
            Ok(outcome) => {
                tracing::info!(
                    run_id = %run.run_id,
                    ?outcome,
                    executed,
                    replans = run.replans,
                    "Run finished"
                );
                Ok(run.into_report(outcome))
            }
            Err(error) => {
                tracing::error!(run_id = %run.run_id, error = %error, executed, "Run failed");
                Err(run.into_failure(error))
            }
        }
    }

    /// Start a run on its own task.
    pub fn spawn_run(
        self: &Arc<Self>,
        start: WorldState,
        goal: WorldState,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<RunReport, RunFailure>> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run(start, goal, cancel).await })
    }

    /// Execute a single action outside any plan.
    ///
    /// Unlike a run, unmet preconditions are an error here rather than a
    /// reason to replan. Returns the successor state and the handler output.
    pub async fn execute_action(
        &self,
        action: &Action,
        state: &WorldState,
        cancel: &CancellationToken,
    ) -> Result<(WorldState, HandlerOutput), OrchestrationError> {
        let missing = action.missing_preconditions(state);
        if !missing.is_empty() {
            return Err(OrchestrationError::PreconditionViolation {
                action: action.name.clone(),
                missing,
            });
        }
        self.check_handler(action)?;

        let ctx = RunContext::new(Uuid::new_v4());
        let outcome = self.executor.execute(action, state, &ctx, cancel).await;
        match outcome.result {
            Ok(output) => Ok((action.apply(state), output)),
            Err(ActionError::Cancelled) => Err(OrchestrationError::Cancelled),
            Err(source) => Err(OrchestrationError::ActionFailed {
                action: action.name.clone(),
                source,
            }),
        }
    }

    async fn drive(
        &self,
        run: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, OrchestrationError> {
        match self.plan(run, None, false)? {
            Some(plan) => run.queue = plan.actions.into(),
            None => {
                tracing::info!(run_id = %run.run_id, "No plan reaches the goal");
                return Ok(RunOutcome::NoPlanFound);
            }
        }

        loop {
            if cancel.is_cancelled() {
                return Err(OrchestrationError::Cancelled);
            }
            if self.poll_goal(run) {
                self.replan(run, "goal changed")?;
                continue;
            }
            if run.state.satisfies(&run.goal) {
                return Ok(RunOutcome::GoalReached);
            }

            let Some(next) = run.queue.front().cloned() else {
                self.replan(run, "plan exhausted before reaching the goal")?;
                continue;
            };
            if !next.can_execute(&run.state) {
                let reason = format!("preconditions of {} no longer hold", next.name);
                self.replan(run, &reason)?;
                continue;
            }

            let len = if self.config.engine.parallel_batches {
                next_batch_len(run.queue.iter(), &run.state)
            } else {
                1
            };
            let batch: Vec<Arc<Action>> = run.queue.drain(..len).collect();
            let resolution = match batch.as_slice() {
                [action] => self.run_single(run, action, cancel).await?,
                _ => self.run_batch(run, &batch, cancel).await?,
            };
            if let Resolution::Replan(reason) = resolution {
                self.replan(run, &reason)?;
            }
        }
    }

    async fn run_single(
        &self,
        run: &mut RunState,
        action: &Arc<Action>,
        cancel: &CancellationToken,
    ) -> Result<Resolution, OrchestrationError> {
        let mut step = RunStep::new(&action.name);
        step.transition(StepStatus::Running)?;
        let mut outcome = self.executor.execute(action, &run.state, &run.ctx, cancel).await;
        run.absorb(&mut step, &mut outcome);

        match outcome.result {
            Ok(output) => {
                run.state = action.apply(&run.state);
                self.succeed(run, step, action, output)?;
                Ok(Resolution::Continue)
            }
            Err(ActionError::Cancelled) => {
                step.transition(StepStatus::Cancelled)?;
                run.steps.push(step);
                Err(OrchestrationError::Cancelled)
            }
            Err(error) => {
                step.error = Some(error.to_string());
                step.transition(StepStatus::Failed)?;
                self.recover(run, step, action, error, cancel).await
            }
        }
    }

    /// Execute independent actions concurrently. Effects are applied once
    /// the whole batch has finished, in action-name order.
    async fn run_batch(
        &self,
        run: &mut RunState,
        batch: &[Arc<Action>],
        cancel: &CancellationToken,
    ) -> Result<Resolution, OrchestrationError> {
        tracing::debug!(
            run_id = %run.run_id,
            actions = ?batch.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            "Executing batch"
        );
        let outcomes = {
            let state = &run.state;
            let ctx = &run.ctx;
            futures::future::join_all(
                batch
                    .iter()
                    .map(|action| self.executor.execute(action, state, ctx, cancel)),
            )
            .await
        };

        let mut succeeded: Vec<&Action> = Vec::new();
        let mut failed = Vec::new();
        let mut cancelled = false;
        for (action, mut outcome) in batch.iter().zip(outcomes) {
            let mut step = RunStep::new(&action.name);
            step.transition(StepStatus::Running)?;
            run.absorb(&mut step, &mut outcome);
            match outcome.result {
                Ok(output) => {
                    self.succeed(run, step, action, output)?;
                    succeeded.push(action);
                }
                Err(ActionError::Cancelled) => {
                    step.transition(StepStatus::Cancelled)?;
                    run.steps.push(step);
                    cancelled = true;
                }
                Err(error) => {
                    step.error = Some(error.to_string());
                    step.transition(StepStatus::Failed)?;
                    failed.push((step, action, error));
                }
            }
        }
        run.state = merge_effects(&run.state, succeeded);

        if cancelled {
            for (mut step, _, _) in failed {
                step.transition(StepStatus::Skipped)?;
                run.steps.push(step);
            }
            return Err(OrchestrationError::Cancelled);
        }

        let mut resolution = Resolution::Continue;
        for (step, action, error) in failed {
            let next = self.recover(run, step, action, error, cancel).await?;
            if resolution == Resolution::Continue {
                resolution = next;
            }
        }
        Ok(resolution)
    }

    /// Record a successful step. The caller applies the action's effects.
    fn succeed(
        &self,
        run: &mut RunState,
        mut step: RunStep,
        action: &Action,
        output: HandlerOutput,
    ) -> Result<(), OrchestrationError> {
        step.transition(StepStatus::Succeeded)?;
        step.output = Some(output.output.clone());
        run.ctx.record_output(&action.name, output.output);
        run.steps.push(step);
        run.last_failure = None;
        Ok(())
    }

    /// Handle an action whose retries are exhausted. `step` is `Failed`.
    async fn recover(
        &self,
        run: &mut RunState,
        mut step: RunStep,
        action: &Arc<Action>,
        mut error: ActionError,
        cancel: &CancellationToken,
    ) -> Result<Resolution, OrchestrationError> {
        let mut conflict_retried = false;
        loop {
            run.failed.insert(action.name.clone());
            run.last_failure = Some(Arc::clone(action));
            let recovery = self.choose(run, action, &error, conflict_retried);
            tracing::info!(
                run_id = %run.run_id,
                action = %action.name,
                error = %error,
                recovery = recovery.label(),
                "Recovering from failure"
            );

            match recovery {
                Recovery::CleanupAndRetry { cleanup } => {
                    conflict_retried = true;
                    if let Some(cleanup) = cleanup {
                        self.run_cleanup(run, &cleanup, cancel).await?;
                    }
                    step.transition(StepStatus::Running)?;
                    let mut outcome = self.executor.execute(action, &run.state, &run.ctx, cancel).await;
                    run.absorb(&mut step, &mut outcome);
                    match outcome.result {
                        Ok(output) => {
                            run.state = action.apply(&run.state);
                            self.succeed(run, step, action, output)?;
                            return Ok(Resolution::Continue);
                        }
                        Err(ActionError::Cancelled) => {
                            step.transition(StepStatus::Cancelled)?;
                            run.steps.push(step);
                            return Err(OrchestrationError::Cancelled);
                        }
                        Err(next) => {
                            step.error = Some(next.to_string());
                            step.transition(StepStatus::Failed)?;
                            error = next;
                        }
                    }
                }
                Recovery::Substitute(alternative) => {
                    self.check_handler(&alternative)?;
                    step.transition(StepStatus::Substituted)?;
                    run.steps.push(step);
                    tracing::info!(
                        action = %action.name,
                        substitute = %alternative.name,
                        "Substituting alternative action"
                    );
                    run.queue.push_front(alternative);
                    return Ok(Resolution::Continue);
                }
                Recovery::Skip => {
                    step.transition(StepStatus::Skipped)?;
                    run.steps.push(step);
                    return Ok(Resolution::Continue);
                }
                Recovery::Replan => {
                    step.transition(StepStatus::Replanned)?;
                    run.steps.push(step);
                    return Ok(Resolution::Replan(format!("{} failed: {}", action.name, error)));
                }
            }
        }
    }

    fn choose(&self, run: &RunState, action: &Action, error: &ActionError, conflict_retried: bool) -> Recovery {
        let gate = ExcludingGate {
            inner: self.breakers.as_ref(),
            excluded: &run.failed,
        };
        choose_recovery(error, action, &run.state, &self.library, &gate, conflict_retried)
    }

    /// Run a conflict cleanup action as its own step. Its failure is logged
    /// and otherwise ignored; the retry that follows decides the outcome.
    async fn run_cleanup(
        &self,
        run: &mut RunState,
        cleanup: &Arc<Action>,
        cancel: &CancellationToken,
    ) -> Result<(), OrchestrationError> {
        if !cleanup.can_execute(&run.state) {
            tracing::warn!(cleanup = %cleanup.name, "Cleanup action not executable, skipping it");
            return Ok(());
        }
        self.check_handler(cleanup)?;

        let mut step = RunStep::new(&cleanup.name);
        step.transition(StepStatus::Running)?;
        let mut outcome = self.executor.execute(cleanup, &run.state, &run.ctx, cancel).await;
        run.absorb(&mut step, &mut outcome);
        match outcome.result {
            Ok(output) => {
                run.state = cleanup.apply(&run.state);
                self.succeed(run, step, cleanup, output)
            }
            Err(ActionError::Cancelled) => {
                step.transition(StepStatus::Cancelled)?;
                run.steps.push(step);
                Err(OrchestrationError::Cancelled)
            }
            Err(error) => {
                tracing::warn!(cleanup = %cleanup.name, error = %error, "Cleanup action failed");
                step.error = Some(error.to_string());
                step.transition(StepStatus::Failed)?;
                step.transition(StepStatus::Skipped)?;
                run.steps.push(step);
                Ok(())
            }
        }
    }

    /// True if the goal source supplied a different goal.
    fn poll_goal(&self, run: &mut RunState) -> bool {
        let Some(source) = &self.goal_source else {
            return false;
        };
        match source.current_goal(run.run_id) {
            Some(goal) if goal != run.goal => {
                tracing::info!(run_id = %run.run_id, old = %run.goal, new = %goal, "Goal changed");
                run.goal = goal;
                true
            }
            _ => false,
        }
    }

    /// Replace the remaining plan, spending one unit of the replan budget.
    fn replan(&self, run: &mut RunState, reason: &str) -> Result<(), OrchestrationError> {
        let budget = self.config.replanner.max_replan_attempts;
        if run.replans >= budget {
            return Err(OrchestrationError::ReplanExhausted {
                attempts: run.replans,
                last_failure: last_failure_name(run, reason),
            });
        }
        run.replans += 1;
        tracing::info!(run_id = %run.run_id, attempt = run.replans, reason, "Replanning");
        self.events.publish(TelemetryEvent::ReplanTriggered {
            run_id: run.run_id,
            attempt: run.replans,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });

        let exclude = run
            .last_failure
            .as_ref()
            .filter(|a| !a.critical)
            .map(|a| a.name.clone());
        match self.plan(run, exclude.as_deref(), true)? {
            Some(plan) => {
                run.queue = plan.actions.into();
                Ok(())
            }
            None => {
                tracing::warn!(run_id = %run.run_id, reason, "Replan found no plan");
                Err(OrchestrationError::ReplanExhausted {
                    attempts: run.replans,
                    last_failure: last_failure_name(run, reason),
                })
            }
        }
    }

    /// One planner invocation from the run's current state. Replans price
    /// actions through the learning model.
    fn plan(
        &self,
        run: &mut RunState,
        exclude: Option<&str>,
        learned_costs: bool,
    ) -> Result<Option<Plan>, OrchestrationError> {
        run.planning_invocations += 1;
        let cost_model = LearningCostModel::new(&self.learning);
        let mut request =
            PlanRequest::new(&run.state, &run.goal, &self.library).with_gate(self.breakers.as_ref());
        if learned_costs {
            request = request.with_cost_model(&cost_model);
        }
        if let Some(name) = exclude {
            request = request.excluding(name);
        }

        let outcome = self.planner.search(&request);
        tracing::debug!(
            run_id = %run.run_id,
            expanded = outcome.stats.expanded,
            generated = outcome.stats.generated,
            "Plan search finished"
        );
        let Some(plan) = outcome.plan else {
            return Ok(None);
        };
        for action in &plan.actions {
            self.check_handler(action)?;
        }

        tracing::info!(
            run_id = %run.run_id,
            actions = ?plan.action_names(),
            total_cost = plan.total_cost,
            "Plan created"
        );
        self.events.publish(TelemetryEvent::PlanCreated {
            run_id: run.run_id,
            actions: plan.action_names().into_iter().map(String::from).collect(),
            total_cost: plan.total_cost,
            timestamp: Utc::now(),
        });
        Ok(Some(plan))
    }

    fn check_handler(&self, action: &Action) -> Result<(), OrchestrationError> {
        if self.executor.handlers().contains(&action.handler) {
            Ok(())
        } else {
            Err(OrchestrationError::UnknownHandler {
                action: action.name.clone(),
                handler: action.handler.clone(),
            })
        }
    }
}

/// The action behind the last unrecovered failure, or the replan reason.
fn last_failure_name(run: &RunState, reason: &str) -> String {
    run.last_failure
        .as_ref()
        .map_or_else(|| reason.to_string(), |a| a.name.clone())
}

/// Assembles an [`Orchestrator`], creating any shared service not supplied.
pub struct OrchestratorBuilder {
    config: WaypointConfig,
    library: Arc<ActionLibrary>,
    handlers: Arc<HandlerRegistry>,
    events: Option<EventBus>,
    breakers: Option<Arc<CircuitBreakerRegistry>>,
    learning: Option<Arc<LearningModel>>,
    binder: Option<Arc<dyn ParameterBinder>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    goal_source: Option<Arc<dyn GoalSource>>,
}

impl OrchestratorBuilder {
    fn new(config: WaypointConfig, library: Arc<ActionLibrary>, handlers: Arc<HandlerRegistry>) -> Self {
        Self {
            config,
            library,
            handlers,
            events: None,
            breakers: None,
            learning: None,
            binder: None,
            probe: None,
            goal_source: None,
        }
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Share breakers with other orchestrators.
    pub fn breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = Some(breakers);
        self
    }

    pub fn learning(mut self, learning: Arc<LearningModel>) -> Self {
        self.learning = Some(learning);
        self
    }

    pub fn binder(mut self, binder: Arc<dyn ParameterBinder>) -> Self {
        self.binder = Some(binder);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn goal_source(mut self, source: Arc<dyn GoalSource>) -> Self {
        self.goal_source = Some(source);
        self
    }

    pub fn build(self) -> Orchestrator {
        let config = self.config;
        let events = self.events.unwrap_or_default();
        let breakers = self.breakers.unwrap_or_else(|| {
            Arc::new(
                CircuitBreakerRegistry::new(config.circuit_breaker.clone()).with_events(events.clone()),
            )
        });
        let learning = self
            .learning
            .unwrap_or_else(|| Arc::new(LearningModel::new(config.learning.clone())));
        let probe = self.probe.unwrap_or_else(|| Arc::new(ProcStatusProbe));
        let monitor = Arc::new(
            ExecutionMonitor::new(config.monitor.clone(), config.general.history_capacity)
                .with_probe(probe)
                .with_breakers(Arc::clone(&breakers))
                .with_events(events.clone()),
        );
        let binder = self.binder.unwrap_or_else(|| Arc::new(TemplateBinder));
        let executor = Executor::new(
            self.handlers,
            Arc::clone(&breakers),
            Arc::clone(&monitor),
            Arc::clone(&learning),
            RetryPolicy::new(config.retry.clone()),
            binder,
        );

        Orchestrator {
            planner: Planner::new(config.planner.clone()),
            config,
            library: self.library,
            executor,
            breakers,
            learning,
            monitor,
            events,
            goal_source: self.goal_source,
        }
    }
}
