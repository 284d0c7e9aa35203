//! Action definitions and the action library.
//!
//! An [`Action`] is an immutable description of a unit of work: what must hold
//! before it runs, what it makes true, and what it costs. The work itself is
//! performed by the handler registered under [`Action::handler`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LibraryError;
use crate::types::WorldState;

fn default_true() -> bool {
    true
}

/// A parameterized unit of work with preconditions, effects and a cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(default)]
    pub preconditions: WorldState,
    #[serde(default)]
    pub effects: WorldState,
    pub cost: f64,
    /// A critical action that fails without recovery ends the run instead of
    /// being skipped.
    #[serde(default)]
    pub critical: bool,
    /// Name of the handler in the handler registry. Defaults to the action name.
    #[serde(default)]
    pub handler: String,
    /// Parameter template resolved by the parameter binder.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Per-action timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Whether re-running after a timeout is safe.
    #[serde(default = "default_true")]
    pub idempotent: bool,
    /// Action to run before retrying after a conflict.
    #[serde(default)]
    pub cleanup: Option<String>,
}

impl Action {
    /// Create an action with no preconditions or effects.
    ///
    /// The handler name defaults to the action name.
    pub fn new(name: impl Into<String>, cost: f64) -> Self {
        let name = name.into();
        Self {
            handler: name.clone(),
            name,
            preconditions: WorldState::new(),
            effects: WorldState::new(),
            cost,
            critical: false,
            params: serde_json::Value::Null,
            timeout_ms: None,
            idempotent: true,
            cleanup: None,
        }
    }

    /// Add a precondition.
    pub fn requires(mut self, key: impl Into<String>, value: impl Into<crate::Value>) -> Self {
        self.preconditions = self.preconditions.with(key, value);
        self
    }

    /// Add an effect.
    pub fn produces(mut self, key: impl Into<String>, value: impl Into<crate::Value>) -> Self {
        self.effects = self.effects.with(key, value);
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = handler.into();
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_cleanup(mut self, cleanup: impl Into<String>) -> Self {
        self.cleanup = Some(cleanup.into());
        self
    }

    /// Every precondition must hold with an exactly equal value.
    ///
    /// A precondition key missing from the state counts as unmet.
    pub fn can_execute(&self, state: &WorldState) -> bool {
        state.satisfies(&self.preconditions)
    }

    /// Preconditions not satisfied by `state`, as `key` names.
    pub fn missing_preconditions(&self, state: &WorldState) -> Vec<String> {
        self.preconditions
            .iter()
            .filter(|(key, value)| state.get(key) != Some(*value))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Fraction of preconditions already true in `state` (1.0 when there are none).
    pub fn readiness(&self, state: &WorldState) -> f64 {
        if self.preconditions.is_empty() {
            return 1.0;
        }
        let met = self.preconditions.len() - state.unmet(&self.preconditions);
        met as f64 / self.preconditions.len() as f64
    }

    /// The state reached by running this action from `state`.
    pub fn apply(&self, state: &WorldState) -> WorldState {
        state.merge(&self.effects)
    }

    /// True if this action sets every condition in `effects` to the same value.
    pub fn provides(&self, effects: &WorldState) -> bool {
        self.effects.satisfies(effects)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Names of every condition this action reads or writes.
    pub fn touched_keys(&self) -> impl Iterator<Item = &String> {
        self.preconditions.keys().chain(self.effects.keys())
    }
}

// =============================================================================
// Action library
// =============================================================================

/// Registry of action definitions, keyed and iterated by name.
///
/// Registration is where definitions are validated, so every action the
/// planner sees has a positive, finite cost.
#[derive(Debug, Clone, Default)]
pub struct ActionLibrary {
    actions: BTreeMap<String, Arc<Action>>,
}

impl ActionLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action definition.
    pub fn register(&mut self, mut action: Action) -> Result<(), LibraryError> {
        if action.name.trim().is_empty() {
            return Err(LibraryError::EmptyName);
        }
        if !action.cost.is_finite() || action.cost <= 0.0 {
            return Err(LibraryError::InvalidCost {
                name: action.name,
                cost: action.cost,
            });
        }
        if action.effects.is_empty() {
            return Err(LibraryError::NoEffects(action.name));
        }
        if self.actions.contains_key(&action.name) {
            return Err(LibraryError::Duplicate(action.name));
        }
        if action.handler.is_empty() {
            action.handler = action.name.clone();
        }
        tracing::debug!(action = %action.name, cost = action.cost, "Action registered");
        self.actions.insert(action.name.clone(), Arc::new(action));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Action>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Iterate actions in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Action>> {
        self.actions.values()
    }

    /// Cheapest registered base cost, if any action is registered.
    pub fn min_cost(&self) -> Option<f64> {
        self.actions.values().map(|a| a.cost).reduce(f64::min)
    }

    /// Largest number of effects any single action declares.
    pub fn max_effect_count(&self) -> usize {
        self.actions
            .values()
            .map(|a| a.effects.len())
            .max()
            .unwrap_or(0)
    }

    /// Other actions whose effects cover every effect of `action`.
    pub fn alternatives_for(&self, action: &Action) -> Vec<Arc<Action>> {
        self.actions
            .values()
            .filter(|candidate| candidate.name != action.name && candidate.provides(&action.effects))
            .cloned()
            .collect()
    }
}

// =============================================================================
// Plan
// =============================================================================

/// An ordered action sequence and its total cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub actions: Vec<Arc<Action>>,
    pub total_cost: f64,
}

impl Plan {
    /// A plan that does nothing, for goals already satisfied.
    pub fn empty() -> Self {
        Self {
            actions: Vec::new(),
            total_cost: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn action_names(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.name.as_str()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.iter().any(|a| a.name == name)
    }

    /// Apply every action in order, ignoring preconditions.
    pub fn final_state(&self, start: &WorldState) -> WorldState {
        self.actions
            .iter()
            .fold(start.clone(), |state, action| action.apply(&state))
    }

    /// Apply every action in order, returning `None` as soon as one has
    /// unmet preconditions.
    pub fn simulate(&self, start: &WorldState) -> Option<WorldState> {
        let mut state = start.clone();
        for action in &self.actions {
            if !action.can_execute(&state) {
                return None;
            }
            state = action.apply(&state);
        }
        Some(state)
    }
}
