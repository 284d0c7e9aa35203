//! Seams through which the planner consults the rest of the system.

use waypoint_core::{Action, WorldState};

/// Decides whether an action may appear in a plan at all.
///
/// The circuit breaker registry implements this so that actions with an open
/// circuit are never selected.
pub trait ActionGate {
    fn is_available(&self, action: &Action) -> bool;
}

/// Gate that admits every action.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl ActionGate for AllowAll {
    fn is_available(&self, _action: &Action) -> bool {
        true
    }
}

/// Prices an action when taken from a given state.
///
/// Implementations must never return less than `action.cost`: the search
/// heuristic is scaled by the cheapest base cost, and cheaper edges would
/// make it overestimate.
pub trait CostModel {
    fn cost(&self, action: &Action, state: &WorldState) -> f64;
}

/// Uses each action's registered cost unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaseCost;

impl CostModel for BaseCost {
    fn cost(&self, action: &Action, _state: &WorldState) -> f64 {
        action.cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let action = Action::new("a", 1.0);
        assert!(AllowAll.is_available(&action));
    }

    #[test]
    fn test_base_cost() {
        let action = Action::new("a", 2.5);
        assert_eq!(BaseCost.cost(&action, &WorldState::new()), 2.5);
    }
}
