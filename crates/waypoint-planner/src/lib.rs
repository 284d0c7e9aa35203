//! Goal-directed planning for Waypoint.
//!
//! A* search over world states: given a start state, a partial goal and an
//! action library, find the cheapest action sequence that reaches the goal.

pub mod cost;
pub mod search;

pub use cost::{ActionGate, AllowAll, BaseCost, CostModel};
pub use search::{PlanOutcome, PlanRequest, Planner, SearchStats};
