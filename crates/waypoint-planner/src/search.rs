//! A* search over the implicit state graph.
//!
//! Nodes are world states, edges are executable actions. `g` is the cost paid
//! so far and `h` an admissible estimate of the remaining cost, so the first
//! goal state popped from the frontier is reached by a cheapest plan.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use waypoint_core::config::PlannerConfig;
use waypoint_core::{Action, ActionLibrary, Plan, WorldState};

use crate::cost::{ActionGate, AllowAll, BaseCost, CostModel};

const COST_EPSILON: f64 = 1e-9;

/// Everything one search needs besides the planner's own bounds.
pub struct PlanRequest<'a> {
    pub start: &'a WorldState,
    pub goal: &'a WorldState,
    pub library: &'a ActionLibrary,
    gate: &'a dyn ActionGate,
    cost_model: &'a dyn CostModel,
    excluded: Vec<String>,
}

impl<'a> PlanRequest<'a> {
    pub fn new(start: &'a WorldState, goal: &'a WorldState, library: &'a ActionLibrary) -> Self {
        Self {
            start,
            goal,
            library,
            gate: &AllowAll,
            cost_model: &BaseCost,
            excluded: Vec::new(),
        }
    }

    /// Only actions the gate admits are considered.
    pub fn with_gate(mut self, gate: &'a dyn ActionGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_cost_model(mut self, cost_model: &'a dyn CostModel) -> Self {
        self.cost_model = cost_model;
        self
    }

    /// Never select the named action.
    pub fn excluding(mut self, name: impl Into<String>) -> Self {
        self.excluded.push(name.into());
        self
    }
}

/// Search counters, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub expanded: usize,
    pub generated: usize,
    pub candidate_actions: usize,
}

/// Result of a search: a plan, or `None` when no plan exists within bounds.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub plan: Option<Plan>,
    pub stats: SearchStats,
}

/// Admissible estimate of the remaining cost.
///
/// One action can fix at most `max_goal_effects` unmet goal conditions and
/// costs at least `min_cost`, so `ceil(unmet / max_goal_effects) * min_cost`
/// never overestimates. With single-effect actions of cost 1 this is exactly
/// the number of unmet goal conditions.
#[derive(Debug, Clone, Copy)]
struct Heuristic {
    min_cost: f64,
    max_goal_effects: usize,
}

impl Heuristic {
    fn estimate(&self, state: &WorldState, goal: &WorldState) -> f64 {
        let unmet = state.unmet(goal);
        if unmet == 0 {
            return 0.0;
        }
        let steps = unmet.div_ceil(self.max_goal_effects);
        steps as f64 * self.min_cost
    }
}

struct Node {
    f: f64,
    g: f64,
    h: f64,
    depth: usize,
    seq: u64,
    key: String,
    state: WorldState,
    path: Vec<Arc<Action>>,
}

impl Node {
    /// `Less` means `self` should be expanded before `other`.
    fn priority(&self, other: &Self) -> Ordering {
        self.f
            .total_cmp(&other.f)
            .then_with(|| self.h.total_cmp(&other.h))
            .then_with(|| {
                let mine = self.path.iter().map(|a| a.name.as_str());
                let theirs = other.path.iter().map(|a| a.name.as_str());
                mine.cmp(theirs)
            })
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.priority(other) == Ordering::Equal
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    // BinaryHeap pops the greatest element; the best node must compare greatest.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority(other).reverse()
    }
}

/// Frontier bookkeeping: per state, the (cost, depth) pairs not dominated by
/// another known path. A path is only worth expanding if no other path reached
/// the same state at most as expensively and at most as deep.
#[derive(Default)]
struct Frontier {
    heap: BinaryHeap<Node>,
    best: HashMap<String, Vec<(f64, usize)>>,
    seq: u64,
}

impl Frontier {
    fn push(&mut self, mut node: Node) -> bool {
        let entries = self.best.entry(node.key.clone()).or_default();
        if entries
            .iter()
            .any(|(g, depth)| *g <= node.g + COST_EPSILON && *depth <= node.depth)
        {
            return false;
        }
        entries.retain(|(g, depth)| !(node.g <= *g + COST_EPSILON && node.depth <= *depth));
        entries.push((node.g, node.depth));
        node.seq = self.seq;
        self.seq += 1;
        self.heap.push(node);
        true
    }

    fn pop(&mut self) -> Option<Node> {
        while let Some(node) = self.heap.pop() {
            let current = self.best.get(&node.key).is_some_and(|entries| {
                entries
                    .iter()
                    .any(|(g, depth)| (g - node.g).abs() <= COST_EPSILON && *depth == node.depth)
            });
            if current {
                return Some(node);
            }
        }
        None
    }
}

/// Minimum-cost planner.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    config: PlannerConfig,
}

impl Planner {
    pub fn new(config: PlannerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan with base costs and every registered action available.
    pub fn find_plan(
        &self,
        start: &WorldState,
        goal: &WorldState,
        library: &ActionLibrary,
    ) -> Option<Plan> {
        self.search(&PlanRequest::new(start, goal, library)).plan
    }

    /// Run A* for `request`.
    ///
    /// Returns `plan: None` when the frontier is exhausted, every branch hits
    /// the depth bound, or the expansion budget runs out. That is a normal
    /// negative result, not an error.
    pub fn search(&self, request: &PlanRequest<'_>) -> PlanOutcome {
        let goal = request.goal;
        let mut stats = SearchStats::default();

        if request.start.satisfies(goal) {
            return PlanOutcome {
                plan: Some(Plan::empty()),
                stats,
            };
        }

        let actions: Vec<Arc<Action>> = request
            .library
            .iter()
            .filter(|a| !request.excluded.iter().any(|name| *name == a.name))
            .filter(|a| request.gate.is_available(a))
            .cloned()
            .collect();
        stats.candidate_actions = actions.len();

        let max_goal_effects = actions
            .iter()
            .map(|a| a.effects.keys().filter(|k| goal.contains_key(k)).count())
            .max()
            .unwrap_or(0);
        if max_goal_effects == 0 {
            tracing::debug!(goal = %goal, "No available action affects the goal");
            return PlanOutcome { plan: None, stats };
        }
        let min_cost = actions
            .iter()
            .map(|a| a.cost)
            .reduce(f64::min)
            .unwrap_or(1.0);
        let heuristic = Heuristic {
            min_cost,
            max_goal_effects,
        };

        let mut frontier = Frontier::default();
        let h0 = heuristic.estimate(request.start, goal);
        frontier.push(Node {
            f: h0,
            g: 0.0,
            h: h0,
            depth: 0,
            seq: 0,
            key: request.start.canonical_key(),
            state: request.start.clone(),
            path: Vec::new(),
        });

        while let Some(node) = frontier.pop() {
            if node.state.satisfies(goal) {
                tracing::debug!(
                    cost = node.g,
                    steps = node.path.len(),
                    expanded = stats.expanded,
                    "Plan found"
                );
                return PlanOutcome {
                    plan: Some(Plan {
                        actions: node.path,
                        total_cost: node.g,
                    }),
                    stats,
                };
            }

            if stats.expanded >= self.config.max_expansions {
                tracing::warn!(
                    max_expansions = self.config.max_expansions,
                    "Planner expansion budget exhausted"
                );
                break;
            }
            stats.expanded += 1;

            if node.depth >= self.config.max_plan_depth {
                continue;
            }

            for action in &actions {
                if !action.can_execute(&node.state) {
                    continue;
                }
                let next = action.apply(&node.state);
                let key = next.canonical_key();
                if key == node.key {
                    continue;
                }
                let g = node.g + request.cost_model.cost(action, &node.state);
                let h = heuristic.estimate(&next, goal);
                let mut path = node.path.clone();
                path.push(Arc::clone(action));
                if frontier.push(Node {
                    f: g + h,
                    g,
                    h,
                    depth: node.depth + 1,
                    seq: 0,
                    key,
                    state: next,
                    path,
                }) {
                    stats.generated += 1;
                }
            }
        }

        tracing::debug!(
            goal = %goal,
            expanded = stats.expanded,
            "No plan found"
        );
        PlanOutcome { plan: None, stats }
    }
}
