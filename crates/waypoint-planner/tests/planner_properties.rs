//! Soundness and optimality checks against exhaustive enumeration.
//!
//! Libraries are generated with proptest. Each library is small enough that
//! every action sequence up to the depth bound can be enumerated.

use proptest::prelude::*;
use waypoint_core::config::PlannerConfig;
use waypoint_core::{Action, ActionLibrary, WorldState};
use waypoint_planner::Planner;

const VARS: [&str; 4] = ["a", "b", "c", "d"];
const COSTS: [f64; 4] = [0.5, 1.0, 2.0, 3.0];
const DEPTH: usize = 4;

/// One generated action: cost index, per-variable precondition roll, the
/// primary effect variable and an optional second effect.
type ActionShape = (usize, Vec<u8>, usize, Option<(usize, bool)>);

fn action_shape() -> impl Strategy<Value = ActionShape> {
    (
        0..COSTS.len(),
        proptest::collection::vec(0u8..6, VARS.len()),
        0..VARS.len(),
        proptest::option::weighted(0.33, (0..VARS.len(), any::<bool>())),
    )
}

fn build_library(shapes: &[ActionShape]) -> ActionLibrary {
    let mut library = ActionLibrary::new();
    for (i, (cost, pre, effect, extra)) in shapes.iter().enumerate() {
        let mut action = Action::new(format!("act{}", i), COSTS[*cost]);
        for (var, roll) in VARS.iter().zip(pre) {
            match roll {
                0 => action = action.requires(*var, true),
                1 => action = action.requires(*var, false),
                _ => {}
            }
        }
        action = action.produces(VARS[*effect], true);
        if let Some((other, value)) = extra {
            action = action.produces(VARS[*other], *value);
        }
        library.register(action).expect("generated action is valid");
    }
    library
}

fn build_goal(picks: &[bool]) -> WorldState {
    let mut goal = WorldState::new();
    for (var, pick) in VARS.iter().zip(picks) {
        if *pick {
            goal = goal.with(*var, true);
        }
    }
    if goal.is_empty() {
        goal = goal.with("a", true);
    }
    goal
}

/// Cheapest cost of any executable sequence of at most `depth` actions that
/// reaches the goal.
fn brute_force(
    state: &WorldState,
    goal: &WorldState,
    library: &ActionLibrary,
    depth: usize,
) -> Option<f64> {
    if state.satisfies(goal) {
        return Some(0.0);
    }
    if depth == 0 {
        return None;
    }
    library
        .iter()
        .filter(|a| a.can_execute(state))
        .filter_map(|a| {
            brute_force(&a.apply(state), goal, library, depth - 1).map(|rest| rest + a.cost)
        })
        .reduce(f64::min)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_plans_are_sound_and_optimal(
        shapes in proptest::collection::vec(action_shape(), 5),
        picks in proptest::collection::vec(any::<bool>(), VARS.len()),
    ) {
        let planner = Planner::new(PlannerConfig {
            max_plan_depth: DEPTH,
            ..PlannerConfig::default()
        });
        let start = WorldState::from([("a", false), ("b", false), ("c", false), ("d", false)]);
        let library = build_library(&shapes);
        let goal = build_goal(&picks);
        let expected = brute_force(&start, &goal, &library, DEPTH);
        let plan = planner.find_plan(&start, &goal, &library);

        match (expected, plan) {
            (None, None) => {}
            (Some(best), Some(plan)) => {
                prop_assert!(plan.len() <= DEPTH, "plan exceeds depth");
                let end = plan.simulate(&start);
                prop_assert!(end.is_some(), "plan not executable");
                prop_assert!(end.is_some_and(|e| e.satisfies(&goal)), "plan misses goal");
                prop_assert!(
                    (plan.total_cost - best).abs() < 1e-9,
                    "planner cost {} but brute force found {}",
                    plan.total_cost,
                    best
                );
            }
            (expected, plan) => prop_assert!(
                false,
                "brute force {:?} disagrees with planner {:?}",
                expected,
                plan.map(|p| p.total_cost)
            ),
        }
    }

    #[test]
    fn prop_identical_inputs_give_identical_plans(
        shapes in proptest::collection::vec(action_shape(), 5),
        picks in proptest::collection::vec(any::<bool>(), VARS.len()),
    ) {
        let planner = Planner::default();
        let start = WorldState::new();
        let library = build_library(&shapes);
        let goal = build_goal(&picks);
        let first = planner.find_plan(&start, &goal, &library);
        let second = planner.find_plan(&start, &goal, &library);
        prop_assert_eq!(
            first.map(|p| p.action_names().join(",")),
            second.map(|p| p.action_names().join(","))
        );
    }
}

/// A fixed library where brute force and the planner must agree on a
/// multi-step optimum.
#[test]
fn test_cheaper_two_step_path_beats_direct_action() {
    let shapes: Vec<ActionShape> = vec![
        (3, vec![5, 5, 5, 5], 0, None),
        (0, vec![5, 5, 5, 5], 1, None),
        (0, vec![5, 0, 5, 5], 0, None),
    ];
    let library = build_library(&shapes);
    let goal = build_goal(&[true, false, false, false]);
    let start = WorldState::from([("a", false), ("b", false), ("c", false), ("d", false)]);
    let planner = Planner::new(PlannerConfig {
        max_plan_depth: DEPTH,
        ..PlannerConfig::default()
    });

    let plan = planner.find_plan(&start, &goal, &library).expect("plan exists");
    assert_eq!(brute_force(&start, &goal, &library, DEPTH), Some(1.0));
    assert_eq!(plan.action_names(), vec!["act1", "act2"]);
    assert!((plan.total_cost - 1.0).abs() < 1e-9);
}
