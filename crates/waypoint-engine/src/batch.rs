//! Grouping of consecutive plan steps that can safely run concurrently.

use std::collections::BTreeSet;
use std::sync::Arc;

use waypoint_core::{Action, WorldState};

/// Length of the batch at the head of `actions`.
///
/// The head action is always included. Each following action joins while it
/// is executable in `state` as-is and touches (reads or writes) no condition
/// touched by an earlier member. Returns 0 only for an empty slice.
pub fn next_batch_len<'a>(actions: impl IntoIterator<Item = &'a Arc<Action>>, state: &WorldState) -> usize {
    let mut iter = actions.into_iter();
    let Some(head) = iter.next() else {
        return 0;
    };
    let mut touched: BTreeSet<&str> = head.touched_keys().map(String::as_str).collect();
    let mut len = 1;

    for action in iter {
        if !action.can_execute(state) {
            break;
        }
        let keys: Vec<&str> = action.touched_keys().map(String::as_str).collect();
        if keys.iter().any(|k| touched.contains(k)) {
            break;
        }
        touched.extend(keys);
        len += 1;
    }
    len
}

/// Apply the effects of a finished batch in action-name order.
pub fn merge_effects<'a>(state: &WorldState, succeeded: impl IntoIterator<Item = &'a Action>) -> WorldState {
    let mut actions: Vec<&Action> = succeeded.into_iter().collect();
    actions.sort_by(|a, b| a.name.cmp(&b.name));
    actions.into_iter().fold(state.clone(), |s, action| action.apply(&s))
}
