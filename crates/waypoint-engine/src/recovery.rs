//! Local recovery after an action has failed for good (retries exhausted).

use std::sync::Arc;

use waypoint_core::{Action, ActionError, ActionLibrary, WorldState};
use waypoint_planner::ActionGate;

#[derive(Debug, Clone, PartialEq)]
pub enum Recovery {
    /// Run the cleanup action (if any), then retry the failed action once.
    CleanupAndRetry { cleanup: Option<Arc<Action>> },
    /// Run an alternative that provides the same effects.
    Substitute(Arc<Action>),
    /// Leave the non-critical action out and carry on.
    Skip,
    /// Ask the planner for a new plan from the current state.
    Replan,
}

impl Recovery {
    pub fn label(&self) -> &'static str {
        match self {
            Recovery::CleanupAndRetry { .. } => "cleanup_and_retry",
            Recovery::Substitute(_) => "substitute",
            Recovery::Skip => "skip",
            Recovery::Replan => "replan",
        }
    }
}

/// Pick a recovery for `action`, which just failed with `error` in `state`.
///
/// `conflict_retried` is true when this action already had its one
/// cleanup-and-retry; a second conflict falls through to skip or replan.
pub fn choose_recovery(
    error: &ActionError,
    action: &Action,
    state: &WorldState,
    library: &ActionLibrary,
    gate: &dyn ActionGate,
    conflict_retried: bool,
) -> Recovery {
    match error {
        ActionError::Conflict(_) if !conflict_retried => {
            let cleanup = action.cleanup.as_deref().and_then(|name| library.get(name));
            return Recovery::CleanupAndRetry { cleanup };
        }
        ActionError::NotFound(_) | ActionError::CircuitOpen(_) => {
            if let Some(alternative) = best_alternative(action, state, library, gate) {
                return Recovery::Substitute(alternative);
            }
        }
        _ => {}
    }

    if action.critical {
        Recovery::Replan
    } else {
        Recovery::Skip
    }
}

/// Cheapest alternative that is executable now and whose breaker admits it.
/// Ties go to the lexicographically smaller name.
pub fn best_alternative(
    action: &Action,
    state: &WorldState,
    library: &ActionLibrary,
    gate: &dyn ActionGate,
) -> Option<Arc<Action>> {
    library
        .alternatives_for(action)
        .into_iter()
        .filter(|alt| alt.can_execute(state) && gate.is_available(alt))
        .min_by(|a, b| a.cost.total_cmp(&b.cost).then_with(|| a.name.cmp(&b.name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use waypoint_planner::AllowAll;

    struct Deny(&'static str);

    impl ActionGate for Deny {
        fn is_available(&self, action: &Action) -> bool {
            action.name != self.0
        }
    }

    fn library() -> ActionLibrary {
        let mut lib = ActionLibrary::new();
        lib.register(
            Action::new("addFiles", 1.0)
                .requires("hasDataset", true)
                .produces("hasFiles", true)
                .with_cleanup("clearFiles"),
        )
        .unwrap();
        lib.register(Action::new("clearFiles", 0.5).produces("filesCleared", true))
            .unwrap();
        lib.register(
            Action::new("uploadFiles", 3.0)
                .requires("hasDataset", true)
                .produces("hasFiles", true),
        )
        .unwrap();
        lib.register(
            Action::new("syncFiles", 2.0)
                .requires("hasDataset", true)
                .produces("hasFiles", true),
        )
        .unwrap();
        lib.register(
            Action::new("importFiles", 0.5)
                .requires("hasImporter", true)
                .produces("hasFiles", true),
        )
        .unwrap();
        lib
    }

    fn state() -> WorldState {
        WorldState::from([("hasDataset", true)])
    }

    #[test]
    fn test_conflict_runs_cleanup_once() {
        let lib = library();
        let action = lib.get("addFiles").unwrap();
        let err = ActionError::Conflict("exists".into());

        let recovery = choose_recovery(&err, &action, &state(), &lib, &AllowAll, false);
        assert_eq!(
            recovery,
            Recovery::CleanupAndRetry {
                cleanup: lib.get("clearFiles")
            }
        );

        let recovery = choose_recovery(&err, &action, &state(), &lib, &AllowAll, true);
        assert_eq!(recovery, Recovery::Skip);
    }

    #[test]
    fn test_not_found_substitutes_cheapest_executable() {
        let lib = library();
        let action = lib.get("addFiles").unwrap();
        let err = ActionError::NotFound("endpoint".into());

        // importFiles is cheaper but not executable.
        let recovery = choose_recovery(&err, &action, &state(), &lib, &AllowAll, false);
        assert_eq!(recovery, Recovery::Substitute(lib.get("syncFiles").unwrap()));
    }

    #[test]
    fn test_substitute_skips_open_circuit() {
        let lib = library();
        let action = lib.get("addFiles").unwrap();
        let err = ActionError::CircuitOpen("addFiles".into());
        let recovery = choose_recovery(&err, &action, &state(), &lib, &Deny("syncFiles"), false);
        assert_eq!(recovery, Recovery::Substitute(lib.get("uploadFiles").unwrap()));
    }

    #[test]
    fn test_no_alternative_falls_back() {
        let lib = library();
        let action = Action::new("clearFiles", 0.5).produces("filesCleared", true);
        let err = ActionError::NotFound("x".into());
        assert_eq!(
            choose_recovery(&err, &action, &state(), &lib, &AllowAll, false),
            Recovery::Skip
        );
        let critical = action.critical();
        assert_eq!(
            choose_recovery(&err, &critical, &state(), &lib, &AllowAll, false),
            Recovery::Replan
        );
    }

    #[test]
    fn test_other_errors_skip_or_replan() {
        let lib = library();
        let err = ActionError::PermissionDenied("no".into());
        let action = Action::new("x", 1.0);
        assert_eq!(
            choose_recovery(&err, &action, &state(), &lib, &AllowAll, false),
            Recovery::Skip
        );
        assert_eq!(
            choose_recovery(&err, &action.critical(), &state(), &lib, &AllowAll, false),
            Recovery::Replan
        );
    }
}
