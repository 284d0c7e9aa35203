//! Parameter binding: turns an action's params template into concrete
//! handler input.

use std::collections::HashMap;

use serde_json::Value as Json;
use uuid::Uuid;
use waypoint_core::{Action, ActionError, Value, WorldState};

const STATE_PREFIX: &str = "$state.";
const OUTPUT_PREFIX: &str = "$output.";

/// Per-run data available to the binder.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub run_id: Uuid,
    /// Output of the latest successful execution of each action.
    pub outputs: HashMap<String, Json>,
}

impl RunContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            outputs: HashMap::new(),
        }
    }

    pub fn record_output(&mut self, action: &str, output: Json) {
        self.outputs.insert(action.to_string(), output);
    }
}

/// Pure mapping from state and run context to handler parameters.
pub trait ParameterBinder: Send + Sync {
    fn bind(&self, action: &Action, state: &WorldState, ctx: &RunContext) -> Result<Json, ActionError>;
}

/// Replaces template strings anywhere in the params tree:
/// - `"$state.<key>"` with the current value of `key`
/// - `"$output.<action>.<path>"` with a field of an earlier action's output,
///   where `<path>` is dot-separated (`files.0.id`) and may be empty
///
/// Any other value is passed through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateBinder;

impl ParameterBinder for TemplateBinder {
    fn bind(&self, action: &Action, state: &WorldState, ctx: &RunContext) -> Result<Json, ActionError> {
        resolve(&action.params, state, ctx)
    }
}

fn resolve(template: &Json, state: &WorldState, ctx: &RunContext) -> Result<Json, ActionError> {
    match template {
        Json::String(s) => resolve_string(s, state, ctx),
        Json::Array(items) => items
            .iter()
            .map(|item| resolve(item, state, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Json::Array),
        Json::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                resolved.insert(key.clone(), resolve(value, state, ctx)?);
            }
            Ok(Json::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(s: &str, state: &WorldState, ctx: &RunContext) -> Result<Json, ActionError> {
    if let Some(key) = s.strip_prefix(STATE_PREFIX) {
        let value = state
            .get(key)
            .ok_or_else(|| ActionError::Binding(format!("state key '{}' is not set", key)))?;
        return value_to_json(value);
    }

    if let Some(reference) = s.strip_prefix(OUTPUT_PREFIX) {
        let (action, path) = reference.split_once('.').unwrap_or((reference, ""));
        let output = ctx
            .outputs
            .get(action)
            .ok_or_else(|| ActionError::Binding(format!("no output recorded for '{}'", action)))?;
        if path.is_empty() {
            return Ok(output.clone());
        }
        let pointer = format!("/{}", path.replace('.', "/"));
        return output.pointer(&pointer).cloned().ok_or_else(|| {
            ActionError::Binding(format!("output of '{}' has no field '{}'", action, path))
        });
    }

    Ok(Json::String(s.to_string()))
}

fn value_to_json(value: &Value) -> Result<Json, ActionError> {
    match value {
        Value::Bool(b) => Ok(Json::Bool(*b)),
        Value::Text(s) => Ok(Json::String(s.clone())),
        Value::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => Ok(Json::from(*n as i64)),
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .ok_or_else(|| ActionError::Binding(format!("number {} is not representable", n))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> RunContext {
        let mut ctx = RunContext::new(Uuid::nil());
        ctx.record_output("createDataset", json!({"id": "ds-42", "files": [{"name": "a.csv"}]}));
        ctx
    }

    #[test]
    fn test_state_and_output_references() {
        let action = Action::new("addFiles", 1.0).with_params(json!({
            "dataset": "$output.createDataset.id",
            "first": "$output.createDataset.files.0.name",
            "authed": "$state.hasAuth",
            "count": "$state.fileCount",
            "mode": "append",
            "tags": ["$state.region", 7],
        }));
        let state = WorldState::from([("hasAuth", Value::from(true)), ("fileCount", Value::from(3))])
            .with("region", "eu");

        let params = TemplateBinder.bind(&action, &state, &ctx()).unwrap();
        assert_eq!(
            params,
            json!({
                "dataset": "ds-42",
                "first": "a.csv",
                "authed": true,
                "count": 3,
                "mode": "append",
                "tags": ["eu", 7],
            })
        );
    }

    #[test]
    fn test_whole_output() {
        let action = Action::new("a", 1.0).with_params(json!("$output.createDataset"));
        let params = TemplateBinder.bind(&action, &WorldState::new(), &ctx()).unwrap();
        assert_eq!(params["id"], "ds-42");
    }

    #[test]
    fn test_missing_references_fail() {
        let state = WorldState::new();
        let missing_key = Action::new("a", 1.0).with_params(json!({"x": "$state.nope"}));
        assert!(matches!(
            TemplateBinder.bind(&missing_key, &state, &ctx()),
            Err(ActionError::Binding(_))
        ));

        let missing_action = Action::new("a", 1.0).with_params(json!("$output.other.id"));
        assert!(TemplateBinder.bind(&missing_action, &state, &ctx()).is_err());

        let missing_field = Action::new("a", 1.0).with_params(json!("$output.createDataset.size"));
        assert!(TemplateBinder.bind(&missing_field, &state, &ctx()).is_err());
    }

    #[test]
    fn test_fractional_numbers() {
        assert_eq!(value_to_json(&Value::from(0.25)).unwrap(), json!(0.25));
        assert!(value_to_json(&Value::Number(f64::NAN)).is_err());
    }

    #[test]
    fn test_null_params_pass_through() {
        let action = Action::new("a", 1.0);
        let params = TemplateBinder.bind(&action, &WorldState::new(), &RunContext::default()).unwrap();
        assert_eq!(params, action.params);
    }
}
