//! Demonstration dataset pipeline with simulated handlers.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use waypoint_core::{
    Action, ActionError, ActionHandler, ActionLibrary, ExecutionContext, HandlerOutput, HandlerRegistry,
    LibraryError, WorldState,
};

/// Sleeps for a fixed latency, then echoes its parameters.
pub struct Simulated {
    latency: Duration,
}

impl Simulated {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl ActionHandler for Simulated {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        params: &serde_json::Value,
    ) -> Result<HandlerOutput, ActionError> {
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err(ActionError::Cancelled),
            _ = tokio::time::sleep(self.latency) => Ok(HandlerOutput::new(json!({
                "action": ctx.action_name,
                "params": params,
            }))),
        }
    }

    fn describe(&self) -> String {
        format!("simulated ({}ms)", self.latency.as_millis())
    }
}

/// Creates a dataset and returns its id for later actions to bind.
pub struct CreateDataset;

#[async_trait]
impl ActionHandler for CreateDataset {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        params: &serde_json::Value,
    ) -> Result<HandlerOutput, ActionError> {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ActionError::Validation("missing dataset name".to_string()))?;
        Ok(HandlerOutput::new(json!({
            "id": format!("ds-{}", ctx.run_id.simple()),
            "name": name,
        })))
    }

    fn describe(&self) -> String {
        "dataset creator".to_string()
    }
}

/// Always fails with a transient error.
#[derive(Default)]
pub struct Unreachable {
    calls: AtomicU32,
}

#[async_trait]
impl ActionHandler for Unreachable {
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        _params: &serde_json::Value,
    ) -> Result<HandlerOutput, ActionError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Err(ActionError::Transient(format!(
            "{} backend unreachable (call {n})",
            ctx.action_name
        )))
    }
}

/// The dataset pipeline: connect, authenticate, create a dataset, then load
/// files into it either incrementally or by bulk upload.
pub fn library() -> Result<ActionLibrary, LibraryError> {
    let mut library = ActionLibrary::new();
    library.register(Action::new("checkConnection", 1.0).produces("hasConnection", true))?;
    library.register(
        Action::new("setupAuth", 1.0)
            .requires("hasConnection", true)
            .produces("hasAuth", true),
    )?;
    library.register(
        Action::new("createDataset", 2.0)
            .requires("hasConnection", true)
            .requires("hasAuth", true)
            .produces("datasetReady", true)
            .with_params(json!({ "name": "demo" })),
    )?;
    library.register(
        Action::new("addFiles", 1.0)
            .requires("datasetReady", true)
            .produces("hasFiles", true)
            .with_params(json!({ "dataset": "$output.createDataset.id" }))
            .with_cleanup("clearFiles"),
    )?;
    library.register(
        Action::new("uploadFiles", 3.0)
            .requires("datasetReady", true)
            .produces("hasFiles", true)
            .with_params(json!({ "dataset": "$output.createDataset.id", "bulk": true })),
    )?;
    library.register(Action::new("clearFiles", 1.0).produces("filesCleared", true))?;
    Ok(library)
}

/// Handlers for every action in [`library`]. With `flaky`, `addFiles` never
/// succeeds.
pub fn handlers(latency: Duration, flaky: bool) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    for name in ["checkConnection", "setupAuth", "uploadFiles", "clearFiles"] {
        handlers.register(name, Simulated::new(latency));
    }
    handlers.register("createDataset", CreateDataset);
    if flaky {
        handlers.register("addFiles", Unreachable::default());
    } else {
        handlers.register("addFiles", Simulated::new(latency));
    }
    handlers
}

pub fn goal() -> WorldState {
    WorldState::new()
        .with("datasetReady", true)
        .with("hasFiles", true)
}
