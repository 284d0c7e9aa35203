//! Action handler trait and registry.
//!
//! Handlers are the external collaborators that actually do the work behind an
//! action (dataset calls, ingestion, crawling). The engine only sees success,
//! failure and duration; it never interprets handler output.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::ActionError;

/// Per-execution context passed to a handler.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    pub execution_id: Uuid,
    pub action_name: String,
    /// Zero-based retry attempt.
    pub attempt: u32,
    /// Cancelled when the monitor times the execution out or the run is
    /// cancelled. Handlers blocked on I/O should select on it.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Successful handler result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerOutput {
    /// Arbitrary output, made available to later actions through the binder.
    pub output: serde_json::Value,
}

impl HandlerOutput {
    pub fn new(output: serde_json::Value) -> Self {
        Self { output }
    }
}

/// Capability interface implemented by every action handler.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Perform the work with already-bound parameters.
    async fn execute(
        &self,
        ctx: &ExecutionContext,
        params: &serde_json::Value,
    ) -> Result<HandlerOutput, ActionError>;

    /// Short human-readable description for logs.
    fn describe(&self) -> String {
        "action handler".to_string()
    }
}

/// Name-to-handler registry.
///
/// Adding an action type means registering a handler here; the planner and
/// executor are untouched.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, handler: impl ActionHandler + 'static) {
        self.register_arc(name, Arc::new(handler));
    }

    pub fn register_arc(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let name = name.into();
        tracing::debug!(handler = %name, "Handler registered");
        self.handlers.insert(name, handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.handlers.keys().collect();
        names.sort();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}
