//! Core model for Waypoint, a goal-directed task orchestration engine.
//!
//! Defines world states, actions, plans, handler contracts, configuration,
//! errors and telemetry events shared by the planner and the engine.

pub mod action;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod types;

pub use action::{Action, ActionLibrary, Plan};
pub use config::WaypointConfig;
pub use error::{ActionError, LibraryError, Result, WaypointError};
pub use events::{EventBus, TelemetryEvent};
pub use handler::{ActionHandler, ExecutionContext, HandlerOutput, HandlerRegistry};
pub use types::{Value, WorldState};
