use std::time::Duration;

use thiserror::Error;

/// Top-level error type for Waypoint configuration and setup.
///
/// Runtime failures of individual actions are reported through
/// [`ActionError`]; orchestration failures have their own type in the engine
/// crate.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WaypointError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Action library error: {0}")]
    Library(#[from] LibraryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for WaypointError {
    fn from(err: toml::de::Error) -> Self {
        WaypointError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for WaypointError {
    fn from(err: toml::ser::Error) -> Self {
        WaypointError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for WaypointError {
    fn from(err: serde_json::Error) -> Self {
        WaypointError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Waypoint setup operations.
pub type Result<T> = std::result::Result<T, WaypointError>;

/// Errors raised while registering actions in an [`ActionLibrary`](crate::ActionLibrary).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LibraryError {
    #[error("Action already registered: {0}")]
    Duplicate(String),
    #[error("Action {name} has invalid cost {cost}: costs must be finite and greater than zero")]
    InvalidCost { name: String, cost: f64 },
    #[error("Action name must not be empty")]
    EmptyName,
    #[error("Action {0} declares no effects")]
    NoEffects(String),
}

/// Errors from a single action execution.
///
/// Handlers return these; the engine classifies them as retryable or not and
/// picks a recovery strategy. Handler internals are never inspected beyond
/// the variant.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("Action timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Action handler failed: {0}")]
    HandlerFailed(String),
    #[error("Circuit open for action: {0}")]
    CircuitOpen(String),
    #[error("Parameter binding failed: {0}")]
    Binding(String),
    #[error("Cancelled")]
    Cancelled,
}

impl ActionError {
    /// Short machine-readable label, used in logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionError::RateLimited { .. } => "rate_limited",
            ActionError::Timeout(_) => "timeout",
            ActionError::Transient(_) => "transient",
            ActionError::Conflict(_) => "conflict",
            ActionError::NotFound(_) => "not_found",
            ActionError::PermissionDenied(_) => "permission_denied",
            ActionError::Validation(_) => "validation",
            ActionError::HandlerFailed(_) => "handler_failed",
            ActionError::CircuitOpen(_) => "circuit_open",
            ActionError::Binding(_) => "binding",
            ActionError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WaypointError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_library_error_conversion() {
        let err: WaypointError = LibraryError::Duplicate("fetch".into()).into();
        assert!(matches!(err, WaypointError::Library(_)));
        assert_eq!(
            err.to_string(),
            "Action library error: Action already registered: fetch"
        );
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let waypoint_err: WaypointError = err.unwrap_err().into();
        assert!(matches!(waypoint_err, WaypointError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let waypoint_err: WaypointError = err.unwrap_err().into();
        assert!(matches!(waypoint_err, WaypointError::Serialization(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: WaypointError = io_err.into();
        assert!(err.to_string().starts_with("I/O error:"));
    }

    #[test]
    fn test_action_error_display() {
        assert_eq!(
            ActionError::HandlerFailed("connection reset".into()).to_string(),
            "Action handler failed: connection reset"
        );
        assert_eq!(
            ActionError::CircuitOpen("addFiles".into()).to_string(),
            "Circuit open for action: addFiles"
        );
        assert_eq!(
            ActionError::Timeout(Duration::from_secs(30)).to_string(),
            "Action timed out after 30s"
        );
    }

    #[test]
    fn test_action_error_kind() {
        assert_eq!(
            ActionError::RateLimited { retry_after: None }.kind(),
            "rate_limited"
        );
        assert_eq!(ActionError::Cancelled.kind(), "cancelled");
        assert_eq!(ActionError::NotFound("x".into()).kind(), "not_found");
    }
}
