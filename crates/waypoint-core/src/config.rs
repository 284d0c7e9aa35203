use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, WaypointError};

/// Top-level configuration for a Waypoint engine.
///
/// Loaded from `waypoint.toml` by default. Each section configures one
/// component; every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaypointConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub replanner: ReplannerConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl WaypointConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: WaypointConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Reject values that would break planner or monitor invariants.
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: &str) -> Result<()> {
            Err(WaypointError::Config(msg.to_string()))
        }

        if self.general.history_capacity == 0 {
            return invalid("general.history_capacity must be at least 1");
        }
        if self.planner.max_plan_depth == 0 {
            return invalid("planner.max_plan_depth must be at least 1");
        }
        if self.planner.max_expansions == 0 {
            return invalid("planner.max_expansions must be at least 1");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.circuit_breaker.success_threshold == 0 {
            return invalid("circuit_breaker.success_threshold must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.monitor.error_rate_threshold) {
            return invalid("monitor.error_rate_threshold must be within [0, 1]");
        }
        if self.monitor.timeout_ms == 0 {
            return invalid("monitor.timeout_ms must be greater than zero");
        }
        if self.monitor.anomaly_z_threshold <= 0.0 {
            return invalid("monitor.anomaly_z_threshold must be positive");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return invalid("retry.max_delay_ms must not be below retry.initial_delay_ms");
        }
        if self.learning.max_snapshots == 0 {
            return invalid("learning.max_snapshots must be at least 1");
        }
        Ok(())
    }
}

/// General settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
    /// Execution records the monitor retains across all runs, oldest evicted first.
    pub history_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            history_capacity: 1000,
        }
    }
}

/// A* search bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Longest plan the search will consider.
    pub max_plan_depth: usize,
    /// Node expansions before the search gives up.
    pub max_expansions: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_plan_depth: 15,
            max_expansions: 10_000,
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before an open circuit becomes half-open.
    pub cooldown_ms: u64,
    /// Consecutive half-open successes that close the circuit.
    pub success_threshold: u32,
}

impl CircuitBreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 60_000,
            success_threshold: 3,
        }
    }
}

/// Execution monitor thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Executions slower than this are warned about.
    pub slow_threshold_ms: u64,
    /// Default per-action timeout.
    pub timeout_ms: u64,
    /// Failure fraction above which the monitor trips the breaker.
    pub error_rate_threshold: f64,
    /// Samples required in the window before the error rate is acted on.
    pub error_rate_min_samples: usize,
    /// Trailing window used for the error rate.
    pub error_window_secs: u64,
    /// |z| above which a duration or memory reading is anomalous.
    pub anomaly_z_threshold: f64,
    /// Samples required before anomaly detection runs for an action.
    pub anomaly_min_samples: usize,
}

impl MonitorConfig {
    pub fn slow_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_threshold_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn error_window(&self) -> Duration {
        Duration::from_secs(self.error_window_secs)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            slow_threshold_ms: 5_000,
            timeout_ms: 30_000,
            error_rate_threshold: 0.2,
            error_rate_min_samples: 5,
            error_window_secs: 300,
            anomaly_z_threshold: 2.0,
            anomaly_min_samples: 5,
        }
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Exponential,
    Linear,
    Immediate,
}

/// Retry policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub strategy: RetryStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            max_attempts: 3,
        }
    }
}

/// Replanning budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplannerConfig {
    pub max_replan_attempts: u32,
}

impl Default for ReplannerConfig {
    fn default() -> Self {
        Self {
            max_replan_attempts: 3,
        }
    }
}

/// Learning model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Context snapshots retained per action.
    pub max_snapshots: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self { max_snapshots: 100 }
    }
}

/// Executor behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Run independent consecutive actions concurrently.
    pub parallel_batches: bool,
}
