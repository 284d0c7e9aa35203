//! Orient-phase statistics and decide-phase rules.
//!
//! Everything here is pure: it reads history slices and returns findings, so
//! the rules can be tested without running handlers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::history::ExecutionRecord;
use super::history::ExecutionStatus;

/// Window sizes for pattern detection.
const PATTERN_WINDOW: usize = 5;
const REPEATED_FAILURE_MIN: usize = 3;
const SLOWDOWN_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pattern {
    /// At least three of the last five executions failed.
    RepeatedFailures { failed: usize, window: usize },
    /// Mean duration of the last five is well above the five before.
    Slowdown { recent_ms: f64, previous_ms: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub metric: String,
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub z_score: f64,
}

/// Output of the orient phase for one execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Analysis {
    pub action_name: String,
    pub duration: Duration,
    pub is_slow: bool,
    pub is_timeout: bool,
    pub idempotent: bool,
    /// Failures over completed executions in the trailing window.
    pub error_rate: f64,
    /// Completed executions the error rate is based on.
    pub error_samples: usize,
    pub patterns: Vec<Pattern>,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Cancel,
    Warn,
    CircuitBreak,
    Investigate(Vec<Anomaly>),
    Retry,
}

/// Failure rate among non-cancelled records finished within `window` of `now`.
///
/// Returns `(rate, samples)`; the rate is 0 when there are no samples.
pub fn error_rate<'a>(
    records: impl Iterator<Item = &'a ExecutionRecord>,
    now: DateTime<Utc>,
    window: Duration,
) -> (f64, usize) {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);

    let mut samples = 0usize;
    let mut failures = 0usize;
    for record in records {
        if record.status == ExecutionStatus::Cancelled || record.finished_at < cutoff {
            continue;
        }
        samples += 1;
        if record.is_failure() {
            failures += 1;
        }
    }

    if samples == 0 {
        (0.0, 0)
    } else {
        (failures as f64 / samples as f64, samples)
    }
}

/// Pattern detection over one action's records, oldest first.
pub fn detect_patterns(records: &[&ExecutionRecord]) -> Vec<Pattern> {
    let completed: Vec<&ExecutionRecord> = records
        .iter()
        .copied()
        .filter(|r| r.status != ExecutionStatus::Cancelled)
        .collect();
    let mut patterns = Vec::new();

    let recent = &completed[completed.len().saturating_sub(PATTERN_WINDOW)..];
    let failed = recent.iter().filter(|r| r.is_failure()).count();
    if failed >= REPEATED_FAILURE_MIN {
        patterns.push(Pattern::RepeatedFailures {
            failed,
            window: recent.len(),
        });
    }

    if completed.len() >= PATTERN_WINDOW * 2 {
        let split = completed.len() - PATTERN_WINDOW;
        let previous = &completed[split - PATTERN_WINDOW..split];
        let recent_ms = mean(recent.iter().map(|r| r.duration_ms()));
        let previous_ms = mean(previous.iter().map(|r| r.duration_ms()));
        if recent_ms > SLOWDOWN_FACTOR * previous_ms {
            patterns.push(Pattern::Slowdown {
                recent_ms,
                previous_ms,
            });
        }
    }

    patterns
}

/// Flag `value` when it lies more than `threshold` standard deviations from
/// the mean of `samples`.
///
/// Needs `min_samples` history points; a zero standard deviation never
/// produces an anomaly.
pub fn z_score_anomaly(
    metric: &str,
    samples: &[f64],
    value: f64,
    threshold: f64,
    min_samples: usize,
) -> Option<Anomaly> {
    if samples.len() < min_samples.max(2) {
        return None;
    }
    let mean = mean(samples.iter().copied());
    let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / samples.len() as f64;
    let std_dev = variance.sqrt();
    if std_dev <= f64::EPSILON {
        return None;
    }
    let z_score = (value - mean) / std_dev;
    (z_score.abs() > threshold).then(|| Anomaly {
        metric: metric.to_string(),
        value,
        mean,
        std_dev,
        z_score,
    })
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

/// True once `duration` is strictly past `limit`; reaching it exactly is not.
pub fn exceeds(duration: Duration, limit: Duration) -> bool {
    duration > limit
}

/// Decide-phase rules, in order.
pub fn decide(analysis: &Analysis, error_rate_threshold: f64, min_samples: usize) -> Vec<Decision> {
    let mut decisions = Vec::new();
    if analysis.is_timeout {
        decisions.push(Decision::Cancel);
    } else if analysis.is_slow {
        decisions.push(Decision::Warn);
    }
    if analysis.error_samples >= min_samples && analysis.error_rate > error_rate_threshold {
        decisions.push(Decision::CircuitBreak);
    }
    if !analysis.anomalies.is_empty() {
        decisions.push(Decision::Investigate(analysis.anomalies.clone()));
    }
    if analysis.is_timeout && analysis.idempotent {
        decisions.push(Decision::Retry);
    }
    decisions
}
