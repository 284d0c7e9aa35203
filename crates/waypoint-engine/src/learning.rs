//! Per-action success history and success prediction.
//!
//! The model is shared by every run. It only ever raises planning costs:
//! [`LearningCostModel`] prices an action at `cost * (2 - p)` with `p` in
//! `[0, 1]`, and with no history `p` is 1.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use waypoint_core::config::LearningConfig;
use waypoint_core::{Action, Value, WorldState};
use waypoint_planner::CostModel;

const RATE_WEIGHT: f64 = 0.6;
const SIMILARITY_WEIGHT: f64 = 0.2;
const READINESS_WEIGHT: f64 = 0.2;
const CONFIDENCE_SCALE: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub features: WorldState,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Running mean and variance (Welford).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
}

impl RunningStats {
    fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn std_dev(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            (self.m2 / (self.count - 1) as f64).sqrt()
        }
    }
}

#[derive(Debug, Default)]
struct ActionHistory {
    successes: u64,
    failures: u64,
    snapshots: VecDeque<ContextSnapshot>,
    durations: RunningStats,
}

impl ActionHistory {
    fn total(&self) -> u64 {
        self.successes + self.failures
    }
}

/// Reporting view of one action's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningStats {
    pub action: String,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub confidence: f64,
    pub mean_duration_ms: f64,
    pub std_dev_duration_ms: f64,
    pub snapshots: usize,
}

pub struct LearningModel {
    config: LearningConfig,
    actions: Mutex<HashMap<String, ActionHistory>>,
}

impl LearningModel {
    pub fn new(config: LearningConfig) -> Self {
        Self {
            config,
            actions: Mutex::new(HashMap::new()),
        }
    }

    /// Record a completed (not cancelled) execution.
    pub fn record(&self, name: &str, features: &WorldState, success: bool, duration: Duration) {
        let max = self.config.max_snapshots.max(1);
        let mut actions = self.lock();
        let history = actions.entry(name.to_string()).or_default();
        if success {
            history.successes += 1;
        } else {
            history.failures += 1;
        }
        if history.snapshots.len() == max {
            history.snapshots.pop_front();
        }
        history.snapshots.push_back(ContextSnapshot {
            features: features.clone(),
            success,
            recorded_at: Utc::now(),
        });
        history.durations.push(duration.as_secs_f64() * 1000.0);
        tracing::trace!(action = %name, success, total = history.total(), "Learning sample recorded");
    }

    /// Blend of raw success rate, similarity to past contexts and
    /// precondition readiness, in `[0, 1]`.
    pub fn predict_success(&self, action: &Action, features: &WorldState) -> f64 {
        let (rate, similarity) = {
            let actions = self.lock();
            match actions.get(&action.name) {
                Some(h) if h.total() > 0 => (
                    h.successes as f64 / h.total() as f64,
                    similarity_adjustment(&h.snapshots, features),
                ),
                _ => (0.5, 0.0),
            }
        };
        let readiness = action.readiness(features);
        let p = RATE_WEIGHT * rate
            + SIMILARITY_WEIGHT * (0.5 + 0.5 * similarity)
            + READINESS_WEIGHT * readiness;
        p.clamp(0.0, 1.0)
    }

    /// `1 - e^(-n/10)` for `n` recorded outcomes.
    pub fn confidence(&self, name: &str) -> f64 {
        let n = self.lock().get(name).map_or(0, ActionHistory::total);
        1.0 - (-(n as f64) / CONFIDENCE_SCALE).exp()
    }

    /// Prediction pulled towards 1 in proportion to missing confidence, so
    /// unknown actions are planned at their base cost.
    pub fn discounted_success(&self, action: &Action, features: &WorldState) -> f64 {
        let p = self.predict_success(action, features);
        let confidence = self.confidence(&action.name);
        1.0 - confidence * (1.0 - p)
    }

    pub fn stats(&self, name: &str) -> Option<LearningStats> {
        let actions = self.lock();
        let h = actions.get(name)?;
        let total = h.total();
        Some(LearningStats {
            action: name.to_string(),
            successes: h.successes,
            failures: h.failures,
            success_rate: if total == 0 { 0.0 } else { h.successes as f64 / total as f64 },
            confidence: 1.0 - (-(total as f64) / CONFIDENCE_SCALE).exp(),
            mean_duration_ms: h.durations.mean,
            std_dev_duration_ms: h.durations.std_dev(),
            snapshots: h.snapshots.len(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActionHistory>> {
        self.actions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LearningModel {
    fn default() -> Self {
        Self::new(LearningConfig::default())
    }
}

/// Similarity-weighted vote of past outcomes, in `[-1, 1]`.
fn similarity_adjustment(snapshots: &VecDeque<ContextSnapshot>, features: &WorldState) -> f64 {
    let mut weighted = 0.0;
    let mut weights = 0.0;
    for snapshot in snapshots {
        let Some(sim) = similarity(&snapshot.features, features) else {
            continue;
        };
        weighted += if snapshot.success { sim } else { -sim };
        weights += sim;
    }
    if weights <= f64::EPSILON {
        0.0
    } else {
        weighted / weights
    }
}

/// Mean per-key similarity over shared keys; `None` with nothing shared.
fn similarity(a: &WorldState, b: &WorldState) -> Option<f64> {
    let mut total = 0.0;
    let mut shared = 0usize;
    for (key, left) in a.iter() {
        let Some(right) = b.get(key) else { continue };
        shared += 1;
        total += match (left, right) {
            (Value::Number(x), Value::Number(y)) => {
                let scale = x.abs() + y.abs();
                if scale <= f64::EPSILON {
                    1.0
                } else {
                    1.0 - (x - y).abs() / scale
                }
            }
            _ => {
                if left == right {
                    1.0
                } else {
                    0.0
                }
            }
        };
    }
    (shared > 0).then(|| total / shared as f64)
}

/// Prices actions at `cost * (2 - p)` using the model's discounted prediction.
pub struct LearningCostModel<'a> {
    model: &'a LearningModel,
}

impl<'a> LearningCostModel<'a> {
    pub fn new(model: &'a LearningModel) -> Self {
        Self { model }
    }
}

impl CostModel for LearningCostModel<'_> {
    fn cost(&self, action: &Action, state: &WorldState) -> f64 {
        let p = self.model.discounted_success(action, state);
        action.cost * (2.0 - p)
    }
}
