//! Per-action circuit breakers.
//!
//! Closed -> Open after `failure_threshold` consecutive failures.
//! Open -> HalfOpen once `cooldown` has passed since the last failure
//! (evaluated lazily whenever the state is read).
//! HalfOpen -> Closed after `success_threshold` consecutive successes, or
//! straight back to Open on any failure.
//!
//! One registry is shared by every concurrent run; tests build their own.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use waypoint_core::config::CircuitBreakerConfig;
use waypoint_core::{Action, EventBus, TelemetryEvent};
use waypoint_planner::ActionGate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
}

impl Default for Breaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub action: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Mutex-guarded map of action name to breaker.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
    events: Option<EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
            events: None,
        }
    }

    /// Publish open/half-open/close transitions on `events`.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state of `name`'s breaker. Unknown actions are closed.
    pub fn state(&self, name: &str) -> CircuitState {
        let mut pending = Vec::new();
        let state = {
            let mut breakers = self.lock();
            match breakers.get_mut(name) {
                Some(breaker) => {
                    self.refresh(name, breaker, &mut pending);
                    breaker.state
                }
                None => CircuitState::Closed,
            }
        };
        self.emit(pending);
        state
    }

    /// True unless the breaker is open.
    pub fn allows(&self, name: &str) -> bool {
        self.state(name) != CircuitState::Open
    }

    pub fn record_success(&self, name: &str) {
        let mut pending = Vec::new();
        {
            let mut breakers = self.lock();
            let breaker = breakers.entry(name.to_string()).or_default();
            self.refresh(name, breaker, &mut pending);
            match breaker.state {
                CircuitState::Closed => {
                    breaker.consecutive_failures = 0;
                }
                CircuitState::HalfOpen => {
                    breaker.consecutive_successes += 1;
                    if breaker.consecutive_successes >= self.config.success_threshold {
                        breaker.state = CircuitState::Closed;
                        breaker.consecutive_failures = 0;
                        breaker.consecutive_successes = 0;
                        tracing::info!(action = %name, "Circuit closed");
                        pending.push(TelemetryEvent::CircuitClosed {
                            action: name.to_string(),
                            timestamp: Utc::now(),
                        });
                    }
                }
                CircuitState::Open => {
                    // Only reachable if a caller bypassed the pre-flight guard.
                    tracing::debug!(action = %name, "Success recorded while circuit open");
                }
            }
        }
        self.emit(pending);
    }

    pub fn record_failure(&self, name: &str) {
        let mut pending = Vec::new();
        {
            let mut breakers = self.lock();
            let breaker = breakers.entry(name.to_string()).or_default();
            self.refresh(name, breaker, &mut pending);
            breaker.last_failure = Some(Instant::now());
            breaker.consecutive_failures += 1;
            match breaker.state {
                CircuitState::Closed => {
                    if breaker.consecutive_failures >= self.config.failure_threshold {
                        breaker.state = CircuitState::Open;
                        tracing::warn!(
                            action = %name,
                            failures = breaker.consecutive_failures,
                            "Circuit opened"
                        );
                        pending.push(TelemetryEvent::CircuitOpened {
                            action: name.to_string(),
                            consecutive_failures: breaker.consecutive_failures,
                            timestamp: Utc::now(),
                        });
                    }
                }
                CircuitState::HalfOpen => {
                    breaker.state = CircuitState::Open;
                    breaker.consecutive_successes = 0;
                    tracing::warn!(action = %name, "Half-open trial failed, circuit reopened");
                    pending.push(TelemetryEvent::CircuitOpened {
                        action: name.to_string(),
                        consecutive_failures: breaker.consecutive_failures,
                        timestamp: Utc::now(),
                    });
                }
                CircuitState::Open => {}
            }
        }
        self.emit(pending);
    }

    /// Forget all history for `name`, closing its breaker.
    pub fn reset(&self, name: &str) {
        self.lock().remove(name);
    }

    /// Every known breaker, sorted by action name.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut pending = Vec::new();
        let mut snapshots: Vec<BreakerSnapshot> = {
            let mut breakers = self.lock();
            breakers
                .iter_mut()
                .map(|(name, breaker)| {
                    self.refresh(name, breaker, &mut pending);
                    BreakerSnapshot {
                        action: name.clone(),
                        state: breaker.state,
                        consecutive_failures: breaker.consecutive_failures,
                        consecutive_successes: breaker.consecutive_successes,
                    }
                })
                .collect()
        };
        self.emit(pending);
        snapshots.sort_by(|a, b| a.action.cmp(&b.action));
        snapshots
    }

    /// Open -> HalfOpen once the cooldown has elapsed.
    fn refresh(&self, name: &str, breaker: &mut Breaker, pending: &mut Vec<TelemetryEvent>) {
        if breaker.state != CircuitState::Open {
            return;
        }
        let cooled = breaker
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.config.cooldown());
        if cooled {
            breaker.state = CircuitState::HalfOpen;
            breaker.consecutive_successes = 0;
            tracing::info!(action = %name, "Circuit half-open");
            pending.push(TelemetryEvent::CircuitHalfOpened {
                action: name.to_string(),
                timestamp: Utc::now(),
            });
        }
    }

    fn emit(&self, pending: Vec<TelemetryEvent>) {
        if let Some(events) = &self.events {
            for event in pending {
                events.publish(event);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Breaker>> {
        // Breaker state stays consistent across a panic in another holder.
        self.breakers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl ActionGate for CircuitBreakerRegistry {
    fn is_available(&self, action: &Action) -> bool {
        self.allows(&action.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn registry(cooldown_ms: u64) -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 5,
            cooldown_ms,
            success_threshold: 3,
        })
    }

    #[test]
    fn test_unknown_action_is_closed() {
        let breakers = registry(60_000);
        assert_eq!(breakers.state("never-seen"), CircuitState::Closed);
        assert!(breakers.allows("never-seen"));
    }

    #[test]
    fn test_opens_after_threshold() {
        let breakers = registry(60_000);
        for _ in 0..4 {
            breakers.record_failure("addFiles");
            assert_eq!(breakers.state("addFiles"), CircuitState::Closed);
        }
        breakers.record_failure("addFiles");
        assert_eq!(breakers.state("addFiles"), CircuitState::Open);
        assert!(!breakers.allows("addFiles"));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breakers = registry(60_000);
        for _ in 0..4 {
            breakers.record_failure("a");
        }
        breakers.record_success("a");
        for _ in 0..4 {
            breakers.record_failure("a");
        }
        assert_eq!(breakers.state("a"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_cooldown() {
        let breakers = registry(20);
        for _ in 0..5 {
            breakers.record_failure("a");
        }
        assert_eq!(breakers.state("a"), CircuitState::Open);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(breakers.state("a"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let breakers = registry(0);
        for _ in 0..5 {
            breakers.record_failure("a");
        }
        assert_eq!(breakers.state("a"), CircuitState::HalfOpen);
        breakers.record_success("a");
        breakers.record_success("a");
        assert_eq!(breakers.state("a"), CircuitState::HalfOpen);
        breakers.record_success("a");
        assert_eq!(breakers.state("a"), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breakers = registry(60_000);
        for _ in 0..5 {
            breakers.record_failure("a");
        }
        {
            // Pretend the cooldown elapsed.
            let mut map = breakers.lock();
            let breaker = map.get_mut("a").unwrap();
            breaker.last_failure = Some(Instant::now() - Duration::from_secs(120));
        }
        assert_eq!(breakers.state("a"), CircuitState::HalfOpen);
        breakers.record_success("a");
        breakers.record_failure("a");
        assert_eq!(breakers.state("a"), CircuitState::Open);
    }

    #[test]
    fn test_breakers_are_independent() {
        let breakers = registry(60_000);
        for _ in 0..5 {
            breakers.record_failure("a");
        }
        assert_eq!(breakers.state("a"), CircuitState::Open);
        assert_eq!(breakers.state("b"), CircuitState::Closed);
    }

    #[test]
    fn test_reset_and_snapshot() {
        let breakers = registry(60_000);
        for _ in 0..5 {
            breakers.record_failure("b");
        }
        breakers.record_failure("a");
        let snapshot = breakers.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].action, "a");
        assert_eq!(snapshot[0].consecutive_failures, 1);
        assert_eq!(snapshot[1].state, CircuitState::Open);

        breakers.reset("b");
        assert_eq!(breakers.state("b"), CircuitState::Closed);
    }

    #[test]
    fn test_gate_excludes_open_actions() {
        let breakers = registry(60_000);
        for _ in 0..5 {
            breakers.record_failure("createDataset");
        }
        assert!(!breakers.is_available(&Action::new("createDataset", 2.0)));
        assert!(breakers.is_available(&Action::new("setupAuth", 1.0)));
    }

    #[tokio::test]
    async fn test_transitions_publish_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let breakers = registry(0).with_events(bus);

        for _ in 0..5 {
            breakers.record_failure("a");
        }
        breakers.state("a");
        for _ in 0..3 {
            breakers.record_success("a");
        }

        let names: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|e| e.event_name())
            .collect();
        assert_eq!(
            names,
            vec!["circuit_opened", "circuit_half_opened", "circuit_closed"]
        );
    }

    #[test]
    fn test_shared_across_threads() {
        let breakers = std::sync::Arc::new(registry(60_000));
        let handles: Vec<_> = (0..5)
            .map(|_| {
                let b = std::sync::Arc::clone(&breakers);
                std::thread::spawn(move || b.record_failure("shared"))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(breakers.state("shared"), CircuitState::Open);
    }
}
