//! Bounded execution history and per-action metrics.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::resources::ResourceSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    /// Interrupted by run cancellation. Never counted as a failure.
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Succeeded => write!(f, "succeeded"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One finished handler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub run_id: Uuid,
    pub action_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub attempt: u32,
    pub resources: ResourceSnapshot,
}

impl ExecutionRecord {
    pub fn is_failure(&self) -> bool {
        self.status == ExecutionStatus::Failed
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

/// Ring buffer of the most recent records; the oldest is evicted when full.
#[derive(Debug, Clone)]
pub struct ExecutionHistory {
    capacity: usize,
    records: VecDeque<ExecutionRecord>,
}

impl ExecutionHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: ExecutionRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest first.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &ExecutionRecord> {
        self.records.iter()
    }

    /// Records for one action, oldest first.
    pub fn for_action<'a>(&'a self, name: &'a str) -> impl DoubleEndedIterator<Item = &'a ExecutionRecord> {
        self.records.iter().filter(move |r| r.action_name == name)
    }
}

/// Aggregate counters for one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionMetrics {
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub cancelled: u64,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    pub total_duration: Duration,
}

impl ActionMetrics {
    pub fn update(&mut self, record: &ExecutionRecord) {
        self.count += 1;
        match record.status {
            ExecutionStatus::Succeeded => self.successes += 1,
            ExecutionStatus::Failed => self.failures += 1,
            ExecutionStatus::Cancelled => self.cancelled += 1,
        }
        self.total_duration += record.duration;
        self.min_duration = Some(match self.min_duration {
            Some(min) => min.min(record.duration),
            None => record.duration,
        });
        self.max_duration = Some(match self.max_duration {
            Some(max) => max.max(record.duration),
            None => record.duration,
        });
    }

    pub fn avg_duration(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total_duration.as_nanos() / u128::from(self.count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Successes over completed (non-cancelled) executions.
    pub fn success_rate(&self) -> f64 {
        let completed = self.successes + self.failures;
        if completed == 0 {
            return 0.0;
        }
        self.successes as f64 / completed as f64
    }
}

#[cfg(test)]
pub(crate) fn record(action: &str, status: ExecutionStatus, duration_ms: u64) -> ExecutionRecord {
    let now = Utc::now();
    ExecutionRecord {
        execution_id: Uuid::new_v4(),
        run_id: Uuid::nil(),
        action_name: action.to_string(),
        started_at: now,
        finished_at: now,
        duration: Duration::from_millis(duration_ms),
        status,
        error: None,
        attempt: 0,
        resources: ResourceSnapshot::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut history = ExecutionHistory::new(3);
        for ms in [1, 2, 3, 4] {
            history.push(record("a", ExecutionStatus::Succeeded, ms));
        }
        assert_eq!(history.len(), 3);
        let durations: Vec<_> = history.iter().map(|r| r.duration.as_millis()).collect();
        assert_eq!(durations, vec![2, 3, 4]);
    }

    #[test]
    fn test_for_action_filters() {
        let mut history = ExecutionHistory::new(10);
        history.push(record("a", ExecutionStatus::Succeeded, 1));
        history.push(record("b", ExecutionStatus::Failed, 1));
        history.push(record("a", ExecutionStatus::Failed, 1));
        assert_eq!(history.for_action("a").count(), 2);
        assert_eq!(history.for_action("c").count(), 0);
    }

    #[test]
    fn test_metrics() {
        let mut metrics = ActionMetrics::default();
        metrics.update(&record("a", ExecutionStatus::Succeeded, 100));
        metrics.update(&record("a", ExecutionStatus::Failed, 300));
        metrics.update(&record("a", ExecutionStatus::Cancelled, 200));

        assert_eq!(metrics.count, 3);
        assert_eq!(metrics.min_duration, Some(Duration::from_millis(100)));
        assert_eq!(metrics.max_duration, Some(Duration::from_millis(300)));
        assert_eq!(metrics.avg_duration(), Duration::from_millis(200));
        assert!((metrics.success_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_avg_duration_beyond_u32_count() {
        let count = u64::from(u32::MAX) + 1;
        let metrics = ActionMetrics {
            count,
            successes: count,
            total_duration: Duration::from_secs(count),
            ..ActionMetrics::default()
        };
        assert_eq!(metrics.avg_duration(), Duration::from_secs(1));
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = ActionMetrics::default();
        assert_eq!(metrics.avg_duration(), Duration::ZERO);
        assert_eq!(metrics.success_rate(), 0.0);
    }
}
