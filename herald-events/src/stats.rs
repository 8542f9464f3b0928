//! Per-(topic, event type) consumption counters.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Counters for one event type on one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventStats {
    pub topic: String,
    pub event_type: String,
    pub success_count: u64,
    pub failure_count: u64,
    /// Time of the last success or failure; `None` until one happens.
    pub last_processed: Option<DateTime<Utc>>,
}

impl EventStats {
    fn new(topic: &str, event_type: &str) -> Self {
        Self {
            topic: topic.to_string(),
            event_type: event_type.to_string(),
            success_count: 0,
            failure_count: 0,
            last_processed: None,
        }
    }

    /// Successes plus failures.
    pub fn processed(&self) -> u64 {
        self.success_count + self.failure_count
    }
}

/// Snapshot of every tracked (topic, event type), as served by a health or
/// admin endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub service: String,
    pub total_events_processed: u64,
    pub timestamp: DateTime<Utc>,
    pub events_by_type: Vec<EventStats>,
}

/// Counts handled and failed deliveries per (topic, event type).
#[derive(Debug, Default)]
pub struct EventTracker {
    stats: DashMap<(String, String), EventStats>,
}

impl EventTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a pair with zero counts, if not tracked yet.
    pub fn initialize(&self, topic: &str, event_type: &str) {
        self.stats
            .entry((topic.to_string(), event_type.to_string()))
            .or_insert_with(|| EventStats::new(topic, event_type));
    }

    /// Count one success or failure.
    pub fn record(&self, topic: &str, event_type: &str, success: bool) {
        let mut entry = self
            .stats
            .entry((topic.to_string(), event_type.to_string()))
            .or_insert_with(|| EventStats::new(topic, event_type));
        if success {
            entry.success_count += 1;
        } else {
            entry.failure_count += 1;
        }
        entry.last_processed = Some(Utc::now());
    }

    pub fn get(&self, topic: &str, event_type: &str) -> Option<EventStats> {
        self.stats
            .get(&(topic.to_string(), event_type.to_string()))
            .map(|s| s.value().clone())
    }

    /// Every tracked pair, ordered by event type then topic.
    pub fn snapshot(&self) -> Vec<EventStats> {
        let mut all: Vec<EventStats> = self.stats.iter().map(|s| s.value().clone()).collect();
        all.sort_by(|a, b| {
            a.event_type
                .cmp(&b.event_type)
                .then_with(|| a.topic.cmp(&b.topic))
        });
        all
    }

    /// Successes plus failures across every pair.
    pub fn total_processed(&self) -> u64 {
        self.stats.iter().map(|s| s.processed()).sum()
    }

    pub fn summary(&self, service: impl Into<String>) -> StatsSummary {
        let events_by_type = self.snapshot();
        StatsSummary {
            service: service.into(),
            total_events_processed: events_by_type.iter().map(EventStats::processed).sum(),
            timestamp: Utc::now(),
            events_by_type,
        }
    }

    /// Forget every counter.
    pub fn reset(&self) {
        self.stats.clear();
    }
}
