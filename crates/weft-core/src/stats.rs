//! Node-wide counters, exposed through the API's statistics action.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Shared atomic counters. Gauges (currently-executing figures) use signed
/// atomics so a late decrement never wraps.
#[derive(Debug, Default)]
pub struct Statistics {
    pub instances_launched: AtomicU64,
    pub instances_executing: AtomicI64,
    pub instances_errors: AtomicU64,
    pub tasks_accepted: AtomicU64,
    pub tasks_executed: AtomicU64,
    pub tasks_rejected: AtomicU64,
    pub events_emitted: AtomicU64,
    pub event_subscriptions: AtomicI64,
    pub api_queries: AtomicU64,
    pub api_exceptions: AtomicU64,
}

/// A point-in-time copy of every counter.
#[derive(Debug, Clone, Serialize)]
pub struct StatisticsSnapshot {
    pub instances_launched: u64,
    pub instances_executing: i64,
    pub instances_errors: u64,
    pub tasks_accepted: u64,
    pub tasks_executed: u64,
    pub tasks_rejected: u64,
    pub events_emitted: u64,
    pub event_subscriptions: i64,
    pub api_queries: u64,
    pub api_exceptions: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            instances_launched: self.instances_launched.load(Ordering::Relaxed),
            instances_executing: self.instances_executing.load(Ordering::Relaxed),
            instances_errors: self.instances_errors.load(Ordering::Relaxed),
            tasks_accepted: self.tasks_accepted.load(Ordering::Relaxed),
            tasks_executed: self.tasks_executed.load(Ordering::Relaxed),
            tasks_rejected: self.tasks_rejected.load(Ordering::Relaxed),
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            event_subscriptions: self.event_subscriptions.load(Ordering::Relaxed),
            api_queries: self.api_queries.load(Ordering::Relaxed),
            api_exceptions: self.api_exceptions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = Statistics::new();
        stats.tasks_accepted.fetch_add(3, Ordering::Relaxed);
        stats.instances_executing.fetch_add(2, Ordering::Relaxed);
        stats.instances_executing.fetch_sub(1, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.tasks_accepted, 3);
        assert_eq!(snap.instances_executing, 1);
        assert_eq!(snap.api_exceptions, 0);
    }
}
