//! Retry schedules: named curves of `(delay, count)` levels consulted when
//! a task fails.
//!
//! A schedule is stored as XML: `<schedule><level retry_delay="1"
//! retry_times="2"/><level retry_delay="5" retry_times="3"/></schedule>`.
//! The k-th retry (0-based) takes the delay of the level whose cumulative
//! count covers k; past the last level the schedule is exhausted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::PgPool;
use tracing::warn;

use weft_db::queries::schedules as schedule_db;

use crate::error::{EngineError, Result};
use crate::xml::Document;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLevel {
    pub delay: Duration,
    pub times: u32,
}

#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub id: i64,
    pub name: String,
    pub levels: Vec<RetryLevel>,
}

impl RetrySchedule {
    /// Parse a schedule from its XML body.
    pub fn parse(id: i64, name: impl Into<String>, xml: &str) -> Result<Self> {
        let doc = Document::parse(xml)?;
        let mut levels = Vec::new();

        for level in doc.children_named(doc.root(), "level") {
            let delay: u64 = doc
                .attr(level, "retry_delay")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| {
                    EngineError::invalid_parameter(
                        "RetrySchedule",
                        "level is missing a numeric retry_delay",
                    )
                })?;
            let times: u32 = doc
                .attr(level, "retry_times")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| {
                    EngineError::invalid_parameter(
                        "RetrySchedule",
                        "level is missing a numeric retry_times",
                    )
                })?;
            levels.push(RetryLevel {
                delay: Duration::from_secs(delay),
                times,
            });
        }

        Ok(Self {
            id,
            name: name.into(),
            levels,
        })
    }

    /// Total number of retries the schedule grants.
    pub fn total_times(&self) -> u32 {
        self.levels.iter().map(|l| l.times).sum()
    }

    /// Delay before the `retry_index`-th retry (0-based), or `None` when
    /// the budget is exhausted.
    pub fn delay_for(&self, retry_index: u32) -> Option<Duration> {
        let mut boundary = 0;
        for level in &self.levels {
            boundary += level.times;
            if retry_index < boundary {
                return Some(level.delay);
            }
        }
        None
    }
}

/// Registry of retry schedules, reloadable from the database.
#[derive(Default)]
pub struct RetrySchedules {
    schedules: Mutex<HashMap<String, Arc<RetrySchedule>>>,
}

impl RetrySchedules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the registry contents from `t_schedule`.
    pub async fn reload(&self, pool: &PgPool) -> anyhow::Result<()> {
        tracing::info!("reloading retry schedule definitions");

        let rows = schedule_db::list_retry_schedules(pool).await?;
        let mut loaded = HashMap::new();
        for row in rows {
            match RetrySchedule::parse(row.schedule_id, row.schedule_name.as_str(), &row.schedule_xml)
            {
                Ok(schedule) => {
                    loaded.insert(row.schedule_name.clone(), Arc::new(schedule));
                }
                Err(e) => {
                    warn!(schedule = %row.schedule_name, error = %e, "skipping unparseable retry schedule");
                }
            }
        }

        *self.schedules.lock().unwrap() = loaded;
        Ok(())
    }

    /// Register a schedule directly (startup defaults, tests).
    pub fn insert(&self, schedule: RetrySchedule) {
        self.schedules
            .lock()
            .unwrap()
            .insert(schedule.name.clone(), Arc::new(schedule));
    }

    pub fn get(&self, name: &str) -> Option<Arc<RetrySchedule>> {
        self.schedules.lock().unwrap().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> RetrySchedule {
        RetrySchedule::parse(
            1,
            "steps",
            r#"<schedule><level retry_delay="1" retry_times="2"/><level retry_delay="5" retry_times="3"/></schedule>"#,
        )
        .unwrap()
    }

    #[test]
    fn parse_levels() {
        let s = schedule();
        assert_eq!(s.levels.len(), 2);
        assert_eq!(s.levels[0].delay, Duration::from_secs(1));
        assert_eq!(s.levels[1].times, 3);
        assert_eq!(s.total_times(), 5);
    }

    #[test]
    fn delay_walks_cumulative_boundaries() {
        let s = schedule();
        assert_eq!(s.delay_for(0), Some(Duration::from_secs(1)));
        assert_eq!(s.delay_for(1), Some(Duration::from_secs(1)));
        assert_eq!(s.delay_for(2), Some(Duration::from_secs(5)));
        assert_eq!(s.delay_for(4), Some(Duration::from_secs(5)));
        assert_eq!(s.delay_for(5), None);
    }

    #[test]
    fn empty_schedule_never_retries() {
        let s = RetrySchedule::parse(1, "none", "<schedule/>").unwrap();
        assert_eq!(s.delay_for(0), None);
        assert_eq!(s.total_times(), 0);
    }

    #[test]
    fn malformed_level_rejected() {
        assert!(RetrySchedule::parse(1, "bad", r#"<schedule><level retry_delay="x" retry_times="1"/></schedule>"#).is_err());
    }

    #[test]
    fn registry_lookup() {
        let registry = RetrySchedules::new();
        registry.insert(schedule());
        assert!(registry.get("steps").is_some());
        assert!(registry.get("missing").is_none());
    }
}
