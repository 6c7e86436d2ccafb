//! The workflow scheduler: periodic launcher for recurring workflows.
//!
//! Active schedules sit in a min-heap keyed by next fire time. The run
//! loop sleeps until the earliest entry is due, launches the parameterised
//! instance, recomputes the next fire from the cron expression and pushes
//! the entry back. A schedule with `onfailure=SUSPEND` is deactivated when
//! an instance it launched terminates with errors.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_db::models::OnFailureBehavior;
use weft_db::queries::schedules as schedule_db;

use crate::error::{EngineError, Result};

/// What the scheduler asks of the engine. Implemented by the engine;
/// tests substitute fakes.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch_scheduled(&self, request: ScheduledLaunch) -> anyhow::Result<i64>;
}

/// A launch originated by a schedule.
#[derive(Debug, Clone)]
pub struct ScheduledLaunch {
    pub schedule_id: i64,
    pub workflow_id: i64,
    pub parameters: Vec<(String, String)>,
    pub user: Option<String>,
    pub host: Option<String>,
}

/// Termination feedback routed from the engine back to the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct ScheduleFeedback {
    pub schedule_id: i64,
    pub errors: i32,
}

/// One active schedule.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub id: i64,
    pub workflow_id: i64,
    pub expression: cron::Schedule,
    pub onfailure: OnFailureBehavior,
    pub user: Option<String>,
    pub host: Option<String>,
    pub parameters: Vec<(String, String)>,
}

/// Parse the standard 5-field cron form (minute granularity). The cron
/// crate wants a seconds field, which is pinned to zero; expressions that
/// already carry seconds are rejected.
pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    let fields = expr.split_whitespace().count();
    if fields != 5 {
        return Err(EngineError::invalid_parameter(
            "WorkflowSchedule",
            format!("expected a 5-field cron expression, got {fields} fields"),
        ));
    }
    cron::Schedule::from_str(&format!("0 {expr}")).map_err(|e| {
        EngineError::invalid_parameter(
            "WorkflowSchedule",
            format!("invalid cron expression {expr:?}: {e}"),
        )
    })
}

/// A schedule is owned by this node when bound to it explicitly or bound
/// to `any`/`all`.
pub fn owned_by_node(binding: &str, node_name: &str) -> bool {
    binding == "any" || binding == "all" || binding == node_name
}

struct SchedulerState {
    entries: HashMap<i64, ScheduleEntry>,
    heap: BinaryHeap<Reverse<(DateTime<Utc>, i64)>>,
}

pub struct WorkflowScheduler {
    state: Mutex<SchedulerState>,
    reload_waker: Notify,
    launcher: Arc<dyn Launcher>,
    node_name: String,
}

impl WorkflowScheduler {
    pub fn new(launcher: Arc<dyn Launcher>, node_name: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(SchedulerState {
                entries: HashMap::new(),
                heap: BinaryHeap::new(),
            }),
            reload_waker: Notify::new(),
            launcher,
            node_name: node_name.into(),
        }
    }

    /// Load active schedules owned by this node from the database.
    pub async fn reload(&self, pool: &PgPool) -> anyhow::Result<()> {
        info!("reloading workflow schedule definitions");

        let rows = schedule_db::list_workflow_schedules(pool).await?;
        let mut entries = Vec::new();

        for row in rows {
            if !row.workflow_schedule_active {
                continue;
            }
            if !owned_by_node(&row.node_name, &self.node_name) {
                continue;
            }
            let expression = match parse_cron(&row.workflow_schedule) {
                Ok(expr) => expr,
                Err(e) => {
                    warn!(schedule_id = row.workflow_schedule_id, error = %e,
                          "skipping schedule with invalid expression");
                    continue;
                }
            };
            let parameters =
                schedule_db::get_schedule_parameters(pool, row.workflow_schedule_id).await?;

            entries.push(ScheduleEntry {
                id: row.workflow_schedule_id,
                workflow_id: row.workflow_id,
                expression,
                onfailure: row.workflow_schedule_onfailure,
                user: row.workflow_schedule_user,
                host: row.workflow_schedule_host,
                parameters,
            });
        }

        self.replace_entries(entries);
        Ok(())
    }

    /// Replace every entry and re-arm the heap (also used by tests).
    pub fn replace_entries(&self, entries: Vec<ScheduleEntry>) {
        let now = Utc::now();
        let mut state = self.state.lock().unwrap();
        state.entries.clear();
        state.heap.clear();
        for entry in entries {
            if let Some(next) = entry.expression.after(&now).next() {
                state.heap.push(Reverse((next, entry.id)));
            }
            state.entries.insert(entry.id, entry);
        }
        drop(state);
        self.reload_waker.notify_one();
    }

    /// Deactivate a schedule in memory and persist the flag.
    pub async fn suspend(&self, pool: Option<&PgPool>, schedule_id: i64) {
        {
            let mut state = self.state.lock().unwrap();
            state.entries.remove(&schedule_id);
            // Stale heap entries for the id are skipped at pop time.
        }
        info!(schedule_id, "schedule suspended after failed instance");

        if let Some(pool) = pool {
            if let Err(e) = schedule_db::set_schedule_active(pool, schedule_id, false).await {
                warn!(schedule_id, error = %e, "failed to persist schedule suspension");
            }
        }
    }

    /// Next due `(time, schedule_id)` without popping.
    fn peek_due(&self) -> Option<(DateTime<Utc>, i64)> {
        let state = self.state.lock().unwrap();
        state.heap.peek().map(|Reverse(pair)| *pair)
    }

    /// Pop the head if it is due; re-arm it with its next fire time.
    fn pop_due(&self, now: DateTime<Utc>) -> Option<ScheduleEntry> {
        let mut state = self.state.lock().unwrap();
        loop {
            let Reverse((at, id)) = *state.heap.peek()?;
            if at > now {
                return None;
            }
            state.heap.pop();
            let Some(entry) = state.entries.get(&id).cloned() else {
                // Suspended or removed since being queued.
                continue;
            };
            if let Some(next) = entry.expression.after(&now).next() {
                state.heap.push(Reverse((next, id)));
            }
            return Some(entry);
        }
    }

    /// Run until cancelled. `feedback` carries terminations of scheduled
    /// instances so SUSPEND-on-failure can take effect.
    pub async fn run(
        &self,
        pool: Option<PgPool>,
        mut feedback: mpsc::UnboundedReceiver<ScheduleFeedback>,
        shutdown: CancellationToken,
    ) {
        loop {
            // Fire everything currently due.
            let now = Utc::now();
            while let Some(entry) = self.pop_due(now) {
                let request = ScheduledLaunch {
                    schedule_id: entry.id,
                    workflow_id: entry.workflow_id,
                    parameters: entry.parameters.clone(),
                    user: entry.user.clone(),
                    host: entry.host.clone(),
                };
                match self.launcher.launch_scheduled(request).await {
                    Ok(instance_id) => {
                        info!(schedule_id = entry.id, instance_id, "scheduled instance launched");
                    }
                    Err(e) => {
                        warn!(schedule_id = entry.id, error = %e, "scheduled launch failed");
                    }
                }
            }

            // Sleep until the next fire, a reload, feedback or shutdown.
            let sleep_for = match self.peek_due() {
                Some((at, _)) => (at - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO),
                None => std::time::Duration::from_secs(3600),
            };

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.reload_waker.notified() => {}
                item = feedback.recv() => {
                    if let Some(ScheduleFeedback { schedule_id, errors }) = item {
                        self.handle_feedback(pool.as_ref(), schedule_id, errors).await;
                    }
                }
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn handle_feedback(&self, pool: Option<&PgPool>, schedule_id: i64, errors: i32) {
        if errors == 0 {
            return;
        }
        let suspend = {
            let state = self.state.lock().unwrap();
            state
                .entries
                .get(&schedule_id)
                .map(|e| e.onfailure == OnFailureBehavior::Suspend)
                .unwrap_or(false)
        };
        if suspend {
            self.suspend(pool, schedule_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLauncher {
        launches: AtomicUsize,
    }

    #[async_trait]
    impl Launcher for CountingLauncher {
        async fn launch_scheduled(&self, _request: ScheduledLaunch) -> anyhow::Result<i64> {
            self.launches.fetch_add(1, Ordering::SeqCst);
            Ok(1)
        }
    }

    #[test]
    fn cron_five_fields_accepted() {
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 12 * * 1-5").is_ok());
        assert!(parse_cron("30 4 1,15 * *").is_ok());
    }

    #[test]
    fn cron_other_field_counts_rejected() {
        assert!(parse_cron("* * * *").is_err());
        // Second-granularity form is not supported.
        assert!(parse_cron("0 */5 * * * *").is_err());
        assert!(parse_cron("0 0 */5 * * * 2030").is_err());
    }

    #[test]
    fn cron_next_fire_advances() {
        let schedule = parse_cron("*/5 * * * *").unwrap();
        let now = Utc::now();
        let next = schedule.after(&now).next().unwrap();
        assert!(next > now);
        assert_eq!(next.timestamp() % 300, 0);
    }

    #[test]
    fn node_binding() {
        assert!(owned_by_node("any", "node-1"));
        assert!(owned_by_node("all", "node-1"));
        assert!(owned_by_node("node-1", "node-1"));
        assert!(!owned_by_node("node-2", "node-1"));
    }

    #[test]
    fn pop_due_skips_suspended_entries() {
        let launcher = Arc::new(CountingLauncher {
            launches: AtomicUsize::new(0),
        });
        let scheduler = WorkflowScheduler::new(launcher, "node-1");

        scheduler.replace_entries(vec![ScheduleEntry {
            id: 7,
            workflow_id: 1,
            expression: parse_cron("* * * * *").unwrap(),
            onfailure: OnFailureBehavior::Suspend,
            user: None,
            host: None,
            parameters: Vec::new(),
        }]);

        // Entry removed; even a due heap item must not fire.
        scheduler.state.lock().unwrap().entries.remove(&7);
        let due = scheduler.pop_due(Utc::now() + chrono::Duration::minutes(2));
        assert!(due.is_none());
    }

    #[tokio::test]
    async fn feedback_suspends_on_failure() {
        let launcher = Arc::new(CountingLauncher {
            launches: AtomicUsize::new(0),
        });
        let scheduler = WorkflowScheduler::new(launcher, "node-1");

        scheduler.replace_entries(vec![ScheduleEntry {
            id: 3,
            workflow_id: 1,
            expression: parse_cron("0 0 1 1 *").unwrap(),
            onfailure: OnFailureBehavior::Suspend,
            user: None,
            host: None,
            parameters: Vec::new(),
        }]);

        scheduler.handle_feedback(None, 3, 2).await;
        assert!(scheduler.state.lock().unwrap().entries.get(&3).is_none());
    }

    #[tokio::test]
    async fn feedback_keeps_continue_schedules() {
        let launcher = Arc::new(CountingLauncher {
            launches: AtomicUsize::new(0),
        });
        let scheduler = WorkflowScheduler::new(launcher, "node-1");

        scheduler.replace_entries(vec![ScheduleEntry {
            id: 4,
            workflow_id: 1,
            expression: parse_cron("0 0 1 1 *").unwrap(),
            onfailure: OnFailureBehavior::Continue,
            user: None,
            host: None,
            parameters: Vec::new(),
        }]);

        scheduler.handle_feedback(None, 4, 2).await;
        assert!(scheduler.state.lock().unwrap().entries.get(&4).is_some());
    }
}
