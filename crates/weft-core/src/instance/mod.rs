//! The workflow instance engine.
//!
//! Owns every live instance, drives DAG evaluation through the queue pool
//! and process manager, and persists savepoints. Mutations of one instance
//! are serialised by its own async mutex; the engine itself is re-entrant.

pub mod dag;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{info, warn};

use weft_db::models::InstanceStatus;

use crate::error::{EngineError, Result};
use crate::events::{EventType, EventsBus};
use crate::notify::{InstanceSnapshot, NotificationDispatcher};
use crate::process::{ProcessManager, TaskCommand, TaskOutcome, TaskRequest};
use crate::queue::{AttemptRef, QueuePool};
use crate::retry::RetrySchedules;
use crate::schedule::{Launcher, ScheduleFeedback, ScheduledLaunch};
use crate::stats::Statistics;
use crate::storage::{InstanceStore, NewInstance};
use crate::workflow::{TaskType, Workflow};

use dag::{Action, InstanceDisposition, TaskState, WorkflowInstance};

pub use dag::TaskSlot;

/// Options carried by a launch request.
#[derive(Debug, Clone, Default)]
pub struct LaunchOptions {
    pub host: Option<String>,
    pub user: Option<String>,
    pub schedule_id: Option<i64>,
}

struct InstanceHandle {
    state: tokio::sync::Mutex<WorkflowInstance>,
    notifications: Vec<i64>,
    schedule_id: Option<i64>,
    default_host: Option<String>,
    default_user: Option<String>,
    finalized: AtomicBool,
}

#[derive(Debug, Clone)]
struct RunningAttempt {
    queue: String,
    attempt: AttemptRef,
}

pub struct Engine {
    node_name: String,
    store: Arc<dyn InstanceStore>,
    queue_pool: Arc<QueuePool>,
    process: Arc<ProcessManager>,
    events: Arc<EventsBus>,
    notifier: Option<Arc<NotificationDispatcher>>,
    retries: Arc<RetrySchedules>,
    stats: Arc<Statistics>,
    /// Database handle for schedule-driven launches; `None` for one-shot
    /// in-memory execution.
    pool: Option<PgPool>,
    schedule_feedback: Mutex<Option<tokio::sync::mpsc::UnboundedSender<ScheduleFeedback>>>,
    instances: Mutex<HashMap<i64, Arc<InstanceHandle>>>,
    attempts: Mutex<HashMap<u64, RunningAttempt>>,
    next_attempt_id: AtomicU64,
    accepting: AtomicBool,
    idle: Notify,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_name: impl Into<String>,
        store: Arc<dyn InstanceStore>,
        queue_pool: Arc<QueuePool>,
        process: Arc<ProcessManager>,
        events: Arc<EventsBus>,
        notifier: Option<Arc<NotificationDispatcher>>,
        retries: Arc<RetrySchedules>,
        stats: Arc<Statistics>,
        pool: Option<PgPool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_name: node_name.into(),
            store,
            queue_pool,
            process,
            events,
            notifier,
            retries,
            stats,
            pool,
            schedule_feedback: Mutex::new(None),
            instances: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            next_attempt_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            idle: Notify::new(),
        })
    }

    /// Wire the scheduler feedback channel (SUSPEND-on-failure).
    pub fn set_schedule_feedback(
        &self,
        tx: tokio::sync::mpsc::UnboundedSender<ScheduleFeedback>,
    ) {
        *self.schedule_feedback.lock().unwrap() = Some(tx);
    }

    /// Number of live instances.
    pub fn active_instances(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    // -- launch --------------------------------------------------------------

    /// Validate parameters, create the instance, schedule the initially
    /// runnable tasks and return the instance id.
    pub async fn launch(
        self: &Arc<Self>,
        workflow: &Workflow,
        parameters: &[(String, String)],
        options: LaunchOptions,
    ) -> Result<i64> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::invalid_parameter(
                "Engine",
                "node is shutting down, no new launches accepted",
            ));
        }

        workflow.check_input_parameters(parameters)?;

        let instance_id = self
            .store
            .create_instance(NewInstance {
                node_name: self.node_name.clone(),
                workflow_id: workflow.id,
                workflow_schedule_id: options.schedule_id,
                host: options.host.clone(),
            })
            .await
            .map_err(store_err)?;

        self.store
            .record_parameters(instance_id, parameters)
            .await
            .map_err(store_err)?;

        let (instance, actions) =
            WorkflowInstance::build(instance_id, workflow, parameters, &self.retries)?;

        let handle = Arc::new(InstanceHandle {
            state: tokio::sync::Mutex::new(instance),
            notifications: workflow.notifications.clone(),
            schedule_id: options.schedule_id,
            default_host: options.host,
            default_user: options.user,
            finalized: AtomicBool::new(false),
        });
        self.instances
            .lock()
            .unwrap()
            .insert(instance_id, Arc::clone(&handle));

        self.stats.instances_launched.fetch_add(1, Ordering::Relaxed);
        self.stats.instances_executing.fetch_add(1, Ordering::Relaxed);
        self.events.create(EventType::InstanceStarted, instance_id as u64);
        info!(instance_id, workflow = %workflow.name, "workflow instance launched");

        self.persist_progress(instance_id, &handle).await;
        self.apply_actions(instance_id, actions).await;
        self.maybe_finalize(instance_id).await;

        Ok(instance_id)
    }

    /// Reload instances this node left `EXECUTING` and re-schedule their
    /// interrupted tasks.
    pub async fn resume_all(self: &Arc<Self>) -> Result<usize> {
        let recoverable = self
            .store
            .list_recoverable(&self.node_name)
            .await
            .map_err(store_err)?;

        let mut resumed = 0;
        for item in recoverable {
            match WorkflowInstance::resume(item.instance_id, &item.savepoint, &self.retries) {
                Ok((instance, actions)) => {
                    let instance_id = item.instance_id;
                    let handle = Arc::new(InstanceHandle {
                        state: tokio::sync::Mutex::new(instance),
                        notifications: Vec::new(),
                        schedule_id: None,
                        default_host: None,
                        default_user: None,
                        finalized: AtomicBool::new(false),
                    });
                    self.instances
                        .lock()
                        .unwrap()
                        .insert(instance_id, Arc::clone(&handle));
                    self.stats.instances_executing.fetch_add(1, Ordering::Relaxed);
                    info!(instance_id, "resumed workflow instance from savepoint");

                    self.apply_actions(instance_id, actions).await;
                    self.maybe_finalize(instance_id).await;
                    resumed += 1;
                }
                Err(e) => {
                    warn!(instance_id = item.instance_id, error = %e,
                          "failed to resume instance from savepoint");
                }
            }
        }
        Ok(resumed)
    }

    // -- cancellation --------------------------------------------------------

    /// Forbid further tasks of an instance; optionally kill its running
    /// processes. The instance terminates `ABORTED` once nothing runs.
    pub async fn cancel(self: &Arc<Self>, instance_id: i64, kill_running: bool) -> Result<()> {
        let handle = self.handle(instance_id)?;

        {
            let mut state = handle.state.lock().await;
            state.cancel();
        }

        // Pull waiting attempts out of the queues; each becomes an aborted
        // attempt record.
        let removed = self.queue_pool.cancel_instance(instance_id);
        if !removed.is_empty() {
            let mut state = handle.state.lock().await;
            let mut actions = Vec::new();
            for attempt in removed {
                if state.task(attempt.task_index).state == TaskState::Queued {
                    state.task_dropped(
                        attempt.task_index,
                        "Cancelled while queued",
                        &self.retries,
                        &mut actions,
                    );
                }
            }
            // Cancellation never yields new work.
            debug_assert!(actions.is_empty());
        }

        if kill_running {
            let attempts = {
                let state = handle.state.lock().await;
                state.running_attempts(None)
            };
            for attempt_id in attempts {
                self.process.kill(attempt_id);
            }
        }

        self.persist_progress(instance_id, &handle).await;
        self.maybe_finalize(instance_id).await;
        Ok(())
    }

    /// Signal the running process(es) of an instance, optionally only the
    /// tasks matching a label.
    pub async fn kill(&self, instance_id: i64, task_label: Option<&str>) -> Result<usize> {
        let handle = self.handle(instance_id)?;
        let attempts = {
            let state = handle.state.lock().await;
            state.running_attempts(task_label)
        };
        let mut killed = 0;
        for attempt_id in &attempts {
            if self.process.kill(*attempt_id) {
                killed += 1;
            }
        }
        Ok(killed)
    }

    // -- dispatch ------------------------------------------------------------

    /// Called by the dispatcher when the queue pool releases an attempt:
    /// build the process request and hand it to the process manager.
    pub async fn start_attempt(self: &Arc<Self>, queue: String, attempt: AttemptRef) {
        let Ok(handle) = self.handle(attempt.instance_id) else {
            warn!(instance_id = attempt.instance_id, "attempt for unknown instance dropped");
            self.queue_pool.on_attempt_finished(&queue);
            return;
        };

        let request = {
            let mut state = handle.state.lock().await;

            if state.cancelling() || state.task(attempt.task_index).state != TaskState::Queued {
                let mut actions = Vec::new();
                if state.task(attempt.task_index).state == TaskState::Queued {
                    state.task_dropped(
                        attempt.task_index,
                        "Cancelled before execution",
                        &self.retries,
                        &mut actions,
                    );
                }
                drop(state);
                self.queue_pool.on_attempt_finished(&queue);
                self.maybe_finalize(attempt.instance_id).await;
                return;
            }

            let attempt_id = self.next_attempt_id.fetch_add(1, Ordering::SeqCst);
            state.task_started(attempt.task_index, attempt_id);

            let task = state.task(attempt.task_index);
            let command = match &task.spec.task_type {
                TaskType::Binary { path } => TaskCommand::Binary { path: path.clone() },
                TaskType::Script { .. } => TaskCommand::Script {
                    body: task.script_body.clone().unwrap_or_default(),
                },
            };

            self.attempts.lock().unwrap().insert(
                attempt_id,
                RunningAttempt {
                    queue: queue.clone(),
                    attempt: attempt.clone(),
                },
            );

            TaskRequest {
                attempt_id,
                instance_id: attempt.instance_id,
                task_index: attempt.task_index,
                command,
                args: task.args.clone(),
                env: task.env.clone(),
                stdin: task.stdin.clone(),
                merge_stderr: task.spec.merge_stderr,
                use_agent: task.spec.use_agent,
                user: task.spec.user.clone().or_else(|| handle.default_user.clone()),
                host: task.spec.host.clone().or_else(|| handle.default_host.clone()),
                wd: task.spec.wd.clone(),
            }
        };

        self.events
            .create(EventType::TaskExecute, attempt.instance_id as u64);
        self.events.create(EventType::QueueExecute, attempt.instance_id as u64);

        let attempt_id = request.attempt_id;
        if let Err(e) = self.process.execute(request).await {
            self.attempts.lock().unwrap().remove(&attempt_id);
            self.queue_pool.on_attempt_finished(&queue);

            let actions = {
                let mut state = handle.state.lock().await;
                let mut actions = Vec::new();
                state.task_dropped(
                    attempt.task_index,
                    &format!("failed to start task: {e}"),
                    &self.retries,
                    &mut actions,
                );
                actions
            };
            self.events
                .create(EventType::TaskTerminate, attempt.instance_id as u64);
            self.persist_progress(attempt.instance_id, &handle).await;
            self.apply_actions(attempt.instance_id, actions).await;
            self.maybe_finalize(attempt.instance_id).await;
        }
    }

    /// Called by the runtime when the process manager reaps an attempt.
    pub async fn on_task_outcome(self: &Arc<Self>, outcome: TaskOutcome) {
        let running = self.attempts.lock().unwrap().remove(&outcome.attempt_id);
        let Some(running) = running else {
            warn!(attempt_id = outcome.attempt_id, "outcome for unknown attempt");
            return;
        };
        self.queue_pool.on_attempt_finished(&running.queue);

        let Ok(handle) = self.handle(outcome.instance_id) else {
            return;
        };

        let actions = {
            let mut state = handle.state.lock().await;
            let mut actions = Vec::new();
            state.on_outcome(&outcome, &self.retries, &mut actions);
            actions
        };

        self.events
            .create(EventType::TaskTerminate, outcome.instance_id as u64);
        self.events
            .create(EventType::QueueTerminate, outcome.instance_id as u64);

        self.persist_progress(outcome.instance_id, &handle).await;
        self.apply_actions(outcome.instance_id, actions).await;
        self.maybe_finalize(outcome.instance_id).await;
    }

    // -- shutdown ------------------------------------------------------------

    /// Stop accepting launches, wait up to `grace` for live instances to
    /// drain, then abort the rest with a shutdown marker.
    pub async fn shutdown(self: &Arc<Self>, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            if self.active_instances() == 0 {
                return;
            }
            let idle = self.idle.notified();
            if self.active_instances() == 0 {
                return;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                break;
            }
        }

        // Grace expired: abort what is left, savepoints included.
        let remaining: Vec<(i64, Arc<InstanceHandle>)> = {
            let instances = self.instances.lock().unwrap();
            instances.iter().map(|(id, h)| (*id, Arc::clone(h))).collect()
        };
        for (instance_id, handle) in remaining {
            let attempts = {
                let mut state = handle.state.lock().await;
                let attempts = state.running_attempts(None);
                state.mark_shutdown();
                attempts
            };
            for attempt_id in attempts {
                self.process.kill(attempt_id);
            }
            warn!(instance_id, "instance aborted by shutdown");
            self.finalize(instance_id, &handle).await;
        }
    }

    // -- internals -----------------------------------------------------------

    fn handle(&self, instance_id: i64) -> Result<Arc<InstanceHandle>> {
        self.instances
            .lock()
            .unwrap()
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::invalid_parameter(
                    "Engine",
                    format!("unknown workflow instance: {instance_id}"),
                )
            })
    }

    /// Apply the actions produced by a DAG mutation.
    fn apply_actions(
        self: &Arc<Self>,
        instance_id: i64,
        actions: Vec<Action>,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            for action in actions {
                match action {
                    Action::Enqueue {
                        task_index,
                        queue,
                        priority,
                    } => {
                        let attempt = {
                            let Ok(handle) = self.handle(instance_id) else { return };
                            let state = handle.state.lock().await;
                            AttemptRef {
                                instance_id,
                                task_index,
                                retry_count: state.task(task_index).retry_count,
                            }
                        };

                        self.events.create(EventType::TaskEnqueue, instance_id as u64);
                        self.events.create(EventType::QueueEnqueue, instance_id as u64);

                        if let Err(e) = self.queue_pool.enqueue(&queue, attempt, priority) {
                            warn!(instance_id, queue = %queue, error = %e, "enqueue failed");
                            let Ok(handle) = self.handle(instance_id) else { return };
                            let followup = {
                                let mut state = handle.state.lock().await;
                                let mut actions = Vec::new();
                                state.task_dropped(
                                    task_index,
                                    &format!("unknown queue: {queue}"),
                                    &self.retries,
                                    &mut actions,
                                );
                                actions
                            };
                            self.apply_actions(instance_id, followup).await;
                        }
                    }
                    Action::ScheduleRetry { task_index, delay } => {
                        let engine = Arc::clone(self);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            engine.fire_retry(instance_id, task_index).await;
                        });
                    }
                }
            }
        })
    }

    fn fire_retry(
        self: &Arc<Self>,
        instance_id: i64,
        task_index: usize,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Ok(handle) = self.handle(instance_id) else {
                return;
            };
            let action = {
                let mut state = handle.state.lock().await;
                state.requeue_task(task_index)
            };
            match action {
                Some(action) => self.apply_actions(instance_id, vec![action]).await,
                None => self.maybe_finalize(instance_id).await,
            }
        })
    }

    /// Best-effort savepoint persistence while the instance is live.
    async fn persist_progress(&self, instance_id: i64, handle: &Arc<InstanceHandle>) {
        let (xml, errors) = {
            let mut state = handle.state.lock().await;
            (state.savepoint_xml(), state.errors)
        };
        if let Err(e) = self
            .store
            .save_savepoint(instance_id, &xml, InstanceStatus::Executing, errors, None)
            .await
        {
            warn!(instance_id, error = %e, "savepoint write failed (will retry on next transition)");
        }
    }

    /// Terminate the instance if no task can still run.
    async fn maybe_finalize(self: &Arc<Self>, instance_id: i64) {
        let Ok(handle) = self.handle(instance_id) else {
            return;
        };
        let finished = {
            let state = handle.state.lock().await;
            state.is_finished()
        };
        if finished {
            self.finalize(instance_id, &handle).await;
        }
    }

    async fn finalize(self: &Arc<Self>, instance_id: i64, handle: &Arc<InstanceHandle>) {
        if handle.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        let (mut status, errors, mut xml, workflow_name) = {
            let mut state = handle.state.lock().await;
            state.seal();
            let status = match state.disposition() {
                InstanceDisposition::Terminated => InstanceStatus::Terminated,
                InstanceDisposition::Aborted => InstanceStatus::Aborted,
            };
            (status, state.errors, state.savepoint_xml(), state.workflow_name.clone())
        };

        // The terminal write must land; if it cannot, the instance goes to
        // ABORTED with the engine-error flag set in the savepoint.
        if let Err(e) = self
            .store
            .save_savepoint(instance_id, &xml, status, errors, Some(Utc::now()))
            .await
        {
            warn!(instance_id, error = %e, "terminal savepoint write failed");
            status = InstanceStatus::Aborted;
            {
                let mut state = handle.state.lock().await;
                state.engine_error = true;
                state.seal();
                xml = state.savepoint_xml();
            }
            if let Err(e) = self
                .store
                .save_savepoint(instance_id, &xml, status, errors, Some(Utc::now()))
                .await
            {
                warn!(instance_id, error = %e, "giving up on terminal savepoint write");
            }
        }

        self.instances.lock().unwrap().remove(&instance_id);
        self.stats.instances_executing.fetch_sub(1, Ordering::Relaxed);
        if errors > 0 {
            self.stats.instances_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.events
            .create(EventType::InstanceTerminated, instance_id as u64);
        info!(instance_id, %status, errors, "workflow instance finished");

        // Terminal notifications, fire-and-forget.
        if let Some(notifier) = &self.notifier {
            let snapshot = InstanceSnapshot {
                instance_id,
                workflow_name,
                status,
                errors,
            };
            for notification_id in &handle.notifications {
                notifier.dispatch(*notification_id, snapshot.clone());
            }
        }

        // Suspend-on-failure feedback for scheduled instances.
        if let Some(schedule_id) = handle.schedule_id {
            let feedback = self.schedule_feedback.lock().unwrap().clone();
            if let Some(tx) = feedback {
                let _ = tx.send(ScheduleFeedback {
                    schedule_id,
                    errors,
                });
            }
        }

        self.idle.notify_waiters();
    }
}

/// [`Launcher`] adapter handed to the scheduler.
pub struct EngineLauncher(pub Arc<Engine>);

#[async_trait]
impl Launcher for EngineLauncher {
    async fn launch_scheduled(&self, request: ScheduledLaunch) -> anyhow::Result<i64> {
        let engine = &self.0;
        let pool = engine.pool.as_ref().ok_or_else(|| {
            anyhow::anyhow!("no database attached, cannot launch scheduled workflows")
        })?;

        let workflow = Workflow::load_by_id(pool, request.workflow_id).await?;
        let id = engine
            .launch(
                &workflow,
                &request.parameters,
                LaunchOptions {
                    host: request.host,
                    user: request.user,
                    schedule_id: Some(request.schedule_id),
                },
            )
            .await?;
        Ok(id)
    }
}

fn store_err(err: anyhow::Error) -> EngineError {
    EngineError::new("DB", format!("{err:#}"), crate::error::ErrorCode::DbError)
}

