//! Node runtime: constructs every component once, threads them through
//! constructors, and runs the dispatcher/outcome loops.
//!
//! This is the single composition root. The CLI's `serve` and `run`
//! commands build a `Runtime`; engine integration tests do the same with
//! an in-memory store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::dblog::DbLogger;
use crate::events::EventsBus;
use crate::gc::{GarbageCollector, GcConfig};
use crate::instance::{Engine, EngineLauncher};
use crate::notify::{NotificationDispatcher, NotifyConfig};
use crate::process::{ProcessConfig, ProcessManager};
use crate::queue::{QueuePool, QueuePoolConfig};
use crate::retry::RetrySchedules;
use crate::schedule::WorkflowScheduler;
use crate::stats::Statistics;
use crate::storage::InstanceStore;

/// Node-level configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub node_name: String,
    pub logs_dir: PathBuf,
    pub logs_delete: bool,
    pub agent_path: Option<String>,
    pub queue_pool: QueuePoolConfig,
    /// Plugin dispatch; `None` disables notifications.
    pub notify: Option<NotifyConfig>,
    pub gc: GcConfig,
    /// How long shutdown waits for live instances before aborting them.
    pub shutdown_grace: Duration,
    /// Whether to run the cron scheduler (requires a database).
    pub run_scheduler: bool,
}

impl RuntimeConfig {
    /// Minimal configuration for one-shot runs and tests.
    pub fn ephemeral(logs_dir: PathBuf) -> Self {
        Self {
            node_name: "local".to_owned(),
            logs_dir,
            logs_delete: true,
            agent_path: None,
            queue_pool: QueuePoolConfig::default(),
            notify: None,
            gc: GcConfig {
                enabled: false,
                ..GcConfig::default()
            },
            shutdown_grace: Duration::from_secs(30),
            run_scheduler: false,
        }
    }
}

/// A running node.
pub struct Runtime {
    pub engine: Arc<Engine>,
    pub queue_pool: Arc<QueuePool>,
    pub process: Arc<ProcessManager>,
    pub events: Arc<EventsBus>,
    pub stats: Arc<Statistics>,
    pub retries: Arc<RetrySchedules>,
    pub scheduler: Option<Arc<WorkflowScheduler>>,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
    workers: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Build and start every component.
    pub async fn start(
        config: RuntimeConfig,
        store: Arc<dyn InstanceStore>,
        pool: Option<PgPool>,
    ) -> anyhow::Result<Self> {
        let shutdown = CancellationToken::new();
        let stats = Arc::new(Statistics::new());
        let events = Arc::new(EventsBus::new(Arc::clone(&stats)));

        let queue_pool = Arc::new(QueuePool::new(config.queue_pool.clone(), Arc::clone(&stats)));
        if let Some(pool) = &pool {
            queue_pool.reload(pool).await?;
        }

        let retries = Arc::new(RetrySchedules::new());
        if let Some(pool) = &pool {
            retries.reload(pool).await?;
        }

        let logger = Arc::new(match &pool {
            Some(pool) => {
                DbLogger::new(pool.clone(), config.node_name.as_str(), Arc::clone(&events))
            }
            None => DbLogger::detached(config.node_name.as_str()),
        });

        let notifier = config.notify.clone().map(|notify_config| {
            NotificationDispatcher::start(notify_config, pool.clone(), Arc::clone(&logger))
        });

        let (process, mut outcome_rx) = ProcessManager::new(ProcessConfig {
            logs_dir: config.logs_dir.clone(),
            logs_delete: config.logs_delete,
            agent_path: config.agent_path.clone(),
        });

        let engine = Engine::new(
            config.node_name.as_str(),
            store,
            Arc::clone(&queue_pool),
            Arc::clone(&process),
            Arc::clone(&events),
            notifier,
            Arc::clone(&retries),
            Arc::clone(&stats),
            pool.clone(),
        );

        let mut workers = Vec::new();

        // Dispatcher: queue pool -> process manager.
        {
            let engine = Arc::clone(&engine);
            let queue_pool = Arc::clone(&queue_pool);
            let token = shutdown.clone();
            workers.push(tokio::spawn(async move {
                while let Some((queue, attempt)) = queue_pool.dequeue_next(&token).await {
                    engine.start_attempt(queue, attempt).await;
                }
            }));
        }

        // Outcome consumer: process manager -> engine.
        {
            let engine = Arc::clone(&engine);
            let token = shutdown.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        outcome = outcome_rx.recv() => {
                            match outcome {
                                Some(outcome) => engine.on_task_outcome(outcome).await,
                                None => break,
                            }
                        }
                        _ = token.cancelled() => {
                            // Drain whatever was already posted.
                            while let Ok(outcome) = outcome_rx.try_recv() {
                                engine.on_task_outcome(outcome).await;
                            }
                            break;
                        }
                    }
                }
            }));
        }

        // Cron scheduler.
        let scheduler = if config.run_scheduler {
            let scheduler = Arc::new(WorkflowScheduler::new(
                Arc::new(EngineLauncher(Arc::clone(&engine))),
                config.node_name.as_str(),
            ));
            if let Some(pool) = &pool {
                scheduler.reload(pool).await?;
            }
            let (feedback_tx, feedback_rx) = tokio::sync::mpsc::unbounded_channel();
            engine.set_schedule_feedback(feedback_tx);

            let runner = Arc::clone(&scheduler);
            let pool = pool.clone();
            let token = shutdown.clone();
            workers.push(tokio::spawn(async move {
                runner.run(pool, feedback_rx, token).await;
            }));
            Some(scheduler)
        } else {
            None
        };

        // Garbage collector.
        if let Some(pool) = &pool {
            let gc = GarbageCollector::new(pool.clone(), config.gc.clone());
            let token = shutdown.clone();
            workers.push(tokio::spawn(async move {
                gc.run(token).await;
            }));
        }

        // Recover instances left executing by a previous run.
        let resumed = engine.resume_all().await?;
        if resumed > 0 {
            info!(resumed, "recovered instances from savepoints");
        }

        Ok(Self {
            engine,
            queue_pool,
            process,
            events,
            stats,
            retries,
            scheduler,
            shutdown,
            shutdown_grace: config.shutdown_grace,
            workers,
        })
    }

    /// Graceful shutdown: stop launches, drain instances and children,
    /// then stop the worker tasks.
    pub async fn shutdown(self) {
        self.engine.shutdown(self.shutdown_grace).await;
        self.process.drain().await;
        self.shutdown.cancel();
        self.queue_pool.wake();
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}
