//! The notification dispatcher: invokes subscribed plugin binaries
//! out-of-process when an instance reaches a terminal state.
//!
//! A plugin lives at `<plugins_dir>/<type_name>` and receives the
//! notification's JSON parameters on stdin plus a small environment
//! contract describing the instance. Dispatch is fire-and-forget: a plugin
//! failure is logged, never retried, and never affects the instance.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

use weft_db::models::InstanceStatus;
use weft_db::queries::notifications as notification_db;

use crate::dblog::DbLogger;

/// Snapshot of the instance handed to plugins.
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub instance_id: i64,
    pub workflow_name: String,
    pub status: InstanceStatus,
    pub errors: i32,
}

/// One queued plugin invocation.
#[derive(Debug, Clone)]
struct WorkItem {
    notification_id: i64,
    snapshot: InstanceSnapshot,
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Directory holding plugin binaries, named by notification type.
    pub plugins_dir: PathBuf,
    /// Wall-clock limit per plugin run.
    pub timeout: Duration,
    /// Node name exported to plugins.
    pub node_name: String,
}

/// The notification dispatcher. `dispatch` enqueues; a single worker task
/// drains the channel and runs plugins.
pub struct NotificationDispatcher {
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl NotificationDispatcher {
    /// Start the worker. The returned handle enqueues work; dropping it
    /// (and every clone) ends the worker after the queue drains.
    pub fn start(config: NotifyConfig, pool: Option<PgPool>, logger: Arc<DbLogger>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkItem>();

        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                run_plugin(&config, pool.as_ref(), &logger, item).await;
            }
        });

        Arc::new(Self { tx })
    }

    /// Fire-and-forget: hand an instance snapshot to a notification.
    pub fn dispatch(&self, notification_id: i64, snapshot: InstanceSnapshot) {
        let item = WorkItem {
            notification_id,
            snapshot,
        };
        if self.tx.send(item).is_err() {
            warn!("notification worker is gone, dropping notification");
        }
    }
}

/// Resolve the plugin binary and run it. All failure paths log and return.
async fn run_plugin(
    config: &NotifyConfig,
    pool: Option<&PgPool>,
    logger: &DbLogger,
    item: WorkItem,
) {
    let Some(pool) = pool else {
        info!(
            notification_id = item.notification_id,
            "no database attached, skipping notification"
        );
        return;
    };

    let notification = match notification_db::get_notification(pool, item.notification_id).await {
        Ok(Some(n)) => n,
        Ok(None) => {
            warn!(
                notification_id = item.notification_id,
                "notification vanished before dispatch"
            );
            return;
        }
        Err(e) => {
            warn!(error = %e, "failed to load notification");
            return;
        }
    };

    let plugin_type =
        match notification_db::get_notification_type(pool, notification.notification_type_id).await
        {
            Ok(Some(t)) => t,
            Ok(None) | Err(_) => {
                warn!(
                    notification_id = item.notification_id,
                    "notification type missing, cannot resolve plugin binary"
                );
                return;
            }
        };

    let binary = config.plugins_dir.join(&plugin_type.notification_type_name);
    let snapshot = &item.snapshot;

    let mut cmd = Command::new(&binary);
    cmd.env("WEFT_NODE_NAME", &config.node_name)
        .env("WEFT_INSTANCE_ID", snapshot.instance_id.to_string())
        .env("WEFT_WORKFLOW_NAME", &snapshot.workflow_name)
        .env("WEFT_WORKFLOW_STATUS", snapshot.status.to_string())
        .env("WEFT_WORKFLOW_ERRORS", snapshot.errors.to_string())
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            logger
                .notification_log(
                    0,
                    &format!(
                        "unable to execute notification plugin {} : {e}",
                        binary.display()
                    ),
                )
                .await;
            return;
        }
    };

    let pid = child.id().unwrap_or(0) as i32;

    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin
            .write_all(notification.notification_parameters.as_bytes())
            .await
        {
            warn!(pid, error = %e, "failed to write plugin parameters");
        }
        drop(stdin);
    }

    match tokio::time::timeout(config.timeout, child.wait()).await {
        Ok(Ok(status)) => {
            let message = format!(
                "notification {} exited with status {}",
                notification.notification_name,
                status.code().unwrap_or(-1)
            );
            logger.notification_log(pid, &message).await;
        }
        Ok(Err(e)) => {
            logger
                .notification_log(pid, &format!("failed to reap notification plugin: {e}"))
                .await;
        }
        Err(_elapsed) => {
            warn!(pid, "notification plugin timed out, killing it");
            let _ = child.kill().await;
            logger
                .notification_log(
                    pid,
                    &format!(
                        "notification {} killed after timeout",
                        notification.notification_name
                    ),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_without_database_is_a_noop() {
        let logger = Arc::new(DbLogger::detached("node-1"));
        let dispatcher = NotificationDispatcher::start(
            NotifyConfig {
                plugins_dir: PathBuf::from("/nonexistent"),
                timeout: Duration::from_secs(1),
                node_name: "node-1".to_owned(),
            },
            None,
            logger,
        );

        dispatcher.dispatch(
            1,
            InstanceSnapshot {
                instance_id: 42,
                workflow_name: "demo".to_owned(),
                status: InstanceStatus::Terminated,
                errors: 0,
            },
        );

        // Nothing to assert beyond "does not panic / does not block".
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
