//! Best-effort database log sink.
//!
//! Engine log lines always go through `tracing`; when a pool is attached
//! they are mirrored into `t_log` and a `LOG_ENGINE` event is emitted.
//! Every database failure here is swallowed: a logging problem must never
//! cascade into the engine (or into more logging).

use std::sync::Arc;

use sqlx::PgPool;

use weft_db::queries::logs as log_db;

use crate::events::{EventType, EventsBus};

/// Syslog-style levels stored in `t_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
}

pub struct DbLogger {
    pool: Option<PgPool>,
    node_name: String,
    events: Option<Arc<EventsBus>>,
}

impl DbLogger {
    pub fn new(pool: PgPool, node_name: impl Into<String>, events: Arc<EventsBus>) -> Self {
        Self {
            pool: Some(pool),
            node_name: node_name.into(),
            events: Some(events),
        }
    }

    /// A logger with no database attached; lines only reach `tracing`.
    pub fn detached(node_name: impl Into<String>) -> Self {
        Self {
            pool: None,
            node_name: node_name.into(),
            events: None,
        }
    }

    /// Record an engine log line.
    pub async fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Error => tracing::error!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            LogLevel::Notice | LogLevel::Info => tracing::info!("{message}"),
        }

        if let Some(pool) = &self.pool {
            if log_db::insert_engine_log(pool, &self.node_name, level as i32, message)
                .await
                .is_ok()
            {
                if let Some(events) = &self.events {
                    events.create(EventType::LogEngine, 0);
                }
            }
        }
    }

    /// Record a notification plugin outcome.
    pub async fn notification_log(&self, pid: i32, message: &str) {
        tracing::info!(pid, "{message}");

        if let Some(pool) = &self.pool {
            if log_db::insert_notification_log(pool, &self.node_name, pid, message)
                .await
                .is_ok()
            {
                if let Some(events) = &self.events {
                    events.create(EventType::LogNotification, 0);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_logger_never_fails() {
        let logger = DbLogger::detached("node-1");
        logger.log(LogLevel::Error, "boom").await;
        logger.notification_log(123, "plugin exited").await;
    }
}
