//! Periodic garbage collector.
//!
//! Purges terminal instances and aged log rows in bounded batches, pausing
//! between batches so a large backlog never turns into one long lock-heavy
//! scan.

use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use weft_db::queries::gc as gc_db;

/// Retention and pacing configuration.
#[derive(Debug, Clone)]
pub struct GcConfig {
    pub enabled: bool,
    /// Time between collection cycles.
    pub interval: Duration,
    /// Pause between batches within one cycle.
    pub delay: Duration,
    /// Maximum rows removed per category per batch.
    pub limit: i64,
    pub instance_retention: Duration,
    pub logs_retention: Duration,
    pub logs_api_retention: Duration,
    pub logs_notifications_retention: Duration,
    pub unique_action_retention: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(43200),
            delay: Duration::from_secs(2),
            limit: 1000,
            instance_retention: Duration::from_secs(30 * 86400),
            logs_retention: Duration::from_secs(7 * 86400),
            logs_api_retention: Duration::from_secs(30 * 86400),
            logs_notifications_retention: Duration::from_secs(30 * 86400),
            unique_action_retention: Duration::from_secs(30 * 86400),
        }
    }
}

pub struct GarbageCollector {
    pool: PgPool,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(pool: PgPool, config: GcConfig) -> Self {
        Self { pool, config }
    }

    /// Run until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        if !self.config.enabled {
            info!("garbage collector disabled");
            return;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown.cancelled() => return,
            }

            // Keep purging while batches come back full, with a pause
            // between rounds.
            loop {
                match self.purge_once().await {
                    Ok(0) => break,
                    Ok(removed) => {
                        info!(removed, "garbage collector purged rows");
                    }
                    Err(e) => {
                        warn!(error = %e, "garbage collection cycle failed");
                        break;
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.config.delay) => {}
                    _ = shutdown.cancelled() => return,
                }
            }
        }
    }

    /// One bounded batch across every category. Returns total rows removed.
    pub async fn purge_once(&self) -> anyhow::Result<u64> {
        let now = Utc::now();
        let limit = self.config.limit;
        let mut removed = 0;

        let cutoff = now - chrono::Duration::from_std(self.config.instance_retention)?;
        removed += gc_db::purge_instances(&self.pool, cutoff, limit).await?;

        let cutoff = now - chrono::Duration::from_std(self.config.logs_retention)?;
        removed += gc_db::purge_engine_logs(&self.pool, cutoff, limit).await?;

        let cutoff = now - chrono::Duration::from_std(self.config.logs_api_retention)?;
        removed += gc_db::purge_api_logs(&self.pool, cutoff, limit).await?;

        let cutoff = now - chrono::Duration::from_std(self.config.logs_notifications_retention)?;
        removed += gc_db::purge_notification_logs(&self.pool, cutoff, limit).await?;

        let cutoff = now - chrono::Duration::from_std(self.config.unique_action_retention)?;
        removed += gc_db::purge_unique_actions(&self.pool, cutoff, limit).await?;

        Ok(removed)
    }
}
