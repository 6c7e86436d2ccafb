//! Bounded purge queries for the garbage collector.
//!
//! Every delete is limited to a batch of rows selected by an id-bounded
//! subquery so a purge tick never turns into a full table scan holding
//! locks.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

/// Delete up to `limit` terminated instances older than `cutoff`, together
/// with their parameters and tags. Returns the number of instances removed.
pub async fn purge_instances(pool: &PgPool, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
    let ids: Vec<(i64,)> = sqlx::query_as(
        "SELECT workflow_instance_id FROM t_workflow_instance \
         WHERE workflow_instance_status != 'EXECUTING' \
           AND workflow_instance_end < $1 \
         ORDER BY workflow_instance_id LIMIT $2",
    )
    .bind(cutoff)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to select purgeable instances")?;

    if ids.is_empty() {
        return Ok(0);
    }

    let ids: Vec<i64> = ids.into_iter().map(|(id,)| id).collect();

    let mut tx = pool.begin().await.context("failed to begin purge transaction")?;

    sqlx::query("DELETE FROM t_workflow_instance_parameters WHERE workflow_instance_id = ANY($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .context("failed to purge instance parameters")?;

    sqlx::query("DELETE FROM t_workflow_instance_tag WHERE workflow_instance_id = ANY($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .context("failed to purge instance tags")?;

    let removed = sqlx::query("DELETE FROM t_workflow_instance WHERE workflow_instance_id = ANY($1)")
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .context("failed to purge instances")?
        .rows_affected();

    tx.commit().await.context("failed to commit purge")?;
    Ok(removed)
}

/// Delete up to `limit` engine log rows older than `cutoff`.
pub async fn purge_engine_logs(pool: &PgPool, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
    purge_by_timestamp(pool, "t_log", "log_id", "log_timestamp", cutoff, limit).await
}

/// Delete up to `limit` API log rows older than `cutoff`.
pub async fn purge_api_logs(pool: &PgPool, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
    purge_by_timestamp(
        pool,
        "t_log_api",
        "log_api_id",
        "log_api_timestamp",
        cutoff,
        limit,
    )
    .await
}

/// Delete up to `limit` notification log rows older than `cutoff`.
pub async fn purge_notification_logs(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<u64> {
    purge_by_timestamp(
        pool,
        "t_log_notifications",
        "log_notifications_id",
        "log_notifications_timestamp",
        cutoff,
        limit,
    )
    .await
}

/// Delete up to `limit` unique-action markers older than `cutoff`.
pub async fn purge_unique_actions(pool: &PgPool, cutoff: DateTime<Utc>, limit: i64) -> Result<u64> {
    purge_by_timestamp(
        pool,
        "t_uniqueaction",
        "uniqueaction_id",
        "uniqueaction_time",
        cutoff,
        limit,
    )
    .await
}

/// Shared bounded delete: remove up to `limit` rows of `table` whose
/// `ts_column` predates `cutoff`. Table and column names are compile-time
/// constants supplied by the wrappers above, never user input.
async fn purge_by_timestamp(
    pool: &PgPool,
    table: &str,
    id_column: &str,
    ts_column: &str,
    cutoff: DateTime<Utc>,
    limit: i64,
) -> Result<u64> {
    let sql = format!(
        "DELETE FROM {table} WHERE {id_column} IN \
         (SELECT {id_column} FROM {table} WHERE {ts_column} < $1 \
          ORDER BY {id_column} LIMIT $2)"
    );

    let removed = sqlx::query(&sql)
        .bind(cutoff)
        .bind(limit)
        .execute(pool)
        .await
        .with_context(|| format!("failed to purge {table}"))?
        .rows_affected();

    Ok(removed)
}
