//! Database query functions for the `t_queue` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::QueueRow;

/// List all queue definitions, ordered by name.
pub async fn list_queues(pool: &PgPool) -> Result<Vec<QueueRow>> {
    let rows = sqlx::query_as::<_, QueueRow>("SELECT * FROM t_queue ORDER BY queue_name")
        .fetch_all(pool)
        .await
        .context("failed to list queues")?;

    Ok(rows)
}

/// Insert a queue definition. Returns the generated id.
pub async fn insert_queue(
    pool: &PgPool,
    name: &str,
    concurrency: i32,
    scheduler: &str,
    dynamic: bool,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO t_queue (queue_name, queue_concurrency, queue_scheduler, queue_dynamic) \
         VALUES ($1, $2, $3, $4) RETURNING queue_id",
    )
    .bind(name)
    .bind(concurrency)
    .bind(scheduler)
    .bind(dynamic)
    .fetch_one(pool)
    .await
    .context("failed to insert queue")?;

    Ok(id)
}

/// Delete a queue by id. Returns the number of rows removed.
pub async fn delete_queue(pool: &PgPool, id: i64) -> Result<u64> {
    let result = sqlx::query("DELETE FROM t_queue WHERE queue_id = $1")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete queue")?;

    Ok(result.rows_affected())
}
