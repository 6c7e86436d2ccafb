//! Database query functions for the `t_workflow` and
//! `t_workflow_notification` tables.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::WorkflowRow;

/// Insert a new workflow template. Returns the generated id.
pub async fn insert_workflow(
    pool: &PgPool,
    name: &str,
    xml: &str,
    group: &str,
    comment: &str,
    lastcommit: Option<&str>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO t_workflow \
           (workflow_name, workflow_xml, workflow_group, workflow_comment, workflow_lastcommit) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING workflow_id",
    )
    .bind(name)
    .bind(xml)
    .bind(group)
    .bind(comment)
    .bind(lastcommit)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow")?;

    Ok(id)
}

/// Fetch a workflow by id.
pub async fn get_workflow(pool: &PgPool, id: i64) -> Result<Option<WorkflowRow>> {
    let row = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM t_workflow WHERE workflow_id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow")?;

    Ok(row)
}

/// Fetch a workflow by name.
pub async fn get_workflow_by_name(pool: &PgPool, name: &str) -> Result<Option<WorkflowRow>> {
    let row = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM t_workflow WHERE workflow_name = $1")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow by name")?;

    Ok(row)
}

/// Count workflows carrying a name (existence check for creation).
pub async fn workflow_name_exists(pool: &PgPool, name: &str) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM t_workflow WHERE workflow_name = $1")
            .bind(name)
            .fetch_one(pool)
            .await
            .context("failed to count workflows by name")?;

    Ok(count > 0)
}

/// List all workflow templates, ordered by name.
pub async fn list_workflows(pool: &PgPool) -> Result<Vec<WorkflowRow>> {
    let rows = sqlx::query_as::<_, WorkflowRow>("SELECT * FROM t_workflow ORDER BY workflow_name")
        .fetch_all(pool)
        .await
        .context("failed to list workflows")?;

    Ok(rows)
}

/// Update a workflow template in place.
pub async fn update_workflow(
    pool: &PgPool,
    id: i64,
    name: &str,
    xml: &str,
    group: &str,
    comment: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE t_workflow \
         SET workflow_name = $1, workflow_xml = $2, workflow_group = $3, workflow_comment = $4 \
         WHERE workflow_id = $5",
    )
    .bind(name)
    .bind(xml)
    .bind(group)
    .bind(comment)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update workflow")?;

    Ok(result.rows_affected())
}

/// Delete a workflow and its dependent rows (notification subscriptions,
/// schedules) in one transaction. Returns false when the workflow did not
/// exist.
pub async fn delete_workflow(pool: &PgPool, id: i64) -> Result<bool> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let deleted = sqlx::query("DELETE FROM t_workflow WHERE workflow_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to delete workflow")?
        .rows_affected();

    if deleted == 0 {
        tx.rollback().await.ok();
        return Ok(false);
    }

    sqlx::query("DELETE FROM t_workflow_notification WHERE workflow_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to delete workflow notifications")?;

    sqlx::query("DELETE FROM t_workflow_schedule WHERE workflow_id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await
        .context("failed to delete workflow schedules")?;

    tx.commit().await.context("failed to commit deletion")?;
    Ok(true)
}

/// List the notification ids a workflow is subscribed to.
pub async fn list_workflow_notifications(pool: &PgPool, workflow_id: i64) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT notification_id FROM t_workflow_notification \
         WHERE workflow_id = $1 ORDER BY notification_id",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflow notifications")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Subscribe a workflow to a notification. Idempotent.
pub async fn subscribe_notification(
    pool: &PgPool,
    workflow_id: i64,
    notification_id: i64,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO t_workflow_notification (workflow_id, notification_id) \
         VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(workflow_id)
    .bind(notification_id)
    .execute(pool)
    .await
    .context("failed to subscribe notification")?;

    Ok(())
}

/// Unsubscribe a workflow from a notification. Returns the number of rows
/// removed (0 when there was no subscription).
pub async fn unsubscribe_notification(
    pool: &PgPool,
    workflow_id: i64,
    notification_id: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "DELETE FROM t_workflow_notification WHERE workflow_id = $1 AND notification_id = $2",
    )
    .bind(workflow_id)
    .bind(notification_id)
    .execute(pool)
    .await
    .context("failed to unsubscribe notification")?;

    Ok(result.rows_affected())
}

/// Remove all notification subscriptions of a workflow.
pub async fn clear_notifications(pool: &PgPool, workflow_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM t_workflow_notification WHERE workflow_id = $1")
        .bind(workflow_id)
        .execute(pool)
        .await
        .context("failed to clear workflow notifications")?;

    Ok(())
}
