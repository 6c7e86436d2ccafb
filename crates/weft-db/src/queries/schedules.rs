//! Database query functions for retry schedules (`t_schedule`) and
//! recurring workflow launches (`t_workflow_schedule`).

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{RetryScheduleRow, WorkflowScheduleRow};

/// List all retry schedule definitions.
pub async fn list_retry_schedules(pool: &PgPool) -> Result<Vec<RetryScheduleRow>> {
    let rows = sqlx::query_as::<_, RetryScheduleRow>("SELECT * FROM t_schedule ORDER BY schedule_name")
        .fetch_all(pool)
        .await
        .context("failed to list retry schedules")?;

    Ok(rows)
}

/// Insert a retry schedule. Returns the generated id.
pub async fn insert_retry_schedule(pool: &PgPool, name: &str, xml: &str) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO t_schedule (schedule_name, schedule_xml) VALUES ($1, $2) \
         RETURNING schedule_id",
    )
    .bind(name)
    .bind(xml)
    .fetch_one(pool)
    .await
    .context("failed to insert retry schedule")?;

    Ok(id)
}

/// List all workflow schedules.
pub async fn list_workflow_schedules(pool: &PgPool) -> Result<Vec<WorkflowScheduleRow>> {
    let rows = sqlx::query_as::<_, WorkflowScheduleRow>(
        "SELECT * FROM t_workflow_schedule ORDER BY workflow_schedule_id",
    )
    .fetch_all(pool)
    .await
    .context("failed to list workflow schedules")?;

    Ok(rows)
}

/// Parameters bound to a workflow schedule.
pub async fn get_schedule_parameters(
    pool: &PgPool,
    schedule_id: i64,
) -> Result<Vec<(String, String)>> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        "SELECT workflow_schedule_parameter, workflow_schedule_parameter_value \
         FROM t_workflow_schedule_parameters WHERE workflow_schedule_id = $1",
    )
    .bind(schedule_id)
    .fetch_all(pool)
    .await
    .context("failed to get schedule parameters")?;

    Ok(rows)
}

/// Flip a schedule's active flag (SUSPEND-on-failure, operator reactivation).
pub async fn set_schedule_active(pool: &PgPool, schedule_id: i64, active: bool) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE t_workflow_schedule SET workflow_schedule_active = $1 \
         WHERE workflow_schedule_id = $2",
    )
    .bind(active)
    .bind(schedule_id)
    .execute(pool)
    .await
    .context("failed to update schedule active flag")?;

    Ok(result.rows_affected())
}
