//! Database query functions for the `t_workflow_instance` family.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{InstanceRow, InstanceStatus};

/// Fields for a freshly launched instance.
#[derive(Debug, Clone)]
pub struct NewInstance<'a> {
    pub node_name: &'a str,
    pub workflow_id: i64,
    pub workflow_schedule_id: Option<i64>,
    pub host: Option<&'a str>,
}

/// Insert an instance row in `EXECUTING` state. Returns the generated id.
pub async fn insert_instance(pool: &PgPool, new: &NewInstance<'_>) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO t_workflow_instance \
           (node_name, workflow_id, workflow_schedule_id, workflow_instance_host, \
            workflow_instance_status) \
         VALUES ($1, $2, $3, $4, 'EXECUTING') \
         RETURNING workflow_instance_id",
    )
    .bind(new.node_name)
    .bind(new.workflow_id)
    .bind(new.workflow_schedule_id)
    .bind(new.host)
    .fetch_one(pool)
    .await
    .context("failed to insert workflow instance")?;

    Ok(id)
}

/// Record the launch parameters of an instance.
pub async fn insert_instance_parameters(
    pool: &PgPool,
    instance_id: i64,
    parameters: &[(String, String)],
) -> Result<()> {
    for (name, value) in parameters {
        sqlx::query(
            "INSERT INTO t_workflow_instance_parameters \
               (workflow_instance_id, workflow_instance_parameter, \
                workflow_instance_parameter_value) \
             VALUES ($1, $2, $3)",
        )
        .bind(instance_id)
        .bind(name)
        .bind(value)
        .execute(pool)
        .await
        .context("failed to insert instance parameter")?;
    }

    Ok(())
}

/// Persist a savepoint snapshot with the current status and error count.
/// `end` is set only on terminal transitions.
pub async fn save_savepoint(
    pool: &PgPool,
    instance_id: i64,
    savepoint: &str,
    status: InstanceStatus,
    errors: i32,
    end: Option<DateTime<Utc>>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE t_workflow_instance \
         SET workflow_instance_savepoint = $1, workflow_instance_status = $2, \
             workflow_instance_errors = $3, workflow_instance_end = COALESCE($4, workflow_instance_end) \
         WHERE workflow_instance_id = $5",
    )
    .bind(savepoint)
    .bind(status)
    .bind(errors)
    .bind(end)
    .bind(instance_id)
    .execute(pool)
    .await
    .context("failed to save instance savepoint")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("workflow instance {instance_id} not found");
    }

    Ok(())
}

/// Fetch a single instance by id.
pub async fn get_instance(pool: &PgPool, id: i64) -> Result<Option<InstanceRow>> {
    let row = sqlx::query_as::<_, InstanceRow>(
        "SELECT * FROM t_workflow_instance WHERE workflow_instance_id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch instance")?;

    Ok(row)
}

/// List recent instances, newest first.
pub async fn list_instances(pool: &PgPool, limit: i64) -> Result<Vec<InstanceRow>> {
    let rows = sqlx::query_as::<_, InstanceRow>(
        "SELECT * FROM t_workflow_instance \
         ORDER BY workflow_instance_id DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to list instances")?;

    Ok(rows)
}

/// Instances of this node still marked `EXECUTING` -- candidates for
/// savepoint recovery after a restart.
pub async fn list_recoverable(pool: &PgPool, node_name: &str) -> Result<Vec<InstanceRow>> {
    let rows = sqlx::query_as::<_, InstanceRow>(
        "SELECT * FROM t_workflow_instance \
         WHERE node_name = $1 AND workflow_instance_status = 'EXECUTING' \
           AND workflow_instance_savepoint IS NOT NULL \
         ORDER BY workflow_instance_id",
    )
    .bind(node_name)
    .fetch_all(pool)
    .await
    .context("failed to list recoverable instances")?;

    Ok(rows)
}
