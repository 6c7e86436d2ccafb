//! Database query functions for the log tables.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Insert an engine log line into `t_log`.
pub async fn insert_engine_log(
    pool: &PgPool,
    node_name: &str,
    level: i32,
    message: &str,
) -> Result<()> {
    sqlx::query("INSERT INTO t_log (node_name, log_level, log_message) VALUES ($1, $2, $3)")
        .bind(node_name)
        .bind(level)
        .bind(message)
        .execute(pool)
        .await
        .context("failed to insert engine log")?;

    Ok(())
}

/// Insert an API action audit line into `t_log_api`.
pub async fn insert_api_log(
    pool: &PgPool,
    node_name: &str,
    user_login: &str,
    object_id: i64,
    object_type: &str,
    action: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO t_log_api \
           (node_name, user_login, log_api_object_id, log_api_object_type, log_api_action) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(node_name)
    .bind(user_login)
    .bind(object_id)
    .bind(object_type)
    .bind(action)
    .execute(pool)
    .await
    .context("failed to insert api log")?;

    Ok(())
}

/// Insert a notification plugin outcome into `t_log_notifications`.
pub async fn insert_notification_log(
    pool: &PgPool,
    node_name: &str,
    pid: i32,
    message: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO t_log_notifications \
           (node_name, log_notifications_pid, log_notifications_message) \
         VALUES ($1, $2, $3)",
    )
    .bind(node_name)
    .bind(pid)
    .bind(message)
    .execute(pool)
    .await
    .context("failed to insert notification log")?;

    Ok(())
}
