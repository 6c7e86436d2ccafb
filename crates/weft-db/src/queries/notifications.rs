//! Database query functions for `t_notification` and `t_notification_type`.

use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::{NotificationRow, NotificationTypeRow};

/// Fetch a notification by id.
pub async fn get_notification(pool: &PgPool, id: i64) -> Result<Option<NotificationRow>> {
    let row = sqlx::query_as::<_, NotificationRow>(
        "SELECT * FROM t_notification WHERE notification_id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch notification")?;

    Ok(row)
}

/// List all notifications.
pub async fn list_notifications(pool: &PgPool) -> Result<Vec<NotificationRow>> {
    let rows =
        sqlx::query_as::<_, NotificationRow>("SELECT * FROM t_notification ORDER BY notification_id")
            .fetch_all(pool)
            .await
            .context("failed to list notifications")?;

    Ok(rows)
}

/// Notifications flagged `subscribe_all` (attached to every new workflow).
pub async fn list_subscribe_all(pool: &PgPool) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT notification_id FROM t_notification WHERE notification_subscribe_all",
    )
    .fetch_all(pool)
    .await
    .context("failed to list subscribe-all notifications")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Fetch a notification type by id.
pub async fn get_notification_type(pool: &PgPool, id: i64) -> Result<Option<NotificationTypeRow>> {
    let row = sqlx::query_as::<_, NotificationTypeRow>(
        "SELECT * FROM t_notification_type WHERE notification_type_id = $1",
    )
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch notification type")?;

    Ok(row)
}

/// Insert a notification definition. Returns the generated id.
pub async fn insert_notification(
    pool: &PgPool,
    type_id: i64,
    name: &str,
    subscribe_all: bool,
    parameters: &str,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO t_notification \
           (notification_type_id, notification_name, notification_subscribe_all, \
            notification_parameters) \
         VALUES ($1, $2, $3, $4) RETURNING notification_id",
    )
    .bind(type_id)
    .bind(name)
    .bind(subscribe_all)
    .bind(parameters)
    .fetch_one(pool)
    .await
    .context("failed to insert notification")?;

    Ok(id)
}
