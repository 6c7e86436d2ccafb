//! Database query functions for the `t_user` table.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Insert or update a user with a pre-hashed password.
pub async fn upsert_user(
    pool: &PgPool,
    login: &str,
    password_hash: &str,
    profile: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO t_user (user_login, user_password, user_profile) VALUES ($1, $2, $3) \
         ON CONFLICT (user_login) DO UPDATE \
         SET user_password = EXCLUDED.user_password, user_profile = EXCLUDED.user_profile",
    )
    .bind(login)
    .bind(password_hash)
    .bind(profile)
    .execute(pool)
    .await
    .context("failed to upsert user")?;

    Ok(())
}

/// Fetch a user's stored password hash.
pub async fn get_password_hash(pool: &PgPool, login: &str) -> Result<Option<String>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT user_password FROM t_user WHERE user_login = $1")
            .bind(login)
            .fetch_optional(pool)
            .await
            .context("failed to fetch user")?;

    Ok(row.map(|(hash,)| hash))
}
