//! Shared test utilities for weft integration tests.
//!
//! Provides a PostgreSQL instance shared across tests. Each test gets its
//! own database within the instance.
//!
//! Two modes:
//! - **`WEFT_TEST_PG_URL`** set (CI setup script): use the external
//!   server directly. No testcontainers overhead per process.
//! - **No env var** (`cargo test`): spin up a container via
//!   testcontainers, shared per binary through a `OnceCell`.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use weft_db::pool;

/// Shared container state: base URL and optional container handle (kept
/// alive for the process lifetime).
struct SharedPg {
    base_url: String,
    /// Held to keep the container alive. `None` when using an external URL.
    _container: Option<ContainerAsync<Postgres>>,
}

static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    if let Ok(url) = std::env::var("WEFT_TEST_PG_URL") {
        return SharedPg {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("16")
        .start()
        .await
        .expect("failed to start PostgreSQL container");

    let host = container.get_host().await.expect("failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    let base_url = format!("postgresql://postgres:postgres@{host}:{port}");

    SharedPg {
        base_url,
        _container: Some(container),
    }
}

/// Base URL for the shared PostgreSQL (server root, no database name).
pub async fn pg_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

/// Create a temporary database with migrations applied.
///
/// Returns `(pool, db_name)`. Call [`drop_test_db`] with the returned name
/// when the test is done.
pub async fn create_test_db() -> (PgPool, String) {
    let base_url = pg_url().await;

    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&format!("{base_url}/postgres"))
        .await
        .expect("failed to connect to postgres database");

    let db_name = format!("weft_test_{}", Uuid::new_v4().simple());
    admin_pool
        .execute(format!("CREATE DATABASE {db_name}").as_str())
        .await
        .expect("failed to create test database");
    admin_pool.close().await;

    let test_pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&format!("{base_url}/{db_name}"))
        .await
        .expect("failed to connect to test database");

    pool::run_migrations(&test_pool, pool::default_migrations_path())
        .await
        .expect("failed to run migrations");

    (test_pool, db_name)
}

/// Drop a temporary database created by [`create_test_db`].
pub async fn drop_test_db(db_name: &str) {
    let base_url = pg_url().await;

    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&format!("{base_url}/postgres"))
        .await
        .expect("failed to connect to postgres database");

    let _ = admin_pool
        .execute(format!("DROP DATABASE IF EXISTS {db_name} WITH (FORCE)").as_str())
        .await;
    admin_pool.close().await;
}
