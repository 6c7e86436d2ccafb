//! `weft serve`: run a full engine node with the HTTP API attached.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use weft_core::runtime::Runtime;
use weft_core::storage::PgInstanceStore;
use weft_db::pool as db_pool;

use crate::api::{self, ApiState};
use crate::config::WeftConfig;

pub async fn run_serve(config: &WeftConfig) -> Result<()> {
    let pool = db_pool::create_pool(&config.db_config).await?;

    let store = Arc::new(PgInstanceStore::new(pool.clone()));
    let runtime = Arc::new(
        Runtime::start(
            config.runtime_config(),
            store as Arc<dyn weft_core::storage::InstanceStore>,
            Some(pool.clone()),
        )
        .await?,
    );

    let state = ApiState::new(Arc::clone(&runtime), pool.clone());
    let router = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.api_bind)
        .await
        .with_context(|| format!("failed to bind API listener on {}", config.api_bind))?;
    info!(bind = %config.api_bind, node = %config.node_name, "weft node serving");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("API server failed")?;

    // The API is down; drain the engine before exiting.
    match Arc::try_unwrap(runtime) {
        Ok(runtime) => runtime.shutdown().await,
        Err(runtime) => {
            // A handler still holds a reference; the grace logic inside the
            // engine is all we can run.
            runtime
                .engine
                .shutdown(std::time::Duration::from_secs(30))
                .await;
            runtime.process.drain().await;
        }
    }

    pool.close().await;
    Ok(())
}
