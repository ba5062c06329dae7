//! Remote coordination plane.
//!
//! A thin HTTP queue over a relational store: clients post runs, polling
//! agents lease jobs and report completions. Agents reuse the same
//! execution engine as local runs; this service never executes anything.

pub mod handlers;
pub mod routes;
pub mod state;
pub mod store;

pub use state::{AppState, ServerConfig};
pub use store::{Database, JobRecord, JobStatus, LeasedJob};

use std::sync::Arc;
use tarmac_core::{Error, Result};
use tracing::info;

/// Open the store and serve the API until the process is stopped.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;

    let state = Arc::new(AppState::new(db, config.lease_seconds));
    let router = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| Error::Network(format!("failed to bind {}: {e}", config.bind_addr)))?;
    info!(addr = %config.bind_addr, "coordination plane listening");

    axum::serve(listener, router)
        .await
        .map_err(|e| Error::Network(format!("server error: {e}")))
}
