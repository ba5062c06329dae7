//! API route definitions.

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

use crate::handlers;
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/runs", post(handlers::create_run))
        .route("/runs/{id}", get(handlers::get_run))
        .route("/jobs/lease", post(handlers::lease_job))
        .route("/jobs/{id}", get(handlers::get_job))
        .route("/jobs/{id}/complete", post(handlers::complete_job))
        .route("/health", get(handlers::health))
        .with_state(state)
}
