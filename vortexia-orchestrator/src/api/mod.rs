//! API Module
//!
//! HTTP API layer for the orchestrator. A thin adapter over the engine's
//! trigger API; every handler delegates to the [`Scheduler`].

pub mod build;
pub mod error;
pub mod health;

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;
use vortexia_engine::Scheduler;

/// Create the main API router with all endpoints
pub fn create_router(scheduler: Scheduler) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Build endpoints
        .route("/build/trigger", post(build::trigger_build))
        .route("/build/list", get(build::list_builds))
        .route("/build/{id}", get(build::get_build))
        .route("/build/{id}/cancel", post(build::cancel_build))
        .route("/build/{id}/logs", get(build::get_build_logs))
        .route("/build/{id}/logs/stream", get(build::stream_build_logs))
        .route(
            "/build/pipeline/{pipeline_id}",
            get(build::list_builds_by_pipeline),
        )
        // Add state and middleware
        .with_state(scheduler)
        .layer(TraceLayer::new_for_http())
}
