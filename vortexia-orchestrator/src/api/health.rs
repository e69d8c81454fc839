//! Health Check API Handler

use axum::{Json, extract::State};
use serde_json::{Value, json};
use vortexia_engine::Scheduler;

/// GET /health
/// Liveness plus the number of builds this process is driving
pub async fn health_check(State(scheduler): State<Scheduler>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "running_builds": scheduler.running_builds(),
    }))
}
