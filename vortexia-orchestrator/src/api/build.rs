//! Build API Handlers
//!
//! HTTP endpoints for triggering, inspecting and canceling builds, and for
//! reading or following their output.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use uuid::Uuid;
use vortexia_core::domain::build::Build;
use vortexia_core::dto::build::{BuildDetails, BuildSummary, Page, TriggerBuild};
use vortexia_core::dto::log::{LogBatch, LogEvent};
use vortexia_engine::Scheduler;
use vortexia_engine::service::SubscriptionEnd;

use crate::api::error::ApiResult;

const DEFAULT_PAGE_SIZE: u64 = 50;
const MAX_PAGE_SIZE: u64 = 200;

// =============================================================================
// Build Lifecycle Endpoints
// =============================================================================

/// POST /build/trigger
/// Create and start a new build for a pipeline
pub async fn trigger_build(
    State(scheduler): State<Scheduler>,
    Json(req): Json<TriggerBuild>,
) -> ApiResult<(StatusCode, Json<Build>)> {
    tracing::info!(
        "Triggering build for pipeline {} on branch '{}'",
        req.pipeline_id,
        req.branch
    );

    let build = scheduler.trigger(req).await?;

    Ok((StatusCode::CREATED, Json(build)))
}

/// GET /build/{id}
/// Get a build and its steps
pub async fn get_build(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<BuildDetails>> {
    tracing::debug!("Getting build: {}", id);

    let details = scheduler.get_status(id).await?;

    Ok(Json(details))
}

/// POST /build/{id}/cancel
/// Request cancellation of a build; a no-op for finished builds
pub async fn cancel_build(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Canceling build: {}", id);

    scheduler.cancel(id).await?;

    Ok(StatusCode::ACCEPTED)
}

/// GET /build/list
/// List builds of every pipeline, newest first
///
/// Takes the same `offset` and `limit` parameters as the per-pipeline listing.
pub async fn list_builds(
    State(scheduler): State<Scheduler>,
    Query(params): Query<ListQuery>,
) -> ApiResult<Json<Page<BuildSummary>>> {
    let (offset, limit) = params.window();
    tracing::debug!("Listing builds (offset {}, limit {})", offset, limit);

    let page = scheduler.list_all_builds(offset, limit).await?;

    Ok(Json(page.map(BuildSummary::from)))
}

/// GET /build/pipeline/{pipeline_id}
/// List builds of a pipeline, newest first
///
/// Query parameters:
/// - `offset` (optional, default 0)
/// - `limit` (optional, default 50, at most 200)
pub async fn list_builds_by_pipeline(
    State(scheduler): State<Scheduler>,
    Path(pipeline_id): Path<Uuid>,
    Query(params): Query<ListQuery>,
) -> ApiResult<Json<Page<BuildSummary>>> {
    let (offset, limit) = params.window();
    tracing::debug!(
        "Listing builds for pipeline {} (offset {}, limit {})",
        pipeline_id,
        offset,
        limit
    );

    let page = scheduler.list_builds(pipeline_id, offset, limit).await?;

    Ok(Json(page.map(BuildSummary::from)))
}

// =============================================================================
// Build Output Endpoints
// =============================================================================

/// GET /build/{id}/logs
/// Get the output recorded so far
pub async fn get_build_logs(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<LogBatch>> {
    tracing::debug!("Getting logs for build: {}", id);

    let chunks = scheduler.logs(id).await?;

    Ok(Json(LogBatch {
        build_id: id,
        chunks,
    }))
}

/// GET /build/{id}/logs/stream
/// Follow a build's output as server-sent events
///
/// Replays everything recorded so far, then streams new chunks until the
/// build finishes, when a `finished` event carries the final status. A
/// watcher that falls behind gets a `disconnected` event instead.
pub async fn stream_build_logs(
    State(scheduler): State<Scheduler>,
    Path(id): Path<Uuid>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    tracing::debug!("Streaming logs for build: {}", id);

    let watch = scheduler.stream_logs(id).await?;

    let events = futures::stream::unfold(Some(watch), move |watch| {
        let scheduler = scheduler.clone();
        async move {
            let mut watch = watch?;
            match watch.next().await {
                Some(chunk) => Some((Some(LogEvent::Chunk(chunk)), Some(watch))),
                None => Some((closing_event(&scheduler, id, watch.end()).await, None)),
            }
        }
    })
    .filter_map(|event| async move { event.as_ref().and_then(to_event) })
    .map(Ok);

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Last event of a log stream, if its end is worth reporting
async fn closing_event(
    scheduler: &Scheduler,
    id: Uuid,
    end: Option<SubscriptionEnd>,
) -> Option<LogEvent> {
    match end {
        Some(SubscriptionEnd::Finished(status)) => Some(LogEvent::Finished { status }),
        Some(SubscriptionEnd::Lagged(missed)) => Some(LogEvent::Disconnected { missed }),
        Some(SubscriptionEnd::Closed) | None => match scheduler.get_status(id).await {
            Ok(details) if details.build.is_terminal() => Some(LogEvent::Finished {
                status: details.build.status,
            }),
            Ok(details) => {
                tracing::debug!(
                    "Log stream of build {} closed while {}",
                    id,
                    details.build.status
                );
                None
            }
            Err(e) => {
                tracing::warn!("Could not read final status of build {}: {}", id, e);
                None
            }
        },
    }
}

fn to_event(event: &LogEvent) -> Option<Event> {
    let name = match event {
        LogEvent::Chunk(_) => "chunk",
        LogEvent::Finished { .. } => "finished",
        LogEvent::Disconnected { .. } => "disconnected",
    };

    match Event::default().event(name).json_data(event) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::error!("Failed to encode log event: {}", e);
            None
        }
    }
}

// =============================================================================
// Query Types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
}

impl ListQuery {
    fn window(&self) -> (u64, u64) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);
        (self.offset.unwrap_or(0), limit)
    }
}
