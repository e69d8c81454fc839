//! Build Repository
//!
//! Handles all database operations related to builds. A build and its steps
//! are inserted in one transaction.

use sqlx::PgPool;
use uuid::Uuid;
use vortexia_core::domain::build::{Build, BuildStatus, BuildStep};
use vortexia_engine::GatewayError;

use super::step;

/// Insert a build together with all of its steps
pub async fn create_with_steps(
    pool: &PgPool,
    build: &Build,
    steps: &[BuildStep],
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO builds (
            id, pipeline_id, branch, commit_sha, status, started_at, finished_at,
            duration, triggered_by, created_at, failure
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(build.id)
    .bind(build.pipeline_id)
    .bind(&build.branch)
    .bind(&build.commit)
    .bind(build.status.as_str())
    .bind(build.started_at)
    .bind(build.finished_at)
    .bind(build.duration)
    .bind(build.triggered_by)
    .bind(build.created_at)
    .bind(build.failure.map(|f| f.as_str()))
    .execute(&mut *tx)
    .await?;

    for s in steps {
        step::insert(&mut tx, s).await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Find a build by ID
pub async fn find_by_id(pool: &PgPool, id: Uuid) -> Result<Option<BuildRow>, sqlx::Error> {
    sqlx::query_as::<_, BuildRow>(
        r#"
        SELECT id, pipeline_id, branch, commit_sha, status, started_at, finished_at,
               duration, triggered_by, created_at, failure
        FROM builds
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await
}

/// Find builds by pipeline ID, newest first
pub async fn find_by_pipeline(
    pool: &PgPool,
    pipeline_id: Uuid,
    offset: u64,
    limit: u64,
) -> Result<Vec<BuildRow>, sqlx::Error> {
    sqlx::query_as::<_, BuildRow>(
        r#"
        SELECT id, pipeline_id, branch, commit_sha, status, started_at, finished_at,
               duration, triggered_by, created_at, failure
        FROM builds
        WHERE pipeline_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3
        "#,
    )
    .bind(pipeline_id)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await
}

/// Find builds of every pipeline, newest first
pub async fn find_all(pool: &PgPool, offset: u64, limit: u64) -> Result<Vec<BuildRow>, sqlx::Error> {
    sqlx::query_as::<_, BuildRow>(
        r#"
        SELECT id, pipeline_id, branch, commit_sha, status, started_at, finished_at,
               duration, triggered_by, created_at, failure
        FROM builds
        ORDER BY created_at DESC
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await
}

/// Count builds across pipelines
pub async fn count_all(pool: &PgPool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM builds")
        .fetch_one(pool)
        .await?;

    Ok(row.0)
}

/// Count builds of a pipeline
pub async fn count_by_pipeline(pool: &PgPool, pipeline_id: Uuid) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM builds WHERE pipeline_id = $1")
        .bind(pipeline_id)
        .fetch_one(pool)
        .await?;

    Ok(row.0)
}

/// Count pending or running builds of a pipeline
pub async fn count_active(pool: &PgPool, pipeline_id: Uuid) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*) FROM builds
        WHERE pipeline_id = $1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(pipeline_id)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

/// Find every pending or running build
pub async fn find_active(pool: &PgPool) -> Result<Vec<BuildRow>, sqlx::Error> {
    sqlx::query_as::<_, BuildRow>(
        r#"
        SELECT id, pipeline_id, branch, commit_sha, status, started_at, finished_at,
               duration, triggered_by, created_at, failure
        FROM builds
        WHERE status IN ('pending', 'running')
        ORDER BY created_at ASC
        "#,
    )
    .fetch_all(pool)
    .await
}

/// Update the status fields of a build
pub async fn update_status(pool: &PgPool, build: &Build) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE builds
        SET status = $1, started_at = $2, finished_at = $3, duration = $4, failure = $5
        WHERE id = $6
        "#,
    )
    .bind(build.status.as_str())
    .bind(build.started_at)
    .bind(build.finished_at)
    .bind(build.duration)
    .bind(build.failure.map(|f| f.as_str()))
    .bind(build.id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
pub struct BuildRow {
    id: Uuid,
    pipeline_id: Uuid,
    branch: String,
    commit_sha: String,
    status: String,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    duration: Option<i64>,
    triggered_by: Uuid,
    created_at: chrono::DateTime<chrono::Utc>,
    failure: Option<String>,
}

impl TryFrom<BuildRow> for Build {
    type Error = GatewayError;

    fn try_from(row: BuildRow) -> Result<Self, Self::Error> {
        let status: BuildStatus = row.status.parse().map_err(GatewayError::Invalid)?;
        let failure = row
            .failure
            .map(|f| f.parse())
            .transpose()
            .map_err(GatewayError::Invalid)?;

        Ok(Build {
            id: row.id,
            pipeline_id: row.pipeline_id,
            branch: row.branch,
            commit: row.commit_sha,
            status,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration: row.duration,
            triggered_by: row.triggered_by,
            created_at: row.created_at,
            failure,
        })
    }
}
