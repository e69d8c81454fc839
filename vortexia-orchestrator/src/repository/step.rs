//! Build Step Repository
//!
//! Handles all database operations related to build steps. A step's output
//! is read back from the build log.

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;
use vortexia_core::domain::build::BuildStep;
use vortexia_engine::GatewayError;

/// Insert a step as part of a build's creation
pub async fn insert(tx: &mut Transaction<'_, Postgres>, step: &BuildStep) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO build_steps (
            id, build_id, name, command, status, started_at, finished_at,
            duration, ordinal, timeout_seconds, exit_code, failure, error_message
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(step.id)
    .bind(step.build_id)
    .bind(&step.name)
    .bind(&step.command)
    .bind(step.status.as_str())
    .bind(step.started_at)
    .bind(step.finished_at)
    .bind(step.duration)
    .bind(step.ordinal as i32)
    .bind(step.timeout_seconds.map(|t| t as i64))
    .bind(step.exit_code)
    .bind(step.failure.map(|f| f.as_str()))
    .bind(&step.error_message)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Find the steps of a build, ordered by ordinal
pub async fn find_by_build(pool: &PgPool, build_id: Uuid) -> Result<Vec<StepRow>, sqlx::Error> {
    sqlx::query_as::<_, StepRow>(
        r#"
        SELECT s.id, s.build_id, s.name, s.command, s.status,
               COALESCE(
                   (SELECT string_agg(l.data, '' ORDER BY l.seq)
                    FROM build_logs l
                    WHERE l.build_id = s.build_id AND l.step_id = s.id),
                   ''
               ) AS output,
               s.started_at, s.finished_at, s.duration, s.ordinal, s.timeout_seconds,
               s.exit_code, s.failure, s.error_message
        FROM build_steps s
        WHERE s.build_id = $1
        ORDER BY s.ordinal ASC
        "#,
    )
    .bind(build_id)
    .fetch_all(pool)
    .await
}

/// Update the status fields of a step; output is left alone
pub async fn update_status(pool: &PgPool, step: &BuildStep) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE build_steps
        SET status = $1, started_at = $2, finished_at = $3, duration = $4,
            exit_code = $5, failure = $6, error_message = $7
        WHERE id = $8
        "#,
    )
    .bind(step.status.as_str())
    .bind(step.started_at)
    .bind(step.finished_at)
    .bind(step.duration)
    .bind(step.exit_code)
    .bind(step.failure.map(|f| f.as_str()))
    .bind(&step.error_message)
    .bind(step.id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
pub struct StepRow {
    id: Uuid,
    build_id: Uuid,
    name: String,
    command: String,
    status: String,
    output: String,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    finished_at: Option<chrono::DateTime<chrono::Utc>>,
    duration: Option<i64>,
    ordinal: i32,
    timeout_seconds: Option<i64>,
    exit_code: Option<i32>,
    failure: Option<String>,
    error_message: Option<String>,
}

impl TryFrom<StepRow> for BuildStep {
    type Error = GatewayError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        let status = row.status.parse().map_err(GatewayError::Invalid)?;
        let failure = row
            .failure
            .map(|f| f.parse())
            .transpose()
            .map_err(GatewayError::Invalid)?;

        Ok(BuildStep {
            id: row.id,
            build_id: row.build_id,
            name: row.name,
            command: row.command,
            status,
            output: row.output,
            started_at: row.started_at,
            finished_at: row.finished_at,
            duration: row.duration,
            ordinal: u32::try_from(row.ordinal)
                .map_err(|_| GatewayError::Invalid(format!("negative ordinal {}", row.ordinal)))?,
            timeout_seconds: row.timeout_seconds.map(|t| t.max(0) as u64),
            exit_code: row.exit_code,
            failure,
            error_message: row.error_message,
        })
    }
}
