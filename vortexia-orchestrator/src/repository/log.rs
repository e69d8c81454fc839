//! Log Repository
//!
//! Handles all database operations related to build output. Chunks are only
//! ever inserted; a step's output is the concatenation of its chunks.

use sqlx::PgPool;
use std::borrow::Cow;
use uuid::Uuid;
use vortexia_core::domain::log::LogChunk;
use vortexia_engine::GatewayError;

/// Append a chunk to the build log
///
/// Returns false if the step does not belong to the build; nothing is
/// written then.
pub async fn append(pool: &PgPool, chunk: &LogChunk) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO build_logs (build_id, seq, step_id, stream, timestamp, data)
        SELECT $1, $2, $3, $4, $5, $6
        WHERE EXISTS (SELECT 1 FROM build_steps WHERE id = $3 AND build_id = $1)
        "#,
    )
    .bind(chunk.build_id)
    .bind(chunk.seq as i64)
    .bind(chunk.step_id)
    .bind(chunk.stream.as_str())
    .bind(chunk.timestamp)
    .bind(storable(&chunk.data))
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Get the chunks of a build from a sequence number on
pub async fn find_by_build(
    pool: &PgPool,
    build_id: Uuid,
    from_seq: u64,
) -> Result<Vec<LogRow>, sqlx::Error> {
    sqlx::query_as::<_, LogRow>(
        r#"
        SELECT build_id, seq, step_id, stream, timestamp, data
        FROM build_logs
        WHERE build_id = $1 AND seq >= $2
        ORDER BY seq ASC
        "#,
    )
    .bind(build_id)
    .bind(from_seq as i64)
    .fetch_all(pool)
    .await
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
pub struct LogRow {
    build_id: Uuid,
    seq: i64,
    step_id: Uuid,
    stream: String,
    timestamp: chrono::DateTime<chrono::Utc>,
    data: String,
}

impl TryFrom<LogRow> for LogChunk {
    type Error = GatewayError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        Ok(LogChunk {
            build_id: row.build_id,
            seq: u64::try_from(row.seq)
                .map_err(|_| GatewayError::Invalid(format!("negative sequence {}", row.seq)))?,
            step_id: row.step_id,
            stream: row.stream.parse().map_err(GatewayError::Invalid)?,
            timestamp: row.timestamp,
            data: row.data,
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// TEXT columns cannot hold NUL
fn storable(data: &str) -> Cow<'_, str> {
    if data.contains('\0') {
        Cow::Owned(data.replace('\0', "\u{FFFD}"))
    } else {
        Cow::Borrowed(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storable_strips_nul() {
        assert_eq!(storable("a\0b"), "a\u{FFFD}b");
        assert!(matches!(storable("plain\n"), Cow::Borrowed("plain\n")));
    }
}
