use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Pipelines are written by the pipeline management layer; the engine only reads them
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pipelines (
            id UUID PRIMARY KEY,
            project_id UUID NOT NULL,
            name VARCHAR(255) NOT NULL,
            config TEXT NOT NULL,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create builds table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            id UUID PRIMARY KEY,
            pipeline_id UUID NOT NULL REFERENCES pipelines(id) ON DELETE CASCADE,
            branch VARCHAR(255) NOT NULL,
            commit_sha VARCHAR(255) NOT NULL DEFAULT '',
            status VARCHAR(20) NOT NULL,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            duration BIGINT,
            triggered_by UUID NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            failure VARCHAR(40)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create build steps table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS build_steps (
            id UUID PRIMARY KEY,
            build_id UUID NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
            name VARCHAR(255) NOT NULL,
            command TEXT NOT NULL,
            status VARCHAR(20) NOT NULL,
            started_at TIMESTAMPTZ,
            finished_at TIMESTAMPTZ,
            duration BIGINT,
            ordinal INTEGER NOT NULL,
            timeout_seconds BIGINT,
            exit_code INTEGER,
            failure VARCHAR(40),
            error_message TEXT,
            UNIQUE (build_id, ordinal)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create build logs table; seq is gapless per build
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS build_logs (
            build_id UUID NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
            seq BIGINT NOT NULL,
            step_id UUID NOT NULL REFERENCES build_steps(id) ON DELETE CASCADE,
            stream VARCHAR(10) NOT NULL,
            timestamp TIMESTAMPTZ NOT NULL,
            data TEXT NOT NULL,
            PRIMARY KEY (build_id, seq)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for admission and listing queries
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_builds_pipeline_created ON builds(pipeline_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_builds_created ON builds(created_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_builds_status ON builds(status)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_build_steps_build ON build_steps(build_id, ordinal)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_build_logs_step ON build_logs(step_id, seq)")
        .execute(pool)
        .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
