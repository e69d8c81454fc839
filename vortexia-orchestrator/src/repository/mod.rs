//! Repository Module
//!
//! Data access layer for the orchestrator. Each submodule handles database
//! operations for one table; [`PgStore`] exposes them to the engine through
//! its persistence traits.

pub mod build;
pub mod log;
pub mod pipeline;
pub mod step;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;
use vortexia_core::domain::build::{Build, BuildStep};
use vortexia_core::domain::log::LogChunk;
use vortexia_core::domain::pipeline::Pipeline;
use vortexia_core::dto::build::Page;
use vortexia_engine::repository::{PersistenceGateway, PipelineSource, Result};
use vortexia_engine::GatewayError;

// Re-export for convenience
pub use build as build_repository;
pub use log as log_repository;
pub use pipeline as pipeline_repository;
pub use step as step_repository;

/// Postgres implementation of the engine's storage traits
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistenceGateway for PgStore {
    async fn create_build(&self, build: &Build, steps: &[BuildStep]) -> Result<()> {
        build_repository::create_with_steps(&self.pool, build, steps)
            .await
            .map_err(gateway_error)
    }

    async fn update_build(&self, build: &Build) -> Result<()> {
        let updated = build_repository::update_status(&self.pool, build)
            .await
            .map_err(gateway_error)?;

        if !updated {
            return Err(GatewayError::Missing(format!("build {}", build.id)));
        }
        Ok(())
    }

    async fn update_step(&self, step: &BuildStep) -> Result<()> {
        let updated = step_repository::update_status(&self.pool, step)
            .await
            .map_err(gateway_error)?;

        if !updated {
            return Err(GatewayError::Missing(format!("step {}", step.id)));
        }
        Ok(())
    }

    async fn append_log(&self, chunk: &LogChunk) -> Result<()> {
        let appended = log_repository::append(&self.pool, chunk)
            .await
            .map_err(gateway_error)?;

        if !appended {
            return Err(GatewayError::Missing(format!("step {}", chunk.step_id)));
        }
        Ok(())
    }

    async fn get_logs(&self, build_id: Uuid, from_seq: u64) -> Result<Vec<LogChunk>> {
        log_repository::find_by_build(&self.pool, build_id, from_seq)
            .await
            .map_err(gateway_error)?
            .into_iter()
            .map(LogChunk::try_from)
            .collect()
    }

    async fn get_build(&self, build_id: Uuid) -> Result<Option<Build>> {
        build_repository::find_by_id(&self.pool, build_id)
            .await
            .map_err(gateway_error)?
            .map(Build::try_from)
            .transpose()
    }

    async fn get_steps_by_build(&self, build_id: Uuid) -> Result<Vec<BuildStep>> {
        step_repository::find_by_build(&self.pool, build_id)
            .await
            .map_err(gateway_error)?
            .into_iter()
            .map(BuildStep::try_from)
            .collect()
    }

    async fn list_by_pipeline(
        &self,
        pipeline_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Page<Build>> {
        let total = build_repository::count_by_pipeline(&self.pool, pipeline_id)
            .await
            .map_err(gateway_error)?;

        let items = build_repository::find_by_pipeline(&self.pool, pipeline_id, offset, limit)
            .await
            .map_err(gateway_error)?
            .into_iter()
            .map(Build::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            offset,
            limit,
        })
    }

    async fn list_all(&self, offset: u64, limit: u64) -> Result<Page<Build>> {
        let total = build_repository::count_all(&self.pool)
            .await
            .map_err(gateway_error)?;

        let items = build_repository::find_all(&self.pool, offset, limit)
            .await
            .map_err(gateway_error)?
            .into_iter()
            .map(Build::try_from)
            .collect::<Result<Vec<_>>>()?;

        Ok(Page {
            items,
            total: total.max(0) as u64,
            offset,
            limit,
        })
    }

    async fn count_active_builds(&self, pipeline_id: Uuid) -> Result<usize> {
        let count = build_repository::count_active(&self.pool, pipeline_id)
            .await
            .map_err(gateway_error)?;

        Ok(count.max(0) as usize)
    }

    async fn list_active_builds(&self) -> Result<Vec<Build>> {
        build_repository::find_active(&self.pool)
            .await
            .map_err(gateway_error)?
            .into_iter()
            .map(Build::try_from)
            .collect()
    }
}

#[async_trait]
impl PipelineSource for PgStore {
    async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Pipeline>> {
        pipeline_repository::find_by_id(&self.pool, pipeline_id)
            .await
            .map_err(gateway_error)
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Connection-level failures are reported as unavailability, everything else as a backend error
fn gateway_error(err: sqlx::Error) -> GatewayError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            GatewayError::Unavailable(err.to_string())
        }
        other => GatewayError::backend(other),
    }
}
