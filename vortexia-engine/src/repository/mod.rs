//! Repository layer
//!
//! The engine never owns storage. It reaches builds, steps, output and
//! pipelines through the traits below, which are the system of record: every
//! state transition is committed here before the engine treats it as final.
//!
//! All repositories are trait-based so the orchestrator can plug in Postgres
//! and tests can use the in-memory implementation.

mod memory;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;
use vortexia_core::domain::build::{Build, BuildStep};
use vortexia_core::domain::log::LogChunk;
use vortexia_core::domain::pipeline::Pipeline;
use vortexia_core::dto::build::Page;

pub use memory::InMemoryStore;

/// Failure reported by a storage backend
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("row not found: {0}")]
    Missing(String),

    /// A stored value could not be decoded
    #[error("invalid stored value: {0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl GatewayError {
    pub fn backend(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        GatewayError::Backend(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Durable storage for builds, build steps and build output
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Stores a build and all of its steps as one unit
    ///
    /// Either every row becomes visible or none does.
    async fn create_build(&self, build: &Build, steps: &[BuildStep]) -> Result<()>;

    /// Writes the status fields of a build (status, timestamps, duration, failure)
    async fn update_build(&self, build: &Build) -> Result<()>;

    /// Writes the status fields of a step
    ///
    /// Leaves `output` untouched; output only grows through [`append_log`](Self::append_log).
    async fn update_step(&self, step: &BuildStep) -> Result<()>;

    /// Appends one chunk to the build's log and to its step's output
    async fn append_log(&self, chunk: &LogChunk) -> Result<()>;

    /// Persisted chunks of a build with `seq >= from_seq`, in sequence order
    async fn get_logs(&self, build_id: Uuid, from_seq: u64) -> Result<Vec<LogChunk>>;

    async fn get_build(&self, build_id: Uuid) -> Result<Option<Build>>;

    /// Steps of a build ordered by ordinal
    async fn get_steps_by_build(&self, build_id: Uuid) -> Result<Vec<BuildStep>>;

    /// Builds of a pipeline, newest first
    async fn list_by_pipeline(&self, pipeline_id: Uuid, offset: u64, limit: u64)
    -> Result<Page<Build>>;

    /// Builds of every pipeline, newest first
    async fn list_all(&self, offset: u64, limit: u64) -> Result<Page<Build>>;

    /// Number of pending or running builds of a pipeline
    async fn count_active_builds(&self, pipeline_id: Uuid) -> Result<usize>;

    /// Every pending or running build, across pipelines
    async fn list_active_builds(&self) -> Result<Vec<Build>>;
}

/// Read-only access to pipeline definitions
#[async_trait]
pub trait PipelineSource: Send + Sync {
    async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Pipeline>>;
}
