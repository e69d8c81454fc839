//! Engine error types
//!
//! Only errors raised before a build exists, or while reading state, reach the
//! caller. Failures during step execution are recorded on the build instead.

use thiserror::Error;
use uuid::Uuid;
use vortexia_core::resolver::ConfigError;
use vortexia_core::state::TransitionError;

use crate::repository::GatewayError;

/// Errors returned by the trigger API
#[derive(Debug, Error)]
pub enum EngineError {
    /// The pipeline configuration could not be resolved
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("pipeline {0} not found")]
    PipelineNotFound(Uuid),

    #[error("pipeline {0} is not active")]
    PipelineInactive(Uuid),

    #[error("build {0} not found")]
    BuildNotFound(Uuid),

    /// Admission rejected: the pipeline already has `limit` active builds
    #[error("pipeline {pipeline_id} already has {active} active build(s) (limit {limit})")]
    ConcurrencyLimit {
        pipeline_id: Uuid,
        active: usize,
        limit: usize,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error(transparent)]
    Persistence(#[from] GatewayError),
}

impl EngineError {
    /// Whether the error names an unknown or unusable resource
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::PipelineNotFound(_) | Self::PipelineInactive(_) | Self::BuildNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
