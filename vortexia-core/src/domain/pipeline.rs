//! Pipeline domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline definition
///
/// Owned by the pipeline CRUD layer; the engine only reads it. `config` holds the
/// raw step list (YAML) that is resolved into [`StepDefinition`]s at trigger time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub config: String,
    pub is_active: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// One resolved step of a pipeline
///
/// Produced by the resolver from a pipeline's configuration. The ordinal is the
/// position in the configured list and fixes execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub command: String,
    pub ordinal: u32,
    /// Per-step time limit, overriding the engine default
    pub timeout_seconds: Option<u64>,
}
