//! Log DTOs for the trigger API

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::build::BuildStatus;
use crate::domain::log::LogChunk;

/// Persisted output of a build, in sequence order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogBatch {
    pub build_id: Uuid,
    pub chunks: Vec<LogChunk>,
}

/// Event delivered to a live log watcher
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Chunk(LogChunk),
    /// The build reached a terminal state; no more chunks follow
    Finished { status: BuildStatus },
    /// The watcher fell behind and was dropped; reconnect to catch up
    Disconnected { missed: u64 },
}
