//! Build output domain types

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A piece of step output
///
/// `seq` is assigned per build, starting at 0 with no gaps, and defines the
/// order chunks are persisted and delivered in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    pub build_id: Uuid,
    pub step_id: Uuid,
    pub seq: u64,
    pub stream: OutputStream,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub data: String,
}

/// Origin of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Lines written by the engine itself (step banners, termination notices)
    System,
}

impl OutputStream {
    pub fn as_str(self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
            OutputStream::System => "system",
        }
    }
}

impl std::str::FromStr for OutputStream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(OutputStream::Stdout),
            "stderr" => Ok(OutputStream::Stderr),
            "system" => Ok(OutputStream::System),
            other => Err(format!("unknown output stream '{}'", other)),
        }
    }
}
