//! Build and build step domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::pipeline::StepDefinition;

/// One execution of a pipeline
///
/// Created by the scheduler in `Pending` state together with its steps. The
/// status is never written directly; it is derived from the steps by
/// [`crate::state::BuildState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub branch: String,
    pub commit: String,
    pub status: BuildStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Whole seconds between `started_at` and `finished_at`
    pub duration: Option<i64>,
    pub triggered_by: Uuid,
    pub created_at: DateTime<Utc>,
    /// Why the build did not succeed, once terminal
    pub failure: Option<FailureKind>,
}

impl Build {
    /// Creates a pending build for a pipeline
    pub fn new(pipeline_id: Uuid, branch: String, commit: String, triggered_by: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            branch,
            commit,
            status: BuildStatus::Pending,
            started_at: None,
            finished_at: None,
            duration: None,
            triggered_by,
            created_at: Utc::now(),
            failure: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// A single step row of a build
///
/// `name` and `command` are copied from the resolved pipeline at creation, so
/// later pipeline edits never reach a build that already exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildStep {
    pub id: Uuid,
    pub build_id: Uuid,
    pub name: String,
    pub command: String,
    pub status: StepStatus,
    /// Accumulated output; appended by the log broadcaster, never by status updates
    pub output: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration: Option<i64>,
    pub ordinal: u32,
    pub timeout_seconds: Option<u64>,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureKind>,
    pub error_message: Option<String>,
}

impl BuildStep {
    /// Creates a pending step row from a resolved definition
    pub fn pending(build_id: Uuid, definition: &StepDefinition) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            name: definition.name.clone(),
            command: definition.command.clone(),
            status: StepStatus::Pending,
            output: String::new(),
            started_at: None,
            finished_at: None,
            duration: None,
            ordinal: definition.ordinal,
            timeout_seconds: definition.timeout_seconds,
            exit_code: None,
            failure: None,
            error_message: None,
        }
    }

    /// Rebuilds the definition this step was created from
    pub fn definition(&self) -> StepDefinition {
        StepDefinition {
            name: self.name.clone(),
            command: self.command.clone(),
            ordinal: self.ordinal,
            timeout_seconds: self.timeout_seconds,
        }
    }
}

/// Build lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

impl BuildStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }

    /// Pending or running builds count against the concurrency ceiling
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown build status '{}'", other)),
        }
    }
}

/// Build step lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// Marker recorded on a failed step (and on a build that did not succeed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The command exited with a non-zero status
    ExitCode,
    /// The command could not be started or its output could not be read
    Error,
    /// The step exceeded its own time limit
    TimedOut,
    /// An operator canceled the build
    Canceled,
    /// The build exceeded its maximum duration
    DeadlineExceeded,
    /// Persisting a transition or output failed
    Infrastructure,
}

impl FailureKind {
    /// Whether this marker attributes the build's end to cancellation rather than failure
    pub fn is_cancellation(self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExitCode => "exit_code",
            Self::Error => "error",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exit_code" => Ok(Self::ExitCode),
            "error" => Ok(Self::Error),
            "timed_out" => Ok(Self::TimedOut),
            "canceled" => Ok(Self::Canceled),
            "deadline_exceeded" => Ok(Self::DeadlineExceeded),
            "infrastructure" => Ok(Self::Infrastructure),
            other => Err(format!("unknown failure kind '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_through_strings() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Running,
            BuildStatus::Success,
            BuildStatus::Failed,
            BuildStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<BuildStatus>(), Ok(status));
        }
        assert!("queued".parse::<BuildStatus>().is_err());
        assert_eq!("skipped".parse::<StepStatus>(), Ok(StepStatus::Skipped));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!BuildStatus::Pending.is_terminal());
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Canceled.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&BuildStatus::Canceled).unwrap();
        assert_eq!(json, "\"canceled\"");
        let json = serde_json::to_string(&FailureKind::DeadlineExceeded).unwrap();
        assert_eq!(json, "\"deadline_exceeded\"");
    }

    #[test]
    fn test_pending_step_copies_definition() {
        let def = StepDefinition {
            name: "test".to_string(),
            command: "cargo test".to_string(),
            ordinal: 2,
            timeout_seconds: Some(60),
        };
        let build_id = Uuid::new_v4();
        let step = BuildStep::pending(build_id, &def);

        assert_eq!(step.build_id, build_id);
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.definition(), def);
        assert!(step.finished_at.is_none());
    }
}
