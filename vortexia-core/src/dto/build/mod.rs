//! Build DTOs for the trigger API

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::build::{Build, BuildStatus, BuildStep, FailureKind};

/// Request to trigger a new build of a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerBuild {
    pub pipeline_id: Uuid,
    pub branch: String,
    #[serde(default)]
    pub commit: String,
    pub actor_id: Uuid,
}

/// A build together with its steps, ordered by ordinal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildDetails {
    pub build: Build,
    pub steps: Vec<BuildStep>,
}

/// Lightweight build summary for listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub branch: String,
    pub commit: String,
    pub status: BuildStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub duration: Option<i64>,
    pub failure: Option<FailureKind>,
}

impl From<Build> for BuildSummary {
    fn from(build: Build) -> Self {
        Self {
            id: build.id,
            pipeline_id: build.pipeline_id,
            branch: build.branch,
            commit: build.commit,
            status: build.status,
            created_at: build.created_at,
            duration: build.duration,
            failure: build.failure,
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            offset: self.offset,
            limit: self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_summary_conversion() {
        let build = Build::new(
            Uuid::new_v4(),
            "main".to_string(),
            "deadbeef".to_string(),
            Uuid::new_v4(),
        );

        let summary: BuildSummary = build.clone().into();
        assert_eq!(summary.id, build.id);
        assert_eq!(summary.status, BuildStatus::Pending);
        assert_eq!(summary.branch, "main");
    }

    #[test]
    fn test_trigger_commit_defaults_to_empty() {
        let json = serde_json::json!({
            "pipeline_id": Uuid::new_v4(),
            "branch": "main",
            "actor_id": Uuid::new_v4(),
        });

        let req: TriggerBuild = serde_json::from_value(json).unwrap();
        assert_eq!(req.commit, "");
    }

    #[test]
    fn test_page_map() {
        let page = Page {
            items: vec![1, 2, 3],
            total: 10,
            offset: 3,
            limit: 3,
        };

        let mapped = page.map(|n| n * 2);
        assert_eq!(mapped.items, vec![2, 4, 6]);
        assert_eq!(mapped.total, 10);
    }
}
