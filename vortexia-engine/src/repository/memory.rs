//! In-memory repository
//!
//! Keeps every row in process memory behind a single async mutex. Used by the
//! engine's tests and by embedders that do not need durability.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;
use vortexia_core::domain::build::{Build, BuildStep};
use vortexia_core::domain::log::LogChunk;
use vortexia_core::domain::pipeline::Pipeline;
use vortexia_core::dto::build::Page;

use super::{GatewayError, PersistenceGateway, PipelineSource, Result};

#[derive(Default)]
struct Tables {
    pipelines: HashMap<Uuid, Pipeline>,
    builds: HashMap<Uuid, Build>,
    steps: HashMap<Uuid, Vec<BuildStep>>,
    logs: HashMap<Uuid, Vec<LogChunk>>,
}

/// In-memory implementation of PersistenceGateway and PipelineSource
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a pipeline definition
    pub async fn insert_pipeline(&self, pipeline: Pipeline) {
        let mut tables = self.tables.lock().await;
        tables.pipelines.insert(pipeline.id, pipeline);
    }

    /// Number of builds stored, across pipelines
    pub async fn build_count(&self) -> usize {
        self.tables.lock().await.builds.len()
    }

    /// Number of step rows stored, across builds
    pub async fn step_count(&self) -> usize {
        self.tables.lock().await.steps.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryStore {
    async fn create_build(&self, build: &Build, steps: &[BuildStep]) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.builds.contains_key(&build.id) {
            return Err(GatewayError::Unavailable(format!(
                "build {} already exists",
                build.id
            )));
        }

        let mut steps = steps.to_vec();
        steps.sort_by_key(|s| s.ordinal);

        tables.builds.insert(build.id, build.clone());
        tables.steps.insert(build.id, steps);
        tables.logs.insert(build.id, Vec::new());
        Ok(())
    }

    async fn update_build(&self, build: &Build) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .builds
            .get_mut(&build.id)
            .ok_or_else(|| GatewayError::Missing(format!("build {}", build.id)))?;

        stored.status = build.status;
        stored.started_at = build.started_at;
        stored.finished_at = build.finished_at;
        stored.duration = build.duration;
        stored.failure = build.failure;
        Ok(())
    }

    async fn update_step(&self, step: &BuildStep) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .steps
            .get_mut(&step.build_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.id == step.id))
            .ok_or_else(|| GatewayError::Missing(format!("step {}", step.id)))?;

        stored.status = step.status;
        stored.started_at = step.started_at;
        stored.finished_at = step.finished_at;
        stored.duration = step.duration;
        stored.exit_code = step.exit_code;
        stored.failure = step.failure;
        stored.error_message = step.error_message.clone();
        Ok(())
    }

    async fn append_log(&self, chunk: &LogChunk) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let step = tables
            .steps
            .get_mut(&chunk.build_id)
            .and_then(|steps| steps.iter_mut().find(|s| s.id == chunk.step_id))
            .ok_or_else(|| GatewayError::Missing(format!("step {}", chunk.step_id)))?;
        step.output.push_str(&chunk.data);

        tables
            .logs
            .entry(chunk.build_id)
            .or_default()
            .push(chunk.clone());
        Ok(())
    }

    async fn get_logs(&self, build_id: Uuid, from_seq: u64) -> Result<Vec<LogChunk>> {
        let tables = self.tables.lock().await;
        let mut chunks: Vec<LogChunk> = tables
            .logs
            .get(&build_id)
            .map(|logs| logs.iter().filter(|c| c.seq >= from_seq).cloned().collect())
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.seq);
        Ok(chunks)
    }

    async fn get_build(&self, build_id: Uuid) -> Result<Option<Build>> {
        Ok(self.tables.lock().await.builds.get(&build_id).cloned())
    }

    async fn get_steps_by_build(&self, build_id: Uuid) -> Result<Vec<BuildStep>> {
        Ok(self
            .tables
            .lock()
            .await
            .steps
            .get(&build_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_by_pipeline(
        &self,
        pipeline_id: Uuid,
        offset: u64,
        limit: u64,
    ) -> Result<Page<Build>> {
        let tables = self.tables.lock().await;
        Ok(page_of(
            tables.builds.values().filter(|b| b.pipeline_id == pipeline_id),
            offset,
            limit,
        ))
    }

    async fn list_all(&self, offset: u64, limit: u64) -> Result<Page<Build>> {
        let tables = self.tables.lock().await;
        Ok(page_of(tables.builds.values(), offset, limit))
    }

    async fn count_active_builds(&self, pipeline_id: Uuid) -> Result<usize> {
        let tables = self.tables.lock().await;
        Ok(tables
            .builds
            .values()
            .filter(|b| b.pipeline_id == pipeline_id && b.status.is_active())
            .count())
    }

    async fn list_active_builds(&self) -> Result<Vec<Build>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .builds
            .values()
            .filter(|b| b.status.is_active())
            .cloned()
            .collect())
    }
}

/// Newest-first window over a set of builds
fn page_of<'a>(builds: impl Iterator<Item = &'a Build>, offset: u64, limit: u64) -> Page<Build> {
    let mut builds: Vec<&Build> = builds.collect();
    builds.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let total = builds.len() as u64;
    let items = builds
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .cloned()
        .collect();

    Page {
        items,
        total,
        offset,
        limit,
    }
}

#[async_trait]
impl PipelineSource for InMemoryStore {
    async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<Option<Pipeline>> {
        Ok(self.tables.lock().await.pipelines.get(&pipeline_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use vortexia_core::domain::build::{BuildStatus, StepStatus};
    use vortexia_core::domain::log::OutputStream;
    use vortexia_core::domain::pipeline::StepDefinition;

    fn build_with_steps(pipeline_id: Uuid, count: u32) -> (Build, Vec<BuildStep>) {
        let build = Build::new(pipeline_id, "main".to_string(), "c0ffee".to_string(), Uuid::new_v4());
        let steps = (0..count)
            .map(|ordinal| {
                BuildStep::pending(
                    build.id,
                    &StepDefinition {
                        name: format!("step-{}", ordinal),
                        command: "true".to_string(),
                        ordinal,
                        timeout_seconds: None,
                    },
                )
            })
            .collect();
        (build, steps)
    }

    fn chunk(build: &Build, step: &BuildStep, seq: u64, data: &str) -> LogChunk {
        LogChunk {
            build_id: build.id,
            step_id: step.id,
            seq,
            stream: OutputStream::Stdout,
            timestamp: Utc::now(),
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_read_build() {
        let store = InMemoryStore::new();
        let (build, steps) = build_with_steps(Uuid::new_v4(), 3);

        store.create_build(&build, &steps).await.unwrap();

        let stored = store.get_build(build.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BuildStatus::Pending);
        let stored_steps = store.get_steps_by_build(build.id).await.unwrap();
        assert_eq!(stored_steps.len(), 3);
        assert_eq!(stored_steps[2].ordinal, 2);
        assert!(store.get_build(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_step_keeps_output() {
        let store = InMemoryStore::new();
        let (build, steps) = build_with_steps(Uuid::new_v4(), 1);
        store.create_build(&build, &steps).await.unwrap();

        store.append_log(&chunk(&build, &steps[0], 0, "hello\n")).await.unwrap();
        let mut step = steps[0].clone();
        step.status = StepStatus::Running;
        store.update_step(&step).await.unwrap();

        let stored = store.get_steps_by_build(build.id).await.unwrap();
        assert_eq!(stored[0].status, StepStatus::Running);
        assert_eq!(stored[0].output, "hello\n");
    }

    #[tokio::test]
    async fn test_get_logs_from_sequence() {
        let store = InMemoryStore::new();
        let (build, steps) = build_with_steps(Uuid::new_v4(), 1);
        store.create_build(&build, &steps).await.unwrap();

        for seq in 0..5 {
            store
                .append_log(&chunk(&build, &steps[0], seq, &format!("line {}\n", seq)))
                .await
                .unwrap();
        }

        let logs = store.get_logs(build.id, 3).await.unwrap();
        let seqs: Vec<u64> = logs.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_append_to_unknown_step_fails() {
        let store = InMemoryStore::new();
        let (build, steps) = build_with_steps(Uuid::new_v4(), 1);

        let result = store.append_log(&chunk(&build, &steps[0], 0, "x")).await;
        assert!(matches!(result, Err(GatewayError::Missing(_))));
    }

    #[tokio::test]
    async fn test_active_counts_and_listing() {
        let store = InMemoryStore::new();
        let pipeline_id = Uuid::new_v4();

        let (first, first_steps) = build_with_steps(pipeline_id, 1);
        store.create_build(&first, &first_steps).await.unwrap();
        let (mut second, second_steps) = build_with_steps(pipeline_id, 1);
        store.create_build(&second, &second_steps).await.unwrap();
        let (other, other_steps) = build_with_steps(Uuid::new_v4(), 1);
        store.create_build(&other, &other_steps).await.unwrap();

        assert_eq!(store.count_active_builds(pipeline_id).await.unwrap(), 2);

        second.status = BuildStatus::Canceled;
        store.update_build(&second).await.unwrap();
        assert_eq!(store.count_active_builds(pipeline_id).await.unwrap(), 1);
        assert_eq!(store.list_active_builds().await.unwrap().len(), 2);

        let page = store.list_by_pipeline(pipeline_id, 0, 1).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.items.len(), 1);
        let page = store.list_by_pipeline(pipeline_id, 5, 10).await.unwrap();
        assert!(page.items.is_empty());

        let page = store.list_all(0, 10).await.unwrap();
        assert_eq!(page.total, 3);
        assert!(page.items.iter().any(|b| b.id == other.id));
    }
}
