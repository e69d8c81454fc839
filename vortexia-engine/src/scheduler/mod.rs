//! Scheduler
//!
//! Entry point of the engine. Admits builds against the per-pipeline
//! concurrency ceiling, creates them with all their steps in one write, and
//! runs each admitted build in its own task. Also serves status reads,
//! cancellation and log streaming for those builds.

mod run;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vortexia_core::domain::build::{Build, BuildStatus, BuildStep, FailureKind};
use vortexia_core::domain::log::LogChunk;
use vortexia_core::dto::build::{BuildDetails, Page, TriggerBuild};
use vortexia_core::resolver;
use vortexia_core::state::BuildState;

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::repository::{PersistenceGateway, PipelineSource};
use crate::retry::RetryPolicy;
use crate::service::{
    CancelHandle, CancelReason, LogBroadcaster, LogWatch, ShellExecutor, StepExecutor, cancel_pair,
};

use run::BuildRun;

const RESTART_MESSAGE: &str = "engine stopped while the build was in progress";

/// Build scheduler
///
/// Cheap to clone; every clone drives the same set of builds.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    config: EngineConfig,
    gateway: Arc<dyn PersistenceGateway>,
    pipelines: Arc<dyn PipelineSource>,
    executor: Arc<dyn StepExecutor>,
    broadcaster: Arc<LogBroadcaster>,
    retry: RetryPolicy,
    /// One admission lock per pipeline; holds the count-then-create sequence
    admission: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    /// Builds driven by a task of this process
    running: Mutex<HashMap<Uuid, RunningBuild>>,
    /// Serializes aborts of builds no task is driving
    orphans: tokio::sync::Mutex<()>,
}

struct RunningBuild {
    cancel: CancelHandle,
    done: watch::Receiver<bool>,
}

impl Inner {
    fn running(&self) -> MutexGuard<'_, HashMap<Uuid, RunningBuild>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Scheduler {
    /// Creates a scheduler
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn PersistenceGateway>,
        pipelines: Arc<dyn PipelineSource>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        let retry = RetryPolicy::from(&config);
        let broadcaster = Arc::new(LogBroadcaster::new(
            Arc::clone(&gateway),
            config.subscriber_buffer,
            retry,
        ));

        Self {
            inner: Arc::new(Inner {
                config,
                gateway,
                pipelines,
                executor,
                broadcaster,
                retry,
                admission: Mutex::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                orphans: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Creates a scheduler that runs steps through the configured shell
    pub fn with_shell(
        config: EngineConfig,
        gateway: Arc<dyn PersistenceGateway>,
        pipelines: Arc<dyn PipelineSource>,
    ) -> Self {
        let executor = Arc::new(ShellExecutor::new(&config));
        Self::new(config, gateway, pipelines, executor)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ========================================================================
    // Trigger
    // ========================================================================

    /// Admits and starts a new build
    ///
    /// Returns the build in `pending` state; its steps run in the background.
    /// Nothing is stored when the pipeline is unknown, its configuration does
    /// not resolve, or the concurrency ceiling is reached.
    pub async fn trigger(&self, request: TriggerBuild) -> Result<Build> {
        let pipeline = self
            .inner
            .pipelines
            .get_pipeline(request.pipeline_id)
            .await?
            .ok_or(EngineError::PipelineNotFound(request.pipeline_id))?;

        if !pipeline.is_active {
            return Err(EngineError::PipelineInactive(pipeline.id));
        }

        let definitions = resolver::resolve(&pipeline.config).inspect_err(|e| {
            warn!("Pipeline {} has an invalid configuration: {}", pipeline.id, e);
        })?;

        let lock = self.admission_lock(pipeline.id);
        let _admission = lock.lock().await;

        let active = self.inner.gateway.count_active_builds(pipeline.id).await?;
        let limit = self.inner.config.max_active_builds_per_pipeline;
        if active >= limit {
            info!(
                "Rejected build for pipeline {}: {} active build(s), limit {}",
                pipeline.id, active, limit
            );
            return Err(EngineError::ConcurrencyLimit {
                pipeline_id: pipeline.id,
                active,
                limit,
            });
        }

        let build = Build::new(
            pipeline.id,
            request.branch,
            request.commit,
            request.actor_id,
        );
        let steps: Vec<BuildStep> = definitions
            .iter()
            .map(|definition| BuildStep::pending(build.id, definition))
            .collect();

        // Registered before the rows exist, so a cancel never mistakes it for an orphan
        let (cancel, _) = cancel_pair();
        let (done_tx, done_rx) = watch::channel(false);
        self.inner.running().insert(
            build.id,
            RunningBuild {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        if let Err(e) = self.inner.gateway.create_build(&build, &steps).await {
            self.inner.running().remove(&build.id);
            return Err(e.into());
        }

        info!(
            "Created build {} for pipeline '{}' ({} step(s))",
            build.id,
            pipeline.name,
            steps.len()
        );

        self.spawn_run(BuildState::new(build.clone(), steps), cancel, done_tx);
        Ok(build)
    }

    fn admission_lock(&self, pipeline_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .inner
            .admission
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(pipeline_id).or_default())
    }

    fn spawn_run(&self, state: BuildState, cancel: CancelHandle, done: watch::Sender<bool>) {
        let build_id = state.build().id;
        self.inner.broadcaster.open(build_id, 0);

        let run = BuildRun::new(Arc::clone(&self.inner), state, cancel);
        let handle = tokio::spawn(run.execute());

        let scheduler = self.clone();
        tokio::spawn(async move {
            let status = match handle.await {
                Ok(status) => Some(status),
                Err(e) => {
                    error!("Build task {} panicked: {}", build_id, e);
                    None
                }
            };

            scheduler.inner.running().remove(&build_id);

            let status = match status {
                Some(status) => Some(status),
                None => scheduler
                    .abort_orphan(build_id, FailureKind::Infrastructure, RESTART_MESSAGE)
                    .await
                    .inspect_err(|e| error!("Build {} could not be failed: {}", build_id, e))
                    .ok(),
            };

            if let Some(status) = status {
                scheduler.inner.broadcaster.close(build_id, status);
            } else if let Ok(Some(build)) = scheduler.inner.gateway.get_build(build_id).await {
                scheduler.inner.broadcaster.close(build_id, build.status);
            }
            let _ = done.send(true);
        });
    }

    // ========================================================================
    // Cancellation
    // ========================================================================

    /// Requests that a build stop
    ///
    /// A running step is terminated and the remaining steps are skipped; the
    /// build ends `canceled`. Canceling a finished build does nothing.
    pub async fn cancel(&self, build_id: Uuid) -> Result<()> {
        let handle = self
            .inner
            .running()
            .get(&build_id)
            .map(|running| running.cancel.clone());

        if let Some(handle) = handle {
            if handle.cancel(CancelReason::Requested) {
                info!("Cancellation requested for build {}", build_id);
            } else {
                debug!("Build {} is already stopping", build_id);
            }
            return Ok(());
        }

        let build = self
            .inner
            .gateway
            .get_build(build_id)
            .await?
            .ok_or(EngineError::BuildNotFound(build_id))?;

        if build.is_terminal() {
            debug!("Build {} already finished as {}", build_id, build.status);
            return Ok(());
        }

        info!("Canceling build {} which no task is driving", build_id);
        self.abort_orphan(build_id, FailureKind::Canceled, CancelReason::Requested.message())
            .await
            .map(|_| ())
    }

    /// Fails every active build left behind by a previous process
    ///
    /// Call once at startup, before accepting triggers. Returns the number of
    /// builds recovered.
    pub async fn recover_orphans(&self) -> Result<usize> {
        let active = self.inner.gateway.list_active_builds().await?;
        let mut recovered = 0;

        for build in active {
            if self.inner.running().contains_key(&build.id) {
                continue;
            }

            warn!(
                "Build {} was left {} by a previous run; marking failed",
                build.id, build.status
            );
            self.abort_orphan(build.id, FailureKind::Infrastructure, RESTART_MESSAGE)
                .await?;
            recovered += 1;
        }

        if recovered > 0 {
            info!("Recovered {} orphaned build(s)", recovered);
        }
        Ok(recovered)
    }

    /// Aborts a build that no task is driving and commits the result
    async fn abort_orphan(
        &self,
        build_id: Uuid,
        kind: FailureKind,
        message: &str,
    ) -> Result<BuildStatus> {
        let _guard = self.inner.orphans.lock().await;

        let build = self
            .inner
            .gateway
            .get_build(build_id)
            .await?
            .ok_or(EngineError::BuildNotFound(build_id))?;
        if build.is_terminal() {
            return Ok(build.status);
        }

        let steps = self.inner.gateway.get_steps_by_build(build_id).await?;
        let mut state = BuildState::new(build, steps);
        let changes = state.abort(kind, message, Utc::now())?;
        run::commit(
            self.inner.gateway.as_ref(),
            self.inner.retry,
            &state,
            &changes,
        )
        .await?;

        Ok(state.build().status)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current build record and its steps
    pub async fn get_status(&self, build_id: Uuid) -> Result<BuildDetails> {
        let build = self
            .inner
            .gateway
            .get_build(build_id)
            .await?
            .ok_or(EngineError::BuildNotFound(build_id))?;
        let steps = self.inner.gateway.get_steps_by_build(build_id).await?;

        Ok(BuildDetails { build, steps })
    }

    /// Builds of a pipeline, newest first
    pub async fn list_builds(&self, pipeline_id: Uuid, offset: u64, limit: u64) -> Result<Page<Build>> {
        Ok(self
            .inner
            .gateway
            .list_by_pipeline(pipeline_id, offset, limit)
            .await?)
    }

    /// Builds of every pipeline, newest first
    pub async fn list_all_builds(&self, offset: u64, limit: u64) -> Result<Page<Build>> {
        Ok(self.inner.gateway.list_all(offset, limit).await?)
    }

    /// Persisted output of a build
    pub async fn logs(&self, build_id: Uuid) -> Result<Vec<LogChunk>> {
        self.ensure_build(build_id).await?;
        Ok(self.inner.broadcaster.history(build_id).await?)
    }

    /// Complete output of a build from its first chunk, following it live while it runs
    pub async fn stream_logs(&self, build_id: Uuid) -> Result<LogWatch> {
        self.ensure_build(build_id).await?;
        Ok(self.inner.broadcaster.watch(build_id).await?)
    }

    /// Waits until a build driven by this scheduler finishes, then returns it
    pub async fn wait(&self, build_id: Uuid) -> Result<BuildDetails> {
        let done = self
            .inner
            .running()
            .get(&build_id)
            .map(|running| running.done.clone());

        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }

        self.get_status(build_id).await
    }

    /// Number of builds currently driven by this scheduler
    pub fn running_builds(&self) -> usize {
        self.inner.running().len()
    }

    async fn ensure_build(&self, build_id: Uuid) -> Result<()> {
        match self.inner.gateway.get_build(build_id).await? {
            Some(_) => Ok(()),
            None => Err(EngineError::BuildNotFound(build_id)),
        }
    }
}
