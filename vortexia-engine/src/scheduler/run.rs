//! Build run
//!
//! Drives one build through its steps in ordinal order. Each transition is
//! computed on the in-memory [`BuildState`] and committed (steps first, then
//! the build) before the next one starts. A commit that still fails after
//! retries ends the build as failed with an infrastructure marker.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vortexia_core::domain::build::{BuildStatus, FailureKind};
use vortexia_core::state::{BuildState, Changes, StepOutcome};

use crate::error::{EngineError, Result};
use crate::repository::PersistenceGateway;
use crate::retry::RetryPolicy;
use crate::service::{CancelHandle, CancelReason, CancelSignal, StepOutput};

use super::Inner;

pub(super) struct BuildRun {
    inner: Arc<Inner>,
    state: BuildState,
    cancel: CancelHandle,
    signal: CancelSignal,
}

impl BuildRun {
    pub fn new(inner: Arc<Inner>, state: BuildState, cancel: CancelHandle) -> Self {
        let signal = cancel.signal();
        Self {
            inner,
            state,
            cancel,
            signal,
        }
    }

    fn build_id(&self) -> Uuid {
        self.state.build().id
    }

    /// Runs the build to a terminal state and returns that state
    pub async fn execute(mut self) -> BuildStatus {
        let build_id = self.build_id();
        info!(
            "Starting build {} ({} step(s))",
            build_id,
            self.state.steps().len()
        );

        let watchdog = self.inner.config.build_timeout.map(|limit| {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                if cancel.cancel(CancelReason::DeadlineExceeded) {
                    warn!("Build {} exceeded its maximum duration of {:?}", build_id, limit);
                }
            })
        });

        let result = self.drive().await;

        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        if let Err(e) = result {
            error!("Build {} could not proceed: {}", build_id, e);
            self.fail(&e.to_string()).await;
        }

        let build = self.state.build();
        info!(
            "Build {} finished: {} ({}s)",
            build_id,
            build.status,
            build.duration.unwrap_or(0)
        );
        build.status
    }

    async fn drive(&mut self) -> Result<()> {
        while let Some(index) = self.state.next_pending() {
            if let Some(reason) = self.signal.reason() {
                info!("Build {} stopped before step {}: {}", self.build_id(), index, reason.message());
                let changes = self
                    .state
                    .abort(reason.failure_kind(), reason.message(), Utc::now())?;
                self.commit(&changes).await?;
                return Ok(());
            }

            let changes = self.state.start_step(index, Utc::now())?;
            self.commit(&changes).await?;

            let step = &self.state.steps()[index];
            let definition = step.definition();
            let sink = StepOutput::new(
                Arc::clone(&self.inner.broadcaster),
                step.build_id,
                step.id,
            );
            debug!(
                "Build {}: step {} '{}' started",
                self.build_id(),
                definition.ordinal,
                definition.name
            );

            let outcome = self
                .inner
                .executor
                .execute(&definition, &sink, self.signal.clone())
                .await;

            match &outcome {
                StepOutcome::Success => debug!(
                    "Build {}: step '{}' succeeded",
                    self.build_id(),
                    definition.name
                ),
                StepOutcome::Failed(info) => info!(
                    "Build {}: step '{}' failed ({}): {}",
                    self.build_id(),
                    definition.name,
                    info.kind,
                    info.message
                ),
            }

            let changes = self.state.finish_step(index, &outcome, Utc::now())?;
            self.commit(&changes).await?;
        }

        Ok(())
    }

    /// Ends the build as failed after a commit or transition error
    ///
    /// Starts over from the last committed state, since the in-memory one may
    /// hold transitions that never reached storage. When that state cannot be
    /// read, every row is written from memory instead.
    async fn fail(&mut self, message: &str) {
        let reloaded = match self.reload().await {
            Ok(state) => {
                self.state = state;
                true
            }
            Err(e) => {
                warn!(
                    "Build {} could not be reloaded, aborting from memory: {}",
                    self.build_id(),
                    e
                );
                false
            }
        };

        let mut changes = match self
            .state
            .abort(FailureKind::Infrastructure, message, Utc::now())
        {
            Ok(changes) => changes,
            Err(e) => {
                error!("Build {} could not be aborted: {}", self.build_id(), e);
                return;
            }
        };

        if !reloaded {
            changes = Changes {
                steps: (0..self.state.steps().len()).collect(),
                build: true,
            };
        }

        if let Err(e) = self.commit(&changes).await {
            error!(
                "Build {} left active in storage; it will be recovered on restart: {}",
                self.build_id(),
                e
            );
        }
    }

    async fn reload(&self) -> Result<BuildState> {
        let build_id = self.build_id();
        let build = self
            .inner
            .gateway
            .get_build(build_id)
            .await?
            .ok_or(EngineError::BuildNotFound(build_id))?;
        let steps = self.inner.gateway.get_steps_by_build(build_id).await?;
        Ok(BuildState::new(build, steps))
    }

    async fn commit(&self, changes: &Changes) -> Result<()> {
        commit(
            self.inner.gateway.as_ref(),
            self.inner.retry,
            &self.state,
            changes,
        )
        .await
    }
}

/// Writes the rows touched by a transition: steps first, then the build
pub(super) async fn commit(
    gateway: &dyn PersistenceGateway,
    retry: RetryPolicy,
    state: &BuildState,
    changes: &Changes,
) -> Result<()> {
    for &index in &changes.steps {
        let step = &state.steps()[index];
        retry
            .run("update build step", || gateway.update_step(step))
            .await?;
    }

    if changes.build {
        let build = state.build();
        retry
            .run("update build", || gateway.update_build(build))
            .await?;
    }

    Ok(())
}
