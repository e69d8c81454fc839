//! Build status state machine
//!
//! Legal transitions:
//!
//! ```text
//! Build: pending -> running -> {success | failed | canceled}
//!        pending -> {failed | canceled}
//! Step:  pending -> running -> {success | failed}
//!        pending -> skipped
//! ```
//!
//! [`BuildState`] is the only place statuses change. Step transitions are
//! applied explicitly; the build status is then recomputed from the steps and
//! checked against the build transition table before it is applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::build::{Build, BuildStatus, BuildStep, FailureKind, StepStatus};

/// Rejected state change
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("build {build_id} cannot move from {from} to {to}")]
    Build {
        build_id: Uuid,
        from: BuildStatus,
        to: BuildStatus,
    },

    #[error("step {ordinal} of build {build_id} cannot move from {from} to {to}")]
    Step {
        build_id: Uuid,
        ordinal: u32,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("step {ordinal} cannot start while step {blocking} is not finished")]
    OutOfOrder { ordinal: u32, blocking: u32 },

    #[error("build {0} is already finished")]
    BuildFinished(Uuid),

    #[error("build has no step at index {0}")]
    UnknownStep(usize),
}

impl BuildStatus {
    pub fn can_transition_to(self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Canceled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }
}

impl StepStatus {
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Skipped) | (Running, Success) | (Running, Failed)
        )
    }
}

/// Terminal result of running one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Success,
    Failed(ExitInfo),
}

impl StepOutcome {
    pub fn failed(kind: FailureKind, exit_code: Option<i32>, message: impl Into<String>) -> Self {
        StepOutcome::Failed(ExitInfo {
            kind,
            exit_code,
            message: message.into(),
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success)
    }
}

/// Details of a failed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub kind: FailureKind,
    pub exit_code: Option<i32>,
    pub message: String,
}

/// Rows touched by a transition, to be committed in this order: steps, then build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes {
    /// Indexes into [`BuildState::steps`]
    pub steps: Vec<usize>,
    pub build: bool,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && !self.build
    }
}

/// Derives the build status from its steps
///
/// `abort` is the reason the build was stopped from outside the step loop, if
/// it was. It only matters when steps were skipped without any step failing,
/// which happens when a build is stopped between two steps.
pub fn derive_build_status(steps: &[BuildStep], abort: Option<FailureKind>) -> BuildStatus {
    if steps.is_empty() {
        return BuildStatus::Pending;
    }

    if steps.iter().any(|s| s.status == StepStatus::Running) {
        return BuildStatus::Running;
    }

    if let Some(failed) = steps.iter().find(|s| s.status == StepStatus::Failed) {
        return match failed.failure {
            Some(kind) if kind.is_cancellation() => BuildStatus::Canceled,
            _ => BuildStatus::Failed,
        };
    }

    if steps.iter().any(|s| s.status == StepStatus::Skipped) {
        return match abort {
            Some(kind) if !kind.is_cancellation() => BuildStatus::Failed,
            _ => BuildStatus::Canceled,
        };
    }

    if steps.iter().all(|s| s.status == StepStatus::Success) {
        return BuildStatus::Success;
    }

    if steps.iter().all(|s| s.status == StepStatus::Pending) {
        return BuildStatus::Pending;
    }

    // Between two steps: some succeeded, the rest still pending
    BuildStatus::Running
}

/// In-memory copy of a build and its steps, mutated only through transitions
#[derive(Debug, Clone)]
pub struct BuildState {
    build: Build,
    steps: Vec<BuildStep>,
    abort: Option<FailureKind>,
}

impl BuildState {
    pub fn new(build: Build, mut steps: Vec<BuildStep>) -> Self {
        steps.sort_by_key(|s| s.ordinal);
        Self {
            build,
            steps,
            abort: None,
        }
    }

    pub fn build(&self) -> &Build {
        &self.build
    }

    pub fn steps(&self) -> &[BuildStep] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&BuildStep> {
        self.steps.get(index)
    }

    pub fn into_parts(self) -> (Build, Vec<BuildStep>) {
        (self.build, self.steps)
    }

    pub fn is_terminal(&self) -> bool {
        self.build.is_terminal()
    }

    /// Index of the lowest-ordinal step that has not started yet
    pub fn next_pending(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::Pending)
    }

    /// Moves a pending step to running
    ///
    /// Fails if the build is finished or a lower-ordinal step is not terminal.
    pub fn start_step(&mut self, index: usize, now: DateTime<Utc>) -> Result<Changes, TransitionError> {
        if self.build.is_terminal() {
            return Err(TransitionError::BuildFinished(self.build.id));
        }

        let step = self.steps.get(index).ok_or(TransitionError::UnknownStep(index))?;
        if let Some(blocking) = self.steps[..index].iter().find(|s| !s.status.is_terminal()) {
            return Err(TransitionError::OutOfOrder {
                ordinal: step.ordinal,
                blocking: blocking.ordinal,
            });
        }

        self.set_step_status(index, StepStatus::Running)?;
        self.steps[index].started_at = Some(now);

        let mut changes = Changes {
            steps: vec![index],
            build: false,
        };
        changes.build = self.refresh(now)?;
        Ok(changes)
    }

    /// Records the outcome of a running step
    ///
    /// A failure skips every step that has not started yet.
    pub fn finish_step(
        &mut self,
        index: usize,
        outcome: &StepOutcome,
        now: DateTime<Utc>,
    ) -> Result<Changes, TransitionError> {
        let mut changes = Changes::default();

        match outcome {
            StepOutcome::Success => {
                self.set_step_status(index, StepStatus::Success)?;
            }
            StepOutcome::Failed(info) => {
                self.set_step_status(index, StepStatus::Failed)?;
                let step = &mut self.steps[index];
                step.exit_code = info.exit_code;
                step.failure = Some(info.kind);
                step.error_message = Some(info.message.clone());
            }
        }
        let step = &mut self.steps[index];
        stamp_finished(
            &mut step.started_at,
            &mut step.finished_at,
            &mut step.duration,
            now,
        );
        changes.steps.push(index);

        if !outcome.is_success() {
            changes.steps.extend(self.skip_pending(now)?);
        }

        changes.build = self.refresh(now)?;
        Ok(changes)
    }

    /// Stops the build from outside the step loop
    ///
    /// The running step (if any) fails with `kind`, pending steps are skipped.
    /// A cancellation marker ends the build `canceled`, anything else `failed`.
    /// Aborting a finished build changes nothing.
    pub fn abort(
        &mut self,
        kind: FailureKind,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Changes, TransitionError> {
        if self.build.is_terminal() {
            return Ok(Changes::default());
        }

        self.abort = Some(kind);
        let mut changes = Changes::default();

        if let Some(index) = self
            .steps
            .iter()
            .position(|s| s.status == StepStatus::Running)
        {
            self.set_step_status(index, StepStatus::Failed)?;
            let step = &mut self.steps[index];
            step.failure = Some(kind);
            step.error_message = Some(message.to_string());
            stamp_finished(
                &mut step.started_at,
                &mut step.finished_at,
                &mut step.duration,
                now,
            );
            changes.steps.push(index);
        }

        changes.steps.extend(self.skip_pending(now)?);
        changes.build = self.refresh(now)?;
        Ok(changes)
    }

    fn skip_pending(&mut self, now: DateTime<Utc>) -> Result<Vec<usize>, TransitionError> {
        let pending: Vec<usize> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == StepStatus::Pending)
            .map(|(i, _)| i)
            .collect();

        for &index in &pending {
            self.set_step_status(index, StepStatus::Skipped)?;
            let step = &mut self.steps[index];
            stamp_finished(
                &mut step.started_at,
                &mut step.finished_at,
                &mut step.duration,
                now,
            );
        }

        Ok(pending)
    }

    fn set_step_status(&mut self, index: usize, next: StepStatus) -> Result<(), TransitionError> {
        let build_id = self.build.id;
        let step = self
            .steps
            .get_mut(index)
            .ok_or(TransitionError::UnknownStep(index))?;

        if !step.status.can_transition_to(next) {
            return Err(TransitionError::Step {
                build_id,
                ordinal: step.ordinal,
                from: step.status,
                to: next,
            });
        }

        step.status = next;
        Ok(())
    }

    /// Recomputes the build status from the steps; returns whether the build row changed
    fn refresh(&mut self, now: DateTime<Utc>) -> Result<bool, TransitionError> {
        let next = derive_build_status(&self.steps, self.abort);
        let current = self.build.status;
        if next == current {
            return Ok(false);
        }

        if !current.can_transition_to(next) {
            return Err(TransitionError::Build {
                build_id: self.build.id,
                from: current,
                to: next,
            });
        }

        self.build.status = next;
        if next == BuildStatus::Running {
            self.build.started_at.get_or_insert(now);
        }

        if next.is_terminal() {
            if next != BuildStatus::Success {
                self.build.failure = self
                    .steps
                    .iter()
                    .find(|s| s.status == StepStatus::Failed)
                    .and_then(|s| s.failure)
                    .or(self.abort)
                    .or(Some(FailureKind::Canceled));
            }
            stamp_finished(
                &mut self.build.started_at,
                &mut self.build.finished_at,
                &mut self.build.duration,
                now,
            );
        }

        Ok(true)
    }
}

/// Sets `finished_at` and `duration` once; a row that never started gets `started_at = finished_at`
fn stamp_finished(
    started_at: &mut Option<DateTime<Utc>>,
    finished_at: &mut Option<DateTime<Utc>>,
    duration: &mut Option<i64>,
    now: DateTime<Utc>,
) {
    if finished_at.is_some() {
        return;
    }

    let started = *started_at.get_or_insert(now);
    let finished = now.max(started);
    *finished_at = Some(finished);
    *duration = Some((finished - started).num_seconds());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pipeline::StepDefinition;
    use chrono::Duration;

    fn state_with(names: &[&str]) -> BuildState {
        let build = Build::new(
            Uuid::new_v4(),
            "main".to_string(),
            "abc123".to_string(),
            Uuid::new_v4(),
        );
        let steps = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                BuildStep::pending(
                    build.id,
                    &StepDefinition {
                        name: name.to_string(),
                        command: format!("echo {}", name),
                        ordinal: i as u32,
                        timeout_seconds: None,
                    },
                )
            })
            .collect();
        BuildState::new(build, steps)
    }

    fn statuses(state: &BuildState) -> Vec<StepStatus> {
        state.steps().iter().map(|s| s.status).collect()
    }

    #[test]
    fn test_transition_tables() {
        assert!(BuildStatus::Pending.can_transition_to(BuildStatus::Running));
        assert!(BuildStatus::Running.can_transition_to(BuildStatus::Canceled));
        assert!(!BuildStatus::Success.can_transition_to(BuildStatus::Failed));
        assert!(!BuildStatus::Canceled.can_transition_to(BuildStatus::Running));
        assert!(!BuildStatus::Pending.can_transition_to(BuildStatus::Success));

        assert!(StepStatus::Pending.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Running.can_transition_to(StepStatus::Skipped));
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Success));
        assert!(!StepStatus::Skipped.can_transition_to(StepStatus::Running));
    }

    #[test]
    fn test_first_step_start_moves_build_to_running() {
        let mut state = state_with(&["a", "b"]);
        let now = Utc::now();

        let changes = state.start_step(0, now).unwrap();

        assert_eq!(changes.steps, vec![0]);
        assert!(changes.build);
        assert_eq!(state.build().status, BuildStatus::Running);
        assert_eq!(state.build().started_at, Some(now));
        assert_eq!(state.steps()[0].started_at, Some(now));
    }

    #[test]
    fn test_all_success_ends_build_success() {
        let mut state = state_with(&["a", "b", "c"]);
        let start = Utc::now();

        for i in 0..3 {
            state.start_step(i, start).unwrap();
            state
                .finish_step(i, &StepOutcome::Success, start + Duration::seconds(i as i64 + 1))
                .unwrap();
        }

        let build = state.build();
        assert_eq!(build.status, BuildStatus::Success);
        assert_eq!(build.failure, None);
        assert_eq!(build.duration, Some(3));
        assert_eq!(
            build.finished_at.unwrap() - build.started_at.unwrap(),
            Duration::seconds(3)
        );
    }

    #[test]
    fn test_failure_skips_later_steps_and_fails_build() {
        let mut state = state_with(&["a", "b", "c", "d"]);
        let now = Utc::now();

        state.start_step(0, now).unwrap();
        state.finish_step(0, &StepOutcome::Success, now).unwrap();
        state.start_step(1, now).unwrap();
        let changes = state
            .finish_step(
                1,
                &StepOutcome::failed(FailureKind::ExitCode, Some(2), "exit status 2"),
                now,
            )
            .unwrap();

        assert_eq!(changes.steps, vec![1, 2, 3]);
        assert!(changes.build);
        assert_eq!(
            statuses(&state),
            vec![
                StepStatus::Success,
                StepStatus::Failed,
                StepStatus::Skipped,
                StepStatus::Skipped
            ]
        );
        assert_eq!(state.steps()[1].exit_code, Some(2));
        assert_eq!(state.build().status, BuildStatus::Failed);
        assert_eq!(state.build().failure, Some(FailureKind::ExitCode));
        assert!(state.steps()[3].started_at.is_some());
        assert_eq!(state.steps()[3].duration, Some(0));
    }

    #[test]
    fn test_cancel_running_build() {
        let mut state = state_with(&["a", "b", "c"]);
        let now = Utc::now();
        state.start_step(0, now).unwrap();

        state
            .abort(FailureKind::Canceled, "canceled by request", now + Duration::seconds(4))
            .unwrap();

        assert_eq!(
            statuses(&state),
            vec![StepStatus::Failed, StepStatus::Skipped, StepStatus::Skipped]
        );
        assert_eq!(state.steps()[0].failure, Some(FailureKind::Canceled));
        assert_eq!(state.build().status, BuildStatus::Canceled);
        assert_eq!(state.build().duration, Some(4));
    }

    #[test]
    fn test_cancel_between_steps() {
        let mut state = state_with(&["a", "b"]);
        let now = Utc::now();
        state.start_step(0, now).unwrap();
        state.finish_step(0, &StepOutcome::Success, now).unwrap();
        assert_eq!(state.build().status, BuildStatus::Running);

        state.abort(FailureKind::Canceled, "canceled", now).unwrap();

        assert_eq!(statuses(&state), vec![StepStatus::Success, StepStatus::Skipped]);
        assert_eq!(state.build().status, BuildStatus::Canceled);
        assert_eq!(state.build().failure, Some(FailureKind::Canceled));
    }

    #[test]
    fn test_cancel_pending_build() {
        let mut state = state_with(&["a", "b"]);
        let now = Utc::now();

        state.abort(FailureKind::Canceled, "canceled", now).unwrap();

        assert_eq!(state.build().status, BuildStatus::Canceled);
        assert_eq!(state.build().started_at, Some(now));
        assert_eq!(state.build().duration, Some(0));
    }

    #[test]
    fn test_deadline_is_attributed_to_cancellation() {
        let mut state = state_with(&["a", "b"]);
        let now = Utc::now();
        state.start_step(0, now).unwrap();

        state
            .abort(FailureKind::DeadlineExceeded, "build timed out", now)
            .unwrap();

        assert_eq!(state.build().status, BuildStatus::Canceled);
        assert_eq!(state.build().failure, Some(FailureKind::DeadlineExceeded));
    }

    #[test]
    fn test_infrastructure_abort_fails_build() {
        let mut state = state_with(&["a", "b"]);
        let now = Utc::now();

        state
            .abort(FailureKind::Infrastructure, "database unavailable", now)
            .unwrap();

        assert_eq!(statuses(&state), vec![StepStatus::Skipped, StepStatus::Skipped]);
        assert_eq!(state.build().status, BuildStatus::Failed);
        assert_eq!(state.build().failure, Some(FailureKind::Infrastructure));
    }

    #[test]
    fn test_abort_on_finished_build_is_noop() {
        let mut state = state_with(&["a"]);
        let now = Utc::now();
        state.start_step(0, now).unwrap();
        state.finish_step(0, &StepOutcome::Success, now).unwrap();
        let finished_at = state.build().finished_at;

        let changes = state.abort(FailureKind::Canceled, "late", now).unwrap();

        assert!(changes.is_empty());
        assert_eq!(state.build().status, BuildStatus::Success);
        assert_eq!(state.build().finished_at, finished_at);
    }

    #[test]
    fn test_steps_start_in_order() {
        let mut state = state_with(&["a", "b"]);
        let now = Utc::now();

        let err = state.start_step(1, now).unwrap_err();
        assert_eq!(err, TransitionError::OutOfOrder { ordinal: 1, blocking: 0 });

        state.start_step(0, now).unwrap();
        let err = state.start_step(1, now).unwrap_err();
        assert_eq!(err, TransitionError::OutOfOrder { ordinal: 1, blocking: 0 });
    }

    #[test]
    fn test_finished_build_rejects_new_steps() {
        let mut state = state_with(&["a", "b"]);
        let now = Utc::now();
        state.abort(FailureKind::Canceled, "canceled", now).unwrap();

        assert_eq!(
            state.start_step(0, now),
            Err(TransitionError::BuildFinished(state.build().id))
        );
    }

    #[test]
    fn test_finishing_a_pending_step_is_rejected() {
        let mut state = state_with(&["a"]);
        let err = state
            .finish_step(0, &StepOutcome::Success, Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            TransitionError::Step {
                from: StepStatus::Pending,
                to: StepStatus::Success,
                ..
            }
        ));
        assert_eq!(state.steps()[0].status, StepStatus::Pending);
    }

    #[test]
    fn test_derive_build_status() {
        let mut state = state_with(&["a", "b"]);
        assert_eq!(derive_build_status(state.steps(), None), BuildStatus::Pending);
        assert_eq!(derive_build_status(&[], None), BuildStatus::Pending);

        state.start_step(0, Utc::now()).unwrap();
        assert_eq!(derive_build_status(state.steps(), None), BuildStatus::Running);
    }

    #[test]
    fn test_terminal_timestamps_are_not_revised() {
        let mut started = None;
        let mut finished = None;
        let mut duration = None;
        let first = Utc::now();

        stamp_finished(&mut started, &mut finished, &mut duration, first);
        stamp_finished(
            &mut started,
            &mut finished,
            &mut duration,
            first + Duration::seconds(30),
        );

        assert_eq!(finished, Some(first));
        assert_eq!(duration, Some(0));
    }
}
