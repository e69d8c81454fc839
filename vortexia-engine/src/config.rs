//! Engine configuration
//!
//! Defines the scheduling policy and execution limits of the engine:
//! admission ceiling, timeouts, termination grace period, subscriber buffers
//! and persistence retry behaviour.

use std::time::Duration;

/// Engine configuration
///
/// All limits are configurable; the defaults are deliberately conservative
/// (one active build per pipeline, no build deadline, no step time limit).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of pending or running builds per pipeline
    pub max_active_builds_per_pipeline: usize,

    /// Maximum wall-clock time of a whole build; exceeding it cancels the build
    pub build_timeout: Option<Duration>,

    /// Default time limit of a single step, unless the step sets its own
    pub step_timeout: Option<Duration>,

    /// Time between asking a step's processes to stop and killing them
    pub kill_grace_period: Duration,

    /// Chunks buffered per live subscriber before it is disconnected
    pub subscriber_buffer: usize,

    /// Attempts made to commit a transition before the build is failed
    pub persist_retry_attempts: u32,

    /// Delay before the first commit retry; doubles on every further attempt
    pub persist_retry_backoff: Duration,

    /// Shell used to run step commands, invoked as `<shell> -c <command>`
    pub shell: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_active_builds_per_pipeline: 1,
            build_timeout: None,
            step_timeout: None,
            kill_grace_period: Duration::from_secs(10),
            subscriber_buffer: 256,
            persist_retry_attempts: 3,
            persist_retry_backoff: Duration::from_millis(200),
            shell: "sh".to_string(),
        }
    }
}

impl EngineConfig {
    /// Creates configuration from environment variables
    ///
    /// Every variable is optional; unset variables keep their default.
    /// - MAX_ACTIVE_BUILDS_PER_PIPELINE (default: 1)
    /// - BUILD_TIMEOUT (seconds, default: none)
    /// - STEP_TIMEOUT (seconds, default: none)
    /// - KILL_GRACE_PERIOD (seconds, default: 10)
    /// - SUBSCRIBER_BUFFER (chunks, default: 256)
    /// - PERSIST_RETRY_ATTEMPTS (default: 3)
    /// - PERSIST_RETRY_BACKOFF_MS (default: 200)
    /// - STEP_SHELL (default: sh)
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let config = Self {
            max_active_builds_per_pipeline: parse_var("MAX_ACTIVE_BUILDS_PER_PIPELINE")?
                .unwrap_or(defaults.max_active_builds_per_pipeline),
            build_timeout: parse_var("BUILD_TIMEOUT")?.map(Duration::from_secs),
            step_timeout: parse_var("STEP_TIMEOUT")?.map(Duration::from_secs),
            kill_grace_period: parse_var("KILL_GRACE_PERIOD")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.kill_grace_period),
            subscriber_buffer: parse_var("SUBSCRIBER_BUFFER")?
                .unwrap_or(defaults.subscriber_buffer),
            persist_retry_attempts: parse_var("PERSIST_RETRY_ATTEMPTS")?
                .unwrap_or(defaults.persist_retry_attempts),
            persist_retry_backoff: parse_var("PERSIST_RETRY_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.persist_retry_backoff),
            shell: std::env::var("STEP_SHELL").unwrap_or(defaults.shell),
        };

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_active_builds_per_pipeline == 0 {
            anyhow::bail!("max_active_builds_per_pipeline must be greater than 0");
        }

        if self.build_timeout.is_some_and(|t| t.is_zero()) {
            anyhow::bail!("build_timeout must be greater than 0");
        }

        if self.step_timeout.is_some_and(|t| t.is_zero()) {
            anyhow::bail!("step_timeout must be greater than 0");
        }

        if self.subscriber_buffer == 0 {
            anyhow::bail!("subscriber_buffer must be greater than 0");
        }

        if self.persist_retry_attempts == 0 {
            anyhow::bail!("persist_retry_attempts must be greater than 0");
        }

        if self.shell.trim().is_empty() {
            anyhow::bail!("shell cannot be empty");
        }

        Ok(())
    }

    /// Sets the per-pipeline admission ceiling
    pub fn with_max_active_builds(mut self, max: usize) -> Self {
        self.max_active_builds_per_pipeline = max;
        self
    }

    /// Sets the maximum build duration
    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = Some(timeout);
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", name, raw)),
        Err(_) => Ok(None),
    }
}
