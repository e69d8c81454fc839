//! Bounded retry for storage writes

use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::repository::GatewayError;

const MAX_DELAY: Duration = Duration::from_secs(5);

/// How often and how patiently a write is retried
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            attempts: config.persist_retry_attempts.max(1),
            backoff: config.persist_retry_backoff,
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds or the attempts are used up, with exponential backoff
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0;
        let mut delay = self.backoff;

        loop {
            attempt += 1;

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("{} succeeded after {} attempt(s)", what, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if attempt >= self.attempts {
                        error!("{} failed after {} attempt(s): {}", what, attempt, e);
                        return Err(e);
                    }

                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        what, attempt, self.attempts, e
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(MAX_DELAY);
                }
            }
        }
    }
}
