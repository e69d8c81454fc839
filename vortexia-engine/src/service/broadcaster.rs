//! Log broadcaster service
//!
//! Fans build output out to live subscribers. Every chunk gets the next
//! per-build sequence number and is persisted before any subscriber sees it,
//! so a watcher that reads history and then follows the live tail never misses
//! a chunk. Subscribers that fall more than the channel capacity behind are
//! disconnected instead of slowing the step down.

use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;
use vortexia_core::domain::build::BuildStatus;
use vortexia_core::domain::log::{LogChunk, OutputStream};
use vortexia_core::dto::log::LogEvent;

use crate::repository::{GatewayError, PersistenceGateway};
use crate::retry::RetryPolicy;
use crate::service::executor::OutputSink;

struct BuildChannel {
    sender: broadcast::Sender<LogEvent>,
    next_seq: u64,
}

/// Per-build log fan-out
pub struct LogBroadcaster {
    gateway: Arc<dyn PersistenceGateway>,
    channels: Mutex<HashMap<Uuid, BuildChannel>>,
    capacity: usize,
    retry: RetryPolicy,
}

impl LogBroadcaster {
    pub(crate) fn new(
        gateway: Arc<dyn PersistenceGateway>,
        capacity: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            gateway,
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            retry,
        }
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<Uuid, BuildChannel>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Opens the channel of a build that is about to run
    ///
    /// `next_seq` is the sequence number of the first chunk.
    pub fn open(&self, build_id: Uuid, next_seq: u64) {
        let (sender, _) = broadcast::channel(self.capacity);
        self.channels()
            .insert(build_id, BuildChannel { sender, next_seq });
    }

    /// Records a chunk of output and delivers it to live subscribers
    ///
    /// The chunk is persisted first; subscribers only see durable chunks. On
    /// failure no sequence number is consumed.
    pub async fn append(
        &self,
        build_id: Uuid,
        step_id: Uuid,
        stream: OutputStream,
        data: String,
    ) -> Result<LogChunk, GatewayError> {
        let seq = self
            .channels()
            .get(&build_id)
            .map(|channel| channel.next_seq)
            .ok_or_else(|| GatewayError::Missing(format!("log channel of build {}", build_id)))?;

        let chunk = LogChunk {
            build_id,
            step_id,
            seq,
            stream,
            timestamp: Utc::now(),
            data,
        };

        self.retry
            .run("append log chunk", || self.gateway.append_log(&chunk))
            .await?;

        if let Some(channel) = self.channels().get_mut(&build_id) {
            channel.next_seq = seq + 1;
            // No receivers is fine
            let _ = channel.sender.send(LogEvent::Chunk(chunk.clone()));
        }

        Ok(chunk)
    }

    /// Ends the live stream of a build
    pub fn close(&self, build_id: Uuid, status: BuildStatus) {
        if let Some(channel) = self.channels().remove(&build_id) {
            debug!(
                "Closing log channel of build {} ({} subscriber(s))",
                build_id,
                channel.sender.receiver_count()
            );
            let _ = channel.sender.send(LogEvent::Finished { status });
        }
    }

    pub fn is_open(&self, build_id: Uuid) -> bool {
        self.channels().contains_key(&build_id)
    }

    /// Follows the live output of a build
    ///
    /// A build that is not running yields an already finished subscription.
    pub fn subscribe(&self, build_id: Uuid) -> LogSubscription {
        let receiver = self
            .channels()
            .get(&build_id)
            .map(|channel| channel.sender.subscribe());

        match receiver {
            Some(receiver) => LogSubscription {
                build_id,
                receiver: Some(receiver),
                end: None,
            },
            None => LogSubscription {
                build_id,
                receiver: None,
                end: Some(SubscriptionEnd::Closed),
            },
        }
    }

    /// Persisted output of a build
    pub async fn history(&self, build_id: Uuid) -> Result<Vec<LogChunk>, GatewayError> {
        self.gateway.get_logs(build_id, 0).await
    }

    /// Full output of a build: everything persisted so far, then the live tail
    ///
    /// Subscribes before reading history, so chunks produced in between show up
    /// in both and are dropped from the live side by sequence number.
    pub async fn watch(&self, build_id: Uuid) -> Result<LogWatch, GatewayError> {
        let live = self.subscribe(build_id);
        let history = self.history(build_id).await?;
        let next_seq = history.last().map_or(0, |chunk| chunk.seq + 1);

        Ok(LogWatch {
            history: history.into(),
            next_seq,
            live,
        })
    }
}

/// Why a subscription stopped delivering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// The build finished; every chunk was delivered
    Finished(BuildStatus),
    /// The subscriber fell too far behind and was disconnected
    Lagged(u64),
    /// No live channel, or it went away without a final status
    Closed,
}

/// Live tail of one build's output
pub struct LogSubscription {
    build_id: Uuid,
    receiver: Option<broadcast::Receiver<LogEvent>>,
    end: Option<SubscriptionEnd>,
}

impl LogSubscription {
    /// Next live chunk, or `None` once the subscription ended
    pub async fn next(&mut self) -> Option<LogChunk> {
        let receiver = self.receiver.as_mut()?;

        let end = match receiver.recv().await {
            Ok(LogEvent::Chunk(chunk)) => return Some(chunk),
            Ok(LogEvent::Finished { status }) => SubscriptionEnd::Finished(status),
            Ok(LogEvent::Disconnected { missed }) => SubscriptionEnd::Lagged(missed),
            Err(RecvError::Lagged(missed)) => {
                warn!(
                    "Log subscriber of build {} missed {} chunk(s); disconnecting",
                    self.build_id, missed
                );
                SubscriptionEnd::Lagged(missed)
            }
            Err(RecvError::Closed) => SubscriptionEnd::Closed,
        };

        self.receiver = None;
        self.end = Some(end);
        None
    }

    pub fn end(&self) -> Option<SubscriptionEnd> {
        self.end
    }
}

/// History followed by the live tail, without gaps or duplicates
pub struct LogWatch {
    history: VecDeque<LogChunk>,
    next_seq: u64,
    live: LogSubscription,
}

impl LogWatch {
    pub async fn next(&mut self) -> Option<LogChunk> {
        if let Some(chunk) = self.history.pop_front() {
            return Some(chunk);
        }

        loop {
            let chunk = self.live.next().await?;
            if chunk.seq >= self.next_seq {
                self.next_seq = chunk.seq + 1;
                return Some(chunk);
            }
        }
    }

    /// Why the live tail ended, once it has
    pub fn end(&self) -> Option<SubscriptionEnd> {
        self.live.end()
    }

    pub fn into_stream(self) -> impl Stream<Item = LogChunk> + Send + 'static {
        futures::stream::unfold(self, |mut watch| async move {
            watch.next().await.map(|chunk| (chunk, watch))
        })
    }
}

/// Output sink of one running step
pub struct StepOutput {
    broadcaster: Arc<LogBroadcaster>,
    build_id: Uuid,
    step_id: Uuid,
}

impl StepOutput {
    pub fn new(broadcaster: Arc<LogBroadcaster>, build_id: Uuid, step_id: Uuid) -> Self {
        Self {
            broadcaster,
            build_id,
            step_id,
        }
    }
}

#[async_trait]
impl OutputSink for StepOutput {
    async fn write(&self, stream: OutputStream, data: String) -> Result<(), GatewayError> {
        self.broadcaster
            .append(self.build_id, self.step_id, stream, data)
            .await
            .map(|_| ())
    }
}
