//! Cancellation signal
//!
//! A build owns one [`CancelHandle`]; every step executor it runs receives a
//! [`CancelSignal`] cloned from it. The first reason recorded wins, later
//! requests are ignored.

use std::sync::Arc;
use tokio::sync::watch;
use vortexia_core::domain::build::FailureKind;

/// Why a build is being stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// An operator asked for the build to stop
    Requested,
    /// The build ran past its maximum duration
    DeadlineExceeded,
}

impl CancelReason {
    /// Marker recorded on the step that was interrupted
    pub fn failure_kind(self) -> FailureKind {
        match self {
            CancelReason::Requested => FailureKind::Canceled,
            CancelReason::DeadlineExceeded => FailureKind::DeadlineExceeded,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            CancelReason::Requested => "build canceled by request",
            CancelReason::DeadlineExceeded => "build exceeded its maximum duration",
        }
    }
}

/// Creates a connected handle/signal pair
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(None);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// Sending side, held by the scheduler
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Option<CancelReason>>>,
}

impl CancelHandle {
    /// Requests cancellation; returns false if a reason was already recorded
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        })
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Receiving side, observed by step executors
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<Option<CancelReason>>,
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_, rx) = watch::channel(None);
        Self { rx }
    }

    /// The recorded reason, if cancellation was requested
    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested
    ///
    /// Pends forever if the handle is dropped without canceling.
    pub async fn cancelled(&mut self) -> CancelReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_reason_wins() {
        let (handle, signal) = cancel_pair();
        assert_eq!(signal.reason(), None);

        assert!(handle.cancel(CancelReason::DeadlineExceeded));
        assert!(!handle.cancel(CancelReason::Requested));

        assert_eq!(signal.reason(), Some(CancelReason::DeadlineExceeded));
        assert_eq!(
            signal.reason().map(CancelReason::failure_kind),
            Some(FailureKind::DeadlineExceeded)
        );
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let (handle, mut signal) = cancel_pair();

        let waiter = tokio::spawn(async move { signal.cancelled().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel(CancelReason::Requested);

        let reason = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CancelReason::Requested);
    }

    #[tokio::test]
    async fn test_signal_created_after_cancel_sees_reason() {
        let (handle, _signal) = cancel_pair();
        handle.cancel(CancelReason::Requested);

        let mut late = handle.signal();
        assert_eq!(late.cancelled().await, CancelReason::Requested);
    }

    #[tokio::test]
    async fn test_never_signal_stays_pending() {
        let mut signal = CancelSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(50), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
