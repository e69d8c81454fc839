//! Service layer
//!
//! Services hold the moving parts of a build run: cancellation signals, the
//! step executor and the log broadcaster. The scheduler wires them together.
//!
//! Executors are trait-based so tests and embedders can substitute their own.

mod broadcaster;
mod cancel;
mod executor;

// Re-export traits
pub use executor::{OutputSink, StepExecutor};

// Re-export implementations
pub use broadcaster::{LogBroadcaster, LogSubscription, LogWatch, StepOutput, SubscriptionEnd};
pub use cancel::{CancelHandle, CancelReason, CancelSignal, cancel_pair};
pub use executor::ShellExecutor;
