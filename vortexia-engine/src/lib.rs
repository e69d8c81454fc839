//! Vortexia build execution engine
//!
//! Turns a pipeline into a build, runs its steps in order as OS processes,
//! records every transition through a [`repository::PersistenceGateway`] and
//! streams step output to live subscribers.

pub mod config;
pub mod error;
pub mod repository;
mod retry;
pub mod scheduler;
pub mod service;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use repository::{GatewayError, InMemoryStore, PersistenceGateway, PipelineSource};
pub use scheduler::Scheduler;
