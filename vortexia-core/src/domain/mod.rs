//! Core domain types
//!
//! This module contains the core domain structures used across Vortexia crates.
//! These types represent the fundamental business entities and are shared between
//! the engine (for execution) and the orchestrator (for persistence).

pub mod build;
pub mod log;
pub mod pipeline;
