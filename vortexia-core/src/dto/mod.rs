//! Data Transfer Objects for the trigger API
//!
//! These are the shapes exchanged between the engine and whatever front end
//! adapts it (HTTP handlers, CLIs). They are lightweight views over the domain
//! types, optimized for transfer.

pub mod build;
pub mod log;
