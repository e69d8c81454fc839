//! Vortexia Core
//!
//! Core types and pure logic for the Vortexia build execution engine.
//!
//! This crate contains:
//! - Domain types: Pipeline, Build, BuildStep, LogChunk
//! - The build status state machine
//! - The pipeline configuration resolver
//! - DTOs: Data transfer objects for the trigger API

pub mod domain;
pub mod dto;
pub mod resolver;
pub mod state;
