//! Core domain types
//!
//! These types represent the fundamental entities of a deployment and are shared
//! between the engine (which drives runs) and the service (which persists and
//! serves them).

pub mod build;
pub mod deployment;
pub mod log;
