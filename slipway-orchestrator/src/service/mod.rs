//! Service Module
//!
//! Business logic layer between the HTTP handlers and the engine.

pub mod deployment;

// Re-export for convenience
pub use deployment as deployment_service;
