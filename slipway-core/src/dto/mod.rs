//! Data Transfer Objects
//!
//! Request and response bodies of the Slipway HTTP API.

pub mod build;
pub mod deployment;
pub mod log;
