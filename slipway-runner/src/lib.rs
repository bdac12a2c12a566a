//! Slipway build-and-run engine
//!
//! Turns a GitHub repository branch into a running HTTP workload on this host.
//!
//! Architecture:
//! - Configuration: tunables with defaults and environment overrides
//! - Workspace: deterministic, cached git checkouts
//! - Executors: container and native-process build/run strategies
//! - Ports: atomic host port leasing
//! - Supervisor: start, readiness, teardown of one workload
//! - Log pipeline: local append-only buffers mirrored to the archive
//! - Repositories: record store and archive contracts
//! - Engine: the per-run state machine tying it all together

pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod port;
pub mod repository;
pub mod retry;
pub mod service;
pub mod supervisor;
pub mod workspace;

pub use config::Config;
pub use engine::{Engine, TargetError};
pub use error::{DeployError, Result};
