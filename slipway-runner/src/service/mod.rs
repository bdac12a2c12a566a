//! Service layer
//!
//! Services that sit between the engine and its collaborators: the log
//! pipeline that captures workload output, and source artifact packing.

pub mod artifact;
pub mod log_pipeline;

pub use log_pipeline::{LogPipeline, LogStream};
