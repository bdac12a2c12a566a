//! Build executors
//!
//! A build executor turns a checked-out workspace into a runnable artifact and
//! knows how to start, stop and probe the workload it produces. Two
//! interchangeable strategies implement the same [`Executor`] trait:
//! - [`ContainerExecutor`]: builds an image and runs it as a locked-down container
//! - [`NativeExecutor`]: installs dependencies and spawns the app as a process group

pub(crate) mod command;
pub mod container;
pub mod detect;
pub mod dockerfile;
pub mod native;

use async_trait::async_trait;
use slipway_core::domain::deployment::{ExecutorKind, RunId, WorkloadRef};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;
use crate::service::log_pipeline::LogStream;

pub use container::ContainerExecutor;
pub use native::NativeExecutor;

/// Output of a successful build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    /// A locally tagged container image
    Image { tag: String },
    /// An installed (and possibly compiled) application tree
    AppTree { root: PathBuf, start_command: String },
}

/// Inputs of the build phase
pub struct BuildContext<'a> {
    pub run_id: &'a RunId,
    pub workspace: &'a Path,
    pub env: &'a BTreeMap<String, String>,
    pub log: &'a LogStream,
    pub cancel: &'a CancellationToken,
}

/// Inputs of the start phase
pub struct StartContext<'a> {
    pub run_id: &'a RunId,
    pub artifact: &'a Artifact,
    pub host_port: u16,
    pub env: &'a BTreeMap<String, String>,
    /// Owned handle so runtime output can keep flowing after `start` returns
    pub log: Arc<LogStream>,
}

/// Service trait for a build-and-run strategy
#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Produces a runnable artifact from the workspace
    async fn build(&self, ctx: BuildContext<'_>) -> Result<Artifact>;

    /// Starts the workload with its HTTP port bound to `host_port`
    async fn start(&self, ctx: StartContext<'_>) -> Result<WorkloadRef>;

    /// Tears down the workload of a run
    ///
    /// Must be idempotent and must tolerate a workload that is already gone
    /// or never fully started. `workload` is `None` when only the run id is
    /// known (e.g. after a restart).
    async fn stop(&self, run_id: &RunId, workload: Option<&WorkloadRef>) -> Result<()>;

    async fn is_alive(&self, workload: &WorkloadRef) -> bool;
}

/// Builds the executor selected by configuration
pub fn from_config(config: &Config) -> Arc<dyn Executor> {
    match config.executor {
        ExecutorKind::Container => Arc::new(ContainerExecutor::new(
            config.container_cli.clone(),
            config.run_memory.clone(),
            config.run_cpus.clone(),
        )),
        ExecutorKind::Native => Arc::new(NativeExecutor::new()),
    }
}
