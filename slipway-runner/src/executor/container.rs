//! Container strategy
//!
//! Builds an image per run and runs it as a locked-down container:
//! - Image and container names derive from the run id, so a run can be torn
//!   down by id alone after a restart
//! - The app listens on [`INTERNAL_PORT`] inside the container, published on
//!   the allocated host port
//! - Read-only root filesystem, dropped capabilities, no-new-privileges and
//!   memory/CPU caps
//! - Stopping a run also drops its image, best-effort

use async_trait::async_trait;
use slipway_core::domain::deployment::{ExecutorKind, RunId, WorkloadRef};
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::command::run_streaming;
use super::dockerfile::{self, DOCKERFILE};
use super::{Artifact, BuildContext, Executor, StartContext};
use crate::config::INTERNAL_PORT;
use crate::error::{DeployError, Result};

/// Checks that the container CLI is installed and answering
pub async fn check_available(cli: &str) -> anyhow::Result<()> {
    let output = Command::new(cli)
        .arg("--version")
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to execute '{} --version': {}", cli, e))?;

    if !output.status.success() {
        anyhow::bail!("{} is not working correctly", cli);
    }

    let version = String::from_utf8_lossy(&output.stdout);
    info!("Container runtime is available: {}", version.trim());
    Ok(())
}

/// Executor that builds images and runs containers through a docker-compatible CLI
pub struct ContainerExecutor {
    cli: String,
    memory: String,
    cpus: String,
}

impl ContainerExecutor {
    pub fn new(cli: impl Into<String>, memory: impl Into<String>, cpus: impl Into<String>) -> Self {
        Self {
            cli: cli.into(),
            memory: memory.into(),
            cpus: cpus.into(),
        }
    }

    /// Arguments of the `run` invocation for one workload
    pub fn run_args(
        &self,
        run_id: &RunId,
        image: &str,
        host_port: u16,
        env: &BTreeMap<String, String>,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            run_id.container_name(),
            "-p".to_string(),
            format!("{}:{}", host_port, INTERNAL_PORT),
            "--read-only".to_string(),
            "--tmpfs".to_string(),
            "/tmp".to_string(),
            "--memory".to_string(),
            self.memory.clone(),
            "--cpus".to_string(),
            self.cpus.clone(),
            "--cap-drop".to_string(),
            "ALL".to_string(),
            "--security-opt".to_string(),
            "no-new-privileges:true".to_string(),
        ];
        for (key, value) in env {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(image.to_string());
        args
    }

    /// Force-removes a container; a missing container counts as removed
    async fn remove(&self, name: &str) -> Result<()> {
        let output = Command::new(&self.cli)
            .args(["rm", "-f", name])
            .output()
            .await
            .map_err(|e| DeployError::StopFailed(format!("{} rm: {}", self.cli, e)))?;

        if output.status.success() {
            debug!("Container {} removed", name);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.to_lowercase().contains("no such container") {
            debug!("Container {} already gone", name);
            return Ok(());
        }
        Err(DeployError::StopFailed(format!(
            "failed to remove container {}: {}",
            name,
            stderr.trim()
        )))
    }

    /// Removes a per-run image; failures are only logged
    async fn remove_image(&self, tag: &str) {
        match Command::new(&self.cli).args(["rmi", "-f", tag]).output().await {
            Ok(output) if output.status.success() => debug!("Image {} removed", tag),
            Ok(output) => debug!(
                "Image {} not removed: {}",
                tag,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("Failed to remove image {}: {}", tag, e),
        }
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Container
    }

    async fn build(&self, ctx: BuildContext<'_>) -> Result<Artifact> {
        dockerfile::prepare(ctx.workspace, ctx.log).await?;

        let tag = ctx.run_id.image_tag();
        ctx.log.marker(&format!("Building image {}", tag)).await;

        let mut cmd = Command::new(&self.cli);
        cmd.args(["build", "-t", &tag, "-f", DOCKERFILE, "."])
            .current_dir(ctx.workspace);
        let label = format!("{} build", self.cli);
        run_streaming(cmd, &label, ctx.log, ctx.cancel)
            .await?
            .into_build_result(&label)?;

        info!("Built image {} for run {}", tag, ctx.run_id);
        Ok(Artifact::Image { tag })
    }

    async fn start(&self, ctx: StartContext<'_>) -> Result<WorkloadRef> {
        let Artifact::Image { tag } = ctx.artifact else {
            return Err(DeployError::RuntimeCrash(
                "container executor needs an image artifact".to_string(),
            ));
        };

        let name = ctx.run_id.container_name();
        if let Err(e) = self.remove(&name).await {
            warn!("Could not remove stale container {}: {}", name, e);
        }

        let args = self.run_args(ctx.run_id, tag, ctx.host_port, ctx.env);
        ctx.log
            .marker(&format!(
                "Starting container {} on port {}",
                name, ctx.host_port
            ))
            .await;

        let output = Command::new(&self.cli)
            .args(&args)
            .output()
            .await
            .map_err(|e| DeployError::RuntimeCrash(format!("{} run: {}", self.cli, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            ctx.log.append(stderr.trim_end()).await;
        }

        if !output.status.success() {
            return Err(DeployError::RuntimeCrash(format!(
                "container {} failed to start (exit code {}): {}",
                name,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        info!(
            "Container {} started with ID {} for run {}",
            name,
            stdout.trim(),
            ctx.run_id
        );
        Ok(WorkloadRef::Container { name })
    }

    async fn stop(&self, run_id: &RunId, workload: Option<&WorkloadRef>) -> Result<()> {
        let name = match workload {
            Some(WorkloadRef::Container { name }) => name.clone(),
            _ => run_id.container_name(),
        };
        let removed = self.remove(&name).await;
        self.remove_image(&run_id.image_tag()).await;
        removed
    }

    async fn is_alive(&self, workload: &WorkloadRef) -> bool {
        let WorkloadRef::Container { name } = workload else {
            return false;
        };
        match Command::new(&self.cli)
            .args(["inspect", "-f", "{{.State.Running}}", name])
            .output()
            .await
        {
            Ok(output) => {
                output.status.success() && String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            Err(e) => {
                warn!("Failed to inspect container {}: {}", name, e);
                false
            }
        }
    }
}
