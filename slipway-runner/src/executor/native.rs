//! Native process strategy
//!
//! Installs dependencies in the workspace and runs the detected start
//! command as a child process in its own process group. Children start from
//! an empty environment: a few base variables from the host, then the
//! caller's variables, then the values the engine forces (`NODE_ENV` for
//! builds, `PORT` for runs), which callers cannot override.

use async_trait::async_trait;
use parking_lot::Mutex;
use slipway_core::domain::deployment::{ExecutorKind, RunId, WorkloadRef};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::command::{next_line, run_streaming};
use super::detect::detect_node_app;
use super::{Artifact, BuildContext, Executor, StartContext};
use crate::error::{DeployError, Result};
use crate::retry::RetryPolicy;
use crate::service::log_pipeline::LogStream;

/// Host variables passed through to every child
const BASE_VARS: [&str; 4] = ["PATH", "HOME", "LANG", "TMPDIR"];

/// How long a process group gets to exit after SIGTERM
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Builds a child environment; later layers win
pub fn child_env(
    caller: &BTreeMap<String, String>,
    forced: &[(&str, String)],
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = BASE_VARS
        .iter()
        .filter_map(|key| std::env::var(key).ok().map(|value| (key.to_string(), value)))
        .collect();
    env.extend(caller.iter().map(|(k, v)| (k.clone(), v.clone())));
    for (key, value) in forced {
        env.insert(key.to_string(), value.clone());
    }
    env
}

fn shell(script: &str, cwd: &Path, env: &BTreeMap<String, String>) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(script)
        .current_dir(cwd)
        .env_clear()
        .envs(env);
    cmd
}

/// Executor that runs apps directly on the host
#[derive(Default)]
pub struct NativeExecutor {
    children: Mutex<HashMap<RunId, Child>>,
}

impl NativeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn pid_of(&self, run_id: &RunId, workload: Option<&WorkloadRef>) -> Option<u32> {
        match workload {
            Some(WorkloadRef::Process { pid }) => Some(*pid),
            _ => self.children.lock().get(run_id).and_then(Child::id),
        }
    }
}

#[async_trait]
impl Executor for NativeExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Native
    }

    async fn build(&self, ctx: BuildContext<'_>) -> Result<Artifact> {
        let app = detect_node_app(ctx.workspace)?;

        let install = app.package_manager.install_command(app.lockfile.is_some());
        ctx.log
            .marker(&format!(
                "Installing dependencies with {}",
                app.package_manager
            ))
            .await;
        let env = child_env(ctx.env, &[]);
        run_streaming(shell(&install, ctx.workspace, &env), &install, ctx.log, ctx.cancel)
            .await?
            .into_build_result(&install)?;

        if let Some(build) = &app.build_command {
            ctx.log.marker("Building application").await;
            let env = child_env(ctx.env, &[("NODE_ENV", "production".to_string())]);
            run_streaming(shell(build, ctx.workspace, &env), build, ctx.log, ctx.cancel)
                .await?
                .into_build_result(build)?;
        }

        info!("Installed app for run {} ({})", ctx.run_id, app.start_command);
        Ok(Artifact::AppTree {
            root: ctx.workspace.to_path_buf(),
            start_command: app.start_command,
        })
    }

    async fn start(&self, ctx: StartContext<'_>) -> Result<WorkloadRef> {
        let Artifact::AppTree {
            root,
            start_command,
        } = ctx.artifact
        else {
            return Err(DeployError::RuntimeCrash(
                "native executor needs an application tree".to_string(),
            ));
        };

        // A previous child under the same id would otherwise leak
        if self.children.lock().contains_key(ctx.run_id) {
            self.stop(ctx.run_id, None).await.ok();
        }

        let env = child_env(ctx.env, &[("PORT", ctx.host_port.to_string())]);
        let mut cmd = shell(start_command, root, &env);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        ctx.log
            .marker(&format!(
                "Starting `{}` on port {}",
                start_command, ctx.host_port
            ))
            .await;

        let mut child = cmd
            .spawn()
            .map_err(|e| DeployError::RuntimeCrash(format!("failed to spawn app: {}", e)))?;
        let pid = child
            .id()
            .ok_or_else(|| DeployError::RuntimeCrash("app exited immediately".to_string()))?;

        tokio::spawn(pump_runtime_output(
            child.stdout.take(),
            child.stderr.take(),
            Arc::clone(&ctx.log),
        ));
        self.children.lock().insert(ctx.run_id.clone(), child);

        info!("Started process group {} for run {}", pid, ctx.run_id);
        Ok(WorkloadRef::Process { pid })
    }

    async fn stop(&self, run_id: &RunId, workload: Option<&WorkloadRef>) -> Result<()> {
        let pid = self.pid_of(run_id, workload);
        let mut child = self.children.lock().remove(run_id);

        let Some(pid) = pid else {
            debug!("No process to stop for run {}", run_id);
            return Ok(());
        };

        if !signal_group(pid, libc::SIGTERM)? {
            reap(child).await;
            return Ok(());
        }

        let exited = match child.as_mut() {
            Some(child) => tokio::time::timeout(GRACE_PERIOD, child.wait())
                .await
                .is_ok(),
            None => {
                let grace = RetryPolicy::fixed(Duration::from_millis(100), 50);
                grace
                    .retry(|_| async move {
                        if process_exists(pid) { Err(()) } else { Ok(()) }
                    })
                    .await
                    .is_ok()
            }
        };

        if !exited {
            warn!(
                "Process group {} ignored SIGTERM, sending SIGKILL (run {})",
                pid, run_id
            );
            signal_group(pid, libc::SIGKILL)?;
        }
        reap(child).await;

        info!("Stopped process group {} for run {}", pid, run_id);
        Ok(())
    }

    async fn is_alive(&self, workload: &WorkloadRef) -> bool {
        let WorkloadRef::Process { pid } = workload else {
            return false;
        };

        let mut children = self.children.lock();
        let tracked = children
            .iter_mut()
            .find(|(_, child)| child.id() == Some(*pid));
        match tracked {
            Some((_, child)) => matches!(child.try_wait(), Ok(None)),
            None => process_exists(*pid),
        }
    }
}

/// Sends `signal` to a process group; `Ok(false)` if the group is gone
fn signal_group(pid: u32, signal: libc::c_int) -> Result<bool> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| DeployError::StopFailed(format!("invalid pid {}", pid)))?;
    // SAFETY: killpg has no memory-safety preconditions
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(false);
    }
    Err(DeployError::StopFailed(format!(
        "failed to signal process group {}: {}",
        pid, err
    )))
}

fn process_exists(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 only checks for existence
    unsafe { libc::kill(pid, 0) == 0 }
}

async fn reap(child: Option<Child>) {
    if let Some(mut child) = child {
        let _ = child.wait().await;
    }
}

/// Streams a running app's output into its log until both pipes close
async fn pump_runtime_output<O, E>(stdout: Option<O>, stderr: Option<E>, log: Arc<LogStream>)
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = stdout.map(BufReader::new);
    let mut err = stderr.map(BufReader::new);
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();

    while out.is_some() || err.is_some() {
        tokio::select! {
            read = next_line(out.as_mut(), &mut out_buf), if out.is_some() => match read {
                Some(line) => log.append(&format!("[STDOUT] {}", line)).await,
                None => out = None,
            },
            read = next_line(err.as_mut(), &mut err_buf), if err.is_some() => match read {
                Some(line) => log.append(&format!("[STDERR] {}", line)).await,
                None => err = None,
            },
        }
    }
    debug!("Output of run {} closed", log.run_id());
}
