//! Streaming command execution
//!
//! Runs an external command, mirroring every stdout/stderr line into a run's
//! log as it arrives and remembering the last lines for error reports.

use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{DeployError, Result};
use crate::service::log_pipeline::LogStream;

/// Number of trailing output lines kept for failure messages
pub(crate) const TAIL_LINES: usize = 30;

/// Exit status and trailing output of a finished command
#[derive(Debug)]
pub(crate) struct CommandOutcome {
    pub exit_code: i32,
    pub tail: String,
}

impl CommandOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Converts a non-zero exit into `BuildFailed`
    pub fn into_build_result(self, label: &str) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        Err(DeployError::BuildFailed {
            command: label.to_string(),
            exit_code: self.exit_code,
            tail: self.tail,
        })
    }
}

/// Runs `cmd` to completion, streaming its output into `log`
///
/// The child is killed if `cancel` fires; the call then returns `Cancelled`.
pub(crate) async fn run_streaming(
    mut cmd: Command,
    label: &str,
    log: &LogStream,
    cancel: &CancellationToken,
) -> Result<CommandOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!("Running `{}` for run {}", label, log.run_id());

    let mut child = cmd.spawn().map_err(|e| DeployError::BuildFailed {
        command: label.to_string(),
        exit_code: -1,
        tail: format!("failed to spawn: {}", e),
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut tail = VecDeque::with_capacity(TAIL_LINES);

    let pump = pump_lines(stdout, stderr, log, &mut tail);
    tokio::select! {
        _ = pump => {}
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(DeployError::Cancelled);
        }
    }

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(DeployError::Cancelled);
        }
    };

    Ok(CommandOutcome {
        exit_code: status.code().unwrap_or(-1),
        tail: Vec::from(tail).join("\n"),
    })
}

/// Copies both output pipes line by line until they close
async fn pump_lines<O, E>(
    stdout: Option<O>,
    stderr: Option<E>,
    log: &LogStream,
    tail: &mut VecDeque<String>,
) where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out = stdout.map(BufReader::new);
    let mut err = stderr.map(BufReader::new);
    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();

    while out.is_some() || err.is_some() {
        let line = tokio::select! {
            read = next_line(out.as_mut(), &mut out_buf), if out.is_some() => {
                match read {
                    Some(line) => line,
                    None => { out = None; continue; }
                }
            }
            read = next_line(err.as_mut(), &mut err_buf), if err.is_some() => {
                match read {
                    Some(line) => line,
                    None => { err = None; continue; }
                }
            }
        };

        log.append(&line).await;
        if tail.len() == TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}

/// Reads one line, decoding lossily; `None` at EOF or on a read error
pub(crate) async fn next_line<R>(reader: Option<&mut BufReader<R>>, buf: &mut Vec<u8>) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let reader = reader?;
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => {
            let text = String::from_utf8_lossy(buf);
            Some(text.trim_end_matches(['\n', '\r']).to_string())
        }
    }
}
