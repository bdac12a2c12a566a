//! Workspace manager
//!
//! Checks repositories out into a deterministic cache path
//! (`<root>/<owner>/<repo>/<branch>`) and refreshes cached trees instead of
//! cloning again. Checkouts of the same coordinates are serialized by a
//! per-path lock; unrelated coordinates never wait on each other.

use async_trait::async_trait;
use parking_lot::Mutex;
use slipway_core::domain::build::RepoRef;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{DeployError, Result};
use crate::executor::command::run_streaming;
use crate::service::log_pipeline::LogStream;

/// A checked-out tree, locked against concurrent checkouts while held
#[derive(Debug)]
pub struct Checkout {
    pub path: PathBuf,
    _lock: Option<OwnedMutexGuard<()>>,
}

impl Checkout {
    /// A checkout that holds no lock (for providers without a shared cache)
    pub fn unlocked(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _lock: None,
        }
    }
}

/// Service trait for fetching source trees
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Makes the branch available locally and returns its path
    async fn checkout(
        &self,
        source: &RepoRef,
        log: &LogStream,
        cancel: &CancellationToken,
    ) -> Result<Checkout>;
}

/// Git-backed implementation of SourceProvider
pub struct WorkspaceManager {
    root: PathBuf,
    remote: String,
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            remote: remote.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Cache path of a branch; `/` in branch names becomes `~`
    pub fn path_for(&self, source: &RepoRef) -> PathBuf {
        self.root
            .join(&source.owner)
            .join(&source.repo)
            .join(source.branch.replace('/', "~"))
    }

    fn remote_url(&self, source: &RepoRef) -> String {
        format!(
            "{}/{}/{}.git",
            self.remote.trim_end_matches('/'),
            source.owner,
            source.repo
        )
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.lock().entry(path.to_path_buf()).or_default())
    }

    async fn git(
        &self,
        source: &RepoRef,
        args: &[&str],
        cwd: Option<&Path>,
        log: &LogStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(cwd) = cwd {
            cmd.current_dir(cwd);
        }

        let label = format!("git {}", args.first().copied().unwrap_or_default());
        let unavailable = |reason: String| DeployError::SourceUnavailable {
            coordinates: source.to_string(),
            reason,
        };

        match run_streaming(cmd, &label, log, cancel).await {
            Ok(outcome) if outcome.success() => Ok(()),
            Ok(outcome) => Err(unavailable(format!(
                "{} exited with code {}\n{}",
                label, outcome.exit_code, outcome.tail
            ))),
            Err(DeployError::BuildFailed { tail, .. }) => Err(unavailable(tail)),
            Err(e) => Err(e),
        }
    }

    async fn refresh(
        &self,
        source: &RepoRef,
        path: &Path,
        log: &LogStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let branch = source.branch.as_str();
        self.git(source, &["fetch", "origin", branch], Some(path), log, cancel)
            .await?;
        self.git(
            source,
            &["checkout", "-B", branch, "FETCH_HEAD"],
            Some(path),
            log,
            cancel,
        )
        .await?;
        self.git(source, &["reset", "--hard", "FETCH_HEAD"], Some(path), log, cancel)
            .await?;
        self.git(source, &["clean", "-fd"], Some(path), log, cancel)
            .await
    }

    async fn clone_fresh(
        &self,
        source: &RepoRef,
        path: &Path,
        log: &LogStream,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if path.exists() {
            debug!("Removing leftover directory {}", path.display());
            tokio::fs::remove_dir_all(path).await?;
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = self.remote_url(source);
        let target = path.to_string_lossy();
        self.git(
            source,
            &[
                "clone",
                "--branch",
                &source.branch,
                "--single-branch",
                "--",
                &url,
                &target,
            ],
            None,
            log,
            cancel,
        )
        .await
    }
}

#[async_trait]
impl SourceProvider for WorkspaceManager {
    async fn checkout(
        &self,
        source: &RepoRef,
        log: &LogStream,
        cancel: &CancellationToken,
    ) -> Result<Checkout> {
        source.validate().map_err(|e| DeployError::SourceUnavailable {
            coordinates: source.to_string(),
            reason: e.to_string(),
        })?;

        let path = self.path_for(source);
        let lock = self.lock_for(&path);
        let guard = tokio::select! {
            guard = lock.lock_owned() => guard,
            _ = cancel.cancelled() => return Err(DeployError::Cancelled),
        };

        if path.join(".git").is_dir() {
            log.append(&format!("Using cached repo at {}", path.display()))
                .await;
            self.refresh(source, &path, log, cancel).await?;
        } else {
            log.append(&format!("Cloning {}", source)).await;
            self.clone_fresh(source, &path, log, cancel).await?;
        }

        info!("Checked out {} at {}", source, path.display());
        Ok(Checkout {
            path,
            _lock: Some(guard),
        })
    }
}
