//! Deployment engine
//!
//! Drives every run through `QUEUED -> BUILDING -> RUNNING -> {STOPPED, FAILED}`:
//! - Each submitted run executes as its own task; unrelated runs never wait
//!   on each other
//! - The in-memory run table is the source of truth for in-flight runs; the
//!   record store and the archive's `meta/<id>.json` are mirrors, written
//!   best-effort on every transition
//! - Every transition appends a `==> Status: X` marker to the run's log
//! - Entering FAILED tears down whatever was started and releases the port
//! - A run leaves the table once its teardown is done and its log is retired;
//!   its id can only be submitted again after that

mod lookup;
mod watch;

use chrono::Utc;
use parking_lot::Mutex;
use slipway_core::domain::build::{BuildRecord, BuildRequest};
use slipway_core::domain::deployment::{DeploymentRecord, ExecutorKind, RunId, RunStatus};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{DeployError, Result};
use crate::executor::{self, BuildContext, Executor};
use crate::port::PortAllocator;
use crate::repository::{ArchiveStore, RecordStore, put_json};
use crate::retry::RetryPolicy;
use crate::service::artifact;
use crate::service::log_pipeline::{LogPipeline, LogStream};
use crate::supervisor::{RunHandle, Supervisor};
use crate::workspace::{SourceProvider, WorkspaceManager};

pub use lookup::TargetError;

/// Budget for mirror writes to the record store
const MIRROR_RETRY: RetryPolicy = RetryPolicy {
    interval: Duration::from_millis(200),
    max_attempts: Some(3),
    backoff: crate::retry::Backoff::Fixed,
};

/// How long `stop` waits for a cancelled build to wind down
const STOP_WAIT: RetryPolicy = RetryPolicy {
    interval: Duration::from_millis(100),
    max_attempts: Some(100),
    backoff: crate::retry::Backoff::Fixed,
};

struct RunEntry {
    record: DeploymentRecord,
    handle: Option<RunHandle>,
    cancel: CancellationToken,
    log: Arc<LogStream>,
    /// Serializes mirror writes so the last writer publishes the latest state
    publish: Arc<tokio::sync::Mutex<()>>,
}

/// Applies a transition to a record if the state machine allows it
fn apply(record: &mut DeploymentRecord, next: RunStatus, error: Option<String>) -> bool {
    if !record.status.can_transition_to(next) {
        return false;
    }
    record.status = next;
    record.updated_at = Utc::now();
    if error.is_some() {
        record.error = error;
    }
    true
}

fn store_error(e: anyhow::Error) -> DeployError {
    DeployError::Io(std::io::Error::other(format!("{:#}", e)))
}

pub struct Engine {
    config: Config,
    sources: Arc<dyn SourceProvider>,
    ports: PortAllocator,
    supervisor: Supervisor,
    logs: LogPipeline,
    records: Arc<dyn RecordStore>,
    archive: Arc<dyn ArchiveStore>,
    runs: Mutex<HashMap<RunId, RunEntry>>,
    submit_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    /// Builds an engine with git checkouts and the configured executor
    pub fn new(
        config: Config,
        records: Arc<dyn RecordStore>,
        archive: Arc<dyn ArchiveStore>,
    ) -> Arc<Self> {
        let sources = Arc::new(WorkspaceManager::new(
            config.workspace_root.clone(),
            config.git_remote.clone(),
        ));
        let executor = executor::from_config(&config);
        let ports = PortAllocator::new(config.port_min, config.port_max);
        Self::with_parts(config, sources, executor, ports, records, archive)
    }

    /// Builds an engine from explicit collaborators
    pub fn with_parts(
        config: Config,
        sources: Arc<dyn SourceProvider>,
        executor: Arc<dyn Executor>,
        ports: PortAllocator,
        records: Arc<dyn RecordStore>,
        archive: Arc<dyn ArchiveStore>,
    ) -> Arc<Self> {
        let supervisor = Supervisor::new(
            executor,
            RetryPolicy::fixed(config.ready_interval, config.ready_attempts),
        );
        let logs = LogPipeline::new(
            config.log_dir.clone(),
            Arc::clone(&archive),
            Arc::clone(&records),
            config.log_flush_interval,
            config.trim_local_logs,
        );
        Arc::new(Self {
            config,
            sources,
            ports,
            supervisor,
            logs,
            records,
            archive,
            runs: Mutex::new(HashMap::new()),
            submit_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn logs(&self) -> &LogPipeline {
        &self.logs
    }

    /// Accepts a build request and starts executing it in the background
    ///
    /// Returns the QUEUED record. Fails with `ConfigInvalid` for malformed
    /// coordinates or when the run id is still in flight or winding down.
    pub async fn submit(self: &Arc<Self>, request: BuildRequest) -> Result<DeploymentRecord> {
        request
            .source
            .validate()
            .map_err(|e| DeployError::ConfigInvalid(e.to_string()))?;

        let _submitting = self.submit_lock.lock().await;
        let run_id = request.run_id.clone();
        let tracked = self.runs.lock().get(&run_id).map(|entry| entry.record.status);
        match tracked {
            Some(status) if status.is_terminal() => {
                return Err(DeployError::ConfigInvalid(format!(
                    "run {} is {} but still shutting down",
                    run_id, status
                )));
            }
            Some(_) => {
                return Err(DeployError::ConfigInvalid(format!(
                    "run {} is already in progress",
                    run_id
                )));
            }
            None => {}
        }

        let log = self
            .logs
            .open(&run_id, request.build_id)
            .await
            .map_err(store_error)?;

        let now = Utc::now();
        let record = DeploymentRecord {
            id: run_id.clone(),
            build_id: request.build_id,
            owner: request.source.owner.clone(),
            repo: request.source.repo.clone(),
            branch: request.source.branch.clone(),
            status: RunStatus::Queued,
            host_port: None,
            workload: None,
            error: None,
            created_at: now,
            updated_at: now,
        };
        let build = BuildRecord {
            id: request.build_id,
            run_id: run_id.clone(),
            status: RunStatus::Queued,
            logs: String::new(),
            error: None,
            created_at: now,
            updated_at: now,
        };
        if let Err(e) = MIRROR_RETRY
            .retry(|_| self.records.create_build(&build))
            .await
        {
            warn!("Failed to create build record for run {}: {:#}", run_id, e.last);
        }

        let cancel = CancellationToken::new();
        self.runs.lock().insert(
            run_id.clone(),
            RunEntry {
                record: record.clone(),
                handle: None,
                cancel: cancel.clone(),
                log: Arc::clone(&log),
                publish: Arc::new(tokio::sync::Mutex::new(())),
            },
        );

        info!(
            "Accepted run {} for {} (correlation {})",
            run_id, request.source, request.correlation_id
        );
        self.publish(&run_id, RunStatus::Queued).await;

        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.execute(request, log, cancel).await });

        Ok(record)
    }

    async fn execute(
        self: Arc<Self>,
        request: BuildRequest,
        log: Arc<LogStream>,
        cancel: CancellationToken,
    ) {
        if let Err(e) = self.run_pipeline(&request, &log, &cancel).await {
            self.fail(&request.run_id, e).await;
        }
    }

    async fn run_pipeline(
        &self,
        request: &BuildRequest,
        log: &Arc<LogStream>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let run_id = &request.run_id;
        if cancel.is_cancelled() {
            return Err(DeployError::Cancelled);
        }
        self.transition(run_id, RunStatus::Building, None).await;

        let checkout = self.sources.checkout(&request.source, log, cancel).await?;
        let executor = self.supervisor.executor();
        let artifact = executor
            .build(BuildContext {
                run_id,
                workspace: &checkout.path,
                env: &request.env,
                log,
                cancel,
            })
            .await?;
        log.checkpoint().await;

        let lease = self.ports.allocate()?;
        log.marker(&format!("Allocated port {}", lease.port())).await;

        let handle = tokio::select! {
            started = self.supervisor.start(run_id, &artifact, lease, &request.env, Arc::clone(log)) => started?,
            _ = cancel.cancelled() => {
                if let Err(e) = self.supervisor.stop_by_id(run_id, None).await {
                    warn!("Cleanup of cancelled start for run {} failed: {}", run_id, e);
                }
                return Err(DeployError::Cancelled);
            }
        };

        let rejected = {
            let mut runs = self.runs.lock();
            match runs.get_mut(run_id).filter(|_| !cancel.is_cancelled()) {
                Some(entry) if entry.record.status.can_transition_to(RunStatus::Running) => {
                    entry.record.host_port = Some(handle.port());
                    entry.record.workload = Some(handle.workload.clone());
                    apply(&mut entry.record, RunStatus::Running, None);
                    entry.handle = Some(handle);
                    None
                }
                _ => Some(handle),
            }
        };
        if let Some(mut handle) = rejected {
            if let Err(e) = self.supervisor.stop(&mut handle).await {
                warn!("Teardown of rejected run {} failed: {}", run_id, e);
            }
            return Err(DeployError::Cancelled);
        }

        info!("Run {} is RUNNING", run_id);
        self.publish(run_id, RunStatus::Running).await;
        log.checkpoint().await;

        if self.config.upload_artifacts && executor.kind() == ExecutorKind::Container {
            self.upload_artifact(run_id, &checkout.path, log).await;
        }
        Ok(())
    }

    /// Moves a run to FAILED, tearing down anything it started
    async fn fail(&self, run_id: &RunId, err: DeployError) {
        let message = err.status_message();
        warn!("Run {} failed: {}", run_id, message);

        let taken = {
            let mut runs = self.runs.lock();
            runs.get_mut(run_id).map(|entry| {
                let applied = apply(&mut entry.record, RunStatus::Failed, Some(message.clone()));
                (entry.handle.take(), Arc::clone(&entry.log), applied)
            })
        };
        let Some((handle, log, applied)) = taken else {
            error!("Run {} failed but is not tracked", run_id);
            return;
        };

        self.teardown(run_id, handle, &log).await;
        log.append(&format!("ERROR: {}", message)).await;
        if applied {
            self.publish(run_id, RunStatus::Failed).await;
        }
        log.retire().await;
        self.evict(run_id, &log);
    }

    /// Stops a run
    ///
    /// RUNNING runs are torn down and become STOPPED. QUEUED and BUILDING
    /// runs are cancelled and end up FAILED. Terminal runs are left alone.
    /// Runs this process does not know are torn down by their derived
    /// workload name and their mirrored record is updated. Never fails:
    /// teardown problems are logged and the run is treated as stopped.
    pub async fn stop(&self, run_id: &RunId) -> RunStatus {
        enum Action {
            Teardown(Option<RunHandle>, Arc<LogStream>),
            Cancel(CancellationToken),
            Settled(RunStatus),
        }

        let action = {
            let mut runs = self.runs.lock();
            runs.get_mut(run_id).map(|entry| match entry.record.status {
                RunStatus::Running => {
                    apply(&mut entry.record, RunStatus::Stopped, None);
                    Action::Teardown(entry.handle.take(), Arc::clone(&entry.log))
                }
                RunStatus::Queued | RunStatus::Building => Action::Cancel(entry.cancel.clone()),
                settled => Action::Settled(settled),
            })
        };

        match action {
            None => self.stop_untracked(run_id).await,
            Some(Action::Teardown(handle, log)) => {
                info!("Stopping run {}", run_id);
                self.teardown(run_id, handle, &log).await;
                self.publish(run_id, RunStatus::Stopped).await;
                log.retire().await;
                self.evict(run_id, &log);
                RunStatus::Stopped
            }
            Some(Action::Cancel(cancel)) => {
                info!("Cancelling run {} before it reached RUNNING", run_id);
                cancel.cancel();
                self.wait_settled(run_id).await
            }
            Some(Action::Settled(status)) => {
                debug!("Run {} is already {}", run_id, status);
                status
            }
        }
    }

    /// Stops a run this process no longer tracks, going by its stored record
    ///
    /// The recorded workload is what gets signalled, so a native process
    /// started before a restart is found by its pid. Runs whose record is
    /// already terminal are not touched again.
    async fn stop_untracked(&self, run_id: &RunId) -> RunStatus {
        let record = match self.records.get_deployment(run_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to load record of run {}: {:#}", run_id, e);
                None
            }
        };

        let Some(mut record) = record else {
            if let Err(e) = self.supervisor.stop_by_id(run_id, None).await {
                warn!("Stop of unknown run {} not confirmed: {}", run_id, e);
            }
            return RunStatus::Stopped;
        };
        if record.status.is_terminal() {
            debug!("Run {} is already {}", run_id, record.status);
            return record.status;
        }

        if let Err(e) = self
            .supervisor
            .stop_by_id(run_id, record.workload.as_ref())
            .await
        {
            warn!("Stop of untracked run {} not confirmed: {}", run_id, e);
        }

        let changed = match record.status {
            RunStatus::Running => apply(&mut record, RunStatus::Stopped, None),
            _ => apply(
                &mut record,
                RunStatus::Failed,
                Some(DeployError::Cancelled.status_message()),
            ),
        };
        if changed {
            self.mirror(&record).await;
        }
        record.status
    }

    async fn wait_settled(&self, run_id: &RunId) -> RunStatus {
        let mut pacer = STOP_WAIT.pacer();
        let mut status = RunStatus::Queued;
        while pacer.tick().await {
            let current = self.runs.lock().get(run_id).map(|entry| entry.record.status);
            let Some(current) = current else {
                // Already evicted; the mirror holds the final state
                return self.status(run_id).await.unwrap_or(RunStatus::Failed);
            };
            status = current;
            if status.is_terminal() {
                break;
            }
        }
        status
    }

    /// Stops a workload and releases its port, tolerating a missing handle
    async fn teardown(&self, run_id: &RunId, handle: Option<RunHandle>, log: &LogStream) {
        let result = match handle {
            Some(mut handle) => self.supervisor.stop(&mut handle).await,
            None => self.supervisor.stop_by_id(run_id, None).await,
        };
        if let Err(e) = result {
            warn!("Teardown of run {} not confirmed: {}", run_id, e);
            log.append(&format!("WARN: {}", e.status_message())).await;
        }
    }

    /// Drops a settled run from the table
    ///
    /// Only the entry owning `log` is removed, so a later run under the same
    /// id is never evicted by an older teardown.
    fn evict(&self, run_id: &RunId, log: &Arc<LogStream>) {
        let mut runs = self.runs.lock();
        if runs
            .get(run_id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.log, log))
        {
            runs.remove(run_id);
            debug!("Evicted settled run {}", run_id);
        }
    }

    /// Applies a transition in memory and publishes it
    async fn transition(&self, run_id: &RunId, next: RunStatus, error: Option<String>) -> bool {
        let applied = self
            .runs
            .lock()
            .get_mut(run_id)
            .is_some_and(|entry| apply(&mut entry.record, next, error));
        if applied {
            info!("Run {} is {}", run_id, next);
            self.publish(run_id, next).await;
        }
        applied
    }

    /// Writes the marker line and mirrors the current record
    async fn publish(&self, run_id: &RunId, status: RunStatus) {
        let Some((lock, log)) = self
            .runs
            .lock()
            .get(run_id)
            .map(|entry| (Arc::clone(&entry.publish), Arc::clone(&entry.log)))
        else {
            return;
        };

        let _publishing = lock.lock().await;
        log.marker(&format!("Status: {}", status)).await;

        let record = self.runs.lock().get(run_id).map(|entry| entry.record.clone());
        if let Some(record) = record {
            self.mirror(&record).await;
        }
    }

    /// Best-effort write of a record to the record store and the archive
    async fn mirror(&self, record: &DeploymentRecord) {
        if let Err(e) = MIRROR_RETRY
            .retry(|_| self.records.upsert_deployment(record))
            .await
        {
            warn!(
                "Failed to mirror run {} after {} attempts: {:#}",
                record.id, e.attempts, e.last
            );
        }

        if let Err(e) = MIRROR_RETRY
            .retry(|_| {
                self.records
                    .update_build_status(record.build_id, record.status, record.error.as_deref())
            })
            .await
        {
            warn!("Failed to update build {}: {:#}", record.build_id, e.last);
        }

        if let Err(e) = put_json(self.archive.as_ref(), &record.id.meta_key(), record).await {
            warn!("Failed to archive metadata of run {}: {:#}", record.id, e);
        }
    }

    async fn upload_artifact(&self, run_id: &RunId, workspace: &Path, log: &LogStream) {
        let uploaded = async {
            let body = artifact::pack_workspace(workspace).await?;
            let size = body.len();
            self.archive
                .put(&run_id.artifact_key(), body, "application/gzip")
                .await?;
            anyhow::Ok(size)
        }
        .await;

        match uploaded {
            Ok(size) => {
                debug!("Archived {} bytes of source for run {}", size, run_id);
                log.append(&format!("Uploaded source artifact {}", run_id.artifact_key()))
                    .await;
            }
            Err(e) => {
                warn!("Failed to upload source artifact for run {}: {:#}", run_id, e);
                log.append(&format!("WARN: failed to upload source artifact: {:#}", e))
                    .await;
            }
        }
    }
}
