//! Read side of the engine
//!
//! Record lookups follow one order: in-memory run table (in-flight truth),
//! then the record store, then the archive's JSON mirror.

use slipway_core::domain::deployment::{DeploymentRecord, RunId, RunStatus};
use slipway_core::domain::log::LogChunk;
use thiserror::Error;
use tracing::warn;

use super::Engine;
use crate::repository::get_json;

/// Why a run cannot be proxied to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("deployment not found")]
    Unknown,
    #[error("deployment is {0}, not RUNNING")]
    NotRunning(RunStatus),
}

impl Engine {
    /// Current record of a run
    pub async fn describe(&self, run_id: &RunId) -> Option<DeploymentRecord> {
        if let Some(record) = self.tracked(run_id) {
            return Some(record);
        }

        match self.records.get_deployment(run_id).await {
            Ok(Some(record)) => return Some(record),
            Ok(None) => {}
            Err(e) => warn!("Record store lookup for run {} failed: {:#}", run_id, e),
        }

        match self.archived_meta(run_id).await {
            Some(value) => serde_json::from_value(value)
                .inspect_err(|e| warn!("Archived metadata of run {} is unreadable: {}", run_id, e))
                .ok(),
            None => None,
        }
    }

    /// Primary record and archive mirror of a run, side by side
    pub async fn meta(&self, run_id: &RunId) -> (Option<DeploymentRecord>, Option<serde_json::Value>) {
        let primary = match self.tracked(run_id) {
            Some(record) => Some(record),
            None => self
                .records
                .get_deployment(run_id)
                .await
                .inspect_err(|e| warn!("Record store lookup for run {} failed: {:#}", run_id, e))
                .ok()
                .flatten(),
        };
        (primary, self.archived_meta(run_id).await)
    }

    pub async fn status(&self, run_id: &RunId) -> Option<RunStatus> {
        self.describe(run_id).await.map(|record| record.status)
    }

    /// Host port of a RUNNING run, for the reverse proxy
    pub async fn resolve_target(&self, run_id: &RunId) -> Result<u16, TargetError> {
        let record = self.describe(run_id).await.ok_or(TargetError::Unknown)?;
        match (record.status, record.host_port) {
            (RunStatus::Running, Some(port)) => Ok(port),
            (status, _) => Err(TargetError::NotRunning(status)),
        }
    }

    /// Reads a run's log from `offset`; `None` if no log exists
    pub async fn read_log(&self, run_id: &RunId, offset: u64) -> anyhow::Result<Option<LogChunk>> {
        self.logs.read_from(run_id, offset).await
    }

    fn tracked(&self, run_id: &RunId) -> Option<DeploymentRecord> {
        self.runs.lock().get(run_id).map(|entry| entry.record.clone())
    }

    async fn archived_meta(&self, run_id: &RunId) -> Option<serde_json::Value> {
        get_json(self.archive.as_ref(), &run_id.meta_key())
            .await
            .inspect_err(|e| warn!("Archive lookup for run {} failed: {:#}", run_id, e))
            .ok()
            .flatten()
    }
}
