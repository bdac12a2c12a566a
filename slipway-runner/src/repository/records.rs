//! Records repository
//!
//! Create/update contract for build and deployment records. The store is an
//! eventually-consistent mirror of engine state, never the source of truth for
//! a run that is still in flight.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use slipway_core::domain::build::BuildRecord;
use slipway_core::domain::deployment::{DeploymentRecord, RunId, RunStatus};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// Repository trait for build and deployment records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Creates a build record
    async fn create_build(&self, record: &BuildRecord) -> Result<()>;

    /// Updates the status (and failure message) of a build
    async fn update_build_status(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Appends text to the accumulated log of a build
    async fn append_build_log(&self, id: Uuid, text: &str) -> Result<()>;

    async fn get_build(&self, id: Uuid) -> Result<Option<BuildRecord>>;

    /// Inserts or replaces a deployment record
    async fn upsert_deployment(&self, record: &DeploymentRecord) -> Result<()>;

    async fn get_deployment(&self, id: &RunId) -> Result<Option<DeploymentRecord>>;
}

/// In-memory implementation of RecordStore
#[derive(Default)]
pub struct InMemoryRecordStore {
    builds: Mutex<HashMap<Uuid, BuildRecord>>,
    deployments: Mutex<HashMap<RunId, DeploymentRecord>>,
    unavailable: AtomicBool,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail (or succeed again)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("record store unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create_build(&self, record: &BuildRecord) -> Result<()> {
        self.check()?;
        self.builds.lock().insert(record.id, record.clone());
        Ok(())
    }

    async fn update_build_status(
        &self,
        id: Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        self.check()?;
        let mut builds = self.builds.lock();
        let build = builds
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("build {} not found", id))?;
        build.status = status;
        if let Some(error) = error {
            build.error = Some(error.to_string());
        }
        build.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn append_build_log(&self, id: Uuid, text: &str) -> Result<()> {
        self.check()?;
        let mut builds = self.builds.lock();
        let build = builds
            .get_mut(&id)
            .ok_or_else(|| anyhow::anyhow!("build {} not found", id))?;
        build.logs.push_str(text);
        build.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn get_build(&self, id: Uuid) -> Result<Option<BuildRecord>> {
        self.check()?;
        Ok(self.builds.lock().get(&id).cloned())
    }

    async fn upsert_deployment(&self, record: &DeploymentRecord) -> Result<()> {
        self.check()?;
        self.deployments
            .lock()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: &RunId) -> Result<Option<DeploymentRecord>> {
        self.check()?;
        Ok(self.deployments.lock().get(id).cloned())
    }
}
