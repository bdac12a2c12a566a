//! Deployment DTOs

use serde::{Deserialize, Serialize};

use crate::domain::deployment::{DeploymentRecord, RunId, RunStatus};

/// Body of `GET /deployments/{id}`
///
/// The relational record and the archive mirror side by side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentMeta {
    pub ok: bool,
    pub db: Option<DeploymentRecord>,
    pub archive: Option<serde_json::Value>,
}

/// Body of `POST /deployments/{id}/stop`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub ok: bool,
    pub run_id: RunId,
    pub status: RunStatus,
}

/// Payload of a `status` event on the live-update stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEvent {
    pub status: RunStatus,
    pub deployment: Option<DeploymentRecord>,
}
