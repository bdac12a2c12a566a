//! Build DTOs

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::deployment::{RunId, RunStatus};

fn default_branch() -> String {
    "main".to_string()
}

/// Request to build and run a repository branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBuild {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Caller-chosen run id; normalised before use
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

/// Response to an accepted build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAccepted {
    pub ok: bool,
    pub run_id: RunId,
    pub build_id: Uuid,
    pub status: RunStatus,
}
