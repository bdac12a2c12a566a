//! Deployment domain types
//!
//! A deployment (a "run") is one build-to-teardown lifecycle of a workload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Prefix for container names derived from a run id
const CONTAINER_PREFIX: &str = "slipway-ctr";

/// Prefix for image tags derived from a run id
const IMAGE_PREFIX: &str = "slipway-img";

const MAX_RUN_ID_LEN: usize = 64;

/// Identifier of a single run
///
/// Run ids are normalised exactly once, when the run is created: the raw value
/// is lowercased, every character outside `[a-z0-9_.-]` is dropped, and the
/// result is shaped into a valid image name component (no leading or trailing
/// separators; separator runs limited to `.`, `_`, `__` or dashes). Every
/// derived name (container, image, archive keys) is computed from the
/// normalised value, so stop-by-id works without a live handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRunId {
    #[error("run id is empty after normalisation")]
    Empty,
    #[error("run id is longer than {MAX_RUN_ID_LEN} characters")]
    TooLong,
}

impl RunId {
    /// Generates a fresh run id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Normalises an arbitrary string into a run id
    pub fn parse(raw: &str) -> Result<Self, InvalidRunId> {
        let kept: String = raw
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'))
            .collect();
        let normalised = name_component(&kept);

        if normalised.is_empty() {
            return Err(InvalidRunId::Empty);
        }
        if normalised.len() > MAX_RUN_ID_LEN {
            return Err(InvalidRunId::TooLong);
        }

        Ok(Self(normalised))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the container that hosts this run
    pub fn container_name(&self) -> String {
        format!("{}-{}", CONTAINER_PREFIX, self.0)
    }

    /// Tag of the image built for this run
    pub fn image_tag(&self) -> String {
        format!("{}-{}", IMAGE_PREFIX, self.0)
    }

    /// Archive key of the JSON metadata mirror
    pub fn meta_key(&self) -> String {
        format!("meta/{}.json", self.0)
    }

    /// Archive key of the durable log copy
    pub fn log_key(&self) -> String {
        format!("logs/{}.log", self.0)
    }

    /// Archive key of the packed source tree
    pub fn artifact_key(&self) -> String {
        format!("artifacts/{}.tar.gz", self.0)
    }
}

fn is_separator(c: char) -> bool {
    matches!(c, '_' | '.' | '-')
}

/// Trims outer separators and reduces each inner separator run to one the
/// image reference grammar accepts, keeping its first character otherwise
fn name_component(kept: &str) -> String {
    let mut out = String::with_capacity(kept.len());
    let mut run = String::new();
    for c in kept.trim_matches(is_separator).chars() {
        if is_separator(c) {
            run.push(c);
            continue;
        }
        if !run.is_empty() {
            let valid = run.len() == 1 || run == "__" || run.chars().all(|c| c == '-');
            if valid {
                out.push_str(&run);
            } else {
                out.extend(run.chars().take(1));
            }
            run.clear();
        }
        out.push(c);
    }
    out
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RunId {
    type Error = InvalidRunId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RunId::parse(&value)
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

/// Lifecycle state of a run
///
/// `Queued -> Building -> Running -> {Stopped, Failed}`. `Failed` is also
/// reachable from `Queued` and `Building`. `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Building,
    Running,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Stopped | RunStatus::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Queued, Building)
                | (Queued, Failed)
                | (Building, Running)
                | (Building, Failed)
                | (Running, Stopped)
                | (Running, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::Building => "BUILDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Stopped => "STOPPED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(RunStatus::Queued),
            "BUILDING" => Some(RunStatus::Building),
            "RUNNING" => Some(RunStatus::Running),
            "STOPPED" => Some(RunStatus::Stopped),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which strategy produced and hosts a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Container,
    Native,
}

/// Reference to a started workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum WorkloadRef {
    Container { name: String },
    Process { pid: u32 },
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadRef::Container { name } => write!(f, "container:{}", name),
            WorkloadRef::Process { pid } => write!(f, "pid:{}", pid),
        }
    }
}

/// Deployment record
///
/// Mirrored to the metadata store and to the archive. The engine's in-memory
/// state is authoritative while a run is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: RunId,
    pub build_id: Uuid,
    pub owner: String,
    pub repo: String,
    pub branch: String,
    pub status: RunStatus,
    pub host_port: Option<u16>,
    pub workload: Option<WorkloadRef>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
