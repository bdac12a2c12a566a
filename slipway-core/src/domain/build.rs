//! Build domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::deployment::{RunId, RunStatus};

/// Coordinates of a repository branch
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoRef {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository coordinate {field}: {reason}")]
pub struct InvalidRepoRef {
    pub field: &'static str,
    pub reason: &'static str,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            branch: branch.into(),
        }
    }

    /// Rejects coordinates that could escape the workspace cache or be
    /// interpreted as command-line flags.
    pub fn validate(&self) -> Result<(), InvalidRepoRef> {
        validate_segment("owner", &self.owner, false)?;
        validate_segment("repo", &self.repo, false)?;
        validate_segment("branch", &self.branch, true)?;
        Ok(())
    }
}

fn validate_segment(
    field: &'static str,
    value: &str,
    allow_slash: bool,
) -> Result<(), InvalidRepoRef> {
    if value.is_empty() {
        return Err(InvalidRepoRef {
            field,
            reason: "must not be empty",
        });
    }
    if value.starts_with('-') || value.starts_with('.') {
        return Err(InvalidRepoRef {
            field,
            reason: "must not start with '-' or '.'",
        });
    }
    if value.contains("..") {
        return Err(InvalidRepoRef {
            field,
            reason: "must not contain '..'",
        });
    }
    let ok = value.chars().all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') || (allow_slash && c == '/')
    });
    if !ok {
        return Err(InvalidRepoRef {
            field,
            reason: "contains unsupported characters",
        });
    }
    Ok(())
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.branch)
    }
}

/// An accepted build request
///
/// Immutable once created. Environment keys are unique by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub build_id: Uuid,
    pub run_id: RunId,
    pub source: RepoRef,
    pub env: BTreeMap<String, String>,
    pub correlation_id: String,
}

/// Build record as mirrored to the metadata store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: Uuid,
    pub run_id: RunId,
    pub status: RunStatus,
    pub logs: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
