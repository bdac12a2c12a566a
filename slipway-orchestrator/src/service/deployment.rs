//! Deployment Service
//!
//! Turns API requests into engine calls: request validation, run id
//! assignment and the lookups behind the read endpoints.

use slipway_core::domain::build::{BuildRequest, RepoRef};
use slipway_core::domain::deployment::{RunId, RunStatus};
use slipway_core::dto::build::{BuildAccepted, SubmitBuild};
use slipway_core::dto::deployment::{DeploymentMeta, StopResponse};
use slipway_core::dto::log::LogResponse;
use slipway_runner::{DeployError, Engine};
use std::sync::Arc;
use uuid::Uuid;

/// Longest accepted environment variable name
const MAX_ENV_KEY_LEN: usize = 128;

/// Service error type
#[derive(Debug)]
pub enum DeploymentError {
    NotFound(String),
    ValidationError(String),
    Rejected(DeployError),
    Internal(String),
}

impl From<DeployError> for DeploymentError {
    fn from(err: DeployError) -> Self {
        match err {
            DeployError::ConfigInvalid(msg) => DeploymentError::ValidationError(msg),
            other => DeploymentError::Rejected(other),
        }
    }
}

type Result<T> = std::result::Result<T, DeploymentError>;

/// Parses a run id taken from a URL path
pub fn parse_run_id(raw: &str) -> Result<RunId> {
    RunId::parse(raw)
        .map_err(|e| DeploymentError::ValidationError(format!("Invalid run id '{}': {}", raw, e)))
}

/// Validates a submission and hands it to the engine
pub async fn submit_build(engine: &Arc<Engine>, req: SubmitBuild) -> Result<BuildAccepted> {
    let request = build_request(req)?;
    let build_id = request.build_id;

    tracing::info!(
        "Submitting build {} for {} as run {} (correlation {})",
        build_id,
        request.source,
        request.run_id,
        request.correlation_id
    );

    let record = engine.submit(request).await?;

    Ok(BuildAccepted {
        ok: true,
        run_id: record.id,
        build_id,
        status: record.status,
    })
}

/// Primary record and archive mirror of a run
pub async fn get_meta(engine: &Engine, run_id: &RunId) -> Result<DeploymentMeta> {
    let (db, archive) = engine.meta(run_id).await;
    if db.is_none() && archive.is_none() {
        return Err(DeploymentError::NotFound(format!(
            "Deployment {} not found",
            run_id
        )));
    }
    Ok(DeploymentMeta {
        ok: true,
        db,
        archive,
    })
}

/// Stops a run; never fails for unknown ids
pub async fn stop(engine: &Engine, run_id: RunId) -> StopResponse {
    let status = engine.stop(&run_id).await;
    tracing::info!("Stop of run {} settled as {}", run_id, status);
    StopResponse {
        ok: true,
        run_id,
        status,
    }
}

/// Reads a run's log from `from`
pub async fn read_log(engine: &Engine, run_id: &RunId, from: u64) -> Result<LogResponse> {
    let chunk = engine
        .read_log(run_id, from)
        .await
        .map_err(|e| DeploymentError::Internal(format!("Failed to read log: {:#}", e)))?
        .ok_or_else(|| DeploymentError::NotFound(format!("No log for deployment {}", run_id)))?;
    Ok(chunk.into())
}

/// Current status of a run, if it is known anywhere
pub async fn get_status(engine: &Engine, run_id: &RunId) -> Result<RunStatus> {
    engine
        .status(run_id)
        .await
        .ok_or_else(|| DeploymentError::NotFound(format!("Deployment {} not found", run_id)))
}

// =============================================================================
// Validation
// =============================================================================

fn build_request(req: SubmitBuild) -> Result<BuildRequest> {
    let source = RepoRef::new(req.owner.trim(), req.repo.trim(), req.branch.trim());
    source
        .validate()
        .map_err(|e| DeploymentError::ValidationError(e.to_string()))?;

    for key in req.env.keys() {
        validate_env_key(key)?;
    }

    let run_id = match req.run_id.as_deref() {
        Some(raw) => parse_run_id(raw)?,
        None => RunId::generate(),
    };
    let build_id = Uuid::new_v4();
    let correlation_id = req
        .correlation_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| build_id.to_string());

    Ok(BuildRequest {
        build_id,
        run_id,
        source,
        env: req.env,
        correlation_id,
    })
}

fn validate_env_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_ENV_KEY_LEN {
        return Err(DeploymentError::ValidationError(format!(
            "Environment variable name must be 1-{} characters",
            MAX_ENV_KEY_LEN
        )));
    }

    let valid = key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !key.starts_with(|c: char| c.is_ascii_digit());
    if !valid {
        return Err(DeploymentError::ValidationError(format!(
            "Invalid environment variable name '{}'",
            key
        )));
    }

    Ok(())
}
