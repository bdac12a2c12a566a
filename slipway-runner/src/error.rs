//! Engine error types

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, DeployError>;

/// Errors that can end a run
#[derive(Debug, Error)]
pub enum DeployError {
    /// The repository or branch could not be fetched
    #[error("source unavailable for {coordinates}: {reason}")]
    SourceUnavailable { coordinates: String, reason: String },

    /// No build descriptor exists and none can be synthesized
    #[error("invalid build configuration: {0}")]
    ConfigInvalid(String),

    /// A build or install command exited non-zero
    #[error("{command} failed with exit code {exit_code}\n{tail}")]
    BuildFailed {
        command: String,
        exit_code: i32,
        tail: String,
    },

    /// Every port in the configured range is taken
    #[error("no port available in range {low}-{high}")]
    NoPortAvailable { low: u16, high: u16 },

    /// The workload never answered the readiness probe
    #[error("workload did not become ready on port {port} after {attempts} attempts")]
    StartupTimeout { port: u16, attempts: u32 },

    /// The workload failed to start or died while running
    #[error("workload crashed: {0}")]
    RuntimeCrash(String),

    /// Teardown could not be confirmed
    #[error("stop could not be confirmed: {0}")]
    StopFailed(String),

    /// The run was stopped before it reached RUNNING
    #[error("run was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeployError {
    /// Stable machine-readable name of the failure
    pub fn kind(&self) -> &'static str {
        match self {
            DeployError::SourceUnavailable { .. } => "SourceUnavailable",
            DeployError::ConfigInvalid(_) => "ConfigInvalid",
            DeployError::BuildFailed { .. } => "BuildFailed",
            DeployError::NoPortAvailable { .. } => "NoPortAvailable",
            DeployError::StartupTimeout { .. } => "StartupTimeout",
            DeployError::RuntimeCrash(_) => "RuntimeCrash",
            DeployError::StopFailed(_) => "StopFailed",
            DeployError::Cancelled => "Cancelled",
            DeployError::Io(_) => "Io",
        }
    }

    /// Human-readable message stored on the FAILED record
    pub fn status_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}
