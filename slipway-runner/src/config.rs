//! Engine configuration
//!
//! Defines all configurable parameters of the build-and-run engine: cache
//! locations, the execution strategy, container resource caps, the host port
//! range and the timings of the log flusher and readiness/liveness probes.

use slipway_core::domain::deployment::ExecutorKind;
use std::path::PathBuf;
use std::time::Duration;

/// Port the workload listens on inside its container
pub const INTERNAL_PORT: u16 = 3000;

/// Engine configuration
///
/// All intervals are configurable to allow tuning for different hosts
/// (fast dev laptops vs. shared build machines).
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the checkout cache (`<root>/<owner>/<repo>/<branch>`)
    pub workspace_root: PathBuf,

    /// Directory holding the live local log buffers
    pub log_dir: PathBuf,

    /// Root of the filesystem archive
    pub archive_root: PathBuf,

    /// Base URL repositories are cloned from (e.g., "https://github.com")
    pub git_remote: String,

    /// Which build-and-run strategy to use
    pub executor: ExecutorKind,

    /// Container CLI binary ("podman" or "docker")
    pub container_cli: String,

    /// Inclusive host port range
    pub port_min: u16,
    pub port_max: u16,

    /// Memory ceiling passed to the container runtime (e.g., "1024m")
    pub run_memory: String,

    /// CPU share passed to the container runtime (e.g., "0.5")
    pub run_cpus: String,

    /// How often buffered log lines are flushed to the archive and records
    pub log_flush_interval: Duration,

    /// Delete the local log buffer once the run is archived
    pub trim_local_logs: bool,

    /// Readiness probe budget
    pub ready_attempts: u32,
    pub ready_interval: Duration,

    /// How often running workloads are checked for liveness
    pub liveness_interval: Duration,

    /// Pack the source tree into the archive after a container starts
    pub upload_artifacts: bool,
}

impl Config {
    /// Creates a configuration with defaults rooted at `base`
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            workspace_root: base.join("workspaces"),
            log_dir: base.join("logs"),
            archive_root: base.join("archive"),
            git_remote: "https://github.com".to_string(),
            executor: ExecutorKind::Container,
            container_cli: "podman".to_string(),
            port_min: 40000,
            port_max: 48000,
            run_memory: "1024m".to_string(),
            run_cpus: "0.5".to_string(),
            log_flush_interval: Duration::from_millis(1000),
            trim_local_logs: true,
            ready_attempts: 10,
            ready_interval: Duration::from_millis(1000),
            liveness_interval: Duration::from_millis(5000),
            upload_artifacts: true,
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Every variable is optional:
    /// - SLIPWAY_BASE_DIR (default: /tmp/slipway)
    /// - SLIPWAY_WORKSPACE_ROOT, SLIPWAY_LOG_DIR, SLIPWAY_ARCHIVE_ROOT
    /// - SLIPWAY_GIT_REMOTE (default: https://github.com)
    /// - SLIPWAY_EXECUTOR ("container" or "native", default: container)
    /// - SLIPWAY_CONTAINER_CLI (default: podman)
    /// - SLIPWAY_PORT_MIN / SLIPWAY_PORT_MAX (default: 40000 / 48000)
    /// - SLIPWAY_RUN_MEMORY (default: 1024m), SLIPWAY_RUN_CPUS (default: 0.5)
    /// - SLIPWAY_LOG_FLUSH_MS (default: 1000)
    /// - SLIPWAY_TRIM_LOCAL_LOGS (default: true)
    /// - SLIPWAY_READY_ATTEMPTS (default: 10), SLIPWAY_READY_INTERVAL_MS (default: 1000)
    /// - SLIPWAY_LIVENESS_INTERVAL_MS (default: 5000)
    /// - SLIPWAY_UPLOAD_ARTIFACTS (default: true)
    pub fn from_env() -> anyhow::Result<Self> {
        let base = std::env::var("SLIPWAY_BASE_DIR").unwrap_or_else(|_| "/tmp/slipway".to_string());
        let mut config = Self::with_base(base);

        if let Ok(path) = std::env::var("SLIPWAY_WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SLIPWAY_LOG_DIR") {
            config.log_dir = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("SLIPWAY_ARCHIVE_ROOT") {
            config.archive_root = PathBuf::from(path);
        }
        if let Ok(remote) = std::env::var("SLIPWAY_GIT_REMOTE") {
            config.git_remote = remote;
        }
        if let Ok(kind) = std::env::var("SLIPWAY_EXECUTOR") {
            config.executor = parse_executor(&kind)?;
        }
        if let Ok(cli) = std::env::var("SLIPWAY_CONTAINER_CLI") {
            config.container_cli = cli;
        }
        if let Ok(memory) = std::env::var("SLIPWAY_RUN_MEMORY") {
            config.run_memory = memory;
        }
        if let Ok(cpus) = std::env::var("SLIPWAY_RUN_CPUS") {
            config.run_cpus = cpus;
        }

        config.port_min = env_parse("SLIPWAY_PORT_MIN")?.unwrap_or(config.port_min);
        config.port_max = env_parse("SLIPWAY_PORT_MAX")?.unwrap_or(config.port_max);

        if let Some(ms) = env_parse::<u64>("SLIPWAY_LOG_FLUSH_MS")? {
            config.log_flush_interval = Duration::from_millis(ms);
        }
        if let Some(trim) = env_parse::<bool>("SLIPWAY_TRIM_LOCAL_LOGS")? {
            config.trim_local_logs = trim;
        }
        config.ready_attempts = env_parse("SLIPWAY_READY_ATTEMPTS")?.unwrap_or(config.ready_attempts);
        if let Some(ms) = env_parse::<u64>("SLIPWAY_READY_INTERVAL_MS")? {
            config.ready_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SLIPWAY_LIVENESS_INTERVAL_MS")? {
            config.liveness_interval = Duration::from_millis(ms);
        }
        if let Some(upload) = env_parse::<bool>("SLIPWAY_UPLOAD_ARTIFACTS")? {
            config.upload_artifacts = upload;
        }

        Ok(config)
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_min == 0 || self.port_min > self.port_max {
            anyhow::bail!(
                "port range {}-{} is empty or inverted",
                self.port_min,
                self.port_max
            );
        }

        if !self.git_remote.contains("://") && !self.git_remote.starts_with('/') {
            anyhow::bail!("git_remote must be a URL or an absolute path");
        }

        if self.container_cli.is_empty() {
            anyhow::bail!("container_cli cannot be empty");
        }

        if self.log_flush_interval.is_zero() {
            anyhow::bail!("log_flush_interval must be greater than 0");
        }

        if self.ready_attempts == 0 {
            anyhow::bail!("ready_attempts must be greater than 0");
        }

        if self.ready_interval.is_zero() || self.liveness_interval.is_zero() {
            anyhow::bail!("probe intervals must be greater than 0");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::with_base("/tmp/slipway")
    }
}

fn parse_executor(value: &str) -> anyhow::Result<ExecutorKind> {
    match value.to_ascii_lowercase().as_str() {
        "container" | "docker" | "podman" => Ok(ExecutorKind::Container),
        "native" | "process" => Ok(ExecutorKind::Native),
        other => anyhow::bail!("unknown executor '{}', expected 'container' or 'native'", other),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> anyhow::Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| anyhow::anyhow!("{} has an invalid value: '{}'", key, raw)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port_min, 40000);
        assert_eq!(config.port_max, 48000);
        assert_eq!(config.executor, ExecutorKind::Container);
        assert_eq!(config.workspace_root, PathBuf::from("/tmp/slipway/workspaces"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.port_min = 5000;
        config.port_max = 4000;
        assert!(config.validate().is_err());

        config.port_max = 5000;
        assert!(config.validate().is_ok());

        config.git_remote = "github.com".to_string();
        assert!(config.validate().is_err());

        config.git_remote = "/srv/git".to_string();
        assert!(config.validate().is_ok());

        config.ready_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_executor() {
        assert_eq!(parse_executor("native").unwrap(), ExecutorKind::Native);
        assert_eq!(parse_executor("Docker").unwrap(), ExecutorKind::Container);
        assert!(parse_executor("vm").is_err());
    }
}
