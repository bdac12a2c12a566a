//! Project detection
//!
//! Inspects a workspace to decide how it is installed, built and started.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::{DeployError, Result};

/// JavaScript package manager, detected from lockfiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pnpm,
    Yarn,
    Npm,
}

/// Lockfiles in priority order; the first one present wins
const LOCKFILES: [(&str, PackageManager); 3] = [
    ("pnpm-lock.yaml", PackageManager::Pnpm),
    ("yarn.lock", PackageManager::Yarn),
    ("package-lock.json", PackageManager::Npm),
];

impl PackageManager {
    pub fn binary(self) -> &'static str {
        match self {
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Npm => "npm",
        }
    }

    /// Install command; frozen installs require a lockfile
    pub fn install_command(self, has_lockfile: bool) -> String {
        match (self, has_lockfile) {
            (PackageManager::Pnpm, true) => "pnpm install --frozen-lockfile".to_string(),
            (PackageManager::Yarn, true) => "yarn install --frozen-lockfile".to_string(),
            (PackageManager::Npm, true) => "npm ci --no-audit --no-fund".to_string(),
            (pm, false) => format!("{} install", pm.binary()),
        }
    }

    pub fn run_script(self, script: &str) -> String {
        if script == "start" {
            format!("{} start", self.binary())
        } else {
            format!("{} run {}", self.binary(), script)
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

#[derive(Debug, Default, Deserialize)]
struct PackageJson {
    #[serde(default)]
    scripts: HashMap<String, String>,
    #[serde(default)]
    dependencies: HashMap<String, serde_json::Value>,
    #[serde(default, rename = "devDependencies")]
    dev_dependencies: HashMap<String, serde_json::Value>,
}

/// What the workspace needs to be installed, built and started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeApp {
    pub package_manager: PackageManager,
    /// Lockfile name, when one exists
    pub lockfile: Option<&'static str>,
    pub start_command: String,
    pub build_command: Option<String>,
    pub uses_next: bool,
    pub has_public_dir: bool,
}

/// Detects a Node.js application in `workspace`
///
/// Fails with `ConfigInvalid` when there is no readable `package.json` or it
/// defines neither a `start` nor a `dev` script.
pub fn detect_node_app(workspace: &Path) -> Result<NodeApp> {
    let manifest_path = workspace.join("package.json");
    let raw = std::fs::read_to_string(&manifest_path).map_err(|_| {
        DeployError::ConfigInvalid("no package.json found in repository".to_string())
    })?;
    let manifest: PackageJson = serde_json::from_str(&raw)
        .map_err(|e| DeployError::ConfigInvalid(format!("package.json is not valid: {}", e)))?;

    let (lockfile, package_manager) = LOCKFILES
        .iter()
        .find(|(name, _)| workspace.join(name).is_file())
        .map(|(name, pm)| (Some(*name), *pm))
        .unwrap_or((None, PackageManager::Npm));

    let start_command = if manifest.scripts.contains_key("start") {
        package_manager.run_script("start")
    } else if manifest.scripts.contains_key("dev") {
        package_manager.run_script("dev")
    } else {
        return Err(DeployError::ConfigInvalid(
            "package.json defines neither a 'start' nor a 'dev' script".to_string(),
        ));
    };

    let build_command = manifest
        .scripts
        .contains_key("build")
        .then(|| package_manager.run_script("build"));

    let uses_next =
        manifest.dependencies.contains_key("next") || manifest.dev_dependencies.contains_key("next");

    Ok(NodeApp {
        package_manager,
        lockfile,
        start_command,
        build_command,
        uses_next,
        has_public_dir: workspace.join("public").is_dir(),
    })
}
