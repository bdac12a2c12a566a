//! Dockerfile synthesis
//!
//! A repository that ships its own `Dockerfile` is built as-is. Otherwise a
//! multi-stage Node.js Dockerfile is generated from the detected project. For
//! Next.js projects the config is patched to emit a standalone server so the
//! runtime image only carries the traced output.

use regex::Regex;
use std::path::Path;
use tracing::{debug, warn};

use super::detect::{NodeApp, PackageManager, detect_node_app};
use crate::config::INTERNAL_PORT;
use crate::error::{DeployError, Result};
use crate::service::log_pipeline::LogStream;

pub const DOCKERFILE: &str = "Dockerfile";

const BASE_IMAGE: &str = "node:20-alpine";
const NEXT_CONFIGS: [&str; 3] = ["next.config.ts", "next.config.mjs", "next.config.js"];

/// How the Dockerfile used for a build came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerfileOrigin {
    Repository,
    Generic,
    NextStandalone,
}

/// Makes sure `workspace` has a Dockerfile, generating one when missing
pub async fn prepare(workspace: &Path, log: &LogStream) -> Result<DockerfileOrigin> {
    let path = workspace.join(DOCKERFILE);
    if path.is_file() {
        log.append("Using Dockerfile from repository").await;
        return Ok(DockerfileOrigin::Repository);
    }

    let app = detect_node_app(workspace)?;
    log.append(&format!(
        "No Dockerfile found, generating one (package manager: {})",
        app.package_manager
    ))
    .await;

    let (origin, contents) = if app.uses_next && app.build_command.is_some() {
        match ensure_standalone(workspace) {
            Ok(()) => (DockerfileOrigin::NextStandalone, next_standalone(&app)),
            Err(e) => {
                warn!("Could not enable Next.js standalone output: {}", e);
                log.append("Could not enable Next.js standalone output, using generic image")
                    .await;
                (DockerfileOrigin::Generic, generic(&app))
            }
        }
    } else {
        (DockerfileOrigin::Generic, generic(&app))
    };

    tokio::fs::write(&path, contents).await?;
    debug!("Wrote {:?} Dockerfile to {}", origin, path.display());
    Ok(origin)
}

fn corepack_line(pm: PackageManager) -> Option<&'static str> {
    match pm {
        PackageManager::Npm => None,
        PackageManager::Pnpm | PackageManager::Yarn => Some("RUN corepack enable"),
    }
}

/// Lines shared by both templates: dependency install and source build
fn builder_stage(app: &NodeApp) -> Vec<String> {
    let mut lines = vec![
        format!("FROM {} AS builder", BASE_IMAGE),
        "WORKDIR /app".to_string(),
    ];
    if let Some(line) = corepack_line(app.package_manager) {
        lines.push(line.to_string());
    }
    match app.lockfile {
        Some(lockfile) => lines.push(format!("COPY package.json {} ./", lockfile)),
        None => lines.push("COPY package.json ./".to_string()),
    }
    lines.push(format!(
        "RUN {}",
        app.package_manager.install_command(app.lockfile.is_some())
    ));
    lines.push("COPY . .".to_string());
    if let Some(build) = &app.build_command {
        lines.push(format!("RUN {}", build));
    }
    lines
}

/// Template that ships the whole built tree
pub fn generic(app: &NodeApp) -> String {
    let mut lines = builder_stage(app);
    lines.push(String::new());
    lines.push(format!("FROM {}", BASE_IMAGE));
    lines.push("WORKDIR /app".to_string());
    if let Some(line) = corepack_line(app.package_manager) {
        lines.push(line.to_string());
    }
    lines.push("COPY --from=builder /app /app".to_string());
    lines.push(format!("ENV NODE_ENV=production PORT={}", INTERNAL_PORT));
    lines.push(format!("EXPOSE {}", INTERNAL_PORT));
    lines.push(format!(
        "CMD [\"sh\", \"-c\", {}]",
        serde_json::Value::String(app.start_command.clone())
    ));
    lines.join("\n") + "\n"
}

/// Template that ships only the Next.js standalone server
pub fn next_standalone(app: &NodeApp) -> String {
    let mut lines = builder_stage(app);
    lines.push(String::new());
    lines.push(format!("FROM {}", BASE_IMAGE));
    lines.push("WORKDIR /app".to_string());
    lines.push(format!(
        "ENV NODE_ENV=production PORT={} HOSTNAME=0.0.0.0",
        INTERNAL_PORT
    ));
    lines.push("COPY --from=builder /app/.next/standalone ./".to_string());
    if app.has_public_dir {
        lines.push("COPY --from=builder /app/public ./public".to_string());
    }
    lines.push("COPY --from=builder /app/.next/static ./.next/static".to_string());
    lines.push(format!("EXPOSE {}", INTERNAL_PORT));
    lines.push("CMD [\"node\", \"server.js\"]".to_string());
    lines.join("\n") + "\n"
}

/// Patches (or creates) the Next.js config so builds emit `output: 'standalone'`
pub fn ensure_standalone(workspace: &Path) -> Result<()> {
    let Some(path) = NEXT_CONFIGS
        .iter()
        .map(|name| workspace.join(name))
        .find(|path| path.is_file())
    else {
        std::fs::write(
            workspace.join("next.config.mjs"),
            "export default { output: 'standalone' };\n",
        )?;
        return Ok(());
    };

    let source = std::fs::read_to_string(&path)?;
    if source.contains("standalone") {
        return Ok(());
    }

    let patched = patch_next_config(&source).ok_or_else(|| {
        DeployError::ConfigInvalid(format!(
            "cannot find the config object in {}",
            path.display()
        ))
    })?;
    std::fs::write(&path, patched)?;
    Ok(())
}

/// Inserts `output: 'standalone'` at the top of the `nextConfig` object
fn patch_next_config(source: &str) -> Option<String> {
    let pattern = Regex::new(r"const\s+nextConfig\s*(:\s*NextConfig\s*)?=\s*\{").ok()?;
    let found = pattern.find(source)?;
    let mut patched = String::with_capacity(source.len() + 32);
    patched.push_str(&source[..found.end()]);
    patched.push_str("\n  output: 'standalone',");
    patched.push_str(&source[found.end()..]);
    Some(patched)
}
