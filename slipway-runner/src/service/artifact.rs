//! Source artifact packing
//!
//! Packs a checked-out tree into a gzip tarball for the archive, leaving out
//! VCS metadata and installed dependencies.

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::path::{Path, PathBuf};

/// Directory names never packed
const EXCLUDED: [&str; 3] = [".git", "node_modules", ".next"];

/// Packs `root` into a `.tar.gz` held in memory
pub async fn pack_workspace(root: &Path) -> Result<Vec<u8>> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || pack_blocking(&root))
        .await
        .context("Packing task panicked")?
}

fn pack_blocking(root: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(encoder);
    tar.follow_symlinks(false);

    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        let dir = root.join(&relative);
        let mut entries = std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to read {}", dir.display()))?
            .collect::<std::io::Result<Vec<_>>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let name = entry.file_name();
            if EXCLUDED.iter().any(|excluded| name == *excluded) {
                continue;
            }
            let relative = relative.join(&name);
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                tar.append_dir(&relative, entry.path())?;
                pending.push(relative);
            } else {
                tar.append_path_with_name(entry.path(), &relative)
                    .with_context(|| format!("Failed to pack {}", relative.display()))?;
            }
        }
    }

    let encoder = tar.into_inner().context("Failed to finish tarball")?;
    encoder.finish().context("Failed to finish gzip stream")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;

    #[tokio::test]
    async fn test_pack_skips_git_and_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("package.json"), "{}").unwrap();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::write(root.join("src/index.js"), "x").unwrap();
        std::fs::create_dir_all(root.join(".git/objects")).unwrap();
        std::fs::write(root.join(".git/HEAD"), "ref").unwrap();
        std::fs::create_dir_all(root.join("node_modules/left-pad")).unwrap();
        std::fs::write(root.join("node_modules/left-pad/index.js"), "y").unwrap();

        let bytes = pack_workspace(root).await.unwrap();

        let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| entry.unwrap().path().unwrap().display().to_string())
            .collect();

        assert!(names.iter().any(|n| n == "package.json"));
        assert!(names.iter().any(|n| n == "src/index.js"));
        assert!(!names.iter().any(|n| n.starts_with(".git")));
        assert!(!names.iter().any(|n| n.starts_with("node_modules")));
    }
}
