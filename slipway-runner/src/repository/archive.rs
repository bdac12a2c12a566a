//! Archive repository
//!
//! Durable key/value blob storage for logs, metadata mirrors and source
//! artifacts. Keys look like `logs/<id>.log`, `meta/<id>.json` and
//! `artifacts/<id>.tar.gz`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Repository trait for the durable archive
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Stores a whole object, replacing any previous value
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// Reads a whole object
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Reads an object from byte `from` to its end
    ///
    /// Offsets past the end yield an empty body.
    async fn get_range(&self, key: &str, from: u64) -> Result<Option<Vec<u8>>>;
}

/// Writes `value` as pretty JSON under `key`
pub async fn put_json<T: serde::Serialize + ?Sized>(
    archive: &dyn ArchiveStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let body = serde_json::to_vec_pretty(value).context("Failed to serialize archive object")?;
    archive.put(key, body, "application/json").await
}

/// Reads and parses the JSON object under `key`
pub async fn get_json(archive: &dyn ArchiveStore, key: &str) -> Result<Option<serde_json::Value>> {
    match archive.get(key).await? {
        Some(body) => Ok(Some(
            serde_json::from_slice(&body).context("Archive object is not valid JSON")?,
        )),
        None => Ok(None),
    }
}

/// Filesystem implementation of ArchiveStore
///
/// Objects are files under `root`; writes go through a temporary file and a
/// rename so readers never observe a partially written object.
pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            anyhow::bail!("Invalid archive key: '{}'", key);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArchiveStore for FsArchive {
    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create archive directory")?;
        }

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("Failed to write archive object {}", key))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to publish archive object {}", key))?;

        debug!("Archived {} ({} bytes)", key, body.len());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read archive object {}", key)),
        }
    }

    async fn get_range(&self, key: &str, from: u64) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to open archive object {}", key));
            }
        };

        let len = file.metadata().await?.len();
        let mut body = Vec::new();
        if from < len {
            file.seek(SeekFrom::Start(from)).await?;
            file.read_to_end(&mut body).await?;
        }
        Ok(Some(body))
    }
}

/// In-memory implementation of ArchiveStore
///
/// Can be switched into an unavailable state to exercise failure paths.
#[derive(Default)]
pub struct MemoryArchive {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    unavailable: AtomicBool,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail (or succeed again)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            anyhow::bail!("archive unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchive {
    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<()> {
        self.check()?;
        self.objects.lock().insert(key.to_string(), body);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.objects.lock().get(key).cloned())
    }

    async fn get_range(&self, key: &str, from: u64) -> Result<Option<Vec<u8>>> {
        self.check()?;
        Ok(self.objects.lock().get(key).map(|body| {
            let start = usize::try_from(from).unwrap_or(usize::MAX).min(body.len());
            body[start..].to_vec()
        }))
    }
}
