//! Log pipeline
//!
//! Captures build and runtime output of every run:
//! - Each line is appended to a local append-only file for low-latency tailing
//! - A per-run flusher periodically copies the file to the archive and appends
//!   the new text to the build record, coalescing many lines into one write
//! - Readers resume from byte offsets; once a run is retired its local file is
//!   replaced by the archived copy, which is addressed with the same offsets

use anyhow::{Context, Result};
use parking_lot::Mutex;
use slipway_core::domain::deployment::RunId;
use slipway_core::domain::log::{LogChunk, LogSource};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::repository::{ArchiveStore, RecordStore};
use crate::retry::RetryPolicy;

/// Registry of live log streams and the read side of the pipeline
pub struct LogPipeline {
    dir: PathBuf,
    archive: Arc<dyn ArchiveStore>,
    records: Arc<dyn RecordStore>,
    flush_interval: Duration,
    trim_local: bool,
    streams: Arc<Mutex<HashMap<RunId, Arc<LogStream>>>>,
}

impl LogPipeline {
    pub fn new(
        dir: impl Into<PathBuf>,
        archive: Arc<dyn ArchiveStore>,
        records: Arc<dyn RecordStore>,
        flush_interval: Duration,
        trim_local: bool,
    ) -> Self {
        Self {
            dir: dir.into(),
            archive,
            records,
            flush_interval,
            trim_local,
            streams: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn local_path(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.log", run_id))
    }

    /// Opens a fresh stream for a run and starts its flusher
    ///
    /// Fails while an earlier stream of the same run has not been retired.
    pub async fn open(&self, run_id: &RunId, build_id: Uuid) -> Result<Arc<LogStream>> {
        if self.streams.lock().contains_key(run_id) {
            anyhow::bail!("log stream of run {} is still open", run_id);
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .context("Failed to create log directory")?;

        let path = self.local_path(run_id);
        let file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("Failed to create log file {}", path.display()))?;

        let stream = Arc::new(LogStream {
            run_id: run_id.clone(),
            build_id,
            path,
            len: AtomicU64::new(0),
            state: tokio::sync::Mutex::new(StreamState {
                file: Some(file),
                pending_record_text: String::new(),
                archive_dirty: false,
                retired: false,
            }),
            archive: Arc::clone(&self.archive),
            records: Arc::clone(&self.records),
            trim_local: self.trim_local,
            flusher: Mutex::new(None),
            registry: Arc::downgrade(&self.streams),
        });

        let flusher = spawn_flusher(Arc::downgrade(&stream), self.flush_interval);
        *stream.flusher.lock() = Some(flusher);

        self.streams
            .lock()
            .insert(run_id.clone(), Arc::clone(&stream));

        info!("Opened log stream for run {}", run_id);
        Ok(stream)
    }

    /// Returns the live stream of a run, if it has not been retired
    pub fn stream(&self, run_id: &RunId) -> Option<Arc<LogStream>> {
        self.streams.lock().get(run_id).cloned()
    }

    /// Reads a run's log from byte `offset` to the current end
    ///
    /// Serves the local file while it exists and the archive afterwards.
    /// Returns `None` when neither holds a log for the run.
    pub async fn read_from(&self, run_id: &RunId, offset: u64) -> Result<Option<LogChunk>> {
        let path = self.local_path(run_id);
        match read_local(&path, offset).await {
            Ok(Some((data, next_offset))) => {
                let live = self.streams.lock().contains_key(run_id);
                return Ok(Some(LogChunk {
                    data,
                    next_offset,
                    at_end: !live,
                    source: LogSource::Local,
                }));
            }
            Ok(None) => {}
            Err(e) => return Err(e),
        }

        let Some(data) = self.archive.get_range(&run_id.log_key(), offset).await? else {
            return Ok(None);
        };
        let next_offset = offset + data.len() as u64;
        Ok(Some(LogChunk {
            data,
            next_offset,
            at_end: true,
            source: LogSource::Archive,
        }))
    }
}

/// Reads `[offset, end)` of a local file; `None` if the file does not exist
async fn read_local(path: &Path, offset: u64) -> Result<Option<(Vec<u8>, u64)>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("Failed to open local log"),
    };

    let len = file.metadata().await?.len();
    let start = offset.min(len);
    let mut data = Vec::new();
    file.seek(SeekFrom::Start(start)).await?;
    file.read_to_end(&mut data).await?;
    let next = start + data.len() as u64;
    Ok(Some((data, next)))
}

fn spawn_flusher(stream: Weak<LogStream>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(stream) = stream.upgrade() else {
                break;
            };

            if let Err(e) = stream.flush().await {
                warn!("Failed to flush logs for run {}: {:#}", stream.run_id, e);
            }
        }
    })
}

struct StreamState {
    file: Option<tokio::fs::File>,
    /// Text appended since the last successful record update
    pending_record_text: String,
    /// The archive copy is behind the local file
    archive_dirty: bool,
    retired: bool,
}

/// Writer side of one run's log
pub struct LogStream {
    run_id: RunId,
    build_id: Uuid,
    path: PathBuf,
    len: AtomicU64,
    state: tokio::sync::Mutex<StreamState>,
    archive: Arc<dyn ArchiveStore>,
    records: Arc<dyn RecordStore>,
    trim_local: bool,
    flusher: Mutex<Option<JoinHandle<()>>>,
    registry: Weak<Mutex<HashMap<RunId, Arc<LogStream>>>>,
}

impl LogStream {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Bytes written so far
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends one line (a trailing newline is added when missing)
    ///
    /// Write failures are logged and swallowed: losing a log line must never
    /// fail the workload.
    pub async fn append(&self, line: &str) {
        let mut text = line.to_string();
        if !text.ends_with('\n') {
            text.push('\n');
        }

        let mut state = self.state.lock().await;
        if state.retired {
            warn!("Dropping log line for retired run {}", self.run_id);
            return;
        }
        let Some(file) = state.file.as_mut() else {
            return;
        };

        let written = async {
            file.write_all(text.as_bytes()).await?;
            file.flush().await
        }
        .await;

        match written {
            Ok(()) => {
                self.len.fetch_add(text.len() as u64, Ordering::SeqCst);
                state.pending_record_text.push_str(&text);
                state.archive_dirty = true;
            }
            Err(e) => warn!("Failed to append log line for run {}: {}", self.run_id, e),
        }
    }

    /// Appends a `==> ` marker line
    pub async fn marker(&self, message: &str) {
        self.append(&format!("==> {}", message)).await;
    }

    /// Copies pending output to the archive and the build record
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    async fn flush_locked(&self, state: &mut StreamState) -> Result<()> {
        let mut first_error = None;

        if state.archive_dirty {
            let body = tokio::fs::read(&self.path)
                .await
                .context("Failed to read local log for archiving")?;
            match self
                .archive
                .put(&self.run_id.log_key(), body, "text/plain")
                .await
            {
                Ok(()) => state.archive_dirty = false,
                Err(e) => first_error = Some(e),
            }
        }

        if !state.pending_record_text.is_empty() {
            match self
                .records
                .append_build_log(self.build_id, &state.pending_record_text)
                .await
            {
                Ok(()) => state.pending_record_text.clear(),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                debug!("Flushed logs for run {}", self.run_id);
                Ok(())
            }
        }
    }

    /// Flushes at the end of a phase, logging instead of failing
    pub async fn checkpoint(&self) {
        if let Err(e) = self.flush().await {
            warn!("Log checkpoint failed for run {}: {:#}", self.run_id, e);
        }
    }

    /// Returns up to `lines` trailing lines of the log
    pub async fn tail(&self, lines: usize) -> String {
        let _state = self.state.lock().await;
        let content = match tokio::fs::read(&self.path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => return String::new(),
        };
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }

    /// Closes the stream: final flush, then (optionally) trims the local file
    ///
    /// The local file is only removed once the archive holds every byte, so a
    /// reader switching from local to archive sees no gap. Safe to call twice.
    pub async fn retire(&self) {
        if let Some(flusher) = self.flusher.lock().take() {
            flusher.abort();
        }

        let mut state = self.state.lock().await;
        if state.retired {
            return;
        }
        state.retired = true;
        state.file = None;

        let policy = RetryPolicy::fixed(Duration::from_millis(200), 3);
        let mut archived = !state.archive_dirty;
        for attempt in 1..=policy.max_attempts.unwrap_or(1) {
            match self.flush_locked(&mut state).await {
                Ok(()) => {
                    archived = true;
                    break;
                }
                Err(e) => {
                    archived = !state.archive_dirty;
                    warn!(
                        "Final log flush for run {} failed (attempt {}): {:#}",
                        self.run_id, attempt, e
                    );
                    if archived || !policy.allows_more_after(attempt) {
                        break;
                    }
                    tokio::time::sleep(policy.delay_after(attempt)).await;
                }
            }
        }

        if let Some(registry) = self.registry.upgrade() {
            let mut streams = registry.lock();
            if streams
                .get(&self.run_id)
                .is_some_and(|stream| std::ptr::eq(Arc::as_ptr(stream), self))
            {
                streams.remove(&self.run_id);
            }
        }

        if archived && self.trim_local {
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                warn!("Failed to trim local log for run {}: {}", self.run_id, e);
            }
        } else if !archived {
            warn!(
                "Keeping local log for run {} because archiving failed",
                self.run_id
            );
        }

        info!("Retired log stream for run {}", self.run_id);
    }
}
