//! Log domain types

use serde::{Deserialize, Serialize};

/// Where a log chunk was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// The live local buffer of an active run
    Local,
    /// The durable archive copy
    Archive,
}

/// A byte range read from a run's log stream
///
/// Offsets are byte counts from the start of the stream and mean the same
/// thing for local and archived reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogChunk {
    pub data: Vec<u8>,
    pub next_offset: u64,
    /// The stream is closed and `next_offset` is its final length
    pub at_end: bool,
    pub source: LogSource,
}

impl LogChunk {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}
