//! Log DTOs

use serde::{Deserialize, Serialize};

use crate::domain::log::{LogChunk, LogSource};

/// Query string of `GET /deployments/{id}/log`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogQuery {
    pub from: Option<u64>,
}

/// Body of `GET /deployments/{id}/log`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogResponse {
    pub ok: bool,
    pub chunk: String,
    pub next_from: u64,
    pub eof: bool,
    pub source: LogSource,
}

impl From<LogChunk> for LogResponse {
    fn from(chunk: LogChunk) -> Self {
        Self {
            ok: true,
            chunk: chunk.text(),
            next_from: chunk.next_offset,
            eof: chunk.at_end,
            source: chunk.source,
        }
    }
}

/// Payload of a `logs` event on the live-update stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogAppend {
    pub append: String,
}
