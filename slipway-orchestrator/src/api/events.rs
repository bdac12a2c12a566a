//! Live-update stream
//!
//! `GET /deployments/{id}/events` is a Server-Sent Events stream. It opens
//! with a `status` snapshot, then on every poll sends new log text as a
//! `logs` event and the current state as a `status` event. The stream ends
//! once the run is terminal and its log has been closed.

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{SinkExt, Stream, StreamExt, channel::mpsc};
use serde::Serialize;
use slipway_core::domain::deployment::{DeploymentRecord, RunId, RunStatus};
use slipway_core::dto::deployment::StatusEvent;
use slipway_core::dto::log::LogAppend;
use slipway_runner::Engine;
use slipway_runner::retry::RetryPolicy;
use std::convert::Infallible;
use std::sync::Arc;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::deployment_service;

/// Polls allowed after a terminal status while the log is still open
const SETTLE_POLLS: u32 = 20;

/// GET /deployments/{id}/events
pub async fn deployment_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let run_id = deployment_service::parse_run_id(&id)?;
    let snapshot = state
        .engine
        .describe(&run_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Deployment {} not found", run_id)))?;

    tracing::debug!("Opening event stream for run {}", run_id);

    let (tx, rx) = mpsc::channel(16);
    let policy = RetryPolicy::every(state.event_interval);
    tokio::spawn(pump(Arc::clone(&state.engine), run_id, snapshot, policy, tx));

    Ok(Sse::new(rx.map(Ok)).keep_alive(KeepAlive::default()))
}

/// Feeds one client until the run settles or the client goes away
async fn pump(
    engine: Arc<Engine>,
    run_id: RunId,
    snapshot: DeploymentRecord,
    policy: RetryPolicy,
    mut tx: mpsc::Sender<Event>,
) {
    let mut status = snapshot.status;
    if send(&mut tx, "status", &status_event(status, Some(snapshot)))
        .await
        .is_err()
    {
        return;
    }

    let mut offset = 0u64;
    let mut settle = 0u32;
    let mut pacer = policy.pacer();

    while pacer.tick().await {
        let Ok(log_closed) = drain_log(&engine, &run_id, &mut offset, &mut tx).await else {
            break;
        };

        let record = engine.describe(&run_id).await;
        if let Some(record) = &record {
            status = record.status;
        }
        if status.is_terminal() && log_closed {
            // The close may have raced the read; pick up the final bytes
            if drain_log(&engine, &run_id, &mut offset, &mut tx).await.is_err() {
                break;
            }
        }
        if send(&mut tx, "status", &status_event(status, record))
            .await
            .is_err()
        {
            break;
        }

        if status.is_terminal() {
            settle += 1;
            if log_closed || settle > SETTLE_POLLS {
                break;
            }
        }
    }

    tracing::debug!("Event stream for run {} closed at {}", run_id, status);
}

/// Sends log text past `offset`; `Ok(true)` once the log is closed
async fn drain_log(
    engine: &Engine,
    run_id: &RunId,
    offset: &mut u64,
    tx: &mut mpsc::Sender<Event>,
) -> Result<bool, mpsc::SendError> {
    match engine.read_log(run_id, *offset).await {
        Ok(Some(chunk)) => {
            *offset = chunk.next_offset;
            if !chunk.data.is_empty() {
                let append = LogAppend {
                    append: chunk.text(),
                };
                send(tx, "logs", &append).await?;
            }
            Ok(chunk.at_end)
        }
        Ok(None) => Ok(true),
        Err(e) => {
            tracing::warn!("Event stream of run {} failed to read log: {:#}", run_id, e);
            Ok(false)
        }
    }
}

fn status_event(status: RunStatus, deployment: Option<DeploymentRecord>) -> StatusEvent {
    StatusEvent { status, deployment }
}

/// Serializes and sends one event; `Err` once the client is gone
async fn send<T: Serialize>(
    tx: &mut mpsc::Sender<Event>,
    name: &str,
    payload: &T,
) -> Result<(), mpsc::SendError> {
    match Event::default().event(name).json_data(payload) {
        Ok(event) => tx.send(event).await,
        Err(e) => {
            tracing::warn!("Failed to encode {} event: {}", name, e);
            Ok(())
        }
    }
}
