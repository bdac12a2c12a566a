//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific concern.

pub mod build;
pub mod deployment;
pub mod error;
pub mod events;
pub mod health;
pub mod proxy;

#[cfg(test)]
pub(crate) mod testing;

use axum::{
    Router,
    routing::{any, get, post},
};
use slipway_runner::Engine;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// How often the live-update stream polls a run
const EVENT_INTERVAL: Duration = Duration::from_millis(600);

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Upstream client of the reverse proxy; never follows redirects
    pub client: reqwest::Client,
    pub event_interval: Duration,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            engine,
            client,
            event_interval: EVENT_INTERVAL,
        })
    }
}

/// Create the main API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Build endpoints
        .route("/builds", post(build::submit_build))
        // Deployment endpoints
        .route("/deployments/{id}", get(deployment::get_deployment))
        .route("/deployments/{id}/stop", post(deployment::stop_deployment))
        .route("/deployments/{id}/log", get(deployment::get_log))
        .route("/deployments/{id}/events", get(events::deployment_events))
        // Reverse proxy into running workloads
        .route("/proxy/{id}", any(proxy::proxy))
        .route("/proxy/{id}/", any(proxy::proxy))
        .route("/proxy/{id}/{*path}", any(proxy::proxy))
        // Add state and middleware
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
