//! Health Check API Handler

use axum::{Json, extract::State};
use serde::Serialize;

use crate::api::AppState;

#[derive(Serialize)]
pub struct Health {
    pub ok: bool,
    pub ports_in_use: usize,
}

/// GET /health
/// Liveness of the service plus the number of leased host ports
pub async fn health_check(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        ok: true,
        ports_in_use: state.engine.ports().in_use(),
    })
}
