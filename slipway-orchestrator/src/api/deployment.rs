//! Deployment API Handlers
//!
//! Read and stop endpoints for individual runs.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use slipway_core::dto::deployment::{DeploymentMeta, StopResponse};
use slipway_core::dto::log::{LogQuery, LogResponse};

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::deployment_service;

/// GET /deployments/{id}
/// Relational record and archive mirror of a run
pub async fn get_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeploymentMeta>> {
    tracing::debug!("Getting deployment: {}", id);

    let run_id = deployment_service::parse_run_id(&id)?;
    let meta = deployment_service::get_meta(&state.engine, &run_id).await?;

    Ok(Json(meta))
}

/// POST /deployments/{id}/stop
/// Stop a run; safe to repeat
pub async fn stop_deployment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<StopResponse>> {
    let run_id = deployment_service::parse_run_id(&id)?;
    tracing::info!("Stop requested for run {}", run_id);

    Ok(Json(deployment_service::stop(&state.engine, run_id).await))
}

/// GET /deployments/{id}/log?from=N
/// Log bytes of a run from offset `from`
pub async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<LogResponse>> {
    let run_id = deployment_service::parse_run_id(&id)?;
    let from = query.from.unwrap_or(0);

    let chunk = deployment_service::read_log(&state.engine, &run_id, from).await?;

    Ok(Json(chunk))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{TestApp, body_json, get, post_empty};
    use axum::http::StatusCode;
    use slipway_core::domain::deployment::RunStatus;
    use slipway_core::domain::log::LogSource;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_unknown_deployment() {
        let app = TestApp::new();

        let response = app
            .router()
            .oneshot(get("/deployments/nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.router().oneshot(get("/deployments/nope/log")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_get_deployment_meta() {
        let app = TestApp::new();
        let run_id = app.submit("meta-1").await;
        app.wait_for_mirror(&run_id, RunStatus::Running).await;

        let response = app
            .router()
            .oneshot(get("/deployments/meta-1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let meta: DeploymentMeta = body_json(response).await;
        let db = meta.db.unwrap();
        assert_eq!(db.status, RunStatus::Running);
        assert!(db.host_port.is_some());
        assert_eq!(meta.archive.unwrap()["status"], "RUNNING");
    }

    #[tokio::test]
    async fn test_stop_deployment_is_idempotent() {
        let app = TestApp::new();
        let run_id = app.submit("stop-1").await;
        app.wait_for(&run_id, RunStatus::Running).await;
        assert_eq!(app.state.engine.ports().in_use(), 1);

        for _ in 0..2 {
            let response = app
                .router()
                .oneshot(post_empty("/deployments/stop-1/stop"))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);

            let stopped: StopResponse = body_json(response).await;
            assert_eq!(stopped.status, RunStatus::Stopped);
        }
        assert_eq!(app.state.engine.ports().in_use(), 0);
    }

    #[tokio::test]
    async fn test_stop_unknown_deployment() {
        let app = TestApp::new();

        let response = app
            .router()
            .oneshot(post_empty("/deployments/ghost/stop"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stopped: StopResponse = body_json(response).await;
        assert_eq!(stopped.status, RunStatus::Stopped);
        assert_eq!(app.executor.stops(), vec!["ghost".to_string()]);
    }

    #[tokio::test]
    async fn test_get_log_resumes_from_offset() {
        let app = TestApp::new();
        let run_id = app.submit("log-1").await;
        app.wait_for(&run_id, RunStatus::Running).await;

        let response = app
            .router()
            .oneshot(get("/deployments/log-1/log"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first: LogResponse = body_json(response).await;
        assert!(first.chunk.contains("Status: BUILDING"));
        assert_eq!(first.next_from, first.chunk.len() as u64);
        assert_eq!(first.source, LogSource::Local);
        assert!(!first.eof);

        let uri = format!("/deployments/log-1/log?from={}", first.next_from);
        let response = app.router().oneshot(get(&uri)).await.unwrap();
        let rest: LogResponse = body_json(response).await;
        assert!(!rest.chunk.contains("Status: BUILDING"));
        assert_eq!(rest.next_from, first.next_from + rest.chunk.len() as u64);
    }

    #[tokio::test]
    async fn test_get_log_of_failed_build() {
        let app = TestApp::failing();
        let run_id = app.submit("broken").await;
        app.wait_for(&run_id, RunStatus::Failed).await;
        app.wait_retired(&run_id).await;

        let response = app
            .router()
            .oneshot(get("/deployments/broken/log?from=0"))
            .await
            .unwrap();
        let log: LogResponse = body_json(response).await;
        assert!(log.eof);
        assert_eq!(log.source, LogSource::Archive);
        assert!(log.chunk.contains("npm ERR! missing script: build"));
        assert!(log.chunk.contains("ERROR: BuildFailed"));
        assert_eq!(app.state.engine.ports().in_use(), 0);
    }
}
