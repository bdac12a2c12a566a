//! Build API Handlers

use axum::{Json, extract::State, http::StatusCode};
use slipway_core::dto::build::{BuildAccepted, SubmitBuild};

use crate::api::AppState;
use crate::api::error::ApiResult;
use crate::service::deployment_service;

/// POST /builds
/// Accept a build and start it in the background
pub async fn submit_build(
    State(state): State<AppState>,
    Json(req): Json<SubmitBuild>,
) -> ApiResult<(StatusCode, Json<BuildAccepted>)> {
    tracing::info!("Build requested for {}/{}#{}", req.owner, req.repo, req.branch);

    let accepted = deployment_service::submit_build(&state.engine, req).await?;

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{TestApp, body_json, post_json};
    use slipway_core::domain::deployment::RunStatus;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_submit_build_accepted() {
        let app = TestApp::new();

        let response = app
            .router()
            .oneshot(post_json(
                "/builds",
                serde_json::json!({"owner": "acme", "repo": "site", "run_id": "Site-1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let accepted: BuildAccepted = body_json(response).await;
        assert!(accepted.ok);
        assert_eq!(accepted.run_id.as_str(), "site-1");
        assert_eq!(accepted.status, RunStatus::Queued);

        app.wait_for(&accepted.run_id, RunStatus::Running).await;
    }

    #[tokio::test]
    async fn test_submit_build_rejects_bad_coordinates() {
        let app = TestApp::new();

        let response = app
            .router()
            .oneshot(post_json(
                "/builds",
                serde_json::json!({"owner": "acme", "repo": "..", "branch": "main"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body: serde_json::Value = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("repo"));
    }

    #[tokio::test]
    async fn test_submit_build_rejects_duplicate_run() {
        let app = TestApp::new();
        let body = serde_json::json!({"owner": "acme", "repo": "site", "run_id": "dup"});

        let first = app
            .router()
            .oneshot(post_json("/builds", body.clone()))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = app.router().oneshot(post_json("/builds", body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::BAD_REQUEST);
    }
}
