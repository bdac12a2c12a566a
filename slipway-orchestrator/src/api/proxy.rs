//! Reverse proxy
//!
//! `/proxy/{id}/...` forwards any request to the RUNNING workload of a run
//! on `127.0.0.1:<host port>` and relays the answer. Redirects are rewritten
//! so the browser stays under the proxy prefix.

use axum::{
    body::{Body, to_bytes},
    extract::{Path, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, header},
    response::Response,
};
use serde::Deserialize;
use slipway_core::domain::deployment::RunId;
use slipway_runner::TargetError;

use crate::api::AppState;
use crate::api::error::{ApiError, ApiResult};
use crate::service::deployment_service;

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
];

/// Response headers that keep the app from rendering in a preview frame
const FRAME_BLOCKING: &[&str] = &["x-frame-options", "content-security-policy"];

/// Largest request body relayed upstream
const MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Deserialize)]
pub struct ProxyParams {
    id: String,
}

/// ANY /proxy/{id} and /proxy/{id}/{*path}
pub async fn proxy(
    State(state): State<AppState>,
    Path(params): Path<ProxyParams>,
    req: Request,
) -> ApiResult<Response> {
    let run_id = deployment_service::parse_run_id(&params.id)?;
    let port = state
        .engine
        .resolve_target(&run_id)
        .await
        .map_err(|e| match e {
            TargetError::Unknown => ApiError::NotFound(format!("Deployment {} not found", run_id)),
            TargetError::NotRunning(_) => ApiError::BadRequest(e.to_string()),
        })?;

    let (parts, body) = req.into_parts();
    let upstream = upstream_url(port, parts.uri.path(), parts.uri.query())?;
    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read request body: {}", e)))?;

    let mut headers = parts.headers;
    strip_hop_by_hop(&mut headers);

    tracing::debug!("Proxying {} {} for run {}", parts.method, upstream, run_id);

    let response = state
        .client
        .request(parts.method, upstream.clone())
        .headers(headers)
        .body(body)
        .send()
        .await
        .map_err(|e| ApiError::BadGateway(format!("Upstream of run {} failed: {}", run_id, e)))?;

    let status = response.status();
    let mut headers = response.headers().clone();
    strip_hop_by_hop(&mut headers);
    for name in FRAME_BLOCKING {
        headers.remove(*name);
    }
    rewrite_location(&mut headers, &upstream, &run_id);

    let mut relayed = Response::new(Body::from_stream(response.bytes_stream()));
    *relayed.status_mut() = status;
    *relayed.headers_mut() = headers;
    Ok(relayed)
}

/// Maps `/proxy/<id>/<rest>` onto the workload, keeping `<rest>` encoded as sent
fn upstream_url(port: u16, path: &str, query: Option<&str>) -> ApiResult<reqwest::Url> {
    let rest = path
        .strip_prefix("/proxy/")
        .and_then(|p| p.split_once('/'))
        .map(|(_, rest)| rest)
        .unwrap_or("");

    let mut url = format!("http://127.0.0.1:{}/{}", port, rest);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    reqwest::Url::parse(&url).map_err(|e| ApiError::BadRequest(format!("Invalid proxy path: {}", e)))
}

/// Drops hop-by-hop headers, including any the `Connection` header names
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Points same-origin redirects back through `/proxy/<id>`
fn rewrite_location(headers: &mut HeaderMap, upstream: &reqwest::Url, run_id: &RunId) {
    let Some(location) = headers
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
    else {
        return;
    };
    let Ok(target) = upstream.join(location) else {
        return;
    };
    if target.origin() != upstream.origin() {
        return;
    }

    let mut rewritten = format!("/proxy/{}{}", run_id, target.path());
    if let Some(query) = target.query() {
        rewritten.push('?');
        rewritten.push_str(query);
    }
    if let Ok(value) = HeaderValue::from_str(&rewritten) {
        headers.insert(header::LOCATION, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::{TestApp, body_json, body_text, get};
    use axum::http::StatusCode;
    use slipway_core::domain::deployment::RunStatus;
    use tower::ServiceExt;

    fn upstream() -> reqwest::Url {
        reqwest::Url::parse("http://127.0.0.1:40001/a/b").unwrap()
    }

    #[test]
    fn test_upstream_url_keeps_rest_and_query() {
        let url = upstream_url(40001, "/proxy/abc/_next/static/x%20y.js", Some("v=1")).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:40001/_next/static/x%20y.js?v=1");

        let url = upstream_url(40001, "/proxy/abc", None).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:40001/");
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("x-session", HeaderValue::from_static("1"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("host", HeaderValue::from_static("example.com"));
        headers.insert("cookie", HeaderValue::from_static("a=b"));

        strip_hop_by_hop(&mut headers);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers["cookie"], "a=b");
    }

    #[test]
    fn test_rewrite_location() {
        let run_id = RunId::parse("abc").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, HeaderValue::from_static("../login?next=%2F"));
        rewrite_location(&mut headers, &upstream(), &run_id);
        assert_eq!(headers[header::LOCATION], "/proxy/abc/login?next=%2F");

        headers.insert(
            header::LOCATION,
            HeaderValue::from_static("http://127.0.0.1:40001/done"),
        );
        rewrite_location(&mut headers, &upstream(), &run_id);
        assert_eq!(headers[header::LOCATION], "/proxy/abc/done");

        headers.insert(
            header::LOCATION,
            HeaderValue::from_static("https://accounts.example.com/"),
        );
        rewrite_location(&mut headers, &upstream(), &run_id);
        assert_eq!(headers[header::LOCATION], "https://accounts.example.com/");
    }

    #[tokio::test]
    async fn test_proxy_serves_running_app() {
        let app = TestApp::new();
        let run_id = app.submit("proxied").await;
        app.wait_for(&run_id, RunStatus::Running).await;

        for uri in ["/proxy/proxied", "/proxy/proxied/"] {
            let response = app.router().oneshot(get(uri)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, "hello from the app");
        }

        let response = app
            .router()
            .oneshot(get("/proxy/proxied/query?a=1&b=two"))
            .await
            .unwrap();
        assert_eq!(body_text(response).await, "a=1&b=two");
    }

    #[tokio::test]
    async fn test_proxy_forwards_method_headers_and_body() {
        let app = TestApp::new();
        let run_id = app.submit("echo").await;
        app.wait_for(&run_id, RunStatus::Running).await;

        let request = Request::builder()
            .method("POST")
            .uri("/proxy/echo/echo")
            .header("x-custom", "42")
            .header("proxy-authorization", "Basic c2VjcmV0")
            .body(Body::from("payload"))
            .unwrap();
        let response = app.router().oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-upstream"], "yes");
        assert!(response.headers().get("x-frame-options").is_none());
        assert_eq!(body_text(response).await, "42|false|payload");
    }

    #[tokio::test]
    async fn test_proxy_rewrites_redirects() {
        let app = TestApp::new();
        let run_id = app.submit("redirect").await;
        app.wait_for(&run_id, RunStatus::Running).await;

        let response = app
            .router()
            .oneshot(get("/proxy/redirect/old"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            "/proxy/redirect/new?step=2"
        );
    }

    #[tokio::test]
    async fn test_proxy_rejects_unknown_and_stopped_runs() {
        let app = TestApp::new();

        let response = app.router().oneshot(get("/proxy/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let run_id = app.submit("halted").await;
        app.wait_for(&run_id, RunStatus::Running).await;
        app.state.engine.stop(&run_id).await;

        let response = app.router().oneshot(get("/proxy/halted/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("STOPPED"));
    }

    #[tokio::test]
    async fn test_proxy_reports_dead_upstream() {
        let app = TestApp::new();
        let run_id = app.submit("flaky").await;
        app.wait_for(&run_id, RunStatus::Running).await;

        app.executor.crash(&run_id);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let response = app.router().oneshot(get("/proxy/flaky/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        app.state.engine.check_liveness().await;
        assert_eq!(app.state.engine.status(&run_id).await, Some(RunStatus::Failed));
        assert_eq!(app.state.engine.ports().in_use(), 0);
    }
}
