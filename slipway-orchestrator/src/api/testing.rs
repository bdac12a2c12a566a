//! Test harness: an engine wired to in-memory stores, a fixed source tree
//! and an executor that serves a small axum app on the leased port.

use async_trait::async_trait;
use axum::{
    Router,
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    response::{IntoResponse, Redirect},
    routing::{self, post},
};
use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use slipway_core::domain::build::{BuildRequest, RepoRef};
use slipway_core::domain::deployment::{ExecutorKind, RunId, RunStatus, WorkloadRef};
use slipway_runner::executor::{Artifact, BuildContext, Executor, StartContext};
use slipway_runner::port::PortAllocator;
use slipway_runner::repository::{InMemoryRecordStore, MemoryArchive};
use slipway_runner::service::LogStream;
use slipway_runner::workspace::{Checkout, SourceProvider};
use slipway_runner::{Config, DeployError, Engine};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{AppState, create_router};

struct FixedSource {
    path: PathBuf,
}

#[async_trait]
impl SourceProvider for FixedSource {
    async fn checkout(
        &self,
        source: &RepoRef,
        log: &LogStream,
        _cancel: &CancellationToken,
    ) -> slipway_runner::Result<Checkout> {
        log.append(&format!("Cloning {}", source)).await;
        Ok(Checkout::unlocked(&self.path))
    }
}

/// The app every stub workload serves
fn workload_app() -> Router {
    Router::new()
        .route("/", routing::get(|| async { "hello from the app" }))
        .route("/old", routing::get(|| async { Redirect::temporary("/new?step=2") }))
        .route(
            "/echo",
            post(|headers: HeaderMap, body: String| async move {
                let custom = headers
                    .get("x-custom")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                let hop = headers.contains_key("proxy-authorization");
                (
                    StatusCode::CREATED,
                    [("x-upstream", "yes"), ("x-frame-options", "DENY")],
                    format!("{}|{}|{}", custom, hop, body),
                )
                    .into_response()
            }),
        )
        .route(
            "/query",
            routing::get(|uri: axum::http::Uri| async move { uri.query().unwrap_or("").to_string() }),
        )
}

#[derive(Default)]
pub(crate) struct StubExecutor {
    fail_build: bool,
    servers: Mutex<HashMap<RunId, JoinHandle<()>>>,
    stops: Mutex<Vec<String>>,
}

impl StubExecutor {
    pub fn stops(&self) -> Vec<String> {
        self.stops.lock().clone()
    }

    /// Kills a served app without going through `stop`
    pub fn crash(&self, run_id: &RunId) {
        if let Some(server) = self.servers.lock().remove(run_id) {
            server.abort();
        }
    }
}

#[async_trait]
impl Executor for StubExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Container
    }

    async fn build(&self, ctx: BuildContext<'_>) -> slipway_runner::Result<Artifact> {
        ctx.log.append("> next build").await;
        if self.fail_build {
            ctx.log.append("npm ERR! missing script: build").await;
            return Err(DeployError::BuildFailed {
                command: "npm run build".to_string(),
                exit_code: 1,
                tail: ctx.log.tail(3).await,
            });
        }
        Ok(Artifact::Image {
            tag: ctx.run_id.image_tag(),
        })
    }

    async fn start(&self, ctx: StartContext<'_>) -> slipway_runner::Result<WorkloadRef> {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", ctx.host_port)).await?;
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, workload_app()).await;
        });
        self.servers.lock().insert(ctx.run_id.clone(), server);
        Ok(WorkloadRef::Container {
            name: ctx.run_id.container_name(),
        })
    }

    async fn stop(
        &self,
        run_id: &RunId,
        _workload: Option<&WorkloadRef>,
    ) -> slipway_runner::Result<()> {
        if let Some(server) = self.servers.lock().remove(run_id) {
            server.abort();
        }
        self.stops.lock().push(run_id.to_string());
        Ok(())
    }

    async fn is_alive(&self, workload: &WorkloadRef) -> bool {
        match workload {
            WorkloadRef::Container { name } => self
                .servers
                .lock()
                .keys()
                .any(|id| &id.container_name() == name),
            WorkloadRef::Process { .. } => false,
        }
    }
}

/// Disjoint ranges per harness so parallel tests never share a port
fn port_range() -> (u16, u16) {
    static NEXT: AtomicU16 = AtomicU16::new(23000);
    let low = NEXT.fetch_add(10, Ordering::SeqCst);
    (low, low + 9)
}

pub(crate) struct TestApp {
    _dir: tempfile::TempDir,
    pub state: AppState,
    pub executor: Arc<StubExecutor>,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_executor(StubExecutor::default())
    }

    pub fn failing() -> Self {
        Self::with_executor(StubExecutor {
            fail_build: true,
            ..Default::default()
        })
    }

    fn with_executor(executor: StubExecutor) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::with_base(dir.path());
        config.ready_attempts = 50;
        config.ready_interval = Duration::from_millis(20);
        config.log_flush_interval = Duration::from_millis(50);
        config.liveness_interval = Duration::from_millis(50);
        config.upload_artifacts = false;

        let app_dir = dir.path().join("app");
        std::fs::create_dir_all(&app_dir).unwrap();

        let (low, high) = port_range();
        let executor = Arc::new(executor);
        let engine = Engine::with_parts(
            config,
            Arc::new(FixedSource { path: app_dir }),
            executor.clone(),
            PortAllocator::new(low, high),
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(MemoryArchive::new()),
        );

        let mut state = AppState::new(engine).unwrap();
        state.event_interval = Duration::from_millis(20);

        Self {
            _dir: dir,
            state,
            executor,
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Submits a build straight to the engine
    pub async fn submit(&self, run_id: &str) -> RunId {
        let request = BuildRequest {
            build_id: Uuid::new_v4(),
            run_id: RunId::parse(run_id).unwrap(),
            source: RepoRef::new("acme", "site", "main"),
            env: BTreeMap::new(),
            correlation_id: "test".to_string(),
        };
        self.state.engine.submit(request).await.unwrap().id
    }

    pub async fn wait_for(&self, run_id: &RunId, status: RunStatus) {
        for _ in 0..400 {
            if self.state.engine.status(run_id).await == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("run {} never reached {}", run_id, status);
    }

    /// Waits until the archive mirror reports `status`
    pub async fn wait_for_mirror(&self, run_id: &RunId, status: RunStatus) {
        for _ in 0..400 {
            let (_, archive) = self.state.engine.meta(run_id).await;
            if archive.is_some_and(|meta| meta["status"] == status.as_str()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("mirror of run {} never reached {}", run_id, status);
    }

    pub async fn wait_retired(&self, run_id: &RunId) {
        for _ in 0..400 {
            if self.state.engine.logs().stream(run_id).is_none() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("log of run {} was never retired", run_id);
    }
}

pub(crate) fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub(crate) fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

pub(crate) fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub(crate) async fn body_text(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub(crate) async fn body_json<T: DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
