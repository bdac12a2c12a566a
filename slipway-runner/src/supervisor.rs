//! Run supervisor
//!
//! Starts a built artifact on a leased port, waits until it answers HTTP,
//! and tears it down again. A [`RunHandle`] owns the port lease, so dropping
//! or stopping a handle is what gives the port back.

use slipway_core::domain::deployment::{RunId, WorkloadRef};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DeployError, Result};
use crate::executor::{Artifact, Executor, StartContext};
use crate::port::PortLease;
use crate::retry::RetryPolicy;
use crate::service::log_pipeline::LogStream;

/// A started workload and the port it owns
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: RunId,
    pub workload: WorkloadRef,
    lease: PortLease,
}

impl RunHandle {
    pub fn port(&self) -> u16 {
        self.lease.port()
    }
}

pub struct Supervisor {
    executor: Arc<dyn Executor>,
    ready_policy: RetryPolicy,
    client: reqwest::Client,
}

impl Supervisor {
    pub fn new(executor: Arc<dyn Executor>, ready_policy: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_default();
        Self {
            executor,
            ready_policy,
            client,
        }
    }

    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Starts the workload and waits for it to become reachable
    ///
    /// On any failure the partially started workload is torn down and the
    /// lease is released before the error is returned.
    pub async fn start(
        &self,
        run_id: &RunId,
        artifact: &Artifact,
        lease: PortLease,
        env: &BTreeMap<String, String>,
        log: Arc<LogStream>,
    ) -> Result<RunHandle> {
        let port = lease.port();
        let started = self
            .executor
            .start(StartContext {
                run_id,
                artifact,
                host_port: port,
                env,
                log: Arc::clone(&log),
            })
            .await;

        let workload = match started {
            Ok(workload) => workload,
            Err(e) => {
                self.teardown(run_id, None).await;
                return Err(e);
            }
        };

        let mut handle = RunHandle {
            run_id: run_id.clone(),
            workload,
            lease,
        };

        if let Err(e) = self.wait_ready(&handle, &log).await {
            self.stop(&mut handle).await.ok();
            return Err(e);
        }

        log.append(&format!("Application is running on port {}", port))
            .await;
        info!("Run {} is ready on port {}", run_id, port);
        Ok(handle)
    }

    /// Polls the workload's port until any HTTP response comes back
    async fn wait_ready(&self, handle: &RunHandle, log: &LogStream) -> Result<()> {
        let port = handle.port();
        let url = format!("http://127.0.0.1:{}/", port);
        let attempts = self.ready_policy.max_attempts.unwrap_or(u32::MAX);
        let mut pacer = self.ready_policy.pacer();

        while pacer.tick().await {
            match self.client.get(&url).send().await {
                Ok(response) => {
                    debug!("Run {} answered with {}", handle.run_id, response.status());
                    return Ok(());
                }
                Err(e) => debug!("Run {} not ready yet: {}", handle.run_id, e),
            }

            if !self.executor.is_alive(&handle.workload).await {
                return Err(DeployError::RuntimeCrash(format!(
                    "{} exited before becoming ready",
                    handle.workload
                )));
            }

            log.append(&format!(
                "Waiting for application to be ready... ({}/{})",
                pacer.attempt(),
                attempts
            ))
            .await;
        }

        Err(DeployError::StartupTimeout {
            port,
            attempts: pacer.attempt(),
        })
    }

    /// Tears the workload down and releases its port
    ///
    /// Safe to call repeatedly. The lease is released even when teardown
    /// cannot be confirmed.
    pub async fn stop(&self, handle: &mut RunHandle) -> Result<()> {
        let result = self
            .executor
            .stop(&handle.run_id, Some(&handle.workload))
            .await;
        handle.lease.release();
        result
    }

    /// Tears down a run without a handle, using its recorded workload if any
    pub async fn stop_by_id(&self, run_id: &RunId, workload: Option<&WorkloadRef>) -> Result<()> {
        self.executor.stop(run_id, workload).await
    }

    pub async fn is_alive(&self, handle: &RunHandle) -> bool {
        self.executor.is_alive(&handle.workload).await
    }

    async fn teardown(&self, run_id: &RunId, workload: Option<&WorkloadRef>) {
        if let Err(e) = self.executor.stop(run_id, workload).await {
            warn!("Cleanup after failed start of run {}: {}", run_id, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::executor::BuildContext;
    use crate::port::PortAllocator;
    use crate::repository::{InMemoryRecordStore, MemoryArchive};
    use crate::service::log_pipeline::LogPipeline;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use slipway_core::domain::deployment::ExecutorKind;
    use std::collections::HashMap;
    use tokio::task::JoinHandle;

    /// Executor double that serves a tiny axum app on the leased port
    #[derive(Default)]
    pub(crate) struct HttpStubExecutor {
        pub fail_build: bool,
        pub never_listen: bool,
        /// How long `stop` takes before the app goes away
        pub stop_delay: Duration,
        pub(crate) servers: Mutex<HashMap<RunId, JoinHandle<()>>>,
        pub stops: Mutex<Vec<RunId>>,
    }

    impl HttpStubExecutor {
        /// Kills a served app without going through `stop`
        pub fn crash(&self, run_id: &RunId) {
            if let Some(server) = self.servers.lock().remove(run_id) {
                server.abort();
            }
        }
    }

    #[async_trait]
    impl Executor for HttpStubExecutor {
        fn kind(&self) -> ExecutorKind {
            ExecutorKind::Container
        }

        async fn build(&self, ctx: BuildContext<'_>) -> Result<Artifact> {
            ctx.log.append("step 1/2: install").await;
            if self.fail_build {
                ctx.log.append("npm ERR! missing script: build").await;
                return Err(DeployError::BuildFailed {
                    command: "build".to_string(),
                    exit_code: 1,
                    tail: ctx.log.tail(5).await,
                });
            }
            Ok(Artifact::Image {
                tag: ctx.run_id.image_tag(),
            })
        }

        async fn start(&self, ctx: StartContext<'_>) -> Result<WorkloadRef> {
            if !self.never_listen {
                let listener = tokio::net::TcpListener::bind(("127.0.0.1", ctx.host_port))
                    .await
                    .map_err(DeployError::Io)?;
                let app = axum::Router::new()
                    .route("/", axum::routing::get(|| async { "hello from the app" }))
                    .route(
                        "/old",
                        axum::routing::get(|| async {
                            axum::response::Redirect::temporary("/new")
                        }),
                    );
                let server = tokio::spawn(async move {
                    let _ = axum::serve(listener, app).await;
                });
                self.servers.lock().insert(ctx.run_id.clone(), server);
            }
            Ok(WorkloadRef::Container {
                name: ctx.run_id.container_name(),
            })
        }

        async fn stop(&self, run_id: &RunId, _workload: Option<&WorkloadRef>) -> Result<()> {
            if !self.stop_delay.is_zero() {
                tokio::time::sleep(self.stop_delay).await;
            }
            if let Some(server) = self.servers.lock().remove(run_id) {
                server.abort();
            }
            self.stops.lock().push(run_id.clone());
            Ok(())
        }

        async fn is_alive(&self, workload: &WorkloadRef) -> bool {
            match workload {
                WorkloadRef::Container { name } => {
                    self.never_listen
                        || self
                            .servers
                            .lock()
                            .keys()
                            .any(|id| &id.container_name() == name)
                }
                WorkloadRef::Process { .. } => false,
            }
        }
    }

    async fn log(dir: &tempfile::TempDir, run_id: &RunId) -> Arc<LogStream> {
        let pipeline = LogPipeline::new(
            dir.path(),
            Arc::new(MemoryArchive::new()),
            Arc::new(InMemoryRecordStore::new()),
            Duration::from_secs(60),
            false,
        );
        pipeline.open(run_id, uuid::Uuid::new_v4()).await.unwrap()
    }

    fn free_range() -> (u16, u16) {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (port, port)
    }

    #[tokio::test]
    async fn test_start_waits_for_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::parse("ready").unwrap();
        let executor = Arc::new(HttpStubExecutor::default());
        let supervisor = Supervisor::new(
            executor.clone(),
            RetryPolicy::fixed(Duration::from_millis(50), 20),
        );
        let (low, high) = free_range();
        let ports = PortAllocator::new(low, high);
        let artifact = Artifact::Image {
            tag: run_id.image_tag(),
        };

        let mut handle = supervisor
            .start(
                &run_id,
                &artifact,
                ports.allocate().unwrap(),
                &BTreeMap::new(),
                log(&dir, &run_id).await,
            )
            .await
            .unwrap();
        assert!(supervisor.is_alive(&handle).await);
        assert!(ports.is_reserved(handle.port()));

        supervisor.stop(&mut handle).await.unwrap();
        supervisor.stop(&mut handle).await.unwrap();
        assert!(!ports.is_reserved(handle.port()));
    }

    #[tokio::test]
    async fn test_startup_timeout_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::parse("silent").unwrap();
        let executor = Arc::new(HttpStubExecutor {
            never_listen: true,
            ..Default::default()
        });
        let supervisor = Supervisor::new(
            executor.clone(),
            RetryPolicy::fixed(Duration::from_millis(10), 3),
        );
        let (low, high) = free_range();
        let ports = PortAllocator::new(low, high);
        let artifact = Artifact::Image {
            tag: run_id.image_tag(),
        };

        let result = supervisor
            .start(
                &run_id,
                &artifact,
                ports.allocate().unwrap(),
                &BTreeMap::new(),
                log(&dir, &run_id).await,
            )
            .await;

        assert!(matches!(
            result,
            Err(DeployError::StartupTimeout { attempts: 3, .. })
        ));
        assert_eq!(ports.in_use(), 0);
        assert_eq!(executor.stops.lock().as_slice(), &[run_id]);
    }
}
