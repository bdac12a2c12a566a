//! Liveness watch
//!
//! Periodically probes RUNNING workloads and fails the ones that died on
//! their own, releasing their ports.

use slipway_core::domain::deployment::{RunId, RunStatus, WorkloadRef};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Engine, apply};
use crate::error::DeployError;
use crate::retry::RetryPolicy;

impl Engine {
    /// Starts the liveness watch; it ends when the engine is dropped
    pub fn spawn_liveness_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let policy = RetryPolicy::every(self.config.liveness_interval);
        info!("Starting liveness watch (interval: {:?})", policy.interval);

        tokio::spawn(async move {
            let mut pacer = policy.pacer();
            while pacer.tick().await {
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                engine.check_liveness().await;
            }
            debug!("Liveness watch stopped");
        })
    }

    /// Probes every RUNNING workload once
    pub async fn check_liveness(&self) {
        let running: Vec<(RunId, WorkloadRef)> = self
            .runs
            .lock()
            .iter()
            .filter(|(_, entry)| entry.record.status == RunStatus::Running)
            .filter_map(|(id, entry)| {
                entry
                    .handle
                    .as_ref()
                    .map(|handle| (id.clone(), handle.workload.clone()))
            })
            .collect();

        for (run_id, workload) in running {
            if !self.supervisor.executor().is_alive(&workload).await {
                self.crashed(&run_id, &workload).await;
            }
        }
    }

    async fn crashed(&self, run_id: &RunId, workload: &WorkloadRef) {
        let message = DeployError::RuntimeCrash(format!("{} is no longer running", workload))
            .status_message();

        let taken = {
            let mut runs = self.runs.lock();
            runs.get_mut(run_id).and_then(|entry| {
                let same = entry
                    .handle
                    .as_ref()
                    .is_some_and(|handle| &handle.workload == workload);
                if !same || !apply(&mut entry.record, RunStatus::Failed, Some(message.clone())) {
                    return None;
                }
                Some((entry.handle.take(), Arc::clone(&entry.log)))
            })
        };
        let Some((handle, log)) = taken else {
            return;
        };

        warn!("Run {} crashed: {}", run_id, message);
        self.teardown(run_id, handle, &log).await;
        log.append(&format!("ERROR: {}", message)).await;
        self.publish(run_id, RunStatus::Failed).await;
        log.retire().await;
        self.evict(run_id, &log);
    }
}
