// Copyright 2025 Petrel Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use parking_lot::RwLock;
use petrel_common::types::worker::{ResourceInfo, WorkerId, WorkerInfo, WorkerStatus};
use thiserror::Error;
use tokio::sync::oneshot::Sender;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type ClusterManagerRef = Arc<ClusterManager>;
pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("worker {0} not found")]
    NotFound(WorkerId),
    #[error("unknown worker {0}, re-register before sending heartbeats")]
    UnknownWorker(WorkerId),
}

/// Instruction returned to a heartbeating worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatDirective {
    Continue,
    /// The registry has no record of the worker; it should register again.
    Reregister,
}

/// Per-status worker counts, a point-in-time view for logs and diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub draining: usize,
}

/// Ground truth of cluster membership and worker health.
///
/// All mutations take the write lock for a short critical section and never
/// await while holding it. Reads clone a consistent snapshot of one worker's
/// record; callers needing a cluster-wide view consume [`ClusterManager::list`]
/// and treat it as point-in-time.
pub struct ClusterManager {
    unhealthy_after: Duration,

    core: RwLock<ClusterManagerCore>,
}

impl ClusterManager {
    pub fn new(unhealthy_after: Duration) -> Self {
        Self {
            unhealthy_after,
            core: RwLock::new(ClusterManagerCore::default()),
        }
    }

    /// Registers a worker and returns its assigned id.
    ///
    /// A missing or colliding `worker_id` gets a freshly generated one. A
    /// re-registration from an endpoint that is already present replaces the
    /// prior record for that endpoint.
    pub fn register(
        &self,
        worker_id: Option<WorkerId>,
        endpoint: impl Into<String>,
        resources: ResourceInfo,
    ) -> WorkerId {
        let endpoint = endpoint.into();
        let mut core = self.core.write();

        if let Some(previous) = core.find_by_endpoint(&endpoint) {
            tracing::info!(endpoint = %endpoint, previous_id = %previous, "replacing re-registered worker");
            core.workers.remove(&previous);
        }

        let assigned_id = match worker_id {
            Some(id) if !core.workers.contains_key(&id) => id,
            requested => {
                let generated = format!("worker-{}", uuid::Uuid::new_v4().simple());
                if let Some(collided) = requested {
                    tracing::info!(
                        requested = %collided,
                        assigned = %generated,
                        "worker id collision, assigning a fresh id"
                    );
                }
                generated
            }
        };

        let worker = WorkerInfo::new(assigned_id.clone(), endpoint.clone(), resources);
        core.workers.insert(assigned_id.clone(), worker);
        tracing::info!(worker_id = %assigned_id, endpoint = %endpoint, "worker registered");
        assigned_id
    }

    pub fn deregister(&self, worker_id: &str, reason: &str) -> RegistryResult<()> {
        let mut core = self.core.write();
        match core.workers.remove(worker_id) {
            Some(worker) => {
                tracing::info!(worker_id, endpoint = %worker.endpoint, reason, "worker deregistered");
                Ok(())
            }
            None => Err(RegistryError::NotFound(worker_id.to_string())),
        }
    }

    /// Refreshes a worker's resources and liveness.
    ///
    /// An unhealthy worker that heartbeats again becomes healthy; a draining
    /// worker stays draining.
    pub fn heartbeat(
        &self,
        worker_id: &str,
        resources: ResourceInfo,
    ) -> RegistryResult<HeartbeatDirective> {
        let mut core = self.core.write();
        let worker = core
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| RegistryError::UnknownWorker(worker_id.to_string()))?;
        tracing::trace!(worker_id, "received heartbeat");
        worker.resources = resources.sanitized();
        worker.last_heartbeat_at = Instant::now();
        if worker.status == WorkerStatus::Unhealthy {
            tracing::info!(worker_id, "worker recovered, marking healthy");
            worker.status = WorkerStatus::Healthy;
        }
        Ok(HeartbeatDirective::Continue)
    }

    /// Marks a worker as draining: still visible, excluded from new
    /// assignments.
    pub fn drain(&self, worker_id: &str) -> RegistryResult<()> {
        let mut core = self.core.write();
        let worker = core
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| RegistryError::NotFound(worker_id.to_string()))?;
        tracing::info!(worker_id, "worker draining");
        worker.status = WorkerStatus::Draining;
        Ok(())
    }

    pub fn get_worker(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.core.read().workers.get(worker_id).cloned()
    }

    /// Point-in-time list of workers, optionally filtered by status, ordered
    /// by worker id.
    pub fn list(&self, filter: Option<WorkerStatus>) -> Vec<WorkerInfo> {
        self.core
            .read()
            .workers
            .values()
            .filter(|w| filter.map_or(true, |status| w.status == status))
            .cloned()
            .sorted_by(|a, b| a.worker_id.cmp(&b.worker_id))
            .collect()
    }

    pub fn get_healthy(&self) -> Vec<WorkerInfo> {
        self.list(Some(WorkerStatus::Healthy))
    }

    pub fn cluster_snapshot(&self) -> ClusterSnapshot {
        let core = self.core.read();
        let mut snapshot = ClusterSnapshot {
            total: core.workers.len(),
            ..Default::default()
        };
        for worker in core.workers.values() {
            match worker.status {
                WorkerStatus::Healthy => snapshot.healthy += 1,
                WorkerStatus::Unhealthy => snapshot.unhealthy += 1,
                WorkerStatus::Draining => snapshot.draining += 1,
            }
        }
        snapshot
    }

    /// One pass of the health sweep: any healthy worker whose last heartbeat
    /// is older than `unhealthy_after` is marked unhealthy. Returns the ids
    /// that were flipped.
    pub fn sweep_once(&self) -> Vec<WorkerId> {
        let now = Instant::now();
        let mut core = self.core.write();
        let mut expired = Vec::new();
        for worker in core.workers.values_mut() {
            if worker.status == WorkerStatus::Healthy
                && now.duration_since(worker.last_heartbeat_at) > self.unhealthy_after
            {
                worker.status = WorkerStatus::Unhealthy;
                expired.push(worker.worker_id.clone());
            }
        }
        drop(core);
        for worker_id in &expired {
            tracing::warn!(worker_id = %worker_id, "worker missed heartbeats, marking unhealthy");
        }
        expired
    }

    /// Spawns the periodic health sweep. Returns the join handle and a
    /// shutdown sender.
    pub fn start_health_checker(
        cluster_manager: ClusterManagerRef,
        check_interval: Duration,
    ) -> (JoinHandle<()>, Sender<()>) {
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();
        let join_handle = tokio::spawn(async move {
            let mut min_interval = tokio::time::interval(check_interval);
            min_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = min_interval.tick() => {},
                    _ = &mut shutdown_rx => {
                        tracing::info!("health checker is stopped");
                        return;
                    }
                }
                cluster_manager.sweep_once();
            }
        });
        (join_handle, shutdown_tx)
    }
}

#[derive(Default)]
struct ClusterManagerCore {
    workers: HashMap<WorkerId, WorkerInfo>,
}

impl ClusterManagerCore {
    fn find_by_endpoint(&self, endpoint: &str) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|w| w.endpoint == endpoint)
            .map(|w| w.worker_id.clone())
    }
}
