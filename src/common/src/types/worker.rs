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

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Opaque worker identifier, unique within a cluster lifetime.
pub type WorkerId = String;

/// Liveness state of a registered worker.
///
/// Transitions are driven solely by heartbeats and by explicit drain or
/// deregister calls. A worker holds exactly one status at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Healthy,
    Unhealthy,
    Draining,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Healthy => "healthy",
            WorkerStatus::Unhealthy => "unhealthy",
            WorkerStatus::Draining => "draining",
        };
        write!(f, "{}", s)
    }
}

/// Declared capacity and reported utilization of one worker.
///
/// Shipped with every registration and heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub cpu_cores: u32,
    pub memory_mb: i64,
    pub disk_mb: i64,
    /// Number of queries the worker currently reports as running.
    pub active_queries: u32,
    /// CPU utilization in `[0, 1]`.
    pub cpu_utilization: f64,
    /// Memory utilization in `[0, 1]`.
    pub memory_utilization: f64,
}

impl ResourceInfo {
    /// Returns a copy with utilization values clamped into `[0, 1]`.
    ///
    /// Heartbeats come from remote processes; out-of-range samples must not
    /// poison load scores downstream.
    pub fn sanitized(&self) -> Self {
        let clamp = |v: f64| {
            if v.is_finite() {
                v.clamp(0.0, 1.0)
            } else {
                0.0
            }
        };
        Self {
            cpu_utilization: clamp(self.cpu_utilization),
            memory_utilization: clamp(self.memory_utilization),
            ..self.clone()
        }
    }
}

/// Registry record for one worker.
#[derive(Clone, Debug)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    /// RPC address, `host:port`.
    pub endpoint: String,
    pub status: WorkerStatus,
    pub resources: ResourceInfo,
    pub last_heartbeat_at: Instant,
}

impl WorkerInfo {
    pub fn new(worker_id: WorkerId, endpoint: String, resources: ResourceInfo) -> Self {
        Self {
            worker_id,
            endpoint,
            status: WorkerStatus::Healthy,
            resources: resources.sanitized(),
            last_heartbeat_at: Instant::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == WorkerStatus::Healthy
    }

    /// Milliseconds elapsed since the last heartbeat, for diagnostics.
    pub fn millis_since_heartbeat(&self) -> u128 {
        self.last_heartbeat_at.elapsed().as_millis()
    }
}
