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

use itertools::Itertools;
use parking_lot::Mutex;
use petrel_common::config::BalancePolicy;
use petrel_common::types::worker::{WorkerId, WorkerInfo};

use crate::manager::ClusterManagerRef;

/// External runtime health signal, e.g. from a container runtime.
///
/// A worker is selectable only if the registry reports it healthy *and* this
/// probe (when installed) accepts it.
pub trait ReadinessProbe: Send + Sync {
    fn is_ready(&self, worker: &WorkerInfo) -> bool;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BalancerStats {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub total_outstanding: u64,
    pub avg_outstanding: f64,
    pub per_worker: HashMap<WorkerId, u64>,
}

pub type LoadBalancerRef = Arc<LoadBalancer>;

/// Picks workers for units of work and tracks outstanding load.
///
/// Selection and counter updates happen under one short lock so concurrent
/// callers cannot double-book a slot beyond what the policy intends. The
/// healthy set is read as a point-in-time snapshot from the registry.
pub struct LoadBalancer {
    cluster_manager: ClusterManagerRef,
    readiness_probe: Option<Arc<dyn ReadinessProbe>>,
    counters: Mutex<BalancerCounters>,
}

#[derive(Default)]
struct BalancerCounters {
    /// Assignments handed out but not yet released, per worker.
    outstanding: HashMap<WorkerId, u64>,
    round_robin_cursor: u64,
    weighted_cursor: u64,
}

impl LoadBalancer {
    pub fn new(cluster_manager: ClusterManagerRef) -> Self {
        Self {
            cluster_manager,
            readiness_probe: None,
            counters: Mutex::new(BalancerCounters::default()),
        }
    }

    pub fn with_readiness_probe(mut self, probe: Arc<dyn ReadinessProbe>) -> Self {
        self.readiness_probe = Some(probe);
        self
    }

    /// Registry-healthy workers that also pass the runtime readiness probe,
    /// ordered by worker id for deterministic iteration and tie-breaks.
    fn selectable_workers(&self) -> Vec<WorkerInfo> {
        self.cluster_manager
            .get_healthy()
            .into_iter()
            .filter(|w| {
                self.readiness_probe
                    .as_ref()
                    .map_or(true, |probe| probe.is_ready(w))
            })
            .collect()
    }

    /// Picks one worker per `policy` and charges it one outstanding slot.
    /// Returns `None` if no worker is selectable.
    pub fn select_one(&self, policy: BalancePolicy) -> Option<WorkerId> {
        let workers = self.selectable_workers();
        if workers.is_empty() {
            return None;
        }
        let mut counters = self.counters.lock();
        let picked = Self::pick(&workers, policy, &mut counters);
        *counters.outstanding.entry(picked.clone()).or_insert(0) += 1;
        tracing::trace!(worker_id = %picked, ?policy, "selected worker");
        Some(picked)
    }

    /// Picks up to `n` distinct workers, each charged one outstanding slot.
    /// Fewer than `n` selectable workers yields fewer picks, not an error.
    pub fn select_many(&self, n: usize, policy: BalancePolicy) -> Vec<WorkerId> {
        let workers = self.selectable_workers();
        if workers.is_empty() || n == 0 {
            return vec![];
        }
        let mut counters = self.counters.lock();
        let picked = match policy {
            BalancePolicy::RoundRobin | BalancePolicy::WeightedRoundRobin => {
                let mut picks = Vec::new();
                // Successive picks; bounded so a small weighted slot ring
                // cannot loop forever once every distinct worker is taken.
                let limit = n.min(workers.len());
                while picks.len() < limit {
                    let next = Self::pick(&workers, policy, &mut counters);
                    if !picks.contains(&next) {
                        picks.push(next);
                    }
                }
                picks
            }
            _ => workers
                .iter()
                .sorted_by(|a, b| {
                    Self::policy_rank(a, policy, &counters)
                        .partial_cmp(&Self::policy_rank(b, policy, &counters))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.worker_id.cmp(&b.worker_id))
                })
                .take(n)
                .map(|w| w.worker_id.clone())
                .collect_vec(),
        };
        for worker_id in &picked {
            *counters.outstanding.entry(worker_id.clone()).or_insert(0) += 1;
        }
        picked
    }

    /// Returns `n` outstanding slots for `worker_id`, floored at zero.
    pub fn release(&self, worker_id: &str, n: u64) {
        let mut counters = self.counters.lock();
        if let Some(outstanding) = counters.outstanding.get_mut(worker_id) {
            *outstanding = outstanding.saturating_sub(n);
        }
    }

    pub fn outstanding_of(&self, worker_id: &str) -> u64 {
        self.counters
            .lock()
            .outstanding
            .get(worker_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn stats(&self) -> BalancerStats {
        let total_workers = self.cluster_manager.list(None).len();
        let healthy_workers = self.selectable_workers().len();
        let counters = self.counters.lock();
        let per_worker = counters.outstanding.clone();
        let total_outstanding: u64 = per_worker.values().sum();
        BalancerStats {
            total_workers,
            healthy_workers,
            total_outstanding,
            avg_outstanding: total_outstanding as f64 / healthy_workers.max(1) as f64,
            per_worker,
        }
    }

    /// Clears the outstanding counters. Used in tests.
    pub fn reset(&self) {
        self.counters.lock().outstanding.clear();
    }

    fn pick(
        workers: &[WorkerInfo],
        policy: BalancePolicy,
        counters: &mut BalancerCounters,
    ) -> WorkerId {
        match policy {
            BalancePolicy::RoundRobin => {
                let index = (counters.round_robin_cursor % workers.len() as u64) as usize;
                counters.round_robin_cursor += 1;
                workers[index].worker_id.clone()
            }
            BalancePolicy::WeightedRoundRobin => {
                // Each worker occupies one slot per declared cpu core.
                let slots: Vec<&WorkerInfo> = workers
                    .iter()
                    .flat_map(|w| {
                        std::iter::repeat(w).take(w.resources.cpu_cores.max(1) as usize)
                    })
                    .collect();
                let index = (counters.weighted_cursor % slots.len() as u64) as usize;
                counters.weighted_cursor += 1;
                slots[index].worker_id.clone()
            }
            _ => workers
                .iter()
                .min_by(|a, b| {
                    Self::policy_rank(a, policy, counters)
                        .partial_cmp(&Self::policy_rank(b, policy, counters))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.worker_id.cmp(&b.worker_id))
                })
                .expect("workers is non-empty")
                .worker_id
                .clone(),
        }
    }

    /// Lower rank is preferred.
    fn policy_rank(worker: &WorkerInfo, policy: BalancePolicy, counters: &BalancerCounters) -> f64 {
        match policy {
            // Reported connections plus what we have dispatched but not yet
            // released, so picks within one wave spread out.
            BalancePolicy::LeastConnections => {
                let outstanding = counters
                    .outstanding
                    .get(&worker.worker_id)
                    .copied()
                    .unwrap_or(0);
                (worker.resources.active_queries as u64 + outstanding) as f64
            }
            BalancePolicy::LeastLoaded => Self::load_score(worker, counters),
            BalancePolicy::ResourceAware => -Self::availability_score(worker),
            // Cursor policies never rank.
            BalancePolicy::RoundRobin | BalancePolicy::WeightedRoundRobin => 0.0,
        }
    }

    /// Composite pressure on a worker; smaller is better.
    fn load_score(worker: &WorkerInfo, counters: &BalancerCounters) -> f64 {
        let outstanding = counters
            .outstanding
            .get(&worker.worker_id)
            .copied()
            .unwrap_or(0) as f64;
        0.4 * outstanding
            + 0.3 * (100.0 * worker.resources.cpu_utilization)
            + 0.2 * (100.0 * worker.resources.memory_utilization)
            + 0.1 * worker.resources.active_queries as f64
    }

    /// Composite headroom of a worker; larger is better.
    fn availability_score(worker: &WorkerInfo) -> f64 {
        0.6 * (100.0 * (1.0 - worker.resources.cpu_utilization))
            + 0.4 * (100.0 * (1.0 - worker.resources.memory_utilization))
    }
}
