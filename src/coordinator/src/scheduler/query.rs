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

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::StreamExt;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use petrel_common::config::CoordinatorConfig;
use petrel_common::types::plan::{ExecutionPlan, StageId};
use petrel_common::types::result::{QueryResult, StageResult};
use petrel_common::types::worker::{WorkerId, WorkerInfo};
use petrel_rpc_client::{CancelRequest, StageRequest, WorkerClientPoolRef};
use rand::seq::SliceRandom;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::aggregator::{AggregatedStats, FinalAggregation, ResultAggregator};
use crate::balancer::LoadBalancerRef;
use crate::manager::ClusterManagerRef;
use crate::scheduler::{SchedulerError, SchedulerResult, STAGE_SCHEDULING_PARALLELISM};

/// Externally visible lifecycle of a query. `Pending` and `Running` are the
/// only non-terminal states and there are no reverse edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryState::Pending | QueryState::Running)
    }
}

/// Where one stage runs. Solely a logging and cancellation handle; it carries
/// ids, never references.
#[derive(Clone, Debug)]
pub struct WorkerAssignment {
    pub worker_id: WorkerId,
    pub endpoint: String,
    pub stage_id: StageId,
}

#[derive(Clone, Debug)]
pub struct QueryExecutionStatus {
    pub query_id: String,
    pub state: QueryState,
    pub assigned_workers: Vec<WorkerId>,
    pub execution_time_ms: u64,
    pub error_message: Option<String>,
}

enum ExecutionState {
    Pending,
    Running,
    Completed {
        result: QueryResult,
        stats: AggregatedStats,
    },
    Failed {
        error: SchedulerError,
    },
    Cancelled {
        reason: String,
    },
}

/// Drives one plan to a terminal state.
///
/// The driver task repeatedly dispatches the wave of ready stages through the
/// load balancer and the worker client pool, then waits for the wave under
/// one deadline. Stage dependencies order dispatches; unrelated stages run
/// concurrently. Uniquely owned by the scheduler for the query's lifetime.
pub struct QueryExecution {
    plan: ExecutionPlan,
    config: CoordinatorConfig,
    cluster_manager: ClusterManagerRef,
    balancer: LoadBalancerRef,
    client_pool: WorkerClientPoolRef,
    aggregator: ResultAggregator,

    started_at: Instant,
    finished_at: ArcSwapOption<Instant>,
    state: RwLock<ExecutionState>,

    cancelled: AtomicBool,
    cancel_reason: Mutex<Option<String>>,
    cancel_tx: watch::Sender<bool>,

    /// Stages currently running on a worker. Drained exactly once per entry
    /// when the query aborts, so each in-flight stage receives one
    /// cancellation RPC.
    inflight: Mutex<HashMap<StageId, WorkerAssignment>>,
    assigned_workers: Mutex<Vec<WorkerId>>,
}

impl QueryExecution {
    pub fn new(
        plan: ExecutionPlan,
        config: CoordinatorConfig,
        cluster_manager: ClusterManagerRef,
        balancer: LoadBalancerRef,
        client_pool: WorkerClientPoolRef,
        aggregator: ResultAggregator,
    ) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            plan,
            config,
            cluster_manager,
            balancer,
            client_pool,
            aggregator,
            started_at: Instant::now(),
            finished_at: ArcSwapOption::empty(),
            state: RwLock::new(ExecutionState::Pending),
            cancelled: AtomicBool::new(false),
            cancel_reason: Mutex::new(None),
            cancel_tx,
            inflight: Mutex::new(HashMap::new()),
            assigned_workers: Mutex::new(Vec::new()),
        }
    }

    pub fn query_id(&self) -> &str {
        &self.plan.query_id
    }

    pub fn state(&self) -> QueryState {
        match &*self.state.read() {
            ExecutionState::Pending => QueryState::Pending,
            ExecutionState::Running => QueryState::Running,
            ExecutionState::Completed { .. } => QueryState::Completed,
            ExecutionState::Failed { .. } => QueryState::Failed,
            ExecutionState::Cancelled { .. } => QueryState::Cancelled,
        }
    }

    /// The final result, available only once the query completed.
    pub fn result(&self) -> Option<QueryResult> {
        match &*self.state.read() {
            ExecutionState::Completed { result, .. } => Some(result.clone()),
            _ => None,
        }
    }

    pub fn stats(&self) -> Option<AggregatedStats> {
        match &*self.state.read() {
            ExecutionState::Completed { stats, .. } => Some(stats.clone()),
            _ => None,
        }
    }

    pub fn status(&self) -> QueryExecutionStatus {
        let (state, error_message) = match &*self.state.read() {
            ExecutionState::Pending => (QueryState::Pending, None),
            ExecutionState::Running => (QueryState::Running, None),
            ExecutionState::Completed { .. } => (QueryState::Completed, None),
            ExecutionState::Failed { error } => (QueryState::Failed, Some(error.to_string())),
            ExecutionState::Cancelled { reason } => (QueryState::Cancelled, Some(reason.clone())),
        };
        let execution_time_ms = match self.finished_at.load_full() {
            Some(finished_at) => finished_at.duration_since(self.started_at).as_millis() as u64,
            None => self.started_at.elapsed().as_millis() as u64,
        };
        QueryExecutionStatus {
            query_id: self.plan.query_id.clone(),
            state,
            assigned_workers: self.assigned_workers.lock().iter().unique().cloned().collect(),
            execution_time_ms,
            error_message,
        }
    }

    /// Requests cancellation of a pending or running query.
    ///
    /// Sets the cooperative flag the driver observes before each wave and
    /// before any new dispatch, and sends one best-effort cancellation RPC
    /// per stage currently in flight. Returns whether the query was active.
    pub fn cancel(&self, reason: &str) -> bool {
        {
            let state = self.state.read();
            if !matches!(*state, ExecutionState::Pending | ExecutionState::Running) {
                return false;
            }
        }
        self.cancel_reason
            .lock()
            .get_or_insert_with(|| reason.to_string());
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.cancel_tx.send(true);
        let drained = self.drain_inflight();
        self.spawn_cancellations(drained, reason);
        true
    }

    /// Runs the query to its terminal state and records it.
    pub async fn run(&self) -> SchedulerResult<QueryResult> {
        {
            let mut state = self.state.write();
            if !matches!(*state, ExecutionState::Pending) {
                return Err(SchedulerError::Internal(format!(
                    "query {} was started twice",
                    self.plan.query_id
                )));
            }
            *state = ExecutionState::Running;
        }
        tracing::info!(
            query_id = %self.plan.query_id,
            stages = self.plan.stage_count(),
            "query execution started"
        );

        let outcome = self.execute().await;
        self.finished_at.store(Some(Arc::new(Instant::now())));
        match outcome {
            Ok((result, stats)) => {
                tracing::info!(
                    query_id = %self.plan.query_id,
                    rows = result.total_rows,
                    stages = stats.stage_count,
                    rows_processed = stats.rows_processed,
                    "query completed"
                );
                *self.state.write() = ExecutionState::Completed {
                    result: result.clone(),
                    stats,
                };
                Ok(result)
            }
            Err(SchedulerError::Cancelled(reason)) => {
                tracing::info!(query_id = %self.plan.query_id, reason = %reason, "query cancelled");
                *self.state.write() = ExecutionState::Cancelled {
                    reason: reason.clone(),
                };
                Err(SchedulerError::Cancelled(reason))
            }
            Err(error) => {
                tracing::warn!(query_id = %self.plan.query_id, %error, "query failed");
                *self.state.write() = ExecutionState::Failed {
                    error: error.clone(),
                };
                Err(error)
            }
        }
    }

    async fn execute(&self) -> SchedulerResult<(QueryResult, AggregatedStats)> {
        // A malformed DAG must be rejected before any stage is dispatched.
        self.plan.validate()?;

        let mut completed: HashSet<StageId> = HashSet::new();
        let mut stage_results: Vec<StageResult> = Vec::with_capacity(self.plan.stage_count());
        let mut cancel_rx = self.cancel_tx.subscribe();

        while completed.len() < self.plan.stage_count() {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(SchedulerError::Cancelled(self.cancel_reason()));
            }

            let ready = self.plan.ready_stages(&completed);
            if ready.is_empty() {
                return Err(SchedulerError::PlanInvalid(format!(
                    "no runnable stages with {} of {} completed",
                    completed.len(),
                    self.plan.stage_count()
                )));
            }
            tracing::debug!(query_id = %self.plan.query_id, ?ready, "dispatching wave");

            let mut wave = futures::stream::iter(
                ready.iter().copied().map(|stage_id| self.dispatch_stage(stage_id)),
            )
            .buffer_unordered(STAGE_SCHEDULING_PARALLELISM);
            let deadline = tokio::time::sleep(Duration::from_millis(self.config.wave_deadline_ms));
            tokio::pin!(deadline);

            let mut remaining = ready.len();
            while remaining > 0 {
                tokio::select! {
                    biased;
                    _ = cancel_rx.changed() => {
                        let drained = self.drain_inflight();
                        self.spawn_cancellations(drained, "query cancelled");
                        return Err(SchedulerError::Cancelled(self.cancel_reason()));
                    }
                    _ = &mut deadline => {
                        let drained = self.drain_inflight();
                        let pending = drained.iter().map(|a| a.stage_id).sorted().collect();
                        self.spawn_cancellations(drained, "wave deadline exceeded");
                        return Err(SchedulerError::StageTimeout {
                            deadline_ms: self.config.wave_deadline_ms,
                            pending,
                        });
                    }
                    dispatched = wave.next() => {
                        let result = match dispatched
                            .expect("wave stream yields one result per ready stage")
                        {
                            Ok(result) => result,
                            Err(e) => {
                                let drained = self.drain_inflight();
                                self.spawn_cancellations(drained, "sibling dispatch failed");
                                return Err(e);
                            }
                        };
                        if !result.success {
                            let stage_id = result.stage_id;
                            let message = result
                                .error_message
                                .unwrap_or_else(|| "unknown worker error".to_string());
                            let drained = self.drain_inflight();
                            self.spawn_cancellations(drained, "sibling stage failed");
                            return Err(SchedulerError::StageFailed { stage_id, message });
                        }
                        tracing::debug!(
                            query_id = %self.plan.query_id,
                            stage_id = result.stage_id,
                            "stage completed"
                        );
                        completed.insert(result.stage_id);
                        stage_results.push(result);
                        remaining -= 1;
                    }
                }
            }
        }

        let aggregated = self
            .aggregator
            .aggregate(&stage_results, FinalAggregation::None)
            .await?;
        Ok(aggregated)
    }

    /// Runs one stage on one worker and returns its result, transport
    /// failures included as non-success results. The balancer slot is
    /// released when this future resolves or is dropped.
    async fn dispatch_stage(&self, stage_id: StageId) -> SchedulerResult<StageResult> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SchedulerError::Cancelled(self.cancel_reason()));
        }
        let stage = self
            .plan
            .stages
            .get(&stage_id)
            .expect("ready stage exists in plan");
        let (worker, slot) = self.choose_worker()?;

        self.inflight.lock().insert(
            stage_id,
            WorkerAssignment {
                worker_id: worker.worker_id.clone(),
                endpoint: worker.endpoint.clone(),
                stage_id,
            },
        );
        self.assigned_workers.lock().push(worker.worker_id.clone());
        tracing::debug!(
            query_id = %self.plan.query_id,
            stage_id,
            worker_id = %worker.worker_id,
            "executing stage"
        );

        let request = StageRequest::new(self.plan.query_id.clone(), stage_id, stage.payload.clone());
        let result = self
            .client_pool
            .execute_stage_safe(&worker.endpoint, request)
            .await;

        self.inflight.lock().remove(&stage_id);
        drop(slot);
        Ok(result)
    }

    /// Picks a worker with the configured policy; if the balancer has nothing
    /// selectable, falls back to the healthy worker with the fewest active
    /// queries. An empty healthy set fails the query.
    fn choose_worker(&self) -> SchedulerResult<(WorkerInfo, Option<SlotGuard>)> {
        if let Some(worker_id) = self.balancer.select_one(self.config.default_policy) {
            match self.cluster_manager.get_worker(&worker_id) {
                Some(worker) => {
                    let guard = SlotGuard {
                        balancer: self.balancer.clone(),
                        worker_id,
                    };
                    return Ok((worker, Some(guard)));
                }
                // Deregistered between selection and lookup.
                None => self.balancer.release(&worker_id, 1),
            }
        }

        let healthy = self.cluster_manager.get_healthy();
        let min_active = healthy
            .iter()
            .map(|w| w.resources.active_queries)
            .min()
            .ok_or(SchedulerError::NoWorkers)?;
        let candidates = healthy
            .into_iter()
            .filter(|w| w.resources.active_queries == min_active)
            .collect_vec();
        let worker = candidates
            .choose(&mut rand::thread_rng())
            .expect("candidates is non-empty")
            .clone();
        Ok((worker, None))
    }

    fn cancel_reason(&self) -> String {
        self.cancel_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "cancelled".to_string())
    }

    fn drain_inflight(&self) -> Vec<WorkerAssignment> {
        let mut inflight = self.inflight.lock();
        std::mem::take(&mut *inflight).into_values().collect()
    }

    /// Sends one best-effort cancellation RPC per drained assignment. The
    /// stages may still complete normally on their workers; their outcomes
    /// are discarded once the query is terminal.
    fn spawn_cancellations(&self, assignments: Vec<WorkerAssignment>, reason: &str) {
        for assignment in assignments {
            let client_pool = self.client_pool.clone();
            let request = CancelRequest {
                query_id: self.plan.query_id.clone(),
                stage_id: assignment.stage_id,
                reason: reason.to_string(),
            };
            tokio::spawn(async move {
                tracing::debug!(
                    worker_id = %assignment.worker_id,
                    stage_id = assignment.stage_id,
                    "cancelling in-flight stage"
                );
                client_pool
                    .cancel_stage_best_effort(&assignment.endpoint, request)
                    .await;
            });
        }
    }
}

/// Returns one outstanding balancer slot on drop, so the accounting holds no
/// matter how the dispatch future ends.
struct SlotGuard {
    balancer: LoadBalancerRef,
    worker_id: WorkerId,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.balancer.release(&self.worker_id, 1);
    }
}
