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

//! End-to-end scheduler scenarios over an in-process mock worker transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use petrel_common::config::{BalancePolicy, CoordinatorConfig};
use petrel_common::types::plan::{ExecutionPlan, ExecutionStage, StageId, StageKind};
use petrel_common::types::result::{Datum, ExecutionStats, Row, StageResult};
use petrel_common::types::worker::ResourceInfo;
use petrel_coordinator::aggregator::{AggregateResult, ResultFetcher};
use petrel_coordinator::balancer::{LoadBalancer, LoadBalancerRef};
use petrel_coordinator::manager::{ClusterManager, ClusterManagerRef};
use petrel_coordinator::scheduler::{QueryManager, QueryManagerRef, QueryState, SchedulerError};
use petrel_rpc_client::{
    CancelRequest, RpcResult, StageRequest, WorkerClientPool, WorkerRpc, WorkerRpcFactory,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Clone)]
enum StageBehavior {
    Succeed { rows_processed: u64 },
    Fail(String),
    Hang,
}

/// Shared journal of everything the mock workers saw.
#[derive(Default)]
struct MockState {
    behaviors: Mutex<HashMap<StageId, StageBehavior>>,
    executed: Mutex<Vec<(String, StageId)>>,
    cancelled: Mutex<Vec<StageId>>,
}

impl MockState {
    fn set_behavior(&self, stage_id: StageId, behavior: StageBehavior) {
        self.behaviors.lock().insert(stage_id, behavior);
    }

    fn executed(&self) -> Vec<(String, StageId)> {
        self.executed.lock().clone()
    }

    fn executed_stages(&self) -> Vec<StageId> {
        self.executed.lock().iter().map(|(_, s)| *s).collect()
    }

    fn cancelled_stages(&self) -> Vec<StageId> {
        self.cancelled.lock().clone()
    }
}

struct MockWorkerClient {
    endpoint: String,
    state: Arc<MockState>,
}

#[async_trait]
impl WorkerRpc for MockWorkerClient {
    async fn execute_stage(&self, request: StageRequest) -> RpcResult<StageResult> {
        // The scheduler must propagate the real query id, never a stage
        // debug representation.
        assert!(!request.query_id.is_empty());
        assert_eq!(
            request.trace_id,
            format!("{}-{}", request.query_id, request.stage_id)
        );
        let behavior = self
            .state
            .behaviors
            .lock()
            .get(&request.stage_id)
            .cloned()
            .unwrap_or(StageBehavior::Succeed { rows_processed: 0 });
        self.state
            .executed
            .lock()
            .push((self.endpoint.clone(), request.stage_id));
        match behavior {
            StageBehavior::Succeed { rows_processed } => Ok(StageResult::ok(
                request.stage_id,
                format!("mem://{}/{}", request.query_id, request.stage_id),
                ExecutionStats {
                    rows_processed,
                    ..Default::default()
                },
            )),
            StageBehavior::Fail(message) => Ok(StageResult::failed(request.stage_id, message)),
            StageBehavior::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }

    async fn cancel_stage(&self, request: CancelRequest) -> RpcResult<()> {
        self.state.cancelled.lock().push(request.stage_id);
        Ok(())
    }
}

struct MockFactory {
    state: Arc<MockState>,
}

#[async_trait]
impl WorkerRpcFactory for MockFactory {
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Arc<dyn WorkerRpc>> {
        Ok(Arc::new(MockWorkerClient {
            endpoint: endpoint.to_string(),
            state: self.state.clone(),
        }))
    }
}

/// In-memory result fetcher. Handles not explicitly inserted resolve to an
/// empty single-column table so scenarios that do not care about row content
/// stay short.
struct MemoryFetcher {
    outputs: Mutex<HashMap<String, (Vec<String>, Vec<Row>)>>,
}

impl MemoryFetcher {
    fn new() -> Self {
        Self {
            outputs: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, handle: &str, columns: Vec<String>, rows: Vec<Row>) {
        self.outputs
            .lock()
            .insert(handle.to_string(), (columns, rows));
    }

    fn get(&self, handle: &str) -> AggregateResult<(Vec<String>, Vec<Row>)> {
        Ok(self
            .outputs
            .lock()
            .get(handle)
            .cloned()
            .unwrap_or_else(|| (vec!["id".to_string()], vec![])))
    }
}

#[async_trait]
impl ResultFetcher for MemoryFetcher {
    async fn fetch_columns(&self, handle: &str) -> AggregateResult<Vec<String>> {
        Ok(self.get(handle)?.0)
    }

    async fn fetch_rows(&self, handle: &str) -> AggregateResult<Vec<Row>> {
        Ok(self.get(handle)?.1)
    }
}

struct TestCluster {
    cluster_manager: ClusterManagerRef,
    balancer: LoadBalancerRef,
    manager: QueryManagerRef,
    state: Arc<MockState>,
    fetcher: Arc<MemoryFetcher>,
}

fn endpoint_of(index: usize) -> String {
    format!("127.0.0.1:{}", 9001 + index)
}

fn build_cluster(worker_count: usize, config: CoordinatorConfig) -> TestCluster {
    let cluster_manager = Arc::new(ClusterManager::new(Duration::from_millis(
        config.unhealthy_after_ms,
    )));
    for index in 0..worker_count {
        cluster_manager.register(
            Some(format!("w{}", index + 1)),
            endpoint_of(index),
            ResourceInfo {
                cpu_cores: 4,
                memory_mb: 8 * 1024,
                disk_mb: 64 * 1024,
                active_queries: 0,
                cpu_utilization: 0.1,
                memory_utilization: 0.1,
            },
        );
    }
    let balancer: LoadBalancerRef = Arc::new(LoadBalancer::new(cluster_manager.clone()));
    let state = Arc::new(MockState::default());
    let client_pool = Arc::new(WorkerClientPool::new(Arc::new(MockFactory {
        state: state.clone(),
    })));
    let fetcher = Arc::new(MemoryFetcher::new());
    let manager = Arc::new(QueryManager::new(
        config,
        cluster_manager.clone(),
        balancer.clone(),
        client_pool,
        fetcher.clone(),
    ));
    TestCluster {
        cluster_manager,
        balancer,
        manager,
        state,
        fetcher,
    }
}

fn make_plan(
    query_id: &str,
    stages: &[(StageId, StageKind)],
    deps: &[(StageId, &[StageId])],
) -> ExecutionPlan {
    let stages = stages
        .iter()
        .map(|(id, kind)| ExecutionStage::new(*id, *kind))
        .collect();
    let deps = deps
        .iter()
        .map(|(id, ds)| (*id, ds.iter().copied().collect::<HashSet<_>>()))
        .collect();
    ExecutionPlan::new(query_id, stages, deps)
}

fn scan_plan(query_id: &str) -> ExecutionPlan {
    make_plan(query_id, &[(0, StageKind::Scan)], &[])
}

fn two_wave_plan(query_id: &str) -> ExecutionPlan {
    make_plan(
        query_id,
        &[
            (0, StageKind::Scan),
            (1, StageKind::Scan),
            (2, StageKind::Aggregate),
        ],
        &[(2, &[0, 1])],
    )
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

#[tokio::test]
async fn test_single_scan_query_on_one_worker() {
    let cluster = build_cluster(1, CoordinatorConfig::default());
    cluster
        .state
        .set_behavior(0, StageBehavior::Succeed { rows_processed: 1000 });
    cluster.fetcher.insert(
        "mem://q1/0",
        vec!["v".to_string()],
        (0..1000).map(|i| vec![Datum::Int(i)]).collect(),
    );

    let result = cluster.manager.submit(scan_plan("q1")).await.unwrap();
    assert_eq!(result.total_rows, 1000);

    // Exactly one stage rpc, to the only worker.
    assert_eq!(cluster.state.executed(), vec![(endpoint_of(0), 0)]);

    let status = cluster.manager.status("q1").unwrap();
    assert_eq!(status.state, QueryState::Completed);
    assert_eq!(status.assigned_workers, vec!["w1".to_string()]);
    assert!(status.error_message.is_none());

    assert_eq!(cluster.manager.get_results("q1").unwrap().total_rows, 1000);
    let stats = cluster.manager.get_stats("q1").unwrap();
    assert_eq!(stats.rows_processed, 1000);
    assert_eq!(stats.stage_count, 1);

    assert_eq!(cluster.balancer.stats().total_outstanding, 0);
}

#[tokio::test]
async fn test_two_wave_aggregation() {
    let config = CoordinatorConfig {
        default_policy: BalancePolicy::LeastConnections,
        ..Default::default()
    };
    let cluster = build_cluster(2, config);

    cluster.manager.submit(two_wave_plan("q2")).await.unwrap();

    let executed = cluster.state.executed();
    assert_eq!(executed.len(), 3);

    // Stage 2 runs strictly after both of its inputs.
    assert_eq!(executed[2].1, 2);
    let first_wave: HashSet<StageId> = executed[..2].iter().map(|(_, s)| *s).collect();
    assert_eq!(first_wave, HashSet::from([0, 1]));

    // Least-connections spread the first wave over distinct workers.
    assert_ne!(executed[0].0, executed[1].0);

    // All slots returned once the query is done.
    assert_eq!(cluster.balancer.stats().total_outstanding, 0);
    assert_eq!(cluster.balancer.outstanding_of("w1"), 0);
    assert_eq!(cluster.balancer.outstanding_of("w2"), 0);
}

#[tokio::test]
async fn test_stage_failure_aborts_query() {
    let cluster = build_cluster(2, CoordinatorConfig::default());
    cluster.state.set_behavior(0, StageBehavior::Hang);
    cluster
        .state
        .set_behavior(1, StageBehavior::Fail("boom".to_string()));

    let error = cluster.manager.submit(two_wave_plan("q3")).await.unwrap_err();
    let message = error.to_string();
    assert!(message.contains("stage 1"), "got: {}", message);
    assert!(message.contains("boom"), "got: {}", message);

    let status = cluster.manager.status("q3").unwrap();
    assert_eq!(status.state, QueryState::Failed);
    assert!(status.error_message.unwrap().contains("boom"));

    // The still-running scan is cancelled on its worker; the aggregate stage
    // is never dispatched.
    wait_until("cancel of stage 0", || {
        cluster.state.cancelled_stages().contains(&0)
    })
    .await;
    assert!(!cluster.state.executed_stages().contains(&2));
    assert!(cluster.manager.get_results("q3").is_none());
    assert_eq!(cluster.balancer.stats().total_outstanding, 0);
}

#[tokio::test(start_paused = true)]
async fn test_wave_deadline_expiry() {
    let config = CoordinatorConfig {
        wave_deadline_ms: 500,
        ..Default::default()
    };
    let cluster = build_cluster(2, config);
    cluster.state.set_behavior(1, StageBehavior::Hang);

    let started = tokio::time::Instant::now();
    let error = cluster.manager.submit(two_wave_plan("q4")).await.unwrap_err();
    let elapsed = started.elapsed();

    assert_matches::assert_matches!(
        error,
        SchedulerError::StageTimeout {
            deadline_ms: 500,
            ref pending
        } if pending.contains(&1)
    );
    assert!(elapsed >= Duration::from_millis(500));
    assert!(elapsed < Duration::from_millis(600), "elapsed {:?}", elapsed);

    wait_until("cancel of stage 1", || {
        cluster.state.cancelled_stages().contains(&1)
    })
    .await;
    assert_eq!(
        cluster.manager.status("q4").unwrap().state,
        QueryState::Failed
    );
    assert_eq!(cluster.balancer.stats().total_outstanding, 0);
}

#[tokio::test]
async fn test_no_healthy_workers_fails_before_dispatch() {
    let cluster = build_cluster(0, CoordinatorConfig::default());

    let error = cluster.manager.submit(scan_plan("q5")).await.unwrap_err();
    assert_matches::assert_matches!(error, SchedulerError::NoWorkers);
    assert!(cluster.state.executed().is_empty());
    assert_eq!(
        cluster.manager.status("q5").unwrap().state,
        QueryState::Failed
    );
}

#[tokio::test]
async fn test_draining_only_cluster_counts_as_no_workers() {
    let cluster = build_cluster(1, CoordinatorConfig::default());
    cluster.cluster_manager.drain("w1").unwrap();

    let error = cluster.manager.submit(scan_plan("q5b")).await.unwrap_err();
    assert_matches::assert_matches!(error, SchedulerError::NoWorkers);
    assert!(cluster.state.executed().is_empty());
}

#[tokio::test]
async fn test_cancel_mid_flight() {
    let cluster = build_cluster(2, CoordinatorConfig::default());
    cluster.state.set_behavior(0, StageBehavior::Hang);
    cluster.state.set_behavior(1, StageBehavior::Hang);

    let manager = cluster.manager.clone();
    let submission =
        tokio::spawn(async move { manager.submit(two_wave_plan("q6")).await });

    let state = cluster.state.clone();
    wait_until("both scans dispatched", move || {
        state.executed.lock().len() == 2
    })
    .await;

    let active = cluster.manager.list_active();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].query_id, "q6");
    assert_eq!(active[0].state, QueryState::Running);

    assert!(cluster.manager.cancel("q6", "user"));
    let outcome = submission.await.unwrap();
    assert_matches::assert_matches!(
        outcome,
        Err(SchedulerError::Cancelled(ref reason)) if reason.contains("user")
    );

    let status = cluster.manager.status("q6").unwrap();
    assert_eq!(status.state, QueryState::Cancelled);

    // One cancellation per in-flight stage, the aggregate never dispatched.
    wait_until("cancel of both scans", || {
        let cancelled: HashSet<StageId> = cluster.state.cancelled_stages().into_iter().collect();
        cancelled == HashSet::from([0, 1])
    })
    .await;
    assert_eq!(cluster.state.cancelled_stages().len(), 2);
    assert!(!cluster.state.executed_stages().contains(&2));

    // Cancelling a terminal query is a no-op.
    assert!(!cluster.manager.cancel("q6", "again"));
    assert!(cluster.manager.list_active().is_empty());
    assert_eq!(cluster.balancer.stats().total_outstanding, 0);
}

#[tokio::test]
async fn test_cyclic_plan_rejected_without_rpc() {
    let cluster = build_cluster(2, CoordinatorConfig::default());
    let plan = make_plan(
        "q7",
        &[(0, StageKind::Scan), (1, StageKind::Filter)],
        &[(0, &[1]), (1, &[0])],
    );

    let error = cluster.manager.submit(plan).await.unwrap_err();
    assert_matches::assert_matches!(error, SchedulerError::PlanInvalid(_));
    assert!(cluster.state.executed().is_empty());
}

#[tokio::test]
async fn test_transport_error_surfaces_as_stage_failure() {
    struct RefusingFactory;

    #[async_trait]
    impl WorkerRpcFactory for RefusingFactory {
        async fn connect(&self, endpoint: &str) -> anyhow::Result<Arc<dyn WorkerRpc>> {
            Err(anyhow::anyhow!("connection refused to {}", endpoint))
        }
    }

    let cluster_manager = Arc::new(ClusterManager::new(Duration::from_secs(120)));
    cluster_manager.register(
        Some("w1".to_string()),
        endpoint_of(0),
        ResourceInfo::default(),
    );
    let balancer: LoadBalancerRef = Arc::new(LoadBalancer::new(cluster_manager.clone()));
    let manager = QueryManager::new(
        CoordinatorConfig::default(),
        cluster_manager,
        balancer,
        Arc::new(WorkerClientPool::new(Arc::new(RefusingFactory))),
        Arc::new(MemoryFetcher::new()),
    );

    let error = manager.submit(scan_plan("q8")).await.unwrap_err();
    assert_matches::assert_matches!(
        error,
        SchedulerError::StageFailed { stage_id: 0, ref message } if message.contains("transport error")
    );
}

/// Random DAGs with bounded fan-in, random worker counts and injected stage
/// failures. Checks the universal invariants: one terminal state per query,
/// dependency order at dispatch time, each stage dispatched at most once, and
/// load-balancer accounting returning to zero.
#[tokio::test]
async fn test_random_dags_hold_invariants() {
    for seed in 0..24u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let stage_count: u32 = rng.gen_range(1..=20);

        let mut stage_list = Vec::new();
        let mut dep_list: Vec<(StageId, Vec<StageId>)> = Vec::new();
        for stage_id in 0..stage_count {
            stage_list.push((stage_id, StageKind::Scan));
            if stage_id > 0 {
                let fan_in = rng.gen_range(0..=stage_id.min(3));
                let mut prerequisites = HashSet::new();
                while (prerequisites.len() as u32) < fan_in {
                    prerequisites.insert(rng.gen_range(0..stage_id));
                }
                dep_list.push((stage_id, prerequisites.into_iter().collect()));
            }
        }
        let deps_refs: Vec<(StageId, &[StageId])> = dep_list
            .iter()
            .map(|(id, ds)| (*id, ds.as_slice()))
            .collect();
        let query_id = format!("prop-{}", seed);
        let plan = make_plan(&query_id, &stage_list, &deps_refs);
        let dependencies: HashMap<StageId, Vec<StageId>> = dep_list.into_iter().collect();

        let worker_count = rng.gen_range(1..=8);
        let cluster = build_cluster(worker_count, CoordinatorConfig::default());
        let mut failed_stages = HashSet::new();
        for stage_id in 0..stage_count {
            if rng.gen_bool(0.2) {
                failed_stages.insert(stage_id);
                cluster
                    .state
                    .set_behavior(stage_id, StageBehavior::Fail("injected".to_string()));
            }
        }

        let outcome = cluster.manager.submit(plan).await;

        // Exactly one terminal state, consistent with the outcome.
        let status = cluster.manager.status(&query_id).unwrap();
        match &outcome {
            Ok(_) => assert_eq!(status.state, QueryState::Completed, "seed {}", seed),
            Err(SchedulerError::StageFailed { stage_id, .. }) => {
                assert_eq!(status.state, QueryState::Failed, "seed {}", seed);
                assert!(failed_stages.contains(stage_id), "seed {}", seed);
            }
            Err(other) => panic!("seed {}: unexpected error {:?}", seed, other),
        }

        let executed = cluster.state.executed_stages();

        // Each stage is dispatched at most once; on success, exactly once.
        let executed_set: HashSet<StageId> = executed.iter().copied().collect();
        assert_eq!(executed.len(), executed_set.len(), "seed {}", seed);
        if outcome.is_ok() {
            assert_eq!(executed_set.len() as u32, stage_count, "seed {}", seed);
        }

        // A stage is only dispatched once all its prerequisites succeeded.
        let position: HashMap<StageId, usize> = executed
            .iter()
            .enumerate()
            .map(|(index, stage_id)| (*stage_id, index))
            .collect();
        for stage_id in &executed {
            for dep in dependencies.get(stage_id).into_iter().flatten() {
                assert!(
                    !failed_stages.contains(dep),
                    "seed {}: stage {} ran after failed dependency {}",
                    seed,
                    stage_id,
                    dep
                );
                assert!(
                    position[dep] < position[stage_id],
                    "seed {}: stage {} dispatched before its dependency {}",
                    seed,
                    stage_id,
                    dep
                );
            }
        }

        // Every selected slot was released.
        assert_eq!(
            cluster.balancer.stats().total_outstanding,
            0,
            "seed {}",
            seed
        );
    }
}
