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
use petrel_common::config::CoordinatorConfig;
use petrel_common::types::plan::ExecutionPlan;
use petrel_common::types::result::QueryResult;
use petrel_rpc_client::WorkerClientPoolRef;

use crate::aggregator::{ResultAggregator, ResultFetcher};
use crate::balancer::LoadBalancerRef;
use crate::manager::ClusterManagerRef;
use crate::scheduler::query::QueryExecution;
use crate::scheduler::{QueryExecutionStatus, SchedulerError, SchedulerResult};

pub type QueryManagerRef = Arc<QueryManager>;

/// Entry point the planner submits plans to.
///
/// Owns the map of executions; one driver task per submitted query. Terminal
/// executions stay in the map so `status` and `get_results` keep answering
/// after the driver exits; the map is process-local and lost on restart.
pub struct QueryManager {
    config: CoordinatorConfig,
    cluster_manager: ClusterManagerRef,
    balancer: LoadBalancerRef,
    client_pool: WorkerClientPoolRef,
    aggregator: ResultAggregator,
    executions: Mutex<HashMap<String, Arc<QueryExecution>>>,
}

impl QueryManager {
    pub fn new(
        config: CoordinatorConfig,
        cluster_manager: ClusterManagerRef,
        balancer: LoadBalancerRef,
        client_pool: WorkerClientPoolRef,
        fetcher: Arc<dyn ResultFetcher>,
    ) -> Self {
        Self {
            config,
            cluster_manager,
            balancer,
            client_pool,
            aggregator: ResultAggregator::new(fetcher),
            executions: Mutex::new(HashMap::new()),
        }
    }

    /// Starts executing `plan` and resolves once the query reaches a terminal
    /// state. A plan without a query id gets a generated one.
    pub async fn submit(&self, mut plan: ExecutionPlan) -> SchedulerResult<QueryResult> {
        if plan.query_id.is_empty() {
            plan.query_id = format!("query-{}", uuid::Uuid::new_v4().simple());
        }
        let query_id = plan.query_id.clone();
        let execution = Arc::new(QueryExecution::new(
            plan,
            self.config.clone(),
            self.cluster_manager.clone(),
            self.balancer.clone(),
            self.client_pool.clone(),
            self.aggregator.clone(),
        ));
        {
            let mut executions = self.executions.lock();
            if let Some(previous) = executions.get(&query_id) {
                if !previous.state().is_terminal() {
                    return Err(SchedulerError::Internal(format!(
                        "query {} is already running",
                        query_id
                    )));
                }
            }
            // A terminal run under the same id is replaced by the new one.
            executions.insert(query_id.clone(), execution.clone());
        }

        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        let driver = execution.clone();
        tokio::spawn(async move {
            let outcome = driver.run().await;
            let _ = result_tx.send(outcome);
        });

        result_rx.await.unwrap_or_else(|_| {
            Err(SchedulerError::Internal(format!(
                "driver task of query {} terminated unexpectedly",
                query_id
            )))
        })
    }

    /// Cancels an active query; returns whether it was active.
    pub fn cancel(&self, query_id: &str, reason: &str) -> bool {
        let execution = self.executions.lock().get(query_id).cloned();
        match execution {
            Some(execution) => execution.cancel(reason),
            None => false,
        }
    }

    pub fn status(&self, query_id: &str) -> Option<QueryExecutionStatus> {
        self.executions
            .lock()
            .get(query_id)
            .map(|execution| execution.status())
    }

    pub fn list_active(&self) -> Vec<QueryExecutionStatus> {
        self.executions
            .lock()
            .values()
            .filter(|execution| !execution.state().is_terminal())
            .map(|execution| execution.status())
            .sorted_by(|a, b| a.query_id.cmp(&b.query_id))
            .collect()
    }

    /// The final result of a completed query; `None` in any other state.
    pub fn get_results(&self, query_id: &str) -> Option<QueryResult> {
        self.executions
            .lock()
            .get(query_id)
            .and_then(|execution| execution.result())
    }

    /// Rolled-up execution statistics of a completed query.
    pub fn get_stats(&self, query_id: &str) -> Option<crate::aggregator::AggregatedStats> {
        self.executions
            .lock()
            .get(query_id)
            .and_then(|execution| execution.stats())
    }
}
