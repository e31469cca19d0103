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

use async_trait::async_trait;
use parking_lot::Mutex;
use petrel_common::types::result::StageResult;

use crate::{CancelRequest, RpcResult, StageRequest, WorkerRpc};

/// Creates a client for one worker endpoint. Failures are reported with
/// whatever context the transport has; the pool wraps them into
/// [`crate::RpcError::ConnectionFailed`].
#[async_trait]
pub trait WorkerRpcFactory: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> anyhow::Result<Arc<dyn WorkerRpc>>;
}

pub type WorkerClientPoolRef = Arc<WorkerClientPool>;

/// Caches one [`WorkerRpc`] client per endpoint.
///
/// The lock guards only the map; connecting happens outside of it, so two
/// tasks racing on a cold endpoint may both connect and one client wins.
pub struct WorkerClientPool {
    factory: Arc<dyn WorkerRpcFactory>,
    clients: Mutex<HashMap<String, Arc<dyn WorkerRpc>>>,
}

impl WorkerClientPool {
    pub fn new(factory: Arc<dyn WorkerRpcFactory>) -> Self {
        Self {
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, endpoint: &str) -> RpcResult<Arc<dyn WorkerRpc>> {
        if let Some(client) = self.clients.lock().get(endpoint) {
            return Ok(client.clone());
        }
        let client = self.factory.connect(endpoint).await.map_err(|source| {
            crate::RpcError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                source,
            }
        })?;
        Ok(self
            .clients
            .lock()
            .entry(endpoint.to_string())
            .or_insert(client)
            .clone())
    }

    /// Drops the cached client for `endpoint`, forcing a reconnect on next
    /// use.
    pub fn invalidate(&self, endpoint: &str) {
        self.clients.lock().remove(endpoint);
    }

    /// Runs a stage and folds every transport-level failure into a
    /// non-success [`StageResult`], so the scheduler always sees one result
    /// shape.
    pub async fn execute_stage_safe(&self, endpoint: &str, request: StageRequest) -> StageResult {
        let stage_id = request.stage_id;
        let client = match self.get(endpoint).await {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(endpoint, stage_id, error = %e, "failed to reach worker");
                return StageResult::failed(stage_id, format!("transport error: {}", e));
            }
        };
        match client.execute_stage(request).await {
            Ok(result) => result,
            Err(e) => {
                self.invalidate(endpoint);
                tracing::warn!(endpoint, stage_id, error = %e, "stage rpc failed");
                StageResult::failed(stage_id, format!("transport error: {}", e))
            }
        }
    }

    /// Sends a cancellation and ignores any failure; the stage may have
    /// already finished or the worker may be gone.
    pub async fn cancel_stage_best_effort(&self, endpoint: &str, request: CancelRequest) {
        let stage_id = request.stage_id;
        match self.get(endpoint).await {
            Ok(client) => {
                if let Err(e) = client.cancel_stage(request).await {
                    tracing::warn!(endpoint, stage_id, error = %e, "cancel rpc failed");
                }
            }
            Err(e) => {
                tracing::warn!(endpoint, stage_id, error = %e, "cancel rpc unreachable");
            }
        }
    }
}
