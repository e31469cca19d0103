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

//! The contract the stage scheduler uses to talk to workers.
//!
//! The wire transport itself is external to this crate; concrete transports
//! (and test doubles) plug in through [`WorkerRpcFactory`] and are cached per
//! endpoint by [`WorkerClientPool`].

mod error;
mod pool;

use async_trait::async_trait;
use bytes::Bytes;
pub use error::{RpcError, RpcResult};
use petrel_common::types::plan::StageId;
use petrel_common::types::result::StageResult;
use petrel_common::types::worker::WorkerInfo;
pub use pool::{WorkerClientPool, WorkerClientPoolRef, WorkerRpcFactory};

/// Request to run one stage on a worker.
#[derive(Clone, Debug)]
pub struct StageRequest {
    pub query_id: String,
    pub stage_id: StageId,
    /// The planner's stage description, opaque to the coordinator.
    pub payload: Bytes,
    pub trace_id: String,
}

impl StageRequest {
    pub fn new(query_id: impl Into<String>, stage_id: StageId, payload: Bytes) -> Self {
        let query_id = query_id.into();
        let trace_id = format!("{}-{}", query_id, stage_id);
        Self {
            query_id,
            stage_id,
            payload,
            trace_id,
        }
    }
}

/// Best-effort request to stop a running stage.
#[derive(Clone, Debug)]
pub struct CancelRequest {
    pub query_id: String,
    pub stage_id: StageId,
    pub reason: String,
}

/// Per-endpoint client for the worker stage service.
///
/// `execute_stage` may block until the worker finishes the stage and must be
/// safely callable from many tasks concurrently. Implementations surface
/// transport problems as [`RpcError`]; the pool folds those into non-success
/// stage results so callers always see one result shape.
#[async_trait]
pub trait WorkerRpc: Send + Sync + 'static {
    async fn execute_stage(&self, request: StageRequest) -> RpcResult<StageResult>;

    async fn cancel_stage(&self, request: CancelRequest) -> RpcResult<()>;

    /// Diagnostic helper; transports without a membership view may leave the
    /// default in place.
    async fn list_workers(&self) -> RpcResult<Vec<WorkerInfo>> {
        Err(RpcError::Unsupported("list_workers"))
    }
}
