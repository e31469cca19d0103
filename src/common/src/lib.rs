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

//! Shared data model and configuration for the petrel coordinator.
//!
//! Everything the coordinator, the RPC client and the tests agree on lives
//! here: worker descriptors, execution plans, stage results, the tabular
//! result representation and the process configuration.

pub mod config;
pub mod types;

pub use types::plan::{ExecutionPlan, ExecutionStage, PlanError, StageId, StageKind};
pub use types::result::{Datum, ExecutionStats, QueryResult, Row, StageResult};
pub use types::worker::{ResourceInfo, WorkerId, WorkerInfo, WorkerStatus};
