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

use petrel_common::types::plan::{PlanError, StageId};
use thiserror::Error;

use crate::aggregator::AggregateError;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Every way a query can fail. One query terminates with exactly one of
/// these; transport problems reach the scheduler already folded into
/// non-success stage results and surface as [`SchedulerError::StageFailed`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("invalid plan: {0}")]
    PlanInvalid(String),

    #[error("no healthy workers available")]
    NoWorkers,

    #[error("stage {stage_id} failed: {message}")]
    StageFailed { stage_id: StageId, message: String },

    #[error("wave deadline of {deadline_ms} ms exceeded, stages {pending:?} incomplete")]
    StageTimeout {
        deadline_ms: u64,
        pending: Vec<StageId>,
    },

    #[error("query cancelled: {0}")]
    Cancelled(String),

    #[error("result aggregation failed: {0}")]
    Aggregation(String),

    #[error("internal scheduler error: {0}")]
    Internal(String),
}

impl From<PlanError> for SchedulerError {
    fn from(e: PlanError) -> Self {
        SchedulerError::PlanInvalid(e.to_string())
    }
}

impl From<AggregateError> for SchedulerError {
    fn from(e: AggregateError) -> Self {
        SchedulerError::Aggregation(e.to_string())
    }
}
