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

mod error;
mod query;
mod query_manager;

pub use error::{SchedulerError, SchedulerResult};
pub use query::{QueryExecution, QueryExecutionStatus, QueryState, WorkerAssignment};
pub use query_manager::{QueryManager, QueryManagerRef};

/// How many stage dispatches of one wave may be in flight at once.
pub(crate) const STAGE_SCHEDULING_PARALLELISM: usize = 10;
