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
use std::time::SystemTime;

use bytes::Bytes;
use itertools::Itertools;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stage identifier, unique within one plan.
pub type StageId = u32;

/// The planner's classification of a stage. Opaque to the coordinator: it is
/// forwarded to workers and never interpreted here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Scan,
    Filter,
    Aggregate,
    Exchange,
    Final,
}

/// One unit of work in a plan, executed on a single worker.
#[derive(Clone, Debug)]
pub struct ExecutionStage {
    pub stage_id: StageId,
    pub kind: StageKind,
    pub input_partitions: u32,
    /// The planner's per-stage description, forwarded to workers verbatim.
    pub payload: Bytes,
}

impl ExecutionStage {
    pub fn new(stage_id: StageId, kind: StageKind) -> Self {
        Self {
            stage_id,
            kind,
            input_partitions: 1,
            payload: Bytes::new(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan has no stages")]
    Empty,
    #[error("stage {referenced} referenced in dependencies of stage {by} does not exist")]
    UnknownStage { referenced: StageId, by: StageId },
    #[error("dependency entry for unknown stage {0}")]
    DanglingDependencyEntry(StageId),
    #[error("dependency graph contains a cycle through stage {0}")]
    Cyclic(StageId),
    #[error("plan has no root stages")]
    NoRootStages,
}

/// A dependency DAG of execution stages for one query.
///
/// Stages and dependencies are flat tables keyed by [`StageId`]; there are no
/// back-pointers between stages.
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    pub query_id: String,
    pub stages: HashMap<StageId, ExecutionStage>,
    /// Prerequisites per stage. A stage missing from the map has no
    /// dependencies.
    pub deps: HashMap<StageId, HashSet<StageId>>,
    pub created_at: SystemTime,
}

impl ExecutionPlan {
    pub fn new(
        query_id: impl Into<String>,
        stages: Vec<ExecutionStage>,
        deps: HashMap<StageId, HashSet<StageId>>,
    ) -> Self {
        Self {
            query_id: query_id.into(),
            stages: stages.into_iter().map(|s| (s.stage_id, s)).collect(),
            deps,
            created_at: SystemTime::now(),
        }
    }

    /// Checks the structural invariants: every referenced stage exists, the
    /// dependency graph is acyclic and at least one root stage exists.
    pub fn validate(&self) -> Result<(), PlanError> {
        if self.stages.is_empty() {
            return Err(PlanError::Empty);
        }
        for (stage_id, prerequisites) in &self.deps {
            if !self.stages.contains_key(stage_id) {
                return Err(PlanError::DanglingDependencyEntry(*stage_id));
            }
            for dep in prerequisites {
                if !self.stages.contains_key(dep) {
                    return Err(PlanError::UnknownStage {
                        referenced: *dep,
                        by: *stage_id,
                    });
                }
            }
        }

        let mut graph = DiGraph::<StageId, ()>::new();
        let indices: HashMap<StageId, _> = self
            .stages
            .keys()
            .sorted()
            .map(|id| (*id, graph.add_node(*id)))
            .collect();
        for (stage_id, prerequisites) in &self.deps {
            for dep in prerequisites {
                graph.add_edge(indices[dep], indices[stage_id], ());
            }
        }
        if let Err(cycle) = toposort(&graph, None) {
            return Err(PlanError::Cyclic(graph[cycle.node_id()]));
        }

        if self.root_stages().is_empty() {
            return Err(PlanError::NoRootStages);
        }
        Ok(())
    }

    /// Stages with no prerequisites.
    pub fn root_stages(&self) -> Vec<StageId> {
        self.stages
            .keys()
            .filter(|id| self.deps.get(id).map_or(true, |d| d.is_empty()))
            .copied()
            .sorted()
            .collect()
    }

    /// Stages whose prerequisites are all in `completed` and which are not
    /// themselves completed, in ascending stage id order.
    pub fn ready_stages(&self, completed: &HashSet<StageId>) -> Vec<StageId> {
        self.stages
            .keys()
            .filter(|id| !completed.contains(id))
            .filter(|id| {
                self.deps
                    .get(id)
                    .map_or(true, |prerequisites| prerequisites.is_subset(completed))
            })
            .copied()
            .sorted()
            .collect()
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}
