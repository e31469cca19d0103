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

//! The petrel query coordinator.
//!
//! An external planner hands [`scheduler::QueryManager`] an execution plan;
//! the manager drives the stage DAG in dependency waves over the workers
//! tracked by [`manager::ClusterManager`], picking workers through
//! [`balancer::LoadBalancer`] and talking to them through the worker RPC
//! client pool. Per-stage outputs are merged by
//! [`aggregator::ResultAggregator`] into the final tabular result.

pub mod aggregator;
pub mod balancer;
pub mod manager;
pub mod scheduler;
