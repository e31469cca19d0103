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

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Worker selection policy of the load balancer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancePolicy {
    RoundRobin,
    LeastConnections,
    LeastLoaded,
    #[default]
    ResourceAware,
    WeightedRoundRobin,
}

/// Top-level process configuration.
///
/// Loaded from a TOML file via [`load_config`]; if the path is empty, default
/// values are used.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PetrelConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Expected worker heartbeat cadence.
    #[serde(default = "default::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// A healthy worker whose last heartbeat is older than this is marked
    /// unhealthy by the sweep.
    #[serde(default = "default::unhealthy_after_ms")]
    pub unhealthy_after_ms: u64,

    /// Period of the health sweep task. Must not exceed the heartbeat
    /// interval to keep staleness detection timely.
    #[serde(default = "default::sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Upper bound on wall-clock time for one wave of concurrent stage
    /// executions.
    #[serde(default = "default::wave_deadline_ms")]
    pub wave_deadline_ms: u64,

    #[serde(default)]
    pub default_policy: BalancePolicy,

    /// Bounds honored by any external autoscaler feeding the registry.
    #[serde(default = "default::min_workers")]
    pub min_workers: u32,
    #[serde(default = "default::max_workers")]
    pub max_workers: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

mod default {
    pub fn heartbeat_interval_ms() -> u64 {
        30_000
    }

    pub fn unhealthy_after_ms() -> u64 {
        120_000
    }

    pub fn sweep_interval_ms() -> u64 {
        heartbeat_interval_ms()
    }

    pub fn wave_deadline_ms() -> u64 {
        30_000
    }

    pub fn min_workers() -> u32 {
        1
    }

    pub fn max_workers() -> u32 {
        5
    }
}

/// Loads the config from `path`, or returns defaults if `path` is empty.
pub fn load_config(path: &str) -> Result<PetrelConfig, ConfigError> {
    if path.is_empty() {
        tracing::info!("no config file specified, using default configuration");
        return Ok(PetrelConfig::default());
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_string(),
        source,
    })
}
