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

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use petrel_common::types::result::{Datum, ExecutionStats, QueryResult, Row, StageResult};
use thiserror::Error;

pub type AggregateResult<T> = Result<T, AggregateError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregateError {
    #[error("schema mismatch while merging stage results: expected {expected:?}, got {actual:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        actual: Vec<String>,
    },
    #[error("column {0} does not exist in the merged result")]
    UnknownColumn(String),
    #[error("column {0} is not numeric, cannot sum it")]
    NonNumericColumn(String),
    #[error("failed to fetch stage output {handle}: {message}")]
    Fetch { handle: String, message: String },
}

/// Resolves opaque stage result handles into columns and rows.
///
/// Provided by the storage layer in production; tests install an in-memory
/// fetcher.
#[async_trait]
pub trait ResultFetcher: Send + Sync + 'static {
    async fn fetch_columns(&self, handle: &str) -> AggregateResult<Vec<String>>;
    async fn fetch_rows(&self, handle: &str) -> AggregateResult<Vec<Row>>;
}

/// Final transformation applied to the merged rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub enum FinalAggregation {
    #[default]
    None,
    Count,
    Sum {
        column: String,
    },
    GroupBy {
        key: String,
    },
}

/// Execution statistics rolled up across the successful stages of a query.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregatedStats {
    pub rows_processed: u64,
    pub bytes_processed: u64,
    pub execution_time_ms: u64,
    pub cpu_time_ms: u64,
    /// Maximum across stages, not a sum.
    pub memory_peak_mb: u64,
    pub network_bytes_sent: u64,
    pub network_bytes_received: u64,
    pub stage_count: usize,
}

/// Merges per-stage outputs into the final query result.
#[derive(Clone)]
pub struct ResultAggregator {
    fetcher: Arc<dyn ResultFetcher>,
}

impl ResultAggregator {
    pub fn new(fetcher: Arc<dyn ResultFetcher>) -> Self {
        Self { fetcher }
    }

    /// Produces the final result and rolled-up stats from the stage results
    /// the scheduler collected, in the order the stages completed.
    ///
    /// Zero successful stages yield an empty result and zeroed stats; whether
    /// the query as a whole succeeded is the scheduler's verdict, not ours.
    pub async fn aggregate(
        &self,
        results: &[StageResult],
        mode: FinalAggregation,
    ) -> AggregateResult<(QueryResult, AggregatedStats)> {
        let mut partitions = Vec::new();
        for result in results.iter().filter(|r| r.success) {
            if let Some(handle) = &result.result_location {
                let columns = self.fetcher.fetch_columns(handle).await?;
                let rows = self.fetcher.fetch_rows(handle).await?;
                partitions.push(QueryResult::new(columns, rows));
            }
        }
        let merged = Self::merge_partition_results(partitions)?;
        let finalized = Self::apply_final_aggregation(merged, mode)?;
        Ok((finalized, Self::rollup_stats(results)))
    }

    /// Unions row sequences in stage completion order. Every participating
    /// result must carry an identical column list.
    pub fn merge_partition_results(partitions: Vec<QueryResult>) -> AggregateResult<QueryResult> {
        let mut parts = partitions.into_iter();
        let Some(first) = parts.next() else {
            return Ok(QueryResult::empty());
        };
        let columns = first.columns;
        let mut rows = first.rows;
        for part in parts {
            if part.columns != columns {
                return Err(AggregateError::SchemaMismatch {
                    expected: columns,
                    actual: part.columns,
                });
            }
            rows.extend(part.rows);
        }
        Ok(QueryResult::new(columns, rows))
    }

    pub fn apply_final_aggregation(
        intermediate: QueryResult,
        mode: FinalAggregation,
    ) -> AggregateResult<QueryResult> {
        match mode {
            FinalAggregation::None => Ok(intermediate),
            FinalAggregation::Count => Ok(QueryResult::new(
                vec!["count".to_string()],
                vec![vec![Datum::Int(intermediate.total_rows as i64)]],
            )),
            FinalAggregation::Sum { column } => Self::sum_column(intermediate, &column),
            FinalAggregation::GroupBy { key } => Self::group_by(intermediate, &key),
        }
    }

    fn column_index(result: &QueryResult, column: &str) -> AggregateResult<usize> {
        result
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| AggregateError::UnknownColumn(column.to_string()))
    }

    /// Sums the designated column, skipping nulls. An integer column stays
    /// integral; any float widens the total to float. All-null input sums to
    /// a single null.
    fn sum_column(intermediate: QueryResult, column: &str) -> AggregateResult<QueryResult> {
        let index = Self::column_index(&intermediate, column)?;
        let mut int_total: i64 = 0;
        let mut float_total: f64 = 0.0;
        let mut saw_float = false;
        let mut saw_value = false;
        for row in &intermediate.rows {
            match row.get(index).unwrap_or(&Datum::Null) {
                Datum::Int(v) => {
                    saw_value = true;
                    int_total += v;
                }
                Datum::Float(v) => {
                    saw_value = true;
                    saw_float = true;
                    float_total += v;
                }
                Datum::Null => {}
                Datum::Utf8(_) => {
                    return Err(AggregateError::NonNumericColumn(column.to_string()));
                }
            }
        }
        let total = if !saw_value {
            Datum::Null
        } else if saw_float {
            Datum::Float(float_total + int_total as f64)
        } else {
            Datum::Int(int_total)
        };
        Ok(QueryResult::new(
            vec![format!("sum_{}", column)],
            vec![vec![total]],
        ))
    }

    /// Counts rows per distinct key, ordered lexicographically by the key's
    /// string representation for determinism.
    fn group_by(intermediate: QueryResult, key: &str) -> AggregateResult<QueryResult> {
        let index = Self::column_index(&intermediate, key)?;
        let mut groups: BTreeMap<String, (Datum, i64)> = BTreeMap::new();
        for row in &intermediate.rows {
            let datum = row.get(index).unwrap_or(&Datum::Null);
            let entry = groups
                .entry(datum.to_string())
                .or_insert_with(|| (datum.clone(), 0));
            entry.1 += 1;
        }
        let rows = groups
            .into_values()
            .map(|(datum, count)| vec![datum, Datum::Int(count)])
            .collect();
        Ok(QueryResult::new(
            vec![key.to_string(), "count".to_string()],
            rows,
        ))
    }

    /// Additive fields sum across successful stages; `memory_peak_mb` takes
    /// the maximum.
    pub fn rollup_stats(results: &[StageResult]) -> AggregatedStats {
        let mut rolled = AggregatedStats::default();
        for stats in results
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| r.stats.as_ref())
        {
            rolled.rows_processed += stats.rows_processed;
            rolled.bytes_processed += stats.bytes_processed;
            rolled.execution_time_ms += stats.execution_time_ms;
            rolled.cpu_time_ms += stats.cpu_time_ms;
            rolled.memory_peak_mb = rolled.memory_peak_mb.max(stats.memory_peak_mb);
            rolled.network_bytes_sent += stats.network_bytes_sent;
            rolled.network_bytes_received += stats.network_bytes_received;
        }
        rolled.stage_count = results.iter().filter(|r| r.success).count();
        rolled
    }
}
