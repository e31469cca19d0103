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

use crate::types::plan::StageId;

/// Counters a worker reports for one executed stage. All values are
/// non-negative; additive across stages except `memory_peak_mb`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub rows_processed: u64,
    pub bytes_processed: u64,
    pub execution_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_peak_mb: u64,
    pub network_bytes_sent: u64,
    pub network_bytes_received: u64,
}

/// Outcome of one stage execution on one worker.
///
/// `result_location` is an opaque handle used to fetch the stage output and
/// is present iff the stage succeeded; `error_message` is present iff it did
/// not.
#[derive(Clone, Debug, PartialEq)]
pub struct StageResult {
    pub stage_id: StageId,
    pub success: bool,
    pub error_message: Option<String>,
    pub result_location: Option<String>,
    pub stats: Option<ExecutionStats>,
}

impl StageResult {
    pub fn ok(stage_id: StageId, result_location: impl Into<String>, stats: ExecutionStats) -> Self {
        Self {
            stage_id,
            success: true,
            error_message: None,
            result_location: Some(result_location.into()),
            stats: Some(stats),
        }
    }

    pub fn failed(stage_id: StageId, message: impl Into<String>) -> Self {
        Self {
            stage_id,
            success: false,
            error_message: Some(message.into()),
            result_location: None,
            stats: None,
        }
    }
}

/// A single typed cell of a result row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datum {
    Int(i64),
    Float(f64),
    Utf8(String),
    Null,
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }
}

impl std::fmt::Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Int(v) => write!(f, "{}", v),
            Datum::Float(v) => write!(f, "{}", v),
            Datum::Utf8(v) => write!(f, "{}", v),
            Datum::Null => write!(f, "null"),
        }
    }
}

pub type Row = Vec<Datum>;

/// The final tabular answer of a query.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub total_rows: u64,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let total_rows = rows.len() as u64;
        Self {
            columns,
            rows,
            total_rows,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_result_constructors() {
        let ok = StageResult::ok(3, "mem://q/3", ExecutionStats::default());
        assert!(ok.success);
        assert_eq!(ok.result_location.as_deref(), Some("mem://q/3"));
        assert!(ok.error_message.is_none());

        let failed = StageResult::failed(5, "scan error");
        assert!(!failed.success);
        assert!(failed.result_location.is_none());
        assert_eq!(failed.error_message.as_deref(), Some("scan error"));
    }

    #[test]
    fn test_datum_display() {
        assert_eq!(Datum::Int(42).to_string(), "42");
        assert_eq!(Datum::Float(1.5).to_string(), "1.5");
        assert_eq!(Datum::Utf8("a".into()).to_string(), "a");
        assert_eq!(Datum::Null.to_string(), "null");
    }

    #[test]
    fn test_query_result_counts_rows() {
        let result = QueryResult::new(
            vec!["id".into()],
            vec![vec![Datum::Int(1)], vec![Datum::Int(2)]],
        );
        assert_eq!(result.total_rows, 2);
        assert!(!result.is_empty());
        assert!(QueryResult::empty().is_empty());
    }
}
