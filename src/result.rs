//! Grouped statistics returned by the engine.

use serde::{Deserialize, Serialize};

use crate::model::KeyValue;

/// One group: its key, the number of rows that fell into it and one value
/// per requested statistic, in request order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub key: Vec<KeyValue>,
    pub size: u64,
    pub stats: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub key_columns: Vec<String>,
    pub stat_columns: Vec<String>,
    pub rows: Vec<ResultRow>,
}

impl AggregationResult {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn stat_index(&self, label: &str) -> Option<usize> {
        self.stat_columns.iter().position(|c| c == label)
    }

    pub fn key_index(&self, column: &str) -> Option<usize> {
        self.key_columns.iter().position(|c| c == column)
    }

    /// Statistic `label` of `row`.
    pub fn stat(&self, row: &ResultRow, label: &str) -> Option<f64> {
        self.stat_index(label).and_then(|i| row.stats.get(i).copied())
    }

    pub fn key<'a>(&self, row: &'a ResultRow, column: &str) -> Option<&'a KeyValue> {
        self.key_index(column).and_then(|i| row.key.get(i))
    }

    pub fn find(&self, key: &[KeyValue]) -> Option<&ResultRow> {
        self.rows.iter().find(|r| r.key == key)
    }

    /// Rows sorted by key, for presentation and stable comparisons.
    pub fn sorted_by_key(mut self) -> Self {
        self.rows.sort_by(|a, b| a.key.cmp(&b.key));
        self
    }
}

/// Ranks already-aggregated groups by size, largest first with ties going
/// to the smaller key, and keeps the first `n`.
pub fn rank_top_n(rows: &mut Vec<ResultRow>, n: usize) {
    rows.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.key.cmp(&b.key)));
    rows.truncate(n);
}
