//! # Column Statistics
//!
//! Per-column statistics as gathered by ANALYZE and handed to the planner through
//! the catalog. They feed clause selectivity estimation (see `selectivity`) and
//! row-width estimation.
//!
//! ## Estimation Defaults
//!
//! When a column has no statistics the planner falls back to fixed defaults:
//!
//! - **Equality**: 1 / [`DEFAULT_NUM_DISTINCT`].
//! - **Range**: [`DEFAULT_INEQ_SEL`] (one third).
//! - **Unknown clause**: [`DEFAULT_UNK_SEL`].

use crate::expr::{oids, Oid, ScalarValue};
use serde::{Deserialize, Serialize};

pub const DEFAULT_EQ_SEL: f64 = 0.005;
pub const DEFAULT_INEQ_SEL: f64 = 1.0 / 3.0;
pub const DEFAULT_UNK_SEL: f64 = 0.005;
pub const DEFAULT_NOT_UNK_SEL: f64 = 1.0 - DEFAULT_UNK_SEL;
pub const DEFAULT_BOOL_SEL: f64 = 0.5;
pub const DEFAULT_NUM_DISTINCT: f64 = 200.0;

/// Typical stored width of a value of the given type, for columns without
/// statistics.
pub fn get_typavgwidth(typid: Oid) -> i32 {
    match typid {
        oids::BOOLOID => 1,
        oids::INT4OID => 4,
        oids::INT8OID | oids::FLOAT8OID => 8,
        _ => 32,
    }
}

/// Per-column statistics used for selectivity estimation and cost modeling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnStatistics {
    /// Number of distinct non-null values.
    pub distinct_count: f64,
    /// Fraction of rows that are NULL [0.0, 1.0].
    pub null_fraction: f64,
    /// Average width of a value in bytes.
    pub avg_width: i32,
    /// Most common values with their frequencies (fraction of all rows).
    pub most_common: Vec<(ScalarValue, f64)>,
}

impl ColumnStatistics {
    pub fn new(distinct_count: f64, null_fraction: f64) -> Self {
        Self {
            distinct_count,
            null_fraction,
            avg_width: 4,
            most_common: Vec::new(),
        }
    }

    pub fn with_width(mut self, avg_width: i32) -> Self {
        self.avg_width = avg_width;
        self
    }

    pub fn with_mcv(mut self, value: ScalarValue, frequency: f64) -> Self {
        self.most_common.push((value, frequency));
        self
    }

    /// Frequency of `value` when it is one of the tracked common values.
    pub fn mcv_frequency(&self, value: &ScalarValue) -> Option<f64> {
        self.most_common
            .iter()
            .find(|(v, _)| v == value)
            .map(|(_, freq)| *freq)
    }

    /// Selectivity of `col = value`.
    ///
    /// Tracked values use their own frequency. Other values share what is left
    /// after the common values and NULLs, spread uniformly over the remaining
    /// distinct values.
    pub fn equality_selectivity(&self, value: &ScalarValue) -> f64 {
        if matches!(value, ScalarValue::Null) {
            return 0.0;
        }
        if let Some(freq) = self.mcv_frequency(value) {
            return freq;
        }
        let mcv_total: f64 = self.most_common.iter().map(|(_, f)| f).sum();
        let remaining_distinct = self.distinct_count - self.most_common.len() as f64;
        if remaining_distinct <= 0.0 {
            return 0.0;
        }
        ((1.0 - mcv_total - self.null_fraction) / remaining_distinct).clamp(0.0, 1.0)
    }

    /// Frequency of the most common value, or the uniform estimate without one.
    pub fn max_frequency(&self) -> f64 {
        self.most_common
            .iter()
            .map(|(_, f)| *f)
            .fold(None, |acc: Option<f64>, f| Some(acc.map_or(f, |a| a.max(f))))
            .unwrap_or_else(|| (1.0 - self.null_fraction) / self.distinct_count.max(1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_prefers_mcv() {
        let stats = ColumnStatistics::new(100.0, 0.0)
            .with_mcv(ScalarValue::Int64(42), 0.5)
            .with_mcv(ScalarValue::Int64(44), 0.25);
        assert!((stats.equality_selectivity(&ScalarValue::Int64(42)) - 0.5).abs() < 1e-12);
        // (1 - 0.75) / 98 for anything else
        let other = stats.equality_selectivity(&ScalarValue::Int64(7));
        assert!((other - 0.25 / 98.0).abs() < 1e-12);
        assert_eq!(stats.equality_selectivity(&ScalarValue::Null), 0.0);
    }

    #[test]
    fn test_uniform_without_mcv() {
        let stats = ColumnStatistics::new(50.0, 0.2);
        assert!((stats.equality_selectivity(&ScalarValue::Int64(1)) - 0.8 / 50.0).abs() < 1e-12);
        assert!((stats.max_frequency() - 0.8 / 50.0).abs() < 1e-12);
    }
}
