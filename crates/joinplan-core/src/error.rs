//! Planner error type.
//!
//! Only fatal conditions are errors. Proofs that do not succeed (uniqueness,
//! distinctness, join removability) are plain `bool`/`Option` results.

/// Errors that can abort a planner run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    /// Malformed join tree, dangling range-table index or impossible outer-join nesting.
    #[error("invalid query: {0}")]
    InvalidInput(String),
    /// A construct the planner cannot handle in its position.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Missing relation or operator metadata.
    #[error("catalog lookup failed: {0}")]
    Catalog(String),
    /// The caller cancelled planning.
    #[error("planning cancelled")]
    Cancelled,
    /// A configuration value is out of range.
    #[error("invalid planner configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, PlanError>;
