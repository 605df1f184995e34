//! # joinplan-core: Join Planning Core
//!
//! This crate implements the scan/join planning stage of a relational query
//! planner: it takes an analyzed query, reasons about its relations, clauses
//! and outer joins, and searches for the cheapest join order and join methods
//! under a work budget.
//!
//! ## Module Overview
//!
//! - **`relids`**: Compact sets of range-table indexes.
//! - **`expr`**: Scalar expressions, walkers and the var-rewriting helpers.
//! - **`query`**: The analyzed query handed to the planner.
//! - **`catalog`**, **`stats`**: Catalog trait for relation, index and operator
//!   metadata, and per-column statistics.
//! - **`config`**: Cost constants, enable switches and search knobs.
//! - **`planner_info`**: The per-query planning context and its arenas.
//! - **`relation`**, **`restrictinfo`**, **`path`**: Rels, clauses and paths.
//! - **`initsplan`**, **`placeholder`**: Building base rels and distributing quals.
//! - **`equivalence`**, **`pathkeys`**, **`orclauses`**: Equivalence classes,
//!   canonical sort orders and OR-clause restriction pull-up.
//! - **`params`**: `PARAM_EXEC` slot assignment.
//! - **`uniqueness`**: Inner-rel uniqueness proofs and their per-rel cache.
//! - **`selectivity`**, **`cost`**: Clause selectivity and the cost model.
//! - **`pathnode`**, **`relnode`**, **`allpaths`**, **`joinpath`**, **`joinrels`**:
//!   Path construction for base and join rels.
//! - **`search`**: Budgeted join search (topology decomposition, DP, GEQO, GOO).
//! - **`rule`**: The `Rule` trait and `RuleRegistry` for join simplification.
//! - **`createplan`**, **`planner`**: Plan emission and the `plan_query` entry point.

pub mod allpaths;
pub mod catalog;
pub mod config;
pub mod cost;
pub mod createplan;
pub mod equivalence;
pub mod error;
pub mod expr;
pub mod initsplan;
pub mod joinpath;
pub mod joinrels;
pub mod orclauses;
pub mod params;
pub mod path;
pub mod pathkeys;
pub mod pathnode;
pub mod placeholder;
pub mod planner;
pub mod planner_info;
pub mod query;
pub mod relation;
pub mod relids;
pub mod relnode;
pub mod restrictinfo;
pub mod rule;
pub mod search;
pub mod selectivity;
pub mod stats;
pub mod uniqueness;

pub use error::{PlanError, Result};
pub use planner::{plan_query, PlannedStmt};
