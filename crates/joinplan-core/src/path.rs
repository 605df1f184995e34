//! # Paths
//!
//! A `Path` is one way of producing a rel's rows: a scan strategy for a base
//! rel, or a join method plus two input paths for a join rel. Every variant
//! shares the header fields of [`Path`] (parent rel, parameterization, rows,
//! costs, output ordering); the variant-specific parts live in [`PathKind`].
//!
//! Paths reference their inputs by [`PathId`] into the planner arena, so a path
//! tree is a DAG of ids rooted at the chosen path of the top rel.

use crate::catalog::IndexInfo;
use crate::expr::Oid;
use crate::planner_info::{EcId, PathId, PathKeyId, RelId, RinfoId};
use crate::query::JoinType;
use crate::relation::ParamPathInfo;
use crate::relids::Relids;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Canonical sort-order descriptor. Two pathkeys with the same `PathKeyId` are
/// the same ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathKey {
    pub ec: EcId,
    pub opfamily: Oid,
    pub direction: SortDirection,
    pub nulls_first: bool,
}

/// Header of every join path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinPath {
    pub jointype: JoinType,
    /// Each outer row matches at most one inner row.
    pub inner_unique: bool,
    pub outerjoinpath: PathId,
    pub innerjoinpath: PathId,
    pub joinrestrictinfo: Vec<RinfoId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PathKind {
    SeqScan,
    IndexScan {
        index: IndexInfo,
        /// Clauses used as index conditions; join clauses make the path
        /// parameterized.
        indexclauses: Vec<RinfoId>,
    },
    SubqueryScan,
    Append {
        subpaths: Vec<PathId>,
    },
    /// Produces no rows (dummy rel) or evaluates only constant quals.
    Result,
    Material {
        subpath: PathId,
    },
    Sort {
        subpath: PathId,
    },
    NestLoop(JoinPath),
    MergeJoin {
        join: JoinPath,
        mergeclauses: Vec<RinfoId>,
        outersortkeys: Vec<PathKeyId>,
        innersortkeys: Vec<PathKeyId>,
        skip_mark_restore: bool,
        materialize_inner: bool,
    },
    HashJoin {
        join: JoinPath,
        hashclauses: Vec<RinfoId>,
        num_batches: f64,
        inner_rows_total: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Path {
    pub kind: PathKind,
    pub parent: RelId,
    pub param_info: Option<ParamPathInfo>,
    pub parallel_aware: bool,
    pub parallel_safe: bool,
    pub parallel_workers: u32,
    pub rows: f64,
    pub startup_cost: f64,
    pub total_cost: f64,
    pub pathkeys: Vec<PathKeyId>,
}

impl Path {
    pub fn new(kind: PathKind, parent: RelId) -> Self {
        Self {
            kind,
            parent,
            param_info: None,
            parallel_aware: false,
            parallel_safe: true,
            parallel_workers: 0,
            rows: 0.0,
            startup_cost: 0.0,
            total_cost: 0.0,
            pathkeys: Vec::new(),
        }
    }

    /// Outer rels this path needs parameter values from.
    pub fn req_outer(&self) -> Relids {
        self.param_info
            .as_ref()
            .map(|ppi| ppi.req_outer.clone())
            .unwrap_or_default()
    }

    pub fn is_parameterized(&self) -> bool {
        self.param_info
            .as_ref()
            .is_some_and(|ppi| !ppi.req_outer.is_empty())
    }

    pub fn join(&self) -> Option<&JoinPath> {
        match &self.kind {
            PathKind::NestLoop(join)
            | PathKind::MergeJoin { join, .. }
            | PathKind::HashJoin { join, .. } => Some(join),
            _ => None,
        }
    }

    /// Input paths, outer first.
    pub fn subpaths(&self) -> Vec<PathId> {
        match &self.kind {
            PathKind::SeqScan
            | PathKind::IndexScan { .. }
            | PathKind::SubqueryScan
            | PathKind::Result => Vec::new(),
            PathKind::Append { subpaths } => subpaths.clone(),
            PathKind::Material { subpath } | PathKind::Sort { subpath } => vec![*subpath],
            PathKind::NestLoop(join)
            | PathKind::MergeJoin { join, .. }
            | PathKind::HashJoin { join, .. } => vec![join.outerjoinpath, join.innerjoinpath],
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            PathKind::SeqScan => "SeqScan",
            PathKind::IndexScan { .. } => "IndexScan",
            PathKind::SubqueryScan => "SubqueryScan",
            PathKind::Append { .. } => "Append",
            PathKind::Result => "Result",
            PathKind::Material { .. } => "Material",
            PathKind::Sort { .. } => "Sort",
            PathKind::NestLoop(_) => "NestLoop",
            PathKind::MergeJoin { .. } => "MergeJoin",
            PathKind::HashJoin { .. } => "HashJoin",
        }
    }
}

/// Intermediate results of the first costing phase of a join, reused by the
/// second phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinCostWorkspace {
    /// Lower bounds on the final costs.
    pub startup_cost: f64,
    pub total_cost: f64,

    pub run_cost: f64,
    /// Nestloop: cost of the first inner scan and of each rescan.
    pub inner_run_cost: f64,
    pub inner_rescan_run_cost: f64,

    /// Mergejoin: rows read from each side after skipping the non-overlapping
    /// key ranges, and how many were skipped.
    pub outer_rows: f64,
    pub inner_rows: f64,
    pub outer_skip_rows: f64,
    pub inner_skip_rows: f64,

    /// Hashjoin: table geometry.
    pub numbuckets: f64,
    pub numbatches: f64,
    pub inner_rows_total: f64,
}
