//! # Query Input
//!
//! The planner's input is an analyzed query: a range table, a join tree whose
//! leaves reference range-table entries, a target list and optional HAVING,
//! ORDER BY and row-locking clauses. Range-table indexes are 1-based; index 0 is
//! reserved for "the final output".
//!
//! Every outer join (LEFT, RIGHT, FULL, ANTI) owns a range-table entry of kind
//! [`RteKind::Join`]. Its index is the outer-join relid that appears in nulling
//! markers and relid sets. Inner and semi joins do not need one.

use crate::catalog::PartitionInfo;
use crate::error::{PlanError, Result};
use crate::expr::{AttrNumber, Expr, Oid, ScalarValue};
use crate::relids::Index;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Full,
    /// Only produced for paths: a LEFT join executed with its sides swapped.
    Right,
    Semi,
    Anti,
}

impl JoinType {
    pub fn is_outer(self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full | JoinType::Right | JoinType::Anti)
    }
}

/// Uniqueness-relevant shape of a subquery in FROM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubqueryInfo {
    pub rows: f64,
    pub width: i32,
    /// Type of each output column, indexed by `column - 1`.
    pub column_types: Vec<Oid>,
    /// Output columns of a DISTINCT clause.
    pub distinct_cols: Option<Vec<AttrNumber>>,
    /// Output columns that are GROUP BY keys.
    pub group_by_cols: Option<Vec<AttrNumber>>,
    pub has_grouping_sets: bool,
    /// UNION/INTERSECT/EXCEPT without ALL: every output row is distinct.
    pub setop_distinct: bool,
    /// Aggregates without GROUP BY: the subquery yields at most one row.
    pub single_row: bool,
    /// Set-returning functions in the target list defeat every uniqueness proof.
    pub has_target_srfs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RteKind {
    Relation {
        relation: Oid,
    },
    Subquery(SubqueryInfo),
    /// Outer-join marker; never scanned.
    Join,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RangeTblEntry {
    pub alias: String,
    pub kind: RteKind,
    /// Inheritance parent or UNION ALL parent with child entries in `append_rels`.
    pub inh: bool,
    /// References to columns of other FROM items at the same level.
    pub lateral_refs: Vec<Expr>,
    pub partitioning: Option<PartitionInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JoinTreeNode {
    Rel(Index),
    Join {
        jointype: JoinType,
        larg: Box<JoinTreeNode>,
        rarg: Box<JoinTreeNode>,
        quals: Vec<Expr>,
        /// Outer-join relid. Required for LEFT, RIGHT, FULL and ANTI.
        rtindex: Option<Index>,
    },
    /// An implicit inner join of several items with a WHERE-style qual list.
    From {
        items: Vec<JoinTreeNode>,
        quals: Vec<Expr>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetEntry {
    pub expr: Expr,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RowMarkStrength {
    KeyShare,
    Share,
    NoKeyUpdate,
    Update,
}

/// A FOR UPDATE / FOR SHARE request on one range-table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowMark {
    pub rti: Index,
    pub strength: RowMarkStrength,
}

/// Child-to-parent column mapping for inheritance and UNION ALL members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRelInfo {
    pub parent_relid: Index,
    pub child_relid: Index,
    /// Child column number for each parent column, indexed by `parent_attno - 1`.
    pub translated_attnos: Vec<AttrNumber>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortClause {
    pub expr: Expr,
    /// Ordering operator (`<` for ascending, `>` for descending).
    pub sortop: Oid,
    pub nulls_first: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Range table; entry `i` has range-table index `i + 1`.
    pub rtable: Vec<RangeTblEntry>,
    pub jointree: JoinTreeNode,
    pub target_list: Vec<TargetEntry>,
    pub having_qual: Option<Expr>,
    pub result_relation: Option<Index>,
    pub row_marks: Vec<RowMark>,
    pub append_rels: Vec<AppendRelInfo>,
    pub sort_clause: Vec<SortClause>,
    /// Fraction of the result the caller expects to fetch; 0 means all of it.
    pub tuple_fraction: f64,
}

impl Default for Query {
    fn default() -> Self {
        Self {
            rtable: Vec::new(),
            jointree: JoinTreeNode::From {
                items: Vec::new(),
                quals: Vec::new(),
            },
            target_list: Vec::new(),
            having_qual: None,
            result_relation: None,
            row_marks: Vec::new(),
            append_rels: Vec::new(),
            sort_clause: Vec::new(),
            tuple_fraction: 0.0,
        }
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_rte(&mut self, alias: &str, kind: RteKind) -> Index {
        self.rtable.push(RangeTblEntry {
            alias: alias.to_string(),
            kind,
            inh: false,
            lateral_refs: Vec::new(),
            partitioning: None,
        });
        self.rtable.len()
    }

    /// Appends a plain table reference and returns its range-table index.
    pub fn add_relation(&mut self, alias: &str, relation: Oid) -> Index {
        self.push_rte(alias, RteKind::Relation { relation })
    }

    pub fn add_subquery(&mut self, alias: &str, info: SubqueryInfo) -> Index {
        self.push_rte(alias, RteKind::Subquery(info))
    }

    /// Allocates the range-table entry of an outer join.
    pub fn add_join_rte(&mut self, alias: &str) -> Index {
        self.push_rte(alias, RteKind::Join)
    }

    pub fn rte(&self, rti: Index) -> Result<&RangeTblEntry> {
        rti.checked_sub(1)
            .and_then(|i| self.rtable.get(i))
            .ok_or_else(|| PlanError::InvalidInput(format!("range-table index {rti} out of range")))
    }

    pub fn add_target(&mut self, name: &str, expr: Expr) {
        self.target_list.push(TargetEntry {
            expr,
            name: name.to_string(),
        });
    }
}

/// Values for `$n` parameters of a prepared statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoundParams {
    /// Value and type of `$1`, `$2`, ...
    pub values: Vec<(ScalarValue, Oid)>,
}

impl BoundParams {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn get(&self, id: usize) -> Option<&(ScalarValue, Oid)> {
        id.checked_sub(1).and_then(|i| self.values.get(i))
    }
}

/// Joins `larg` and `rarg`.
pub fn join_node(
    jointype: JoinType,
    larg: JoinTreeNode,
    rarg: JoinTreeNode,
    quals: Vec<Expr>,
    rtindex: Option<Index>,
) -> JoinTreeNode {
    JoinTreeNode::Join {
        jointype,
        larg: Box::new(larg),
        rarg: Box::new(rarg),
        quals,
        rtindex,
    }
}
