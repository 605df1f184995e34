//! # Relation Model
//!
//! A [`RelOptInfo`] describes something that can be scanned or joined: a base
//! relation, an inheritance child, or a join of several relations. Base rels are
//! created when planning starts; join rels are created lazily by the join search
//! and cached by their relid set.
//!
//! ## Outer Joins
//!
//! Each LEFT/FULL/ANTI join is described by a [`SpecialJoinInfo`]. Its
//! `min_lefthand`/`min_righthand` sets are the smallest sets of relations that
//! must be present on each side before the join can be performed; the
//! `syn_*` sets are the syntactic sides. A join rel that contains an outer join's
//! relid always contains both of its minimal sides.
//!
//! ## Placeholders
//!
//! A [`PlaceHolderInfo`] tracks where a placeholder expression is evaluated
//! (`ph_eval_at`), where it is still needed (`ph_needed`), and which relations it
//! references laterally.

use crate::catalog::{ForeignKeyInfo, IndexInfo, PartitionInfo};
use crate::expr::{AttrNumber, Expr, Oid, PlaceHolderVar};
use crate::planner_info::{PathId, RinfoId};
use crate::query::{JoinType, SubqueryInfo};
use crate::relids::{Index, Relids};
use crate::stats::ColumnStatistics;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelOptKind {
    Base,
    /// Inheritance or UNION ALL child; scanned as part of its parent's Append.
    OtherMember,
    Join,
    OtherJoin,
    Upper,
    OtherUpper,
}

/// Output columns of a rel, with their total width and evaluation cost.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathTarget {
    pub exprs: Vec<Expr>,
    pub width: i32,
    pub cost_startup: f64,
    pub cost_per_tuple: f64,
}

/// A proof that a rel is unique for joins against `outer_relids`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniqueRelInfo {
    pub outer_relids: Relids,
    /// The proof was made for self-join elimination and holds only for exactly
    /// these outer relids.
    pub self_join: bool,
    /// Base restriction clauses the proof relied on.
    pub extra_clauses: Vec<RinfoId>,
}

/// What kind of object a base rel scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RelSource {
    Relation { oid: Oid },
    Subquery(SubqueryInfo),
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelOptInfo {
    pub kind: RelOptKind,
    pub relids: Relids,
    pub rows: f64,
    /// Keep paths with cheap startup as well as cheap total.
    pub consider_startup: bool,
    pub consider_param_startup: bool,
    pub reltarget: PathTarget,

    pub pathlist: Vec<PathId>,
    pub ppilist: Vec<ParamPathInfo>,
    pub cheapest_startup_path: Option<PathId>,
    pub cheapest_total_path: Option<PathId>,
    /// Cheapest path for each distinct parameterization, unparameterized first.
    pub cheapest_parameterized_paths: Vec<PathId>,

    /// Rels referenced laterally by this rel and not part of it.
    pub direct_lateral_relids: Relids,
    pub lateral_relids: Relids,

    /// Range-table index of a base rel, 0 for joins.
    pub relid: Index,
    pub source: RelSource,
    pub alias: String,
    pub min_attr: AttrNumber,
    pub max_attr: AttrNumber,
    /// Where each column is needed, indexed by `attno - min_attr`. Member 0 means
    /// the final output.
    pub attr_needed: Vec<Relids>,
    pub attr_widths: Vec<i32>,
    pub attr_types: Vec<Oid>,
    /// Outer joins that can null this rel.
    pub nulling_relids: Relids,
    pub lateral_vars: Vec<Expr>,
    pub lateral_referencers: Relids,
    pub indexlist: Vec<IndexInfo>,
    pub pages: f64,
    pub tuples: f64,
    pub allvisfrac: f64,
    pub notnull_attnums: Vec<AttrNumber>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    pub partitioning: Option<PartitionInfo>,
    pub column_stats: HashMap<AttrNumber, ColumnStatistics>,
    /// Has child AppendRelInfos.
    pub inh: bool,

    pub baserestrictinfo: Vec<RinfoId>,
    pub baserestrictcost: f64,
    pub baserestrict_min_security: u32,
    pub joininfo: Vec<RinfoId>,
    pub has_eclass_joins: bool,
    /// Indexes of the equivalence classes that mention this rel.
    pub eclass_indexes: Relids,

    pub unique_for_rels: Vec<UniqueRelInfo>,
    pub non_unique_for_rels: Vec<Relids>,
}

impl RelOptInfo {
    pub fn new(kind: RelOptKind, relids: Relids) -> Self {
        Self {
            kind,
            relids,
            rows: 0.0,
            consider_startup: false,
            consider_param_startup: false,
            reltarget: PathTarget::default(),
            pathlist: Vec::new(),
            ppilist: Vec::new(),
            cheapest_startup_path: None,
            cheapest_total_path: None,
            cheapest_parameterized_paths: Vec::new(),
            direct_lateral_relids: Relids::new(),
            lateral_relids: Relids::new(),
            relid: 0,
            source: RelSource::None,
            alias: String::new(),
            min_attr: 1,
            max_attr: 0,
            attr_needed: Vec::new(),
            attr_widths: Vec::new(),
            attr_types: Vec::new(),
            nulling_relids: Relids::new(),
            lateral_vars: Vec::new(),
            lateral_referencers: Relids::new(),
            indexlist: Vec::new(),
            pages: 0.0,
            tuples: 0.0,
            allvisfrac: 0.0,
            notnull_attnums: Vec::new(),
            foreign_keys: Vec::new(),
            partitioning: None,
            column_stats: HashMap::new(),
            inh: false,
            baserestrictinfo: Vec::new(),
            baserestrictcost: 0.0,
            baserestrict_min_security: u32::MAX,
            joininfo: Vec::new(),
            has_eclass_joins: false,
            eclass_indexes: Relids::new(),
            unique_for_rels: Vec::new(),
            non_unique_for_rels: Vec::new(),
        }
    }

    pub fn is_base(&self) -> bool {
        self.kind == RelOptKind::Base
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, RelOptKind::Join | RelOptKind::OtherJoin)
    }

    /// Slot of a column in the per-attribute arrays.
    pub fn attr_slot(&self, attno: AttrNumber) -> Option<usize> {
        if attno < self.min_attr || attno > self.max_attr {
            return None;
        }
        Some((attno - self.min_attr) as usize)
    }

    pub fn attr_width(&self, attno: AttrNumber) -> i32 {
        self.attr_slot(attno)
            .and_then(|slot| self.attr_widths.get(slot).copied())
            .unwrap_or(4)
    }
}

/// Information about an outer, semi or anti join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpecialJoinInfo {
    pub jointype: JoinType,
    pub min_lefthand: Relids,
    pub min_righthand: Relids,
    pub syn_lefthand: Relids,
    pub syn_righthand: Relids,
    /// Outer-join relid, 0 for semi joins.
    pub ojrelid: Index,
    /// Outer joins above this one, in its LHS, that it commutes with.
    pub commute_above_l: Relids,
    /// Outer joins above this one, in its RHS, that it commutes with.
    pub commute_above_r: Relids,
    /// Outer joins below this one, in its LHS, that it commutes with.
    pub commute_below_l: Relids,
    /// Outer joins below this one, in its RHS, that it commutes with.
    pub commute_below_r: Relids,
    /// The join clauses are strict for some LHS rel.
    pub lhs_strict: bool,
    /// Semi join: the join operators, and the RHS expressions they compare.
    pub semi_operators: Vec<Oid>,
    pub semi_rhs_exprs: Vec<Expr>,
}

impl SpecialJoinInfo {
    /// Describes a plain inner join of the two inputs.
    pub fn dummy(left: &Relids, right: &Relids) -> Self {
        Self {
            jointype: JoinType::Inner,
            min_lefthand: left.clone(),
            min_righthand: right.clone(),
            syn_lefthand: left.clone(),
            syn_righthand: right.clone(),
            ojrelid: 0,
            commute_above_l: Relids::new(),
            commute_above_r: Relids::new(),
            commute_below_l: Relids::new(),
            commute_below_r: Relids::new(),
            lhs_strict: false,
            semi_operators: Vec::new(),
            semi_rhs_exprs: Vec::new(),
        }
    }

    /// Every relid this join needs: both minimal sides plus its own relid.
    pub fn full_relids(&self) -> Relids {
        let mut out = self.min_lefthand.union(&self.min_righthand);
        if self.ojrelid != 0 {
            out.add(self.ojrelid);
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceHolderInfo {
    pub phid: u32,
    pub ph_var: PlaceHolderVar,
    /// Lowest join level at which the expression can be computed.
    pub ph_eval_at: Relids,
    /// Rels referenced by the expression that are outside `ph_eval_at`.
    pub ph_lateral: Relids,
    /// Highest level at which the value is still needed. Member 0 is the final output.
    pub ph_needed: Relids,
    pub ph_width: i32,
}

/// Parameterization of a path: the outer rels it needs values from and the
/// join clauses enforced by taking them as parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamPathInfo {
    pub req_outer: Relids,
    pub rows: f64,
    pub clauses: Vec<RinfoId>,
    pub serials: BTreeSet<u32>,
}
