//! # Planner State
//!
//! [`PlannerInfo`] is the per-query planning context. It owns every object the
//! planner creates (rels, paths, restriction clauses, equivalence classes) in
//! flat arenas; objects refer to each other through the typed ids defined here.
//! Dropping the `PlannerInfo` releases the whole planning run at once.
//!
//! [`PlannerGlobal`] holds the state shared by all query levels of one planner
//! invocation, chiefly the `PARAM_EXEC` slot table.

use crate::catalog::Catalog;
use crate::config::PlannerConfig;
use crate::equivalence::{EquivalenceClass, JoinDomain};
use crate::error::{PlanError, Result};
use crate::expr::{Expr, Oid};
use crate::path::{Path, PathKey};
use crate::query::{AppendRelInfo, Query, RowMark, SortClause, TargetEntry};
use crate::relation::{PlaceHolderInfo, RelOptInfo, SpecialJoinInfo};
use crate::relids::{Index, Relids};
use crate::restrictinfo::RestrictInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub usize);

        impl $name {
            pub fn index(self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

arena_id!(
    /// Index of a [`RelOptInfo`] in [`PlannerInfo::rels`].
    RelId
);
arena_id!(
    /// Index of a [`Path`] in [`PlannerInfo::paths`].
    PathId
);
arena_id!(
    /// Index of a [`RestrictInfo`] in [`PlannerInfo::rinfos`].
    RinfoId
);
arena_id!(
    /// Index of an [`EquivalenceClass`] in [`PlannerInfo::eq_classes`].
    EcId
);
arena_id!(
    /// Index of a canonical [`PathKey`] in [`PlannerInfo::canon_pathkeys`].
    PathKeyId
);
arena_id!(JoinDomainId);

/// One member of one equivalence class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmRef {
    pub ec: EcId,
    pub member: usize,
}

/// Cooperative cancellation flag, polled by the planner's long loops.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// A value an outer query level passes down into a subquery as a `PARAM_EXEC`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerParamItem {
    /// Var (with `varlevelsup` reset to 0), placeholder, aggregate or grouping
    /// function, as seen from the level that supplies it.
    pub item: Expr,
    pub param_id: usize,
}

/// A parameter a nest loop sets from its outer row before rescanning its inner
/// side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NestLoopParam {
    pub paramno: usize,
    /// Var or placeholder from the outer side.
    pub paramval: Expr,
}

/// State shared by every query level of one planner invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerGlobal {
    /// Result type of each `PARAM_EXEC` slot, indexed by slot id.
    pub param_exec_types: Vec<Oid>,
    /// Outer-level values supplied to lower levels, indexed by `query_level - 1`.
    pub plan_params: Vec<Vec<PlannerParamItem>>,
}

impl PlannerGlobal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameter list of the given (1-based) query level.
    pub fn level_params_mut(&mut self, level: u32) -> &mut Vec<PlannerParamItem> {
        let slot = level.saturating_sub(1) as usize;
        if self.plan_params.len() <= slot {
            self.plan_params.resize_with(slot + 1, Vec::new);
        }
        &mut self.plan_params[slot]
    }
}

pub struct PlannerInfo {
    pub parse: Query,
    pub catalog: Arc<dyn Catalog>,
    pub config: PlannerConfig,
    pub cancel: CancelHandle,
    pub glob: PlannerGlobal,
    /// 1 for the outermost query.
    pub query_level: u32,

    pub rels: Vec<RelOptInfo>,
    pub paths: Vec<Path>,
    pub rinfos: Vec<RestrictInfo>,
    pub eq_classes: Vec<EquivalenceClass>,
    pub join_domains: Vec<JoinDomain>,
    pub canon_pathkeys: Vec<PathKey>,

    /// Base rel of each range-table index; slot 0 is unused.
    pub simple_rel_array: Vec<Option<RelId>>,
    pub join_rel_list: Vec<RelId>,
    pub join_rel_hash: HashMap<Relids, RelId>,
    /// Join level currently being built by the search, for diagnostics.
    pub join_cur_level: usize,

    pub join_info_list: Vec<SpecialJoinInfo>,
    pub placeholder_list: Vec<PlaceHolderInfo>,
    pub append_rel_list: Vec<AppendRelInfo>,
    pub row_marks: Vec<RowMark>,
    /// Nest-loop parameters not yet claimed by a nest-loop plan node.
    pub cur_outer_params: Vec<NestLoopParam>,

    pub all_baserels: Relids,
    pub outer_join_rels: Relids,
    pub all_query_rels: Relids,
    /// Rels the final result is computed from, including outer-join relids.
    pub all_result_relids: Relids,

    pub processed_tlist: Vec<TargetEntry>,
    pub having_qual: Option<Expr>,
    pub sort_clause: Vec<SortClause>,
    pub query_pathkeys: Vec<PathKeyId>,
    pub tuple_fraction: f64,
    pub result_relation: Option<Index>,

    pub last_rinfo_serial: u32,
    pub last_phid: u32,
    pub ec_merging_done: bool,
}

impl PlannerInfo {
    pub fn new(parse: Query, catalog: Arc<dyn Catalog>, config: PlannerConfig) -> Self {
        let nrtes = parse.rtable.len();
        let processed_tlist = parse.target_list.clone();
        let having_qual = parse.having_qual.clone();
        let sort_clause = parse.sort_clause.clone();
        let tuple_fraction = parse.tuple_fraction;
        let result_relation = parse.result_relation;
        let row_marks = parse.row_marks.clone();
        let append_rel_list = parse.append_rels.clone();
        Self {
            parse,
            catalog,
            config,
            cancel: CancelHandle::new(),
            glob: PlannerGlobal::new(),
            query_level: 1,
            rels: Vec::new(),
            paths: Vec::new(),
            rinfos: Vec::new(),
            eq_classes: Vec::new(),
            join_domains: Vec::new(),
            canon_pathkeys: Vec::new(),
            simple_rel_array: vec![None; nrtes + 1],
            join_rel_list: Vec::new(),
            join_rel_hash: HashMap::new(),
            join_cur_level: 0,
            join_info_list: Vec::new(),
            placeholder_list: Vec::new(),
            append_rel_list,
            row_marks,
            cur_outer_params: Vec::new(),
            all_baserels: Relids::new(),
            outer_join_rels: Relids::new(),
            all_query_rels: Relids::new(),
            all_result_relids: Relids::new(),
            processed_tlist,
            having_qual,
            sort_clause,
            query_pathkeys: Vec::new(),
            tuple_fraction,
            result_relation,
            last_rinfo_serial: 0,
            last_phid: 0,
            ec_merging_done: false,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn next_rinfo_serial(&mut self) -> u32 {
        self.last_rinfo_serial += 1;
        self.last_rinfo_serial
    }

    /// Returns `PlanError::Cancelled` once cancellation has been requested.
    pub fn check_for_interrupts(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(PlanError::Cancelled);
        }
        Ok(())
    }

    pub fn rel(&self, id: RelId) -> &RelOptInfo {
        &self.rels[id.0]
    }

    pub fn rel_mut(&mut self, id: RelId) -> &mut RelOptInfo {
        &mut self.rels[id.0]
    }

    pub fn path(&self, id: PathId) -> &Path {
        &self.paths[id.0]
    }

    pub fn rinfo(&self, id: RinfoId) -> &RestrictInfo {
        &self.rinfos[id.0]
    }

    pub fn rinfo_mut(&mut self, id: RinfoId) -> &mut RestrictInfo {
        &mut self.rinfos[id.0]
    }

    pub fn ec(&self, id: EcId) -> &EquivalenceClass {
        &self.eq_classes[id.0]
    }

    pub fn ec_mut(&mut self, id: EcId) -> &mut EquivalenceClass {
        &mut self.eq_classes[id.0]
    }

    pub fn pathkey(&self, id: PathKeyId) -> &PathKey {
        &self.canon_pathkeys[id.0]
    }

    pub fn add_rel(&mut self, rel: RelOptInfo) -> RelId {
        self.rels.push(rel);
        RelId(self.rels.len() - 1)
    }

    pub fn alloc_path(&mut self, path: Path) -> PathId {
        self.paths.push(path);
        PathId(self.paths.len() - 1)
    }

    pub fn add_rinfo(&mut self, rinfo: RestrictInfo) -> RinfoId {
        self.rinfos.push(rinfo);
        RinfoId(self.rinfos.len() - 1)
    }

    /// Base rel for a range-table index, if one was built.
    pub fn base_rel_id(&self, relid: Index) -> Option<RelId> {
        self.simple_rel_array.get(relid).copied().flatten()
    }

    pub fn find_base_rel(&self, relid: Index) -> Result<RelId> {
        self.base_rel_id(relid)
            .ok_or_else(|| PlanError::InvalidInput(format!("no relation entry for relid {relid}")))
    }

    pub fn find_join_rel(&self, relids: &Relids) -> Option<RelId> {
        self.join_rel_hash.get(relids).copied()
    }

    /// Base rel or join rel with exactly these relids.
    pub fn find_rel(&self, relids: &Relids) -> Option<RelId> {
        match relids.singleton_member() {
            Some(relid) => self.base_rel_id(relid),
            None => self.find_join_rel(relids),
        }
    }

    /// Ids of the live base rels, in range-table order.
    pub fn base_rel_ids(&self) -> Vec<RelId> {
        self.all_baserels
            .iter()
            .filter_map(|relid| self.base_rel_id(relid))
            .collect()
    }

    /// Restriction clauses of a rel, resolved.
    pub fn restrictions(&self, rel: RelId) -> impl Iterator<Item = &RestrictInfo> + '_ {
        self.rels[rel.0].baserestrictinfo.iter().map(|id| &self.rinfos[id.0])
    }

    /// Outer joins whose nullable side contains `relid`.
    pub fn nullers_of(&self, relid: Index) -> Relids {
        self.base_rel_id(relid)
            .map(|id| self.rels[id.0].nulling_relids.clone())
            .unwrap_or_default()
    }

    pub fn cheapest_total(&self, rel: RelId) -> Result<PathId> {
        self.rels[rel.0].cheapest_total_path.ok_or_else(|| {
            PlanError::InvalidInput(format!(
                "relation {} has no usable path",
                self.rels[rel.0].relids
            ))
        })
    }
}

impl fmt::Debug for PlannerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlannerInfo")
            .field("query_level", &self.query_level)
            .field("rels", &self.rels.len())
            .field("paths", &self.paths.len())
            .field("rinfos", &self.rinfos.len())
            .field("eq_classes", &self.eq_classes.len())
            .field("all_baserels", &self.all_baserels)
            .field("outer_join_rels", &self.outer_join_rels)
            .finish()
    }
}
