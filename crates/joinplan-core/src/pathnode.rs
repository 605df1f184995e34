//! # Path Lists
//!
//! Each rel keeps only the paths that could still be part of the cheapest
//! plan. [`add_path`] compares a new path with every existing one on four
//! dimensions:
//!
//! - costs (total and, when the rel asks for it, startup), with a 1% fuzz
//!   factor so that near-ties are decided by the other dimensions;
//! - output ordering (pathkeys);
//! - parameterization (fewer required outer rels is better);
//! - row count and parallel safety.
//!
//! A path that is no better on any dimension is discarded. When two paths are
//! equal on everything, the one already in the list wins, which keeps the
//! outcome independent of floating-point noise in later candidates.
//!
//! The path list is kept sorted by total cost, so the first entry is always the
//! cheapest and [`add_path_precheck`] can stop early.
//!
//! The `create_*_path` constructors build and cost a path without adding it.

use tracing::trace;

use crate::catalog::IndexInfo;
use crate::cost::{
    cost_append, cost_index, cost_material, cost_seqscan, cost_sort, cost_subqueryscan, final_cost_hashjoin,
    final_cost_mergejoin, final_cost_nestloop,
};
use crate::error::{PlanError, Result};
use crate::joinpath::JoinPathExtraInfo;
use crate::path::{JoinCostWorkspace, JoinPath, Path, PathKind};
use crate::pathkeys::{compare_pathkeys, PathKeysComparison};
use crate::planner_info::{PathId, PathKeyId, PlannerInfo, RelId, RinfoId};
use crate::query::JoinType;
use crate::relation::SpecialJoinInfo;
use crate::relids::{Relids, SubsetComparison};
use crate::relnode::{get_baserel_parampathinfo, get_joinrel_parampathinfo};
use crate::restrictinfo::join_clause_is_movable_into;

/// Paths whose costs differ by less than this factor are treated as equally
/// expensive.
pub const STD_FUZZ_FACTOR: f64 = 1.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostComparison {
    Equal,
    Better1,
    Better2,
    Different,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CostSelector {
    Startup,
    Total,
}

/// Exact comparison on one cost, falling back to the other as a tiebreaker.
pub fn compare_path_costs(path1: &Path, path2: &Path, criterion: CostSelector) -> std::cmp::Ordering {
    let (a1, a2, b1, b2) = match criterion {
        CostSelector::Startup => (path1.startup_cost, path2.startup_cost, path1.total_cost, path2.total_cost),
        CostSelector::Total => (path1.total_cost, path2.total_cost, path1.startup_cost, path2.startup_cost),
    };
    a1.total_cmp(&a2).then(b1.total_cmp(&b2))
}

fn consider_startup(root: &PlannerInfo, path: &Path) -> bool {
    let rel = root.rel(path.parent);
    if path.is_parameterized() {
        rel.consider_param_startup
    } else {
        rel.consider_startup
    }
}

/// Fuzzy cost comparison. Startup cost only matters when the parent rel asks
/// for it.
pub fn compare_path_costs_fuzzily(root: &PlannerInfo, path1: &Path, path2: &Path, fuzz: f64) -> CostComparison {
    if path1.total_cost > path2.total_cost * fuzz {
        if path2.startup_cost > path1.startup_cost * fuzz && consider_startup(root, path1) {
            return CostComparison::Different;
        }
        return CostComparison::Better2;
    }
    if path2.total_cost > path1.total_cost * fuzz {
        if path1.startup_cost > path2.startup_cost * fuzz && consider_startup(root, path2) {
            return CostComparison::Different;
        }
        return CostComparison::Better1;
    }
    if path1.startup_cost > path2.startup_cost * fuzz {
        return CostComparison::Better2;
    }
    if path2.startup_cost > path1.startup_cost * fuzz {
        return CostComparison::Better1;
    }
    CostComparison::Equal
}

/// Pathkeys that count for domination: a parameterized path is only ever
/// used as a nestloop inner, where its ordering is irrelevant.
fn effective_pathkeys(path: &Path) -> &[PathKeyId] {
    if path.param_info.is_some() {
        &[]
    } else {
        &path.pathkeys
    }
}

/// Row count and parallel safety tiebreak between two paths already equal
/// on cost and keys. With `prefer_new` set, returns true when `new` is at
/// least as good as `old` on both, so `old` can be dropped; otherwise returns
/// true when `old` is at least as good as `new`, so `new` can be rejected.
fn compare_secondary(new: &Path, old: &Path, prefer_new: bool) -> bool {
    if prefer_new {
        new.rows <= old.rows && new.parallel_safe >= old.parallel_safe
    } else {
        new.rows >= old.rows && new.parallel_safe <= old.parallel_safe
    }
}

/// Adds `new_path` to `rel`'s path list unless an existing path dominates it,
/// and drops the existing paths it dominates. Returns the id of the stored
/// path when it was accepted.
pub fn add_path(root: &mut PlannerInfo, rel: RelId, new_path: Path) -> Option<PathId> {
    let mut accept_new = true;
    let mut insert_at = 0;
    let mut keep: Vec<PathId> = Vec::new();
    let pathlist = root.rel(rel).pathlist.clone();
    let new_keys = effective_pathkeys(&new_path).to_vec();
    let new_outer = new_path.req_outer();

    let mut iter = pathlist.iter().copied();
    while let Some(old_id) = iter.next() {
        let old = root.path(old_id);
        let mut remove_old = false;

        let costcmp = compare_path_costs_fuzzily(root, &new_path, old, STD_FUZZ_FACTOR);
        if costcmp != CostComparison::Different {
            let keyscmp = compare_pathkeys(&new_keys, effective_pathkeys(old));
            if keyscmp != PathKeysComparison::Different {
                let outercmp = new_outer.subset_compare(&old.req_outer());
                let new_outer_ok = matches!(outercmp, SubsetComparison::Equal | SubsetComparison::Subset1);
                let old_outer_ok = matches!(outercmp, SubsetComparison::Equal | SubsetComparison::Subset2);
                match costcmp {
                    CostComparison::Equal => match keyscmp {
                        PathKeysComparison::Better1 => {
                            if new_outer_ok && compare_secondary(&new_path, old, true) {
                                remove_old = true;
                            }
                        }
                        PathKeysComparison::Better2 => {
                            if old_outer_ok && compare_secondary(&new_path, old, false) {
                                accept_new = false;
                            }
                        }
                        _ => match outercmp {
                            SubsetComparison::Subset1 => {
                                if compare_secondary(&new_path, old, true) {
                                    remove_old = true;
                                }
                            }
                            SubsetComparison::Subset2 => {
                                if compare_secondary(&new_path, old, false) {
                                    accept_new = false;
                                }
                            }
                            SubsetComparison::Equal => {
                                if new_path.parallel_safe && !old.parallel_safe {
                                    remove_old = true;
                                } else if !new_path.parallel_safe && old.parallel_safe {
                                    accept_new = false;
                                } else if new_path.rows < old.rows {
                                    remove_old = true;
                                } else if new_path.rows > old.rows {
                                    accept_new = false;
                                } else if compare_path_costs_fuzzily(root, &new_path, old, 1.000_000_000_1)
                                    == CostComparison::Better1
                                {
                                    remove_old = true;
                                } else {
                                    accept_new = false;
                                }
                            }
                            SubsetComparison::Different => {}
                        },
                    },
                    CostComparison::Better1 => {
                        if keyscmp != PathKeysComparison::Better2
                            && new_outer_ok
                            && compare_secondary(&new_path, old, true)
                        {
                            remove_old = true;
                        }
                    }
                    CostComparison::Better2 => {
                        if keyscmp != PathKeysComparison::Better1
                            && old_outer_ok
                            && compare_secondary(&new_path, old, false)
                        {
                            accept_new = false;
                        }
                    }
                    CostComparison::Different => {}
                }
            }
        }

        if !remove_old {
            if new_path.total_cost >= old.total_cost {
                insert_at = keep.len() + 1;
            }
            keep.push(old_id);
        }
        if !accept_new {
            keep.extend(iter.by_ref());
            break;
        }
    }

    let stored = if accept_new {
        trace!(
            rel = %root.rel(rel).relids,
            path = new_path.type_name(),
            startup = new_path.startup_cost,
            total = new_path.total_cost,
            rows = new_path.rows,
            "accepted path"
        );
        let id = root.alloc_path(new_path);
        keep.insert(insert_at.min(keep.len()), id);
        Some(id)
    } else {
        None
    };
    root.rel_mut(rel).pathlist = keep;
    stored
}

/// Cheap test of whether a path with these costs could survive [`add_path`],
/// so the caller can skip building it.
pub fn add_path_precheck(
    root: &PlannerInfo,
    rel: RelId,
    startup_cost: f64,
    total_cost: f64,
    pathkeys: &[PathKeyId],
    required_outer: &Relids,
) -> bool {
    let parent = root.rel(rel);
    let consider_startup = if required_outer.is_empty() {
        parent.consider_startup
    } else {
        parent.consider_param_startup
    };
    let new_keys: &[PathKeyId] = if required_outer.is_empty() { pathkeys } else { &[] };
    for old_id in &parent.pathlist {
        let old = root.path(*old_id);
        if total_cost <= old.total_cost * STD_FUZZ_FACTOR {
            // the list is sorted by total cost
            break;
        }
        if startup_cost > old.startup_cost * STD_FUZZ_FACTOR || !consider_startup {
            let keyscmp = compare_pathkeys(new_keys, effective_pathkeys(old));
            if matches!(keyscmp, PathKeysComparison::Equal | PathKeysComparison::Better2)
                && required_outer == &old.req_outer()
            {
                return false;
            }
        }
    }
    true
}

/// Picks the cheapest-startup and cheapest-total unparameterized paths, and
/// the cheapest path for each parameterization.
pub fn set_cheapest(root: &mut PlannerInfo, rel: RelId) -> Result<()> {
    let pathlist = root.rel(rel).pathlist.clone();
    let mut cheapest_startup: Option<PathId> = None;
    let mut cheapest_total: Option<PathId> = None;
    let mut best_per_outer: Vec<(Relids, PathId)> = Vec::new();

    for id in &pathlist {
        let path = root.path(*id);
        if path.is_parameterized() {
            let req = path.req_outer();
            match best_per_outer.iter_mut().find(|(r, _)| *r == req) {
                Some((_, best)) => {
                    if compare_path_costs(path, root.path(*best), CostSelector::Total).is_lt() {
                        *best = *id;
                    }
                }
                None => best_per_outer.push((req, *id)),
            }
            continue;
        }
        let (Some(cs), Some(ct)) = (cheapest_startup, cheapest_total) else {
            cheapest_startup = Some(*id);
            cheapest_total = Some(*id);
            continue;
        };
        let cmp = compare_path_costs(root.path(cs), path, CostSelector::Startup);
        if cmp.is_gt()
            || (cmp.is_eq() && compare_pathkeys(&path.pathkeys, &root.path(cs).pathkeys) == PathKeysComparison::Better1)
        {
            cheapest_startup = Some(*id);
        }
        let cmp = compare_path_costs(root.path(ct), path, CostSelector::Total);
        if cmp.is_gt()
            || (cmp.is_eq() && compare_pathkeys(&path.pathkeys, &root.path(ct).pathkeys) == PathKeysComparison::Better1)
        {
            cheapest_total = Some(*id);
        }
    }

    if cheapest_total.is_none() && best_per_outer.is_empty() {
        return Err(PlanError::InvalidInput(format!(
            "could not devise a query plan for relation {}",
            root.rel(rel).relids
        )));
    }

    let mut parameterized: Vec<PathId> = cheapest_total.into_iter().collect();
    parameterized.extend(best_per_outer.iter().map(|(_, id)| *id));
    let fallback = best_per_outer.first().map(|(_, id)| *id);

    let r = root.rel_mut(rel);
    r.cheapest_startup_path = cheapest_startup;
    r.cheapest_total_path = cheapest_total.or(fallback);
    r.cheapest_parameterized_paths = parameterized;
    Ok(())
}

// ---------------------------------------------------------------------------
// Scan paths
// ---------------------------------------------------------------------------

pub fn create_seqscan_path(root: &mut PlannerInfo, rel: RelId, required_outer: &Relids) -> Path {
    let mut path = Path::new(PathKind::SeqScan, rel);
    path.param_info = get_baserel_parampathinfo(root, rel, required_outer);
    cost_seqscan(root, &mut path);
    path
}

/// Index scan using `indexclauses` as index conditions. Join clauses among
/// them make the path parameterized by `required_outer`, and `loop_count` is
/// the expected number of repetitions as a nestloop inner.
pub fn create_index_path(
    root: &mut PlannerInfo,
    rel: RelId,
    index: IndexInfo,
    indexclauses: Vec<RinfoId>,
    pathkeys: Vec<PathKeyId>,
    required_outer: &Relids,
    loop_count: f64,
) -> Path {
    let mut path = Path::new(PathKind::IndexScan { index, indexclauses }, rel);
    path.param_info = get_baserel_parampathinfo(root, rel, required_outer);
    path.pathkeys = pathkeys;
    cost_index(root, &mut path, loop_count);
    path
}

pub fn create_subqueryscan_path(root: &mut PlannerInfo, rel: RelId, required_outer: &Relids) -> Path {
    let mut path = Path::new(PathKind::SubqueryScan, rel);
    path.param_info = get_baserel_parampathinfo(root, rel, required_outer);
    cost_subqueryscan(root, &mut path);
    path
}

pub fn create_append_path(root: &mut PlannerInfo, rel: RelId, subpaths: Vec<PathId>) -> Path {
    let parallel_safe = subpaths.iter().all(|id| root.path(*id).parallel_safe);
    let mut path = Path::new(PathKind::Append { subpaths }, rel);
    path.parallel_safe = parallel_safe;
    cost_append(root, &mut path);
    path
}

/// A path producing no rows.
pub fn create_dummy_path(rel: RelId) -> Path {
    Path::new(PathKind::Result, rel)
}

pub fn create_material_path(root: &PlannerInfo, rel: RelId, subpath: PathId) -> Path {
    let sub = root.path(subpath);
    let width = root.rel(sub.parent).reltarget.width;
    let (startup, total) = cost_material(root, sub.startup_cost, sub.total_cost, sub.rows, width);
    let mut path = Path::new(PathKind::Material { subpath }, rel);
    path.param_info = sub.param_info.clone();
    path.parallel_safe = sub.parallel_safe;
    path.rows = sub.rows;
    path.pathkeys = sub.pathkeys.clone();
    path.startup_cost = startup;
    path.total_cost = total;
    path
}

pub fn create_sort_path(root: &PlannerInfo, rel: RelId, subpath: PathId, pathkeys: Vec<PathKeyId>) -> Path {
    let sub = root.path(subpath);
    let width = root.rel(sub.parent).reltarget.width;
    let (startup, total) = cost_sort(root, sub.total_cost, sub.rows, width);
    let mut path = Path::new(PathKind::Sort { subpath }, rel);
    path.param_info = sub.param_info.clone();
    path.parallel_safe = sub.parallel_safe;
    path.rows = sub.rows;
    path.pathkeys = pathkeys;
    path.startup_cost = startup;
    path.total_cost = total;
    path
}

// ---------------------------------------------------------------------------
// Join paths
// ---------------------------------------------------------------------------

fn join_header(
    root: &mut PlannerInfo,
    joinrel: RelId,
    jointype: JoinType,
    sjinfo: &SpecialJoinInfo,
    inner_unique: bool,
    outer_path: PathId,
    inner_path: PathId,
    mut restrict_clauses: Vec<RinfoId>,
    required_outer: &Relids,
) -> (JoinPath, Option<crate::relation::ParamPathInfo>) {
    let param_info = get_joinrel_parampathinfo(
        root,
        joinrel,
        outer_path,
        inner_path,
        sjinfo,
        required_outer,
        &mut restrict_clauses,
    );
    let join = JoinPath {
        jointype,
        inner_unique,
        outerjoinpath: outer_path,
        innerjoinpath: inner_path,
        joinrestrictinfo: restrict_clauses,
    };
    (join, param_info)
}

fn parallel_safe_join(root: &PlannerInfo, outer_path: PathId, inner_path: PathId) -> bool {
    root.path(outer_path).parallel_safe && root.path(inner_path).parallel_safe
}

#[allow(clippy::too_many_arguments)]
pub fn create_nestloop_path(
    root: &mut PlannerInfo,
    joinrel: RelId,
    jointype: JoinType,
    workspace: &JoinCostWorkspace,
    extra: &JoinPathExtraInfo,
    outer_path: PathId,
    inner_path: PathId,
    restrict_clauses: Vec<RinfoId>,
    pathkeys: Vec<PathKeyId>,
    required_outer: &Relids,
) -> Path {
    // clauses the parameterized inner side already enforces need no recheck
    let inner = root.path(inner_path);
    let inner_req_outer = inner.req_outer();
    let outer_relids = root.rel(root.path(outer_path).parent).relids.clone();
    let restrict_clauses = if inner_req_outer.overlaps(&outer_relids) {
        let inner_relids = root.rel(inner.parent).relids.clone();
        let inner_and_outer = inner_relids.union(&inner_req_outer);
        restrict_clauses
            .into_iter()
            .filter(|id| !join_clause_is_movable_into(root.rinfo(*id), &inner_relids, &inner_and_outer))
            .collect()
    } else {
        restrict_clauses
    };

    let (join, param_info) = join_header(
        root,
        joinrel,
        jointype,
        &extra.sjinfo,
        extra.inner_unique,
        outer_path,
        inner_path,
        restrict_clauses,
        required_outer,
    );
    let mut path = Path::new(PathKind::NestLoop(join), joinrel);
    path.param_info = param_info;
    path.parallel_safe = parallel_safe_join(root, outer_path, inner_path);
    path.pathkeys = pathkeys;
    final_cost_nestloop(root, &mut path, workspace, extra);
    path
}

#[allow(clippy::too_many_arguments)]
pub fn create_mergejoin_path(
    root: &mut PlannerInfo,
    joinrel: RelId,
    jointype: JoinType,
    workspace: &JoinCostWorkspace,
    extra: &JoinPathExtraInfo,
    outer_path: PathId,
    inner_path: PathId,
    restrict_clauses: Vec<RinfoId>,
    pathkeys: Vec<PathKeyId>,
    required_outer: &Relids,
    mergeclauses: Vec<RinfoId>,
    outersortkeys: Vec<PathKeyId>,
    innersortkeys: Vec<PathKeyId>,
) -> Path {
    let (join, param_info) = join_header(
        root,
        joinrel,
        jointype,
        &extra.sjinfo,
        extra.inner_unique,
        outer_path,
        inner_path,
        restrict_clauses,
        required_outer,
    );
    // with at most one match per outer row the inner never has to back up
    let skip_mark_restore = (matches!(jointype, JoinType::Semi | JoinType::Anti) || extra.inner_unique)
        && join.joinrestrictinfo.len() == mergeclauses.len();
    let mut path = Path::new(
        PathKind::MergeJoin {
            join,
            mergeclauses,
            outersortkeys,
            innersortkeys,
            skip_mark_restore,
            materialize_inner: false,
        },
        joinrel,
    );
    path.param_info = param_info;
    path.parallel_safe = parallel_safe_join(root, outer_path, inner_path);
    path.pathkeys = pathkeys;
    final_cost_mergejoin(root, &mut path, workspace, extra);
    path
}

#[allow(clippy::too_many_arguments)]
pub fn create_hashjoin_path(
    root: &mut PlannerInfo,
    joinrel: RelId,
    jointype: JoinType,
    workspace: &JoinCostWorkspace,
    extra: &JoinPathExtraInfo,
    outer_path: PathId,
    inner_path: PathId,
    restrict_clauses: Vec<RinfoId>,
    required_outer: &Relids,
    hashclauses: Vec<RinfoId>,
) -> Path {
    let (join, param_info) = join_header(
        root,
        joinrel,
        jointype,
        &extra.sjinfo,
        extra.inner_unique,
        outer_path,
        inner_path,
        restrict_clauses,
        required_outer,
    );
    let mut path = Path::new(
        PathKind::HashJoin {
            join,
            hashclauses,
            num_batches: 1.0,
            inner_rows_total: 0.0,
        },
        joinrel,
    );
    path.param_info = param_info;
    path.parallel_safe = parallel_safe_join(root, outer_path, inner_path);
    final_cost_hashjoin(root, &mut path, workspace, extra);
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::config::PlannerConfig;
    use crate::query::Query;
    use crate::relation::{RelOptInfo, RelOptKind};
    use crate::relids;
    use std::sync::Arc;

    fn root_with_rel() -> (PlannerInfo, RelId) {
        let mut root = PlannerInfo::new(Query::new(), Arc::new(InMemoryCatalog::new()), PlannerConfig::default());
        let rel = root.add_rel(RelOptInfo::new(RelOptKind::Base, relids![1]));
        (root, rel)
    }

    fn costed(rel: RelId, startup: f64, total: f64) -> Path {
        let mut p = Path::new(PathKind::SeqScan, rel);
        p.startup_cost = startup;
        p.total_cost = total;
        p.rows = 100.0;
        p
    }

    #[test]
    fn test_cheaper_path_replaces_dominated_one() {
        let (mut root, rel) = root_with_rel();
        let first = add_path(&mut root, rel, costed(rel, 0.0, 100.0)).unwrap();
        let second = add_path(&mut root, rel, costed(rel, 0.0, 50.0)).unwrap();
        assert_eq!(root.rel(rel).pathlist, vec![second]);
        assert_ne!(first, second);
    }

    #[test]
    fn test_fuzzy_tie_keeps_old_path() {
        let (mut root, rel) = root_with_rel();
        let first = add_path(&mut root, rel, costed(rel, 0.0, 100.0)).unwrap();
        assert!(add_path(&mut root, rel, costed(rel, 0.0, 100.5)).is_none());
        assert!(add_path(&mut root, rel, costed(rel, 0.0, 100.0)).is_none());
        assert_eq!(root.rel(rel).pathlist, vec![first]);
    }

    #[test]
    fn test_startup_cost_kept_only_when_considered() {
        let (mut root, rel) = root_with_rel();
        add_path(&mut root, rel, costed(rel, 50.0, 100.0)).unwrap();
        assert!(add_path(&mut root, rel, costed(rel, 0.0, 200.0)).is_none());

        root.rel_mut(rel).consider_startup = true;
        assert!(add_path(&mut root, rel, costed(rel, 0.0, 200.0)).is_some());
        assert_eq!(root.rel(rel).pathlist.len(), 2);
        // sorted by total cost
        let totals: Vec<f64> = root.rel(rel).pathlist.iter().map(|id| root.path(*id).total_cost).collect();
        assert_eq!(totals, vec![100.0, 200.0]);
    }

    #[test]
    fn test_precheck_rejects_dominated_costs() {
        let (mut root, rel) = root_with_rel();
        add_path(&mut root, rel, costed(rel, 0.0, 100.0)).unwrap();
        assert!(!add_path_precheck(&root, rel, 0.0, 500.0, &[], &Relids::new()));
        assert!(add_path_precheck(&root, rel, 0.0, 50.0, &[], &Relids::new()));
        // a different parameterization is never dominated by the precheck
        assert!(add_path_precheck(&root, rel, 0.0, 500.0, &[], &relids![2]));
    }

    #[test]
    fn test_set_cheapest_picks_cheapest_total_and_startup() {
        let (mut root, rel) = root_with_rel();
        root.rel_mut(rel).consider_startup = true;
        let slow_start = add_path(&mut root, rel, costed(rel, 40.0, 100.0)).unwrap();
        let fast_start = add_path(&mut root, rel, costed(rel, 0.0, 300.0)).unwrap();
        set_cheapest(&mut root, rel).unwrap();
        assert_eq!(root.rel(rel).cheapest_total_path, Some(slow_start));
        assert_eq!(root.rel(rel).cheapest_startup_path, Some(fast_start));
    }

    #[test]
    fn test_set_cheapest_without_paths_is_an_error() {
        let (mut root, rel) = root_with_rel();
        assert!(matches!(set_cheapest(&mut root, rel), Err(PlanError::InvalidInput(_))));
    }
}
