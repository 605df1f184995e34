//! # Join Paths
//!
//! [`add_paths_to_joinrel`] generates every join path for one ordered pair of
//! input rels and offers each to [`add_path`]. Methods are tried in a fixed
//! order, so that of two equally cheap paths the earlier one is kept:
//!
//! 1. for each outer path: nested loops over every cheapest inner path
//!    (including parameterized inner scans, and a materialized copy of the
//!    cheapest inner path), then a merge join reusing the outer ordering;
//! 2. merge joins with both inputs explicitly sorted on the merge clauses;
//! 3. hash joins.
//!
//! Each candidate is first given a lower-bound cost by the matching
//! `initial_cost_*` function. Candidates that [`add_path_precheck`] says cannot
//! survive are dropped before the path is built.
//!
//! ## Outer Joins
//!
//! A FULL join cannot run as a nested loop, and a merge or hash FULL join needs
//! every join clause to be usable by the method. A RIGHT join is the LEFT join
//! of the same rels with the inputs swapped; only merge and hash joins can
//! execute it.

use crate::cost::{
    compute_semi_anti_join_factors, initial_cost_hashjoin, initial_cost_mergejoin, initial_cost_nestloop,
    SemiAntiJoinFactors,
};
use crate::path::{JoinCostWorkspace, PathKind};
use crate::pathkeys::{
    find_mergeclauses_for_outer_pathkeys, make_inner_pathkeys_for_merge, pathkeys_contained_in,
    select_outer_pathkeys_for_merge, truncate_useless_pathkeys,
};
use crate::pathnode::{
    add_path, add_path_precheck, create_hashjoin_path, create_material_path, create_mergejoin_path,
    create_nestloop_path,
};
use crate::planner_info::{PathId, PathKeyId, PlannerInfo, RelId, RinfoId};
use crate::query::JoinType;
use crate::relation::SpecialJoinInfo;
use crate::relids::Relids;
use crate::restrictinfo::{clause_sides_match_join, rinfo_is_pushed_down};
use crate::uniqueness::innerrel_is_unique;
use tracing::trace;

/// Everything the path generators for one join need besides the two inputs.
#[derive(Debug, Clone)]
pub struct JoinPathExtraInfo {
    pub restrictlist: Vec<RinfoId>,
    /// Join clauses usable as merge clauses.
    pub mergeclause_list: Vec<RinfoId>,
    /// Each outer row matches at most one inner row.
    pub inner_unique: bool,
    pub sjinfo: SpecialJoinInfo,
    pub semifactors: SemiAntiJoinFactors,
    /// Rels that may legitimately parameterize a path for this join.
    pub param_source_rels: Relids,
}

/// Generates nested-loop, merge and hash join paths for joining `outerrel`
/// to `innerrel` into `joinrel`.
pub fn add_paths_to_joinrel(
    root: &mut PlannerInfo,
    joinrel: RelId,
    outerrel: RelId,
    innerrel: RelId,
    jointype: JoinType,
    sjinfo: &SpecialJoinInfo,
    restrictlist: &[RinfoId],
) {
    let joinrelids = root.rel(joinrel).relids.clone();
    let outer_relids = root.rel(outerrel).relids.clone();

    let inner_unique = match jointype {
        // the executor stops at the first match anyway
        JoinType::Semi | JoinType::Anti => false,
        _ => innerrel_is_unique(
            root,
            &joinrelids,
            &outer_relids,
            innerrel,
            jointype,
            restrictlist,
            false,
        ),
    };

    let (mergeclause_list, mergejoin_allowed) = if root.config.enable_mergejoin || jointype == JoinType::Full {
        select_mergejoin_clauses(root, joinrel, outerrel, innerrel, restrictlist, jointype)
    } else {
        (Vec::new(), true)
    };

    let semifactors = if matches!(jointype, JoinType::Semi | JoinType::Anti) || inner_unique {
        let inner_rows = root.rel(innerrel).rows;
        compute_semi_anti_join_factors(root, &joinrelids, inner_rows, jointype, restrictlist)
    } else {
        SemiAntiJoinFactors::default()
    };

    let mut param_source_rels = Relids::new();
    for other in &root.join_info_list {
        if joinrelids.overlaps(&other.min_righthand) && !joinrelids.overlaps(&other.min_lefthand) {
            param_source_rels.union_with(&root.all_baserels.difference(&other.min_righthand));
        }
        if other.jointype == JoinType::Full
            && joinrelids.overlaps(&other.min_lefthand)
            && !joinrelids.overlaps(&other.min_righthand)
        {
            param_source_rels.union_with(&root.all_baserels.difference(&other.min_lefthand));
        }
    }
    param_source_rels.union_with(&root.rel(joinrel).lateral_relids);

    let extra = JoinPathExtraInfo {
        restrictlist: restrictlist.to_vec(),
        mergeclause_list,
        inner_unique,
        sjinfo: sjinfo.clone(),
        semifactors,
        param_source_rels,
    };

    trace!(
        joinrel = %joinrelids,
        outer = %outer_relids,
        inner = %root.rel(innerrel).relids,
        ?jointype,
        inner_unique,
        "generating join paths"
    );

    // only RIGHT and FULL joins can be refused, and neither can use a nested loop
    if mergejoin_allowed {
        match_unsorted_outer(root, joinrel, outerrel, innerrel, jointype, &extra);
        sort_inner_and_outer(root, joinrel, outerrel, innerrel, jointype, &extra);
    }

    if root.config.enable_hashjoin || jointype == JoinType::Full {
        hash_inner_and_outer(root, joinrel, outerrel, innerrel, jointype, &extra);
    }
}

/// Is `path` parameterized by any member of `rel`?
fn path_param_by_rel(root: &PlannerInfo, path: PathId, rel: RelId) -> bool {
    root.path(path).req_outer().overlaps(&root.rel(rel).relids)
}

fn path_relids(root: &PlannerInfo, path: PathId) -> Relids {
    root.rel(root.path(path).parent).relids.clone()
}

/// Pathkeys of a join whose outer input has `outer_pathkeys`. Outer joins that
/// null the outer side destroy the ordering.
fn build_join_pathkeys(
    root: &PlannerInfo,
    joinrel: RelId,
    jointype: JoinType,
    outer_pathkeys: &[PathKeyId],
) -> Vec<PathKeyId> {
    if matches!(jointype, JoinType::Full | JoinType::Right) {
        return Vec::new();
    }
    truncate_useless_pathkeys(root, joinrel, outer_pathkeys.to_vec())
}

/// An inner path parameterized by the outer rel and by rels outside this join
/// is acceptable only when the join is the only way to reach those rels.
fn allow_star_schema_join(outerrelids: &Relids, inner_paramrels: &Relids) -> bool {
    inner_paramrels.overlaps(outerrelids) && !inner_paramrels.is_subset(outerrelids)
}

fn try_nestloop_path(
    root: &mut PlannerInfo,
    joinrel: RelId,
    outer_path: PathId,
    inner_path: PathId,
    pathkeys: Vec<PathKeyId>,
    jointype: JoinType,
    extra: &JoinPathExtraInfo,
) {
    let outerrelids = path_relids(root, outer_path);
    let outer_paramrels = root.path(outer_path).req_outer();
    let inner_paramrels = root.path(inner_path).req_outer();

    let required_outer = outer_paramrels.union(&inner_paramrels).difference(&outerrelids);
    if !required_outer.is_empty()
        && !required_outer.overlaps(&extra.param_source_rels)
        && !allow_star_schema_join(&outerrelids, &inner_paramrels)
    {
        return;
    }

    let mut workspace = JoinCostWorkspace::default();
    initial_cost_nestloop(root, &mut workspace, jointype, outer_path, inner_path, extra);
    if !add_path_precheck(
        root,
        joinrel,
        workspace.startup_cost,
        workspace.total_cost,
        &pathkeys,
        &required_outer,
    ) {
        return;
    }
    let path = create_nestloop_path(
        root,
        joinrel,
        jointype,
        &workspace,
        extra,
        outer_path,
        inner_path,
        extra.restrictlist.clone(),
        pathkeys,
        &required_outer,
    );
    add_path(root, joinrel, path);
}

#[allow(clippy::too_many_arguments)]
fn try_mergejoin_path(
    root: &mut PlannerInfo,
    joinrel: RelId,
    outer_path: PathId,
    inner_path: PathId,
    pathkeys: Vec<PathKeyId>,
    mergeclauses: Vec<RinfoId>,
    mut outersortkeys: Vec<PathKeyId>,
    mut innersortkeys: Vec<PathKeyId>,
    jointype: JoinType,
    extra: &JoinPathExtraInfo,
) {
    let required_outer = root.path(outer_path).req_outer().union(&root.path(inner_path).req_outer());
    if !required_outer.is_empty() && !required_outer.overlaps(&extra.param_source_rels) {
        return;
    }

    // inputs already in the right order need no explicit sort
    if !outersortkeys.is_empty() && pathkeys_contained_in(&outersortkeys, &root.path(outer_path).pathkeys) {
        outersortkeys.clear();
    }
    if !innersortkeys.is_empty() && pathkeys_contained_in(&innersortkeys, &root.path(inner_path).pathkeys) {
        innersortkeys.clear();
    }

    let mut workspace = JoinCostWorkspace::default();
    initial_cost_mergejoin(
        root,
        &mut workspace,
        outer_path,
        inner_path,
        !outersortkeys.is_empty(),
        !innersortkeys.is_empty(),
    );
    if !add_path_precheck(
        root,
        joinrel,
        workspace.startup_cost,
        workspace.total_cost,
        &pathkeys,
        &required_outer,
    ) {
        return;
    }
    let path = create_mergejoin_path(
        root,
        joinrel,
        jointype,
        &workspace,
        extra,
        outer_path,
        inner_path,
        extra.restrictlist.clone(),
        pathkeys,
        &required_outer,
        mergeclauses,
        outersortkeys,
        innersortkeys,
    );
    add_path(root, joinrel, path);
}

fn try_hashjoin_path(
    root: &mut PlannerInfo,
    joinrel: RelId,
    outer_path: PathId,
    inner_path: PathId,
    hashclauses: &[RinfoId],
    jointype: JoinType,
    extra: &JoinPathExtraInfo,
) {
    let required_outer = root.path(outer_path).req_outer().union(&root.path(inner_path).req_outer());
    if !required_outer.is_empty() && !required_outer.overlaps(&extra.param_source_rels) {
        return;
    }

    let mut workspace = JoinCostWorkspace::default();
    initial_cost_hashjoin(root, &mut workspace, hashclauses, outer_path, inner_path);
    if !add_path_precheck(root, joinrel, workspace.startup_cost, workspace.total_cost, &[], &required_outer) {
        return;
    }
    let path = create_hashjoin_path(
        root,
        joinrel,
        jointype,
        &workspace,
        extra,
        outer_path,
        inner_path,
        extra.restrictlist.clone(),
        &required_outer,
        hashclauses.to_vec(),
    );
    add_path(root, joinrel, path);
}

/// Merge joins with both inputs explicitly sorted. Only the cheapest total
/// paths are considered, since the sort hides any other ordering.
fn sort_inner_and_outer(
    root: &mut PlannerInfo,
    joinrel: RelId,
    outerrel: RelId,
    innerrel: RelId,
    jointype: JoinType,
    extra: &JoinPathExtraInfo,
) {
    if extra.mergeclause_list.is_empty() {
        return;
    }
    let (Some(outer_path), Some(inner_path)) =
        (root.rel(outerrel).cheapest_total_path, root.rel(innerrel).cheapest_total_path)
    else {
        return;
    };
    if path_param_by_rel(root, outer_path, innerrel) || path_param_by_rel(root, inner_path, outerrel) {
        return;
    }

    let outerkeys = select_outer_pathkeys_for_merge(root, &extra.mergeclause_list);
    let cur_mergeclauses = find_mergeclauses_for_outer_pathkeys(root, &outerkeys, &extra.mergeclause_list);
    if cur_mergeclauses.len() != extra.mergeclause_list.len() && jointype == JoinType::Full {
        return;
    }
    let innerkeys = make_inner_pathkeys_for_merge(root, &cur_mergeclauses, &outerkeys);
    let merge_pathkeys = build_join_pathkeys(root, joinrel, jointype, &outerkeys);

    try_mergejoin_path(
        root,
        joinrel,
        outer_path,
        inner_path,
        merge_pathkeys,
        cur_mergeclauses,
        outerkeys,
        innerkeys,
        jointype,
        extra,
    );
}

/// Cheapest unparameterized inner path already sorted on `innersortkeys`.
fn cheapest_sorted_inner(root: &PlannerInfo, innerrel: RelId, innersortkeys: &[PathKeyId]) -> Option<PathId> {
    root.rel(innerrel)
        .pathlist
        .iter()
        .copied()
        .filter(|id| {
            let p = root.path(*id);
            !p.is_parameterized() && pathkeys_contained_in(innersortkeys, &p.pathkeys)
        })
        .min_by(|a, b| root.path(*a).total_cost.total_cmp(&root.path(*b).total_cost))
}

/// Nested loops and presorted merge joins driven by each outer path.
fn match_unsorted_outer(
    root: &mut PlannerInfo,
    joinrel: RelId,
    outerrel: RelId,
    innerrel: RelId,
    jointype: JoinType,
    extra: &JoinPathExtraInfo,
) {
    let nestjoin_ok = !matches!(jointype, JoinType::Full | JoinType::Right);
    let useallclauses = jointype == JoinType::Full;

    let mut inner_cheapest_total = root.rel(innerrel).cheapest_total_path;
    if let Some(inner) = inner_cheapest_total {
        if path_param_by_rel(root, inner, outerrel) {
            inner_cheapest_total = None;
        }
    }

    let matpath = match inner_cheapest_total {
        Some(inner)
            if nestjoin_ok
                && root.config.enable_material
                && !matches!(root.path(inner).kind, PathKind::Material { .. } | PathKind::Sort { .. }) =>
        {
            let path = create_material_path(root, innerrel, inner);
            Some(root.alloc_path(path))
        }
        _ => None,
    };

    let outer_paths = root.rel(outerrel).pathlist.clone();
    let inner_candidates = root.rel(innerrel).cheapest_parameterized_paths.clone();
    for outer_path in outer_paths {
        if path_param_by_rel(root, outer_path, innerrel) {
            continue;
        }
        let outer_pathkeys = root.path(outer_path).pathkeys.clone();
        let merge_pathkeys = build_join_pathkeys(root, joinrel, jointype, &outer_pathkeys);

        if nestjoin_ok {
            for inner_path in &inner_candidates {
                try_nestloop_path(
                    root,
                    joinrel,
                    outer_path,
                    *inner_path,
                    merge_pathkeys.clone(),
                    jointype,
                    extra,
                );
            }
            if let Some(mat) = matpath {
                try_nestloop_path(root, joinrel, outer_path, mat, merge_pathkeys.clone(), jointype, extra);
            }
        }

        let Some(inner_total) = inner_cheapest_total else {
            continue;
        };
        if outer_pathkeys.is_empty() || extra.mergeclause_list.is_empty() {
            continue;
        }
        let mergeclauses = find_mergeclauses_for_outer_pathkeys(root, &outer_pathkeys, &extra.mergeclause_list);
        if mergeclauses.is_empty() || (useallclauses && mergeclauses.len() != extra.mergeclause_list.len()) {
            continue;
        }
        let innersortkeys = make_inner_pathkeys_for_merge(root, &mergeclauses, &outer_pathkeys);

        try_mergejoin_path(
            root,
            joinrel,
            outer_path,
            inner_total,
            merge_pathkeys.clone(),
            mergeclauses.clone(),
            Vec::new(),
            innersortkeys.clone(),
            jointype,
            extra,
        );
        if let Some(sorted_inner) = cheapest_sorted_inner(root, innerrel, &innersortkeys) {
            if sorted_inner != inner_total {
                try_mergejoin_path(
                    root,
                    joinrel,
                    outer_path,
                    sorted_inner,
                    merge_pathkeys,
                    mergeclauses,
                    Vec::new(),
                    Vec::new(),
                    jointype,
                    extra,
                );
            }
        }
    }
}

/// Hash joins over every combination of the inputs' cheapest paths.
fn hash_inner_and_outer(
    root: &mut PlannerInfo,
    joinrel: RelId,
    outerrel: RelId,
    innerrel: RelId,
    jointype: JoinType,
    extra: &JoinPathExtraInfo,
) {
    let joinrelids = root.rel(joinrel).relids.clone();
    let outer_relids = root.rel(outerrel).relids.clone();
    let inner_relids = root.rel(innerrel).relids.clone();
    let is_outer = jointype.is_outer() || jointype == JoinType::Semi;

    let mut hashclauses = Vec::new();
    let mut have_unhashable = false;
    for id in &extra.restrictlist {
        let rinfo = root.rinfo(*id);
        if is_outer && rinfo_is_pushed_down(rinfo, &joinrelids) {
            continue;
        }
        if !rinfo.can_join
            || rinfo.hashjoinoperator.is_none()
            || !clause_sides_match_join(rinfo, &outer_relids, &inner_relids)
        {
            have_unhashable = true;
            continue;
        }
        hashclauses.push(*id);
    }
    if hashclauses.is_empty() || (jointype == JoinType::Full && have_unhashable) {
        return;
    }

    let (Some(outer_total), Some(inner_total)) =
        (root.rel(outerrel).cheapest_total_path, root.rel(innerrel).cheapest_total_path)
    else {
        return;
    };
    if !path_param_by_rel(root, outer_total, innerrel) && !path_param_by_rel(root, inner_total, outerrel) {
        try_hashjoin_path(root, joinrel, outer_total, inner_total, &hashclauses, jointype, extra);
    }
    if jointype == JoinType::Full {
        return;
    }

    if let Some(outer_startup) = root.rel(outerrel).cheapest_startup_path {
        if outer_startup != outer_total
            && !path_param_by_rel(root, outer_startup, innerrel)
            && !path_param_by_rel(root, inner_total, outerrel)
        {
            try_hashjoin_path(root, joinrel, outer_startup, inner_total, &hashclauses, jointype, extra);
        }
    }

    let outer_paths = root.rel(outerrel).cheapest_parameterized_paths.clone();
    let inner_paths = root.rel(innerrel).cheapest_parameterized_paths.clone();
    for outer_path in &outer_paths {
        if path_param_by_rel(root, *outer_path, innerrel) {
            continue;
        }
        for inner_path in &inner_paths {
            if path_param_by_rel(root, *inner_path, outerrel) {
                continue;
            }
            if *outer_path == outer_total && *inner_path == inner_total {
                continue;
            }
            try_hashjoin_path(root, joinrel, *outer_path, *inner_path, &hashclauses, jointype, extra);
        }
    }
}

/// Join clauses usable as merge clauses for this pair of inputs, oriented for
/// this join. The flag says whether a merge join is possible at all: RIGHT and
/// FULL merge joins need every join clause to be mergejoinable.
fn select_mergejoin_clauses(
    root: &PlannerInfo,
    joinrel: RelId,
    outerrel: RelId,
    innerrel: RelId,
    restrictlist: &[RinfoId],
    jointype: JoinType,
) -> (Vec<RinfoId>, bool) {
    let joinrelids = &root.rel(joinrel).relids;
    let outer_relids = &root.rel(outerrel).relids;
    let inner_relids = &root.rel(innerrel).relids;
    let is_outer = jointype.is_outer();

    let mut result = Vec::new();
    let mut have_nonmergeable = false;
    for id in restrictlist {
        let rinfo = root.rinfo(*id);
        if is_outer && rinfo_is_pushed_down(rinfo, joinrelids) {
            continue;
        }
        if !rinfo.can_join || rinfo.mergeopfamilies.is_empty() {
            have_nonmergeable = true;
            continue;
        }
        if !clause_sides_match_join(rinfo, outer_relids, inner_relids) {
            have_nonmergeable = true;
            continue;
        }
        let (Some(left_ec), Some(right_ec)) = (rinfo.left_ec, rinfo.right_ec) else {
            have_nonmergeable = true;
            continue;
        };
        // a class pinned to a constant sorts nothing
        if root.ec(left_ec).ec_has_const || root.ec(right_ec).ec_has_const {
            have_nonmergeable = true;
            continue;
        }
        result.push(*id);
    }

    let allowed = match jointype {
        JoinType::Right | JoinType::Full => !have_nonmergeable,
        _ => true,
    };
    (result, allowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalog, RelationInfo};
    use crate::config::PlannerConfig;
    use crate::cost::set_baserel_size_estimates;
    use crate::equivalence::generate_base_implied_equalities;
    use crate::expr::{oids, Expr};
    use crate::initsplan::{add_base_rels_to_query, build_base_rel_tlists, deconstruct_jointree};
    use crate::pathnode::{create_seqscan_path, set_cheapest};
    use crate::query::{JoinTreeNode, Query};
    use crate::relnode::build_join_rel;
    use std::sync::Arc;

    /// Two rels joined on their first columns, with plain scans built.
    fn setup(config: PlannerConfig) -> (PlannerInfo, RelId, RelId) {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(100, RelationInfo::new(10_000.0, 2));
        catalog.add_relation(200, RelationInfo::new(20_000.0, 2));
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 200);
        q.jointree = JoinTreeNode::From {
            items: vec![JoinTreeNode::Rel(a), JoinTreeNode::Rel(b)],
            quals: vec![Expr::op(oids::INT4EQ, Expr::int4_var(a, 1), Expr::int4_var(b, 1))],
        };
        q.add_target("x", Expr::int4_var(a, 2));
        let mut root = PlannerInfo::new(q, Arc::new(catalog), config);
        add_base_rels_to_query(&mut root).unwrap();
        build_base_rel_tlists(&mut root);
        deconstruct_jointree(&mut root).unwrap();
        generate_base_implied_equalities(&mut root).unwrap();
        let ra = root.base_rel_id(a).unwrap();
        let rb = root.base_rel_id(b).unwrap();
        for rel in [ra, rb] {
            set_baserel_size_estimates(&mut root, rel);
            let path = create_seqscan_path(&mut root, rel, &Relids::new());
            add_path(&mut root, rel, path);
            set_cheapest(&mut root, rel).unwrap();
        }
        (root, ra, rb)
    }

    fn join(root: &mut PlannerInfo, ra: RelId, rb: RelId) -> RelId {
        let outer = root.rel(ra).relids.clone();
        let inner = root.rel(rb).relids.clone();
        let joinrelids = outer.union(&inner);
        let sjinfo = SpecialJoinInfo::dummy(&outer, &inner);
        let (joinrel, restrictlist) = build_join_rel(root, &joinrelids, ra, rb, &sjinfo);
        add_paths_to_joinrel(root, joinrel, ra, rb, JoinType::Inner, &sjinfo, &restrictlist);
        add_paths_to_joinrel(root, joinrel, rb, ra, JoinType::Inner, &sjinfo, &restrictlist);
        set_cheapest(root, joinrel).unwrap();
        joinrel
    }

    #[test]
    fn test_hash_join_wins_for_large_unindexed_inputs() {
        let (mut root, ra, rb) = setup(PlannerConfig::default());
        let joinrel = join(&mut root, ra, rb);
        let cheapest = root.cheapest_total(joinrel).unwrap();
        assert_eq!(root.path(cheapest).type_name(), "HashJoin");
    }

    #[test]
    fn test_disabled_hashjoin_falls_back_to_other_methods() {
        let config = PlannerConfig {
            enable_hashjoin: false,
            ..PlannerConfig::default()
        };
        let (mut root, ra, rb) = setup(config);
        let joinrel = join(&mut root, ra, rb);
        for id in &root.rel(joinrel).pathlist {
            assert_ne!(root.path(*id).type_name(), "HashJoin");
        }
        assert!(!root.rel(joinrel).pathlist.is_empty());
    }

    #[test]
    fn test_paths_are_never_parameterized_by_own_inputs() {
        let (mut root, ra, rb) = setup(PlannerConfig::default());
        let joinrel = join(&mut root, ra, rb);
        for id in &root.rel(joinrel).pathlist {
            assert!(root.path(*id).req_outer().is_empty());
        }
    }
}
