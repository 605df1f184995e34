//! Join rel construction and the parameterization records of base and join
//! rels.
//!
//! A join rel is created the first time the search proposes some pair of
//! inputs that produces its relid set, and cached in `join_rel_hash`. Later
//! pairs for the same set only need their own restriction list, which
//! depends on how the set was split.

use tracing::trace;

use crate::cost::{get_parameterized_baserel_size, get_parameterized_joinrel_size, set_joinrel_size_estimates};
use crate::equivalence::{eclass_indexes_for, generate_join_implied_equalities, has_relevant_eclass_joinclause};
use crate::expr::Expr;
use crate::placeholder::add_placeholders_to_joinrel;
use crate::planner_info::{PathId, PlannerInfo, RelId, RinfoId};
use crate::relation::{ParamPathInfo, RelOptInfo, RelOptKind, SpecialJoinInfo};
use crate::relids::Relids;
use crate::restrictinfo::join_clause_is_movable_into;

/// Finds or creates the join rel for `joinrelids` built from `outer_rel` and
/// `inner_rel`, returning it together with the clauses to check at this
/// particular join of the two inputs.
pub fn build_join_rel(
    root: &mut PlannerInfo,
    joinrelids: &Relids,
    outer_rel: RelId,
    inner_rel: RelId,
    sjinfo: &SpecialJoinInfo,
) -> (RelId, Vec<RinfoId>) {
    if let Some(existing) = root.find_join_rel(joinrelids) {
        let restrictlist = build_joinrel_restrictlist(root, existing, outer_rel, inner_rel);
        return (existing, restrictlist);
    }

    let mut joinrel = RelOptInfo::new(RelOptKind::Join, joinrelids.clone());
    let outer = root.rel(outer_rel);
    let inner = root.rel(inner_rel);
    joinrel.direct_lateral_relids = outer
        .direct_lateral_relids
        .union(&inner.direct_lateral_relids)
        .difference(joinrelids);
    joinrel.lateral_relids = min_join_parameterization(joinrelids, outer, inner);
    joinrel.consider_startup = outer.consider_startup || inner.consider_startup;
    joinrel.consider_param_startup = outer.consider_param_startup || inner.consider_param_startup;
    let id = root.add_rel(joinrel);

    build_joinrel_tlist(root, id, outer_rel);
    build_joinrel_tlist(root, id, inner_rel);
    let outer_relids = root.rel(outer_rel).relids.clone();
    let inner_relids = root.rel(inner_rel).relids.clone();
    add_placeholders_to_joinrel(root, id, &outer_relids, &inner_relids);

    let restrictlist = build_joinrel_restrictlist(root, id, outer_rel, inner_rel);
    build_joinrel_joinlist(root, id, outer_rel, inner_rel);

    let eclass_indexes = eclass_indexes_for(root, joinrelids);
    root.rel_mut(id).eclass_indexes = eclass_indexes;
    let has_eclass_joins = has_relevant_eclass_joinclause(root, id);
    root.rel_mut(id).has_eclass_joins = has_eclass_joins;

    set_joinrel_size_estimates(root, id, outer_rel, inner_rel, sjinfo, &restrictlist);

    root.join_rel_list.push(id);
    root.join_rel_hash.insert(joinrelids.clone(), id);
    trace!(
        joinrel = %joinrelids,
        rows = root.rel(id).rows,
        width = root.rel(id).reltarget.width,
        "built join rel"
    );
    (id, restrictlist)
}

/// Lateral references of a join: whatever its inputs reference that it does
/// not itself contain.
pub fn min_join_parameterization(joinrelids: &Relids, outer: &RelOptInfo, inner: &RelOptInfo) -> Relids {
    outer.lateral_relids.union(&inner.lateral_relids).difference(joinrelids)
}

/// Copies the input's output columns that are still needed above the join,
/// marking them as nullable by the outer joins the join contains.
fn build_joinrel_tlist(root: &mut PlannerInfo, joinrel: RelId, input: RelId) {
    let joinrelids = root.rel(joinrel).relids.clone();
    let oj_in_join = root.outer_join_rels.intersect(&joinrelids);
    let mut exprs = Vec::new();
    let mut width = 0;
    for expr in &root.rel(input).reltarget.exprs {
        let Expr::Var(var) = expr else {
            // placeholders are added by add_placeholders_to_joinrel
            continue;
        };
        let Some(base) = root.base_rel_id(var.varno) else {
            continue;
        };
        let baserel = root.rel(base);
        let Some(slot) = baserel.attr_slot(var.varattno) else {
            continue;
        };
        if baserel.attr_needed[slot].is_subset(&joinrelids) {
            continue;
        }
        let mut var = var.clone();
        var.varnullingrels = baserel.nulling_relids.intersect(&oj_in_join);
        width += baserel.attr_width(var.varattno);
        exprs.push(Expr::Var(var));
    }
    let rel = root.rel_mut(joinrel);
    for expr in exprs {
        if !rel.reltarget.exprs.contains(&expr) {
            rel.reltarget.exprs.push(expr);
        }
    }
    rel.reltarget.width += width;
}

/// Clauses that become checkable at this join, from the inputs' join clause
/// lists plus the equalities implied by equivalence classes.
///
/// A clone of an outer-join clause is accepted only in the form matching how
/// the join is being built: its required rels must all come from the two
/// inputs and none of its incompatible rels may.
pub fn build_joinrel_restrictlist(
    root: &mut PlannerInfo,
    joinrel: RelId,
    outer_rel: RelId,
    inner_rel: RelId,
) -> Vec<RinfoId> {
    let joinrelids = root.rel(joinrel).relids.clone();
    let outer_relids = root.rel(outer_rel).relids.clone();
    let inner_relids = root.rel(inner_rel).relids.clone();
    let both_input_relids = outer_relids.union(&inner_relids);

    let mut result: Vec<RinfoId> = Vec::new();
    for input in [outer_rel, inner_rel] {
        for id in &root.rel(input).joininfo {
            let rinfo = root.rinfo(*id);
            if !rinfo.required_relids.is_subset(&joinrelids) {
                continue;
            }
            if rinfo.has_clone || rinfo.is_clone {
                if !rinfo.required_relids.is_subset(&both_input_relids) {
                    continue;
                }
                if rinfo.incompatible_relids.overlaps(&both_input_relids) {
                    continue;
                }
            }
            if !result.contains(id) {
                result.push(*id);
            }
        }
    }
    for id in generate_join_implied_equalities(root, &joinrelids, &outer_relids, &inner_relids) {
        if !result.contains(&id) {
            result.push(id);
        }
    }
    result
}

/// Join clauses of the inputs that still refer outside the join.
fn build_joinrel_joinlist(root: &mut PlannerInfo, joinrel: RelId, outer_rel: RelId, inner_rel: RelId) {
    let joinrelids = root.rel(joinrel).relids.clone();
    let mut joininfo: Vec<RinfoId> = Vec::new();
    for input in [outer_rel, inner_rel] {
        for id in &root.rel(input).joininfo {
            if root.rinfo(*id).required_relids.is_subset(&joinrelids) {
                continue;
            }
            if !joininfo.contains(id) {
                joininfo.push(*id);
            }
        }
    }
    root.rel_mut(joinrel).joininfo = joininfo;
}

/// The parameterization record for scanning `baserel` with values from
/// `required_outer`, or `None` when no outer rels are required. Records are
/// cached on the rel, one per distinct `required_outer`.
pub fn get_baserel_parampathinfo(root: &mut PlannerInfo, baserel: RelId, required_outer: &Relids) -> Option<ParamPathInfo> {
    if required_outer.is_empty() {
        return None;
    }
    if let Some(ppi) = root.rel(baserel).ppilist.iter().find(|p| &p.req_outer == required_outer) {
        return Some(ppi.clone());
    }

    let relids = root.rel(baserel).relids.clone();
    let joinrelids = relids.union(required_outer);
    let mut pclauses: Vec<RinfoId> = root
        .rel(baserel)
        .joininfo
        .iter()
        .copied()
        .filter(|id| join_clause_is_movable_into(root.rinfo(*id), &relids, &joinrelids))
        .collect();
    for id in generate_join_implied_equalities(root, &joinrelids, required_outer, &relids) {
        if !pclauses.contains(&id) {
            pclauses.push(id);
        }
    }

    let rows = get_parameterized_baserel_size(root, baserel, &pclauses);
    let serials = pclauses.iter().map(|id| root.rinfo(*id).rinfo_serial).collect();
    let ppi = ParamPathInfo {
        req_outer: required_outer.clone(),
        rows,
        clauses: pclauses,
        serials,
    };
    root.rel_mut(baserel).ppilist.push(ppi.clone());
    Some(ppi)
}

/// The parameterization record of a join path that needs `required_outer`.
/// Join clauses that can be enforced here but not in either input are
/// appended to `restrict_clauses`.
pub fn get_joinrel_parampathinfo(
    root: &mut PlannerInfo,
    joinrel: RelId,
    outer_path: PathId,
    inner_path: PathId,
    sjinfo: &SpecialJoinInfo,
    required_outer: &Relids,
    restrict_clauses: &mut Vec<RinfoId>,
) -> Option<ParamPathInfo> {
    if required_outer.is_empty() {
        return None;
    }
    let joinrelids = root.rel(joinrel).relids.clone();
    let join_and_req = joinrelids.union(required_outer);
    let outer = root.path(outer_path);
    let outer_relids = root.rel(outer.parent).relids.clone();
    let outer_and_req = outer_relids.union(&outer.req_outer());
    let inner = root.path(inner_path);
    let inner_relids = root.rel(inner.parent).relids.clone();
    let inner_and_req = inner_relids.union(&inner.req_outer());

    let enforceable_here = |root: &PlannerInfo, id: RinfoId| {
        let rinfo = root.rinfo(id);
        join_clause_is_movable_into(rinfo, &joinrelids, &join_and_req)
            && !join_clause_is_movable_into(rinfo, &outer_relids, &outer_and_req)
            && !join_clause_is_movable_into(rinfo, &inner_relids, &inner_and_req)
    };
    let mut pclauses: Vec<RinfoId> = root
        .rel(joinrel)
        .joininfo
        .iter()
        .copied()
        .filter(|id| enforceable_here(root, *id))
        .collect();
    for id in generate_join_implied_equalities(root, &join_and_req, required_outer, &joinrelids) {
        if enforceable_here(root, id) && !pclauses.contains(&id) {
            pclauses.push(id);
        }
    }
    for id in &pclauses {
        if !restrict_clauses.contains(id) {
            restrict_clauses.push(*id);
        }
    }

    if let Some(ppi) = root.rel(joinrel).ppilist.iter().find(|p| &p.req_outer == required_outer) {
        return Some(ppi.clone());
    }
    let rows = get_parameterized_joinrel_size(root, joinrel, outer_path, inner_path, sjinfo, restrict_clauses);
    let ppi = ParamPathInfo {
        req_outer: required_outer.clone(),
        rows,
        clauses: Vec::new(),
        serials: pclauses.iter().map(|id| root.rinfo(*id).rinfo_serial).collect(),
    };
    root.rel_mut(joinrel).ppilist.push(ppi.clone());
    Some(ppi)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalog, RelationInfo};
    use crate::config::PlannerConfig;
    use crate::cost::set_baserel_size_estimates;
    use crate::expr::oids;
    use crate::initsplan::{add_base_rels_to_query, build_base_rel_tlists, deconstruct_jointree};
    use crate::equivalence::generate_base_implied_equalities;
    use crate::query::{JoinTreeNode, Query};
    use crate::relids;
    use std::sync::Arc;

    fn eq(l: Expr, r: Expr) -> Expr {
        Expr::op(oids::INT4EQ, l, r)
    }

    /// a, b, c with a.1 = b.1 and b.2 = c.1.
    fn setup() -> PlannerInfo {
        let mut catalog = InMemoryCatalog::new();
        for oid in 100..103 {
            catalog.add_relation(oid, RelationInfo::new(1000.0, 2));
        }
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 101);
        let c = q.add_relation("c", 102);
        q.jointree = JoinTreeNode::From {
            items: vec![JoinTreeNode::Rel(a), JoinTreeNode::Rel(b), JoinTreeNode::Rel(c)],
            quals: vec![
                eq(Expr::int4_var(a, 1), Expr::int4_var(b, 1)),
                eq(Expr::int4_var(b, 2), Expr::int4_var(c, 1)),
            ],
        };
        q.add_target("x", Expr::int4_var(a, 2));
        q.add_target("y", Expr::int4_var(c, 2));
        let mut root = PlannerInfo::new(q, Arc::new(catalog), PlannerConfig::default());
        add_base_rels_to_query(&mut root).unwrap();
        build_base_rel_tlists(&mut root);
        deconstruct_jointree(&mut root).unwrap();
        generate_base_implied_equalities(&mut root).unwrap();
        for id in root.base_rel_ids() {
            set_baserel_size_estimates(&mut root, id);
        }
        root
    }

    #[test]
    fn test_join_rel_is_cached_by_relids() {
        let mut root = setup();
        let a = root.base_rel_id(1).unwrap();
        let b = root.base_rel_id(2).unwrap();
        let sj = SpecialJoinInfo::dummy(&relids![1], &relids![2]);
        let (ab, restrict) = build_join_rel(&mut root, &relids![1, 2], a, b, &sj);
        assert_eq!(restrict.len(), 1);
        let (again, restrict_again) = build_join_rel(&mut root, &relids![1, 2], b, a, &sj);
        assert_eq!(ab, again);
        assert_eq!(restrict_again.len(), 1);
        assert_eq!(root.join_rel_list.len(), 1);
        // 1000 * 1000 / 200 default distinct keys
        assert_eq!(root.rel(ab).rows, 5000.0);
    }

    #[test]
    fn test_join_tlist_keeps_only_columns_needed_above() {
        let mut root = setup();
        let a = root.base_rel_id(1).unwrap();
        let b = root.base_rel_id(2).unwrap();
        let sj = SpecialJoinInfo::dummy(&relids![1], &relids![2]);
        let (ab, _) = build_join_rel(&mut root, &relids![1, 2], a, b, &sj);
        let names: Vec<String> = root.rel(ab).reltarget.exprs.iter().map(|e| e.to_string()).collect();
        // a.1 is consumed by the join; a.2 is output and b.2 joins to c
        assert_eq!(names.len(), 2);
        assert!(root.rel(ab).has_eclass_joins);
    }

    #[test]
    fn test_baserel_parampathinfo_is_cached_per_outer_set() {
        let mut root = setup();
        let b = root.base_rel_id(2).unwrap();
        assert!(get_baserel_parampathinfo(&mut root, b, &Relids::new()).is_none());
        let ppi = get_baserel_parampathinfo(&mut root, b, &relids![1]).unwrap();
        assert_eq!(ppi.clauses.len(), 1);
        assert_eq!(ppi.rows, 5.0);
        let again = get_baserel_parampathinfo(&mut root, b, &relids![1]).unwrap();
        assert_eq!(ppi, again);
        assert_eq!(root.rel(b).ppilist.len(), 1);
    }
}
