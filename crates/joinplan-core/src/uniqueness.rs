//! # Uniqueness Proofs
//!
//! Decides whether a base rel yields at most one row for any given values of
//! the columns that a list of equality join clauses constrains. Join removal,
//! self-join elimination and semijoin reduction depend on this proof. So does
//! join costing, where an inner-unique join can stop scanning the inner input
//! after the first match.
//!
//! A plain relation is distinct when a unique, immediately enforced,
//! non-partial index has every key column equated to either an outer
//! expression or a constant. A subquery is distinct when its DISTINCT list,
//! GROUP BY list or set operation is covered by the equated output columns.
//! An aggregate without GROUP BY also makes it distinct, since it yields one
//! row.
//!
//! ## Cache
//!
//! Each rel remembers for which outer relid sets the proof succeeded
//! (`unique_for_rels`) or failed (`non_unique_for_rels`). A proof valid against
//! outer set `S` stays valid against every superset of `S`, since more outer
//! rels only add join clauses. A failure against `S` likewise answers every
//! subset of `S`.

use crate::catalog::IndexInfo;
use crate::expr::{AttrNumber, Expr};
use crate::planner_info::{PlannerInfo, RelId, RinfoId};
use crate::query::{JoinType, SubqueryInfo};
use crate::relation::{RelOptInfo, RelSource, UniqueRelInfo};
use crate::relids::{Index, Relids};
use crate::restrictinfo::{clause_sides_match_join, rinfo_is_pushed_down};
use tracing::trace;

/// Caching behavior of one uniqueness inquiry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UniqueProofMode {
    /// Remember a failed proof. Only callers that do not ask again with a
    /// growing outer set should set this.
    pub force_cache: bool,
    /// The inquiry comes from self-join elimination. Cache hits must then
    /// match the outer relids exactly.
    pub self_join: bool,
    /// Do not remember a successful proof. Used when the clause list was
    /// filtered by the caller and the result would not hold in general.
    pub no_positive_cache: bool,
}

/// Can `innerrel` produce at most one row per outer row of this join?
pub fn innerrel_is_unique(
    root: &mut PlannerInfo,
    joinrelids: &Relids,
    outerrelids: &Relids,
    innerrel: RelId,
    jointype: JoinType,
    restrictlist: &[RinfoId],
    force_cache: bool,
) -> bool {
    let mode = UniqueProofMode {
        force_cache,
        ..UniqueProofMode::default()
    };
    innerrel_is_unique_ext(root, joinrelids, outerrelids, innerrel, jointype, restrictlist, mode).is_some()
}

/// Like [`innerrel_is_unique`], but returns the inner rel's baserestrict
/// clauses the proof relied on when it succeeds.
pub fn innerrel_is_unique_ext(
    root: &mut PlannerInfo,
    joinrelids: &Relids,
    outerrelids: &Relids,
    innerrel: RelId,
    jointype: JoinType,
    restrictlist: &[RinfoId],
    mode: UniqueProofMode,
) -> Option<Vec<RinfoId>> {
    if restrictlist.is_empty() {
        return None;
    }
    if !rel_supports_distinctness(root.rel(innerrel)) {
        return None;
    }

    let rel = root.rel(innerrel);
    for cached in &rel.unique_for_rels {
        let hit = if mode.self_join {
            cached.self_join && cached.outer_relids == *outerrelids
        } else {
            cached.outer_relids.is_subset(outerrelids)
        };
        if hit {
            return Some(cached.extra_clauses.clone());
        }
    }
    if rel
        .non_unique_for_rels
        .iter()
        .any(|known| outerrelids.is_subset(known))
    {
        return None;
    }

    match is_innerrel_unique_for(root, joinrelids, outerrelids, innerrel, jointype, restrictlist) {
        Some(extra_clauses) => {
            if !mode.no_positive_cache {
                root.rel_mut(innerrel).unique_for_rels.push(UniqueRelInfo {
                    outer_relids: outerrelids.clone(),
                    self_join: mode.self_join,
                    extra_clauses: extra_clauses.clone(),
                });
            }
            trace!(inner = %root.rel(innerrel).relids, outer = %outerrelids, "inner rel proven unique");
            Some(extra_clauses)
        }
        None => {
            if mode.force_cache {
                root.rel_mut(innerrel).non_unique_for_rels.push(outerrelids.clone());
            }
            None
        }
    }
}

/// Runs the proof without consulting the cache.
fn is_innerrel_unique_for(
    root: &PlannerInfo,
    joinrelids: &Relids,
    outerrelids: &Relids,
    innerrel: RelId,
    jointype: JoinType,
    restrictlist: &[RinfoId],
) -> Option<Vec<RinfoId>> {
    let inner_relids = &root.rel(innerrel).relids;
    let mut clause_list = Vec::new();
    for id in restrictlist {
        let rinfo = root.rinfo(*id);
        // a pushed-down qual of an outer join does not restrict its matches
        if jointype.is_outer() && rinfo_is_pushed_down(rinfo, joinrelids) {
            continue;
        }
        if !rinfo.can_join || rinfo.mergeopfamilies.is_empty() {
            continue;
        }
        if !clause_sides_match_join(rinfo, outerrelids, inner_relids) {
            continue;
        }
        clause_list.push(*id);
    }
    rel_is_distinct_for(root, innerrel, &clause_list)
}

/// Could the rel ever be proven distinct? Cheap test run before any clause
/// matching.
pub fn rel_supports_distinctness(rel: &RelOptInfo) -> bool {
    if !rel.is_base() {
        return false;
    }
    match &rel.source {
        RelSource::Relation { .. } => rel.indexlist.iter().any(usable_unique_index),
        RelSource::Subquery(sub) => {
            sub.distinct_cols.is_some()
                || (sub.group_by_cols.is_some() && !sub.has_grouping_sets)
                || sub.setop_distinct
                || sub.single_row
        }
        RelSource::None => false,
    }
}

fn usable_unique_index(index: &IndexInfo) -> bool {
    index.unique && index.immediate && index.predicate.is_none()
}

/// Is the rel distinct on the inner operands of `clause_list`? Each clause
/// must already be oriented with `clause_sides_match_join`.
pub fn rel_is_distinct_for(root: &PlannerInfo, rel: RelId, clause_list: &[RinfoId]) -> Option<Vec<RinfoId>> {
    let info = root.rel(rel);
    match &info.source {
        RelSource::Relation { .. } => relation_has_unique_index_for(root, rel, clause_list, &[]),
        RelSource::Subquery(sub) => {
            let colnos: Vec<AttrNumber> = clause_list
                .iter()
                .filter_map(|id| root.rinfo(*id).inner_operand())
                .filter_map(|expr| column_of(expr, info.relid))
                .collect();
            query_is_distinct_for(sub, &colnos).then(Vec::new)
        }
        RelSource::None => None,
    }
}

fn column_of(expr: &Expr, relid: Index) -> Option<AttrNumber> {
    expr.as_var()
        .filter(|v| v.varno == relid && v.varlevelsup == 0)
        .map(|v| v.varattno)
}

/// Finds a unique index of `rel` whose every key column is equated by one of
/// the join clauses (inner side on the rel), by one of the rel's own
/// `column = constant` restrictions, or by one of `extra_exprs` (pairs of
/// column and opfamily list).
///
/// Returns the baserestrict clauses used in the match, which is empty if only
/// join clauses were needed.
pub fn relation_has_unique_index_for(
    root: &PlannerInfo,
    rel: RelId,
    clause_list: &[RinfoId],
    extra_exprs: &[(Expr, Vec<u32>)],
) -> Option<Vec<RinfoId>> {
    let info = root.rel(rel);

    // (column, opfamilies, baserestrict clause that supplied it)
    let mut candidates: Vec<(AttrNumber, &[u32], Option<RinfoId>)> = Vec::new();
    for id in clause_list {
        let rinfo = root.rinfo(*id);
        if let Some(col) = rinfo.inner_operand().and_then(|e| column_of(e, info.relid)) {
            candidates.push((col, rinfo.mergeopfamilies.as_slice(), None));
        }
    }
    for id in &info.baserestrictinfo {
        let rinfo = root.rinfo(*id);
        if rinfo.mergeopfamilies.is_empty() {
            continue;
        }
        let Some((left, right)) = rinfo.operands() else {
            continue;
        };
        let inner = if rinfo.left_relids.is_empty() {
            right
        } else if rinfo.right_relids.is_empty() {
            left
        } else {
            continue;
        };
        if let Some(col) = column_of(inner, info.relid) {
            candidates.push((col, rinfo.mergeopfamilies.as_slice(), Some(*id)));
        }
    }
    for (expr, families) in extra_exprs {
        if let Some(col) = column_of(expr, info.relid) {
            candidates.push((col, families.as_slice(), None));
        }
    }
    if candidates.is_empty() {
        return None;
    }

    'index: for index in info.indexlist.iter().filter(|i| usable_unique_index(i)) {
        let mut used = Vec::new();
        for (pos, key) in index.keys.iter().enumerate() {
            let Some(family) = index.opfamilies.get(pos) else {
                continue 'index;
            };
            let matched = candidates
                .iter()
                .find(|(col, families, _)| col == key && families.contains(family));
            match matched {
                Some((_, _, source)) => used.extend(source.iter().copied()),
                None => continue 'index,
            }
        }
        trace!(rel = %info.relids, index = index.indexoid, "unique index covers join keys");
        return Some(used);
    }
    None
}

/// Does the subquery yield distinct rows over the output columns `colnos`?
pub fn query_is_distinct_for(sub: &SubqueryInfo, colnos: &[AttrNumber]) -> bool {
    if let Some(distinct) = &sub.distinct_cols {
        if distinct.iter().all(|c| colnos.contains(c)) {
            return true;
        }
    }

    // DISTINCT is applied after set-returning functions, everything else before
    if sub.has_target_srfs {
        return false;
    }

    if let Some(group_by) = &sub.group_by_cols {
        if !sub.has_grouping_sets && group_by.iter().all(|c| colnos.contains(c)) {
            return true;
        }
    } else if sub.single_row {
        return true;
    }

    if sub.setop_distinct {
        let ncols = sub.column_types.len() as AttrNumber;
        if (1..=ncols).all(|c| colnos.contains(&c)) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{IndexInfo, InMemoryCatalog, RelationInfo};
    use crate::config::PlannerConfig;
    use crate::equivalence::generate_base_implied_equalities;
    use crate::expr::{oids, Expr};
    use crate::initsplan::{add_base_rels_to_query, build_base_rel_tlists, deconstruct_jointree};
    use crate::query::{JoinTreeNode, Query};
    use crate::relnode::build_join_rel;
    use crate::relation::SpecialJoinInfo;
    use std::sync::Arc;

    fn subquery(distinct: Option<Vec<AttrNumber>>, group_by: Option<Vec<AttrNumber>>) -> SubqueryInfo {
        SubqueryInfo {
            rows: 100.0,
            width: 8,
            column_types: vec![oids::INT4OID, oids::INT4OID],
            distinct_cols: distinct,
            group_by_cols: group_by,
            has_grouping_sets: false,
            setop_distinct: false,
            single_row: false,
            has_target_srfs: false,
        }
    }

    #[test]
    fn test_distinct_subquery() {
        let sub = subquery(Some(vec![1]), None);
        assert!(query_is_distinct_for(&sub, &[1]));
        assert!(query_is_distinct_for(&sub, &[1, 2]));
        assert!(!query_is_distinct_for(&sub, &[2]));
    }

    #[test]
    fn test_group_by_defeated_by_srfs_and_grouping_sets() {
        let mut sub = subquery(None, Some(vec![1, 2]));
        assert!(query_is_distinct_for(&sub, &[1, 2]));
        assert!(!query_is_distinct_for(&sub, &[1]));
        sub.has_target_srfs = true;
        assert!(!query_is_distinct_for(&sub, &[1, 2]));
        sub.has_target_srfs = false;
        sub.has_grouping_sets = true;
        assert!(!query_is_distinct_for(&sub, &[1, 2]));
    }

    #[test]
    fn test_setop_needs_every_column() {
        let mut sub = subquery(None, None);
        sub.setop_distinct = true;
        assert!(!query_is_distinct_for(&sub, &[1]));
        assert!(query_is_distinct_for(&sub, &[1, 2]));
    }

    #[test]
    fn test_single_row_subquery_is_distinct_for_anything() {
        let mut sub = subquery(None, None);
        sub.single_row = true;
        assert!(query_is_distinct_for(&sub, &[]));
    }

    /// `a JOIN b ON a.1 = b.1`, with `b` carrying the given indexes.
    fn two_rel_join(indexes: Vec<IndexInfo>) -> (PlannerInfo, RelId, RelId, RelId, Vec<RinfoId>) {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(100, RelationInfo::new(1000.0, 2));
        let mut b_info = RelationInfo::new(1000.0, 2);
        for index in indexes {
            b_info = b_info.with_index(index);
        }
        catalog.add_relation(200, b_info);
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 200);
        q.jointree = JoinTreeNode::From {
            items: vec![JoinTreeNode::Rel(a), JoinTreeNode::Rel(b)],
            quals: vec![Expr::op(oids::INT4EQ, Expr::int4_var(a, 1), Expr::int4_var(b, 1))],
        };
        let mut root = PlannerInfo::new(q, Arc::new(catalog), PlannerConfig::default());
        add_base_rels_to_query(&mut root).unwrap();
        build_base_rel_tlists(&mut root);
        deconstruct_jointree(&mut root).unwrap();
        generate_base_implied_equalities(&mut root).unwrap();
        let ra = root.base_rel_id(a).unwrap();
        let rb = root.base_rel_id(b).unwrap();
        let outer = root.rel(ra).relids.clone();
        let inner = root.rel(rb).relids.clone();
        let sjinfo = SpecialJoinInfo::dummy(&outer, &inner);
        let (joinrel, restrictlist) = build_join_rel(&mut root, &outer.union(&inner), ra, rb, &sjinfo);
        (root, ra, rb, joinrel, restrictlist)
    }

    #[test]
    fn test_unique_index_proves_uniqueness_and_caches() {
        let (mut root, ra, rb, joinrel, restrictlist) =
            two_rel_join(vec![IndexInfo::unique_btree(201, vec![1], 1000.0)]);
        let joinrelids = root.rel(joinrel).relids.clone();
        let outer = root.rel(ra).relids.clone();
        assert!(innerrel_is_unique(
            &mut root,
            &joinrelids,
            &outer,
            rb,
            JoinType::Inner,
            &restrictlist,
            false
        ));
        assert_eq!(root.rel(rb).unique_for_rels.len(), 1);

        // a superset of the cached outer set hits the cache, even without clauses that match
        let bigger = outer.with(99);
        assert!(innerrel_is_unique(
            &mut root,
            &joinrelids,
            &bigger,
            rb,
            JoinType::Inner,
            &restrictlist,
            false
        ));
        assert_eq!(root.rel(rb).unique_for_rels.len(), 1);
    }

    #[test]
    fn test_non_unique_index_is_not_proof() {
        let (mut root, ra, rb, joinrel, restrictlist) =
            two_rel_join(vec![IndexInfo::btree(201, vec![1], 1000.0)]);
        let joinrelids = root.rel(joinrel).relids.clone();
        let outer = root.rel(ra).relids.clone();
        assert!(!innerrel_is_unique(
            &mut root,
            &joinrelids,
            &outer,
            rb,
            JoinType::Inner,
            &restrictlist,
            true
        ));
    }

    #[test]
    fn test_multi_column_index_needs_every_key() {
        let (mut root, ra, rb, joinrel, restrictlist) =
            two_rel_join(vec![IndexInfo::unique_btree(201, vec![1, 2], 1000.0)]);
        let joinrelids = root.rel(joinrel).relids.clone();
        let outer = root.rel(ra).relids.clone();
        assert!(!innerrel_is_unique(
            &mut root,
            &joinrelids,
            &outer,
            rb,
            JoinType::Inner,
            &restrictlist,
            true
        ));
        assert_eq!(root.rel(rb).non_unique_for_rels, vec![outer.clone()]);
    }

    #[test]
    fn test_negative_result_cached_only_when_forced() {
        let (mut root, ra, rb, joinrel, restrictlist) =
            two_rel_join(vec![IndexInfo::unique_btree(201, vec![2], 1000.0)]);
        let joinrelids = root.rel(joinrel).relids.clone();
        let outer = root.rel(ra).relids.clone();
        assert!(!innerrel_is_unique(
            &mut root,
            &joinrelids,
            &outer,
            rb,
            JoinType::Inner,
            &restrictlist,
            false
        ));
        assert!(root.rel(rb).non_unique_for_rels.is_empty());
    }

    #[test]
    fn test_self_join_lookup_needs_exact_outer_set() {
        let (mut root, ra, rb, joinrel, restrictlist) =
            two_rel_join(vec![IndexInfo::unique_btree(201, vec![1], 1000.0)]);
        let joinrelids = root.rel(joinrel).relids.clone();
        let outer = root.rel(ra).relids.clone();
        let self_join = UniqueProofMode {
            self_join: true,
            ..UniqueProofMode::default()
        };
        assert!(
            innerrel_is_unique_ext(&mut root, &joinrelids, &outer, rb, JoinType::Inner, &restrictlist, self_join)
                .is_some()
        );
        assert!(root.rel(rb).unique_for_rels[0].self_join);

        let unfiltered = UniqueProofMode {
            self_join: true,
            no_positive_cache: true,
            ..UniqueProofMode::default()
        };
        let (mut root, ra, rb, joinrel, restrictlist) =
            two_rel_join(vec![IndexInfo::unique_btree(201, vec![1], 1000.0)]);
        let joinrelids = root.rel(joinrel).relids.clone();
        let outer = root.rel(ra).relids.clone();
        assert!(
            innerrel_is_unique_ext(&mut root, &joinrelids, &outer, rb, JoinType::Inner, &restrictlist, unfiltered)
                .is_some()
        );
        assert!(root.rel(rb).unique_for_rels.is_empty());
    }
}
