//! # Path Keys
//!
//! A path's output ordering is a list of canonical [`PathKey`]s. Each pathkey
//! names an equivalence class rather than an expression, so a path sorted on
//! `a.x` also counts as sorted on `b.y` once `a.x = b.y` has been applied.
//!
//! Pathkeys are interned in [`PlannerInfo::canon_pathkeys`]: two orderings are
//! the same iff their [`PathKeyId`]s are equal. A pathkey whose class contains a
//! constant is redundant (every row has the same value) and is never emitted.
//!
//! Merge joins use pathkeys in both directions: the outer path's ordering
//! selects which merge clauses can be used, and the chosen clauses dictate the
//! ordering required of the inner path.

use crate::catalog::{BtStrategy, IndexInfo};
use crate::equivalence::{canonical_ec, eclass_useful_for_merging, get_eclass_for_sort_expr};
use crate::expr::Expr;
use crate::path::{PathKey, SortDirection};
use crate::planner_info::{EcId, JoinDomainId, PathKeyId, PlannerInfo, RelId, RinfoId};
use crate::query::SortClause;

/// Result of [`compare_pathkeys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKeysComparison {
    Equal,
    /// The first list is longer and has the second as a prefix.
    Better1,
    /// The second list is longer and has the first as a prefix.
    Better2,
    Different,
}

/// Interns the pathkey, returning the id shared by every equal ordering.
pub fn make_canonical_pathkey(
    root: &mut PlannerInfo,
    ec: EcId,
    opfamily: u32,
    direction: SortDirection,
    nulls_first: bool,
) -> PathKeyId {
    let key = PathKey {
        ec: canonical_ec(root, ec),
        opfamily,
        direction,
        nulls_first,
    };
    if let Some(pos) = root.canon_pathkeys.iter().position(|pk| *pk == key) {
        return PathKeyId(pos);
    }
    root.canon_pathkeys.push(key);
    PathKeyId(root.canon_pathkeys.len() - 1)
}

/// A pathkey adds nothing if its class is pinned to a constant or an earlier
/// key already sorts on the same class.
pub fn pathkey_is_redundant(root: &PlannerInfo, pathkey: PathKeyId, prior: &[PathKeyId]) -> bool {
    let ec = root.pathkey(pathkey).ec;
    if root.ec(ec).ec_has_const {
        return true;
    }
    prior.iter().any(|pk| root.pathkey(*pk).ec == ec)
}

/// Ordering requested by an ORDER BY list.
pub fn make_pathkeys_for_sortclauses(root: &mut PlannerInfo, clauses: &[SortClause]) -> Vec<PathKeyId> {
    let mut pathkeys = Vec::new();
    for clause in clauses {
        let Some(op) = root.catalog.get_operator(clause.sortop) else {
            continue;
        };
        let Some((family, strategy)) = op.btree else {
            continue;
        };
        let direction = match strategy {
            BtStrategy::Less | BtStrategy::LessEqual => SortDirection::Asc,
            BtStrategy::Greater | BtStrategy::GreaterEqual => SortDirection::Desc,
            BtStrategy::Equal => continue,
        };
        let datatype = clause.expr.type_oid();
        let Some(ec) = get_eclass_for_sort_expr(root, &clause.expr, &[family], datatype, JoinDomainId(0), true)
        else {
            continue;
        };
        let pk = make_canonical_pathkey(root, ec, family, direction, clause.nulls_first);
        if !pathkey_is_redundant(root, pk, &pathkeys) {
            pathkeys.push(pk);
        }
    }
    pathkeys
}

pub fn compare_pathkeys(keys1: &[PathKeyId], keys2: &[PathKeyId]) -> PathKeysComparison {
    if keys1 == keys2 {
        return PathKeysComparison::Equal;
    }
    let common = keys1.len().min(keys2.len());
    if keys1[..common] != keys2[..common] {
        return PathKeysComparison::Different;
    }
    if keys1.len() > keys2.len() {
        PathKeysComparison::Better1
    } else {
        PathKeysComparison::Better2
    }
}

/// True if a path sorted by `keys2` satisfies an ordering requirement `keys1`.
pub fn pathkeys_contained_in(keys1: &[PathKeyId], keys2: &[PathKeyId]) -> bool {
    matches!(
        compare_pathkeys(keys1, keys2),
        PathKeysComparison::Equal | PathKeysComparison::Better2
    )
}

/// Ordering produced by scanning `index` forwards. Stops at the first key
/// column that no equivalence class knows about.
pub fn build_index_pathkeys(root: &mut PlannerInfo, rel: RelId, index: &IndexInfo) -> Vec<PathKeyId> {
    let relid = root.rel(rel).relid;
    let mut pathkeys = Vec::new();
    for (pos, attno) in index.keys.iter().enumerate() {
        let Some(&family) = index.opfamilies.get(pos) else {
            break;
        };
        let Some(slot) = root.rel(rel).attr_slot(*attno) else {
            break;
        };
        let vartype = root.rel(rel).attr_types.get(slot).copied().unwrap_or_default();
        let expr = Expr::var(relid, *attno, vartype);
        let Some(ec) = get_eclass_for_sort_expr(root, &expr, &[family], vartype, JoinDomainId(0), false) else {
            break;
        };
        let pk = make_canonical_pathkey(root, ec, family, SortDirection::Asc, false);
        if !pathkey_is_redundant(root, pk, &pathkeys) {
            pathkeys.push(pk);
        }
    }
    pathkeys
}

/// Class on the outer side of a merge clause, as oriented by the last
/// `clause_sides_match_join`.
pub fn mergeclause_outer_ec(root: &PlannerInfo, rinfo: RinfoId) -> Option<EcId> {
    let r = root.rinfo(rinfo);
    if r.outer_is_left.get() {
        r.left_ec
    } else {
        r.right_ec
    }
}

pub fn mergeclause_inner_ec(root: &PlannerInfo, rinfo: RinfoId) -> Option<EcId> {
    let r = root.rinfo(rinfo);
    if r.outer_is_left.get() {
        r.right_ec
    } else {
        r.left_ec
    }
}

/// Merge clauses usable with an outer path sorted by `pathkeys`, in pathkey
/// order. Stops at the first pathkey no clause matches.
pub fn find_mergeclauses_for_outer_pathkeys(
    root: &PlannerInfo,
    pathkeys: &[PathKeyId],
    restrictinfos: &[RinfoId],
) -> Vec<RinfoId> {
    let mut result = Vec::new();
    for pk in pathkeys {
        let ec = root.pathkey(*pk).ec;
        let matched: Vec<RinfoId> = restrictinfos
            .iter()
            .copied()
            .filter(|r| mergeclause_outer_ec(root, *r).map(|e| canonical_ec(root, e)) == Some(ec))
            .filter(|r| !result.contains(r))
            .collect();
        if matched.is_empty() {
            break;
        }
        result.extend(matched);
    }
    result
}

/// An outer sort order that makes every merge clause usable: one ascending key
/// per distinct outer class, in clause order.
pub fn select_outer_pathkeys_for_merge(root: &mut PlannerInfo, mergeclauses: &[RinfoId]) -> Vec<PathKeyId> {
    let mut pathkeys = Vec::new();
    for rinfo in mergeclauses {
        let Some(ec) = mergeclause_outer_ec(root, *rinfo) else {
            continue;
        };
        let ec = canonical_ec(root, ec);
        let Some(&family) = root.ec(ec).ec_opfamilies.first() else {
            continue;
        };
        let pk = make_canonical_pathkey(root, ec, family, SortDirection::Asc, false);
        if !pathkey_is_redundant(root, pk, &pathkeys) {
            pathkeys.push(pk);
        }
    }
    pathkeys
}

/// Inner ordering matching an outer ordering for the given merge clauses.
pub fn make_inner_pathkeys_for_merge(
    root: &mut PlannerInfo,
    mergeclauses: &[RinfoId],
    outer_pathkeys: &[PathKeyId],
) -> Vec<PathKeyId> {
    let mut pathkeys = Vec::new();
    let mut last_outer: Option<PathKey> = None;
    for rinfo in mergeclauses {
        let Some(outer_ec) = mergeclause_outer_ec(root, *rinfo).map(|e| canonical_ec(root, e)) else {
            continue;
        };
        let Some(inner_ec) = mergeclause_inner_ec(root, *rinfo).map(|e| canonical_ec(root, e)) else {
            continue;
        };
        let outer_pk = outer_pathkeys
            .iter()
            .map(|pk| root.pathkey(*pk).clone())
            .find(|pk| pk.ec == outer_ec)
            .or_else(|| last_outer.clone());
        let Some(outer_pk) = outer_pk else {
            continue;
        };
        let pk = make_canonical_pathkey(root, inner_ec, outer_pk.opfamily, outer_pk.direction, outer_pk.nulls_first);
        if !pathkey_is_redundant(root, pk, &pathkeys) {
            pathkeys.push(pk);
        }
        last_outer = Some(outer_pk);
    }
    pathkeys
}

/// Leading pathkeys whose classes could drive a merge join with some other rel.
fn pathkeys_useful_for_merging(root: &PlannerInfo, rel: RelId, pathkeys: &[PathKeyId]) -> usize {
    let relids = &root.rel(rel).relids;
    pathkeys
        .iter()
        .take_while(|pk| eclass_useful_for_merging(root, root.pathkey(**pk).ec, relids))
        .count()
}

fn pathkeys_useful_for_ordering(root: &PlannerInfo, pathkeys: &[PathKeyId]) -> usize {
    if root.query_pathkeys.is_empty() {
        return 0;
    }
    if pathkeys_contained_in(&root.query_pathkeys, pathkeys) {
        root.query_pathkeys.len()
    } else {
        0
    }
}

/// Drops the trailing pathkeys that neither a merge join nor the final
/// ordering could use.
pub fn truncate_useless_pathkeys(root: &PlannerInfo, rel: RelId, pathkeys: Vec<PathKeyId>) -> Vec<PathKeyId> {
    let useful = pathkeys_useful_for_merging(root, rel, &pathkeys).max(pathkeys_useful_for_ordering(root, &pathkeys));
    let mut pathkeys = pathkeys;
    pathkeys.truncate(useful);
    pathkeys
}

/// Could any ordering of this rel matter?
pub fn has_useful_pathkeys(root: &PlannerInfo, rel: RelId) -> bool {
    root.rel(rel).has_eclass_joins || !root.query_pathkeys.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::config::PlannerConfig;
    use crate::expr::oids;
    use crate::query::Query;
    use std::sync::Arc;

    fn root() -> PlannerInfo {
        let mut root = PlannerInfo::new(
            Query::new(),
            Arc::new(InMemoryCatalog::new()),
            PlannerConfig::default(),
        );
        root.join_domains.push(Default::default());
        root
    }

    #[test]
    fn test_canonical_pathkeys_are_shared() {
        let mut root = root();
        let ec = get_eclass_for_sort_expr(
            &mut root,
            &Expr::int4_var(1, 1),
            &[oids::INTEGER_BTREE_FAM],
            oids::INT4OID,
            JoinDomainId(0),
            true,
        )
        .unwrap();
        let a = make_canonical_pathkey(&mut root, ec, oids::INTEGER_BTREE_FAM, SortDirection::Asc, false);
        let b = make_canonical_pathkey(&mut root, ec, oids::INTEGER_BTREE_FAM, SortDirection::Asc, false);
        let c = make_canonical_pathkey(&mut root, ec, oids::INTEGER_BTREE_FAM, SortDirection::Desc, true);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(root.canon_pathkeys.len(), 2);
    }

    #[test]
    fn test_compare_pathkeys() {
        let (a, b, c) = (PathKeyId(0), PathKeyId(1), PathKeyId(2));
        assert_eq!(compare_pathkeys(&[a, b], &[a, b]), PathKeysComparison::Equal);
        assert_eq!(compare_pathkeys(&[a, b], &[a]), PathKeysComparison::Better1);
        assert_eq!(compare_pathkeys(&[], &[a]), PathKeysComparison::Better2);
        assert_eq!(compare_pathkeys(&[a, c], &[a, b]), PathKeysComparison::Different);
        assert!(pathkeys_contained_in(&[a], &[a, b]));
        assert!(!pathkeys_contained_in(&[a, b], &[a]));
    }

    #[test]
    fn test_sortclauses_build_ordered_keys() {
        let mut root = root();
        let clauses = vec![
            SortClause {
                expr: Expr::int4_var(1, 1),
                sortop: oids::INT4LT,
                nulls_first: false,
            },
            SortClause {
                expr: Expr::int4_var(1, 2),
                sortop: oids::INT4GT,
                nulls_first: true,
            },
            // repeating a key adds nothing
            SortClause {
                expr: Expr::int4_var(1, 1),
                sortop: oids::INT4LT,
                nulls_first: false,
            },
        ];
        let keys = make_pathkeys_for_sortclauses(&mut root, &clauses);
        assert_eq!(keys.len(), 2);
        assert_eq!(root.pathkey(keys[0]).direction, SortDirection::Asc);
        assert_eq!(root.pathkey(keys[1]).direction, SortDirection::Desc);
        assert!(root.pathkey(keys[1]).nulls_first);
    }
}
