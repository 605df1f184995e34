//! # Base Rel Access Paths
//!
//! [`make_one_rel`] drives path construction for one query level. It first
//! estimates the size of every base rel, then builds the scan paths of each
//! one, and finally hands the base rels to the join search.
//!
//! ## Scans
//!
//! * Plain relations get a sequential scan plus, for each usable btree index,
//!   an index scan restricted by the rel's own quals and parameterized index
//!   scans driven by join clauses.
//! * Subqueries get a scan of the subquery result.
//! * Inheritance parents become an Append over their children's cheapest
//!   paths, after translating the parent's restrictions to each child.
//!
//! A rel whose restrictions reduce to constant FALSE is marked dummy: it keeps
//! a single empty Result path and joins short-circuit around it.

use crate::catalog::IndexInfo;
use crate::cost::{clamp_row_est, set_baserel_size_estimates, set_rel_width};
use crate::equivalence::{add_child_rel_equivalences, generate_implied_equalities_for_column, translate_attno};
use crate::error::Result;
use crate::expr::{change_var_nodes_extended, contain_volatile_functions, pull_varnos, AttrNumber, Expr};
use crate::joinrels::{is_dummy_rel, mark_dummy_rel, restriction_is_constant_false};
use crate::pathkeys::{build_index_pathkeys, has_useful_pathkeys, truncate_useless_pathkeys};
use crate::pathnode::{
    add_path, create_append_path, create_index_path, create_seqscan_path, create_subqueryscan_path, set_cheapest,
};
use crate::planner_info::{PlannerInfo, RelId, RinfoId};
use crate::query::AppendRelInfo;
use crate::relation::RelSource;
use crate::relids::{Index, Relids};
use crate::relnode::get_baserel_parampathinfo;
use crate::restrictinfo::{join_clause_is_movable_to, make_restrictinfo, RestrictInfo, RinfoOptions};
use crate::search::join_search;
use tracing::{debug, trace};

/// Builds every access path of the query's base rels and searches for the
/// best join order. Returns the rel holding the whole query.
pub fn make_one_rel(root: &mut PlannerInfo) -> Result<RelId> {
    set_base_rel_sizes(root)?;
    set_base_rel_pathlists(root)?;
    let top = join_search(root)?;
    debug!(
        relids = %root.rel(top).relids,
        rows = root.rel(top).rows,
        "built final rel"
    );
    Ok(top)
}

/// Estimates rows and width of every base rel.
pub fn set_base_rel_sizes(root: &mut PlannerInfo) -> Result<()> {
    for rel in root.base_rel_ids() {
        root.check_for_interrupts()?;
        let baserestrict = root.rel(rel).baserestrictinfo.clone();
        if restriction_is_constant_false(root, &baserestrict, &Relids::new(), false) {
            set_rel_width(root, rel);
            mark_dummy_rel(root, rel)?;
            continue;
        }
        if root.rel(rel).inh {
            set_append_rel_size(root, rel)?;
        } else {
            set_baserel_size_estimates(root, rel);
        }
    }
    Ok(())
}

/// Builds and costs the scan paths of every base rel.
pub fn set_base_rel_pathlists(root: &mut PlannerInfo) -> Result<()> {
    for rel in root.base_rel_ids() {
        root.check_for_interrupts()?;
        if is_dummy_rel(root, rel) {
            continue;
        }
        if root.rel(rel).inh {
            set_append_rel_pathlist(root, rel)?;
        } else {
            set_plain_rel_pathlist(root, rel)?;
        }
        trace!(
            rel = %root.rel(rel).relids,
            paths = root.rel(rel).pathlist.len(),
            "base rel paths built"
        );
    }
    Ok(())
}

fn set_plain_rel_pathlist(root: &mut PlannerInfo, rel: RelId) -> Result<()> {
    // laterally-referencing rels can only be scanned as a nestloop inner
    let required_outer = root.rel(rel).lateral_relids.clone();
    if matches!(root.rel(rel).source, RelSource::Relation { .. }) {
        let path = create_seqscan_path(root, rel, &required_outer);
        add_path(root, rel, path);
        create_index_paths(root, rel);
    } else if matches!(root.rel(rel).source, RelSource::Subquery(_)) {
        let path = create_subqueryscan_path(root, rel, &required_outer);
        add_path(root, rel, path);
    }
    set_cheapest(root, rel)
}

// ---------------------------------------------------------------------------
// Index paths
// ---------------------------------------------------------------------------

/// Position of the index column a clause can drive, if any. The clause must
/// compare a key column of `relid` with an expression free of `relid` using
/// an operator of that column's btree family.
fn match_clause_to_index(root: &PlannerInfo, rinfo: &RestrictInfo, relid: Index, index: &IndexInfo) -> Option<usize> {
    if rinfo.pseudoconstant || rinfo.has_volatile() {
        return None;
    }
    let (left, right) = rinfo.operands()?;
    let op = root.catalog.get_operator(rinfo.opno()?)?;
    let (column, other) = match (left.as_var(), right.as_var()) {
        (Some(v), _) if v.varno == relid && v.varlevelsup == 0 => (v.varattno, right),
        (_, Some(v)) if v.varno == relid && v.varlevelsup == 0 => (v.varattno, left),
        _ => return None,
    };
    if pull_varnos(other).contains(relid) || contain_volatile_functions(other) {
        return None;
    }
    let pos = index.keys.iter().position(|k| *k == column)?;
    let family = *index.opfamilies.get(pos)?;
    let in_family = op.btree.is_some_and(|(f, _)| f == family) || op.mergejoin_opfamilies.contains(&family);
    in_family.then_some(pos)
}

/// Clauses from `candidates` usable with `index`, and whether the leading
/// column is among the matched ones.
fn match_clauses_to_index(
    root: &PlannerInfo,
    relid: Index,
    index: &IndexInfo,
    candidates: &[RinfoId],
) -> (Vec<RinfoId>, bool) {
    let mut matched = Vec::new();
    let mut leading = false;
    for id in candidates {
        if let Some(pos) = match_clause_to_index(root, root.rinfo(*id), relid, index) {
            leading |= pos == 0;
            matched.push(*id);
        }
    }
    (matched, leading)
}

/// Number of times a parameterized scan is expected to repeat: the smallest
/// row count among the rels supplying its parameters.
fn get_loop_count(root: &PlannerInfo, outer_relids: &Relids) -> f64 {
    let mut result: Option<f64> = None;
    for relid in outer_relids.iter() {
        let Some(rel) = root.base_rel_id(relid) else {
            continue;
        };
        let rows = root.rel(rel).rows;
        if rows > 0.0 && result.map_or(true, |r| rows < r) {
            result = Some(rows);
        }
    }
    clamp_row_est(result.unwrap_or(1.0))
}

/// Adds plain and parameterized index scans for each usable index of `rel`.
pub fn create_index_paths(root: &mut PlannerInfo, rel: RelId) {
    let relid = root.rel(rel).relid;
    let lateral = root.rel(rel).lateral_relids.clone();
    let relids = root.rel(rel).relids.clone();
    let baserestrict = root.rel(rel).baserestrictinfo.clone();
    let indexes: Vec<IndexInfo> = root
        .rel(rel)
        .indexlist
        .iter()
        // partial indexes would need predicate proofs
        .filter(|i| i.predicate.is_none())
        .cloned()
        .collect();
    if indexes.is_empty() {
        return;
    }

    // outer relid sets that could parameterize an index scan
    let mut outer_sets: Vec<Relids> = Vec::new();
    let mut note_outer = |set: Relids| {
        if !set.is_empty() && !outer_sets.contains(&set) {
            outer_sets.push(set);
        }
    };
    for id in root.rel(rel).joininfo.clone() {
        let rinfo = root.rinfo(id);
        if join_clause_is_movable_to(rinfo, root.rel(rel)) && rinfo.is_mergejoinable() {
            note_outer(rinfo.clause_relids.difference(&relids));
        }
    }
    let key_columns: Vec<AttrNumber> = indexes.iter().flat_map(|i| i.keys.iter().copied()).collect();
    let is_key = move |e: &Expr| {
        e.as_var()
            .is_some_and(|v| v.varno == relid && v.varlevelsup == 0 && key_columns.contains(&v.varattno))
    };
    for id in generate_implied_equalities_for_column(root, rel, &is_key) {
        note_outer(root.rinfo(id).clause_relids.difference(&relids));
    }

    for index in indexes {
        let (restriction_clauses, restriction_leading) = match_clauses_to_index(root, relid, &index, &baserestrict);
        let pathkeys = if has_useful_pathkeys(root, rel) {
            let keys = build_index_pathkeys(root, rel, &index);
            truncate_useless_pathkeys(root, rel, keys)
        } else {
            Vec::new()
        };

        if restriction_leading || !pathkeys.is_empty() {
            let path = create_index_path(
                root,
                rel,
                index.clone(),
                restriction_clauses.clone(),
                pathkeys.clone(),
                &lateral,
                1.0,
            );
            add_path(root, rel, path);
        }

        for outer in &outer_sets {
            let required_outer = outer.union(&lateral);
            let Some(ppi) = get_baserel_parampathinfo(root, rel, &required_outer) else {
                continue;
            };
            let (join_clauses, join_leading) = match_clauses_to_index(root, relid, &index, &ppi.clauses);
            if join_clauses.is_empty() || !(join_leading || restriction_leading) {
                continue;
            }
            let mut indexclauses = restriction_clauses.clone();
            indexclauses.extend(join_clauses);
            let loop_count = get_loop_count(root, outer);
            let path = create_index_path(
                root,
                rel,
                index.clone(),
                indexclauses,
                pathkeys.clone(),
                &required_outer,
                loop_count,
            );
            trace!(
                rel = %relids,
                index = index.indexoid,
                outer = %required_outer,
                rows = path.rows,
                "parameterized index path"
            );
            add_path(root, rel, path);
        }
    }
}

// ---------------------------------------------------------------------------
// Append rels
// ---------------------------------------------------------------------------

fn translate_expr(expr: &Expr, appinfo: &AppendRelInfo) -> Expr {
    let mut translate = |e: &Expr| translate_attno(e, appinfo);
    change_var_nodes_extended(
        expr.clone(),
        appinfo.parent_relid,
        appinfo.child_relid,
        0,
        Some(&mut translate as &mut dyn FnMut(&Expr) -> Option<Expr>),
    )
}

fn child_appinfos(root: &PlannerInfo, parent_relid: Index) -> Vec<AppendRelInfo> {
    root.append_rel_list
        .iter()
        .filter(|a| a.parent_relid == parent_relid)
        .cloned()
        .collect()
}

/// Sizes the children of an inheritance parent. The parent's rows are the sum
/// of its live children.
fn set_append_rel_size(root: &mut PlannerInfo, parent: RelId) -> Result<()> {
    let parent_relid = root.rel(parent).relid;
    let parent_restrict = root.rel(parent).baserestrictinfo.clone();
    let parent_target = root.rel(parent).reltarget.exprs.clone();

    let mut rows = 0.0;
    let mut tuples = 0.0;
    let mut any_live = false;
    for appinfo in child_appinfos(root, parent_relid) {
        root.check_for_interrupts()?;
        let child = root.find_base_rel(appinfo.child_relid)?;

        let mut child_restrict = Vec::with_capacity(parent_restrict.len());
        for id in &parent_restrict {
            let parent_rinfo = root.rinfo(*id);
            let clause = translate_expr(&parent_rinfo.clause, &appinfo);
            let opts = RinfoOptions {
                is_pushed_down: parent_rinfo.is_pushed_down,
                pseudoconstant: parent_rinfo.pseudoconstant,
                security_level: parent_rinfo.security_level,
                ..RinfoOptions::default()
            };
            let serial = parent_rinfo.rinfo_serial;
            let mut rinfo = make_restrictinfo(root, clause, opts);
            rinfo.rinfo_serial = serial;
            child_restrict.push(root.add_rinfo(rinfo));
        }
        let child_target: Vec<Expr> = parent_target.iter().map(|e| translate_expr(e, &appinfo)).collect();
        {
            let child_rel = root.rel_mut(child);
            child_rel.baserestrictinfo = child_restrict.clone();
            child_rel.reltarget.exprs = child_target;
        }
        add_child_rel_equivalences(root, &appinfo, child);

        if restriction_is_constant_false(root, &child_restrict, &Relids::new(), false) {
            set_rel_width(root, child);
            mark_dummy_rel(root, child)?;
            continue;
        }
        set_baserel_size_estimates(root, child);
        any_live = true;
        rows += root.rel(child).rows;
        tuples += root.rel(child).tuples;
    }

    set_rel_width(root, parent);
    if !any_live {
        return mark_dummy_rel(root, parent);
    }
    let parent_rel = root.rel_mut(parent);
    parent_rel.rows = clamp_row_est(rows);
    parent_rel.tuples = tuples;
    Ok(())
}

/// Builds each live child's paths and an Append of their cheapest totals.
fn set_append_rel_pathlist(root: &mut PlannerInfo, parent: RelId) -> Result<()> {
    let parent_relid = root.rel(parent).relid;
    let mut subpaths = Vec::new();
    for appinfo in child_appinfos(root, parent_relid) {
        let child = root.find_base_rel(appinfo.child_relid)?;
        if is_dummy_rel(root, child) {
            continue;
        }
        set_plain_rel_pathlist(root, child)?;
        subpaths.push(root.cheapest_total(child)?);
    }
    let path = create_append_path(root, parent, subpaths);
    add_path(root, parent, path);
    set_cheapest(root, parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalog, RelationInfo};
    use crate::config::PlannerConfig;
    use crate::equivalence::generate_base_implied_equalities;
    use crate::expr::oids;
    use crate::initsplan::{add_base_rels_to_query, build_base_rel_tlists, deconstruct_jointree};
    use crate::path::PathKind;
    use crate::query::{JoinTreeNode, Query};
    use std::sync::Arc;

    fn prepare(q: Query, catalog: InMemoryCatalog) -> PlannerInfo {
        let mut root = PlannerInfo::new(q, Arc::new(catalog), PlannerConfig::default());
        add_base_rels_to_query(&mut root).unwrap();
        build_base_rel_tlists(&mut root);
        deconstruct_jointree(&mut root).unwrap();
        generate_base_implied_equalities(&mut root).unwrap();
        root
    }

    #[test]
    fn test_constant_false_restriction_makes_dummy_rel() {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(100, RelationInfo::new(1000.0, 2));
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        q.jointree = JoinTreeNode::From {
            items: vec![JoinTreeNode::Rel(a)],
            quals: vec![Expr::bool_const(false)],
        };
        q.add_target("x", Expr::int4_var(a, 1));
        let mut root = prepare(q, catalog);
        set_base_rel_sizes(&mut root).unwrap();
        set_base_rel_pathlists(&mut root).unwrap();
        let ra = root.base_rel_id(a).unwrap();
        assert!(is_dummy_rel(&root, ra));
        assert_eq!(root.rel(ra).rows, 0.0);
    }

    #[test]
    fn test_selective_restriction_uses_index() {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(
            100,
            RelationInfo::new(1_000_000.0, 2).with_index(IndexInfo::unique_btree(101, vec![1], 1_000_000.0)),
        );
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        q.jointree = JoinTreeNode::From {
            items: vec![JoinTreeNode::Rel(a)],
            quals: vec![Expr::op(oids::INT4EQ, Expr::int4_var(a, 1), Expr::int4(42))],
        };
        q.add_target("x", Expr::int4_var(a, 2));
        let mut root = prepare(q, catalog);
        set_base_rel_sizes(&mut root).unwrap();
        set_base_rel_pathlists(&mut root).unwrap();
        let ra = root.base_rel_id(a).unwrap();
        let cheapest = root.cheapest_total(ra).unwrap();
        assert!(matches!(root.path(cheapest).kind, PathKind::IndexScan { .. }));
    }

    #[test]
    fn test_join_clause_produces_parameterized_index_path() {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(100, RelationInfo::new(100.0, 2));
        catalog.add_relation(
            200,
            RelationInfo::new(1_000_000.0, 2).with_index(IndexInfo::unique_btree(201, vec![1], 1_000_000.0)),
        );
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 200);
        q.jointree = JoinTreeNode::From {
            items: vec![JoinTreeNode::Rel(a), JoinTreeNode::Rel(b)],
            quals: vec![Expr::op(oids::INT4EQ, Expr::int4_var(a, 1), Expr::int4_var(b, 1))],
        };
        q.add_target("x", Expr::int4_var(b, 2));
        let mut root = prepare(q, catalog);
        set_base_rel_sizes(&mut root).unwrap();
        set_base_rel_pathlists(&mut root).unwrap();
        let rb = root.base_rel_id(b).unwrap();
        let param = root
            .rel(rb)
            .pathlist
            .iter()
            .map(|id| root.path(*id))
            .find(|p| p.is_parameterized())
            .expect("parameterized path");
        assert!(matches!(param.kind, PathKind::IndexScan { .. }));
        assert!(param.req_outer().contains(a));
        assert!(param.rows < 10.0);
        assert!(root.rel(rb).cheapest_parameterized_paths.len() >= 2);
    }
}
