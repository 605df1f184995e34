//! Placeholder bookkeeping: where each [`PlaceHolderVar`] is computed, which
//! rels must supply its inputs, and which join rels carry its value upward.

use crate::expr::{expression_tree_walker, pull_var_clause, pull_varnos, Expr, PlaceHolderVar, PullVarFlags};
use crate::initsplan::add_vars_to_targetlist;
use crate::planner_info::{PlannerInfo, RelId};
use crate::relation::PlaceHolderInfo;
use crate::relids::Relids;
use crate::stats::get_typavgwidth;

/// Wraps `expr` in a new placeholder scoped to `phrels`.
pub fn make_placeholder_expr(root: &mut PlannerInfo, expr: Expr, phrels: Relids) -> PlaceHolderVar {
    root.last_phid += 1;
    PlaceHolderVar {
        phid: root.last_phid,
        phexpr: Box::new(expr),
        phrels,
        phnullingrels: Relids::new(),
        phlevelsup: 0,
    }
}

/// Index of the placeholder's info in `placeholder_list`, creating it on
/// first sight.
pub fn find_placeholder_info(root: &mut PlannerInfo, phv: &PlaceHolderVar) -> usize {
    if let Some(pos) = root.placeholder_list.iter().position(|p| p.phid == phv.phid) {
        return pos;
    }
    root.last_phid = root.last_phid.max(phv.phid);

    let rels_used = pull_varnos(&phv.phexpr);
    let ph_lateral = rels_used.difference(&phv.phrels);
    let mut ph_eval_at = rels_used.intersect(&phv.phrels);
    // a constant expression is evaluated at its syntactic scope
    if ph_eval_at.is_empty() {
        ph_eval_at = phv.phrels.clone();
    }
    let mut ph_var = phv.clone();
    ph_var.phnullingrels = Relids::new();
    root.placeholder_list.push(PlaceHolderInfo {
        phid: phv.phid,
        ph_var,
        ph_eval_at,
        ph_lateral,
        ph_needed: Relids::new(),
        ph_width: get_typavgwidth(phv.phexpr.type_oid()),
    });
    root.placeholder_list.len() - 1
}

/// Registers every placeholder appearing in the query's quals and target list.
pub fn find_placeholders_in_query(root: &mut PlannerInfo) {
    let mut found: Vec<PlaceHolderVar> = Vec::new();
    let mut collect = |e: &Expr| {
        expression_tree_walker(e, &mut |node| {
            if let Expr::PlaceHolderVar(phv) = node {
                if phv.phlevelsup == 0 && !found.iter().any(|p| p.phid == phv.phid) {
                    found.push(phv.clone());
                }
            }
            false
        });
    };
    for tle in &root.processed_tlist {
        collect(&tle.expr);
    }
    if let Some(having) = &root.having_qual {
        collect(having);
    }
    let mut quals = Vec::new();
    collect_jointree_quals(&root.parse.jointree, &mut quals);
    for qual in quals {
        collect(qual);
    }
    for phv in found {
        find_placeholder_info(root, &phv);
    }
}

fn collect_jointree_quals<'a>(node: &'a crate::query::JoinTreeNode, out: &mut Vec<&'a Expr>) {
    use crate::query::JoinTreeNode;
    match node {
        JoinTreeNode::Rel(_) => {}
        JoinTreeNode::Join { larg, rarg, quals, .. } => {
            collect_jointree_quals(larg, out);
            collect_jointree_quals(rarg, out);
            out.extend(quals.iter());
        }
        JoinTreeNode::From { items, quals } => {
            for item in items {
                collect_jointree_quals(item, out);
            }
            out.extend(quals.iter());
        }
    }
}

/// The inputs of each placeholder must be available where it is evaluated.
pub fn fix_placeholder_input_needed_levels(root: &mut PlannerInfo) {
    let pending: Vec<(Vec<Expr>, Relids)> = root
        .placeholder_list
        .iter()
        .map(|phinfo| {
            let vars = pull_var_clause(
                &phinfo.ph_var.phexpr,
                PullVarFlags {
                    include_aggregates: false,
                    include_placeholders: true,
                },
            );
            (vars, phinfo.ph_eval_at.clone())
        })
        .collect();
    for (vars, eval_at) in pending {
        add_vars_to_targetlist(root, &vars, &eval_at);
    }
}

/// Adds placeholders computed at a single base rel, and needed above it, to
/// that rel's output.
pub fn add_placeholders_to_base_rels(root: &mut PlannerInfo) {
    for i in 0..root.placeholder_list.len() {
        let phinfo = &root.placeholder_list[i];
        let Some(relid) = phinfo.ph_eval_at.singleton_member() else {
            continue;
        };
        if phinfo.ph_needed.difference(&phinfo.ph_eval_at).is_empty() {
            continue;
        }
        let Some(rel_id) = root.base_rel_id(relid) else {
            continue;
        };
        let expr = Expr::PlaceHolderVar(phinfo.ph_var.clone());
        let width = phinfo.ph_width;
        let rel = root.rel_mut(rel_id);
        rel.reltarget.exprs.push(expr);
        rel.reltarget.width += width;
    }
}

/// Adds the placeholders that become computable at this join, and are still
/// needed above it, to the join's output. A placeholder computed here also
/// makes the join laterally dependent on its lateral sources.
pub fn add_placeholders_to_joinrel(root: &mut PlannerInfo, joinrel: RelId, outer: &Relids, inner: &Relids) {
    let relids = root.rel(joinrel).relids.clone();
    let mut exprs = Vec::new();
    let mut width = 0;
    let mut lateral = Relids::new();
    for phinfo in &root.placeholder_list {
        if !phinfo.ph_eval_at.is_subset(&relids) {
            continue;
        }
        if !phinfo.ph_needed.difference(&relids).is_empty() {
            let mut phv = phinfo.ph_var.clone();
            phv.phnullingrels = root
                .outer_join_rels
                .intersect(&relids)
                .difference(&phinfo.ph_eval_at);
            exprs.push(Expr::PlaceHolderVar(phv));
            width += phinfo.ph_width;
        }
        if !phinfo.ph_eval_at.is_subset(outer) && !phinfo.ph_eval_at.is_subset(inner) {
            lateral.union_with(&phinfo.ph_lateral);
        }
    }
    let rel = root.rel_mut(joinrel);
    rel.reltarget.exprs.extend(exprs);
    rel.reltarget.width += width;
    rel.direct_lateral_relids.union_with(&lateral);
    let own = rel.relids.clone();
    rel.direct_lateral_relids.difference_with(&own);
}

/// Drops the placeholders that were only needed inside a removed join and
/// evaluated at its removed rel, and strips `relid` and `ojrelid` from the rest.
/// `joinrelids` is the full relid set of the removed join.
pub fn remove_rel_from_placeholders(root: &mut PlannerInfo, relid: usize, ojrelid: usize, joinrelids: &Relids) {
    root.placeholder_list.retain(|phinfo| {
        !(phinfo.ph_needed.is_subset(joinrelids)
            && phinfo.ph_eval_at.contains(relid)
            && (ojrelid == 0 || !phinfo.ph_eval_at.contains(ojrelid)))
    });
    let mut removed = Relids::singleton(relid);
    if ojrelid != 0 {
        removed.add(ojrelid);
    }
    for phinfo in &mut root.placeholder_list {
        phinfo.ph_eval_at.difference_with(&removed);
        phinfo.ph_needed.difference_with(&removed);
        phinfo.ph_var.phrels.difference_with(&removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::config::PlannerConfig;
    use crate::expr::oids;
    use crate::query::Query;
    use crate::relids;
    use std::sync::Arc;

    fn root() -> PlannerInfo {
        PlannerInfo::new(
            Query::new(),
            Arc::new(InMemoryCatalog::new()),
            PlannerConfig::default(),
        )
    }

    #[test]
    fn test_eval_level_is_used_rels_within_scope() {
        let mut root = root();
        let expr = Expr::op(oids::INT4EQ, Expr::int4_var(2, 1), Expr::int4_var(1, 1));
        let phv = make_placeholder_expr(&mut root, expr, relids![2]);
        let pos = find_placeholder_info(&mut root, &phv);
        let info = &root.placeholder_list[pos];
        assert_eq!(info.ph_eval_at, relids![2]);
        assert_eq!(info.ph_lateral, relids![1]);
        assert_eq!(find_placeholder_info(&mut root, &phv), pos);
    }

    #[test]
    fn test_constant_placeholder_evaluates_at_scope() {
        let mut root = root();
        let phv = make_placeholder_expr(&mut root, Expr::int4(1), relids![3]);
        let pos = find_placeholder_info(&mut root, &phv);
        assert_eq!(root.placeholder_list[pos].ph_eval_at, relids![3]);
        assert!(root.placeholder_list[pos].ph_lateral.is_empty());
    }
}
