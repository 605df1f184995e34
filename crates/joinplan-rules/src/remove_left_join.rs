//! # Useless Left-Join Removal
//!
//! `L LEFT JOIN r ON q` returns exactly the rows of `L` when nothing above the
//! join reads a column of `r` and `r` matches at most one row per row of `L`.
//! In that case the join, and `r` with it, can be dropped before the join
//! search ever sees them.
//!
//! ## Conditions
//!
//! - The nullable side is a single base rel that is not the result relation.
//! - No column of `r` is needed outside the join's inputs, and no placeholder
//!   needed above the join has to be computed at `r`.
//! - `r` is provably distinct on the columns the join's mergejoinable
//!   equalities constrain (see `uniqueness`).
//!
//! Removing one join can make another one removable, so the rule removes one
//! join per application and relies on the registry's fixpoint loop.

use crate::relid_rewrite::{rewrite_all_rinfos, rewrite_eclasses, rewrite_planner_relids, rewrite_query_exprs, RelidChange};
use joinplan_core::config::PlannerConfig;
use joinplan_core::error::Result;
use joinplan_core::expr::pull_varnos;
use joinplan_core::initsplan::{distribute_restrictinfo_to_rels, rebuild_attr_needed, remove_join_clause_from_rels};
use joinplan_core::placeholder::remove_rel_from_placeholders;
use joinplan_core::planner_info::PlannerInfo;
use joinplan_core::query::JoinType;
use joinplan_core::relids::Index;
use joinplan_core::restrictinfo::{clause_sides_match_join, rinfo_is_pushed_down};
use joinplan_core::rule::Rule;
use joinplan_core::uniqueness::{rel_is_distinct_for, rel_supports_distinctness};
use tracing::{debug, trace};

/// Removes left joins whose nullable side contributes nothing to the result.
pub struct RemoveUselessLeftJoinsRule;

impl Rule for RemoveUselessLeftJoinsRule {
    fn name(&self) -> &str {
        "RemoveUselessLeftJoins"
    }

    fn enabled(&self, config: &PlannerConfig) -> bool {
        config.enable_left_join_removal
    }

    fn apply(&self, root: &mut PlannerInfo) -> Result<bool> {
        // one removal per application; the fixpoint loop rescans from the start
        for pos in 0..root.join_info_list.len() {
            if let Some(relid) = join_is_removable(root, pos) {
                remove_rel_from_query(root, pos, relid)?;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Range-table index of the nullable rel of special join `pos` if the join
/// can be removed.
pub fn join_is_removable(root: &PlannerInfo, pos: usize) -> Option<Index> {
    let sjinfo = root.join_info_list.get(pos)?;
    if sjinfo.jointype != JoinType::Left {
        return None;
    }
    let relid = sjinfo.min_righthand.singleton_member()?;
    if root.result_relation == Some(relid) {
        return None;
    }
    let inner = root.base_rel_id(relid)?;
    let rel = root.rel(inner);
    if !rel_supports_distinctness(rel) {
        return None;
    }

    let inputrelids = sjinfo.min_lefthand.union(&sjinfo.min_righthand);
    let joinrelids = inputrelids.with(sjinfo.ojrelid);

    if rel.attr_needed.iter().any(|needed| !needed.is_subset(&inputrelids)) {
        trace!(relid, "inner rel columns needed above the join");
        return None;
    }

    for phinfo in &root.placeholder_list {
        if phinfo.ph_lateral.overlaps(&rel.relids) {
            return None;
        }
        if phinfo.ph_needed.is_subset(&inputrelids) {
            continue;
        }
        if !phinfo.ph_eval_at.overlaps(&rel.relids) {
            continue;
        }
        if phinfo.ph_eval_at.is_subset(&rel.relids) {
            return None;
        }
        if pull_varnos(&phinfo.ph_var.phexpr).overlaps(&rel.relids) {
            return None;
        }
    }

    let mut clause_list = Vec::new();
    for id in &rel.joininfo {
        let rinfo = root.rinfo(*id);
        if rinfo_is_pushed_down(rinfo, &joinrelids) {
            if rinfo.clause_relids.contains(relid) {
                return None;
            }
            continue;
        }
        if !rinfo.can_join || rinfo.mergeopfamilies.is_empty() {
            continue;
        }
        if !clause_sides_match_join(rinfo, &sjinfo.min_lefthand, &rel.relids) {
            continue;
        }
        clause_list.push(*id);
    }

    rel_is_distinct_for(root, inner, &clause_list).map(|_| relid)
}

/// Takes rel `relid` and the outer join of special join `pos` out of every
/// planner structure.
pub fn remove_rel_from_query(root: &mut PlannerInfo, pos: usize, relid: Index) -> Result<()> {
    let sjinfo = root.join_info_list.remove(pos);
    let ojrelid = sjinfo.ojrelid;
    let inner = root.find_base_rel(relid)?;
    let joinrelids = sjinfo.min_lefthand.union(&sjinfo.min_righthand).with(ojrelid);
    let change = RelidChange::Remove { relid, ojrelid };

    // the join's own clauses disappear; filters from above it are refiled
    let joininfo = std::mem::take(&mut root.rel_mut(inner).joininfo);
    let mut refile = Vec::new();
    for id in joininfo {
        remove_join_clause_from_rels(root, id);
        let rinfo = root.rinfo(id);
        if rinfo_is_pushed_down(rinfo, &joinrelids) && !rinfo.clause_relids.contains(relid) {
            refile.push(id);
        }
    }

    root.simple_rel_array[relid] = None;
    rewrite_planner_relids(root, change);
    rewrite_all_rinfos(root, change, &|root, id| !root.rinfo(id).clause_relids.contains(relid));

    for id in refile {
        if root.rinfo(id).required_relids.is_empty() {
            continue;
        }
        distribute_restrictinfo_to_rels(root, id)?;
    }

    let rinfos = &root.rinfos;
    for ec in root.eq_classes.iter_mut() {
        ec.ec_sources.retain(|id| !rinfos[id.0].clause_relids.contains(relid));
        ec.ec_derives.retain(|id| !rinfos[id.0].clause_relids.contains(relid));
    }
    rewrite_eclasses(root, change, &|em| em.em_relids.contains(relid));

    remove_rel_from_placeholders(root, relid, ojrelid, &joinrelids);
    rewrite_query_exprs(root, change);
    rebuild_attr_needed(root);

    debug!(relid, ojrelid, remaining = %root.all_baserels, "removed useless left join");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_root, two_table_catalog};
    use joinplan_core::expr::{oids, Expr};
    use joinplan_core::query::{join_node, JoinTreeNode, Query};

    fn left_join_query(select_inner: bool) -> Query {
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 200);
        let oj = q.add_join_rte("oj");
        q.jointree = JoinTreeNode::From {
            items: vec![join_node(
                JoinType::Left,
                JoinTreeNode::Rel(a),
                JoinTreeNode::Rel(b),
                vec![Expr::op(oids::INT4EQ, Expr::int4_var(a, 1), Expr::int4_var(b, 1))],
                Some(oj),
            )],
            quals: Vec::new(),
        };
        q.add_target("x", Expr::int4_var(a, 2));
        if select_inner {
            q.add_target("y", Expr::int4_var(b, 2));
        }
        q
    }

    #[test]
    fn test_unused_unique_inner_is_removed() {
        let mut root = plan_root(left_join_query(false), two_table_catalog());
        assert_eq!(join_is_removable(&root, 0), Some(2));
        assert!(RemoveUselessLeftJoinsRule.apply(&mut root).unwrap());
        assert!(root.join_info_list.is_empty());
        assert_eq!(root.all_baserels.len(), 1);
        assert!(root.base_rel_id(2).is_none());
        let a = root.find_base_rel(1).unwrap();
        assert!(root.rel(a).joininfo.is_empty());
        assert!(!RemoveUselessLeftJoinsRule.apply(&mut root).unwrap());
    }

    #[test]
    fn test_inner_columns_in_output_block_removal() {
        let root = plan_root(left_join_query(true), two_table_catalog());
        assert_eq!(join_is_removable(&root, 0), None);
    }

    #[test]
    fn test_disabled_by_config() {
        let config = PlannerConfig {
            enable_left_join_removal: false,
            ..PlannerConfig::default()
        };
        assert!(!RemoveUselessLeftJoinsRule.enabled(&config));
    }
}
