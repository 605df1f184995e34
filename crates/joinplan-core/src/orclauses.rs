//! # OR-clause restriction pull-up
//!
//! A join clause such as `(a.x = 1 AND b.y = 2) OR (a.x = 3 AND b.z = 4)`
//! cannot be used until both rels are joined, but it implies the single-rel
//! condition `a.x = 1 OR a.x = 3`. Adding that implied condition to `a`'s
//! restrictions lets the scan of `a` discard rows early.
//!
//! The implied clause is redundant with the original, so the original
//! clause's cached inner-join selectivity is divided by the implied clause's
//! selectivity to keep the join size estimate unchanged. Its outer-join
//! selectivity is left as is.

use tracing::trace;

use crate::expr::{make_ands_explicit, make_orclause, Expr};
use crate::planner_info::{PlannerInfo, RelId, RinfoId};
use crate::query::JoinType;
use crate::restrictinfo::{
    join_clause_is_movable_to, make_restrictinfo, restriction_is_securely_promotable, RestrictInfo,
    RinfoOptions,
};
use crate::selectivity::clause_selectivity;

/// Adds to each base rel the single-rel OR clauses implied by its join
/// clauses.
pub fn extract_restriction_or_clauses(root: &mut PlannerInfo) {
    if !root.config.enable_or_pullup {
        return;
    }
    for rel_id in root.base_rel_ids() {
        let candidates: Vec<RinfoId> = {
            let rel = root.rel(rel_id);
            rel.joininfo
                .iter()
                .copied()
                .filter(|id| {
                    let rinfo = root.rinfo(*id);
                    rinfo.is_or_clause() && join_clause_is_movable_to(rinfo, rel)
                })
                .collect()
        };
        for join_or in candidates {
            if let Some(orclause) = extract_or_clause(root, join_or, rel_id) {
                consider_new_or_clause(root, rel_id, orclause, join_or);
            }
        }
    }
}

/// The OR of, for every arm, the AND of the arm's conditions that mention
/// only `rel`. `None` if some arm has no such condition.
fn extract_or_clause(root: &PlannerInfo, join_or: RinfoId, rel_id: RelId) -> Option<Expr> {
    let rel = root.rel(rel_id);
    let arms = root.rinfo(join_or).orclause.as_ref()?;
    let mut clauses = Vec::with_capacity(arms.len());
    for arm in arms {
        let subclauses: Vec<Expr> = arm
            .iter()
            .filter(|sub| is_safe_restriction_clause_for(sub, rel))
            .map(|sub| sub.clause.clone())
            .collect();
        if subclauses.is_empty() {
            return None;
        }
        clauses.push(make_ands_explicit(subclauses));
    }
    Some(make_orclause(clauses))
}

fn is_safe_restriction_clause_for(rinfo: &RestrictInfo, rel: &crate::relation::RelOptInfo) -> bool {
    if rinfo.pseudoconstant || rinfo.clause_relids != rel.relids {
        return false;
    }
    if rinfo.has_volatile() {
        return false;
    }
    restriction_is_securely_promotable(rinfo, rel)
}

fn consider_new_or_clause(root: &mut PlannerInfo, rel_id: RelId, orclause: Expr, join_or: RinfoId) {
    let security_level = root.rinfo(join_or).security_level;
    let or_rinfo = make_restrictinfo(
        root,
        orclause,
        RinfoOptions {
            is_pushed_down: true,
            security_level,
            ..Default::default()
        },
    );
    let or_selec = clause_selectivity(root, &or_rinfo, 0, JoinType::Inner, None);
    let max_selectivity = root.config.or_pullup_max_selectivity;
    if or_selec > max_selectivity {
        trace!(
            rel = %root.rel(rel_id).relids,
            clause = %or_rinfo.clause,
            selectivity = or_selec,
            "implied OR restriction too weak, skipped"
        );
        return;
    }
    trace!(
        rel = %root.rel(rel_id).relids,
        clause = %or_rinfo.clause,
        selectivity = or_selec,
        "adding implied OR restriction"
    );

    let id = root.add_rinfo(or_rinfo);
    let rel = root.rel_mut(rel_id);
    rel.baserestrictinfo.push(id);
    rel.baserestrict_min_security = rel.baserestrict_min_security.min(security_level);

    let orig_selec = clause_selectivity(root, root.rinfo(join_or), 0, JoinType::Inner, None);
    let compensated = if or_selec > 0.0 {
        (orig_selec / or_selec).min(1.0)
    } else {
        1.0
    };
    root.rinfo(join_or).norm_selec.set(Some(compensated));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalog, RelationInfo};
    use crate::config::PlannerConfig;
    use crate::expr::{oids, ScalarValue};
    use crate::initsplan::{add_base_rels_to_query, build_base_rel_tlists, deconstruct_jointree};
    use crate::query::{JoinTreeNode, Query};
    use crate::stats::ColumnStatistics;
    use std::sync::Arc;

    fn eq(l: Expr, r: Expr) -> Expr {
        Expr::op(oids::INT4EQ, l, r)
    }

    fn setup(catalog: InMemoryCatalog) -> PlannerInfo {
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 200);
        let arm = |ax: i64, bcol: i32, bval: i64| {
            Expr::And(vec![
                eq(Expr::int4_var(a, 1), Expr::int4(ax)),
                eq(Expr::int4_var(b, bcol), Expr::int4(bval)),
            ])
        };
        q.jointree = JoinTreeNode::From {
            items: vec![JoinTreeNode::Rel(a), JoinTreeNode::Rel(b)],
            quals: vec![Expr::Or(vec![arm(42, 1, 43), arm(44, 2, 45)])],
        };
        q.add_target("x", Expr::int4_var(a, 1));
        let mut root = PlannerInfo::new(q, Arc::new(catalog), PlannerConfig::default());
        add_base_rels_to_query(&mut root).unwrap();
        build_base_rel_tlists(&mut root);
        deconstruct_jointree(&mut root).unwrap();
        root
    }

    fn restriction_text(root: &PlannerInfo, relid: usize) -> Vec<String> {
        let rel = root.base_rel_id(relid).unwrap();
        root.restrictions(rel).map(|ri| ri.clause.to_string()).collect()
    }

    #[test]
    fn test_selective_or_is_pulled_up_and_join_estimate_preserved() {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(100, RelationInfo::new(1000.0, 1).with_column_stats(1, ColumnStatistics::new(100.0, 0.0)));
        catalog.add_relation(
            200,
            RelationInfo::new(2000.0, 2)
                .with_column_stats(1, ColumnStatistics::new(10.0, 0.0))
                .with_column_stats(2, ColumnStatistics::new(20.0, 0.0)),
        );
        let mut root = setup(catalog);
        let join_or = root.rel(root.base_rel_id(1).unwrap()).joininfo[0];
        let original = clause_selectivity(&root, root.rinfo(join_or), 0, JoinType::Inner, None);
        root.rinfo(join_or).norm_selec.set(None);

        extract_restriction_or_clauses(&mut root);

        assert_eq!(restriction_text(&root, 1).len(), 1);
        assert_eq!(restriction_text(&root, 2).len(), 1);
        let a_sel = 0.02;
        let b_sel = 0.1 + 0.05 - 0.1 * 0.05;
        let compensated = root.rinfo(join_or).norm_selec.get().unwrap();
        assert!((compensated * a_sel * b_sel - original).abs() < 1e-12);
        assert_eq!(root.rinfo(join_or).outer_selec.get(), None);
    }

    #[test]
    fn test_weak_or_is_not_pulled_up() {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(
            100,
            RelationInfo::new(1000.0, 1).with_column_stats(
                1,
                ColumnStatistics::new(100.0, 0.0)
                    .with_mcv(ScalarValue::Int64(42), 0.5)
                    .with_mcv(ScalarValue::Int64(44), 0.45),
            ),
        );
        catalog.add_relation(
            200,
            RelationInfo::new(2000.0, 2)
                .with_column_stats(1, ColumnStatistics::new(10.0, 0.0).with_mcv(ScalarValue::Int64(43), 0.9))
                .with_column_stats(2, ColumnStatistics::new(20.0, 0.0).with_mcv(ScalarValue::Int64(45), 0.5)),
        );
        let mut root = setup(catalog);
        extract_restriction_or_clauses(&mut root);
        assert!(restriction_text(&root, 1).is_empty());
        assert!(restriction_text(&root, 2).is_empty());
    }

    #[test]
    fn test_disabled_pullup_does_nothing() {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(100, RelationInfo::new(1000.0, 1));
        catalog.add_relation(200, RelationInfo::new(2000.0, 2));
        let mut root = setup(catalog);
        root.config.enable_or_pullup = false;
        extract_restriction_or_clauses(&mut root);
        assert!(restriction_text(&root, 1).is_empty());
    }
}
