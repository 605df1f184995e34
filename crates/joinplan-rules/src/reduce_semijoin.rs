//! # Unique-Semijoin Reduction
//!
//! A semijoin `L ⋉ r` returns each row of `L` at most once. When `r` is
//! provably unique for the join clauses, an inner join produces exactly the
//! same rows, and an inner join can be reordered freely and executed by any
//! join method. The reduction simply forgets the semijoin's
//! [`SpecialJoinInfo`](joinplan_core::relation::SpecialJoinInfo); the quals
//! were already distributed as ordinary inner-join quals.
//!
//! One semijoin is reduced per application; the registry's fixpoint loop
//! rescans the list from the start until nothing more changes.

use joinplan_core::config::PlannerConfig;
use joinplan_core::equivalence::generate_join_implied_equalities;
use joinplan_core::error::Result;
use joinplan_core::planner_info::PlannerInfo;
use joinplan_core::query::JoinType;
use joinplan_core::restrictinfo::join_clause_is_movable_into;
use joinplan_core::rule::Rule;
use joinplan_core::uniqueness::{innerrel_is_unique, rel_supports_distinctness};
use tracing::debug;

/// Turns semijoins against a unique single rel into inner joins.
pub struct ReduceUniqueSemijoinsRule;

impl Rule for ReduceUniqueSemijoinsRule {
    fn name(&self) -> &str {
        "ReduceUniqueSemijoins"
    }

    fn enabled(&self, config: &PlannerConfig) -> bool {
        config.enable_semijoin_reduction
    }

    fn apply(&self, root: &mut PlannerInfo) -> Result<bool> {
        // removing an entry shifts the list, so stop and let the fixpoint rescan
        for pos in 0..root.join_info_list.len() {
            if semijoin_is_reducible(root, pos) {
                let sjinfo = root.join_info_list.remove(pos);
                debug!(
                    lhs = %sjinfo.min_lefthand,
                    rhs = %sjinfo.min_righthand,
                    "reduced unique semijoin to inner join"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Is special join `pos` a semijoin whose inner side is a single base rel
/// unique for the join clauses?
pub fn semijoin_is_reducible(root: &mut PlannerInfo, pos: usize) -> bool {
    let Some(sjinfo) = root.join_info_list.get(pos).cloned() else {
        return false;
    };
    if sjinfo.jointype != JoinType::Semi {
        return false;
    }
    let Some(relid) = sjinfo.min_righthand.singleton_member() else {
        return false;
    };
    let Some(inner) = root.base_rel_id(relid) else {
        return false;
    };
    if !rel_supports_distinctness(root.rel(inner)) {
        return false;
    }

    let joinrelids = sjinfo.min_lefthand.union(&sjinfo.min_righthand);
    let mut restrictlist =
        generate_join_implied_equalities(root, &joinrelids, &sjinfo.min_lefthand, &sjinfo.min_righthand);
    let inner_relids = root.rel(inner).relids.clone();
    restrictlist.extend(
        root.rel(inner)
            .joininfo
            .iter()
            .copied()
            .filter(|id| join_clause_is_movable_into(root.rinfo(*id), &inner_relids, &joinrelids)),
    );

    innerrel_is_unique(
        root,
        &joinrelids,
        &sjinfo.min_lefthand,
        inner,
        JoinType::Semi,
        &restrictlist,
        true,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{plan_root, semijoin_catalog, semijoin_query};
    use joinplan_core::expr::{oids, Expr};
    use joinplan_core::query::{join_node, JoinTreeNode, Query};
    use joinplan_core::rule::RuleRegistry;

    #[test]
    fn test_unique_semijoin_is_reduced() {
        let mut root = plan_root(semijoin_query(), semijoin_catalog(true));
        assert_eq!(root.join_info_list.len(), 1);
        assert!(ReduceUniqueSemijoinsRule.apply(&mut root).unwrap());
        assert!(root.join_info_list.is_empty());
        assert!(!ReduceUniqueSemijoinsRule.apply(&mut root).unwrap());
    }

    #[test]
    fn test_non_unique_inner_keeps_semijoin() {
        let mut root = plan_root(semijoin_query(), semijoin_catalog(false));
        assert!(!ReduceUniqueSemijoinsRule.apply(&mut root).unwrap());
        assert_eq!(root.join_info_list[0].jointype, JoinType::Semi);
    }

    #[test]
    fn test_fixpoint_reduces_stacked_semijoins() {
        // orders o WHERE o.customer_id IN (customers c1) AND o.customer_id IN (customers c2)
        let mut q = Query::new();
        let o = q.add_relation("orders", 300);
        let c1 = q.add_relation("c1", 400);
        let c2 = q.add_relation("c2", 400);
        let inner = join_node(
            JoinType::Semi,
            JoinTreeNode::Rel(o),
            JoinTreeNode::Rel(c1),
            vec![Expr::op(oids::INT4EQ, Expr::int4_var(o, 2), Expr::int4_var(c1, 1))],
            None,
        );
        q.jointree = JoinTreeNode::From {
            items: vec![join_node(
                JoinType::Semi,
                inner,
                JoinTreeNode::Rel(c2),
                vec![Expr::op(oids::INT4EQ, Expr::int4_var(o, 2), Expr::int4_var(c2, 1))],
                None,
            )],
            quals: Vec::new(),
        };
        q.add_target("id", Expr::int4_var(o, 1));

        let mut root = plan_root(q, semijoin_catalog(true));
        assert_eq!(root.join_info_list.len(), 2);
        let mut rules = RuleRegistry::new();
        rules.add_rule(Box::new(ReduceUniqueSemijoinsRule));
        assert_eq!(rules.apply_to_fixpoint(&mut root).unwrap(), 2);
        assert!(root.join_info_list.is_empty());
    }
}
