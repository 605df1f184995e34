//! # Planner Entry Point
//!
//! [`plan_query`] runs the whole pipeline for one query:
//!
//! 1. bind `$n` parameters whose values the caller supplied;
//! 2. build base rels and their output columns, find placeholders and
//!    lateral references;
//! 3. distribute the join tree's quals and build equivalence classes;
//! 4. run the simplification rules to a fixpoint;
//! 5. finish placeholder and lateral bookkeeping, pull restriction ORs out
//!    of join clauses;
//! 6. build paths and search join orders;
//! 7. add a final sort if ORDER BY is not already satisfied, and emit the
//!    plan tree.
//!
//! All planner state lives in one [`PlannerInfo`] that is dropped when the
//! call returns; only the [`PlannedStmt`] escapes.

use crate::allpaths::make_one_rel;
use crate::catalog::Catalog;
use crate::config::PlannerConfig;
use crate::createplan::{create_plan, Plan};
use crate::equivalence::generate_base_implied_equalities;
use crate::error::Result;
use crate::expr::{expression_tree_mutator, Expr, Oid, ParamKind};
use crate::initsplan::{
    add_base_rels_to_query, build_base_rel_tlists, create_lateral_join_info, deconstruct_jointree,
    find_lateral_references,
};
use crate::orclauses::extract_restriction_or_clauses;
use crate::pathkeys::{make_pathkeys_for_sortclauses, pathkeys_contained_in};
use crate::pathnode::create_sort_path;
use crate::placeholder::{add_placeholders_to_base_rels, find_placeholders_in_query, fix_placeholder_input_needed_levels};
use crate::planner_info::{CancelHandle, PathId, PlannerInfo, RelId};
use crate::query::{BoundParams, JoinTreeNode, Query, RowMark, TargetEntry};
use crate::relids::Index;
use crate::rule::RuleRegistry;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Output of the planner: the plan tree plus what the executor needs to run it.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedStmt {
    pub plan: Plan,
    pub target_list: Vec<TargetEntry>,
    /// Result type of each `PARAM_EXEC` slot referenced by the plan.
    pub param_exec_types: Vec<Oid>,
    pub result_relation: Option<Index>,
    pub row_marks: Vec<RowMark>,
}

/// Plans `query` with the given parameter values, catalog, configuration and
/// simplification rules.
pub fn plan_query(
    query: Query,
    params: &BoundParams,
    catalog: Arc<dyn Catalog>,
    config: PlannerConfig,
    rules: &RuleRegistry,
) -> Result<PlannedStmt> {
    plan_query_with_cancel(query, params, catalog, config, rules, CancelHandle::new())
}

/// Like [`plan_query`], polling `cancel` during long loops.
pub fn plan_query_with_cancel(
    mut query: Query,
    params: &BoundParams,
    catalog: Arc<dyn Catalog>,
    config: PlannerConfig,
    rules: &RuleRegistry,
    cancel: CancelHandle,
) -> Result<PlannedStmt> {
    config.validate()?;
    bind_extern_params(&mut query, params);
    debug!(
        rtable = query.rtable.len(),
        quals = count_quals(&query.jointree),
        rules = rules.len(),
        "planning query"
    );

    let mut root = PlannerInfo::new(query, catalog, config).with_cancel(cancel);
    let top = query_planner(&mut root, rules)?;
    let best = final_path(&mut root, top)?;
    let plan = create_plan(&mut root, best)?;
    debug!(cost = plan.total_cost, rows = plan.rows, "planning done");

    Ok(PlannedStmt {
        plan,
        target_list: root.processed_tlist,
        param_exec_types: root.glob.param_exec_types,
        result_relation: root.result_relation,
        row_marks: root.row_marks,
    })
}

/// Builds the rel holding the whole join tree, with its paths.
pub fn query_planner(root: &mut PlannerInfo, rules: &RuleRegistry) -> Result<RelId> {
    deconstruct_query(root)?;
    rules.apply_to_fixpoint(root)?;

    add_placeholders_to_base_rels(root);
    create_lateral_join_info(root);
    extract_restriction_or_clauses(root);
    make_one_rel(root)
}

/// Builds the base rels, distributes the quals and forms equivalence
/// classes: everything the simplification rules inspect.
pub fn deconstruct_query(root: &mut PlannerInfo) -> Result<()> {
    add_base_rels_to_query(root)?;
    build_base_rel_tlists(root);
    find_placeholders_in_query(root);
    find_lateral_references(root);
    deconstruct_jointree(root)?;
    root.all_result_relids = root.all_query_rels.clone();
    generate_base_implied_equalities(root)?;
    let sort_clause = root.sort_clause.clone();
    root.query_pathkeys = make_pathkeys_for_sortclauses(root, &sort_clause);
    fix_placeholder_input_needed_levels(root);
    Ok(())
}

/// Cheapest path of `top` that delivers the requested ordering: either an
/// already-sorted path or an explicit sort over the cheapest one.
fn final_path(root: &mut PlannerInfo, top: RelId) -> Result<PathId> {
    let cheapest = root.cheapest_total(top)?;
    let wanted = root.query_pathkeys.clone();
    if wanted.is_empty() || pathkeys_contained_in(&wanted, &root.path(cheapest).pathkeys) {
        return Ok(cheapest);
    }

    let sorted = root
        .rel(top)
        .pathlist
        .iter()
        .copied()
        .filter(|id| !root.path(*id).is_parameterized() && pathkeys_contained_in(&wanted, &root.path(*id).pathkeys))
        .min_by(|a, b| root.path(*a).total_cost.total_cmp(&root.path(*b).total_cost));
    let sort = create_sort_path(root, top, cheapest, wanted);
    match sorted {
        Some(presorted) if root.path(presorted).total_cost <= sort.total_cost => Ok(presorted),
        _ => Ok(root.alloc_path(sort)),
    }
}

/// Replaces `$n` params with the caller's constants. Params without a value
/// stay in place and are evaluated at run time.
fn bind_extern_params(query: &mut Query, params: &BoundParams) {
    if params.values.is_empty() {
        return;
    }
    let mut bind = |node: Expr| match &node {
        Expr::Param(p) if p.kind == ParamKind::Extern => match params.get(p.id) {
            Some((value, consttype)) => Expr::Const {
                value: value.clone(),
                consttype: *consttype,
            },
            None => node,
        },
        _ => node,
    };
    bind_in_jointree(&mut query.jointree, &mut bind);
    for tle in &mut query.target_list {
        let expr = std::mem::replace(&mut tle.expr, Expr::bool_const(true));
        tle.expr = expression_tree_mutator(expr, &mut bind);
    }
    if let Some(having) = query.having_qual.take() {
        query.having_qual = Some(expression_tree_mutator(having, &mut bind));
    }
}

fn bind_in_jointree(node: &mut JoinTreeNode, bind: &mut dyn FnMut(Expr) -> Expr) {
    let quals = match node {
        JoinTreeNode::Rel(_) => return,
        JoinTreeNode::Join { larg, rarg, quals, .. } => {
            bind_in_jointree(larg, bind);
            bind_in_jointree(rarg, bind);
            quals
        }
        JoinTreeNode::From { items, quals } => {
            for item in items.iter_mut() {
                bind_in_jointree(item, bind);
            }
            quals
        }
    };
    for qual in quals.iter_mut() {
        let expr = std::mem::replace(qual, Expr::bool_const(true));
        *qual = expression_tree_mutator(expr, bind);
    }
}

fn count_quals(node: &JoinTreeNode) -> usize {
    match node {
        JoinTreeNode::Rel(_) => 0,
        JoinTreeNode::Join { larg, rarg, quals, .. } => quals.len() + count_quals(larg) + count_quals(rarg),
        JoinTreeNode::From { items, quals } => quals.len() + items.iter().map(count_quals).sum::<usize>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalog, RelationInfo};
    use crate::createplan::PlanNode;
    use crate::error::PlanError;
    use crate::expr::{oids, Param, ScalarValue};
    use crate::query::SortClause;

    fn one_table(quals: Vec<Expr>) -> (Query, InMemoryCatalog) {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(100, RelationInfo::new(1000.0, 2));
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        q.jointree = JoinTreeNode::From {
            items: vec![JoinTreeNode::Rel(a)],
            quals,
        };
        q.add_target("x", Expr::int4_var(a, 1));
        (q, catalog)
    }

    #[test]
    fn test_extern_params_are_bound() {
        let param = Expr::Param(Param {
            kind: ParamKind::Extern,
            id: 1,
            paramtype: oids::INT4OID,
        });
        let (q, catalog) = one_table(vec![Expr::op(oids::INT4EQ, Expr::int4_var(1, 1), param)]);
        let params = BoundParams {
            values: vec![(ScalarValue::Int64(7), oids::INT4OID)],
        };
        let stmt = plan_query(q, &params, Arc::new(catalog), PlannerConfig::default(), &RuleRegistry::new()).unwrap();
        let text = stmt.plan.to_string();
        assert!(text.contains("1.1 = 7"), "{text}");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (q, catalog) = one_table(Vec::new());
        let config = PlannerConfig {
            q: 0.0,
            ..PlannerConfig::default()
        };
        let err = plan_query(q, &BoundParams::none(), Arc::new(catalog), config, &RuleRegistry::new()).unwrap_err();
        assert!(matches!(err, PlanError::InvalidConfig(_)));
    }

    #[test]
    fn test_order_by_adds_sort() {
        let (mut q, catalog) = one_table(Vec::new());
        q.sort_clause.push(SortClause {
            expr: Expr::int4_var(1, 2),
            sortop: oids::INT4LT,
            nulls_first: false,
        });
        let stmt = plan_query(q, &BoundParams::none(), Arc::new(catalog), PlannerConfig::default(), &RuleRegistry::new())
            .unwrap();
        assert!(matches!(&stmt.plan.node, PlanNode::Sort { keys } if keys.len() == 1));
        assert_eq!(stmt.plan.children[0].name(), "SeqScan");
    }

    #[test]
    fn test_cancelled_planning_returns_error() {
        let (q, catalog) = one_table(Vec::new());
        let cancel = CancelHandle::new();
        cancel.cancel();
        let err = plan_query_with_cancel(
            q,
            &BoundParams::none(),
            Arc::new(catalog),
            PlannerConfig::default(),
            &RuleRegistry::new(),
            cancel,
        )
        .unwrap_err();
        assert_eq!(err, PlanError::Cancelled);
    }
}
