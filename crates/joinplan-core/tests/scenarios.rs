//! End-to-end planning scenarios.
//!
//! Each test builds a small catalog and an analyzed query, runs the planner
//! with the default simplification rules and checks the shape of the result:
//!
//! - A: a left join against an unused unique rel disappears.
//! - B: a self-join on the primary key collapses into one filtered scan.
//! - C: a semijoin against a unique rel becomes an inner join.
//! - D, E: restriction ORs are pulled out of a join OR only when selective.
//! - F: a small outer side drives index scans on a large inner side through a
//!   parameterized nestloop.

use joinplan_core::catalog::{InMemoryCatalog, IndexInfo, RelationInfo};
use joinplan_core::config::PlannerConfig;
use joinplan_core::createplan::{Plan, PlanNode};
use joinplan_core::expr::{oids, AttrNumber, Expr, Oid, ScalarValue};
use joinplan_core::orclauses::extract_restriction_or_clauses;
use joinplan_core::planner::{deconstruct_query, query_planner};
use joinplan_core::planner_info::PlannerInfo;
use joinplan_core::query::{join_node, BoundParams, JoinTreeNode, JoinType, Query};
use joinplan_core::relids;
use joinplan_core::rule::RuleRegistry;
use joinplan_core::stats::ColumnStatistics;
use joinplan_core::{plan_query, PlannedStmt};
use joinplan_rules::default_rule_registry;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn eq(l: Expr, r: Expr) -> Expr {
    Expr::op(oids::INT4EQ, l, r)
}

fn keyed(tuples: f64, ncols: AttrNumber, indexoid: Oid) -> RelationInfo {
    RelationInfo::new(tuples, ncols).with_index(IndexInfo::unique_btree(indexoid, vec![1], tuples))
}

/// Routes planner events to the test output; `RUST_LOG=joinplan_core=debug`
/// shows the simplification and search decisions.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn plan(query: Query, catalog: InMemoryCatalog) -> PlannedStmt {
    init_tracing();
    plan_query(
        query,
        &BoundParams::none(),
        Arc::new(catalog),
        PlannerConfig::default(),
        &default_rule_registry(),
    )
    .unwrap()
}

fn is_join(plan: &Plan) -> bool {
    matches!(
        plan.node,
        PlanNode::NestLoop { .. } | PlanNode::MergeJoin { .. } | PlanNode::HashJoin { .. }
    )
}

fn join_type(plan: &Plan) -> Option<JoinType> {
    match &plan.node {
        PlanNode::NestLoop { jointype, .. }
        | PlanNode::MergeJoin { jointype, .. }
        | PlanNode::HashJoin { jointype, .. } => Some(*jointype),
        _ => None,
    }
}

fn scanned_rels(plan: &Plan) -> Vec<usize> {
    plan.iter()
        .filter_map(|node| match &node.node {
            PlanNode::SeqScan { scanrelid, .. }
            | PlanNode::IndexScan { scanrelid, .. }
            | PlanNode::SubqueryScan { scanrelid, .. } => Some(*scanrelid),
            _ => None,
        })
        .collect()
}

/// Every qual text evaluated anywhere in the tree, index conditions included.
fn all_quals(plan: &Plan) -> Vec<String> {
    let mut out = Vec::new();
    for node in plan.iter() {
        out.extend(node.qual.iter().map(|e| e.to_string()));
        if let PlanNode::IndexScan { indexqual, .. } = &node.node {
            out.extend(indexqual.iter().map(|e| e.to_string()));
        }
    }
    out
}

fn restriction_text(root: &PlannerInfo, relid: usize) -> Vec<String> {
    let rel = root.base_rel_id(relid).unwrap();
    root.restrictions(rel).map(|ri| ri.clause.to_string()).collect()
}

// ---------------------------------------------------------------------------
// A: useless left-join removal
// ---------------------------------------------------------------------------

#[test]
fn test_scenario_a_useless_left_join_is_removed() {
    let mut catalog = InMemoryCatalog::new();
    catalog.add_relation(100, keyed(1000.0, 2, 101));
    catalog.add_relation(200, keyed(1000.0, 2, 201));

    let mut q = Query::new();
    let a = q.add_relation("a", 100);
    let b = q.add_relation("b", 200);
    let oj = q.add_join_rte("a_b");
    q.jointree = JoinTreeNode::From {
        items: vec![join_node(
            JoinType::Left,
            JoinTreeNode::Rel(a),
            JoinTreeNode::Rel(b),
            vec![eq(Expr::int4_var(a, 1), Expr::int4_var(b, 1))],
            Some(oj),
        )],
        quals: Vec::new(),
    };
    q.add_target("x", Expr::int4_var(a, 2));

    let stmt = plan(q, catalog);
    assert!(!stmt.plan.iter().any(is_join), "{}", stmt.plan);
    assert_eq!(scanned_rels(&stmt.plan), vec![a]);
    assert!(all_quals(&stmt.plan).is_empty());
}

#[test]
fn test_scenario_a_kept_when_inner_column_is_selected() {
    let mut catalog = InMemoryCatalog::new();
    catalog.add_relation(100, keyed(1000.0, 2, 101));
    catalog.add_relation(200, keyed(1000.0, 2, 201));

    let mut q = Query::new();
    let a = q.add_relation("a", 100);
    let b = q.add_relation("b", 200);
    let oj = q.add_join_rte("a_b");
    q.jointree = JoinTreeNode::From {
        items: vec![join_node(
            JoinType::Left,
            JoinTreeNode::Rel(a),
            JoinTreeNode::Rel(b),
            vec![eq(Expr::int4_var(a, 1), Expr::int4_var(b, 1))],
            Some(oj),
        )],
        quals: Vec::new(),
    };
    q.add_target("y", Expr::int4_var(b, 2));

    let stmt = plan(q, catalog);
    let joins: Vec<JoinType> = stmt.plan.iter().filter_map(join_type).collect();
    assert_eq!(joins.len(), 1, "{}", stmt.plan);
    assert!(matches!(joins[0], JoinType::Left | JoinType::Right));
}

// ---------------------------------------------------------------------------
// B: self-join elimination
// ---------------------------------------------------------------------------

#[test]
fn test_scenario_b_self_join_collapses_to_one_scan() {
    let mut catalog = InMemoryCatalog::new();
    catalog.add_relation(500, keyed(1000.0, 2, 501));

    let mut q = Query::new();
    let t1 = q.add_relation("t1", 500);
    let t2 = q.add_relation("t2", 500);
    q.jointree = JoinTreeNode::From {
        items: vec![JoinTreeNode::Rel(t1), JoinTreeNode::Rel(t2)],
        quals: vec![
            eq(Expr::int4_var(t1, 1), Expr::int4_var(t2, 1)),
            Expr::op(oids::INT4GT, Expr::int4_var(t1, 2), Expr::int4(0)),
        ],
    };
    q.add_target("v", Expr::int4_var(t1, 2));

    let stmt = plan(q, catalog);
    assert!(!stmt.plan.iter().any(is_join), "{}", stmt.plan);
    assert_eq!(scanned_rels(&stmt.plan), vec![t1]);
    let mut quals = all_quals(&stmt.plan);
    quals.sort();
    assert_eq!(quals, vec!["1.1 IS NOT NULL".to_string(), "1.2 > 0".to_string()]);
    assert_eq!(stmt.target_list[0].expr, Expr::int4_var(t1, 2));
}

#[test]
fn test_scenario_b_disabled_keeps_join() {
    let mut catalog = InMemoryCatalog::new();
    catalog.add_relation(500, keyed(1000.0, 2, 501));

    let mut q = Query::new();
    let t1 = q.add_relation("t1", 500);
    let t2 = q.add_relation("t2", 500);
    q.jointree = JoinTreeNode::From {
        items: vec![JoinTreeNode::Rel(t1), JoinTreeNode::Rel(t2)],
        quals: vec![eq(Expr::int4_var(t1, 1), Expr::int4_var(t2, 1))],
    };
    q.add_target("v", Expr::int4_var(t2, 2));

    let config = PlannerConfig {
        enable_self_join_elimination: false,
        ..PlannerConfig::default()
    };
    let stmt = plan_query(q, &BoundParams::none(), Arc::new(catalog), config, &default_rule_registry()).unwrap();
    assert_eq!(stmt.plan.iter().filter(|p| is_join(p)).count(), 1);
    let mut rels = scanned_rels(&stmt.plan);
    rels.sort();
    assert_eq!(rels, vec![t1, t2]);
}

// ---------------------------------------------------------------------------
// C: semijoin to inner join
// ---------------------------------------------------------------------------

#[test]
fn test_scenario_c_unique_semijoin_becomes_inner_join() {
    let mut catalog = InMemoryCatalog::new();
    catalog.add_relation(300, RelationInfo::new(10_000.0, 2));
    catalog.add_relation(400, keyed(500.0, 1, 401));

    let mut q = Query::new();
    let o = q.add_relation("orders", 300);
    let c = q.add_relation("customers", 400);
    q.jointree = JoinTreeNode::From {
        items: vec![join_node(
            JoinType::Semi,
            JoinTreeNode::Rel(o),
            JoinTreeNode::Rel(c),
            vec![eq(Expr::int4_var(o, 2), Expr::int4_var(c, 1))],
            None,
        )],
        quals: Vec::new(),
    };
    q.add_target("id", Expr::int4_var(o, 1));
    q.add_target("customer_id", Expr::int4_var(o, 2));

    let stmt = plan(q, catalog);
    let joins: Vec<JoinType> = stmt.plan.iter().filter_map(join_type).collect();
    assert_eq!(joins, vec![JoinType::Inner], "{}", stmt.plan);
}

// ---------------------------------------------------------------------------
// D, E: OR-clause restriction pull-up
// ---------------------------------------------------------------------------

/// `SELECT a.x FROM a, b WHERE (a.x = 42 AND b.y = 43) OR (a.x = 44 AND b.z = 45)`.
fn or_join_query() -> Query {
    let mut q = Query::new();
    let a = q.add_relation("a", 100);
    let b = q.add_relation("b", 200);
    let arm = |ax: i64, bcol: AttrNumber, bval: i64| {
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
    q
}

fn or_join_root(catalog: InMemoryCatalog) -> PlannerInfo {
    let mut root = PlannerInfo::new(or_join_query(), Arc::new(catalog), PlannerConfig::default());
    deconstruct_query(&mut root).unwrap();
    root
}

/// Uniform statistics under which both pulled-up ORs are selective.
fn selective_or_catalog() -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    catalog.add_relation(100, RelationInfo::new(1000.0, 1).with_column_stats(1, ColumnStatistics::new(100.0, 0.0)));
    catalog.add_relation(
        200,
        RelationInfo::new(2000.0, 2)
            .with_column_stats(1, ColumnStatistics::new(10.0, 0.0))
            .with_column_stats(2, ColumnStatistics::new(20.0, 0.0)),
    );
    catalog
}

/// Runs the planner through the join search and returns the join rel's rows.
fn or_join_rows(enable_or_pullup: bool) -> f64 {
    let config = PlannerConfig {
        enable_or_pullup,
        ..PlannerConfig::default()
    };
    let mut root = PlannerInfo::new(or_join_query(), Arc::new(selective_or_catalog()), config);
    let top = query_planner(&mut root, &RuleRegistry::new()).unwrap();
    assert_eq!(root.rel(top).relids, relids![1, 2]);
    root.rel(top).rows
}

#[test]
fn test_scenario_d_selective_or_is_pulled_up() {
    let mut root = or_join_root(selective_or_catalog());
    let join_or = root.rel(root.base_rel_id(1).unwrap()).joininfo[0];
    let before = root.rinfo(join_or).clause.clone();

    extract_restriction_or_clauses(&mut root);

    assert_eq!(restriction_text(&root, 1), vec!["(1.1 = 42 OR 1.1 = 44)".to_string()]);
    assert_eq!(restriction_text(&root, 2), vec!["(2.1 = 43 OR 2.2 = 45)".to_string()]);
    assert_eq!(root.rinfo(join_or).clause, before);
    let compensated = root.rinfo(join_or).norm_selec.get().unwrap();
    assert!(compensated > 0.0 && compensated <= 1.0);
}

#[test]
fn test_scenario_d_join_rows_unchanged_by_pull_up() {
    let with_pullup = or_join_rows(true);
    let without = or_join_rows(false);
    assert!(without > 1.0);
    assert!(
        ((with_pullup - without) / without).abs() < 1e-9,
        "with pull-up {with_pullup}, without {without}"
    );
}

#[test]
fn test_scenario_e_weak_or_is_rejected() {
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
    let mut root = or_join_root(catalog);
    let join_or = root.rel(root.base_rel_id(1).unwrap()).joininfo[0];
    let cached = root.rinfo(join_or).norm_selec.get();

    extract_restriction_or_clauses(&mut root);

    assert!(restriction_text(&root, 1).is_empty());
    assert!(restriction_text(&root, 2).is_empty());
    assert_eq!(root.rinfo(join_or).norm_selec.get(), cached);
}

// ---------------------------------------------------------------------------
// F: parameterized nestloop
// ---------------------------------------------------------------------------

#[test]
fn test_scenario_f_small_outer_drives_index_scan() {
    let mut catalog = InMemoryCatalog::new();
    catalog.add_relation(
        600,
        RelationInfo::new(1_000_000.0, 2).with_column_stats(2, ColumnStatistics::new(100_000.0, 0.0)),
    );
    catalog.add_relation(700, keyed(10_000_000.0, 2, 701));

    let mut q = Query::new();
    let outer = q.add_relation("outer_rel", 600);
    let inner = q.add_relation("inner_rel", 700);
    q.jointree = JoinTreeNode::From {
        items: vec![JoinTreeNode::Rel(outer), JoinTreeNode::Rel(inner)],
        quals: vec![
            eq(Expr::int4_var(outer, 1), Expr::int4_var(inner, 1)),
            eq(Expr::int4_var(outer, 2), Expr::int4(7)),
        ],
    };
    q.add_target("x", Expr::int4_var(outer, 1));
    q.add_target("y", Expr::int4_var(inner, 2));

    let stmt = plan(q, catalog);
    let top = &stmt.plan;
    match &top.node {
        PlanNode::NestLoop {
            jointype, nest_params, ..
        } => {
            assert_eq!(*jointype, JoinType::Inner);
            assert!(!nest_params.is_empty(), "{top}");
        }
        other => panic!("expected a nestloop, got {other:?}\n{top}"),
    }
    assert_eq!(scanned_rels(&top.children[0]), vec![outer]);
    let inner_scan = &top.children[1];
    match &inner_scan.node {
        PlanNode::IndexScan {
            scanrelid,
            indexoid,
            indexqual,
            ..
        } => {
            assert_eq!(*scanrelid, inner);
            assert_eq!(*indexoid, 701);
            assert_eq!(indexqual.len(), 1);
        }
        other => panic!("expected an index scan, got {other:?}\n{top}"),
    }
    assert!(stmt.param_exec_types.contains(&oids::INT4OID));
}
