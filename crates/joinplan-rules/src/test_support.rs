//! Small catalogs and queries shared by the rule tests.

use joinplan_core::catalog::{InMemoryCatalog, IndexInfo, RelationInfo};
use joinplan_core::config::PlannerConfig;
use joinplan_core::expr::{oids, AttrNumber, Expr, Oid};
use joinplan_core::planner::deconstruct_query;
use joinplan_core::planner_info::PlannerInfo;
use joinplan_core::query::{join_node, JoinTreeNode, JoinType, Query};
use std::sync::Arc;

/// Planner state right before the simplification rules run.
pub fn plan_root(query: Query, catalog: InMemoryCatalog) -> PlannerInfo {
    let mut root = PlannerInfo::new(query, Arc::new(catalog), PlannerConfig::default());
    deconstruct_query(&mut root).unwrap();
    root
}

fn keyed(tuples: f64, ncols: AttrNumber, indexoid: Oid) -> RelationInfo {
    RelationInfo::new(tuples, ncols).with_index(IndexInfo::unique_btree(indexoid, vec![1], tuples))
}

/// `a(id pk, x)` as relation 100 and `b(id pk, y)` as relation 200.
pub fn two_table_catalog() -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    catalog.add_relation(100, keyed(1000.0, 2, 101));
    catalog.add_relation(200, keyed(1000.0, 2, 201));
    catalog
}

/// `orders(id, customer_id)` as relation 300 and `customers(id)` as relation
/// 400, the latter with a primary key when `unique`.
pub fn semijoin_catalog(unique: bool) -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    catalog.add_relation(300, RelationInfo::new(10_000.0, 2));
    let customers = if unique {
        keyed(500.0, 1, 401)
    } else {
        RelationInfo::new(500.0, 1)
    };
    catalog.add_relation(400, customers);
    catalog
}

/// `SELECT o.id FROM orders o WHERE o.customer_id IN (SELECT c.id FROM customers c)`.
pub fn semijoin_query() -> Query {
    let mut q = Query::new();
    let o = q.add_relation("orders", 300);
    let c = q.add_relation("customers", 400);
    q.jointree = JoinTreeNode::From {
        items: vec![join_node(
            JoinType::Semi,
            JoinTreeNode::Rel(o),
            JoinTreeNode::Rel(c),
            vec![Expr::op(oids::INT4EQ, Expr::int4_var(o, 2), Expr::int4_var(c, 1))],
            None,
        )],
        quals: Vec::new(),
    };
    q.add_target("id", Expr::int4_var(o, 1));
    q
}

/// `t(id pk, v)` as relation 500.
pub fn self_join_catalog() -> InMemoryCatalog {
    let mut catalog = InMemoryCatalog::new();
    catalog.add_relation(500, keyed(1000.0, 2, 501));
    catalog
}

/// `SELECT t1.v FROM t t1, t t2 WHERE t1.id = t2.id AND t1.v > 0`.
pub fn self_join_query() -> Query {
    let mut q = Query::new();
    let t1 = q.add_relation("t1", 500);
    let t2 = q.add_relation("t2", 500);
    q.jointree = JoinTreeNode::From {
        items: vec![JoinTreeNode::Rel(t1), JoinTreeNode::Rel(t2)],
        quals: vec![
            Expr::op(oids::INT4EQ, Expr::int4_var(t1, 1), Expr::int4_var(t2, 1)),
            Expr::op(oids::INT4GT, Expr::int4_var(t1, 2), Expr::int4(0)),
        ],
    };
    q.add_target("v", Expr::int4_var(t1, 2));
    q
}
