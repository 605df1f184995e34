//! # Clause Selectivity
//!
//! Estimates the fraction of rows that pass a clause, using the per-column
//! statistics the catalog supplied for each base rel.
//!
//! ## Estimators
//!
//! - **Equality with a constant**: the constant's most-common-value frequency
//!   when it is tracked, otherwise the non-MCV remainder spread uniformly over
//!   the remaining distinct values.
//! - **Equality between two rels** (a join clause): `1 / max(ndv1, ndv2)`,
//!   scaled by the non-null fractions.
//! - **Range comparisons**: [`DEFAULT_INEQ_SEL`].
//! - **IS NULL / IS NOT NULL**: the column's null fraction and its complement.
//! - **NOT**: `1 - s`.
//! - **OR**: equalities of one column against distinct constants are mutually
//!   exclusive, so their selectivities add. Any other OR combines its arms by
//!   inclusion-exclusion, treating them as independent.
//! - **AND** and clause lists: the product.
//!
//! ## Caching
//!
//! The estimate of a [`RestrictInfo`] is cached in `norm_selec` (inner-join
//! semantics) or `outer_selec` (as the condition of an outer or semi join)
//! whenever it does not depend on which rel is being scanned.

use crate::catalog::BtStrategy;
use crate::expr::{oids, Expr, Oid, ScalarValue, Var};
use crate::planner_info::{PlannerInfo, RinfoId};
use crate::query::JoinType;
use crate::relation::SpecialJoinInfo;
use crate::relids::Index;
use crate::restrictinfo::RestrictInfo;
use crate::stats::{
    ColumnStatistics, DEFAULT_BOOL_SEL, DEFAULT_EQ_SEL, DEFAULT_INEQ_SEL, DEFAULT_NOT_UNK_SEL,
    DEFAULT_NUM_DISTINCT, DEFAULT_UNK_SEL,
};

/// Keeps a selectivity inside [0, 1], mapping NaN to 0.
pub fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

/// What the planner knows about the values of one expression.
#[derive(Debug, Clone)]
pub struct VariableStats<'a> {
    pub var: Option<&'a Var>,
    pub stats: Option<&'a ColumnStatistics>,
    /// Number of distinct non-null values.
    pub ndistinct: f64,
    pub nullfrac: f64,
    pub rel_tuples: f64,
}

/// Looks up the statistics of a plain column reference. Anything else is
/// treated as an unknown with default distinctness.
pub fn examine_variable<'a>(root: &'a PlannerInfo, expr: &'a Expr) -> VariableStats<'a> {
    let unknown = VariableStats {
        var: None,
        stats: None,
        ndistinct: DEFAULT_NUM_DISTINCT,
        nullfrac: 0.0,
        rel_tuples: 0.0,
    };
    let inner = match expr {
        Expr::PlaceHolderVar(phv) => phv.phexpr.as_ref(),
        other => other,
    };
    let Expr::Var(var) = inner else {
        return unknown;
    };
    if var.varlevelsup != 0 {
        return unknown;
    }
    let Some(rel_id) = root.base_rel_id(var.varno) else {
        return VariableStats { var: Some(var), ..unknown };
    };
    let rel = root.rel(rel_id);
    let tuples = rel.tuples.max(0.0);
    let not_null = rel.notnull_attnums.contains(&var.varattno);
    if let Some(stats) = rel.column_stats.get(&var.varattno) {
        return VariableStats {
            var: Some(var),
            stats: Some(stats),
            ndistinct: stats.distinct_count.max(1.0),
            nullfrac: if not_null { 0.0 } else { stats.null_fraction },
            rel_tuples: tuples,
        };
    }
    let unique = rel
        .indexlist
        .iter()
        .any(|idx| idx.unique && idx.predicate.is_none() && idx.keys == [var.varattno]);
    let ndistinct = if unique || (tuples > 0.0 && tuples < DEFAULT_NUM_DISTINCT) {
        tuples.max(1.0)
    } else {
        DEFAULT_NUM_DISTINCT
    };
    VariableStats {
        var: Some(var),
        stats: None,
        ndistinct,
        nullfrac: 0.0,
        rel_tuples: tuples,
    }
}

fn const_value(expr: &Expr) -> Option<&ScalarValue> {
    match expr {
        Expr::Const { value, .. } => Some(value),
        _ => None,
    }
}

fn is_local_column(expr: &Expr) -> bool {
    match expr {
        Expr::Var(v) => v.varlevelsup == 0,
        Expr::PlaceHolderVar(phv) => phv.phlevelsup == 0,
        _ => false,
    }
}

fn varno_of(expr: &Expr) -> Option<Index> {
    match expr {
        Expr::Var(v) if v.varlevelsup == 0 => Some(v.varno),
        Expr::PlaceHolderVar(phv) => phv.phexpr.as_var().map(|v| v.varno),
        _ => None,
    }
}

/// `column = value`, where `value` is a constant if known.
fn var_eq_const(vardata: &VariableStats<'_>, value: Option<&ScalarValue>) -> f64 {
    if let Some(ScalarValue::Null) = value {
        return 0.0;
    }
    match (vardata.stats, value) {
        (Some(stats), Some(value)) => clamp_probability(stats.equality_selectivity(value)),
        _ => clamp_probability((1.0 - vardata.nullfrac) / vardata.ndistinct.max(1.0)),
    }
}

/// Join equality between two columns.
fn eqjoinsel(root: &PlannerInfo, left: &Expr, right: &Expr) -> f64 {
    let l = examine_variable(root, left);
    let r = examine_variable(root, right);
    if l.var.is_none() && r.var.is_none() {
        return DEFAULT_EQ_SEL;
    }
    let nd = l.ndistinct.max(r.ndistinct).max(1.0);
    clamp_probability((1.0 - l.nullfrac) * (1.0 - r.nullfrac) / nd)
}

fn operator_strategy(root: &PlannerInfo, opno: Oid) -> Option<BtStrategy> {
    root.catalog.get_operator(opno).and_then(|op| op.btree.map(|(_, s)| s))
}

fn operator_negator_strategy(root: &PlannerInfo, opno: Oid) -> Option<BtStrategy> {
    let op = root.catalog.get_operator(opno)?;
    operator_strategy(root, op.negator?)
}

/// Selectivity of a binary operator clause.
fn opclause_selectivity(root: &PlannerInfo, opno: Oid, args: &[Expr], varrelid: Index) -> f64 {
    let [left, right] = args else {
        return DEFAULT_BOOL_SEL;
    };
    let strategy = operator_strategy(root, opno);
    let is_ne = strategy.is_none() && operator_negator_strategy(root, opno) == Some(BtStrategy::Equal);

    // a comparison between two rels is a join clause unless one side is the
    // rel being scanned, in which case the other side is a runtime constant
    let (lrel, rrel) = (varno_of(left), varno_of(right));
    let is_join = is_local_column(left) && is_local_column(right) && lrel != rrel;
    if is_join && (varrelid == 0 || (lrel != Some(varrelid) && rrel != Some(varrelid))) {
        return match strategy {
            Some(BtStrategy::Equal) => eqjoinsel(root, left, right),
            Some(_) => DEFAULT_INEQ_SEL,
            None if is_ne => 1.0 - eqjoinsel(root, left, right),
            None => DEFAULT_BOOL_SEL,
        };
    }

    let (column, other) = if is_join {
        if lrel == Some(varrelid) {
            (left, right)
        } else {
            (right, left)
        }
    } else if is_local_column(left) {
        (left, right)
    } else if is_local_column(right) {
        (right, left)
    } else {
        return DEFAULT_BOOL_SEL;
    };
    let vardata = examine_variable(root, column);
    let value = const_value(other);
    match strategy {
        Some(BtStrategy::Equal) => var_eq_const(&vardata, value),
        Some(_) => DEFAULT_INEQ_SEL,
        None if is_ne => {
            if let Some(ScalarValue::Null) = value {
                return 0.0;
            }
            clamp_probability(1.0 - var_eq_const(&vardata, value) - vardata.nullfrac)
        }
        None => DEFAULT_BOOL_SEL,
    }
}

fn nulltest_selectivity(root: &PlannerInfo, arg: &Expr, is_not_null: bool) -> f64 {
    let vardata = examine_variable(root, arg);
    if vardata.var.is_none() {
        return if is_not_null { DEFAULT_NOT_UNK_SEL } else { DEFAULT_UNK_SEL };
    }
    let nullfrac = if vardata.stats.is_some() || vardata.nullfrac > 0.0 {
        vardata.nullfrac
    } else {
        match vardata.var {
            Some(var) if root.base_rel_id(var.varno).is_some_and(|id| root.rel(id).notnull_attnums.contains(&var.varattno)) => 0.0,
            _ => DEFAULT_UNK_SEL,
        }
    };
    if is_not_null {
        1.0 - nullfrac
    } else {
        nullfrac
    }
}

/// The column and constant of `column = const`, in either operand order.
fn equality_with_const<'a>(root: &PlannerInfo, expr: &'a Expr) -> Option<(&'a Expr, &'a ScalarValue)> {
    let Expr::Op { opno, args } = expr else {
        return None;
    };
    if operator_strategy(root, *opno) != Some(BtStrategy::Equal) {
        return None;
    }
    let [l, r] = args.as_slice() else {
        return None;
    };
    match (const_value(l), const_value(r)) {
        (None, Some(v)) if is_local_column(l) => Some((l, v)),
        (Some(v), None) if is_local_column(r) => Some((r, v)),
        _ => None,
    }
}

/// True if every arm is `col = const` on one column with pairwise different
/// constants, so that at most one arm can be true for any row.
fn or_arms_mutually_exclusive<'a>(root: &PlannerInfo, arms: impl Iterator<Item = &'a Expr>) -> bool {
    let mut column: Option<&Expr> = None;
    let mut seen: Vec<&ScalarValue> = Vec::new();
    for arm in arms {
        let Some((col, value)) = equality_with_const(root, arm) else {
            return false;
        };
        if column.is_some_and(|c| c != col) || seen.contains(&value) {
            return false;
        }
        column = Some(col);
        seen.push(value);
    }
    column.is_some()
}

fn combine_or(arm_sels: &[f64], exclusive: bool) -> f64 {
    if exclusive {
        return clamp_probability(arm_sels.iter().sum());
    }
    let mut s = 0.0;
    for &s2 in arm_sels {
        s = s + s2 - s * s2;
    }
    clamp_probability(s)
}

/// Selectivity of a bare expression with no cache.
pub fn expr_selectivity(root: &PlannerInfo, expr: &Expr, varrelid: Index) -> f64 {
    let s = match expr {
        Expr::Const { value, .. } => match value {
            ScalarValue::Bool(true) => 1.0,
            ScalarValue::Bool(false) | ScalarValue::Null => 0.0,
            _ => 1.0,
        },
        Expr::Param(_) => 1.0,
        Expr::Var(v) if v.vartype == oids::BOOLOID => {
            let vardata = examine_variable(root, expr);
            match vardata.stats {
                Some(stats) => stats.equality_selectivity(&ScalarValue::Bool(true)),
                None => DEFAULT_BOOL_SEL,
            }
        }
        Expr::Var(_) | Expr::PlaceHolderVar(_) => DEFAULT_BOOL_SEL,
        Expr::Not(arg) => 1.0 - expr_selectivity(root, arg, varrelid),
        Expr::And(args) => args.iter().map(|a| expr_selectivity(root, a, varrelid)).product(),
        Expr::Or(args) => {
            let sels: Vec<f64> = args.iter().map(|a| expr_selectivity(root, a, varrelid)).collect();
            combine_or(&sels, or_arms_mutually_exclusive(root, args.iter()))
        }
        Expr::NullTest { arg, is_not_null } => nulltest_selectivity(root, arg, *is_not_null),
        Expr::Op { opno, args } => opclause_selectivity(root, *opno, args, varrelid),
        Expr::Func { .. } => DEFAULT_INEQ_SEL,
        Expr::Aggref { .. } | Expr::GroupingFunc { .. } => DEFAULT_BOOL_SEL,
    };
    clamp_probability(s)
}

/// Selectivity of one restriction clause, cached when it does not depend on
/// `varrelid`.
pub fn clause_selectivity(
    root: &PlannerInfo,
    rinfo: &RestrictInfo,
    varrelid: Index,
    jointype: JoinType,
    sjinfo: Option<&SpecialJoinInfo>,
) -> f64 {
    // constant quals other than a literal are evaluated once at run time
    if rinfo.pseudoconstant && !matches!(rinfo.clause, Expr::Const { .. }) {
        return 1.0;
    }
    let cacheable = varrelid == 0
        || rinfo.num_base_rels == 0
        || (rinfo.num_base_rels == 1 && rinfo.clause_relids.contains(varrelid));
    let cache = if jointype == JoinType::Inner {
        &rinfo.norm_selec
    } else {
        &rinfo.outer_selec
    };
    if cacheable {
        if let Some(s) = cache.get() {
            return s;
        }
    }

    let s = match &rinfo.orclause {
        Some(arms) => {
            let sels: Vec<f64> = arms
                .iter()
                .map(|conjuncts| {
                    conjuncts
                        .iter()
                        .map(|sub| clause_selectivity(root, sub, varrelid, jointype, sjinfo))
                        .product::<f64>()
                })
                .collect();
            let exclusive = arms.iter().all(|a| a.len() == 1)
                && or_arms_mutually_exclusive(root, arms.iter().map(|a| &a[0].clause));
            combine_or(&sels, exclusive)
        }
        None => expr_selectivity(root, &rinfo.clause, varrelid),
    };

    if cacheable {
        cache.set(Some(s));
    }
    s
}

/// Product of the clauses' selectivities.
pub fn clauselist_selectivity(
    root: &PlannerInfo,
    clauses: &[RinfoId],
    varrelid: Index,
    jointype: JoinType,
    sjinfo: Option<&SpecialJoinInfo>,
) -> f64 {
    let mut s = 1.0;
    for id in clauses {
        s *= clause_selectivity(root, root.rinfo(*id), varrelid, jointype, sjinfo);
    }
    clamp_probability(s)
}

/// Bucket fraction and most-common-value frequency of a hash key, for a hash
/// table with `nbuckets` buckets.
pub fn estimate_hash_bucket_stats(root: &PlannerInfo, expr: &Expr, nbuckets: f64) -> (f64, f64) {
    let vardata = examine_variable(root, expr);
    if vardata.var.is_none() {
        return (0.1, 0.0);
    }
    let ndistinct = vardata.ndistinct.max(1.0);
    let mcv_freq = vardata.stats.map(|s| s.max_frequency()).unwrap_or(0.0);
    let mut estfract = 1.0 / ndistinct.min(nbuckets.max(1.0));
    let avgfreq = (1.0 - vardata.nullfrac) / ndistinct;
    if avgfreq > 0.0 && mcv_freq > avgfreq {
        estfract *= mcv_freq / avgfreq;
    }
    (estfract.clamp(1.0e-6, 1.0), mcv_freq)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalog, RelationInfo};
    use crate::config::PlannerConfig;
    use crate::initsplan::add_base_rels_to_query;
    use crate::query::{JoinTreeNode, Query};
    use crate::restrictinfo::{make_restrictinfo, RinfoOptions};
    use std::sync::Arc;

    fn eq(l: Expr, r: Expr) -> Expr {
        Expr::op(oids::INT4EQ, l, r)
    }

    /// a(x) with 1000 rows, b(y, z) with 2000 rows.
    fn root(a_x: ColumnStatistics, b_y: ColumnStatistics, b_z: ColumnStatistics) -> PlannerInfo {
        let mut catalog = InMemoryCatalog::new();
        catalog.add_relation(100, RelationInfo::new(1000.0, 1).with_column_stats(1, a_x));
        catalog.add_relation(
            200,
            RelationInfo::new(2000.0, 2)
                .with_column_stats(1, b_y)
                .with_column_stats(2, b_z),
        );
        let mut query = Query::new();
        let a = query.add_relation("a", 100);
        let b = query.add_relation("b", 200);
        query.jointree = JoinTreeNode::From {
            items: vec![JoinTreeNode::Rel(a), JoinTreeNode::Rel(b)],
            quals: vec![],
        };
        let mut root = PlannerInfo::new(query, Arc::new(catalog), PlannerConfig::default());
        add_base_rels_to_query(&mut root).unwrap();
        root
    }

    fn uniform() -> PlannerInfo {
        root(
            ColumnStatistics::new(100.0, 0.0),
            ColumnStatistics::new(10.0, 0.0),
            ColumnStatistics::new(20.0, 0.0),
        )
    }

    #[test]
    fn test_equality_uses_distinct_count() {
        let root = uniform();
        let s = expr_selectivity(&root, &eq(Expr::int4_var(1, 1), Expr::int4(42)), 0);
        assert!((s - 0.01).abs() < 1e-12);
        // commuted operands give the same answer
        let s = expr_selectivity(&root, &eq(Expr::int4(42), Expr::int4_var(2, 1)), 0);
        assert!((s - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_equality_prefers_mcv_frequency() {
        let root = root(
            ColumnStatistics::new(100.0, 0.0).with_mcv(ScalarValue::Int64(42), 0.5),
            ColumnStatistics::new(10.0, 0.0),
            ColumnStatistics::new(20.0, 0.0),
        );
        let s = expr_selectivity(&root, &eq(Expr::int4_var(1, 1), Expr::int4(42)), 0);
        assert!((s - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_join_equality_is_inverse_max_ndv() {
        let root = uniform();
        let s = expr_selectivity(&root, &eq(Expr::int4_var(1, 1), Expr::int4_var(2, 2)), 0);
        assert!((s - 0.01).abs() < 1e-12);
        // seen from a scan of b, a.x is a runtime constant
        let s = expr_selectivity(&root, &eq(Expr::int4_var(1, 1), Expr::int4_var(2, 2)), 2);
        assert!((s - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_or_of_same_column_constants_adds() {
        let root = uniform();
        let or = Expr::Or(vec![
            eq(Expr::int4_var(1, 1), Expr::int4(42)),
            eq(Expr::int4_var(1, 1), Expr::int4(44)),
        ]);
        assert!((expr_selectivity(&root, &or, 0) - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_or_of_different_columns_uses_inclusion_exclusion() {
        let root = uniform();
        let or = Expr::Or(vec![
            eq(Expr::int4_var(2, 1), Expr::int4(43)),
            eq(Expr::int4_var(2, 2), Expr::int4(45)),
        ]);
        let expected = 0.1 + 0.05 - 0.1 * 0.05;
        assert!((expr_selectivity(&root, &or, 0) - expected).abs() < 1e-12);
    }

    #[test]
    fn test_range_null_and_not() {
        let root = root(
            ColumnStatistics::new(100.0, 0.2),
            ColumnStatistics::new(10.0, 0.0),
            ColumnStatistics::new(20.0, 0.0),
        );
        let lt = Expr::op(oids::INT4LT, Expr::int4_var(1, 1), Expr::int4(3));
        assert!((expr_selectivity(&root, &lt, 0) - DEFAULT_INEQ_SEL).abs() < 1e-12);
        assert!((expr_selectivity(&root, &Expr::is_null(Expr::int4_var(1, 1)), 0) - 0.2).abs() < 1e-12);
        let not = Expr::Not(Box::new(Expr::is_null(Expr::int4_var(1, 1))));
        assert!((expr_selectivity(&root, &not, 0) - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_restrictinfo_caches_norm_selec() {
        let mut root = uniform();
        let ri = make_restrictinfo(
            &mut root,
            eq(Expr::int4_var(1, 1), Expr::int4(42)),
            RinfoOptions::pushed_down(),
        );
        assert_eq!(ri.norm_selec.get(), None);
        let s = clause_selectivity(&root, &ri, 0, JoinType::Inner, None);
        assert_eq!(ri.norm_selec.get(), Some(s));
        ri.norm_selec.set(Some(0.5));
        assert_eq!(clause_selectivity(&root, &ri, 0, JoinType::Inner, None), 0.5);
        assert_eq!(ri.outer_selec.get(), None);
    }

    #[test]
    fn test_pseudoconstant_false_passes_nothing() {
        let mut root = uniform();
        let ri = make_restrictinfo(
            &mut root,
            Expr::bool_const(false),
            RinfoOptions {
                is_pushed_down: true,
                pseudoconstant: true,
                ..Default::default()
            },
        );
        assert_eq!(clause_selectivity(&root, &ri, 0, JoinType::Inner, None), 0.0);
    }
}
