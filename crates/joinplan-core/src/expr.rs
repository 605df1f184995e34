//! # Scalar Expressions
//!
//! Expressions appear in restriction and join clauses, target lists, equivalence
//! members and placeholder contents. The tree is deliberately close to what an
//! analyzer hands to a planner: column references are `Var`s addressed by range
//! table index and attribute number, operators are identified by catalog OIDs,
//! and every `Var` carries the set of outer joins that can null it.
//!
//! ## Nulling Markers
//!
//! `Var::varnullingrels` and `PlaceHolderVar::phnullingrels` name the outer joins
//! (by their range-table index) below the point of use that may replace the
//! value with NULL. Two references to the same column with different markers are
//! different expressions: `a.x` above `a LEFT JOIN b` is not the same value as
//! `a.x` inside the join's ON clause when `a` is the nullable side.
//!
//! ## Walkers
//!
//! [`expression_tree_walker`] visits nodes pre-order and stops as soon as the
//! callback returns `true`. [`expression_tree_mutator`] rebuilds a tree bottom-up.
//! The common analyses (`pull_varnos`, `pull_var_clause`, volatility and leak
//! checks, `change_var_nodes`) are built on top of them.

use crate::relids::{Index, Relids};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Catalog object identifier.
pub type Oid = u32;
/// Column number within a relation, 1-based. Zero and negative numbers denote
/// whole-row and system columns.
pub type AttrNumber = i32;

pub const INVALID_OID: Oid = 0;

/// Well-known type and operator identifiers used by the built-in catalog.
pub mod oids {
    use super::Oid;

    pub const BOOLOID: Oid = 16;
    pub const INT8OID: Oid = 20;
    pub const INT4OID: Oid = 23;
    pub const TEXTOID: Oid = 25;
    pub const FLOAT8OID: Oid = 701;

    pub const INT4EQ: Oid = 96;
    pub const INT4LT: Oid = 97;
    pub const INT4NE: Oid = 518;
    pub const INT4GT: Oid = 521;
    pub const INT4LE: Oid = 523;
    pub const INT4GE: Oid = 525;
    pub const INT8EQ: Oid = 410;
    pub const INT8LT: Oid = 412;
    pub const INT8GT: Oid = 413;
    pub const INT48EQ: Oid = 15;
    pub const INT84EQ: Oid = 416;
    pub const TEXTEQ: Oid = 98;
    pub const TEXTLT: Oid = 664;
    pub const TEXTGT: Oid = 666;

    pub const INTEGER_BTREE_FAM: Oid = 1976;
    pub const TEXT_BTREE_FAM: Oid = 1994;
    pub const INTEGER_HASH_FAM: Oid = 1977;
    pub const TEXT_HASH_FAM: Oid = 1995;

    /// Printable symbol of a built-in operator.
    pub fn operator_symbol(opno: Oid) -> Option<&'static str> {
        Some(match opno {
            INT4EQ | INT8EQ | INT48EQ | INT84EQ | TEXTEQ => "=",
            INT4LT | INT8LT | TEXTLT => "<",
            INT4GT | INT8GT | TEXTGT => ">",
            INT4LE => "<=",
            INT4GE => ">=",
            INT4NE => "<>",
            _ => return None,
        })
    }
}

/// Constant values.
///
/// Floats are wrapped in `OrderedFloat` so that constants, and therefore whole
/// expressions, can be compared and hashed when deduplicating clauses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(OrderedFloat<f64>),
    Utf8(String),
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int64(a), Self::Int64(b)) => a == b,
            (Self::Float64(a), Self::Float64(b)) => a == b,
            (Self::Utf8(a), Self::Utf8(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for ScalarValue {}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(v) => v.hash(state),
            Self::Int64(v) => v.hash(state),
            Self::Float64(v) => v.hash(state),
            Self::Utf8(v) => v.hash(state),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int64(v) => write!(f, "{v}"),
            Self::Float64(v) => write!(f, "{v}"),
            Self::Utf8(v) => write!(f, "'{v}'"),
        }
    }
}

/// A column reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Var {
    /// Range-table index of the relation the column belongs to.
    pub varno: Index,
    pub varattno: AttrNumber,
    pub vartype: Oid,
    pub vartypmod: i32,
    pub varcollid: Oid,
    /// Outer joins that can null this reference at its point of use.
    pub varnullingrels: Relids,
    /// Number of query levels up from the one it appears in. Zero for local.
    pub varlevelsup: u32,
}

/// An expression that must be evaluated at a particular join level so that it
/// goes to NULL correctly above outer joins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaceHolderVar {
    pub phid: u32,
    pub phexpr: Box<Expr>,
    /// Syntactic scope: relations the placeholder must be evaluated within.
    pub phrels: Relids,
    pub phnullingrels: Relids,
    pub phlevelsup: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParamKind {
    /// Value supplied by the executor at run time (nest-loop and correlation params).
    Exec,
    /// Value supplied by the client for a prepared statement.
    Extern,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Param {
    pub kind: ParamKind,
    pub id: usize,
    pub paramtype: Oid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Volatility {
    Immutable,
    Stable,
    Volatile,
}

/// Scalar expression tree.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Expr {
    Var(Var),
    Const {
        value: ScalarValue,
        consttype: Oid,
    },
    Param(Param),
    /// Operator invocation. Binary operators carry two arguments.
    Op {
        opno: Oid,
        args: Vec<Expr>,
    },
    Func {
        funcid: Oid,
        name: String,
        volatility: Volatility,
        leakproof: bool,
        /// Returns a set of rows rather than a scalar.
        retset: bool,
        args: Vec<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    NullTest {
        arg: Box<Expr>,
        is_not_null: bool,
    },
    PlaceHolderVar(PlaceHolderVar),
    Aggref {
        aggfnoid: Oid,
        aggtype: Oid,
        args: Vec<Expr>,
        agglevelsup: u32,
    },
    GroupingFunc {
        args: Vec<Expr>,
        agglevelsup: u32,
    },
}

impl Expr {
    pub fn var(varno: Index, varattno: AttrNumber, vartype: Oid) -> Expr {
        Expr::Var(Var {
            varno,
            varattno,
            vartype,
            vartypmod: -1,
            varcollid: INVALID_OID,
            varnullingrels: Relids::new(),
            varlevelsup: 0,
        })
    }

    pub fn int4_var(varno: Index, varattno: AttrNumber) -> Expr {
        Expr::var(varno, varattno, oids::INT4OID)
    }

    pub fn int4(value: i64) -> Expr {
        Expr::Const {
            value: ScalarValue::Int64(value),
            consttype: oids::INT4OID,
        }
    }

    pub fn bool_const(value: bool) -> Expr {
        Expr::Const {
            value: ScalarValue::Bool(value),
            consttype: oids::BOOLOID,
        }
    }

    pub fn op(opno: Oid, left: Expr, right: Expr) -> Expr {
        Expr::Op {
            opno,
            args: vec![left, right],
        }
    }

    pub fn is_null(arg: Expr) -> Expr {
        Expr::NullTest {
            arg: Box::new(arg),
            is_not_null: false,
        }
    }

    pub fn is_not_null(arg: Expr) -> Expr {
        Expr::NullTest {
            arg: Box::new(arg),
            is_not_null: true,
        }
    }

    /// Left and right operands of a two-argument operator clause.
    pub fn binary_args(&self) -> Option<(&Expr, &Expr)> {
        match self {
            Expr::Op { args, .. } if args.len() == 2 => Some((&args[0], &args[1])),
            _ => None,
        }
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Expr::Var(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_true_const(&self) -> bool {
        matches!(
            self,
            Expr::Const {
                value: ScalarValue::Bool(true),
                ..
            }
        )
    }

    /// Constant FALSE or NULL: a qual that can never pass.
    pub fn is_false_const(&self) -> bool {
        matches!(
            self,
            Expr::Const {
                value: ScalarValue::Bool(false) | ScalarValue::Null,
                ..
            }
        )
    }

    pub fn is_or(&self) -> bool {
        matches!(self, Expr::Or(_))
    }

    /// Result type, when it can be determined from the node alone.
    pub fn type_oid(&self) -> Oid {
        match self {
            Expr::Var(v) => v.vartype,
            Expr::Const { consttype, .. } => *consttype,
            Expr::Param(p) => p.paramtype,
            Expr::Aggref { aggtype, .. } => *aggtype,
            Expr::PlaceHolderVar(phv) => phv.phexpr.type_oid(),
            Expr::GroupingFunc { .. } => oids::INT4OID,
            Expr::Func { .. } => INVALID_OID,
            Expr::Op { .. }
            | Expr::And(_)
            | Expr::Or(_)
            | Expr::Not(_)
            | Expr::NullTest { .. } => oids::BOOLOID,
        }
    }

    /// Flatten AND-chains: (A AND (B AND C)) -> [A, B, C].
    pub fn conjuncts(&self) -> Vec<&Expr> {
        match self {
            Expr::And(exprs) => exprs.iter().flat_map(|e| e.conjuncts()).collect(),
            other => vec![other],
        }
    }

    pub fn into_conjuncts(self) -> Vec<Expr> {
        match self {
            Expr::And(exprs) => exprs.into_iter().flat_map(Expr::into_conjuncts).collect(),
            other => vec![other],
        }
    }

    /// Immediate children, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Var(_) | Expr::Const { .. } | Expr::Param(_) => Vec::new(),
            Expr::Op { args, .. }
            | Expr::Func { args, .. }
            | Expr::And(args)
            | Expr::Or(args)
            | Expr::Aggref { args, .. }
            | Expr::GroupingFunc { args, .. } => args.iter().collect(),
            Expr::Not(arg) | Expr::NullTest { arg, .. } => vec![arg.as_ref()],
            Expr::PlaceHolderVar(phv) => vec![phv.phexpr.as_ref()],
        }
    }
}

/// Builds an AND of the given conjuncts, collapsing the trivial cases.
pub fn make_ands_explicit(mut conjuncts: Vec<Expr>) -> Expr {
    match conjuncts.len() {
        0 => Expr::bool_const(true),
        1 => conjuncts.remove(0),
        _ => Expr::And(conjuncts),
    }
}

/// Builds an OR of the given arms, collapsing the single-arm case.
pub fn make_orclause(mut arms: Vec<Expr>) -> Expr {
    match arms.len() {
        0 => Expr::bool_const(false),
        1 => arms.remove(0),
        _ => Expr::Or(arms),
    }
}

// ---------------------------------------------------------------------------
// Walkers
// ---------------------------------------------------------------------------

/// Pre-order walk. The callback returns `true` to stop; the walk then returns
/// `true` as well.
pub fn expression_tree_walker(node: &Expr, walker: &mut dyn FnMut(&Expr) -> bool) -> bool {
    if walker(node) {
        return true;
    }
    for child in node.children() {
        if expression_tree_walker(child, walker) {
            return true;
        }
    }
    false
}

/// Bottom-up rebuild: children are mutated first, then the node itself is
/// handed to the callback.
pub fn expression_tree_mutator(node: Expr, mutator: &mut dyn FnMut(Expr) -> Expr) -> Expr {
    let rebuilt = match node {
        leaf @ (Expr::Var(_) | Expr::Const { .. } | Expr::Param(_)) => leaf,
        Expr::Op { opno, args } => Expr::Op {
            opno,
            args: mutate_list(args, mutator),
        },
        Expr::Func {
            funcid,
            name,
            volatility,
            leakproof,
            retset,
            args,
        } => Expr::Func {
            funcid,
            name,
            volatility,
            leakproof,
            retset,
            args: mutate_list(args, mutator),
        },
        Expr::And(args) => Expr::And(mutate_list(args, mutator)),
        Expr::Or(args) => Expr::Or(mutate_list(args, mutator)),
        Expr::Not(arg) => Expr::Not(Box::new(expression_tree_mutator(*arg, mutator))),
        Expr::NullTest { arg, is_not_null } => Expr::NullTest {
            arg: Box::new(expression_tree_mutator(*arg, mutator)),
            is_not_null,
        },
        Expr::PlaceHolderVar(mut phv) => {
            phv.phexpr = Box::new(expression_tree_mutator(*phv.phexpr, mutator));
            Expr::PlaceHolderVar(phv)
        }
        Expr::Aggref {
            aggfnoid,
            aggtype,
            args,
            agglevelsup,
        } => Expr::Aggref {
            aggfnoid,
            aggtype,
            args: mutate_list(args, mutator),
            agglevelsup,
        },
        Expr::GroupingFunc { args, agglevelsup } => Expr::GroupingFunc {
            args: mutate_list(args, mutator),
            agglevelsup,
        },
    };
    mutator(rebuilt)
}

fn mutate_list(args: Vec<Expr>, mutator: &mut dyn FnMut(Expr) -> Expr) -> Vec<Expr> {
    args.into_iter()
        .map(|a| expression_tree_mutator(a, mutator))
        .collect()
}

/// Relations referenced by an expression at the current query level, including
/// the outer joins named in nulling markers. Placeholders contribute their
/// syntactic scope rather than their contents.
pub fn pull_varnos(expr: &Expr) -> Relids {
    let mut out = Relids::new();
    collect_varnos(expr, &mut out);
    out
}

fn collect_varnos(expr: &Expr, out: &mut Relids) {
    match expr {
        Expr::Var(v) if v.varlevelsup == 0 => {
            out.add(v.varno);
            out.union_with(&v.varnullingrels);
        }
        Expr::PlaceHolderVar(phv) if phv.phlevelsup == 0 => {
            out.union_with(&phv.phrels);
            out.union_with(&phv.phnullingrels);
        }
        Expr::PlaceHolderVar(_) => {}
        other => {
            for child in other.children() {
                collect_varnos(child, out);
            }
        }
    }
}

/// What `pull_var_clause` returns for nodes other than plain `Var`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct PullVarFlags {
    /// Return `Aggref`/`GroupingFunc` nodes whole instead of looking inside.
    pub include_aggregates: bool,
    /// Return `PlaceHolderVar`s whole instead of looking inside.
    pub include_placeholders: bool,
}

/// Collects the local `Var`s of an expression, plus aggregates and placeholders
/// according to `flags`, in first-appearance order without duplicates.
pub fn pull_var_clause(expr: &Expr, flags: PullVarFlags) -> Vec<Expr> {
    let mut out: Vec<Expr> = Vec::new();
    pull_vars_into(expr, flags, &mut out);
    out
}

fn pull_vars_into(expr: &Expr, flags: PullVarFlags, out: &mut Vec<Expr>) {
    let push = |e: &Expr, out: &mut Vec<Expr>| {
        if !out.contains(e) {
            out.push(e.clone());
        }
    };
    match expr {
        Expr::Var(v) if v.varlevelsup == 0 => push(expr, out),
        Expr::Var(_) => {}
        Expr::PlaceHolderVar(phv) if flags.include_placeholders && phv.phlevelsup == 0 => {
            push(expr, out)
        }
        Expr::Aggref { agglevelsup: 0, .. } | Expr::GroupingFunc { agglevelsup: 0, .. }
            if flags.include_aggregates =>
        {
            push(expr, out)
        }
        other => {
            for child in other.children() {
                pull_vars_into(child, flags, out);
            }
        }
    }
}

pub fn contain_volatile_functions(expr: &Expr) -> bool {
    expression_tree_walker(expr, &mut |e| {
        matches!(
            e,
            Expr::Func {
                volatility: Volatility::Volatile,
                ..
            }
        )
    })
}

/// True if the expression contains a function that is not leakproof and is
/// applied to column data.
pub fn contain_leaked_vars(expr: &Expr) -> bool {
    expression_tree_walker(expr, &mut |e| match e {
        Expr::Func {
            leakproof: false,
            args,
            ..
        } => args.iter().any(contains_vars),
        _ => false,
    })
}

pub fn contain_set_returning_functions(expr: &Expr) -> bool {
    expression_tree_walker(expr, &mut |e| matches!(e, Expr::Func { retset: true, .. }))
}

pub fn contains_vars(expr: &Expr) -> bool {
    expression_tree_walker(expr, &mut |e| {
        matches!(e, Expr::Var(_) | Expr::PlaceHolderVar(_))
    })
}

/// Rewrites references to range-table index `from` so that they point at `to`.
///
/// Var numbers, nulling markers and placeholder scopes are all adjusted. The
/// optional hook sees every node before the default handling and may return a
/// replacement, which is used as-is.
pub fn change_var_nodes_extended(
    expr: Expr,
    from: Index,
    to: Index,
    levels_up: u32,
    hook: Option<&mut dyn FnMut(&Expr) -> Option<Expr>>,
) -> Expr {
    let mut hook = hook;
    expression_tree_mutator(expr, &mut |node| {
        if let Some(h) = hook.as_deref_mut() {
            if let Some(replacement) = h(&node) {
                return replacement;
            }
        }
        match node {
            Expr::Var(mut v) if v.varlevelsup == levels_up => {
                if v.varno == from {
                    v.varno = to;
                }
                v.varnullingrels.replace(from, to);
                Expr::Var(v)
            }
            Expr::PlaceHolderVar(mut phv) if phv.phlevelsup == levels_up => {
                phv.phrels.replace(from, to);
                phv.phnullingrels.replace(from, to);
                Expr::PlaceHolderVar(phv)
            }
            other => other,
        }
    })
}

pub fn change_var_nodes(expr: Expr, from: Index, to: Index) -> Expr {
    change_var_nodes_extended(expr, from, to, 0, None)
}

/// Drops the given outer joins from every nulling marker in the expression.
pub fn remove_nulling_relids(expr: Expr, removable: &Relids) -> Expr {
    expression_tree_mutator(expr, &mut |node| match node {
        Expr::Var(mut v) if v.varlevelsup == 0 => {
            v.varnullingrels.difference_with(removable);
            Expr::Var(v)
        }
        Expr::PlaceHolderVar(mut phv) if phv.phlevelsup == 0 => {
            phv.phnullingrels.difference_with(removable);
            Expr::PlaceHolderVar(phv)
        }
        other => other,
    })
}

/// Adds `nullers[varno]` to each local reference's nulling markers.
pub fn add_nulling_relids(expr: Expr, nullers: &dyn Fn(Index) -> Relids) -> Expr {
    expression_tree_mutator(expr, &mut |node| match node {
        Expr::Var(mut v) if v.varlevelsup == 0 => {
            v.varnullingrels.union_with(&nullers(v.varno));
            Expr::Var(v)
        }
        Expr::PlaceHolderVar(mut phv) if phv.phlevelsup == 0 => {
            let mut extra = Relids::new();
            for rel in phv.phrels.iter() {
                extra.union_with(&nullers(rel));
            }
            phv.phnullingrels.union_with(&extra.difference(&phv.phrels));
            Expr::PlaceHolderVar(phv)
        }
        other => other,
    })
}

/// Relations for which the expression is strict: if any column of such a
/// relation is NULL, the expression cannot return true.
pub fn find_nonnullable_rels(expr: &Expr) -> Relids {
    match expr {
        Expr::Var(v) if v.varlevelsup == 0 => Relids::singleton(v.varno),
        Expr::Op { args, .. } => {
            let mut out = Relids::new();
            for a in args {
                out.union_with(&find_nonnullable_rels(a));
            }
            out
        }
        Expr::And(args) => {
            let mut out = Relids::new();
            for a in args {
                out.union_with(&find_nonnullable_rels(a));
            }
            out
        }
        Expr::Or(args) => {
            let mut iter = args.iter().map(find_nonnullable_rels);
            let first = iter.next().unwrap_or_default();
            iter.fold(first, |acc, r| acc.intersect(&r))
        }
        Expr::NullTest {
            arg,
            is_not_null: true,
        } => find_nonnullable_rels(arg),
        Expr::PlaceHolderVar(phv) if phv.phlevelsup == 0 => find_nonnullable_rels(&phv.phexpr),
        _ => Relids::new(),
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.varlevelsup > 0 {
            write!(f, "^{}.", self.varlevelsup)?;
        }
        write!(f, "{}.{}", self.varno, self.varattno)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, items: &[Expr], sep: &str) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, "{sep}")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }
        match self {
            Expr::Var(v) => write!(f, "{v}"),
            Expr::Const { value, .. } => write!(f, "{value}"),
            Expr::Param(p) => match p.kind {
                ParamKind::Exec => write!(f, "$exec{}", p.id),
                ParamKind::Extern => write!(f, "${}", p.id),
            },
            Expr::Op { opno, args } if args.len() == 2 => {
                let sym = oids::operator_symbol(*opno)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("#{opno}"));
                write!(f, "{} {} {}", args[0], sym, args[1])
            }
            Expr::Op { opno, args } => {
                write!(f, "op#{opno}(")?;
                join(f, args, ", ")?;
                write!(f, ")")
            }
            Expr::Func { name, args, .. } => {
                write!(f, "{name}(")?;
                join(f, args, ", ")?;
                write!(f, ")")
            }
            Expr::And(args) => join(f, args, " AND "),
            Expr::Or(args) => {
                write!(f, "(")?;
                join(f, args, " OR ")?;
                write!(f, ")")
            }
            Expr::Not(arg) => write!(f, "NOT {arg}"),
            Expr::NullTest { arg, is_not_null } => {
                if *is_not_null {
                    write!(f, "{arg} IS NOT NULL")
                } else {
                    write!(f, "{arg} IS NULL")
                }
            }
            Expr::PlaceHolderVar(phv) => write!(f, "PHV{}({})", phv.phid, phv.phexpr),
            Expr::Aggref { aggfnoid, args, .. } => {
                write!(f, "agg#{aggfnoid}(")?;
                join(f, args, ", ")?;
                write!(f, ")")
            }
            Expr::GroupingFunc { args, .. } => {
                write!(f, "GROUPING(")?;
                join(f, args, ", ")?;
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relids;

    fn nulled(varno: Index, attno: AttrNumber, by: Relids) -> Expr {
        let mut e = Expr::int4_var(varno, attno);
        if let Expr::Var(v) = &mut e {
            v.varnullingrels = by;
        }
        e
    }

    #[test]
    fn test_pull_varnos_includes_nulling_markers() {
        let clause = Expr::op(oids::INT4EQ, nulled(2, 1, relids![3]), Expr::int4_var(4, 1));
        assert_eq!(pull_varnos(&clause), relids![2, 3, 4]);
    }

    #[test]
    fn test_pull_varnos_uses_placeholder_scope() {
        let phv = Expr::PlaceHolderVar(PlaceHolderVar {
            phid: 1,
            phexpr: Box::new(Expr::int4(1)),
            phrels: relids![2],
            phnullingrels: relids![5],
            phlevelsup: 0,
        });
        assert_eq!(pull_varnos(&phv), relids![2, 5]);
    }

    #[test]
    fn test_pull_var_clause_dedups_and_respects_flags() {
        let agg = Expr::Aggref {
            aggfnoid: 2147,
            aggtype: oids::INT8OID,
            args: vec![Expr::int4_var(1, 2)],
            agglevelsup: 0,
        };
        let expr = Expr::And(vec![
            Expr::op(oids::INT4EQ, Expr::int4_var(1, 1), Expr::int4_var(1, 1)),
            agg.clone(),
        ]);
        let vars = pull_var_clause(&expr, PullVarFlags::default());
        assert_eq!(vars, vec![Expr::int4_var(1, 1), Expr::int4_var(1, 2)]);
        let with_aggs = pull_var_clause(
            &expr,
            PullVarFlags {
                include_aggregates: true,
                ..Default::default()
            },
        );
        assert_eq!(with_aggs, vec![Expr::int4_var(1, 1), agg]);
    }

    #[test]
    fn test_change_var_nodes_rewrites_numbers_and_markers() {
        let clause = Expr::op(oids::INT4EQ, nulled(2, 1, relids![2, 7]), Expr::int4_var(3, 1));
        let out = change_var_nodes(clause, 2, 1);
        assert_eq!(
            out,
            Expr::op(oids::INT4EQ, nulled(1, 1, relids![1, 7]), Expr::int4_var(3, 1))
        );
    }

    #[test]
    fn test_change_var_nodes_hook_overrides() {
        let clause = Expr::op(oids::INT4EQ, Expr::int4_var(2, 1), Expr::int4(5));
        let mut hook = |e: &Expr| match e {
            Expr::Const { .. } => Some(Expr::int4(6)),
            _ => None,
        };
        let out = change_var_nodes_extended(clause, 2, 9, 0, Some(&mut hook));
        assert_eq!(out, Expr::op(oids::INT4EQ, Expr::int4_var(9, 1), Expr::int4(6)));
    }

    #[test]
    fn test_volatility_and_leaks() {
        let random = Expr::Func {
            funcid: 1598,
            name: "random".into(),
            volatility: Volatility::Volatile,
            leakproof: true,
            retset: false,
            args: vec![],
        };
        let clause = Expr::op(oids::INT4LT, Expr::int4_var(1, 1), random);
        assert!(contain_volatile_functions(&clause));
        assert!(!contain_leaked_vars(&clause));

        let leaky = Expr::Func {
            funcid: 9000,
            name: "leaky".into(),
            volatility: Volatility::Immutable,
            leakproof: false,
            retset: false,
            args: vec![Expr::int4_var(1, 1)],
        };
        assert!(contain_leaked_vars(&leaky));
        assert!(!contain_volatile_functions(&leaky));
    }

    #[test]
    fn test_nonnullable_rels_through_or() {
        let or = Expr::Or(vec![
            Expr::op(oids::INT4EQ, Expr::int4_var(1, 1), Expr::int4_var(2, 1)),
            Expr::op(oids::INT4EQ, Expr::int4_var(1, 2), Expr::int4(3)),
        ]);
        assert_eq!(find_nonnullable_rels(&or), relids![1]);
        assert!(find_nonnullable_rels(&Expr::is_null(Expr::int4_var(1, 1))).is_empty());
    }

    #[test]
    fn test_display() {
        let e = Expr::And(vec![
            Expr::op(oids::INT4GT, Expr::int4_var(1, 2), Expr::int4(0)),
            Expr::is_not_null(Expr::int4_var(1, 1)),
        ]);
        assert_eq!(e.to_string(), "1.2 > 0 AND 1.1 IS NOT NULL");
    }
}
