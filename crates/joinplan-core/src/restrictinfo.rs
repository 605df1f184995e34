//! # Restriction Clauses
//!
//! A [`RestrictInfo`] wraps one top-level AND conjunct of a WHERE or ON clause
//! together with the relid bookkeeping the planner needs to decide where the
//! conjunct may be evaluated, plus lazily computed caches for selectivity,
//! volatility and hash-bucket estimates.
//!
//! ## Where a Clause Is Evaluated
//!
//! - `clause_relids` are the rels (and outer joins, through nulling markers) the
//!   clause mentions.
//! - `required_relids` is the smallest join level at which the clause may be
//!   evaluated; for an outer join's own ON clause it is the join's whole scope.
//! - [`rinfo_is_pushed_down`] decides, for a given join, whether the clause acts
//!   as a filter on the join's output or as the join condition itself.
//!
//! ## Clones
//!
//! When two left joins commute, the upper join's condition is generated twice:
//! once without the lower join's nulling marker (`has_clone`, with the lower
//! join in `incompatible_relids`) and once with it (`is_clone`). Both share a
//! `rinfo_serial`, and the relid checks guarantee that exactly one of them is
//! applied in any given join order.

use crate::expr::{contain_leaked_vars, contain_volatile_functions, pull_varnos, Expr, Oid};
use crate::planner_info::{EcId, EmRef, PlannerInfo};
use crate::relation::RelOptInfo;
use crate::relids::Relids;
use std::cell::{Cell, OnceCell};

#[derive(Debug, Clone)]
pub struct RestrictInfo {
    pub clause: Expr,
    /// False only for an outer join's own ON conjunct at its natural level.
    pub is_pushed_down: bool,
    /// A binary operator clause whose two sides reference disjoint rels.
    pub can_join: bool,
    /// References no local columns and contains nothing volatile.
    pub pseudoconstant: bool,
    pub has_clone: bool,
    pub is_clone: bool,
    pub leakproof: bool,
    has_volatile: OnceCell<bool>,
    pub security_level: u32,
    /// Base rels among `clause_relids`.
    pub num_base_rels: usize,

    pub clause_relids: Relids,
    pub required_relids: Relids,
    /// Outer joins above which this clone must not be evaluated.
    pub incompatible_relids: Relids,
    /// Non-nullable side of the outer join whose ON clause this is.
    pub outer_relids: Relids,
    pub left_relids: Relids,
    pub right_relids: Relids,

    /// For an OR clause: each arm as a list of conjunct sub-clauses.
    pub orclause: Option<Vec<Vec<RestrictInfo>>>,

    /// Shared by clones of the same qual.
    pub rinfo_serial: u32,
    /// Equivalence class this clause was generated from.
    pub parent_ec: Option<EcId>,

    pub norm_selec: Cell<Option<f64>>,
    pub outer_selec: Cell<Option<f64>>,

    /// Btree families in which the operator is the equality member.
    pub mergeopfamilies: Vec<Oid>,
    pub left_ec: Option<EcId>,
    pub right_ec: Option<EcId>,
    pub left_em: Option<EmRef>,
    pub right_em: Option<EmRef>,
    /// Set by [`clause_sides_match_join`] for the join being considered.
    pub outer_is_left: Cell<bool>,

    pub hashjoinoperator: Option<Oid>,
    pub left_bucketsize: Cell<Option<f64>>,
    pub right_bucketsize: Cell<Option<f64>>,
    pub left_mcvfreq: Cell<Option<f64>>,
    pub right_mcvfreq: Cell<Option<f64>>,
}

/// Flags and relid overrides for [`make_restrictinfo`].
#[derive(Debug, Clone, Default)]
pub struct RinfoOptions {
    pub is_pushed_down: bool,
    pub has_clone: bool,
    pub is_clone: bool,
    pub pseudoconstant: bool,
    pub security_level: u32,
    /// Defaults to the clause's own relids.
    pub required_relids: Option<Relids>,
    pub incompatible_relids: Option<Relids>,
    pub outer_relids: Option<Relids>,
}

impl RinfoOptions {
    /// A plain WHERE-style qual.
    pub fn pushed_down() -> Self {
        Self {
            is_pushed_down: true,
            ..Default::default()
        }
    }
}

impl RestrictInfo {
    pub fn has_volatile(&self) -> bool {
        *self
            .has_volatile
            .get_or_init(|| contain_volatile_functions(&self.clause))
    }

    pub fn is_or_clause(&self) -> bool {
        self.orclause.is_some()
    }

    pub fn is_mergejoinable(&self) -> bool {
        !self.mergeopfamilies.is_empty()
    }

    /// Left and right operand of a binary clause.
    pub fn operands(&self) -> Option<(&Expr, &Expr)> {
        self.clause.binary_args()
    }

    pub fn opno(&self) -> Option<Oid> {
        match &self.clause {
            Expr::Op { opno, .. } => Some(*opno),
            _ => None,
        }
    }

    /// Operand on the outer side, as decided by the last [`clause_sides_match_join`].
    pub fn outer_operand(&self) -> Option<&Expr> {
        self.operands()
            .map(|(l, r)| if self.outer_is_left.get() { l } else { r })
    }

    pub fn inner_operand(&self) -> Option<&Expr> {
        self.operands()
            .map(|(l, r)| if self.outer_is_left.get() { r } else { l })
    }
}

/// Builds a RestrictInfo for `clause`, assigning it a fresh serial number.
///
/// A top-level OR gets a parallel `orclause` whose leaves are themselves
/// RestrictInfos, so that later passes can reason about each arm.
pub fn make_restrictinfo(root: &mut PlannerInfo, clause: Expr, opts: RinfoOptions) -> RestrictInfo {
    let orclause = match &clause {
        Expr::Or(arms) => Some(
            arms.iter()
                .map(|arm| {
                    arm.conjuncts()
                        .into_iter()
                        .map(|conjunct| {
                            let sub_opts = RinfoOptions {
                                required_relids: None,
                                incompatible_relids: opts.incompatible_relids.clone(),
                                outer_relids: opts.outer_relids.clone(),
                                ..opts.clone()
                            };
                            make_restrictinfo(root, conjunct.clone(), sub_opts)
                        })
                        .collect::<Vec<_>>()
                })
                .collect::<Vec<_>>(),
        ),
        _ => None,
    };

    let clause_relids = pull_varnos(&clause);
    let (left_relids, right_relids, can_join) = match clause.binary_args() {
        Some((l, r)) => {
            let left = pull_varnos(l);
            let right = pull_varnos(r);
            let can_join = !opts.pseudoconstant
                && !left.is_empty()
                && !right.is_empty()
                && !left.overlaps(&right);
            (left, right, can_join)
        }
        None => (Relids::new(), Relids::new(), false),
    };
    let required_relids = opts
        .required_relids
        .clone()
        .unwrap_or_else(|| clause_relids.clone());
    let num_base_rels = clause_relids.difference(&root.outer_join_rels).len();
    let leakproof = !contain_leaked_vars(&clause);

    let mut rinfo = RestrictInfo {
        clause,
        is_pushed_down: opts.is_pushed_down,
        can_join,
        pseudoconstant: opts.pseudoconstant,
        has_clone: opts.has_clone,
        is_clone: opts.is_clone,
        leakproof,
        has_volatile: OnceCell::new(),
        security_level: opts.security_level,
        num_base_rels,
        clause_relids,
        required_relids,
        incompatible_relids: opts.incompatible_relids.unwrap_or_default(),
        outer_relids: opts.outer_relids.unwrap_or_default(),
        left_relids,
        right_relids,
        orclause,
        rinfo_serial: root.next_rinfo_serial(),
        parent_ec: None,
        norm_selec: Cell::new(None),
        outer_selec: Cell::new(None),
        mergeopfamilies: Vec::new(),
        left_ec: None,
        right_ec: None,
        left_em: None,
        right_em: None,
        outer_is_left: Cell::new(true),
        hashjoinoperator: None,
        left_bucketsize: Cell::new(None),
        right_bucketsize: Cell::new(None),
        left_mcvfreq: Cell::new(None),
        right_mcvfreq: Cell::new(None),
    };
    check_join_operator(root, &mut rinfo);
    rinfo
}

/// Fills in merge and hash joinability from the operator's catalog entry.
fn check_join_operator(root: &PlannerInfo, rinfo: &mut RestrictInfo) {
    if rinfo.pseudoconstant || rinfo.has_volatile() {
        return;
    }
    let Some(opno) = rinfo.opno() else { return };
    if rinfo.operands().is_none() {
        return;
    }
    let Some(info) = root.catalog.get_operator(opno) else {
        return;
    };
    rinfo.mergeopfamilies = info.mergejoin_opfamilies.clone();
    if info.hashjoinable && rinfo.can_join {
        rinfo.hashjoinoperator = Some(opno);
    }
}

/// Copy of a binary clause with its operands swapped, using the commutator
/// `comm_op`. The serial number and every cached estimate carry over, with
/// the per-side caches swapped.
pub fn commute_restrictinfo(rinfo: &RestrictInfo, comm_op: Oid) -> RestrictInfo {
    let mut out = rinfo.clone();
    if let Expr::Op { args, .. } = &rinfo.clause {
        let mut swapped = args.clone();
        swapped.reverse();
        out.clause = Expr::Op {
            opno: comm_op,
            args: swapped,
        };
    }
    std::mem::swap(&mut out.left_relids, &mut out.right_relids);
    std::mem::swap(&mut out.left_ec, &mut out.right_ec);
    std::mem::swap(&mut out.left_em, &mut out.right_em);
    out.left_bucketsize.swap(&out.right_bucketsize);
    out.left_mcvfreq.swap(&out.right_mcvfreq);
    out.outer_is_left.set(!rinfo.outer_is_left.get());
    if out.hashjoinoperator.is_some() {
        out.hashjoinoperator = Some(comm_op);
    }
    out
}

/// True if the clause acts as a filter at a join computing `joinrelids`
/// rather than as that join's own condition.
pub fn rinfo_is_pushed_down(rinfo: &RestrictInfo, joinrelids: &Relids) -> bool {
    rinfo.is_pushed_down || !rinfo.required_relids.is_subset(joinrelids)
}

/// Clause expressions for the executor, keeping only those whose
/// pseudoconstant flag matches and dropping constant-TRUE ones.
pub fn extract_actual_clauses<'a>(
    rinfos: impl IntoIterator<Item = &'a RestrictInfo>,
    pseudoconstant: bool,
) -> Vec<Expr> {
    rinfos
        .into_iter()
        .filter(|r| r.pseudoconstant == pseudoconstant && !r.clause.is_true_const())
        .map(|r| r.clause.clone())
        .collect()
}

/// Splits a join's clauses into its own conditions and the filters applied to
/// its output.
pub fn extract_actual_join_clauses<'a>(
    rinfos: impl IntoIterator<Item = &'a RestrictInfo>,
    joinrelids: &Relids,
) -> (Vec<Expr>, Vec<Expr>) {
    let mut joinquals = Vec::new();
    let mut otherquals = Vec::new();
    for rinfo in rinfos {
        if rinfo.clause.is_true_const() {
            continue;
        }
        if rinfo_is_pushed_down(rinfo, joinrelids) {
            if !rinfo.pseudoconstant {
                otherquals.push(rinfo.clause.clone());
            }
        } else {
            joinquals.push(rinfo.clause.clone());
        }
    }
    (joinquals, otherquals)
}

/// Can this join clause be enforced at a scan of `rel`, with the other rels
/// supplying parameters?
pub fn join_clause_is_movable_to(rinfo: &RestrictInfo, rel: &RelOptInfo) -> bool {
    // must physically reference the target rel
    if !rinfo.clause_relids.contains(rel.relid) {
        return false;
    }
    // an outer join's condition cannot move into its outer side
    if rinfo.outer_relids.contains(rel.relid) {
        return false;
    }
    // the rel's columns must not be nulled by any outer join the clause sees
    if rinfo.clause_relids.overlaps(&rel.nulling_relids) {
        return false;
    }
    if rel.lateral_referencers.overlaps(&rinfo.clause_relids) {
        return false;
    }
    !rinfo.is_clone
}

/// Can the clause be evaluated at a path for `currentrelids` that takes
/// parameters from `current_and_outer - currentrelids`?
pub fn join_clause_is_movable_into(
    rinfo: &RestrictInfo,
    currentrelids: &Relids,
    current_and_outer: &Relids,
) -> bool {
    if !rinfo.clause_relids.is_subset(current_and_outer) {
        return false;
    }
    if !currentrelids.overlaps(&rinfo.clause_relids) {
        return false;
    }
    !currentrelids.overlaps(&rinfo.outer_relids)
}

/// False if some outer join already performed at `eval_relids` could have
/// nulled columns the clause reads without the clause's markers saying so.
pub fn clause_is_computable_at(root: &PlannerInfo, rinfo: &RestrictInfo, eval_relids: &Relids) -> bool {
    root.join_info_list.iter().all(|sjinfo| {
        if sjinfo.ojrelid == 0 || !eval_relids.contains(sjinfo.ojrelid) {
            return true;
        }
        if rinfo.clause_relids.contains(sjinfo.ojrelid) {
            return true;
        }
        !(rinfo.clause_relids.overlaps(&sjinfo.min_righthand)
            || (sjinfo.jointype == crate::query::JoinType::Full
                && rinfo.clause_relids.overlaps(&sjinfo.min_lefthand)))
    })
}

/// Checks that one operand comes from each side of a join and records which
/// operand is on the outer side.
pub fn clause_sides_match_join(rinfo: &RestrictInfo, outerrelids: &Relids, innerrelids: &Relids) -> bool {
    if rinfo.left_relids.is_subset(outerrelids) && rinfo.right_relids.is_subset(innerrelids) {
        rinfo.outer_is_left.set(true);
        true
    } else if rinfo.left_relids.is_subset(innerrelids) && rinfo.right_relids.is_subset(outerrelids) {
        rinfo.outer_is_left.set(false);
        true
    } else {
        false
    }
}

/// Can a clause at this security level be applied ahead of the rel's other
/// restrictions?
pub fn restriction_is_securely_promotable(rinfo: &RestrictInfo, rel: &RelOptInfo) -> bool {
    rinfo.security_level <= rel.baserestrict_min_security || rinfo.leakproof
}

/// Same qual in every respect that matters for evaluation, ignoring serial
/// numbers and caches.
pub fn restrict_infos_logically_equal(a: &RestrictInfo, b: &RestrictInfo) -> bool {
    a.clause == b.clause
        && a.is_pushed_down == b.is_pushed_down
        && a.pseudoconstant == b.pseudoconstant
        && a.security_level == b.security_level
        && a.required_relids == b.required_relids
        && a.incompatible_relids == b.incompatible_relids
        && a.outer_relids == b.outer_relids
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

    fn eq(l: Expr, r: Expr) -> Expr {
        Expr::op(oids::INT4EQ, l, r)
    }

    #[test]
    fn test_join_clause_is_can_join_and_mergejoinable() {
        let mut root = root();
        let ri = make_restrictinfo(
            &mut root,
            eq(Expr::int4_var(1, 1), Expr::int4_var(2, 1)),
            RinfoOptions::pushed_down(),
        );
        assert!(ri.can_join);
        assert_eq!(ri.clause_relids, relids![1, 2]);
        assert_eq!(ri.required_relids, relids![1, 2]);
        assert_eq!(ri.mergeopfamilies, vec![oids::INTEGER_BTREE_FAM]);
        assert_eq!(ri.hashjoinoperator, Some(oids::INT4EQ));
    }

    #[test]
    fn test_restriction_is_not_can_join() {
        let mut root = root();
        let ri = make_restrictinfo(
            &mut root,
            eq(Expr::int4_var(1, 1), Expr::int4(5)),
            RinfoOptions::pushed_down(),
        );
        assert!(!ri.can_join);
        assert!(ri.hashjoinoperator.is_none());
        assert!(ri.is_mergejoinable());
    }

    #[test]
    fn test_or_clause_gets_arm_structure() {
        let mut root = root();
        let clause = Expr::Or(vec![
            Expr::And(vec![
                eq(Expr::int4_var(1, 1), Expr::int4(42)),
                eq(Expr::int4_var(2, 1), Expr::int4(43)),
            ]),
            eq(Expr::int4_var(1, 1), Expr::int4(44)),
        ]);
        let ri = make_restrictinfo(&mut root, clause, RinfoOptions::pushed_down());
        let arms = ri.orclause.as_ref().unwrap();
        assert_eq!(arms.len(), 2);
        assert_eq!(arms[0].len(), 2);
        assert_eq!(arms[1].len(), 1);
        assert_eq!(arms[0][1].clause_relids, relids![2]);
        // sub-clauses get their own serials
        assert_ne!(arms[0][0].rinfo_serial, ri.rinfo_serial);
    }

    #[test]
    fn test_commute_twice_restores_clause_and_keeps_caches() {
        let mut root = root();
        let ri = make_restrictinfo(
            &mut root,
            Expr::op(oids::INT4LT, Expr::int4_var(1, 1), Expr::int4_var(2, 1)),
            RinfoOptions::pushed_down(),
        );
        ri.norm_selec.set(Some(0.25));
        ri.left_bucketsize.set(Some(0.1));
        let flipped = commute_restrictinfo(&ri, oids::INT4GT);
        assert_eq!(flipped.left_relids, relids![2]);
        assert_eq!(flipped.right_bucketsize.get(), Some(0.1));
        assert_eq!(flipped.rinfo_serial, ri.rinfo_serial);
        let back = commute_restrictinfo(&flipped, oids::INT4LT);
        assert_eq!(back.clause, ri.clause);
        assert_eq!(back.norm_selec.get(), Some(0.25));
        assert_eq!(back.left_bucketsize.get(), Some(0.1));
    }

    #[test]
    fn test_pushed_down_classification() {
        let mut root = root();
        let on_clause = make_restrictinfo(
            &mut root,
            eq(Expr::int4_var(1, 1), Expr::int4_var(2, 1)),
            RinfoOptions {
                is_pushed_down: false,
                required_relids: Some(relids![1, 2]),
                outer_relids: Some(relids![1]),
                ..Default::default()
            },
        );
        assert!(!rinfo_is_pushed_down(&on_clause, &relids![1, 2, 3]));
        assert!(rinfo_is_pushed_down(&on_clause, &relids![2, 3]));

        let filter = make_restrictinfo(
            &mut root,
            eq(Expr::int4_var(2, 2), Expr::int4(1)),
            RinfoOptions::pushed_down(),
        );
        let (joinquals, otherquals) =
            extract_actual_join_clauses([&on_clause, &filter], &relids![1, 2, 3]);
        assert_eq!(joinquals, vec![on_clause.clause.clone()]);
        assert_eq!(otherquals, vec![filter.clause.clone()]);
    }

    #[test]
    fn test_extract_actual_clauses_drops_true() {
        let mut root = root();
        let t = make_restrictinfo(&mut root, Expr::bool_const(true), RinfoOptions::pushed_down());
        let c = make_restrictinfo(
            &mut root,
            eq(Expr::int4_var(1, 1), Expr::int4(1)),
            RinfoOptions::pushed_down(),
        );
        assert_eq!(extract_actual_clauses([&t, &c], false), vec![c.clause.clone()]);
    }

    #[test]
    fn test_movable_into() {
        let mut root = root();
        let ri = make_restrictinfo(
            &mut root,
            eq(Expr::int4_var(1, 1), Expr::int4_var(2, 1)),
            RinfoOptions::pushed_down(),
        );
        assert!(join_clause_is_movable_into(&ri, &relids![2], &relids![1, 2]));
        assert!(!join_clause_is_movable_into(&ri, &relids![2], &relids![2, 3]));
        assert!(!join_clause_is_movable_into(&ri, &relids![3], &relids![1, 2, 3]));
    }

    #[test]
    fn test_clause_sides_match_join_sets_orientation() {
        let mut root = root();
        let ri = make_restrictinfo(
            &mut root,
            eq(Expr::int4_var(1, 1), Expr::int4_var(2, 1)),
            RinfoOptions::pushed_down(),
        );
        assert!(clause_sides_match_join(&ri, &relids![2], &relids![1]));
        assert!(!ri.outer_is_left.get());
        assert_eq!(ri.outer_operand(), Some(&Expr::int4_var(2, 1)));
        assert!(!clause_sides_match_join(&ri, &relids![3], &relids![1]));
    }
}
