//! # Relid Rewriting
//!
//! Removing a base rel from the query means every planner structure that
//! names it must either forget it (useless left-join removal) or name the rel
//! that absorbed it instead (self-join elimination). [`RelidChange`] describes
//! which of the two happens; the functions here apply it to clauses,
//! equivalence classes, placeholders, special joins and query-level sets.
//!
//! Clauses are rebuilt with `make_restrictinfo` rather than patched field by
//! field, so their derived fields (relid sets, joinability, hash operator)
//! always agree with the rewritten expression. The serial number and the
//! equivalence-class links survive the rebuild.

use joinplan_core::equivalence::EquivalenceMember;
use joinplan_core::expr::{change_var_nodes, remove_nulling_relids, Expr};
use joinplan_core::planner_info::{EcId, EmRef, PlannerInfo, RinfoId};
use joinplan_core::relids::{Index, Relids};
use joinplan_core::restrictinfo::{make_restrictinfo, RinfoOptions};

/// How a rule maps relids when it takes a base rel out of the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelidChange {
    /// Forget `relid` and, when nonzero, the outer join `ojrelid`.
    Remove { relid: Index, ojrelid: Index },
    /// Rename `from` to `to`.
    Replace { from: Index, to: Index },
}

impl RelidChange {
    pub fn apply(self, relids: &Relids) -> Relids {
        let mut out = relids.clone();
        self.apply_in_place(&mut out);
        out
    }

    pub fn apply_in_place(self, relids: &mut Relids) {
        match self {
            RelidChange::Remove { relid, ojrelid } => {
                relids.remove(relid);
                if ojrelid != 0 {
                    relids.remove(ojrelid);
                }
            }
            RelidChange::Replace { from, to } => relids.replace(from, to),
        }
    }

    pub fn touches(self, relids: &Relids) -> bool {
        match self {
            RelidChange::Remove { relid, ojrelid } => {
                relids.contains(relid) || (ojrelid != 0 && relids.contains(ojrelid))
            }
            RelidChange::Replace { from, .. } => relids.contains(from),
        }
    }

    /// Rewrites the column references of an expression. A removal only strips
    /// the outer join from nulling markers; columns of the removed rel must
    /// already be gone.
    pub fn apply_expr(self, expr: Expr) -> Expr {
        match self {
            RelidChange::Remove { relid, ojrelid } => {
                let mut removed = Relids::singleton(relid);
                if ojrelid != 0 {
                    removed.add(ojrelid);
                }
                remove_nulling_relids(expr, &removed)
            }
            RelidChange::Replace { from, to } => change_var_nodes(expr, from, to),
        }
    }
}

/// Rebuilds clause `id` with a new expression, mapping its relid sets through
/// `change`. When `keep_ec` is false the equivalence-class links are dropped,
/// which is required whenever the new expression is no longer the equality
/// the class derived.
pub fn rebuild_rinfo(root: &mut PlannerInfo, id: RinfoId, clause: Expr, change: Option<RelidChange>, keep_ec: bool) {
    let old = root.rinfo(id);
    let map = |relids: &Relids| change.map_or_else(|| relids.clone(), |c| c.apply(relids));
    let opts = RinfoOptions {
        is_pushed_down: old.is_pushed_down,
        has_clone: old.has_clone,
        is_clone: old.is_clone,
        pseudoconstant: old.pseudoconstant,
        security_level: old.security_level,
        required_relids: Some(map(&old.required_relids)),
        incompatible_relids: Some(map(&old.incompatible_relids)),
        outer_relids: Some(map(&old.outer_relids)),
    };
    let serial = old.rinfo_serial;
    let links = (old.parent_ec, old.left_ec, old.right_ec, old.left_em, old.right_em);

    let mut rebuilt = make_restrictinfo(root, clause, opts);
    rebuilt.rinfo_serial = serial;
    if keep_ec {
        (
            rebuilt.parent_ec,
            rebuilt.left_ec,
            rebuilt.right_ec,
            rebuilt.left_em,
            rebuilt.right_em,
        ) = links;
    }
    *root.rinfo_mut(id) = rebuilt;
}

/// Applies `change` to one clause if it mentions an affected relid.
pub fn rewrite_rinfo(root: &mut PlannerInfo, id: RinfoId, change: RelidChange) {
    let rinfo = root.rinfo(id);
    let touched = change.touches(&rinfo.clause_relids)
        || change.touches(&rinfo.required_relids)
        || change.touches(&rinfo.outer_relids)
        || change.touches(&rinfo.incompatible_relids);
    if !touched {
        return;
    }
    let clause = change.apply_expr(rinfo.clause.clone());
    rebuild_rinfo(root, id, clause, Some(change), true);
}

/// Applies `change` to every clause in the arena that `keep` accepts.
pub fn rewrite_all_rinfos(root: &mut PlannerInfo, change: RelidChange, keep: &dyn Fn(&PlannerInfo, RinfoId) -> bool) {
    for i in 0..root.rinfos.len() {
        let id = RinfoId(i);
        if keep(root, id) {
            rewrite_rinfo(root, id, change);
        }
    }
}

/// Applies `change` to the query-level relid sets, the special joins, the
/// join domains, and the lateral, nulling and uniqueness bookkeeping of every
/// live base rel.
pub fn rewrite_planner_relids(root: &mut PlannerInfo, change: RelidChange) {
    change.apply_in_place(&mut root.all_baserels);
    change.apply_in_place(&mut root.outer_join_rels);
    change.apply_in_place(&mut root.all_query_rels);
    root.all_result_relids = change.apply(&root.all_result_relids);

    for sjinfo in &mut root.join_info_list {
        for relids in [
            &mut sjinfo.min_lefthand,
            &mut sjinfo.min_righthand,
            &mut sjinfo.syn_lefthand,
            &mut sjinfo.syn_righthand,
            &mut sjinfo.commute_above_l,
            &mut sjinfo.commute_above_r,
            &mut sjinfo.commute_below_l,
            &mut sjinfo.commute_below_r,
        ] {
            change.apply_in_place(relids);
        }
    }
    for domain in &mut root.join_domains {
        change.apply_in_place(&mut domain.jd_relids);
    }

    for id in root.base_rel_ids() {
        let rel = root.rel_mut(id);
        change.apply_in_place(&mut rel.direct_lateral_relids);
        change.apply_in_place(&mut rel.lateral_relids);
        change.apply_in_place(&mut rel.lateral_referencers);
        change.apply_in_place(&mut rel.nulling_relids);
        let own = rel.relid;
        for cached in &mut rel.unique_for_rels {
            change.apply_in_place(&mut cached.outer_relids);
        }
        rel.unique_for_rels.retain(|cached| !cached.outer_relids.contains(own));
        for known in &mut rel.non_unique_for_rels {
            change.apply_in_place(known);
        }
        rel.non_unique_for_rels.retain(|known| !known.contains(own));
    }
}

/// Rewrites the expressions that live outside the clause arena: the target
/// list, HAVING, ORDER BY, lateral references, placeholder expressions and
/// semijoin operands.
pub fn rewrite_query_exprs(root: &mut PlannerInfo, change: RelidChange) {
    let take = |e: &mut Expr| std::mem::replace(e, Expr::bool_const(true));
    for tle in &mut root.processed_tlist {
        tle.expr = change.apply_expr(take(&mut tle.expr));
    }
    if let Some(having) = root.having_qual.take() {
        root.having_qual = Some(change.apply_expr(having));
    }
    for clause in &mut root.sort_clause {
        clause.expr = change.apply_expr(take(&mut clause.expr));
    }
    for id in root.base_rel_ids() {
        let rel = root.rel_mut(id);
        for expr in &mut rel.lateral_vars {
            *expr = change.apply_expr(take(expr));
        }
    }
    for phinfo in &mut root.placeholder_list {
        let expr = std::mem::replace(phinfo.ph_var.phexpr.as_mut(), Expr::bool_const(true));
        *phinfo.ph_var.phexpr = change.apply_expr(expr);
    }
    for sjinfo in &mut root.join_info_list {
        for expr in &mut sjinfo.semi_rhs_exprs {
            *expr = change.apply_expr(take(expr));
        }
    }
}

/// Renames a rel in the placeholder bookkeeping.
pub fn replace_relid_in_placeholders(root: &mut PlannerInfo, from: Index, to: Index) {
    for phinfo in &mut root.placeholder_list {
        phinfo.ph_eval_at.replace(from, to);
        phinfo.ph_needed.replace(from, to);
        phinfo.ph_lateral.replace(from, to);
        phinfo.ph_var.phrels.replace(from, to);
        phinfo.ph_var.phnullingrels.replace(from, to);
    }
}

/// Applies `change` to every live equivalence class that mentions an
/// affected relid. Members `discard` selects are deleted, members that become
/// identical are merged, and clause links into the classes are renumbered.
pub fn rewrite_eclasses(root: &mut PlannerInfo, change: RelidChange, discard: &dyn Fn(&EquivalenceMember) -> bool) {
    for i in 0..root.eq_classes.len() {
        let ec_id = EcId(i);
        let ec = root.ec(ec_id);
        if !ec.is_live() || !change.touches(&ec.ec_relids) {
            continue;
        }

        let ec = root.ec_mut(ec_id);
        change.apply_in_place(&mut ec.ec_relids);
        let members = std::mem::take(&mut ec.ec_members);
        let mut remap: Vec<Option<usize>> = Vec::with_capacity(members.len());
        let mut kept: Vec<EquivalenceMember> = Vec::with_capacity(members.len());
        for mut em in members {
            if discard(&em) {
                remap.push(None);
                continue;
            }
            if change.touches(&em.em_relids) {
                change.apply_in_place(&mut em.em_relids);
            }
            em.em_expr = change.apply_expr(em.em_expr);
            match kept
                .iter()
                .position(|k| k.em_expr == em.em_expr && k.em_is_child == em.em_is_child)
            {
                Some(existing) => remap.push(Some(existing)),
                None => {
                    remap.push(Some(kept.len()));
                    kept.push(em);
                }
            }
        }
        for em in &mut kept {
            em.em_parent = em.em_parent.and_then(|p| remap.get(p).copied().flatten());
        }
        ec.ec_members = kept;

        for rinfo in &mut root.rinfos {
            for em in [&mut rinfo.left_em, &mut rinfo.right_em] {
                if let Some(r) = *em {
                    if r.ec == ec_id {
                        *em = remap
                            .get(r.member)
                            .copied()
                            .flatten()
                            .map(|member| EmRef { ec: ec_id, member });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use joinplan_core::expr::oids;
    use joinplan_core::relids;

    #[test]
    fn test_remove_drops_relid_and_outer_join() {
        let change = RelidChange::Remove { relid: 2, ojrelid: 3 };
        assert_eq!(change.apply(&relids![1, 2, 3]), relids![1]);
        assert!(change.touches(&relids![3]));
        assert!(!change.touches(&relids![1, 4]));
    }

    #[test]
    fn test_replace_renames() {
        let change = RelidChange::Replace { from: 2, to: 1 };
        assert_eq!(change.apply(&relids![2, 4]), relids![1, 4]);
        let expr = change.apply_expr(Expr::op(oids::INT4EQ, Expr::int4_var(2, 1), Expr::int4(3)));
        assert_eq!(expr.to_string(), "1.1 = 3");
    }
}
