//! # Self-Join Elimination
//!
//! An inner join of a table with itself, `t t1 JOIN t t2 ON t1.k = t2.k`,
//! where `k` covers a unique index of `t`, pairs every row of `t1` with
//! itself. The join can be replaced by a single scan of `t1` carrying the
//! restrictions of both sides, provided `t1.k` is not null.
//!
//! ## Conditions
//!
//! For two base rels scanning the same relation:
//!
//! 1. neither is lateral, inherited or the inner one the result relation;
//! 2. both sit on the same sides of every outer join and are nulled by the
//!    same outer joins;
//! 3. both carry the same row mark, or none;
//! 4. the join clauses between them include equalities comparing a column
//!    with the same column of the other rel ("self-join quals"), and the
//!    inner rel is unique for those quals;
//! 5. when the uniqueness proof relied on restrictions of the inner rel, the
//!    outer rel has the same restrictions.
//!
//! ## Merge
//!
//! Every reference to the inner rel is renamed to the outer rel. Self-join
//! quals then read `x = x` and become `x IS NOT NULL`. The inner rel's
//! restrictions and join clauses are refiled against the outer rel, skipping
//! logical duplicates; equivalence-class members that became identical are
//! merged; row marks collapse.

use crate::relid_rewrite::{
    rebuild_rinfo, replace_relid_in_placeholders, rewrite_all_rinfos, rewrite_eclasses, rewrite_planner_relids,
    rewrite_query_exprs, RelidChange,
};
use joinplan_core::config::PlannerConfig;
use joinplan_core::equivalence::{generate_join_implied_equalities, has_relevant_eclass_joinclause};
use joinplan_core::error::Result;
use joinplan_core::expr::{change_var_nodes, contain_volatile_functions, Expr, Oid};
use joinplan_core::initsplan::{distribute_restrictinfo_to_rels, rebuild_attr_needed, remove_join_clause_from_rels};
use joinplan_core::planner_info::{PlannerInfo, RelId, RinfoId};
use joinplan_core::query::{JoinType, RowMarkStrength};
use joinplan_core::relation::RelSource;
use joinplan_core::relids::{Index, Membership, Relids};
use joinplan_core::restrictinfo::{clause_sides_match_join, restrict_infos_logically_equal};
use joinplan_core::rule::Rule;
use joinplan_core::uniqueness::{innerrel_is_unique_ext, UniqueProofMode};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Removes inner self-joins on a unique key.
pub struct RemoveUselessSelfJoinsRule;

impl Rule for RemoveUselessSelfJoinsRule {
    fn name(&self) -> &str {
        "RemoveUselessSelfJoins"
    }

    fn enabled(&self, config: &PlannerConfig) -> bool {
        config.enable_self_join_elimination
    }

    fn apply(&self, root: &mut PlannerInfo) -> Result<bool> {
        for group in candidate_groups(root) {
            for (i, &outer) in group.iter().enumerate() {
                for &inner in &group[i + 1..] {
                    // the result relation must survive
                    let (keep, remove) = if root.result_relation == Some(inner) {
                        (inner, outer)
                    } else {
                        (outer, inner)
                    };
                    if let Some(restrictlist) = self_join_is_removable(root, keep, remove) {
                        remove_self_join_rel(root, keep, remove, &restrictlist)?;
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }
}

/// Base rels grouped by the relation they scan, keeping groups of two or more.
fn candidate_groups(root: &PlannerInfo) -> Vec<Vec<Index>> {
    let mut groups: BTreeMap<Oid, Vec<Index>> = BTreeMap::new();
    for id in root.base_rel_ids() {
        let rel = root.rel(id);
        if let RelSource::Relation { oid } = &rel.source {
            if !rel.inh {
                groups.entry(*oid).or_default().push(rel.relid);
            }
        }
    }
    groups.into_values().filter(|g| g.len() > 1).collect()
}

fn row_mark_strength(root: &PlannerInfo, rti: Index) -> Option<RowMarkStrength> {
    root.row_marks.iter().find(|m| m.rti == rti).map(|m| m.strength)
}

/// Do the two rels take part in outer joins in the same way?
fn same_join_context(root: &PlannerInfo, outer: Index, inner: Index) -> bool {
    let (o, i) = match (root.base_rel_id(outer), root.base_rel_id(inner)) {
        (Some(o), Some(i)) => (root.rel(o), root.rel(i)),
        _ => return false,
    };
    if o.nulling_relids != i.nulling_relids {
        return false;
    }
    root.join_info_list.iter().all(|sjinfo| {
        sjinfo.syn_lefthand.contains(outer) == sjinfo.syn_lefthand.contains(inner)
            && sjinfo.syn_righthand.contains(outer) == sjinfo.syn_righthand.contains(inner)
    })
}

/// Checks whether `inner` duplicates `outer` row for row. Returns the join
/// clauses between them when it does.
pub fn self_join_is_removable(root: &mut PlannerInfo, outer: Index, inner: Index) -> Option<Vec<RinfoId>> {
    let outer_rel = root.base_rel_id(outer)?;
    let inner_rel = root.base_rel_id(inner)?;
    if root.result_relation == Some(inner) {
        return None;
    }
    let lateral = |id: RelId| !root.rel(id).lateral_relids.is_empty() || !root.rel(id).lateral_referencers.is_empty();
    if lateral(outer_rel) || lateral(inner_rel) {
        return None;
    }
    if !same_join_context(root, outer, inner) {
        trace!(outer, inner, "self join crosses an outer join boundary");
        return None;
    }
    if row_mark_strength(root, outer) != row_mark_strength(root, inner) {
        trace!(outer, inner, "self join rels carry different row marks");
        return None;
    }

    let outer_relids = Relids::singleton(outer);
    let inner_relids = Relids::singleton(inner);
    let joinrelids = outer_relids.union(&inner_relids);
    let mut restrictlist = generate_join_implied_equalities(root, &joinrelids, &outer_relids, &inner_relids);
    for id in &root.rel(inner_rel).joininfo {
        let rinfo = root.rinfo(*id);
        if rinfo.required_relids.is_subset(&joinrelids) && !restrictlist.contains(id) {
            restrictlist.push(*id);
        }
    }
    if restrictlist.is_empty() {
        return None;
    }

    let (selfjoinquals, otherquals): (Vec<RinfoId>, Vec<RinfoId>) = restrictlist
        .iter()
        .copied()
        .partition(|id| is_self_join_qual(root, *id, &outer_relids, &inner_relids, inner, outer));
    if selfjoinquals.is_empty() {
        return None;
    }

    let mode = UniqueProofMode {
        force_cache: false,
        self_join: true,
        no_positive_cache: !otherquals.is_empty(),
    };
    let uclauses = innerrel_is_unique_ext(
        root,
        &joinrelids,
        &outer_relids,
        inner_rel,
        JoinType::Inner,
        &selfjoinquals,
        mode,
    )?;

    // the proof may lean on restrictions of the inner rel; the outer rel
    // must then be restricted the same way
    for id in &uclauses {
        let renamed = change_var_nodes(root.rinfo(*id).clause.clone(), inner, outer);
        let matched = root.rel(outer_rel).baserestrictinfo.iter().any(|o| root.rinfo(*o).clause == renamed);
        if !matched {
            trace!(outer, inner, clause = %renamed, "outer rel lacks a restriction the proof used");
            return None;
        }
    }
    Some(restrictlist)
}

/// A mergejoinable equality whose two sides name the same expression once
/// the inner rel is renamed to the outer one.
fn is_self_join_qual(
    root: &PlannerInfo,
    id: RinfoId,
    outer_relids: &Relids,
    inner_relids: &Relids,
    inner: Index,
    outer: Index,
) -> bool {
    let rinfo = root.rinfo(id);
    if rinfo.mergeopfamilies.is_empty() || !clause_sides_match_join(rinfo, outer_relids, inner_relids) {
        return false;
    }
    match (rinfo.outer_operand(), rinfo.inner_operand()) {
        (Some(o), Some(i)) => change_var_nodes(i.clone(), inner, outer) == *o && !contain_volatile_functions(o),
        _ => false,
    }
}

/// Renames `inner` to `outer` throughout the planner state and files the
/// inner rel's clauses with the outer rel.
pub fn remove_self_join_rel(root: &mut PlannerInfo, outer: Index, inner: Index, restrictlist: &[RinfoId]) -> Result<()> {
    let outer_rel = root.find_base_rel(outer)?;
    let inner_rel = root.find_base_rel(inner)?;
    let change = RelidChange::Replace { from: inner, to: outer };

    let base = std::mem::take(&mut root.rel_mut(inner_rel).baserestrictinfo);
    let joininfo = std::mem::take(&mut root.rel_mut(inner_rel).joininfo);
    for id in &joininfo {
        remove_join_clause_from_rels(root, *id);
    }
    let inner_eclasses = root.rel(inner_rel).eclass_indexes.clone();

    root.simple_rel_array[inner] = None;
    rewrite_planner_relids(root, change);
    rewrite_all_rinfos(root, change, &|_, _| true);
    for i in 0..root.rinfos.len() {
        if root.rinfos[i].clause_relids.contains(outer) {
            fold_self_equality(root, RinfoId(i));
        }
    }

    for id in base.iter().chain(joininfo.iter()).chain(restrictlist.iter()) {
        file_unless_duplicate(root, *id)?;
    }

    rewrite_eclasses(root, change, &|_| false);
    root.rel_mut(outer_rel).eclass_indexes.union_with(&inner_eclasses);
    let has_joins = has_relevant_eclass_joinclause(root, outer_rel);
    root.rel_mut(outer_rel).has_eclass_joins = has_joins;

    replace_relid_in_placeholders(root, inner, outer);
    rewrite_query_exprs(root, change);

    root.row_marks.retain(|m| m.rti != inner);
    if root.result_relation == Some(inner) {
        root.result_relation = Some(outer);
    }
    rebuild_attr_needed(root);

    debug!(kept = outer, removed = inner, "removed useless self join");
    Ok(())
}

/// Replaces `x = x` by `x IS NOT NULL`.
fn fold_self_equality(root: &mut PlannerInfo, id: RinfoId) {
    let rinfo = root.rinfo(id);
    if rinfo.mergeopfamilies.is_empty() {
        return;
    }
    let Some((left, right)) = rinfo.operands() else {
        return;
    };
    if left != right || contain_volatile_functions(left) {
        return;
    }
    let clause = Expr::is_not_null(left.clone());
    rebuild_rinfo(root, id, clause, None, false);
}

/// Files a clause with the rels it needs unless an equal clause is already
/// there.
fn file_unless_duplicate(root: &mut PlannerInfo, id: RinfoId) -> Result<()> {
    let rinfo = root.rinfo(id);
    let Some(first) = rinfo.required_relids.iter().find_map(|r| root.base_rel_id(r)) else {
        return Ok(());
    };
    let existing = match rinfo.required_relids.membership() {
        Membership::Singleton => &root.rel(first).baserestrictinfo,
        _ => &root.rel(first).joininfo,
    };
    let duplicate = existing
        .iter()
        .any(|e| *e == id || restrict_infos_logically_equal(root.rinfo(*e), rinfo));
    if duplicate {
        return Ok(());
    }
    distribute_restrictinfo_to_rels(root, id)
}
