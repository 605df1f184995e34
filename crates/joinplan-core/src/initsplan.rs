//! # Initial Planning
//!
//! Turns the query's join tree into planner structures:
//!
//! 1. [`add_base_rels_to_query`] builds a base [`RelOptInfo`] for every leaf of
//!    the join tree, plus "other member" rels for inheritance children.
//! 2. [`build_base_rel_tlists`] records which columns the final output needs.
//! 3. [`deconstruct_jointree`] walks the join tree twice. The first pass builds
//!    one [`SpecialJoinInfo`] per non-inner join, labels column references with
//!    the outer joins that can null them, and decides which outer joins may
//!    commute. The second pass turns each qual conjunct into a
//!    [`RestrictInfo`] and files it with the rels that can evaluate it, feeding
//!    usable equalities to the equivalence machinery.
//!
//! ## Outer-Join Commutation
//!
//! `(A leftjoin B on Pab) leftjoin C on Pbc` may be executed as
//! `A leftjoin (B leftjoin C on Pbc) on Pab` when `Pbc` is strict for `B`. The
//! references to `B` inside `Pbc` are nulled by the lower join in the first
//! order but not in the second, so `Pbc` is distributed twice: once without the
//! lower join's marker (`has_clone`) and once with it (`is_clone`). The
//! `incompatible_relids` of each version make sure exactly one of them is
//! applied in any join order. Outer joins nested inside the right-hand side of
//! another left join keep their syntactic order.

use crate::equivalence::{initialize_mergeclause_eclasses, process_equivalence, JoinDomain};
use crate::error::{PlanError, Result};
use crate::expr::{
    add_nulling_relids, contain_set_returning_functions, contain_volatile_functions, find_nonnullable_rels,
    pull_var_clause, pull_varnos, remove_nulling_relids, Expr, Oid, PullVarFlags,
};
use crate::placeholder::find_placeholder_info;
use crate::planner_info::{JoinDomainId, PlannerInfo, RelId, RinfoId};
use crate::query::{JoinTreeNode, JoinType, RteKind};
use crate::relation::{RelOptInfo, RelOptKind, RelSource, SpecialJoinInfo};
use crate::relids::{Index, Membership, Relids};
use crate::restrictinfo::{make_restrictinfo, RestrictInfo, RinfoOptions};
use crate::stats::get_typavgwidth;
use tracing::trace;

// ---------------------------------------------------------------------------
// Base rels
// ---------------------------------------------------------------------------

/// Builds a base rel for every range-table entry referenced by the join tree.
pub fn add_base_rels_to_query(root: &mut PlannerInfo) -> Result<()> {
    let mut leaves = Vec::new();
    collect_leaves(&root.parse.jointree, &mut leaves);
    for rti in leaves {
        if root.base_rel_id(rti).is_some() {
            return Err(PlanError::InvalidInput(format!(
                "range-table entry {rti} appears more than once in the join tree"
            )));
        }
        let rel = build_simple_rel(root, rti, None)?;
        root.all_baserels.add(rti);
        expand_append_children(root, rel)?;
    }
    root.all_query_rels = root.all_baserels.clone();
    Ok(())
}

fn collect_leaves(node: &JoinTreeNode, out: &mut Vec<Index>) {
    match node {
        JoinTreeNode::Rel(rti) => out.push(*rti),
        JoinTreeNode::Join { larg, rarg, .. } => {
            collect_leaves(larg, out);
            collect_leaves(rarg, out);
        }
        JoinTreeNode::From { items, .. } => {
            for item in items {
                collect_leaves(item, out);
            }
        }
    }
}

/// Creates the RelOptInfo of one range-table entry, reading its size,
/// indexes and column statistics from the catalog.
pub fn build_simple_rel(root: &mut PlannerInfo, rti: Index, parent: Option<RelId>) -> Result<RelId> {
    let rte = root.parse.rte(rti)?.clone();
    let kind = if parent.is_some() {
        RelOptKind::OtherMember
    } else {
        RelOptKind::Base
    };
    let mut rel = RelOptInfo::new(kind, Relids::singleton(rti));
    rel.relid = rti;
    rel.alias = rte.alias.clone();
    rel.min_attr = 0;
    rel.inh = rte.inh;
    rel.partitioning = rte.partitioning.clone();

    match &rte.kind {
        RteKind::Relation { relation } => {
            let info = root
                .catalog
                .get_relation_info(*relation)
                .ok_or_else(|| PlanError::Catalog(format!("relation {relation} not found")))?;
            rel.source = RelSource::Relation { oid: *relation };
            rel.max_attr = info.max_attr;
            rel.pages = info.pages;
            rel.tuples = info.tuples;
            rel.allvisfrac = info.allvisfrac;
            rel.indexlist = info.indexes;
            rel.notnull_attnums = info.notnull_attnums;
            rel.foreign_keys = info.foreign_keys;
            if rel.partitioning.is_none() {
                rel.partitioning = info.partitioning;
            }
            rel.attr_types = std::iter::once(crate::expr::INVALID_OID)
                .chain(info.attr_types.iter().copied())
                .collect();
            rel.column_stats = info.column_stats;
        }
        RteKind::Subquery(sub) => {
            rel.source = RelSource::Subquery(sub.clone());
            rel.max_attr = sub.column_types.len() as i32;
            rel.tuples = sub.rows;
            rel.pages = 0.0;
            rel.attr_types = std::iter::once(crate::expr::INVALID_OID)
                .chain(sub.column_types.iter().copied())
                .collect();
        }
        RteKind::Join => {
            return Err(PlanError::InvalidInput(format!(
                "range-table entry {rti} is an outer-join marker, not a scannable relation"
            )));
        }
    }

    let nslots = (rel.max_attr - rel.min_attr + 1).max(0) as usize;
    rel.attr_needed = vec![Relids::new(); nslots];
    rel.attr_widths = (0..nslots)
        .map(|slot| {
            let attno = rel.min_attr + slot as i32;
            rel.column_stats
                .get(&attno)
                .map(|s| s.avg_width)
                .unwrap_or_else(|| get_typavgwidth(rel.attr_types.get(slot).copied().unwrap_or(0)))
        })
        .collect();

    if !rte.lateral_refs.is_empty() {
        rel.lateral_vars = rte.lateral_refs.clone();
        let mut refs = Relids::new();
        for expr in &rte.lateral_refs {
            refs.union_with(&pull_varnos(expr));
        }
        refs.remove(rti);
        rel.direct_lateral_relids = refs.clone();
        rel.lateral_relids = refs;
    }

    let id = root.add_rel(rel);
    if root.simple_rel_array.len() <= rti {
        root.simple_rel_array.resize(rti + 1, None);
    }
    root.simple_rel_array[rti] = Some(id);
    Ok(id)
}

fn expand_append_children(root: &mut PlannerInfo, parent: RelId) -> Result<()> {
    let parent_relid = root.rel(parent).relid;
    let children: Vec<Index> = root
        .append_rel_list
        .iter()
        .filter(|a| a.parent_relid == parent_relid)
        .map(|a| a.child_relid)
        .collect();
    // only a flagged parent with at least one child counts as inherited
    let inh = root.rel(parent).inh && !children.is_empty();
    root.rel_mut(parent).inh = inh;
    if !inh {
        return Ok(());
    }
    for child in children {
        let child_id = build_simple_rel(root, child, Some(parent))?;
        let lateral = root.rel(parent).lateral_relids.clone();
        root.rel_mut(child_id).lateral_relids = lateral;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Target lists
// ---------------------------------------------------------------------------

/// Marks the columns used by the final target list and HAVING qual as needed
/// by the final output.
pub fn build_base_rel_tlists(root: &mut PlannerInfo) {
    let flags = PullVarFlags {
        include_aggregates: false,
        include_placeholders: true,
    };
    let mut vars = Vec::new();
    for tle in &root.processed_tlist {
        vars.extend(pull_var_clause(&tle.expr, flags));
    }
    if let Some(having) = &root.having_qual {
        vars.extend(pull_var_clause(having, flags));
    }
    for clause in &root.sort_clause {
        vars.extend(pull_var_clause(&clause.expr, flags));
    }
    add_vars_to_targetlist(root, &vars, &Relids::singleton(0));
}

/// Records that each Var (or placeholder) is needed at the join level
/// `where_needed`, adding it to its rel's output on first use.
pub fn add_vars_to_targetlist(root: &mut PlannerInfo, vars: &[Expr], where_needed: &Relids) {
    for var in vars {
        match var {
            Expr::Var(v) => {
                let Some(rel_id) = root.base_rel_id(v.varno) else {
                    continue;
                };
                let rel = root.rel_mut(rel_id);
                let Some(slot) = rel.attr_slot(v.varattno) else {
                    continue;
                };
                if rel.attr_needed[slot].is_empty() {
                    let mut plain = v.clone();
                    plain.varnullingrels = Relids::new();
                    rel.reltarget.exprs.push(Expr::Var(plain));
                }
                rel.attr_needed[slot].union_with(where_needed);
            }
            Expr::PlaceHolderVar(phv) => {
                let pos = find_placeholder_info(root, phv);
                root.placeholder_list[pos].ph_needed.union_with(where_needed);
            }
            _ => {}
        }
    }
}

/// Lateral references must be emitted by the rels they point at.
pub fn find_lateral_references(root: &mut PlannerInfo) {
    let pending: Vec<(Vec<Expr>, Index)> = root
        .base_rel_ids()
        .into_iter()
        .map(|id| root.rel(id))
        .filter(|rel| !rel.lateral_vars.is_empty())
        .map(|rel| {
            let mut vars = Vec::new();
            for expr in &rel.lateral_vars {
                vars.extend(pull_var_clause(
                    expr,
                    PullVarFlags {
                        include_aggregates: false,
                        include_placeholders: true,
                    },
                ));
            }
            (vars, rel.relid)
        })
        .collect();
    for (vars, relid) in pending {
        add_vars_to_targetlist(root, &vars, &Relids::singleton(relid));
    }
}

/// Closes `lateral_relids` transitively and fills in `lateral_referencers`.
pub fn create_lateral_join_info(root: &mut PlannerInfo) {
    let ids = root.base_rel_ids();
    loop {
        let mut changed = false;
        for &id in &ids {
            let mut closure = root.rel(id).lateral_relids.clone();
            for relid in root.rel(id).lateral_relids.iter() {
                if let Some(src) = root.base_rel_id(relid) {
                    closure.union_with(&root.rel(src).lateral_relids);
                }
            }
            closure.remove(root.rel(id).relid);
            if closure != root.rel(id).lateral_relids {
                root.rel_mut(id).lateral_relids = closure;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    for &id in &ids {
        let referencer = root.rel(id).relid;
        for src in root.rel(id).lateral_relids.iter().collect::<Vec<_>>() {
            if let Some(src_id) = root.base_rel_id(src) {
                root.rel_mut(src_id).lateral_referencers.add(referencer);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Join tree deconstruction
// ---------------------------------------------------------------------------

struct JoinTreeItem {
    /// Every base and outer-join relid in the subtree, including this join's own.
    qualscope: Relids,
    /// Base rels joined by inner joins within the subtree.
    inner_join_rels: Relids,
    /// Left and right inputs' qualscopes, for joins.
    left_rels: Relids,
    right_rels: Relids,
    /// Rels whose columns the join's ON clause may not be pushed past.
    nonnullable_rels: Option<Relids>,
    /// Domain the item itself sits in.
    jdomain: JoinDomainId,
    /// Domains of a join's inputs; an outer join gives its nullable side a new one.
    left_domain: JoinDomainId,
    right_domain: JoinDomainId,
    sjinfo: Option<usize>,
    quals: Vec<Expr>,
}

/// Where and how one group of qual conjuncts is distributed.
#[derive(Debug, Clone)]
struct QualPlacement {
    jdomain: JoinDomainId,
    qualscope: Relids,
    ojscope: Option<Relids>,
    outerjoin_nonnullable: Option<Relids>,
    incompatible_relids: Option<Relids>,
    allow_equivalence: bool,
    has_clone: bool,
    is_clone: bool,
}

/// Builds the SpecialJoinInfo list and distributes every qual of the join tree.
pub fn deconstruct_jointree(root: &mut PlannerInfo) -> Result<()> {
    let top_domain = add_join_domain(root, Relids::new());
    let jointree = root.parse.jointree.clone();
    let mut items = Vec::new();
    let top = deconstruct_recurse(root, &jointree, top_domain, &mut items)?;
    let top_scope = items[top].qualscope.clone();
    root.join_domains[top_domain.0].jd_relids = top_scope.clone();
    root.all_query_rels = top_scope;

    // the final output sees every outer join that nulls a rel
    let nullers: Vec<Relids> = (0..root.simple_rel_array.len())
        .map(|rti| root.nullers_of(rti))
        .collect();
    let lookup = |varno: Index| nullers.get(varno).cloned().unwrap_or_default();
    for tle in &mut root.processed_tlist {
        tle.expr = add_nulling_relids(std::mem::replace(&mut tle.expr, Expr::bool_const(true)), &lookup);
    }
    if let Some(having) = root.having_qual.take() {
        root.having_qual = Some(add_nulling_relids(having, &lookup));
    }

    for idx in 0..items.len() {
        root.check_for_interrupts()?;
        deconstruct_distribute(root, &items, idx)?;
    }
    Ok(())
}

fn add_join_domain(root: &mut PlannerInfo, jd_relids: Relids) -> JoinDomainId {
    root.join_domains.push(JoinDomain { jd_relids });
    JoinDomainId(root.join_domains.len() - 1)
}

fn deconstruct_recurse(
    root: &mut PlannerInfo,
    node: &JoinTreeNode,
    jdomain: JoinDomainId,
    items: &mut Vec<JoinTreeItem>,
) -> Result<usize> {
    let item = match node {
        JoinTreeNode::Rel(rti) => {
            root.find_base_rel(*rti)?;
            JoinTreeItem {
                qualscope: Relids::singleton(*rti),
                inner_join_rels: Relids::new(),
                left_rels: Relids::new(),
                right_rels: Relids::new(),
                nonnullable_rels: None,
                jdomain,
                left_domain: jdomain,
                right_domain: jdomain,
                sjinfo: None,
                quals: Vec::new(),
            }
        }
        JoinTreeNode::From { items: children, quals } => {
            let mut qualscope = Relids::new();
            let mut inner_join_rels = Relids::new();
            for child in children {
                let idx = deconstruct_recurse(root, child, jdomain, items)?;
                qualscope.union_with(&items[idx].qualscope);
                inner_join_rels.union_with(&items[idx].inner_join_rels);
            }
            if children.len() > 1 {
                inner_join_rels = qualscope.clone();
            }
            let quals = mark_quals(root, quals, &qualscope);
            JoinTreeItem {
                qualscope,
                inner_join_rels,
                left_rels: Relids::new(),
                right_rels: Relids::new(),
                nonnullable_rels: None,
                jdomain,
                left_domain: jdomain,
                right_domain: jdomain,
                sjinfo: None,
                quals,
            }
        }
        JoinTreeNode::Join {
            jointype,
            larg,
            rarg,
            quals,
            rtindex,
        } => {
            // a right join is a left join with its inputs swapped
            let (jointype, larg, rarg) = match jointype {
                JoinType::Right => (JoinType::Left, rarg, larg),
                other => (*other, larg, rarg),
            };
            deconstruct_join(root, jointype, larg, rarg, quals, *rtindex, jdomain, items)?
        }
    };
    items.push(item);
    Ok(items.len() - 1)
}

#[allow(clippy::too_many_arguments)]
fn deconstruct_join(
    root: &mut PlannerInfo,
    jointype: JoinType,
    larg: &JoinTreeNode,
    rarg: &JoinTreeNode,
    quals: &[Expr],
    rtindex: Option<Index>,
    jdomain: JoinDomainId,
    items: &mut Vec<JoinTreeItem>,
) -> Result<JoinTreeItem> {
    let (left_domain, right_domain) = match jointype {
        JoinType::Inner | JoinType::Semi => (jdomain, jdomain),
        JoinType::Left | JoinType::Right | JoinType::Anti => (jdomain, add_join_domain(root, Relids::new())),
        JoinType::Full => (
            add_join_domain(root, Relids::new()),
            add_join_domain(root, Relids::new()),
        ),
    };
    let l = deconstruct_recurse(root, larg, left_domain, items)?;
    let r = deconstruct_recurse(root, rarg, right_domain, items)?;
    let left_rels = items[l].qualscope.clone();
    let right_rels = items[r].qualscope.clone();
    if left_domain != jdomain {
        root.join_domains[left_domain.0].jd_relids = left_rels.clone();
    }
    if right_domain != jdomain {
        root.join_domains[right_domain.0].jd_relids = right_rels.clone();
    }
    let below = left_rels.union(&right_rels);
    let quals = mark_quals(root, quals, &below);

    let ojrelid = match jointype {
        JoinType::Left | JoinType::Right | JoinType::Anti | JoinType::Full => {
            let oj = rtindex.ok_or_else(|| {
                PlanError::InvalidInput(format!("{jointype:?} join has no range-table entry"))
            })?;
            if !matches!(root.parse.rte(oj)?.kind, RteKind::Join) {
                return Err(PlanError::InvalidInput(format!(
                    "outer-join relid {oj} does not name a join entry"
                )));
            }
            oj
        }
        _ => 0,
    };

    let (qualscope, inner_join_rels, nonnullable_rels) = match jointype {
        JoinType::Inner => (below.clone(), below.clone(), None),
        JoinType::Semi => (
            below.clone(),
            items[l].inner_join_rels.union(&items[r].inner_join_rels),
            None,
        ),
        JoinType::Left | JoinType::Right | JoinType::Anti => (
            below.with(ojrelid),
            items[l].inner_join_rels.union(&items[r].inner_join_rels),
            Some(left_rels.clone()),
        ),
        JoinType::Full => (
            below.with(ojrelid),
            items[l].inner_join_rels.union(&items[r].inner_join_rels),
            Some(below.clone()),
        ),
    };

    let sjinfo = if jointype == JoinType::Inner {
        None
    } else {
        let info = make_outerjoininfo(
            root,
            &left_rels,
            &right_rels,
            &inner_join_rels,
            jointype,
            ojrelid,
            &quals,
        );
        if ojrelid != 0 {
            root.outer_join_rels.add(ojrelid);
            let nullable = if jointype == JoinType::Full {
                below.clone()
            } else {
                right_rels.clone()
            };
            for relid in nullable.iter() {
                if let Some(id) = root.base_rel_id(relid) {
                    root.rel_mut(id).nulling_relids.add(ojrelid);
                }
            }
        }
        root.join_info_list.push(info);
        Some(root.join_info_list.len() - 1)
    };

    Ok(JoinTreeItem {
        qualscope,
        inner_join_rels,
        left_rels,
        right_rels,
        nonnullable_rels,
        jdomain,
        left_domain,
        right_domain,
        sjinfo,
        quals,
    })
}

/// Splits quals into conjuncts and labels each column reference with the
/// outer joins inside `scope` that null it.
fn mark_quals(root: &PlannerInfo, quals: &[Expr], scope: &Relids) -> Vec<Expr> {
    quals
        .iter()
        .flat_map(|q| q.clone().into_conjuncts())
        .map(|q| add_nulling_relids(q, &|varno| root.nullers_of(varno).intersect(scope)))
        .collect()
}

/// Describes a non-inner join: its minimal input sets and which lower outer
/// joins it may commute with.
pub fn make_outerjoininfo(
    root: &mut PlannerInfo,
    left_rels: &Relids,
    right_rels: &Relids,
    inner_join_rels: &Relids,
    jointype: JoinType,
    ojrelid: Index,
    clauses: &[Expr],
) -> SpecialJoinInfo {
    let mut sjinfo = SpecialJoinInfo::dummy(left_rels, right_rels);
    sjinfo.jointype = jointype;
    sjinfo.ojrelid = ojrelid;

    if jointype == JoinType::Full {
        // full joins do not commute with anything
        for other in &root.join_info_list {
            if other.ojrelid == 0 {
                continue;
            }
            if left_rels.overlaps(&other.syn_lefthand) || left_rels.overlaps(&other.syn_righthand) {
                sjinfo.min_lefthand.add(other.ojrelid);
            }
            if right_rels.overlaps(&other.syn_lefthand) || right_rels.overlaps(&other.syn_righthand) {
                sjinfo.min_righthand.add(other.ojrelid);
            }
        }
        sjinfo.min_lefthand.union_with(&left_rels.intersect(&root.outer_join_rels));
        sjinfo.min_righthand.union_with(&right_rels.intersect(&root.outer_join_rels));
        return sjinfo;
    }

    let clause = crate::expr::make_ands_explicit(clauses.to_vec());
    let clause_relids = pull_varnos(&clause);
    let strict_relids = find_nonnullable_rels(&clause);
    sjinfo.lhs_strict = strict_relids.overlaps(left_rels);

    let mut min_lefthand = clause_relids.intersect(left_rels);
    let mut min_righthand = clause_relids.union(inner_join_rels).intersect(right_rels);

    for other in &root.join_info_list {
        if other.jointype == JoinType::Full {
            if left_rels.overlaps(&other.syn_lefthand) || left_rels.overlaps(&other.syn_righthand) {
                min_lefthand.union_with(&other.syn_lefthand);
                min_lefthand.union_with(&other.syn_righthand);
                min_lefthand.add(other.ojrelid);
            }
            if right_rels.overlaps(&other.syn_lefthand) || right_rels.overlaps(&other.syn_righthand) {
                min_righthand.union_with(&other.syn_lefthand);
                min_righthand.union_with(&other.syn_righthand);
                min_righthand.add(other.ojrelid);
            }
            continue;
        }

        if left_rels.overlaps(&other.syn_righthand) {
            let preserve = clause_relids.overlaps(&other.syn_righthand)
                && (matches!(jointype, JoinType::Semi | JoinType::Anti)
                    || !strict_relids.overlaps(&other.min_righthand));
            if preserve {
                min_lefthand.union_with(&other.syn_lefthand);
                min_lefthand.union_with(&other.syn_righthand);
                if other.ojrelid != 0 {
                    min_lefthand.add(other.ojrelid);
                }
            } else if jointype == JoinType::Left
                && other.jointype == JoinType::Left
                && strict_relids.overlaps(&other.min_righthand)
                && !clause_relids.overlaps(&other.syn_lefthand)
            {
                min_lefthand.remove(other.ojrelid);
                sjinfo.commute_below_l.add(other.ojrelid);
            }
        }

        if right_rels.overlaps(&other.syn_righthand) {
            min_righthand.union_with(&other.syn_lefthand);
            min_righthand.union_with(&other.syn_righthand);
            if other.ojrelid != 0 {
                min_righthand.add(other.ojrelid);
            }
        }
    }

    // a join must have at least one rel on each side
    if min_lefthand.intersect(&root.all_baserels).is_empty() {
        min_lefthand = left_rels.clone();
    }
    if min_righthand.intersect(&root.all_baserels).is_empty() {
        min_righthand = right_rels.clone();
    }
    sjinfo.min_lefthand = min_lefthand;
    sjinfo.min_righthand = min_righthand;

    if jointype == JoinType::Semi {
        compute_semijoin_info(root, &mut sjinfo, clauses);
    }

    for lower in sjinfo.commute_below_l.iter() {
        if let Some(other) = root.join_info_list.iter_mut().find(|o| o.ojrelid == lower) {
            other.commute_above_l.add(ojrelid);
        }
    }
    sjinfo
}

/// Records the equality operators of a semijoin and the right-hand
/// expressions they compare, when every conjunct has that shape.
fn compute_semijoin_info(root: &PlannerInfo, sjinfo: &mut SpecialJoinInfo, clauses: &[Expr]) {
    let mut operators = Vec::new();
    let mut rhs_exprs = Vec::new();
    for clause in clauses {
        let Expr::Op { opno, .. } = clause else {
            return;
        };
        let Some((l, r)) = clause.binary_args() else {
            return;
        };
        let Some(info) = root.catalog.get_operator(*opno) else {
            return;
        };
        if !info.is_equality() {
            return;
        }
        let lrels = pull_varnos(l);
        let rrels = pull_varnos(r);
        let rhs = if lrels.is_subset(&sjinfo.syn_lefthand) && rrels.is_subset(&sjinfo.syn_righthand) {
            r
        } else if rrels.is_subset(&sjinfo.syn_lefthand) && lrels.is_subset(&sjinfo.syn_righthand) {
            l
        } else {
            return;
        };
        if contain_volatile_functions(rhs) {
            return;
        }
        operators.push(*opno);
        rhs_exprs.push(rhs.clone());
    }
    sjinfo.semi_operators = operators;
    sjinfo.semi_rhs_exprs = rhs_exprs;
}

fn deconstruct_distribute(root: &mut PlannerInfo, items: &[JoinTreeItem], idx: usize) -> Result<()> {
    let item = &items[idx];
    let sjinfo = item.sjinfo.map(|i| root.join_info_list[i].clone());
    match sjinfo {
        Some(sj) if sj.ojrelid != 0 => distribute_oj_quals(root, items, idx, &sj),
        _ => {
            let placement = QualPlacement {
                jdomain: item.jdomain,
                qualscope: item.qualscope.clone(),
                ojscope: None,
                outerjoin_nonnullable: None,
                incompatible_relids: None,
                allow_equivalence: true,
                has_clone: false,
                is_clone: false,
            };
            for qual in &item.quals {
                distribute_qual_to_rels(root, qual.clone(), &placement)?;
            }
            Ok(())
        }
    }
}

fn distribute_oj_quals(
    root: &mut PlannerInfo,
    items: &[JoinTreeItem],
    idx: usize,
    sjinfo: &SpecialJoinInfo,
) -> Result<()> {
    let item = &items[idx];
    let ojscope = sjinfo.min_lefthand.union(&sjinfo.min_righthand);
    let nonnullable = item
        .nonnullable_rels
        .clone()
        .unwrap_or_else(|| item.left_rels.clone());
    let base = QualPlacement {
        jdomain: item.jdomain,
        qualscope: item.qualscope.clone(),
        ojscope: Some(ojscope.clone()),
        outerjoin_nonnullable: Some(nonnullable.clone()),
        incompatible_relids: None,
        allow_equivalence: true,
        has_clone: false,
        is_clone: false,
    };

    let commutes = sjinfo.jointype == JoinType::Left && !sjinfo.commute_below_l.is_empty();
    // conjuncts confined to the nullable side read the same in every join order
    let (flexible, fixed): (Vec<Expr>, Vec<Expr>) = item
        .quals
        .iter()
        .cloned()
        .partition(|q| commutes && pull_varnos(q).overlaps(&nonnullable));
    for qual in fixed {
        let placement = QualPlacement {
            jdomain: qual_domain(item, &qual),
            ..base.clone()
        };
        distribute_qual_to_rels(root, qual, &placement)?;
    }
    if flexible.is_empty() {
        return Ok(());
    }

    let joins_below = sjinfo.commute_below_l.clone();
    let mut quals: Vec<Expr> = flexible
        .into_iter()
        .map(|q| remove_nulling_relids(q, &joins_below))
        .collect();
    let mut incompatible = joins_below.with(sjinfo.ojrelid);
    let save_serial = root.last_rinfo_serial;
    let mut joins_so_far = Relids::new();

    // visit the commuting joins in syntactic nesting order, restoring the
    // lower joins' markers one level at a time
    for other_item in items.iter().take(idx + 1) {
        let Some(other_idx) = other_item.sjinfo else {
            continue;
        };
        let other = root.join_info_list[other_idx].clone();
        let below = joins_below.contains(other.ojrelid) && other.ojrelid != 0;
        if !below && other.ojrelid != sjinfo.ojrelid {
            continue;
        }
        root.last_rinfo_serial = save_serial;

        let first = joins_so_far.is_empty();
        let placement = QualPlacement {
            qualscope: other_item.qualscope.union(&joins_so_far),
            ojscope: Some(ojscope.union(&joins_so_far)),
            incompatible_relids: Some(incompatible.clone()),
            allow_equivalence: first,
            has_clone: first,
            is_clone: !first,
            ..base.clone()
        };
        trace!(
            ojrelid = sjinfo.ojrelid,
            level = other.ojrelid,
            has_clone = placement.has_clone,
            "distributing commuted join clause"
        );
        for qual in &quals {
            distribute_qual_to_rels(root, qual.clone(), &placement)?;
        }

        if below {
            let syn_rhs = other.syn_righthand.clone();
            let oj = other.ojrelid;
            quals = quals
                .into_iter()
                .map(|q| {
                    add_nulling_relids(q, &|varno| {
                        if syn_rhs.contains(varno) {
                            Relids::singleton(oj)
                        } else {
                            Relids::new()
                        }
                    })
                })
                .collect();
            incompatible.remove(oj);
        }
        joins_so_far.add(other.ojrelid);
    }
    Ok(())
}

/// Join domain for one conjunct of an outer join's ON clause. A conjunct
/// confined to one input belongs to that input's domain, so a constant it
/// equates never merges with the same constant from outside the join.
fn qual_domain(item: &JoinTreeItem, qual: &Expr) -> JoinDomainId {
    let varnos = pull_varnos(qual);
    if varnos.is_empty() {
        item.jdomain
    } else if varnos.is_subset(&item.right_rels) {
        item.right_domain
    } else if varnos.is_subset(&item.left_rels) {
        item.left_domain
    } else {
        item.jdomain
    }
}

fn distribute_qual_to_rels(root: &mut PlannerInfo, clause: Expr, placement: &QualPlacement) -> Result<()> {
    if clause.is_true_const() {
        return Ok(());
    }
    if contain_set_returning_functions(&clause) {
        return Err(PlanError::Unsupported(format!(
            "set-returning function in qualification {clause}"
        )));
    }
    let mut relids = pull_varnos(&clause);
    let scope = placement.ojscope.as_ref().unwrap_or(&placement.qualscope);
    if !relids.is_subset(&placement.qualscope.union(scope)) {
        return Err(PlanError::InvalidInput(format!(
            "qualification {clause} refers to relations outside its join"
        )));
    }

    let mut pseudoconstant = false;
    if relids.is_empty() {
        match &placement.ojscope {
            Some(ojscope) => relids = ojscope.clone(),
            None => {
                relids = placement.qualscope.clone();
                pseudoconstant = !contain_volatile_functions(&clause);
            }
        }
    }

    let (is_pushed_down, maybe_equivalence) = match &placement.outerjoin_nonnullable {
        Some(nonnullable) if relids.overlaps(nonnullable) => {
            if let Some(ojscope) = &placement.ojscope {
                relids = ojscope.clone();
            }
            (false, false)
        }
        _ => (true, placement.allow_equivalence),
    };

    if relids.membership() == Membership::Multiple {
        let vars = pull_var_clause(
            &clause,
            PullVarFlags {
                include_aggregates: false,
                include_placeholders: true,
            },
        );
        let where_needed = if placement.is_clone {
            relids.intersect(&root.all_baserels)
        } else {
            relids.clone()
        };
        add_vars_to_targetlist(root, &vars, &where_needed);
    }

    let rinfo = make_restrictinfo(
        root,
        clause,
        RinfoOptions {
            is_pushed_down,
            has_clone: placement.has_clone,
            is_clone: placement.is_clone,
            pseudoconstant,
            security_level: 0,
            required_relids: Some(relids),
            incompatible_relids: placement.incompatible_relids.clone(),
            outer_relids: placement.outerjoin_nonnullable.clone(),
        },
    );
    let mergejoinable = rinfo.is_mergejoinable();
    let id = root.add_rinfo(rinfo);

    if mergejoinable {
        if maybe_equivalence && !pseudoconstant && process_equivalence(root, id, placement.jdomain) {
            return Ok(());
        }
        initialize_mergeclause_eclasses(root, id);
    }
    distribute_restrictinfo_to_rels(root, id)
}

/// Files a clause with the rels that evaluate it: the base rel's restriction
/// list when one base rel suffices, otherwise the join lists of every base rel
/// it needs.
pub fn distribute_restrictinfo_to_rels(root: &mut PlannerInfo, id: RinfoId) -> Result<()> {
    let relids = root.rinfo(id).required_relids.clone();
    let security_level = root.rinfo(id).security_level;
    let base: Vec<RelId> = relids.iter().filter_map(|r| root.base_rel_id(r)).collect();
    match (relids.membership(), base.as_slice()) {
        (Membership::Singleton, [rel]) => {
            let rel = root.rel_mut(*rel);
            rel.baserestrictinfo.push(id);
            rel.baserestrict_min_security = rel.baserestrict_min_security.min(security_level);
            Ok(())
        }
        (Membership::Empty, _) | (_, []) => Err(PlanError::InvalidInput(format!(
            "cannot place clause {} with no relations",
            root.rinfo(id).clause
        ))),
        _ => {
            for rel in base {
                root.rel_mut(rel).joininfo.push(id);
            }
            Ok(())
        }
    }
}

/// Removes a join clause from the join lists of the rels it was filed with.
pub fn remove_join_clause_from_rels(root: &mut PlannerInfo, id: RinfoId) {
    let relids = root.rinfo(id).required_relids.clone();
    for relid in relids.iter() {
        if let Some(rel) = root.base_rel_id(relid) {
            root.rel_mut(rel).joininfo.retain(|r| *r != id);
        }
    }
}

/// Builds `item1 = item2` with the given operator.
fn make_equality_clause(opno: Oid, item1: &Expr, item2: &Expr) -> Expr {
    Expr::op(opno, item1.clone(), item2.clone())
}

/// Creates and distributes a restriction derived from an equivalence class,
/// returning its id.
pub fn process_implied_equality(
    root: &mut PlannerInfo,
    opno: Oid,
    item1: &Expr,
    item2: &Expr,
    qualscope: &Relids,
    security_level: u32,
) -> Result<RinfoId> {
    let clause = make_equality_clause(opno, item1, item2);
    let mut relids = pull_varnos(&clause);
    let mut pseudoconstant = false;
    if relids.is_empty() {
        relids = qualscope.clone();
        pseudoconstant = !contain_volatile_functions(&clause);
    }
    if relids.membership() == Membership::Multiple {
        let vars = pull_var_clause(
            &clause,
            PullVarFlags {
                include_aggregates: false,
                include_placeholders: true,
            },
        );
        add_vars_to_targetlist(root, &vars, &relids);
    }
    let rinfo = make_restrictinfo(
        root,
        clause,
        RinfoOptions {
            is_pushed_down: true,
            pseudoconstant,
            security_level,
            required_relids: Some(relids),
            ..Default::default()
        },
    );
    let id = root.add_rinfo(rinfo);
    distribute_restrictinfo_to_rels(root, id)?;
    Ok(id)
}

/// Builds, without distributing, a join clause derived from an equivalence
/// class.
pub fn build_implied_join_equality(
    root: &mut PlannerInfo,
    opno: Oid,
    item1: &Expr,
    item2: &Expr,
    qualscope: &Relids,
    security_level: u32,
) -> RestrictInfo {
    let clause = make_equality_clause(opno, item1, item2);
    make_restrictinfo(
        root,
        clause,
        RinfoOptions {
            is_pushed_down: true,
            security_level,
            required_relids: Some(qualscope.clone()),
            ..Default::default()
        },
    )
}

/// Recomputes every base rel's `attr_needed`, output columns and every
/// placeholder's `ph_needed` from the clauses that are still live.
pub fn rebuild_attr_needed(root: &mut PlannerInfo) {
    for id in root.base_rel_ids() {
        let rel = root.rel_mut(id);
        for needed in &mut rel.attr_needed {
            *needed = Relids::new();
        }
        rel.reltarget.exprs.clear();
    }
    for phinfo in &mut root.placeholder_list {
        phinfo.ph_needed = Relids::new();
    }

    build_base_rel_tlists(root);

    let flags = PullVarFlags {
        include_aggregates: false,
        include_placeholders: true,
    };
    let mut seen = std::collections::BTreeSet::new();
    let mut pending: Vec<(Vec<Expr>, Relids)> = Vec::new();
    for id in root.base_rel_ids() {
        for rinfo_id in &root.rel(id).joininfo {
            if !seen.insert(*rinfo_id) {
                continue;
            }
            let rinfo = root.rinfo(*rinfo_id);
            let where_needed = if rinfo.is_clone {
                rinfo.required_relids.intersect(&root.all_baserels)
            } else {
                rinfo.required_relids.clone()
            };
            pending.push((pull_var_clause(&rinfo.clause, flags), where_needed));
        }
    }
    for ec in &root.eq_classes {
        if ec.ec_merged.is_some() || ec.ec_relids.intersect(&root.all_baserels).len() < 2 {
            continue;
        }
        for em in ec.ec_members.iter().filter(|em| !em.em_is_child && !em.em_is_const) {
            pending.push((pull_var_clause(&em.em_expr, flags), ec.ec_relids.clone()));
        }
    }
    for (vars, where_needed) in pending {
        add_vars_to_targetlist(root, &vars, &where_needed);
    }
    find_lateral_references(root);
    crate::placeholder::fix_placeholder_input_needed_levels(root);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalog, RelationInfo};
    use crate::config::PlannerConfig;
    use crate::expr::oids;
    use crate::query::{join_node, Query};
    use crate::relids;
    use std::sync::Arc;

    fn catalog() -> Arc<InMemoryCatalog> {
        let mut catalog = InMemoryCatalog::new();
        for oid in 100..104 {
            catalog.add_relation(oid, RelationInfo::new(1000.0, 2));
        }
        Arc::new(catalog)
    }

    fn eq(l: Expr, r: Expr) -> Expr {
        Expr::op(oids::INT4EQ, l, r)
    }

    fn setup(query: Query) -> PlannerInfo {
        let mut root = PlannerInfo::new(query, catalog(), PlannerConfig::default());
        add_base_rels_to_query(&mut root).unwrap();
        build_base_rel_tlists(&mut root);
        deconstruct_jointree(&mut root).unwrap();
        root
    }

    /// (a LEFT JOIN b ON a.1 = b.1) LEFT JOIN c ON b.2 = c.1
    fn commuting_left_joins() -> Query {
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 101);
        let c = q.add_relation("c", 102);
        let l = q.add_join_rte("l");
        let u = q.add_join_rte("u");
        let lower = join_node(
            JoinType::Left,
            JoinTreeNode::Rel(a),
            JoinTreeNode::Rel(b),
            vec![eq(Expr::int4_var(a, 1), Expr::int4_var(b, 1))],
            Some(l),
        );
        q.jointree = JoinTreeNode::From {
            items: vec![join_node(
                JoinType::Left,
                lower,
                JoinTreeNode::Rel(c),
                vec![eq(Expr::int4_var(b, 2), Expr::int4_var(c, 1))],
                Some(u),
            )],
            quals: vec![],
        };
        q.add_target("x", Expr::int4_var(a, 2));
        q
    }

    #[test]
    fn test_where_quals_become_restrictions_and_join_clauses() {
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 101);
        q.jointree = JoinTreeNode::From {
            items: vec![JoinTreeNode::Rel(a), JoinTreeNode::Rel(b)],
            quals: vec![Expr::And(vec![
                Expr::op(oids::INT4GT, Expr::int4_var(a, 2), Expr::int4(0)),
                Expr::op(oids::INT4LT, Expr::int4_var(a, 1), Expr::int4_var(b, 1)),
            ])],
        };
        let root = setup(q);
        let rel_a = root.rel(root.find_base_rel(a).unwrap());
        let rel_b = root.rel(root.find_base_rel(b).unwrap());
        assert_eq!(rel_a.baserestrictinfo.len(), 1);
        assert_eq!(rel_a.joininfo.len(), 1);
        assert_eq!(rel_b.joininfo, rel_a.joininfo);
        let join = root.rinfo(rel_a.joininfo[0]);
        assert_eq!(join.required_relids, relids![1, 2]);
        assert!(join.clause_relids.is_subset(&join.required_relids));
        // column 1 of a is needed at the join
        assert_eq!(rel_a.attr_needed[1], relids![1, 2]);
    }

    #[test]
    fn test_left_join_on_clause_stays_at_join() {
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 101);
        let oj = q.add_join_rte("oj");
        q.jointree = JoinTreeNode::From {
            items: vec![join_node(
                JoinType::Left,
                JoinTreeNode::Rel(a),
                JoinTreeNode::Rel(b),
                vec![Expr::And(vec![
                    eq(Expr::int4_var(a, 1), Expr::int4_var(b, 1)),
                    Expr::op(oids::INT4GT, Expr::int4_var(b, 2), Expr::int4(5)),
                ])],
                Some(oj),
            )],
            quals: vec![Expr::op(oids::INT4GT, Expr::int4_var(b, 2), Expr::int4(7))],
        };
        let root = setup(q);
        assert_eq!(root.join_info_list.len(), 1);
        let sj = &root.join_info_list[0];
        assert_eq!(sj.ojrelid, oj);
        assert_eq!(sj.min_lefthand, relids![a]);
        assert_eq!(sj.min_righthand, relids![b]);
        assert!(sj.lhs_strict);

        let rel_b = root.rel(root.find_base_rel(b).unwrap());
        assert!(rel_b.nulling_relids.contains(oj));
        // the degenerate ON conjunct is pushed into b's scan
        assert_eq!(rel_b.baserestrictinfo.len(), 1);
        let on = root
            .rinfos
            .iter()
            .find(|r| !r.is_pushed_down)
            .expect("outer join clause");
        assert_eq!(on.required_relids, relids![a, b]);
        assert_eq!(on.outer_relids, relids![a]);
        // the WHERE qual reads b after null-extension
        let wher = root
            .rinfos
            .iter()
            .find(|r| r.clause_relids.contains(oj))
            .expect("upper qual");
        assert!(wher.is_pushed_down);
        assert_eq!(wher.required_relids, relids![b, oj]);
    }

    #[test]
    fn test_identity_three_commutation_produces_clones() {
        let root = setup(commuting_left_joins());
        let (l, u) = (4, 5);
        let lower = root.join_info_list.iter().find(|s| s.ojrelid == l).unwrap();
        let upper = root.join_info_list.iter().find(|s| s.ojrelid == u).unwrap();
        assert_eq!(upper.commute_below_l, relids![l]);
        assert_eq!(lower.commute_above_l, relids![u]);
        assert_eq!(upper.min_lefthand, relids![2]);

        let clones: Vec<&RestrictInfo> = root
            .rinfos
            .iter()
            .filter(|r| r.has_clone || r.is_clone)
            .collect();
        assert_eq!(clones.len(), 2);
        assert_eq!(clones[0].rinfo_serial, clones[1].rinfo_serial);
        let plain = clones.iter().find(|r| r.has_clone).unwrap();
        let marked = clones.iter().find(|r| r.is_clone).unwrap();
        assert_eq!(plain.required_relids, relids![2, 3]);
        assert_eq!(plain.incompatible_relids, relids![l, u]);
        assert_eq!(marked.required_relids, relids![2, 3, l]);
        assert_eq!(marked.incompatible_relids, relids![u]);
    }

    #[test]
    fn test_full_join_clause_is_not_pushed_down() {
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 101);
        let oj = q.add_join_rte("oj");
        q.jointree = join_node(
            JoinType::Full,
            JoinTreeNode::Rel(a),
            JoinTreeNode::Rel(b),
            vec![Expr::And(vec![
                eq(Expr::int4_var(a, 1), Expr::int4_var(b, 1)),
                eq(Expr::int4_var(b, 2), Expr::int4(5)),
            ])],
            Some(oj),
        );
        let root = setup(q);
        for rinfo in &root.rinfos {
            assert!(!rinfo.is_pushed_down);
            assert_eq!(rinfo.required_relids, relids![a, b]);
        }
        assert!(root.rel(root.find_base_rel(a).unwrap()).nulling_relids.contains(oj));
    }

    #[test]
    fn test_outer_join_without_rte_is_invalid() {
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 101);
        q.jointree = join_node(
            JoinType::Left,
            JoinTreeNode::Rel(a),
            JoinTreeNode::Rel(b),
            vec![eq(Expr::int4_var(a, 1), Expr::int4_var(b, 1))],
            None,
        );
        let mut root = PlannerInfo::new(q, catalog(), PlannerConfig::default());
        add_base_rels_to_query(&mut root).unwrap();
        assert!(matches!(deconstruct_jointree(&mut root), Err(PlanError::InvalidInput(_))));
    }

    #[test]
    fn test_dangling_rtindex_is_invalid() {
        let mut q = Query::new();
        q.jointree = JoinTreeNode::Rel(9);
        let mut root = PlannerInfo::new(q, catalog(), PlannerConfig::default());
        assert!(matches!(add_base_rels_to_query(&mut root), Err(PlanError::InvalidInput(_))));
    }

    #[test]
    fn test_qual_referencing_outside_rel_is_invalid() {
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let b = q.add_relation("b", 101);
        let c = q.add_relation("c", 102);
        q.jointree = JoinTreeNode::From {
            items: vec![
                join_node(
                    JoinType::Inner,
                    JoinTreeNode::Rel(a),
                    JoinTreeNode::Rel(b),
                    vec![eq(Expr::int4_var(a, 1), Expr::int4_var(c, 1))],
                    None,
                ),
                JoinTreeNode::Rel(c),
            ],
            quals: vec![],
        };
        let mut root = PlannerInfo::new(q, catalog(), PlannerConfig::default());
        add_base_rels_to_query(&mut root).unwrap();
        assert!(matches!(deconstruct_jointree(&mut root), Err(PlanError::InvalidInput(_))));
    }

    #[test]
    fn test_set_returning_function_in_qual_is_unsupported() {
        let mut q = Query::new();
        let a = q.add_relation("a", 100);
        let srf = Expr::Func {
            funcid: 1,
            name: "generate_series".into(),
            volatility: crate::expr::Volatility::Immutable,
            leakproof: true,
            retset: true,
            args: vec![Expr::int4_var(a, 1)],
        };
        q.jointree = JoinTreeNode::From {
            items: vec![JoinTreeNode::Rel(a)],
            quals: vec![eq(srf, Expr::int4(1))],
        };
        let mut root = PlannerInfo::new(q, catalog(), PlannerConfig::default());
        add_base_rels_to_query(&mut root).unwrap();
        assert!(matches!(deconstruct_jointree(&mut root), Err(PlanError::Unsupported(_))));
    }
}
