//! # Equivalence Classes
//!
//! A mergejoinable equality `a = b` found in a pushed-down qual says that `a`
//! and `b` are interchangeable wherever the qual has been applied. Such quals
//! are absorbed into [`EquivalenceClass`]es instead of being filed directly.
//! Once all quals are read, [`generate_base_implied_equalities`] derives the
//! restrictions each scan must enforce, and
//! [`generate_join_implied_equalities`] produces, for any proposed join, the
//! smallest set of join clauses that enforces the class across that join.
//!
//! Constants belong to the join domain they appeared in. Two `= 5` members
//! from different domains never match, since a constant below an outer join is
//! not known to hold above it.
//!
//! A class whose members cannot all be compared by one operator family is
//! marked broken; it then falls back to enforcing its original source clauses.

use crate::catalog::BtStrategy;
use crate::error::Result;
use crate::expr::{contain_volatile_functions, pull_var_clause, pull_varnos, Expr, Oid, PullVarFlags, INVALID_OID};
use crate::initsplan::{add_vars_to_targetlist, build_implied_join_equality, distribute_restrictinfo_to_rels, process_implied_equality};
use crate::planner_info::{EcId, EmRef, JoinDomainId, PlannerInfo, RelId, RinfoId};
use crate::query::AppendRelInfo;
use crate::relids::{Index, Membership, Relids};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, trace};

/// The part of the join tree within which a constant equality is known to hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinDomain {
    pub jd_relids: Relids,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquivalenceMember {
    pub em_expr: Expr,
    pub em_relids: Relids,
    pub em_is_const: bool,
    /// Derived for an inheritance child; used only for matching on that child.
    pub em_is_child: bool,
    pub em_datatype: Oid,
    pub em_jdomain: JoinDomainId,
    /// Member of the parent rel this child member was translated from.
    pub em_parent: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquivalenceClass {
    pub ec_opfamilies: Vec<Oid>,
    pub ec_collation: Oid,
    pub ec_members: Vec<EquivalenceMember>,
    /// Quals the class was built from.
    pub ec_sources: Vec<RinfoId>,
    /// Clauses generated from the class, cached for reuse.
    pub ec_derives: Vec<RinfoId>,
    pub ec_relids: Relids,
    pub ec_has_const: bool,
    pub ec_has_volatile: bool,
    pub ec_broken: bool,
    pub ec_sortref: u32,
    pub ec_min_security: u32,
    pub ec_max_security: u32,
    /// Set once this class has been folded into another.
    pub ec_merged: Option<EcId>,
}

impl EquivalenceClass {
    fn new(opfamilies: Vec<Oid>) -> Self {
        Self {
            ec_opfamilies: opfamilies,
            ec_collation: INVALID_OID,
            ec_members: Vec::new(),
            ec_sources: Vec::new(),
            ec_derives: Vec::new(),
            ec_relids: Relids::new(),
            ec_has_const: false,
            ec_has_volatile: false,
            ec_broken: false,
            ec_sortref: 0,
            ec_min_security: u32::MAX,
            ec_max_security: 0,
            ec_merged: None,
        }
    }

    fn add_member(&mut self, expr: Expr, relids: Relids, datatype: Oid, jdomain: JoinDomainId) -> usize {
        let is_const = relids.is_empty() && !contain_volatile_functions(&expr);
        if is_const {
            self.ec_has_const = true;
        } else {
            self.ec_relids.union_with(&relids);
        }
        self.ec_members.push(EquivalenceMember {
            em_expr: expr,
            em_relids: relids,
            em_is_const: is_const,
            em_is_child: false,
            em_datatype: datatype,
            em_jdomain: jdomain,
            em_parent: None,
        });
        self.ec_members.len() - 1
    }

    pub fn is_live(&self) -> bool {
        self.ec_merged.is_none()
    }
}

impl PlannerInfo {
    pub fn em(&self, r: EmRef) -> &EquivalenceMember {
        &self.eq_classes[r.ec.0].ec_members[r.member]
    }
}

/// Follows merge links to the class that absorbed `ec`.
pub fn canonical_ec(root: &PlannerInfo, mut ec: EcId) -> EcId {
    while let Some(next) = root.ec(ec).ec_merged {
        ec = next;
    }
    ec
}

fn live_ecs(root: &PlannerInfo) -> impl Iterator<Item = (EcId, &EquivalenceClass)> + '_ {
    root.eq_classes
        .iter()
        .enumerate()
        .filter(|(_, ec)| ec.is_live())
        .map(|(i, ec)| (EcId(i), ec))
}

fn intersect_families(a: &[Oid], b: &[Oid]) -> Vec<Oid> {
    a.iter().copied().filter(|f| b.contains(f)).collect()
}

fn operator_input_types(root: &PlannerInfo, opno: Oid, left: &Expr, right: &Expr) -> (Oid, Oid) {
    match root.catalog.get_operator(opno) {
        Some(info) => (info.left_type, info.right_type),
        None => (left.type_oid(), right.type_oid()),
    }
}

/// Feeds a mergejoinable equality to the equivalence machinery. Returns false
/// when the clause must instead be filed as an ordinary restriction.
pub fn process_equivalence(root: &mut PlannerInfo, id: RinfoId, jdomain: JoinDomainId) -> bool {
    if root.ec_merging_done {
        return false;
    }
    let rinfo = root.rinfo(id);
    let Some(opno) = rinfo.opno() else {
        return false;
    };
    let Some((item1, item2)) = rinfo.operands().map(|(l, r)| (l.clone(), r.clone())) else {
        return false;
    };
    // X = X is really X IS NOT NULL and stays a plain restriction
    if item1 == item2 {
        return false;
    }
    let opfamilies = rinfo.mergeopfamilies.clone();
    let item1_relids = rinfo.left_relids.clone();
    let item2_relids = rinfo.right_relids.clone();
    let security_level = rinfo.security_level;
    let (type1, type2) = operator_input_types(root, opno, &item1, &item2);

    let mut found1: Option<EmRef> = None;
    let mut found2: Option<EmRef> = None;
    for (ec_id, ec) in live_ecs(root) {
        if ec.ec_has_volatile || intersect_families(&ec.ec_opfamilies, &opfamilies).is_empty() {
            continue;
        }
        for (m, em) in ec.ec_members.iter().enumerate() {
            if em.em_is_child || (em.em_is_const && em.em_jdomain != jdomain) {
                continue;
            }
            if found1.is_none() && em.em_datatype == type1 && em.em_expr == item1 {
                found1 = Some(EmRef { ec: ec_id, member: m });
            }
            if found2.is_none() && em.em_datatype == type2 && em.em_expr == item2 {
                found2 = Some(EmRef { ec: ec_id, member: m });
            }
        }
        if found1.is_some() && found2.is_some() {
            break;
        }
    }

    let (left_em, right_em) = match (found1, found2) {
        (Some(em1), Some(em2)) if em1.ec == em2.ec => {
            let ec = root.ec_mut(em1.ec);
            ec.ec_opfamilies = intersect_families(&ec.ec_opfamilies, &opfamilies);
            (em1, em2)
        }
        (Some(em1), Some(em2)) => {
            let families = intersect_families(
                &intersect_families(&root.ec(em1.ec).ec_opfamilies, &root.ec(em2.ec).ec_opfamilies),
                &opfamilies,
            );
            if families.is_empty() {
                debug!(ec = %em1.ec, other = %em2.ec, "equivalence classes share no operator family");
                root.ec_mut(em1.ec).ec_broken = true;
                return false;
            }
            let offset = merge_equivalence_classes(root, em1.ec, em2.ec, families);
            (
                em1,
                EmRef {
                    ec: em1.ec,
                    member: em2.member + offset,
                },
            )
        }
        (Some(em1), None) => {
            let ec = root.ec_mut(em1.ec);
            ec.ec_opfamilies = intersect_families(&ec.ec_opfamilies, &opfamilies);
            let m = ec.add_member(item2, item2_relids, type2, jdomain);
            (em1, EmRef { ec: em1.ec, member: m })
        }
        (None, Some(em2)) => {
            let ec = root.ec_mut(em2.ec);
            ec.ec_opfamilies = intersect_families(&ec.ec_opfamilies, &opfamilies);
            let m = ec.add_member(item1, item1_relids, type1, jdomain);
            (EmRef { ec: em2.ec, member: m }, em2)
        }
        (None, None) => {
            let mut ec = EquivalenceClass::new(opfamilies);
            let m1 = ec.add_member(item1, item1_relids, type1, jdomain);
            let m2 = ec.add_member(item2, item2_relids, type2, jdomain);
            root.eq_classes.push(ec);
            let ec_id = EcId(root.eq_classes.len() - 1);
            (
                EmRef { ec: ec_id, member: m1 },
                EmRef { ec: ec_id, member: m2 },
            )
        }
    };

    let ec_id = left_em.ec;
    let ec = root.ec_mut(ec_id);
    ec.ec_sources.push(id);
    ec.ec_min_security = ec.ec_min_security.min(security_level);
    ec.ec_max_security = ec.ec_max_security.max(security_level);
    let rinfo = root.rinfo_mut(id);
    rinfo.left_ec = Some(ec_id);
    rinfo.right_ec = Some(ec_id);
    rinfo.left_em = Some(left_em);
    rinfo.right_em = Some(right_em);
    trace!(rinfo = %id, ec = %ec_id, "absorbed equality into equivalence class");
    true
}

/// Folds `from` into `into`, returning the offset at which `from`'s members
/// now start. Clauses that pointed at `from` are redirected.
fn merge_equivalence_classes(root: &mut PlannerInfo, into: EcId, from: EcId, families: Vec<Oid>) -> usize {
    let donor = std::mem::replace(root.ec_mut(from), EquivalenceClass::new(Vec::new()));
    let target = root.ec_mut(into);
    let offset = target.ec_members.len();
    target.ec_opfamilies = families;
    target.ec_members.extend(donor.ec_members);
    target.ec_sources.extend(donor.ec_sources);
    target.ec_derives.extend(donor.ec_derives);
    target.ec_relids.union_with(&donor.ec_relids);
    target.ec_has_const |= donor.ec_has_const;
    target.ec_has_volatile |= donor.ec_has_volatile;
    target.ec_broken |= donor.ec_broken;
    target.ec_min_security = target.ec_min_security.min(donor.ec_min_security);
    target.ec_max_security = target.ec_max_security.max(donor.ec_max_security);
    root.ec_mut(from).ec_merged = Some(into);

    let redirect = |em: &mut Option<EmRef>| {
        if let Some(r) = em {
            if r.ec == from {
                *r = EmRef {
                    ec: into,
                    member: r.member + offset,
                };
            }
        }
    };
    for rinfo in &mut root.rinfos {
        for ec in [&mut rinfo.left_ec, &mut rinfo.right_ec, &mut rinfo.parent_ec] {
            if *ec == Some(from) {
                *ec = Some(into);
            }
        }
        redirect(&mut rinfo.left_em);
        redirect(&mut rinfo.right_em);
    }
    debug!(into = %into, from = %from, "merged equivalence classes");
    offset
}

/// Finds the class containing `expr` sorted by `opfamilies`, creating a
/// single-member class if asked to.
pub fn get_eclass_for_sort_expr(
    root: &mut PlannerInfo,
    expr: &Expr,
    opfamilies: &[Oid],
    datatype: Oid,
    jdomain: JoinDomainId,
    create: bool,
) -> Option<EcId> {
    let volatile = contain_volatile_functions(expr);
    if !volatile {
        for (ec_id, ec) in live_ecs(root) {
            if ec.ec_has_volatile || ec.ec_opfamilies != opfamilies {
                continue;
            }
            let hit = ec.ec_members.iter().any(|em| {
                !em.em_is_child
                    && !(em.em_is_const && em.em_jdomain != jdomain)
                    && em.em_datatype == datatype
                    && em.em_expr == *expr
            });
            if hit {
                return Some(ec_id);
            }
        }
    }
    if !create {
        return None;
    }
    let mut ec = EquivalenceClass::new(opfamilies.to_vec());
    // a volatile expression stands alone and is never matched again
    ec.ec_has_volatile = volatile;
    ec.add_member(expr.clone(), pull_varnos(expr), datatype, jdomain);
    let relids = ec.ec_relids.clone();
    root.eq_classes.push(ec);
    let ec_id = EcId(root.eq_classes.len() - 1);
    if root.ec_merging_done {
        for relid in relids.iter() {
            if let Some(rel) = root.base_rel_id(relid) {
                root.rel_mut(rel).eclass_indexes.add(ec_id.0);
            }
        }
    }
    Some(ec_id)
}

/// Gives an outer-join or otherwise non-absorbed mergejoinable clause
/// single-member classes for its two sides, so merge joins can sort on them.
pub fn initialize_mergeclause_eclasses(root: &mut PlannerInfo, id: RinfoId) {
    let rinfo = root.rinfo(id);
    let Some((left, right)) = rinfo.operands().map(|(l, r)| (l.clone(), r.clone())) else {
        return;
    };
    let Some(opno) = rinfo.opno() else { return };
    let families = rinfo.mergeopfamilies.clone();
    let (ltype, rtype) = operator_input_types(root, opno, &left, &right);
    let top = JoinDomainId(0);
    let left_ec = get_eclass_for_sort_expr(root, &left, &families, ltype, top, true);
    let right_ec = get_eclass_for_sort_expr(root, &right, &families, rtype, top, true);
    let rinfo = root.rinfo_mut(id);
    rinfo.left_ec = left_ec;
    rinfo.right_ec = right_ec;
}

/// An equality operator in one of the class's families for the given types.
pub fn select_equality_operator(root: &PlannerInfo, ec: EcId, lefttype: Oid, righttype: Oid) -> Option<Oid> {
    root.ec(ec)
        .ec_opfamilies
        .iter()
        .find_map(|fam| root.catalog.get_opfamily_member(*fam, lefttype, righttype, BtStrategy::Equal))
}

/// Derives the restriction clauses implied by every class and records which
/// classes mention each base rel. Ends the merging phase.
pub fn generate_base_implied_equalities(root: &mut PlannerInfo) -> Result<()> {
    root.ec_merging_done = true;
    for i in 0..root.eq_classes.len() {
        root.check_for_interrupts()?;
        let ec_id = EcId(i);
        if !root.ec(ec_id).is_live() {
            continue;
        }
        if root.ec(ec_id).ec_members.len() > 1 {
            if root.ec(ec_id).ec_has_const {
                generate_base_implied_equalities_const(root, ec_id)?;
            } else {
                generate_base_implied_equalities_no_const(root, ec_id)?;
            }
        }
        if root.ec(ec_id).ec_broken {
            generate_base_implied_equalities_broken(root, ec_id)?;
        }

        let ec_relids = root.ec(ec_id).ec_relids.clone();
        let joins = ec_relids.intersect(&root.all_baserels).len() > 1;
        for relid in ec_relids.iter() {
            if let Some(rel) = root.base_rel_id(relid) {
                let rel = root.rel_mut(rel);
                rel.eclass_indexes.add(i);
                rel.has_eclass_joins |= joins;
            }
        }
    }
    Ok(())
}

fn generate_base_implied_equalities_const(root: &mut PlannerInfo, ec_id: EcId) -> Result<()> {
    let ec = root.ec(ec_id);
    // one variable equated to one constant: the original clause suffices
    if ec.ec_members.len() == 2 && ec.ec_sources.len() == 1 {
        let source = ec.ec_sources[0];
        return distribute_restrictinfo_to_rels(root, source);
    }
    let Some(const_idx) = ec
        .ec_members
        .iter()
        .position(|em| em.em_is_const && matches!(em.em_expr, Expr::Const { .. }))
        .or_else(|| ec.ec_members.iter().position(|em| em.em_is_const))
    else {
        return Ok(());
    };
    let const_em = ec.ec_members[const_idx].clone();
    let ec_relids = ec.ec_relids.clone();
    let security = ec.ec_min_security;
    let members: Vec<(usize, EquivalenceMember)> = ec
        .ec_members
        .iter()
        .cloned()
        .enumerate()
        .filter(|(i, em)| *i != const_idx && !em.em_is_const && !em.em_is_child)
        .collect();
    for (idx, em) in members {
        let Some(eq_op) = select_equality_operator(root, ec_id, em.em_datatype, const_em.em_datatype) else {
            debug!(ec = %ec_id, "no equality operator for constant member, class is broken");
            root.ec_mut(ec_id).ec_broken = true;
            break;
        };
        let id = process_implied_equality(root, eq_op, &em.em_expr, &const_em.em_expr, &ec_relids, security)?;
        let rinfo = root.rinfo_mut(id);
        rinfo.parent_ec = Some(ec_id);
        if !rinfo.mergeopfamilies.is_empty() {
            rinfo.left_ec = Some(ec_id);
            rinfo.right_ec = Some(ec_id);
            rinfo.left_em = Some(EmRef { ec: ec_id, member: idx });
            rinfo.right_em = Some(EmRef {
                ec: ec_id,
                member: const_idx,
            });
        }
        root.ec_mut(ec_id).ec_derives.push(id);
    }
    Ok(())
}

fn generate_base_implied_equalities_no_const(root: &mut PlannerInfo, ec_id: EcId) -> Result<()> {
    let ec = root.ec(ec_id);
    let ec_relids = ec.ec_relids.clone();
    let security = ec.ec_min_security;
    let members: Vec<EquivalenceMember> = ec.ec_members.clone();
    let mut prev_ems: HashMap<Index, usize> = HashMap::new();
    for (idx, em) in members.iter().enumerate() {
        if em.em_is_child {
            continue;
        }
        let Some(relid) = em.em_relids.singleton_member() else {
            continue;
        };
        if let Some(&prev_idx) = prev_ems.get(&relid) {
            let prev = &members[prev_idx];
            let Some(eq_op) = select_equality_operator(root, ec_id, prev.em_datatype, em.em_datatype) else {
                root.ec_mut(ec_id).ec_broken = true;
                break;
            };
            let id = process_implied_equality(root, eq_op, &prev.em_expr, &em.em_expr, &ec_relids, security)?;
            let rinfo = root.rinfo_mut(id);
            rinfo.parent_ec = Some(ec_id);
            if !rinfo.mergeopfamilies.is_empty() {
                rinfo.left_ec = Some(ec_id);
                rinfo.right_ec = Some(ec_id);
                rinfo.left_em = Some(EmRef {
                    ec: ec_id,
                    member: prev_idx,
                });
                rinfo.right_em = Some(EmRef { ec: ec_id, member: idx });
            }
            root.ec_mut(ec_id).ec_derives.push(id);
        }
        prev_ems.insert(relid, idx);
    }

    // every member must be available at any join that might enforce the class
    let flags = PullVarFlags {
        include_aggregates: false,
        include_placeholders: true,
    };
    for em in &members {
        if em.em_is_child {
            continue;
        }
        let vars = pull_var_clause(&em.em_expr, flags);
        add_vars_to_targetlist(root, &vars, &ec_relids);
    }
    Ok(())
}

fn generate_base_implied_equalities_broken(root: &mut PlannerInfo, ec_id: EcId) -> Result<()> {
    let has_const = root.ec(ec_id).ec_has_const;
    for source in root.ec(ec_id).ec_sources.clone() {
        let required = &root.rinfo(source).required_relids;
        if has_const || required.membership() != Membership::Multiple {
            distribute_restrictinfo_to_rels(root, source)?;
        }
    }
    Ok(())
}

/// Join clauses needed to enforce every class that spans the proposed join of
/// `outer_relids` and `inner_relids`, producing `join_relids`.
pub fn generate_join_implied_equalities(
    root: &mut PlannerInfo,
    join_relids: &Relids,
    outer_relids: &Relids,
    inner_relids: &Relids,
) -> Vec<RinfoId> {
    let mut ec_ids = Relids::new();
    for relid in inner_relids.iter() {
        if let Some(rel) = root.base_rel_id(relid) {
            ec_ids.union_with(&root.rel(rel).eclass_indexes);
        }
    }
    let mut result = Vec::new();
    for i in ec_ids.iter() {
        let ec_id = EcId(i);
        let ec = root.ec(ec_id);
        if !ec.is_live() || ec.ec_has_const || ec.ec_members.len() <= 1 {
            continue;
        }
        if !ec.ec_relids.overlaps(outer_relids) {
            continue;
        }
        let mut sublist = Vec::new();
        if !ec.ec_broken {
            sublist = generate_join_implied_equalities_normal(root, ec_id, join_relids, outer_relids, inner_relids);
        }
        if root.ec(ec_id).ec_broken {
            sublist = generate_join_implied_equalities_broken(root, ec_id, join_relids, outer_relids, inner_relids);
        }
        result.extend(sublist);
    }
    result
}

fn generate_join_implied_equalities_normal(
    root: &mut PlannerInfo,
    ec_id: EcId,
    join_relids: &Relids,
    outer_relids: &Relids,
    inner_relids: &Relids,
) -> Vec<RinfoId> {
    let mut outer_members = Vec::new();
    let mut inner_members = Vec::new();
    let mut new_members = Vec::new();
    for (i, em) in root.ec(ec_id).ec_members.iter().enumerate() {
        if em.em_is_const || !em.em_relids.is_subset(join_relids) {
            continue;
        }
        if em.em_relids.is_subset(outer_relids) {
            outer_members.push(i);
        } else if em.em_relids.is_subset(inner_relids) {
            inner_members.push(i);
        } else {
            new_members.push(i);
        }
    }

    let mut result = Vec::new();
    if !outer_members.is_empty() && !inner_members.is_empty() {
        // prefer plain columns and hashable operators
        let mut best: Option<(i32, usize, usize, Oid)> = None;
        'search: for &o in &outer_members {
            for &i in &inner_members {
                let (oem, iem) = (&root.ec(ec_id).ec_members[o], &root.ec(ec_id).ec_members[i]);
                let Some(eq_op) = select_equality_operator(root, ec_id, oem.em_datatype, iem.em_datatype) else {
                    continue;
                };
                let mut score = 0;
                if matches!(oem.em_expr, Expr::Var(_)) {
                    score += 1;
                }
                if matches!(iem.em_expr, Expr::Var(_)) {
                    score += 1;
                }
                if root.catalog.get_operator(eq_op).is_some_and(|op| op.hashjoinable) {
                    score += 1;
                }
                if best.map_or(true, |(s, ..)| score > s) {
                    best = Some((score, o, i, eq_op));
                    if score == 3 {
                        break 'search;
                    }
                }
            }
        }
        let Some((_, o, i, eq_op)) = best else {
            root.ec_mut(ec_id).ec_broken = true;
            return Vec::new();
        };
        result.push(create_join_clause(root, ec_id, eq_op, o, i, Some(ec_id)));
    }

    if !new_members.is_empty() {
        if let Some(&first_old) = outer_members.first().or(inner_members.first()) {
            new_members.push(first_old);
        }
        for pair in new_members.windows(2) {
            let (prev, cur) = (pair[0], pair[1]);
            let (ptype, ctype) = (
                root.ec(ec_id).ec_members[prev].em_datatype,
                root.ec(ec_id).ec_members[cur].em_datatype,
            );
            let Some(eq_op) = select_equality_operator(root, ec_id, ptype, ctype) else {
                root.ec_mut(ec_id).ec_broken = true;
                return Vec::new();
            };
            // not redundant with the other derived clauses
            result.push(create_join_clause(root, ec_id, eq_op, prev, cur, None));
        }
    }
    result
}

fn generate_join_implied_equalities_broken(
    root: &PlannerInfo,
    ec_id: EcId,
    join_relids: &Relids,
    outer_relids: &Relids,
    inner_relids: &Relids,
) -> Vec<RinfoId> {
    root.ec(ec_id)
        .ec_sources
        .iter()
        .copied()
        .filter(|id| {
            let required = &root.rinfo(*id).required_relids;
            required.is_subset(join_relids) && !required.is_subset(outer_relids) && !required.is_subset(inner_relids)
        })
        .collect()
}

/// Builds `em1 = em2`, reusing a matching source or previously derived clause.
fn create_join_clause(
    root: &mut PlannerInfo,
    ec_id: EcId,
    opno: Oid,
    em1: usize,
    em2: usize,
    parent_ec: Option<EcId>,
) -> RinfoId {
    let left = EmRef { ec: ec_id, member: em1 };
    let right = EmRef { ec: ec_id, member: em2 };
    let ec = root.ec(ec_id);
    let existing = ec.ec_sources.iter().chain(ec.ec_derives.iter()).copied().find(|id| {
        let r = root.rinfo(*id);
        r.left_em == Some(left) && r.right_em == Some(right) && r.parent_ec == parent_ec
    });
    if let Some(id) = existing {
        return id;
    }
    let (e1, e2) = (ec.ec_members[em1].clone(), ec.ec_members[em2].clone());
    let security = ec.ec_min_security;
    let qualscope = e1.em_relids.union(&e2.em_relids);
    let mut rinfo = build_implied_join_equality(root, opno, &e1.em_expr, &e2.em_expr, &qualscope, security);
    rinfo.parent_ec = parent_ec;
    rinfo.left_ec = Some(ec_id);
    rinfo.right_ec = Some(ec_id);
    rinfo.left_em = Some(left);
    rinfo.right_em = Some(right);
    let id = root.add_rinfo(rinfo);
    root.ec_mut(ec_id).ec_derives.push(id);
    id
}

/// True if some class could produce a join clause between the two rels.
pub fn have_relevant_eclass_joinclause(root: &PlannerInfo, rel1: RelId, rel2: RelId) -> bool {
    let (r1, r2) = (root.rel(rel1), root.rel(rel2));
    let common = eclass_indexes_for(root, &r1.relids).intersect(&eclass_indexes_for(root, &r2.relids));
    let found = common.iter().any(|i| {
        let ec = &root.eq_classes[i];
        ec.is_live()
            && ec.ec_members.len() > 1
            && ec.ec_relids.overlaps(&r1.relids)
            && ec.ec_relids.overlaps(&r2.relids)
    });
    found
}

/// True if some class could join `rel` to anything outside it.
pub fn has_relevant_eclass_joinclause(root: &PlannerInfo, rel: RelId) -> bool {
    let relids = &root.rel(rel).relids;
    eclass_indexes_for(root, relids).iter().any(|i| {
        let ec = &root.eq_classes[i];
        ec.is_live() && ec.ec_members.len() > 1 && !ec.ec_relids.is_subset(relids)
    })
}

/// Classes mentioning any base rel of `relids`.
pub fn eclass_indexes_for(root: &PlannerInfo, relids: &Relids) -> Relids {
    let mut out = Relids::new();
    for relid in relids.iter() {
        if let Some(rel) = root.base_rel_id(relid) {
            out.union_with(&root.rel(rel).eclass_indexes);
        }
    }
    out
}

/// True if the two expressions are known equal through some class.
pub fn exprs_known_equal(root: &PlannerInfo, a: &Expr, b: &Expr) -> bool {
    live_ecs(root).any(|(_, ec)| {
        !ec.ec_has_volatile
            && ec.ec_members.iter().any(|em| em.em_expr == *a)
            && ec.ec_members.iter().any(|em| em.em_expr == *b)
    })
}

/// A class is useful for merging with `rel` if it has a member computable
/// outside the rel.
pub fn eclass_useful_for_merging(root: &PlannerInfo, ec: EcId, relids: &Relids) -> bool {
    let ec = root.ec(canonical_ec(root, ec));
    if ec.ec_has_const || ec.ec_members.len() <= 1 {
        return false;
    }
    if ec.ec_relids.is_subset(relids) {
        return false;
    }
    ec.ec_members
        .iter()
        .any(|em| !em.em_is_const && !em.em_is_child && !em.em_relids.overlaps(relids))
}

/// Member of `ec` computable from `relids` alone.
pub fn find_ec_member_for_relids(root: &PlannerInfo, ec: EcId, relids: &Relids) -> Option<usize> {
    root.ec(ec).ec_members.iter().position(|em| {
        !em.em_is_const && !em.em_relids.is_empty() && em.em_relids.is_subset(relids)
    })
}

/// True when `rinfo` was derived from a class that already produced one of
/// the clauses in `clauses`.
pub fn is_redundant_derived_clause(root: &PlannerInfo, rinfo: RinfoId, clauses: &[RinfoId]) -> bool {
    let Some(parent) = root.rinfo(rinfo).parent_ec else {
        return false;
    };
    clauses.iter().any(|c| root.rinfo(*c).parent_ec == Some(parent))
}

/// Join clauses usable as index conditions on `rel`: for every class with a
/// member on `rel` accepted by `matches`, an equality to each member computable
/// from other rels.
pub fn generate_implied_equalities_for_column(
    root: &mut PlannerInfo,
    rel: RelId,
    matches: &dyn Fn(&Expr) -> bool,
) -> Vec<RinfoId> {
    let relids = root.rel(rel).relids.clone();
    let referencers = root.rel(rel).lateral_referencers.clone();
    let mut result = Vec::new();
    for i in root.rel(rel).eclass_indexes.iter().collect::<Vec<_>>() {
        let ec_id = EcId(i);
        let ec = root.ec(ec_id);
        if !ec.is_live() || ec.ec_has_const || ec.ec_members.len() <= 1 {
            continue;
        }
        let Some(cur) = ec
            .ec_members
            .iter()
            .position(|em| !em.em_is_child && em.em_relids == relids && matches(&em.em_expr))
        else {
            continue;
        };
        let others: Vec<usize> = ec
            .ec_members
            .iter()
            .enumerate()
            .filter(|(_, em)| {
                !em.em_is_const
                    && !em.em_is_child
                    && !em.em_relids.overlaps(&relids)
                    && !em.em_relids.overlaps(&referencers)
            })
            .map(|(j, _)| j)
            .collect();
        let cur_type = ec.ec_members[cur].em_datatype;
        for other in others {
            let other_type = root.ec(ec_id).ec_members[other].em_datatype;
            let Some(eq_op) = select_equality_operator(root, ec_id, cur_type, other_type) else {
                continue;
            };
            result.push(create_join_clause(root, ec_id, eq_op, cur, other, Some(ec_id)));
        }
    }
    result
}

/// Adds translated members for an inheritance child to every class that
/// mentions its parent.
pub fn add_child_rel_equivalences(root: &mut PlannerInfo, appinfo: &AppendRelInfo, child: RelId) {
    let parent_relid = appinfo.parent_relid;
    let Some(parent) = root.base_rel_id(parent_relid) else {
        return;
    };
    let child_relid = appinfo.child_relid;
    for i in root.rel(parent).eclass_indexes.iter().collect::<Vec<_>>() {
        let ec_id = EcId(i);
        let translated: Vec<(usize, EquivalenceMember)> = root
            .ec(ec_id)
            .ec_members
            .iter()
            .enumerate()
            .filter(|(_, em)| !em.em_is_const && !em.em_is_child && em.em_relids.contains(parent_relid))
            .map(|(m, em)| {
                let mut translate = |e: &Expr| translate_attno(e, appinfo);
                let expr = crate::expr::change_var_nodes_extended(
                    em.em_expr.clone(),
                    parent_relid,
                    child_relid,
                    0,
                    Some(&mut translate as &mut dyn FnMut(&Expr) -> Option<Expr>),
                );
                let mut relids = em.em_relids.clone();
                relids.replace(parent_relid, child_relid);
                (
                    m,
                    EquivalenceMember {
                        em_expr: expr,
                        em_relids: relids,
                        em_is_const: false,
                        em_is_child: true,
                        em_datatype: em.em_datatype,
                        em_jdomain: em.em_jdomain,
                        em_parent: Some(m),
                    },
                )
            })
            .collect();
        let ec = root.ec_mut(ec_id);
        for (_, member) in translated {
            ec.ec_members.push(member);
        }
        root.rel_mut(child).eclass_indexes.add(i);
    }
}

/// Maps a parent column reference to the child's column numbering.
pub fn translate_attno(expr: &Expr, appinfo: &AppendRelInfo) -> Option<Expr> {
    let Expr::Var(v) = expr else {
        return None;
    };
    if v.varno != appinfo.parent_relid || v.varlevelsup != 0 || v.varattno <= 0 {
        return None;
    }
    let child_attno = appinfo
        .translated_attnos
        .get((v.varattno - 1) as usize)
        .copied()
        .unwrap_or(v.varattno);
    let mut out = v.clone();
    out.varno = appinfo.child_relid;
    out.varattno = child_attno;
    Some(Expr::Var(out))
}
