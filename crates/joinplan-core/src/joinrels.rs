//! # Join Rel Construction
//!
//! [`make_join_rel`] is the single entry point the join search uses to combine
//! two rels. It checks that the combination respects every outer join
//! ([`join_is_legal`]), orders the inputs the way the matching special join
//! needs, builds or finds the join rel, and adds the paths for this particular
//! split of its relids.
//!
//! ## Legality
//!
//! A special join may be performed at a join of `rel1` and `rel2` only if one
//! input covers its minimal LHS and the other its minimal RHS. A join that
//! reaches into a special join's RHS without completing it is legal only when
//! the violation was already accepted further down, or when the proposed join
//! is itself a strict LEFT join that can commute with it. Lateral references
//! add one more constraint: a rel can only be joined after every rel it
//! references laterally, unless the reference can be passed down as a
//! parameter.

use crate::error::{PlanError, Result};
use crate::joinpath::add_paths_to_joinrel;
use crate::path::PathKind;
use crate::pathnode::{create_dummy_path, set_cheapest};
use crate::planner_info::{PlannerInfo, RelId, RinfoId};
use crate::query::JoinType;
use crate::relation::SpecialJoinInfo;
use crate::relids::Relids;
use crate::relnode::{build_join_rel, min_join_parameterization};
use crate::restrictinfo::rinfo_is_pushed_down;
use tracing::trace;

/// Outcome of a successful legality check: the special join to perform, if
/// any, and whether the inputs must be swapped to match its sides.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinLegality {
    pub sjinfo: Option<SpecialJoinInfo>,
    pub reversed: bool,
}

/// Decides whether `rel1` and `rel2` may be joined directly.
pub fn join_is_legal(root: &PlannerInfo, rel1: RelId, rel2: RelId, joinrelids: &Relids) -> Option<JoinLegality> {
    let r1 = root.rel(rel1);
    let r2 = root.rel(rel2);
    let mut match_sjinfo: Option<&SpecialJoinInfo> = None;
    let mut reversed = false;
    let mut must_be_leftjoin = false;

    for sjinfo in &root.join_info_list {
        if !sjinfo.min_righthand.overlaps(joinrelids) {
            continue;
        }
        if joinrelids.is_subset(&sjinfo.min_righthand) {
            continue;
        }
        // already performed inside one of the inputs
        if sjinfo.min_lefthand.is_subset(&r1.relids) && sjinfo.min_righthand.is_subset(&r1.relids) {
            continue;
        }
        if sjinfo.min_lefthand.is_subset(&r2.relids) && sjinfo.min_righthand.is_subset(&r2.relids) {
            continue;
        }

        if sjinfo.min_lefthand.is_subset(&r1.relids) && sjinfo.min_righthand.is_subset(&r2.relids) {
            if match_sjinfo.is_some() {
                return None;
            }
            match_sjinfo = Some(sjinfo);
            reversed = false;
        } else if sjinfo.min_lefthand.is_subset(&r2.relids) && sjinfo.min_righthand.is_subset(&r1.relids) {
            if match_sjinfo.is_some() {
                return None;
            }
            match_sjinfo = Some(sjinfo);
            reversed = true;
        } else {
            // both inputs already violate the RHS, so this was accepted below
            if r1.relids.overlaps(&sjinfo.min_righthand) && r2.relids.overlaps(&sjinfo.min_righthand) {
                continue;
            }
            if sjinfo.jointype != JoinType::Left || joinrelids.overlaps(&sjinfo.min_lefthand) {
                return None;
            }
            must_be_leftjoin = true;
        }
    }

    if must_be_leftjoin
        && !match_sjinfo.is_some_and(|sj| sj.jointype == JoinType::Left && sj.lhs_strict)
    {
        return None;
    }

    if !r1.lateral_relids.is_empty() || !r2.lateral_relids.is_empty() {
        let full_or = |sj: Option<&SpecialJoinInfo>| sj.is_some_and(|sj| sj.jointype == JoinType::Full);
        if r1.relids.overlaps(&r2.lateral_relids) {
            // rel2 must be the inner side of a nestloop over rel1
            if match_sjinfo.is_some() && (reversed || full_or(match_sjinfo)) {
                return None;
            }
            if r2.relids.overlaps(&r1.lateral_relids) {
                return None;
            }
        } else if r2.relids.overlaps(&r1.lateral_relids) && match_sjinfo.is_some() && (!reversed || full_or(match_sjinfo)) {
            return None;
        }

        // outer rels referenced laterally must not sit inside the RHS of an
        // outer join this join has to be completed under
        let join_lateral_rels = min_join_parameterization(joinrelids, r1, r2);
        if !join_lateral_rels.is_empty() {
            let mut join_plus_rhs = joinrelids.clone();
            loop {
                let mut more = false;
                for sjinfo in &root.join_info_list {
                    if sjinfo.jointype == JoinType::Full {
                        continue;
                    }
                    if sjinfo.min_lefthand.overlaps(&join_plus_rhs)
                        && !sjinfo.min_righthand.is_subset(&join_plus_rhs)
                    {
                        join_plus_rhs.union_with(&sjinfo.min_righthand);
                        more = true;
                    }
                }
                if !more {
                    break;
                }
            }
            if join_plus_rhs.overlaps(&join_lateral_rels) {
                return None;
            }
        }
    }

    Some(JoinLegality {
        sjinfo: match_sjinfo.cloned(),
        reversed,
    })
}

/// Adds the relids of the outer joins that are completed by joining inputs
/// covering `input_relids` with `sjinfo`.
///
/// A LEFT join pushed into the RHS of a lower LEFT join (outer join identity
/// 3) cannot claim its relid until the lower join is performed too. Once it
/// is, every commuting join above whose inputs are present is added as well.
pub fn add_outer_joins_to_relids(root: &PlannerInfo, input_relids: &Relids, sjinfo: &SpecialJoinInfo) -> Relids {
    let mut relids = input_relids.clone();
    if sjinfo.ojrelid == 0 {
        return relids;
    }
    if sjinfo.jointype != JoinType::Left {
        relids.add(sjinfo.ojrelid);
        return relids;
    }
    if !sjinfo.commute_below_l.is_subset(&relids) {
        return relids;
    }
    relids.add(sjinfo.ojrelid);

    for other in &root.join_info_list {
        if other.ojrelid == 0 || other.ojrelid == sjinfo.ojrelid || other.jointype != JoinType::Left {
            continue;
        }
        if !sjinfo.commute_above_l.contains(other.ojrelid) {
            continue;
        }
        if other.commute_below_l.is_subset(&relids) && other.min_righthand.is_subset(&relids) {
            relids.add(other.ojrelid);
        }
    }
    relids
}

/// Joins two rels if that is legal, returning the join rel. `None` means the
/// combination is not allowed. The rel may still exist from an earlier pair.
pub fn make_join_rel(root: &mut PlannerInfo, rel1: RelId, rel2: RelId) -> Result<Option<RelId>> {
    let relids1 = root.rel(rel1).relids.clone();
    let relids2 = root.rel(rel2).relids.clone();
    if relids1.overlaps(&relids2) {
        return Err(PlanError::InvalidInput(format!(
            "cannot join overlapping rels {relids1} and {relids2}"
        )));
    }
    let joinrelids = relids1.union(&relids2);

    let Some(legality) = join_is_legal(root, rel1, rel2, &joinrelids) else {
        trace!(rel1 = %relids1, rel2 = %relids2, "join not legal");
        return Ok(None);
    };
    let (rel1, rel2) = if legality.reversed { (rel2, rel1) } else { (rel1, rel2) };
    let outer_relids = root.rel(rel1).relids.clone();
    let inner_relids = root.rel(rel2).relids.clone();
    let sjinfo = legality
        .sjinfo
        .unwrap_or_else(|| SpecialJoinInfo::dummy(&outer_relids, &inner_relids));
    let joinrelids = add_outer_joins_to_relids(root, &joinrelids, &sjinfo);

    let (joinrel, restrictlist) = build_join_rel(root, &joinrelids, rel1, rel2, &sjinfo);
    if is_dummy_rel(root, joinrel) {
        return Ok(Some(joinrel));
    }
    populate_joinrel_with_paths(root, rel1, rel2, joinrel, &sjinfo, &restrictlist)?;
    Ok(Some(joinrel))
}

/// Adds the paths of one split of `joinrel` into `rel1` and `rel2`, trying
/// both input orders where the join type allows it.
pub fn populate_joinrel_with_paths(
    root: &mut PlannerInfo,
    rel1: RelId,
    rel2: RelId,
    joinrel: RelId,
    sjinfo: &SpecialJoinInfo,
    restrictlist: &[RinfoId],
) -> Result<()> {
    let joinrelids = root.rel(joinrel).relids.clone();
    let dummy1 = is_dummy_rel(root, rel1);
    let dummy2 = is_dummy_rel(root, rel2);

    match sjinfo.jointype {
        JoinType::Inner => {
            if dummy1 || dummy2 || restriction_is_constant_false(root, restrictlist, &joinrelids, false) {
                return mark_dummy_rel(root, joinrel);
            }
            add_paths_to_joinrel(root, joinrel, rel1, rel2, JoinType::Inner, sjinfo, restrictlist);
            add_paths_to_joinrel(root, joinrel, rel2, rel1, JoinType::Inner, sjinfo, restrictlist);
        }
        JoinType::Left => {
            if dummy1 || restriction_is_constant_false(root, restrictlist, &joinrelids, true) {
                return mark_dummy_rel(root, joinrel);
            }
            if restriction_is_constant_false(root, restrictlist, &joinrelids, false)
                && root.rel(rel2).relids.is_subset(&sjinfo.syn_righthand)
            {
                mark_dummy_rel(root, rel2)?;
            }
            add_paths_to_joinrel(root, joinrel, rel1, rel2, JoinType::Left, sjinfo, restrictlist);
            add_paths_to_joinrel(root, joinrel, rel2, rel1, JoinType::Right, sjinfo, restrictlist);
        }
        JoinType::Full => {
            if (dummy1 && dummy2) || restriction_is_constant_false(root, restrictlist, &joinrelids, true) {
                return mark_dummy_rel(root, joinrel);
            }
            add_paths_to_joinrel(root, joinrel, rel1, rel2, JoinType::Full, sjinfo, restrictlist);
            add_paths_to_joinrel(root, joinrel, rel2, rel1, JoinType::Full, sjinfo, restrictlist);
            if root.rel(joinrel).pathlist.is_empty() {
                return Err(PlanError::Unsupported(
                    "FULL JOIN is only supported with merge-joinable or hash-joinable join conditions".into(),
                ));
            }
        }
        JoinType::Semi => {
            if dummy1 || dummy2 || restriction_is_constant_false(root, restrictlist, &joinrelids, false) {
                return mark_dummy_rel(root, joinrel);
            }
            add_paths_to_joinrel(root, joinrel, rel1, rel2, JoinType::Semi, sjinfo, restrictlist);
        }
        JoinType::Anti => {
            if dummy1 || restriction_is_constant_false(root, restrictlist, &joinrelids, true) {
                return mark_dummy_rel(root, joinrel);
            }
            if restriction_is_constant_false(root, restrictlist, &joinrelids, false)
                && root.rel(rel2).relids.is_subset(&sjinfo.syn_righthand)
            {
                mark_dummy_rel(root, rel2)?;
            }
            add_paths_to_joinrel(root, joinrel, rel1, rel2, JoinType::Anti, sjinfo, restrictlist);
        }
        JoinType::Right => {
            return Err(PlanError::InvalidInput(
                "RIGHT joins must be flipped to LEFT joins before the join search".into(),
            ));
        }
    }
    Ok(())
}

/// Is any clause of `restrictlist` constant FALSE or NULL? With
/// `only_pushed_down`, only clauses that act as filters above the join count.
pub fn restriction_is_constant_false(
    root: &PlannerInfo,
    restrictlist: &[RinfoId],
    joinrelids: &Relids,
    only_pushed_down: bool,
) -> bool {
    restrictlist.iter().any(|id| {
        let rinfo = root.rinfo(*id);
        if only_pushed_down && !rinfo_is_pushed_down(rinfo, joinrelids) {
            return false;
        }
        rinfo.clause.is_false_const()
    })
}

/// Has the rel been proven empty?
pub fn is_dummy_rel(root: &PlannerInfo, rel: RelId) -> bool {
    match root.rel(rel).pathlist.as_slice() {
        [only] => {
            let path = root.path(*only);
            matches!(path.kind, PathKind::Result) && path.rows == 0.0
        }
        _ => false,
    }
}

/// Replaces the rel's paths with a single empty Result path.
pub fn mark_dummy_rel(root: &mut PlannerInfo, rel: RelId) -> Result<()> {
    if is_dummy_rel(root, rel) {
        return Ok(());
    }
    let path = create_dummy_path(rel);
    let id = root.alloc_path(path);
    let r = root.rel_mut(rel);
    r.rows = 0.0;
    r.pathlist = vec![id];
    r.ppilist.clear();
    trace!(rel = %r.relids, "rel proven empty");
    set_cheapest(root, rel)
}
