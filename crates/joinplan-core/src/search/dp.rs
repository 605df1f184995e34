//! Exhaustive bottom-up join search over a small set of rels.
//!
//! Level `k` holds the best join rel found for every `k`-element subset of
//! the inputs that could be joined legally. Subsets are keyed by bitmask over
//! input positions, so join rels whose relids also carry outer-join relids
//! still line up with the inputs they were built from.

use super::graph::have_relevant_joinclause;
use crate::error::Result;
use crate::joinrels::make_join_rel;
use crate::pathnode::set_cheapest;
use crate::planner_info::{PlannerInfo, RelId};
use std::collections::BTreeMap;
use tracing::trace;

/// Joins all of `rels` into one rel, or returns `None` when no legal join
/// order over exactly these inputs exists.
pub fn dp_join_search(root: &mut PlannerInfo, rels: &[RelId]) -> Result<Option<RelId>> {
    let n = rels.len();
    match n {
        0 => return Ok(None),
        1 => return Ok(Some(rels[0])),
        _ if n > 64 => return Ok(None),
        _ => {}
    }

    let mut levels: Vec<BTreeMap<u64, RelId>> = vec![BTreeMap::new(); n + 1];
    for (pos, rel) in rels.iter().enumerate() {
        levels[1].insert(1u64 << pos, *rel);
    }

    for level in 2..=n {
        root.check_for_interrupts()?;
        root.join_cur_level = level;
        let mut built = join_level(root, &levels, level, true)?;
        if built.is_empty() {
            // nothing connected by a clause; allow cartesian products
            built = join_level(root, &levels, level, false)?;
        }
        levels[level] = keep_cheapest(root, built)?;
        trace!(level, rels = levels[level].len(), "join search level done");
    }
    root.join_cur_level = 0;

    let full = if n == 64 { u64::MAX } else { (1u64 << n) - 1 };
    Ok(levels[n].get(&full).copied())
}

/// Every join rel buildable at `level` from two disjoint lower-level rels.
fn join_level(
    root: &mut PlannerInfo,
    levels: &[BTreeMap<u64, RelId>],
    level: usize,
    need_clause: bool,
) -> Result<Vec<(u64, RelId)>> {
    let mut built = Vec::new();
    for left_size in 1..=level / 2 {
        let right_size = level - left_size;
        for (left_mask, left) in &levels[left_size] {
            for (right_mask, right) in &levels[right_size] {
                if left_mask & right_mask != 0 {
                    continue;
                }
                // equal-sized halves would otherwise be tried twice
                if left_size == right_size && left_mask > right_mask {
                    continue;
                }
                if need_clause && !joinable_by_clause(root, *left, *right) {
                    continue;
                }
                if let Some(joinrel) = make_join_rel(root, *left, *right)? {
                    built.push((left_mask | right_mask, joinrel));
                }
            }
        }
    }
    Ok(built)
}

/// A pair is worth joining when a clause links them, or when one side has
/// no join clauses at all and so can only ever enter as a cartesian product.
fn joinable_by_clause(root: &PlannerInfo, left: RelId, right: RelId) -> bool {
    let lonely = |rel: RelId| {
        let r = root.rel(rel);
        r.joininfo.is_empty() && !r.has_eclass_joins
    };
    have_relevant_joinclause(root, left, right) || lonely(left) || lonely(right)
}

/// Finishes every rel built at this level and keeps, per input subset, the
/// one with the cheapest total path.
fn keep_cheapest(root: &mut PlannerInfo, built: Vec<(u64, RelId)>) -> Result<BTreeMap<u64, RelId>> {
    let mut best: BTreeMap<u64, RelId> = BTreeMap::new();
    let mut finished: Vec<RelId> = Vec::new();
    for (mask, rel) in built {
        if root.rel(rel).pathlist.is_empty() {
            continue;
        }
        if !finished.contains(&rel) {
            set_cheapest(root, rel)?;
            finished.push(rel);
        }
        match best.get(&mask) {
            Some(current) if cheapest_cost(root, *current) <= cheapest_cost(root, rel) => {}
            _ => {
                best.insert(mask, rel);
            }
        }
    }
    Ok(best)
}

pub(crate) fn cheapest_cost(root: &PlannerInfo, rel: RelId) -> f64 {
    root.rel(rel)
        .cheapest_total_path
        .map(|p| root.path(p).total_cost)
        .unwrap_or(f64::INFINITY)
}
