//! Greedy operator ordering.
//!
//! Repeatedly joins the pair of rels that scores best under the configured
//! criterion until one rel is left or no legal pair remains. Pairs linked by
//! a join clause are preferred; cartesian products are only considered when
//! no such pair can be joined.

use super::dp::cheapest_cost;
use super::graph::have_relevant_joinclause;
use crate::config::GooCriterion;
use crate::error::Result;
use crate::joinrels::make_join_rel;
use crate::pathnode::set_cheapest;
use crate::planner_info::{PlannerInfo, RelId};
use tracing::trace;

/// Greedily joins `rels`, returning what is left: a single rel on success,
/// or several when the remaining rels cannot be combined legally.
pub fn goo(root: &mut PlannerInfo, rels: &[RelId], criterion: GooCriterion, clauseless: bool) -> Result<Vec<RelId>> {
    let mut rels = rels.to_vec();
    while rels.len() > 1 {
        root.check_for_interrupts()?;
        let mut best = best_pair(root, &rels, criterion, !clauseless)?;
        if best.is_none() && !clauseless {
            best = best_pair(root, &rels, criterion, false)?;
        }
        let Some((i, j, joinrel)) = best else {
            trace!(remaining = rels.len(), "greedy join search stuck");
            break;
        };
        trace!(joinrel = %root.rel(joinrel).relids, "greedy join");
        rels.remove(j);
        rels[i] = joinrel;
    }
    Ok(rels)
}

/// Best-scoring legal join among pairs of `rels`, as `(i, j, joinrel)` with
/// `i < j`. Ties go to the earliest pair.
fn best_pair(
    root: &mut PlannerInfo,
    rels: &[RelId],
    criterion: GooCriterion,
    need_clause: bool,
) -> Result<Option<(usize, usize, RelId)>> {
    let mut best: Option<(f64, usize, usize, RelId)> = None;
    for i in 0..rels.len() {
        for j in i + 1..rels.len() {
            let (left, right) = (rels[i], rels[j]);
            if need_clause && !have_relevant_joinclause(root, left, right) {
                continue;
            }
            let Some(joinrel) = make_join_rel(root, left, right)? else {
                continue;
            };
            if root.rel(joinrel).pathlist.is_empty() {
                continue;
            }
            set_cheapest(root, joinrel)?;
            let score = match criterion {
                GooCriterion::Cost => cheapest_cost(root, joinrel),
                GooCriterion::Selectivity => {
                    let product = root.rel(left).rows * root.rel(right).rows;
                    if product > 0.0 {
                        root.rel(joinrel).rows / product
                    } else {
                        0.0
                    }
                }
            };
            if best.as_ref().map_or(true, |(s, ..)| score < *s) {
                best = Some((score, i, j, joinrel));
            }
        }
    }
    Ok(best.map(|(_, i, j, rel)| (i, j, rel)))
}
