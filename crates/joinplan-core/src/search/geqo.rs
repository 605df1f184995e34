//! Genetic join order search.
//!
//! A tour is a permutation of the input rels. It is turned into a join tree
//! by folding rels into "clumps" in tour order: each new rel is joined into
//! the first clump it shares a join clause with, and the result is merged
//! further while possible. Leftover clumps are then joined without requiring a
//! clause. The fitness of a tour is the total cost of the cheapest path of
//! the resulting rel.
//!
//! Join rels built while scoring a tour are dropped from the join rel list
//! and hash afterwards so that each evaluation starts from the same state.
//! Only the winning tour is built for keeps.

use super::dp::cheapest_cost;
use super::graph::have_relevant_joinclause;
use crate::error::Result;
use crate::joinrels::make_join_rel;
use crate::pathnode::set_cheapest;
use crate::planner_info::{PlannerInfo, RelId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace};

type Tour = Vec<usize>;

/// Searches join orders of `rels` genetically, spending at most `budget`
/// rel-joins on tour evaluation. Returns the joined rel, or `None` if no
/// tour yields a single rel.
pub fn geqo(root: &mut PlannerInfo, rels: &[RelId], budget: u64) -> Result<Option<RelId>> {
    let n = rels.len();
    if n <= 1 {
        return Ok(rels.first().copied());
    }

    let config = &root.config;
    let mut rng = StdRng::seed_from_u64(config.geqo_seed);
    let pool_size = config.geqo_pool_size;
    let per_tour = n as u64;
    let affordable = (budget / per_tour).saturating_sub(pool_size as u64) as usize;
    let generations = config.geqo_generations.min(affordable.max(1));

    let mut pool: Vec<(Tour, f64)> = Vec::with_capacity(pool_size);
    for _ in 0..pool_size {
        let mut tour: Tour = (0..n).collect();
        tour.shuffle(&mut rng);
        let fitness = evaluate(root, rels, &tour)?;
        pool.push((tour, fitness));
    }
    sort_pool(&mut pool);

    for generation in 0..generations {
        root.check_for_interrupts()?;
        let mom = tournament(&pool, &mut rng);
        let dad = tournament(&pool, &mut rng);
        let mut child = order_crossover(&pool[mom].0, &pool[dad].0, &mut rng);
        if rng.gen_bool(0.2) {
            let (a, b) = (rng.gen_range(0..n), rng.gen_range(0..n));
            child.swap(a, b);
        }
        let fitness = evaluate(root, rels, &child)?;
        if let Some(worst) = pool.last_mut() {
            if fitness < worst.1 {
                *worst = (child, fitness);
                sort_pool(&mut pool);
            }
        }
        trace!(generation, best = pool[0].1, "geqo generation");
    }

    let (best, fitness) = &pool[0];
    if !fitness.is_finite() {
        debug!(rels = n, "geqo found no complete join order");
        return Ok(None);
    }
    let clumps = gimme_tree(root, rels, best)?;
    Ok(match clumps.as_slice() {
        [one] => Some(*one),
        _ => None,
    })
}

fn sort_pool(pool: &mut [(Tour, f64)]) {
    pool.sort_by(|a, b| a.1.total_cmp(&b.1));
}

/// Index of the fitter of two random pool members.
fn tournament(pool: &[(Tour, f64)], rng: &mut StdRng) -> usize {
    let a = rng.gen_range(0..pool.len());
    let b = rng.gen_range(0..pool.len());
    // pool is sorted, so the smaller index is the fitter
    a.min(b)
}

/// OX1: copy a random slice of `mom`, then fill the other positions with the
/// remaining genes in the order they appear in `dad`.
fn order_crossover(mom: &[usize], dad: &[usize], rng: &mut StdRng) -> Tour {
    let n = mom.len();
    let (mut lo, mut hi) = (rng.gen_range(0..n), rng.gen_range(0..n));
    if lo > hi {
        std::mem::swap(&mut lo, &mut hi);
    }
    let segment = &mom[lo..=hi];
    let mut rest = dad.iter().copied().filter(|gene| !segment.contains(gene));
    let mut child = Vec::with_capacity(n);
    for pos in 0..n {
        if (lo..=hi).contains(&pos) {
            child.push(mom[pos]);
        } else if let Some(gene) = rest.next() {
            child.push(gene);
        }
    }
    child
}

/// Cost of the tour's join tree, leaving the join rel list as it was.
fn evaluate(root: &mut PlannerInfo, rels: &[RelId], tour: &[usize]) -> Result<f64> {
    let mark = root.join_rel_list.len();
    let clumps = gimme_tree(root, rels, tour)?;
    let fitness = match clumps.as_slice() {
        [one] => cheapest_cost(root, *one),
        _ => f64::INFINITY,
    };
    for rel in root.join_rel_list.split_off(mark) {
        let relids = root.rel(rel).relids.clone();
        root.join_rel_hash.remove(&relids);
    }
    Ok(fitness)
}

/// Folds the tour into clumps; a successful tour leaves exactly one.
fn gimme_tree(root: &mut PlannerInfo, rels: &[RelId], tour: &[usize]) -> Result<Vec<RelId>> {
    let mut clumps: Vec<RelId> = Vec::new();
    for pos in tour {
        merge_clump(root, &mut clumps, rels[*pos], false)?;
    }
    if clumps.len() > 1 {
        for clump in std::mem::take(&mut clumps) {
            merge_clump(root, &mut clumps, clump, true)?;
        }
    }
    Ok(clumps)
}

/// Joins `new` into the first clump it can be joined with, then keeps
/// merging the result. Without `force` only clause-linked pairs are tried.
fn merge_clump(root: &mut PlannerInfo, clumps: &mut Vec<RelId>, new: RelId, force: bool) -> Result<()> {
    let mut new = new;
    'merge: loop {
        for i in 0..clumps.len() {
            let old = clumps[i];
            if !force && !have_relevant_joinclause(root, old, new) {
                continue;
            }
            let Some(joinrel) = make_join_rel(root, old, new)? else {
                continue;
            };
            if root.rel(joinrel).pathlist.is_empty() {
                continue;
            }
            set_cheapest(root, joinrel)?;
            clumps.remove(i);
            new = joinrel;
            continue 'merge;
        }
        clumps.push(new);
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_crossover_yields_permutation() {
        let mut rng = StdRng::seed_from_u64(7);
        let mom = vec![0, 1, 2, 3, 4, 5, 6, 7];
        let dad = vec![7, 6, 5, 4, 3, 2, 1, 0];
        for _ in 0..50 {
            let mut child = order_crossover(&mom, &dad, &mut rng);
            assert_eq!(child.len(), 8);
            child.sort_unstable();
            assert_eq!(child, mom);
        }
    }

    #[test]
    fn test_tournament_prefers_fitter() {
        let pool = vec![(vec![0], 1.0), (vec![0], 2.0), (vec![0], 3.0)];
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            assert!(tournament(&pool, &mut rng) < pool.len());
        }
    }
}
