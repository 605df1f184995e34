//! Counting connected subgraphs.
//!
//! Exhaustive dynamic programming builds one join rel per connected subgraph
//! of the join graph, so their number is the work such a search does. The
//! count grows exponentially with the graph size, and callers only need to know
//! whether it fits a budget, so counting stops once the bound is reached.
//!
//! Enumeration follows the csg scheme of DPccp: every connected set is grown
//! from its lowest-numbered vertex, only ever adding neighbors numbered above
//! it. Each set is thus produced exactly once.

/// Number of connected vertex subsets of the graph, at most `bound`.
///
/// `adj[v]` is the neighbor bitmask of vertex `v`, and the graph has at most
/// 64 vertices.
pub fn count_cc(adj: &[u64], bound: u64) -> u64 {
    let n = adj.len();
    let mut count = 0u64;
    for i in (0..n).rev() {
        count += 1;
        if count >= bound {
            return bound;
        }
        let start = 1u64 << i;
        // vertices at or below `i` are never added to sets grown from `i`
        let excluded = if i == 63 { u64::MAX } else { (1u64 << (i + 1)) - 1 };
        count = grow(adj, start, excluded, count, bound);
        if count >= bound {
            return bound;
        }
    }
    count
}

fn neighborhood(adj: &[u64], set: u64) -> u64 {
    let mut out = 0u64;
    let mut rest = set;
    while rest != 0 {
        let v = rest.trailing_zeros() as usize;
        out |= adj[v];
        rest &= rest - 1;
    }
    out
}

fn grow(adj: &[u64], set: u64, excluded: u64, mut count: u64, bound: u64) -> u64 {
    let frontier = neighborhood(adj, set) & !excluded & !set;
    if frontier == 0 {
        return count;
    }

    let mut sub = frontier;
    while sub != 0 {
        count += 1;
        if count >= bound {
            return bound;
        }
        sub = (sub - 1) & frontier;
    }

    let excluded = excluded | frontier;
    let mut sub = frontier;
    while sub != 0 {
        count = grow(adj, set | sub, excluded, count, bound);
        if count >= bound {
            return bound;
        }
        sub = (sub - 1) & frontier;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize) -> Vec<u64> {
        (0..n)
            .map(|v| {
                let mut mask = 0;
                if v > 0 {
                    mask |= 1 << (v - 1);
                }
                if v + 1 < n {
                    mask |= 1 << (v + 1);
                }
                mask
            })
            .collect()
    }

    fn clique(n: usize) -> Vec<u64> {
        let all = (1u64 << n) - 1;
        (0..n).map(|v| all & !(1 << v)).collect()
    }

    #[test]
    fn test_chain_has_quadratic_count() {
        // n(n+1)/2 contiguous segments
        assert_eq!(count_cc(&chain(1), u64::MAX), 1);
        assert_eq!(count_cc(&chain(4), u64::MAX), 10);
        assert_eq!(count_cc(&chain(10), u64::MAX), 55);
    }

    #[test]
    fn test_clique_counts_every_subset() {
        assert_eq!(count_cc(&clique(5), u64::MAX), 31);
    }

    #[test]
    fn test_star_counts_hub_subsets_plus_leaves() {
        // hub 0 with 4 leaves: 2^4 sets containing the hub, plus 4 lone leaves
        let adj = vec![0b11110, 0b00001, 0b00001, 0b00001, 0b00001];
        assert_eq!(count_cc(&adj, u64::MAX), 20);
    }

    #[test]
    fn test_disconnected_graph_counts_parts_separately() {
        let adj = vec![0b10, 0b01, 0b1000, 0b0100];
        assert_eq!(count_cc(&adj, u64::MAX), 6);
    }

    #[test]
    fn test_bound_stops_early() {
        assert_eq!(count_cc(&clique(30), 1000), 1000);
        assert_eq!(count_cc(&chain(10), 20), 20);
    }
}
