//! Decomposition of a join graph component into simple topologies.
//!
//! Each pass over a component carves its still-unused vertices into disjoint
//! subgraphs, in this order: dense subgraphs, cycles, stars, then chains for
//! whatever remains. Every vertex lands in exactly one topology; a vertex with
//! no unused neighbors becomes a single-vertex chain.

use super::counter::count_cc;
use super::graph::JoinGraph;
use crate::config::PlannerConfig;

/// Upper bound on DFS steps spent looking for one cycle.
const CYCLE_SEARCH_STEPS: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyKind {
    Dense,
    Cycle,
    Star,
    Chain,
}

/// A subgraph of the component, by vertex index into the [`JoinGraph`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub kind: TopologyKind,
    pub members: Vec<usize>,
}

impl Topology {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Share of the pass budget this topology asks for.
    pub fn weight(&self, graph: &JoinGraph) -> u64 {
        (self.members.len() + graph.induced_edge_count(&self.members)) as u64
    }

    /// Short chains and small stars are planned exhaustively whatever the budget.
    pub fn is_easy(&self, config: &PlannerConfig) -> bool {
        match self.kind {
            _ if self.members.len() <= 2 => true,
            TopologyKind::Chain => self.members.len() <= config.easy_chain_max,
            TopologyKind::Star => self.members.len() <= config.easy_star_max,
            TopologyKind::Dense | TopologyKind::Cycle => false,
        }
    }

    /// Work of exhaustive DP: the number of connected subgraphs, counted up
    /// to `bound`.
    pub fn cost_standard(&self, graph: &JoinGraph, bound: u64) -> u64 {
        match graph.masks(&self.members) {
            Some(masks) => count_cc(&masks, bound),
            None => bound,
        }
    }

    /// Work of the randomized search, linear in the vertex count except for
    /// dense subgraphs where every pair is a candidate.
    pub fn cost_heuristic(&self) -> u64 {
        let n = self.members.len() as u64;
        match self.kind {
            TopologyKind::Dense => n * n,
            _ => n,
        }
    }
}

/// Splits `component` (vertex indexes of `graph`) into topologies.
pub fn decompose(graph: &JoinGraph, component: &[usize], config: &PlannerConfig) -> Vec<Topology> {
    let mut used = vec![true; graph.len()];
    for v in component {
        used[*v] = false;
    }
    let mut out = Vec::new();
    find_dense(graph, component, config, &mut used, &mut out);
    find_cycles(graph, component, &mut used, &mut out);
    find_stars(graph, component, config, &mut used, &mut out);
    find_chains(graph, component, &mut used, &mut out);
    out
}

fn unused_degree(graph: &JoinGraph, v: usize, used: &[bool]) -> usize {
    graph.adj[v].iter().filter(|w| !used[**w]).count()
}

fn take(kind: TopologyKind, mut members: Vec<usize>, used: &mut [bool], out: &mut Vec<Topology>) {
    members.sort_unstable();
    for v in &members {
        used[*v] = true;
    }
    out.push(Topology { kind, members });
}

/// A hub together with its unused neighbors, when their induced subgraph has
/// an average degree above the threshold.
fn find_dense(graph: &JoinGraph, component: &[usize], config: &PlannerConfig, used: &mut [bool], out: &mut Vec<Topology>) {
    let mut hubs = component.to_vec();
    hubs.sort_by_key(|v| (std::cmp::Reverse(graph.degree(*v)), *v));
    for hub in hubs {
        if used[hub] {
            continue;
        }
        let mut members = vec![hub];
        members.extend(graph.adj[hub].iter().copied().filter(|w| !used[*w]));
        if members.len() < 3 {
            continue;
        }
        let avg_degree = 2.0 * graph.induced_edge_count(&members) as f64 / members.len() as f64;
        if avg_degree > config.dense_degree_threshold {
            take(TopologyKind::Dense, members, used, out);
        }
    }
}

fn find_cycles(graph: &JoinGraph, component: &[usize], used: &mut [bool], out: &mut Vec<Topology>) {
    for start in component {
        if used[*start] {
            continue;
        }
        let mut steps = 0;
        let mut path = vec![*start];
        if let Some(cycle) = cycle_from(graph, used, &mut path, &mut steps) {
            take(TopologyKind::Cycle, cycle, used, out);
        }
    }
}

/// DFS for a simple cycle of at least three unused vertices through
/// `path[0]`, extending only to vertices numbered above it.
fn cycle_from(graph: &JoinGraph, used: &[bool], path: &mut Vec<usize>, steps: &mut usize) -> Option<Vec<usize>> {
    let start = path[0];
    let Some(&last) = path.last() else {
        return None;
    };
    for next in &graph.adj[last] {
        *steps += 1;
        if *steps > CYCLE_SEARCH_STEPS {
            return None;
        }
        if *next == start && path.len() >= 3 {
            return Some(path.clone());
        }
        if used[*next] || *next < start || path.contains(next) {
            continue;
        }
        path.push(*next);
        if let Some(cycle) = cycle_from(graph, used, path, steps) {
            return Some(cycle);
        }
        path.pop();
    }
    None
}

/// A hub with enough unused leaves whose only unused neighbor is the hub.
fn find_stars(graph: &JoinGraph, component: &[usize], config: &PlannerConfig, used: &mut [bool], out: &mut Vec<Topology>) {
    let mut hubs = component.to_vec();
    hubs.sort_by_key(|v| (std::cmp::Reverse(graph.degree(*v)), *v));
    for hub in hubs {
        if used[hub] {
            continue;
        }
        let leaves: Vec<usize> = graph.adj[hub]
            .iter()
            .copied()
            .filter(|w| !used[*w] && unused_degree(graph, *w, used) == 1)
            .collect();
        if leaves.len() >= config.star_min_leaves.max(1) {
            let mut members = vec![hub];
            members.extend(leaves);
            take(TopologyKind::Star, members, used, out);
        }
    }
}

/// Greedy maximal paths, each started from a vertex of least unused degree.
fn find_chains(graph: &JoinGraph, component: &[usize], used: &mut [bool], out: &mut Vec<Topology>) {
    loop {
        let Some(start) = component
            .iter()
            .copied()
            .filter(|v| !used[*v])
            .min_by_key(|v| (unused_degree(graph, *v, used), *v))
        else {
            break;
        };
        let mut chain = vec![start];
        used[start] = true;
        let mut cur = start;
        while let Some(next) = graph.adj[cur].iter().copied().filter(|w| !used[*w]).min() {
            chain.push(next);
            used[next] = true;
            cur = next;
        }
        // keep chain order for planning; `take` would sort it
        out.push(Topology {
            kind: TopologyKind::Chain,
            members: chain,
        });
    }
}
