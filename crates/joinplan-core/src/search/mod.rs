//! # Join Search
//!
//! Finds a join order for all base rels of the query under a work budget.
//!
//! ## Decomposition
//!
//! The join graph is split into connected components and each component gets
//! a share of `search_budget` proportional to its vertex plus edge count.
//! Within a component the search works in passes. Each pass decomposes the
//! current vertices into topologies (dense subgraphs, cycles, stars, chains),
//! hands every topology a slice of the pass budget and replaces its vertices
//! with whatever rels planning it produced. The next pass runs over the
//! shrunken graph, until a single vertex remains or a pass makes no progress.
//!
//! ## Strategy per Topology
//!
//! - Exhaustive DP when the budget covers the number of connected subgraphs,
//!   or when the topology is a short chain or a small star.
//! - Genetic search when the budget covers its linear (quadratic for dense
//!   subgraphs) estimate.
//! - Greedy operator ordering otherwise, and as the fallback whenever the
//!   chosen strategy cannot produce a single rel.
//!
//! Budget a topology does not use is returned to the component's pool.
//! Whatever remains after all passes, across components too, is combined
//! greedily, allowing cartesian products.

pub mod counter;
pub mod dp;
pub mod geqo;
pub mod goo;
pub mod graph;
pub mod topology;

use self::dp::{cheapest_cost, dp_join_search};
use self::geqo::geqo;
use self::goo::goo;
use self::graph::{BaseEdges, JoinGraph};
use self::topology::{decompose, Topology};
use crate::config::PlannerConfig;
use crate::error::{PlanError, Result};
use crate::planner_info::{PlannerInfo, RelId};
use tracing::{debug, trace};

/// Joins every base rel of the query into one rel and returns it.
pub fn join_search(root: &mut PlannerInfo) -> Result<RelId> {
    let base = root.base_rel_ids();
    match base.as_slice() {
        [] => return Err(PlanError::InvalidInput("query has no relations to join".into())),
        [only] => return Ok(*only),
        _ => {}
    }

    let config = root.config.clone();
    let edges = BaseEdges::collect(root);
    let graph = JoinGraph::build(root, &base, &edges);
    let components = graph.components();
    let total_weight: u64 = components.iter().map(|c| component_weight(&graph, c)).sum();
    debug!(
        rels = base.len(),
        edges = edges.len(),
        components = components.len(),
        budget = config.search_budget,
        "join search"
    );

    let mut remaining = Vec::new();
    for component in &components {
        let share = proportional(config.search_budget, component_weight(&graph, component), total_weight);
        let rels: Vec<RelId> = component.iter().map(|v| graph.vertices[*v]).collect();
        trace!(rels = rels.len(), budget = share, "component budget");
        remaining.extend(plan_component(root, &config, &edges, rels, share)?);
    }

    if remaining.len() > 1 {
        remaining = goo(root, &remaining, config.goo_criterion, true)?;
    }
    match remaining.as_slice() {
        [top] => {
            debug!(relids = %root.rel(*top).relids, cost = cheapest_cost(root, *top), "join search done");
            Ok(*top)
        }
        _ => Err(PlanError::InvalidInput(format!(
            "could not find a legal join order for {} remaining relations",
            remaining.len()
        ))),
    }
}

fn component_weight(graph: &JoinGraph, component: &[usize]) -> u64 {
    (component.len() + graph.induced_edge_count(component)) as u64
}

fn proportional(budget: u64, weight: u64, total: u64) -> u64 {
    if total == 0 {
        return budget;
    }
    (budget as u128 * weight as u128 / total as u128) as u64
}

/// Runs decomposition passes over one connected component, returning the
/// rels it was reduced to.
fn plan_component(
    root: &mut PlannerInfo,
    config: &PlannerConfig,
    edges: &BaseEdges,
    mut vertices: Vec<RelId>,
    budget: u64,
) -> Result<Vec<RelId>> {
    let mut pool = budget;
    for pass in 0..config.max_decomposition_iterations {
        if vertices.len() <= 1 {
            break;
        }
        root.check_for_interrupts()?;
        let graph = JoinGraph::build(root, &vertices, edges);
        let all: Vec<usize> = (0..graph.len()).collect();
        let topologies = decompose(&graph, &all, config);

        let fraction = if pass == 0 { config.b1 } else { config.q };
        let pass_budget = ((pool as f64) * fraction) as u64;
        let total_weight: u64 = topologies.iter().map(|t| t.weight(&graph)).sum();
        trace!(pass, vertices = vertices.len(), topologies = topologies.len(), pass_budget, pool, "decomposition pass");

        let mut spent = 0u64;
        let mut next = Vec::with_capacity(vertices.len());
        for topology in &topologies {
            let share = proportional(pass_budget, topology.weight(&graph), total_weight);
            let (used, rels) = plan_subgraph(root, config, &graph, topology, share)?;
            spent = spent.saturating_add(used);
            next.extend(rels);
        }
        pool = pool.saturating_sub(spent);

        let progressed = next.len() < vertices.len();
        vertices = next;
        if !progressed {
            trace!(pass, "decomposition pass made no progress");
            break;
        }
    }
    Ok(vertices)
}

/// Plans one topology with the strategy its budget affords, returning the
/// work spent and the rels that replace its vertices.
fn plan_subgraph(
    root: &mut PlannerInfo,
    config: &PlannerConfig,
    graph: &JoinGraph,
    topology: &Topology,
    budget: u64,
) -> Result<(u64, Vec<RelId>)> {
    let rels: Vec<RelId> = topology.members.iter().map(|v| graph.vertices[*v]).collect();
    if rels.len() <= 1 {
        return Ok((0, rels));
    }

    let standard = topology.cost_standard(graph, budget.saturating_add(1));
    if standard <= budget || topology.is_easy(config) {
        trace!(kind = ?topology.kind, rels = rels.len(), standard, budget, "planning topology with DP");
        if let Some(rel) = dp_join_search(root, &rels)? {
            return Ok((standard, vec![rel]));
        }
    } else if topology.cost_heuristic() <= budget {
        trace!(kind = ?topology.kind, rels = rels.len(), budget, "planning topology with GEQO");
        if let Some(rel) = geqo(root, &rels, budget)? {
            return Ok((budget, vec![rel]));
        }
    }

    trace!(kind = ?topology.kind, rels = rels.len(), budget, "planning topology greedily");
    let joined = goo(root, &rels, config.goo_criterion, config.goo_clauseless)?;
    Ok(((rels.len() as u64).min(budget), joined))
}
