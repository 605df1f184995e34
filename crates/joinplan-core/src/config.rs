//! # Planner Configuration
//!
//! `PlannerConfig` gathers the cost constants, the per-path-type enable switches,
//! the simplification switches and the join-search knobs. Everything has a
//! default so callers only set what they want to change.
//!
//! ## Disabled Path Types
//!
//! Turning off a path type (say `enable_hashjoin`) does not remove it from the
//! search. Such paths are charged [`DISABLE_COST`] on top of their real cost, so
//! they lose to any enabled alternative but a plan is still produced when
//! nothing else is possible.
//!
//! ## Search Budget
//!
//! The join search spends an abstract number of work units (`search_budget`).
//! Each connected component of the join graph receives a share proportional to
//! its size. The first decomposition pass over a component may use the fraction
//! `b1` of that share, each later pass the fraction `q` of what remains.

use crate::error::{PlanError, Result};
use serde::{Deserialize, Serialize};

/// Cost added to paths of a disabled type.
pub const DISABLE_COST: f64 = 1.0e10;

/// How the final greedy combination ranks candidate pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GooCriterion {
    /// Cheapest total cost of the resulting join.
    Cost,
    /// Smallest result rows relative to the cross product of the inputs.
    Selectivity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub seq_page_cost: f64,
    pub random_page_cost: f64,
    pub cpu_tuple_cost: f64,
    pub cpu_index_tuple_cost: f64,
    pub cpu_operator_cost: f64,
    /// Memory available to a sort or hash table before spilling, in kilobytes.
    pub work_mem_kb: u64,
    /// Pages assumed to be cached across repeated index lookups.
    pub effective_cache_size_pages: f64,

    pub enable_seqscan: bool,
    pub enable_indexscan: bool,
    pub enable_nestloop: bool,
    pub enable_mergejoin: bool,
    pub enable_hashjoin: bool,
    pub enable_material: bool,
    pub enable_sort: bool,

    pub enable_left_join_removal: bool,
    pub enable_self_join_elimination: bool,
    pub enable_semijoin_reduction: bool,
    pub enable_or_pullup: bool,
    /// A derived OR restriction is kept only if its selectivity is at most this.
    pub or_pullup_max_selectivity: f64,

    /// Work units available to the whole join search.
    pub search_budget: u64,
    /// Fraction of a component's budget spent on its first decomposition pass.
    pub b1: f64,
    /// Fraction of the remaining budget spent on each later pass.
    pub q: f64,
    /// Average degree above which a subgraph is treated as dense.
    pub dense_degree_threshold: f64,
    /// Minimum number of leaves for a hub to form a star.
    pub star_min_leaves: usize,
    /// Chains up to this many vertices are always planned exhaustively.
    pub easy_chain_max: usize,
    /// Stars up to this many vertices are always planned exhaustively.
    pub easy_star_max: usize,
    pub max_decomposition_iterations: usize,
    pub goo_criterion: GooCriterion,
    /// Let the final greedy step form cross products freely.
    pub goo_clauseless: bool,
    pub geqo_seed: u64,
    pub geqo_generations: usize,
    pub geqo_pool_size: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            seq_page_cost: 1.0,
            random_page_cost: 4.0,
            cpu_tuple_cost: 0.01,
            cpu_index_tuple_cost: 0.005,
            cpu_operator_cost: 0.0025,
            work_mem_kb: 4096,
            effective_cache_size_pages: 524_288.0,
            enable_seqscan: true,
            enable_indexscan: true,
            enable_nestloop: true,
            enable_mergejoin: true,
            enable_hashjoin: true,
            enable_material: true,
            enable_sort: true,
            enable_left_join_removal: true,
            enable_self_join_elimination: true,
            enable_semijoin_reduction: true,
            enable_or_pullup: true,
            or_pullup_max_selectivity: 0.9,
            search_budget: 10_000,
            b1: 0.5,
            q: 0.5,
            dense_degree_threshold: 3.0,
            star_min_leaves: 3,
            easy_chain_max: 8,
            easy_star_max: 6,
            max_decomposition_iterations: 64,
            goo_criterion: GooCriterion::Cost,
            goo_clauseless: false,
            geqo_seed: 0x5eed,
            geqo_generations: 32,
            geqo_pool_size: 16,
        }
    }
}

impl PlannerConfig {
    /// Checks that every knob is in range.
    pub fn validate(&self) -> Result<()> {
        let costs = [
            ("seq_page_cost", self.seq_page_cost),
            ("random_page_cost", self.random_page_cost),
            ("cpu_tuple_cost", self.cpu_tuple_cost),
            ("cpu_index_tuple_cost", self.cpu_index_tuple_cost),
            ("cpu_operator_cost", self.cpu_operator_cost),
        ];
        for (name, value) in costs {
            if !value.is_finite() || value < 0.0 {
                return Err(PlanError::InvalidConfig(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        for (name, value) in [("b1", self.b1), ("q", self.q)] {
            if !(value > 0.0 && value < 1.0) {
                return Err(PlanError::InvalidConfig(format!(
                    "{name} must lie strictly between 0 and 1, got {value}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.or_pullup_max_selectivity) {
            return Err(PlanError::InvalidConfig(format!(
                "or_pullup_max_selectivity must lie in [0, 1], got {}",
                self.or_pullup_max_selectivity
            )));
        }
        if self.work_mem_kb == 0 {
            return Err(PlanError::InvalidConfig("work_mem_kb must be positive".into()));
        }
        if self.search_budget == 0 {
            return Err(PlanError::InvalidConfig("search_budget must be positive".into()));
        }
        if self.geqo_pool_size < 2 || self.geqo_generations == 0 {
            return Err(PlanError::InvalidConfig(
                "geqo_pool_size must be at least 2 and geqo_generations positive".into(),
            ));
        }
        if self.max_decomposition_iterations == 0 {
            return Err(PlanError::InvalidConfig(
                "max_decomposition_iterations must be positive".into(),
            ));
        }
        Ok(())
    }
}
