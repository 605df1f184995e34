//! # Join Simplification Rules
//!
//! This crate provides the default set of join simplification rules. They run
//! after the quals have been distributed and before any path is built, so the
//! join search only ever sees the joins that survive.
//!
//! - **`RemoveUselessLeftJoinsRule`**: Drops `L LEFT JOIN r` when nothing above
//!   the join reads `r` and `r` is unique for the join clauses.
//! - **`ReduceUniqueSemijoinsRule`**: Turns a semijoin into an inner join when
//!   its inner rel is unique for the join clauses.
//! - **`RemoveUselessSelfJoinsRule`**: Replaces an inner join of a table with
//!   itself on a unique key by a single scan.
//!
//! All three rely on the uniqueness proofs in `joinplan_core::uniqueness`, and
//! the two removal rules share the relid rewriting in [`relid_rewrite`].

pub mod reduce_semijoin;
pub mod relid_rewrite;
pub mod remove_left_join;
pub mod self_join;

#[cfg(test)]
pub(crate) mod test_support;

use joinplan_core::rule::RuleRegistry;

pub use reduce_semijoin::ReduceUniqueSemijoinsRule;
pub use remove_left_join::RemoveUselessLeftJoinsRule;
pub use self_join::RemoveUselessSelfJoinsRule;

/// Creates a rule registry with all built-in rules, in the order the planner
/// applies them.
pub fn default_rule_registry() -> RuleRegistry {
    let mut registry = RuleRegistry::new();
    registry.add_rule(Box::new(RemoveUselessLeftJoinsRule));
    registry.add_rule(Box::new(ReduceUniqueSemijoinsRule));
    registry.add_rule(Box::new(RemoveUselessSelfJoinsRule));
    registry
}
