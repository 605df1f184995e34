//! # Rule System
//!
//! Join simplification passes run between predicate distribution and path
//! construction. Each pass is a [`Rule`]: it inspects the whole query level
//! held by [`PlannerInfo`] and rewrites it in place, reporting whether it
//! changed anything.
//!
//! ## Fixpoint
//!
//! The planner applies every enabled rule in registration order and repeats
//! each one until it reports no change. A rule may therefore remove one join
//! per call; removing a join often exposes the next one.
//!
//! ## Registration
//!
//! The core does not know any concrete rules. Callers assemble a
//! [`RuleRegistry`] (the rules crate provides the default one) and pass it to
//! [`crate::planner::plan_query`].

use crate::config::PlannerConfig;
use crate::error::Result;
use crate::planner_info::PlannerInfo;
use tracing::debug;

/// A query-level rewrite applied before the join search.
pub trait Rule: Send + Sync {
    /// Unique name of this rule.
    fn name(&self) -> &str;

    /// Whether the configuration allows this rule to run.
    fn enabled(&self, _config: &PlannerConfig) -> bool {
        true
    }

    /// Rewrites `root` in place. Returns `true` if anything changed.
    ///
    /// A rule that cannot prove its rewrite safe returns `Ok(false)`; errors
    /// are reserved for malformed planner state.
    fn apply(&self, root: &mut PlannerInfo) -> Result<bool>;
}

/// Ordered collection of simplification rules.
#[derive(Default)]
pub struct RuleRegistry {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name()).collect()
    }

    /// Rules the configuration allows, in registration order.
    pub fn active_rules(&self, config: &PlannerConfig) -> Vec<&dyn Rule> {
        self.rules
            .iter()
            .map(|r| r.as_ref())
            .filter(|r| r.enabled(config))
            .collect()
    }

    /// Runs each active rule until it stops changing the query. Returns the
    /// number of successful applications.
    pub fn apply_to_fixpoint(&self, root: &mut PlannerInfo) -> Result<usize> {
        let config = root.config.clone();
        let mut applied = 0;
        for rule in self.active_rules(&config) {
            loop {
                root.check_for_interrupts()?;
                if !rule.apply(root)? {
                    break;
                }
                applied += 1;
                debug!(rule = rule.name(), base_rels = %root.all_baserels, "simplification rule applied");
            }
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::query::Query;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Reports a change for its first `limit` calls.
    struct Countdown {
        limit: usize,
        calls: AtomicUsize,
    }

    impl Rule for Countdown {
        fn name(&self) -> &str {
            "countdown"
        }

        fn apply(&self, _root: &mut PlannerInfo) -> Result<bool> {
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) < self.limit)
        }
    }

    struct Disabled;

    impl Rule for Disabled {
        fn name(&self) -> &str {
            "disabled"
        }

        fn enabled(&self, _config: &PlannerConfig) -> bool {
            false
        }

        fn apply(&self, _root: &mut PlannerInfo) -> Result<bool> {
            Ok(true)
        }
    }

    fn root() -> PlannerInfo {
        PlannerInfo::new(Query::new(), Arc::new(InMemoryCatalog::new()), PlannerConfig::default())
    }

    #[test]
    fn test_rules_run_to_fixpoint_in_order() {
        let mut registry = RuleRegistry::new();
        registry.add_rule(Box::new(Countdown {
            limit: 3,
            calls: AtomicUsize::new(0),
        }));
        registry.add_rule(Box::new(Disabled));
        assert_eq!(registry.names(), vec!["countdown", "disabled"]);

        let mut root = root();
        assert_eq!(registry.apply_to_fixpoint(&mut root).unwrap(), 3);
        assert_eq!(registry.active_rules(&root.config).len(), 1);
    }

    #[test]
    fn test_cancellation_stops_rules() {
        let mut registry = RuleRegistry::new();
        registry.add_rule(Box::new(Countdown {
            limit: 1,
            calls: AtomicUsize::new(0),
        }));
        let mut root = root();
        root.cancel.cancel();
        assert!(registry.apply_to_fixpoint(&mut root).is_err());
    }
}
