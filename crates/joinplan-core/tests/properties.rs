//! Property-based tests using proptest.
//!
//! - `Relids` behaves like a set of integers (checked against `BTreeSet`)
//! - the set algebra laws hold (commutativity, subset relations, disjointness)
//! - `add_path` never leaves two paths in a list where one dominates the other
//! - the path list stays ordered by total cost

use joinplan_core::catalog::InMemoryCatalog;
use joinplan_core::config::PlannerConfig;
use joinplan_core::path::{Path, PathKind};
use joinplan_core::pathnode::{add_path, compare_path_costs_fuzzily, CostComparison, STD_FUZZ_FACTOR};
use joinplan_core::planner_info::{PlannerInfo, RelId};
use joinplan_core::query::Query;
use joinplan_core::relation::{RelOptInfo, RelOptKind};
use joinplan_core::relids::{Index, Membership, Relids};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

// ── Relids ──────────────────────────────────────────────────────────────────

/// Strategy: member lists spanning several 64-bit words.
fn arb_members() -> impl Strategy<Value = Vec<Index>> {
    prop::collection::vec(0usize..200, 0..24)
}

fn relids_of(members: &[Index]) -> Relids {
    members.iter().copied().collect()
}

fn model_of(members: &[Index]) -> BTreeSet<Index> {
    members.iter().copied().collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn prop_relids_matches_model(members in arb_members()) {
        let set = relids_of(&members);
        let model = model_of(&members);
        prop_assert_eq!(set.iter().collect::<Vec<_>>(), model.iter().copied().collect::<Vec<_>>());
        prop_assert_eq!(set.len(), model.len());
        prop_assert_eq!(set.is_empty(), model.is_empty());
        let expected = match model.len() {
            0 => Membership::Empty,
            1 => Membership::Singleton,
            _ => Membership::Multiple,
        };
        prop_assert_eq!(set.membership(), expected);
        prop_assert_eq!(set.singleton_member(), if model.len() == 1 { model.first().copied() } else { None });
    }

    #[test]
    fn prop_relids_equality_ignores_build_order(members in arb_members()) {
        let mut reversed = members.clone();
        reversed.reverse();
        prop_assert_eq!(relids_of(&members), relids_of(&reversed));
    }

    #[test]
    fn prop_union_and_intersect(a in arb_members(), b in arb_members()) {
        let (x, y) = (relids_of(&a), relids_of(&b));
        let union = x.union(&y);
        prop_assert_eq!(&union, &y.union(&x));
        prop_assert!(x.is_subset(&union));
        prop_assert!(y.is_subset(&union));

        let both = x.intersect(&y);
        prop_assert!(both.is_subset(&x));
        prop_assert!(both.is_subset(&y));
        prop_assert_eq!(x.overlaps(&y), !both.is_empty());

        let model: BTreeSet<Index> = model_of(&a).union(&model_of(&b)).copied().collect();
        prop_assert_eq!(union.iter().collect::<BTreeSet<_>>(), model);
    }

    #[test]
    fn prop_difference_is_disjoint(a in arb_members(), b in arb_members()) {
        let (x, y) = (relids_of(&a), relids_of(&b));
        let diff = x.difference(&y);
        prop_assert!(!diff.overlaps(&y));
        prop_assert!(diff.is_subset(&x));
        prop_assert_eq!(diff.union(&x.intersect(&y)), x.clone());

        let mut in_place = x.clone();
        in_place.difference_with(&y);
        prop_assert_eq!(in_place, diff);
    }

    #[test]
    fn prop_with_without(members in arb_members(), m in 0usize..200) {
        let set = relids_of(&members);
        prop_assert!(set.with(m).contains(m));
        prop_assert!(!set.without(m).contains(m));
        prop_assert_eq!(set.with(m).without(m), set.without(m));
        prop_assert!(set.without(m).is_subset(&set));
    }

    #[test]
    fn prop_replace_moves_member(members in arb_members(), from in 0usize..200, to in 0usize..200) {
        let set = relids_of(&members);
        let mut replaced = set.clone();
        replaced.replace(from, to);
        if set.contains(from) {
            prop_assert!(replaced.contains(to));
            prop_assert!(from == to || !replaced.contains(from));
        } else {
            prop_assert_eq!(replaced, set);
        }
    }
}

// ── add_path ────────────────────────────────────────────────────────────────

fn root_with_rel(consider_startup: bool) -> (PlannerInfo, RelId) {
    let mut root = PlannerInfo::new(Query::new(), Arc::new(InMemoryCatalog::new()), PlannerConfig::default());
    let rel = root.add_rel(RelOptInfo::new(RelOptKind::Base, Relids::singleton(1)));
    root.rel_mut(rel).consider_startup = consider_startup;
    (root, rel)
}

/// Strategy: `(startup, run)` cost pairs; total = startup + run.
fn arb_costs() -> impl Strategy<Value = Vec<(f64, f64)>> {
    prop::collection::vec((0.0f64..1000.0, 0.0f64..1000.0), 1..30)
}

fn costed(rel: RelId, startup: f64, run: f64) -> Path {
    let mut p = Path::new(PathKind::SeqScan, rel);
    p.startup_cost = startup;
    p.total_cost = startup + run;
    p.rows = 100.0;
    p
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_add_path_leaves_no_dominated_pair(costs in arb_costs(), consider_startup in any::<bool>()) {
        let (mut root, rel) = root_with_rel(consider_startup);
        for (startup, run) in costs {
            add_path(&mut root, rel, costed(rel, startup, run));

            let list = root.rel(rel).pathlist.clone();
            prop_assert!(!list.is_empty());
            for (i, a) in list.iter().enumerate() {
                for b in &list[i + 1..] {
                    let cmp = compare_path_costs_fuzzily(&root, root.path(*a), root.path(*b), STD_FUZZ_FACTOR);
                    prop_assert_eq!(cmp, CostComparison::Different);
                }
            }
        }
    }

    #[test]
    fn prop_add_path_keeps_total_cost_order(costs in arb_costs()) {
        let (mut root, rel) = root_with_rel(true);
        for (startup, run) in costs {
            add_path(&mut root, rel, costed(rel, startup, run));
        }
        let totals: Vec<f64> = root.rel(rel).pathlist.iter().map(|id| root.path(*id).total_cost).collect();
        prop_assert!(totals.windows(2).all(|w| w[0] <= w[1]), "{:?}", totals);
    }

    #[test]
    fn prop_without_startup_one_path_survives(costs in arb_costs()) {
        let (mut root, rel) = root_with_rel(false);
        for (startup, run) in costs {
            add_path(&mut root, rel, costed(rel, startup, run));
        }
        let list = &root.rel(rel).pathlist;
        prop_assert_eq!(list.len(), 1);
    }
}
