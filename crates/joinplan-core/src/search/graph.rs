//! Join graph over the rels the search is currently combining.
//!
//! Edges come from simple inner equi-joins between two base rels: pushed-down,
//! mergejoinable, non-volatile join clauses, and pairs of members of a
//! non-constant equivalence class. A vertex is any rel (base or join) and two
//! vertices are adjacent when some base edge crosses between their relid sets.

use crate::equivalence::have_relevant_eclass_joinclause;
use crate::planner_info::{PlannerInfo, RelId};
use crate::relids::{Index, Relids};
use std::collections::{BTreeSet, VecDeque};

/// Undirected edges between base rel indexes, smaller index first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaseEdges {
    edges: BTreeSet<(Index, Index)>,
}

impl BaseEdges {
    /// Collects every simple inner equi-join edge of the query.
    pub fn collect(root: &PlannerInfo) -> Self {
        let mut edges = BTreeSet::new();
        let mut note = |a: Index, b: Index| {
            if a != b {
                edges.insert((a.min(b), a.max(b)));
            }
        };

        let base_of = |relids: &Relids| relids.intersect(&root.all_baserels).singleton_member();
        for rel in root.base_rel_ids() {
            for id in &root.rel(rel).joininfo {
                let rinfo = root.rinfo(*id);
                if !rinfo.is_pushed_down || !rinfo.can_join || rinfo.mergeopfamilies.is_empty() || rinfo.has_volatile()
                {
                    continue;
                }
                if let (Some(l), Some(r)) = (base_of(&rinfo.left_relids), base_of(&rinfo.right_relids)) {
                    note(l, r);
                }
            }
        }

        for ec in &root.eq_classes {
            if !ec.is_live() || ec.ec_has_const || ec.ec_has_volatile {
                continue;
            }
            let members: Vec<Index> = ec
                .ec_members
                .iter()
                .filter(|em| !em.em_is_child && !em.em_is_const)
                .filter_map(|em| base_of(&em.em_relids))
                .collect();
            for (i, a) in members.iter().enumerate() {
                for b in &members[i + 1..] {
                    note(*a, *b);
                }
            }
        }
        Self { edges }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Does some edge join a member of `a` to a member of `b`?
    pub fn connects(&self, a: &Relids, b: &Relids) -> bool {
        self.edges
            .iter()
            .any(|(x, y)| (a.contains(*x) && b.contains(*y)) || (a.contains(*y) && b.contains(*x)))
    }
}

/// Is there any join clause, inner or outer, linking the two rels?
pub fn have_relevant_joinclause(root: &PlannerInfo, rel1: RelId, rel2: RelId) -> bool {
    let (r1, r2) = (root.rel(rel1), root.rel(rel2));
    let (small, other) = if r1.joininfo.len() <= r2.joininfo.len() { (r1, r2) } else { (r2, r1) };
    small
        .joininfo
        .iter()
        .any(|id| root.rinfo(*id).required_relids.overlaps(&other.relids))
        || have_relevant_eclass_joinclause(root, rel1, rel2)
}

/// Adjacency structure over a set of rels.
#[derive(Debug, Clone)]
pub struct JoinGraph {
    pub vertices: Vec<RelId>,
    pub relids: Vec<Relids>,
    pub adj: Vec<Vec<usize>>,
}

impl JoinGraph {
    pub fn build(root: &PlannerInfo, vertices: &[RelId], edges: &BaseEdges) -> Self {
        let relids: Vec<Relids> = vertices.iter().map(|v| root.rel(*v).relids.clone()).collect();
        let n = vertices.len();
        let mut adj = vec![Vec::new(); n];
        for i in 0..n {
            for j in i + 1..n {
                if edges.connects(&relids[i], &relids[j]) {
                    adj[i].push(j);
                    adj[j].push(i);
                }
            }
        }
        Self {
            vertices: vertices.to_vec(),
            relids,
            adj,
        }
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn degree(&self, v: usize) -> usize {
        self.adj[v].len()
    }

    pub fn edge_count(&self) -> usize {
        self.adj.iter().map(Vec::len).sum::<usize>() / 2
    }

    pub fn adjacent(&self, a: usize, b: usize) -> bool {
        self.adj[a].contains(&b)
    }

    /// Edges with both ends in `members`.
    pub fn induced_edge_count(&self, members: &[usize]) -> usize {
        members
            .iter()
            .map(|v| self.adj[*v].iter().filter(|w| members.contains(w)).count())
            .sum::<usize>()
            / 2
    }

    /// Connected components, each sorted, in order of their smallest vertex.
    pub fn components(&self) -> Vec<Vec<usize>> {
        let mut seen = vec![false; self.len()];
        let mut out = Vec::new();
        for start in 0..self.len() {
            if seen[start] {
                continue;
            }
            seen[start] = true;
            let mut component = vec![start];
            let mut queue = VecDeque::from([start]);
            while let Some(v) = queue.pop_front() {
                for w in &self.adj[v] {
                    if !seen[*w] {
                        seen[*w] = true;
                        component.push(*w);
                        queue.push_back(*w);
                    }
                }
            }
            component.sort_unstable();
            out.push(component);
        }
        out
    }

    /// Adjacency of the subgraph induced by `members`, as bitmasks over
    /// positions in `members`. `None` when it has more than 64 vertices.
    pub fn masks(&self, members: &[usize]) -> Option<Vec<u64>> {
        if members.len() > 64 {
            return None;
        }
        let masks = members
            .iter()
            .map(|v| {
                members
                    .iter()
                    .enumerate()
                    .filter(|(_, w)| self.adjacent(*v, **w))
                    .fold(0u64, |mask, (pos, _)| mask | (1u64 << pos))
            })
            .collect();
        Some(masks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relids;

    /// Graph over vertices 0..n given by base relids 1..=n.
    fn graph(n: usize, pairs: &[(Index, Index)]) -> JoinGraph {
        let edges = BaseEdges {
            edges: pairs.iter().map(|(a, b)| (*a.min(b), *a.max(b))).collect(),
        };
        let relids: Vec<Relids> = (1..=n).map(Relids::singleton).collect();
        let mut adj = vec![Vec::new(); n];
        for i in 0..n {
            for j in i + 1..n {
                if edges.connects(&relids[i], &relids[j]) {
                    adj[i].push(j);
                    adj[j].push(i);
                }
            }
        }
        JoinGraph {
            vertices: (0..n).map(RelId).collect(),
            relids,
            adj,
        }
    }

    #[test]
    fn test_components_split_disconnected_parts() {
        let g = graph(5, &[(1, 2), (2, 3), (4, 5)]);
        assert_eq!(g.components(), vec![vec![0, 1, 2], vec![3, 4]]);
        assert_eq!(g.edge_count(), 3);
    }

    #[test]
    fn test_edges_cross_join_rel_boundaries() {
        let edges = BaseEdges {
            edges: [(1, 3)].into_iter().collect(),
        };
        assert!(edges.connects(&relids![1, 2], &relids![3]));
        assert!(!edges.connects(&relids![1, 3], &relids![2]));
    }

    #[test]
    fn test_masks_follow_member_positions() {
        let g = graph(4, &[(1, 2), (2, 3), (3, 4)]);
        let masks = g.masks(&[1, 2, 3]).unwrap();
        assert_eq!(masks, vec![0b010, 0b101, 0b010]);
        assert_eq!(g.induced_edge_count(&[1, 2, 3]), 2);
    }
}
