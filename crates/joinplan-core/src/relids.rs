//! # Relation Index Sets
//!
//! `Relids` is a compact set of small non-negative integers. The planner uses it
//! for range-table indexes (base relations and outer joins share one numbering
//! space), and reuses the same structure for any other dense integer set such as
//! vertex indexes during join search or restriction-clause serial numbers.
//!
//! ## Representation
//!
//! The set is stored as a vector of 64-bit words. Trailing zero words are always
//! trimmed, so two sets with the same members compare equal and hash equally no
//! matter how they were built. Sets that only ever hold members below 64 never
//! allocate more than one word.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Range-table index. Index 0 is never a relation; it marks "the final output".
pub type Index = usize;

const WORD_BITS: usize = 64;

/// How many members a set has, without counting past two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Empty,
    Singleton,
    Multiple,
}

/// A set of relation indexes.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relids {
    words: Vec<u64>,
}

impl Relids {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn singleton(member: Index) -> Self {
        let mut set = Self::new();
        set.add(member);
        set
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn membership(&self) -> Membership {
        let mut seen = 0;
        for word in &self.words {
            seen += word.count_ones();
            if seen > 1 {
                return Membership::Multiple;
            }
        }
        if seen == 1 {
            Membership::Singleton
        } else {
            Membership::Empty
        }
    }

    /// The only member of a one-element set.
    pub fn singleton_member(&self) -> Option<Index> {
        match self.membership() {
            Membership::Singleton => self.first(),
            _ => None,
        }
    }

    pub fn first(&self) -> Option<Index> {
        self.iter().next()
    }

    pub fn contains(&self, member: Index) -> bool {
        let (w, b) = (member / WORD_BITS, member % WORD_BITS);
        self.words.get(w).is_some_and(|word| word & (1u64 << b) != 0)
    }

    pub fn add(&mut self, member: Index) {
        let (w, b) = (member / WORD_BITS, member % WORD_BITS);
        if self.words.len() <= w {
            self.words.resize(w + 1, 0);
        }
        self.words[w] |= 1u64 << b;
    }

    pub fn remove(&mut self, member: Index) {
        let (w, b) = (member / WORD_BITS, member % WORD_BITS);
        if let Some(word) = self.words.get_mut(w) {
            *word &= !(1u64 << b);
            self.trim();
        }
    }

    pub fn with(&self, member: Index) -> Self {
        let mut out = self.clone();
        out.add(member);
        out
    }

    pub fn without(&self, member: Index) -> Self {
        let mut out = self.clone();
        out.remove(member);
        out
    }

    pub fn union(&self, other: &Relids) -> Self {
        let mut out = self.clone();
        out.union_with(other);
        out
    }

    pub fn union_with(&mut self, other: &Relids) {
        if self.words.len() < other.words.len() {
            self.words.resize(other.words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            *dst |= *src;
        }
    }

    pub fn intersect(&self, other: &Relids) -> Self {
        let mut out = Relids {
            words: self
                .words
                .iter()
                .zip(&other.words)
                .map(|(a, b)| a & b)
                .collect(),
        };
        out.trim();
        out
    }

    pub fn difference(&self, other: &Relids) -> Self {
        let mut out = self.clone();
        out.difference_with(other);
        out
    }

    pub fn difference_with(&mut self, other: &Relids) {
        for (dst, src) in self.words.iter_mut().zip(&other.words) {
            *dst &= !*src;
        }
        self.trim();
    }

    /// True when every member of `self` is also in `other`.
    pub fn is_subset(&self, other: &Relids) -> bool {
        if self.words.len() > other.words.len() {
            return false;
        }
        self.words
            .iter()
            .zip(&other.words)
            .all(|(a, b)| a & !b == 0)
    }

    pub fn overlaps(&self, other: &Relids) -> bool {
        self.words
            .iter()
            .zip(&other.words)
            .any(|(a, b)| a & b != 0)
    }

    /// Compares two sets by inclusion.
    pub fn subset_compare(&self, other: &Relids) -> SubsetComparison {
        match (self.is_subset(other), other.is_subset(self)) {
            (true, true) => SubsetComparison::Equal,
            (true, false) => SubsetComparison::Subset1,
            (false, true) => SubsetComparison::Subset2,
            (false, false) => SubsetComparison::Different,
        }
    }

    /// Replaces `from` by `to` when `from` is a member.
    pub fn replace(&mut self, from: Index, to: Index) {
        if self.contains(from) {
            self.remove(from);
            self.add(to);
        }
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Index> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(w * WORD_BITS + bit)
            })
        })
    }
}

/// Result of [`Relids::subset_compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubsetComparison {
    Equal,
    /// The left set is a proper subset of the right one.
    Subset1,
    /// The right set is a proper subset of the left one.
    Subset2,
    Different,
}

impl FromIterator<Index> for Relids {
    fn from_iter<T: IntoIterator<Item = Index>>(iter: T) -> Self {
        let mut set = Relids::new();
        for member in iter {
            set.add(member);
        }
        set
    }
}

impl fmt::Debug for Relids {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(b")?;
        for member in self.iter() {
            write!(f, " {member}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Relids {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Builds a `Relids` from a list of members.
#[macro_export]
macro_rules! relids {
    () => { $crate::relids::Relids::new() };
    ($($member:expr),+ $(,)?) => {{
        let mut set = $crate::relids::Relids::new();
        $( set.add($member); )+
        set
    }};
}
