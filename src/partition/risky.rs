// SPDX-License-Identifier: GPL-2.0
//! Risky pair bookkeeping.
//!
//! Every partition keeps the access pairs that may still race. Pairs are
//! only ever removed once populated. Population stops for good when adding
//! a batch would exceed the budget, unless every pair must be computed.

use std::collections::BTreeSet;

use crate::ir::ids::AccessId;

/// An access pair, smaller id first
pub type RiskyPair = (AccessId, AccessId);

/// Order a pair canonically
pub fn ordered_pair(a: AccessId, b: AccessId) -> RiskyPair {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Pairs of one partition that may still race
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RiskyPairSet {
    pairs: BTreeSet<RiskyPair>,
    budget: usize,
    compute_all: bool,
    over_budget: bool,
}

impl RiskyPairSet {
    /// Empty set holding at most `budget` pairs unless `compute_all`
    pub fn new(budget: usize, compute_all: bool) -> Self {
        Self {
            pairs: BTreeSet::new(),
            budget,
            compute_all,
            over_budget: false,
        }
    }

    fn has_budget(&self, n: usize) -> bool {
        !self.over_budget && self.pairs.len() + n <= self.budget
    }

    /// Add every pair of `ids1 × ids2`. Nothing is added when the batch
    /// does not fit in the budget; the set is then over budget for good.
    pub fn add_pairs_from(&mut self, ids1: &[AccessId], ids2: &[AccessId]) {
        if !self.compute_all {
            let n = ids1.len() * ids2.len();
            if !self.has_budget(n) {
                self.over_budget = true;
                return;
            }
        }
        for a in ids1 {
            for b in ids2 {
                self.pairs.insert(ordered_pair(*a, *b));
            }
        }
    }

    /// Whether the pair count reached the budget or a batch was dropped
    pub fn is_over_budget(&self) -> bool {
        self.over_budget || self.pairs.len() >= self.budget
    }

    /// Whether the set was populated while ignoring the budget
    pub fn computes_all(&self) -> bool {
        self.compute_all
    }

    /// Remove every pair `prune` answers true for; returns the number removed
    pub fn retain_not<F: FnMut(AccessId, AccessId) -> bool>(&mut self, mut prune: F) -> usize {
        let before = self.pairs.len();
        self.pairs.retain(|(a, b)| !prune(*a, *b));
        before - self.pairs.len()
    }

    /// Whether the pair is still risky
    pub fn contains(&self, a: AccessId, b: AccessId) -> bool {
        self.pairs.contains(&ordered_pair(a, b))
    }

    /// Surviving pairs, ordered
    pub fn pairs(&self) -> impl Iterator<Item = RiskyPair> + '_ {
        self.pairs.iter().copied()
    }

    /// Accesses taking part in some surviving pair
    pub fn risky_ids(&self) -> BTreeSet<AccessId> {
        self.pairs.iter().flat_map(|(a, b)| [*a, *b]).collect()
    }

    /// Number of pairs
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no pair survives
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
