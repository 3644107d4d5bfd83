// SPDX-License-Identifier: GPL-2.0
//! Context-sensitive points-to and flows-to sets.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::cfl::context::CflContext;
use crate::ir::ids::NodeId;
use crate::pta::PointerAnalysis;

/// Progress of one cached query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// Never started
    #[default]
    Fresh,
    /// On the current query stack
    InProcess,
    /// Complete
    Solved,
    /// The operation budget ran out
    OutOfBudget,
    /// The graph holds something the traversal cannot handle
    OtherFailure,
}

impl QueryStatus {
    /// Whether the query failed for good
    pub fn is_failed(self) -> bool {
        matches!(self, QueryStatus::OutOfBudget | QueryStatus::OtherFailure)
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            QueryStatus::Fresh => "fresh",
            QueryStatus::InProcess => "in process",
            QueryStatus::Solved => "solved",
            QueryStatus::OutOfBudget => "out of budget",
            QueryStatus::OtherFailure => "failed",
        })
    }
}

/// Nodes, each with the contexts under which it is reached.
///
/// Used both for points-to sets (object nodes) and flows-to sets (pointer
/// nodes).
#[derive(Debug, Clone)]
pub struct CsPts<C> {
    pts: BTreeMap<NodeId, BTreeSet<C>>,
    status: QueryStatus,
}

impl<C> Default for CsPts<C> {
    fn default() -> Self {
        Self {
            pts: BTreeMap::new(),
            status: QueryStatus::Fresh,
        }
    }
}

impl<C: CflContext> CsPts<C> {
    /// Empty, fresh set
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty set carrying a failure status
    pub fn failed(status: QueryStatus) -> Self {
        Self {
            pts: BTreeMap::new(),
            status,
        }
    }

    /// Add `n` under `ctx`
    pub fn add(&mut self, n: NodeId, ctx: C) {
        self.pts.entry(n).or_default().insert(ctx);
    }

    /// Add `n` under every context of `ctxs`
    pub fn add_all(&mut self, n: NodeId, ctxs: &BTreeSet<C>) {
        self.pts.entry(n).or_default().extend(ctxs.iter().cloned());
    }

    /// Add every entry of `other`
    pub fn union(&mut self, other: &CsPts<C>) {
        for (n, ctxs) in &other.pts {
            self.add_all(*n, ctxs);
        }
    }

    /// Entries in node order
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &BTreeSet<C>)> + '_ {
        self.pts.iter().map(|(n, c)| (*n, c))
    }

    /// Nodes in order
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.pts.keys().copied()
    }

    /// Whether `n` is in the set under some context
    pub fn contains(&self, n: NodeId) -> bool {
        self.pts.contains_key(&n)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.pts.len()
    }

    /// Whether no node was added
    pub fn is_empty(&self) -> bool {
        self.pts.is_empty()
    }

    /// Query status
    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Update the query status
    pub fn set_status(&mut self, status: QueryStatus) {
        self.status = status;
    }

    /// Whether the query completed
    pub fn is_solved(&self) -> bool {
        self.status == QueryStatus::Solved
    }

    /// Whether both sets hold one node under matching contexts. The
    /// unknown-memory node `dummy` aliases everything.
    pub fn alias(&self, other: &CsPts<C>, dummy: NodeId) -> bool {
        if (self.contains(dummy) && !other.is_empty()) || (other.contains(dummy) && !self.is_empty()) {
            return true;
        }
        let (mut it1, mut it2) = (self.pts.iter().peekable(), other.pts.iter().peekable());
        while let (Some((n1, c1)), Some((n2, c2))) = (it1.peek(), it2.peek()) {
            match n1.cmp(n2) {
                std::cmp::Ordering::Less => {
                    it1.next();
                }
                std::cmp::Ordering::Greater => {
                    it2.next();
                }
                std::cmp::Ordering::Equal => {
                    if c1.iter().any(|a| c2.iter().any(|b| a.matches(b))) {
                        return true;
                    }
                    it1.next();
                    it2.next();
                }
            }
        }
        false
    }

    /// Add the base object of every field object. An intrinsic touching
    /// the base touches any of its fields.
    pub fn include_base_for_any_field(&mut self, pta: &PointerAnalysis) {
        self.include_bases(pta, |_| true);
    }

    /// Add the base object of every field at offset 0, which shares its
    /// address with the base
    pub fn include_base_for_first_field(&mut self, pta: &PointerAnalysis) {
        self.include_bases(pta, |field| field == 0);
    }

    fn include_bases<F: Fn(u32) -> bool>(&mut self, pta: &PointerAnalysis, pick: F) {
        let pag = pta.pag();
        let mut extra: Vec<(NodeId, BTreeSet<C>)> = Vec::new();
        for (n, ctxs) in &self.pts {
            let Some(o) = pag.as_obj(*n) else {
                continue;
            };
            let obj = pta.obj(o);
            match obj.field {
                Some(k) if obj.base != o && pick(k) => {
                    extra.push((pag.obj_node(obj.base), ctxs.clone()));
                }
                _ => {}
            }
        }
        for (n, ctxs) in extra {
            self.add_all(n, &ctxs);
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::cfl::context::CallString;
    use crate::ir::ids::InstId;

    fn ctx(sites: &[usize]) -> CallString {
        CallString::from_sites(sites.iter().map(|s| InstId::new(*s)).collect())
    }

    #[test]
    fn test_alias_needs_matching_contexts() {
        let dummy = NodeId::new(1000);
        let mut a = CsPts::new();
        let mut b = CsPts::new();
        a.add(NodeId::new(3), ctx(&[1, 2]));
        b.add(NodeId::new(3), ctx(&[4, 2]));
        b.add(NodeId::new(7), ctx(&[]));
        assert!(!a.alias(&b, dummy));
        b.add(NodeId::new(3), ctx(&[2]));
        assert!(a.alias(&b, dummy));
        assert!(b.alias(&a, dummy));
    }

    #[test]
    fn test_dummy_aliases_everything() {
        let dummy = NodeId::new(9);
        let mut a: CsPts<CallString> = CsPts::new();
        let mut b = CsPts::new();
        a.add(dummy, CallString::new());
        assert!(!a.alias(&b, dummy));
        b.add(NodeId::new(2), ctx(&[5]));
        assert!(a.alias(&b, dummy));
    }

    #[test]
    fn test_status_transitions() {
        let mut p: CsPts<CallString> = CsPts::new();
        assert_eq!(p.status(), QueryStatus::Fresh);
        p.set_status(QueryStatus::InProcess);
        assert!(!p.status().is_failed());
        p.set_status(QueryStatus::OutOfBudget);
        assert!(p.status().is_failed());
        assert!(!p.is_solved());
    }
}
