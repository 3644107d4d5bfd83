// SPDX-License-Identifier: GPL-2.0
//! Result cache of points-to and flows-to queries.
//!
//! Entries are keyed by node and interned context (and offset for flows-to
//! queries) and move through the [`QueryStatus`] lattice in place. A cache
//! belongs to one solver; a solver must not be shared between runs that
//! execute at the same time.

use std::collections::BTreeMap;
use std::fmt;

use crate::cfl::context::{CflContext, CtxId};
use crate::cfl::pts::{CsPts, QueryStatus};
use crate::ir::ids::NodeId;

/// Key of a points-to query
pub type PtsKey = (NodeId, CtxId);

/// Key of a flows-to query
pub type FtsKey = (NodeId, Option<u32>, CtxId);

/// Lookup counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a finished entry
    pub hits: u64,
    /// Lookups that had to start a traversal
    pub misses: u64,
}

impl CacheStats {
    /// Add the counters of `other`
    pub fn merge(&mut self, other: CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} hits, {} misses", self.hits, self.misses)
    }
}

/// Query results by key
#[derive(Debug, Clone)]
pub struct QueryCache<K, C> {
    entries: BTreeMap<K, CsPts<C>>,
    stats: CacheStats,
}

impl<K, C> Default for QueryCache<K, C> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            stats: CacheStats::default(),
        }
    }
}

impl<K: Ord + Copy, C: CflContext> QueryCache<K, C> {
    /// Empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry of `key`. Finished entries count as hits; missing and fresh
    /// ones as misses. In-process entries are not counted.
    pub fn lookup(&mut self, key: &K) -> Option<&CsPts<C>> {
        let entry = self.entries.get(key);
        match entry.map(CsPts::status) {
            Some(QueryStatus::InProcess) => {}
            Some(QueryStatus::Fresh) | None => self.stats.misses += 1,
            Some(_) => self.stats.hits += 1,
        }
        entry
    }

    /// Status of `key`; fresh when absent
    pub fn status(&self, key: &K) -> QueryStatus {
        self.entries.get(key).map(CsPts::status).unwrap_or_default()
    }

    /// Move `key` to `status`, creating an empty entry when absent
    pub fn set_status(&mut self, key: K, status: QueryStatus) {
        self.entries.entry(key).or_default().set_status(status);
    }

    /// Replace the entry of `key`
    pub fn store(&mut self, key: K, pts: CsPts<C>) {
        self.entries.insert(key, pts);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Lookup counters
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Drop every entry and reset the counters
    pub fn reset(&mut self) {
        self.entries.clear();
        self.stats = CacheStats::default();
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::cfl::context::{CallString, CtxPool};

    #[test]
    fn test_hits_and_misses() {
        let mut pool = CtxPool::new();
        let c = pool.intern(CallString::new());
        let key = (NodeId::new(4), c);
        let mut cache: QueryCache<PtsKey, CallString> = QueryCache::new();

        assert!(cache.lookup(&key).is_none());
        cache.set_status(key, QueryStatus::InProcess);
        assert_eq!(cache.status(&key), QueryStatus::InProcess);
        assert!(cache.lookup(&key).is_some());

        let mut done = CsPts::new();
        done.add(NodeId::new(8), CallString::new());
        done.set_status(QueryStatus::Solved);
        cache.store(key, done);
        assert_eq!(cache.lookup(&key).map(CsPts::len), Some(1));

        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
        cache.reset();
        assert!(cache.is_empty());
        assert_eq!(cache.stats(), CacheStats::default());
    }
}
