// SPDX-License-Identifier: GPL-2.0
//! Detection statistics.
//!
//! Phase timings and counters gathered while the pipeline runs.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Pipeline phases that are timed separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Operation collection
    OpCollection,
    /// Memory partitioning
    MemPart,
    /// Thread-escape filtering
    Escape,
    /// May-happen-in-parallel analysis
    Mhp,
    /// Lockset analysis
    Lockset,
    /// Barrier analysis
    Barrier,
    /// Heap, join and path refinement
    FurtherRefinement,
    /// Context-sensitive alias refinement
    CsRefinement,
}

impl Phase {
    /// All phases in execution order
    pub const ALL: [Phase; 8] = [
        Phase::OpCollection,
        Phase::MemPart,
        Phase::Escape,
        Phase::Mhp,
        Phase::Lockset,
        Phase::Barrier,
        Phase::FurtherRefinement,
        Phase::CsRefinement,
    ];

    /// Display name
    pub fn name(self) -> &'static str {
        match self {
            Phase::OpCollection => "OpCollection",
            Phase::MemPart => "MemPart",
            Phase::Escape => "Escape",
            Phase::Mhp => "Mhp",
            Phase::Lockset => "Lockset",
            Phase::Barrier => "Barrier",
            Phase::FurtherRefinement => "FurtherRefinement",
            Phase::CsRefinement => "CsRefinement",
        }
    }
}

/// Statistics of one detection run
#[derive(Debug, Clone, Default)]
pub struct AnalysisStats {
    /// Time spent per phase
    pub phase_time: BTreeMap<Phase, Duration>,
    /// Risky pairs alive after each phase
    pub pairs_after: BTreeMap<Phase, usize>,
    /// Number of collected memory accesses
    pub accesses: usize,
    /// Number of non-empty partitions
    pub partitions: usize,
    /// Spawn sites found
    pub spawn_sites: usize,
    /// Alias cache hits
    pub cache_hits: u64,
    /// Alias cache misses
    pub cache_misses: u64,
    /// Pairs the context-sensitive refinement removed
    pub cs_refined_pairs: usize,
    /// Pairs the context-sensitive refinement could not remove
    pub cs_unrefined_pairs: usize,
    /// Alias queries that ran out of budget
    pub cs_out_of_budget: usize,
    /// Number of races reported
    pub races: usize,
}

impl AnalysisStats {
    /// Create empty statistics
    pub fn new() -> Self {
        Self::default()
    }

    /// Start timing a phase
    pub fn start_timer(&self) -> Instant {
        Instant::now()
    }

    /// Stop timing a phase, accumulating into its total
    pub fn stop_timer(&mut self, phase: Phase, start: Instant) {
        *self.phase_time.entry(phase).or_default() += start.elapsed();
    }

    /// Record the number of risky pairs left after a phase
    pub fn record_pairs(&mut self, phase: Phase, pairs: usize) {
        self.pairs_after.insert(phase, pairs);
    }

    /// Total time of all phases
    pub fn total_time(&self) -> Duration {
        self.phase_time.values().sum()
    }

    /// Alias cache hit rate in percent
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        (self.cache_hits as f64 / total as f64) * 100.0
    }
}

impl fmt::Display for AnalysisStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Race Detection Statistics ===")?;
        writeln!(f, "Accesses: {}", self.accesses)?;
        writeln!(f, "Partitions: {}", self.partitions)?;
        writeln!(f, "Spawn Sites: {}", self.spawn_sites)?;
        writeln!(f)?;
        writeln!(f, "--- Phases ---")?;
        for phase in Phase::ALL {
            let time = self.phase_time.get(&phase).copied().unwrap_or_default();
            match self.pairs_after.get(&phase) {
                Some(pairs) => writeln!(
                    f,
                    "{:<18} {:>10.3}ms  {:>8} pairs",
                    phase.name(),
                    time.as_secs_f64() * 1000.0,
                    pairs
                )?,
                None => writeln!(
                    f,
                    "{:<18} {:>10.3}ms",
                    phase.name(),
                    time.as_secs_f64() * 1000.0
                )?,
            }
        }
        writeln!(f)?;
        writeln!(f, "--- Context-Sensitive Refinement ---")?;
        writeln!(f, "Refined: {}", self.cs_refined_pairs)?;
        writeln!(f, "Unrefined: {}", self.cs_unrefined_pairs)?;
        writeln!(f, "Out of budget: {}", self.cs_out_of_budget)?;
        writeln!(
            f,
            "Cache: {} hits, {} misses ({:.1}%)",
            self.cache_hits,
            self.cache_misses,
            self.cache_hit_rate()
        )?;
        writeln!(f)?;
        write!(f, "Races: {}", self.races)
    }
}
