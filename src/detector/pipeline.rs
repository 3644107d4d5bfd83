// SPDX-License-Identifier: GPL-2.0
//! The detection pipeline.
//!
//! Phases run in a fixed order: collect, partition, escape, MHP seeding,
//! lockset, barrier, the demand-driven refinements, context-sensitive
//! refinement, then settling into a report. Every phase after MHP seeding
//! only removes risky pairs.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::collector::OperationCollector;
use crate::analysis::context::AnalysisContext;
use crate::cfl::csaa::{ContextSensitiveAliasAnalysis, CsaaEnv};
use crate::core::config::DetectorConfig;
use crate::core::error::Result;
use crate::core::log::AnalysisLog;
use crate::core::stats::{AnalysisStats, Phase};
use crate::ir::ids::{AccessId, InstId, ObjId, PartId};
use crate::ir::program::Program;
use crate::mhp::MhpAnalysis;
use crate::partition::escape::ThreadEscapeAnalysis;
use crate::partition::mem_part::MemoryPartitioning;
use crate::refine::heap::HeapRefinement;
use crate::refine::join::ThreadJoinRefinement;
use crate::refine::path::PathRefinement;
use crate::report::annotation::RaceAnnotation;
use crate::report::validator::ResultValidator;
use crate::report::warning::RaceReport;
use crate::sync::barrier::BarrierAnalysis;
use crate::sync::lockset::LocksetAnalysis;

/// Output of one detection run
#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Racy partitions
    pub report: RaceReport,
    /// Check ids for a runtime checker, when annotation is on
    pub annotation: Option<RaceAnnotation>,
    /// Per-phase statistics
    pub stats: AnalysisStats,
    /// Diagnostics written during the run
    pub log: AnalysisLog,
}

impl DetectionResult {
    /// Whether no race was found
    pub fn is_race_free(&self) -> bool {
        self.report.is_empty()
    }
}

/// Whole-program static race detector
#[derive(Debug)]
pub struct RaceDetector {
    ctx: AnalysisContext,
}

impl RaceDetector {
    /// Build points-to sets, call graph and SCC order for `program`
    pub fn new(program: Program, config: DetectorConfig) -> Result<Self> {
        Ok(Self::from_context(AnalysisContext::new(program, config)?))
    }

    /// Detector over an existing context
    pub fn from_context(ctx: AnalysisContext) -> Self {
        Self { ctx }
    }

    /// Analysis inputs
    pub fn context(&self) -> &AnalysisContext {
        &self.ctx
    }

    /// Run every phase and settle the surviving pairs into a report
    pub fn run(&self) -> Result<DetectionResult> {
        let ctx = &self.ctx;
        let mut stats = AnalysisStats::new();
        let mut state = PipelineState::build(ctx, &mut stats);
        let lsa = state.apply_sync_filters(ctx, &mut stats);
        state.apply_refinements(ctx, &mut stats)?;

        let mp = &mut state.mp;
        mp.prune_non_risky();
        mp.report_budget_overruns(ctx);

        let mut report = RaceReport::collect(ctx, &state.oc, mp);
        if ctx.config.detail {
            report = report.with_details(ctx, &lsa);
        }
        stats.races = report.len();
        log::info!("{}", report);

        let annotation = ctx.config.annotate.then(|| RaceAnnotation::annotate(ctx, &report));
        if ctx.config.collect_stats {
            log::info!("{}", stats);
        }

        Ok(DetectionResult {
            report,
            annotation,
            stats,
            log: ctx.take_log(),
        })
    }

    /// Recheck instruction pairs one at a time with [`ResultValidator`]
    pub fn validate_pairs(&self, pairs: &[(InstId, InstId)]) -> Result<Vec<bool>> {
        let ctx = &self.ctx;
        for &(i1, i2) in pairs {
            ctx.prog.try_inst(i1)?;
            ctx.prog.try_inst(i2)?;
        }
        let mut stats = AnalysisStats::new();
        let mut state = PipelineState::build(ctx, &mut stats);
        state.mhp.perform_refinement(ctx);
        let lsa = LocksetAnalysis::analyze(ctx);
        let ba = BarrierAnalysis::analyze(ctx);
        let mut validator = ResultValidator::new(ctx, &state.oc, &state.mhp, &lsa, &ba, &state.tea)?;
        Ok(pairs
            .iter()
            .map(|&(i1, i2)| validator.may_have_data_race(i1, i2))
            .collect())
    }
}

/// Analyses shared by the phases of one run
struct PipelineState {
    oc: OperationCollector,
    mp: MemoryPartitioning,
    tea: ThreadEscapeAnalysis,
    mhp: MhpAnalysis,
    csaa: Option<ContextSensitiveAliasAnalysis>,
}

impl PipelineState {
    /// Collection, partitioning, escape and MHP seeding
    fn build(ctx: &AnalysisContext, stats: &mut AnalysisStats) -> Self {
        let t = stats.start_timer();
        let oc = OperationCollector::collect(ctx);
        stats.accesses = oc.len();
        stats.spawn_sites = oc.spawn_sites().len();
        stats.stop_timer(Phase::OpCollection, t);
        log::debug!("collected {} accesses", oc.len());

        let t = stats.start_timer();
        let mut mp = MemoryPartitioning::run(ctx, &oc);
        stats.partitions = mp.len();
        stats.stop_timer(Phase::MemPart, t);

        let t = stats.start_timer();
        let tea = ThreadEscapeAnalysis::analyze(ctx, &oc, &mp);
        mp.apply_escape(&tea);
        stats.stop_timer(Phase::Escape, t);
        log::debug!("{} partitions escape", mp.num_live_parts());

        let t = stats.start_timer();
        let mhp = MhpAnalysis::analyze(ctx, &oc);
        let mut csaa = ContextSensitiveAliasAnalysis::new(&ctx.config);
        let part_objs: Vec<BTreeSet<ObjId>> = mp.parts().iter().map(|p| p.objs.clone()).collect();
        {
            let env = CsaaEnv::new(ctx, &oc, &mhp);
            mp.apply_mhp(ctx, &oc, &mhp, &tea, |a, rp, p| match csaa.as_mut() {
                Some(csaa) => csaa.must_not_access_part(&env, a, rp, &part_objs[p.index()]),
                None => false,
            });
        }
        stats.stop_timer(Phase::Mhp, t);
        stats.record_pairs(Phase::Mhp, mp.num_risky_pairs());
        log::debug!("{} risky pairs after MHP", mp.num_risky_pairs());

        Self {
            oc,
            mp,
            tea,
            mhp,
            csaa,
        }
    }

    fn insts(&self, a: AccessId, b: AccessId) -> (InstId, InstId) {
        (self.oc.access(a).inst, self.oc.access(b).inst)
    }

    /// Lockset and barrier filters. The locksets are kept for the report.
    fn apply_sync_filters(&mut self, ctx: &AnalysisContext, stats: &mut AnalysisStats) -> LocksetAnalysis {
        let t = stats.start_timer();
        let lsa = LocksetAnalysis::analyze(ctx);
        let oc = &self.oc;
        let removed = self.mp.apply_pair_filter(|_, a, b| {
            lsa.protected_by_common_locks(ctx, oc.access(a).inst, oc.access(b).inst)
        });
        stats.stop_timer(Phase::Lockset, t);
        stats.record_pairs(Phase::Lockset, self.mp.num_risky_pairs());
        log::debug!("lockset removed {} pairs", removed);

        let t = stats.start_timer();
        let ba = BarrierAnalysis::analyze(ctx);
        let removed = self
            .mp
            .apply_pair_filter(|_, a, b| ba.separated_by_barrier(ctx, oc.access(a).inst, oc.access(b).inst));
        stats.stop_timer(Phase::Barrier, t);
        stats.record_pairs(Phase::Barrier, self.mp.num_risky_pairs());
        log::debug!("barrier removed {} pairs", removed);
        lsa
    }

    /// Heap, join and path refinements, then context-sensitive aliasing
    fn apply_refinements(&mut self, ctx: &AnalysisContext, stats: &mut AnalysisStats) -> Result<()> {
        let t = stats.start_timer();
        self.mhp.perform_refinement(ctx);

        let single: BTreeMap<PartId, ObjId> = self
            .mp
            .part_ids()
            .filter_map(|p| {
                let objs = &self.mp.part(p).objs;
                match (objs.len(), objs.first()) {
                    (1, Some(&o)) => Some((p, o)),
                    _ => None,
                }
            })
            .collect();
        let oc = &self.oc;
        let mut heap = HeapRefinement::new(ctx, &self.mhp, &self.tea);
        let removed = self.mp.apply_pair_filter(|p, a, b| match single.get(&p) {
            Some(&o) => heap.access_different_heap_instances(o, oc.access(a).inst, oc.access(b).inst),
            None => false,
        });
        log::debug!("heap refinement removed {} pairs", removed);

        let tjr = ThreadJoinRefinement::from_refined(ctx, &self.mhp)?;
        let removed = self
            .mp
            .apply_pair_filter(|_, a, b| tjr.branch_join_refined(oc.access(a).inst, oc.access(b).inst));
        log::debug!("join refinement removed {} pairs", removed);

        // Path refinement reads the risky partners of the guarding loads,
        // so it decides on a snapshot before any pair is removed.
        let mut path = PathRefinement::new(ctx, oc, &self.mhp);
        let mut refined: BTreeSet<(PartId, (AccessId, AccessId))> = BTreeSet::new();
        for p in self.mp.part_ids() {
            let set = self.mp.risky(p);
            if set.is_over_budget() {
                continue;
            }
            for (a, b) in set.pairs() {
                let (i1, i2) = self.insts(a, b);
                if path.path_refined(&self.mp, i1, i2) {
                    refined.insert((p, (a, b)));
                }
            }
        }
        let removed = self.mp.apply_pair_filter(|p, a, b| refined.contains(&(p, (a, b))));
        log::debug!(
            "path refinement removed {} pairs over {} condition variables",
            removed,
            path.num_cond_vars()
        );
        stats.stop_timer(Phase::FurtherRefinement, t);
        stats.record_pairs(Phase::FurtherRefinement, self.mp.num_risky_pairs());

        let t = stats.start_timer();
        if let Some(csaa) = self.csaa.as_mut() {
            let env = CsaaEnv::new(ctx, oc, &self.mhp);
            let removed = self.mp.apply_pair_filter(|_, a, b| csaa.must_not_access_aliases(&env, a, b));
            log::debug!("context-sensitive refinement removed {} pairs", removed);

            let cs = csaa.stats();
            stats.cs_refined_pairs = cs.refined;
            stats.cs_unrefined_pairs = cs.unrefined;
            stats.cs_out_of_budget = cs.out_of_budget;
            stats.cache_hits = cs.cache.hits;
            stats.cache_misses = cs.cache.misses;
            if cs.out_of_budget > 0 {
                ctx.warn(|| format!("{} alias queries ran out of budget", cs.out_of_budget));
            }
        }
        stats.stop_timer(Phase::CsRefinement, t);
        stats.record_pairs(Phase::CsRefinement, self.mp.num_risky_pairs());
        Ok(())
    }
}
