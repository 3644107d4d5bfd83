// SPDX-License-Identifier: GPL-2.0
//! End-to-end recheck of a single pair of instructions.
//!
//! The pipeline filters whole partitions at a time. The validator asks the
//! same questions about one instruction pair, in the order the pipeline
//! applies its filters, on a partitioning of its own.

use std::collections::BTreeMap;

use crate::analysis::collector::OperationCollector;
use crate::analysis::context::AnalysisContext;
use crate::cfl::csaa::{ContextSensitiveAliasAnalysis, CsaaEnv};
use crate::core::error::Result;
use crate::ir::ids::{AccessId, InstId, PartId};
use crate::mhp::MhpAnalysis;
use crate::partition::escape::ThreadEscapeAnalysis;
use crate::partition::mem_part::MemoryPartitioning;
use crate::refine::heap::HeapRefinement;
use crate::refine::join::ThreadJoinRefinement;
use crate::refine::path::PathRefinement;
use crate::sync::barrier::BarrierAnalysis;
use crate::sync::lockset::LocksetAnalysis;

/// Rechecks instruction pairs against every filter
pub struct ResultValidator<'a> {
    ctx: &'a AnalysisContext,
    oc: &'a OperationCollector,
    mhp: &'a MhpAnalysis,
    lsa: &'a LocksetAnalysis,
    ba: &'a BarrierAnalysis,
    tea: &'a ThreadEscapeAnalysis,
    mp: MemoryPartitioning,
    join: ThreadJoinRefinement<'a>,
    path: PathRefinement<'a>,
    heap: HeapRefinement<'a>,
    csaa: Option<ContextSensitiveAliasAnalysis>,
    inst_accesses: BTreeMap<InstId, Vec<(AccessId, PartId)>>,
}

impl<'a> ResultValidator<'a> {
    /// Set up the filters. `mhp` must already hold its refined
    /// reachability.
    pub fn new(
        ctx: &'a AnalysisContext,
        oc: &'a OperationCollector,
        mhp: &'a MhpAnalysis,
        lsa: &'a LocksetAnalysis,
        ba: &'a BarrierAnalysis,
        tea: &'a ThreadEscapeAnalysis,
    ) -> Result<Self> {
        let join = ThreadJoinRefinement::from_refined(ctx, mhp)?;

        let mut mp = MemoryPartitioning::run(ctx, oc);
        let mut inst_accesses: BTreeMap<InstId, Vec<(AccessId, PartId)>> = BTreeMap::new();
        for p in mp.part_ids() {
            for a in mp.part(p).live_accesses() {
                inst_accesses.entry(oc.access(a).inst).or_default().push((a, p));
            }
        }
        // Seed risky pairs so that path refinement sees the same partners
        // the pipeline does.
        mp.apply_escape(tea);
        mp.apply_mhp(ctx, oc, mhp, tea, |_, _, _| false);

        Ok(Self {
            ctx,
            oc,
            mhp,
            lsa,
            ba,
            tea,
            mp,
            join,
            path: PathRefinement::new(ctx, oc, mhp),
            heap: HeapRefinement::new(ctx, mhp, tea),
            csaa: ContextSensitiveAliasAnalysis::new(&ctx.config),
            inst_accesses,
        })
    }

    /// Whether `i1` and `i2` may still race after every filter
    pub fn may_have_data_race(&mut self, i1: InstId, i2: InstId) -> bool {
        let ctx = self.ctx;
        let spawns = self.mhp.may_happen_in_parallel(ctx, i1, i2);
        if spawns.is_empty() {
            return false;
        }
        if self.join.branch_join_refined(i1, i2)
            || self.path.path_refined(&self.mp, i1, i2)
            || self.ba.separated_by_barrier(ctx, i1, i2)
        {
            return false;
        }
        if self.lsa.protected_by_common_locks(ctx, i1, i2) {
            return false;
        }

        let (Some(accs1), Some(accs2)) = (self.inst_accesses.get(&i1), self.inst_accesses.get(&i2)) else {
            return false;
        };
        let env = CsaaEnv::new(ctx, self.oc, self.mhp);
        for &(a1, p1) in accs1 {
            for &(a2, p2) in accs2 {
                if !self.mp.is_write(a1) && !self.mp.is_write(a2) {
                    continue;
                }
                if p1 != p2 {
                    continue;
                }
                if !spawns.iter().any(|s| self.tea.may_escape_to(p1, *s)) {
                    continue;
                }
                let objs = &self.mp.part(p1).objs;
                if let (1, Some(&obj)) = (objs.len(), objs.first()) {
                    if self.heap.access_different_heap_instances(obj, i1, i2) {
                        continue;
                    }
                }
                if let Some(csaa) = self.csaa.as_mut() {
                    if csaa.must_not_access_aliases(&env, a1, a2) {
                        continue;
                    }
                }
                log::trace!("{} and {} may race on partition {}", i1, i2, p1);
                return true;
            }
        }
        false
    }

    /// The validator's own partitioning
    pub fn partitioning(&self) -> &MemoryPartitioning {
        &self.mp
    }
}
