// SPDX-License-Identifier: GPL-2.0
//! Lockset analysis.
//!
//! The bottom-up pass summarizes, per SCC, the locks a call must leave
//! acquired (a lock site dominating the return with no matching release
//! on the way) and the locks it may release without having acquired them.
//! Call sites inherit these effects as if they were lock or unlock sites.
//!
//! The top-down pass starts from the entry lockset, the locks held at every
//! call site of a function, and from every lock site. Protection spreads
//! forward through code dominated by the start point, and only into blocks
//! whose guards imply the guards of the start point, so code behind an
//! unrelated early return is not treated as protected.
//!
//! In the intraprocedural mode no lock effect crosses a call; instead every
//! access of a callee called inside a critical section is protected. This
//! is unsound when a callee is called both with and without the lock.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::context::AnalysisContext;
use crate::analysis::interproc::{note_recursion, run_interprocedural, SccSummaries, SccVisitor};
use crate::analysis::scc::Scc;
use crate::ir::ids::{BlockId, FuncId, InstId, ValueId};
use crate::ir::inst::InstKind;
use crate::ir::scev::strip_casts;
use crate::sync::guard::{valid_call_sites, GuardExtractor, SimpleCmpGuard};

/// Lock pointers
pub type LockSet = BTreeSet<ValueId>;

type SiteLocks = BTreeMap<InstId, LockSet>;

#[derive(Debug, Clone, Default)]
struct LocksetSummary {
    must_acquire: LockSet,
    may_release: LockSet,
    /// Accesses of the SCC and its callees, intraprocedural mode only
    accesses: BTreeSet<InstId>,
}

/// Locks held at each access and call site
#[derive(Debug, Clone)]
pub struct LocksetAnalysis {
    intraprocedural: bool,
    summaries: SccSummaries<LocksetSummary>,
    lock_sites: BTreeMap<FuncId, SiteLocks>,
    unlock_sites: BTreeMap<FuncId, SiteLocks>,
    protecting: BTreeMap<InstId, LockSet>,
    guards: GuardExtractor<SimpleCmpGuard>,
}

impl LocksetAnalysis {
    /// Run both passes
    pub fn analyze(ctx: &AnalysisContext) -> Self {
        let mut lsa = Self {
            intraprocedural: ctx.config.intraprocedural_lockset,
            summaries: SccSummaries::new(),
            lock_sites: BTreeMap::new(),
            unlock_sites: BTreeMap::new(),
            protecting: BTreeMap::new(),
            guards: GuardExtractor::intraprocedural(),
        };
        run_interprocedural(ctx, &mut lsa);
        log::debug!(
            "lockset: {} protected instructions{}",
            lsa.protecting.len(),
            if lsa.intraprocedural { " (intraprocedural)" } else { "" }
        );
        lsa
    }

    /// Whether the intraprocedural mode was used
    pub fn is_intraprocedural(&self) -> bool {
        self.intraprocedural
    }

    /// Locks held when `i` runs; `None` when no lock is known to be held
    pub fn lockset_of(&self, i: InstId) -> Option<&LockSet> {
        self.protecting.get(&i)
    }

    /// Whether some lock held at `i1` and some lock held at `i2` must be
    /// the same lock
    pub fn protected_by_common_locks(&self, ctx: &AnalysisContext, i1: InstId, i2: InstId) -> bool {
        let (Some(l1), Some(l2)) = (self.protecting.get(&i1), self.protecting.get(&i2)) else {
            return false;
        };
        l1.iter()
            .any(|p1| l2.iter().any(|p2| ctx.pta.must_alias(*p1, *p2)))
    }

    /// Whether the two sets may share a lock
    pub fn has_common_lock(ctx: &AnalysisContext, l1: &LockSet, l2: &LockSet) -> bool {
        l1.iter().any(|p1| l2.iter().any(|p2| ctx.pta.alias(*p1, *p2)))
    }

    /// Locks `f` leaves acquired when it returns
    pub fn must_acquire(&self, ctx: &AnalysisContext, f: FuncId) -> Option<&LockSet> {
        let scc = ctx.sccs.scc_of(f)?;
        self.summaries.get(&scc).map(|s| &s.must_acquire)
    }

    /// Locks `f` may release without acquiring them
    pub fn may_release(&self, ctx: &AnalysisContext, f: FuncId) -> Option<&LockSet> {
        let scc = ctx.sccs.scc_of(f)?;
        self.summaries.get(&scc).map(|s| &s.may_release)
    }

    /// Number of instructions with a known lockset
    pub fn num_protected(&self) -> usize {
        self.protecting.len()
    }

    fn summary_of(&self, ctx: &AnalysisContext, f: FuncId) -> Option<&LocksetSummary> {
        self.summaries.get(&ctx.sccs.scc_of(f)?)
    }

    fn protect(&mut self, i: InstId, locks: &LockSet) {
        self.protecting.entry(i).or_default().extend(locks.iter().copied());
    }

    /// Direct and inherited lock and unlock sites of `f`
    fn identify_sites(&mut self, ctx: &AnalysisContext, f: FuncId) {
        let prog = &ctx.prog;
        let mut locks = SiteLocks::new();
        let mut unlocks = SiteLocks::new();
        for i in prog.func_insts(f) {
            if let Some(p) = ctx.api.lock_ptr(prog, i) {
                let p = strip_casts(prog, p);
                if ctx.api.is_lock(prog, i) {
                    locks.entry(i).or_default().insert(p);
                } else {
                    unlocks.entry(i).or_default().insert(p);
                }
            }
            for callee in ctx.cg.callees_at(i) {
                let Some(summary) = self.summary_of(ctx, callee) else {
                    continue;
                };
                if !summary.must_acquire.is_empty() {
                    locks.entry(i).or_default().extend(summary.must_acquire.iter().copied());
                }
                if !summary.may_release.is_empty() {
                    unlocks.entry(i).or_default().extend(summary.may_release.iter().copied());
                }
            }
        }
        self.lock_sites.insert(f, locks);
        self.unlock_sites.insert(f, unlocks);
    }

    /// Unlock sites of `f` that may release a lock of `locks`
    fn matching_unlocks(&self, ctx: &AnalysisContext, f: FuncId, locks: &LockSet) -> BTreeSet<InstId> {
        self.unlock_sites
            .get(&f)
            .into_iter()
            .flatten()
            .filter(|(_, unlocked)| Self::has_common_lock(ctx, locks, unlocked))
            .map(|(site, _)| *site)
            .collect()
    }

    /// Whether the locks taken at `lock_site` are still held at `ret`
    fn keeps_acquired(&self, ctx: &AnalysisContext, f: FuncId, lock_site: InstId, locks: &LockSet, ret: InstId) -> bool {
        let unlocks = self.matching_unlocks(ctx, f, locks);
        if unlocks.is_empty() {
            return true;
        }
        let prog = &ctx.prog;
        let (lock, exit) = (prog.inst(lock_site), prog.inst(ret));
        // Unlock in block `b` at a position in `lo..hi`
        let unlock_between = |b: BlockId, lo: usize, hi: usize| {
            unlocks.iter().any(|u| {
                let ui = prog.inst(*u);
                ui.block == b && (lo..hi).contains(&ui.pos)
            })
        };
        if lock.block == exit.block {
            return !unlock_between(lock.block, lock.pos + 1, exit.pos);
        }
        if unlock_between(exit.block, 0, exit.pos) || unlock_between(lock.block, lock.pos + 1, usize::MAX) {
            return false;
        }
        let unlock_blocks: BTreeSet<BlockId> = unlocks.iter().map(|u| prog.block_of(*u)).collect();
        let mut seen = BTreeSet::from([exit.block]);
        let mut stack: Vec<BlockId> = prog.block(exit.block).preds.clone();
        while let Some(b) = stack.pop() {
            if b == lock.block || !seen.insert(b) {
                continue;
            }
            if unlock_blocks.contains(&b) {
                return false;
            }
            stack.extend(prog.block(b).preds.iter().copied());
        }
        true
    }

    fn bottom_up(&mut self, ctx: &AnalysisContext, f: FuncId, summary: &mut LocksetSummary) {
        if self.intraprocedural {
            let prog = &ctx.prog;
            for i in prog.func_insts(f) {
                if is_memory_access(ctx, i) {
                    summary.accesses.insert(i);
                }
                for callee in ctx.cg.callees_at(i) {
                    if let Some(s) = self.summary_of(ctx, callee) {
                        summary.accesses.extend(s.accesses.iter().copied());
                    }
                }
            }
            return;
        }

        self.identify_sites(ctx, f);
        let Some(ret) = ctx.passes(f).ret else {
            return;
        };
        let empty = SiteLocks::new();
        let locks = self.lock_sites.get(&f).unwrap_or(&empty);
        let unlocks = self.unlock_sites.get(&f).unwrap_or(&empty);
        for (site, held) in locks {
            if ctx.dominates(*site, ret) && self.keeps_acquired(ctx, f, *site, held, ret) {
                summary.must_acquire.extend(held.iter().copied());
            }
        }
        for (site, released) in unlocks {
            let acquired_here = locks
                .iter()
                .any(|(l, held)| ctx.dominates(*l, *site) && Self::has_common_lock(ctx, held, released));
            if !acquired_here {
                summary.may_release.extend(released.iter().copied());
            }
        }
    }

    /// Locks held at every valid call site of `f`
    fn entry_lockset(&self, ctx: &AnalysisContext, f: FuncId) -> LockSet {
        let mut entry: Option<LockSet> = None;
        for cs in valid_call_sites(ctx, f) {
            let Some(held) = self.protecting.get(&cs) else {
                return LockSet::new();
            };
            entry = Some(match entry {
                None => held.clone(),
                Some(acc) => acc.intersection(held).copied().collect(),
            });
        }
        entry.unwrap_or_default()
    }

    fn top_down(&mut self, ctx: &AnalysisContext, f: FuncId) {
        if self.intraprocedural {
            self.protect_within_function(ctx, f);
            return;
        }
        let prog = &ctx.prog;
        let entry = self.entry_lockset(ctx, f);
        if !entry.is_empty() {
            let first = prog.func(f).entry().and_then(|b| first_non_phi(ctx, b));
            if let Some(first) = first {
                self.identify_protected(ctx, f, first, &entry);
            }
        }
        let sites: Vec<(InstId, LockSet)> = self
            .lock_sites
            .get(&f)
            .map(|m| m.iter().map(|(i, l)| (*i, l.clone())).collect())
            .unwrap_or_default();
        for (site, locks) in sites {
            if let Some(next) = prog.next_inst(site) {
                self.identify_protected(ctx, f, next, &locks);
            }
        }
    }

    /// Spread `locks` from `root` to the instructions whose guards imply
    /// the guards of `root`
    fn identify_protected(&mut self, ctx: &AnalysisContext, f: FuncId, root: InstId, locks: &LockSet) {
        let prog = &ctx.prog;
        let unlocks = self.matching_unlocks(ctx, f, locks);
        let root_block = prog.block_of(root);
        let mut visited = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(i) = stack.pop() {
            if visited.contains(&i) {
                continue;
            }
            let bb = prog.block_of(i);
            if self.guards.subsumes(ctx, bb, root_block) {
                let frontiers = self.protecting_from(ctx, i, locks, &unlocks, &mut visited);
                stack.extend(frontiers);
            } else {
                visited.insert(i);
                for succ in &prog.block(bb).succs {
                    if let Some(first) = first_non_phi(ctx, *succ) {
                        if !visited.contains(&first) {
                            stack.push(first);
                        }
                    }
                }
            }
        }
    }

    /// Protect the code dominated by `root` up to a matching unlock and
    /// return the first instructions of the blocks where dominance ends
    fn protecting_from(
        &mut self,
        ctx: &AnalysisContext,
        root: InstId,
        locks: &LockSet,
        unlocks: &BTreeSet<InstId>,
        visited: &mut BTreeSet<InstId>,
    ) -> BTreeSet<InstId> {
        let prog = &ctx.prog;
        let passes = ctx.passes(prog.func_of(root));
        let root_block = prog.block_of(root);
        let mut frontiers = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(i) = stack.pop() {
            if !visited.insert(i) {
                continue;
            }
            let inst = prog.inst(i);
            if matches!(inst.kind, InstKind::Load { .. } | InstKind::Store { .. }) {
                self.protect(i, locks);
            }
            if prog.is_call(i) {
                if unlocks.contains(&i) {
                    continue;
                }
                self.protect(i, locks);
            }
            if !inst.kind.is_terminator() {
                if let Some(next) = prog.next_inst(i) {
                    stack.push(next);
                }
                continue;
            }
            for succ in &prog.block(inst.block).succs {
                let Some(first) = first_non_phi(ctx, *succ) else {
                    continue;
                };
                let dominated = root_block != *succ && passes.dom.dominates(root_block, *succ);
                if !dominated {
                    frontiers.insert(first);
                } else if !visited.contains(&first) {
                    stack.push(first);
                }
            }
        }
        frontiers
    }

    /// Intraprocedural mode: protect everything dominated by a lock site
    /// up to an aliasing unlock, callee accesses included
    fn protect_within_function(&mut self, ctx: &AnalysisContext, f: FuncId) {
        let prog = &ctx.prog;
        let lock_sites: Vec<InstId> = prog.func_insts(f).filter(|i| ctx.api.is_lock(prog, *i)).collect();
        if lock_sites.is_empty() {
            return;
        }
        let passes = ctx.passes(f);
        for site in lock_sites {
            let Some(acquired) = ctx.api.lock_ptr(prog, site) else {
                continue;
            };
            let acquired = strip_casts(prog, acquired);
            let locks = LockSet::from([acquired]);
            let site_block = prog.block_of(site);
            let mut visited = BTreeSet::new();
            let mut stack = vec![site];
            while let Some(i) = stack.pop() {
                if !visited.insert(i) {
                    continue;
                }
                if is_memory_access(ctx, i) {
                    self.protect(i, &locks);
                }
                let callee_accesses: Vec<InstId> = ctx
                    .cg
                    .callees_at(i)
                    .filter_map(|c| self.summary_of(ctx, c))
                    .flat_map(|s| s.accesses.iter().copied())
                    .collect();
                for a in callee_accesses {
                    self.protect(a, &locks);
                }
                if ctx.api.is_unlock(prog, i) {
                    let released = ctx.api.lock_ptr(prog, i).map(|p| strip_casts(prog, p));
                    if released.is_some_and(|p| ctx.pta.alias(acquired, p)) {
                        continue;
                    }
                }
                let inst = prog.inst(i);
                if !inst.kind.is_terminator() {
                    if let Some(next) = prog.next_inst(i) {
                        stack.push(next);
                    }
                    continue;
                }
                for succ in &prog.block(inst.block).succs {
                    if *succ == site_block || !passes.dom.dominates(site_block, *succ) {
                        continue;
                    }
                    if let Some(first) = first_non_phi(ctx, *succ) {
                        if !visited.contains(&first) {
                            stack.push(first);
                        }
                    }
                }
            }
        }
    }
}

impl SccVisitor for LocksetAnalysis {
    fn visit_bottom_up(&mut self, ctx: &AnalysisContext, scc: &Scc) {
        note_recursion(ctx, scc, "lockset");
        let mut summary = self.summaries.remove(&scc.id).unwrap_or_default();
        for f in &scc.members {
            self.bottom_up(ctx, *f, &mut summary);
        }
        self.summaries.insert(scc.id, summary);
    }

    fn visit_top_down(&mut self, ctx: &AnalysisContext, scc: &Scc) {
        for f in &scc.members {
            self.top_down(ctx, *f);
        }
    }
}

/// Loads, stores and memory intrinsics
fn is_memory_access(ctx: &AnalysisContext, i: InstId) -> bool {
    matches!(ctx.prog.inst(i).kind, InstKind::Load { .. } | InstKind::Store { .. })
        || ctx.api.is_mem_intrinsic(&ctx.prog, i)
}

/// First instruction of `b` that is not a phi
fn first_non_phi(ctx: &AnalysisContext, b: BlockId) -> Option<InstId> {
    ctx.prog
        .block(b)
        .insts
        .iter()
        .copied()
        .find(|i| !matches!(ctx.prog.inst(*i).kind, InstKind::Phi { .. }))
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::core::config::DetectorConfig;
    use crate::ir::builder::ProgramBuilder;
    use crate::ir::inst::Predicate;

    fn context(pb: ProgramBuilder, intraprocedural: bool) -> AnalysisContext {
        let prog = pb.finish().unwrap();
        let config = DetectorConfig::default().with_intraprocedural_lockset(intraprocedural);
        AnalysisContext::new(prog, config).unwrap()
    }

    #[test]
    fn test_critical_section() {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let m = pb.global("m", 0);
        let main = pb.declare("main", 0);
        let (inside, outside) = {
            let mut fb = pb.body(main);
            let zero = fb.const_int(0);
            fb.call_named("mutex_lock", vec![m]);
            let inside = fb.store(g, zero);
            fb.call_named("mutex_unlock", vec![m]);
            let outside = fb.store(g, zero);
            fb.ret(None);
            (inside, outside)
        };
        let ctx = context(pb, false);
        let lsa = LocksetAnalysis::analyze(&ctx);

        assert_eq!(lsa.lockset_of(inside), Some(&LockSet::from([m])));
        assert!(lsa.lockset_of(outside).is_none());
        assert!(lsa.protected_by_common_locks(&ctx, inside, inside));
        assert!(!lsa.protected_by_common_locks(&ctx, inside, outside));
    }

    #[test]
    fn test_lock_wrapper_summary() {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let m = pb.global("m", 0);
        let acquire = pb.declare("acquire", 0);
        let release = pb.declare("release", 0);
        let main = pb.declare("main", 0);
        {
            let mut fb = pb.body(acquire);
            fb.call_named("mutex_lock", vec![m]);
            fb.ret(None);
        }
        {
            let mut fb = pb.body(release);
            fb.call_named("mutex_unlock", vec![m]);
            fb.ret(None);
        }
        let (inside, after) = {
            let mut fb = pb.body(main);
            let zero = fb.const_int(0);
            fb.call(acquire, vec![]);
            let inside = fb.store(g, zero);
            fb.call(release, vec![]);
            let after = fb.store(g, zero);
            fb.ret(None);
            (inside, after)
        };
        let ctx = context(pb, false);
        let lsa = LocksetAnalysis::analyze(&ctx);

        assert_eq!(lsa.must_acquire(&ctx, acquire), Some(&LockSet::from([m])));
        assert_eq!(lsa.may_release(&ctx, release), Some(&LockSet::from([m])));
        assert!(lsa.must_acquire(&ctx, release).is_some_and(|l| l.is_empty()));
        assert!(lsa.lockset_of(inside).is_some());
        assert!(lsa.lockset_of(after).is_none());
    }

    /// `main` calls `update` under `m`, and once more without it when
    /// `unlocked_call` is set
    fn caller_program(unlocked_call: bool) -> (AnalysisContext, InstId, ValueId) {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let m = pb.global("m", 0);
        let update = pb.declare("update", 0);
        let main = pb.declare("main", 0);
        let store = {
            let mut fb = pb.body(update);
            let one = fb.const_int(1);
            let s = fb.store(g, one);
            fb.ret(None);
            s
        };
        {
            let mut fb = pb.body(main);
            fb.call_named("mutex_lock", vec![m]);
            fb.call(update, vec![]);
            fb.call_named("mutex_unlock", vec![m]);
            if unlocked_call {
                fb.call(update, vec![]);
            }
            fb.ret(None);
        }
        (context(pb, false), store, m)
    }

    #[test]
    fn test_entry_lockset_from_callers() {
        let (ctx, store, m) = caller_program(false);
        let lsa = LocksetAnalysis::analyze(&ctx);
        assert_eq!(lsa.lockset_of(store), Some(&LockSet::from([m])));

        let (ctx, store, _) = caller_program(true);
        let lsa = LocksetAnalysis::analyze(&ctx);
        assert!(lsa.lockset_of(store).is_none());
    }

    #[test]
    fn test_early_return_is_not_protected() {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let x = pb.global("x", 0);
        let m = pb.global("m", 0);
        let main = pb.declare("main", 0);
        let (guarded, tail) = {
            let mut fb = pb.body(main);
            let body_bb = fb.new_block();
            let tail_bb = fb.new_block();
            let exit_bb = fb.new_block();
            let zero = fb.const_int(0);
            let v = fb.load(x);
            let c = fb.cmp(Predicate::Eq, v, zero);
            fb.cond_br(c, body_bb, tail_bb);

            fb.position_at(body_bb);
            fb.call_named("mutex_lock", vec![m]);
            let guarded = fb.store(g, zero);
            fb.br(exit_bb);

            fb.position_at(tail_bb);
            let tail = fb.store(g, zero);
            fb.br(exit_bb);

            fb.position_at(exit_bb);
            fb.call_named("mutex_unlock", vec![m]);
            fb.ret(None);
            (guarded, tail)
        };
        let ctx = context(pb, false);
        let lsa = LocksetAnalysis::analyze(&ctx);
        assert!(lsa.lockset_of(guarded).is_some());
        assert!(lsa.lockset_of(tail).is_none());
    }

    #[test]
    fn test_intraprocedural_mode_covers_callees() {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let m = pb.global("m", 0);
        let update = pb.declare("update", 0);
        let main = pb.declare("main", 0);
        let store = {
            let mut fb = pb.body(update);
            let one = fb.const_int(1);
            let s = fb.store(g, one);
            fb.ret(None);
            s
        };
        {
            let mut fb = pb.body(main);
            fb.call_named("mutex_lock", vec![m]);
            fb.call(update, vec![]);
            fb.call_named("mutex_unlock", vec![m]);
            fb.ret(None);
        }
        let ctx = context(pb, true);
        let lsa = LocksetAnalysis::analyze(&ctx);
        assert!(lsa.is_intraprocedural());
        assert_eq!(lsa.lockset_of(store), Some(&LockSet::from([m])));
    }
}
