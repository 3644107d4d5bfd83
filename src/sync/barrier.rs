// SPDX-License-Identifier: GPL-2.0
//! Barrier analysis.
//!
//! Bottom-up, each SCC is summarized by the barriers its members must wait
//! on before returning; a call to such a function is a wait site of those
//! barriers. Top-down, the code post-dominated by a wait site runs before
//! the barrier and the code it dominates runs after it. A function inherits
//! the before or after side that all its call sites share.
//!
//! Loops are not handled: the code after a wait inside a loop also runs
//! before the next wait. The answers are therefore unsound for barriers in
//! loops.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::context::AnalysisContext;
use crate::analysis::interproc::{run_interprocedural, SccSummaries, SccVisitor};
use crate::analysis::scc::Scc;
use crate::ir::ids::{FuncId, InstId, ValueId};
use crate::ir::program::Program;
use crate::ir::scev::strip_casts;
use crate::mhp::codeset::CodeSet;
use crate::sync::guard::valid_call_sites;

/// Code that must run before or after some wait on one barrier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarrierEffect {
    /// Code finished before the wait returns
    pub before: CodeSet,
    /// Code started only after the wait returned
    pub after: CodeSet,
}

impl BarrierEffect {
    /// Whether `i1` and `i2` are on opposite sides of the barrier, each on
    /// exactly one side
    pub fn separates(&self, prog: &Program, i1: InstId, i2: InstId) -> bool {
        let before1 = self.before.covers_inst(prog, i1);
        let before2 = self.before.covers_inst(prog, i2);
        if before1 == before2 {
            return false;
        }
        before1 != self.after.covers_inst(prog, i1) && before2 != self.after.covers_inst(prog, i2)
    }
}

/// Before and after effects of every barrier
#[derive(Debug, Clone, Default)]
pub struct BarrierAnalysis {
    summaries: SccSummaries<BTreeSet<ValueId>>,
    wait_sites: BTreeMap<FuncId, BTreeMap<InstId, BTreeSet<ValueId>>>,
    effects: BTreeMap<ValueId, BarrierEffect>,
}

impl BarrierAnalysis {
    /// Run both passes
    pub fn analyze(ctx: &AnalysisContext) -> Self {
        let mut ba = Self::default();
        run_interprocedural(ctx, &mut ba);
        log::debug!("barrier: {} barriers with effects", ba.effects.len());
        ba
    }

    /// Whether some barrier must separate `i1` and `i2`
    pub fn separated_by_barrier(&self, ctx: &AnalysisContext, i1: InstId, i2: InstId) -> bool {
        self.effects.values().any(|e| e.separates(&ctx.prog, i1, i2))
    }

    /// Effect of barrier pointer `barrier`
    pub fn effect(&self, barrier: ValueId) -> Option<&BarrierEffect> {
        self.effects.get(&barrier)
    }

    /// Barriers with a recorded effect
    pub fn barriers(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.effects.keys().copied()
    }

    /// Barriers every call of `f` waits on before returning
    pub fn must_wait(&self, ctx: &AnalysisContext, f: FuncId) -> Option<&BTreeSet<ValueId>> {
        self.summaries.get(&ctx.sccs.scc_of(f)?)
    }

    fn bottom_up(&mut self, ctx: &AnalysisContext, f: FuncId, waited: &mut BTreeSet<ValueId>) {
        let prog = &ctx.prog;
        let mut sites: BTreeMap<InstId, BTreeSet<ValueId>> = BTreeMap::new();
        for i in prog.func_insts(f) {
            if let Some(b) = ctx.api.barrier_ptr(prog, i) {
                sites.entry(i).or_default().insert(strip_casts(prog, b));
            }
            for callee in ctx.cg.callees_at(i) {
                let Some(inherited) = self.must_wait(ctx, callee) else {
                    continue;
                };
                if !inherited.is_empty() {
                    sites.entry(i).or_default().extend(inherited.iter().copied());
                }
            }
        }
        if let Some(ret) = ctx.passes(f).ret {
            for (site, barriers) in &sites {
                if ctx.dominates(*site, ret) {
                    waited.extend(barriers.iter().copied());
                }
            }
        }
        self.wait_sites.insert(f, sites);
    }

    fn top_down(&mut self, ctx: &AnalysisContext, f: FuncId) {
        let prog = &ctx.prog;

        // Sides shared by every call site of `f`
        let mut shared: Option<(BTreeSet<ValueId>, BTreeSet<ValueId>)> = None;
        for cs in valid_call_sites(ctx, f) {
            let mut before = BTreeSet::new();
            let mut after = BTreeSet::new();
            for (barrier, effect) in &self.effects {
                if effect.before.covers_inst(prog, cs) {
                    before.insert(*barrier);
                }
                if effect.after.covers_inst(prog, cs) {
                    after.insert(*barrier);
                }
            }
            shared = Some(match shared {
                None => (before, after),
                Some((b, a)) => (&b & &before, &a & &after),
            });
        }
        if let Some((before, after)) = shared {
            for barrier in before {
                self.effects.entry(barrier).or_default().before.insert_func(f);
            }
            for barrier in after {
                self.effects.entry(barrier).or_default().after.insert_func(f);
            }
        }

        let sites = self.wait_sites.get(&f).cloned().unwrap_or_default();
        for (site, barriers) in sites {
            for barrier in barriers {
                let effect = self.effects.entry(barrier).or_default();
                dominated_code(ctx, site, &mut effect.after);
                post_dominated_code(ctx, site, &mut effect.before);
            }
        }
    }
}

impl SccVisitor for BarrierAnalysis {
    fn visit_bottom_up(&mut self, ctx: &AnalysisContext, scc: &Scc) {
        let mut waited = self.summaries.remove(&scc.id).unwrap_or_default();
        for f in &scc.members {
            self.bottom_up(ctx, *f, &mut waited);
        }
        self.summaries.insert(scc.id, waited);
    }

    fn visit_top_down(&mut self, ctx: &AnalysisContext, scc: &Scc) {
        for f in &scc.members {
            self.top_down(ctx, *f);
        }
    }
}

/// Add the code dominated by `root`, excluding `root` unless a cycle leads
/// back to it
fn dominated_code(ctx: &AnalysisContext, root: InstId, out: &mut CodeSet) {
    let prog = &ctx.prog;
    if out.covers_inst(prog, root) {
        return;
    }
    let mut cur = prog.next_inst(root);
    while let Some(i) = cur {
        let kind = &prog.inst(i).kind;
        if kind.is_terminator() {
            break;
        }
        if kind.is_interesting() {
            out.insert_inst(i);
        }
        cur = prog.next_inst(i);
    }

    let passes = ctx.passes(prog.func_of(root));
    let root_bb = prog.block_of(root);
    let mut stack: Vec<_> = prog
        .block(root_bb)
        .succs
        .iter()
        .copied()
        .filter(|s| passes.dom.dominates(root_bb, *s))
        .collect();
    while let Some(bb) = stack.pop() {
        if out.has_block(bb) {
            continue;
        }
        out.insert_block(bb);
        stack.extend(
            prog.block(bb)
                .succs
                .iter()
                .copied()
                .filter(|s| passes.dom.dominates(root_bb, *s)),
        );
    }
}

/// Add the code post-dominated by `root`, excluding `root` unless a cycle
/// leads back to it
fn post_dominated_code(ctx: &AnalysisContext, root: InstId, out: &mut CodeSet) {
    let prog = &ctx.prog;
    if out.covers_inst(prog, root) {
        return;
    }
    let inst = prog.inst(root);
    for i in &prog.block(inst.block).insts[..inst.pos] {
        if prog.inst(*i).kind.is_interesting() {
            out.insert_inst(*i);
        }
    }

    let passes = ctx.passes(inst.func);
    let root_bb = inst.block;
    let mut stack: Vec<_> = prog
        .block(root_bb)
        .preds
        .iter()
        .copied()
        .filter(|p| passes.post_dom.dominates(root_bb, *p))
        .collect();
    while let Some(bb) = stack.pop() {
        if out.has_block(bb) {
            continue;
        }
        out.insert_block(bb);
        stack.extend(
            prog.block(bb)
                .preds
                .iter()
                .copied()
                .filter(|p| passes.post_dom.dominates(root_bb, *p)),
        );
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::core::config::DetectorConfig;
    use crate::ir::builder::ProgramBuilder;

    struct Fixture {
        ctx: AnalysisContext,
        write: InstId,
        read: InstId,
        helper_write: InstId,
        barrier: ValueId,
    }

    /// `worker` writes `g`, calls `sync` (which waits on `b`) and reads `g`.
    /// `main` writes `g` through `helper` before waiting itself.
    fn barrier_program() -> Fixture {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let b = pb.global("b", 0);
        let sync = pb.declare("sync", 0);
        let helper = pb.declare("helper", 0);
        let worker = pb.declare("worker", 1);
        let main = pb.declare("main", 0);
        {
            let mut fb = pb.body(sync);
            fb.call_named("barrier_wait", vec![b]);
            fb.ret(None);
        }
        let helper_write = {
            let mut fb = pb.body(helper);
            let one = fb.const_int(1);
            let s = fb.store(g, one);
            fb.ret(None);
            s
        };
        let (write, read) = {
            let mut fb = pb.body(worker);
            let one = fb.const_int(1);
            let write = fb.store(g, one);
            fb.call(sync, vec![]);
            let v = fb.load(g);
            let read = fb.def(v);
            fb.ret(None);
            (write, read)
        };
        {
            let mut fb = pb.body(main);
            let tid = fb.alloca(0);
            let null = fb.null();
            let routine = fb.func_addr(worker);
            fb.call_named("thread_create", vec![tid, routine, null]);
            fb.call(helper, vec![]);
            fb.call_named("barrier_wait", vec![b]);
            fb.ret(None);
        }
        let prog = pb.finish().unwrap();
        let ctx = AnalysisContext::new(prog, DetectorConfig::default()).unwrap();
        Fixture {
            ctx,
            write,
            read,
            helper_write,
            barrier: b,
        }
    }

    #[test]
    fn test_wrapper_must_wait() {
        let fx = barrier_program();
        let ba = BarrierAnalysis::analyze(&fx.ctx);
        let sync = fx.ctx.prog.func_by_name("sync").unwrap();
        assert_eq!(ba.must_wait(&fx.ctx, sync), Some(&BTreeSet::from([fx.barrier])));
    }

    #[test]
    fn test_before_and_after() {
        let fx = barrier_program();
        let ba = BarrierAnalysis::analyze(&fx.ctx);
        let effect = ba.effect(fx.barrier).unwrap();
        let prog = &fx.ctx.prog;
        assert!(effect.before.covers_inst(prog, fx.write));
        assert!(effect.after.covers_inst(prog, fx.read));
        assert!(effect.before.covers_inst(prog, fx.helper_write));

        assert!(ba.separated_by_barrier(&fx.ctx, fx.write, fx.read));
        assert!(ba.separated_by_barrier(&fx.ctx, fx.helper_write, fx.read));
        assert!(!ba.separated_by_barrier(&fx.ctx, fx.write, fx.helper_write));
    }
}
