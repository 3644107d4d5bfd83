// SPDX-License-Identifier: GPL-2.0
//! Spawn/join matching.
//!
//! A join blocks the reachability of a spawn site only when it provably
//! joins every thread that site created. Outside loops that means the two
//! sites operate on aliasing thread ids. For a spawn inside a loop, the join
//! must sit in a loop running the same number of iterations and walk the
//! thread id array with the same start and step; the exit of that join loop
//! is then the blocker. Anything the symbolic oracle cannot decide leaves the
//! join unmatched.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::context::AnalysisContext;
use crate::ir::ids::{BlockId, FuncId, InstId, ValueId};
use crate::ir::inst::InstKind;
use crate::ir::loops::{LoopId, LoopInfo};
use crate::ir::program::Program;
use crate::ir::scev::{strip_casts, AddRec, BoundCond, TripCount};
use crate::mhp::codeset::CodeSet;
use crate::mhp::reachability::reachable_instructions;

/// Facts about one spawn or join site
#[derive(Debug, Clone)]
pub struct SpawnJoinSiteInfo {
    /// The call
    pub site: InstId,
    /// Spawn rather than join
    pub is_spawn: bool,
    /// Spawn site this join was matched to
    pub matching_spawn: Option<InstId>,
    /// Thread id pointer
    pub tid_ptr: Option<ValueId>,
    /// Innermost loop around the site
    pub loop_id: Option<LoopId>,
    /// Exiting block of the loop exit that counts iterations
    pub exiting: Option<BlockId>,
    /// Exit block of that loop exit
    pub exit: Option<BlockId>,
    /// Recurrence of the thread id offset
    pub offset: Option<AddRec>,
    /// Continue condition of the loop
    pub bound: Option<BoundCond>,
}

impl SpawnJoinSiteInfo {
    /// Gather loop facts for `site`
    pub fn compute(ctx: &AnalysisContext, site: InstId, is_spawn: bool) -> Self {
        let mut info = Self {
            site,
            is_spawn,
            matching_spawn: None,
            tid_ptr: None,
            loop_id: None,
            exiting: None,
            exit: None,
            offset: None,
            bound: None,
        };
        info.tid_ptr = tid_pointer(ctx, site, is_spawn);
        let Some(tid_ptr) = info.tid_ptr else {
            // A join on a thread id passed in from a wrapper.
            return info;
        };

        let prog = &ctx.prog;
        let f = prog.func_of(site);
        let passes = ctx.passes(f);
        let loops = &passes.loops;
        info.offset = tid_offset(ctx, loops, tid_ptr);
        if info.offset.is_none() {
            return info;
        }

        info.loop_id = loops.loop_of(prog.block_of(site));
        let Some(l) = info.loop_id else {
            return info;
        };
        let Some((exiting, exit)) = counting_exit(ctx, loops, l, site, is_spawn) else {
            return info;
        };
        if !passes.dom.dominates(exiting, exit) {
            return info;
        }
        info.exiting = Some(exiting);
        info.exit = Some(exit);
        info.bound = ctx.oracle().bound_cond(prog, loops, l, exiting);
        info
    }

    /// Whether both sites run loops with equal bounds and walk their thread
    /// ids with the same start and step
    pub fn matches(&self, ctx: &AnalysisContext, other: &SpawnJoinSiteInfo) -> bool {
        let (prog, oracle) = (&ctx.prog, ctx.oracle());
        let (Some(b1), Some(b2)) = (&self.bound, &other.bound) else {
            return false;
        };
        if !oracle.same_bound_cond(prog, b1, b2) {
            return false;
        }
        match (&self.offset, &other.offset) {
            (Some(o1), Some(o2)) => oracle.same_start_and_step(prog, o1, o2),
            _ => false,
        }
    }
}

fn tid_pointer(ctx: &AnalysisContext, site: InstId, is_spawn: bool) -> Option<ValueId> {
    let prog = &ctx.prog;
    let tid = ctx.api.thread_id(prog, site)?;
    if is_spawn {
        return Some(tid);
    }
    let def = prog.def_inst(strip_casts(prog, tid))?;
    match prog.inst(def).kind {
        InstKind::Load { ptr } => Some(ptr),
        _ => None,
    }
}

/// Recurrence of the variable index a thread id pointer is projected with
fn tid_offset(ctx: &AnalysisContext, loops: &LoopInfo, ptr: ValueId) -> Option<AddRec> {
    let prog = &ctx.prog;
    let mut v = strip_casts(prog, ptr);
    while let Some(def) = prog.def_inst(v) {
        match prog.inst(def).kind {
            InstKind::Gep {
                index: Some(index), ..
            } => return ctx.oracle().add_rec(prog, loops, index),
            InstKind::Gep { base, .. } | InstKind::Cast { src: base } => v = base,
            _ => break,
        }
    }
    None
}

/// The loop exit whose trip count equals the number of times the site runs.
/// A spawn loop may also leave through the failure branch of the spawn.
fn counting_exit(
    ctx: &AnalysisContext,
    loops: &LoopInfo,
    l: LoopId,
    site: InstId,
    is_spawn: bool,
) -> Option<(BlockId, BlockId)> {
    let prog = &ctx.prog;
    let edges = loops.get(l).exit_edges(prog);
    if is_spawn {
        if let [only] = edges.as_slice() {
            return Some(*only);
        }
        let failure = spawn_failure_branch(prog, site);
        edges.into_iter().find(|(_, exit)| Some(*exit) != failure)
    } else if runs_every_iteration(ctx, loops, l, prog.block_of(site)) {
        edges.first().copied()
    } else {
        None
    }
}

/// Whether `b` dominates the single latch of loop `l`
fn runs_every_iteration(ctx: &AnalysisContext, loops: &LoopInfo, l: LoopId, b: BlockId) -> bool {
    let Some(latch) = loops.get(l).unique_latch() else {
        return false;
    };
    ctx.passes(ctx.prog.block(b).func).dom.dominates(b, latch)
}

/// Successor taken when the spawn at `spawn` reports failure, recognized from
/// `spawn(...) cmp 0` feeding the terminator of the spawn's block
pub fn spawn_failure_branch(prog: &Program, spawn: InstId) -> Option<BlockId> {
    let result = prog.result(spawn)?;
    let term = prog.block(prog.block_of(spawn)).terminator()?;
    let InstKind::CondBr {
        cond,
        then_bb,
        else_bb,
    } = prog.inst(term).kind
    else {
        return None;
    };
    let cmp = prog.def_inst(cond)?;
    let InstKind::Cmp { pred, lhs, rhs } = prog.inst(cmp).kind else {
        return None;
    };
    let (lhs, rhs) = (strip_casts(prog, lhs), strip_casts(prog, rhs));
    let other = if lhs == result {
        rhs
    } else if rhs == result {
        lhs
    } else {
        return None;
    };
    if matches!(prog.const_value(other), Some(c) if c != 0) {
        return None;
    }
    // Success compares equal to zero, so a predicate that is false on
    // equality is true on failure.
    let true_on_failure = !pred.eval(0, 0);
    Some(if true_on_failure { then_bb } else { else_bb })
}

/// A join site or a join loop exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Blocker {
    /// Code after this join instruction
    Inst(InstId),
    /// Code dominated by this block
    Block(BlockId),
}

/// Code of one function that a matched join cuts off
#[derive(Debug, Clone, Default)]
pub struct BlockingCodeInfo {
    blocked: CodeSet,
    blocking_blocks: BTreeSet<BlockId>,
}

static EMPTY_BLOCKING: BlockingCodeInfo = BlockingCodeInfo {
    blocked: CodeSet::new(),
    blocking_blocks: BTreeSet::new(),
};

impl BlockingCodeInfo {
    /// Info blocking nothing
    pub fn empty() -> &'static BlockingCodeInfo {
        &EMPTY_BLOCKING
    }

    /// Compute the code dominated by `blockers`
    pub fn new(ctx: &AnalysisContext, f: FuncId, blockers: &[Blocker]) -> Self {
        let prog = &ctx.prog;
        let dom = &ctx.passes(f).dom;
        let mut info = Self::default();
        for blocker in blockers {
            match *blocker {
                Blocker::Inst(i) => {
                    let bb = prog.block_of(i);
                    for d in dom.descendants(bb) {
                        if d != bb {
                            info.blocked.insert_block(d);
                        }
                    }
                    reachable_instructions(prog, prog.next_inst(i), Self::empty(), &mut info.blocked);
                    info.blocking_blocks.insert(bb);
                }
                Blocker::Block(bb) => {
                    for d in dom.descendants(bb) {
                        info.blocked.insert_block(d);
                    }
                }
            }
        }
        info
    }

    /// Whether `b` holds a join instruction
    pub fn is_blocking_block(&self, b: BlockId) -> bool {
        self.blocking_blocks.contains(&b)
    }

    /// Whether instruction `i` is cut off
    pub fn is_inst_blocked(&self, prog: &Program, i: InstId) -> bool {
        self.blocked.covers_inst(prog, i)
    }

    /// Whether block `b` is cut off
    pub fn is_block_blocked(&self, prog: &Program, b: BlockId) -> bool {
        self.blocked.covers_block(prog, b)
    }

    /// Whether nothing is cut off
    pub fn is_empty(&self) -> bool {
        self.blocked.is_empty()
    }
}

/// Joins matched to one spawn site, and the code they cut off
#[derive(Debug, Clone)]
pub struct ThreadJoinAnalysis {
    spawn: InstId,
    blockers: BTreeMap<FuncId, Vec<Blocker>>,
    blocking: BTreeMap<FuncId, BlockingCodeInfo>,
}

impl ThreadJoinAnalysis {
    /// Match `spawn` against every join site. Matched joins record the
    /// spawn in their info.
    pub fn run(
        ctx: &AnalysisContext,
        spawn: &SpawnJoinSiteInfo,
        joins: &mut BTreeMap<InstId, SpawnJoinSiteInfo>,
    ) -> Self {
        let prog = &ctx.prog;
        let spawner = prog.func_of(spawn.site);
        let mut tja = Self {
            spawn: spawn.site,
            blockers: BTreeMap::new(),
            blocking: BTreeMap::new(),
        };
        let Some(tid_ptr) = spawn.tid_ptr else {
            return tja;
        };

        for join in joins.values_mut() {
            let Some(join_tid) = join.tid_ptr else {
                continue;
            };
            if !ctx.pta.alias(tid_ptr, join_tid) {
                continue;
            }
            let join_fn = prog.func_of(join.site);
            let blocker = if join_fn == spawner {
                if spawn.loop_id == join.loop_id {
                    Some(Blocker::Inst(join.site))
                } else {
                    tja.loop_join_exit(ctx, spawn, join).map(Blocker::Block)
                }
            } else if ctx.is_singleton(tid_ptr) {
                Some(Blocker::Inst(join.site))
            } else if spawn.matches(ctx, join) {
                join.exit.map(Blocker::Block)
            } else {
                None
            };
            if let Some(b) = blocker {
                tja.blockers.entry(join_fn).or_default().push(b);
                join.matching_spawn = Some(spawn.site);
            }
        }

        for (f, blockers) in &tja.blockers {
            tja.blocking.insert(*f, BlockingCodeInfo::new(ctx, *f, blockers));
        }
        tja
    }

    /// Exit of the join loop when it joins every thread the spawn loop made
    fn loop_join_exit(
        &self,
        ctx: &AnalysisContext,
        spawn: &SpawnJoinSiteInfo,
        join: &SpawnJoinSiteInfo,
    ) -> Option<BlockId> {
        let (prog, oracle) = (&ctx.prog, ctx.oracle());
        let passes = ctx.passes(prog.func_of(self.spawn));
        let loops = &passes.loops;
        let (spawn_loop, join_loop) = (spawn.loop_id?, join.loop_id?);

        let spawn_count = trip_count(ctx, loops, spawn_loop, spawn.exiting?)?;
        let join_count = trip_count(ctx, loops, join_loop, join.exiting?)?;
        if !oracle.same_trip_count(prog, &spawn_count, &join_count) {
            return None;
        }
        if !oracle.same_start_and_step(prog, spawn.offset.as_ref()?, join.offset.as_ref()?) {
            return None;
        }

        let (exiting, exit) = match loops.get(join_loop).exit_edges(prog).as_slice() {
            [only] => *only,
            _ => return None,
        };
        passes.dom.dominates(exiting, exit).then_some(exit)
    }

    /// Spawn site analyzed
    pub fn spawn(&self) -> InstId {
        self.spawn
    }

    /// Matched join sites and join loop exits in `f`
    pub fn blockers(&self, f: FuncId) -> &[Blocker] {
        self.blockers.get(&f).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Code of `f` cut off by matched joins
    pub fn blocking_info(&self, f: FuncId) -> &BlockingCodeInfo {
        self.blocking.get(&f).unwrap_or(BlockingCodeInfo::empty())
    }

    /// Whether any matched join cuts off `i`
    pub fn is_inst_blocked(&self, prog: &Program, i: InstId) -> bool {
        self.blocking.values().any(|b| b.is_inst_blocked(prog, i))
    }

    /// Whether any join was matched
    pub fn has_joins(&self) -> bool {
        !self.blockers.is_empty()
    }
}

fn trip_count(ctx: &AnalysisContext, loops: &LoopInfo, l: LoopId, exiting: BlockId) -> Option<TripCount> {
    ctx.oracle().trip_count(&ctx.prog, loops, l, exiting)
}
