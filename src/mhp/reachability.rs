// SPDX-License-Identifier: GPL-2.0
//! Forward reachability under join blocking.
//!
//! Trunk reachability starts right after a spawn site (or after the call
//! sites through which a spawn takes effect) and follows the CFG and the call
//! graph. Branch reachability is the code run by the spawned routine. In both
//! directions code dominated by a matched join is not entered.

use std::collections::BTreeSet;

use crate::analysis::context::AnalysisContext;
use crate::analysis::scc::Scc;
use crate::ir::ids::{BlockId, FuncId, InstId};
use crate::ir::program::Program;
use crate::mhp::codeset::CodeSet;
use crate::mhp::join::{BlockingCodeInfo, ThreadJoinAnalysis};

/// Add the interesting, unblocked instructions from `start` up to the end
/// of its block, terminator excluded
pub fn reachable_instructions(
    prog: &Program,
    start: Option<InstId>,
    blocking: &BlockingCodeInfo,
    out: &mut CodeSet,
) {
    let mut cur = start;
    while let Some(i) = cur {
        let inst = prog.inst(i);
        if inst.kind.is_terminator() {
            break;
        }
        if inst.kind.is_interesting() && !blocking.is_inst_blocked(prog, i) {
            out.insert_inst(i);
        }
        cur = prog.next_inst(i);
    }
}

/// Add the code of one function reachable after `root`. `root` itself is
/// only added when a cycle leads back to it.
pub fn reachable_insts_and_blocks(
    prog: &Program,
    root: InstId,
    blocking: &BlockingCodeInfo,
    out: &mut CodeSet,
) {
    if out.covers_inst(prog, root) {
        return;
    }
    reachable_instructions(prog, prog.next_inst(root), blocking, out);
    let bb = prog.block_of(root);
    if blocking.is_blocking_block(bb) {
        return;
    }
    reach_blocks(prog, prog.block(bb).succs.clone(), blocking, out);
}

/// Add the code of `f` reachable from its entry
fn reachable_from_entry(prog: &Program, f: FuncId, blocking: &BlockingCodeInfo, out: &mut CodeSet) {
    if let Some(entry) = prog.func(f).entry() {
        reach_blocks(prog, vec![entry], blocking, out);
    }
}

fn reach_blocks(
    prog: &Program,
    mut worklist: Vec<BlockId>,
    blocking: &BlockingCodeInfo,
    out: &mut CodeSet,
) {
    while let Some(b) = worklist.pop() {
        if out.has_block(b) || blocking.is_block_blocked(prog, b) {
            continue;
        }
        let block = prog.block(b);
        // Only the part before the join runs.
        if blocking.is_blocking_block(b) {
            reachable_instructions(prog, block.insts.first().copied(), blocking, out);
            continue;
        }
        out.insert_block(b);
        worklist.extend(block.succs.iter().copied());
    }
}

/// Add every defined function reachable from `start` through call and fork
/// edges
pub fn reachable_functions(
    ctx: &AnalysisContext,
    start: impl IntoIterator<Item = FuncId>,
    out: &mut CodeSet,
) {
    let mut worklist: Vec<FuncId> = start.into_iter().collect();
    while let Some(f) = worklist.pop() {
        if ctx.prog.func(f).is_declaration() || out.has_func(f) {
            continue;
        }
        out.insert_func(f);
        for e in ctx.cg.edges_from(f) {
            if !out.has_func(e.callee) {
                worklist.push(e.callee);
            }
        }
    }
}

/// Push the callees of the call sites of `f` that `code` covers, or of all
/// of them when `f` is entirely reachable
fn push_callees(
    ctx: &AnalysisContext,
    f: FuncId,
    fine_grain: bool,
    code: &CodeSet,
    excluded: Option<InstId>,
    worklist: &mut Vec<FuncId>,
) {
    let prog = &ctx.prog;
    for i in prog.func_insts(f) {
        if !prog.is_call(i) || Some(i) == excluded {
            continue;
        }
        if fine_grain && !code.covers_inst(prog, i) {
            continue;
        }
        for e in ctx.cg.edges_at(i) {
            if !prog.func(e.callee).is_declaration() && !code.has_func(e.callee) {
                worklist.push(e.callee);
            }
        }
    }
}

/// Code running on the spawning thread after the spawn took effect at
/// `roots`. Calls at `excluded` are not followed.
pub fn solve_trunk(
    ctx: &AnalysisContext,
    roots: &BTreeSet<InstId>,
    scc: &Scc,
    tja: &ThreadJoinAnalysis,
    excluded: Option<InstId>,
    trunk: &mut CodeSet,
) {
    let prog = &ctx.prog;
    for &root in roots {
        let f = prog.func_of(root);
        if trunk.has_func(f) {
            continue;
        }
        reachable_insts_and_blocks(prog, root, tja.blocking_info(f), trunk);
    }

    let mut worklist = Vec::new();
    for &f in &scc.members {
        for i in prog.func_insts(f) {
            if !prog.is_call(i) || Some(i) == excluded || !trunk.covers_inst(prog, i) {
                continue;
            }
            for e in ctx.cg.edges_at(i) {
                if !trunk.has_func(e.callee) {
                    worklist.push(e.callee);
                }
            }
        }
    }

    let mut partial: BTreeSet<FuncId> = BTreeSet::new();
    while let Some(f) = worklist.pop() {
        if prog.func(f).is_declaration() || trunk.has_func(f) || partial.contains(&f) {
            continue;
        }
        let blocking = tja.blocking_info(f);
        let fine_grain = !blocking.is_empty();
        if fine_grain {
            reachable_from_entry(prog, f, blocking, trunk);
            partial.insert(f);
        } else {
            trunk.insert_func(f);
        }
        push_callees(ctx, f, fine_grain, trunk, excluded, &mut worklist);
    }
}

/// Functions run by the threads of `spawn`
pub fn solve_branch(ctx: &AnalysisContext, spawn: InstId, branch: &mut CodeSet) {
    if !branch.is_empty() {
        return;
    }
    reachable_functions(ctx, ctx.cg.edges_at(spawn).iter().map(|e| e.callee), branch);
}

/// Code run by the threads of `spawn` before the joins matched by `tja`
pub fn solve_refined_branch(
    ctx: &AnalysisContext,
    spawn: InstId,
    tja: &ThreadJoinAnalysis,
    branch: &mut CodeSet,
) {
    if !branch.is_empty() {
        return;
    }
    let prog = &ctx.prog;
    let mut worklist: Vec<FuncId> = ctx.cg.edges_at(spawn).iter().map(|e| e.callee).collect();
    let mut visited: BTreeSet<FuncId> = BTreeSet::new();
    while let Some(f) = worklist.pop() {
        if prog.func(f).is_declaration() || branch.has_func(f) || !visited.insert(f) {
            continue;
        }
        let blocking = tja.blocking_info(f);
        let fine_grain = !blocking.is_empty();
        if fine_grain {
            reachable_from_entry(prog, f, blocking, branch);
        } else {
            branch.insert_func(f);
        }
        push_callees(ctx, f, fine_grain, branch, None, &mut worklist);
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::core::config::DetectorConfig;
    use crate::ir::builder::ProgramBuilder;
    use crate::ir::inst::Predicate;
    use crate::mhp::join::SpawnJoinSiteInfo;

    #[test]
    fn test_reachable_after_root_in_diamond() {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let main = pb.declare("main", 0);
        let (first, left_store, right_store, join_store) = {
            let mut fb = pb.body(main);
            let left = fb.new_block();
            let right = fb.new_block();
            let merge = fb.new_block();
            let v = fb.load(g);
            let first = fb.def(v);
            let zero = fb.const_int(0);
            let c = fb.cmp(Predicate::Eq, v, zero);
            fb.cond_br(c, left, right);
            fb.position_at(left);
            let l = fb.store(g, zero);
            fb.br(merge);
            fb.position_at(right);
            let r = fb.store(g, v);
            fb.br(merge);
            fb.position_at(merge);
            let m = fb.store(g, zero);
            fb.ret(None);
            (first, l, r, m)
        };
        let prog = pb.finish().unwrap();

        let mut out = CodeSet::new();
        reachable_insts_and_blocks(&prog, first, BlockingCodeInfo::empty(), &mut out);
        assert!(!out.covers_inst(&prog, first));
        for i in [left_store, right_store, join_store] {
            assert!(out.covers_inst(&prog, i));
        }
    }

    #[test]
    fn test_join_blocks_trailing_code() {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let worker = pb.declare("worker", 1);
        let create = pb.declare("pthread_create", 4);
        let join = pb.declare("pthread_join", 2);
        let main = pb.declare("main", 0);
        {
            let mut fb = pb.body(worker);
            let one = fb.const_int(1);
            fb.store(g, one);
            fb.ret(None);
        }
        let (spawn, join_site, before, after) = {
            let mut fb = pb.body(main);
            let tid = fb.alloca(0);
            let null = fb.null();
            let routine = fb.func_addr(worker);
            let spawn = fb.call(create, vec![tid, null, routine, null]);
            let zero = fb.const_int(0);
            let before = fb.store(g, zero);
            let t = fb.load(tid);
            let join_site = fb.call(join, vec![t, null]);
            let after = fb.store(g, zero);
            fb.ret(None);
            (spawn, join_site, before, after)
        };
        let prog = pb.finish().unwrap();
        let ctx = AnalysisContext::new(prog, DetectorConfig::default()).unwrap();

        let spawn_info = SpawnJoinSiteInfo::compute(&ctx, spawn, true);
        let mut joins = std::collections::BTreeMap::new();
        joins.insert(join_site, SpawnJoinSiteInfo::compute(&ctx, join_site, false));
        let tja = ThreadJoinAnalysis::run(&ctx, &spawn_info, &mut joins);
        assert!(tja.has_joins());
        assert_eq!(joins[&join_site].matching_spawn, Some(spawn));

        let mut out = CodeSet::new();
        let f = ctx.prog.func_of(spawn);
        reachable_insts_and_blocks(&ctx.prog, spawn, tja.blocking_info(f), &mut out);
        assert!(out.covers_inst(&ctx.prog, before));
        assert!(out.covers_inst(&ctx.prog, join_site));
        assert!(!out.covers_inst(&ctx.prog, after));
    }
}
