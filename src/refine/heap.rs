// SPDX-License-Identifier: GPL-2.0
//! Heap refinement.
//!
//! A heap object allocated in a loop and handed to exactly one spawn site
//! in the same loop gives each thread its own instance. An access on the
//! spawning thread then races with the spawned thread only when it uses the
//! instance of the same iteration after the spawn.
//!
//! The allocation is followed through casts, field projections and phis
//! within its function. Storing the pointer into memory or returning it
//! gives up.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::context::AnalysisContext;
use crate::ir::ids::{BlockId, FuncId, InstId, ObjId, ValueId};
use crate::ir::inst::InstKind;
use crate::ir::loops::LoopId;
use crate::ir::program::Program;
use crate::ir::scev::strip_casts;
use crate::mhp::MhpAnalysis;
use crate::partition::escape::ThreadEscapeAnalysis;
use crate::pta::ObjOrigin;

/// Where the address returned by one allocation flows within its scope
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapFlowDestinations {
    /// The only spawn site receiving the address in the same loop
    pub unique_spawn: Option<InstId>,
    /// Accesses dereferencing a pointer derived only from the allocation
    pub accesses: BTreeSet<InstId>,
    /// Other call sites receiving the address
    pub call_sites: BTreeSet<InstId>,
}

/// Distinct heap instance filter
#[derive(Debug)]
pub struct HeapRefinement<'a> {
    ctx: &'a AnalysisContext,
    mhp: &'a MhpAnalysis,
    tea: &'a ThreadEscapeAnalysis,
    flows: BTreeMap<InstId, HeapFlowDestinations>,
    reach: BTreeMap<FuncId, BTreeSet<FuncId>>,
}

impl<'a> HeapRefinement<'a> {
    /// Filter using the given MHP and escape results
    pub fn new(ctx: &'a AnalysisContext, mhp: &'a MhpAnalysis, tea: &'a ThreadEscapeAnalysis) -> Self {
        Self {
            ctx,
            mhp,
            tea,
            flows: BTreeMap::new(),
            reach: BTreeMap::new(),
        }
    }

    /// Whether `i1` and `i2` must access different instances of heap
    /// object `obj`
    pub fn access_different_heap_instances(&mut self, obj: ObjId, i1: InstId, i2: InstId) -> bool {
        let Some(malloc) = self.heap_allocation_site(obj) else {
            return false;
        };
        let flows = self.flow_destinations(malloc).clone();
        let Some(spawn) = flows.unique_spawn else {
            return false;
        };

        let (ctx, mhp) = (self.ctx, self.mhp);
        let branch1 = mhp.is_branch_reachable(ctx, spawn, i1);
        let branch2 = mhp.is_branch_reachable(ctx, spawn, i2);
        // Parallel because of some other spawn site
        if !branch1 && !branch2 {
            return false;
        }

        let prog = &ctx.prog;
        let passes = ctx.passes(prog.func_of(spawn));
        let header = passes
            .loops
            .loop_of(prog.block_of(spawn))
            .map(|l| passes.loops.get(l).header);
        let (reachable_insts, reachable_blocks) = reachable_code(prog, spawn, header);

        let trunk_inst = if branch1 { i2 } else { i1 };
        let mut uses = BTreeSet::new();
        if flows.accesses.contains(&trunk_inst) {
            uses.insert(trunk_inst);
        }
        let target = prog.func_of(trunk_inst);
        for &cs in &flows.call_sites {
            let callees: Vec<FuncId> = ctx.cg.callees_at(cs).collect();
            if callees.into_iter().any(|c| self.reaches(c, target)) {
                uses.insert(cs);
            }
        }

        !uses
            .iter()
            .any(|i| reachable_insts.contains(i) || reachable_blocks.contains(&prog.block_of(*i)))
    }

    /// Flow destinations of allocation `malloc`
    pub fn flow_destinations(&mut self, malloc: InstId) -> &HeapFlowDestinations {
        let (ctx, tea) = (self.ctx, self.tea);
        self.flows
            .entry(malloc)
            .or_insert_with(|| compute_flow_destinations(ctx, tea, malloc))
    }

    fn heap_allocation_site(&self, obj: ObjId) -> Option<InstId> {
        let obj = self.ctx.pta.obj(obj);
        match obj.origin {
            ObjOrigin::Alloc(i) if obj.is_heap() => Some(i),
            _ => None,
        }
    }

    /// Whether `to` may run during a call of `from`
    fn reaches(&mut self, from: FuncId, to: FuncId) -> bool {
        let ctx = self.ctx;
        let cg = &ctx.cg;
        self.reach
            .entry(from)
            .or_insert_with(|| {
                let mut seen = BTreeSet::new();
                let mut stack = vec![from];
                while let Some(f) = stack.pop() {
                    if seen.insert(f) {
                        stack.extend(cg.edges_from(f).iter().map(|e| e.callee));
                    }
                }
                seen
            })
            .contains(&to)
    }
}

fn compute_flow_destinations(
    ctx: &AnalysisContext,
    tea: &ThreadEscapeAnalysis,
    malloc: InstId,
) -> HeapFlowDestinations {
    let prog = &ctx.prog;
    let mut flows = HeapFlowDestinations::default();
    let Some(addr) = prog.result(malloc) else {
        return flows;
    };
    let global_visible = tea.is_global_visible(&ctx.pta, addr);
    let passes = ctx.passes(prog.func_of(malloc));
    let loop_of = |i: InstId| -> Option<LoopId> { passes.loops.loop_of(prog.block_of(i)) };
    let malloc_loop = loop_of(malloc);

    let mut spawns = Vec::new();
    let mut visited: BTreeSet<ValueId> = BTreeSet::new();
    let mut stack = vec![addr];
    while let Some(v) = stack.pop() {
        if !visited.insert(v) {
            continue;
        }
        for &user in prog.users(v) {
            let same_loop = loop_of(user) == malloc_loop;
            match prog.inst(user).kind {
                InstKind::Store { ptr, val } => {
                    if val == v {
                        return HeapFlowDestinations::default();
                    }
                    if ptr == v && same_loop && exclusively_from(prog, malloc, v) {
                        flows.accesses.insert(user);
                    }
                }
                InstKind::Load { ptr } => {
                    if ptr == v && same_loop && exclusively_from(prog, malloc, v) {
                        flows.accesses.insert(user);
                    }
                }
                InstKind::Ret { .. } => return HeapFlowDestinations::default(),
                InstKind::Call { .. } => {
                    if ctx.api.is_mem_intrinsic(prog, user) {
                        flows.accesses.insert(user);
                    } else if ctx.api.is_spawn(prog, user) {
                        let arg = ctx.api.routine_arg(prog, user);
                        if same_loop && arg.is_some_and(|a| exclusively_from(prog, malloc, a)) {
                            spawns.push(user);
                        }
                    } else if global_visible {
                        return HeapFlowDestinations::default();
                    } else {
                        flows.call_sites.insert(user);
                    }
                }
                _ => {
                    if let Some(r) = prog.result(user) {
                        if !visited.contains(&r) {
                            stack.push(r);
                        }
                    }
                }
            }
        }
    }

    if let &[spawn] = spawns.as_slice() {
        flows.unique_spawn = Some(spawn);
    }
    flows
}

/// Whether `dst` is derived from the result of `src` through field
/// projections and casts only
fn exclusively_from(prog: &Program, src: InstId, dst: ValueId) -> bool {
    let mut v = dst;
    loop {
        v = strip_casts(prog, v);
        let Some(i) = prog.def_inst(v) else {
            return false;
        };
        if i == src {
            return true;
        }
        match prog.inst(i).kind {
            InstKind::Gep { base, .. } => v = base,
            InstKind::Cast { src } => v = src,
            _ => return false,
        }
    }
}

/// Instructions after `root` in its block and the blocks reachable from
/// it. With a loop `header`, the walk stays within the current iteration.
fn reachable_code(
    prog: &Program,
    root: InstId,
    header: Option<BlockId>,
) -> (BTreeSet<InstId>, BTreeSet<BlockId>) {
    let mut insts = BTreeSet::new();
    let mut cur = prog.next_inst(root);
    while let Some(i) = cur {
        if prog.inst(i).kind.is_terminator() {
            break;
        }
        insts.insert(i);
        cur = prog.next_inst(i);
    }

    let root_bb = prog.block_of(root);
    let mut blocks = BTreeSet::new();
    let mut stack = vec![root_bb];
    while let Some(bb) = stack.pop() {
        if Some(bb) == header || blocks.contains(&bb) {
            continue;
        }
        if bb != root_bb {
            blocks.insert(bb);
        }
        for &succ in &prog.block(bb).succs {
            if Some(succ) != header && !blocks.contains(&succ) && succ != root_bb {
                stack.push(succ);
            }
        }
    }
    (insts, blocks)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::analysis::collector::OperationCollector;
    use crate::core::config::DetectorConfig;
    use crate::ir::builder::ProgramBuilder;
    use crate::ir::inst::{BinOp, Predicate};
    use crate::partition::mem_part::MemoryPartitioning;

    struct Fixture {
        ctx: AnalysisContext,
        malloc: InstId,
        spawn: InstId,
        worker_store: InstId,
        main_store: Option<InstId>,
    }

    /// `for (i = 0; i < 4; i++) { p = malloc(); spawn(worker, p); }` where
    /// `worker` writes `*p`. With `touch`, `main` also writes `*p` after
    /// the spawn. With `hoisted`, the allocation happens before the loop.
    fn loop_program(touch: bool, hoisted: bool) -> Fixture {
        let mut pb = ProgramBuilder::new();
        let worker = pb.declare("worker", 1);
        let main = pb.declare("main", 0);
        let worker_store = {
            let mut fb = pb.body(worker);
            let p = fb.param(0);
            let one = fb.const_int(1);
            let s = fb.store(p, one);
            fb.ret(None);
            s
        };
        let (malloc, spawn, main_store) = {
            let mut fb = pb.body(main);
            let entry = fb.current_block();
            let header = fb.new_block();
            let body = fb.new_block();
            let exit = fb.new_block();

            let tid = fb.alloca(0);
            let zero = fb.const_int(0);
            let four = fb.const_int(4);
            let outer = if hoisted { Some(fb.malloc(0)) } else { None };
            fb.br(header);

            fb.position_at(header);
            let i = fb.phi(vec![(zero, entry)]);
            let c = fb.cmp(Predicate::Slt, i, four);
            fb.cond_br(c, body, exit);

            fb.position_at(body);
            let p = match outer {
                Some(p) => p,
                None => fb.malloc(0),
            };
            let malloc = fb.def(p);
            let routine = fb.func_addr(worker);
            let spawn = fb.call_named("thread_create", vec![tid, routine, p]);
            let main_store = if touch { Some(fb.store(p, zero)) } else { None };
            let one = fb.const_int(1);
            let next = fb.binop(BinOp::Add, i, one);
            fb.add_incoming(i, next, body);
            fb.br(header);

            fb.position_at(exit);
            fb.ret(None);
            (malloc, spawn, main_store)
        };
        let prog = pb.finish().unwrap();
        let ctx = AnalysisContext::new(prog, DetectorConfig::default()).unwrap();
        Fixture {
            ctx,
            malloc,
            spawn,
            worker_store,
            main_store,
        }
    }

    #[test]
    fn test_unique_spawn_destination() {
        let fx = loop_program(false, false);
        let oc = OperationCollector::collect(&fx.ctx);
        let mp = MemoryPartitioning::run(&fx.ctx, &oc);
        let tea = ThreadEscapeAnalysis::analyze(&fx.ctx, &oc, &mp);
        let mhp = MhpAnalysis::analyze(&fx.ctx, &oc);
        let mut hr = HeapRefinement::new(&fx.ctx, &mhp, &tea);
        let flows = hr.flow_destinations(fx.malloc);
        assert_eq!(flows.unique_spawn, Some(fx.spawn));
        assert!(flows.call_sites.is_empty());
    }

    #[test]
    fn test_threads_use_distinct_instances() {
        let fx = loop_program(false, false);
        let oc = OperationCollector::collect(&fx.ctx);
        let mp = MemoryPartitioning::run(&fx.ctx, &oc);
        let tea = ThreadEscapeAnalysis::analyze(&fx.ctx, &oc, &mp);
        let mhp = MhpAnalysis::analyze(&fx.ctx, &oc);
        let obj = fx.ctx.pta.alloc_obj(fx.malloc).unwrap();
        let mut hr = HeapRefinement::new(&fx.ctx, &mhp, &tea);
        assert!(hr.access_different_heap_instances(obj, fx.worker_store, fx.worker_store));
    }

    #[test]
    fn test_same_iteration_use_is_kept() {
        let fx = loop_program(true, false);
        let oc = OperationCollector::collect(&fx.ctx);
        let mp = MemoryPartitioning::run(&fx.ctx, &oc);
        let tea = ThreadEscapeAnalysis::analyze(&fx.ctx, &oc, &mp);
        let mhp = MhpAnalysis::analyze(&fx.ctx, &oc);
        let obj = fx.ctx.pta.alloc_obj(fx.malloc).unwrap();
        let main_store = fx.main_store.unwrap();
        let mut hr = HeapRefinement::new(&fx.ctx, &mhp, &tea);
        assert!(hr.flow_destinations(fx.malloc).accesses.contains(&main_store));
        assert!(!hr.access_different_heap_instances(obj, main_store, fx.worker_store));
    }

    #[test]
    fn test_allocation_outside_loop_is_shared() {
        let fx = loop_program(false, true);
        let oc = OperationCollector::collect(&fx.ctx);
        let mp = MemoryPartitioning::run(&fx.ctx, &oc);
        let tea = ThreadEscapeAnalysis::analyze(&fx.ctx, &oc, &mp);
        let mhp = MhpAnalysis::analyze(&fx.ctx, &oc);
        let obj = fx.ctx.pta.alloc_obj(fx.malloc).unwrap();
        let mut hr = HeapRefinement::new(&fx.ctx, &mhp, &tea);
        assert_eq!(hr.flow_destinations(fx.malloc).unique_spawn, None);
        assert!(!hr.access_different_heap_instances(obj, fx.worker_store, fx.worker_store));
    }
}
