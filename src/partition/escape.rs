// SPDX-License-Identifier: GPL-2.0
//! Thread-escape analysis.
//!
//! An object escapes when another thread can reach it: through a global, or
//! through the argument handed to a spawn or parallel loop site. Reachability
//! follows points-to sets transitively through object contents. A pointer to
//! the start of an aggregate exposes all of its fields.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::collector::OperationCollector;
use crate::analysis::context::AnalysisContext;
use crate::ir::ids::{InstId, ObjId, PartId, ValueId};
use crate::partition::mem_part::MemoryPartitioning;
use crate::pta::PointerAnalysis;

/// Objects and partitions visible to more than one thread
#[derive(Debug, Clone, Default)]
pub struct ThreadEscapeAnalysis {
    global_objs: BTreeSet<ObjId>,
    spawn_objs: BTreeMap<InstId, BTreeSet<ObjId>>,
    global_parts: BTreeSet<PartId>,
    all_spawn_parts: BTreeSet<PartId>,
    spawn_parts: BTreeMap<InstId, BTreeSet<PartId>>,
}

impl ThreadEscapeAnalysis {
    /// Compute visibility from globals and from spawn site arguments
    pub fn analyze(ctx: &AnalysisContext, oc: &OperationCollector, mp: &MemoryPartitioning) -> Self {
        let (prog, pta) = (&ctx.prog, &ctx.pta);
        let mut tea = Self::default();

        for g in prog.globals() {
            reachable_objs(pta, g.addr, &mut tea.global_objs);
        }

        let sites = oc.spawn_sites().iter().chain(oc.par_for_sites());
        for &site in sites {
            let objs = tea.spawn_objs.entry(site).or_default();
            if let Some(arg) = ctx.api.routine_arg(prog, site) {
                reachable_objs(pta, arg, objs);
            }
        }

        let to_parts = |objs: &BTreeSet<ObjId>| -> BTreeSet<PartId> {
            objs.iter().filter_map(|o| mp.part_of(*o)).collect()
        };
        tea.global_parts = to_parts(&tea.global_objs);
        for (site, objs) in &tea.spawn_objs {
            let parts = to_parts(objs);
            tea.all_spawn_parts.extend(parts.iter().copied());
            tea.spawn_parts.insert(*site, parts);
        }
        log::debug!(
            "escape: {} globally visible partitions, {} visible from spawn sites",
            tea.global_parts.len(),
            tea.all_spawn_parts.len()
        );
        tea
    }

    /// Whether partition `p` may be accessed by more than one thread
    pub fn may_escape(&self, p: PartId) -> bool {
        self.global_parts.contains(&p) || self.all_spawn_parts.contains(&p)
    }

    /// Whether partition `p` is visible to the thread of `spawn`
    pub fn may_escape_to(&self, p: PartId, spawn: InstId) -> bool {
        self.global_parts.contains(&p)
            || self
                .spawn_parts
                .get(&spawn)
                .is_some_and(|parts| parts.contains(&p))
    }

    /// Spawn sites whose thread can see partition `p`
    pub fn visible_spawn_sites(&self, p: PartId) -> BTreeSet<InstId> {
        let global = self.global_parts.contains(&p);
        self.spawn_parts
            .iter()
            .filter(|(_, parts)| global || parts.contains(&p))
            .map(|(site, _)| *site)
            .collect()
    }

    /// Partitions reachable from globals
    pub fn global_visible(&self) -> &BTreeSet<PartId> {
        &self.global_parts
    }

    /// Partitions reachable from some spawn site argument
    pub fn all_spawn_site_visible(&self) -> &BTreeSet<PartId> {
        &self.all_spawn_parts
    }

    /// Whether an object `p` points to is reachable from a global
    pub fn is_global_visible(&self, pta: &PointerAnalysis, p: ValueId) -> bool {
        is_visible(pta, p, &self.global_objs)
    }

    /// Whether an object `p` points to is reachable from the argument of `spawn`
    pub fn is_spawn_site_visible(&self, pta: &PointerAnalysis, p: ValueId, spawn: InstId) -> bool {
        self.spawn_objs
            .get(&spawn)
            .is_some_and(|objs| is_visible(pta, p, objs))
    }
}

/// `o` together with every field of its aggregate when `o` is its start
fn expand_fields(pta: &PointerAnalysis, o: ObjId) -> Vec<ObjId> {
    if pta.obj(o).is_first_field() {
        pta.objs().all_fields(pta.obj(o).base)
    } else {
        vec![o]
    }
}

fn is_visible(pta: &PointerAnalysis, p: ValueId, visible: &BTreeSet<ObjId>) -> bool {
    pta.points_to(p)
        .iter()
        .flat_map(|o| expand_fields(pta, *o))
        .any(|o| visible.contains(&o))
}

/// Every object reachable from `root` by following points-to sets
fn reachable_objs(pta: &PointerAnalysis, root: ValueId, out: &mut BTreeSet<ObjId>) {
    let mut worklist: Vec<ObjId> = pta
        .points_to(root)
        .iter()
        .flat_map(|o| expand_fields(pta, *o))
        .collect();
    while let Some(o) = worklist.pop() {
        if !out.insert(o) {
            continue;
        }
        for m in pta.obj_contents(o) {
            worklist.extend(expand_fields(pta, *m));
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::core::config::DetectorConfig;
    use crate::ir::builder::ProgramBuilder;

    #[test]
    fn test_spawn_argument_escapes_but_local_does_not() {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let worker = pb.declare("worker", 1);
        let create = pb.declare("thread_create", 3);
        let main = pb.declare("main", 0);
        {
            let mut fb = pb.body(worker);
            let arg = fb.param(0);
            let one = fb.const_int(1);
            fb.store(arg, one);
            fb.ret(None);
        }
        {
            let mut fb = pb.body(main);
            let tid = fb.alloca(0);
            let shared = fb.malloc(0);
            let local = fb.alloca(0);
            let zero = fb.const_int(0);
            fb.store(local, zero);
            fb.store(g, zero);
            let routine = fb.func_addr(worker);
            fb.call(create, vec![tid, routine, shared]);
            fb.store(shared, zero);
            fb.ret(None);
        }
        let prog = pb.finish().unwrap();
        let ctx = AnalysisContext::new(prog, DetectorConfig::default()).unwrap();
        let oc = OperationCollector::collect(&ctx);
        let mp = MemoryPartitioning::run(&ctx, &oc);
        let tea = ThreadEscapeAnalysis::analyze(&ctx, &oc, &mp);

        let spawn = oc.spawn_sites()[0];
        let part_of_ptr = |v: ValueId| {
            let o = *ctx.pta.points_to(v).iter().next().unwrap();
            mp.part_of(o).unwrap()
        };
        let shared_v = ctx.prog.call_args(spawn)[2];
        assert!(tea.may_escape(part_of_ptr(shared_v)));
        assert!(tea.may_escape_to(part_of_ptr(shared_v), spawn));
        assert!(tea.may_escape(part_of_ptr(g)));
        assert_eq!(tea.visible_spawn_sites(part_of_ptr(g)).len(), 1);
        assert!(tea.is_spawn_site_visible(&ctx.pta, shared_v, spawn));
        assert!(!tea.is_global_visible(&ctx.pta, shared_v));

        let local_store = ctx
            .prog
            .func_insts(ctx.prog.require_func("main").unwrap())
            .find(|i| oc.accesses_of(*i).len() == 1)
            .unwrap();
        let local_ptr = oc.access(oc.accesses_of(local_store)[0]).ptr;
        assert!(!tea.may_escape(part_of_ptr(local_ptr)));
    }
}
