// SPDX-License-Identifier: GPL-2.0
//! Inclusion-based points-to solver.
//!
//! A worklist over PAG nodes. Loads and stores are lowered to derived copy
//! edges as the points-to sets of their pointers grow; indirect calls and
//! thread entry routines are linked when function objects reach the callee
//! operand. Join edges need the points-to sets of thread id pointers, so
//! they are added after a first fixpoint and solving resumes.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::analysis::thread_api::{ThreadApi, ThreadApiKind};
use crate::ir::ids::{FuncId, GlobalId, InstId, NodeId, ObjId, ValueId};
use crate::ir::inst::{Callee, InstKind, ValueKind};
use crate::ir::program::Program;
use crate::ir::scev::strip_casts;
use crate::pta::objects::{ObjFlags, ObjOrigin, ObjSet, ObjTable};
use crate::pta::pag::{Pag, PagEdgeKind};
use crate::pta::PointerAnalysis;

/// Pending field projection of a base pointer
#[derive(Debug, Clone, Copy)]
struct GepUse {
    dst: usize,
    offset: Option<u32>,
}

pub(crate) struct Solver<'a> {
    prog: &'a Program,
    api: ThreadApi,
    handle_vgep: bool,
    objs: ObjTable,
    pag: Pag,
    pts: Vec<ObjSet>,
    succ: Vec<BTreeSet<usize>>,
    loads: Vec<Vec<usize>>,
    stores: Vec<Vec<usize>>,
    geps: Vec<Vec<GepUse>>,
    indirect: Vec<Vec<InstId>>,
    routines: Vec<Vec<InstId>>,
    worklist: VecDeque<usize>,
    queued: Vec<bool>,
    alloc_objs: BTreeMap<InstId, ObjId>,
    global_objs: Vec<ObjId>,
    func_objs: Vec<ObjId>,
    callees: BTreeMap<InstId, BTreeSet<FuncId>>,
    spawnees: BTreeMap<InstId, BTreeSet<FuncId>>,
    join_spawns: BTreeMap<InstId, BTreeSet<InstId>>,
    dummy: ObjId,
}

impl<'a> Solver<'a> {
    pub(crate) fn new(prog: &'a Program, handle_vgep: bool) -> Self {
        let mut objs = ObjTable::new();
        let mut global_objs = Vec::with_capacity(prog.globals().count());
        for g in prog.globals() {
            global_objs.push(objs.add(
                ObjFlags::GLOBAL,
                ObjOrigin::Global(g.id),
                g.fields,
                None,
                g.loc.clone(),
                g.name.clone(),
            ));
        }
        let mut func_objs = Vec::with_capacity(prog.num_funcs());
        for f in prog.funcs() {
            func_objs.push(objs.add(
                ObjFlags::FUNCTION,
                ObjOrigin::Function(f.id),
                0,
                None,
                None,
                f.name.clone(),
            ));
        }
        let mut alloc_objs = BTreeMap::new();
        for inst in prog.insts() {
            if let InstKind::Alloc { heap, fields } = inst.kind {
                let flags = if heap { ObjFlags::HEAP } else { ObjFlags::STACK };
                let name = format!("{}@{}", if heap { "heap" } else { "stack" }, inst.id);
                let o = objs.add(
                    flags,
                    ObjOrigin::Alloc(inst.id),
                    fields,
                    Some(inst.func),
                    inst.loc.clone(),
                    name,
                );
                alloc_objs.insert(inst.id, o);
            }
        }
        let dummy = objs.dummy();

        let nv = prog.num_values();
        let n = nv + objs.len();
        Self {
            prog,
            api: ThreadApi::new(),
            handle_vgep,
            pag: Pag::new(nv, objs.len()),
            objs,
            pts: vec![ObjSet::new(); n],
            succ: vec![BTreeSet::new(); n],
            loads: vec![Vec::new(); n],
            stores: vec![Vec::new(); n],
            geps: vec![Vec::new(); n],
            indirect: vec![Vec::new(); n],
            routines: vec![Vec::new(); n],
            worklist: VecDeque::new(),
            queued: vec![false; n],
            alloc_objs,
            global_objs,
            func_objs,
            callees: BTreeMap::new(),
            spawnees: BTreeMap::new(),
            join_spawns: BTreeMap::new(),
            dummy,
        }
    }

    fn vnode(&self, v: ValueId) -> usize {
        self.pag.value_node(v).index()
    }

    fn onode(&self, o: ObjId) -> usize {
        self.pag.obj_node(o).index()
    }

    fn push(&mut self, n: usize) {
        if !self.queued[n] {
            self.queued[n] = true;
            self.worklist.push_back(n);
        }
    }

    fn add_obj(&mut self, n: usize, o: ObjId) {
        if self.pts[n].insert(o) {
            self.push(n);
        }
    }

    fn add_addr(&mut self, o: ObjId, v: ValueId) {
        let (on, vn) = (self.pag.obj_node(o), self.pag.value_node(v));
        self.pag.add_edge(on, vn, PagEdgeKind::Addr);
        self.add_obj(vn.index(), o);
    }

    /// Copy-like flow from `src` to `dst`, recorded in the PAG with `kind`
    fn add_flow(&mut self, src: ValueId, dst: ValueId, kind: PagEdgeKind) {
        let (s, d) = (self.vnode(src), self.vnode(dst));
        self.pag.add_edge(NodeId::new(s), NodeId::new(d), kind);
        self.add_derived(s, d);
    }

    fn add_derived(&mut self, s: usize, d: usize) {
        if self.succ[s].insert(d) && !self.pts[s].is_empty() {
            let before = self.pts[d].len();
            let src = self.pts[s].clone();
            self.pts[d].extend(src);
            if self.pts[d].len() != before {
                self.push(d);
            }
        }
    }

    fn seed(&mut self) {
        let prog = self.prog;
        for (g, o) in self.global_objs.clone().into_iter().enumerate() {
            self.add_addr(o, prog.global(GlobalId::new(g)).addr);
        }
        for (f, o) in self.func_objs.clone().into_iter().enumerate() {
            self.add_addr(o, prog.func(FuncId::new(f)).addr);
        }
        for inst in prog.insts() {
            let res = inst.result;
            match &inst.kind {
                InstKind::Alloc { .. } => {
                    if let (Some(o), Some(r)) = (self.alloc_objs.get(&inst.id).copied(), res) {
                        self.add_addr(o, r);
                    }
                }
                InstKind::Load { ptr } => {
                    if let Some(r) = res {
                        let (p, d) = (self.pag.value_node(*ptr), self.pag.value_node(r));
                        self.pag.add_edge(p, d, PagEdgeKind::Load);
                        self.loads[p.index()].push(d.index());
                    }
                }
                InstKind::Store { ptr, val } => {
                    let (s, p) = (self.pag.value_node(*val), self.pag.value_node(*ptr));
                    self.pag.add_edge(s, p, PagEdgeKind::Store);
                    self.stores[p.index()].push(s.index());
                }
                InstKind::Gep { base, offset, .. } => {
                    if let Some(r) = res {
                        let kind = match offset {
                            Some(k) => PagEdgeKind::NormalGep(*k),
                            None => PagEdgeKind::VariantGep,
                        };
                        let (b, d) = (self.pag.value_node(*base), self.pag.value_node(r));
                        self.pag.add_edge(b, d, kind);
                        self.geps[b.index()].push(GepUse {
                            dst: d.index(),
                            offset: *offset,
                        });
                    }
                }
                InstKind::Cast { src } => {
                    if let Some(r) = res {
                        self.add_flow(*src, r, PagEdgeKind::Copy);
                    }
                }
                InstKind::Phi { incoming } => {
                    if let Some(r) = res {
                        for (v, _) in incoming {
                            self.add_flow(*v, r, PagEdgeKind::Copy);
                        }
                    }
                }
                InstKind::Call { callee, .. } => match callee {
                    Callee::Direct(f) => self.link_call(inst.id, *f),
                    Callee::Indirect(v) => {
                        let n = self.vnode(*v);
                        self.indirect[n].push(inst.id);
                        self.push(n);
                    }
                },
                _ => {}
            }
        }
    }

    fn link_call(&mut self, cs: InstId, f: FuncId) {
        if !self.callees.entry(cs).or_default().insert(f) {
            return;
        }
        let prog = self.prog;
        let func = prog.func(f);
        if func.is_declaration() {
            match self.api.func_kind(prog, f) {
                Some(ThreadApiKind::Spawn) | Some(ThreadApiKind::ParFor) => {
                    self.spawnees.entry(cs).or_default();
                    if let Some(routine) = self.api.routine(prog, cs) {
                        match prog.value(routine).kind {
                            ValueKind::Function(g) => self.link_spawn(cs, g),
                            _ => {
                                let n = self.vnode(routine);
                                self.routines[n].push(cs);
                                self.push(n);
                            }
                        }
                    }
                }
                Some(_) => {}
                None => {
                    // Unknown library code returns unknown memory.
                    if let Some(r) = prog.result(cs) {
                        let n = self.vnode(r);
                        self.add_obj(n, self.dummy);
                    }
                }
            }
            return;
        }
        let args = prog.call_args(cs).to_vec();
        for (a, p) in args.iter().zip(func.params.clone()) {
            self.add_flow(*a, p, PagEdgeKind::Call(cs));
        }
        if let (Some(ret), Some(r)) = (self.ret_value(f), prog.result(cs)) {
            self.add_flow(ret, r, PagEdgeKind::Ret(cs));
        }
    }

    fn link_spawn(&mut self, cs: InstId, g: FuncId) {
        if !self.spawnees.entry(cs).or_default().insert(g) {
            return;
        }
        let prog = self.prog;
        let func = prog.func(g);
        if func.is_declaration() {
            return;
        }
        if let (Some(arg), Some(p)) = (self.api.routine_arg(prog, cs), func.params.first()) {
            self.add_flow(arg, *p, PagEdgeKind::Fork(cs));
        }
    }

    fn ret_value(&self, f: FuncId) -> Option<ValueId> {
        let ret = self.prog.unique_return(f)?;
        match self.prog.inst(ret).kind {
            InstKind::Ret { val } => val,
            _ => None,
        }
    }

    fn gep_targets(&mut self, o: ObjId, offset: Option<u32>) -> Vec<ObjId> {
        match offset {
            Some(k) => vec![self.objs.field_obj(o, k)],
            None if self.handle_vgep => {
                if !self.objs.get(o).is_dummy() {
                    self.objs.mark_array(o);
                }
                self.objs.all_fields(o)
            }
            None => vec![self.objs.get(o).base],
        }
    }

    fn process(&mut self, n: usize) {
        let set = self.pts[n].clone();
        for o in set.iter().copied() {
            let on = self.onode(o);
            for d in self.loads[n].clone() {
                self.add_derived(on, d);
            }
            for s in self.stores[n].clone() {
                self.add_derived(s, on);
            }
            for g in self.geps[n].clone() {
                for t in self.gep_targets(o, g.offset) {
                    self.add_obj(g.dst, t);
                }
            }
            if let ObjOrigin::Function(f) = self.objs.get(o).origin {
                for cs in self.indirect[n].clone() {
                    self.link_call(cs, f);
                }
                for cs in self.routines[n].clone() {
                    self.link_spawn(cs, f);
                }
            }
        }
        for m in self.succ[n].clone() {
            let before = self.pts[m].len();
            self.pts[m].extend(set.iter().copied());
            if self.pts[m].len() != before {
                self.push(m);
            }
        }
    }

    fn solve(&mut self) {
        while let Some(n) = self.worklist.pop_front() {
            self.queued[n] = false;
            self.process(n);
        }
    }

    fn may_alias_values(&self, a: ValueId, b: ValueId) -> bool {
        let (pa, pb) = (&self.pts[self.vnode(a)], &self.pts[self.vnode(b)]);
        if pa.contains(&self.dummy) || pb.contains(&self.dummy) {
            return !pa.is_empty() && !pb.is_empty();
        }
        pa.intersection(pb).next().is_some()
    }

    /// Match join sites to spawn sites through their thread id pointers.
    /// Returns whether a new edge was added.
    fn link_joins(&mut self) -> bool {
        let prog = self.prog;
        let spawns: Vec<InstId> = self
            .spawnees
            .keys()
            .copied()
            .filter(|s| self.api.is_spawn(prog, *s))
            .collect();
        let joins: Vec<InstId> = self
            .callees
            .keys()
            .copied()
            .filter(|j| self.api.is_join(prog, *j))
            .collect();
        let mut changed = false;
        for j in joins {
            let Some(tid) = self.api.thread_id(prog, j) else {
                continue;
            };
            let Some(InstKind::Load { ptr }) = prog.def_inst(strip_casts(prog, tid)).map(|i| &prog.inst(i).kind)
            else {
                continue;
            };
            let Some(res) = prog.result(j) else {
                continue;
            };
            for s in &spawns {
                let Some(sptr) = self.api.thread_id(prog, *s) else {
                    continue;
                };
                if !self.may_alias_values(*ptr, sptr) {
                    continue;
                }
                self.join_spawns.entry(j).or_default().insert(*s);
                let targets = self.spawnees.get(s).cloned().unwrap_or_default();
                for g in targets {
                    if let Some(ret) = self.ret_value(g) {
                        let before = self.pag.num_edges();
                        self.add_flow(ret, res, PagEdgeKind::Join(*s));
                        changed |= self.pag.num_edges() != before;
                    }
                }
            }
        }
        changed
    }

    pub(crate) fn run(mut self) -> PointerAnalysis {
        self.seed();
        self.solve();
        while self.link_joins() {
            self.solve();
        }
        log::debug!(
            "points-to solved: {} objects, {} PAG edges",
            self.objs.len(),
            self.pag.num_edges()
        );
        PointerAnalysis {
            objs: self.objs,
            pag: self.pag,
            pts: self.pts,
            alloc_objs: self.alloc_objs,
            global_objs: self.global_objs,
            func_objs: self.func_objs,
            callees: self.callees,
            spawnees: self.spawnees,
            join_spawns: self.join_spawns,
            dummy: self.dummy,
        }
    }
}
