// SPDX-License-Identifier: GPL-2.0
//! Points-to analysis.
//!
//! An inclusion-based, field-sensitive, context-insensitive analysis over a
//! pointer assignment graph ([`pag::Pag`]). Its results back memory
//! partitioning, lock and thread id matching, and call graph resolution;
//! the context-sensitive alias refinement re-traverses the same graph.

pub mod andersen;
pub mod objects;
pub mod pag;

use std::collections::{BTreeMap, BTreeSet};

pub use objects::{MemObject, ObjFlags, ObjOrigin, ObjSet, ObjTable};
pub use pag::{Pag, PagEdge, PagEdgeKind, PagNode};

use crate::ir::ids::{FuncId, GlobalId, InstId, ObjId, ValueId};
use crate::ir::program::Program;

/// Solved points-to information
#[derive(Debug, Clone)]
pub struct PointerAnalysis {
    pub(crate) objs: ObjTable,
    pub(crate) pag: Pag,
    pub(crate) pts: Vec<ObjSet>,
    pub(crate) alloc_objs: BTreeMap<InstId, ObjId>,
    pub(crate) global_objs: Vec<ObjId>,
    pub(crate) func_objs: Vec<ObjId>,
    pub(crate) callees: BTreeMap<InstId, BTreeSet<FuncId>>,
    pub(crate) spawnees: BTreeMap<InstId, BTreeSet<FuncId>>,
    pub(crate) join_spawns: BTreeMap<InstId, BTreeSet<InstId>>,
    pub(crate) dummy: ObjId,
}

impl PointerAnalysis {
    /// Solve the whole program
    pub fn analyze(prog: &Program, handle_variant_gep: bool) -> Self {
        andersen::Solver::new(prog, handle_variant_gep).run()
    }

    /// Objects a value may point to
    pub fn points_to(&self, v: ValueId) -> &ObjSet {
        &self.pts[self.pag.value_node(v).index()]
    }

    /// Objects whose addresses may be stored in `o`
    pub fn obj_contents(&self, o: ObjId) -> &ObjSet {
        &self.pts[self.pag.obj_node(o).index()]
    }

    /// Whether two pointers may refer to the same object
    pub fn alias(&self, a: ValueId, b: ValueId) -> bool {
        let (pa, pb) = (self.points_to(a), self.points_to(b));
        if pa.contains(&self.dummy) || pb.contains(&self.dummy) {
            return !pa.is_empty() && !pb.is_empty();
        }
        pa.intersection(pb).next().is_some()
    }

    /// Whether two pointers always refer to the same concrete object
    pub fn must_alias(&self, a: ValueId, b: ValueId) -> bool {
        let (pa, pb) = (self.points_to(a), self.points_to(b));
        if pa.len() != 1 || pa != pb {
            return false;
        }
        pa.iter().all(|o| {
            let obj = self.objs.get(*o);
            !obj.is_dummy() && !obj.is_heap() && !obj.is_function() && !self.objs.is_array(*o)
        })
    }

    /// Whether `v` points to exactly one object that has one instance at
    /// run time. Stack objects of functions in `recursive` have many.
    pub fn is_singleton(&self, v: ValueId, recursive: &BTreeSet<FuncId>) -> bool {
        let pts = self.points_to(v);
        if pts.len() != 1 {
            return false;
        }
        pts.iter().all(|o| {
            let obj = self.objs.get(*o);
            if obj.is_dummy() || obj.is_heap() || self.objs.is_array(*o) {
                return false;
            }
            !(obj.flags.contains(ObjFlags::STACK)
                && obj.func.map(|f| recursive.contains(&f)).unwrap_or(false))
        })
    }

    /// Object table
    pub fn objs(&self) -> &ObjTable {
        &self.objs
    }

    /// Object by handle
    pub fn obj(&self, o: ObjId) -> &MemObject {
        self.objs.get(o)
    }

    /// The pointer assignment graph, with resolved call edges
    pub fn pag(&self) -> &Pag {
        &self.pag
    }

    /// The black hole object
    pub fn dummy(&self) -> ObjId {
        self.dummy
    }

    /// Object created by an allocation instruction
    pub fn alloc_obj(&self, i: InstId) -> Option<ObjId> {
        self.alloc_objs.get(&i).copied()
    }

    /// Object of a global variable
    pub fn global_obj(&self, g: GlobalId) -> ObjId {
        self.global_objs[g.index()]
    }

    /// Object of a function
    pub fn func_obj(&self, f: FuncId) -> ObjId {
        self.func_objs[f.index()]
    }

    /// Resolved targets of a call site, library declarations included
    pub fn callees(&self, cs: InstId) -> impl Iterator<Item = FuncId> + '_ {
        self.callees.get(&cs).into_iter().flatten().copied()
    }

    /// Resolved start routines of a spawn or parallel loop site
    pub fn spawnees(&self, cs: InstId) -> impl Iterator<Item = FuncId> + '_ {
        self.spawnees.get(&cs).into_iter().flatten().copied()
    }

    /// Every spawn and parallel loop site
    pub fn spawn_sites(&self) -> impl Iterator<Item = InstId> + '_ {
        self.spawnees.keys().copied()
    }

    /// Spawn sites whose thread id a join may wait for
    pub fn joined_spawns(&self, join: InstId) -> impl Iterator<Item = InstId> + '_ {
        self.join_spawns.get(&join).into_iter().flatten().copied()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::ir::builder::ProgramBuilder;

    #[test]
    fn test_field_sensitivity() {
        let mut pb = ProgramBuilder::new();
        let main = pb.declare("main", 0);
        let (a, b, c) = {
            let mut f = pb.body(main);
            let s = f.alloca(2);
            let a = f.gep(s, 0);
            let b = f.gep(s, 1);
            let c = f.gep(s, 1);
            f.ret(None);
            (a, b, c)
        };
        let prog = pb.finish().expect("valid program");
        let pta = PointerAnalysis::analyze(&prog, true);
        assert!(!pta.alias(a, b));
        assert!(pta.alias(b, c));
        assert!(pta.must_alias(b, c));
    }

    #[test]
    fn test_store_load_and_indirect_call() {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let main = pb.declare("main", 0);
        let callee = pb.declare("callee", 1);
        let param = pb.param(callee, 0);
        {
            let mut f = pb.body(callee);
            f.ret(None);
        }
        let (slot, cs) = {
            let mut f = pb.body(main);
            let slot = f.alloca(0);
            let fp = f.alloca(0);
            f.store(slot, g);
            let addr = f.func_addr(callee);
            f.store(fp, addr);
            let target = f.load(fp);
            let p = f.load(slot);
            let cs = f.call_indirect(target, vec![p]);
            f.ret(None);
            (slot, cs)
        };
        let prog = pb.finish().expect("valid program");
        let pta = PointerAnalysis::analyze(&prog, true);
        assert_eq!(pta.callees(cs).collect::<Vec<_>>(), vec![callee]);
        assert!(pta.alias(param, g));
        assert!(!pta.alias(slot, g));
    }

    #[test]
    fn test_variant_gep_marks_array() {
        let mut pb = ProgramBuilder::new();
        let arr = pb.global("arr", 4);
        let main = pb.declare("main", 0);
        let e = {
            let mut f = pb.body(main);
            let e = f.gep_variant(arr);
            f.ret(None);
            e
        };
        let prog = pb.finish().expect("valid program");
        let pta = PointerAnalysis::analyze(&prog, true);
        assert_eq!(pta.points_to(e).len(), 5);
        assert!(!pta.must_alias(arr, arr));
        assert!(!pta.is_singleton(arr, &BTreeSet::new()));
    }
}
