// SPDX-License-Identifier: GPL-2.0
//! Path refinement.
//!
//! Two accesses guarded by complementary comparisons of the same global
//! against the same constant cannot both execute, provided the global holds
//! the same value at both comparisons. The same reasoning rules out a spawn
//! site whose guard excludes the guard of an access.
//!
//! Only plain globals compared to integer constants are understood.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::analysis::collector::OperationCollector;
use crate::analysis::context::AnalysisContext;
use crate::ir::ids::{FuncId, InstId, ValueId};
use crate::ir::inst::{InstKind, Predicate};
use crate::ir::program::Program;
use crate::mhp::codeset::CodeSet;
use crate::mhp::join::BlockingCodeInfo;
use crate::mhp::reachability::reachable_insts_and_blocks;
use crate::mhp::MhpAnalysis;
use crate::partition::mem_part::MemoryPartitioning;
use crate::sync::guard::{valid_call_sites, Guard, GuardExtractor};

/// `*ptr pred c` where `ptr` is a global and `c` an integer constant
#[derive(Debug, Clone, Copy)]
pub struct CmpValConst {
    /// Comparison instruction
    pub inst: InstId,
    /// Load of the global feeding the comparison
    pub val: InstId,
    /// The global
    pub ptr: ValueId,
    /// The constant
    pub c: i64,
    /// Predicate that holds on the guarded paths
    pub pred: Predicate,
}

impl CmpValConst {
    /// Whether both guards cannot hold on the same value of the global
    pub fn excludes(&self, other: &CmpValConst) -> bool {
        self.ptr == other.ptr && self.c == other.c && self.pred == other.pred.inverse()
    }
}

impl PartialEq for CmpValConst {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.c == other.c && self.pred == other.pred
    }
}

impl Eq for CmpValConst {}

impl Guard for CmpValConst {
    fn from_branch(prog: &Program, cond: ValueId, hold: bool) -> Option<Self> {
        let inst = prog.def_inst(cond)?;
        let InstKind::Cmp { pred, lhs, rhs } = prog.inst(inst).kind else {
            return None;
        };
        let (var, c, pred) = if let Some(c) = prog.const_value(rhs) {
            (lhs, c, pred)
        } else {
            (rhs, prog.const_value(lhs)?, pred.mirror())
        };
        let val = prog.def_inst(var)?;
        let InstKind::Load { ptr } = prog.inst(val).kind else {
            return None;
        };
        prog.as_global(ptr)?;
        let pred = if hold { pred } else { pred.inverse() };
        Some(Self {
            inst,
            val,
            ptr,
            c,
            pred,
        })
    }
}

impl fmt::Display for CmpValConst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*{} {} {}", self.ptr, self.pred, self.c)
    }
}

/// Sites that may change a guarded global, and the code after each
#[derive(Debug, Clone, Default)]
pub struct CondVarInfo {
    /// Stores to the global
    pub direct: BTreeSet<InstId>,
    /// Call sites through which some direct site may run
    pub indirect: BTreeSet<InstId>,
    /// Code that may run after each site, within its function and callees
    pub reachable: BTreeMap<InstId, CodeSet>,
}

impl CondVarInfo {
    fn compute(ctx: &AnalysisContext, ptr: ValueId) -> Self {
        let prog = &ctx.prog;
        let mut info = Self::default();
        let mut stack = Vec::new();
        for &user in prog.users(ptr) {
            if let InstKind::Store { ptr: p, .. } = prog.inst(user).kind {
                if p == ptr {
                    info.direct.insert(user);
                    stack.push(prog.func_of(user));
                }
            }
        }

        // Every transitive caller of a modifying function
        let mut funcs: BTreeSet<FuncId> = BTreeSet::new();
        while let Some(f) = stack.pop() {
            if !funcs.insert(f) {
                continue;
            }
            stack.extend(
                ctx.cg
                    .edges_to(f)
                    .iter()
                    .map(|e| e.caller)
                    .filter(|c| !funcs.contains(c)),
            );
        }
        for f in funcs {
            info.indirect.extend(valid_call_sites(ctx, f));
        }

        for &site in info.direct.iter().chain(info.indirect.iter()) {
            info.reachable.insert(site, code_within_function_scope(ctx, site));
        }
        info
    }

    /// Whether a modification may happen between `li1` and `li2` on one
    /// thread
    fn splits(&self, prog: &Program, li1: InstId, li2: InstId) -> bool {
        self.reachable
            .values()
            .any(|code| code.covers_inst(prog, li1) != code.covers_inst(prog, li2))
    }
}

/// Code after `site` in its function, plus every function called from it
fn code_within_function_scope(ctx: &AnalysisContext, site: InstId) -> CodeSet {
    let prog = &ctx.prog;
    let mut code = CodeSet::new();
    reachable_insts_and_blocks(prog, site, BlockingCodeInfo::empty(), &mut code);

    let mut stack: Vec<FuncId> = prog
        .func_insts(prog.func_of(site))
        .filter(|i| prog.is_call(*i) && code.covers_inst(prog, *i))
        .flat_map(|i| ctx.cg.edges_at(i).iter().map(|e| e.callee))
        .collect();
    while let Some(f) = stack.pop() {
        if code.has_func(f) {
            continue;
        }
        code.insert_func(f);
        for e in ctx.cg.edges_from(f) {
            if !code.has_func(e.callee) {
                stack.push(e.callee);
            }
        }
    }
    code
}

/// Exclusive guard filter
#[derive(Debug)]
pub struct PathRefinement<'a> {
    ctx: &'a AnalysisContext,
    oc: &'a OperationCollector,
    mhp: &'a MhpAnalysis,
    guards: GuardExtractor<CmpValConst>,
    cond_vars: BTreeMap<ValueId, CondVarInfo>,
}

impl<'a> PathRefinement<'a> {
    /// Filter over the given collected accesses and MHP results
    pub fn new(ctx: &'a AnalysisContext, oc: &'a OperationCollector, mhp: &'a MhpAnalysis) -> Self {
        Self {
            ctx,
            oc,
            mhp,
            guards: GuardExtractor::interprocedural(),
            cond_vars: BTreeMap::new(),
        }
    }

    /// Guards of `i`, caller guards included
    pub fn guards(&mut self, i: InstId) -> Vec<CmpValConst> {
        self.guards.inst_guards(self.ctx, i).to_vec()
    }

    /// Whether `i1` and `i2` cannot both run after any spawn site that may
    /// make them parallel, given the risky pairs still in `mp`
    pub fn path_refined(&mut self, mp: &MemoryPartitioning, i1: InstId, i2: InstId) -> bool {
        let guards1 = self.guards(i1);
        let guards2 = self.guards(i2);
        if i1 != i2 && self.have_exclusive_guard(mp, &guards1, &guards2) {
            return true;
        }

        for spawn in self.mhp.may_happen_in_parallel(self.ctx, i1, i2) {
            let spawn_guards = self.guards(spawn);
            if self.have_exclusive_guard(mp, &guards1, &spawn_guards) {
                continue;
            }
            if i1 == i2 || !self.have_exclusive_guard(mp, &guards2, &spawn_guards) {
                return false;
            }
        }
        true
    }

    fn have_exclusive_guard(
        &mut self,
        mp: &MemoryPartitioning,
        guards1: &[CmpValConst],
        guards2: &[CmpValConst],
    ) -> bool {
        for g1 in guards1 {
            for g2 in guards2 {
                if g1.excludes(g2) && !self.may_not_be_consistent(mp, g1.ptr, g1.val, g2.val) {
                    return true;
                }
            }
        }
        false
    }

    /// Whether loads `li1` and `li2` of `ptr` may read different values
    pub fn may_not_be_consistent(
        &mut self,
        mp: &MemoryPartitioning,
        ptr: ValueId,
        li1: InstId,
        li2: InstId,
    ) -> bool {
        let ctx = self.ctx;
        let info = self
            .cond_vars
            .entry(ptr)
            .or_insert_with(|| CondVarInfo::compute(ctx, ptr));
        if info.splits(&ctx.prog, li1, li2) {
            return true;
        }

        // A store on another thread still paired with either load
        let pts = ctx.pta.points_to(ptr);
        let Some(&obj) = pts.first() else {
            return true;
        };
        if pts.len() != 1 {
            return true;
        }
        let Some(part) = mp.part_of(obj) else {
            return true;
        };
        let risky = mp.risky(part);
        if risky.is_over_budget() {
            return true;
        }
        let mut partners = BTreeSet::new();
        for (a, b) in risky.pairs() {
            let (ia, ib) = (self.oc.access(a).inst, self.oc.access(b).inst);
            if ia == li1 || ia == li2 {
                partners.insert(ib);
            } else if ib == li1 || ib == li2 {
                partners.insert(ia);
            }
        }
        info.direct.iter().any(|m| partners.contains(m))
    }

    /// Number of globals whose modification sites were computed
    pub fn num_cond_vars(&self) -> usize {
        self.cond_vars.len()
    }
}
