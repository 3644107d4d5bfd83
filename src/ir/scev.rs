// SPDX-License-Identifier: GPL-2.0
//! Symbolic loop-bound oracle.
//!
//! Recognizes the canonical induction pattern
//! `iv = phi [start, preheader], [iv + step, latch]` and the exit comparison
//! of a loop. Only the questions asked by thread join matching are answered:
//! the start and step of an induction-derived value, and whether two loops
//! run the same number of iterations.

use std::fmt;

use crate::ir::ids::{BlockId, InstId, ValueId};
use crate::ir::inst::{BinOp, InstKind, Predicate, ValueKind};
use crate::ir::loops::{LoopId, LoopInfo};
use crate::ir::program::Program;

/// A symbolic start or step value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymVal {
    /// Known constant
    Const(i64),
    /// Loop-invariant value
    Value(ValueId),
}

/// An add-recurrence `{start, +, step}` over the loop with `header`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddRec {
    /// Header of the loop the recurrence belongs to
    pub header: BlockId,
    /// Value in the first iteration
    pub start: SymVal,
    /// Increment per iteration
    pub step: SymVal,
}

/// The exit condition of a loop, normalized to `indvar pred bound`
/// holding while the loop continues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundCond {
    /// The comparison instruction
    pub cmp: InstId,
    /// Canonical induction variable
    pub indvar: ValueId,
    /// Loop bound
    pub bound: ValueId,
    /// Predicate
    pub pred: Predicate,
}

/// Symbolic iteration count of a loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TripCount {
    /// Induction variable recurrence
    pub rec: AddRec,
    /// Continue condition
    pub cond: BoundCond,
}

/// Queries answered by a symbolic loop-bound analysis
pub trait LoopBoundOracle: fmt::Debug {
    /// Recurrence of `v`, if it is an affine function of an induction variable
    fn add_rec(&self, prog: &Program, loops: &LoopInfo, v: ValueId) -> Option<AddRec>;

    /// The exit condition of loop `l` through exiting block `exiting`
    fn bound_cond(
        &self,
        prog: &Program,
        loops: &LoopInfo,
        l: LoopId,
        exiting: BlockId,
    ) -> Option<BoundCond>;

    /// Whether two values are structurally equal bounds
    fn same_bound(&self, prog: &Program, a: ValueId, b: ValueId) -> bool;

    /// Whether two recurrences have equal start and step
    fn same_start_and_step(&self, prog: &Program, a: &AddRec, b: &AddRec) -> bool {
        sym_eq(self, prog, a.start, b.start) && sym_eq(self, prog, a.step, b.step)
    }

    /// Whether two bound conditions are equal up to signedness
    fn same_bound_cond(&self, prog: &Program, a: &BoundCond, b: &BoundCond) -> bool {
        a.pred.sign_insensitive_eq(b.pred) && self.same_bound(prog, a.bound, b.bound)
    }

    /// Iteration count of loop `l` leaving through `exiting`
    fn trip_count(
        &self,
        prog: &Program,
        loops: &LoopInfo,
        l: LoopId,
        exiting: BlockId,
    ) -> Option<TripCount> {
        let cond = self.bound_cond(prog, loops, l, exiting)?;
        let rec = self.add_rec(prog, loops, cond.indvar)?;
        Some(TripCount { rec, cond })
    }

    /// Whether two trip counts are provably equal
    fn same_trip_count(&self, prog: &Program, a: &TripCount, b: &TripCount) -> bool {
        self.same_start_and_step(prog, &a.rec, &b.rec) && self.same_bound_cond(prog, &a.cond, &b.cond)
    }
}

fn sym_eq<O: LoopBoundOracle + ?Sized>(oracle: &O, prog: &Program, a: SymVal, b: SymVal) -> bool {
    match (a, b) {
        (SymVal::Const(x), SymVal::Const(y)) => x == y,
        (SymVal::Value(x), SymVal::Value(y)) => oracle.same_bound(prog, x, y),
        _ => false,
    }
}

/// Oracle recognizing phi-based induction variables
#[derive(Debug, Clone, Copy, Default)]
pub struct InductionOracle;

impl InductionOracle {
    /// Create the oracle
    pub fn new() -> Self {
        Self
    }

    fn sym(prog: &Program, v: ValueId) -> SymVal {
        let v = strip_casts(prog, v);
        match prog.const_value(v) {
            Some(c) => SymVal::Const(c),
            None => SymVal::Value(v),
        }
    }

    /// Recurrence of a header phi
    fn phi_rec(prog: &Program, loops: &LoopInfo, phi: InstId) -> Option<AddRec> {
        let inst = prog.inst(phi);
        let InstKind::Phi { incoming } = &inst.kind else {
            return None;
        };
        let l = loops.loop_of(inst.block)?;
        let lp = loops.get(l);
        if lp.header != inst.block || incoming.len() != 2 {
            return None;
        }
        let phi_val = inst.result?;
        let (mut start, mut next) = (None, None);
        for (v, from) in incoming {
            if lp.contains(*from) {
                next = Some(*v);
            } else {
                start = Some(*v);
            }
        }
        let (start, next) = (start?, next?);
        let next_inst = prog.def_inst(strip_casts(prog, next))?;
        let step = match &prog.inst(next_inst).kind {
            InstKind::BinOp {
                op: BinOp::Add,
                lhs,
                rhs,
            } => {
                if strip_casts(prog, *lhs) == phi_val {
                    *rhs
                } else if strip_casts(prog, *rhs) == phi_val {
                    *lhs
                } else {
                    return None;
                }
            }
            InstKind::BinOp {
                op: BinOp::Sub,
                lhs,
                rhs,
            } if strip_casts(prog, *lhs) == phi_val => {
                let c = prog.const_value(*rhs)?;
                return Some(AddRec {
                    header: lp.header,
                    start: Self::sym(prog, start),
                    step: SymVal::Const(-c),
                });
            }
            _ => return None,
        };
        Some(AddRec {
            header: lp.header,
            start: Self::sym(prog, start),
            step: Self::sym(prog, step),
        })
    }
}

impl LoopBoundOracle for InductionOracle {
    fn add_rec(&self, prog: &Program, loops: &LoopInfo, v: ValueId) -> Option<AddRec> {
        let v = strip_casts(prog, v);
        let def = prog.def_inst(v)?;
        match &prog.inst(def).kind {
            InstKind::Phi { .. } => Self::phi_rec(prog, loops, def),
            InstKind::BinOp { op, lhs, rhs } => {
                // `rec + c` and `rec * c` with constant c.
                let (rec, c) = match (self.add_rec(prog, loops, *lhs), prog.const_value(*rhs)) {
                    (Some(r), Some(c)) => (r, c),
                    _ => match (self.add_rec(prog, loops, *rhs), prog.const_value(*lhs)) {
                        (Some(r), Some(c)) if *op != BinOp::Sub => (r, c),
                        _ => return None,
                    },
                };
                match (op, rec.start, rec.step) {
                    (BinOp::Add, SymVal::Const(s), step) => Some(AddRec {
                        start: SymVal::Const(s + c),
                        step,
                        ..rec
                    }),
                    (BinOp::Sub, SymVal::Const(s), step) => Some(AddRec {
                        start: SymVal::Const(s - c),
                        step,
                        ..rec
                    }),
                    (BinOp::Mul, SymVal::Const(s), SymVal::Const(st)) => Some(AddRec {
                        start: SymVal::Const(s * c),
                        step: SymVal::Const(st * c),
                        ..rec
                    }),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    fn bound_cond(
        &self,
        prog: &Program,
        loops: &LoopInfo,
        l: LoopId,
        exiting: BlockId,
    ) -> Option<BoundCond> {
        let lp = loops.get(l);
        let term = prog.block(exiting).terminator()?;
        let InstKind::CondBr {
            cond,
            then_bb: _,
            else_bb,
        } = &prog.inst(term).kind
        else {
            return None;
        };
        let cmp = prog.def_inst(*cond)?;
        let InstKind::Cmp { pred, lhs, rhs } = &prog.inst(cmp).kind else {
            return None;
        };
        let (lhs, rhs) = (strip_casts(prog, *lhs), strip_casts(prog, *rhs));
        let is_indvar = |v: ValueId| {
            self.add_rec(prog, loops, v)
                .map(|r| r.header == lp.header)
                .unwrap_or(false)
                && prog
                    .def_inst(v)
                    .map(|i| matches!(prog.inst(i).kind, InstKind::Phi { .. }))
                    .unwrap_or(false)
        };
        let (indvar, bound, mut pred) = if is_indvar(lhs) {
            (lhs, rhs, *pred)
        } else if is_indvar(rhs) {
            (rhs, lhs, pred.mirror())
        } else {
            return None;
        };
        if lp.contains(*else_bb) {
            pred = pred.inverse();
        }
        Some(BoundCond {
            cmp,
            indvar,
            bound,
            pred,
        })
    }

    fn same_bound(&self, prog: &Program, a: ValueId, b: ValueId) -> bool {
        let (a, b) = (strip_casts(prog, a), strip_casts(prog, b));
        if a == b {
            return true;
        }
        match (&prog.value(a).kind, &prog.value(b).kind) {
            (ValueKind::Const(x), ValueKind::Const(y)) => x == y,
            (ValueKind::Inst(ia), ValueKind::Inst(ib)) => {
                let (ka, kb) = (&prog.inst(*ia).kind, &prog.inst(*ib).kind);
                let same_op = match (ka, kb) {
                    (InstKind::Load { .. }, InstKind::Load { .. }) => true,
                    (InstKind::BinOp { op: x, .. }, InstKind::BinOp { op: y, .. }) => x == y,
                    (
                        InstKind::Gep { offset: x, .. },
                        InstKind::Gep { offset: y, .. },
                    ) => x == y,
                    _ => false,
                };
                if !same_op {
                    return false;
                }
                let (oa, ob) = (ka.operands(), kb.operands());
                oa.len() == ob.len()
                    && oa.iter().zip(ob.iter()).all(|(x, y)| self.same_bound(prog, *x, *y))
            }
            _ => false,
        }
    }
}

/// Strip every cast around a value
pub fn strip_casts(prog: &Program, mut v: ValueId) -> ValueId {
    while let Some(i) = prog.def_inst(v) {
        match prog.inst(i).kind {
            InstKind::Cast { src } => v = src,
            _ => break,
        }
    }
    v
}

/// Strip every field projection and cast around a pointer
pub fn base_pointer(prog: &Program, mut v: ValueId) -> ValueId {
    while let Some(i) = prog.def_inst(v) {
        match prog.inst(i).kind {
            InstKind::Cast { src } => v = src,
            InstKind::Gep { base, .. } => v = base,
            _ => break,
        }
    }
    v
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::ir::builder::{FunctionBuilder, ProgramBuilder};
    use crate::ir::dom::DomTree;
    use crate::ir::ids::FuncId;

    struct CountingLoop {
        header: BlockId,
        iv: ValueId,
        scaled: ValueId,
    }

    /// `for (i = 0; i < bound; i++) scaled = i * 2 + 1;` starting at the
    /// current block and leaving the builder at the loop exit. With
    /// `exit_first` the header branches to the exit on `i >= bound`.
    fn add_loop(fb: &mut FunctionBuilder<'_>, bound: i64, exit_first: bool) -> CountingLoop {
        let preheader = fb.current_block();
        let header = fb.new_block();
        let body = fb.new_block();
        let exit = fb.new_block();
        let zero = fb.const_int(0);
        let n = fb.const_int(bound);
        fb.br(header);

        fb.position_at(header);
        let iv = fb.phi(vec![(zero, preheader)]);
        if exit_first {
            let c = fb.cmp(Predicate::Sge, iv, n);
            fb.cond_br(c, exit, body);
        } else {
            let c = fb.cmp(Predicate::Slt, iv, n);
            fb.cond_br(c, body, exit);
        }

        fb.position_at(body);
        let one = fb.const_int(1);
        let two = fb.const_int(2);
        let doubled = fb.binop(BinOp::Mul, iv, two);
        let scaled = fb.binop(BinOp::Add, doubled, one);
        let next = fb.binop(BinOp::Add, iv, one);
        fb.add_incoming(iv, next, body);
        fb.br(header);

        fb.position_at(exit);
        CountingLoop { header, iv, scaled }
    }

    fn build(bounds: &[(i64, bool)]) -> (Program, FuncId, Vec<CountingLoop>) {
        let mut pb = ProgramBuilder::new();
        let f = pb.declare("main", 0);
        let loops = {
            let mut fb = pb.body(f);
            let loops: Vec<CountingLoop> = bounds.iter().map(|&(b, e)| add_loop(&mut fb, b, e)).collect();
            fb.ret(None);
            loops
        };
        (pb.finish().unwrap(), f, loops)
    }

    fn loop_info(prog: &Program, f: FuncId) -> LoopInfo {
        LoopInfo::compute(prog, f, &DomTree::dominators(prog, f))
    }

    fn trip_count_of(prog: &Program, loops: &LoopInfo, header: BlockId) -> TripCount {
        let l = loops.loop_of(header).unwrap();
        InductionOracle::new().trip_count(prog, loops, l, header).unwrap()
    }

    #[test]
    fn test_induction_start_and_step() {
        let (prog, f, cl) = build(&[(4, false)]);
        let loops = loop_info(&prog, f);
        let oracle = InductionOracle::new();

        let iv = oracle.add_rec(&prog, &loops, cl[0].iv).unwrap();
        assert_eq!(iv.header, cl[0].header);
        assert_eq!((iv.start, iv.step), (SymVal::Const(0), SymVal::Const(1)));

        let scaled = oracle.add_rec(&prog, &loops, cl[0].scaled).unwrap();
        assert_eq!((scaled.start, scaled.step), (SymVal::Const(1), SymVal::Const(2)));
        assert!(!oracle.same_start_and_step(&prog, &iv, &scaled));
    }

    #[test]
    fn test_trip_count_normalizes_exit_branch() {
        for exit_first in [false, true] {
            let (prog, f, cl) = build(&[(4, exit_first)]);
            let loops = loop_info(&prog, f);
            let tc = trip_count_of(&prog, &loops, cl[0].header);
            assert_eq!(tc.cond.indvar, cl[0].iv);
            assert_eq!(tc.cond.pred, Predicate::Slt);
            assert_eq!(prog.const_value(tc.cond.bound), Some(4));
            assert_eq!((tc.rec.start, tc.rec.step), (SymVal::Const(0), SymVal::Const(1)));
        }
    }

    #[test]
    fn test_same_trip_count() {
        let oracle = InductionOracle::new();

        let (prog, f, cl) = build(&[(4, false), (4, true)]);
        let loops = loop_info(&prog, f);
        let (a, b) = (
            trip_count_of(&prog, &loops, cl[0].header),
            trip_count_of(&prog, &loops, cl[1].header),
        );
        assert!(oracle.same_trip_count(&prog, &a, &b));

        let (prog, f, cl) = build(&[(4, false), (2, false)]);
        let loops = loop_info(&prog, f);
        let (a, b) = (
            trip_count_of(&prog, &loops, cl[0].header),
            trip_count_of(&prog, &loops, cl[1].header),
        );
        assert!(!oracle.same_trip_count(&prog, &a, &b));
    }

    #[test]
    fn test_non_induction_value_has_no_recurrence() {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let f = pb.declare("main", 0);
        let v = {
            let mut fb = pb.body(f);
            let v = fb.load(g);
            fb.ret(None);
            v
        };
        let prog = pb.finish().unwrap();
        let loops = loop_info(&prog, f);
        assert!(InductionOracle::new().add_rec(&prog, &loops, v).is_none());
    }
}
