// SPDX-License-Identifier: GPL-2.0
//! Branch conditions that must hold on every path to a block.
//!
//! A conditional branch guards a block when exactly one of its successors
//! dominates the block and the other successor does not merge back into
//! that dominator (the join block of an `if` without `else` is reached
//! either way). Only comparisons are understood; each analysis chooses its
//! own guard language through [`Guard`].
//!
//! In interprocedural mode the guards common to every call site of a
//! function are added to the guards of each of its blocks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::analysis::context::AnalysisContext;
use crate::ir::ids::{BlockId, FuncId, InstId, ValueId};
use crate::ir::inst::{InstKind, Predicate};
use crate::ir::program::Program;
use crate::ir::scev::strip_casts;

/// A condition language understood by [`GuardExtractor`]
pub trait Guard: Clone + PartialEq {
    /// Guard stating that branch condition `cond` evaluates to `hold`, if
    /// the condition is expressible
    fn from_branch(prog: &Program, cond: ValueId, hold: bool) -> Option<Self>;
}

/// `lhs pred rhs` over two arbitrary values
///
/// Operands are stored with casts stripped and ordered by value id, so the
/// same comparison written either way yields equal guards.
#[derive(Debug, Clone, Copy)]
pub struct SimpleCmpGuard {
    /// Comparison instruction the guard was read from
    pub inst: InstId,
    /// Smaller operand
    pub lhs: ValueId,
    /// Larger operand
    pub rhs: ValueId,
    /// Predicate that holds on the guarded paths
    pub pred: Predicate,
}

impl PartialEq for SimpleCmpGuard {
    fn eq(&self, other: &Self) -> bool {
        self.lhs == other.lhs && self.rhs == other.rhs && self.pred == other.pred
    }
}

impl Eq for SimpleCmpGuard {}

impl Guard for SimpleCmpGuard {
    fn from_branch(prog: &Program, cond: ValueId, hold: bool) -> Option<Self> {
        let inst = prog.def_inst(cond)?;
        let InstKind::Cmp { pred, lhs, rhs } = prog.inst(inst).kind else {
            return None;
        };
        let (lhs, rhs) = (strip_casts(prog, lhs), strip_casts(prog, rhs));
        let (lhs, rhs, pred) = if lhs < rhs {
            (lhs, rhs, pred)
        } else {
            (rhs, lhs, pred.mirror())
        };
        let pred = if hold { pred } else { pred.inverse() };
        Some(Self { inst, lhs, rhs, pred })
    }
}

impl fmt::Display for SimpleCmpGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.lhs, self.pred, self.rhs)
    }
}

/// Lazily computed guards of blocks
#[derive(Debug, Clone)]
pub struct GuardExtractor<G> {
    interprocedural: bool,
    by_block: BTreeMap<BlockId, Vec<G>>,
    by_func: BTreeMap<FuncId, Vec<G>>,
}

impl<G: Guard> GuardExtractor<G> {
    /// Extractor looking at one function at a time
    pub fn intraprocedural() -> Self {
        Self {
            interprocedural: false,
            by_block: BTreeMap::new(),
            by_func: BTreeMap::new(),
        }
    }

    /// Extractor that also inherits guards from call sites
    pub fn interprocedural() -> Self {
        Self {
            interprocedural: true,
            ..Self::intraprocedural()
        }
    }

    /// Whether caller guards are inherited
    pub fn is_interprocedural(&self) -> bool {
        self.interprocedural
    }

    /// Guards of the block of `i`
    pub fn inst_guards(&mut self, ctx: &AnalysisContext, i: InstId) -> &[G] {
        self.guards(ctx, ctx.prog.block_of(i))
    }

    /// Guards of block `b`
    pub fn guards(&mut self, ctx: &AnalysisContext, b: BlockId) -> &[G] {
        if !self.by_block.contains_key(&b) {
            let mut guards = intraprocedural_guards(ctx, b);
            if self.interprocedural {
                let f = ctx.prog.block(b).func;
                for g in self.external_guards(ctx, f) {
                    if !guards.contains(&g) {
                        guards.push(g);
                    }
                }
            }
            self.by_block.insert(b, guards);
        }
        self.by_block.get(&b).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Guards shared by the blocks of every call site of `f`
    fn external_guards(&mut self, ctx: &AnalysisContext, f: FuncId) -> Vec<G> {
        if let Some(guards) = self.by_func.get(&f) {
            return guards.clone();
        }
        // Recursive calls see no inherited guards while `f` is in progress.
        self.by_func.insert(f, Vec::new());

        let blocks: BTreeSet<BlockId> = valid_call_sites(ctx, f)
            .into_iter()
            .map(|cs| ctx.prog.block_of(cs))
            .collect();
        let mut common: Option<Vec<G>> = None;
        for bb in blocks {
            let guards = self.guards(ctx, bb).to_vec();
            common = Some(match common {
                None => guards,
                Some(mut acc) => {
                    acc.retain(|g| guards.contains(g));
                    acc
                }
            });
        }
        let common = common.unwrap_or_default();
        self.by_func.insert(f, common.clone());
        common
    }

    /// Whether every guard of `b2` is also a guard of `b1`, that is the
    /// conditions reaching `b1` imply those reaching `b2`
    pub fn subsumes(&mut self, ctx: &AnalysisContext, b1: BlockId, b2: BlockId) -> bool {
        if b1 == b2 {
            return true;
        }
        let guards1 = self.guards(ctx, b1).to_vec();
        self.guards(ctx, b2).iter().all(|g| guards1.contains(g))
    }

    /// Number of blocks whose guards were computed
    pub fn len(&self) -> usize {
        self.by_block.len()
    }

    /// Whether no block was looked at yet
    pub fn is_empty(&self) -> bool {
        self.by_block.is_empty()
    }
}

/// Call sites, not spawn sites, in live callers that may invoke `f`
pub fn valid_call_sites(ctx: &AnalysisContext, f: FuncId) -> BTreeSet<InstId> {
    ctx.cg
        .edges_to(f)
        .iter()
        .filter(|e| !e.fork && ctx.cg.is_live(e.caller))
        .map(|e| e.site)
        .collect()
}

/// Blocks from which `dst` is reachable, `dst` included
pub fn backward_reachable_blocks(prog: &Program, dst: BlockId) -> BTreeSet<BlockId> {
    let mut seen = BTreeSet::new();
    let mut stack = vec![dst];
    while let Some(b) = stack.pop() {
        if !seen.insert(b) {
            continue;
        }
        stack.extend(prog.block(b).preds.iter().filter(|p| !seen.contains(p)));
    }
    seen
}

fn intraprocedural_guards<G: Guard>(ctx: &AnalysisContext, dst: BlockId) -> Vec<G> {
    let prog = &ctx.prog;
    let f = prog.block(dst).func;
    let Some(root) = prog.func(f).entry() else {
        return Vec::new();
    };
    let passes = ctx.passes(f);
    let dom = &passes.dom;
    if !dom.strictly_dominates(root, dst) {
        return Vec::new();
    }

    let backward = backward_reachable_blocks(prog, dst);
    let mut guards = Vec::new();
    let mut visited = BTreeSet::new();
    let mut stack = vec![root];
    while let Some(bb) = stack.pop() {
        if !backward.contains(&bb) || !visited.insert(bb) {
            continue;
        }
        let block = prog.block(bb);
        stack.extend(
            block
                .succs
                .iter()
                .filter(|s| backward.contains(s) && !visited.contains(s)),
        );

        let Some(term) = block.terminator() else {
            continue;
        };
        let InstKind::CondBr {
            cond,
            then_bb,
            else_bb,
        } = prog.inst(term).kind
        else {
            continue;
        };
        let then_dominates = dom.dominates(then_bb, dst);
        if then_dominates == dom.dominates(else_bb, dst) {
            continue;
        }
        let (dominator, other) = if then_dominates {
            (then_bb, else_bb)
        } else {
            (else_bb, then_bb)
        };
        if passes.frontier.contains(other, dominator) {
            continue;
        }
        if let Some(g) = G::from_branch(prog, cond, then_dominates) {
            guards.push(g);
        }
    }
    guards
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::core::config::DetectorConfig;
    use crate::ir::builder::ProgramBuilder;

    struct Fixture {
        ctx: AnalysisContext,
        entry_store: InstId,
        guarded: InstId,
        joined: InstId,
        early_exit: InstId,
    }

    /// `main`: `if (x < 3) { store; } store;` then `if (x == 7) return;`
    fn branchy_program() -> Fixture {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let x = pb.global("x", 0);
        let main = pb.declare("main", 0);
        let mut fb = pb.body(main);
        let then_bb = fb.new_block();
        let join_bb = fb.new_block();
        let exit_bb = fb.new_block();
        let tail_bb = fb.new_block();

        let zero = fb.const_int(0);
        let entry_store = fb.store(g, zero);
        let v = fb.load(x);
        let three = fb.const_int(3);
        let c = fb.cmp(Predicate::Slt, v, three);
        fb.cond_br(c, then_bb, join_bb);

        fb.position_at(then_bb);
        let guarded = fb.store(g, zero);
        fb.br(join_bb);

        fb.position_at(join_bb);
        let joined = fb.store(g, zero);
        let seven = fb.const_int(7);
        let c2 = fb.cmp(Predicate::Eq, seven, v);
        fb.cond_br(c2, exit_bb, tail_bb);

        fb.position_at(exit_bb);
        fb.ret(None);

        fb.position_at(tail_bb);
        let early_exit = fb.store(g, zero);
        fb.br(exit_bb);
        drop(fb);

        let prog = pb.finish().unwrap();
        let ctx = AnalysisContext::new(prog, DetectorConfig::default()).unwrap();
        Fixture {
            ctx,
            entry_store,
            guarded,
            joined,
            early_exit,
        }
    }

    #[test]
    fn test_then_branch_is_guarded() {
        let fx = branchy_program();
        let mut ge: GuardExtractor<SimpleCmpGuard> = GuardExtractor::intraprocedural();
        assert!(ge.inst_guards(&fx.ctx, fx.entry_store).is_empty());
        let guards = ge.inst_guards(&fx.ctx, fx.guarded).to_vec();
        assert_eq!(guards.len(), 1);
        assert_eq!(guards[0].pred, Predicate::Slt);
    }

    #[test]
    fn test_if_without_else_join_is_unguarded() {
        let fx = branchy_program();
        let mut ge: GuardExtractor<SimpleCmpGuard> = GuardExtractor::intraprocedural();
        assert!(ge.inst_guards(&fx.ctx, fx.joined).is_empty());
    }

    #[test]
    fn test_false_branch_inverts_and_orders_operands() {
        let fx = branchy_program();
        let mut ge: GuardExtractor<SimpleCmpGuard> = GuardExtractor::intraprocedural();
        let guards = ge.inst_guards(&fx.ctx, fx.early_exit).to_vec();
        assert_eq!(guards.len(), 1);
        let g = guards[0];
        assert!(g.lhs < g.rhs);
        assert_eq!(g.pred, Predicate::Ne);
    }

    #[test]
    fn test_subsumption() {
        let fx = branchy_program();
        let prog = &fx.ctx.prog;
        let mut ge: GuardExtractor<SimpleCmpGuard> = GuardExtractor::intraprocedural();
        let guarded = prog.block_of(fx.guarded);
        let entry = prog.block_of(fx.entry_store);
        let tail = prog.block_of(fx.early_exit);
        assert!(ge.subsumes(&fx.ctx, guarded, entry));
        assert!(!ge.subsumes(&fx.ctx, entry, guarded));
        assert!(!ge.subsumes(&fx.ctx, guarded, tail));
        assert!(ge.subsumes(&fx.ctx, tail, tail));
    }
}
