// SPDX-License-Identifier: GPL-2.0
//! Code sets at mixed granularity.
//!
//! Reachable code is recorded as whole functions where possible, whole
//! blocks where a function is only partly reachable, and single
//! instructions where a block is cut by a join.

use std::collections::BTreeSet;
use std::fmt;

use crate::ir::ids::{BlockId, FuncId, InstId};
use crate::ir::program::Program;

/// Functions, blocks and instructions
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeSet {
    funcs: BTreeSet<FuncId>,
    blocks: BTreeSet<BlockId>,
    insts: BTreeSet<InstId>,
}

impl CodeSet {
    /// Empty code set
    pub const fn new() -> Self {
        Self {
            funcs: BTreeSet::new(),
            blocks: BTreeSet::new(),
            insts: BTreeSet::new(),
        }
    }

    /// Add a whole function
    pub fn insert_func(&mut self, f: FuncId) {
        self.funcs.insert(f);
    }

    /// Add a whole block
    pub fn insert_block(&mut self, b: BlockId) {
        self.blocks.insert(b);
    }

    /// Add one instruction
    pub fn insert_inst(&mut self, i: InstId) {
        self.insts.insert(i);
    }

    /// Whether `f` was added as a whole
    pub fn has_func(&self, f: FuncId) -> bool {
        self.funcs.contains(&f)
    }

    /// Whether `b` was added as a whole
    pub fn has_block(&self, b: BlockId) -> bool {
        self.blocks.contains(&b)
    }

    /// Whether `i` was added on its own
    pub fn has_inst(&self, i: InstId) -> bool {
        self.insts.contains(&i)
    }

    /// Whether `i` is inside the set at any granularity
    pub fn covers_inst(&self, prog: &Program, i: InstId) -> bool {
        let inst = prog.inst(i);
        self.funcs.contains(&inst.func) || self.blocks.contains(&inst.block) || self.insts.contains(&i)
    }

    /// Whether block `b` is inside the set as a whole
    pub fn covers_block(&self, prog: &Program, b: BlockId) -> bool {
        self.funcs.contains(&prog.block(b).func) || self.blocks.contains(&b)
    }

    /// Whether nothing was added
    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty() && self.blocks.is_empty() && self.insts.is_empty()
    }

    /// Whole functions
    pub fn funcs(&self) -> &BTreeSet<FuncId> {
        &self.funcs
    }

    /// Whole blocks
    pub fn blocks(&self) -> &BTreeSet<BlockId> {
        &self.blocks
    }

    /// Single instructions
    pub fn insts(&self) -> &BTreeSet<InstId> {
        &self.insts
    }

    /// Drop entries already covered at a coarser granularity
    pub fn remove_redundancy(&mut self, prog: &Program) {
        let blocks = &self.blocks;
        let funcs = &self.funcs;
        self.insts.retain(|i| {
            let inst = prog.inst(*i);
            !blocks.contains(&inst.block) && !funcs.contains(&inst.func)
        });
        self.blocks.retain(|b| !funcs.contains(&prog.block(*b).func));
    }
}

/// How a program point relates to a spawn site
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ReachableType {
    /// Not reachable
    Not,
    /// Reachable on the spawning thread
    Trunk,
    /// Reachable on the spawned thread
    Branch,
}

impl ReachableType {
    /// Whether two points of the same spawn site may run in parallel:
    /// one on each side of the fork.
    pub fn may_run_in_parallel(self, other: ReachableType) -> bool {
        matches!(
            (self, other),
            (ReachableType::Trunk, ReachableType::Branch) | (ReachableType::Branch, ReachableType::Trunk)
        )
    }
}

impl fmt::Display for ReachableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReachableType::Not => "not",
            ReachableType::Trunk => "trunk",
            ReachableType::Branch => "branch",
        })
    }
}

/// A spawn site reaching a program point
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReachablePoint {
    /// Spawn or parallel loop site
    pub spawn: InstId,
    /// Side of the fork
    pub ty: ReachableType,
}

impl ReachablePoint {
    /// Create a point
    pub fn new(spawn: InstId, ty: ReachableType) -> Self {
        Self { spawn, ty }
    }
}

/// Code reachable from one spawn site, per side of the fork
#[derive(Debug, Clone, Default)]
pub struct SpawnSiteReachableCode {
    /// Reachability through a recursive SCC is approximate
    pub recursive: bool,
    /// Reachable on the spawning thread
    pub trunk: CodeSet,
    /// Reachable on the spawned thread
    pub branch: CodeSet,
}

impl SpawnSiteReachableCode {
    /// Whether `i` runs on the spawning thread after the spawn
    pub fn is_trunk_reachable(&self, prog: &Program, i: InstId) -> bool {
        self.trunk.covers_inst(prog, i)
    }

    /// Whether `i` runs on the spawned thread
    pub fn is_branch_reachable(&self, prog: &Program, i: InstId) -> bool {
        self.branch.covers_inst(prog, i)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::ir::builder::ProgramBuilder;

    #[test]
    fn test_covers_and_redundancy() {
        let mut pb = ProgramBuilder::new();
        let f = pb.declare("f", 0);
        let g = pb.global("g", 0);
        let (entry, load) = {
            let mut fb = pb.body(f);
            let entry = fb.current_block();
            let v = fb.load(g);
            fb.ret(None);
            (entry, fb.def(v))
        };
        let prog = pb.finish().unwrap();

        let mut cs = CodeSet::new();
        cs.insert_inst(load);
        assert!(cs.covers_inst(&prog, load));
        assert!(!cs.covers_block(&prog, entry));
        cs.insert_block(entry);
        cs.insert_func(f);
        cs.remove_redundancy(&prog);
        assert!(cs.insts().is_empty());
        assert!(cs.blocks().is_empty());
        assert!(cs.covers_inst(&prog, load));
    }

    #[test]
    fn test_parallel_types() {
        use ReachableType::*;
        assert!(Trunk.may_run_in_parallel(Branch));
        assert!(Branch.may_run_in_parallel(Trunk));
        assert!(!Trunk.may_run_in_parallel(Trunk));
        assert!(!Branch.may_run_in_parallel(Branch));
        assert!(!Not.may_run_in_parallel(Branch));
    }
}
