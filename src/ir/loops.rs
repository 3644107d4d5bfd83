// SPDX-License-Identifier: GPL-2.0
//! Natural loop detection.
//!
//! A back edge is an edge whose target dominates its source. Each loop is the
//! union of the natural loops of all back edges sharing a header.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::dom::DomTree;
use crate::ir::ids::{BlockId, FuncId, InstId};
use crate::ir::program::Program;

/// Index of a loop inside one [`LoopInfo`]
pub type LoopId = usize;

/// A natural loop
#[derive(Debug, Clone)]
pub struct Loop {
    /// Loop header
    pub header: BlockId,
    /// Blocks of the loop, header included
    pub blocks: BTreeSet<BlockId>,
    /// In-loop predecessors of the header
    pub latches: Vec<BlockId>,
    /// Out-of-loop successors of loop blocks
    pub exits: Vec<BlockId>,
    /// The unique out-of-loop predecessor of the header
    pub preheader: Option<BlockId>,
    /// Enclosing loop
    pub parent: Option<LoopId>,
    /// Nesting depth, 1 for outermost loops
    pub depth: u32,
}

impl Loop {
    /// Whether `b` belongs to the loop
    pub fn contains(&self, b: BlockId) -> bool {
        self.blocks.contains(&b)
    }

    /// The unique exit block, if any
    pub fn unique_exit(&self) -> Option<BlockId> {
        match self.exits.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }

    /// `(exiting, exit)` edges leaving the loop, in block order
    pub fn exit_edges(&self, prog: &Program) -> Vec<(BlockId, BlockId)> {
        let mut edges = Vec::new();
        for b in &self.blocks {
            for s in &prog.block(*b).succs {
                if !self.contains(*s) {
                    edges.push((*b, *s));
                }
            }
        }
        edges
    }

    /// The unique in-loop predecessor of the header
    pub fn unique_latch(&self) -> Option<BlockId> {
        match self.latches.as_slice() {
            [only] => Some(*only),
            _ => None,
        }
    }
}

/// All loops of one function
#[derive(Debug, Clone, Default)]
pub struct LoopInfo {
    loops: Vec<Loop>,
    innermost: BTreeMap<BlockId, LoopId>,
}

impl LoopInfo {
    /// Detect loops of `f`
    pub fn compute(prog: &Program, f: FuncId, dt: &DomTree) -> Self {
        let mut by_header: BTreeMap<BlockId, (BTreeSet<BlockId>, Vec<BlockId>)> = BTreeMap::new();
        for b in &prog.func(f).blocks {
            if !dt.is_reachable(*b) {
                continue;
            }
            for s in &prog.block(*b).succs {
                if !dt.dominates(*s, *b) {
                    continue;
                }
                // Natural loop of back edge b -> s.
                let entry = by_header.entry(*s).or_default();
                entry.1.push(*b);
                entry.0.insert(*s);
                let mut stack = vec![*b];
                while let Some(x) = stack.pop() {
                    if !entry.0.insert(x) {
                        continue;
                    }
                    for p in &prog.block(x).preds {
                        if dt.is_reachable(*p) {
                            stack.push(*p);
                        }
                    }
                }
            }
        }

        let mut loops: Vec<Loop> = by_header
            .into_iter()
            .map(|(header, (blocks, latches))| {
                let mut exits = Vec::new();
                for b in &blocks {
                    for s in &prog.block(*b).succs {
                        if !blocks.contains(s) && !exits.contains(s) {
                            exits.push(*s);
                        }
                    }
                }
                let outside: Vec<BlockId> = prog
                    .block(header)
                    .preds
                    .iter()
                    .copied()
                    .filter(|p| !blocks.contains(p))
                    .collect();
                let preheader = match outside.as_slice() {
                    [only] => Some(*only),
                    _ => None,
                };
                Loop {
                    header,
                    blocks,
                    latches,
                    exits,
                    preheader,
                    parent: None,
                    depth: 1,
                }
            })
            .collect();

        // Parent = smallest other loop containing the header.
        for i in 0..loops.len() {
            let header = loops[i].header;
            let size = loops[i].blocks.len();
            let parent = (0..loops.len())
                .filter(|j| *j != i && loops[*j].contains(header) && loops[*j].blocks.len() > size)
                .min_by_key(|j| loops[*j].blocks.len());
            loops[i].parent = parent;
        }
        for i in 0..loops.len() {
            let mut depth = 1;
            let mut cur = loops[i].parent;
            while let Some(p) = cur {
                depth += 1;
                cur = loops[p].parent;
            }
            loops[i].depth = depth;
        }

        let mut innermost: BTreeMap<BlockId, LoopId> = BTreeMap::new();
        for (id, l) in loops.iter().enumerate() {
            for b in &l.blocks {
                let replace = match innermost.get(b) {
                    Some(cur) => loops[*cur].blocks.len() > l.blocks.len(),
                    None => true,
                };
                if replace {
                    innermost.insert(*b, id);
                }
            }
        }

        LoopInfo { loops, innermost }
    }

    /// Loop by id
    pub fn get(&self, id: LoopId) -> &Loop {
        &self.loops[id]
    }

    /// All loops
    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    /// Innermost loop containing `b`
    pub fn loop_of(&self, b: BlockId) -> Option<LoopId> {
        self.innermost.get(&b).copied()
    }

    /// Innermost loop containing instruction `i`
    pub fn loop_of_inst(&self, prog: &Program, i: InstId) -> Option<LoopId> {
        self.loop_of(prog.block_of(i))
    }

    /// Whether `b` is a loop header
    pub fn is_header(&self, b: BlockId) -> bool {
        self.loops.iter().any(|l| l.header == b)
    }

    /// Whether the block is inside any loop
    pub fn in_loop(&self, b: BlockId) -> bool {
        self.innermost.contains_key(&b)
    }
}
