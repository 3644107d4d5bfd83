// SPDX-License-Identifier: GPL-2.0
//! Dominator and post-dominator trees, dominance frontiers.
//!
//! Trees are computed per function with the iterative algorithm of Cooper,
//! Harvey and Kennedy over the reverse postorder of the block graph. The
//! post-dominator tree is rooted at a virtual exit joined to every block
//! without successors.

use std::collections::{BTreeMap, BTreeSet};

use crate::ir::ids::{BlockId, FuncId, InstId};
use crate::ir::program::Program;

/// A dominator (or post-dominator) tree over the blocks of one function
#[derive(Debug, Clone, Default)]
pub struct DomTree {
    blocks: Vec<BlockId>,
    index: BTreeMap<BlockId, usize>,
    /// Immediate dominator by local index; `None` for roots and unreachable blocks
    idom: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    reachable: Vec<bool>,
    depth: Vec<usize>,
    post: bool,
}

impl DomTree {
    /// Dominator tree of `f`
    pub fn dominators(prog: &Program, f: FuncId) -> Self {
        Self::build(prog, f, false)
    }

    /// Post-dominator tree of `f`
    pub fn post_dominators(prog: &Program, f: FuncId) -> Self {
        Self::build(prog, f, true)
    }

    fn build(prog: &Program, f: FuncId, post: bool) -> Self {
        let blocks = prog.func(f).blocks.clone();
        let n = blocks.len();
        let index: BTreeMap<BlockId, usize> =
            blocks.iter().enumerate().map(|(i, b)| (*b, i)).collect();
        let local = |bs: &[BlockId]| -> Vec<usize> {
            bs.iter().filter_map(|b| index.get(b).copied()).collect()
        };

        // Graph in analysis direction, with node `n` as virtual root.
        let mut succs: Vec<Vec<usize>> = vec![Vec::new(); n + 1];
        let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n + 1];
        for (i, b) in blocks.iter().enumerate() {
            let bb = prog.block(*b);
            let fwd = if post { local(&bb.preds) } else { local(&bb.succs) };
            succs[i] = fwd;
        }
        if post {
            for (i, b) in blocks.iter().enumerate() {
                if prog.block(*b).succs.is_empty() {
                    succs[n].push(i);
                }
            }
        } else if n > 0 {
            succs[n].push(0);
        }
        for (u, vs) in succs.iter().enumerate() {
            for v in vs {
                preds[*v].push(u);
            }
        }

        // Reverse postorder from the virtual root.
        let mut postorder = Vec::with_capacity(n + 1);
        let mut visited = vec![false; n + 1];
        let mut stack = vec![(n, 0usize)];
        visited[n] = true;
        while let Some((node, next)) = stack.pop() {
            if next < succs[node].len() {
                stack.push((node, next + 1));
                let s = succs[node][next];
                if !visited[s] {
                    visited[s] = true;
                    stack.push((s, 0));
                }
            } else {
                postorder.push(node);
            }
        }
        let mut po_num = vec![usize::MAX; n + 1];
        for (i, node) in postorder.iter().enumerate() {
            po_num[*node] = i;
        }

        let mut idom: Vec<Option<usize>> = vec![None; n + 1];
        idom[n] = Some(n);
        let mut changed = true;
        while changed {
            changed = false;
            for &node in postorder.iter().rev() {
                if node == n {
                    continue;
                }
                let mut new_idom: Option<usize> = None;
                for &p in &preds[node] {
                    if idom[p].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => intersect(&idom, &po_num, p, cur),
                    });
                }
                if new_idom.is_some() && idom[node] != new_idom {
                    idom[node] = new_idom;
                    changed = true;
                }
            }
        }

        let reachable: Vec<bool> = (0..n).map(|i| visited[i]).collect();
        let idom: Vec<Option<usize>> = (0..n)
            .map(|i| match idom[i] {
                Some(d) if d != n => Some(d),
                _ => None,
            })
            .collect();
        let mut children = vec![Vec::new(); n];
        for (i, d) in idom.iter().enumerate() {
            if let Some(d) = d {
                children[*d].push(i);
            }
        }
        let mut depth = vec![0; n];
        for &node in postorder.iter().rev() {
            if node < n {
                if let Some(d) = idom[node] {
                    depth[node] = depth[d] + 1;
                }
            }
        }

        DomTree {
            blocks,
            index,
            idom,
            children,
            reachable,
            depth,
            post,
        }
    }

    /// Whether this is a post-dominator tree
    pub fn is_post(&self) -> bool {
        self.post
    }

    /// Immediate dominator of `b`
    pub fn idom(&self, b: BlockId) -> Option<BlockId> {
        let i = *self.index.get(&b)?;
        self.idom[i].map(|d| self.blocks[d])
    }

    /// Whether `b` is reachable from the tree root
    pub fn is_reachable(&self, b: BlockId) -> bool {
        self.index.get(&b).map(|i| self.reachable[*i]).unwrap_or(false)
    }

    /// Whether block `a` dominates block `b` (reflexive)
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let (Some(&ia), Some(&ib)) = (self.index.get(&a), self.index.get(&b)) else {
            return false;
        };
        if !self.reachable[ib] {
            return false;
        }
        if !self.reachable[ia] {
            return false;
        }
        let mut cur = ib;
        while self.depth[cur] > self.depth[ia] {
            match self.idom[cur] {
                Some(d) => cur = d,
                None => return false,
            }
        }
        cur == ia
    }

    /// Whether `a` strictly dominates `b`
    pub fn strictly_dominates(&self, a: BlockId, b: BlockId) -> bool {
        a != b && self.dominates(a, b)
    }

    /// Children of `b` in the tree
    pub fn children(&self, b: BlockId) -> Vec<BlockId> {
        match self.index.get(&b) {
            Some(i) => self.children[*i].iter().map(|c| self.blocks[*c]).collect(),
            None => Vec::new(),
        }
    }

    /// `b` and every block it dominates
    pub fn descendants(&self, b: BlockId) -> Vec<BlockId> {
        let Some(&root) = self.index.get(&b) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(i) = stack.pop() {
            out.push(self.blocks[i]);
            stack.extend(self.children[i].iter().copied());
        }
        out
    }

    /// Instruction-level dominance: `a` dominates `b`
    ///
    /// Inside one block an instruction dominates itself and every later one.
    /// For a post-dominator tree the order inside the block is reversed.
    pub fn dominates_inst(&self, prog: &Program, a: InstId, b: InstId) -> bool {
        let (ia, ib) = (prog.inst(a), prog.inst(b));
        if ia.block == ib.block {
            return if self.post {
                ia.pos >= ib.pos
            } else {
                ia.pos <= ib.pos
            };
        }
        self.dominates(ia.block, ib.block)
    }
}

fn intersect(idom: &[Option<usize>], po_num: &[usize], mut a: usize, mut b: usize) -> usize {
    while a != b {
        while po_num[a] < po_num[b] {
            a = idom[a].unwrap_or(a);
        }
        while po_num[b] < po_num[a] {
            b = idom[b].unwrap_or(b);
        }
    }
    a
}

/// Dominance frontier of every block of a function
#[derive(Debug, Clone, Default)]
pub struct DominanceFrontier {
    frontier: BTreeMap<BlockId, BTreeSet<BlockId>>,
}

impl DominanceFrontier {
    /// Compute the frontier from the forward dominator tree
    pub fn compute(prog: &Program, f: FuncId, dt: &DomTree) -> Self {
        let mut frontier: BTreeMap<BlockId, BTreeSet<BlockId>> = BTreeMap::new();
        for b in &prog.func(f).blocks {
            let preds = &prog.block(*b).preds;
            if preds.len() < 2 {
                continue;
            }
            let idom = dt.idom(*b);
            for p in preds {
                if !dt.is_reachable(*p) {
                    continue;
                }
                let mut runner = Some(*p);
                while let Some(r) = runner {
                    if Some(r) == idom {
                        break;
                    }
                    frontier.entry(r).or_default().insert(*b);
                    runner = dt.idom(r);
                }
            }
        }
        DominanceFrontier { frontier }
    }

    /// Frontier of `b`
    pub fn of(&self, b: BlockId) -> Option<&BTreeSet<BlockId>> {
        self.frontier.get(&b)
    }

    /// Whether `x` is in the frontier of `b`
    pub fn contains(&self, b: BlockId, x: BlockId) -> bool {
        self.frontier.get(&b).map(|s| s.contains(&x)).unwrap_or(false)
    }
}
