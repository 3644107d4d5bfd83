// SPDX-License-Identifier: GPL-2.0
//! Lazily computed per-function CFG analyses.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::ir::dom::{DomTree, DominanceFrontier};
use crate::ir::ids::{FuncId, InstId};
use crate::ir::loops::LoopInfo;
use crate::ir::program::Program;

/// CFG analyses of one function
#[derive(Debug)]
pub struct FunctionPasses {
    /// Dominator tree
    pub dom: DomTree,
    /// Post-dominator tree
    pub post_dom: DomTree,
    /// Dominance frontier
    pub frontier: DominanceFrontier,
    /// Natural loops
    pub loops: LoopInfo,
    /// The single return instruction, if the function returns
    pub ret: Option<InstId>,
}

impl FunctionPasses {
    /// Run every analysis on `f`
    pub fn compute(prog: &Program, f: FuncId) -> Self {
        let dom = DomTree::dominators(prog, f);
        let post_dom = DomTree::post_dominators(prog, f);
        let frontier = DominanceFrontier::compute(prog, f, &dom);
        let loops = LoopInfo::compute(prog, f, &dom);
        let ret = prog.unique_return(f);
        Self {
            dom,
            post_dom,
            frontier,
            loops,
            ret,
        }
    }
}

/// Cache of [`FunctionPasses`], filled on first request
#[derive(Debug, Default)]
pub struct PassPool {
    cache: RefCell<BTreeMap<FuncId, Rc<FunctionPasses>>>,
}

impl PassPool {
    /// Create an empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Analyses of `f`, computed on first use
    pub fn get(&self, prog: &Program, f: FuncId) -> Rc<FunctionPasses> {
        if let Some(p) = self.cache.borrow().get(&f) {
            return Rc::clone(p);
        }
        let passes = Rc::new(FunctionPasses::compute(prog, f));
        self.cache.borrow_mut().insert(f, Rc::clone(&passes));
        passes
    }

    /// Number of functions analyzed so far
    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    /// Whether nothing was analyzed yet
    pub fn is_empty(&self) -> bool {
        self.cache.borrow().is_empty()
    }

    /// Drop every cached result
    pub fn clear(&self) {
        self.cache.borrow_mut().clear();
    }
}
