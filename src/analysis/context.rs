// SPDX-License-Identifier: GPL-2.0
//! Shared analysis inputs.
//!
//! [`AnalysisContext`] owns the program together with everything derived
//! from it once: points-to sets, call graphs, the SCC order and the lazily
//! filled pass pool. Every race analysis borrows it; none of them keeps
//! process-wide state.

use std::cell::{Ref, RefCell};
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use crate::analysis::callgraph::CallGraph;
use crate::analysis::scc::SccOrder;
use crate::analysis::thread_api::ThreadApi;
use crate::core::config::DetectorConfig;
use crate::core::error::Result;
use crate::core::log::{log_debug, log_info, log_warn, AnalysisLog};
use crate::ir::ids::{FuncId, InstId, ValueId};
use crate::ir::pass_pool::{FunctionPasses, PassPool};
use crate::ir::program::Program;
use crate::ir::scev::{InductionOracle, LoopBoundOracle};
use crate::pta::PointerAnalysis;

/// Program and derived whole-program facts
pub struct AnalysisContext {
    /// Program under analysis
    pub prog: Program,
    /// Detector configuration
    pub config: DetectorConfig,
    /// Thread API classifier
    pub api: ThreadApi,
    /// Points-to results
    pub pta: PointerAnalysis,
    /// Call graph
    pub cg: CallGraph,
    /// SCCs of the call graph
    pub sccs: SccOrder,
    /// Functions in recursive SCCs
    pub recursive: BTreeSet<FuncId>,
    passes: PassPool,
    oracle: Box<dyn LoopBoundOracle>,
    log: RefCell<AnalysisLog>,
}

impl fmt::Debug for AnalysisContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisContext")
            .field("funcs", &self.prog.num_funcs())
            .field("insts", &self.prog.num_insts())
            .field("sccs", &self.sccs.len())
            .field("oracle", &self.oracle)
            .finish()
    }
}

impl AnalysisContext {
    /// Build points-to sets, call graph and SCC order for `prog`
    pub fn new(prog: Program, config: DetectorConfig) -> Result<Self> {
        Self::with_oracle(prog, config, Box::new(InductionOracle::new()))
    }

    /// Same as [`AnalysisContext::new`] with a custom loop-bound oracle
    pub fn with_oracle(
        prog: Program,
        config: DetectorConfig,
        oracle: Box<dyn LoopBoundOracle>,
    ) -> Result<Self> {
        config.validate()?;
        let pta = PointerAnalysis::analyze(&prog, config.handle_variant_gep);
        let cg = CallGraph::build(&prog, &pta);
        let sccs = SccOrder::compute(&prog, &cg);
        let recursive = sccs
            .sccs()
            .iter()
            .filter(|s| s.recursive)
            .flat_map(|s| s.members.iter().copied())
            .collect();
        let log = AnalysisLog::with_max_size(config.log_level, config.max_log_size);
        Ok(Self {
            prog,
            api: ThreadApi::new(),
            pta,
            cg,
            sccs,
            recursive,
            passes: PassPool::new(),
            oracle,
            log: RefCell::new(log),
            config,
        })
    }

    /// CFG analyses of `f`
    pub fn passes(&self, f: FuncId) -> Rc<FunctionPasses> {
        self.passes.get(&self.prog, f)
    }

    /// Loop-bound oracle
    pub fn oracle(&self) -> &dyn LoopBoundOracle {
        self.oracle.as_ref()
    }

    /// Whether `f` should be analyzed: defined and live from `main`
    pub fn is_analyzable(&self, f: FuncId) -> bool {
        !self.prog.func(f).is_declaration() && self.cg.is_live(f)
    }

    /// Whether instruction `a` dominates instruction `b`
    pub fn dominates(&self, a: InstId, b: InstId) -> bool {
        let f = self.prog.func_of(a);
        f == self.prog.func_of(b) && self.passes(f).dom.dominates_inst(&self.prog, a, b)
    }

    /// Whether instruction `a` post-dominates instruction `b`
    pub fn post_dominates(&self, a: InstId, b: InstId) -> bool {
        let f = self.prog.func_of(a);
        f == self.prog.func_of(b) && self.passes(f).post_dom.dominates_inst(&self.prog, a, b)
    }

    /// Whether `v` points to a single run-time object
    pub fn is_singleton(&self, v: ValueId) -> bool {
        self.pta.is_singleton(v, &self.recursive)
    }

    /// Diagnostics log
    pub fn log(&self) -> Ref<'_, AnalysisLog> {
        self.log.borrow()
    }

    /// Take the diagnostics log, leaving an empty one
    pub fn take_log(&self) -> AnalysisLog {
        let fresh = AnalysisLog::with_max_size(self.config.log_level, self.config.max_log_size);
        self.log.replace(fresh)
    }

    /// Soft warning, see [`log_warn`]
    pub fn warn(&self, msg: impl FnOnce() -> String) {
        log_warn(&mut self.log.borrow_mut(), msg);
    }

    /// Verbose note, see [`log_info`]
    pub fn info(&self, msg: impl FnOnce() -> String) {
        log_info(&mut self.log.borrow_mut(), msg);
    }

    /// Debug note, see [`log_debug`]
    pub fn debug(&self, msg: impl FnOnce() -> String) {
        log_debug(&mut self.log.borrow_mut(), msg);
    }
}
