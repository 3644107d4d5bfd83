// SPDX-License-Identifier: GPL-2.0
//! Context-sensitive refinement of risky pairs.
//!
//! For every pair of reachable points under which two accesses may run in
//! parallel, the pointers of both accesses are resolved under a context
//! standing for that point. The pair is refined when no resolution aliases.
//! In hybrid mode the contexts are rooted at the reachable points
//! themselves; in standard mode the concrete call strings are enumerated by
//! the [`MhpPathFinder`]. Any query that fails keeps the pair.

use std::collections::BTreeSet;
use std::fmt;

use crate::analysis::collector::{MemoryAccess, OperationCollector};
use crate::analysis::context::AnalysisContext;
use crate::cfl::cache::CacheStats;
use crate::cfl::context::{CallString, CflContext, CtxEnv, HybridContext};
use crate::cfl::pts::CsPts;
use crate::cfl::solver::CflSolver;
use crate::core::config::{ContextMode, DetectorConfig};
use crate::ir::ids::{AccessId, ObjId};
use crate::mhp::analysis::MhpAnalysis;
use crate::mhp::codeset::ReachablePoint;
use crate::mhp::path_finder::MhpPathFinder;

/// Inputs of a refinement query
#[derive(Clone, Copy)]
pub struct CsaaEnv<'a> {
    /// Analysis inputs
    pub ctx: &'a AnalysisContext,
    /// Collected accesses
    pub oc: &'a OperationCollector,
    /// Reachable points of the accesses
    pub mhp: &'a MhpAnalysis,
}

impl<'a> CsaaEnv<'a> {
    /// Bundle the inputs
    pub fn new(ctx: &'a AnalysisContext, oc: &'a OperationCollector, mhp: &'a MhpAnalysis) -> Self {
        Self { ctx, oc, mhp }
    }

    fn ctx_env(&self) -> CtxEnv<'a> {
        CtxEnv::new(self.ctx, self.mhp)
    }
}

/// Refinement counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsaaStats {
    /// Pairs proven not to alias
    pub refined: usize,
    /// Pairs that may still alias
    pub unrefined: usize,
    /// Top-level queries that ran out of budget
    pub out_of_budget: usize,
    /// Cache counters
    pub cache: CacheStats,
}

impl CsaaStats {
    /// Share of refined pairs in percent
    pub fn refined_rate(&self) -> f64 {
        let total = self.refined + self.unrefined;
        if total == 0 {
            return 0.0;
        }
        self.refined as f64 * 100.0 / total as f64
    }
}

impl fmt::Display for CsaaStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "refined {} / {} pairs ({:.1}%), {} out of budget, cache {}",
            self.refined,
            self.refined + self.unrefined,
            self.refined_rate(),
            self.out_of_budget,
            self.cache
        )
    }
}

#[derive(Debug, Clone)]
enum Engine {
    Hybrid(CflSolver<HybridContext>),
    Standard {
        solver: CflSolver<CallString>,
        paths: MhpPathFinder,
    },
}

/// Context-sensitive alias refinement
#[derive(Debug, Clone)]
pub struct ContextSensitiveAliasAnalysis {
    engine: Engine,
    refined: usize,
    unrefined: usize,
}

impl ContextSensitiveAliasAnalysis {
    /// Refinement in the configured context mode; `None` when disabled
    pub fn new(config: &DetectorConfig) -> Option<Self> {
        let engine = match config.context_mode {
            ContextMode::Disabled => return None,
            ContextMode::Hybrid => Engine::Hybrid(CflSolver::new(config.cfl_query_budget)),
            ContextMode::Standard => Engine::Standard {
                solver: CflSolver::new(config.cfl_query_budget),
                paths: MhpPathFinder::new(config),
            },
        };
        Some(Self {
            engine,
            refined: 0,
            unrefined: 0,
        })
    }

    /// Whether the pointers of `a1` and `a2` cannot alias under any pair
    /// of reachable points that lets them run in parallel
    pub fn must_not_access_aliases(&mut self, env: &CsaaEnv<'_>, a1: AccessId, a2: AccessId) -> bool {
        let (acc1, acc2) = (*env.oc.access(a1), *env.oc.access(a2));
        let refined = match &mut self.engine {
            Engine::Hybrid(solver) => hybrid_refine(solver, env, &acc1, &acc2),
            Engine::Standard { solver, paths } => standard_refine(solver, paths, env, &acc1, &acc2),
        };
        if refined {
            self.refined += 1;
        } else {
            self.unrefined += 1;
        }
        refined
    }

    /// Whether `access` cannot touch any object of a partition when it
    /// runs as `rp`. Only hybrid contexts can be rooted at a single point,
    /// so the standard mode never rules an access out.
    pub fn must_not_access_part(
        &mut self,
        env: &CsaaEnv<'_>,
        access: AccessId,
        rp: ReachablePoint,
        part_objs: &BTreeSet<ObjId>,
    ) -> bool {
        let Engine::Hybrid(solver) = &mut self.engine else {
            return false;
        };
        let ctx = env.ctx;
        let pta = &ctx.pta;
        let acc = *env.oc.access(access);
        let cenv = env.ctx_env();
        let mut pts = solver.points_to(&cenv, pta.pag().value_node(acc.ptr), HybridContext::rooted(rp));
        if !pts.is_solved() {
            return false;
        }
        pts.include_base_for_first_field(pta);
        let intrinsic = is_intrinsic(ctx, &acc);
        for n in pts.nodes() {
            let Some(o) = pta.pag().as_obj(n) else {
                continue;
            };
            if pta.obj(o).is_dummy() {
                return false;
            }
            let hit = if intrinsic {
                pta.objs().all_fields(o).iter().any(|f| part_objs.contains(f))
            } else {
                part_objs.contains(&o)
            };
            if hit {
                return false;
            }
        }
        true
    }

    /// Refinement counters together with the solver's
    pub fn stats(&self) -> CsaaStats {
        let (out_of_budget, cache) = match &self.engine {
            Engine::Hybrid(solver) => (solver.out_of_budget_queries(), solver.stats()),
            Engine::Standard { solver, .. } => (solver.out_of_budget_queries(), solver.stats()),
        };
        CsaaStats {
            refined: self.refined,
            unrefined: self.unrefined,
            out_of_budget,
            cache,
        }
    }

    /// Drop cached results and counters
    pub fn reset(&mut self) {
        match &mut self.engine {
            Engine::Hybrid(solver) => solver.reset(),
            Engine::Standard { solver, .. } => solver.reset(),
        }
        self.refined = 0;
        self.unrefined = 0;
    }
}

// Memory intrinsics are call-site accesses covering a whole object.
fn is_intrinsic(ctx: &AnalysisContext, acc: &MemoryAccess) -> bool {
    ctx.prog.is_call(acc.inst)
}

fn hybrid_refine(
    solver: &mut CflSolver<HybridContext>,
    env: &CsaaEnv<'_>,
    acc1: &MemoryAccess,
    acc2: &MemoryAccess,
) -> bool {
    let pairs = env.mhp.reachable_point_pairs(env.ctx, acc1.inst, acc2.inst);
    pairs.into_iter().all(|(rp1, rp2)| {
        may_not_alias_under(
            solver,
            env,
            acc1,
            HybridContext::rooted(rp1),
            acc2,
            HybridContext::rooted(rp2),
        )
    })
}

fn standard_refine(
    solver: &mut CflSolver<CallString>,
    paths: &mut MhpPathFinder,
    env: &CsaaEnv<'_>,
    acc1: &MemoryAccess,
    acc2: &MemoryAccess,
) -> bool {
    let pairs = env.mhp.reachable_point_pairs(env.ctx, acc1.inst, acc2.inst);
    for (rp1, rp2) in pairs {
        let Some(ctx_pairs) = paths.mhp_paths(env.ctx, env.mhp, acc1.inst, rp1, acc2.inst, rp2) else {
            return false;
        };
        for (c1, c2) in ctx_pairs {
            if !may_not_alias_under(solver, env, acc1, c1, acc2, c2) {
                return false;
            }
        }
    }
    true
}

// Whether both pointers resolve and the resolutions share no object under
// matching contexts.
fn may_not_alias_under<C: CflContext>(
    solver: &mut CflSolver<C>,
    env: &CsaaEnv<'_>,
    acc1: &MemoryAccess,
    c1: C,
    acc2: &MemoryAccess,
    c2: C,
) -> bool {
    let pta = &env.ctx.pta;
    let pag = pta.pag();
    let cenv = env.ctx_env();
    let s1 = solver.points_to(&cenv, pag.value_node(acc1.ptr), c1);
    if !s1.is_solved() {
        return false;
    }
    let s2 = solver.points_to(&cenv, pag.value_node(acc2.ptr), c2);
    if !s2.is_solved() {
        return false;
    }
    let (mut s1, mut s2): (CsPts<C>, CsPts<C>) = (s1, s2);
    if is_intrinsic(env.ctx, acc1) {
        s2.include_base_for_any_field(pta);
    }
    if is_intrinsic(env.ctx, acc2) {
        s1.include_base_for_any_field(pta);
    }
    s1.include_base_for_first_field(pta);
    s2.include_base_for_first_field(pta);
    !s1.alias(&s2, pag.obj_node(pta.dummy()))
}
