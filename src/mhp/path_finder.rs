// SPDX-License-Identifier: GPL-2.0
//! Enumeration of concrete calling contexts behind a reachable point.
//!
//! For an instruction reached from a spawn site, the finder lists every
//! call string from `main` down to the instruction that stays within the
//! trunk or branch code of that spawn site. A trunk path also remembers its
//! splitting site: the site in the spawning SCC through which the spawn's
//! effect reaches it. Pairs of paths whose branch side cannot have passed
//! the splitting site of the trunk side are dropped. Parallel loop sites
//! are handled the same way, with paths starting at the loop site instead
//! of `main`.

use std::collections::BTreeSet;
use std::fmt;

use crate::analysis::context::AnalysisContext;
use crate::cfl::context::CallString;
use crate::core::config::DetectorConfig;
use crate::ir::ids::{BlockId, InstId};
use crate::mhp::analysis::MhpAnalysis;
use crate::mhp::codeset::{ReachablePoint, ReachableType};

/// Outcome of the last path query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathStatus {
    /// No query finished yet
    #[default]
    Init,
    /// All paths were enumerated
    Solved,
    /// Too many paths or path pairs
    OutOfBudget,
    /// Paths cannot be rooted, e.g. without `main`
    OtherFailure,
}

impl fmt::Display for PathStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PathStatus::Init => "init",
            PathStatus::Solved => "solved",
            PathStatus::OutOfBudget => "out of budget",
            PathStatus::OtherFailure => "failed",
        })
    }
}

/// One enumerated context
#[derive(Debug, Clone)]
struct CtxPath {
    sites: CallString,
    split: Option<InstId>,
}

/// Bounded context enumeration
#[derive(Debug, Clone)]
pub struct MhpPathFinder {
    max_ctx_path_size: usize,
    max_path_pair_count: usize,
    status: PathStatus,
}

impl MhpPathFinder {
    /// Finder with the path limits of `config`
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            max_ctx_path_size: config.max_ctx_path_size,
            max_path_pair_count: config.max_path_pair_count,
            status: PathStatus::Init,
        }
    }

    /// Outcome of the last query
    pub fn status(&self) -> PathStatus {
        self.status
    }

    /// Whether the last query hit a limit
    pub fn is_out_of_budget(&self) -> bool {
        self.status == PathStatus::OutOfBudget
    }

    /// Feasible context pairs under which `i1` (reached as `rp1`) and `i2`
    /// (reached as `rp2`) run in parallel. `None` when the paths could not
    /// be enumerated within the limits.
    pub fn mhp_paths(
        &mut self,
        ctx: &AnalysisContext,
        mhp: &MhpAnalysis,
        i1: InstId,
        rp1: ReachablePoint,
        i2: InstId,
        rp2: ReachablePoint,
    ) -> Option<Vec<(CallString, CallString)>> {
        self.status = PathStatus::Init;
        let paths1 = self.ctx_paths(ctx, mhp, i1, rp1)?;
        let paths2 = self.ctx_paths(ctx, mhp, i2, rp2)?;
        if paths1.len() * paths2.len() >= self.max_path_pair_count {
            self.status = PathStatus::OutOfBudget;
            return None;
        }

        let mut pairs = Vec::new();
        for p1 in &paths1 {
            for p2 in &paths2 {
                if let (Some(s1), Some(s2)) = (p1.split, p2.split) {
                    let feasible = if rp1.ty == ReachableType::Branch {
                        is_feasible_branch_path(ctx, &p1.sites, s2)
                    } else {
                        is_feasible_branch_path(ctx, &p2.sites, s1)
                    };
                    if !feasible {
                        continue;
                    }
                }
                pairs.push((p1.sites.clone(), p2.sites.clone()));
            }
        }
        self.status = PathStatus::Solved;
        Some(pairs)
    }

    fn ctx_paths(
        &mut self,
        ctx: &AnalysisContext,
        mhp: &MhpAnalysis,
        i: InstId,
        rp: ReachablePoint,
    ) -> Option<Vec<CtxPath>> {
        if mhp.is_par_for_site(rp.spawn) {
            return self.par_for_paths(ctx, i, rp.spawn);
        }
        self.spawn_paths(ctx, mhp, i, rp)
    }

    fn spawn_paths(
        &mut self,
        ctx: &AnalysisContext,
        mhp: &MhpAnalysis,
        i: InstId,
        rp: ReachablePoint,
    ) -> Option<Vec<CtxPath>> {
        let Some(main) = ctx.prog.entry_func() else {
            self.status = PathStatus::OtherFailure;
            return None;
        };
        let init_split = match rp.ty {
            ReachableType::Trunk => trunk_splitting_site(ctx, mhp, i, rp.spawn),
            ReachableType::Branch => (i == rp.spawn).then_some(i),
            ReachableType::Not => None,
        };

        let mut paths = Vec::new();
        let mut path: Vec<InstId> = Vec::new();
        let mut work: Vec<(InstId, Option<InstId>, usize)> = vec![(i, init_split, 0)];
        while let Some((cur, split, depth)) = work.pop() {
            path.truncate(depth);
            path.push(cur);
            let f = ctx.prog.func_of(cur);
            if !ctx.cg.is_live(f) {
                continue;
            }
            if f == main {
                if paths.len() >= self.max_ctx_path_size {
                    self.status = PathStatus::OutOfBudget;
                    return None;
                }
                let sites = path[1..].iter().rev().copied().collect();
                paths.push(CtxPath {
                    sites: CallString::from_sites(sites),
                    split,
                });
                continue;
            }
            for e in ctx.cg.edges_to(f) {
                if !ctx.cg.is_live(e.caller) || path.contains(&e.site) {
                    continue;
                }
                let site = e.site;
                let next = match (rp.ty, split) {
                    (_, Some(s)) => Some(Some(s)),
                    (ReachableType::Trunk, None) => match trunk_splitting_site(ctx, mhp, site, rp.spawn) {
                        Some(s) => Some(Some(s)),
                        None => mhp.is_trunk_reachable(ctx, rp.spawn, site).then_some(None),
                    },
                    (ReachableType::Branch, None) if site == rp.spawn => Some(Some(site)),
                    (ReachableType::Branch, None) => mhp.is_branch_reachable(ctx, rp.spawn, site).then_some(None),
                    (ReachableType::Not, None) => None,
                };
                if let Some(next_split) = next {
                    work.push((site, next_split, path.len()));
                }
            }
        }
        Some(paths)
    }

    // Contexts of a parallel loop body start at the loop site.
    fn par_for_paths(&mut self, ctx: &AnalysisContext, i: InstId, site: InstId) -> Option<Vec<CtxPath>> {
        let mut paths = Vec::new();
        let mut path: Vec<InstId> = Vec::new();
        let mut work: Vec<(InstId, usize)> = vec![(i, 0)];
        while let Some((cur, depth)) = work.pop() {
            path.truncate(depth);
            path.push(cur);
            let f = ctx.prog.func_of(cur);
            for e in ctx.cg.edges_to(f) {
                if !ctx.cg.is_live(e.caller) || path.contains(&e.site) {
                    continue;
                }
                if e.site != site {
                    work.push((e.site, path.len()));
                    continue;
                }
                if paths.len() >= self.max_ctx_path_size {
                    self.status = PathStatus::OutOfBudget;
                    return None;
                }
                let mut sites = vec![site];
                sites.extend(path[1..].iter().rev().copied());
                paths.push(CtxPath {
                    sites: CallString::from_sites(sites),
                    split: None,
                });
            }
        }
        Some(paths)
    }
}

/// The first site of `spawn`'s effect in the SCC of `i` that `i` is
/// reachable from within its function
fn trunk_splitting_site(ctx: &AnalysisContext, mhp: &MhpAnalysis, i: InstId, spawn: InstId) -> Option<InstId> {
    let sites = mhp.affected_sites(ctx, ctx.prog.func_of(i), spawn)?;
    let (insts, blocks) = backward_reachable_code(ctx, i);
    sites
        .iter()
        .copied()
        .find(|s| insts.contains(s) || blocks.contains(&ctx.prog.block_of(*s)))
}

/// Instructions before `i` in its block, and the blocks that reach the
/// block of `i`
fn backward_reachable_code(ctx: &AnalysisContext, i: InstId) -> (BTreeSet<InstId>, BTreeSet<BlockId>) {
    let prog = &ctx.prog;
    let inst = prog.inst(i);
    let block = prog.block(inst.block);
    let insts = block.insts[..inst.pos].iter().copied().collect();

    let mut blocks = BTreeSet::new();
    let mut work: Vec<BlockId> = block.preds.clone();
    while let Some(b) = work.pop() {
        if blocks.insert(b) {
            work.extend(prog.block(b).preds.iter().copied());
        }
    }
    (insts, blocks)
}

/// Whether a branch path may pass the splitting site of the trunk side:
/// its outermost site in the splitting function must be that site
fn is_feasible_branch_path(ctx: &AnalysisContext, branch: &CallString, split: InstId) -> bool {
    let f = ctx.prog.func_of(split);
    branch
        .sites()
        .iter()
        .find(|cs| ctx.prog.func_of(**cs) == f)
        .map_or(true, |cs| *cs == split)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::analysis::collector::OperationCollector;
    use crate::ir::builder::ProgramBuilder;

    struct Fixture {
        ctx: AnalysisContext,
        mhp: MhpAnalysis,
        spawn: InstId,
        main_store: InstId,
        worker_store: InstId,
        helper_call: InstId,
    }

    /// `main` spawns `worker`, then stores; `worker` calls `helper`, which
    /// stores.
    fn spawn_program() -> Fixture {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let helper = pb.declare("helper", 0);
        let worker = pb.declare("worker", 1);
        let create = pb.declare("thread_create", 3);
        let main = pb.declare("main", 0);
        let worker_store = {
            let mut fb = pb.body(helper);
            let one = fb.const_int(1);
            let s = fb.store(g, one);
            fb.ret(None);
            s
        };
        let helper_call = {
            let mut fb = pb.body(worker);
            let c = fb.call(helper, vec![]);
            fb.ret(None);
            c
        };
        let (spawn, main_store) = {
            let mut fb = pb.body(main);
            let tid = fb.alloca(0);
            let null = fb.null();
            let routine = fb.func_addr(worker);
            let spawn = fb.call(create, vec![tid, routine, null]);
            let zero = fb.const_int(0);
            let s = fb.store(g, zero);
            fb.ret(None);
            (spawn, s)
        };
        let prog = pb.finish().unwrap();
        let ctx = AnalysisContext::new(prog, DetectorConfig::default()).unwrap();
        let oc = OperationCollector::collect(&ctx);
        let mhp = MhpAnalysis::analyze(&ctx, &oc);
        Fixture {
            ctx,
            mhp,
            spawn,
            main_store,
            worker_store,
            helper_call,
        }
    }

    #[test]
    fn test_paths_from_main() {
        let fx = spawn_program();
        let mut finder = MhpPathFinder::new(&fx.ctx.config);
        let trunk = ReachablePoint::new(fx.spawn, ReachableType::Trunk);
        let branch = ReachablePoint::new(fx.spawn, ReachableType::Branch);
        let pairs = finder
            .mhp_paths(&fx.ctx, &fx.mhp, fx.main_store, trunk, fx.worker_store, branch)
            .unwrap();
        assert_eq!(finder.status(), PathStatus::Solved);
        assert_eq!(pairs.len(), 1);
        let (c1, c2) = &pairs[0];
        assert!(c1.is_empty());
        assert_eq!(c2.sites(), &[fx.spawn, fx.helper_call]);
    }

    #[test]
    fn test_pair_limit() {
        let fx = spawn_program();
        let config = DetectorConfig {
            max_path_pair_count: 1,
            ..DetectorConfig::default()
        };
        let mut finder = MhpPathFinder::new(&config);
        let trunk = ReachablePoint::new(fx.spawn, ReachableType::Trunk);
        let branch = ReachablePoint::new(fx.spawn, ReachableType::Branch);
        assert!(finder
            .mhp_paths(&fx.ctx, &fx.mhp, fx.main_store, trunk, fx.worker_store, branch)
            .is_none());
        assert!(finder.is_out_of_budget());
    }

    #[test]
    fn test_branch_path_feasibility() {
        let fx = spawn_program();
        let path = CallString::from_sites(vec![fx.spawn, fx.helper_call]);
        assert!(is_feasible_branch_path(&fx.ctx, &path, fx.spawn));
        assert!(!is_feasible_branch_path(&fx.ctx, &path, fx.main_store));
        assert!(is_feasible_branch_path(&fx.ctx, &CallString::new(), fx.main_store));
    }
}
