// SPDX-License-Identifier: GPL-2.0
//! May-happen-in-parallel analysis.
//!
//! The bottom-up pass records, per SCC, the spawn sites whose threads may
//! still run when a member returns, together with the call sites through
//! which the effect arrives. The top-down pass then computes trunk and
//! branch reachable code per spawn site. Finally the forward sets are
//! inverted into a backward index from functions, blocks and instructions
//! to the [`ReachablePoint`]s reaching them.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::collector::OperationCollector;
use crate::analysis::context::AnalysisContext;
use crate::analysis::interproc::{
    incoming_calls, note_recursion, run_interprocedural, run_top_down, SccSummaries, SccVisitor,
};
use crate::analysis::scc::Scc;
use crate::core::error::{AnalysisError, Result};
use crate::ir::ids::{BlockId, FuncId, InstId};
use crate::mhp::codeset::{CodeSet, ReachablePoint, ReachableType, SpawnSiteReachableCode};
use crate::mhp::join::{Blocker, SpawnJoinSiteInfo, ThreadJoinAnalysis};
use crate::mhp::reachability::{reachable_functions, solve_branch, solve_refined_branch, solve_trunk};

/// Spawn effects of one SCC
#[derive(Debug, Clone, Default)]
struct MhpSummary {
    /// Spawn site to the sites in this SCC where its effect starts
    spawn_effects: BTreeMap<InstId, BTreeSet<InstId>>,
}

type RefinedCode = BTreeMap<InstId, BTreeMap<InstId, SpawnSiteReachableCode>>;

/// Trunk and branch reachability of every spawn site
#[derive(Debug, Clone, Default)]
pub struct MhpAnalysis {
    summaries: SccSummaries<MhpSummary>,
    spawn_infos: BTreeMap<InstId, SpawnJoinSiteInfo>,
    join_infos: BTreeMap<InstId, SpawnJoinSiteInfo>,
    joins: BTreeMap<InstId, ThreadJoinAnalysis>,
    reachable: BTreeMap<InstId, SpawnSiteReachableCode>,
    par_for: BTreeMap<InstId, CodeSet>,
    /// Spawn site to matched spawn site to code, once refinement ran
    refined: Option<RefinedCode>,
    func_points: BTreeMap<FuncId, Vec<ReachablePoint>>,
    block_points: BTreeMap<BlockId, Vec<ReachablePoint>>,
    inst_points: BTreeMap<InstId, Vec<ReachablePoint>>,
}

impl MhpAnalysis {
    /// Run the analysis over the live spawn, join and parallel loop sites
    pub fn analyze(ctx: &AnalysisContext, oc: &OperationCollector) -> Self {
        let mut mhp = Self::default();
        mhp.identify_spawn_join_sites(ctx, oc);
        run_interprocedural(ctx, &mut mhp);

        for &site in oc.par_for_sites() {
            let code = mhp.par_for.entry(site).or_default();
            let bodies = ctx.cg.edges_at(site).iter().map(|e| e.callee);
            reachable_functions(ctx, bodies, code);
        }

        mhp.compute_backward_index(ctx);
        log::debug!(
            "mhp: {} spawn sites, {} join sites, {} parallel loops",
            mhp.spawn_infos.len(),
            mhp.join_infos.len(),
            mhp.par_for.len()
        );
        mhp
    }

    fn identify_spawn_join_sites(&mut self, ctx: &AnalysisContext, oc: &OperationCollector) {
        let prog = &ctx.prog;
        for &spawn in oc.spawn_sites() {
            let Some(scc) = ctx.sccs.scc_of(prog.func_of(spawn)) else {
                continue;
            };
            self.summaries
                .entry(scc)
                .or_default()
                .spawn_effects
                .entry(spawn)
                .or_default()
                .insert(spawn);
            self.reachable.entry(spawn).or_default();
            self.spawn_infos
                .insert(spawn, SpawnJoinSiteInfo::compute(ctx, spawn, true));
        }

        for &join in oc.join_sites() {
            if ctx.sccs.scc_of(prog.func_of(join)).is_none() {
                continue;
            }
            self.join_infos
                .insert(join, SpawnJoinSiteInfo::compute(ctx, join, false));
        }

        for (spawn, info) in &self.spawn_infos {
            let tja = ThreadJoinAnalysis::run(ctx, info, &mut self.join_infos);
            self.joins.insert(*spawn, tja);
        }

        for (join, info) in &self.join_infos {
            if info.matching_spawn.is_none() {
                ctx.info(|| {
                    format!(
                        "join site {} is not matched to any spawn site",
                        prog.describe_inst(*join)
                    )
                });
            }
        }
    }

    /// Whether the threads of `spawn` may still run when `f` returns
    fn may_have_side_effect(&self, ctx: &AnalysisContext, spawn: InstId, f: FuncId) -> bool {
        let prog = &ctx.prog;
        if prog.func_of(spawn) != f {
            return true;
        }
        let passes = ctx.passes(f);
        let Some(ret) = passes.ret else {
            return false;
        };
        let Some(tja) = self.joins.get(&spawn) else {
            return true;
        };
        !tja.blockers(f).iter().any(|b| match *b {
            Blocker::Inst(i) => passes.dom.dominates_inst(prog, i, ret),
            Blocker::Block(bb) => passes.dom.dominates(bb, prog.block_of(ret)),
        })
    }

    fn identify_reachable(
        &mut self,
        ctx: &AnalysisContext,
        scc: &Scc,
        spawn: InstId,
        sites: &BTreeSet<InstId>,
    ) {
        let Some(tja) = self.joins.get(&spawn) else {
            return;
        };
        let Some(refined) = self.refined.as_mut() else {
            let code = self.reachable.entry(spawn).or_default();
            mark_recursive(ctx, scc, code);
            solve_trunk(ctx, sites, scc, tja, None, &mut code.trunk);
            solve_branch(ctx, spawn, &mut code.branch);
            return;
        };
        let Some(per_excluded) = refined.get_mut(&spawn) else {
            return;
        };
        for (excluded, code) in per_excluded.iter_mut() {
            mark_recursive(ctx, scc, code);
            solve_trunk(ctx, sites, scc, tja, Some(*excluded), &mut code.trunk);
            if let Some(excluded_tja) = self.joins.get(excluded) {
                solve_refined_branch(ctx, spawn, excluded_tja, &mut code.branch);
            }
        }
    }

    fn compute_backward_index(&mut self, ctx: &AnalysisContext) {
        let prog = &ctx.prog;
        for (spawn, code) in self.reachable.iter_mut() {
            code.trunk.remove_redundancy(prog);
            code.branch.remove_redundancy(prog);
            let trunk = ReachablePoint::new(*spawn, ReachableType::Trunk);
            let branch = ReachablePoint::new(*spawn, ReachableType::Branch);
            for f in code.trunk.funcs() {
                self.func_points.entry(*f).or_default().push(trunk);
            }
            for f in code.branch.funcs() {
                self.func_points.entry(*f).or_default().push(branch);
            }
            for b in code.trunk.blocks() {
                self.block_points.entry(*b).or_default().push(trunk);
            }
            for i in code.trunk.insts() {
                self.inst_points.entry(*i).or_default().push(trunk);
            }
        }

        // Every iteration of a parallel loop runs alongside the others.
        for (site, code) in &self.par_for {
            for f in code.funcs() {
                let points = self.func_points.entry(*f).or_default();
                points.push(ReachablePoint::new(*site, ReachableType::Trunk));
                points.push(ReachablePoint::new(*site, ReachableType::Branch));
            }
        }
    }

    /// Whether no spawn site reaches `i`: it only runs on the main thread
    /// before any thread exists, or after all were joined
    pub fn is_sequential(&self, ctx: &AnalysisContext, i: InstId) -> bool {
        let inst = ctx.prog.inst(i);
        !self.inst_points.contains_key(&i)
            && !self.block_points.contains_key(&inst.block)
            && !self.func_points.contains_key(&inst.func)
    }

    /// Spawn sites reaching `i`, with the side of the fork
    pub fn backward_points(&self, ctx: &AnalysisContext, i: InstId) -> Vec<ReachablePoint> {
        let inst = ctx.prog.inst(i);
        let mut points = Vec::new();
        for found in [
            self.inst_points.get(&i),
            self.block_points.get(&inst.block),
            self.func_points.get(&inst.func),
        ]
        .into_iter()
        .flatten()
        {
            points.extend(found.iter().copied());
        }
        points
    }

    /// Spawn sites under which `i1` and `i2` may run in parallel
    pub fn may_happen_in_parallel(&self, ctx: &AnalysisContext, i1: InstId, i2: InstId) -> BTreeSet<InstId> {
        let (p1, p2) = (self.backward_points(ctx, i1), self.backward_points(ctx, i2));
        let mut sites = BTreeSet::new();
        for rp1 in &p1 {
            if sites.contains(&rp1.spawn) {
                continue;
            }
            if p2
                .iter()
                .any(|rp2| rp2.spawn == rp1.spawn && rp1.ty.may_run_in_parallel(rp2.ty))
            {
                sites.insert(rp1.spawn);
            }
        }
        sites
    }

    /// Pairs of reachable points under which `i1` and `i2` may run in
    /// parallel. Mirrored pairs are reported once when `i1 == i2`.
    pub fn reachable_point_pairs(
        &self,
        ctx: &AnalysisContext,
        i1: InstId,
        i2: InstId,
    ) -> Vec<(ReachablePoint, ReachablePoint)> {
        let (p1, p2) = (self.backward_points(ctx, i1), self.backward_points(ctx, i2));
        let mut pairs: Vec<(ReachablePoint, ReachablePoint)> = Vec::new();
        for rp1 in &p1 {
            for rp2 in &p2 {
                if rp1.spawn != rp2.spawn || !rp1.ty.may_run_in_parallel(rp2.ty) {
                    continue;
                }
                if i1 == i2 && pairs.contains(&(*rp2, *rp1)) {
                    continue;
                }
                pairs.push((*rp1, *rp2));
            }
        }
        pairs
    }

    /// Whether `i` runs on the spawning thread after `spawn`
    pub fn is_trunk_reachable(&self, ctx: &AnalysisContext, spawn: InstId, i: InstId) -> bool {
        self.reachable
            .get(&spawn)
            .is_some_and(|code| code.is_trunk_reachable(&ctx.prog, i))
    }

    /// Whether `i` runs on a thread created at `spawn`
    pub fn is_branch_reachable(&self, ctx: &AnalysisContext, spawn: InstId, i: InstId) -> bool {
        self.reachable
            .get(&spawn)
            .is_some_and(|code| code.is_branch_reachable(&ctx.prog, i))
    }

    /// Re-derive reachability with the joins the coarse pass could not
    /// place. A join matched to spawn site `m` but reachable from neither
    /// side of `m` is joined by a thread of some other spawn site `s`; the
    /// code of `s` is then recomputed without following `m`, and with the
    /// threads of `s` stopping at the joins of `m`.
    pub fn perform_refinement(&mut self, ctx: &AnalysisContext) {
        let mut refined = RefinedCode::new();
        for (join, info) in &self.join_infos {
            let Some(matching) = info.matching_spawn else {
                continue;
            };
            if self.is_trunk_reachable(ctx, matching, *join)
                || self.is_branch_reachable(ctx, matching, *join)
            {
                continue;
            }
            for rp in self.backward_points(ctx, *join) {
                refined.entry(rp.spawn).or_default().entry(matching).or_default();
            }
        }
        let entries: usize = refined.values().map(BTreeMap::len).sum();
        self.refined = Some(refined);
        run_top_down(ctx, self);
        log::debug!("mhp refinement: {} refined reachability sets", entries);
    }

    /// Whether the join refinement proves that `i1` and `i2` do not run in
    /// parallel under `spawn`
    pub fn branch_join_refined(&self, ctx: &AnalysisContext, spawn: InstId, i1: InstId, i2: InstId) -> Result<bool> {
        let refined = self
            .refined
            .as_ref()
            .ok_or(AnalysisError::NotInitialized("mhp refinement"))?;
        let Some(per_excluded) = refined.get(&spawn) else {
            return Ok(false);
        };
        let prog = &ctx.prog;
        Ok(!per_excluded.values().any(|code| {
            code.is_trunk_reachable(prog, i1)
                || code.is_trunk_reachable(prog, i2)
                || code.is_branch_reachable(prog, i1)
                || code.is_branch_reachable(prog, i2)
        }))
    }

    /// Whether [`MhpAnalysis::perform_refinement`] ran
    pub fn is_refined(&self) -> bool {
        self.refined.is_some()
    }

    /// Live spawn sites
    pub fn spawn_sites(&self) -> impl Iterator<Item = InstId> + '_ {
        self.spawn_infos.keys().copied()
    }

    /// Parallel loop sites
    pub fn par_for_sites(&self) -> impl Iterator<Item = InstId> + '_ {
        self.par_for.keys().copied()
    }

    /// Whether `site` is a parallel loop site
    pub fn is_par_for_site(&self, site: InstId) -> bool {
        self.par_for.contains_key(&site)
    }

    /// Loop and thread id facts of a spawn site
    pub fn spawn_site_info(&self, spawn: InstId) -> Option<&SpawnJoinSiteInfo> {
        self.spawn_infos.get(&spawn)
    }

    /// Loop and thread id facts of a join site
    pub fn join_site_info(&self, join: InstId) -> Option<&SpawnJoinSiteInfo> {
        self.join_infos.get(&join)
    }

    /// Joins matched to a spawn site
    pub fn thread_join_analysis(&self, spawn: InstId) -> Option<&ThreadJoinAnalysis> {
        self.joins.get(&spawn)
    }

    /// Trunk and branch code of a spawn site
    pub fn reachable_code(&self, spawn: InstId) -> Option<&SpawnSiteReachableCode> {
        self.reachable.get(&spawn)
    }

    /// Functions run by the iterations of a parallel loop
    pub fn par_for_code(&self, site: InstId) -> Option<&CodeSet> {
        self.par_for.get(&site)
    }

    /// Sites in the SCC of `f` where the effect of `spawn` starts: the
    /// spawn itself, or calls that may return while its threads run
    pub fn affected_sites(&self, ctx: &AnalysisContext, f: FuncId, spawn: InstId) -> Option<&BTreeSet<InstId>> {
        let scc = ctx.sccs.scc_of(f)?;
        self.summaries.get(&scc)?.spawn_effects.get(&spawn)
    }

    /// Whether trunk reachability of `spawn` starts right after `site`
    pub fn is_affected_site(&self, ctx: &AnalysisContext, spawn: InstId, site: InstId) -> bool {
        self.affected_sites(ctx, ctx.prog.func_of(site), spawn)
            .is_some_and(|sites| sites.contains(&site))
    }

    /// Join sites that were matched to no spawn site
    pub fn unmatched_joins(&self) -> impl Iterator<Item = InstId> + '_ {
        self.join_infos
            .iter()
            .filter(|(_, info)| info.matching_spawn.is_none())
            .map(|(join, _)| *join)
    }
}

/// A recursive SCC may re-enter any member after the spawn, so every member
/// is trunk reachable as a whole
fn mark_recursive(ctx: &AnalysisContext, scc: &Scc, code: &mut SpawnSiteReachableCode) {
    if !scc.recursive {
        return;
    }
    code.recursive = true;
    for f in &scc.members {
        code.trunk.insert_func(*f);
    }
    note_recursion(ctx, scc, "mhp");
}

impl SccVisitor for MhpAnalysis {
    fn visit_bottom_up(&mut self, ctx: &AnalysisContext, scc: &Scc) {
        let Some(summary) = self.summaries.get(&scc.id) else {
            return;
        };
        let spawns: Vec<InstId> = summary
            .spawn_effects
            .keys()
            .copied()
            .filter(|s| self.may_have_side_effect(ctx, *s, scc.rep))
            .collect();
        if spawns.is_empty() {
            return;
        }
        let edges = incoming_calls(ctx, scc);
        for spawn in spawns {
            for e in &edges {
                let Some(caller_scc) = ctx.sccs.scc_of(e.caller) else {
                    continue;
                };
                self.summaries
                    .entry(caller_scc)
                    .or_default()
                    .spawn_effects
                    .entry(spawn)
                    .or_default()
                    .insert(e.site);
            }
        }
    }

    fn visit_top_down(&mut self, ctx: &AnalysisContext, scc: &Scc) {
        let Some(summary) = self.summaries.get(&scc.id) else {
            return;
        };
        let effects = summary.spawn_effects.clone();
        for (spawn, sites) in &effects {
            self.identify_reachable(ctx, scc, *spawn, sites);
        }
    }
}
