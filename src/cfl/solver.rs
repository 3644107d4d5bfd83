// SPDX-License-Identifier: GPL-2.0
//! Demand-driven CFL-reachability over the pointer assignment graph.
//!
//! Points-to queries walk the graph backward from a pointer, flows-to
//! queries walk it forward from an object, and alias queries chain the two.
//! Call and fork edges are matched against return and join edges through
//! the context. Loads and stores make the three queries mutually
//! recursive; a query met again while still in process counts as solved
//! and empty for that occurrence.
//!
//! Every worklist pop costs one unit of the budget of the current top-level
//! query. Running out fails every query on the stack with
//! [`QueryStatus::OutOfBudget`], and failures stay in the cache.

use std::collections::BTreeSet;

use crate::cfl::cache::{CacheStats, FtsKey, PtsKey, QueryCache};
use crate::cfl::context::{CflContext, CtxEnv, CtxId, CtxPool};
use crate::cfl::pts::{CsPts, QueryStatus};
use crate::ir::ids::NodeId;
use crate::pta::{PagEdgeKind, PagNode};

type Query<C> = std::result::Result<CsPts<C>, QueryStatus>;

/// Budgeted solver with its own caches
#[derive(Debug, Clone)]
pub struct CflSolver<C: CflContext> {
    pool: CtxPool<C>,
    pts_cache: QueryCache<PtsKey, C>,
    fts_cache: QueryCache<FtsKey, C>,
    alias_stack: BTreeSet<(NodeId, CtxId)>,
    budget: i64,
    init_budget: i64,
    out_of_budget: usize,
}

impl<C: CflContext> CflSolver<C> {
    /// Solver granting `budget` operations to every top-level query
    pub fn new(budget: i64) -> Self {
        Self {
            pool: CtxPool::new(),
            pts_cache: QueryCache::new(),
            fts_cache: QueryCache::new(),
            alias_stack: BTreeSet::new(),
            budget,
            init_budget: budget,
            out_of_budget: 0,
        }
    }

    /// Context-sensitive points-to set of node `n` under `ctx`. The result
    /// carries the failure status when the query could not be solved.
    pub fn points_to(&mut self, env: &CtxEnv<'_>, n: NodeId, ctx: C) -> CsPts<C> {
        self.begin_query();
        let res = self.points_to_impl(env, n, ctx);
        self.finish_query(env, n, res)
    }

    /// Pointers that may point to what `p` points to under `ctx`
    pub fn alias_pointers(&mut self, env: &CtxEnv<'_>, p: NodeId, ctx: C) -> CsPts<C> {
        self.begin_query();
        let res = self.alias_pointers_impl(env, p, ctx);
        self.finish_query(env, p, res)
    }

    /// Forget cached results and interned contexts
    pub fn reset(&mut self) {
        self.pool.clear();
        self.pts_cache.reset();
        self.fts_cache.reset();
        self.alias_stack.clear();
        self.budget = self.init_budget;
        self.out_of_budget = 0;
    }

    /// Lookup counters of both caches
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.pts_cache.stats();
        stats.merge(self.fts_cache.stats());
        stats
    }

    /// Top-level queries that ran out of budget
    pub fn out_of_budget_queries(&self) -> usize {
        self.out_of_budget
    }

    fn begin_query(&mut self) {
        self.budget = self.init_budget;
        self.alias_stack.clear();
    }

    fn finish_query(&mut self, env: &CtxEnv<'_>, n: NodeId, res: Query<C>) -> CsPts<C> {
        match res {
            Ok(pts) => pts,
            Err(status) => {
                if status == QueryStatus::OutOfBudget {
                    self.out_of_budget += 1;
                    env.ctx
                        .debug(|| format!("alias query from {} ran out of budget", n));
                }
                log::trace!("cfl query from {}: {}", n, status);
                CsPts::failed(status)
            }
        }
    }

    // Count one worklist pop against the budget.
    fn spend(&mut self) -> std::result::Result<(), QueryStatus> {
        self.budget -= 1;
        if self.budget > 0 {
            Ok(())
        } else {
            Err(QueryStatus::OutOfBudget)
        }
    }

    fn points_to_impl(&mut self, env: &CtxEnv<'_>, n: NodeId, ctx: C) -> Query<C> {
        if n.index() >= env.ctx.pta.pag().num_nodes() {
            return Err(QueryStatus::OtherFailure);
        }
        let key = (n, self.pool.intern(ctx.clone()));
        if let Some(found) = self.cached(true, key.0, None, key.1) {
            return found;
        }
        self.pts_cache.set_status(key, QueryStatus::InProcess);
        let res = self.traverse_pts(env, n, ctx);
        self.settle(res, |solver, pts| solver.pts_cache.store(key, pts))
    }

    fn flows_to_impl(&mut self, env: &CtxEnv<'_>, n: NodeId, offset: Option<u32>, ctx: C) -> Query<C> {
        let key = (n, offset, self.pool.intern(ctx.clone()));
        if let Some(found) = self.cached(false, n, offset, key.2) {
            return found;
        }
        self.fts_cache.set_status(key, QueryStatus::InProcess);
        let res = self.traverse_fts(env, n, offset, ctx);
        self.settle(res, |solver, fts| solver.fts_cache.store(key, fts))
    }

    // Answer from the cache when the entry is finished or in process.
    fn cached(&mut self, pts: bool, n: NodeId, offset: Option<u32>, c: CtxId) -> Option<Query<C>> {
        let entry = if pts {
            self.pts_cache.lookup(&(n, c))
        } else {
            self.fts_cache.lookup(&(n, offset, c))
        }?;
        match entry.status() {
            QueryStatus::Fresh => None,
            QueryStatus::Solved => Some(Ok(entry.clone())),
            QueryStatus::InProcess => {
                let mut empty = CsPts::new();
                empty.set_status(QueryStatus::Solved);
                Some(Ok(empty))
            }
            failed => Some(Err(failed)),
        }
    }

    fn settle<F>(&mut self, res: Query<C>, store: F) -> Query<C>
    where
        F: FnOnce(&mut Self, CsPts<C>),
    {
        match res {
            Ok(mut pts) => {
                pts.set_status(QueryStatus::Solved);
                store(self, pts.clone());
                Ok(pts)
            }
            Err(status) => {
                store(self, CsPts::failed(status));
                Err(status)
            }
        }
    }

    fn alias_pointers_impl(&mut self, env: &CtxEnv<'_>, p: NodeId, ctx: C) -> Query<C> {
        let key = (p, self.pool.intern(ctx.clone()));
        if !self.alias_stack.insert(key) {
            let mut empty = CsPts::new();
            empty.set_status(QueryStatus::Solved);
            return Ok(empty);
        }
        let res = self.collect_aliases(env, p, ctx);
        self.alias_stack.remove(&key);
        res
    }

    fn collect_aliases(&mut self, env: &CtxEnv<'_>, p: NodeId, ctx: C) -> Query<C> {
        let pta = &env.ctx.pta;
        let pag = pta.pag();
        let pts = self.points_to_impl(env, p, ctx)?;
        let mut out = CsPts::new();
        for (o_node, ctxs) in pts.iter() {
            let Some(o) = pag.as_obj(o_node) else {
                continue;
            };
            let obj = pta.obj(o);
            if obj.is_dummy() {
                continue;
            }
            // Only base objects have address edges; fields start there.
            let (start, offset) = match obj.field {
                Some(k) if obj.base != o => (pag.obj_node(obj.base), Some(k)),
                _ => (o_node, None),
            };
            let starts: Vec<C> = if obj.is_global() {
                vec![C::global()]
            } else {
                ctxs.iter().cloned().collect()
            };
            for oc in starts {
                let fts = self.flows_to_impl(env, start, offset, oc)?;
                out.union(&fts);
            }
        }
        out.set_status(QueryStatus::Solved);
        Ok(out)
    }

    // Values returned by library code without a body point to unknown memory.
    fn is_unknown_source(&self, env: &CtxEnv<'_>, n: NodeId) -> bool {
        let ctx = env.ctx;
        let PagNode::Value(v) = ctx.pta.pag().node(n) else {
            return false;
        };
        let Some(cs) = ctx.prog.def_inst(v) else {
            return false;
        };
        ctx.prog.is_call(cs)
            && ctx.pta.callees(cs).any(|f| {
                ctx.prog.func(f).is_declaration() && ctx.api.func_kind(&ctx.prog, f).is_none()
            })
    }

    fn traverse_pts(&mut self, env: &CtxEnv<'_>, root: NodeId, root_ctx: C) -> Query<C> {
        let pta = &env.ctx.pta;
        let pag = pta.pag();
        let dummy = pag.obj_node(pta.dummy());
        let mut out = CsPts::new();
        let mut visited: BTreeSet<(NodeId, CtxId)> = BTreeSet::new();
        let mut work: Vec<(NodeId, C)> = vec![(root, root_ctx)];

        while let Some((x, c)) = work.pop() {
            if !visited.insert((x, self.pool.intern(c.clone()))) {
                continue;
            }
            self.spend()?;
            if self.is_unknown_source(env, x) {
                out.add(dummy, C::global());
            }
            for e in pag.in_edges(x) {
                match e.kind {
                    PagEdgeKind::Addr => {
                        let Some(o) = pag.as_obj(e.src) else {
                            continue;
                        };
                        let obj = pta.obj(o);
                        if obj.is_dummy() {
                            continue;
                        }
                        let oc = if obj.is_global() { C::global() } else { c.clone() };
                        out.add(e.src, oc);
                    }
                    PagEdgeKind::Copy => work.push((e.src, c.clone())),
                    PagEdgeKind::Call(cs) | PagEdgeKind::Fork(cs) => {
                        let mut up = c.clone();
                        if up.pop(cs, env) {
                            work.push((e.src, up));
                        }
                    }
                    PagEdgeKind::Ret(cs) | PagEdgeKind::Join(cs) => {
                        if c.has_cycle(cs) {
                            continue;
                        }
                        let mut down = c.clone();
                        down.push(cs);
                        work.push((e.src, down));
                    }
                    PagEdgeKind::Load => {
                        // x = *src: whatever was stored through an alias of src.
                        let aliases = self.alias_pointers_impl(env, e.src, c.clone())?;
                        for (q, qctxs) in aliases.iter() {
                            for st in pag.in_edges(q).filter(|s| s.kind == PagEdgeKind::Store) {
                                for qc in qctxs {
                                    work.push((st.src, qc.clone()));
                                }
                            }
                        }
                    }
                    PagEdgeKind::Store => {}
                    PagEdgeKind::NormalGep(k) => {
                        let base = self.points_to_impl(env, e.src, c.clone())?;
                        for (o_node, ctxs) in base.iter() {
                            if let Some(o) = pag.as_obj(o_node) {
                                let field = pta.objs().field_obj(o, k);
                                out.add_all(pag.obj_node(field), ctxs);
                            }
                        }
                    }
                    PagEdgeKind::VariantGep => {
                        let base = self.points_to_impl(env, e.src, c.clone())?;
                        for (o_node, ctxs) in base.iter() {
                            let Some(o) = pag.as_obj(o_node) else {
                                continue;
                            };
                            if pta.obj(o).is_dummy() {
                                out.add_all(o_node, ctxs);
                                continue;
                            }
                            for field in pta.objs().all_fields(o) {
                                out.add_all(pag.obj_node(field), ctxs);
                            }
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn traverse_fts(&mut self, env: &CtxEnv<'_>, root: NodeId, offset: Option<u32>, root_ctx: C) -> Query<C> {
        let pag = env.ctx.pta.pag();
        let mut out = CsPts::new();
        let mut visited: BTreeSet<(NodeId, CtxId)> = BTreeSet::new();
        let mut work: Vec<(NodeId, C)> = vec![(root, root_ctx)];

        while let Some((x, c)) = work.pop() {
            if !visited.insert((x, self.pool.intern(c.clone()))) {
                continue;
            }
            self.spend()?;
            if offset.is_none() {
                let dereferenced = pag.out_edges(x).any(|e| e.kind == PagEdgeKind::Load)
                    || pag.in_edges(x).any(|e| e.kind == PagEdgeKind::Store);
                if dereferenced {
                    out.add(x, c.clone());
                }
            }
            for e in pag.out_edges(x) {
                match e.kind {
                    PagEdgeKind::Addr | PagEdgeKind::Copy => work.push((e.dst, c.clone())),
                    PagEdgeKind::Call(cs) | PagEdgeKind::Fork(cs) => {
                        if c.has_cycle(cs) {
                            continue;
                        }
                        let mut down = c.clone();
                        down.push(cs);
                        work.push((e.dst, down));
                    }
                    PagEdgeKind::Ret(cs) | PagEdgeKind::Join(cs) => {
                        let mut up = c.clone();
                        if up.pop(cs, env) {
                            work.push((e.dst, up));
                        }
                    }
                    PagEdgeKind::Store => {
                        // *dst = x: loads through aliases of dst read x back.
                        let aliases = self.alias_pointers_impl(env, e.dst, c.clone())?;
                        for (q, qctxs) in aliases.iter() {
                            for ld in pag.out_edges(q).filter(|l| l.kind == PagEdgeKind::Load) {
                                for qc in qctxs {
                                    work.push((ld.dst, qc.clone()));
                                }
                            }
                        }
                    }
                    PagEdgeKind::Load => {}
                    PagEdgeKind::NormalGep(k) => {
                        if offset.is_none() && k > 0 {
                            continue;
                        }
                        if offset == Some(k) {
                            let fts = self.flows_to_impl(env, e.dst, None, c.clone())?;
                            out.union(&fts);
                        } else if k == 0 {
                            work.push((e.dst, c.clone()));
                        }
                    }
                    PagEdgeKind::VariantGep => {
                        let fts = self.flows_to_impl(env, e.dst, None, c.clone())?;
                        out.union(&fts);
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::analysis::collector::OperationCollector;
    use crate::analysis::context::AnalysisContext;
    use crate::cfl::context::CallString;
    use crate::core::config::DetectorConfig;
    use crate::ir::builder::ProgramBuilder;
    use crate::ir::ids::ValueId;
    use crate::mhp::MhpAnalysis;

    struct Fixture {
        ctx: AnalysisContext,
        mhp: MhpAnalysis,
        p: ValueId,
        q: ValueId,
        r: ValueId,
    }

    // main: a = alloca; b = alloca; p = id(a); q = id(b); r = id(a)
    fn identity_calls() -> Fixture {
        let mut b = ProgramBuilder::new();
        let main = b.declare("main", 0);
        let id = b.declare("id", 1);
        {
            let mut f = b.body(id);
            let x = f.param(0);
            f.ret(Some(x));
        }
        let (p, q, r);
        {
            let mut f = b.body(main);
            let a = f.alloca(1);
            let c = f.alloca(1);
            let cp = f.call(id, vec![a]);
            p = f.result(cp);
            let cq = f.call(id, vec![c]);
            q = f.result(cq);
            let cr = f.call(id, vec![a]);
            r = f.result(cr);
            f.ret(None);
        }
        let prog = b.finish().unwrap();
        let ctx = AnalysisContext::new(prog, DetectorConfig::default()).unwrap();
        let oc = OperationCollector::collect(&ctx);
        let mhp = MhpAnalysis::analyze(&ctx, &oc);
        Fixture { ctx, mhp, p, q, r }
    }

    #[test]
    fn test_return_matching_separates_call_sites() {
        let fx = identity_calls();
        let env = CtxEnv::new(&fx.ctx, &fx.mhp);
        let pag = fx.ctx.pta.pag();
        let dummy = pag.obj_node(fx.ctx.pta.dummy());
        let mut solver: CflSolver<CallString> = CflSolver::new(1000);

        let p = solver.points_to(&env, pag.value_node(fx.p), CallString::new());
        let q = solver.points_to(&env, pag.value_node(fx.q), CallString::new());
        let r = solver.points_to(&env, pag.value_node(fx.r), CallString::new());
        assert!(p.is_solved() && q.is_solved() && r.is_solved());
        assert_eq!(p.len(), 1);
        assert!(!p.alias(&q, dummy));
        assert!(p.alias(&r, dummy));

        // The insensitive analysis merges both through `id`.
        assert!(fx.ctx.pta.alias(fx.p, fx.q));
    }

    #[test]
    fn test_budget_exhaustion_is_sticky() {
        let fx = identity_calls();
        let env = CtxEnv::new(&fx.ctx, &fx.mhp);
        let pag = fx.ctx.pta.pag();
        let mut solver: CflSolver<CallString> = CflSolver::new(2);

        let p = solver.points_to(&env, pag.value_node(fx.p), CallString::new());
        assert_eq!(p.status(), QueryStatus::OutOfBudget);
        assert_eq!(solver.out_of_budget_queries(), 1);
        let again = solver.points_to(&env, pag.value_node(fx.p), CallString::new());
        assert_eq!(again.status(), QueryStatus::OutOfBudget);
    }

    #[test]
    fn test_same_budget_same_answer() {
        let fx = identity_calls();
        let env = CtxEnv::new(&fx.ctx, &fx.mhp);
        let pag = fx.ctx.pta.pag();
        let run = |budget: i64| {
            let mut solver: CflSolver<CallString> = CflSolver::new(budget);
            let a = solver.alias_pointers(&env, pag.value_node(fx.p), CallString::new());
            (a.status(), a.nodes().collect::<Vec<_>>())
        };
        for budget in [1, 3, 10, 1000] {
            assert_eq!(run(budget), run(budget));
        }
    }

    #[test]
    fn test_out_of_range_node_fails() {
        let fx = identity_calls();
        let env = CtxEnv::new(&fx.ctx, &fx.mhp);
        let mut solver: CflSolver<CallString> = CflSolver::new(100);
        let n = NodeId::new(fx.ctx.pta.pag().num_nodes() + 5);
        let res = solver.points_to(&env, n, CallString::new());
        assert_eq!(res.status(), QueryStatus::OtherFailure);
        assert_eq!(solver.stats(), CacheStats::default());
    }
}
