// SPDX-License-Identifier: GPL-2.0
//! Tests for race_detector::cfl::csaa

use race_detector::cfl::{ContextSensitiveAliasAnalysis, CsaaEnv};
use race_detector::prelude::*;

/// `make` returns a fresh allocation; `main` and `worker` each write
/// through their own, and both also write the shared global `g`
fn program(mode: ContextMode, budget: i64) -> AnalysisContext {
    let mut pb = ProgramBuilder::new();
    let g = pb.global("g", 0);
    let make = pb.declare("make", 0);
    let worker = pb.declare("worker", 1);
    let main = pb.declare("main", 0);
    {
        let mut fb = pb.body(make);
        let m = fb.malloc(1);
        fb.ret(Some(m));
    }
    {
        let mut fb = pb.body(worker);
        let c = fb.call(make, vec![]);
        let p = fb.result(c);
        let one = fb.const_int(1);
        fb.store(p, one);
        fb.store(g, one);
        fb.ret(None);
    }
    {
        let mut fb = pb.body(main);
        let tid = fb.alloca(0);
        let null = fb.null();
        let routine = fb.func_addr(worker);
        fb.call_named("thread_create", vec![tid, routine, null]);
        let c = fb.call(make, vec![]);
        let p = fb.result(c);
        let zero = fb.const_int(0);
        fb.store(p, zero);
        fb.store(g, zero);
        fb.ret(None);
    }
    let config = DetectorConfig::default()
        .with_context_mode(mode)
        .with_cfl_query_budget(budget);
    AnalysisContext::new(pb.finish().unwrap(), config).unwrap()
}

/// Verdict for every pair of writes, from a cold cache
fn verdicts(ctx: &AnalysisContext) -> (Vec<bool>, usize) {
    let oc = OperationCollector::collect(ctx);
    let mhp = MhpAnalysis::analyze(ctx, &oc);
    let env = CsaaEnv::new(ctx, &oc, &mhp);
    let mut csaa = ContextSensitiveAliasAnalysis::new(&ctx.config).unwrap();
    let writes: Vec<AccessId> = oc.accesses().iter().filter(|a| a.is_write).map(|a| a.id).collect();
    let mut out = Vec::new();
    for &a in &writes {
        for &b in &writes {
            out.push(csaa.must_not_access_aliases(&env, a, b));
        }
    }
    (out, csaa.stats().out_of_budget)
}

#[test]
fn test_same_budget_same_verdicts() {
    for mode in [ContextMode::Hybrid, ContextMode::Standard] {
        for budget in [1, 4, 16, 1000] {
            let first = verdicts(&program(mode, budget));
            let second = verdicts(&program(mode, budget));
            assert_eq!(first, second, "{:?} {}", mode, budget);
        }
    }
}

#[test]
fn test_exhausted_budget_is_conservative() {
    let (tight, out_of_budget) = verdicts(&program(ContextMode::Hybrid, 1));
    assert!(out_of_budget > 0);
    let (ample, _) = verdicts(&program(ContextMode::Hybrid, 1000));
    // Every pair proven apart under the tight budget is also proven apart
    // with room to spare
    for (t, a) in tight.iter().zip(&ample) {
        assert!(!t || *a);
    }
}

#[test]
fn test_shared_global_is_never_refined() {
    let ctx = program(ContextMode::Hybrid, 1000);
    let oc = OperationCollector::collect(&ctx);
    let mhp = MhpAnalysis::analyze(&ctx, &oc);
    let env = CsaaEnv::new(&ctx, &oc, &mhp);
    let mut csaa = ContextSensitiveAliasAnalysis::new(&ctx.config).unwrap();

    let g = ctx.prog.globals().next().unwrap().id;
    let g_obj = ctx.pta.global_obj(g);
    let g_writes: Vec<AccessId> = oc
        .accesses()
        .iter()
        .filter(|a| a.is_write && ctx.pta.points_to(a.ptr).contains(&g_obj))
        .map(|a| a.id)
        .collect();
    assert_eq!(g_writes.len(), 2);
    assert!(!csaa.must_not_access_aliases(&env, g_writes[0], g_writes[1]));
}

/// Two spawn sites run `worker`, one on `x` and one on `y`
fn shared_routine(mode: ContextMode) -> (Program, DetectorConfig, InstId) {
    let mut pb = ProgramBuilder::new();
    let x = pb.global("x", 0);
    let y = pb.global("y", 0);
    let worker = pb.declare("worker", 1);
    let main = pb.declare("main", 0);
    let store = {
        let mut fb = pb.body(worker);
        let p = fb.param(0);
        let one = fb.const_int(1);
        let s = fb.store(p, one);
        fb.ret(None);
        s
    };
    {
        let mut fb = pb.body(main);
        let t1 = fb.alloca(0);
        let t2 = fb.alloca(0);
        let routine = fb.func_addr(worker);
        fb.call_named("thread_create", vec![t1, routine, x]);
        fb.call_named("thread_create", vec![t2, routine, y]);
        fb.ret(None);
    }
    let config = DetectorConfig::default().with_context_mode(mode);
    (pb.finish().unwrap(), config, store)
}

#[test]
fn test_threads_of_different_spawn_sites_are_separated() {
    let (prog, config, store) = shared_routine(ContextMode::Disabled);
    let result = RaceDetector::new(prog, config).unwrap().run().unwrap();
    assert!(result.report.has_race_between(store, store));

    for mode in [ContextMode::Hybrid, ContextMode::Standard] {
        let (prog, config, _) = shared_routine(mode);
        let result = RaceDetector::new(prog, config).unwrap().run().unwrap();
        assert!(result.is_race_free(), "{:?}", mode);
    }
}

#[test]
fn test_trunk_context_does_not_enter_its_own_thread() {
    let (prog, config, store) = shared_routine(ContextMode::Hybrid);
    let ctx = AnalysisContext::new(prog, config).unwrap();
    let oc = OperationCollector::collect(&ctx);
    let mhp = MhpAnalysis::analyze(&ctx, &oc);
    let env = CsaaEnv::new(&ctx, &oc, &mhp);
    let mut csaa = ContextSensitiveAliasAnalysis::new(&ctx.config).unwrap();

    let a = oc.accesses_of(store)[0];
    assert!(csaa.must_not_access_aliases(&env, a, a));
}
