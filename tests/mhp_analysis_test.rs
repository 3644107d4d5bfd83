// SPDX-License-Identifier: GPL-2.0
//! Tests for race_detector::mhp::analysis

use race_detector::prelude::*;

/// `main` spawns `worker` inside a loop, then spawns `helper` once and
/// joins it. Every function touches `g`.
fn program() -> AnalysisContext {
    let mut pb = ProgramBuilder::new();
    let g = pb.global("g", 0);
    let worker = pb.declare("worker", 1);
    let helper = pb.declare("helper", 1);
    let main = pb.declare("main", 0);
    for f in [worker, helper] {
        let mut fb = pb.body(f);
        let v = fb.load(g);
        fb.store(g, v);
        fb.ret(None);
    }
    {
        let mut fb = pb.body(main);
        let entry = fb.current_block();
        let header = fb.new_block();
        let body = fb.new_block();
        let exit = fb.new_block();

        let tid = fb.alloca(0);
        let tid2 = fb.alloca(0);
        let null = fb.null();
        let zero = fb.const_int(0);
        let n = fb.const_int(3);
        fb.br(header);

        fb.position_at(header);
        let i = fb.phi(vec![(zero, entry)]);
        let c = fb.cmp(Predicate::Slt, i, n);
        fb.cond_br(c, body, exit);

        fb.position_at(body);
        let routine = fb.func_addr(worker);
        fb.call_named("thread_create", vec![tid, routine, null]);
        let one = fb.const_int(1);
        let next = fb.binop(BinOp::Add, i, one);
        fb.add_incoming(i, next, body);
        fb.br(header);

        fb.position_at(exit);
        fb.store(g, zero);
        let routine = fb.func_addr(helper);
        fb.call_named("thread_create", vec![tid2, routine, null]);
        fb.load(g);
        let t = fb.load(tid2);
        fb.call_named("thread_join", vec![t]);
        fb.load(g);
        fb.ret(None);
    }
    AnalysisContext::new(pb.finish().unwrap(), DetectorConfig::default()).unwrap()
}

fn accessing_insts(oc: &OperationCollector) -> Vec<InstId> {
    let mut insts: Vec<InstId> = oc.accesses().iter().map(|a| a.inst).collect();
    insts.dedup();
    insts
}

#[test]
fn test_mhp_symmetry() {
    let ctx = program();
    let oc = OperationCollector::collect(&ctx);
    let mhp = MhpAnalysis::analyze(&ctx, &oc);
    let insts = accessing_insts(&oc);
    assert!(insts.len() >= 8);
    for &a in &insts {
        for &b in &insts {
            assert_eq!(
                mhp.may_happen_in_parallel(&ctx, a, b),
                mhp.may_happen_in_parallel(&ctx, b, a),
                "{} {}",
                a,
                b
            );
        }
    }
}

#[test]
fn test_symmetry_survives_refinement() {
    let ctx = program();
    let oc = OperationCollector::collect(&ctx);
    let mut mhp = MhpAnalysis::analyze(&ctx, &oc);
    mhp.perform_refinement(&ctx);
    assert!(mhp.is_refined());
    let insts = accessing_insts(&oc);
    for &a in &insts {
        for &b in &insts {
            assert_eq!(
                mhp.may_happen_in_parallel(&ctx, a, b),
                mhp.may_happen_in_parallel(&ctx, b, a)
            );
        }
    }
}

#[test]
fn test_code_after_loop_spawn_is_parallel() {
    let ctx = program();
    let oc = OperationCollector::collect(&ctx);
    let mhp = MhpAnalysis::analyze(&ctx, &oc);
    assert_eq!(mhp.spawn_sites().count(), 2);

    // The store at the loop exit runs after the loop spawned workers
    let main = ctx.prog.require_func("main").unwrap();
    let exit_store = ctx
        .prog
        .func_insts(main)
        .find(|i| !oc.accesses_of(*i).is_empty())
        .unwrap();
    assert!(!mhp.is_sequential(&ctx, exit_store));
}

struct JoinLoops {
    prog: Program,
    worker_store: InstId,
    after_store: InstId,
    spawn: InstId,
    join: InstId,
}

/// `main` spawns `worker` over `tids[i]` for `i < spawns`, then joins
/// `tids[j]` for `j < joins` and writes `g`
fn join_loops(spawns: i64, joins: i64) -> JoinLoops {
    let mut pb = ProgramBuilder::new();
    let g = pb.global("g", 0);
    let worker = pb.declare("worker", 1);
    let main = pb.declare("main", 0);
    let worker_store = {
        let mut fb = pb.body(worker);
        let one = fb.const_int(1);
        let s = fb.store(g, one);
        fb.ret(None);
        s
    };
    let (spawn, join, after_store) = {
        let mut fb = pb.body(main);
        let entry = fb.current_block();
        let spawn_header = fb.new_block();
        let spawn_body = fb.new_block();
        let between = fb.new_block();
        let join_header = fb.new_block();
        let join_body = fb.new_block();
        let exit = fb.new_block();

        let tids = fb.alloca(0);
        let null = fb.null();
        let zero = fb.const_int(0);
        let one = fb.const_int(1);
        let n_spawns = fb.const_int(spawns);
        let n_joins = fb.const_int(joins);
        fb.br(spawn_header);

        fb.position_at(spawn_header);
        let i = fb.phi(vec![(zero, entry)]);
        let c = fb.cmp(Predicate::Slt, i, n_spawns);
        fb.cond_br(c, spawn_body, between);

        fb.position_at(spawn_body);
        let slot = fb.gep_index(tids, i);
        let routine = fb.func_addr(worker);
        let spawn = fb.call_named("thread_create", vec![slot, routine, null]);
        let next = fb.binop(BinOp::Add, i, one);
        fb.add_incoming(i, next, spawn_body);
        fb.br(spawn_header);

        fb.position_at(between);
        fb.br(join_header);

        fb.position_at(join_header);
        let j = fb.phi(vec![(zero, between)]);
        let c = fb.cmp(Predicate::Slt, j, n_joins);
        fb.cond_br(c, join_body, exit);

        fb.position_at(join_body);
        let slot = fb.gep_index(tids, j);
        let t = fb.load(slot);
        let join = fb.call_named("thread_join", vec![t]);
        let next = fb.binop(BinOp::Add, j, one);
        fb.add_incoming(j, next, join_body);
        fb.br(join_header);

        fb.position_at(exit);
        let two = fb.const_int(2);
        let after_store = fb.store(g, two);
        fb.ret(None);
        (spawn, join, after_store)
    };
    JoinLoops {
        prog: pb.finish().unwrap(),
        worker_store,
        after_store,
        spawn,
        join,
    }
}

#[test]
fn test_join_loop_with_equal_bounds_blocks_spawn_loop() {
    let fx = join_loops(4, 4);
    let ctx = AnalysisContext::new(fx.prog.clone(), DetectorConfig::default()).unwrap();
    let oc = OperationCollector::collect(&ctx);
    let mhp = MhpAnalysis::analyze(&ctx, &oc);

    let spawn = mhp.spawn_site_info(fx.spawn).unwrap();
    assert!(spawn.loop_id.is_some());
    assert!(spawn.offset.is_some());
    assert_eq!(mhp.join_site_info(fx.join).unwrap().matching_spawn, Some(fx.spawn));
    assert_eq!(mhp.unmatched_joins().count(), 0);
    assert!(mhp.is_sequential(&ctx, fx.after_store));

    let result = RaceDetector::new(fx.prog, DetectorConfig::default())
        .unwrap()
        .run()
        .unwrap();
    // Workers still race among themselves
    assert!(result.report.has_race_between(fx.worker_store, fx.worker_store));
    assert!(!result.report.has_race_between(fx.worker_store, fx.after_store));
}

#[test]
fn test_join_loop_with_fewer_iterations_stays_unmatched() {
    let fx = join_loops(4, 2);
    let ctx = AnalysisContext::new(fx.prog.clone(), DetectorConfig::default()).unwrap();
    let oc = OperationCollector::collect(&ctx);
    let mhp = MhpAnalysis::analyze(&ctx, &oc);

    assert_eq!(mhp.join_site_info(fx.join).unwrap().matching_spawn, None);
    assert!(!mhp.is_sequential(&ctx, fx.after_store));

    let result = RaceDetector::new(fx.prog, DetectorConfig::default())
        .unwrap()
        .run()
        .unwrap();
    assert!(result.report.has_race_between(fx.worker_store, fx.after_store));
}
