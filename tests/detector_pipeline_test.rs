// SPDX-License-Identifier: GPL-2.0
//! Tests for race_detector::detector::pipeline

use race_detector::prelude::*;

struct Scenario {
    prog: Program,
    write: InstId,
    read: InstId,
}

/// `worker` writes `g = 10` under `m`; `main` spawns it and reads `g`
/// before joining, under `m` only when `read_locked`
fn lock_scenario(read_locked: bool) -> Scenario {
    let mut pb = ProgramBuilder::new();
    let g = pb.global_at("g", 0, Some(SourceLoc::new("race.c", 3)));
    let m = pb.global("m", 0);
    let worker = pb.declare("worker", 1);
    let main = pb.declare("main", 0);
    let write = {
        let mut fb = pb.body(worker);
        let ten = fb.const_int(10);
        fb.call_named("mutex_lock", vec![m]);
        let s = fb.store(g, ten);
        fb.call_named("mutex_unlock", vec![m]);
        fb.ret(None);
        s
    };
    let read = {
        let mut fb = pb.body(main);
        let tid = fb.alloca(0);
        let null = fb.null();
        let routine = fb.func_addr(worker);
        fb.call_named("thread_create", vec![tid, routine, null]);
        if read_locked {
            fb.call_named("mutex_lock", vec![m]);
        }
        let v = fb.load(g);
        let read = fb.def(v);
        if read_locked {
            fb.call_named("mutex_unlock", vec![m]);
        }
        let t = fb.load(tid);
        fb.call_named("thread_join", vec![t]);
        fb.ret(None);
        read
    };
    Scenario {
        prog: pb.finish().unwrap(),
        write,
        read,
    }
}

/// `worker` writes `g` and waits on `b`; `main` waits on `b` and then
/// reads `g`
fn barrier_scenario() -> Scenario {
    let mut pb = ProgramBuilder::new();
    let g = pb.global("g", 0);
    let b = pb.global("b", 0);
    let worker = pb.declare("worker", 1);
    let main = pb.declare("main", 0);
    let write = {
        let mut fb = pb.body(worker);
        let one = fb.const_int(1);
        let s = fb.store(g, one);
        fb.call_named("barrier_wait", vec![b]);
        fb.ret(None);
        s
    };
    let read = {
        let mut fb = pb.body(main);
        let tid = fb.alloca(0);
        let null = fb.null();
        let routine = fb.func_addr(worker);
        fb.call_named("thread_create", vec![tid, routine, null]);
        fb.call_named("barrier_wait", vec![b]);
        let v = fb.load(g);
        let read = fb.def(v);
        fb.ret(None);
        read
    };
    Scenario {
        prog: pb.finish().unwrap(),
        write,
        read,
    }
}

/// A loop spawns four threads, each handed its own fresh allocation
fn heap_scenario() -> Program {
    let mut pb = ProgramBuilder::new();
    let worker = pb.declare("worker", 1);
    let main = pb.declare("main", 0);
    {
        let mut fb = pb.body(worker);
        let p = fb.param(0);
        let one = fb.const_int(1);
        fb.store(p, one);
        fb.ret(None);
    }
    {
        let mut fb = pb.body(main);
        let entry = fb.current_block();
        let header = fb.new_block();
        let body = fb.new_block();
        let exit = fb.new_block();

        let tid = fb.alloca(0);
        let zero = fb.const_int(0);
        let four = fb.const_int(4);
        fb.br(header);

        fb.position_at(header);
        let i = fb.phi(vec![(zero, entry)]);
        let c = fb.cmp(Predicate::Slt, i, four);
        fb.cond_br(c, body, exit);

        fb.position_at(body);
        let p = fb.malloc(0);
        let routine = fb.func_addr(worker);
        fb.call_named("thread_create", vec![tid, routine, p]);
        let one = fb.const_int(1);
        let next = fb.binop(BinOp::Add, i, one);
        fb.add_incoming(i, next, body);
        fb.br(header);

        fb.position_at(exit);
        fb.ret(None);
    }
    pb.finish().unwrap()
}

fn detect(prog: Program, config: DetectorConfig) -> DetectionResult {
    RaceDetector::new(prog, config).unwrap().run().unwrap()
}

#[test]
fn test_unprotected_read_races() {
    let sc = lock_scenario(false);
    let result = detect(sc.prog, DetectorConfig::default());

    assert_eq!(result.report.len(), 1);
    let w = &result.report.warnings()[0];
    assert_eq!(w.objects.len(), 1);
    assert_eq!(w.loc, Some(SourceLoc::new("race.c", 3)));
    assert_eq!(w.accesses, vec![sc.write, sc.read]);
    assert_eq!(w.risky_pairs, vec![(sc.write, sc.read)]);
    assert!(!w.over_budget);
    assert!(result.report.has_race_between(sc.read, sc.write));
    assert_eq!(result.report.to_string(), "1 race in total");
    assert_eq!(result.stats.races, 1);
}

#[test]
fn test_common_lock_prevents_race() {
    let sc = lock_scenario(true);
    let result = detect(sc.prog, DetectorConfig::default());

    assert!(result.is_race_free());
    assert!(!result.report.involves(sc.read));
    assert_eq!(result.report.to_string(), "No race found.");
}

#[test]
fn test_barrier_separates_accesses() {
    let sc = barrier_scenario();
    let ctx = AnalysisContext::new(sc.prog.clone(), DetectorConfig::default()).unwrap();
    let oc = OperationCollector::collect(&ctx);
    let mhp = MhpAnalysis::analyze(&ctx, &oc);
    // Parallel as far as MHP can tell
    assert!(!mhp.may_happen_in_parallel(&ctx, sc.write, sc.read).is_empty());

    let result = detect(sc.prog, DetectorConfig::default());
    assert!(result.is_race_free());
}

#[test]
fn test_distinct_heap_instances_do_not_race() {
    let prog = heap_scenario();
    let ctx = AnalysisContext::new(prog.clone(), DetectorConfig::default()).unwrap();
    let oc = OperationCollector::collect(&ctx);
    let mp = MemoryPartitioning::run(&ctx, &oc);
    assert!(mp.parts().iter().any(|p| p.objs.iter().any(|o| ctx.pta.obj(*o).is_heap())));

    for mode in [ContextMode::Hybrid, ContextMode::Disabled] {
        let result = detect(prog.clone(), DetectorConfig::default().with_context_mode(mode));
        assert!(result.is_race_free(), "{:?}", mode);
    }
}

#[test]
fn test_annotation_numbers_racing_accesses() {
    let sc = lock_scenario(false);
    let mut config = DetectorConfig::default();
    config.annotate = true;
    let result = detect(sc.prog, config);

    let ann = result.annotation.unwrap();
    assert_eq!(ann.regular_checks().len(), 2);
    assert!(ann.regular_checks().contains(&sc.write));
    assert_eq!(ann.id_of(sc.write), Some(0));
    assert_eq!(ann.id_of(sc.read), Some(1));
    assert_eq!(ann.num_pairs(), 1);
    assert_eq!(ann.to_pairs(), vec![(0, 1)]);
}

#[test]
fn test_no_annotation_unless_requested() {
    let sc = lock_scenario(false);
    let result = detect(sc.prog, DetectorConfig::default());
    assert!(result.annotation.is_none());
}

#[test]
fn test_detail_report_lists_locksets() {
    let sc = lock_scenario(false);
    let config = DetectorConfig::default().with_detail(true);
    let result = detect(sc.prog, config);

    let details = result.report.details().unwrap();
    assert!(details.contains("dereferenced at 2 places"));
    assert!(details.contains("Locked --- @m"));
    assert!(details.contains("empty lock set"));
    assert!(result.report.to_string().ends_with("1 race in total"));
}

#[test]
fn test_validator_agrees_with_report() {
    let sc = lock_scenario(false);
    let detector = RaceDetector::new(sc.prog, DetectorConfig::default()).unwrap();
    let checks = detector
        .validate_pairs(&[(sc.write, sc.read), (sc.read, sc.read)])
        .unwrap();
    assert_eq!(checks, vec![true, false]);

    let sc = lock_scenario(true);
    let detector = RaceDetector::new(sc.prog, DetectorConfig::default()).unwrap();
    assert_eq!(detector.validate_pairs(&[(sc.write, sc.read)]).unwrap(), vec![false]);
}

#[test]
fn test_stats_follow_phases() {
    let sc = lock_scenario(false);
    let mut config = DetectorConfig::default();
    config.collect_stats = true;
    let result = detect(sc.prog, config);

    let stats = &result.stats;
    assert_eq!(stats.spawn_sites, 1);
    assert!(stats.accesses >= 2);
    let mhp = stats.pairs_after[&Phase::Mhp];
    let last = stats.pairs_after[&Phase::CsRefinement];
    assert!(last <= mhp);
    assert_eq!(last, 1);
}

#[test]
fn test_invalid_config_is_rejected() {
    let sc = lock_scenario(false);
    let config = DetectorConfig::default().with_risky_pair_budget(0);
    assert!(matches!(
        RaceDetector::new(sc.prog, config),
        Err(AnalysisError::InvalidConfig(_))
    ));
}

#[test]
fn test_validator_rejects_foreign_instructions() {
    let sc = lock_scenario(false);
    let bogus = InstId::new(sc.prog.num_insts() + 7);
    let detector = RaceDetector::new(sc.prog, DetectorConfig::default()).unwrap();
    assert!(matches!(
        detector.validate_pairs(&[(sc.write, bogus)]),
        Err(AnalysisError::UnknownInstruction(_))
    ));
}
