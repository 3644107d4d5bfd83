// SPDX-License-Identifier: GPL-2.0
//! Tests for race_detector::partition

use std::collections::{BTreeMap, BTreeSet};

use race_detector::prelude::*;
use race_detector::partition::ordered_pair;

struct Fixture {
    ctx: AnalysisContext,
    globals: Vec<ValueId>,
}

/// `touch(p)` writes through `p` and is called on `c` and `d`, so both
/// share one access. `a` and `b` are accessed directly by `worker` and
/// `main`.
fn shared_program() -> Fixture {
    let mut pb = ProgramBuilder::new();
    let a = pb.global("a", 0);
    let b = pb.global("b", 0);
    let c = pb.global("c", 0);
    let d = pb.global("d", 0);
    let touch = pb.declare("touch", 1);
    let worker = pb.declare("worker", 1);
    let main = pb.declare("main", 0);
    {
        let mut fb = pb.body(touch);
        let p = fb.param(0);
        let one = fb.const_int(1);
        fb.store(p, one);
        fb.ret(None);
    }
    {
        let mut fb = pb.body(worker);
        let one = fb.const_int(1);
        fb.store(a, one);
        fb.load(b);
        fb.call(touch, vec![c]);
        fb.ret(None);
    }
    {
        let mut fb = pb.body(main);
        let tid = fb.alloca(0);
        let null = fb.null();
        let routine = fb.func_addr(worker);
        fb.call_named("thread_create", vec![tid, routine, null]);
        fb.load(a);
        let two = fb.const_int(2);
        fb.store(b, two);
        fb.call(touch, vec![d]);
        fb.ret(None);
    }
    let prog = pb.finish().unwrap();
    let ctx = AnalysisContext::new(prog, DetectorConfig::default()).unwrap();
    Fixture {
        ctx,
        globals: vec![a, b, c, d],
    }
}

fn global_obj(ctx: &AnalysisContext, v: ValueId) -> ObjId {
    ctx.pta.global_obj(ctx.prog.as_global(v).unwrap())
}

fn all_pairs(mp: &MemoryPartitioning) -> BTreeSet<(PartId, (AccessId, AccessId))> {
    mp.part_ids()
        .flat_map(|p| mp.risky(p).pairs().map(move |pair| (p, pair)))
        .collect()
}

#[test]
fn test_partition_soundness() {
    let fx = shared_program();
    let ctx = &fx.ctx;
    let oc = OperationCollector::collect(ctx);
    let mp = MemoryPartitioning::run(ctx, &oc);

    let mut accessed_by: BTreeMap<ObjId, BTreeSet<AccessId>> = BTreeMap::new();
    for ma in oc.accesses() {
        for o in ctx.pta.points_to(ma.ptr) {
            let obj = ctx.pta.obj(*o);
            if !obj.is_dummy() && !obj.is_function() {
                accessed_by.entry(*o).or_default().insert(ma.id);
            }
        }
    }

    let objs: Vec<ObjId> = accessed_by.keys().copied().collect();
    for &o1 in &objs {
        for &o2 in &objs {
            let same_part = mp.part_of(o1) == mp.part_of(o2);
            let same_accesses = accessed_by[&o1] == accessed_by[&o2];
            assert_eq!(same_part, same_accesses, "{} {}", o1, o2);
        }
    }

    let (a, c, d) = (
        global_obj(ctx, fx.globals[0]),
        global_obj(ctx, fx.globals[2]),
        global_obj(ctx, fx.globals[3]),
    );
    assert_eq!(mp.part_of(c), mp.part_of(d));
    assert_ne!(mp.part_of(a), mp.part_of(c));
    assert!(mp.part_of(a).is_some());
}

#[test]
fn test_filters_only_remove_pairs() {
    let fx = shared_program();
    let ctx = &fx.ctx;
    let oc = OperationCollector::collect(ctx);
    let mut mp = MemoryPartitioning::run(ctx, &oc);
    let tea = ThreadEscapeAnalysis::analyze(ctx, &oc, &mp);
    mp.apply_escape(&tea);
    let mhp = MhpAnalysis::analyze(ctx, &oc);
    mp.apply_mhp(ctx, &oc, &mhp, &tea, |_, _, _| false);

    let seeded = all_pairs(&mp);
    assert!(!seeded.is_empty());

    let lsa = LocksetAnalysis::analyze(ctx);
    mp.apply_pair_filter(|_, a, b| {
        lsa.protected_by_common_locks(ctx, oc.access(a).inst, oc.access(b).inst)
    });
    let after_lockset = all_pairs(&mp);
    assert!(after_lockset.is_subset(&seeded));

    // Drop every pair touching the first seeded access
    let (_, (first, _)) = *seeded.iter().next().unwrap();
    let removed = mp.apply_pair_filter(|_, a, b| a == first || b == first);
    let after = all_pairs(&mp);
    assert!(after.is_subset(&after_lockset));
    assert_eq!(after.len() + removed, after_lockset.len());
    assert!(after.iter().all(|(_, (a, b))| *a != first && *b != first));
}

#[test]
fn test_c_and_d_race_through_shared_callee() {
    let fx = shared_program();
    let config = DetectorConfig::default().with_context_mode(ContextMode::Disabled);
    let result = RaceDetector::new(fx.ctx.prog.clone(), config)
        .unwrap()
        .run()
        .unwrap();
    // a, b and the c/d partition each have a write racing with the other
    // thread
    assert_eq!(result.report.len(), 3);
    let c = global_obj(&fx.ctx, fx.globals[2]);
    let d = global_obj(&fx.ctx, fx.globals[3]);
    let w = result.report.warning_for(c).unwrap();
    assert!(w.objects.contains(&d));
    assert!(result
        .report
        .warning_for(global_obj(&fx.ctx, fx.globals[0]))
        .is_some());
}

#[test]
fn test_shared_callee_split_by_spawn_context() {
    let fx = shared_program();
    let result = RaceDetector::new(fx.ctx.prog.clone(), DetectorConfig::default())
        .unwrap()
        .run()
        .unwrap();
    // `touch` writes `c` on the worker and `d` on main, never the same object
    assert_eq!(result.report.len(), 2);
    assert!(result
        .report
        .warning_for(global_obj(&fx.ctx, fx.globals[2]))
        .is_none());
}

/// `worker` writes `g` twice, `main` reads it twice while `worker` runs
fn crowded_program(config: DetectorConfig) -> AnalysisContext {
    let mut pb = ProgramBuilder::new();
    let g = pb.global("g", 0);
    let worker = pb.declare("worker", 1);
    let main = pb.declare("main", 0);
    {
        let mut fb = pb.body(worker);
        let one = fb.const_int(1);
        fb.store(g, one);
        fb.store(g, one);
        fb.ret(None);
    }
    {
        let mut fb = pb.body(main);
        let tid = fb.alloca(0);
        let null = fb.null();
        let routine = fb.func_addr(worker);
        fb.call_named("thread_create", vec![tid, routine, null]);
        fb.load(g);
        fb.load(g);
        fb.ret(None);
    }
    AnalysisContext::new(pb.finish().unwrap(), config).unwrap()
}

fn g_partition(ctx: &AnalysisContext, mp: &MemoryPartitioning) -> PartId {
    let g = ctx.prog.globals().next().unwrap().id;
    mp.part_of(ctx.pta.global_obj(g)).unwrap()
}

fn seeded(ctx: &AnalysisContext) -> MemoryPartitioning {
    let oc = OperationCollector::collect(ctx);
    let mut mp = MemoryPartitioning::run(ctx, &oc);
    let tea = ThreadEscapeAnalysis::analyze(ctx, &oc, &mp);
    mp.apply_escape(&tea);
    let mhp = MhpAnalysis::analyze(ctx, &oc);
    mp.apply_mhp(ctx, &oc, &mhp, &tea, |_, _, _| false);
    mp
}

#[test]
fn test_budget_cap_stops_accumulation() {
    let ctx = crowded_program(DetectorConfig::default().with_risky_pair_budget(2));
    let mp = seeded(&ctx);
    let set = mp.risky(g_partition(&ctx, &mp));
    assert!(set.is_over_budget());
    assert!(set.len() <= 2);
}

#[test]
fn test_compute_all_ignores_cap() {
    let mut config = DetectorConfig::default().with_risky_pair_budget(2);
    config.compute_all_risky_pairs = true;
    let ctx = crowded_program(config);
    let mp = seeded(&ctx);
    assert_eq!(mp.risky(g_partition(&ctx, &mp)).len(), 4);

    let ctx = crowded_program(DetectorConfig::default());
    let mp = seeded(&ctx);
    let set = mp.risky(g_partition(&ctx, &mp));
    assert_eq!(set.len(), 4);
    assert!(!set.is_over_budget());
}

#[test]
fn test_over_budget_partition_is_reported() {
    let ctx = crowded_program(DetectorConfig::default().with_risky_pair_budget(2));
    let detector = RaceDetector::from_context(ctx);
    let result = detector.run().unwrap();
    assert_eq!(result.report.len(), 1);
    let w = &result.report.warnings()[0];
    assert!(w.over_budget);
    assert_eq!(w.accesses.len(), 4);
    // Any two of its accesses count as racing
    assert!(result.report.has_race_between(w.accesses[0], w.accesses[1]));
}

#[test]
fn test_risky_pair_set_cap() {
    let ids: Vec<AccessId> = (0..4).map(AccessId::new).collect();
    let mut capped = RiskyPairSet::new(3, false);
    capped.add_pairs_from(&ids[..2], &ids[2..]);
    assert!(capped.is_over_budget());
    assert!(capped.is_empty());

    let mut all = RiskyPairSet::new(3, true);
    all.add_pairs_from(&ids[..2], &ids[2..]);
    assert_eq!(all.len(), 4);
    assert!(all.contains(ids[3], ids[0]));
    assert_eq!(all.pairs().next(), Some(ordered_pair(ids[2], ids[0])));
}
