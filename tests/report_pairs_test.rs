// SPDX-License-Identifier: GPL-2.0
//! Tests for race_detector::report::pairs

use std::path::PathBuf;

use race_detector::prelude::*;
use race_detector::report::{read_pairs, reorder_pairs};

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("race-detector-it-{}-{}.pairs", std::process::id(), name))
}

/// `worker` writes `x` and `y`; `main` writes `x` twice and reads `y`
fn program() -> Program {
    let mut pb = ProgramBuilder::new();
    let x = pb.global("x", 0);
    let y = pb.global("y", 0);
    let worker = pb.declare("worker", 1);
    let main = pb.declare("main", 0);
    {
        let mut fb = pb.body(worker);
        let one = fb.const_int(1);
        fb.store(x, one);
        fb.store(y, one);
        fb.ret(None);
    }
    {
        let mut fb = pb.body(main);
        let tid = fb.alloca(0);
        let null = fb.null();
        let routine = fb.func_addr(worker);
        fb.call_named("thread_create", vec![tid, routine, null]);
        let two = fb.const_int(2);
        fb.store(x, two);
        fb.store(x, two);
        fb.load(y);
        fb.ret(None);
    }
    pb.finish().unwrap()
}

#[test]
fn test_annotation_round_trips_through_pair_file() {
    let mut config = DetectorConfig::default();
    config.annotate = true;
    let result = RaceDetector::new(program(), config).unwrap().run().unwrap();
    assert_eq!(result.report.len(), 2);

    let ann = result.annotation.unwrap();
    // worker: x=0, y=1; main: x=2, x=3, y=4
    assert_eq!(ann.num_ids(), 5);
    let mut pairs = ann.to_pairs();
    pairs.sort();
    assert_eq!(pairs, vec![(0, 2), (0, 3), (1, 4)]);

    let path = temp_path("annotation");
    ann.write(&path).unwrap();
    assert_eq!(read_pairs(&path).unwrap(), ann.to_pairs());
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_reorder_puts_busy_ids_last() {
    let mut config = DetectorConfig::default();
    config.annotate = true;
    let result = RaceDetector::new(program(), config).unwrap().run().unwrap();
    let ann = result.annotation.unwrap();

    let input = temp_path("reorder-in");
    let output = temp_path("reorder-out");
    ann.write(&input).unwrap();
    assert_eq!(reorder_pairs(&input, &output).unwrap(), 3);
    // Id 0 is in two pairs, so both of its pairs weigh 3 against 2
    assert_eq!(read_pairs(&output).unwrap(), vec![(1, 4), (0, 2), (0, 3)]);
    let _ = std::fs::remove_file(&input);
    let _ = std::fs::remove_file(&output);
}

#[test]
fn test_missing_pair_file_is_an_error() {
    let path = temp_path("missing");
    assert!(matches!(read_pairs(&path), Err(AnalysisError::PairFile { .. })));
}
