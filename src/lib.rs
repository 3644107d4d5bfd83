// SPDX-License-Identifier: GPL-2.0

//! # Static data race detection
//!
//! A whole-program static data race detector for multithreaded programs.
//!
//! Memory objects are grouped into partitions of objects touched by exactly
//! the same accesses. Each partition carries a set of risky access pairs,
//! seeded from may-happen-in-parallel reachability and then pruned by a
//! chain of increasingly expensive filters. Whatever survives is reported.
//!
//! ## Features
//!
//! - **Memory Partitioning**: Groups objects by their access sets and bounds risky pairs per partition
//! - **Thread Escape**: Drops partitions no other thread can reach
//! - **MHP Analysis**: Trunk/branch reachability per spawn site, with join matching
//! - **Lockset and Barrier Analysis**: Drops pairs ordered by common locks or barrier waits
//! - **Refinements**: Thread join, path guard and heap instance refinements
//! - **CFL-Reachability Aliasing**: Context-sensitive alias queries under a budget
//! - **Reports and Annotation**: Sorted race warnings, check ids and a pair file
//!
//! ## Module Structure
//!
//! - [`core`]: Errors, configuration, diagnostics log and statistics
//! - [`ir`]: Program representation, builder and per-function CFG analyses
//! - [`pta`]: Inclusion-based points-to analysis
//! - [`analysis`]: Call graph, SCC order, thread API and operation collection
//! - [`partition`]: Memory partitioning, risky pairs and thread escape
//! - [`mhp`]: May-happen-in-parallel analysis
//! - [`sync`]: Lockset, barrier and guard analyses
//! - [`cfl`]: Context-sensitive alias analysis
//! - [`refine`]: Join, path and heap refinements
//! - [`report`]: Race reports, annotation, pair file and validation
//! - [`detector`]: The detection pipeline

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Errors, configuration, logging and statistics
pub mod core;

/// Program representation
pub mod ir;

/// Points-to analysis
pub mod pta;

/// Whole-program analysis framework
pub mod analysis;

/// Memory partitioning
pub mod partition;

/// May-happen-in-parallel analysis
pub mod mhp;

/// Synchronization analyses
pub mod sync;

/// Context-sensitive alias analysis
pub mod cfl;

/// Refinements of risky pairs
pub mod refine;

/// Reports and their consumers
pub mod report;

/// Detection pipeline
pub mod detector;

// ============================================================================
// Prelude - commonly used re-exports
// ============================================================================

/// Commonly used types and traits
pub mod prelude {
    // Core types and errors
    pub use crate::core::config::{ContextMode, DetectorConfig};
    pub use crate::core::error::{AnalysisError, Result};
    pub use crate::core::log::{AnalysisLog, LogLevel};
    pub use crate::core::stats::{AnalysisStats, Phase};

    // Program representation
    pub use crate::ir::builder::{FunctionBuilder, ProgramBuilder};
    pub use crate::ir::ids::{AccessId, BlockId, FuncId, GlobalId, InstId, ObjId, PartId, ValueId};
    pub use crate::ir::inst::{BinOp, Predicate, SourceLoc};
    pub use crate::ir::program::Program;

    // Analyses
    pub use crate::analysis::collector::OperationCollector;
    pub use crate::analysis::context::AnalysisContext;
    pub use crate::mhp::MhpAnalysis;
    pub use crate::partition::{MemoryPartitioning, RiskyPairSet, ThreadEscapeAnalysis};
    pub use crate::sync::{BarrierAnalysis, LocksetAnalysis};

    // Results
    pub use crate::detector::{DetectionResult, RaceDetector};
    pub use crate::report::{RaceAnnotation, RaceReport, RaceWarning, ResultValidator};
}

// Re-export error types at crate root for convenience
pub use crate::core::error::{AnalysisError, Result};
