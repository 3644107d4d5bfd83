// SPDX-License-Identifier: GPL-2.0
//! Whole-program foundations for the race analyses.
//!
//! This module contains thread API classification, call graph
//! construction, the SCC order and interprocedural driver, the shared
//! analysis context, and operation collection.

pub mod callgraph;
pub mod collector;
pub mod context;
pub mod interproc;
pub mod scc;
pub mod thread_api;

pub use callgraph::*;
pub use collector::*;
pub use context::*;
pub use interproc::*;
pub use scc::*;
pub use thread_api::*;
