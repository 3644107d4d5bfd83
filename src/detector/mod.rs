// SPDX-License-Identifier: GPL-2.0
//! Race detector entry point.
//!
//! [`RaceDetector`] owns the [`AnalysisContext`](crate::analysis::AnalysisContext)
//! of one program and runs the whole pipeline over it.

pub mod pipeline;

pub use pipeline::*;
