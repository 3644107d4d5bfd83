// SPDX-License-Identifier: GPL-2.0
//! Context-sensitive alias analysis by CFL-reachability.
//!
//! Demand-driven points-to, flows-to and alias queries over the pointer
//! assignment graph, under plain call strings or hybrid contexts rooted at
//! a spawn site, with a per-query operation budget and result caches.

pub mod cache;
pub mod context;
pub mod csaa;
pub mod pts;
pub mod solver;

pub use cache::*;
pub use context::*;
pub use csaa::*;
pub use pts::*;
pub use solver::*;
