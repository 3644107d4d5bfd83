// SPDX-License-Identifier: GPL-2.0
//! May-happen-in-parallel analysis.
//!
//! Per spawn site, the code running on the spawning thread after the spawn
//! (trunk) and on the spawned thread (branch), loop-aware spawn/join
//! matching, and enumeration of the calling contexts behind a reachable
//! point.

pub mod analysis;
pub mod codeset;
pub mod join;
pub mod path_finder;
pub mod reachability;

pub use analysis::*;
pub use codeset::*;
pub use join::*;
pub use path_finder::*;
pub use reachability::*;
