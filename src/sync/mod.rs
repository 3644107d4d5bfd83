// SPDX-License-Identifier: GPL-2.0
//! Synchronization analyses.
//!
//! Path guards, locksets and barrier effects. Each answers one question
//! about a pair of accesses: whether a common lock protects both, or
//! whether a barrier separates them.

pub mod barrier;
pub mod guard;
pub mod lockset;

pub use barrier::*;
pub use guard::*;
pub use lockset::*;
