// SPDX-License-Identifier: GPL-2.0
//! Demand-driven refinements of the coarse MHP results.
//!
//! Each filter answers, for one risky pair, whether the two accesses provably
//! cannot race. They are consulted only for pairs left by the cheaper
//! escape, MHP, lockset and barrier filters.

pub mod heap;
pub mod join;
pub mod path;

pub use heap::*;
pub use join::*;
pub use path::*;
