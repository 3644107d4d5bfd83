// SPDX-License-Identifier: GPL-2.0
//! Memory partitioning.
//!
//! Objects accessed by exactly the same accesses form one partition; each
//! partition keeps the access pairs that may still race, and the escape
//! analysis drops partitions only one thread can see.

pub mod escape;
pub mod mem_part;
pub mod risky;

pub use escape::*;
pub use mem_part::*;
pub use risky::*;
