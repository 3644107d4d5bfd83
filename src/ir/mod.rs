// SPDX-License-Identifier: GPL-2.0
//! Program representation.
//!
//! A closed set of instruction kinds over dense ids, a validating builder,
//! and the per-function CFG analyses (dominators, post-dominators, loops)
//! every race analysis relies on.

pub mod builder;
pub mod dom;
pub mod ids;
pub mod inst;
pub mod loops;
pub mod pass_pool;
pub mod program;
pub mod scev;

pub use builder::*;
pub use dom::*;
pub use ids::*;
pub use inst::*;
pub use loops::*;
pub use pass_pool::*;
pub use program::*;
pub use scev::*;
