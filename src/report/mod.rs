// SPDX-License-Identifier: GPL-2.0
//! Race reports and their consumers: the annotation handed to a runtime
//! checker, the pair file, and a per-pair validator.

pub mod annotation;
pub mod pairs;
pub mod validator;
pub mod warning;

pub use annotation::*;
pub use pairs::*;
pub use validator::*;
pub use warning::*;
