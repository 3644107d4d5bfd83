// SPDX-License-Identifier: GPL-2.0
//! Core types shared by every analysis.
//!
//! This module contains error definitions, the diagnostics log, the detector
//! configuration and run statistics.

pub mod config;
pub mod error;
pub mod log;
pub mod stats;

pub use config::*;
pub use error::*;
pub use self::log::*;
pub use stats::*;
