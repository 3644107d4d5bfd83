// SPDX-License-Identifier: GPL-2.0
//! Thread join refinement.
//!
//! The coarse MHP pass stops reachability only at joins it can place on the
//! spawning thread. A join executed by another thread is picked up by
//! [`MhpAnalysis::perform_refinement`]; this filter asks that refined
//! reachability about each risky pair.

use crate::analysis::context::AnalysisContext;
use crate::core::error::{AnalysisError, Result};
use crate::ir::ids::InstId;
use crate::mhp::MhpAnalysis;

/// Pairs ordered by a join on some other thread
#[derive(Debug, Clone, Copy)]
pub struct ThreadJoinRefinement<'a> {
    ctx: &'a AnalysisContext,
    mhp: &'a MhpAnalysis,
}

impl<'a> ThreadJoinRefinement<'a> {
    /// Run the refined reachability of `mhp` if it did not run yet
    pub fn new(ctx: &'a AnalysisContext, mhp: &'a mut MhpAnalysis) -> Self {
        if !mhp.is_refined() {
            mhp.perform_refinement(ctx);
        }
        Self { ctx, mhp }
    }

    /// Use the refined reachability `mhp` already holds
    pub fn from_refined(ctx: &'a AnalysisContext, mhp: &'a MhpAnalysis) -> Result<Self> {
        if !mhp.is_refined() {
            return Err(AnalysisError::NotInitialized("mhp refinement"));
        }
        Ok(Self { ctx, mhp })
    }

    /// Whether every spawn site under which `i1` and `i2` may run in
    /// parallel is ruled out by the refined reachability
    pub fn branch_join_refined(&self, i1: InstId, i2: InstId) -> bool {
        if i1 == i2 {
            return false;
        }
        for (rp1, _) in self.mhp.reachable_point_pairs(self.ctx, i1, i2) {
            let refined = self.mhp.branch_join_refined(self.ctx, rp1.spawn, i1, i2);
            if !matches!(refined, Ok(true)) {
                return false;
            }
        }
        true
    }
}
