// SPDX-License-Identifier: GPL-2.0
//! Annotation for a runtime checker.
//!
//! Every racy access gets a regular check. Accesses taking part in a risky
//! pair also get a dense id, numbered from 0 in function order and then in
//! instruction order, so that the checker can instrument each pair of ids.

use core::fmt;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::analysis::context::AnalysisContext;
use crate::core::error::Result;
use crate::ir::ids::InstId;
use crate::report::pairs::{write_pairs, IdPair};
use crate::report::warning::RaceReport;

/// Ids and pairs attached to the racy accesses of a report
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RaceAnnotation {
    regular_checks: BTreeSet<InstId>,
    pair_ids: BTreeMap<InstId, usize>,
    groups: Vec<Vec<IdPair>>,
    num_pairs: usize,
}

impl RaceAnnotation {
    /// Number the accesses of `report`
    pub fn annotate(ctx: &AnalysisContext, report: &RaceReport) -> Self {
        let prog = &ctx.prog;
        let mut regular_checks = BTreeSet::new();
        let mut paired = BTreeSet::new();
        for w in report.warnings() {
            regular_checks.extend(w.accesses.iter().copied());
            for &(i1, i2) in &w.risky_pairs {
                paired.insert(i1);
                paired.insert(i2);
            }
            if w.over_budget && ctx.config.detail {
                ctx.warn(|| {
                    format!(
                        "partition {} is over budget, its {} accesses only get regular checks",
                        w.part,
                        w.accesses.len()
                    )
                });
            }
        }

        let mut pair_ids = BTreeMap::new();
        for f in prog.funcs() {
            for i in prog.func_insts(f.id) {
                if paired.contains(&i) {
                    let id = pair_ids.len();
                    pair_ids.insert(i, id);
                }
            }
        }

        let mut num_pairs = 0;
        let groups: Vec<Vec<IdPair>> = report
            .warnings()
            .iter()
            .map(|w| {
                let group: Vec<IdPair> = w
                    .risky_pairs
                    .iter()
                    .filter_map(|(i1, i2)| Some((*pair_ids.get(i1)?, *pair_ids.get(i2)?)))
                    .collect();
                num_pairs += group.len();
                group
            })
            .collect();

        log::debug!(
            "annotated {} regular checks and {} pairs",
            regular_checks.len(),
            num_pairs
        );
        Self {
            regular_checks,
            pair_ids,
            groups,
            num_pairs,
        }
    }

    /// Instructions to check on every execution
    pub fn regular_checks(&self) -> &BTreeSet<InstId> {
        &self.regular_checks
    }

    /// Dense id of an instruction taking part in a pair
    pub fn id_of(&self, i: InstId) -> Option<usize> {
        self.pair_ids.get(&i).copied()
    }

    /// Number of ids handed out
    pub fn num_ids(&self) -> usize {
        self.pair_ids.len()
    }

    /// Total number of pairs
    pub fn num_pairs(&self) -> usize {
        self.num_pairs
    }

    /// Pairs of each warning, in report order
    pub fn groups(&self) -> &[Vec<IdPair>] {
        &self.groups
    }

    /// All pairs, in report order
    pub fn to_pairs(&self) -> Vec<IdPair> {
        self.groups.iter().flatten().copied().collect()
    }

    /// Write all pairs as a pair file
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        write_pairs(path, &self.to_pairs())
    }
}

impl fmt::Display for RaceAnnotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} instructions annotated for regular check.", self.regular_checks.len())?;
        writeln!(f, "{} instructions annotated with pair ids.", self.pair_ids.len())?;
        write!(f, "{} pairs in total", self.num_pairs)
    }
}
