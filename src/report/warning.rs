// SPDX-License-Identifier: GPL-2.0
//! Race warnings.
//!
//! After the last filter every partition that still has an unpruned access
//! is a race warning. Warnings are ordered by the source location of their
//! first object so that reports are stable across runs.

use core::fmt;
use std::collections::BTreeSet;

use crate::analysis::collector::OperationCollector;
use crate::analysis::context::AnalysisContext;
use crate::ir::ids::{InstId, ObjId, PartId};
use crate::ir::inst::SourceLoc;
use crate::partition::mem_part::MemoryPartitioning;
use crate::sync::lockset::LocksetAnalysis;

/// One racy partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaceWarning {
    /// Partition id
    pub part: PartId,
    /// Objects of the partition
    pub objects: Vec<ObjId>,
    /// Printable object names, parallel to `objects`
    pub labels: Vec<String>,
    /// Source location of the first located object
    pub loc: Option<SourceLoc>,
    /// Instructions of the unpruned accesses
    pub accesses: Vec<InstId>,
    /// Surviving pairs, each ordered by instruction id
    pub risky_pairs: Vec<(InstId, InstId)>,
    /// The pair set ran out of budget, so `risky_pairs` is incomplete
    pub over_budget: bool,
}

impl RaceWarning {
    fn from_part(ctx: &AnalysisContext, oc: &OperationCollector, mp: &MemoryPartitioning, p: PartId) -> Self {
        let pta = &ctx.pta;
        let part = mp.part(p);
        let objects: Vec<ObjId> = part.objs.iter().copied().collect();
        let labels = objects.iter().map(|o| pta.obj(*o).name.clone()).collect();
        let loc = objects.iter().find_map(|o| pta.obj(*o).loc.clone());

        let accesses: BTreeSet<InstId> = part.live_accesses().map(|a| oc.access(a).inst).collect();
        let risky = mp.risky(p);
        let pairs: BTreeSet<(InstId, InstId)> = risky
            .pairs()
            .map(|(a, b)| {
                let (i1, i2) = (oc.access(a).inst, oc.access(b).inst);
                (i1.min(i2), i1.max(i2))
            })
            .collect();

        Self {
            part: p,
            objects,
            labels,
            loc,
            accesses: accesses.into_iter().collect(),
            risky_pairs: pairs.into_iter().collect(),
            over_budget: risky.is_over_budget(),
        }
    }

    /// Whether `i1` and `i2` are reported as racing with each other.
    /// An over-budget warning covers every pair of its accesses.
    pub fn covers(&self, i1: InstId, i2: InstId) -> bool {
        if self.over_budget {
            return self.accesses.contains(&i1) && self.accesses.contains(&i2);
        }
        self.risky_pairs.contains(&(i1.min(i2), i1.max(i2)))
    }

    /// Whether `i` is one of the racing accesses
    pub fn involves(&self, i: InstId) -> bool {
        self.accesses.binary_search(&i).is_ok()
    }

    fn sort_key(&self) -> (bool, Option<&SourceLoc>, PartId) {
        (self.loc.is_none(), self.loc.as_ref(), self.part)
    }
}

/// Final report of a detection run
#[derive(Debug, Clone, Default)]
pub struct RaceReport {
    warnings: Vec<RaceWarning>,
    details: Option<String>,
}

impl RaceReport {
    /// Turn every partition with an unpruned access into a warning
    pub fn collect(ctx: &AnalysisContext, oc: &OperationCollector, mp: &MemoryPartitioning) -> Self {
        let mut warnings: Vec<RaceWarning> = mp
            .part_ids()
            .filter(|p| !mp.part(*p).is_pruned())
            .map(|p| RaceWarning::from_part(ctx, oc, mp, p))
            .collect();
        warnings.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        log::debug!("{} race warnings", warnings.len());
        Self {
            warnings,
            details: None,
        }
    }

    /// Render objects, instructions and locksets of every warning into
    /// the report text
    pub fn with_details(mut self, ctx: &AnalysisContext, lsa: &LocksetAnalysis) -> Self {
        let mut out = String::new();
        for (n, w) in self.warnings.iter().enumerate() {
            render_warning(&mut out, ctx, lsa, n + 1, w);
        }
        self.details = Some(out);
        self
    }

    /// Warnings in report order
    pub fn warnings(&self) -> &[RaceWarning] {
        &self.warnings
    }

    /// Number of races
    pub fn len(&self) -> usize {
        self.warnings.len()
    }

    /// Whether no race was found
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Whether some warning reports `i1` and `i2` as racing
    pub fn has_race_between(&self, i1: InstId, i2: InstId) -> bool {
        self.warnings.iter().any(|w| w.covers(i1, i2))
    }

    /// Whether `i` takes part in some race
    pub fn involves(&self, i: InstId) -> bool {
        self.warnings.iter().any(|w| w.involves(i))
    }

    /// The warning whose partition contains `o`
    pub fn warning_for(&self, o: ObjId) -> Option<&RaceWarning> {
        self.warnings.iter().find(|w| w.objects.contains(&o))
    }

    /// Detail text, when rendered
    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }
}

fn render_warning(out: &mut String, ctx: &AnalysisContext, lsa: &LocksetAnalysis, n: usize, w: &RaceWarning) {
    let prog = &ctx.prog;
    let pta = &ctx.pta;
    out.push_str(&format!("Race #{} on partition {}", n, w.part));
    if let Some(loc) = &w.loc {
        out.push_str(&format!(" declared at {}", loc));
    }
    out.push('\n');
    out.push_str(&format!("  objects: {{ {} }}\n", w.labels.join(" ")));
    out.push_str(&format!("  dereferenced at {} places:\n", w.accesses.len()));
    for &i in &w.accesses {
        out.push_str(&format!("    {}\n", prog.describe_inst(i)));
        match lsa.lockset_of(i) {
            Some(locks) if !locks.is_empty() => {
                for &l in locks {
                    let objs: Vec<&str> = pta.points_to(l).iter().map(|o| pta.obj(*o).name.as_str()).collect();
                    out.push_str(&format!(
                        "      Locked --- {} --> {{ {} }}\n",
                        prog.value_name(l),
                        objs.join(" ")
                    ));
                }
            }
            _ => out.push_str("      empty lock set\n"),
        }
    }
    if w.over_budget {
        out.push_str(&format!("  {} risky pairs (over budget)\n", w.risky_pairs.len()));
    } else {
        out.push_str(&format!("  {} risky pairs\n", w.risky_pairs.len()));
    }
}

impl fmt::Display for RaceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(details) = &self.details {
            write!(f, "{}", details)?;
        }
        match self.warnings.len() {
            0 => write!(f, "No race found."),
            1 => write!(f, "1 race in total"),
            n => write!(f, "{} races in total", n),
        }
    }
}
