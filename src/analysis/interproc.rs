// SPDX-License-Identifier: GPL-2.0
//! Interprocedural analysis driver.
//!
//! Analyses that summarize procedures implement [`SccVisitor`]. The driver
//! walks the SCCs of the call graph callee-first, then caller-first. SCCs of
//! dead functions are skipped; declarations never form SCCs. One summary is
//! kept per SCC, so facts that differ between members of a recursive SCC are
//! merged. That imprecision is reported in the verbose log.

use std::collections::BTreeMap;

use crate::analysis::callgraph::CallEdge;
use crate::analysis::context::AnalysisContext;
use crate::analysis::scc::{Scc, SccId};

/// Per-SCC summaries
pub type SccSummaries<S> = BTreeMap<SccId, S>;

/// Callbacks of one interprocedural analysis
pub trait SccVisitor {
    /// Called for every live SCC, callees first
    fn visit_bottom_up(&mut self, _ctx: &AnalysisContext, _scc: &Scc) {}

    /// Called for every live SCC, callers first
    fn visit_top_down(&mut self, _ctx: &AnalysisContext, _scc: &Scc) {}
}

/// Whether the SCC is analyzed. Members of an SCC are mutually reachable,
/// so they share liveness.
pub fn is_live_scc(ctx: &AnalysisContext, scc: &Scc) -> bool {
    ctx.is_analyzable(scc.rep)
}

/// Run the bottom-up pass only
pub fn run_bottom_up<V: SccVisitor>(ctx: &AnalysisContext, visitor: &mut V) {
    for scc in ctx.sccs.bottom_up() {
        if is_live_scc(ctx, scc) {
            visitor.visit_bottom_up(ctx, scc);
        }
    }
}

/// Run the top-down pass only
pub fn run_top_down<V: SccVisitor>(ctx: &AnalysisContext, visitor: &mut V) {
    for scc in ctx.sccs.top_down() {
        if is_live_scc(ctx, scc) {
            visitor.visit_top_down(ctx, scc);
        }
    }
}

/// Run the bottom-up pass followed by the top-down pass
pub fn run_interprocedural<V: SccVisitor>(ctx: &AnalysisContext, visitor: &mut V) {
    run_bottom_up(ctx, visitor);
    run_top_down(ctx, visitor);
}

/// Call edges, not fork edges, from live callers into members of `scc`
pub fn incoming_calls(ctx: &AnalysisContext, scc: &Scc) -> Vec<CallEdge> {
    let mut edges: Vec<CallEdge> = scc
        .members
        .iter()
        .flat_map(|f| ctx.cg.edges_to(*f).iter().copied())
        .filter(|e| !e.fork && ctx.cg.is_live(e.caller))
        .collect();
    edges.sort();
    edges
}

/// Note a recursive SCC whose members share one summary
pub fn note_recursion(ctx: &AnalysisContext, scc: &Scc, analysis: &str) {
    if scc.recursive {
        ctx.info(|| {
            let names: Vec<&str> = scc
                .members
                .iter()
                .map(|f| ctx.prog.func(*f).name.as_str())
                .collect();
            format!("{}: recursive SCC {{{}}} summarized once", analysis, names.join(", "))
        });
    }
}
