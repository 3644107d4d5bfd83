// SPDX-License-Identifier: GPL-2.0
//! Call graph construction.
//!
//! Two graphs are built from the solved points-to information. The precise
//! graph links every call site to the functions its callee operand may point
//! to, and every spawn site to its start routines (fork edges). The
//! conservative graph additionally lets every indirect call reach every
//! address-taken function; it is only used to decide which functions are
//! live from `main`.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::analysis::thread_api::ThreadApi;
use crate::ir::ids::{FuncId, InstId};
use crate::ir::inst::{Callee, InstKind, ValueKind};
use crate::ir::program::Program;
use crate::pta::PointerAnalysis;

/// A resolved call or fork edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct CallEdge {
    /// Call or spawn instruction
    pub site: InstId,
    /// Function containing the site
    pub caller: FuncId,
    /// Defined target
    pub callee: FuncId,
    /// Whether the edge starts a new thread
    pub fork: bool,
}

/// Call graph over defined functions
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    out: BTreeMap<FuncId, Vec<CallEdge>>,
    inn: BTreeMap<FuncId, Vec<CallEdge>>,
    site_targets: BTreeMap<InstId, Vec<CallEdge>>,
    address_taken: BTreeSet<FuncId>,
    live: BTreeSet<FuncId>,
}

impl CallGraph {
    /// Build both graphs and compute liveness from `main`
    pub fn build(prog: &Program, pta: &PointerAnalysis) -> Self {
        let api = ThreadApi::new();
        let mut cg = CallGraph::default();

        for f in prog.funcs() {
            // Direct calls name their callee without using its address.
            if !f.is_declaration() && !prog.users(f.addr).is_empty() {
                cg.address_taken.insert(f.id);
            }
        }

        for inst in prog.insts() {
            if !prog.is_call(inst.id) {
                continue;
            }
            let caller = inst.func;
            for callee in pta.callees(inst.id) {
                if !prog.func(callee).is_declaration() {
                    cg.add_edge(CallEdge {
                        site: inst.id,
                        caller,
                        callee,
                        fork: false,
                    });
                }
            }
            if api.is_thread_start(prog, inst.id) {
                for callee in pta.spawnees(inst.id) {
                    if !prog.func(callee).is_declaration() {
                        cg.add_edge(CallEdge {
                            site: inst.id,
                            caller,
                            callee,
                            fork: true,
                        });
                    }
                }
            }
        }

        cg.live = cg.conservative_reachable(prog, &api);
        log::debug!(
            "call graph: {} sites resolved, {} live functions",
            cg.site_targets.len(),
            cg.live.len()
        );
        cg
    }

    fn add_edge(&mut self, e: CallEdge) {
        self.out.entry(e.caller).or_default().push(e);
        self.inn.entry(e.callee).or_default().push(e);
        self.site_targets.entry(e.site).or_default().push(e);
    }

    /// Functions reachable from `main` when indirect calls and spawns
    /// through pointers may reach any address-taken function
    fn conservative_reachable(&self, prog: &Program, api: &ThreadApi) -> BTreeSet<FuncId> {
        let Some(main) = prog.entry_func() else {
            // Without an entry point everything is considered live.
            return prog
                .funcs()
                .filter(|f| !f.is_declaration())
                .map(|f| f.id)
                .collect();
        };
        let mut live = BTreeSet::new();
        let mut queue = VecDeque::from([main]);
        while let Some(f) = queue.pop_front() {
            if !live.insert(f) {
                continue;
            }
            for i in prog.func_insts(f) {
                let InstKind::Call { callee, .. } = &prog.inst(i).kind else {
                    continue;
                };
                for e in self.site_targets.get(&i).into_iter().flatten() {
                    queue.push_back(e.callee);
                }
                let unresolved_routine = api.is_thread_start(prog, i)
                    && api
                        .routine(prog, i)
                        .map(|r| !matches!(prog.value(r).kind, ValueKind::Function(_)))
                        .unwrap_or(false);
                if matches!(callee, Callee::Indirect(_)) || unresolved_routine {
                    queue.extend(self.address_taken.iter().copied());
                }
            }
        }
        live.retain(|f| !prog.func(*f).is_declaration());
        live
    }

    /// Whether `f` is reachable from the program entry
    pub fn is_live(&self, f: FuncId) -> bool {
        self.live.contains(&f)
    }

    /// Live functions
    pub fn live_funcs(&self) -> impl Iterator<Item = FuncId> + '_ {
        self.live.iter().copied()
    }

    /// Edges leaving `f`, fork edges included
    pub fn edges_from(&self, f: FuncId) -> &[CallEdge] {
        self.out.get(&f).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Edges entering `f`, fork edges included
    pub fn edges_to(&self, f: FuncId) -> &[CallEdge] {
        self.inn.get(&f).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Edges out of one call site
    pub fn edges_at(&self, site: InstId) -> &[CallEdge] {
        self.site_targets.get(&site).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Defined functions called, not forked, at `site`
    pub fn callees_at(&self, site: InstId) -> impl Iterator<Item = FuncId> + '_ {
        self.edges_at(site).iter().filter(|e| !e.fork).map(|e| e.callee)
    }

    /// Defined start routines of a spawn site
    pub fn spawnees_at(&self, site: InstId) -> impl Iterator<Item = FuncId> + '_ {
        self.edges_at(site).iter().filter(|e| e.fork).map(|e| e.callee)
    }

    /// Whether `site` has at least one defined target
    pub fn has_edges(&self, site: InstId) -> bool {
        self.site_targets.contains_key(&site)
    }

    /// Call sites, not fork sites, that invoke `f`
    pub fn call_sites_to(&self, f: FuncId) -> impl Iterator<Item = InstId> + '_ {
        self.edges_to(f).iter().filter(|e| !e.fork).map(|e| e.site)
    }

    /// Functions whose address escapes into a value
    pub fn address_taken(&self) -> &BTreeSet<FuncId> {
        &self.address_taken
    }
}
