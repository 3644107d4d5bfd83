// SPDX-License-Identifier: GPL-2.0

//! Strongly Connected Components (SCC) of the call graph.
//!
//! This module implements Tarjan's algorithm over defined functions and the
//! call and fork edges between them. Each SCC is summarized once by the
//! interprocedural analyses; SCCs are visited callee-first (bottom-up) or
//! caller-first (top-down).

use std::collections::BTreeMap;

use crate::analysis::callgraph::CallGraph;
use crate::ir::ids::FuncId;
use crate::ir::program::Program;

/// State of a node during SCC traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    /// Not yet visited.
    Unvisited,
    /// On the DFS stack (being processed).
    OnStack,
    /// Finished processing, assigned to an SCC.
    Finished,
}

/// Index of an SCC inside its [`SccOrder`]
pub type SccId = usize;

/// Information about a single SCC.
#[derive(Debug, Clone)]
pub struct Scc {
    /// Unique ID of this SCC.
    pub id: SccId,
    /// Representative function, the smallest member id.
    pub rep: FuncId,
    /// Functions belonging to this SCC, sorted.
    pub members: Vec<FuncId>,
    /// Whether the members call each other recursively.
    pub recursive: bool,
}

impl Scc {
    /// Check if a function is in this SCC.
    pub fn contains(&self, f: FuncId) -> bool {
        self.members.binary_search(&f).is_ok()
    }

    /// Get the number of members.
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// SCCs of the call graph in topological order.
#[derive(Debug, Clone, Default)]
pub struct SccOrder {
    /// All SCCs, indexed by SCC ID.
    sccs: Vec<Scc>,
    /// Map from function to SCC ID.
    func_scc: BTreeMap<FuncId, SccId>,
    /// SCC IDs, callers before callees.
    topo_order: Vec<SccId>,
}

impl SccOrder {
    /// Compute the SCCs of all defined functions
    pub fn compute(prog: &Program, cg: &CallGraph) -> Self {
        let funcs: Vec<FuncId> = prog
            .funcs()
            .filter(|f| !f.is_declaration())
            .map(|f| f.id)
            .collect();
        let mut computer = SccComputer::new(&funcs, cg);
        for f in &funcs {
            if computer.states.get(f) == Some(&NodeState::Unvisited) {
                computer.strongconnect(*f);
            }
        }
        let mut order = SccOrder {
            sccs: computer.sccs,
            func_scc: computer.func_scc,
            topo_order: Vec::new(),
        };
        // Tarjan emits an SCC after every SCC it reaches.
        order.topo_order = (0..order.sccs.len()).rev().collect();
        order
    }

    /// SCC by id
    pub fn get(&self, id: SccId) -> &Scc {
        &self.sccs[id]
    }

    /// SCC containing `f`
    pub fn scc_of(&self, f: FuncId) -> Option<SccId> {
        self.func_scc.get(&f).copied()
    }

    /// All SCCs
    pub fn sccs(&self) -> &[Scc] {
        &self.sccs
    }

    /// Number of SCCs
    pub fn len(&self) -> usize {
        self.sccs.len()
    }

    /// Whether there are no SCCs
    pub fn is_empty(&self) -> bool {
        self.sccs.is_empty()
    }

    /// Callers before callees
    pub fn top_down(&self) -> impl Iterator<Item = &Scc> + '_ {
        self.topo_order.iter().map(move |id| &self.sccs[*id])
    }

    /// Callees before callers
    pub fn bottom_up(&self) -> impl Iterator<Item = &Scc> + '_ {
        self.topo_order.iter().rev().map(move |id| &self.sccs[*id])
    }

    /// Whether `f` belongs to a recursive SCC
    pub fn is_recursive(&self, f: FuncId) -> bool {
        self.scc_of(f).map(|s| self.sccs[s].recursive).unwrap_or(false)
    }
}

/// SCC computation using Tarjan's algorithm.
struct SccComputer<'a> {
    cg: &'a CallGraph,
    /// DFS index counter.
    index: usize,
    /// DFS indices for each node.
    indices: BTreeMap<FuncId, usize>,
    /// Low-link values for each node.
    lowlinks: BTreeMap<FuncId, usize>,
    /// Node states.
    states: BTreeMap<FuncId, NodeState>,
    /// DFS stack.
    stack: Vec<FuncId>,
    /// Found SCCs.
    sccs: Vec<Scc>,
    func_scc: BTreeMap<FuncId, SccId>,
}

impl<'a> SccComputer<'a> {
    fn new(funcs: &[FuncId], cg: &'a CallGraph) -> Self {
        Self {
            cg,
            index: 0,
            indices: BTreeMap::new(),
            lowlinks: BTreeMap::new(),
            states: funcs.iter().map(|f| (*f, NodeState::Unvisited)).collect(),
            stack: Vec::new(),
            sccs: Vec::new(),
            func_scc: BTreeMap::new(),
        }
    }

    /// Tarjan's strongconnect function.
    fn strongconnect(&mut self, v: FuncId) {
        self.indices.insert(v, self.index);
        self.lowlinks.insert(v, self.index);
        self.index += 1;
        self.stack.push(v);
        self.states.insert(v, NodeState::OnStack);

        let mut self_loop = false;
        let cg = self.cg;
        for e in cg.edges_from(v) {
            let w = e.callee;
            if w == v {
                self_loop = true;
            }
            match self.states.get(&w) {
                Some(&NodeState::Unvisited) => {
                    self.strongconnect(w);
                    let v_low = self.lowlinks[&v];
                    let w_low = self.lowlinks[&w];
                    self.lowlinks.insert(v, v_low.min(w_low));
                }
                Some(&NodeState::OnStack) => {
                    let v_low = self.lowlinks[&v];
                    let w_idx = self.indices[&w];
                    self.lowlinks.insert(v, v_low.min(w_idx));
                }
                _ => {}
            }
        }

        // If v is a root node, pop the stack and generate an SCC
        if self.lowlinks.get(&v) == self.indices.get(&v) {
            let id = self.sccs.len();
            let mut members = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.states.insert(w, NodeState::Finished);
                self.func_scc.insert(w, id);
                members.push(w);
                if w == v {
                    break;
                }
            }
            members.sort();
            let recursive = members.len() > 1 || self_loop;
            self.sccs.push(Scc {
                id,
                rep: members[0],
                members,
                recursive,
            });
        }
    }
}
