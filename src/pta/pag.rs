// SPDX-License-Identifier: GPL-2.0
//! Pointer assignment graph.
//!
//! Nodes are either SSA values or memory objects. Value `v` is node
//! `v.index()`; object `o` is node `num_values + o.index()`.

use std::collections::BTreeSet;

use crate::ir::ids::{InstId, NodeId, ObjId, ValueId};

/// Edge kind of the pointer assignment graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PagEdgeKind {
    /// `dst = &src`, source is an object node
    Addr,
    /// `dst = src`
    Copy,
    /// `dst = *src`
    Load,
    /// `*dst = src`
    Store,
    /// `dst = &src->k`
    NormalGep(u32),
    /// `dst = &src[i]` with a variable index
    VariantGep,
    /// Actual to formal parameter at a call site
    Call(InstId),
    /// Return value to call result at a call site
    Ret(InstId),
    /// Routine argument to thread entry parameter at a spawn site
    Fork(InstId),
    /// Thread return value to join result, labelled with the spawn site
    Join(InstId),
}

impl PagEdgeKind {
    /// Call site or spawn site labelling an interprocedural edge
    pub fn site(self) -> Option<InstId> {
        match self {
            PagEdgeKind::Call(cs)
            | PagEdgeKind::Ret(cs)
            | PagEdgeKind::Fork(cs)
            | PagEdgeKind::Join(cs) => Some(cs),
            _ => None,
        }
    }
}

/// A labelled edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PagEdge {
    /// Source node
    pub src: NodeId,
    /// Destination node
    pub dst: NodeId,
    /// Label
    pub kind: PagEdgeKind,
}

/// What a node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagNode {
    /// An SSA value
    Value(ValueId),
    /// A memory object
    Object(ObjId),
}

/// The graph
#[derive(Debug, Clone, Default)]
pub struct Pag {
    num_values: usize,
    edges: Vec<PagEdge>,
    seen: BTreeSet<PagEdge>,
    out: Vec<Vec<usize>>,
    inn: Vec<Vec<usize>>,
}

impl Pag {
    /// Graph over `num_values` values and `num_objs` objects
    pub fn new(num_values: usize, num_objs: usize) -> Self {
        let n = num_values + num_objs;
        Self {
            num_values,
            edges: Vec::new(),
            seen: BTreeSet::new(),
            out: vec![Vec::new(); n],
            inn: vec![Vec::new(); n],
        }
    }

    /// Node of a value
    pub fn value_node(&self, v: ValueId) -> NodeId {
        NodeId::new(v.index())
    }

    /// Node of an object
    pub fn obj_node(&self, o: ObjId) -> NodeId {
        NodeId::new(self.num_values + o.index())
    }

    /// What `n` stands for
    pub fn node(&self, n: NodeId) -> PagNode {
        if n.index() < self.num_values {
            PagNode::Value(ValueId::new(n.index()))
        } else {
            PagNode::Object(ObjId::new(n.index() - self.num_values))
        }
    }

    /// Object behind an object node
    pub fn as_obj(&self, n: NodeId) -> Option<ObjId> {
        match self.node(n) {
            PagNode::Object(o) => Some(o),
            PagNode::Value(_) => None,
        }
    }

    /// Number of nodes
    pub fn num_nodes(&self) -> usize {
        self.out.len()
    }

    /// Number of edges
    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Add an edge; returns false when it already exists
    pub fn add_edge(&mut self, src: NodeId, dst: NodeId, kind: PagEdgeKind) -> bool {
        let e = PagEdge { src, dst, kind };
        if !self.seen.insert(e) {
            return false;
        }
        let idx = self.edges.len();
        self.edges.push(e);
        self.out[src.index()].push(idx);
        self.inn[dst.index()].push(idx);
        true
    }

    /// Edges leaving `n`
    pub fn out_edges(&self, n: NodeId) -> impl Iterator<Item = &PagEdge> + '_ {
        self.out[n.index()].iter().map(move |e| &self.edges[*e])
    }

    /// Edges entering `n`
    pub fn in_edges(&self, n: NodeId) -> impl Iterator<Item = &PagEdge> + '_ {
        self.inn[n.index()].iter().map(move |e| &self.edges[*e])
    }

    /// All edges in insertion order
    pub fn edges(&self) -> &[PagEdge] {
        &self.edges
    }
}
