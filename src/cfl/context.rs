// SPDX-License-Identifier: GPL-2.0
//! Calling contexts of the CFL-reachability alias analysis.
//!
//! A [`CallString`] is a stack of call sites, innermost last. Call and fork
//! edges push a site, return and join edges pop it. A [`HybridContext`]
//! additionally carries an abstract bottom: a [`ReachablePoint`] standing for
//! every call string that stays inside the code its spawn site reaches on
//! one side of the fork. That keeps contexts finite when a loop spawns
//! threads over and over.

use std::collections::BTreeMap;
use std::fmt;

use crate::analysis::context::AnalysisContext;
use crate::ir::ids::InstId;
use crate::mhp::codeset::{ReachablePoint, ReachableType};
use crate::mhp::MhpAnalysis;

/// What popping an abstract context needs to know about the program
#[derive(Clone, Copy)]
pub struct CtxEnv<'a> {
    /// Analysis inputs
    pub ctx: &'a AnalysisContext,
    /// Reachability of spawn sites
    pub mhp: &'a MhpAnalysis,
}

impl<'a> CtxEnv<'a> {
    /// Bundle the inputs
    pub fn new(ctx: &'a AnalysisContext, mhp: &'a MhpAnalysis) -> Self {
        Self { ctx, mhp }
    }

    /// Whether returning through `cs` stays inside the code abstracted by `rp`
    pub fn matches_rest(&self, rp: ReachablePoint, cs: InstId) -> bool {
        let (ctx, mhp) = (self.ctx, self.mhp);
        if mhp.is_par_for_site(rp.spawn) {
            return mhp
                .par_for_code(rp.spawn)
                .is_some_and(|code| code.covers_inst(&ctx.prog, cs));
        }
        match rp.ty {
            ReachableType::Trunk => {
                mhp.is_trunk_reachable(ctx, rp.spawn, cs)
                    || (cs != rp.spawn && mhp.is_affected_site(ctx, rp.spawn, cs))
            }
            ReachableType::Branch => mhp.is_branch_reachable(ctx, rp.spawn, cs),
            ReachableType::Not => false,
        }
    }

    /// Whether `cs` is the site the abstract context `rp` is rooted at
    pub fn matches_root(&self, rp: ReachablePoint, cs: InstId) -> bool {
        cs == rp.spawn && (rp.ty == ReachableType::Branch || self.mhp.is_par_for_site(rp.spawn))
    }
}

/// Context discipline used by the CFL solver
pub trait CflContext: Clone + Ord + fmt::Debug {
    /// Context of objects that exist once per program run
    fn global() -> Self;

    /// Whether `cs` is already on the stack
    fn has_cycle(&self, cs: InstId) -> bool;

    /// Enter a callee through `cs`
    fn push(&mut self, cs: InstId);

    /// Return through `cs`; false when the context cannot have come from
    /// `cs`, which prunes the path
    fn pop(&mut self, cs: InstId, env: &CtxEnv<'_>) -> bool;

    /// Whether two contexts may denote the same run-time calling context
    fn matches(&self, other: &Self) -> bool;

    /// Number of stack entries, an abstract bottom counting as one
    fn depth(&self) -> usize;
}

/// A plain call string
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallString {
    sites: Vec<InstId>,
}

impl CallString {
    /// Empty call string
    pub const fn new() -> Self {
        Self { sites: Vec::new() }
    }

    /// Call string from outermost to innermost site
    pub fn from_sites(sites: Vec<InstId>) -> Self {
        Self { sites }
    }

    /// Sites from outermost to innermost
    pub fn sites(&self) -> &[InstId] {
        &self.sites
    }

    /// Innermost site
    pub fn top(&self) -> Option<InstId> {
        self.sites.last().copied()
    }

    /// Number of sites
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    /// Whether no site is on the stack
    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Whether the shorter string equals the innermost part of the longer
    pub fn suffix_matches(&self, other: &CallString) -> bool {
        let n = self.len().min(other.len());
        self.sites[self.len() - n..] == other.sites[other.len() - n..]
    }

    fn pop_matching(&mut self, cs: InstId) -> bool {
        match self.sites.last() {
            None => true,
            Some(top) if *top == cs => {
                self.sites.pop();
                true
            }
            Some(_) => false,
        }
    }
}

impl CflContext for CallString {
    fn global() -> Self {
        Self::new()
    }

    fn has_cycle(&self, cs: InstId) -> bool {
        self.sites.contains(&cs)
    }

    fn push(&mut self, cs: InstId) {
        self.sites.push(cs);
    }

    // An empty string may return anywhere.
    fn pop(&mut self, cs: InstId, _env: &CtxEnv<'_>) -> bool {
        self.pop_matching(cs)
    }

    fn matches(&self, other: &Self) -> bool {
        self.suffix_matches(other)
    }

    fn depth(&self) -> usize {
        self.len()
    }
}

impl fmt::Display for CallString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (k, cs) in self.sites.iter().enumerate() {
            if k > 0 {
                f.write_str(" -> ")?;
            }
            write!(f, "{}", cs)?;
        }
        f.write_str("]")
    }
}

/// A concrete call string on top of an optional abstract bottom
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HybridContext {
    root: Option<ReachablePoint>,
    concrete: CallString,
}

impl HybridContext {
    /// Context of code reached from `rp`, with nothing concrete on top
    pub fn rooted(rp: ReachablePoint) -> Self {
        Self {
            root: Some(rp),
            concrete: CallString::new(),
        }
    }

    /// Abstract bottom, if still valid
    pub fn root(&self) -> Option<ReachablePoint> {
        self.root
    }

    /// Concrete part
    pub fn concrete(&self) -> &CallString {
        &self.concrete
    }
}

impl CflContext for HybridContext {
    fn global() -> Self {
        Self::default()
    }

    fn has_cycle(&self, cs: InstId) -> bool {
        self.concrete.has_cycle(cs)
    }

    // Pushes never touch the abstract bottom.
    fn push(&mut self, cs: InstId) {
        self.concrete.push(cs);
    }

    fn pop(&mut self, cs: InstId, env: &CtxEnv<'_>) -> bool {
        if !self.concrete.is_empty() {
            return self.concrete.pop_matching(cs);
        }
        let Some(rp) = self.root else {
            return true;
        };
        if env.matches_root(rp, cs) {
            self.root = None;
            return true;
        }
        env.matches_rest(rp, cs)
    }

    fn matches(&self, other: &Self) -> bool {
        if !self.concrete.suffix_matches(&other.concrete) {
            return false;
        }
        match (self.root, other.root) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    fn depth(&self) -> usize {
        self.concrete.len() + usize::from(self.root.is_some())
    }
}

impl fmt::Display for HybridContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.root {
            Some(rp) => write!(f, "<{} {}> ", rp.ty, rp.spawn)?,
            None => f.write_str("<> ")?,
        }
        write!(f, "{}", self.concrete)
    }
}

/// Handle of an interned context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CtxId(u32);

/// Interning pool, so work items and cache keys carry a small handle
#[derive(Debug, Clone)]
pub struct CtxPool<C> {
    ctxs: Vec<C>,
    ids: BTreeMap<C, CtxId>,
}

impl<C> Default for CtxPool<C> {
    fn default() -> Self {
        Self {
            ctxs: Vec::new(),
            ids: BTreeMap::new(),
        }
    }
}

impl<C: CflContext> CtxPool<C> {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle of `ctx`, adding it on first use
    pub fn intern(&mut self, ctx: C) -> CtxId {
        if let Some(id) = self.ids.get(&ctx) {
            return *id;
        }
        let id = CtxId(self.ctxs.len() as u32);
        self.ctxs.push(ctx.clone());
        self.ids.insert(ctx, id);
        id
    }

    /// Context behind a handle
    pub fn get(&self, id: CtxId) -> &C {
        &self.ctxs[id.0 as usize]
    }

    /// Number of interned contexts
    pub fn len(&self) -> usize {
        self.ctxs.len()
    }

    /// Whether nothing was interned
    pub fn is_empty(&self) -> bool {
        self.ctxs.is_empty()
    }

    /// Forget every context
    pub fn clear(&mut self) {
        self.ctxs.clear();
        self.ids.clear();
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    fn cs(n: usize) -> InstId {
        InstId::new(n)
    }

    #[test]
    fn test_call_string_suffix_match() {
        let long = CallString::from_sites(vec![cs(1), cs(2), cs(3)]);
        let short = CallString::from_sites(vec![cs(2), cs(3)]);
        let other = CallString::from_sites(vec![cs(4), cs(3)]);
        assert!(long.suffix_matches(&short));
        assert!(short.suffix_matches(&long));
        assert!(!long.suffix_matches(&other));
        assert!(CallString::new().suffix_matches(&long));
    }

    #[test]
    fn test_pop_matching() {
        let mut c = CallString::from_sites(vec![cs(1), cs(2)]);
        assert!(!c.pop_matching(cs(1)));
        assert!(c.pop_matching(cs(2)));
        assert!(c.pop_matching(cs(1)));
        assert!(c.is_empty());
        // Unbalanced returns are allowed once the string is empty.
        assert!(c.pop_matching(cs(9)));
        assert!(!c.has_cycle(cs(9)));
    }

    #[test]
    fn test_hybrid_roots_must_agree() {
        let trunk = ReachablePoint::new(cs(5), ReachableType::Trunk);
        let branch = ReachablePoint::new(cs(5), ReachableType::Branch);
        let a = HybridContext::rooted(trunk);
        let b = HybridContext::rooted(branch);
        assert!(!a.matches(&b));
        assert!(a.matches(&HybridContext::rooted(trunk)));
        assert!(a.matches(&HybridContext::global()));
        assert!(HybridContext::global().matches(&b));
        assert_eq!(a.depth(), 1);
    }

    #[test]
    fn test_pool_interns_once() {
        let mut pool = CtxPool::new();
        let a = pool.intern(CallString::from_sites(vec![cs(1)]));
        let b = pool.intern(CallString::from_sites(vec![cs(1)]));
        let c = pool.intern(CallString::new());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.get(a).top(), Some(cs(1)));
    }
}
