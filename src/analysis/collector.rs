// SPDX-License-Identifier: GPL-2.0
//! Operation collection.
//!
//! One pass over the live functions gathers every memory access together
//! with the synchronization sites the later analyses start from.

use std::collections::BTreeMap;

use crate::analysis::context::AnalysisContext;
use crate::analysis::thread_api::ThreadApiKind;
use crate::ir::ids::{AccessId, InstId, ValueId};
use crate::ir::inst::InstKind;
use crate::ir::scev::strip_casts;

/// A collected memory access
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccess {
    /// Dense id
    pub id: AccessId,
    /// Accessing instruction
    pub inst: InstId,
    /// Accessed pointer
    pub ptr: ValueId,
    /// Write rather than read
    pub is_write: bool,
}

/// Accesses and synchronization sites of the program
#[derive(Debug, Clone, Default)]
pub struct OperationCollector {
    accesses: Vec<MemoryAccess>,
    inst_accesses: BTreeMap<InstId, Vec<AccessId>>,
    spawns: Vec<InstId>,
    joins: Vec<InstId>,
    locks: Vec<InstId>,
    unlocks: Vec<InstId>,
    barriers: Vec<InstId>,
    par_fors: Vec<InstId>,
}

impl OperationCollector {
    /// Scan every live function
    pub fn collect(ctx: &AnalysisContext) -> Self {
        let prog = &ctx.prog;
        let mut oc = Self::default();
        for f in prog.funcs() {
            if !ctx.is_analyzable(f.id) {
                continue;
            }
            for i in prog.func_insts(f.id) {
                match &prog.inst(i).kind {
                    InstKind::Load { ptr } => oc.add(i, *ptr, false),
                    InstKind::Store { ptr, .. } => oc.add(i, *ptr, true),
                    InstKind::Call { .. } => oc.collect_call(ctx, i),
                    _ => {}
                }
            }
        }
        log::debug!(
            "collected {} accesses, {} spawn and {} join sites",
            oc.accesses.len(),
            oc.spawns.len(),
            oc.joins.len()
        );
        oc
    }

    fn collect_call(&mut self, ctx: &AnalysisContext, i: InstId) {
        let (prog, api) = (&ctx.prog, &ctx.api);
        let Some(kind) = api.kind(prog, i) else {
            return;
        };
        match kind {
            ThreadApiKind::Spawn => self.spawns.push(i),
            ThreadApiKind::Join => self.joins.push(i),
            ThreadApiKind::Lock => self.locks.push(i),
            ThreadApiKind::Unlock => self.unlocks.push(i),
            ThreadApiKind::BarrierWait => self.barriers.push(i),
            ThreadApiKind::ParFor => self.par_fors.push(i),
            ThreadApiKind::MemSet => {
                if let Some(dst) = api.dest_ptr(prog, i) {
                    self.add(i, strip_casts(prog, dst), true);
                }
            }
            ThreadApiKind::Free => {
                if ctx.config.handle_free {
                    if let Some(dst) = api.dest_ptr(prog, i) {
                        self.add(i, strip_casts(prog, dst), true);
                    }
                }
            }
            ThreadApiKind::MemCopy => {
                if let Some(src) = api.src_ptr(prog, i) {
                    self.add(i, src, false);
                }
                if let Some(dst) = api.dest_ptr(prog, i) {
                    self.add(i, dst, true);
                }
            }
        }
    }

    fn add(&mut self, inst: InstId, ptr: ValueId, is_write: bool) {
        let id = AccessId::new(self.accesses.len());
        self.accesses.push(MemoryAccess {
            id,
            inst,
            ptr,
            is_write,
        });
        self.inst_accesses.entry(inst).or_default().push(id);
    }

    /// All accesses, indexed by id
    pub fn accesses(&self) -> &[MemoryAccess] {
        &self.accesses
    }

    /// Access by id
    pub fn access(&self, id: AccessId) -> &MemoryAccess {
        &self.accesses[id.index()]
    }

    /// Accesses performed by one instruction
    pub fn accesses_of(&self, inst: InstId) -> &[AccessId] {
        self.inst_accesses
            .get(&inst)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of accesses
    pub fn len(&self) -> usize {
        self.accesses.len()
    }

    /// Whether nothing was collected
    pub fn is_empty(&self) -> bool {
        self.accesses.is_empty()
    }

    /// Thread creation sites
    pub fn spawn_sites(&self) -> &[InstId] {
        &self.spawns
    }

    /// Thread join sites
    pub fn join_sites(&self) -> &[InstId] {
        &self.joins
    }

    /// Lock acquire sites
    pub fn lock_sites(&self) -> &[InstId] {
        &self.locks
    }

    /// Lock release sites
    pub fn unlock_sites(&self) -> &[InstId] {
        &self.unlocks
    }

    /// Barrier wait sites
    pub fn barrier_sites(&self) -> &[InstId] {
        &self.barriers
    }

    /// Parallel loop sites
    pub fn par_for_sites(&self) -> &[InstId] {
        &self.par_fors
    }
}
