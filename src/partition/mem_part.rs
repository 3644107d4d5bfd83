// SPDX-License-Identifier: GPL-2.0
//! Memory partitioning.
//!
//! Objects accessed by exactly the same set of accesses form one partition.
//! Partition 0 is reserved and stays empty. Each partition owns the ids of
//! its accesses, where a pruned access becomes `None`, and a
//! [`RiskyPairSet`]. The refinement analyses are applied through
//! [`MemoryPartitioning::apply_pair_filter`], which only ever removes pairs.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::collector::OperationCollector;
use crate::analysis::context::AnalysisContext;
use crate::ir::ids::{AccessId, InstId, ObjId, PartId};
use crate::mhp::codeset::{ReachablePoint, ReachableType};
use crate::mhp::MhpAnalysis;
use crate::partition::escape::ThreadEscapeAnalysis;
use crate::partition::risky::RiskyPairSet;

/// Objects sharing one set of accesses
#[derive(Debug, Clone, Default)]
pub struct Partition {
    /// Handle
    pub id: PartId,
    /// Member objects
    pub objs: BTreeSet<ObjId>,
    /// Accesses, `None` once pruned
    pub accesses: Vec<Option<AccessId>>,
}

impl Partition {
    /// Accesses that are not pruned
    pub fn live_accesses(&self) -> impl Iterator<Item = AccessId> + '_ {
        self.accesses.iter().flatten().copied()
    }

    /// Whether every access was pruned
    pub fn is_pruned(&self) -> bool {
        self.accesses.iter().all(Option::is_none)
    }

    fn prune_all(&mut self) {
        self.accesses.iter_mut().for_each(|a| *a = None);
    }
}

/// Partitions of all accessed objects
#[derive(Debug, Clone, Default)]
pub struct MemoryPartitioning {
    parts: Vec<Partition>,
    obj_part: BTreeMap<ObjId, PartId>,
    risky: Vec<RiskyPairSet>,
    writes: BTreeSet<AccessId>,
}

impl MemoryPartitioning {
    /// Partition the objects accessed by the collected accesses
    pub fn run(ctx: &AnalysisContext, oc: &OperationCollector) -> Self {
        let pta = &ctx.pta;
        let mut obj_accesses: BTreeMap<ObjId, BTreeSet<AccessId>> = BTreeMap::new();
        for ma in oc.accesses() {
            let whole_object = ctx.prog.is_call(ma.inst);
            for o in pta.points_to(ma.ptr).iter().copied() {
                let obj = pta.obj(o);
                if obj.is_dummy() || obj.is_function() {
                    continue;
                }
                obj_accesses.entry(o).or_default().insert(ma.id);
                // Intrinsics touch every field behind a pointer to the start
                // of an aggregate.
                if whole_object && obj.is_first_field() {
                    for f in pta.objs().all_fields(o) {
                        obj_accesses.entry(f).or_default().insert(ma.id);
                    }
                }
            }
        }

        let mut mp = Self {
            parts: vec![Partition::default()],
            ..Self::default()
        };
        let mut eq: BTreeMap<BTreeSet<AccessId>, PartId> = BTreeMap::new();
        for (o, ids) in obj_accesses {
            let part = match eq.get(&ids) {
                Some(p) => *p,
                None => {
                    let p = PartId::new(mp.parts.len());
                    mp.parts.push(Partition {
                        id: p,
                        objs: BTreeSet::new(),
                        accesses: ids.iter().copied().map(Some).collect(),
                    });
                    eq.insert(ids, p);
                    p
                }
            };
            mp.parts[part.index()].objs.insert(o);
            mp.obj_part.insert(o, part);
        }

        let budget = ctx.config.risky_pair_budget;
        let compute_all = ctx.config.compute_all_risky_pairs;
        mp.risky = vec![RiskyPairSet::new(budget, compute_all); mp.parts.len()];
        mp.writes = oc
            .accesses()
            .iter()
            .filter(|a| a.is_write)
            .map(|a| a.id)
            .collect();
        log::debug!("{} memory partitions", mp.parts.len() - 1);
        mp
    }

    /// All partitions, the reserved one included
    pub fn parts(&self) -> &[Partition] {
        &self.parts
    }

    /// Partition by id
    pub fn part(&self, p: PartId) -> &Partition {
        &self.parts[p.index()]
    }

    /// Partition ids, the reserved one excluded
    pub fn part_ids(&self) -> impl Iterator<Item = PartId> + '_ {
        (1..self.parts.len()).map(PartId::new)
    }

    /// Number of partitions, the reserved one excluded
    pub fn len(&self) -> usize {
        self.parts.len() - 1
    }

    /// Whether no object is accessed
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Partition containing `o`
    pub fn part_of(&self, o: ObjId) -> Option<PartId> {
        self.obj_part.get(&o).copied()
    }

    /// Risky pairs of a partition
    pub fn risky(&self, p: PartId) -> &RiskyPairSet {
        &self.risky[p.index()]
    }

    /// Whether an access writes
    pub fn is_write(&self, a: AccessId) -> bool {
        self.writes.contains(&a)
    }

    /// Total number of risky pairs
    pub fn num_risky_pairs(&self) -> usize {
        self.risky.iter().map(RiskyPairSet::len).sum()
    }

    /// Number of partitions with at least one unpruned access
    pub fn num_live_parts(&self) -> usize {
        self.part_ids().filter(|p| !self.part(*p).is_pruned()).count()
    }

    /// Prune every access of partitions no other thread can see
    pub fn apply_escape(&mut self, tea: &ThreadEscapeAnalysis) {
        for p in 1..self.parts.len() {
            if !tea.may_escape(PartId::new(p)) {
                self.parts[p].prune_all();
            }
        }
    }

    /// Prune accesses outside any spawned thread and seed the risky pairs
    /// from trunk/branch reachability per spawn site. `must_not_access`
    /// may rule an access out of a partition under one reachable point.
    pub fn apply_mhp<F>(
        &mut self,
        ctx: &AnalysisContext,
        oc: &OperationCollector,
        mhp: &MhpAnalysis,
        tea: &ThreadEscapeAnalysis,
        mut must_not_access: F,
    ) where
        F: FnMut(AccessId, ReachablePoint, PartId) -> bool,
    {
        for part in self.parts.iter_mut() {
            for slot in part.accesses.iter_mut() {
                if let Some(a) = *slot {
                    if mhp.is_sequential(ctx, oc.access(a).inst) {
                        *slot = None;
                    }
                }
            }
        }

        for p in 1..self.parts.len() {
            let pid = PartId::new(p);
            let visible: BTreeSet<InstId> = tea.visible_spawn_sites(pid);
            let mut reachable: BTreeMap<InstId, Vec<(AccessId, ReachableType)>> = BTreeMap::new();
            for a in self.parts[p].live_accesses() {
                for rp in mhp.backward_points(ctx, oc.access(a).inst) {
                    if !visible.contains(&rp.spawn) {
                        continue;
                    }
                    if must_not_access(a, rp, pid) {
                        continue;
                    }
                    reachable.entry(rp.spawn).or_default().push((a, rp.ty));
                }
            }
            self.identify_risky_pairs(pid, &reachable);
        }
    }

    fn identify_risky_pairs(
        &mut self,
        p: PartId,
        reachable: &BTreeMap<InstId, Vec<(AccessId, ReachableType)>>,
    ) {
        for accesses in reachable.values() {
            let set = &self.risky[p.index()];
            if !set.computes_all() && set.is_over_budget() {
                break;
            }
            let (mut trunk_w, mut trunk_r, mut branch_w, mut branch_r) =
                (Vec::new(), Vec::new(), Vec::new(), Vec::new());
            for (a, ty) in accesses {
                let write = self.writes.contains(a);
                match (ty, write) {
                    (ReachableType::Trunk, true) => trunk_w.push(*a),
                    (ReachableType::Trunk, false) => trunk_r.push(*a),
                    (ReachableType::Branch, true) => branch_w.push(*a),
                    (ReachableType::Branch, false) => branch_r.push(*a),
                    (ReachableType::Not, _) => {}
                }
            }
            let set = &mut self.risky[p.index()];
            set.add_pairs_from(&trunk_w, &branch_w);
            set.add_pairs_from(&trunk_w, &branch_r);
            set.add_pairs_from(&trunk_r, &branch_w);
        }
    }

    /// Remove pairs `refined` proves race free, skipping over-budget
    /// partitions. Returns the number of removed pairs.
    pub fn apply_pair_filter<F>(&mut self, mut refined: F) -> usize
    where
        F: FnMut(PartId, AccessId, AccessId) -> bool,
    {
        let mut removed = 0;
        for p in 1..self.parts.len() {
            let set = &mut self.risky[p];
            if set.is_over_budget() {
                continue;
            }
            let pid = PartId::new(p);
            removed += set.retain_not(|a, b| refined(pid, a, b));
        }
        removed
    }

    /// Prune accesses that take part in no risky pair
    pub fn prune_non_risky(&mut self) {
        for p in 1..self.parts.len() {
            if self.risky[p].is_over_budget() {
                continue;
            }
            let ids = self.risky[p].risky_ids();
            for slot in self.parts[p].accesses.iter_mut() {
                if matches!(slot, Some(a) if !ids.contains(a)) {
                    *slot = None;
                }
            }
        }
    }

    /// Log partitions whose pair set ran out of budget
    pub fn report_budget_overruns(&self, ctx: &AnalysisContext) {
        for p in self.part_ids() {
            let set = self.risky(p);
            if set.is_over_budget() && !self.part(p).is_pruned() {
                ctx.warn(|| {
                    format!(
                        "partition {} is over the risky pair budget ({} pairs kept)",
                        p,
                        set.len()
                    )
                });
            }
        }
    }
}
