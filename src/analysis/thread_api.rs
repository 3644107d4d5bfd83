// SPDX-License-Identifier: GPL-2.0
//! Thread API classification.
//!
//! Call sites are recognized by the name of the called declaration. Both the
//! short spelling (`thread_create`) and the pthread spelling
//! (`pthread_create`) are understood; they differ only in argument layout.

use crate::ir::ids::{FuncId, InstId, ValueId};
use crate::ir::program::Program;

/// Kind of a recognized library call
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ThreadApiKind {
    /// Thread creation
    Spawn,
    /// Wait for a thread
    Join,
    /// Mutex or spin lock acquire
    Lock,
    /// Mutex or spin lock release
    Unlock,
    /// Barrier wait
    BarrierWait,
    /// Parallel loop, a spawn immediately followed by its join
    ParFor,
    /// `memcpy`-like intrinsic
    MemCopy,
    /// `memset`-like intrinsic
    MemSet,
    /// Heap deallocation
    Free,
}

/// Argument layout of one API entry
#[derive(Debug, Clone, Copy)]
struct ApiEntry {
    name: &'static str,
    kind: ThreadApiKind,
    /// Primary pointer argument: thread id pointer, lock, barrier, dest
    ptr: usize,
    /// Start routine position, for spawns
    routine: usize,
    /// Routine argument position, for spawns
    arg: usize,
}

const fn entry(name: &'static str, kind: ThreadApiKind, ptr: usize) -> ApiEntry {
    ApiEntry {
        name,
        kind,
        ptr,
        routine: usize::MAX,
        arg: usize::MAX,
    }
}

const API: &[ApiEntry] = &[
    ApiEntry {
        name: "thread_create",
        kind: ThreadApiKind::Spawn,
        ptr: 0,
        routine: 1,
        arg: 2,
    },
    ApiEntry {
        name: "pthread_create",
        kind: ThreadApiKind::Spawn,
        ptr: 0,
        routine: 2,
        arg: 3,
    },
    ApiEntry {
        name: "parallel_for",
        kind: ThreadApiKind::ParFor,
        ptr: usize::MAX,
        routine: 0,
        arg: 1,
    },
    entry("thread_join", ThreadApiKind::Join, 0),
    entry("pthread_join", ThreadApiKind::Join, 0),
    entry("mutex_lock", ThreadApiKind::Lock, 0),
    entry("pthread_mutex_lock", ThreadApiKind::Lock, 0),
    entry("spin_lock", ThreadApiKind::Lock, 0),
    entry("pthread_spin_lock", ThreadApiKind::Lock, 0),
    entry("mutex_unlock", ThreadApiKind::Unlock, 0),
    entry("pthread_mutex_unlock", ThreadApiKind::Unlock, 0),
    entry("spin_unlock", ThreadApiKind::Unlock, 0),
    entry("pthread_spin_unlock", ThreadApiKind::Unlock, 0),
    entry("barrier_wait", ThreadApiKind::BarrierWait, 0),
    entry("pthread_barrier_wait", ThreadApiKind::BarrierWait, 0),
    entry("memcpy", ThreadApiKind::MemCopy, 0),
    entry("memmove", ThreadApiKind::MemCopy, 0),
    entry("memset", ThreadApiKind::MemSet, 0),
    entry("free", ThreadApiKind::Free, 0),
];

/// Classifier for thread and memory library calls
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadApi;

impl ThreadApi {
    /// Create the classifier
    pub fn new() -> Self {
        Self
    }

    fn lookup(prog: &Program, f: FuncId) -> Option<&'static ApiEntry> {
        let func = prog.func(f);
        if !func.is_declaration() {
            return None;
        }
        API.iter().find(|e| e.name == func.name)
    }

    fn entry_of(prog: &Program, i: InstId) -> Option<&'static ApiEntry> {
        Self::lookup(prog, prog.direct_callee(i)?)
    }

    /// Kind of the call at `i`, if it is a recognized API call
    pub fn kind(&self, prog: &Program, i: InstId) -> Option<ThreadApiKind> {
        Self::entry_of(prog, i).map(|e| e.kind)
    }

    /// Kind of a declared function
    pub fn func_kind(&self, prog: &Program, f: FuncId) -> Option<ThreadApiKind> {
        Self::lookup(prog, f).map(|e| e.kind)
    }

    /// Whether `i` calls a thread creation routine
    pub fn is_spawn(&self, prog: &Program, i: InstId) -> bool {
        self.kind(prog, i) == Some(ThreadApiKind::Spawn)
    }

    /// Whether `i` waits for a thread
    pub fn is_join(&self, prog: &Program, i: InstId) -> bool {
        self.kind(prog, i) == Some(ThreadApiKind::Join)
    }

    /// Whether `i` acquires a lock
    pub fn is_lock(&self, prog: &Program, i: InstId) -> bool {
        self.kind(prog, i) == Some(ThreadApiKind::Lock)
    }

    /// Whether `i` releases a lock
    pub fn is_unlock(&self, prog: &Program, i: InstId) -> bool {
        self.kind(prog, i) == Some(ThreadApiKind::Unlock)
    }

    /// Whether `i` waits on a barrier
    pub fn is_barrier_wait(&self, prog: &Program, i: InstId) -> bool {
        self.kind(prog, i) == Some(ThreadApiKind::BarrierWait)
    }

    /// Whether `i` is a parallel loop
    pub fn is_par_for(&self, prog: &Program, i: InstId) -> bool {
        self.kind(prog, i) == Some(ThreadApiKind::ParFor)
    }

    /// Whether `i` starts new threads, by spawn or parallel loop
    pub fn is_thread_start(&self, prog: &Program, i: InstId) -> bool {
        matches!(
            self.kind(prog, i),
            Some(ThreadApiKind::Spawn) | Some(ThreadApiKind::ParFor)
        )
    }

    /// Whether `i` is a memory intrinsic or deallocation
    pub fn is_mem_intrinsic(&self, prog: &Program, i: InstId) -> bool {
        matches!(
            self.kind(prog, i),
            Some(ThreadApiKind::MemCopy) | Some(ThreadApiKind::MemSet) | Some(ThreadApiKind::Free)
        )
    }

    fn arg_at(prog: &Program, i: InstId, pos: usize) -> Option<ValueId> {
        prog.call_args(i).get(pos).copied()
    }

    /// Thread id pointer of a spawn, or the thread id value of a join
    pub fn thread_id(&self, prog: &Program, i: InstId) -> Option<ValueId> {
        let e = Self::entry_of(prog, i)?;
        match e.kind {
            ThreadApiKind::Spawn | ThreadApiKind::Join => Self::arg_at(prog, i, e.ptr),
            _ => None,
        }
    }

    /// Start routine of a spawn or parallel loop
    pub fn routine(&self, prog: &Program, i: InstId) -> Option<ValueId> {
        let e = Self::entry_of(prog, i)?;
        Self::arg_at(prog, i, e.routine)
    }

    /// Argument handed to the start routine
    pub fn routine_arg(&self, prog: &Program, i: InstId) -> Option<ValueId> {
        let e = Self::entry_of(prog, i)?;
        Self::arg_at(prog, i, e.arg)
    }

    /// Lock pointer of a lock or unlock call
    pub fn lock_ptr(&self, prog: &Program, i: InstId) -> Option<ValueId> {
        let e = Self::entry_of(prog, i)?;
        match e.kind {
            ThreadApiKind::Lock | ThreadApiKind::Unlock => Self::arg_at(prog, i, e.ptr),
            _ => None,
        }
    }

    /// Barrier pointer of a barrier wait
    pub fn barrier_ptr(&self, prog: &Program, i: InstId) -> Option<ValueId> {
        let e = Self::entry_of(prog, i)?;
        match e.kind {
            ThreadApiKind::BarrierWait => Self::arg_at(prog, i, e.ptr),
            _ => None,
        }
    }

    /// Written pointer of a memory intrinsic
    pub fn dest_ptr(&self, prog: &Program, i: InstId) -> Option<ValueId> {
        let e = Self::entry_of(prog, i)?;
        match e.kind {
            ThreadApiKind::MemCopy | ThreadApiKind::MemSet | ThreadApiKind::Free => {
                Self::arg_at(prog, i, 0)
            }
            _ => None,
        }
    }

    /// Read pointer of a `memcpy`
    pub fn src_ptr(&self, prog: &Program, i: InstId) -> Option<ValueId> {
        let e = Self::entry_of(prog, i)?;
        match e.kind {
            ThreadApiKind::MemCopy => Self::arg_at(prog, i, 1),
            _ => None,
        }
    }
}
