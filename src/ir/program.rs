// SPDX-License-Identifier: GPL-2.0
//! Whole-program representation.
//!
//! A [`Program`] owns flat tables of functions, blocks, instructions, values
//! and globals. Entities refer to each other by dense ids only. Programs are
//! created with [`crate::ir::ProgramBuilder`], which validates them.

use std::collections::BTreeMap;

use crate::core::error::{AnalysisError, Result};
use crate::ir::ids::*;
use crate::ir::inst::*;

/// A function definition or declaration
#[derive(Debug, Clone)]
pub struct Function {
    /// Handle
    pub id: FuncId,
    /// Symbol name
    pub name: String,
    /// Formal parameter values
    pub params: Vec<ValueId>,
    /// Blocks, entry first; empty for declarations
    pub blocks: Vec<BlockId>,
    /// Address of the function as a value
    pub addr: ValueId,
}

impl Function {
    /// Whether the function has no body
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Entry block
    pub fn entry(&self) -> Option<BlockId> {
        self.blocks.first().copied()
    }
}

/// A basic block
#[derive(Debug, Clone)]
pub struct BasicBlock {
    /// Handle
    pub id: BlockId,
    /// Owning function
    pub func: FuncId,
    /// Instructions in order; the last one is the terminator
    pub insts: Vec<InstId>,
    /// Successor blocks
    pub succs: Vec<BlockId>,
    /// Predecessor blocks
    pub preds: Vec<BlockId>,
}

impl BasicBlock {
    /// The terminator instruction
    pub fn terminator(&self) -> Option<InstId> {
        self.insts.last().copied()
    }
}

/// An instruction
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Handle
    pub id: InstId,
    /// Owning function
    pub func: FuncId,
    /// Owning block
    pub block: BlockId,
    /// Position inside the block
    pub pos: usize,
    /// Operation
    pub kind: InstKind,
    /// Defined value, if any
    pub result: Option<ValueId>,
    /// Source location
    pub loc: Option<SourceLoc>,
}

/// A global variable
#[derive(Debug, Clone)]
pub struct Global {
    /// Handle
    pub id: GlobalId,
    /// Symbol name
    pub name: String,
    /// Number of fields for aggregates, 0 for scalars
    pub fields: u32,
    /// Address of the global as a value
    pub addr: ValueId,
    /// Declaration site
    pub loc: Option<SourceLoc>,
}

/// An SSA value
#[derive(Debug, Clone)]
pub struct Value {
    /// Handle
    pub id: ValueId,
    /// Definition
    pub kind: ValueKind,
    /// Instructions using the value
    pub users: Vec<InstId>,
}

/// The whole program under analysis
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub(crate) funcs: Vec<Function>,
    pub(crate) blocks: Vec<BasicBlock>,
    pub(crate) insts: Vec<Instruction>,
    pub(crate) values: Vec<Value>,
    pub(crate) globals: Vec<Global>,
    pub(crate) func_names: BTreeMap<String, FuncId>,
}

impl Program {
    /// Function by handle
    pub fn func(&self, f: FuncId) -> &Function {
        &self.funcs[f.index()]
    }

    /// Block by handle
    pub fn block(&self, b: BlockId) -> &BasicBlock {
        &self.blocks[b.index()]
    }

    /// Instruction by handle
    pub fn inst(&self, i: InstId) -> &Instruction {
        &self.insts[i.index()]
    }

    /// Value by handle
    pub fn value(&self, v: ValueId) -> &Value {
        &self.values[v.index()]
    }

    /// Instruction by a handle that may come from outside the program
    pub fn try_inst(&self, i: InstId) -> Result<&Instruction> {
        self.insts
            .get(i.index())
            .ok_or(AnalysisError::UnknownInstruction(i.index() as u32))
    }

    /// Value by a handle that may come from outside the program
    pub fn try_value(&self, v: ValueId) -> Result<&Value> {
        self.values
            .get(v.index())
            .ok_or(AnalysisError::UnknownValue(v.index() as u32))
    }

    /// Global by handle
    pub fn global(&self, g: GlobalId) -> &Global {
        &self.globals[g.index()]
    }

    /// All functions
    pub fn funcs(&self) -> impl Iterator<Item = &Function> + '_ {
        self.funcs.iter()
    }

    /// All globals
    pub fn globals(&self) -> impl Iterator<Item = &Global> + '_ {
        self.globals.iter()
    }

    /// All instructions
    pub fn insts(&self) -> impl Iterator<Item = &Instruction> + '_ {
        self.insts.iter()
    }

    /// Number of functions
    pub fn num_funcs(&self) -> usize {
        self.funcs.len()
    }

    /// Number of instructions
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Number of values
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Look a function up by name
    pub fn func_by_name(&self, name: &str) -> Option<FuncId> {
        self.func_names.get(name).copied()
    }

    /// Look a function up by name, failing when absent
    pub fn require_func(&self, name: &str) -> Result<FuncId> {
        self.func_by_name(name)
            .ok_or_else(|| AnalysisError::UnknownFunction(name.to_string()))
    }

    /// The program entry point
    pub fn entry_func(&self) -> Option<FuncId> {
        self.func_by_name("main")
    }

    /// Instructions of a function in block order
    pub fn func_insts(&self, f: FuncId) -> impl Iterator<Item = InstId> + '_ {
        self.func(f)
            .blocks
            .iter()
            .flat_map(move |b| self.block(*b).insts.iter().copied())
    }

    /// Instruction defining a value
    pub fn def_inst(&self, v: ValueId) -> Option<InstId> {
        match self.value(v).kind {
            ValueKind::Inst(i) => Some(i),
            _ => None,
        }
    }

    /// Integer constant carried by a value
    pub fn const_value(&self, v: ValueId) -> Option<i64> {
        match self.value(v).kind {
            ValueKind::Const(c) => Some(c),
            _ => None,
        }
    }

    /// Global whose address is the value
    pub fn as_global(&self, v: ValueId) -> Option<GlobalId> {
        match self.value(v).kind {
            ValueKind::Global(g) => Some(g),
            _ => None,
        }
    }

    /// Function whose address is the value
    pub fn as_function(&self, v: ValueId) -> Option<FuncId> {
        match self.value(v).kind {
            ValueKind::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Users of a value
    pub fn users(&self, v: ValueId) -> &[InstId] {
        &self.value(v).users
    }

    /// Value defined by an instruction
    pub fn result(&self, i: InstId) -> Option<ValueId> {
        self.inst(i).result
    }

    /// Function containing an instruction
    pub fn func_of(&self, i: InstId) -> FuncId {
        self.inst(i).func
    }

    /// Block containing an instruction
    pub fn block_of(&self, i: InstId) -> BlockId {
        self.inst(i).block
    }

    /// Next instruction in the same block
    pub fn next_inst(&self, i: InstId) -> Option<InstId> {
        let inst = self.inst(i);
        self.block(inst.block).insts.get(inst.pos + 1).copied()
    }

    /// Statically known callee of a call
    pub fn direct_callee(&self, i: InstId) -> Option<FuncId> {
        match &self.inst(i).kind {
            InstKind::Call {
                callee: Callee::Direct(f),
                ..
            } => Some(*f),
            _ => None,
        }
    }

    /// Call arguments
    pub fn call_args(&self, i: InstId) -> &[ValueId] {
        match &self.inst(i).kind {
            InstKind::Call { args, .. } => args,
            _ => &[],
        }
    }

    /// Whether the instruction is a call
    pub fn is_call(&self, i: InstId) -> bool {
        matches!(self.inst(i).kind, InstKind::Call { .. })
    }

    /// The unique return instruction of a function
    pub fn unique_return(&self, f: FuncId) -> Option<InstId> {
        self.func(f).blocks.iter().find_map(|b| {
            let term = self.block(*b).terminator()?;
            matches!(self.inst(term).kind, InstKind::Ret { .. }).then_some(term)
        })
    }

    /// Printable name of a value
    pub fn value_name(&self, v: ValueId) -> String {
        match &self.value(v).kind {
            ValueKind::Inst(i) => format!("%{}", i.0),
            ValueKind::Param { func, index } => format!("{}.arg{}", self.func(*func).name, index),
            ValueKind::Global(g) => format!("@{}", self.global(*g).name),
            ValueKind::Function(f) => format!("@{}", self.func(*f).name),
            ValueKind::Const(c) => c.to_string(),
            ValueKind::Null => "null".to_string(),
        }
    }

    /// One-line description of an instruction for reports
    pub fn describe_inst(&self, i: InstId) -> String {
        let inst = self.inst(i);
        let func = &self.func(inst.func).name;
        let op = match &inst.kind {
            InstKind::Load { ptr } => format!("load {}", self.value_name(*ptr)),
            InstKind::Store { ptr, val } => {
                format!("store {} -> {}", self.value_name(*val), self.value_name(*ptr))
            }
            InstKind::Call { callee, .. } => match callee {
                Callee::Direct(f) => format!("call @{}", self.func(*f).name),
                Callee::Indirect(v) => format!("call *{}", self.value_name(*v)),
            },
            other => format!("{:?}", other),
        };
        match &inst.loc {
            Some(loc) => format!("{} in {} at {} ({})", i, func, loc, op),
            None => format!("{} in {} ({})", i, func, op),
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::ir::builder::ProgramBuilder;

    #[test]
    fn test_checked_lookups() {
        let mut pb = ProgramBuilder::new();
        let g = pb.global("g", 0);
        let main = pb.declare("main", 0);
        let store = {
            let mut fb = pb.body(main);
            let one = fb.const_int(1);
            let s = fb.store(g, one);
            fb.ret(None);
            s
        };
        let prog = pb.finish().unwrap();

        assert!(prog.try_inst(store).is_ok());
        assert!(prog.try_value(g).is_ok());
        assert!(matches!(
            prog.try_inst(InstId::new(prog.num_insts())),
            Err(AnalysisError::UnknownInstruction(_))
        ));
        assert!(matches!(
            prog.try_value(ValueId::new(prog.num_values())),
            Err(AnalysisError::UnknownValue(_))
        ));
    }
}
