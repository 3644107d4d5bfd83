// SPDX-License-Identifier: GPL-2.0
//! Program construction.
//!
//! ```
//! use race_detector::ir::ProgramBuilder;
//!
//! let mut pb = ProgramBuilder::new();
//! let g = pb.global("g", 0);
//! let main = pb.declare("main", 0);
//! let mut fb = pb.body(main);
//! let ten = fb.const_int(10);
//! fb.store(g, ten);
//! fb.ret(None);
//! let program = pb.finish().unwrap();
//! assert_eq!(program.num_funcs(), 1);
//! ```

use std::collections::BTreeMap;

use crate::core::error::{AnalysisError, Result};
use crate::ir::ids::*;
use crate::ir::inst::*;
use crate::ir::program::*;

/// Builds and validates a [`Program`]
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    prog: Program,
    consts: BTreeMap<i64, ValueId>,
    null: Option<ValueId>,
    errors: Vec<String>,
}

impl ProgramBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    fn new_value(&mut self, kind: ValueKind) -> ValueId {
        let id = ValueId::new(self.prog.values.len());
        self.prog.values.push(Value {
            id,
            kind,
            users: Vec::new(),
        });
        id
    }

    /// Add a global variable; returns its address
    pub fn global(&mut self, name: &str, fields: u32) -> ValueId {
        self.global_at(name, fields, None)
    }

    /// Add a global variable with a declaration site
    pub fn global_at(&mut self, name: &str, fields: u32, loc: Option<SourceLoc>) -> ValueId {
        let id = GlobalId::new(self.prog.globals.len());
        let addr = self.new_value(ValueKind::Global(id));
        self.prog.globals.push(Global {
            id,
            name: name.to_string(),
            fields,
            addr,
            loc,
        });
        addr
    }

    /// Declare a function with `params` parameters
    pub fn declare(&mut self, name: &str, params: usize) -> FuncId {
        if let Some(f) = self.prog.func_by_name(name) {
            return f;
        }
        let id = FuncId::new(self.prog.funcs.len());
        let addr = self.new_value(ValueKind::Function(id));
        let params = (0..params)
            .map(|index| self.new_value(ValueKind::Param { func: id, index }))
            .collect();
        self.prog.funcs.push(Function {
            id,
            name: name.to_string(),
            params,
            blocks: Vec::new(),
            addr,
        });
        self.prog.func_names.insert(name.to_string(), id);
        id
    }

    /// Integer constant
    pub fn const_int(&mut self, c: i64) -> ValueId {
        if let Some(v) = self.consts.get(&c) {
            return *v;
        }
        let v = self.new_value(ValueKind::Const(c));
        self.consts.insert(c, v);
        v
    }

    /// Null pointer constant
    pub fn null(&mut self) -> ValueId {
        match self.null {
            Some(v) => v,
            None => {
                let v = self.new_value(ValueKind::Null);
                self.null = Some(v);
                v
            }
        }
    }

    /// Address of a function
    pub fn func_addr(&self, f: FuncId) -> ValueId {
        self.prog.func(f).addr
    }

    /// Formal parameter of a function
    pub fn param(&self, f: FuncId, index: usize) -> ValueId {
        self.prog.func(f).params[index]
    }

    /// Start defining the body of `f`; the entry block is created
    pub fn body(&mut self, f: FuncId) -> FunctionBuilder<'_> {
        if !self.prog.func(f).blocks.is_empty() {
            self.errors
                .push(format!("function {} defined twice", self.prog.func(f).name));
        }
        let mut fb = FunctionBuilder {
            pb: self,
            func: f,
            current: BlockId(0),
            loc: None,
        };
        let entry = fb.new_block();
        fb.current = entry;
        fb
    }

    /// Program built so far
    pub fn program(&self) -> &Program {
        &self.prog
    }

    /// Validate and return the program
    pub fn finish(mut self) -> Result<Program> {
        if let Some(err) = self.errors.first() {
            return Err(AnalysisError::malformed(err.clone()));
        }
        self.link()?;
        Ok(self.prog)
    }

    fn link(&mut self) -> Result<()> {
        let prog = &mut self.prog;

        // Successors, and termination checks.
        for b in 0..prog.blocks.len() {
            let block = &prog.blocks[b];
            let Some(term) = block.terminator() else {
                return Err(AnalysisError::malformed(format!(
                    "block {} of {} is empty",
                    block.id,
                    prog.funcs[block.func.index()].name
                )));
            };
            let kind = &prog.insts[term.index()].kind;
            if !kind.is_terminator() {
                return Err(AnalysisError::malformed(format!(
                    "block {} of {} has no terminator",
                    block.id,
                    prog.funcs[block.func.index()].name
                )));
            }
            let succs = kind.successors();
            for s in &succs {
                if prog.blocks[s.index()].func != block.func {
                    return Err(AnalysisError::malformed(format!(
                        "branch from {} leaves its function",
                        block.id
                    )));
                }
            }
            prog.blocks[b].succs = succs;
        }

        // Predecessors.
        for b in 0..prog.blocks.len() {
            let succs = prog.blocks[b].succs.clone();
            for s in succs {
                prog.blocks[s.index()].preds.push(BlockId::new(b));
            }
        }

        // At most one return per function.
        for f in &prog.funcs {
            let returns = f
                .blocks
                .iter()
                .filter(|b| {
                    prog.blocks[b.index()]
                        .terminator()
                        .map(|t| matches!(prog.insts[t.index()].kind, InstKind::Ret { .. }))
                        .unwrap_or(false)
                })
                .count();
            if returns > 1 {
                return Err(AnalysisError::malformed(format!(
                    "function {} has {} return instructions",
                    f.name, returns
                )));
            }
        }

        // Def-use chains.
        for i in 0..prog.insts.len() {
            for op in prog.insts[i].kind.operands() {
                let users = &mut prog.values[op.index()].users;
                if users.last() != Some(&InstId::new(i)) {
                    users.push(InstId::new(i));
                }
            }
        }
        Ok(())
    }
}

/// Appends instructions to one function body
#[derive(Debug)]
pub struct FunctionBuilder<'a> {
    pb: &'a mut ProgramBuilder,
    func: FuncId,
    current: BlockId,
    loc: Option<SourceLoc>,
}

impl FunctionBuilder<'_> {
    /// Function being built
    pub fn func(&self) -> FuncId {
        self.func
    }

    /// Create a new, empty block (does not move the insertion point)
    pub fn new_block(&mut self) -> BlockId {
        let prog = &mut self.pb.prog;
        let id = BlockId::new(prog.blocks.len());
        prog.blocks.push(BasicBlock {
            id,
            func: self.func,
            insts: Vec::new(),
            succs: Vec::new(),
            preds: Vec::new(),
        });
        prog.funcs[self.func.index()].blocks.push(id);
        id
    }

    /// Move the insertion point to the end of `bb`
    pub fn position_at(&mut self, bb: BlockId) {
        self.current = bb;
    }

    /// Current insertion block
    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Source location attached to subsequent instructions
    pub fn set_loc(&mut self, file: &str, line: u32) {
        self.loc = Some(SourceLoc::new(file, line));
    }

    /// Formal parameter of the function being built
    pub fn param(&self, index: usize) -> ValueId {
        self.pb.param(self.func, index)
    }

    /// Integer constant
    pub fn const_int(&mut self, c: i64) -> ValueId {
        self.pb.const_int(c)
    }

    /// Null pointer
    pub fn null(&mut self) -> ValueId {
        self.pb.null()
    }

    /// Address of a function
    pub fn func_addr(&self, f: FuncId) -> ValueId {
        self.pb.func_addr(f)
    }

    /// Instruction defining `v`
    ///
    /// # Panics
    ///
    /// Panics when `v` is not an instruction result.
    pub fn def(&self, v: ValueId) -> InstId {
        match self.pb.prog.value(v).kind {
            ValueKind::Inst(i) => i,
            ref other => panic!("{} is not an instruction result: {:?}", v, other),
        }
    }

    /// Result value of an instruction
    ///
    /// # Panics
    ///
    /// Panics when the instruction defines no value.
    pub fn result(&self, i: InstId) -> ValueId {
        match self.pb.prog.inst(i).result {
            Some(v) => v,
            None => panic!("{} defines no value", i),
        }
    }

    fn push(&mut self, kind: InstKind) -> InstId {
        let prog = &mut self.pb.prog;
        let id = InstId::new(prog.insts.len());
        let block = &prog.blocks[self.current.index()];
        if let Some(last) = block.terminator() {
            if prog.insts[last.index()].kind.is_terminator() {
                self.pb.errors.push(format!(
                    "instruction appended after the terminator of {}",
                    self.current
                ));
            }
        }
        let prog = &mut self.pb.prog;
        let pos = prog.blocks[self.current.index()].insts.len();
        let result = if kind.has_result() {
            let v = ValueId::new(prog.values.len());
            prog.values.push(Value {
                id: v,
                kind: ValueKind::Inst(id),
                users: Vec::new(),
            });
            Some(v)
        } else {
            None
        };
        prog.insts.push(Instruction {
            id,
            func: self.func,
            block: self.current,
            pos,
            kind,
            result,
            loc: self.loc.clone(),
        });
        prog.blocks[self.current.index()].insts.push(id);
        id
    }

    fn push_value(&mut self, kind: InstKind) -> ValueId {
        let i = self.push(kind);
        self.result(i)
    }

    /// Stack allocation
    pub fn alloca(&mut self, fields: u32) -> ValueId {
        self.push_value(InstKind::Alloc { heap: false, fields })
    }

    /// Heap allocation
    pub fn malloc(&mut self, fields: u32) -> ValueId {
        self.push_value(InstKind::Alloc { heap: true, fields })
    }

    /// Load through `ptr`
    pub fn load(&mut self, ptr: ValueId) -> ValueId {
        self.push_value(InstKind::Load { ptr })
    }

    /// Store `val` through `ptr`
    pub fn store(&mut self, ptr: ValueId, val: ValueId) -> InstId {
        self.push(InstKind::Store { ptr, val })
    }

    /// Constant-offset field projection
    pub fn gep(&mut self, base: ValueId, offset: u32) -> ValueId {
        self.push_value(InstKind::Gep {
            base,
            offset: Some(offset),
            index: None,
        })
    }

    /// Variable-index projection with an unknown index
    pub fn gep_variant(&mut self, base: ValueId) -> ValueId {
        self.push_value(InstKind::Gep {
            base,
            offset: None,
            index: None,
        })
    }

    /// Array element `base[index]`
    pub fn gep_index(&mut self, base: ValueId, index: ValueId) -> ValueId {
        self.push_value(InstKind::Gep {
            base,
            offset: None,
            index: Some(index),
        })
    }

    /// Cast
    pub fn cast(&mut self, src: ValueId) -> ValueId {
        self.push_value(InstKind::Cast { src })
    }

    /// Arithmetic
    pub fn binop(&mut self, op: BinOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push_value(InstKind::BinOp { op, lhs, rhs })
    }

    /// Comparison
    pub fn cmp(&mut self, pred: Predicate, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push_value(InstKind::Cmp { pred, lhs, rhs })
    }

    /// Phi with initial incoming values
    pub fn phi(&mut self, incoming: Vec<(ValueId, BlockId)>) -> ValueId {
        self.push_value(InstKind::Phi { incoming })
    }

    /// Add an incoming value to a phi created earlier
    pub fn add_incoming(&mut self, phi: ValueId, val: ValueId, from: BlockId) {
        let i = self.def(phi);
        if let InstKind::Phi { incoming } = &mut self.pb.prog.insts[i.index()].kind {
            incoming.push((val, from));
        }
    }

    /// Direct call
    pub fn call(&mut self, f: FuncId, args: Vec<ValueId>) -> InstId {
        self.push(InstKind::Call {
            callee: Callee::Direct(f),
            args,
        })
    }

    /// Call through a function pointer
    pub fn call_indirect(&mut self, target: ValueId, args: Vec<ValueId>) -> InstId {
        self.push(InstKind::Call {
            callee: Callee::Indirect(target),
            args,
        })
    }

    /// Call a function by name, declaring it when unknown
    pub fn call_named(&mut self, name: &str, args: Vec<ValueId>) -> InstId {
        let f = self.pb.declare(name, args.len());
        self.call(f, args)
    }

    /// Unconditional branch
    pub fn br(&mut self, target: BlockId) -> InstId {
        self.push(InstKind::Br { target })
    }

    /// Conditional branch
    pub fn cond_br(&mut self, cond: ValueId, then_bb: BlockId, else_bb: BlockId) -> InstId {
        self.push(InstKind::CondBr {
            cond,
            then_bb,
            else_bb,
        })
    }

    /// Return
    pub fn ret(&mut self, val: Option<ValueId>) -> InstId {
        self.push(InstKind::Ret { val })
    }

    /// Unreachable terminator
    pub fn unreachable(&mut self) -> InstId {
        self.push(InstKind::Unreachable)
    }
}
