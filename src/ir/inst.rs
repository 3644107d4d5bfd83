// SPDX-License-Identifier: GPL-2.0
//! Instruction and value kinds of the program representation.

use std::fmt;

use crate::ir::ids::{BlockId, FuncId, GlobalId, InstId, ValueId};

/// Integer comparison predicate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Predicate {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// signed `<`
    Slt,
    /// signed `<=`
    Sle,
    /// signed `>`
    Sgt,
    /// signed `>=`
    Sge,
    /// unsigned `<`
    Ult,
    /// unsigned `<=`
    Ule,
    /// unsigned `>`
    Ugt,
    /// unsigned `>=`
    Uge,
}

impl Predicate {
    /// Predicate that holds after swapping the two operands.
    pub fn mirror(self) -> Self {
        match self {
            Predicate::Eq => Predicate::Eq,
            Predicate::Ne => Predicate::Ne,
            Predicate::Slt => Predicate::Sgt,
            Predicate::Sle => Predicate::Sge,
            Predicate::Sgt => Predicate::Slt,
            Predicate::Sge => Predicate::Sle,
            Predicate::Ult => Predicate::Ugt,
            Predicate::Ule => Predicate::Uge,
            Predicate::Ugt => Predicate::Ult,
            Predicate::Uge => Predicate::Ule,
        }
    }

    /// Logical negation of the predicate.
    pub fn inverse(self) -> Self {
        match self {
            Predicate::Eq => Predicate::Ne,
            Predicate::Ne => Predicate::Eq,
            Predicate::Slt => Predicate::Sge,
            Predicate::Sle => Predicate::Sgt,
            Predicate::Sgt => Predicate::Sle,
            Predicate::Sge => Predicate::Slt,
            Predicate::Ult => Predicate::Uge,
            Predicate::Ule => Predicate::Ugt,
            Predicate::Ugt => Predicate::Ule,
            Predicate::Uge => Predicate::Ult,
        }
    }

    /// Evaluate on two constants.
    pub fn eval(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Predicate::Eq => lhs == rhs,
            Predicate::Ne => lhs != rhs,
            Predicate::Slt => lhs < rhs,
            Predicate::Sle => lhs <= rhs,
            Predicate::Sgt => lhs > rhs,
            Predicate::Sge => lhs >= rhs,
            Predicate::Ult => (lhs as u64) < (rhs as u64),
            Predicate::Ule => (lhs as u64) <= (rhs as u64),
            Predicate::Ugt => (lhs as u64) > (rhs as u64),
            Predicate::Uge => (lhs as u64) >= (rhs as u64),
        }
    }

    /// Equal up to signedness, e.g. `slt` and `ult`.
    pub fn sign_insensitive_eq(self, other: Self) -> bool {
        self.strip_sign() == other.strip_sign()
    }

    fn strip_sign(self) -> Self {
        match self {
            Predicate::Ult => Predicate::Slt,
            Predicate::Ule => Predicate::Sle,
            Predicate::Ugt => Predicate::Sgt,
            Predicate::Uge => Predicate::Sge,
            p => p,
        }
    }

    /// Mnemonic used when printing
    pub fn as_str(self) -> &'static str {
        match self {
            Predicate::Eq => "eq",
            Predicate::Ne => "ne",
            Predicate::Slt => "slt",
            Predicate::Sle => "sle",
            Predicate::Sgt => "sgt",
            Predicate::Sge => "sge",
            Predicate::Ult => "ult",
            Predicate::Ule => "ule",
            Predicate::Ugt => "ugt",
            Predicate::Uge => "uge",
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Arithmetic operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// Addition
    Add,
    /// Subtraction
    Sub,
    /// Multiplication
    Mul,
    /// Any other operator, opaque to the analyses
    Other,
}

/// Target of a call instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Callee {
    /// Statically known function
    Direct(FuncId),
    /// Call through a function pointer
    Indirect(ValueId),
}

/// Instruction kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstKind {
    /// Allocation of a fresh object with `fields` fields (0 for scalars).
    Alloc {
        /// Heap (`malloc`-like) rather than stack allocation
        heap: bool,
        /// Number of fields of an aggregate object
        fields: u32,
    },
    /// Read through a pointer.
    Load {
        /// Address read
        ptr: ValueId,
    },
    /// Write through a pointer.
    Store {
        /// Address written
        ptr: ValueId,
        /// Value written
        val: ValueId,
    },
    /// Field projection; `None` offset means a variable index.
    Gep {
        /// Base pointer
        base: ValueId,
        /// Constant field offset
        offset: Option<u32>,
        /// Index operand of a variable projection
        index: Option<ValueId>,
    },
    /// Pointer or integer cast.
    Cast {
        /// Operand
        src: ValueId,
    },
    /// Arithmetic.
    BinOp {
        /// Operator
        op: BinOp,
        /// Left operand
        lhs: ValueId,
        /// Right operand
        rhs: ValueId,
    },
    /// Integer comparison.
    Cmp {
        /// Predicate
        pred: Predicate,
        /// Left operand
        lhs: ValueId,
        /// Right operand
        rhs: ValueId,
    },
    /// SSA join of values from predecessor blocks.
    Phi {
        /// (value, predecessor block) pairs
        incoming: Vec<(ValueId, BlockId)>,
    },
    /// Function call.
    Call {
        /// Target
        callee: Callee,
        /// Arguments
        args: Vec<ValueId>,
    },
    /// Unconditional branch.
    Br {
        /// Successor
        target: BlockId,
    },
    /// Conditional branch.
    CondBr {
        /// Condition
        cond: ValueId,
        /// Successor when the condition holds
        then_bb: BlockId,
        /// Successor otherwise
        else_bb: BlockId,
    },
    /// Function return.
    Ret {
        /// Returned value
        val: Option<ValueId>,
    },
    /// Control never reaches past this point.
    Unreachable,
}

impl InstKind {
    /// Whether the instruction ends a basic block.
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. } | InstKind::CondBr { .. } | InstKind::Ret { .. } | InstKind::Unreachable
        )
    }

    /// Successor blocks of a terminator.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            InstKind::Br { target } => vec![*target],
            InstKind::CondBr { then_bb, else_bb, .. } => {
                if then_bb == else_bb {
                    vec![*then_bb]
                } else {
                    vec![*then_bb, *else_bb]
                }
            }
            _ => Vec::new(),
        }
    }

    /// Whether this is a load, store or call.
    pub fn is_interesting(&self) -> bool {
        matches!(
            self,
            InstKind::Load { .. } | InstKind::Store { .. } | InstKind::Call { .. }
        )
    }

    /// Value operands, in order.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            InstKind::Alloc { .. } | InstKind::Br { .. } | InstKind::Unreachable => Vec::new(),
            InstKind::Load { ptr } => vec![*ptr],
            InstKind::Store { ptr, val } => vec![*val, *ptr],
            InstKind::Gep { base, index, .. } => {
                let mut ops = vec![*base];
                ops.extend(index.iter().copied());
                ops
            }
            InstKind::Cast { src } => vec![*src],
            InstKind::BinOp { lhs, rhs, .. } | InstKind::Cmp { lhs, rhs, .. } => vec![*lhs, *rhs],
            InstKind::Phi { incoming } => incoming.iter().map(|(v, _)| *v).collect(),
            InstKind::Call { callee, args } => {
                let mut ops = args.clone();
                if let Callee::Indirect(v) = callee {
                    ops.push(*v);
                }
                ops
            }
            InstKind::CondBr { cond, .. } => vec![*cond],
            InstKind::Ret { val } => val.iter().copied().collect(),
        }
    }

    /// Whether the instruction defines a value.
    pub fn has_result(&self) -> bool {
        !matches!(
            self,
            InstKind::Store { .. }
                | InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Ret { .. }
                | InstKind::Unreachable
        )
    }
}

/// Source location used to order reports
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SourceLoc {
    /// File name
    pub file: String,
    /// Line number
    pub line: u32,
}

impl SourceLoc {
    /// Create a location
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
        }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// What an SSA value is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueKind {
    /// Result of an instruction
    Inst(InstId),
    /// Formal parameter
    Param {
        /// Owning function
        func: FuncId,
        /// Position
        index: usize,
    },
    /// Address of a global variable
    Global(GlobalId),
    /// Address of a function
    Function(FuncId),
    /// Integer constant
    Const(i64),
    /// Null pointer
    Null,
}
