// SPDX-License-Identifier: GPL-2.0
//! Dense integer handles for program entities.
//!
//! Every entity of the program representation and of the points-to graph is
//! addressed by an index into an owning table, never by memory address.

use std::fmt;

macro_rules! dense_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        pub struct $name(pub u32);

        impl $name {
            /// Create a handle from a table index
            pub const fn new(index: usize) -> Self {
                Self(index as u32)
            }

            /// Table index of this handle
            pub const fn index(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

dense_id!(
    /// A function of the program
    FuncId,
    "fn"
);
dense_id!(
    /// A basic block, unique across the whole program
    BlockId,
    "bb"
);
dense_id!(
    /// An instruction, unique across the whole program
    InstId,
    "i"
);
dense_id!(
    /// An SSA value: instruction result, parameter, global, constant
    ValueId,
    "v"
);
dense_id!(
    /// A global variable
    GlobalId,
    "g"
);
dense_id!(
    /// A memory object of the points-to analysis
    ObjId,
    "o"
);
dense_id!(
    /// A node of the pointer assignment graph
    NodeId,
    "n"
);
dense_id!(
    /// A collected memory access
    AccessId,
    "a"
);
dense_id!(
    /// A memory partition
    PartId,
    "p"
);
