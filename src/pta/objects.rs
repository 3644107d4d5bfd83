// SPDX-License-Identifier: GPL-2.0
//! Abstract memory objects.

use std::collections::BTreeSet;

use bitflags::bitflags;

use crate::ir::ids::{FuncId, GlobalId, InstId, ObjId};
use crate::ir::inst::SourceLoc;

/// A set of memory objects
pub type ObjSet = BTreeSet<ObjId>;

bitflags! {
    /// Classification of a memory object
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ObjFlags: u32 {
        /// Allocated on the heap
        const HEAP = 1 << 0;
        /// Global variable
        const GLOBAL = 1 << 1;
        /// Stack variable
        const STACK = 1 << 2;
        /// Function object
        const FUNCTION = 1 << 3;
        /// Black hole standing for unknown memory
        const DUMMY = 1 << 4;
        /// Field of an aggregate
        const FIELD = 1 << 5;
        /// Indexed with a variable offset
        const ARRAY = 1 << 6;
    }
}

/// Where an object comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjOrigin {
    /// Allocation instruction
    Alloc(InstId),
    /// Global variable
    Global(GlobalId),
    /// Function
    Function(FuncId),
    /// Unknown memory
    Dummy,
}

/// An abstract memory object
#[derive(Debug, Clone)]
pub struct MemObject {
    /// Handle
    pub id: ObjId,
    /// Classification
    pub flags: ObjFlags,
    /// Allocation site
    pub origin: ObjOrigin,
    /// Base object; `id` itself for base objects
    pub base: ObjId,
    /// Field offset of a field object
    pub field: Option<u32>,
    /// Function containing the allocation, for stack and heap objects
    pub func: Option<FuncId>,
    /// Source location of the allocation
    pub loc: Option<SourceLoc>,
    /// Printable name
    pub name: String,
}

impl MemObject {
    /// Whether this is a heap object
    pub fn is_heap(&self) -> bool {
        self.flags.contains(ObjFlags::HEAP)
    }

    /// Whether this is a global object
    pub fn is_global(&self) -> bool {
        self.flags.contains(ObjFlags::GLOBAL)
    }

    /// Whether this is the black hole object
    pub fn is_dummy(&self) -> bool {
        self.flags.contains(ObjFlags::DUMMY)
    }

    /// Whether this is a function object
    pub fn is_function(&self) -> bool {
        self.flags.contains(ObjFlags::FUNCTION)
    }

    /// Whether the object is a base object or its field at offset 0
    pub fn is_first_field(&self) -> bool {
        self.base == self.id || self.field == Some(0)
    }
}

/// Table of every memory object
#[derive(Debug, Clone, Default)]
pub struct ObjTable {
    objs: Vec<MemObject>,
    /// Field objects of each base, by offset
    fields: Vec<Vec<ObjId>>,
    dummy: Option<ObjId>,
}

impl ObjTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a base object with `fields` field objects
    pub fn add(
        &mut self,
        flags: ObjFlags,
        origin: ObjOrigin,
        fields: u32,
        func: Option<FuncId>,
        loc: Option<SourceLoc>,
        name: String,
    ) -> ObjId {
        let base = ObjId::new(self.objs.len());
        self.objs.push(MemObject {
            id: base,
            flags,
            origin,
            base,
            field: None,
            func,
            loc: loc.clone(),
            name: name.clone(),
        });
        self.fields.push(Vec::new());
        let mut field_ids = Vec::with_capacity(fields as usize);
        for k in 0..fields {
            let id = ObjId::new(self.objs.len());
            self.objs.push(MemObject {
                id,
                flags: flags | ObjFlags::FIELD,
                origin,
                base,
                field: Some(k),
                func,
                loc: loc.clone(),
                name: format!("{}.{}", name, k),
            });
            self.fields.push(Vec::new());
            field_ids.push(id);
        }
        self.fields[base.index()] = field_ids;
        base
    }

    /// The black hole object, created on first use
    pub fn dummy(&mut self) -> ObjId {
        if let Some(d) = self.dummy {
            return d;
        }
        let d = self.add(
            ObjFlags::DUMMY,
            ObjOrigin::Dummy,
            0,
            None,
            None,
            "<unknown>".to_string(),
        );
        self.dummy = Some(d);
        d
    }

    /// Object by handle
    pub fn get(&self, o: ObjId) -> &MemObject {
        &self.objs[o.index()]
    }

    /// Mark an object as indexed with variable offsets
    pub fn mark_array(&mut self, o: ObjId) {
        let base = self.objs[o.index()].base;
        self.objs[base.index()].flags |= ObjFlags::ARRAY;
    }

    /// Number of objects
    pub fn len(&self) -> usize {
        self.objs.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    /// All objects
    pub fn iter(&self) -> impl Iterator<Item = &MemObject> + '_ {
        self.objs.iter()
    }

    /// Field objects of the base of `o`
    pub fn fields_of(&self, o: ObjId) -> &[ObjId] {
        &self.fields[self.get(o).base.index()]
    }

    /// Object reached by projecting `o` by `offset`
    pub fn field_obj(&self, o: ObjId, offset: u32) -> ObjId {
        let obj = self.get(o);
        if obj.is_dummy() || obj.is_function() {
            return o;
        }
        let fields = &self.fields[obj.base.index()];
        let target = obj.field.unwrap_or(0) + offset;
        if fields.is_empty() {
            return obj.base;
        }
        fields.get(target as usize).copied().unwrap_or(obj.base)
    }

    /// The base of `o` together with all of its fields
    pub fn all_fields(&self, o: ObjId) -> Vec<ObjId> {
        let base = self.get(o).base;
        let mut out = vec![base];
        out.extend(self.fields[base.index()].iter().copied());
        out
    }

    /// Whether the base of `o` is an array
    pub fn is_array(&self, o: ObjId) -> bool {
        let base = self.get(o).base;
        self.get(base).flags.contains(ObjFlags::ARRAY)
    }
}
