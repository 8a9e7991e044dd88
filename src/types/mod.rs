// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Type definitions for the module data model.
//!
//! Covers the value and memory-access types, function signatures, the
//! decoded module descriptor tables (globals, functions, data segments), and
//! the index newtypes used to refer into them.

mod opcode;
pub use opcode::*;

use core::str;

use num_enum::TryFromPrimitive;

use crate::Allocator;
use crate::core_compat::vec::Vec;

// Defines a public index newtype without public mutable access to the
// underlying integer, along with some convenience trait implementations.
macro_rules! newtype {
    (
        $(#[$meta:meta])*
        pub struct $type:ident($underlying:ty);
    ) => {
        $(#[$meta])*
        pub struct $type($underlying);

        impl $type {
            pub const fn new(value: $underlying) -> Self {
                Self(value)
            }
        }

        impl ::core::ops::Deref for $type {
            type Target = $underlying;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl From<$type> for usize {
            fn from(value: $type) -> usize {
                value.0 as usize
            }
        }
    };
}
pub(crate) use newtype;

/// The static type of a value computed by bytecode, or the statement
/// pseudo-type for constructs that produce none.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum ValueType {
    /// No value; the type of statements. Doubles as the "void" return type
    /// in signatures and is not a legal parameter or local type.
    Stmt = 0,
    /// 32-bit integer.
    I32 = 1,
    /// 64-bit integer.
    I64 = 2,
    /// 32-bit IEEE 754 float.
    F32 = 3,
    /// 64-bit IEEE 754 float.
    F64 = 4,
}

impl ValueType {
    /// Whether this type is a value proper (anything but `Stmt`).
    pub const fn is_value(self) -> bool {
        !matches!(self, ValueType::Stmt)
    }
}

/// The element type of a linear-memory access or a global variable.
///
/// Narrow integer variants exist in signed/unsigned pairs; loads widen them
/// to the corresponding [`ValueType`] with sign or zero extension, and
/// stores truncate from it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum MemType {
    I8 = 0,
    U8 = 1,
    I16 = 2,
    U16 = 3,
    I32 = 4,
    U32 = 5,
    I64 = 6,
    U64 = 7,
    F32 = 8,
    F64 = 9,
}

impl MemType {
    /// The access size in bytes. Natural alignment equals the size.
    pub const fn size(self) -> u8 {
        match self {
            MemType::I8 | MemType::U8 => 1,
            MemType::I16 | MemType::U16 => 2,
            MemType::I32 | MemType::U32 | MemType::F32 => 4,
            MemType::I64 | MemType::U64 | MemType::F64 => 8,
        }
    }

    /// The value type a load of this access type widens to.
    pub const fn value_type(self) -> ValueType {
        match self {
            MemType::I8 | MemType::U8 | MemType::I16 | MemType::U16 | MemType::I32
            | MemType::U32 => ValueType::I32,
            MemType::I64 | MemType::U64 => ValueType::I64,
            MemType::F32 => ValueType::F32,
            MemType::F64 => ValueType::F64,
        }
    }

    /// Whether a narrow load sign-extends (as opposed to zero-extends).
    pub const fn is_signed(self) -> bool {
        matches!(self, MemType::I8 | MemType::I16 | MemType::I32 | MemType::I64)
    }
}

newtype!(
    /// An index into the module's signature table.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct SigIdx(u16);
);

newtype!(
    /// An index into the module's function table.
    #[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
    pub struct FuncIdx(u16);
);

newtype!(
    /// An index into the module's globals table.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct GlobalIdx(u16);
);

/// A function signature: at most one return value and an ordered parameter
/// list. Signatures are interned per module; structurally equal inline
/// encodings share one table entry.
#[derive(Clone)]
pub struct Signature<A: Allocator> {
    /// The return type, with `Stmt` standing for "returns nothing".
    pub return_type: ValueType,
    /// Parameter types, in declaration order. `Stmt` is illegal here.
    pub params: Vec<ValueType, A>,
}

impl<A: Allocator> core::fmt::Debug for Signature<A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signature")
            .field("return_type", &self.return_type)
            .field("params", &self.params)
            .finish()
    }
}

impl<A: Allocator> Eq for Signature<A> {}

impl<A: Allocator> PartialEq for Signature<A> {
    fn eq(&self, other: &Self) -> bool {
        self.return_type == other.return_type && self.params == other.params
    }
}

impl<A: Allocator> Signature<A> {
    /// The number of values the function returns (0 or 1).
    pub fn return_count(&self) -> usize {
        usize::from(self.return_type.is_value())
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }
}

/// A module global variable. Lives at `offset` within the contiguous,
/// untyped globals area of an instance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Global {
    /// Offset of the global's NUL-terminated name in the module bytes, or 0
    /// if unnamed.
    pub name_offset: u32,
    /// Storage type of the global.
    pub ty: MemType,
    /// Byte offset within the globals area, assigned at decode time by a
    /// single naturally-aligning pass.
    pub offset: u32,
    pub exported: bool,
}

/// A data segment to be copied into linear memory at instantiation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DataSegment {
    /// Destination address in linear memory.
    pub dest_addr: u32,
    /// Source offset of the payload within the module bytes.
    pub source_offset: u32,
    /// Payload size in bytes.
    pub source_size: u32,
    /// Whether the segment is applied at instantiation. Inactive segments
    /// are carried for tooling but never touch memory.
    pub init: bool,
}

/// A function table entry. The body itself stays in the module bytes at
/// `[code_start, code_end)` and is decoded on demand by the verifier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Function {
    pub sig: SigIdx,
    /// Offset of the function's NUL-terminated name in the module bytes, or
    /// 0 if unnamed.
    pub name_offset: u32,
    pub code_start: u32,
    pub code_end: u32,
    pub local_i32: u16,
    pub local_i64: u16,
    pub local_f32: u16,
    pub local_f64: u16,
    pub exported: bool,
    /// External functions have no body; their code is resolved through the
    /// embedder's import map at instantiation.
    pub external: bool,
}

impl Function {
    /// The number of declared locals, parameters not included.
    pub fn local_count(&self) -> u32 {
        u32::from(self.local_i32)
            + u32::from(self.local_i64)
            + u32::from(self.local_f32)
            + u32::from(self.local_f64)
    }
}

/// A decoded module: the header fields, the descriptor tables, and a borrow
/// of the original bytes for name and code lookup.
pub struct Module<'bytes, A: Allocator> {
    /// The raw module bytes the descriptor tables point into.
    pub bytes: &'bytes [u8],
    /// Linear memory size is `1 << mem_size_log2` bytes.
    pub mem_size_log2: u8,
    /// Whether the instance registers its memory as an export.
    pub mem_exported: bool,
    pub signatures: Vec<Signature<A>, A>,
    pub globals: Vec<Global, A>,
    pub functions: Vec<Function, A>,
    pub data_segments: Vec<DataSegment, A>,
    /// Total size of the globals area, as computed by offset assignment.
    pub globals_area_size: u32,
}

impl<A: Allocator> core::fmt::Debug for Module<'_, A> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Module")
            .field("bytes", &self.bytes)
            .field("mem_size_log2", &self.mem_size_log2)
            .field("mem_exported", &self.mem_exported)
            .field("signatures", &self.signatures)
            .field("globals", &self.globals)
            .field("functions", &self.functions)
            .field("data_segments", &self.data_segments)
            .field("globals_area_size", &self.globals_area_size)
            .finish()
    }
}

impl<A: Allocator> PartialEq for Module<'_, A> {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
            && self.mem_size_log2 == other.mem_size_log2
            && self.mem_exported == other.mem_exported
            && self.signatures == other.signatures
            && self.globals == other.globals
            && self.functions == other.functions
            && self.data_segments == other.data_segments
            && self.globals_area_size == other.globals_area_size
    }
}

impl<'bytes, A: Allocator> Module<'bytes, A> {
    /// The linear memory size in bytes.
    pub fn mem_size(&self) -> usize {
        1usize << self.mem_size_log2
    }

    pub fn signature(&self, sig: SigIdx) -> &Signature<A> {
        &self.signatures[usize::from(sig)]
    }

    pub fn function(&self, func: FuncIdx) -> &Function {
        &self.functions[usize::from(func)]
    }

    pub fn global(&self, global: GlobalIdx) -> &Global {
        &self.globals[usize::from(global)]
    }

    /// Looks up a NUL-terminated UTF-8 name at the given module-byte offset.
    /// Offset 0 means "unnamed"; a malformed name yields `None` and is
    /// reported by whoever needed it.
    pub fn name_at(&self, offset: u32) -> Option<&'bytes str> {
        if offset == 0 {
            return None;
        }
        let start = offset as usize;
        let tail = self.bytes.get(start..)?;
        let len = tail.iter().position(|&b| b == 0)?;
        str::from_utf8(&tail[..len]).ok()
    }
}
