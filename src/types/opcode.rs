// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Bytecode opcodes and their static tables.
//!
//! Opcodes split into statement opcodes (control flow and stores, which
//! produce no value) and expression opcodes. Simple expression opcodes carry
//! a fixed [`OpSignature`]; the context-dependent ones (locals, globals,
//! memory, calls, ternary, comma) are typed by the verifier from module
//! state.

use num_enum::TryFromPrimitive;

use super::{MemType, ValueType};

/// A bytecode opcode. Discriminants are the wire encoding.
#[derive(Clone, Copy, Debug, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // Statements.
    Nop = 0x00,
    Block = 0x01,
    Loop = 0x02,
    InfiniteLoop = 0x03,
    If = 0x04,
    IfThen = 0x05,
    Switch = 0x06,
    SwitchNf = 0x07,
    Break = 0x08,
    Continue = 0x09,
    Return = 0x0a,
    SetLocal = 0x0b,
    StoreGlobal = 0x0c,
    StoreMemI8 = 0x0d,
    StoreMemU8 = 0x0e,
    StoreMemI16 = 0x0f,
    StoreMemU16 = 0x10,
    StoreMemI32 = 0x11,
    StoreMemU32 = 0x12,
    StoreMemI64 = 0x13,
    StoreMemU64 = 0x14,
    StoreMemF32 = 0x15,
    StoreMemF64 = 0x16,

    // Expressions.
    I8Const = 0x17,
    I32Const = 0x18,
    I64Const = 0x19,
    F32Const = 0x1a,
    F64Const = 0x1b,
    GetLocal = 0x1c,
    LoadGlobal = 0x1d,
    LoadMemI8 = 0x1e,
    LoadMemU8 = 0x1f,
    LoadMemI16 = 0x20,
    LoadMemU16 = 0x21,
    LoadMemI32 = 0x22,
    LoadMemU32 = 0x23,
    LoadMemI64 = 0x24,
    LoadMemU64 = 0x25,
    LoadMemF32 = 0x26,
    LoadMemF64 = 0x27,
    CallFunction = 0x28,
    Ternary = 0x29,
    Comma = 0x2a,
    BoolNot = 0x2b,

    // 32-bit integer operators.
    I32Add = 0x30,
    I32Sub = 0x31,
    I32Mul = 0x32,
    I32DivS = 0x33,
    I32DivU = 0x34,
    I32RemS = 0x35,
    I32RemU = 0x36,
    I32And = 0x37,
    I32Or = 0x38,
    I32Xor = 0x39,
    I32Shl = 0x3a,
    I32ShrS = 0x3b,
    I32ShrU = 0x3c,
    I32Eq = 0x3d,
    I32Ne = 0x3e,
    I32LtS = 0x3f,
    I32LeS = 0x40,
    I32LtU = 0x41,
    I32LeU = 0x42,
    I32GtS = 0x43,
    I32GeS = 0x44,
    I32GtU = 0x45,
    I32GeU = 0x46,

    // 64-bit integer operators.
    I64Add = 0x50,
    I64Sub = 0x51,
    I64Mul = 0x52,
    I64DivS = 0x53,
    I64DivU = 0x54,
    I64RemS = 0x55,
    I64RemU = 0x56,
    I64And = 0x57,
    I64Or = 0x58,
    I64Xor = 0x59,
    I64Shl = 0x5a,
    I64ShrS = 0x5b,
    I64ShrU = 0x5c,
    I64Eq = 0x5d,
    I64Ne = 0x5e,
    I64LtS = 0x5f,
    I64LeS = 0x60,
    I64LtU = 0x61,
    I64LeU = 0x62,
    I64GtS = 0x63,
    I64GeS = 0x64,
    I64GtU = 0x65,
    I64GeU = 0x66,

    // 32-bit float operators.
    F32Add = 0x70,
    F32Sub = 0x71,
    F32Mul = 0x72,
    F32Div = 0x73,
    F32Abs = 0x74,
    F32Neg = 0x75,
    F32Eq = 0x76,
    F32Ne = 0x77,
    F32Lt = 0x78,
    F32Le = 0x79,
    F32Gt = 0x7a,
    F32Ge = 0x7b,

    // 64-bit float operators.
    F64Add = 0x80,
    F64Sub = 0x81,
    F64Mul = 0x82,
    F64Div = 0x83,
    F64Abs = 0x84,
    F64Neg = 0x85,
    F64Eq = 0x86,
    F64Ne = 0x87,
    F64Lt = 0x88,
    F64Le = 0x89,
    F64Gt = 0x8a,
    F64Ge = 0x8b,

    // Conversions.
    I32ConvertI64 = 0x90,
    I32SConvertF32 = 0x91,
    I32UConvertF32 = 0x92,
    I32SConvertF64 = 0x93,
    I32UConvertF64 = 0x94,
    I64SConvertI32 = 0x95,
    I64UConvertI32 = 0x96,
    I64SConvertF32 = 0x97,
    I64UConvertF32 = 0x98,
    I64SConvertF64 = 0x99,
    I64UConvertF64 = 0x9a,
    F32SConvertI32 = 0x9b,
    F32UConvertI32 = 0x9c,
    F32SConvertI64 = 0x9d,
    F32UConvertI64 = 0x9e,
    F32ConvertF64 = 0x9f,
    F64SConvertI32 = 0xa0,
    F64UConvertI32 = 0xa1,
    F64SConvertI64 = 0xa2,
    F64UConvertI64 = 0xa3,
    F64ConvertF32 = 0xa4,
}

/// The fixed signature of a simple expression opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpSignature {
    pub return_type: ValueType,
    pub params: &'static [ValueType],
}

/// The access descriptor of a load or store opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemAccess {
    pub ty: MemType,
    pub store: bool,
}

use ValueType::{F32, F64, I32, I64};

const SIG_I32: OpSignature = OpSignature { return_type: I32, params: &[] };
const SIG_I64: OpSignature = OpSignature { return_type: I64, params: &[] };
const SIG_F32: OpSignature = OpSignature { return_type: F32, params: &[] };
const SIG_F64: OpSignature = OpSignature { return_type: F64, params: &[] };
const SIG_I32_I32: OpSignature = OpSignature { return_type: I32, params: &[I32] };
const SIG_I32_II: OpSignature = OpSignature { return_type: I32, params: &[I32, I32] };
const SIG_I64_LL: OpSignature = OpSignature { return_type: I64, params: &[I64, I64] };
const SIG_I32_LL: OpSignature = OpSignature { return_type: I32, params: &[I64, I64] };
const SIG_F32_FF: OpSignature = OpSignature { return_type: F32, params: &[F32, F32] };
const SIG_F32_F: OpSignature = OpSignature { return_type: F32, params: &[F32] };
const SIG_I32_FF: OpSignature = OpSignature { return_type: I32, params: &[F32, F32] };
const SIG_F64_DD: OpSignature = OpSignature { return_type: F64, params: &[F64, F64] };
const SIG_F64_D: OpSignature = OpSignature { return_type: F64, params: &[F64] };
const SIG_I32_DD: OpSignature = OpSignature { return_type: I32, params: &[F64, F64] };
const SIG_I32_L: OpSignature = OpSignature { return_type: I32, params: &[I64] };
const SIG_I32_F: OpSignature = OpSignature { return_type: I32, params: &[F32] };
const SIG_I32_D: OpSignature = OpSignature { return_type: I32, params: &[F64] };
const SIG_I64_I: OpSignature = OpSignature { return_type: I64, params: &[I32] };
const SIG_I64_F: OpSignature = OpSignature { return_type: I64, params: &[F32] };
const SIG_I64_D: OpSignature = OpSignature { return_type: I64, params: &[F64] };
const SIG_F32_I: OpSignature = OpSignature { return_type: F32, params: &[I32] };
const SIG_F32_L: OpSignature = OpSignature { return_type: F32, params: &[I64] };
const SIG_F32_D: OpSignature = OpSignature { return_type: F32, params: &[F64] };
const SIG_F64_I: OpSignature = OpSignature { return_type: F64, params: &[I32] };
const SIG_F64_L: OpSignature = OpSignature { return_type: F64, params: &[I64] };
const SIG_F64_F: OpSignature = OpSignature { return_type: F64, params: &[F32] };

impl Opcode {
    /// Whether this opcode begins a statement. Expression opcodes may still
    /// appear in statement position (their value is dropped); the reverse is
    /// an error.
    pub const fn is_statement(self) -> bool {
        (self as u8) <= (Opcode::StoreMemF64 as u8)
    }

    /// The fixed signature of a simple expression opcode, or `None` for
    /// statements and the context-typed expression opcodes.
    pub const fn signature(self) -> Option<OpSignature> {
        use Opcode::*;
        let sig = match self {
            I8Const | I32Const => SIG_I32,
            I64Const => SIG_I64,
            F32Const => SIG_F32,
            F64Const => SIG_F64,

            BoolNot => SIG_I32_I32,

            I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU | I32And
            | I32Or | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Eq | I32Ne | I32LtS
            | I32LeS | I32LtU | I32LeU | I32GtS | I32GeS | I32GtU | I32GeU => SIG_I32_II,

            I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64And
            | I64Or | I64Xor | I64Shl | I64ShrS | I64ShrU => SIG_I64_LL,
            I64Eq | I64Ne | I64LtS | I64LeS | I64LtU | I64LeU | I64GtS | I64GeS | I64GtU
            | I64GeU => SIG_I32_LL,

            F32Add | F32Sub | F32Mul | F32Div => SIG_F32_FF,
            F32Abs | F32Neg => SIG_F32_F,
            F32Eq | F32Ne | F32Lt | F32Le | F32Gt | F32Ge => SIG_I32_FF,

            F64Add | F64Sub | F64Mul | F64Div => SIG_F64_DD,
            F64Abs | F64Neg => SIG_F64_D,
            F64Eq | F64Ne | F64Lt | F64Le | F64Gt | F64Ge => SIG_I32_DD,

            I32ConvertI64 => SIG_I32_L,
            I32SConvertF32 | I32UConvertF32 => SIG_I32_F,
            I32SConvertF64 | I32UConvertF64 => SIG_I32_D,
            I64SConvertI32 | I64UConvertI32 => SIG_I64_I,
            I64SConvertF32 | I64UConvertF32 => SIG_I64_F,
            I64SConvertF64 | I64UConvertF64 => SIG_I64_D,
            F32SConvertI32 | F32UConvertI32 => SIG_F32_I,
            F32SConvertI64 | F32UConvertI64 => SIG_F32_L,
            F32ConvertF64 => SIG_F32_D,
            F64SConvertI32 | F64UConvertI32 => SIG_F64_I,
            F64SConvertI64 | F64UConvertI64 => SIG_F64_L,
            F64ConvertF32 => SIG_F64_F,

            _ => return None,
        };
        Some(sig)
    }

    /// The access descriptor of a load or store opcode.
    pub const fn mem_access(self) -> Option<MemAccess> {
        use Opcode::*;
        let (ty, store) = match self {
            LoadMemI8 => (MemType::I8, false),
            LoadMemU8 => (MemType::U8, false),
            LoadMemI16 => (MemType::I16, false),
            LoadMemU16 => (MemType::U16, false),
            LoadMemI32 => (MemType::I32, false),
            LoadMemU32 => (MemType::U32, false),
            LoadMemI64 => (MemType::I64, false),
            LoadMemU64 => (MemType::U64, false),
            LoadMemF32 => (MemType::F32, false),
            LoadMemF64 => (MemType::F64, false),
            StoreMemI8 => (MemType::I8, true),
            StoreMemU8 => (MemType::U8, true),
            StoreMemI16 => (MemType::I16, true),
            StoreMemU16 => (MemType::U16, true),
            StoreMemI32 => (MemType::I32, true),
            StoreMemU32 => (MemType::U32, true),
            StoreMemI64 => (MemType::I64, true),
            StoreMemU64 => (MemType::U64, true),
            StoreMemF32 => (MemType::F32, true),
            StoreMemF64 => (MemType::F64, true),
            _ => return None,
        };
        Some(MemAccess { ty, store })
    }

    /// The load opcode for the given access type.
    pub const fn load(ty: MemType) -> Opcode {
        match ty {
            MemType::I8 => Opcode::LoadMemI8,
            MemType::U8 => Opcode::LoadMemU8,
            MemType::I16 => Opcode::LoadMemI16,
            MemType::U16 => Opcode::LoadMemU16,
            MemType::I32 => Opcode::LoadMemI32,
            MemType::U32 => Opcode::LoadMemU32,
            MemType::I64 => Opcode::LoadMemI64,
            MemType::U64 => Opcode::LoadMemU64,
            MemType::F32 => Opcode::LoadMemF32,
            MemType::F64 => Opcode::LoadMemF64,
        }
    }

    /// The store opcode for the given access type.
    pub const fn store(ty: MemType) -> Opcode {
        match ty {
            MemType::I8 => Opcode::StoreMemI8,
            MemType::U8 => Opcode::StoreMemU8,
            MemType::I16 => Opcode::StoreMemI16,
            MemType::U16 => Opcode::StoreMemU16,
            MemType::I32 => Opcode::StoreMemI32,
            MemType::U32 => Opcode::StoreMemU32,
            MemType::I64 => Opcode::StoreMemI64,
            MemType::U64 => Opcode::StoreMemU64,
            MemType::F32 => Opcode::StoreMemF32,
            MemType::F64 => Opcode::StoreMemF64,
        }
    }

    /// Whether this opcode reads or writes 64-bit integer values.
    pub const fn uses_i64(self) -> bool {
        use Opcode::*;
        matches!(
            self,
            I64Const
                | StoreMemI64
                | StoreMemU64
                | LoadMemI64
                | LoadMemU64
                | I64Add
                | I64Sub
                | I64Mul
                | I64DivS
                | I64DivU
                | I64RemS
                | I64RemU
                | I64And
                | I64Or
                | I64Xor
                | I64Shl
                | I64ShrS
                | I64ShrU
                | I64Eq
                | I64Ne
                | I64LtS
                | I64LeS
                | I64LtU
                | I64LeU
                | I64GtS
                | I64GeS
                | I64GtU
                | I64GeU
                | I32ConvertI64
                | I64SConvertI32
                | I64UConvertI32
                | I64SConvertF32
                | I64UConvertF32
                | I64SConvertF64
                | I64UConvertF64
                | F32SConvertI64
                | F32UConvertI64
                | F64SConvertI64
                | F64UConvertI64
        )
    }

    /// Whether this opcode is usable on the compilation target. 64-bit
    /// integer opcodes are rejected on 32-bit targets, where the back end
    /// has no word size to carry them.
    pub const fn is_supported(self) -> bool {
        if cfg!(target_pointer_width = "32") {
            !self.uses_i64()
        } else {
            true
        }
    }
}
