// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Binary module decoding.
//!
//! The module byte stream is a fixed little-endian layout: an 8-byte header
//! `{ mem_size_log2: u8, mem_export: u8, globals_count: u16,
//! functions_count: u16, data_segments_count: u16 }`, then the globals
//! table, the function table (each entry led by its inline signature), and
//! the data-segment table. Function bodies, names, and segment payloads live
//! at offsets into the same byte range, which the decoded [`Module`] borrows.

mod reader;

pub use reader::{ReadError, ReadErrorKind, Reader};

use core::fmt;

use crate::Allocator;
use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;
use crate::types::{
    DataSegment, FuncIdx, Function, Global, MemType, Module, SigIdx, Signature, ValueType,
};
use crate::verify::{self, FunctionEnv};

/// The smallest well-formed module: a bare header.
pub const MIN_MODULE_SIZE: usize = 8;

/// Modules larger than this are rejected before any parsing.
pub const MAX_MODULE_SIZE: usize = 1024 * 1024;

/// Upper bound on a single function body, in bytes.
pub const MAX_FUNCTION_SIZE: u32 = 128 * 1024;

/// Represents errors that can arise during module decoding.
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum Error {
    /// Failed memory allocation.
    AllocError,
    /// The input is smaller than a module header.
    ModuleTooSmall(usize),
    /// The input exceeds the implementation's module size limit.
    ModuleTooLarge(usize),
    /// A fixed-width read ran past the end of the module.
    Truncated { offset: u32 },
    /// An offset field points outside the module bytes, or a code range is
    /// inverted.
    OffsetOutOfBounds { offset: u32 },
    /// A function body exceeds the per-function size limit.
    FunctionTooLarge { index: u16, size: u32 },
    /// A global declares an unknown memory-access type.
    InvalidMemType { offset: u32, byte: u8 },
    /// A signature field holds an unknown value-type byte.
    InvalidValueType { offset: u32, byte: u8 },
    /// A signature declares `Stmt` as a parameter type.
    InvalidSignature { offset: u32 },
    /// A function body failed verification.
    Verification { function: u16, error: verify::Error },
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocError => write!(f, "allocation failure"),
            Error::ModuleTooSmall(size) => write!(f, "module too small ({size} bytes)"),
            Error::ModuleTooLarge(size) => write!(f, "module too large ({size} bytes)"),
            Error::Truncated { offset } => write!(f, "truncated module at {offset:#x}"),
            Error::OffsetOutOfBounds { offset } => {
                write!(f, "offset out of bounds at {offset:#x}")
            }
            Error::FunctionTooLarge { index, size } => {
                write!(f, "function #{index} too large ({size} bytes)")
            }
            Error::InvalidMemType { offset, byte } => {
                write!(f, "invalid memory type ({byte:#x}) at {offset:#x}")
            }
            Error::InvalidValueType { offset, byte } => {
                write!(f, "invalid value type ({byte:#x}) at {offset:#x}")
            }
            Error::InvalidSignature { offset } => {
                write!(f, "invalid signature at {offset:#x}")
            }
            Error::Verification { function, error } => {
                write!(f, "function #{function}: {error:?}")
            }
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::AllocError
    }
}

impl From<ReadError> for Error {
    fn from(err: ReadError) -> Self {
        match err.kind {
            ReadErrorKind::Truncated => Error::Truncated { offset: err.pc },
            ReadErrorKind::OffsetOutOfBounds => Error::OffsetOutOfBounds { offset: err.pc },
        }
    }
}

/// Decoding knobs.
#[derive(Clone, Copy, Debug)]
pub struct DecodeOptions {
    /// Hand every non-external function body to the verifier; the first
    /// failure aborts the decode, annotated with the function index.
    pub verify_functions: bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self { verify_functions: true }
    }
}

// Rounds `offset` up to the natural alignment of a global of `size` bytes.
// Sizes are powers of two.
fn align_up(offset: u32, size: u32) -> u32 {
    (offset + size - 1) & !(size - 1)
}

// Converts the reader's latch, if set, before a structural commit.
fn check(reader: &Reader<'_>) -> Result<(), Error> {
    match reader.error() {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

impl<'bytes, A: Allocator + Clone> Module<'bytes, A> {
    /// Decodes a module from `bytes`, which the module borrows for name and
    /// code lookup.
    pub fn decode(bytes: &'bytes [u8], options: DecodeOptions, alloc: A) -> Result<Self, Error> {
        if bytes.len() < MIN_MODULE_SIZE {
            return Err(Error::ModuleTooSmall(bytes.len()));
        }
        if bytes.len() > MAX_MODULE_SIZE {
            return Err(Error::ModuleTooLarge(bytes.len()));
        }

        let mut reader = Reader::new(bytes);
        let mem_size_log2 = reader.u8();
        let mem_exported = reader.u8() != 0;
        let globals_count = reader.u16();
        let functions_count = reader.u16();
        let data_segments_count = reader.u16();

        let mut globals = Vec::new_in(alloc.clone());
        globals.try_reserve_exact(globals_count as usize)?;
        let mut globals_area_size = 0u32;
        for _ in 0..globals_count {
            let name_offset = reader.offset_u32();
            let ty_offset = reader.pos();
            let ty_byte = reader.u8();
            let exported = reader.u8() != 0;
            check(&reader)?;
            let ty = MemType::try_from(ty_byte)
                .map_err(|_| Error::InvalidMemType { offset: ty_offset, byte: ty_byte })?;
            let size = u32::from(ty.size());
            let offset = align_up(globals_area_size, size);
            globals_area_size = offset + size;
            globals.push(Global { name_offset, ty, offset, exported });
        }

        let mut signatures: Vec<Signature<A>, A> = Vec::new_in(alloc.clone());
        let mut functions = Vec::new_in(alloc.clone());
        functions.try_reserve_exact(functions_count as usize)?;
        for index in 0..functions_count {
            let sig = decode_signature(&mut reader, &alloc)?;
            let sig = intern_signature(&mut signatures, sig)?;

            let name_offset = reader.offset_u32();
            let code_offset = reader.pos();
            let code_start = reader.offset_u32();
            let code_end = reader.offset_u32();
            let local_i32 = reader.u16();
            let local_i64 = reader.u16();
            let local_f32 = reader.u16();
            let local_f64 = reader.u16();
            let exported = reader.u8() != 0;
            let external = reader.u8() != 0;
            check(&reader)?;
            if code_start > code_end {
                return Err(Error::OffsetOutOfBounds { offset: code_offset });
            }
            let size = code_end - code_start;
            if size > MAX_FUNCTION_SIZE {
                return Err(Error::FunctionTooLarge { index, size });
            }
            functions.push(Function {
                sig,
                name_offset,
                code_start,
                code_end,
                local_i32,
                local_i64,
                local_f32,
                local_f64,
                exported,
                external,
            });
        }

        let mut data_segments = Vec::new_in(alloc.clone());
        data_segments.try_reserve_exact(data_segments_count as usize)?;
        for _ in 0..data_segments_count {
            let dest_addr = reader.u32();
            let source_pos = reader.pos();
            let source_offset = reader.offset_u32();
            let source_size = reader.u32();
            let init = reader.u8() != 0;
            check(&reader)?;
            if (source_offset as usize) + (source_size as usize) > bytes.len() {
                return Err(Error::OffsetOutOfBounds { offset: source_pos });
            }
            data_segments.push(DataSegment { dest_addr, source_offset, source_size, init });
        }

        let module = Module {
            bytes,
            mem_size_log2,
            mem_exported,
            signatures,
            globals,
            functions,
            data_segments,
            globals_area_size,
        };

        if options.verify_functions {
            for index in 0..module.functions.len() {
                let function = FuncIdx::new(index as u16);
                if module.function(function).external {
                    continue;
                }
                let env = FunctionEnv::new(&module, function);
                verify::build_function_graph(&env, alloc.clone())
                    .map_err(|error| Error::Verification { function: index as u16, error })?;
            }
        }

        Ok(module)
    }
}

// Decodes an inline signature: `param_count: u8, return: u8, params: u8[n]`.
fn decode_signature<A: Allocator + Clone>(
    reader: &mut Reader<'_>,
    alloc: &A,
) -> Result<Signature<A>, Error> {
    let param_count = reader.u8();
    let return_offset = reader.pos();
    let return_byte = reader.u8();
    check(reader)?;
    let return_type = ValueType::try_from(return_byte)
        .map_err(|_| Error::InvalidValueType { offset: return_offset, byte: return_byte })?;

    let mut params = Vec::new_in(alloc.clone());
    params.try_reserve_exact(param_count as usize)?;
    for _ in 0..param_count {
        let offset = reader.pos();
        let byte = reader.u8();
        check(reader)?;
        let ty = ValueType::try_from(byte)
            .map_err(|_| Error::InvalidValueType { offset, byte })?;
        if !ty.is_value() {
            return Err(Error::InvalidSignature { offset });
        }
        params.push(ty);
    }
    Ok(Signature { return_type, params })
}

// Interns a signature, returning the index of the existing structural match
// or of a fresh entry.
fn intern_signature<A: Allocator + Clone>(
    signatures: &mut Vec<Signature<A>, A>,
    sig: Signature<A>,
) -> Result<SigIdx, Error> {
    if let Some(found) = signatures.iter().position(|existing| *existing == sig) {
        return Ok(SigIdx::new(found as u16));
    }
    signatures.try_reserve(1)?;
    let index = SigIdx::new(signatures.len() as u16);
    signatures.push(sig);
    Ok(index)
}
