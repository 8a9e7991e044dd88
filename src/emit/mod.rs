// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Binary module assembly and the source-dialect front end.
//!
//! [`ModuleBuilder`] produces the exact byte layout the decoder consumes:
//! header, globals table, function table, data-segment table, then a blob
//! region holding names (NUL-terminated), function bodies, and segment
//! payloads. [`lower`] walks the typed AST of the restricted source dialect
//! (see [`ast`]) and drives a builder to produce a whole module.

pub mod ast;
mod lower;

pub use lower::{Error as LowerError, emit_module};

use core::fmt;

use crate::core_compat::alloc::Global;
use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;
use crate::decode::MAX_MODULE_SIZE;
use crate::types::{MemType, ValueType};

/// Represents errors that can arise while assembling a module.
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum Error {
    /// Failed memory allocation.
    AllocError,
    /// More entries than a u16 table count can hold.
    TooManyGlobals,
    TooManyFunctions,
    TooManySegments,
    /// More parameters than the u8 count can hold.
    TooManyParams,
    /// The assembled module exceeds the decoder's size limit.
    ModuleTooLarge(usize),
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocError => write!(f, "allocation failure"),
            Error::TooManyGlobals => write!(f, "too many globals"),
            Error::TooManyFunctions => write!(f, "too many functions"),
            Error::TooManySegments => write!(f, "too many data segments"),
            Error::TooManyParams => write!(f, "too many parameters"),
            Error::ModuleTooLarge(size) => write!(f, "module too large ({size} bytes)"),
        }
    }
}

impl From<TryReserveError> for Error {
    fn from(_: TryReserveError) -> Self {
        Error::AllocError
    }
}

struct GlobalEntry {
    ty: MemType,
    exported: bool,
}

struct FunctionEntry<'n> {
    name: Option<&'n str>,
    return_type: ValueType,
    params: Vec<ValueType, Global>,
    body: Vec<u8, Global>,
    locals: [u16; 4],
    exported: bool,
    external: bool,
}

struct SegmentEntry {
    dest_addr: u32,
    payload: Vec<u8, Global>,
    init: bool,
}

/// Assembles binary modules in the §4.3 layout. Names are borrowed from the
/// caller and serialized into the blob region.
pub struct ModuleBuilder<'n> {
    mem_size_log2: u8,
    mem_export: bool,
    globals: Vec<GlobalEntry, Global>,
    functions: Vec<FunctionEntry<'n>, Global>,
    segments: Vec<SegmentEntry, Global>,
}

impl<'n> ModuleBuilder<'n> {
    pub fn new(mem_size_log2: u8, mem_export: bool) -> Self {
        Self {
            mem_size_log2,
            mem_export,
            globals: Vec::new_in(Global),
            functions: Vec::new_in(Global),
            segments: Vec::new_in(Global),
        }
    }

    /// Adds an unnamed global and returns its index.
    pub fn add_global(&mut self, ty: MemType, exported: bool) -> u16 {
        let index = self.globals.len() as u16;
        self.globals.push(GlobalEntry { ty, exported });
        index
    }

    /// Adds a function with the given signature and body bytes; locals,
    /// name, and flags start empty and are set separately.
    pub fn add_function(
        &mut self,
        return_type: ValueType,
        params: &[ValueType],
        body: &[u8],
    ) -> Result<u16, Error> {
        if self.functions.len() >= usize::from(u16::MAX) {
            return Err(Error::TooManyFunctions);
        }
        if params.len() > usize::from(u8::MAX) {
            return Err(Error::TooManyParams);
        }
        let mut stored_params = Vec::new_in(Global);
        stored_params.try_reserve_exact(params.len())?;
        stored_params.extend_from_slice(params);
        let mut stored_body = Vec::new_in(Global);
        stored_body.try_reserve_exact(body.len())?;
        stored_body.extend_from_slice(body);
        let index = self.functions.len() as u16;
        self.functions.push(FunctionEntry {
            name: None,
            return_type,
            params: stored_params,
            body: stored_body,
            locals: [0; 4],
            exported: false,
            external: false,
        });
        Ok(index)
    }

    /// Sets the per-type local counts of a function, in I32/I64/F32/F64
    /// order.
    pub fn set_locals(&mut self, function: u16, locals: [u16; 4]) {
        self.functions[usize::from(function)].locals = locals;
    }

    pub fn set_name(&mut self, function: u16, name: &'n str) {
        self.functions[usize::from(function)].name = Some(name);
    }

    pub fn set_exported(&mut self, function: u16) {
        self.functions[usize::from(function)].exported = true;
    }

    pub fn set_external(&mut self, function: u16) {
        self.functions[usize::from(function)].external = true;
    }

    pub fn add_data_segment(&mut self, dest_addr: u32, payload: &[u8], init: bool) -> u16 {
        let mut stored = Vec::new_in(Global);
        stored.extend_from_slice(payload);
        let index = self.segments.len() as u16;
        self.segments.push(SegmentEntry { dest_addr, payload: stored, init });
        index
    }

    pub fn function_count(&self) -> u16 {
        self.functions.len() as u16
    }

    /// Serializes the module.
    pub fn build(&self) -> Result<Vec<u8, Global>, Error> {
        if self.globals.len() > usize::from(u16::MAX) {
            return Err(Error::TooManyGlobals);
        }
        if self.functions.len() > usize::from(u16::MAX) {
            return Err(Error::TooManyFunctions);
        }
        if self.segments.len() > usize::from(u16::MAX) {
            return Err(Error::TooManySegments);
        }

        let tables_size = 8
            + 6 * self.globals.len()
            + self
                .functions
                .iter()
                .map(|function| 24 + function.params.len())
                .sum::<usize>()
            + 13 * self.segments.len();

        // Lay out the blob: function names first, then bodies, then segment
        // payloads.
        let mut cursor = tables_size;
        let mut name_offsets = Vec::new_in(Global);
        name_offsets.try_reserve_exact(self.functions.len())?;
        for function in &self.functions {
            match function.name {
                Some(name) => {
                    name_offsets.push(cursor as u32);
                    cursor += name.len() + 1;
                }
                None => name_offsets.push(0),
            }
        }
        let mut body_offsets = Vec::new_in(Global);
        body_offsets.try_reserve_exact(self.functions.len())?;
        for function in &self.functions {
            if function.external {
                body_offsets.push((0, 0));
            } else {
                let start = cursor as u32;
                cursor += function.body.len();
                body_offsets.push((start, cursor as u32));
            }
        }
        let mut payload_offsets = Vec::new_in(Global);
        payload_offsets.try_reserve_exact(self.segments.len())?;
        for segment in &self.segments {
            payload_offsets.push(cursor as u32);
            cursor += segment.payload.len();
        }

        let total = cursor;
        if total > MAX_MODULE_SIZE {
            return Err(Error::ModuleTooLarge(total));
        }

        let mut out = Vec::new_in(Global);
        out.try_reserve_exact(total)?;
        out.push(self.mem_size_log2);
        out.push(u8::from(self.mem_export));
        out.extend_from_slice(&(self.globals.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.functions.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.segments.len() as u16).to_le_bytes());

        for global in &self.globals {
            out.extend_from_slice(&0u32.to_le_bytes());
            out.push(global.ty as u8);
            out.push(u8::from(global.exported));
        }
        for (index, function) in self.functions.iter().enumerate() {
            out.push(function.params.len() as u8);
            out.push(function.return_type as u8);
            for &param in function.params.iter() {
                out.push(param as u8);
            }
            out.extend_from_slice(&name_offsets[index].to_le_bytes());
            let (start, end) = body_offsets[index];
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&end.to_le_bytes());
            for count in function.locals {
                out.extend_from_slice(&count.to_le_bytes());
            }
            out.push(u8::from(function.exported));
            out.push(u8::from(function.external));
        }
        for (index, segment) in self.segments.iter().enumerate() {
            out.extend_from_slice(&segment.dest_addr.to_le_bytes());
            out.extend_from_slice(&payload_offsets[index].to_le_bytes());
            out.extend_from_slice(&(segment.payload.len() as u32).to_le_bytes());
            out.push(u8::from(segment.init));
        }

        for function in &self.functions {
            if let Some(name) = function.name {
                out.extend_from_slice(name.as_bytes());
                out.push(0);
            }
        }
        for function in &self.functions {
            if !function.external {
                out.extend_from_slice(&function.body);
            }
        }
        for segment in &self.segments {
            out.extend_from_slice(&segment.payload);
        }

        debug_assert_eq!(out.len(), total);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeOptions;
    use crate::types::{Module, Opcode};

    const NO_VERIFY: DecodeOptions = DecodeOptions { verify_functions: false };

    #[test]
    fn empty_module_is_a_bare_header() {
        let bytes = ModuleBuilder::new(12, true).build().unwrap();
        assert_eq!(bytes.as_slice(), &[12, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn built_modules_decode_back() {
        let mut builder = ModuleBuilder::new(10, false);
        builder.add_global(MemType::I32, true);
        let body = [Opcode::Return as u8, Opcode::I8Const as u8, 7];
        let f = builder
            .add_function(ValueType::I32, &[], &body)
            .unwrap();
        builder.set_name(f, "seven");
        builder.set_exported(f);
        builder.set_locals(f, [2, 0, 1, 0]);
        builder.add_data_segment(16, &[0xde, 0xad], true);

        let bytes = builder.build().unwrap();
        let module = Module::decode(&bytes, NO_VERIFY, Global).unwrap();
        assert_eq!(module.mem_size_log2, 10);
        assert_eq!(module.globals.len(), 1);
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.data_segments.len(), 1);

        let function = &module.functions[0];
        assert!(function.exported);
        assert!(!function.external);
        assert_eq!(function.local_i32, 2);
        assert_eq!(function.local_f32, 1);
        assert_eq!(module.name_at(function.name_offset), Some("seven"));
        let body_range = function.code_start as usize..function.code_end as usize;
        assert_eq!(&module.bytes[body_range], &body);

        let segment = &module.data_segments[0];
        assert_eq!(segment.dest_addr, 16);
        assert!(segment.init);
        let payload = segment.source_offset as usize..;
        assert_eq!(&module.bytes[payload][..2], &[0xde, 0xad]);
    }

    #[test]
    fn external_functions_carry_no_code() {
        let mut builder = ModuleBuilder::new(0, false);
        let f = builder
            .add_function(ValueType::I32, &[ValueType::F64], &[1, 2, 3])
            .unwrap();
        builder.set_external(f);
        builder.set_name(f, "host");
        let bytes = builder.build().unwrap();
        let module = Module::decode(&bytes, NO_VERIFY, Global).unwrap();
        let function = &module.functions[0];
        assert!(function.external);
        assert_eq!(function.code_start, 0);
        assert_eq!(function.code_end, 0);
        assert_eq!(module.name_at(function.name_offset), Some("host"));
    }
}
