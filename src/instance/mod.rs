// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Module instantiation.
//!
//! Turns a decoded module into a runnable instance: allocates and
//! initializes linear memory and the globals area, compiles every function
//! body (resolving externals through the embedder's import map), runs the
//! link pass, and registers exports. Each step is a failure gate; buffers
//! allocated before a failure are released by drop.

use core::fmt;

use hashbrown::HashMap;

use crate::Allocator;
use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;
use crate::link::{Backend, Linker};
use crate::types::{FuncIdx, Module};
use crate::verify::{self, FunctionEnv};

/// Largest accepted `mem_size_log2` (a 1 GiB linear memory).
pub const MAX_MEM_SIZE_LOG2: u8 = 30;

/// The name the linear memory registers under when the module exports it.
/// The binary format gives the memory no name of its own.
pub const MEMORY_EXPORT_NAME: &str = "memory";

/// Represents errors that can arise during instantiation.
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum Error<E> {
    /// Failed memory allocation.
    AllocError,
    /// The header requests a memory beyond the implementation limit.
    MemoryTooLarge(u8),
    /// An init-time data segment does not fit in linear memory.
    DataSegmentOutOfBounds { segment: u16 },
    /// A function body failed verification.
    Verification { function: u16, error: verify::Error },
    /// The back end failed to compile a function.
    Codegen { function: u16, error: E },
    /// An external function has no usable name to resolve by.
    ImportUnnamed { function: u16 },
    /// An external function's name is missing from the import map.
    ImportUnresolved { function: u16 },
    /// An exported function has no usable name to register under.
    ExportUnnamed { function: u16 },
    /// Two exports share a name.
    DuplicateExportName { function: u16 },
}

impl<E: fmt::Debug> fmt::Debug for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::AllocError => write!(f, "allocation failure"),
            Error::MemoryTooLarge(log2) => {
                write!(f, "memory size 2^{log2} exceeds the implementation limit")
            }
            Error::DataSegmentOutOfBounds { segment } => {
                write!(f, "data segment #{segment} does not fit in linear memory")
            }
            Error::Verification { function, error } => {
                write!(f, "function #{function}: {error:?}")
            }
            Error::Codegen { function, error } => {
                write!(f, "code generation for function #{function} failed: {error:?}")
            }
            Error::ImportUnnamed { function } => {
                write!(f, "external function #{function} has no resolvable name")
            }
            Error::ImportUnresolved { function } => {
                write!(f, "external function #{function} is not in the import map")
            }
            Error::ExportUnnamed { function } => {
                write!(f, "exported function #{function} has no name")
            }
            Error::DuplicateExportName { function } => {
                write!(f, "export name of function #{function} is already taken")
            }
        }
    }
}

impl<E> From<TryReserveError> for Error<E> {
    fn from(_: TryReserveError) -> Self {
        Error::AllocError
    }
}

/// The embedder-supplied map from external-function names to callable code
/// objects (e.g. host-call adapters).
pub struct Imports<'a, C> {
    map: HashMap<&'a str, C>,
}

impl<'a, C> Imports<'a, C> {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn insert(&mut self, name: &'a str, code: C) {
        self.map.insert(name, code);
    }

    pub fn get(&self, name: &str) -> Option<&C> {
        self.map.get(name)
    }
}

impl<C> Default for Imports<'_, C> {
    fn default() -> Self {
        Self::new()
    }
}

/// One named export of an instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Export<C> {
    /// An exported function's code object.
    Function(C),
    /// The linear memory; the buffer itself lives on the instance.
    Memory,
}

/// A live module instance: its buffers, per-function code, and named
/// exports. Export names borrow from the module bytes, except the memory's
/// fixed [`MEMORY_EXPORT_NAME`].
pub struct ModuleInstance<'bytes, C, A: Allocator> {
    pub memory: Vec<u8, A>,
    pub globals: Vec<u8, A>,
    /// Finished code per function, in table order.
    pub code: Vec<C, A>,
    /// Every export by name: functions, plus the memory when the header
    /// marks it exported.
    pub exports: HashMap<&'bytes str, Export<C>>,
}

impl<C, A: Allocator> ModuleInstance<'_, C, A> {
    /// The code object of the named exported function, if there is one.
    pub fn exported_function(&self, name: &str) -> Option<&C> {
        match self.exports.get(name) {
            Some(Export::Function(code)) => Some(code),
            _ => None,
        }
    }
}

/// Instantiates `module` against the given back end and import map.
pub fn instantiate<'bytes, B: Backend, A: Allocator + Clone>(
    module: &Module<'bytes, A>,
    backend: &mut B,
    imports: &Imports<'_, B::Code>,
    alloc: A,
) -> Result<ModuleInstance<'bytes, B::Code, A>, Error<B::Error>> {
    if module.mem_size_log2 > MAX_MEM_SIZE_LOG2 {
        return Err(Error::MemoryTooLarge(module.mem_size_log2));
    }

    let mem_size = module.mem_size();
    let mut memory = Vec::new_in(alloc.clone());
    memory.try_reserve_exact(mem_size)?;
    memory.resize(mem_size, 0);

    // Segments apply in table order; overlapping writes resolve to the last
    // one.
    for (index, segment) in module.data_segments.iter().enumerate() {
        if !segment.init {
            continue;
        }
        let dest = segment.dest_addr as usize;
        let size = segment.source_size as usize;
        if dest + size > mem_size {
            return Err(Error::DataSegmentOutOfBounds { segment: index as u16 });
        }
        let source = segment.source_offset as usize;
        memory[dest..dest + size].copy_from_slice(&module.bytes[source..source + size]);
    }

    let mut globals = Vec::new_in(alloc.clone());
    globals.try_reserve_exact(module.globals_area_size as usize)?;
    globals.resize(module.globals_area_size as usize, 0);

    let mut linker: Linker<B::Code, A> =
        Linker::new(module.functions.len(), alloc.clone()).map_err(|_| Error::AllocError)?;
    for index in 0..module.functions.len() {
        let function = FuncIdx::new(index as u16);
        let descriptor = module.function(function);
        if descriptor.external {
            let name = module
                .name_at(descriptor.name_offset)
                .ok_or(Error::ImportUnnamed { function: index as u16 })?;
            let code = imports
                .get(name)
                .ok_or(Error::ImportUnresolved { function: index as u16 })?
                .clone();
            linker.finish(function, code, Vec::new_in(alloc.clone()));
        } else {
            let env = FunctionEnv::new(module, function);
            let graph = verify::build_function_graph(&env, alloc.clone())
                .map_err(|error| Error::Verification { function: index as u16, error })?;
            let generated = backend
                .generate(module, function, &graph, &mut linker)
                .map_err(|error| Error::Codegen { function: index as u16, error })?;
            linker.finish(function, generated.code, generated.fixups);
        }
    }

    linker.link(backend);

    let mut code = Vec::new_in(alloc.clone());
    code.try_reserve_exact(module.functions.len())?;
    let mut exports = HashMap::new();
    if module.mem_exported {
        exports.insert(MEMORY_EXPORT_NAME, Export::Memory);
    }
    for index in 0..module.functions.len() {
        let function = FuncIdx::new(index as u16);
        let finished = linker.code(function).expect("link pass left a hole").clone();
        let descriptor = module.function(function);
        if descriptor.exported {
            let name = module
                .name_at(descriptor.name_offset)
                .ok_or(Error::ExportUnnamed { function: index as u16 })?;
            if exports.insert(name, Export::Function(finished.clone())).is_some() {
                return Err(Error::DuplicateExportName { function: index as u16 });
            }
        }
        code.push(finished);
    }

    Ok(ModuleInstance { memory, globals, code, exports })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_compat::alloc::Global as GlobalAlloc;
    use crate::decode::DecodeOptions;
    use crate::emit::ModuleBuilder;
    use crate::graph::FunctionGraph;
    use crate::link::Generated;
    use crate::types::ValueType;

    // Instantiation of function-free (or external-only) modules never
    // reaches code generation.
    struct NoCodegen;

    impl Backend for NoCodegen {
        type Code = u32;
        type Error = core::convert::Infallible;

        fn placeholder(&mut self, _: FuncIdx) -> Result<u32, Self::Error> {
            unreachable!()
        }

        fn generate<A: Allocator + Clone>(
            &mut self,
            _: &Module<'_, A>,
            _: FuncIdx,
            _: &FunctionGraph<A>,
            _: &mut Linker<u32, A>,
        ) -> Result<Generated<u32, A>, Self::Error> {
            unreachable!()
        }

        fn patch_call(&mut self, _: &u32, _: u32, _: &u32) -> bool {
            false
        }
    }

    fn decode(bytes: &[u8]) -> Module<'_, GlobalAlloc> {
        Module::decode(bytes, DecodeOptions::default(), GlobalAlloc).unwrap()
    }

    #[test]
    fn memory_is_zeroed_and_segments_apply_in_order() {
        let mut builder = ModuleBuilder::new(8, true);
        builder.add_data_segment(4, &[1, 2, 3, 4], true);
        builder.add_data_segment(6, &[9, 9], true);
        builder.add_data_segment(0, &[7], false); // inactive
        let bytes = builder.build().unwrap();
        let module = decode(&bytes);
        let instance =
            instantiate(&module, &mut NoCodegen, &Imports::new(), GlobalAlloc).unwrap();
        assert_eq!(instance.memory.len(), 256);
        assert_eq!(instance.exports.get(MEMORY_EXPORT_NAME), Some(&Export::Memory));
        assert_eq!(&instance.memory[..8], &[0, 0, 0, 0, 1, 2, 9, 9]);
        assert!(instance.memory[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_segment_fails_the_gate() {
        let mut builder = ModuleBuilder::new(2, false);
        builder.add_data_segment(2, &[1, 2, 3], true);
        let bytes = builder.build().unwrap();
        let module = decode(&bytes);
        let result = instantiate(&module, &mut NoCodegen, &Imports::new(), GlobalAlloc);
        assert_eq!(result.err(), Some(Error::DataSegmentOutOfBounds { segment: 0 }));
    }

    #[test]
    fn memory_size_limit_is_enforced() {
        let builder = ModuleBuilder::new(MAX_MEM_SIZE_LOG2 + 1, false);
        let bytes = builder.build().unwrap();
        let module = decode(&bytes);
        let result = instantiate(&module, &mut NoCodegen, &Imports::new(), GlobalAlloc);
        assert_eq!(result.err(), Some(Error::MemoryTooLarge(MAX_MEM_SIZE_LOG2 + 1)));
    }

    #[test]
    fn globals_area_is_allocated_to_its_decoded_size() {
        let mut builder = ModuleBuilder::new(0, false);
        builder.add_global(crate::types::MemType::U8, false);
        builder.add_global(crate::types::MemType::F64, false);
        let bytes = builder.build().unwrap();
        let module = decode(&bytes);
        let instance =
            instantiate(&module, &mut NoCodegen, &Imports::new(), GlobalAlloc).unwrap();
        assert_eq!(instance.globals.len(), 16);
    }

    #[test]
    fn externals_resolve_through_imports_and_export_by_name() {
        let mut builder = ModuleBuilder::new(0, false);
        let f = builder
            .add_function(ValueType::I32, &[ValueType::I32], &[])
            .unwrap();
        builder.set_external(f);
        builder.set_exported(f);
        builder.set_name(f, "host_add");
        let bytes = builder.build().unwrap();
        let module = decode(&bytes);

        let unresolved = instantiate(&module, &mut NoCodegen, &Imports::new(), GlobalAlloc);
        assert_eq!(unresolved.err(), Some(Error::ImportUnresolved { function: 0 }));

        let mut imports = Imports::new();
        imports.insert("host_add", 17u32);
        let instance = instantiate(&module, &mut NoCodegen, &imports, GlobalAlloc).unwrap();
        assert_eq!(instance.code.as_slice(), &[17]);
        assert_eq!(instance.exported_function("host_add"), Some(&17));
        // The memory was not exported, so nothing claims its name.
        assert_eq!(instance.exports.get(MEMORY_EXPORT_NAME), None);
    }

    #[test]
    fn exported_memory_claims_its_name() {
        let mut builder = ModuleBuilder::new(0, true);
        let f = builder.add_function(ValueType::Stmt, &[], &[]).unwrap();
        builder.set_external(f);
        builder.set_exported(f);
        builder.set_name(f, MEMORY_EXPORT_NAME);
        let bytes = builder.build().unwrap();
        let module = decode(&bytes);
        let mut imports = Imports::new();
        imports.insert(MEMORY_EXPORT_NAME, 3u32);
        let result = instantiate(&module, &mut NoCodegen, &imports, GlobalAlloc);
        assert_eq!(result.err(), Some(Error::DuplicateExportName { function: 0 }));
    }

    #[test]
    fn duplicate_export_names_are_rejected() {
        let mut builder = ModuleBuilder::new(0, false);
        for _ in 0..2 {
            let f = builder
                .add_function(ValueType::Stmt, &[], &[])
                .unwrap();
            builder.set_external(f);
            builder.set_exported(f);
            builder.set_name(f, "twice");
        }
        let bytes = builder.build().unwrap();
        let module = decode(&bytes);
        let mut imports = Imports::new();
        imports.insert("twice", 1u32);
        let result = instantiate(&module, &mut NoCodegen, &imports, GlobalAlloc);
        assert_eq!(result.err(), Some(Error::DuplicateExportName { function: 1 }));
    }
}
