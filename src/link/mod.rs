// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Placeholder-and-patch linking of direct calls.
//!
//! Functions may call forward: a call site compiled before its callee targets
//! a placeholder code object, and [`Linker::link`] rewrites such sites once
//! every function has real code. Call sites are identified by typed
//! [`CallFixup`] records (site token plus callee index) that the code
//! generator reports alongside each compiled function, so no marker needs to
//! be smuggled through code-object fields; the linker's own table remembers
//! which slots handed out placeholders.
//!
//! A function that is never finished by link time is a programming error and
//! trips an assertion, as does a fixup whose callee slot is empty.

use core::fmt;

use crate::Allocator;
use crate::core_compat::alloc::collections::TryReserveError;
use crate::core_compat::vec::Vec;
use crate::graph::FunctionGraph;
use crate::types::{FuncIdx, Module};

/// A direct-call relocation within one code object: the backend-defined site
/// token and the function the site calls.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CallFixup {
    pub site: u32,
    pub callee: FuncIdx,
}

/// The code produced for one function, with its direct-call fixups.
pub struct Generated<C, A: Allocator> {
    pub code: C,
    pub fixups: Vec<CallFixup, A>,
}

/// The code-generation back end, as seen by the linker and instantiator.
/// Code objects are opaque, cheaply clonable handles.
pub trait Backend {
    type Code: Clone;
    type Error: fmt::Debug;

    /// Allocates a stub code object to stand in for `callee` until its real
    /// code exists.
    fn placeholder(&mut self, callee: FuncIdx) -> Result<Self::Code, Self::Error>;

    /// Compiles one verified function. Direct-call targets are resolved
    /// through `codes` (handing back a finished code object or a shared
    /// placeholder), and every such site is reported as a fixup.
    fn generate<A: Allocator + Clone>(
        &mut self,
        module: &Module<'_, A>,
        function: FuncIdx,
        graph: &FunctionGraph<A>,
        codes: &mut Linker<Self::Code, A>,
    ) -> Result<Generated<Self::Code, A>, Self::Error>;

    /// Redirects the call at `site` in `code` to `target`, provided the site
    /// still aims at a placeholder. Returns whether a patch occurred.
    fn patch_call(&mut self, code: &Self::Code, site: u32, target: &Self::Code) -> bool;

    /// Called once per code object that received patches; a native back end
    /// flushes the instruction cache here.
    fn commit(&mut self, code: &Self::Code) {
        let _ = code;
    }
}

/// The per-instance code table: placeholders and finished code, indexed by
/// function.
pub struct Linker<C, A: Allocator> {
    placeholders: Vec<Option<C>, A>,
    finished: Vec<Option<C>, A>,
    fixups: Vec<Vec<CallFixup, A>, A>,
    // Which functions handed out a placeholder, in allocation order.
    placeholder_slots: Vec<FuncIdx, A>,
}

impl<C: Clone, A: Allocator + Clone> Linker<C, A> {
    pub fn new(function_count: usize, alloc: A) -> Result<Self, TryReserveError> {
        let mut placeholders = Vec::new_in(alloc.clone());
        placeholders.try_reserve_exact(function_count)?;
        let mut finished = Vec::new_in(alloc.clone());
        finished.try_reserve_exact(function_count)?;
        let mut fixups = Vec::new_in(alloc.clone());
        fixups.try_reserve_exact(function_count)?;
        for _ in 0..function_count {
            placeholders.push(None);
            finished.push(None);
            fixups.push(Vec::new_in(alloc.clone()));
        }
        let mut placeholder_slots = Vec::new_in(alloc.clone());
        // At most one placeholder per function ever exists.
        placeholder_slots.try_reserve_exact(function_count)?;
        Ok(Self { placeholders, finished, fixups, placeholder_slots })
    }

    pub fn function_count(&self) -> usize {
        self.finished.len()
    }

    /// The code to call `callee` through right now: its finished code if
    /// compilation got there already, or a placeholder (allocated by `make`
    /// on first request and shared thereafter).
    pub fn code_for<E>(
        &mut self,
        callee: FuncIdx,
        make: impl FnOnce(FuncIdx) -> Result<C, E>,
    ) -> Result<C, E> {
        let index = usize::from(callee);
        if let Some(code) = &self.finished[index] {
            return Ok(code.clone());
        }
        if let Some(code) = &self.placeholders[index] {
            return Ok(code.clone());
        }
        let code = make(callee)?;
        self.placeholders[index] = Some(code.clone());
        self.placeholder_slots.push(callee);
        Ok(code)
    }

    /// Installs the real code for a function, plus its call-site fixups.
    pub fn finish(&mut self, function: FuncIdx, code: C, fixups: Vec<CallFixup, A>) {
        let index = usize::from(function);
        self.finished[index] = Some(code);
        self.fixups[index] = fixups;
    }

    /// The finished code of a function, if any.
    pub fn code(&self, function: FuncIdx) -> Option<&C> {
        self.finished[usize::from(function)].as_ref()
    }

    /// The number of placeholders handed out so far.
    pub fn placeholder_count(&self) -> usize {
        self.placeholder_slots.len()
    }

    /// Walks every function's fixups and rewrites the sites that still
    /// target placeholders. Returns the number of sites patched; a second
    /// pass over the same table returns zero.
    pub fn link<B: Backend<Code = C>>(&mut self, backend: &mut B) -> usize {
        for (index, code) in self.finished.iter().enumerate() {
            assert!(code.is_some(), "function #{index} was never compiled or resolved");
        }
        let mut total = 0;
        for index in 0..self.finished.len() {
            let code = self.finished[index].clone().unwrap();
            let mut patched = false;
            for fixup in &self.fixups[index] {
                let target = self.finished[usize::from(fixup.callee)]
                    .as_ref()
                    .expect("fixup targets an unresolved function");
                if backend.patch_call(&code, fixup.site, target) {
                    patched = true;
                    total += 1;
                }
            }
            if patched {
                backend.commit(&code);
            }
        }
        total
    }
}
