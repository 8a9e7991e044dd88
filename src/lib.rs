// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Core of an early-format WebAssembly toolchain: a bounded binary module
//! decoder, a single-pass typed bytecode verifier that builds an IR graph,
//! a placeholder-and-patch linker for intra-module direct calls, a module
//! instantiator, and a bytecode emitter for a restricted typed source
//! dialect.
//!
//! The machine-code back end is not part of this crate; it is reached
//! through the [`link::Backend`] trait, and the `conformance` workspace
//! member provides a reference implementation that evaluates IR graphs
//! directly.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(nightly, feature(allocator_api))]

#[cfg(nightly)]
extern crate alloc;

pub mod core_compat;
pub mod decode;
pub mod emit;
pub mod graph;
pub mod instance;
pub mod link;
pub mod types;
pub mod verify;

pub use core_compat::alloc::Allocator;
pub use types::Module;
