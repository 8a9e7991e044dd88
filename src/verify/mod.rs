// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Single-pass function verification and IR graph construction.
//!
//! The verifier walks a function body once, recursive-descent style, checking
//! types as it goes and building the [`crate::graph`] representation at the
//! same time. Locals are renamed into SSA form through a per-path environment
//! of value nodes; control constructs split and re-merge those environments,
//! inserting phis where values differ. Side effects (loads, stores, globals,
//! calls) thread through a single effect chain, so their order survives into
//! the graph.
//!
//! Loops create their header phis eagerly — one per local plus the effect —
//! because a single pass cannot know in advance which values the body will
//! change. Once all back edges are bound, phis whose inputs collapsed back to
//! the entry value are pruned and their uses rewritten, leaving phis exactly
//! for the values that differ around the loop.
//!
//! Nesting is capped at `MAX_NESTING_DEPTH` levels: the walk recurses per
//! nested construct, and a hostile body must not be able to run the native
//! stack out from under the host.

#[cfg(test)]
mod tests;

use core::fmt;

use crate::Allocator;
use crate::core_compat::vec::Vec;
use crate::graph::{FunctionGraph, Graph, NodeId, Operator};
use crate::types::{FuncIdx, Function, GlobalIdx, Module, Opcode, Signature, ValueType};

// Bound on statement/expression nesting, which is also the recursion depth
// of this decoder. A maximum-size body could otherwise encode enough nested
// constructs to overflow the native stack.
const MAX_NESTING_DEPTH: usize = 64;

/// The kind of a verification failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    UnexpectedEndOfBytes,
    UnknownOpcode,
    TypeMismatch,
    LocalIndexOutOfRange,
    GlobalIndexOutOfRange,
    FunctionIndexOutOfRange,
    BreakDepthOutOfRange,
    StmtExpectedValueFound,
    ValueExpectedStmtFound,
    OffsetOutOfBounds,
    InvalidSignature,
    InvalidLocalType,
    InvalidMemType,
    NestingTooDeep,
    OutOfMemory,
}

/// A verification failure: the kind, the offending byte's offset within the
/// module, and (for type mismatches) the offset of the construct that imposed
/// the expected type.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub pc: u32,
    pub pt: Option<u32>,
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self.kind {
            ErrorKind::UnexpectedEndOfBytes => "unexpected end of bytes",
            ErrorKind::UnknownOpcode => "unknown or unsupported opcode",
            ErrorKind::TypeMismatch => "type mismatch",
            ErrorKind::LocalIndexOutOfRange => "local index out of range",
            ErrorKind::GlobalIndexOutOfRange => "global index out of range",
            ErrorKind::FunctionIndexOutOfRange => "function index out of range",
            ErrorKind::BreakDepthOutOfRange => "break depth out of range",
            ErrorKind::StmtExpectedValueFound => "statement expected, value found",
            ErrorKind::ValueExpectedStmtFound => "value expected, statement found",
            ErrorKind::OffsetOutOfBounds => "offset out of bounds",
            ErrorKind::InvalidSignature => "invalid signature",
            ErrorKind::InvalidLocalType => "invalid local type",
            ErrorKind::InvalidMemType => "invalid memory type",
            ErrorKind::NestingTooDeep => "nesting too deep",
            ErrorKind::OutOfMemory => "out of memory",
        };
        write!(f, "{msg} at {:#x}", self.pc)?;
        if let Some(pt) = self.pt {
            write!(f, " (expected type set at {pt:#x})")?;
        }
        Ok(())
    }
}

/// The per-function context the verifier decodes against: the module view,
/// the signature, and the local layout. Parameter indices `0..P` precede
/// locals; within locals, I32 entries come first, then I64, F32, F64.
pub struct FunctionEnv<'a, A: Allocator> {
    module: &'a Module<'a, A>,
    function: Function,
    sig: &'a Signature<A>,
}

impl<'a, A: Allocator> FunctionEnv<'a, A> {
    pub fn new(module: &'a Module<'a, A>, function: FuncIdx) -> Self {
        let function = *module.function(function);
        Self { module, function, sig: module.signature(function.sig) }
    }

    pub fn module(&self) -> &'a Module<'a, A> {
        self.module
    }

    pub fn sig(&self) -> &'a Signature<A> {
        self.sig
    }

    pub fn function(&self) -> &Function {
        &self.function
    }

    pub fn param_count(&self) -> u32 {
        self.sig.param_count() as u32
    }

    /// Parameters plus declared locals.
    pub fn total_locals(&self) -> u32 {
        self.param_count() + self.function.local_count()
    }

    /// The value type of the given parameter or local, or `None` when the
    /// index is out of range.
    pub fn local_type(&self, index: u32) -> Option<ValueType> {
        let params = self.param_count();
        if index < params {
            return Some(self.sig.params[index as usize]);
        }
        let mut next = params;
        for (count, ty) in [
            (self.function.local_i32, ValueType::I32),
            (self.function.local_i64, ValueType::I64),
            (self.function.local_f32, ValueType::F32),
            (self.function.local_f64, ValueType::F64),
        ] {
            next += u32::from(count);
            if index < next {
                return Some(ty);
            }
        }
        None
    }
}

// A value produced by an expression, with the offset of its first byte for
// error reporting.
#[derive(Clone, Copy)]
struct Typed {
    ty: ValueType,
    node: NodeId,
    pc: u32,
}

// The SSA environment along one control path.
#[derive(Clone)]
struct SsaEnv<A: Allocator + Clone> {
    control: NodeId,
    effect: NodeId,
    locals: Vec<NodeId, A>,
    reachable: bool,
}

// The header bookkeeping of a loop under construction.
#[derive(Clone)]
struct LoopHeader<A: Allocator + Clone> {
    loop_node: NodeId,
    effect_phi: NodeId,
    local_phis: Vec<NodeId, A>,
    entry_control: NodeId,
    entry_effect: NodeId,
    entry_locals: Vec<NodeId, A>,
    // First node id belonging to the loop; pruning rewrites uses from here.
    watermark: NodeId,
    backedges: usize,
}

// One labeled construct: a block, loop, or switch.
struct Frame<A: Allocator + Clone> {
    is_loop: bool,
    breaks: Vec<SsaEnv<A>, A>,
    header: Option<LoopHeader<A>>,
}

struct Verifier<'a, A: Allocator + Clone> {
    env: &'a FunctionEnv<'a, A>,
    bytes: &'a [u8],
    pc: usize,
    end: usize,
    graph: Graph<A>,
    frames: Vec<Frame<A>, A>,
    start: NodeId,
    end_node: NodeId,
    // Anchor for unreachable paths. Dead code still verifies and builds
    // nodes, but hangs them here so the live control flow stays clean.
    dead: NodeId,
    // Current statement/expression nesting, capped by MAX_NESTING_DEPTH.
    depth: usize,
    // One zero constant per value type, made on first use.
    zeros: [Option<NodeId>; 4],
    alloc: A,
}

/// Verifies the body of `env`'s function and builds its IR graph.
pub fn build_function_graph<A: Allocator + Clone>(
    env: &FunctionEnv<'_, A>,
    alloc: A,
) -> Result<FunctionGraph<A>, Error> {
    let function = env.function();
    let pc_start = function.code_start as usize;
    let pc_end = function.code_end as usize;

    for &param in &env.sig().params {
        if !param.is_value() {
            return Err(Error {
                kind: ErrorKind::InvalidSignature,
                pc: function.code_start,
                pt: None,
            });
        }
    }

    let verifier = Verifier {
        env,
        bytes: env.module().bytes,
        pc: pc_start,
        end: pc_end,
        graph: Graph::new(alloc.clone()),
        frames: Vec::new_in(alloc.clone()),
        start: NodeId::new(0),
        end_node: NodeId::new(0),
        dead: NodeId::new(0),
        depth: 0,
        zeros: [None; 4],
        alloc,
    };
    verifier.run()
}

impl<'a, A: Allocator + Clone> Verifier<'a, A> {
    fn run(mut self) -> Result<FunctionGraph<A>, Error> {
        self.start = self.node(Operator::Start, ValueType::Stmt, &[])?;
        self.end_node = self.node(Operator::End, ValueType::Stmt, &[])?;
        self.dead = self.node(Operator::Dead, ValueType::Stmt, &[])?;

        let mut locals = Vec::new_in(self.alloc.clone());
        let total = self.env.total_locals() as usize;
        locals.try_reserve_exact(total).map_err(|_| self.oom())?;
        for index in 0..self.env.param_count() {
            let ty = self.env.local_type(index).unwrap_or(ValueType::Stmt);
            let node =
                self.node(Operator::Parameter(index as u16), ty, &[self.start])?;
            locals.push(node);
        }
        for index in self.env.param_count()..self.env.total_locals() {
            let ty = self.env.local_type(index).unwrap_or(ValueType::Stmt);
            let node = self.zero_constant(ty)?;
            locals.push(node);
        }

        let mut ssa =
            SsaEnv { control: self.start, effect: self.start, locals, reachable: true };

        let return_type = self.env.sig().return_type;
        if self.pc == self.end {
            // An empty body is a void function that returns immediately.
            if return_type.is_value() {
                return Err(self.error(ErrorKind::UnexpectedEndOfBytes, self.pos()));
            }
            self.emit_return(&mut ssa, None)?;
        } else {
            let tail = self.decode_stmt(&mut ssa)?;
            if self.pc != self.end {
                return Err(self.error(ErrorKind::UnknownOpcode, self.pos()));
            }
            if ssa.reachable {
                self.emit_fallthru_return(&mut ssa, tail)?;
            }
        }

        Ok(FunctionGraph {
            graph: self.graph,
            start: self.start,
            end: self.end_node,
            return_type,
        })
    }

    // The tail of the outermost statement doubles as the return value of a
    // value-returning function.
    fn emit_fallthru_return(
        &mut self,
        ssa: &mut SsaEnv<A>,
        tail: Option<Typed>,
    ) -> Result<(), Error> {
        let return_type = self.env.sig().return_type;
        if return_type.is_value() {
            let Some(value) = tail else {
                return Err(self.error(ErrorKind::ValueExpectedStmtFound, self.pos()));
            };
            if value.ty != return_type {
                return Err(Error {
                    kind: ErrorKind::TypeMismatch,
                    pc: value.pc,
                    pt: None,
                });
            }
            self.emit_return(ssa, Some(value.node))
        } else {
            if let Some(value) = tail
                && value.ty.is_value()
            {
                // The result position of a void function expects no value.
                return Err(self.error(ErrorKind::StmtExpectedValueFound, value.pc));
            }
            self.emit_return(ssa, None)
        }
    }

    // ----- byte-level helpers -----

    fn pos(&self) -> u32 {
        self.pc as u32
    }

    fn error(&self, kind: ErrorKind, pc: u32) -> Error {
        Error { kind, pc, pt: None }
    }

    fn oom(&self) -> Error {
        self.error(ErrorKind::OutOfMemory, self.pos())
    }

    fn read_bytes<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        if self.end - self.pc < N {
            return Err(self.error(ErrorKind::UnexpectedEndOfBytes, self.pos()));
        }
        let mut out = [0; N];
        out.copy_from_slice(&self.bytes[self.pc..self.pc + N]);
        self.pc += N;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_bytes::<1>()?[0])
    }

    fn read_opcode(&mut self) -> Result<(Opcode, u32), Error> {
        let pc = self.pos();
        let byte = self.read_u8()?;
        let op = Opcode::try_from(byte)
            .map_err(|_| self.error(ErrorKind::UnknownOpcode, pc))?;
        if !op.is_supported() {
            return Err(self.error(ErrorKind::UnknownOpcode, pc));
        }
        Ok((op, pc))
    }

    // ----- graph helpers -----

    fn node(
        &mut self,
        op: Operator,
        ty: ValueType,
        inputs: &[NodeId],
    ) -> Result<NodeId, Error> {
        self.graph.add(op, ty, inputs).map_err(|_| self.oom())
    }

    fn zero_constant(&mut self, ty: ValueType) -> Result<NodeId, Error> {
        let slot = match ty {
            ValueType::I32 => 0,
            ValueType::I64 => 1,
            ValueType::F32 => 2,
            ValueType::F64 => 3,
            ValueType::Stmt => {
                return Err(self.error(ErrorKind::InvalidLocalType, self.pos()));
            }
        };
        if let Some(node) = self.zeros[slot] {
            return Ok(node);
        }
        let op = match ty {
            ValueType::I32 => Operator::Int32Const(0),
            ValueType::I64 => Operator::Int64Const(0),
            ValueType::F32 => Operator::Float32Const(0.0),
            ValueType::F64 => Operator::Float64Const(0.0),
            ValueType::Stmt => unreachable!(),
        };
        let node = self.node(op, ty, &[])?;
        self.zeros[slot] = Some(node);
        Ok(node)
    }

    fn emit_return(&mut self, ssa: &mut SsaEnv<A>, value: Option<NodeId>) -> Result<(), Error> {
        let node = match value {
            Some(value) => self.node(
                Operator::Return,
                ValueType::Stmt,
                &[value, ssa.effect, ssa.control],
            )?,
            None => {
                self.node(Operator::Return, ValueType::Stmt, &[ssa.effect, ssa.control])?
            }
        };
        if ssa.reachable {
            self.graph.push_input(self.end_node, node).map_err(|_| self.oom())?;
        }
        self.kill_env(ssa);
        Ok(())
    }

    // Marks a path unreachable and re-anchors it on the dead node, so that
    // nodes built for dead code never alias the live control flow.
    fn kill_env(&self, ssa: &mut SsaEnv<A>) {
        ssa.reachable = false;
        ssa.control = self.dead;
        ssa.effect = self.dead;
    }

    // Checks that `found` carries the wanted value type; `pt` is the offset
    // of whatever imposed the expectation.
    fn expect(&self, found: Typed, want: ValueType, pt: u32) -> Result<(), Error> {
        if found.ty == want {
            Ok(())
        } else if found.ty == ValueType::Stmt {
            Err(self.error(ErrorKind::ValueExpectedStmtFound, found.pc))
        } else {
            Err(Error { kind: ErrorKind::TypeMismatch, pc: found.pc, pt: Some(pt) })
        }
    }

    // ----- control-flow plumbing -----

    fn branch(
        &mut self,
        cond: NodeId,
        ssa: &SsaEnv<A>,
    ) -> Result<(SsaEnv<A>, SsaEnv<A>), Error> {
        let branch = self.node(
            Operator::Branch,
            ValueType::Stmt,
            &[cond, ssa.effect, ssa.control],
        )?;
        let if_true = self.node(Operator::IfTrue, ValueType::Stmt, &[branch])?;
        let if_false = self.node(Operator::IfFalse, ValueType::Stmt, &[branch])?;
        let mut true_env = ssa.clone();
        true_env.control = if_true;
        let mut false_env = ssa.clone();
        false_env.control = if_false;
        Ok((true_env, false_env))
    }

    // Merges any number of path environments into one. Unreachable inputs
    // drop out; phis appear only for values that differ between paths.
    fn merge(&mut self, envs: &[SsaEnv<A>]) -> Result<SsaEnv<A>, Error> {
        debug_assert!(!envs.is_empty());
        let live = envs.iter().filter(|env| env.reachable).count();
        if live == 0 {
            let mut out = envs[0].clone();
            self.kill_env(&mut out);
            return Ok(out);
        }
        if live == 1 {
            return Ok(envs.iter().find(|env| env.reachable).unwrap().clone());
        }

        let mut controls = Vec::new_in(self.alloc.clone());
        controls.try_reserve_exact(live).map_err(|_| self.oom())?;
        for env in envs.iter().filter(|env| env.reachable) {
            controls.push(env.control);
        }
        let merge = self.node(Operator::Merge, ValueType::Stmt, &controls)?;

        let mut out = envs.iter().find(|env| env.reachable).unwrap().clone();
        out.control = merge;

        out.effect = self.merge_values(
            envs,
            merge,
            |env| env.effect,
            Operator::EffectPhi,
            ValueType::Stmt,
        )?;
        for index in 0..out.locals.len() {
            let ty = self.graph.node(out.locals[index]).ty;
            out.locals[index] = self.merge_values(
                envs,
                merge,
                |env| env.locals[index],
                Operator::Phi,
                ty,
            )?;
        }
        Ok(out)
    }

    // Produces the merged value of one slot: the common node if every live
    // path agrees, or a phi over the per-path values.
    fn merge_values(
        &mut self,
        envs: &[SsaEnv<A>],
        merge: NodeId,
        value: impl Fn(&SsaEnv<A>) -> NodeId,
        op: Operator,
        ty: ValueType,
    ) -> Result<NodeId, Error> {
        let first = value(envs.iter().find(|env| env.reachable).unwrap());
        if envs.iter().filter(|env| env.reachable).all(|env| value(env) == first) {
            return Ok(first);
        }
        let mut inputs = Vec::new_in(self.alloc.clone());
        inputs
            .try_reserve_exact(envs.len() + 1)
            .map_err(|_| self.oom())?;
        for env in envs.iter().filter(|env| env.reachable) {
            inputs.push(value(env));
        }
        inputs.push(merge);
        self.node(op, ty, &inputs)
    }

    fn enter_loop(&mut self, ssa: &mut SsaEnv<A>) -> Result<LoopHeader<A>, Error> {
        let watermark = NodeId::new(self.graph.len() as u32);
        let loop_node = self.node(Operator::Loop, ValueType::Stmt, &[ssa.control])?;
        let effect_phi = self.node(
            Operator::EffectPhi,
            ValueType::Stmt,
            &[ssa.effect, loop_node],
        )?;
        let mut local_phis = Vec::new_in(self.alloc.clone());
        local_phis
            .try_reserve_exact(ssa.locals.len())
            .map_err(|_| self.oom())?;
        for &local in ssa.locals.iter() {
            let ty = self.graph.node(local).ty;
            let phi = self.node(Operator::Phi, ty, &[local, loop_node])?;
            local_phis.push(phi);
        }

        let header = LoopHeader {
            loop_node,
            effect_phi,
            local_phis: local_phis.clone(),
            entry_control: ssa.control,
            entry_effect: ssa.effect,
            entry_locals: ssa.locals.clone(),
            watermark,
            backedges: 0,
        };

        ssa.control = loop_node;
        ssa.effect = effect_phi;
        ssa.locals = local_phis;
        Ok(header)
    }

    // Adds one back edge (a `Continue` or the body's natural fall-through)
    // to the loop header.
    fn bind_backedge(&mut self, frame_index: usize, env: &SsaEnv<A>) -> Result<(), Error> {
        if !env.reachable {
            return Ok(());
        }
        let header = self.frames[frame_index].header.as_ref().unwrap().clone();
        self.graph
            .push_input(header.loop_node, env.control)
            .map_err(|_| self.oom())?;
        let slot = self.graph.node(header.effect_phi).inputs.len() - 1;
        self.graph
            .insert_input(header.effect_phi, slot, env.effect)
            .map_err(|_| self.oom())?;
        for (index, &phi) in header.local_phis.iter().enumerate() {
            let slot = self.graph.node(phi).inputs.len() - 1;
            self.graph
                .insert_input(phi, slot, env.locals[index])
                .map_err(|_| self.oom())?;
        }
        self.frames[frame_index].header.as_mut().unwrap().backedges += 1;
        Ok(())
    }

    // Rewrites uses of `old` to `new` everywhere a loop body could have
    // planted it: nodes from the watermark on, plus every pending break
    // environment.
    fn substitute(
        &mut self,
        watermark: NodeId,
        old: NodeId,
        new: NodeId,
        exits: &mut [SsaEnv<A>],
    ) {
        self.graph.replace_uses_since(watermark, old, new);
        let subst = |env: &mut SsaEnv<A>| {
            if env.control == old {
                env.control = new;
            }
            if env.effect == old {
                env.effect = new;
            }
            for local in &mut env.locals {
                if *local == old {
                    *local = new;
                }
            }
        };
        for env in exits.iter_mut() {
            subst(env);
        }
        for frame in &mut self.frames {
            for env in &mut frame.breaks {
                subst(env);
            }
        }
    }

    // Called once every back edge is bound. Collapses a loop that never
    // repeats, then prunes header phis whose value does not actually change
    // around the loop.
    fn finalize_loop(
        &mut self,
        header: &LoopHeader<A>,
        exits: &mut [SsaEnv<A>],
    ) -> Result<(), Error> {
        if header.backedges == 0 {
            self.substitute(header.watermark, header.loop_node, header.entry_control, exits);
            self.graph.kill(header.loop_node);
            self.substitute(header.watermark, header.effect_phi, header.entry_effect, exits);
            self.graph.kill(header.effect_phi);
            for (index, &phi) in header.local_phis.iter().enumerate() {
                self.substitute(header.watermark, phi, header.entry_locals[index], exits);
                self.graph.kill(phi);
            }
            return Ok(());
        }

        // A phi collapses when every back-edge input is the entry value or
        // the phi itself. Pruning one phi can expose another, so iterate.
        let mut changed = true;
        while changed {
            changed = false;
            for (index, &phi) in header.local_phis.iter().enumerate() {
                let entry = header.entry_locals[index];
                let node = self.graph.node(phi);
                if node.op != Operator::Phi {
                    continue;
                }
                let inputs = &node.inputs;
                if inputs[0] != entry {
                    continue;
                }
                let redundant = inputs[1..inputs.len() - 1]
                    .iter()
                    .all(|&input| input == entry || input == phi);
                if redundant {
                    self.substitute(header.watermark, phi, entry, exits);
                    self.graph.kill(phi);
                    changed = true;
                }
            }
        }
        let effect_node = self.graph.node(header.effect_phi);
        if effect_node.op == Operator::EffectPhi && effect_node.inputs[0] == header.entry_effect
        {
            let redundant = effect_node.inputs[1..effect_node.inputs.len() - 1]
                .iter()
                .all(|&input| input == header.entry_effect || input == header.effect_phi);
            if redundant {
                self.substitute(
                    header.watermark,
                    header.effect_phi,
                    header.entry_effect,
                    exits,
                );
                self.graph.kill(header.effect_phi);
            }
        }
        Ok(())
    }

    // Counts one level of statement/expression nesting; a failure here ends
    // the whole verification, so the unwinding paths need no decrement.
    fn enter_nesting(&mut self, pc: u32) -> Result<(), Error> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(self.error(ErrorKind::NestingTooDeep, pc));
        }
        Ok(())
    }

    // ----- statements -----

    // Decodes a single statement. A bare expression is a legal statement;
    // its value is handed back so a tail expression can become the function
    // result.
    fn decode_stmt(&mut self, ssa: &mut SsaEnv<A>) -> Result<Option<Typed>, Error> {
        let (op, pc) = self.read_opcode()?;
        self.enter_nesting(pc)?;
        let result = self.decode_stmt_at(ssa, op, pc);
        self.depth -= 1;
        result
    }

    fn decode_stmt_at(
        &mut self,
        ssa: &mut SsaEnv<A>,
        op: Opcode,
        pc: u32,
    ) -> Result<Option<Typed>, Error> {
        match op {
            Opcode::Nop => Ok(None),
            Opcode::Block => {
                let count = self.read_u8()?;
                self.decode_block(ssa, count)
            }
            Opcode::Loop => {
                let count = self.read_u8()?;
                self.decode_loop(ssa, count)?;
                Ok(None)
            }
            Opcode::InfiniteLoop => {
                self.decode_loop(ssa, 0)?;
                Ok(None)
            }
            Opcode::If => {
                let cond = self.decode_expr(ssa)?;
                self.expect(cond, ValueType::I32, pc)?;
                let (mut true_env, false_env) = self.branch(cond.node, ssa)?;
                self.decode_stmt(&mut true_env)?;
                *ssa = self.merge(&[true_env, false_env])?;
                Ok(None)
            }
            Opcode::IfThen => {
                let cond = self.decode_expr(ssa)?;
                self.expect(cond, ValueType::I32, pc)?;
                let (mut true_env, mut false_env) = self.branch(cond.node, ssa)?;
                self.decode_stmt(&mut true_env)?;
                self.decode_stmt(&mut false_env)?;
                *ssa = self.merge(&[true_env, false_env])?;
                Ok(None)
            }
            Opcode::Switch => {
                let count = self.read_u8()?;
                self.decode_switch(ssa, count, pc, true)?;
                Ok(None)
            }
            Opcode::SwitchNf => {
                let count = self.read_u8()?;
                self.decode_switch(ssa, count, pc, false)?;
                Ok(None)
            }
            Opcode::Break => {
                let depth_pc = self.pos();
                let depth = self.read_u8()?;
                let Some(frame_index) = self.frames.len().checked_sub(1 + depth as usize)
                else {
                    return Err(self.error(ErrorKind::BreakDepthOutOfRange, depth_pc));
                };
                if ssa.reachable {
                    let exit = ssa.clone();
                    let frame = &mut self.frames[frame_index];
                    frame.breaks.try_reserve(1).map_err(|_| {
                        Error { kind: ErrorKind::OutOfMemory, pc: depth_pc, pt: None }
                    })?;
                    frame.breaks.push(exit);
                }
                self.kill_env(ssa);
                Ok(None)
            }
            Opcode::Continue => {
                let depth_pc = self.pos();
                let depth = self.read_u8()?;
                let Some(frame_index) = self.frames.len().checked_sub(1 + depth as usize)
                else {
                    return Err(self.error(ErrorKind::BreakDepthOutOfRange, depth_pc));
                };
                if !self.frames[frame_index].is_loop {
                    return Err(self.error(ErrorKind::BreakDepthOutOfRange, depth_pc));
                }
                self.bind_backedge(frame_index, ssa)?;
                self.kill_env(ssa);
                Ok(None)
            }
            Opcode::Return => {
                let value = if self.env.sig().return_type.is_value() {
                    let expr = self.decode_expr(ssa)?;
                    self.expect(expr, self.env.sig().return_type, pc)?;
                    Some(expr.node)
                } else {
                    None
                };
                self.emit_return(ssa, value)?;
                Ok(None)
            }
            Opcode::SetLocal => {
                let index_pc = self.pos();
                let index = u32::from(self.read_u8()?);
                let Some(ty) = self.env.local_type(index) else {
                    return Err(self.error(ErrorKind::LocalIndexOutOfRange, index_pc));
                };
                let value = self.decode_expr(ssa)?;
                self.expect(value, ty, pc)?;
                ssa.locals[index as usize] = value.node;
                Ok(None)
            }
            Opcode::StoreGlobal => {
                let index_pc = self.pos();
                let index = u32::from(self.read_u8()?);
                if index as usize >= self.env.module().globals.len() {
                    return Err(self.error(ErrorKind::GlobalIndexOutOfRange, index_pc));
                }
                let global = GlobalIdx::new(index as u16);
                let ty = self.env.module().global(global).ty;
                let value = self.decode_expr(ssa)?;
                self.expect(value, ty.value_type(), pc)?;
                let node = self.node(
                    Operator::StoreGlobal(global),
                    ValueType::Stmt,
                    &[value.node, ssa.effect, ssa.control],
                )?;
                ssa.effect = node;
                Ok(None)
            }
            _ => {
                if let Some(access) = op.mem_access()
                    && access.store
                {
                    let addr = self.decode_expr(ssa)?;
                    self.expect(addr, ValueType::I32, pc)?;
                    let value = self.decode_expr(ssa)?;
                    self.expect(value, access.ty.value_type(), pc)?;
                    let node = self.node(
                        Operator::StoreMem(access.ty),
                        ValueType::Stmt,
                        &[addr.node, value.node, ssa.effect, ssa.control],
                    )?;
                    ssa.effect = node;
                    return Ok(None);
                }
                // Expression in statement position.
                let value = self.decode_expr_at(ssa, op, pc)?;
                Ok(Some(value))
            }
        }
    }

    // Decodes the `count` statements of a block body, returning the last
    // statement's value for fall-through.
    fn decode_stmt_list(
        &mut self,
        ssa: &mut SsaEnv<A>,
        count: u8,
    ) -> Result<Option<Typed>, Error> {
        let mut last = None;
        for _ in 0..count {
            last = self.decode_stmt(ssa)?;
        }
        Ok(last)
    }

    fn push_frame(&mut self, is_loop: bool, header: Option<LoopHeader<A>>) -> Result<(), Error> {
        self.frames.try_reserve(1).map_err(|_| self.oom())?;
        self.frames.push(Frame { is_loop, breaks: Vec::new_in(self.alloc.clone()), header });
        Ok(())
    }

    fn decode_block(&mut self, ssa: &mut SsaEnv<A>, count: u8) -> Result<Option<Typed>, Error> {
        self.push_frame(false, None)?;
        let tail = self.decode_stmt_list(ssa, count)?;
        let frame = self.frames.pop().unwrap();
        if frame.breaks.is_empty() {
            // No breaks: the block is transparent and its tail value falls
            // through.
            return Ok(tail);
        }
        let mut envs = Vec::new_in(self.alloc.clone());
        envs.try_reserve_exact(frame.breaks.len() + 1).map_err(|_| self.oom())?;
        envs.push(ssa.clone());
        for env in frame.breaks {
            envs.push(env);
        }
        *ssa = self.merge(&envs)?;
        Ok(None)
    }

    fn decode_loop(&mut self, ssa: &mut SsaEnv<A>, count: u8) -> Result<(), Error> {
        let header = self.enter_loop(ssa)?;
        self.push_frame(true, Some(header))?;
        let frame_index = self.frames.len() - 1;
        self.decode_stmt_list(ssa, count)?;
        // The body's natural end is a back edge.
        self.bind_backedge(frame_index, ssa)?;
        let frame = self.frames.pop().unwrap();
        let header = frame.header.unwrap();

        let mut exits = Vec::new_in(self.alloc.clone());
        exits.try_reserve_exact(frame.breaks.len().max(1)).map_err(|_| self.oom())?;
        if frame.breaks.is_empty() {
            // No break: the loop never exits.
            let mut dead = ssa.clone();
            self.kill_env(&mut dead);
            exits.push(dead);
        } else {
            for env in frame.breaks {
                exits.push(env);
            }
        }
        self.finalize_loop(&header, &mut exits)?;
        *ssa = self.merge(&exits)?;
        Ok(())
    }

    // Lowers a switch into an equality-test chain over the key. With
    // fallthrough, each case's end flows into the next case's entry merge;
    // without, it flows straight to the exit. An out-of-range key executes
    // no case.
    fn decode_switch(
        &mut self,
        ssa: &mut SsaEnv<A>,
        count: u8,
        pc: u32,
        fallthrough: bool,
    ) -> Result<(), Error> {
        let key = self.decode_expr(ssa)?;
        self.expect(key, ValueType::I32, pc)?;

        self.push_frame(false, None)?;
        let mut dispatch = ssa.clone();
        let mut pending: Option<SsaEnv<A>> = None;
        for case in 0..count {
            let case_const =
                self.node(Operator::Int32Const(i32::from(case)), ValueType::I32, &[])?;
            let cmp = self.node(
                Operator::Simple(Opcode::I32Eq),
                ValueType::I32,
                &[key.node, case_const],
            )?;
            let (selected, rest) = self.branch(cmp, &dispatch)?;
            let mut case_env = match pending.take() {
                Some(fell) => self.merge(&[selected, fell])?,
                None => selected,
            };
            self.decode_stmt(&mut case_env)?;
            if fallthrough {
                pending = Some(case_env);
            } else if case_env.reachable {
                let frame = self.frames.last_mut().unwrap();
                frame.breaks.try_reserve(1).map_err(|_| {
                    Error { kind: ErrorKind::OutOfMemory, pc, pt: None }
                })?;
                frame.breaks.push(case_env);
            }
            dispatch = rest;
        }

        let frame = self.frames.pop().unwrap();
        let mut exits = Vec::new_in(self.alloc.clone());
        exits
            .try_reserve_exact(frame.breaks.len() + 2)
            .map_err(|_| self.oom())?;
        exits.push(dispatch);
        if let Some(fell) = pending {
            exits.push(fell);
        }
        for env in frame.breaks {
            exits.push(env);
        }
        *ssa = self.merge(&exits)?;
        Ok(())
    }

    // ----- expressions -----

    fn decode_expr(&mut self, ssa: &mut SsaEnv<A>) -> Result<Typed, Error> {
        let (op, pc) = self.read_opcode()?;
        if op.is_statement() {
            return Err(self.error(ErrorKind::ValueExpectedStmtFound, pc));
        }
        self.enter_nesting(pc)?;
        let result = self.decode_expr_at(ssa, op, pc);
        self.depth -= 1;
        result
    }

    fn decode_expr_at(
        &mut self,
        ssa: &mut SsaEnv<A>,
        op: Opcode,
        pc: u32,
    ) -> Result<Typed, Error> {
        match op {
            Opcode::I8Const => {
                let byte = self.read_bytes::<1>()?[0] as i8;
                let node = self.node(Operator::Int32Const(i32::from(byte)), ValueType::I32, &[])?;
                Ok(Typed { ty: ValueType::I32, node, pc })
            }
            Opcode::I32Const => {
                let value = i32::from_le_bytes(self.read_bytes()?);
                let node = self.node(Operator::Int32Const(value), ValueType::I32, &[])?;
                Ok(Typed { ty: ValueType::I32, node, pc })
            }
            Opcode::I64Const => {
                let value = i64::from_le_bytes(self.read_bytes()?);
                let node = self.node(Operator::Int64Const(value), ValueType::I64, &[])?;
                Ok(Typed { ty: ValueType::I64, node, pc })
            }
            Opcode::F32Const => {
                let value = f32::from_le_bytes(self.read_bytes()?);
                let node = self.node(Operator::Float32Const(value), ValueType::F32, &[])?;
                Ok(Typed { ty: ValueType::F32, node, pc })
            }
            Opcode::F64Const => {
                let value = f64::from_le_bytes(self.read_bytes()?);
                let node = self.node(Operator::Float64Const(value), ValueType::F64, &[])?;
                Ok(Typed { ty: ValueType::F64, node, pc })
            }
            Opcode::GetLocal => {
                let index_pc = self.pos();
                let index = u32::from(self.read_u8()?);
                let Some(ty) = self.env.local_type(index) else {
                    return Err(self.error(ErrorKind::LocalIndexOutOfRange, index_pc));
                };
                Ok(Typed { ty, node: ssa.locals[index as usize], pc })
            }
            Opcode::LoadGlobal => {
                let index_pc = self.pos();
                let index = u32::from(self.read_u8()?);
                if index as usize >= self.env.module().globals.len() {
                    return Err(self.error(ErrorKind::GlobalIndexOutOfRange, index_pc));
                }
                let global = GlobalIdx::new(index as u16);
                let ty = self.env.module().global(global).ty.value_type();
                let node = self.node(
                    Operator::LoadGlobal(global),
                    ty,
                    &[ssa.effect, ssa.control],
                )?;
                ssa.effect = node;
                Ok(Typed { ty, node, pc })
            }
            Opcode::CallFunction => {
                let index_pc = self.pos();
                let index = u32::from(self.read_u8()?);
                if index as usize >= self.env.module().functions.len() {
                    return Err(self.error(ErrorKind::FunctionIndexOutOfRange, index_pc));
                }
                let callee = FuncIdx::new(index as u16);
                let sig = self.env.module().function(callee).sig;
                let param_count = self.env.module().signature(sig).param_count();
                let return_type = self.env.module().signature(sig).return_type;

                let mut inputs = Vec::new_in(self.alloc.clone());
                inputs.try_reserve_exact(param_count + 2).map_err(|_| self.oom())?;
                for k in 0..param_count {
                    let want = self.env.module().signature(sig).params[k];
                    let arg = self.decode_expr(ssa)?;
                    self.expect(arg, want, pc)?;
                    inputs.push(arg.node);
                }
                inputs.push(ssa.effect);
                inputs.push(ssa.control);
                let node = self.node(Operator::Call(callee), return_type, &inputs)?;
                ssa.effect = node;
                Ok(Typed { ty: return_type, node, pc })
            }
            Opcode::Ternary => {
                let cond = self.decode_expr(ssa)?;
                self.expect(cond, ValueType::I32, pc)?;
                let (mut true_env, mut false_env) = self.branch(cond.node, ssa)?;
                let then = self.decode_expr(&mut true_env)?;
                let otherwise = self.decode_expr(&mut false_env)?;
                if !then.ty.is_value() {
                    return Err(self.error(ErrorKind::ValueExpectedStmtFound, then.pc));
                }
                // Both arms must agree; the then-arm's offset is the source
                // of the expectation.
                self.expect(otherwise, then.ty, then.pc)?;
                *ssa = self.merge(&[true_env, false_env])?;
                let phi = self.node(
                    Operator::Phi,
                    then.ty,
                    &[then.node, otherwise.node, ssa.control],
                )?;
                Ok(Typed { ty: then.ty, node: phi, pc })
            }
            Opcode::Comma => {
                // The first operand is evaluated purely for effect; a void
                // call is fine there.
                let _ = self.decode_expr(ssa)?;
                let result = self.decode_expr(ssa)?;
                Ok(Typed { ty: result.ty, node: result.node, pc })
            }
            _ => {
                if let Some(access) = op.mem_access()
                    && !access.store
                {
                    let addr = self.decode_expr(ssa)?;
                    self.expect(addr, ValueType::I32, pc)?;
                    let ty = access.ty.value_type();
                    let node = self.node(
                        Operator::LoadMem(access.ty),
                        ty,
                        &[addr.node, ssa.effect, ssa.control],
                    )?;
                    ssa.effect = node;
                    return Ok(Typed { ty, node, pc });
                }
                let Some(sig) = op.signature() else {
                    // A statement opcode; the callers handled those already.
                    return Err(self.error(ErrorKind::ValueExpectedStmtFound, pc));
                };
                let mut inputs = Vec::new_in(self.alloc.clone());
                inputs
                    .try_reserve_exact(sig.params.len())
                    .map_err(|_| self.oom())?;
                for &want in sig.params {
                    let operand = self.decode_expr(ssa)?;
                    self.expect(operand, want, pc)?;
                    inputs.push(operand.node);
                }
                let node = self.node(Operator::Simple(op), sig.return_type, &inputs)?;
                Ok(Typed { ty: sig.return_type, node, pc })
            }
        }
    }
}
