// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! A reference code generator for conformance testing.
//!
//! [`Evaluator`] implements the back-end interface by capturing each
//! function's IR graph in its code object and executing it directly: the
//! control token walks Start/Branch/Merge/Loop/Return, phis bind on merge
//! arrival, and the effect chain executes in order at every control
//! transfer, with loads and calls binding their results for later pure
//! evaluation. Slow, but it exercises decoding, verification, graph shape,
//! placeholder linking, and instantiation end to end without a native back
//! end.
//!
//! Float behavior follows Rust cast semantics; NaNs are not canonicalized.

use std::cell::RefCell;
use std::rc::Rc;

use protowasm::Allocator;
use protowasm::core_compat::alloc::Global;
use protowasm::core_compat::vec::Vec as AVec;
use protowasm::decode::DecodeOptions;
use protowasm::graph::{FunctionGraph, Graph, Node, NodeId, Operator};
use protowasm::instance::{self, Imports, ModuleInstance};
use protowasm::link::{Backend, CallFixup, Generated, Linker};
use protowasm::types::{FuncIdx, MemType, Module, Opcode, ValueType};

/// A runtime value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl Val {
    pub fn as_i32(self) -> i32 {
        let Val::I32(v) = self else { panic!("expected i32, got {self:?}") };
        v
    }

    pub fn as_i64(self) -> i64 {
        let Val::I64(v) = self else { panic!("expected i64, got {self:?}") };
        v
    }

    pub fn as_f32(self) -> f32 {
        let Val::F32(v) = self else { panic!("expected f32, got {self:?}") };
        v
    }

    pub fn as_f64(self) -> f64 {
        let Val::F64(v) = self else { panic!("expected f64, got {self:?}") };
        v
    }
}

/// A runtime failure surfaced by generated (here: evaluated) code. The
/// verifier does not bounds-check memory; the generated code does.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Trap {
    MemoryOutOfBounds,
    DivisionByZero,
    IntegerOverflow,
    /// A call reached a placeholder that was never patched.
    UnlinkedCall,
}

/// A code object handle: a placeholder, an evaluated function, or a host
/// callable supplied through the import map.
pub enum EvalCode {
    Placeholder(FuncIdx),
    Function(CompiledFunction),
    Host(Box<dyn Fn(&[Val]) -> Option<Val>>),
}

pub type Code = Rc<RefCell<EvalCode>>;

/// Wraps a host closure as a code object for the import map.
pub fn host(f: impl Fn(&[Val]) -> Option<Val> + 'static) -> Code {
    Rc::new(RefCell::new(EvalCode::Host(Box::new(f))))
}

/// One function "compiled" for evaluation: its graph plus everything the
/// walk needs, precomputed at generation time.
pub struct CompiledFunction {
    graph: Graph<Global>,
    start: NodeId,
    return_type: ValueType,
    /// Control-flow successors per node.
    successors: Vec<Vec<NodeId>>,
    /// Value phis per merge/loop node.
    phis: Vec<Vec<NodeId>>,
    /// Effect phi per merge/loop node, if any.
    effect_phis: Vec<Option<NodeId>>,
    /// `(parameter index, node)` pairs.
    parameters: Vec<(u16, NodeId)>,
    /// Call nodes in site order; `call_targets` is parallel and is what the
    /// linker patches.
    call_sites: Vec<NodeId>,
    call_targets: Vec<Code>,
    /// Global offsets and types captured from the module.
    globals: Vec<(u32, MemType)>,
}

/// The reference back end.
pub struct Evaluator;

impl Backend for Evaluator {
    type Code = Code;
    type Error = core::convert::Infallible;

    fn placeholder(&mut self, callee: FuncIdx) -> Result<Code, Self::Error> {
        Ok(Rc::new(RefCell::new(EvalCode::Placeholder(callee))))
    }

    fn generate<A: Allocator + Clone>(
        &mut self,
        module: &Module<'_, A>,
        _function: FuncIdx,
        graph: &FunctionGraph<A>,
        codes: &mut Linker<Code, A>,
    ) -> Result<Generated<Code, A>, Self::Error> {
        let reified = reify(&graph.graph);
        let len = reified.len();

        let mut successors = vec![Vec::new(); len];
        let mut phis = vec![Vec::new(); len];
        let mut effect_phis = vec![None; len];
        let mut parameters = Vec::new();
        let mut call_sites = Vec::new();
        for (id, node) in reified.iter() {
            match node.op {
                Operator::IfTrue | Operator::IfFalse => {
                    successors[usize::from(node.inputs[0])].push(id);
                }
                Operator::Branch => {
                    successors[usize::from(node.inputs[2])].push(id);
                }
                Operator::Merge | Operator::Loop => {
                    for &pred in node.inputs.iter() {
                        successors[usize::from(pred)].push(id);
                    }
                }
                Operator::Return => {
                    successors[usize::from(*node.inputs.last().unwrap())].push(id);
                }
                Operator::Phi => {
                    phis[usize::from(*node.inputs.last().unwrap())].push(id);
                }
                Operator::EffectPhi => {
                    effect_phis[usize::from(*node.inputs.last().unwrap())] = Some(id);
                }
                Operator::Parameter(index) => parameters.push((index, id)),
                Operator::Call(_) => call_sites.push(id),
                _ => {}
            }
        }

        let mut call_targets = Vec::with_capacity(call_sites.len());
        let mut fixups = AVec::new_in(graph.graph.allocator().clone());
        fixups.try_reserve_exact(call_sites.len()).unwrap();
        for (site, &node) in call_sites.iter().enumerate() {
            let Operator::Call(callee) = reified.node(node).op else { unreachable!() };
            let target = codes.code_for(callee, |index| self.placeholder(index))?;
            call_targets.push(target);
            fixups.push(CallFixup { site: site as u32, callee });
        }

        let mut globals = Vec::with_capacity(module.globals.len());
        for global in module.globals.iter() {
            globals.push((global.offset, global.ty));
        }

        let compiled = CompiledFunction {
            graph: reified,
            start: graph.start,
            return_type: graph.return_type,
            successors,
            phis,
            effect_phis,
            parameters,
            call_sites,
            call_targets,
            globals,
        };
        Ok(Generated { code: Rc::new(RefCell::new(EvalCode::Function(compiled))), fixups })
    }

    fn patch_call(&mut self, code: &Code, site: u32, target: &Code) -> bool {
        let mut borrowed = code.borrow_mut();
        let EvalCode::Function(function) = &mut *borrowed else {
            panic!("patching a non-function code object");
        };
        let slot = &mut function.call_targets[site as usize];
        let stale = matches!(&*slot.borrow(), EvalCode::Placeholder(_));
        if stale {
            *slot = target.clone();
        }
        stale
    }
}

// Copies a graph out of its per-compile arena; the code object owns the
// copy, as real generated code would own its instructions.
fn reify<A: Allocator + Clone>(source: &Graph<A>) -> Graph<Global> {
    let mut out = Graph::new(Global);
    let mut inputs = Vec::new();
    for (_, node) in source.iter() {
        inputs.clear();
        inputs.extend(node.inputs.iter().copied());
        out.add(node.op, node.ty, &inputs).unwrap();
    }
    out
}

/// Invokes a code object.
pub fn call(
    code: &Code,
    args: &[Val],
    memory: &mut [u8],
    globals: &mut [u8],
) -> Result<Option<Val>, Trap> {
    let borrowed = code.borrow();
    match &*borrowed {
        EvalCode::Placeholder(_) => Err(Trap::UnlinkedCall),
        EvalCode::Host(f) => Ok(f(args)),
        EvalCode::Function(f) => {
            let values = vec![None; f.graph.len()];
            Activation { f, args, memory, globals, values, current_effect: f.start }.run()
        }
    }
}

struct Activation<'a> {
    f: &'a CompiledFunction,
    args: &'a [Val],
    memory: &'a mut [u8],
    globals: &'a mut [u8],
    values: Vec<Option<Val>>,
    current_effect: NodeId,
}

impl Activation<'_> {
    fn run(mut self) -> Result<Option<Val>, Trap> {
        let f = self.f;
        for &(index, node) in &f.parameters {
            self.values[usize::from(node)] = Some(self.args[usize::from(index)]);
        }

        let mut prev = f.start;
        let mut cur = f.start;
        loop {
            match f.graph.node(cur).op {
                Operator::Start | Operator::IfTrue | Operator::IfFalse => {}
                Operator::Merge | Operator::Loop => self.arrive(cur, prev)?,
                Operator::Branch => {
                    let (cond, effect) = {
                        let node = f.graph.node(cur);
                        (node.inputs[0], node.inputs[1])
                    };
                    self.exec_effects(effect)?;
                    let taken = self.eval(cond)?.as_i32() != 0;
                    prev = cur;
                    cur = self.projection(cur, taken);
                    continue;
                }
                Operator::Return => {
                    let node = f.graph.node(cur);
                    if self.f.return_type.is_value() {
                        let (value, effect) = (node.inputs[0], node.inputs[1]);
                        self.exec_effects(effect)?;
                        return Ok(Some(self.eval(value)?));
                    }
                    let effect = node.inputs[0];
                    self.exec_effects(effect)?;
                    return Ok(None);
                }
                ref op => unreachable!("{op:?} in the control walk"),
            }
            let successors = &f.successors[usize::from(cur)];
            assert_eq!(successors.len(), 1, "control node without a unique successor");
            prev = cur;
            cur = successors[0];
        }
    }

    // Picks the IfTrue or IfFalse projection of a branch.
    fn projection(&self, branch: NodeId, taken: bool) -> NodeId {
        let want = if taken { Operator::IfTrue } else { Operator::IfFalse };
        *self.f.successors[usize::from(branch)]
            .iter()
            .find(|&&id| self.f.graph.node(id).op == want)
            .expect("branch without projections")
    }

    // Entry into a merge or loop header along the edge from `prev`: run the
    // arriving path's outstanding effects, then bind the phis (as a parallel
    // move, against the old bindings).
    fn arrive(&mut self, merge: NodeId, prev: NodeId) -> Result<(), Trap> {
        let f = self.f;
        let edge = f
            .graph
            .node(merge)
            .inputs
            .iter()
            .position(|&pred| pred == prev)
            .expect("arrived from a non-predecessor");

        if let Some(effect_phi) = f.effect_phis[usize::from(merge)] {
            let input = f.graph.node(effect_phi).inputs[edge];
            self.exec_effects(input)?;
            self.current_effect = effect_phi;
        }

        let phi_list = &f.phis[usize::from(merge)];
        let mut bound = Vec::with_capacity(phi_list.len());
        for &phi in phi_list {
            let input = f.graph.node(phi).inputs[edge];
            bound.push((phi, self.eval(input)?));
        }
        for (phi, value) in bound {
            self.values[usize::from(phi)] = Some(value);
        }
        Ok(())
    }

    // Executes the effect chain from just past `current_effect` up to and
    // including `target`.
    fn exec_effects(&mut self, target: NodeId) -> Result<(), Trap> {
        if target == self.current_effect {
            return Ok(());
        }
        let f = self.f;
        let mut chain = Vec::new();
        let mut node = target;
        while node != self.current_effect {
            chain.push(node);
            node = effect_input(f.graph.node(node));
        }
        for node in chain.into_iter().rev() {
            self.exec_effect(node)?;
            self.current_effect = node;
        }
        Ok(())
    }

    fn exec_effect(&mut self, id: NodeId) -> Result<(), Trap> {
        let f = self.f;
        match f.graph.node(id).op {
            Operator::LoadMem(ty) => {
                let addr = self.eval(f.graph.node(id).inputs[0])?.as_i32();
                let value = read_scalar(self.memory, ty, addr as u32 as usize)?;
                self.values[usize::from(id)] = Some(value);
            }
            Operator::StoreMem(ty) => {
                let (addr, value) = {
                    let node = f.graph.node(id);
                    (node.inputs[0], node.inputs[1])
                };
                let addr = self.eval(addr)?.as_i32();
                let value = self.eval(value)?;
                write_scalar(self.memory, ty, addr as u32 as usize, value)?;
            }
            Operator::LoadGlobal(global) => {
                let (offset, ty) = f.globals[usize::from(global)];
                let value = read_scalar(self.globals, ty, offset as usize)?;
                self.values[usize::from(id)] = Some(value);
            }
            Operator::StoreGlobal(global) => {
                let (offset, ty) = f.globals[usize::from(global)];
                let value = self.eval(f.graph.node(id).inputs[0])?;
                write_scalar(self.globals, ty, offset as usize, value)?;
            }
            Operator::Call(_) => {
                let arg_nodes: Vec<NodeId> = {
                    let node = f.graph.node(id);
                    node.inputs[..node.inputs.len() - 2].to_vec()
                };
                let mut argv = Vec::with_capacity(arg_nodes.len());
                for node in arg_nodes {
                    argv.push(self.eval(node)?);
                }
                let site = f.call_sites.iter().position(|&s| s == id).unwrap();
                let target = f.call_targets[site].clone();
                let result = call(&target, &argv, self.memory, self.globals)?;
                if let Some(value) = result {
                    self.values[usize::from(id)] = Some(value);
                }
            }
            ref op => unreachable!("{op:?} on the effect chain"),
        }
        Ok(())
    }

    // Pure evaluation. Phis, parameters, and executed effectful nodes read
    // their bindings; everything else recomputes on demand.
    fn eval(&mut self, id: NodeId) -> Result<Val, Trap> {
        let f = self.f;
        let node = f.graph.node(id);
        Ok(match node.op {
            Operator::Int32Const(v) => Val::I32(v),
            Operator::Int64Const(v) => Val::I64(v),
            Operator::Float32Const(v) => Val::F32(v),
            Operator::Float64Const(v) => Val::F64(v),
            Operator::Parameter(_)
            | Operator::Phi
            | Operator::LoadMem(_)
            | Operator::LoadGlobal(_)
            | Operator::Call(_) => self.values[usize::from(id)]
                .unwrap_or_else(|| panic!("unbound {:?}", node.op)),
            Operator::Simple(op) => {
                let (a, b) = (node.inputs[0], node.inputs.get(1).copied());
                let a = self.eval(a)?;
                let b = match b {
                    Some(b) => Some(self.eval(b)?),
                    None => None,
                };
                apply(op, a, b)?
            }
            ref op => unreachable!("{op:?} evaluated as a value"),
        })
    }
}

fn effect_input(node: &Node<Global>) -> NodeId {
    match node.op {
        Operator::LoadGlobal(_) => node.inputs[0],
        Operator::LoadMem(_) | Operator::StoreGlobal(_) => node.inputs[1],
        Operator::StoreMem(_) => node.inputs[2],
        Operator::Call(_) => node.inputs[node.inputs.len() - 2],
        ref op => panic!("effect chain desync at {op:?}"),
    }
}

fn read_scalar(buf: &[u8], ty: MemType, addr: usize) -> Result<Val, Trap> {
    let size = usize::from(ty.size());
    let end = addr.checked_add(size).ok_or(Trap::MemoryOutOfBounds)?;
    if end > buf.len() {
        return Err(Trap::MemoryOutOfBounds);
    }
    let bytes = &buf[addr..end];
    Ok(match ty {
        MemType::I8 => Val::I32(i32::from(bytes[0] as i8)),
        MemType::U8 => Val::I32(i32::from(bytes[0])),
        MemType::I16 => Val::I32(i32::from(i16::from_le_bytes([bytes[0], bytes[1]]))),
        MemType::U16 => Val::I32(i32::from(u16::from_le_bytes([bytes[0], bytes[1]]))),
        MemType::I32 | MemType::U32 => {
            Val::I32(i32::from_le_bytes(bytes.try_into().unwrap()))
        }
        MemType::I64 | MemType::U64 => {
            Val::I64(i64::from_le_bytes(bytes.try_into().unwrap()))
        }
        MemType::F32 => Val::F32(f32::from_le_bytes(bytes.try_into().unwrap())),
        MemType::F64 => Val::F64(f64::from_le_bytes(bytes.try_into().unwrap())),
    })
}

fn write_scalar(buf: &mut [u8], ty: MemType, addr: usize, value: Val) -> Result<(), Trap> {
    let size = usize::from(ty.size());
    let end = addr.checked_add(size).ok_or(Trap::MemoryOutOfBounds)?;
    if end > buf.len() {
        return Err(Trap::MemoryOutOfBounds);
    }
    let dest = &mut buf[addr..end];
    match ty {
        MemType::I8 | MemType::U8 => dest[0] = value.as_i32() as u8,
        MemType::I16 | MemType::U16 => {
            dest.copy_from_slice(&(value.as_i32() as u16).to_le_bytes());
        }
        MemType::I32 | MemType::U32 => dest.copy_from_slice(&value.as_i32().to_le_bytes()),
        MemType::I64 | MemType::U64 => dest.copy_from_slice(&value.as_i64().to_le_bytes()),
        MemType::F32 => dest.copy_from_slice(&value.as_f32().to_le_bytes()),
        MemType::F64 => dest.copy_from_slice(&value.as_f64().to_le_bytes()),
    }
    Ok(())
}

// Semantics of the simple operators. Integer division and remainder trap on
// zero divisors (and division on i32::MIN / -1); shifts mask their count;
// float-to-int conversions follow Rust `as` casts.
#[allow(clippy::too_many_lines)]
fn apply(op: Opcode, a: Val, b: Option<Val>) -> Result<Val, Trap> {
    use Opcode::*;
    use Val::*;

    fn bool_val(v: bool) -> Val {
        I32(i32::from(v))
    }

    Ok(match op {
        BoolNot => bool_val(a.as_i32() == 0),

        I32Add => I32(a.as_i32().wrapping_add(b.unwrap().as_i32())),
        I32Sub => I32(a.as_i32().wrapping_sub(b.unwrap().as_i32())),
        I32Mul => I32(a.as_i32().wrapping_mul(b.unwrap().as_i32())),
        I32DivS => {
            let (x, y) = (a.as_i32(), b.unwrap().as_i32());
            if y == 0 {
                return Err(Trap::DivisionByZero);
            }
            if x == i32::MIN && y == -1 {
                return Err(Trap::IntegerOverflow);
            }
            I32(x.wrapping_div(y))
        }
        I32DivU => {
            let (x, y) = (a.as_i32() as u32, b.unwrap().as_i32() as u32);
            if y == 0 {
                return Err(Trap::DivisionByZero);
            }
            I32((x / y) as i32)
        }
        I32RemS => {
            let (x, y) = (a.as_i32(), b.unwrap().as_i32());
            if y == 0 {
                return Err(Trap::DivisionByZero);
            }
            I32(x.wrapping_rem(y))
        }
        I32RemU => {
            let (x, y) = (a.as_i32() as u32, b.unwrap().as_i32() as u32);
            if y == 0 {
                return Err(Trap::DivisionByZero);
            }
            I32((x % y) as i32)
        }
        I32And => I32(a.as_i32() & b.unwrap().as_i32()),
        I32Or => I32(a.as_i32() | b.unwrap().as_i32()),
        I32Xor => I32(a.as_i32() ^ b.unwrap().as_i32()),
        I32Shl => I32(a.as_i32().wrapping_shl(b.unwrap().as_i32() as u32)),
        I32ShrS => I32(a.as_i32().wrapping_shr(b.unwrap().as_i32() as u32)),
        I32ShrU => I32(((a.as_i32() as u32).wrapping_shr(b.unwrap().as_i32() as u32)) as i32),
        I32Eq => bool_val(a.as_i32() == b.unwrap().as_i32()),
        I32Ne => bool_val(a.as_i32() != b.unwrap().as_i32()),
        I32LtS => bool_val(a.as_i32() < b.unwrap().as_i32()),
        I32LeS => bool_val(a.as_i32() <= b.unwrap().as_i32()),
        I32LtU => bool_val((a.as_i32() as u32) < (b.unwrap().as_i32() as u32)),
        I32LeU => bool_val((a.as_i32() as u32) <= (b.unwrap().as_i32() as u32)),
        I32GtS => bool_val(a.as_i32() > b.unwrap().as_i32()),
        I32GeS => bool_val(a.as_i32() >= b.unwrap().as_i32()),
        I32GtU => bool_val((a.as_i32() as u32) > (b.unwrap().as_i32() as u32)),
        I32GeU => bool_val((a.as_i32() as u32) >= (b.unwrap().as_i32() as u32)),

        I64Add => I64(a.as_i64().wrapping_add(b.unwrap().as_i64())),
        I64Sub => I64(a.as_i64().wrapping_sub(b.unwrap().as_i64())),
        I64Mul => I64(a.as_i64().wrapping_mul(b.unwrap().as_i64())),
        I64DivS => {
            let (x, y) = (a.as_i64(), b.unwrap().as_i64());
            if y == 0 {
                return Err(Trap::DivisionByZero);
            }
            if x == i64::MIN && y == -1 {
                return Err(Trap::IntegerOverflow);
            }
            I64(x.wrapping_div(y))
        }
        I64DivU => {
            let (x, y) = (a.as_i64() as u64, b.unwrap().as_i64() as u64);
            if y == 0 {
                return Err(Trap::DivisionByZero);
            }
            I64((x / y) as i64)
        }
        I64RemS => {
            let (x, y) = (a.as_i64(), b.unwrap().as_i64());
            if y == 0 {
                return Err(Trap::DivisionByZero);
            }
            I64(x.wrapping_rem(y))
        }
        I64RemU => {
            let (x, y) = (a.as_i64() as u64, b.unwrap().as_i64() as u64);
            if y == 0 {
                return Err(Trap::DivisionByZero);
            }
            I64((x % y) as i64)
        }
        I64And => I64(a.as_i64() & b.unwrap().as_i64()),
        I64Or => I64(a.as_i64() | b.unwrap().as_i64()),
        I64Xor => I64(a.as_i64() ^ b.unwrap().as_i64()),
        I64Shl => I64(a.as_i64().wrapping_shl(b.unwrap().as_i64() as u32)),
        I64ShrS => I64(a.as_i64().wrapping_shr(b.unwrap().as_i64() as u32)),
        I64ShrU => I64(((a.as_i64() as u64).wrapping_shr(b.unwrap().as_i64() as u32)) as i64),
        I64Eq => bool_val(a.as_i64() == b.unwrap().as_i64()),
        I64Ne => bool_val(a.as_i64() != b.unwrap().as_i64()),
        I64LtS => bool_val(a.as_i64() < b.unwrap().as_i64()),
        I64LeS => bool_val(a.as_i64() <= b.unwrap().as_i64()),
        I64LtU => bool_val((a.as_i64() as u64) < (b.unwrap().as_i64() as u64)),
        I64LeU => bool_val((a.as_i64() as u64) <= (b.unwrap().as_i64() as u64)),
        I64GtS => bool_val(a.as_i64() > b.unwrap().as_i64()),
        I64GeS => bool_val(a.as_i64() >= b.unwrap().as_i64()),
        I64GtU => bool_val((a.as_i64() as u64) > (b.unwrap().as_i64() as u64)),
        I64GeU => bool_val((a.as_i64() as u64) >= (b.unwrap().as_i64() as u64)),

        F32Add => F32(a.as_f32() + b.unwrap().as_f32()),
        F32Sub => F32(a.as_f32() - b.unwrap().as_f32()),
        F32Mul => F32(a.as_f32() * b.unwrap().as_f32()),
        F32Div => F32(a.as_f32() / b.unwrap().as_f32()),
        F32Abs => F32(a.as_f32().abs()),
        F32Neg => F32(-a.as_f32()),
        F32Eq => bool_val(a.as_f32() == b.unwrap().as_f32()),
        F32Ne => bool_val(a.as_f32() != b.unwrap().as_f32()),
        F32Lt => bool_val(a.as_f32() < b.unwrap().as_f32()),
        F32Le => bool_val(a.as_f32() <= b.unwrap().as_f32()),
        F32Gt => bool_val(a.as_f32() > b.unwrap().as_f32()),
        F32Ge => bool_val(a.as_f32() >= b.unwrap().as_f32()),

        F64Add => F64(a.as_f64() + b.unwrap().as_f64()),
        F64Sub => F64(a.as_f64() - b.unwrap().as_f64()),
        F64Mul => F64(a.as_f64() * b.unwrap().as_f64()),
        F64Div => F64(a.as_f64() / b.unwrap().as_f64()),
        F64Abs => F64(a.as_f64().abs()),
        F64Neg => F64(-a.as_f64()),
        F64Eq => bool_val(a.as_f64() == b.unwrap().as_f64()),
        F64Ne => bool_val(a.as_f64() != b.unwrap().as_f64()),
        F64Lt => bool_val(a.as_f64() < b.unwrap().as_f64()),
        F64Le => bool_val(a.as_f64() <= b.unwrap().as_f64()),
        F64Gt => bool_val(a.as_f64() > b.unwrap().as_f64()),
        F64Ge => bool_val(a.as_f64() >= b.unwrap().as_f64()),

        I32ConvertI64 => I32(a.as_i64() as i32),
        I32SConvertF32 => I32(a.as_f32() as i32),
        I32UConvertF32 => I32((a.as_f32() as u32) as i32),
        I32SConvertF64 => I32(a.as_f64() as i32),
        I32UConvertF64 => I32((a.as_f64() as u32) as i32),
        I64SConvertI32 => I64(i64::from(a.as_i32())),
        I64UConvertI32 => I64(i64::from(a.as_i32() as u32)),
        I64SConvertF32 => I64(a.as_f32() as i64),
        I64UConvertF32 => I64((a.as_f32() as u64) as i64),
        I64SConvertF64 => I64(a.as_f64() as i64),
        I64UConvertF64 => I64((a.as_f64() as u64) as i64),
        F32SConvertI32 => F32(a.as_i32() as f32),
        F32UConvertI32 => F32((a.as_i32() as u32) as f32),
        F32SConvertI64 => F32(a.as_i64() as f32),
        F32UConvertI64 => F32((a.as_i64() as u64) as f32),
        F32ConvertF64 => F32(a.as_f64() as f32),
        F64SConvertI32 => F64(f64::from(a.as_i32())),
        F64UConvertI32 => F64(f64::from(a.as_i32() as u32)),
        F64SConvertI64 => F64(a.as_i64() as f64),
        F64UConvertI64 => F64((a.as_i64() as u64) as f64),
        F64ConvertF32 => F64(f64::from(a.as_f32())),

        _ => unreachable!("{op:?} is not a simple operator"),
    })
}

// ----- test harness conveniences -----

/// Decodes (with verification) and instantiates a module against the
/// evaluator back end.
pub fn instantiate_bytes<'b>(
    bytes: &'b [u8],
    imports: &Imports<'_, Code>,
) -> ModuleInstance<'b, Code, Global> {
    let module = Module::decode(bytes, DecodeOptions::default(), Global)
        .expect("module failed to decode");
    instance::instantiate(&module, &mut Evaluator, imports, Global)
        .expect("module failed to instantiate")
}

/// Calls an exported function of an instance.
pub fn run_export(
    instance: &mut ModuleInstance<'_, Code, Global>,
    name: &str,
    args: &[Val],
) -> Result<Option<Val>, Trap> {
    let code = instance
        .exported_function(name)
        .unwrap_or_else(|| panic!("no exported function named {name:?}"))
        .clone();
    call(&code, args, &mut instance.memory, &mut instance.globals)
}
