// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

use super::*;
use crate::core_compat::alloc::Global;
use crate::decode::DecodeOptions;
use crate::emit::ModuleBuilder;
use crate::graph::FunctionGraph;
use crate::types::{MemType, Opcode};

const NO_VERIFY: DecodeOptions = DecodeOptions { verify_functions: false };

// Builds a single-function module around `body` and verifies that function.
fn verify_body(
    return_type: ValueType,
    params: &[ValueType],
    locals: [u16; 4],
    body: &[u8],
) -> Result<FunctionGraph<Global>, Error> {
    let mut builder = ModuleBuilder::new(16, false);
    builder.add_global(MemType::I32, false);
    let f = builder.add_function(return_type, params, body).unwrap();
    builder.set_locals(f, locals);
    let bytes = builder.build().unwrap();
    let module = Module::decode(&bytes, NO_VERIFY, Global).unwrap();
    let env = FunctionEnv::new(&module, FuncIdx::new(0));
    build_function_graph(&env, Global)
}

fn ops<'g>(
    graph: &'g FunctionGraph<Global>,
    pred: impl Fn(&Operator) -> bool + 'g,
) -> impl Iterator<Item = NodeId> + 'g {
    graph
        .graph
        .iter()
        .filter(move |(_, node)| pred(&node.op))
        .map(|(id, _)| id)
}

// Offset of the first body byte, as laid out by the builder above: header,
// one global entry (6 bytes), one function entry (24 bytes plus one per
// parameter).
fn body_start(params: usize) -> u32 {
    (8 + 6 + 24 + params) as u32
}

#[test]
fn constant_return_builds_a_return_node() {
    let graph = verify_body(
        ValueType::I32,
        &[],
        [0; 4],
        &[Opcode::Return as u8, Opcode::I8Const as u8, 121],
    )
    .unwrap();
    let end = graph.graph.node(graph.end);
    assert_eq!(end.inputs.len(), 1);
    let ret = graph.graph.node(end.inputs[0]);
    assert_eq!(ret.op, Operator::Return);
    assert_eq!(ret.inputs.len(), 3);
    assert_eq!(graph.graph.node(ret.inputs[0]).op, Operator::Int32Const(121));
}

#[test]
fn bare_expression_falls_through_as_the_return_value() {
    let graph = verify_body(
        ValueType::I32,
        &[ValueType::I32],
        [0; 4],
        &[Opcode::GetLocal as u8, 0],
    )
    .unwrap();
    let end = graph.graph.node(graph.end);
    assert_eq!(end.inputs.len(), 1);
    let ret = graph.graph.node(end.inputs[0]);
    assert_eq!(graph.graph.node(ret.inputs[0]).op, Operator::Parameter(0));
}

#[test]
fn empty_body_returns_void_only() {
    assert!(verify_body(ValueType::Stmt, &[], [0; 4], &[]).is_ok());
    let err = verify_body(ValueType::I32, &[], [0; 4], &[]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnexpectedEndOfBytes);
}

#[test]
fn trailing_bytes_are_rejected() {
    let err = verify_body(
        ValueType::Stmt,
        &[],
        [0; 4],
        &[Opcode::Nop as u8, Opcode::Nop as u8],
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownOpcode);
    assert_eq!(err.pc, body_start(0) + 1);
}

#[test]
fn missing_result_value_is_reported() {
    let err = verify_body(ValueType::I32, &[], [0; 4], &[Opcode::Nop as u8]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ValueExpectedStmtFound);
}

#[test]
fn void_function_may_not_produce_a_tail_value() {
    let err =
        verify_body(ValueType::Stmt, &[], [0; 4], &[Opcode::I8Const as u8, 5]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::StmtExpectedValueFound);
    assert_eq!(err.pc, body_start(0));
}

#[test]
fn set_local_type_mismatch_carries_both_offsets() {
    let body = [
        Opcode::SetLocal as u8,
        0,
        Opcode::F32Const as u8,
        0,
        0,
        0,
        0,
    ];
    let err = verify_body(ValueType::Stmt, &[], [1, 0, 0, 0], &body).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
    assert_eq!(err.pc, body_start(0) + 2);
    assert_eq!(err.pt, Some(body_start(0)));
}

#[test]
fn index_range_errors() {
    let err =
        verify_body(ValueType::I32, &[], [0; 4], &[Opcode::GetLocal as u8, 5]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::LocalIndexOutOfRange);

    let err = verify_body(
        ValueType::Stmt,
        &[],
        [0; 4],
        &[Opcode::StoreGlobal as u8, 9, Opcode::I8Const as u8, 1],
    )
    .unwrap_err();
    assert_eq!(err.kind, ErrorKind::GlobalIndexOutOfRange);

    let err =
        verify_body(ValueType::I32, &[], [0; 4], &[Opcode::CallFunction as u8, 7])
            .unwrap_err();
    assert_eq!(err.kind, ErrorKind::FunctionIndexOutOfRange);
}

#[test]
fn break_and_continue_depths_are_checked() {
    let err =
        verify_body(ValueType::Stmt, &[], [0; 4], &[Opcode::Break as u8, 0]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::BreakDepthOutOfRange);

    // Continue may only target a loop.
    let body = [Opcode::Block as u8, 1, Opcode::Continue as u8, 0];
    let err = verify_body(ValueType::Stmt, &[], [0; 4], &body).unwrap_err();
    assert_eq!(err.kind, ErrorKind::BreakDepthOutOfRange);
}

#[test]
fn statement_opcode_in_value_position() {
    let body = [Opcode::I32Add as u8, Opcode::Nop as u8, Opcode::Nop as u8];
    let err = verify_body(ValueType::I32, &[], [0; 4], &body).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ValueExpectedStmtFound);
    assert_eq!(err.pc, body_start(0) + 1);
}

#[test]
fn nesting_depth_is_bounded() {
    // N nested Block(1, ...) around a Nop put the Nop at depth N + 1.
    let nested = |blocks: usize| {
        let mut body = std::vec::Vec::new();
        for _ in 0..blocks {
            body.extend_from_slice(&[Opcode::Block as u8, 1]);
        }
        body.push(Opcode::Nop as u8);
        body
    };

    let deepest_legal = nested(MAX_NESTING_DEPTH - 1);
    assert!(verify_body(ValueType::Stmt, &[], [0; 4], &deepest_legal).is_ok());

    let too_deep = nested(MAX_NESTING_DEPTH);
    let err = verify_body(ValueType::Stmt, &[], [0; 4], &too_deep).unwrap_err();
    assert_eq!(err.kind, ErrorKind::NestingTooDeep);
}

#[test]
fn unknown_opcode_byte() {
    let err = verify_body(ValueType::Stmt, &[], [0; 4], &[0xff]).unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnknownOpcode);
    assert_eq!(err.pc, body_start(0));
}

#[test]
fn countdown_loop_inserts_one_phi() {
    // Block(2, Loop(2, If(BoolNot(L0), Break(0)),
    //               SetLocal(0, I32Sub(L0, 1))),
    //          Return(L0))
    let body = [
        Opcode::Block as u8,
        2,
        Opcode::Loop as u8,
        2,
        Opcode::If as u8,
        Opcode::BoolNot as u8,
        Opcode::GetLocal as u8,
        0,
        Opcode::Break as u8,
        0,
        Opcode::SetLocal as u8,
        0,
        Opcode::I32Sub as u8,
        Opcode::GetLocal as u8,
        0,
        Opcode::I8Const as u8,
        1,
        Opcode::Return as u8,
        Opcode::GetLocal as u8,
        0,
    ];
    let graph = verify_body(ValueType::I32, &[ValueType::I32], [0; 4], &body).unwrap();

    let loops: std::vec::Vec<_> = ops(&graph, |op| *op == Operator::Loop).collect();
    assert_eq!(loops.len(), 1);

    // The parameter is rebound around the back edge; no effects happen, so
    // the eagerly created effect phi must have been pruned.
    let phis: std::vec::Vec<_> = ops(&graph, |op| *op == Operator::Phi).collect();
    assert_eq!(phis.len(), 1);
    assert_eq!(ops(&graph, |op| *op == Operator::EffectPhi).count(), 0);

    let phi = graph.graph.node(phis[0]);
    assert_eq!(phi.ty, ValueType::I32);
    // Entry value, back-edge value, control.
    assert_eq!(phi.inputs.len(), 3);
    assert_eq!(graph.graph.node(phi.inputs[0]).op, Operator::Parameter(0));
    assert_eq!(phi.inputs[2], loops[0]);

    // The returned value is the loop phi.
    let end = graph.graph.node(graph.end);
    let ret = graph.graph.node(end.inputs[0]);
    assert_eq!(ret.inputs[0], phis[0]);
}

#[test]
fn if_merge_creates_a_phi_for_the_changed_local() {
    // Block(2, IfThen(L0, SetLocal(0, 1), SetLocal(0, 2)), Return(L0))
    let body = [
        Opcode::Block as u8,
        2,
        Opcode::IfThen as u8,
        Opcode::GetLocal as u8,
        0,
        Opcode::SetLocal as u8,
        0,
        Opcode::I8Const as u8,
        1,
        Opcode::SetLocal as u8,
        0,
        Opcode::I8Const as u8,
        2,
        Opcode::Return as u8,
        Opcode::GetLocal as u8,
        0,
    ];
    let graph = verify_body(ValueType::I32, &[ValueType::I32], [0; 4], &body).unwrap();
    assert_eq!(ops(&graph, |op| *op == Operator::Merge).count(), 1);
    let phis: std::vec::Vec<_> = ops(&graph, |op| *op == Operator::Phi).collect();
    assert_eq!(phis.len(), 1);
    let phi = graph.graph.node(phis[0]);
    assert_eq!(phi.inputs.len(), 3);
    assert_eq!(graph.graph.node(phi.inputs[0]).op, Operator::Int32Const(1));
    assert_eq!(graph.graph.node(phi.inputs[1]).op, Operator::Int32Const(2));
}

#[test]
fn effects_chain_through_stores_and_loads() {
    // Block(2, StoreMem(I32, 0, 7), Return(LoadMem(I32, 0)))
    let body = [
        Opcode::Block as u8,
        2,
        Opcode::StoreMemI32 as u8,
        Opcode::I8Const as u8,
        0,
        Opcode::I8Const as u8,
        7,
        Opcode::Return as u8,
        Opcode::LoadMemI32 as u8,
        Opcode::I8Const as u8,
        0,
    ];
    let graph = verify_body(ValueType::I32, &[], [0; 4], &body).unwrap();
    let store = ops(&graph, |op| matches!(op, Operator::StoreMem(MemType::I32)))
        .next()
        .unwrap();
    let load = ops(&graph, |op| matches!(op, Operator::LoadMem(MemType::I32)))
        .next()
        .unwrap();
    // Load inputs: address, effect, control; its effect is the store.
    assert_eq!(graph.graph.node(load).inputs[1], store);
    assert_eq!(graph.graph.node(load).ty, ValueType::I32);
}

#[test]
fn narrowing_stores_accept_the_widened_type_only() {
    let ok = [
        Opcode::StoreMemI8 as u8,
        Opcode::I8Const as u8,
        0,
        Opcode::I8Const as u8,
        7,
    ];
    assert!(verify_body(ValueType::Stmt, &[], [0; 4], &ok).is_ok());

    let bad = [
        Opcode::StoreMemI8 as u8,
        Opcode::I8Const as u8,
        0,
        Opcode::F32Const as u8,
        0,
        0,
        0,
        0,
    ];
    let err = verify_body(ValueType::Stmt, &[], [0; 4], &bad).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
}

#[test]
fn narrow_loads_widen_to_i32() {
    let body = [Opcode::LoadMemI16 as u8, Opcode::I8Const as u8, 0];
    let graph = verify_body(ValueType::I32, &[], [0; 4], &body).unwrap();
    let load = ops(&graph, |op| matches!(op, Operator::LoadMem(MemType::I16)))
        .next()
        .unwrap();
    assert_eq!(graph.graph.node(load).ty, ValueType::I32);
}

#[test]
fn ternary_arms_must_agree() {
    let body = [
        Opcode::Ternary as u8,
        Opcode::GetLocal as u8,
        0,
        Opcode::I8Const as u8,
        1,
        Opcode::F64Const as u8,
        0,
        0,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    let err =
        verify_body(ValueType::I32, &[ValueType::I32], [0; 4], &body).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
    // The point of interest is the then-arm that fixed the type.
    assert_eq!(err.pt, Some(body_start(1) + 3));
}

#[test]
fn switch_bodies_verify() {
    // Block(2, Switch(4, L0, Nop, Return(45), Nop, Return(47)), Return(L0))
    let body = [
        Opcode::Block as u8,
        2,
        Opcode::Switch as u8,
        4,
        Opcode::GetLocal as u8,
        0,
        Opcode::Nop as u8,
        Opcode::Return as u8,
        Opcode::I8Const as u8,
        45,
        Opcode::Nop as u8,
        Opcode::Return as u8,
        Opcode::I8Const as u8,
        47,
        Opcode::Return as u8,
        Opcode::GetLocal as u8,
        0,
    ];
    let graph = verify_body(ValueType::I32, &[ValueType::I32], [0; 4], &body).unwrap();
    // One equality test per case.
    assert_eq!(
        ops(&graph, |op| *op == Operator::Simple(Opcode::I32Eq)).count(),
        4
    );
    // Three terminators: the two case returns and the trailing return.
    assert_eq!(graph.graph.node(graph.end).inputs.len(), 3);
}

#[test]
fn infinite_loop_terminates_nothing() {
    let graph =
        verify_body(ValueType::Stmt, &[], [0; 4], &[Opcode::InfiniteLoop as u8]).unwrap();
    assert_eq!(graph.graph.node(graph.end).inputs.len(), 0);
}

#[test]
fn loop_without_backedge_collapses() {
    // Loop(1, Break(0)): executes once, then exits.
    let body = [Opcode::Loop as u8, 1, Opcode::Break as u8, 0];
    let graph = verify_body(ValueType::Stmt, &[], [0; 4], &body).unwrap();
    // The loop node exists but nothing downstream references it: the break
    // env was rewritten to the entry control.
    let end = graph.graph.node(graph.end);
    let ret = graph.graph.node(end.inputs[0]);
    let control = *ret.inputs.last().unwrap();
    assert_eq!(graph.graph.node(control).op, Operator::Start);
}

#[test]
fn comma_permits_a_void_first_operand() {
    let mut builder = ModuleBuilder::new(0, false);
    let ext = builder.add_function(ValueType::Stmt, &[], &[]).unwrap();
    builder.set_external(ext);
    builder.set_name(ext, "tick");
    let body = [
        Opcode::Comma as u8,
        Opcode::CallFunction as u8,
        0,
        Opcode::I8Const as u8,
        3,
    ];
    let f = builder.add_function(ValueType::I32, &[], &body).unwrap();
    let bytes = builder.build().unwrap();
    let module = Module::decode(&bytes, NO_VERIFY, Global).unwrap();
    let env = FunctionEnv::new(&module, FuncIdx::new(f));
    let graph = build_function_graph(&env, Global).unwrap();
    assert_eq!(ops(&graph, |op| matches!(op, Operator::Call(_))).count(), 1);

    // The same void call is not a value.
    let body = [
        Opcode::I32Add as u8,
        Opcode::CallFunction as u8,
        0,
        Opcode::I8Const as u8,
        3,
    ];
    let mut builder = ModuleBuilder::new(0, false);
    let ext = builder.add_function(ValueType::Stmt, &[], &[]).unwrap();
    builder.set_external(ext);
    builder.set_name(ext, "tick");
    let f = builder.add_function(ValueType::I32, &[], &body).unwrap();
    let bytes = builder.build().unwrap();
    let module = Module::decode(&bytes, NO_VERIFY, Global).unwrap();
    let env = FunctionEnv::new(&module, FuncIdx::new(f));
    let err = build_function_graph(&env, Global).unwrap_err();
    assert_eq!(err.kind, ErrorKind::ValueExpectedStmtFound);
}

#[test]
fn call_arguments_check_against_the_callee_signature() {
    let mut builder = ModuleBuilder::new(0, false);
    let callee_body = [Opcode::GetLocal as u8, 0];
    builder
        .add_function(ValueType::I32, &[ValueType::I32], &callee_body)
        .unwrap();
    let caller_body = [
        Opcode::Return as u8,
        Opcode::CallFunction as u8,
        0,
        Opcode::F32Const as u8,
        0,
        0,
        0,
        0,
    ];
    let caller = builder.add_function(ValueType::I32, &[], &caller_body).unwrap();
    let bytes = builder.build().unwrap();
    let module = Module::decode(&bytes, NO_VERIFY, Global).unwrap();
    let env = FunctionEnv::new(&module, FuncIdx::new(caller));
    let err = build_function_graph(&env, Global).unwrap_err();
    assert_eq!(err.kind, ErrorKind::TypeMismatch);
}

#[test]
fn graph_node_types_follow_opcode_signatures() {
    let body = [
        Opcode::Return as u8,
        Opcode::I32LtS as u8,
        Opcode::I8Const as u8,
        1,
        Opcode::I8Const as u8,
        2,
    ];
    let graph = verify_body(ValueType::I32, &[], [0; 4], &body).unwrap();
    let cmp = ops(&graph, |op| *op == Operator::Simple(Opcode::I32LtS))
        .next()
        .unwrap();
    assert_eq!(
        graph.graph.node(cmp).ty,
        Opcode::I32LtS.signature().unwrap().return_type
    );
}
