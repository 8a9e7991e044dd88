// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Lowering of the typed AST into bytecode.
//!
//! Statement and expression opcodes are prefix-encoded, so lowering is a
//! straight pre-order walk: emit the opcode and immediates, then the
//! operands. `while` becomes a `Loop` whose first statement breaks out when
//! the negated condition holds; source `break`/`continue` count the labeled
//! constructs between them and the innermost loop to find their depth.

use core::fmt;

use super::ast::{Expr, FunctionDecl, Literal, SourceModule, Stmt, Token, TypeClass, Var};
use super::{Error as BuildError, ModuleBuilder};
use crate::core_compat::alloc::Global;
use crate::core_compat::vec::Vec;
use crate::types::{Opcode, ValueType};

/// Represents errors that can arise while lowering an AST. Each carries the
/// index of the offending function declaration.
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum Error {
    /// Module assembly failed.
    Build(BuildError),
    UnknownVariable { function: u16 },
    UnknownFunction { function: u16 },
    /// A call passes the wrong number of arguments.
    ArityMismatch { function: u16 },
    /// An operand or assigned value has the wrong type.
    TypeMismatch { function: u16 },
    /// A `return` disagrees with the declared return type.
    ReturnTypeMismatch { function: u16 },
    /// A void function ends with a value-producing expression.
    TrailingValue { function: u16 },
    BreakOutsideLoop { function: u16 },
    /// The operator does not exist for the operand class (e.g. `%` on
    /// floats).
    UnsupportedOperator { function: u16 },
    /// A variable, callee, or statement count does not fit its single-byte
    /// encoding.
    IndexOverflow { function: u16 },
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Build(err) => write!(f, "{err:?}"),
            Error::UnknownVariable { function } => {
                write!(f, "function #{function}: unknown variable")
            }
            Error::UnknownFunction { function } => {
                write!(f, "function #{function}: call to unknown function")
            }
            Error::ArityMismatch { function } => {
                write!(f, "function #{function}: call arity mismatch")
            }
            Error::TypeMismatch { function } => {
                write!(f, "function #{function}: operand type mismatch")
            }
            Error::ReturnTypeMismatch { function } => {
                write!(f, "function #{function}: return type mismatch")
            }
            Error::TrailingValue { function } => {
                write!(f, "function #{function}: void function ends in a value")
            }
            Error::BreakOutsideLoop { function } => {
                write!(f, "function #{function}: break/continue outside a loop")
            }
            Error::UnsupportedOperator { function } => {
                write!(f, "function #{function}: operator unsupported for operand class")
            }
            Error::IndexOverflow { function } => {
                write!(f, "function #{function}: index exceeds single-byte encoding")
            }
        }
    }
}

impl From<BuildError> for Error {
    fn from(err: BuildError) -> Self {
        Error::Build(err)
    }
}

/// Lowers a source module into module bytes ready for the decoder.
pub fn emit_module(source: &SourceModule<'_>) -> Result<Vec<u8, Global>, Error> {
    let mut builder = ModuleBuilder::new(source.mem_size_log2, source.mem_export);
    for (index, decl) in source.functions.iter().enumerate() {
        let function = index as u16;
        let mut lowering = FunctionLowering::new(source, decl, function)?;
        lowering.lower_body()?;

        let mut params = Vec::new_in(Global);
        params
            .try_reserve_exact(decl.params.len())
            .map_err(|_| Error::Build(BuildError::AllocError))?;
        for &class in decl.params.iter() {
            params.push(class.value_type());
        }
        let return_type = decl.return_type.map_or(ValueType::Stmt, TypeClass::value_type);

        let added = builder.add_function(return_type, &params, &lowering.code)?;
        debug_assert_eq!(added, function);
        builder.set_locals(added, lowering.locals);
        if let Some(name) = decl.name {
            builder.set_name(added, name);
        }
        if decl.exported {
            builder.set_exported(added);
        }
    }
    Ok(builder.build()?)
}

struct FunctionLowering<'s, 'n> {
    source: &'s SourceModule<'n>,
    decl: &'s FunctionDecl<'n>,
    function: u16,
    code: Vec<u8, Global>,
    // One entry per open labeled construct; true for loops.
    breakable: Vec<bool, Global>,
    // Declaration-order variable index -> bytecode local index.
    var_map: Vec<u8, Global>,
    // Local counts per value type, in I32/I64/F32/F64 order.
    locals: [u16; 4],
}

impl<'s, 'n> FunctionLowering<'s, 'n> {
    fn new(
        source: &'s SourceModule<'n>,
        decl: &'s FunctionDecl<'n>,
        function: u16,
    ) -> Result<Self, Error> {
        let params = decl.params.len();
        let total = params + decl.locals.len();
        if total > 256 {
            return Err(Error::IndexOverflow { function });
        }

        let mut locals = [0u16; 4];
        for &class in decl.locals.iter() {
            locals[Self::group(class)] += 1;
        }
        // Locals regroup by type behind the parameters: I32 first, then
        // I64 (never produced by this dialect), F32, F64.
        let mut group_base = [0usize; 4];
        let mut base = params;
        for group in 0..4 {
            group_base[group] = base;
            base += locals[group] as usize;
        }

        let mut var_map = Vec::new_in(Global);
        var_map
            .try_reserve_exact(total)
            .map_err(|_| Error::Build(BuildError::AllocError))?;
        for index in 0..params {
            var_map.push(index as u8);
        }
        let mut seen = [0usize; 4];
        for &class in decl.locals.iter() {
            let group = Self::group(class);
            var_map.push((group_base[group] + seen[group]) as u8);
            seen[group] += 1;
        }

        Ok(Self {
            source,
            decl,
            function,
            code: Vec::new_in(Global),
            breakable: Vec::new_in(Global),
            var_map,
            locals,
        })
    }

    const fn group(class: TypeClass) -> usize {
        match class.value_type() {
            ValueType::I32 => 0,
            ValueType::I64 => 1,
            ValueType::F32 => 2,
            ValueType::F64 => 3,
            ValueType::Stmt => unreachable!(),
        }
    }

    fn fail(&self, make: fn(u16) -> Error) -> Error {
        make(self.function)
    }

    fn push(&mut self, byte: u8) -> Result<(), Error> {
        self.code.try_reserve(1).map_err(|_| Error::Build(BuildError::AllocError))?;
        self.code.push(byte);
        Ok(())
    }

    fn push_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.code
            .try_reserve(bytes.len())
            .map_err(|_| Error::Build(BuildError::AllocError))?;
        self.code.extend_from_slice(bytes);
        Ok(())
    }

    fn var(&self, var: Var) -> Result<(u8, TypeClass), Error> {
        let index = usize::from(var.0);
        let params = self.decl.params.len();
        let class = if index < params {
            self.decl.params[index]
        } else {
            *self
                .decl
                .locals
                .get(index - params)
                .ok_or(self.fail(|function| Error::UnknownVariable { function }))?
        };
        Ok((self.var_map[index], class))
    }

    // The inferred class of an expression; `None` is a void call.
    fn infer(&self, expr: &Expr) -> Result<Option<TypeClass>, Error> {
        Ok(match expr {
            Expr::Literal(literal) => Some(literal.class()),
            Expr::GetVar(var) => Some(self.var(*var)?.1),
            Expr::Binary { class, token, .. } => {
                Some(if token.is_comparison() { TypeClass::Signed } else { *class })
            }
            Expr::Not(_) => Some(TypeClass::Signed),
            Expr::Call { function, .. } => {
                let callee = self
                    .source
                    .functions
                    .get(usize::from(*function))
                    .ok_or(self.fail(|function| Error::UnknownFunction { function }))?;
                callee.return_type
            }
        })
    }

    fn lower_body(&mut self) -> Result<(), Error> {
        let count = u8::try_from(self.decl.body.len())
            .map_err(|_| self.fail(|function| Error::IndexOverflow { function }))?;
        // The declared return type constrains a value-producing tail
        // expression (the fall-through return) up front.
        if let Some(Stmt::Expr(tail)) = self.decl.body.last() {
            match (self.decl.return_type, self.infer(tail)?) {
                (None, Some(_)) => {
                    return Err(self.fail(|function| Error::TrailingValue { function }));
                }
                (Some(want), Some(found)) if want.value_type() != found.value_type() => {
                    return Err(self.fail(|function| Error::ReturnTypeMismatch { function }));
                }
                _ => {}
            }
        }
        self.push(Opcode::Block as u8)?;
        self.push(count)?;
        self.breakable.push(false);
        let decl = self.decl;
        for stmt in decl.body.iter() {
            self.lower_stmt(stmt)?;
        }
        self.breakable.pop();
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), Error> {
        match stmt {
            Stmt::Expr(expr) => {
                self.lower_expr(expr)?;
                Ok(())
            }
            Stmt::Assign { var, value } => {
                let (index, class) = self.var(*var)?;
                self.push(Opcode::SetLocal as u8)?;
                self.push(index)?;
                let found = self.lower_value(value)?;
                if found.value_type() != class.value_type() {
                    return Err(self.fail(|function| Error::TypeMismatch { function }));
                }
                Ok(())
            }
            Stmt::If { cond, then, otherwise } => {
                match otherwise {
                    None => self.push(Opcode::If as u8)?,
                    Some(_) => self.push(Opcode::IfThen as u8)?,
                }
                self.lower_condition(cond)?;
                self.lower_stmt(then)?;
                if let Some(otherwise) = otherwise {
                    self.lower_stmt(otherwise)?;
                }
                Ok(())
            }
            Stmt::While { cond, body } => self.lower_while(cond, body),
            Stmt::Block(stmts) => {
                let count = u8::try_from(stmts.len())
                    .map_err(|_| self.fail(|function| Error::IndexOverflow { function }))?;
                self.push(Opcode::Block as u8)?;
                self.push(count)?;
                self.breakable.push(false);
                for stmt in stmts.iter() {
                    self.lower_stmt(stmt)?;
                }
                self.breakable.pop();
                Ok(())
            }
            Stmt::Break => {
                let depth = self.innermost_loop_depth()?;
                self.push(Opcode::Break as u8)?;
                self.push(depth)
            }
            Stmt::Continue => {
                let depth = self.innermost_loop_depth()?;
                self.push(Opcode::Continue as u8)?;
                self.push(depth)
            }
            Stmt::Return(expr) => match (self.decl.return_type, expr) {
                (None, None) => self.push(Opcode::Return as u8),
                (None, Some(_)) | (Some(_), None) => {
                    Err(self.fail(|function| Error::ReturnTypeMismatch { function }))
                }
                (Some(want), Some(expr)) => {
                    self.push(Opcode::Return as u8)?;
                    let found = self.lower_value(expr)?;
                    if found.value_type() != want.value_type() {
                        return Err(
                            self.fail(|function| Error::ReturnTypeMismatch { function })
                        );
                    }
                    Ok(())
                }
            },
        }
    }

    // `while (cond) body` becomes `Loop(n+1, If(BoolNot(cond), Break(0)),
    // body...)`; a block body is flattened into the loop to avoid a
    // pointless extra label.
    fn lower_while(&mut self, cond: &Expr, body: &Stmt) -> Result<(), Error> {
        let body_count = match body {
            Stmt::Block(stmts) => stmts.len(),
            _ => 1,
        };
        let count = u8::try_from(1 + body_count)
            .map_err(|_| self.fail(|function| Error::IndexOverflow { function }))?;
        self.push(Opcode::Loop as u8)?;
        self.push(count)?;
        self.breakable.push(true);
        self.push(Opcode::If as u8)?;
        self.push(Opcode::BoolNot as u8)?;
        self.lower_condition(cond)?;
        self.push(Opcode::Break as u8)?;
        self.push(0)?;
        match body {
            Stmt::Block(stmts) => {
                for stmt in stmts.iter() {
                    self.lower_stmt(stmt)?;
                }
            }
            other => self.lower_stmt(other)?,
        }
        self.breakable.pop();
        Ok(())
    }

    // Number of labels between the current position and the innermost loop.
    fn innermost_loop_depth(&self) -> Result<u8, Error> {
        self.breakable
            .iter()
            .rev()
            .position(|&is_loop| is_loop)
            .map(|depth| depth as u8)
            .ok_or(self.fail(|function| Error::BreakOutsideLoop { function }))
    }

    // Lowers an expression that must produce a value of an integer class.
    fn lower_condition(&mut self, cond: &Expr) -> Result<(), Error> {
        let class = self.lower_value(cond)?;
        if !class.is_int() {
            return Err(self.fail(|function| Error::TypeMismatch { function }));
        }
        Ok(())
    }

    fn lower_value(&mut self, expr: &Expr) -> Result<TypeClass, Error> {
        self.lower_expr(expr)?
            .ok_or(self.fail(|function| Error::TypeMismatch { function }))
    }

    fn lower_expr(&mut self, expr: &Expr) -> Result<Option<TypeClass>, Error> {
        match expr {
            Expr::Literal(literal) => {
                self.lower_literal(*literal)?;
                Ok(Some(literal.class()))
            }
            Expr::GetVar(var) => {
                let (index, class) = self.var(*var)?;
                self.push(Opcode::GetLocal as u8)?;
                self.push(index)?;
                Ok(Some(class))
            }
            Expr::Binary { class, token, lhs, rhs } => {
                let op = binary_opcode(*class, *token)
                    .ok_or(self.fail(|function| Error::UnsupportedOperator { function }))?;
                self.push(op as u8)?;
                let found = self.lower_value(lhs)?;
                if found.value_type() != class.value_type() {
                    return Err(self.fail(|function| Error::TypeMismatch { function }));
                }
                let found = self.lower_value(rhs)?;
                if found.value_type() != class.value_type() {
                    return Err(self.fail(|function| Error::TypeMismatch { function }));
                }
                Ok(Some(if token.is_comparison() { TypeClass::Signed } else { *class }))
            }
            Expr::Not(operand) => {
                self.push(Opcode::BoolNot as u8)?;
                let class = self.lower_value(operand)?;
                if !class.is_int() {
                    return Err(self.fail(|function| Error::TypeMismatch { function }));
                }
                Ok(Some(TypeClass::Signed))
            }
            Expr::Call { function, args } => {
                let callee_index = *function;
                let callee = self
                    .source
                    .functions
                    .get(usize::from(callee_index))
                    .ok_or(self.fail(|function| Error::UnknownFunction { function }))?;
                let index = u8::try_from(callee_index)
                    .map_err(|_| self.fail(|function| Error::IndexOverflow { function }))?;
                if args.len() != callee.params.len() {
                    return Err(self.fail(|function| Error::ArityMismatch { function }));
                }
                self.push(Opcode::CallFunction as u8)?;
                self.push(index)?;
                for (arg, &param) in args.iter().zip(callee.params.iter()) {
                    let found = self.lower_value(arg)?;
                    if found.value_type() != param.value_type() {
                        return Err(self.fail(|function| Error::TypeMismatch { function }));
                    }
                }
                Ok(callee.return_type)
            }
        }
    }

    // Integer constants shrink to `I8Const` when they fit a signed byte.
    fn lower_literal(&mut self, literal: Literal) -> Result<(), Error> {
        match literal {
            Literal::Signed(value) => self.lower_int_literal(value),
            Literal::Unsigned(value) => self.lower_int_literal(value as i32),
            Literal::Float32(value) => {
                self.push(Opcode::F32Const as u8)?;
                self.push_all(&value.to_le_bytes())
            }
            Literal::Float64(value) => {
                self.push(Opcode::F64Const as u8)?;
                self.push_all(&value.to_le_bytes())
            }
        }
    }

    fn lower_int_literal(&mut self, value: i32) -> Result<(), Error> {
        if let Ok(byte) = i8::try_from(value) {
            self.push(Opcode::I8Const as u8)?;
            self.push(byte as u8)
        } else {
            self.push(Opcode::I32Const as u8)?;
            self.push_all(&value.to_le_bytes())
        }
    }
}

// The opcode for `(class, token)`, or `None` when the dialect has no such
// operator.
fn binary_opcode(class: TypeClass, token: Token) -> Option<Opcode> {
    use Opcode::*;
    use Token::*;
    let op = match class {
        TypeClass::Signed => match token {
            Add => I32Add,
            Sub => I32Sub,
            Mul => I32Mul,
            Div => I32DivS,
            Rem => I32RemS,
            And => I32And,
            Or => I32Or,
            Xor => I32Xor,
            Shl => I32Shl,
            Shr => I32ShrS,
            Lt => I32LtS,
            Le => I32LeS,
            Gt => I32GtS,
            Ge => I32GeS,
            Eq => I32Eq,
            Ne => I32Ne,
        },
        TypeClass::Unsigned => match token {
            Add => I32Add,
            Sub => I32Sub,
            Mul => I32Mul,
            Div => I32DivU,
            Rem => I32RemU,
            And => I32And,
            Or => I32Or,
            Xor => I32Xor,
            Shl => I32Shl,
            Shr => I32ShrU,
            Lt => I32LtU,
            Le => I32LeU,
            Gt => I32GtU,
            Ge => I32GeU,
            Eq => I32Eq,
            Ne => I32Ne,
        },
        TypeClass::Float32 => match token {
            Add => F32Add,
            Sub => F32Sub,
            Mul => F32Mul,
            Div => F32Div,
            Lt => F32Lt,
            Le => F32Le,
            Gt => F32Gt,
            Ge => F32Ge,
            Eq => F32Eq,
            Ne => F32Ne,
            _ => return None,
        },
        TypeClass::Float64 => match token {
            Add => F64Add,
            Sub => F64Sub,
            Mul => F64Mul,
            Div => F64Div,
            Lt => F64Lt,
            Le => F64Le,
            Gt => F64Gt,
            Ge => F64Ge,
            Eq => F64Eq,
            Ne => F64Ne,
            _ => return None,
        },
    };
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emit::ast::{binary, boxed_stmt};

    fn single_function(decl: FunctionDecl<'static>) -> SourceModule<'static> {
        let mut functions = Vec::new_in(Global);
        functions.push(decl);
        SourceModule { mem_size_log2: 0, mem_export: false, functions }
    }

    fn stmts(list: impl IntoIterator<Item = Stmt>) -> Vec<Stmt, Global> {
        let mut out = Vec::new_in(Global);
        for stmt in list {
            out.push(stmt);
        }
        out
    }

    fn classes(list: &[TypeClass]) -> Vec<TypeClass, Global> {
        let mut out = Vec::new_in(Global);
        out.extend_from_slice(list);
        out
    }

    fn body_bytes(module_bytes: &[u8]) -> &[u8] {
        use crate::core_compat::alloc::Global as GlobalAlloc;
        use crate::decode::DecodeOptions;
        let module = crate::Module::decode(
            module_bytes,
            DecodeOptions::default(),
            GlobalAlloc,
        )
        .unwrap();
        let function = &module.functions[0];
        &module_bytes[function.code_start as usize..function.code_end as usize]
    }

    #[test]
    fn addition_falls_through_as_the_result() {
        let decl = FunctionDecl {
            name: None,
            return_type: Some(TypeClass::Signed),
            params: classes(&[TypeClass::Signed, TypeClass::Signed]),
            locals: classes(&[]),
            body: stmts([Stmt::Expr(binary(
                TypeClass::Signed,
                Token::Add,
                Expr::GetVar(Var(0)),
                Expr::GetVar(Var(1)),
            ))]),
            exported: false,
        };
        let bytes = emit_module(&single_function(decl)).unwrap();
        assert_eq!(
            body_bytes(&bytes),
            &[
                Opcode::Block as u8,
                1,
                Opcode::I32Add as u8,
                Opcode::GetLocal as u8,
                0,
                Opcode::GetLocal as u8,
                1,
            ]
        );
    }

    #[test]
    fn while_lowers_to_loop_with_negated_break() {
        // while (x) { x = x - 1; }
        let decl = FunctionDecl {
            name: None,
            return_type: None,
            params: classes(&[TypeClass::Signed]),
            locals: classes(&[]),
            body: stmts([Stmt::While {
                cond: Expr::GetVar(Var(0)),
                body: boxed_stmt(Stmt::Block(stmts([Stmt::Assign {
                    var: Var(0),
                    value: binary(
                        TypeClass::Signed,
                        Token::Sub,
                        Expr::GetVar(Var(0)),
                        Expr::Literal(Literal::Signed(1)),
                    ),
                }]))),
            }]),
            exported: false,
        };
        let bytes = emit_module(&single_function(decl)).unwrap();
        assert_eq!(
            body_bytes(&bytes),
            &[
                Opcode::Block as u8,
                1,
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
            ]
        );
    }

    #[test]
    fn break_depth_counts_intervening_blocks() {
        // while (1) { { break; } }
        let decl = FunctionDecl {
            name: None,
            return_type: None,
            params: classes(&[]),
            locals: classes(&[]),
            body: stmts([Stmt::While {
                cond: Expr::Literal(Literal::Signed(1)),
                body: boxed_stmt(Stmt::Block(stmts([Stmt::Block(stmts([Stmt::Break]))]))),
            }]),
            exported: false,
        };
        let bytes = emit_module(&single_function(decl)).unwrap();
        assert_eq!(
            body_bytes(&bytes),
            &[
                Opcode::Block as u8,
                1,
                Opcode::Loop as u8,
                2,
                Opcode::If as u8,
                Opcode::BoolNot as u8,
                Opcode::I8Const as u8,
                1,
                Opcode::Break as u8,
                0,
                Opcode::Block as u8,
                1,
                Opcode::Break as u8,
                1,
            ]
        );
    }

    #[test]
    fn unsigned_class_picks_unsigned_opcodes() {
        let decl = FunctionDecl {
            name: None,
            return_type: Some(TypeClass::Signed),
            params: classes(&[TypeClass::Unsigned, TypeClass::Unsigned]),
            locals: classes(&[]),
            body: stmts([Stmt::Return(Some(binary(
                TypeClass::Unsigned,
                Token::Lt,
                Expr::GetVar(Var(0)),
                Expr::GetVar(Var(1)),
            )))]),
            exported: false,
        };
        let bytes = emit_module(&single_function(decl)).unwrap();
        assert_eq!(
            body_bytes(&bytes),
            &[
                Opcode::Block as u8,
                1,
                Opcode::Return as u8,
                Opcode::I32LtU as u8,
                Opcode::GetLocal as u8,
                0,
                Opcode::GetLocal as u8,
                1,
            ]
        );
    }

    #[test]
    fn locals_regroup_by_type_behind_parameters() {
        // One F64 param; locals declared F32, Signed, Signed.
        let decl = FunctionDecl {
            name: None,
            return_type: None,
            params: classes(&[TypeClass::Float64]),
            locals: classes(&[TypeClass::Float32, TypeClass::Signed, TypeClass::Signed]),
            body: stmts([
                Stmt::Assign { var: Var(2), value: Expr::Literal(Literal::Signed(3)) },
                Stmt::Assign { var: Var(1), value: Expr::Literal(Literal::Float32(0.5)) },
            ]),
            exported: false,
        };
        let bytes = emit_module(&single_function(decl)).unwrap();
        // Var(2) is the first Signed local: bytecode index 1 (right after
        // the parameter). Var(1) is the F32 local: index 3, after both I32
        // locals.
        assert_eq!(
            body_bytes(&bytes)[..5],
            [Opcode::Block as u8, 2, Opcode::SetLocal as u8, 1, Opcode::I8Const as u8]
        );
        assert_eq!(body_bytes(&bytes)[6..8], [Opcode::SetLocal as u8, 3]);

        use crate::core_compat::alloc::Global as GlobalAlloc;
        let module = crate::Module::decode(
            &bytes,
            crate::decode::DecodeOptions::default(),
            GlobalAlloc,
        )
        .unwrap();
        let function = &module.functions[0];
        assert_eq!(
            [
                function.local_i32,
                function.local_i64,
                function.local_f32,
                function.local_f64
            ],
            [2, 0, 1, 0]
        );
    }

    #[test]
    fn void_function_may_not_end_in_a_value() {
        let decl = FunctionDecl {
            name: None,
            return_type: None,
            params: classes(&[TypeClass::Signed]),
            locals: classes(&[]),
            body: stmts([Stmt::Expr(Expr::GetVar(Var(0)))]),
            exported: false,
        };
        assert_eq!(
            emit_module(&single_function(decl)).err(),
            Some(Error::TrailingValue { function: 0 })
        );
    }

    #[test]
    fn float_modulo_is_unsupported() {
        let decl = FunctionDecl {
            name: None,
            return_type: Some(TypeClass::Float64),
            params: classes(&[TypeClass::Float64]),
            locals: classes(&[]),
            body: stmts([Stmt::Return(Some(binary(
                TypeClass::Float64,
                Token::Rem,
                Expr::GetVar(Var(0)),
                Expr::GetVar(Var(0)),
            )))]),
            exported: false,
        };
        assert_eq!(
            emit_module(&single_function(decl)).err(),
            Some(Error::UnsupportedOperator { function: 0 })
        );
    }

    #[test]
    fn calls_check_arity() {
        let callee = FunctionDecl {
            name: None,
            return_type: Some(TypeClass::Signed),
            params: classes(&[TypeClass::Signed]),
            locals: classes(&[]),
            body: stmts([Stmt::Return(Some(Expr::GetVar(Var(0))))]),
            exported: false,
        };
        let mut args = Vec::new_in(Global);
        args.push(Expr::Literal(Literal::Signed(1)));
        args.push(Expr::Literal(Literal::Signed(2)));
        let caller = FunctionDecl {
            name: None,
            return_type: Some(TypeClass::Signed),
            params: classes(&[]),
            locals: classes(&[]),
            body: stmts([Stmt::Return(Some(Expr::Call { function: 0, args }))]),
            exported: false,
        };
        let mut functions = Vec::new_in(Global);
        functions.push(callee);
        functions.push(caller);
        let module = SourceModule { mem_size_log2: 0, mem_export: false, functions };
        assert_eq!(
            emit_module(&module).err(),
            Some(Error::ArityMismatch { function: 1 })
        );
    }
}
