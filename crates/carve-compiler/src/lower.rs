//! AST-to-bytecode lowering.
//!
//! Each named complex type lowers to a constructor function `<init><Name>`
//! emitted with the `ctor` flag; everything else accumulates into `<main>`.
//! The two contexts differ in how declarations bind: constructors attach
//! fields to `<this>`, the top level binds locals and exports patterns.
//!
//! The instruction set has no arithmetic opcodes, so arithmetic is
//! constant-folded here; a non-constant operand is a compile error.

use carve_bytecode::{ctor_name, Bytecode, EmitError, Emitter, EmitterFlags, ADDRESS_NAME, MAIN_NAME, THIS_NAME};
use carve_core::TypeId;
use indexmap::IndexMap;

use crate::ast::*;
use crate::diagnostics::Span;

/// Error raised while lowering an unsupported or malformed construct.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
    pub span: Span,
}

impl CompileError {
    fn new(span: Span, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

impl From<EmitError> for CompileError {
    fn from(error: EmitError) -> Self {
        Self {
            message: error.to_string(),
            span: 0..0,
        }
    }
}

/// Lower a validated program to bytecode.
pub fn compile(program: &Program) -> Result<Bytecode, CompileError> {
    let mut lowerer = Lowerer::new();
    lowerer.register_types(program)?;

    let mut bytecode = Bytecode::new();

    for stmt in &program.statements {
        if let Stmt::TypeDecl(decl) = stmt {
            lowerer.lower_type_decl(decl, &mut bytecode)?;
        }
    }

    let mut emitter = Emitter::new(bytecode.symbols_mut()).with_flags(EmitterFlags {
        main: true,
        ctor: false,
    });
    for stmt in &program.statements {
        if let Stmt::VarDecl(decl) = stmt {
            lowerer.lower_decl(&mut emitter, decl)?;
        }
    }
    emitter.return_();
    let body = emitter.finish();
    bytecode.add_function(MAIN_NAME, body);

    Ok(bytecode)
}

/// How a type name resolves for reading purposes.
enum Resolved {
    /// Scalar read of a builtin kind under its own keyword.
    Builtin(TypeId),
    /// Scalar read of the underlying kind, labeled with the enum's name.
    Enum(TypeId),
    /// Constructor-driven read.
    Struct,
}

enum DeclKind {
    Struct,
    Union,
    Enum {
        underlying: TypeId,
        constants: IndexMap<String, i128>,
    },
    Bitfield,
}

#[derive(Default)]
struct Lowerer {
    types: IndexMap<String, DeclKind>,
}

impl Lowerer {
    fn new() -> Self {
        Self::default()
    }

    /// First pass: build the type registry and evaluate enum constants.
    fn register_types(&mut self, program: &Program) -> Result<(), CompileError> {
        for stmt in &program.statements {
            let Stmt::TypeDecl(decl) = stmt else { continue };
            let kind = match &decl.kind {
                TypeDef::Struct(_) => DeclKind::Struct,
                TypeDef::Union(_) => DeclKind::Union,
                TypeDef::Bitfield(_) => DeclKind::Bitfield,
                TypeDef::Enum(def) => {
                    let underlying = TypeId::from_keyword(&def.underlying)
                        .filter(|id| id.is_integer())
                        .ok_or_else(|| {
                            CompileError::new(
                                decl.span.clone(),
                                format!("enum `{}` has no integral underlying type", decl.name),
                            )
                        })?;

                    let mut constants = IndexMap::new();
                    let mut next = 0i128;
                    for constant in &def.constants {
                        let value = match &constant.value {
                            Some(expr) => self.const_eval(expr).ok_or_else(|| {
                                CompileError::new(
                                    constant.span.clone(),
                                    format!(
                                        "enum constant `{}` is not a constant expression",
                                        constant.name
                                    ),
                                )
                            })?,
                            None => next,
                        };
                        next = value + 1;
                        constants.insert(constant.name.clone(), value);
                    }
                    DeclKind::Enum {
                        underlying,
                        constants,
                    }
                }
            };
            self.types.insert(decl.name.clone(), kind);
        }
        Ok(())
    }

    fn lower_type_decl(
        &mut self,
        decl: &TypeDecl,
        bytecode: &mut Bytecode,
    ) -> Result<(), CompileError> {
        // Only struct-like types compile to constructors; enums resolve at
        // read sites, unions and bitfields have no lowering yet.
        let TypeDef::Struct(def) = &decl.kind else {
            return Ok(());
        };

        let mut emitter = Emitter::new(bytecode.symbols_mut()).with_flags(EmitterFlags {
            main: false,
            ctor: true,
        });

        for base in &def.inherits {
            if !matches!(self.types.get(base), Some(DeclKind::Struct)) {
                return Err(CompileError::new(
                    decl.span.clone(),
                    format!("don't know how to inherit from `{base}`"),
                ));
            }
            emitter.load_local(THIS_NAME);
            emitter.call(&ctor_name(base));
        }

        for member in &def.members {
            self.lower_member(&mut emitter, member)?;
        }
        emitter.return_();

        let body = emitter.finish();
        bytecode.add_function(&ctor_name(&decl.name), body);
        Ok(())
    }

    fn lower_member(&self, emitter: &mut Emitter<'_>, member: &Member) -> Result<(), CompileError> {
        match member {
            Member::Decl(decl) => self.lower_decl(emitter, decl),
            Member::If {
                condition,
                then_body,
                else_body,
                ..
            } => {
                self.lower_expr(emitter, condition)?;

                let else_label = emitter.label();
                let end_label = emitter.label();
                emitter.cmp();
                emitter.jmp(else_label);

                for member in then_body {
                    self.lower_member(emitter, member)?;
                }
                emitter.jmp(end_label);

                emitter.place_label(else_label);
                for member in else_body {
                    self.lower_member(emitter, member)?;
                }
                emitter.place_label(end_label);

                emitter.resolve_label(else_label)?;
                emitter.resolve_label(end_label)?;
                Ok(())
            }
            Member::Match {
                scrutinee, arms, ..
            } => {
                let end_label = emitter.label();
                let mut wildcard: Option<&[Member]> = None;

                for arm in arms {
                    let Some(pattern) = &arm.pattern else {
                        wildcard = Some(&arm.body);
                        continue;
                    };

                    let next_arm = emitter.label();
                    self.lower_expr(emitter, scrutinee)?;
                    self.lower_expr(emitter, pattern)?;
                    emitter.eq();
                    emitter.cmp();
                    emitter.jmp(next_arm);

                    for member in &arm.body {
                        self.lower_member(emitter, member)?;
                    }
                    emitter.jmp(end_label);

                    emitter.place_label(next_arm);
                    emitter.resolve_label(next_arm)?;
                }

                if let Some(body) = wildcard {
                    for member in body {
                        self.lower_member(emitter, member)?;
                    }
                }

                emitter.place_label(end_label);
                emitter.resolve_label(end_label)?;
                Ok(())
            }
        }
    }

    /// Lower a variable declaration in either context.
    fn lower_decl(&self, emitter: &mut Emitter<'_>, decl: &VarDecl) -> Result<(), CompileError> {
        if emitter.flags.ctor {
            if decl.placement.is_some() {
                return Err(CompileError::new(
                    decl.span.clone(),
                    "don't know how to emit placed members inside type bodies",
                ));
            }
        } else if decl.placement.is_none() {
            // unplaced top-level declaration: only the type registers
            emitter.local(&decl.name, &decl.type_name);
            return Ok(());
        }

        if let Some(placement) = &decl.placement {
            self.lower_expr(emitter, placement)?;
            emitter.store_local(ADDRESS_NAME, "u64");
        }

        let resolved = self.resolve_type(&decl.type_name, &decl.span)?;
        match &decl.count {
            None => self.lower_scalar_read(emitter, decl, &resolved),
            Some(count) => self.lower_array_read(emitter, decl, &resolved, count),
        }
    }

    fn lower_scalar_read(
        &self,
        emitter: &mut Emitter<'_>,
        decl: &VarDecl,
        resolved: &Resolved,
    ) -> Result<(), CompileError> {
        let type_name = decl.type_name.as_str();
        match resolved {
            Resolved::Builtin(id) | Resolved::Enum(id) => {
                if emitter.flags.ctor {
                    emitter.read_field(&decl.name, type_name, *id);
                } else {
                    emitter.read_value(type_name, *id);
                    emitter.store_value(&decl.name, type_name);
                }
            }
            Resolved::Struct => {
                if emitter.flags.ctor {
                    emitter.new_struct(type_name);
                    emitter.call(&ctor_name(type_name));
                    emitter.store_in_this(&decl.name, type_name);
                } else {
                    emitter.read_value(type_name, TypeId::Structure);
                    emitter.store_value(&decl.name, type_name);
                }
            }
        }
        Ok(())
    }

    fn lower_array_read(
        &self,
        emitter: &mut Emitter<'_>,
        decl: &VarDecl,
        resolved: &Resolved,
        count: &ArrayCount,
    ) -> Result<(), CompileError> {
        let elem_name = decl.type_name.as_str();
        let array_name = format!("{elem_name}[]");

        match (resolved, count) {
            (Resolved::Builtin(id) | Resolved::Enum(id), ArrayCount::Fixed(count)) => {
                emitter.read_value(elem_name, *id);
                self.lower_expr(emitter, count)?;
                emitter.read_static_array_with_size(elem_name);
            }
            (Resolved::Builtin(id) | Resolved::Enum(id), ArrayCount::While(condition)) => {
                emitter.read_value(elem_name, *id);
                let head = emitter.label();
                emitter.place_label(head);
                self.lower_expr(emitter, condition)?;
                emitter.read_static_array(elem_name, head);
                emitter.resolve_label(head)?;
            }
            (Resolved::Struct, ArrayCount::Fixed(count)) => {
                self.lower_expr(emitter, count)?;
                emitter.read_dynamic_array_with_size(elem_name);
            }
            (Resolved::Struct, ArrayCount::While(condition)) => {
                let head = emitter.label();
                emitter.place_label(head);
                self.lower_expr(emitter, condition)?;
                emitter.read_dynamic_array(elem_name, head);
                emitter.resolve_label(head)?;
            }
        }

        emitter.store_value(&decl.name, &array_name);
        Ok(())
    }

    fn resolve_type(&self, name: &str, span: &Span) -> Result<Resolved, CompileError> {
        if let Some(id) = TypeId::from_keyword(name) {
            if id.is_builtin() {
                return Ok(Resolved::Builtin(id));
            }
            return Err(CompileError::new(
                span.clone(),
                format!("don't know how to emit `{name}` values"),
            ));
        }

        match self.types.get(name) {
            Some(DeclKind::Struct) => Ok(Resolved::Struct),
            Some(DeclKind::Enum { underlying, .. }) => Ok(Resolved::Enum(*underlying)),
            Some(DeclKind::Union) => Err(CompileError::new(
                span.clone(),
                "don't know how to emit union types",
            )),
            Some(DeclKind::Bitfield) => Err(CompileError::new(
                span.clone(),
                "don't know how to emit bitfield types",
            )),
            None => Err(CompileError::new(
                span.clone(),
                format!("unknown type `{name}`"),
            )),
        }
    }

    // --- expressions ------------------------------------------------------

    fn lower_expr(&self, emitter: &mut Emitter<'_>, expr: &Expr) -> Result<(), CompileError> {
        if let Some(value) = self.const_eval(expr) {
            return self.load_const(emitter, value, &expr.span());
        }

        match expr {
            Expr::Name(name, _) => {
                if emitter.flags.ctor {
                    emitter.load_from_this(name);
                } else {
                    emitter.load_local(name);
                }
                Ok(())
            }
            Expr::ScopeResolution { scope, name, span } => Err(CompileError::new(
                span.clone(),
                format!("unknown enum constant `{scope}::{name}`"),
            )),
            Expr::Unary { op, operand, span } => match op {
                UnaryOp::Not => {
                    self.lower_expr(emitter, operand)?;
                    emitter.not();
                    Ok(())
                }
                UnaryOp::Neg => Err(CompileError::new(
                    span.clone(),
                    "don't know how to emit non-constant negation",
                )),
            },
            Expr::Binary { op, lhs, rhs, span } => self.lower_binary(emitter, *op, lhs, rhs, span),
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
                ..
            } => {
                self.lower_expr(emitter, condition)?;

                let else_label = emitter.label();
                let end_label = emitter.label();
                emitter.cmp();
                emitter.jmp(else_label);

                self.lower_expr(emitter, then_expr)?;
                emitter.jmp(end_label);

                emitter.place_label(else_label);
                self.lower_expr(emitter, else_expr)?;
                emitter.place_label(end_label);

                emitter.resolve_label(else_label)?;
                emitter.resolve_label(end_label)?;
                Ok(())
            }
            // literals fold unless they overflow the folding domain
            Expr::Unsigned(value) => Err(CompileError::new(
                expr.span(),
                format!("integer literal {value} is out of range"),
            )),
            Expr::Bool(_) | Expr::Char(_) => unreachable!("bool and char literals always fold"),
        }
    }

    fn lower_binary(
        &self,
        emitter: &mut Emitter<'_>,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        span: &Span,
    ) -> Result<(), CompileError> {
        if op.is_comparison() {
            self.lower_expr(emitter, lhs)?;
            self.lower_expr(emitter, rhs)?;
            match op {
                BinaryOp::Eq => emitter.eq(),
                BinaryOp::Neq => emitter.neq(),
                BinaryOp::Lt => emitter.lt(),
                BinaryOp::Lte => emitter.lte(),
                BinaryOp::Gt => emitter.gt(),
                BinaryOp::Gte => emitter.gte(),
                _ => unreachable!(),
            }
            return Ok(());
        }

        match op {
            // left, dup, (not for or), cmp skips the jump past the right
            // operand; pop discards the left value before re-evaluating
            BinaryOp::And | BinaryOp::Or => {
                self.lower_expr(emitter, lhs)?;

                let end_label = emitter.label();
                emitter.dup();
                if op == BinaryOp::Or {
                    emitter.not();
                }
                emitter.cmp();
                emitter.jmp(end_label);
                emitter.pop();
                self.lower_expr(emitter, rhs)?;

                emitter.place_label(end_label);
                emitter.resolve_label(end_label)?;
                Ok(())
            }
            _ => Err(CompileError::new(
                span.clone(),
                "don't know how to emit arithmetic on non-constant operands",
            )),
        }
    }

    fn load_const(
        &self,
        emitter: &mut Emitter<'_>,
        value: i128,
        span: &Span,
    ) -> Result<(), CompileError> {
        let id = if value >= 0 {
            let value = u64::try_from(value).map_err(|_| {
                CompileError::new(span.clone(), format!("constant {value} is out of range"))
            })?;
            emitter.symbols().intern_unsigned(value)
        } else {
            let value = i64::try_from(value).map_err(|_| {
                CompileError::new(span.clone(), format!("constant {value} is out of range"))
            })?;
            emitter.symbols().intern_signed(value)
        };
        emitter.load_symbol(id);
        Ok(())
    }

    /// Compile-time evaluation; `None` when the expression depends on
    /// runtime state.
    fn const_eval(&self, expr: &Expr) -> Option<i128> {
        match expr {
            Expr::Unsigned(value) => i128::try_from(*value).ok(),
            Expr::Bool(value) => Some(*value as i128),
            Expr::Char(value) => Some(*value as u32 as i128),
            Expr::Name(..) => None,
            Expr::ScopeResolution { scope, name, .. } => match self.types.get(scope)? {
                DeclKind::Enum { constants, .. } => constants.get(name).copied(),
                _ => None,
            },
            Expr::Unary { op, operand, .. } => {
                let value = self.const_eval(operand)?;
                Some(match op {
                    UnaryOp::Neg => value.checked_neg()?,
                    UnaryOp::Not => (value == 0) as i128,
                })
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                let a = self.const_eval(lhs)?;
                let b = self.const_eval(rhs)?;
                Some(match op {
                    BinaryOp::Add => a.checked_add(b)?,
                    BinaryOp::Sub => a.checked_sub(b)?,
                    BinaryOp::Mul => a.checked_mul(b)?,
                    BinaryOp::Div => a.checked_div(b)?,
                    BinaryOp::Rem => a.checked_rem(b)?,
                    BinaryOp::Shl => a.checked_shl(u32::try_from(b).ok()?)?,
                    BinaryOp::Shr => a.checked_shr(u32::try_from(b).ok()?)?,
                    BinaryOp::BitAnd => a & b,
                    BinaryOp::BitOr => a | b,
                    BinaryOp::BitXor => a ^ b,
                    BinaryOp::Eq => (a == b) as i128,
                    BinaryOp::Neq => (a != b) as i128,
                    BinaryOp::Lt => (a < b) as i128,
                    BinaryOp::Lte => (a <= b) as i128,
                    BinaryOp::Gt => (a > b) as i128,
                    BinaryOp::Gte => (a >= b) as i128,
                    BinaryOp::And => ((a != 0) && (b != 0)) as i128,
                    BinaryOp::Or => ((a != 0) || (b != 0)) as i128,
                })
            }
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
                ..
            } => {
                if self.const_eval(condition)? != 0 {
                    self.const_eval(then_expr)
                } else {
                    self.const_eval(else_expr)
                }
            }
        }
    }
}
