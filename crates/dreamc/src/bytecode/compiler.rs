//! Lowers proc bodies to stack bytecode.
//!
//! Every expression leaves exactly one value on the stack; statement
//! context pops it. Every statement nets zero. Control-flow merges assert
//! equal depths on all incoming edges; a mismatch, an unresolvable name,
//! or an unsupported construct abandons the proc, which keeps an empty
//! bytecode while compilation continues.

use std::fmt;

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    ast::{AssignOp, BinaryOp, CallArg, Expr, ExprKind, ForList, Stmt, StmtKind, SwitchValue, UnaryOp},
    diagnostics::{Diagnostics, WarningCode},
    intern::StringTable,
    location::Location,
    objtree::{ObjectTree, SourceInfo, TypeId},
    path::DreamPath,
};

use super::{
    builder::{CodeBuilder, JumpLabel},
    op::Opcode,
};

/// Why a proc was abandoned during emission.
#[derive(Debug)]
pub enum EmitError {
    UnknownIdentifier(String, Location),
    UnknownProc(String, Location),
    UnknownType(String, Location),
    UnknownLabel(String, Location),
    StackImbalance(Location),
    Unsupported(&'static str, Location),
}

impl EmitError {
    #[must_use]
    pub fn location(&self) -> Location {
        match self {
            Self::UnknownIdentifier(_, loc)
            | Self::UnknownProc(_, loc)
            | Self::UnknownType(_, loc)
            | Self::UnknownLabel(_, loc)
            | Self::StackImbalance(loc)
            | Self::Unsupported(_, loc) => *loc,
        }
    }
}

impl fmt::Display for EmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownIdentifier(name, _) => write!(f, "Unknown variable \"{name}\""),
            Self::UnknownProc(name, _) => write!(f, "Unknown proc \"{name}\""),
            Self::UnknownType(path, _) => write!(f, "Unknown type \"{path}\""),
            Self::UnknownLabel(name, _) => write!(f, "Unknown label \"{name}\""),
            Self::StackImbalance(_) => write!(f, "Internal stack depth imbalance"),
            Self::Unsupported(what, _) => write!(f, "Unsupported construct: {what}"),
        }
    }
}

type EmitResult<T = ()> = Result<T, EmitError>;

struct LoopContext {
    break_labels: Vec<JumpLabel>,
    continue_labels: Vec<JumpLabel>,
    continue_target: Option<usize>,
}

/// How a store obtains the value it writes.
enum StoreRhs<'e> {
    Plain(&'e Expr),
    Compound(AssignOp, &'e Expr),
    IncDec { delta: Opcode, post: bool },
}

/// Compiles one proc body into bytecode.
pub struct ProcCompiler<'a> {
    diag: &'a mut Diagnostics,
    tree: &'a ObjectTree,
    strings: &'a mut StringTable,
    resources: &'a mut StringTable,
    owner: TypeId,
    proc_name: String,
    builder: CodeBuilder,
    locals: IndexMap<String, u8>,
    loops: Vec<LoopContext>,
    labels: AHashMap<String, usize>,
    gotos: Vec<(String, JumpLabel, Location)>,
}

impl<'a> ProcCompiler<'a> {
    pub fn new(
        diag: &'a mut Diagnostics,
        tree: &'a ObjectTree,
        strings: &'a mut StringTable,
        resources: &'a mut StringTable,
        owner: TypeId,
        proc_name: &str,
    ) -> Self {
        Self {
            diag,
            tree,
            strings,
            resources,
            owner,
            proc_name: proc_name.to_owned(),
            builder: CodeBuilder::new(),
            locals: IndexMap::new(),
            loops: Vec::new(),
            labels: AHashMap::new(),
            gotos: Vec::new(),
        }
    }

    /// Compiles the body with the given parameter names bound to the first
    /// local slots.
    pub fn compile(
        mut self,
        parameters: &[(String, Option<Expr>)],
        body: &[Stmt],
        loc: Location,
    ) -> EmitResult<(Vec<u8>, u16, Vec<SourceInfo>)> {
        self.builder.set_line(loc.line);
        for (name, _) in parameters {
            self.declare_local(name, loc)?;
        }
        for (index, (_, default)) in parameters.iter().enumerate() {
            if let Some(default) = default {
                self.emit_param_default(u8::try_from(index).unwrap_or(u8::MAX), default)?;
            }
        }
        self.emit_block(body)?;

        // Implicit `return .` at the end of the body.
        self.builder.emit(Opcode::PushDot);
        self.builder.emit(Opcode::Return);

        let gotos = std::mem::take(&mut self.gotos);
        for (name, label, loc) in gotos {
            match self.labels.get(&name) {
                Some(&target) => self.builder.patch_jump_to(label, target),
                None => return Err(EmitError::UnknownLabel(name, loc)),
            }
        }

        if self.builder.underflowed() {
            return Err(EmitError::StackImbalance(loc));
        }
        Ok(self.builder.build())
    }

    /// Null parameters take their declared default on entry.
    fn emit_param_default(&mut self, slot: u8, default: &Expr) -> EmitResult {
        self.builder.emit_u8(Opcode::GetLocal, slot);
        let assign = self.builder.emit_jump(Opcode::JumpIfNull);
        self.builder.emit(Opcode::Pop);
        let end = self.builder.emit_jump(Opcode::Jump);
        self.builder.patch_jump(assign);
        self.builder.set_stack_depth(1);
        self.builder.emit(Opcode::Pop);
        self.emit_expr(default)?;
        self.builder.emit_u8(Opcode::SetLocal, slot);
        self.builder.emit(Opcode::Pop);
        self.builder.patch_jump(end);
        self.builder.set_stack_depth(0);
        Ok(())
    }

    fn declare_local(&mut self, name: &str, loc: Location) -> EmitResult<u8> {
        if let Some(&slot) = self.locals.get(name) {
            self.diag.emit(
                WarningCode::DuplicateVariable,
                loc,
                format!("Duplicate local variable \"{name}\""),
            );
            return Ok(slot);
        }
        let slot = u8::try_from(self.locals.len()).map_err(|_| EmitError::Unsupported("too many locals", loc))?;
        self.locals.insert(name.to_owned(), slot);
        Ok(slot)
    }

    // ------------------------------------------------------------------
    // Statements

    fn emit_block(&mut self, statements: &[Stmt]) -> EmitResult {
        for statement in statements {
            self.emit_stmt(statement)?;
        }
        Ok(())
    }

    fn emit_stmt(&mut self, statement: &Stmt) -> EmitResult {
        self.builder.set_line(statement.loc.line);
        let depth = self.builder.stack_depth();
        self.emit_stmt_inner(statement)?;
        if self.builder.stack_depth() != depth || self.builder.underflowed() {
            return Err(EmitError::StackImbalance(statement.loc));
        }
        Ok(())
    }

    fn emit_stmt_inner(&mut self, statement: &Stmt) -> EmitResult {
        let loc = statement.loc;
        match &statement.kind {
            StmtKind::Expr(expr) => {
                self.emit_expr(expr)?;
                self.builder.emit(Opcode::Pop);
                Ok(())
            }
            StmtKind::VarDecls(decls) => {
                for decl in decls {
                    let slot = self.declare_local(&decl.name, loc)?;
                    match &decl.value {
                        Some(value) => self.emit_expr(value)?,
                        None => self.builder.emit(Opcode::PushNull),
                    }
                    self.builder.emit_u8(Opcode::SetLocal, slot);
                    self.builder.emit(Opcode::Pop);
                }
                Ok(())
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                self.emit_expr(cond)?;
                let else_label = self.builder.emit_jump(Opcode::JumpIfFalse);
                self.emit_block(then_body)?;
                match else_body {
                    Some(else_body) => {
                        let end = self.builder.emit_jump(Opcode::Jump);
                        self.builder.patch_jump(else_label);
                        self.emit_block(else_body)?;
                        self.builder.patch_jump(end);
                    }
                    None => self.builder.patch_jump(else_label),
                }
                Ok(())
            }
            StmtKind::While { cond, body } => {
                let header = self.builder.current_offset();
                self.emit_expr(cond)?;
                let end = self.builder.emit_jump(Opcode::JumpIfFalse);
                self.loops.push(LoopContext {
                    break_labels: Vec::new(),
                    continue_labels: Vec::new(),
                    continue_target: Some(header),
                });
                self.emit_block(body)?;
                let ctx = self.loops.pop().expect("loop context pushed above");
                self.builder.emit_jump_to(Opcode::Jump, header);
                self.builder.patch_jump(end);
                for label in ctx.break_labels {
                    self.builder.patch_jump(label);
                }
                Ok(())
            }
            StmtKind::DoWhile { body, cond } => {
                let start = self.builder.current_offset();
                self.loops.push(LoopContext {
                    break_labels: Vec::new(),
                    continue_labels: Vec::new(),
                    continue_target: None,
                });
                self.emit_block(body)?;
                let ctx = self.loops.pop().expect("loop context pushed above");
                for label in ctx.continue_labels {
                    self.builder.patch_jump(label);
                }
                self.emit_expr(cond)?;
                self.builder.emit_jump_to(Opcode::JumpIfTrue, start);
                for label in ctx.break_labels {
                    self.builder.patch_jump(label);
                }
                Ok(())
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(init) = init {
                    self.emit_stmt(init)?;
                }
                let header = self.builder.current_offset();
                let end = match cond {
                    Some(cond) => {
                        self.emit_expr(cond)?;
                        Some(self.builder.emit_jump(Opcode::JumpIfFalse))
                    }
                    None => None,
                };
                self.loops.push(LoopContext {
                    break_labels: Vec::new(),
                    continue_labels: Vec::new(),
                    continue_target: None,
                });
                self.emit_block(body)?;
                let ctx = self.loops.pop().expect("loop context pushed above");
                for label in ctx.continue_labels {
                    self.builder.patch_jump(label);
                }
                if let Some(step) = step {
                    self.emit_stmt(step)?;
                }
                self.builder.emit_jump_to(Opcode::Jump, header);
                if let Some(end) = end {
                    self.builder.patch_jump(end);
                }
                for label in ctx.break_labels {
                    self.builder.patch_jump(label);
                }
                Ok(())
            }
            StmtKind::ForIn { decl, var, list, body } => match list {
                ForList::Expr(list) => self.emit_for_in_list(decl.as_ref(), var, list, body, loc),
                ForList::Range { start, end, step } => {
                    self.emit_for_in_range(decl.as_ref(), var, start, end, step.as_ref(), body, loc)
                }
            },
            StmtKind::Switch {
                subject,
                cases,
                default,
            } => self.emit_switch(subject, cases, default.as_deref(), loc),
            StmtKind::Spawn { delay, body } => {
                match delay {
                    Some(delay) => self.emit_expr(delay)?,
                    None => self.builder.emit_float(0.0),
                }
                let parent = self.builder.emit_jump(Opcode::Spawn);
                self.emit_block(body)?;
                self.builder.emit(Opcode::PushNull);
                self.builder.emit(Opcode::Return);
                self.builder.patch_jump(parent);
                Ok(())
            }
            StmtKind::TryCatch {
                try_body,
                catch_var,
                catch_body,
            } => {
                let slot = match catch_var {
                    Some(name) => self.declare_local(name, loc)?,
                    None => 0xFF,
                };
                let depth = self.builder.stack_depth();
                let handler = self.builder.emit_setup_try(slot);
                self.emit_block(try_body)?;
                self.builder.emit(Opcode::EndTryCatch);
                let end = self.builder.emit_jump(Opcode::Jump);
                self.builder.patch_jump(handler);
                self.builder.set_stack_depth(depth);
                self.emit_block(catch_body)?;
                self.builder.patch_jump(end);
                Ok(())
            }
            StmtKind::Throw(value) => {
                self.emit_expr(value)?;
                self.builder.emit(Opcode::Throw);
                Ok(())
            }
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.emit_expr(value)?,
                    None => self.builder.emit(Opcode::PushDot),
                }
                self.builder.emit(Opcode::Return);
                Ok(())
            }
            StmtKind::Break(_) => {
                let Some(ctx) = self.loops.last_mut() else {
                    return Err(EmitError::Unsupported("break outside of a loop", loc));
                };
                let label = self.builder.emit_jump(Opcode::Jump);
                ctx.break_labels.push(label);
                Ok(())
            }
            StmtKind::Continue(_) => {
                let Some(ctx) = self.loops.last() else {
                    return Err(EmitError::Unsupported("continue outside of a loop", loc));
                };
                match ctx.continue_target {
                    Some(target) => self.builder.emit_jump_to(Opcode::Jump, target),
                    None => {
                        let label = self.builder.emit_jump(Opcode::Jump);
                        self.loops
                            .last_mut()
                            .expect("loop context checked above")
                            .continue_labels
                            .push(label);
                    }
                }
                Ok(())
            }
            StmtKind::Goto(name) => {
                let label = self.builder.emit_jump(Opcode::Jump);
                self.gotos.push((name.clone(), label, loc));
                Ok(())
            }
            StmtKind::Label { name, body } => {
                if self.labels.insert(name.clone(), self.builder.current_offset()).is_some() {
                    self.diag
                        .emit(WarningCode::BadStatement, loc, format!("Duplicate label \"{name}\""));
                }
                self.emit_block(body)
            }
            StmtKind::Del(value) => {
                self.emit_expr(value)?;
                self.builder.emit(Opcode::DeleteObject);
                Ok(())
            }
            // Verb metadata, consumed by the code-tree builder.
            StmtKind::Set { .. } => Ok(()),
            StmtKind::ObjectDef { .. }
            | StmtKind::VarDef { .. }
            | StmtKind::VarOverride { .. }
            | StmtKind::ProcDef { .. } => Err(EmitError::Unsupported("definition inside a proc body", loc)),
        }
    }

    fn emit_for_in_list(
        &mut self,
        decl: Option<&crate::ast::LocalVarDecl>,
        var: &str,
        list: &Expr,
        body: &[Stmt],
        loc: Location,
    ) -> EmitResult {
        let slot = match decl {
            Some(decl) => self.declare_local(&decl.name, loc)?,
            None => self.resolve_or_declare_local(var, loc)?,
        };
        self.emit_expr(list)?;
        self.builder.emit(Opcode::CreateIterator);
        let start = self.builder.current_offset();
        let exhausted = self.builder.emit_jump(Opcode::Iterate);
        self.builder.emit_u8(Opcode::SetLocal, slot);
        self.builder.emit(Opcode::Pop);
        self.loops.push(LoopContext {
            break_labels: Vec::new(),
            continue_labels: Vec::new(),
            continue_target: Some(start),
        });
        self.emit_block(body)?;
        let ctx = self.loops.pop().expect("loop context pushed above");
        self.builder.emit_jump_to(Opcode::Jump, start);
        self.builder.patch_jump(exhausted);
        for label in ctx.break_labels {
            self.builder.patch_jump(label);
        }
        self.builder.emit(Opcode::Pop);
        Ok(())
    }

    #[expect(clippy::too_many_arguments, reason = "range loops carry every component")]
    fn emit_for_in_range(
        &mut self,
        decl: Option<&crate::ast::LocalVarDecl>,
        var: &str,
        start: &Expr,
        end: &Expr,
        step: Option<&Expr>,
        body: &[Stmt],
        loc: Location,
    ) -> EmitResult {
        let slot = match decl {
            Some(decl) => self.declare_local(&decl.name, loc)?,
            None => self.resolve_or_declare_local(var, loc)?,
        };
        self.emit_expr(start)?;
        self.builder.emit_u8(Opcode::SetLocal, slot);
        self.builder.emit(Opcode::Pop);

        let header = self.builder.current_offset();
        self.builder.emit_u8(Opcode::GetLocal, slot);
        self.emit_expr(end)?;
        self.builder.emit(Opcode::CompareLessOrEqual);
        let done = self.builder.emit_jump(Opcode::JumpIfFalse);

        self.loops.push(LoopContext {
            break_labels: Vec::new(),
            continue_labels: Vec::new(),
            continue_target: None,
        });
        self.emit_block(body)?;
        let ctx = self.loops.pop().expect("loop context pushed above");
        for label in ctx.continue_labels {
            self.builder.patch_jump(label);
        }

        self.builder.emit_u8(Opcode::GetLocal, slot);
        match step {
            Some(step) => self.emit_expr(step)?,
            None => self.builder.emit_int(1),
        }
        self.builder.emit(Opcode::Add);
        self.builder.emit_u8(Opcode::SetLocal, slot);
        self.builder.emit(Opcode::Pop);
        self.builder.emit_jump_to(Opcode::Jump, header);

        self.builder.patch_jump(done);
        for label in ctx.break_labels {
            self.builder.patch_jump(label);
        }
        Ok(())
    }

    fn emit_switch(
        &mut self,
        subject: &Expr,
        cases: &[crate::ast::SwitchCase],
        default: Option<&[Stmt]>,
        _loc: Location,
    ) -> EmitResult {
        let depth = self.builder.stack_depth();
        self.emit_expr(subject)?;

        let mut case_labels: Vec<Vec<JumpLabel>> = Vec::with_capacity(cases.len());
        for case in cases {
            let mut labels = Vec::with_capacity(case.values.len());
            for value in &case.values {
                self.builder.emit(Opcode::Dup);
                match value {
                    SwitchValue::Exact(expr) => {
                        self.emit_expr(expr)?;
                        self.builder.emit(Opcode::CompareEquals);
                    }
                    SwitchValue::Range(lo, hi) => {
                        self.emit_expr(lo)?;
                        self.emit_expr(hi)?;
                        self.builder.emit(Opcode::CompareInRange);
                    }
                }
                labels.push(self.builder.emit_jump(Opcode::JumpIfTrue));
            }
            case_labels.push(labels);
        }

        // No case matched: drop the subject and run the default.
        self.builder.emit(Opcode::Pop);
        let mut end_labels = Vec::new();
        if let Some(default) = default {
            self.emit_block(default)?;
        }
        end_labels.push(self.builder.emit_jump(Opcode::Jump));

        for (case, labels) in cases.iter().zip(case_labels) {
            for label in labels {
                self.builder.patch_jump(label);
            }
            self.builder.set_stack_depth(depth + 1);
            self.builder.emit(Opcode::Pop);
            self.emit_block(&case.body)?;
            end_labels.push(self.builder.emit_jump(Opcode::Jump));
        }

        for label in end_labels {
            self.builder.patch_jump(label);
        }
        self.builder.set_stack_depth(depth);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Expressions

    fn emit_expr(&mut self, expr: &Expr) -> EmitResult {
        let loc = expr.loc;
        match &expr.kind {
            ExprKind::Null => {
                self.builder.emit(Opcode::PushNull);
                Ok(())
            }
            ExprKind::Int(value) => {
                match i32::try_from(*value) {
                    Ok(value) => self.builder.emit_int(value),
                    Err(_) => self.builder.emit_float(*value as f32),
                }
                Ok(())
            }
            ExprKind::Float(value) => {
                self.builder.emit_float(*value as f32);
                Ok(())
            }
            ExprKind::Str(value) => {
                let id = self.strings.intern(value);
                self.builder.emit_u32(Opcode::PushString, id.raw());
                Ok(())
            }
            ExprKind::Resource(path) => {
                let id = self.resources.intern(path);
                self.builder.emit_u32(Opcode::PushResource, id.raw());
                Ok(())
            }
            ExprKind::Path(path) => {
                let Some(type_id) = self.tree.resolve_type(path, Some(self.owner)) else {
                    return Err(EmitError::UnknownType(path.to_string(), loc));
                };
                self.builder.emit_u32(Opcode::PushPath, type_id.raw());
                Ok(())
            }
            ExprKind::FormatStr { parts, exprs } => {
                for inner in exprs {
                    self.emit_expr(inner)?;
                }
                let text = parts.join("\u{1}");
                let id = self.strings.intern(&text);
                let count = u8::try_from(exprs.len()).map_err(|_| EmitError::Unsupported("format string slots", loc))?;
                self.builder.emit_call(Opcode::FormatString, id.raw(), count);
                Ok(())
            }
            ExprKind::Ident(name) => self.emit_ident_load(name, loc),
            ExprKind::DotValue => {
                self.builder.emit(Opcode::PushDot);
                Ok(())
            }
            ExprKind::ParentCall(args) => {
                let count = self.emit_args(args)?;
                self.builder.emit_call_u8(Opcode::CallParent, count);
                Ok(())
            }
            ExprKind::SelfCall(args) => {
                let count = self.emit_args(args)?;
                let name = self.proc_name.clone();
                let id = self.strings.intern(&name);
                self.builder.emit_call(Opcode::CallOwn, id.raw(), count);
                Ok(())
            }
            ExprKind::Binary { op, lhs, rhs } => self.emit_binary(*op, lhs, rhs),
            ExprKind::Assign { op, target, value } => self.emit_store(target, &StoreRhs::from_assign(*op, value), loc),
            ExprKind::Unary { op, operand } => {
                self.emit_expr(operand)?;
                self.builder.emit(match op {
                    UnaryOp::Neg => Opcode::Negate,
                    UnaryOp::Not => Opcode::BooleanNot,
                    UnaryOp::BitNot => Opcode::BitNot,
                });
                Ok(())
            }
            ExprKind::PreIncrement(target) => self.emit_store(
                target,
                &StoreRhs::IncDec {
                    delta: Opcode::Add,
                    post: false,
                },
                loc,
            ),
            ExprKind::PostIncrement(target) => self.emit_store(
                target,
                &StoreRhs::IncDec {
                    delta: Opcode::Add,
                    post: true,
                },
                loc,
            ),
            ExprKind::PreDecrement(target) => self.emit_store(
                target,
                &StoreRhs::IncDec {
                    delta: Opcode::Subtract,
                    post: false,
                },
                loc,
            ),
            ExprKind::PostDecrement(target) => self.emit_store(
                target,
                &StoreRhs::IncDec {
                    delta: Opcode::Subtract,
                    post: true,
                },
                loc,
            ),
            ExprKind::Ternary {
                cond,
                then,
                otherwise,
            } => {
                let depth = self.builder.stack_depth();
                self.emit_expr(cond)?;
                let else_label = self.builder.emit_jump(Opcode::JumpIfFalse);
                self.emit_expr(then)?;
                let end = self.builder.emit_jump(Opcode::Jump);
                self.builder.patch_jump(else_label);
                self.builder.set_stack_depth(depth);
                self.emit_expr(otherwise)?;
                self.builder.patch_jump(end);
                Ok(())
            }
            ExprKind::Deref { object, op, field } => {
                self.emit_expr(object)?;
                let id = self.strings.intern(field);
                if op.is_safe() {
                    let skip = self.builder.emit_jump(Opcode::JumpIfNull);
                    self.builder.emit_u32(Opcode::GetField, id.raw());
                    self.builder.patch_jump(skip);
                } else {
                    self.builder.emit_u32(Opcode::GetField, id.raw());
                }
                Ok(())
            }
            ExprKind::Index { object, index, safe } => {
                self.emit_expr(object)?;
                if *safe {
                    let skip = self.builder.emit_jump(Opcode::JumpIfNull);
                    self.emit_expr(index)?;
                    self.builder.emit(Opcode::GetIndex);
                    self.builder.patch_jump(skip);
                } else {
                    self.emit_expr(index)?;
                    self.builder.emit(Opcode::GetIndex);
                }
                Ok(())
            }
            ExprKind::Call { callee, args } => self.emit_call(callee, args, loc),
            ExprKind::New { type_expr, args } => self.emit_new(type_expr.as_deref(), args, loc),
        }
    }

    fn emit_binary(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> EmitResult {
        match op {
            BinaryOp::And | BinaryOp::Or => {
                self.emit_expr(lhs)?;
                self.builder.emit(Opcode::Dup);
                let jump_op = if op == BinaryOp::And {
                    Opcode::JumpIfFalse
                } else {
                    Opcode::JumpIfTrue
                };
                let end = self.builder.emit_jump(jump_op);
                self.builder.emit(Opcode::Pop);
                self.emit_expr(rhs)?;
                self.builder.patch_jump(end);
                Ok(())
            }
            BinaryOp::In => {
                self.emit_expr(lhs)?;
                self.emit_expr(rhs)?;
                self.builder.emit(Opcode::IsInList);
                Ok(())
            }
            _ => {
                self.emit_expr(lhs)?;
                self.emit_expr(rhs)?;
                self.builder.emit(binary_opcode(op));
                Ok(())
            }
        }
    }

    fn emit_args(&mut self, args: &[CallArg]) -> EmitResult<u8> {
        for arg in args {
            self.emit_expr(&arg.value)?;
        }
        u8::try_from(args.len()).map_err(|_| {
            EmitError::Unsupported(
                "too many call arguments",
                args.last().map_or(Location::INTERNAL, |a| a.value.loc),
            )
        })
    }

    fn emit_call(&mut self, callee: &Expr, args: &[CallArg], loc: Location) -> EmitResult {
        match &callee.kind {
            ExprKind::Ident(name) => {
                if self.tree.proc_in_chain(self.owner, name).is_some() {
                    let count = self.emit_args(args)?;
                    let id = self.strings.intern(name);
                    self.builder.emit_call(Opcode::CallOwn, id.raw(), count);
                    return Ok(());
                }
                if let Some(proc_id) = self.tree.global_proc(name) {
                    let count = self.emit_args(args)?;
                    self.builder.emit_call(Opcode::CallGlobal, proc_id.raw(), count);
                    return Ok(());
                }
                Err(EmitError::UnknownProc(name.clone(), loc))
            }
            ExprKind::Deref { object, op, field } => {
                self.emit_expr(object)?;
                let id = self.strings.intern(field);
                if op.is_safe() {
                    let skip = self.builder.emit_jump(Opcode::JumpIfNull);
                    let count = self.emit_args(args)?;
                    self.builder.emit_call(Opcode::CallMethod, id.raw(), count);
                    self.builder.patch_jump(skip);
                } else {
                    let count = self.emit_args(args)?;
                    self.builder.emit_call(Opcode::CallMethod, id.raw(), count);
                }
                Ok(())
            }
            _ => Err(EmitError::Unsupported("call target", loc)),
        }
    }

    fn emit_new(&mut self, type_expr: Option<&Expr>, args: &[CallArg], loc: Location) -> EmitResult {
        match type_expr {
            Some(Expr {
                kind: ExprKind::Path(path),
                ..
            }) => {
                let Some(type_id) = self.tree.resolve_type(path, Some(self.owner)) else {
                    return Err(EmitError::UnknownType(path.to_string(), loc));
                };
                let count = self.emit_args(args)?;
                self.builder.emit_call(Opcode::CreateObject, type_id.raw(), count);
                Ok(())
            }
            Some(Expr {
                kind: ExprKind::Ident(name),
                ..
            }) => {
                // A bare name may be a type or a variable holding one.
                if let Some(type_id) = self.tree.resolve_type(&DreamPath::relative([name.clone()]), Some(self.owner)) {
                    let count = self.emit_args(args)?;
                    self.builder.emit_call(Opcode::CreateObject, type_id.raw(), count);
                    return Ok(());
                }
                self.emit_ident_load(name, loc)?;
                let count = self.emit_args(args)?;
                self.builder.emit_call_u8(Opcode::CreateObjectDynamic, count);
                Ok(())
            }
            Some(other) => {
                self.emit_expr(other)?;
                let count = self.emit_args(args)?;
                self.builder.emit_call_u8(Opcode::CreateObjectDynamic, count);
                Ok(())
            }
            None => {
                // Type inferred by the runtime from the destination.
                self.builder.emit(Opcode::PushNull);
                let count = self.emit_args(args)?;
                self.builder.emit_call_u8(Opcode::CreateObjectDynamic, count);
                Ok(())
            }
        }
    }

    /// Loads an identifier: locals, then owner-chain fields, then globals.
    fn emit_ident_load(&mut self, name: &str, loc: Location) -> EmitResult {
        match name {
            "src" => {
                self.builder.emit(Opcode::PushSelf);
                return Ok(());
            }
            "usr" => {
                self.builder.emit(Opcode::PushUsr);
                return Ok(());
            }
            "world" => {
                self.builder.emit(Opcode::PushWorld);
                return Ok(());
            }
            _ => {}
        }
        if let Some(&slot) = self.locals.get(name) {
            self.builder.emit_u8(Opcode::GetLocal, slot);
            return Ok(());
        }
        if self.tree.var_in_chain(self.owner, name).is_some() {
            let id = self.strings.intern(name);
            self.builder.emit(Opcode::PushSelf);
            self.builder.emit_u32(Opcode::GetField, id.raw());
            return Ok(());
        }
        if let Some(index) = self.tree.global_index(name) {
            let index = u32::try_from(index).map_err(|_| EmitError::Unsupported("global index", loc))?;
            self.builder.emit_u32(Opcode::GetGlobal, index);
            return Ok(());
        }
        Err(EmitError::UnknownIdentifier(name.to_owned(), loc))
    }

    fn resolve_or_declare_local(&mut self, name: &str, loc: Location) -> EmitResult<u8> {
        if let Some(&slot) = self.locals.get(name) {
            return Ok(slot);
        }
        let slot = u8::try_from(self.locals.len()).map_err(|_| EmitError::Unsupported("too many locals", loc))?;
        self.locals.insert(name.to_owned(), slot);
        Ok(slot)
    }

    // ------------------------------------------------------------------
    // Stores

    /// Emits an assignment-family expression, leaving the resulting value
    /// (the old value for postfix forms) on the stack.
    fn emit_store(&mut self, target: &Expr, rhs: &StoreRhs<'_>, loc: Location) -> EmitResult {
        match &target.kind {
            ExprKind::Ident(name) => {
                if let Some(&slot) = self.locals.get(name) {
                    return self.emit_slot_store(Opcode::GetLocal, Opcode::SetLocal, u32::from(slot), rhs);
                }
                if let Some((_, variable)) = self.tree.var_in_chain(self.owner, name) {
                    if variable.is_const {
                        self.diag.emit(
                            WarningCode::WriteToConstant,
                            loc,
                            format!("Cannot write to constant variable \"{name}\""),
                        );
                    }
                    let id = self.strings.intern(name);
                    return self.emit_field_store(None, id.raw(), rhs);
                }
                if let Some(index) = self.tree.global_index(name) {
                    if self.tree.globals[index].is_const {
                        self.diag.emit(
                            WarningCode::WriteToConstant,
                            loc,
                            format!("Cannot write to constant variable \"{name}\""),
                        );
                    }
                    let index = u32::try_from(index).map_err(|_| EmitError::Unsupported("global index", loc))?;
                    return self.emit_slot_store(Opcode::GetGlobal, Opcode::SetGlobal, index, rhs);
                }
                Err(EmitError::UnknownIdentifier(name.clone(), loc))
            }
            ExprKind::DotValue => self.emit_slot_store(Opcode::PushDot, Opcode::SetDot, u32::MAX, rhs),
            ExprKind::Deref { object, field, .. } => {
                let id = self.strings.intern(field);
                self.emit_field_store(Some(object), id.raw(), rhs)
            }
            ExprKind::Index { object, index, .. } => self.emit_index_store(object, index, rhs),
            _ => Err(EmitError::Unsupported("assignment target", loc)),
        }
    }

    /// Store family for slot-addressed storage (locals, globals, `.`).
    /// `SetLocal`/`SetGlobal`/`SetDot` peek the stored value, so the result
    /// stays on the stack.
    fn emit_slot_store(&mut self, get: Opcode, set: Opcode, slot: u32, rhs: &StoreRhs<'_>) -> EmitResult {
        let emit_get = |builder: &mut CodeBuilder| match get {
            Opcode::GetLocal => builder.emit_u8(Opcode::GetLocal, slot as u8),
            Opcode::GetGlobal => builder.emit_u32(Opcode::GetGlobal, slot),
            _ => builder.emit(Opcode::PushDot),
        };
        let emit_set = |builder: &mut CodeBuilder| match set {
            Opcode::SetLocal => builder.emit_u8(Opcode::SetLocal, slot as u8),
            Opcode::SetGlobal => builder.emit_u32(Opcode::SetGlobal, slot),
            _ => builder.emit(Opcode::SetDot),
        };
        match rhs {
            StoreRhs::Plain(value) => {
                self.emit_expr(value)?;
                emit_set(&mut self.builder);
            }
            StoreRhs::Compound(op, value) => {
                emit_get(&mut self.builder);
                self.emit_compound_value(*op, value)?;
                emit_set(&mut self.builder);
            }
            StoreRhs::IncDec { delta, post: false } => {
                emit_get(&mut self.builder);
                self.builder.emit_int(1);
                self.builder.emit(*delta);
                emit_set(&mut self.builder);
            }
            StoreRhs::IncDec { delta, post: true } => {
                emit_get(&mut self.builder);
                self.builder.emit(Opcode::Dup);
                self.builder.emit_int(1);
                self.builder.emit(*delta);
                emit_set(&mut self.builder);
                self.builder.emit(Opcode::Pop);
            }
        }
        Ok(())
    }

    /// Store family for fields. `receiver` of `None` means the implicit
    /// `src`.
    fn emit_field_store(&mut self, receiver: Option<&Expr>, field_id: u32, rhs: &StoreRhs<'_>) -> EmitResult {
        let emit_receiver = |this: &mut Self| -> EmitResult {
            match receiver {
                Some(object) => this.emit_expr(object),
                None => {
                    this.builder.emit(Opcode::PushSelf);
                    Ok(())
                }
            }
        };
        match rhs {
            StoreRhs::Plain(value) => {
                emit_receiver(self)?;
                self.emit_expr(value)?;
                self.builder.emit_u32(Opcode::SetField, field_id);
            }
            StoreRhs::Compound(op, value) => {
                emit_receiver(self)?;
                self.builder.emit(Opcode::Dup);
                self.builder.emit_u32(Opcode::GetField, field_id);
                self.emit_compound_value(*op, value)?;
                self.builder.emit_u32(Opcode::SetField, field_id);
            }
            StoreRhs::IncDec { delta, post: false } => {
                emit_receiver(self)?;
                self.builder.emit(Opcode::Dup);
                self.builder.emit_u32(Opcode::GetField, field_id);
                self.builder.emit_int(1);
                self.builder.emit(*delta);
                self.builder.emit_u32(Opcode::SetField, field_id);
            }
            StoreRhs::IncDec { delta, post: true } => {
                // Leaves the old value under the receiver for the store.
                emit_receiver(self)?;
                self.builder.emit(Opcode::Dup);
                self.builder.emit_u32(Opcode::GetField, field_id);
                self.builder.emit(Opcode::Swap);
                self.builder.emit(Opcode::Dup);
                self.builder.emit_u32(Opcode::GetField, field_id);
                self.builder.emit_int(1);
                self.builder.emit(*delta);
                self.builder.emit_u32(Opcode::SetField, field_id);
                self.builder.emit(Opcode::Pop);
            }
        }
        Ok(())
    }

    fn emit_index_store(&mut self, object: &Expr, index: &Expr, rhs: &StoreRhs<'_>) -> EmitResult {
        match rhs {
            StoreRhs::Plain(value) => {
                self.emit_expr(object)?;
                self.emit_expr(index)?;
                self.emit_expr(value)?;
                self.builder.emit(Opcode::SetIndex);
            }
            StoreRhs::Compound(op, value) => {
                self.emit_expr(object)?;
                self.emit_expr(index)?;
                self.builder.emit(Opcode::Dup2);
                self.builder.emit(Opcode::GetIndex);
                self.emit_compound_value(*op, value)?;
                self.builder.emit(Opcode::SetIndex);
            }
            StoreRhs::IncDec { delta, post: false } => {
                self.emit_expr(object)?;
                self.emit_expr(index)?;
                self.builder.emit(Opcode::Dup2);
                self.builder.emit(Opcode::GetIndex);
                self.builder.emit_int(1);
                self.builder.emit(*delta);
                self.builder.emit(Opcode::SetIndex);
            }
            StoreRhs::IncDec { delta, post: true } => {
                // The old value is fetched first; the receiver pair is
                // re-evaluated for the store.
                self.emit_expr(object)?;
                self.emit_expr(index)?;
                self.builder.emit(Opcode::GetIndex);
                self.emit_expr(object)?;
                self.emit_expr(index)?;
                self.builder.emit(Opcode::Dup2);
                self.builder.emit(Opcode::GetIndex);
                self.builder.emit_int(1);
                self.builder.emit(*delta);
                self.builder.emit(Opcode::SetIndex);
                self.builder.emit(Opcode::Pop);
            }
        }
        Ok(())
    }

    /// With the current value on the stack, combines it with `value`
    /// according to the compound operator, leaving the new value.
    fn emit_compound_value(&mut self, op: AssignOp, value: &Expr) -> EmitResult {
        match op {
            AssignOp::And | AssignOp::Or => {
                self.builder.emit(Opcode::Dup);
                let jump_op = if op == AssignOp::And {
                    Opcode::JumpIfFalse
                } else {
                    Opcode::JumpIfTrue
                };
                let end = self.builder.emit_jump(jump_op);
                self.builder.emit(Opcode::Pop);
                self.emit_expr(value)?;
                self.builder.patch_jump(end);
                Ok(())
            }
            _ => {
                self.emit_expr(value)?;
                self.builder.emit(match op {
                    AssignOp::Add => Opcode::Add,
                    AssignOp::Sub => Opcode::Subtract,
                    AssignOp::Mul => Opcode::Multiply,
                    AssignOp::Div => Opcode::Divide,
                    AssignOp::Mod => Opcode::Modulus,
                    AssignOp::FloatMod => Opcode::ModulusModulus,
                    AssignOp::BitAnd => Opcode::BitAnd,
                    AssignOp::BitOr => Opcode::BitOr,
                    AssignOp::BitXor => Opcode::BitXor,
                    AssignOp::Shl => Opcode::BitShiftLeft,
                    AssignOp::Shr => Opcode::BitShiftRight,
                    AssignOp::Assign | AssignOp::Into | AssignOp::And | AssignOp::Or => {
                        unreachable!("handled above or not compound")
                    }
                });
                Ok(())
            }
        }
    }
}

impl<'e> StoreRhs<'e> {
    fn from_assign(op: AssignOp, value: &'e Expr) -> Self {
        match op {
            AssignOp::Assign | AssignOp::Into => Self::Plain(value),
            other => Self::Compound(other, value),
        }
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Subtract,
        BinaryOp::Mul => Opcode::Multiply,
        BinaryOp::Div => Opcode::Divide,
        BinaryOp::Mod => Opcode::Modulus,
        BinaryOp::FloatMod => Opcode::ModulusModulus,
        BinaryOp::Power => Opcode::Power,
        BinaryOp::BitAnd => Opcode::BitAnd,
        BinaryOp::BitOr => Opcode::BitOr,
        BinaryOp::BitXor => Opcode::BitXor,
        BinaryOp::Shl => Opcode::BitShiftLeft,
        BinaryOp::Shr => Opcode::BitShiftRight,
        BinaryOp::Eq => Opcode::CompareEquals,
        BinaryOp::Ne => Opcode::CompareNotEquals,
        BinaryOp::Lt => Opcode::CompareLess,
        BinaryOp::Le => Opcode::CompareLessOrEqual,
        BinaryOp::Gt => Opcode::CompareGreater,
        BinaryOp::Ge => Opcode::CompareGreaterOrEqual,
        BinaryOp::Equiv => Opcode::CompareEquivalent,
        BinaryOp::NotEquiv => Opcode::CompareNotEquivalent,
        BinaryOp::And | BinaryOp::Or | BinaryOp::In => unreachable!("emitted with control flow"),
    }
}
