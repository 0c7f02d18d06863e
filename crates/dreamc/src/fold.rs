//! Post-parse constant folding.
//!
//! A single bottom-up pass that replaces pure constant sub-expressions with
//! literal nodes. Idempotent by construction. Folding failures that would
//! be runtime errors (division by zero on constants) are reported as
//! warnings and the node is left for the emitter to encode.

use crate::{
    ast::{BinaryOp, ConstValue, Expr, ExprKind, ForList, Stmt, StmtKind, SwitchValue},
    diagnostics::{Diagnostics, WarningCode},
};

/// Folds every expression in a parsed file in place.
pub fn fold_file(diag: &mut Diagnostics, statements: &mut [Stmt]) {
    for statement in statements {
        fold_stmt(diag, statement);
    }
}

fn fold_stmt(diag: &mut Diagnostics, statement: &mut Stmt) {
    match &mut statement.kind {
        StmtKind::ObjectDef { body, .. } => fold_file(diag, body),
        StmtKind::VarDef { value, .. } => {
            if let Some(value) = value {
                fold_expr(diag, value);
            }
        }
        StmtKind::VarOverride { value, .. } => fold_expr(diag, value),
        StmtKind::ProcDef { params, body, .. } => {
            for param in params {
                if let Some(default) = &mut param.default {
                    fold_expr(diag, default);
                }
            }
            fold_file(diag, body);
        }
        StmtKind::Expr(expr) | StmtKind::Throw(expr) | StmtKind::Del(expr) => fold_expr(diag, expr),
        StmtKind::VarDecls(decls) => {
            for decl in decls {
                if let Some(value) = &mut decl.value {
                    fold_expr(diag, value);
                }
            }
        }
        StmtKind::If {
            cond,
            then_body,
            else_body,
        } => {
            fold_expr(diag, cond);
            fold_file(diag, then_body);
            if let Some(else_body) = else_body {
                fold_file(diag, else_body);
            }
        }
        StmtKind::While { cond, body } | StmtKind::DoWhile { body, cond } => {
            fold_expr(diag, cond);
            fold_file(diag, body);
        }
        StmtKind::For {
            init,
            cond,
            step,
            body,
        } => {
            if let Some(init) = init {
                fold_stmt(diag, init);
            }
            if let Some(cond) = cond {
                fold_expr(diag, cond);
            }
            if let Some(step) = step {
                fold_stmt(diag, step);
            }
            fold_file(diag, body);
        }
        StmtKind::ForIn { decl, list, body, .. } => {
            if let Some(decl) = decl {
                if let Some(value) = &mut decl.value {
                    fold_expr(diag, value);
                }
            }
            match list {
                ForList::Expr(expr) => fold_expr(diag, expr),
                ForList::Range { start, end, step } => {
                    fold_expr(diag, start);
                    fold_expr(diag, end);
                    if let Some(step) = step {
                        fold_expr(diag, step);
                    }
                }
            }
            fold_file(diag, body);
        }
        StmtKind::Switch {
            subject,
            cases,
            default,
        } => {
            fold_expr(diag, subject);
            for case in cases {
                for value in &mut case.values {
                    match value {
                        SwitchValue::Exact(expr) => fold_expr(diag, expr),
                        SwitchValue::Range(lo, hi) => {
                            fold_expr(diag, lo);
                            fold_expr(diag, hi);
                        }
                    }
                }
                fold_file(diag, &mut case.body);
            }
            if let Some(default) = default {
                fold_file(diag, default);
            }
        }
        StmtKind::Spawn { delay, body } => {
            if let Some(delay) = delay {
                fold_expr(diag, delay);
            }
            fold_file(diag, body);
        }
        StmtKind::TryCatch {
            try_body, catch_body, ..
        } => {
            fold_file(diag, try_body);
            fold_file(diag, catch_body);
        }
        StmtKind::Return(value) => {
            if let Some(value) = value {
                fold_expr(diag, value);
            }
        }
        StmtKind::Label { body, .. } => fold_file(diag, body),
        StmtKind::Set { value, .. } => fold_expr(diag, value),
        StmtKind::Break(_) | StmtKind::Continue(_) | StmtKind::Goto(_) => {}
    }
}

/// Folds one expression tree bottom-up.
pub fn fold_expr(diag: &mut Diagnostics, expr: &mut Expr) {
    // Children first so parent folds see literals.
    match &mut expr.kind {
        ExprKind::Binary { lhs, rhs, .. } => {
            fold_expr(diag, lhs);
            fold_expr(diag, rhs);
        }
        ExprKind::Unary { operand, .. } => fold_expr(diag, operand),
        ExprKind::Ternary {
            cond,
            then,
            otherwise,
        } => {
            fold_expr(diag, cond);
            fold_expr(diag, then);
            fold_expr(diag, otherwise);
        }
        ExprKind::Assign { target, value, .. } => {
            fold_expr(diag, target);
            fold_expr(diag, value);
        }
        ExprKind::Deref { object, .. } => fold_expr(diag, object),
        ExprKind::Index { object, index, .. } => {
            fold_expr(diag, object);
            fold_expr(diag, index);
        }
        ExprKind::Call { callee, args } => {
            fold_expr(diag, callee);
            for arg in args {
                fold_expr(diag, &mut arg.value);
            }
        }
        ExprKind::New { type_expr, args } => {
            if let Some(type_expr) = type_expr {
                fold_expr(diag, type_expr);
            }
            for arg in args {
                fold_expr(diag, &mut arg.value);
            }
        }
        ExprKind::ParentCall(args) | ExprKind::SelfCall(args) => {
            for arg in args {
                fold_expr(diag, &mut arg.value);
            }
        }
        ExprKind::FormatStr { exprs, .. } => {
            for inner in exprs {
                fold_expr(diag, inner);
            }
        }
        ExprKind::PreIncrement(inner)
        | ExprKind::PostIncrement(inner)
        | ExprKind::PreDecrement(inner)
        | ExprKind::PostDecrement(inner) => fold_expr(diag, inner),
        _ => {}
    }

    match &expr.kind {
        ExprKind::Binary { op, lhs, rhs } => {
            let (Some(left), Some(right)) = (lhs.try_const(), rhs.try_const()) else {
                return;
            };
            if matches!(op, BinaryOp::Div | BinaryOp::Mod | BinaryOp::FloatMod) && is_const_zero(&right) {
                diag.emit(
                    WarningCode::ConstantDivisionByZero,
                    expr.loc,
                    "Division by a constant zero",
                );
                return;
            }
            if let Some(folded) = ConstValue::binary(*op, &left, &right) {
                expr.kind = const_to_expr_kind(folded);
            }
        }
        ExprKind::Unary { op, operand } => {
            let Some(value) = operand.try_const() else { return };
            if let Some(folded) = ConstValue::unary(*op, &value) {
                expr.kind = const_to_expr_kind(folded);
            }
        }
        ExprKind::Ternary { cond, then, otherwise } => {
            let Some(cond) = cond.try_const() else { return };
            let branch = if cond.is_truthy() { then } else { otherwise };
            let folded = (**branch).clone();
            expr.kind = folded.kind;
        }
        _ => {}
    }
}

fn is_const_zero(value: &ConstValue) -> bool {
    matches!(value, ConstValue::Int(0)) || matches!(value, ConstValue::Float(f) if *f == 0.0)
}

fn const_to_expr_kind(value: ConstValue) -> ExprKind {
    match value {
        ConstValue::Null => ExprKind::Null,
        ConstValue::Int(i) => ExprKind::Int(i),
        ConstValue::Float(f) => ExprKind::Float(f),
        ConstValue::Str(s) => ExprKind::Str(s),
        ConstValue::Resource(r) => ExprKind::Resource(r),
        ConstValue::Path(p) => ExprKind::Path(crate::path::DreamPath::parse(&p)),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{indent::IndentLexer, lexer::Lexer, parse::Parser};

    fn parse_and_fold(source: &str) -> (Vec<Stmt>, Diagnostics) {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("test.dm");
        let tokens = Lexer::new(file, source.to_owned(), false, true).lex_all(&mut diag);
        let stream = IndentLexer::new(tokens);
        let mut statements = {
            let mut parser = Parser::new(&mut diag, stream);
            parser.parse_file()
        };
        fold_file(&mut diag, &mut statements);
        (statements, diag)
    }

    fn root_var_value(statements: &[Stmt]) -> &ExprKind {
        let StmtKind::VarDef { value: Some(value), .. } = &statements[0].kind else {
            panic!("expected VarDef with value");
        };
        &value.kind
    }

    #[test]
    fn arithmetic_folds_to_literal() {
        let (statements, _) = parse_and_fold("var/x = 1 + 2\n");
        assert_eq!(root_var_value(&statements), &ExprKind::Int(3));
    }

    #[test]
    fn nested_expression_folds() {
        let (statements, _) = parse_and_fold("var/x = (3 + 1) * (3 + 1)\n");
        assert_eq!(root_var_value(&statements), &ExprKind::Int(16));
    }

    #[test]
    fn string_concat_folds() {
        let (statements, _) = parse_and_fold("var/x = \"a\" + \"b\"\n");
        assert_eq!(root_var_value(&statements), &ExprKind::Str("ab".to_owned()));
    }

    #[test]
    fn ternary_on_literal_folds() {
        let (statements, _) = parse_and_fold("var/x = 1 ? 10 : 20\n");
        assert_eq!(root_var_value(&statements), &ExprKind::Int(10));
    }

    #[test]
    fn division_by_zero_warns_and_stays() {
        let (statements, diag) = parse_and_fold("var/x = 1 / 0\n");
        assert!(matches!(root_var_value(&statements), ExprKind::Binary { .. }));
        assert_eq!(diag.warning_count(), 1);
    }

    #[test]
    fn folding_is_idempotent() {
        let (mut statements, _) = parse_and_fold("var/x = 2 ** 10 - 1\n");
        let first = statements.clone();
        let mut diag = Diagnostics::new(100, false);
        fold_file(&mut diag, &mut statements);
        assert_eq!(statements, first);
        assert_eq!(diag.warning_count(), 0);
    }

    #[test]
    fn non_constant_parts_left_alone() {
        let (statements, _) = parse_and_fold("proc/f(y)\n\treturn y + (1 + 1)\n");
        let StmtKind::ProcDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        let StmtKind::Return(Some(value)) = &body[0].kind else {
            panic!()
        };
        let ExprKind::Binary { rhs, .. } = &value.kind else {
            panic!("expected Binary");
        };
        assert_eq!(rhs.kind, ExprKind::Int(2));
    }
}
