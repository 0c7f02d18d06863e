//! Recursive-descent parser: token stream to AST.
//!
//! Operates on the indent-layer stream with a small lookahead buffer. Two
//! guards protect against pathological input: a no-progress watchdog that
//! aborts parsing when the cursor stops advancing, and a nesting-depth
//! budget for deeply nested expressions.
//!
//! Errors recover in panic mode: the offending construct is reported, then
//! tokens are skipped to the next statement boundary and parsing continues.

use std::collections::VecDeque;

use crate::{
    ast::{
        AssignOp, BinaryOp, CallArg, DerefOp, Expr, ExprKind, ForList, LocalVarDecl, ProcParam, Stmt, StmtKind,
        SwitchCase, SwitchValue, UnaryOp,
    },
    diagnostics::{Diagnostics, WarningCode},
    indent::IndentLexer,
    lexer::Lexer,
    location::Location,
    token::{Token, TokenKind, TokenValue},
};

/// Iterations without cursor movement before parsing is aborted.
const MAX_NO_PROGRESS: u32 = 1000;
/// Expression nesting budget, guarding against stack overflow.
const MAX_NESTING_DEPTH: u16 = 1000;

/// The DM parser.
pub struct Parser<'a> {
    diag: &'a mut Diagnostics,
    lexer: IndentLexer,
    current: Token,
    peeked: VecDeque<Token>,
    progress: u64,
    no_progress: u32,
    depth_remaining: u16,
    /// Whether `in` binds as a binary operator; suppressed inside `for`
    /// headers where it is syntax.
    allow_in: bool,
    aborted: bool,
}

impl<'a> Parser<'a> {
    pub fn new(diag: &'a mut Diagnostics, mut lexer: IndentLexer) -> Self {
        let current = lexer.next_token(diag);
        Self {
            diag,
            lexer,
            current,
            peeked: VecDeque::new(),
            progress: 0,
            no_progress: 0,
            depth_remaining: MAX_NESTING_DEPTH,
            allow_in: true,
            aborted: false,
        }
    }

    // ------------------------------------------------------------------
    // Cursor

    fn advance(&mut self) {
        self.progress += 1;
        self.current = match self.peeked.pop_front() {
            Some(token) => token,
            None => self.lexer.next_token(self.diag),
        };
    }

    fn peek(&mut self, n: usize) -> &Token {
        while self.peeked.len() <= n {
            let token = self.lexer.next_token(self.diag);
            self.peeked.push_back(token);
        }
        &self.peeked[n]
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> bool {
        if self.eat(kind) {
            return true;
        }
        self.diag.emit(
            WarningCode::BadToken,
            self.current.loc,
            format!("Expected {what}, found \"{}\"", self.current),
        );
        false
    }

    fn loc(&self) -> Location {
        self.current.loc
    }

    /// Skips newline and semicolon separators.
    fn skip_separators(&mut self) {
        while matches!(self.current.kind, TokenKind::Newline | TokenKind::Semicolon) {
            self.advance();
        }
    }

    /// Panic-mode recovery: skip to the next statement boundary.
    fn recover(&mut self) {
        loop {
            match self.current.kind {
                TokenKind::Newline | TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::Dedent | TokenKind::RightBrace | TokenKind::EndOfFile => return,
                _ => self.advance(),
            }
        }
    }

    /// Watchdog bookkeeping for a statement loop. Returns `false` when the
    /// loop should stop.
    fn check_progress(&mut self, before: u64) -> bool {
        if self.aborted {
            return false;
        }
        if self.progress == before {
            self.advance();
            self.no_progress += 1;
            if self.no_progress >= MAX_NO_PROGRESS {
                self.diag.error(self.current.loc, "Parser made no progress; aborting");
                self.aborted = true;
                return false;
            }
        } else {
            self.no_progress = 0;
        }
        true
    }

    // ------------------------------------------------------------------
    // Top level

    /// Parses the whole token stream into top-level object statements.
    pub fn parse_file(&mut self) -> Vec<Stmt> {
        let mut statements = Vec::new();
        loop {
            self.skip_separators();
            if self.at(TokenKind::EndOfFile) || self.aborted || self.diag.should_abort() {
                break;
            }
            // Stray structure at top level is skipped quietly.
            if self.eat(TokenKind::Indent) || self.eat(TokenKind::Dedent) {
                continue;
            }
            let before = self.progress;
            match self.parse_object_statement() {
                Some(statement) => statements.push(statement),
                None => self.recover(),
            }
            if !self.check_progress(before) {
                break;
            }
        }
        statements
    }

    fn is_path_element(&self) -> bool {
        matches!(
            self.current.kind,
            TokenKind::Identifier
                | TokenKind::Var
                | TokenKind::Proc
                | TokenKind::Verb
                | TokenKind::Step
                | TokenKind::Null
                | TokenKind::Switch
                | TokenKind::New
                | TokenKind::Do
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Const
                | TokenKind::Tmp
                | TokenKind::Static
                | TokenKind::Global
        )
    }

    /// Skips blank lines that precede an indented block, so the Indent
    /// token becomes current.
    fn skip_blank_lines_before_indent(&mut self) {
        while self.at(TokenKind::Newline)
            && matches!(self.peek(0).kind, TokenKind::Newline | TokenKind::Indent)
        {
            self.advance();
        }
    }

    /// Parses one path-structured definition: an object block, a variable
    /// definition or override, or a proc definition.
    fn parse_object_statement(&mut self) -> Option<Stmt> {
        let loc = self.loc();

        let kind = if self.eat(TokenKind::Slash) {
            crate::path::PathKind::Absolute
        } else if self.eat(TokenKind::DotDot) {
            self.eat(TokenKind::Slash);
            crate::path::PathKind::Upward
        } else if self.current.kind == TokenKind::Dot && self.peek(0).kind == TokenKind::Slash {
            self.advance();
            self.advance();
            crate::path::PathKind::Downward
        } else {
            crate::path::PathKind::Relative
        };

        let mut elements: Vec<String> = Vec::new();
        loop {
            if self.is_path_element() {
                elements.push(self.current.text.clone());
                self.advance();
            } else {
                if elements.is_empty() && kind == crate::path::PathKind::Relative {
                    self.diag.emit(
                        WarningCode::BadDefinition,
                        loc,
                        format!("Expected a definition, found \"{}\"", self.current),
                    );
                    return None;
                }
                break;
            }
            if !self.eat(TokenKind::Slash) {
                break;
            }
        }

        let mut path = crate::path::DreamPath { kind, elements: elements.into() };
        self.skip_blank_lines_before_indent();

        match self.current.kind {
            TokenKind::LeftParen => {
                let Some(name) = path.elements.pop() else {
                    self.diag.emit(WarningCode::BadDefinition, loc, "Expected a proc name");
                    return None;
                };
                let is_verb = path.contains("verb");
                self.advance();
                let params = self.parse_proc_params();
                let body = self.parse_block();
                Some(Stmt {
                    loc,
                    kind: StmtKind::ProcDef {
                        object_path: path,
                        name,
                        is_verb,
                        params,
                        body,
                    },
                })
            }
            TokenKind::Assign => {
                self.advance();
                let value = self.parse_expression()?;
                let name = path.elements.pop()?;
                if path.contains("var") {
                    Some(Stmt {
                        loc,
                        kind: StmtKind::VarDef {
                            path,
                            name,
                            value: Some(value),
                        },
                    })
                } else {
                    Some(Stmt {
                        loc,
                        kind: StmtKind::VarOverride { path, name, value },
                    })
                }
            }
            TokenKind::LeftBracket if path.contains("var") => {
                // Sized list declaration: var/list/x[8] or var/x[2][3].
                let name = path.elements.pop()?;
                let mut dims = Vec::new();
                while self.eat(TokenKind::LeftBracket) {
                    if !self.at(TokenKind::RightBracket) {
                        dims.push(self.parse_expression()?);
                    }
                    self.expect(TokenKind::RightBracket, "\"]\"");
                }
                let value = if self.eat(TokenKind::Assign) {
                    Some(self.parse_expression()?)
                } else {
                    Some(Expr::new(
                        loc,
                        ExprKind::New {
                            type_expr: Some(Box::new(Expr::new(
                                loc,
                                ExprKind::Path(crate::path::DreamPath::absolute(["list"])),
                            ))),
                            args: dims.into_iter().map(|value| CallArg { name: None, value }).collect(),
                        },
                    ))
                };
                Some(Stmt {
                    loc,
                    kind: StmtKind::VarDef { path, name, value },
                })
            }
            TokenKind::Indent => {
                self.advance();
                let body = self.parse_object_block_body();
                Some(Stmt {
                    loc,
                    kind: StmtKind::ObjectDef { path, body },
                })
            }
            TokenKind::LeftBrace => {
                self.advance();
                let body = self.parse_brace_object_block();
                Some(Stmt {
                    loc,
                    kind: StmtKind::ObjectDef { path, body },
                })
            }
            _ => {
                // Bare declaration line.
                if path.contains("var") || path.last() == Some("var") {
                    let name = path.elements.pop()?;
                    Some(Stmt {
                        loc,
                        kind: StmtKind::VarDef {
                            path,
                            name,
                            value: None,
                        },
                    })
                } else {
                    Some(Stmt {
                        loc,
                        kind: StmtKind::ObjectDef { path, body: Vec::new() },
                    })
                }
            }
        }
    }

    fn parse_object_block_body(&mut self) -> Vec<Stmt> {
        let mut body = Vec::new();
        loop {
            self.skip_separators();
            if self.eat(TokenKind::Dedent) || self.at(TokenKind::EndOfFile) || self.aborted {
                return body;
            }
            let before = self.progress;
            match self.parse_object_statement() {
                Some(statement) => body.push(statement),
                None => self.recover(),
            }
            if !self.check_progress(before) {
                return body;
            }
        }
    }

    fn parse_brace_object_block(&mut self) -> Vec<Stmt> {
        let mut body = Vec::new();
        loop {
            self.skip_separators();
            while self.eat(TokenKind::Indent) || self.eat(TokenKind::Dedent) {
                self.skip_separators();
            }
            if self.eat(TokenKind::RightBrace) || self.at(TokenKind::EndOfFile) || self.aborted {
                return body;
            }
            let before = self.progress;
            match self.parse_object_statement() {
                Some(statement) => body.push(statement),
                None => self.recover(),
            }
            if !self.check_progress(before) {
                return body;
            }
        }
    }

    // ------------------------------------------------------------------
    // Proc-level statements

    /// Parses a statement block: an indented block, a braced block, or
    /// inline statements up to the end of the line.
    fn parse_block(&mut self) -> Vec<Stmt> {
        self.skip_blank_lines_before_indent();
        if self.eat(TokenKind::Indent) {
            let mut body = Vec::new();
            loop {
                self.skip_separators();
                if self.eat(TokenKind::Dedent) || self.at(TokenKind::EndOfFile) || self.aborted {
                    return body;
                }
                let before = self.progress;
                match self.parse_statement() {
                    Some(statement) => body.push(statement),
                    None => self.recover(),
                }
                if !self.check_progress(before) {
                    return body;
                }
            }
        }
        if self.eat(TokenKind::LeftBrace) {
            let mut body = Vec::new();
            loop {
                self.skip_separators();
                while self.eat(TokenKind::Indent) || self.eat(TokenKind::Dedent) {
                    self.skip_separators();
                }
                if self.eat(TokenKind::RightBrace) || self.at(TokenKind::EndOfFile) || self.aborted {
                    return body;
                }
                let before = self.progress;
                match self.parse_statement() {
                    Some(statement) => body.push(statement),
                    None => self.recover(),
                }
                if !self.check_progress(before) {
                    return body;
                }
            }
        }
        // Inline body on the same line.
        let mut body = Vec::new();
        loop {
            if matches!(
                self.current.kind,
                TokenKind::Newline | TokenKind::Dedent | TokenKind::EndOfFile | TokenKind::RightBrace
            ) {
                return body;
            }
            if self.eat(TokenKind::Semicolon) {
                continue;
            }
            let before = self.progress;
            match self.parse_statement() {
                Some(statement) => body.push(statement),
                None => {
                    self.recover();
                    return body;
                }
            }
            if !self.check_progress(before) {
                return body;
            }
        }
    }

    fn parse_statement(&mut self) -> Option<Stmt> {
        let loc = self.loc();
        let current_kind = self.current.kind;
        match current_kind {
            TokenKind::If => {
                self.advance();
                self.expect(TokenKind::LeftParen, "\"(\"");
                let cond = self.parse_expression()?;
                self.expect(TokenKind::RightParen, "\")\"");
                self.eat(TokenKind::Semicolon);
                let then_body = self.parse_block();
                if self.at(TokenKind::Newline) && self.peek(0).kind == TokenKind::Else {
                    self.advance();
                }
                let else_body = if self.eat(TokenKind::Else) {
                    if self.at(TokenKind::If) {
                        Some(vec![self.parse_statement()?])
                    } else {
                        Some(self.parse_block())
                    }
                } else {
                    None
                };
                Some(Stmt {
                    loc,
                    kind: StmtKind::If {
                        cond,
                        then_body,
                        else_body,
                    },
                })
            }
            TokenKind::While => {
                self.advance();
                self.expect(TokenKind::LeftParen, "\"(\"");
                let cond = self.parse_expression()?;
                self.expect(TokenKind::RightParen, "\")\"");
                let body = self.parse_block();
                Some(Stmt {
                    loc,
                    kind: StmtKind::While { cond, body },
                })
            }
            TokenKind::Do => {
                self.advance();
                let body = self.parse_block();
                if self.at(TokenKind::Newline) && self.peek(0).kind == TokenKind::While {
                    self.advance();
                }
                self.expect(TokenKind::While, "\"while\"");
                self.expect(TokenKind::LeftParen, "\"(\"");
                let cond = self.parse_expression()?;
                self.expect(TokenKind::RightParen, "\")\"");
                Some(Stmt {
                    loc,
                    kind: StmtKind::DoWhile { body, cond },
                })
            }
            TokenKind::For => self.parse_for(),
            TokenKind::Switch => self.parse_switch(),
            TokenKind::Spawn => {
                self.advance();
                let delay = if self.eat(TokenKind::LeftParen) {
                    let delay = if self.at(TokenKind::RightParen) {
                        None
                    } else {
                        Some(self.parse_expression()?)
                    };
                    self.expect(TokenKind::RightParen, "\")\"");
                    delay
                } else {
                    None
                };
                let body = self.parse_block();
                Some(Stmt {
                    loc,
                    kind: StmtKind::Spawn { delay, body },
                })
            }
            TokenKind::Try => {
                self.advance();
                let try_body = self.parse_block();
                if self.at(TokenKind::Newline) && self.peek(0).kind == TokenKind::Catch {
                    self.advance();
                }
                self.expect(TokenKind::Catch, "\"catch\"");
                let mut catch_var = None;
                if self.eat(TokenKind::LeftParen) {
                    if !self.at(TokenKind::RightParen) {
                        if self.eat(TokenKind::Var) {
                            self.eat(TokenKind::Slash);
                        }
                        // Any type segments before the name are skipped.
                        while self.current.kind.is_identifier_like() && self.peek(0).kind == TokenKind::Slash {
                            self.advance();
                            self.advance();
                        }
                        if self.current.kind.is_identifier_like() {
                            catch_var = Some(self.current.text.clone());
                            self.advance();
                        }
                    }
                    self.expect(TokenKind::RightParen, "\")\"");
                }
                let catch_body = self.parse_block();
                Some(Stmt {
                    loc,
                    kind: StmtKind::TryCatch {
                        try_body,
                        catch_var,
                        catch_body,
                    },
                })
            }
            TokenKind::Throw => {
                self.advance();
                let value = self.parse_expression()?;
                Some(Stmt {
                    loc,
                    kind: StmtKind::Throw(value),
                })
            }
            TokenKind::Return => {
                self.advance();
                let value = if matches!(
                    self.current.kind,
                    TokenKind::Newline
                        | TokenKind::Semicolon
                        | TokenKind::Dedent
                        | TokenKind::EndOfFile
                        | TokenKind::RightBrace
                ) {
                    None
                } else {
                    Some(self.parse_expression()?)
                };
                Some(Stmt {
                    loc,
                    kind: StmtKind::Return(value),
                })
            }
            TokenKind::Break => {
                self.advance();
                let label = self.eat_optional_label();
                Some(Stmt {
                    loc,
                    kind: StmtKind::Break(label),
                })
            }
            TokenKind::Continue => {
                self.advance();
                let label = self.eat_optional_label();
                Some(Stmt {
                    loc,
                    kind: StmtKind::Continue(label),
                })
            }
            TokenKind::Goto => {
                self.advance();
                if !self.current.kind.is_identifier_like() {
                    self.diag
                        .emit(WarningCode::BadStatement, loc, "Expected a label after goto");
                    return None;
                }
                let label = self.current.text.clone();
                self.advance();
                Some(Stmt {
                    loc,
                    kind: StmtKind::Goto(label),
                })
            }
            TokenKind::Del => {
                self.advance();
                let value = self.parse_expression()?;
                Some(Stmt {
                    loc,
                    kind: StmtKind::Del(value),
                })
            }
            TokenKind::Set => {
                self.advance();
                if !self.current.kind.is_identifier_like() {
                    self.diag
                        .emit(WarningCode::BadStatement, loc, "Expected a setting name after set");
                    return None;
                }
                let attr = self.current.text.clone();
                self.advance();
                let in_list = if self.eat(TokenKind::In) {
                    true
                } else {
                    self.expect(TokenKind::Assign, "\"=\" or \"in\"");
                    false
                };
                let value = self.parse_expression()?;
                Some(Stmt {
                    loc,
                    kind: StmtKind::Set { attr, value, in_list },
                })
            }
            TokenKind::Var => {
                self.advance();
                let decls = self.parse_local_var_decls()?;
                Some(Stmt {
                    loc,
                    kind: StmtKind::VarDecls(decls),
                })
            }
            TokenKind::Identifier
                if self.peek(0).kind == TokenKind::Colon
                    && matches!(self.peek(1).kind, TokenKind::Newline | TokenKind::Indent) =>
            {
                let name = self.current.text.clone();
                self.advance();
                self.advance();
                let body = if self.at(TokenKind::Indent) {
                    self.parse_block()
                } else {
                    Vec::new()
                };
                Some(Stmt {
                    loc,
                    kind: StmtKind::Label { name, body },
                })
            }
            _ => {
                let expr = self.parse_expression()?;
                Some(Stmt {
                    loc,
                    kind: StmtKind::Expr(expr),
                })
            }
        }
    }

    fn eat_optional_label(&mut self) -> Option<String> {
        if self.current.kind.is_identifier_like() {
            let label = self.current.text.clone();
            self.advance();
            Some(label)
        } else {
            None
        }
    }

    /// Parses a local `var` declaration list after the `var` keyword.
    fn parse_local_var_decls(&mut self) -> Option<Vec<LocalVarDecl>> {
        let mut decls = Vec::new();
        loop {
            self.eat(TokenKind::Slash);
            let mut segments: Vec<String> = Vec::new();
            while self.is_path_element() {
                segments.push(self.current.text.clone());
                self.advance();
                if !self.eat(TokenKind::Slash) {
                    break;
                }
            }
            let Some(name) = segments.pop() else {
                self.diag
                    .emit(WarningCode::BadStatement, self.loc(), "Expected a variable name");
                return None;
            };
            segments.retain(|s| !matches!(s.as_str(), "const" | "tmp" | "global" | "static" | "final"));
            let type_path = if segments.is_empty() {
                None
            } else {
                Some(crate::path::DreamPath::absolute(segments))
            };

            let mut value = None;
            if self.eat(TokenKind::LeftBracket) {
                let loc = self.loc();
                let mut dims = Vec::new();
                if !self.at(TokenKind::RightBracket) {
                    dims.push(self.parse_expression()?);
                }
                self.expect(TokenKind::RightBracket, "\"]\"");
                value = Some(Expr::new(
                    loc,
                    ExprKind::New {
                        type_expr: Some(Box::new(Expr::new(
                            loc,
                            ExprKind::Path(crate::path::DreamPath::absolute(["list"])),
                        ))),
                        args: dims.into_iter().map(|value| CallArg { name: None, value }).collect(),
                    },
                ));
            }
            if self.eat(TokenKind::Assign) {
                value = Some(self.parse_expression()?);
            }
            decls.push(LocalVarDecl { name, type_path, value });

            if !self.eat(TokenKind::Comma) {
                return Some(decls);
            }
            self.eat(TokenKind::Var);
        }
    }

    fn parse_for(&mut self) -> Option<Stmt> {
        let loc = self.loc();
        self.advance();
        self.expect(TokenKind::LeftParen, "\"(\"");

        if self.eat(TokenKind::RightParen) {
            let body = self.parse_block();
            return Some(Stmt {
                loc,
                kind: StmtKind::For {
                    init: None,
                    cond: None,
                    step: None,
                    body,
                },
            });
        }

        let was_allow_in = self.allow_in;
        self.allow_in = false;

        let result = self.parse_for_header(loc);

        self.allow_in = was_allow_in;
        let (init, cond, step, for_in) = result?;

        self.expect(TokenKind::RightParen, "\")\"");
        let body = self.parse_block();

        if let Some((decl, var, list)) = for_in {
            return Some(Stmt {
                loc,
                kind: StmtKind::ForIn { decl, var, list, body },
            });
        }
        Some(Stmt {
            loc,
            kind: StmtKind::For {
                init,
                cond,
                step,
                body,
            },
        })
    }

    /// Parses the inside of a `for(...)` header. Returns either C-style
    /// components or a for-in description.
    #[expect(clippy::type_complexity, reason = "internal helper returns one of two loop shapes")]
    fn parse_for_header(
        &mut self,
        loc: Location,
    ) -> Option<(
        Option<Box<Stmt>>,
        Option<Expr>,
        Option<Box<Stmt>>,
        Option<(Option<LocalVarDecl>, String, ForList)>,
    )> {
        // var-declaring loop: for(var/x in list) or for(var/i = 1, ...).
        if self.at(TokenKind::Var) {
            self.advance();
            let mut decls = self.parse_local_var_decl_single()?;
            if self.eat(TokenKind::In) {
                let list = self.parse_for_list()?;
                let var = decls.name.clone();
                return Some((None, None, None, Some((Some(decls), var, list))));
            }
            if self.eat(TokenKind::To) {
                let start = decls.value.take().unwrap_or_else(|| Expr::new(loc, ExprKind::Int(1)));
                let end = self.parse_expression()?;
                let step = if self.eat(TokenKind::Step) {
                    Some(self.parse_expression()?)
                } else {
                    None
                };
                let var = decls.name.clone();
                return Some((
                    None,
                    None,
                    None,
                    Some((Some(decls), var, ForList::Range { start, end, step })),
                ));
            }
            // C-style with a declaring initializer.
            let init = Some(Box::new(Stmt {
                loc,
                kind: StmtKind::VarDecls(vec![decls]),
            }));
            let (cond, step) = self.parse_for_tail()?;
            return Some((init, cond, step, None));
        }

        let first = self.parse_expression()?;

        if self.eat(TokenKind::In) {
            let ExprKind::Ident(var) = &first.kind else {
                self.diag
                    .emit(WarningCode::BadExpression, first.loc, "Expected a variable before \"in\"");
                return None;
            };
            let var = var.clone();
            let list = self.parse_for_list()?;
            return Some((None, None, None, Some((None, var, list))));
        }

        if self.eat(TokenKind::To) {
            // for(i = 1 to 10): the initializer doubles as the range start.
            let ExprKind::Assign {
                op: AssignOp::Assign,
                target,
                value,
            } = &first.kind
            else {
                self.diag
                    .emit(WarningCode::MalformedRange, first.loc, "Expected an assignment before \"to\"");
                return None;
            };
            let ExprKind::Ident(var) = &target.kind else {
                self.diag
                    .emit(WarningCode::MalformedRange, first.loc, "Expected a variable before \"to\"");
                return None;
            };
            let end = self.parse_expression()?;
            let step = if self.eat(TokenKind::Step) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            return Some((
                None,
                None,
                None,
                Some((
                    None,
                    var.clone(),
                    ForList::Range {
                        start: (**value).clone(),
                        end,
                        step,
                    },
                )),
            ));
        }

        if self.at(TokenKind::RightParen) {
            // Single expression: condition-only loop.
            return Some((None, Some(first), None, None));
        }

        let init = Some(Box::new(Stmt {
            loc: first.loc,
            kind: StmtKind::Expr(first),
        }));
        let (cond, step) = self.parse_for_tail()?;
        Some((init, cond, step, None))
    }

    /// Parses the `; cond ; step` tail of a C-style for header.
    fn parse_for_tail(&mut self) -> Option<(Option<Expr>, Option<Box<Stmt>>)> {
        let mut cond = None;
        let mut step = None;
        if self.eat(TokenKind::Semicolon) || self.eat(TokenKind::Comma) {
            if !self.at(TokenKind::RightParen) && !self.at(TokenKind::Semicolon) && !self.at(TokenKind::Comma) {
                cond = Some(self.parse_expression()?);
            }
            if self.eat(TokenKind::Semicolon) || self.eat(TokenKind::Comma) {
                if !self.at(TokenKind::RightParen) {
                    let loc = self.loc();
                    let expr = self.parse_expression()?;
                    step = Some(Box::new(Stmt {
                        loc,
                        kind: StmtKind::Expr(expr),
                    }));
                }
            }
        }
        Some((cond, step))
    }

    fn parse_for_list(&mut self) -> Option<ForList> {
        let first = self.parse_expression()?;
        if self.eat(TokenKind::To) {
            let end = self.parse_expression()?;
            let step = if self.eat(TokenKind::Step) {
                Some(self.parse_expression()?)
            } else {
                None
            };
            return Some(ForList::Range {
                start: first,
                end,
                step,
            });
        }
        Some(ForList::Expr(first))
    }

    /// Parses a single declaration after `var` in a for header.
    fn parse_local_var_decl_single(&mut self) -> Option<LocalVarDecl> {
        self.eat(TokenKind::Slash);
        let mut segments: Vec<String> = Vec::new();
        while self.is_path_element() {
            segments.push(self.current.text.clone());
            self.advance();
            if !self.eat(TokenKind::Slash) {
                break;
            }
        }
        let name = segments.pop()?;
        segments.retain(|s| !matches!(s.as_str(), "const" | "tmp" | "global" | "static" | "final"));
        let type_path = if segments.is_empty() {
            None
        } else {
            Some(crate::path::DreamPath::absolute(segments))
        };
        let value = if self.eat(TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        Some(LocalVarDecl { name, type_path, value })
    }

    fn parse_switch(&mut self) -> Option<Stmt> {
        let loc = self.loc();
        self.advance();
        self.expect(TokenKind::LeftParen, "\"(\"");
        let subject = self.parse_expression()?;
        self.expect(TokenKind::RightParen, "\")\"");

        let mut cases = Vec::new();
        let mut default = None;

        self.skip_blank_lines_before_indent();
        if !self.eat(TokenKind::Indent) {
            self.diag
                .emit(WarningCode::BadStatement, loc, "Expected an indented block after switch");
            return Some(Stmt {
                loc,
                kind: StmtKind::Switch {
                    subject,
                    cases,
                    default,
                },
            });
        }

        loop {
            self.skip_separators();
            if self.eat(TokenKind::Dedent) || self.at(TokenKind::EndOfFile) || self.aborted {
                break;
            }
            let before = self.progress;
            if self.eat(TokenKind::If) {
                self.expect(TokenKind::LeftParen, "\"(\"");
                let mut values = Vec::new();
                loop {
                    let Some(first) = self.parse_expression() else {
                        self.recover();
                        break;
                    };
                    if self.eat(TokenKind::To) {
                        match self.parse_expression() {
                            Some(end) => values.push(SwitchValue::Range(first, end)),
                            None => values.push(SwitchValue::Exact(first)),
                        }
                    } else {
                        values.push(SwitchValue::Exact(first));
                    }
                    if !self.eat(TokenKind::Comma) {
                        break;
                    }
                }
                self.expect(TokenKind::RightParen, "\")\"");
                let body = self.parse_block();
                cases.push(SwitchCase { values, body });
            } else if self.eat(TokenKind::Else) {
                default = Some(self.parse_block());
            } else {
                self.diag.emit(
                    WarningCode::BadStatement,
                    self.loc(),
                    "Expected if(...) or else inside switch",
                );
                self.recover();
            }
            if !self.check_progress(before) {
                break;
            }
        }

        Some(Stmt {
            loc,
            kind: StmtKind::Switch {
                subject,
                cases,
                default,
            },
        })
    }

    fn parse_proc_params(&mut self) -> Vec<ProcParam> {
        let mut params = Vec::new();
        if self.eat(TokenKind::RightParen) {
            return params;
        }
        loop {
            while self.eat(TokenKind::Newline) {}
            if self.eat(TokenKind::RightParen) || self.at(TokenKind::EndOfFile) {
                return params;
            }
            if self.eat(TokenKind::DotDotDot) {
                // Variadic marker; arguments beyond the named ones are
                // collected into args at runtime anyway.
                self.eat(TokenKind::Comma);
                continue;
            }

            self.eat(TokenKind::Slash);
            let mut segments: Vec<String> = Vec::new();
            while self.is_path_element() {
                segments.push(self.current.text.clone());
                self.advance();
                if !self.eat(TokenKind::Slash) {
                    break;
                }
            }
            let Some(name) = segments.pop() else {
                self.diag
                    .emit(WarningCode::BadDefinition, self.loc(), "Expected a parameter name");
                while !matches!(self.current.kind, TokenKind::RightParen | TokenKind::EndOfFile) {
                    self.advance();
                }
                self.eat(TokenKind::RightParen);
                return params;
            };
            segments.retain(|s| s != "var");
            let type_path = if segments.is_empty() {
                None
            } else {
                Some(crate::path::DreamPath::absolute(segments))
            };

            if self.eat(TokenKind::LeftBracket) {
                self.eat(TokenKind::RightBracket);
            }

            let default = if self.eat(TokenKind::Assign) {
                self.parse_expression()
            } else {
                None
            };

            let mut as_types = Vec::new();
            if self.eat(TokenKind::As) {
                while self.current.kind.is_identifier_like() || self.current.kind == TokenKind::Null {
                    as_types.push(self.current.text.clone());
                    self.advance();
                    if !self.eat(TokenKind::BitOr) {
                        break;
                    }
                }
            }

            let in_list = if self.eat(TokenKind::In) {
                let list = self.parse_expression();
                if self.eat(TokenKind::To) {
                    self.parse_expression();
                    if self.eat(TokenKind::Step) {
                        self.parse_expression();
                    }
                }
                list
            } else {
                None
            };

            params.push(ProcParam {
                name,
                type_path,
                default,
                as_types,
                in_list,
            });

            if self.eat(TokenKind::Comma) {
                continue;
            }
            while self.eat(TokenKind::Newline) {}
            if self.eat(TokenKind::RightParen) {
                return params;
            }
            if self.at(TokenKind::EndOfFile) {
                return params;
            }
            self.diag.emit(
                WarningCode::BadDefinition,
                self.loc(),
                format!("Unexpected \"{}\" in parameter list", self.current),
            );
            while !matches!(self.current.kind, TokenKind::RightParen | TokenKind::EndOfFile) {
                self.advance();
            }
            self.eat(TokenKind::RightParen);
            return params;
        }
    }

    // ------------------------------------------------------------------
    // Expressions

    pub fn parse_expression(&mut self) -> Option<Expr> {
        if self.depth_remaining == 0 {
            self.diag
                .emit(WarningCode::BadExpression, self.loc(), "Expression is nested too deeply");
            return None;
        }
        self.depth_remaining -= 1;
        let result = self.parse_assignment();
        self.depth_remaining += 1;
        result
    }

    fn parse_assignment(&mut self) -> Option<Expr> {
        let lhs = self.parse_ternary()?;
        let op = match self.current.kind {
            TokenKind::Assign => AssignOp::Assign,
            TokenKind::AssignInto => AssignOp::Into,
            TokenKind::PlusAssign => AssignOp::Add,
            TokenKind::MinusAssign => AssignOp::Sub,
            TokenKind::StarAssign => AssignOp::Mul,
            TokenKind::SlashAssign => AssignOp::Div,
            TokenKind::PercentAssign => AssignOp::Mod,
            TokenKind::PercentPercentAssign => AssignOp::FloatMod,
            TokenKind::BitAndAssign => AssignOp::BitAnd,
            TokenKind::BitOrAssign => AssignOp::BitOr,
            TokenKind::BitXorAssign => AssignOp::BitXor,
            TokenKind::LeftShiftAssign => AssignOp::Shl,
            TokenKind::RightShiftAssign => AssignOp::Shr,
            TokenKind::AndAssign => AssignOp::And,
            TokenKind::OrAssign => AssignOp::Or,
            _ => return Some(lhs),
        };
        let loc = lhs.loc;
        self.advance();
        let value = self.parse_expression()?;
        Some(Expr::new(
            loc,
            ExprKind::Assign {
                op,
                target: Box::new(lhs),
                value: Box::new(value),
            },
        ))
    }

    fn parse_ternary(&mut self) -> Option<Expr> {
        let cond = self.parse_or()?;
        if !self.eat(TokenKind::Question) {
            return Some(cond);
        }
        let loc = cond.loc;
        let then = self.parse_ternary()?;
        self.expect(TokenKind::Colon, "\":\" in ternary expression");
        let otherwise = self.parse_ternary()?;
        Some(Expr::new(
            loc,
            ExprKind::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            },
        ))
    }

    fn parse_binary_level(
        &mut self,
        next: fn(&mut Self) -> Option<Expr>,
        ops: &[(TokenKind, BinaryOp)],
    ) -> Option<Expr> {
        let mut lhs = next(self)?;
        'outer: loop {
            for (kind, op) in ops {
                if self.at(*kind) {
                    self.advance();
                    let rhs = next(self)?;
                    let loc = lhs.loc;
                    lhs = Expr::new(
                        loc,
                        ExprKind::Binary {
                            op: *op,
                            lhs: Box::new(lhs),
                            rhs: Box::new(rhs),
                        },
                    );
                    continue 'outer;
                }
            }
            return Some(lhs);
        }
    }

    fn parse_or(&mut self) -> Option<Expr> {
        self.parse_binary_level(Self::parse_and, &[(TokenKind::Or, BinaryOp::Or)])
    }

    fn parse_and(&mut self) -> Option<Expr> {
        self.parse_binary_level(Self::parse_in, &[(TokenKind::And, BinaryOp::And)])
    }

    fn parse_in(&mut self) -> Option<Expr> {
        let mut lhs = self.parse_bitor()?;
        while self.allow_in && self.at(TokenKind::In) {
            self.advance();
            let rhs = self.parse_bitor()?;
            let loc = lhs.loc;
            lhs = Expr::new(
                loc,
                ExprKind::Binary {
                    op: BinaryOp::In,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
            );
        }
        Some(lhs)
    }

    fn parse_bitor(&mut self) -> Option<Expr> {
        self.parse_binary_level(Self::parse_bitxor, &[(TokenKind::BitOr, BinaryOp::BitOr)])
    }

    fn parse_bitxor(&mut self) -> Option<Expr> {
        self.parse_binary_level(Self::parse_bitand, &[(TokenKind::BitXor, BinaryOp::BitXor)])
    }

    fn parse_bitand(&mut self) -> Option<Expr> {
        self.parse_binary_level(Self::parse_equality, &[(TokenKind::BitAnd, BinaryOp::BitAnd)])
    }

    fn parse_equality(&mut self) -> Option<Expr> {
        self.parse_binary_level(
            Self::parse_relational,
            &[
                (TokenKind::Equals, BinaryOp::Eq),
                (TokenKind::NotEquals, BinaryOp::Ne),
                (TokenKind::TildeEquals, BinaryOp::Equiv),
                (TokenKind::TildeNotEquals, BinaryOp::NotEquiv),
            ],
        )
    }

    fn parse_relational(&mut self) -> Option<Expr> {
        self.parse_binary_level(
            Self::parse_shift,
            &[
                (TokenKind::Less, BinaryOp::Lt),
                (TokenKind::LessOrEqual, BinaryOp::Le),
                (TokenKind::Greater, BinaryOp::Gt),
                (TokenKind::GreaterOrEqual, BinaryOp::Ge),
            ],
        )
    }

    fn parse_shift(&mut self) -> Option<Expr> {
        self.parse_binary_level(
            Self::parse_additive,
            &[
                (TokenKind::LeftShift, BinaryOp::Shl),
                (TokenKind::RightShift, BinaryOp::Shr),
            ],
        )
    }

    fn parse_additive(&mut self) -> Option<Expr> {
        self.parse_binary_level(
            Self::parse_multiplicative,
            &[(TokenKind::Plus, BinaryOp::Add), (TokenKind::Minus, BinaryOp::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> Option<Expr> {
        self.parse_binary_level(
            Self::parse_power,
            &[
                (TokenKind::Star, BinaryOp::Mul),
                (TokenKind::Slash, BinaryOp::Div),
                (TokenKind::Percent, BinaryOp::Mod),
                (TokenKind::PercentPercent, BinaryOp::FloatMod),
            ],
        )
    }

    fn parse_power(&mut self) -> Option<Expr> {
        let lhs = self.parse_unary()?;
        if !self.eat(TokenKind::Power) {
            return Some(lhs);
        }
        let loc = lhs.loc;
        let rhs = self.parse_power()?;
        Some(Expr::new(
            loc,
            ExprKind::Binary {
                op: BinaryOp::Power,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
        ))
    }

    fn parse_unary(&mut self) -> Option<Expr> {
        let loc = self.loc();
        match self.current.kind {
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_unary()?;
                Some(Expr::new(
                    loc,
                    ExprKind::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(operand),
                    },
                ))
            }
            TokenKind::Not => {
                self.advance();
                let operand = self.parse_unary()?;
                Some(Expr::new(
                    loc,
                    ExprKind::Unary {
                        op: UnaryOp::Not,
                        operand: Box::new(operand),
                    },
                ))
            }
            TokenKind::BitNot => {
                self.advance();
                let operand = self.parse_unary()?;
                Some(Expr::new(
                    loc,
                    ExprKind::Unary {
                        op: UnaryOp::BitNot,
                        operand: Box::new(operand),
                    },
                ))
            }
            TokenKind::Increment => {
                self.advance();
                let operand = self.parse_unary()?;
                Some(Expr::new(loc, ExprKind::PreIncrement(Box::new(operand))))
            }
            TokenKind::Decrement => {
                self.advance();
                let operand = self.parse_unary()?;
                Some(Expr::new(loc, ExprKind::PreDecrement(Box::new(operand))))
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Option<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            let loc = expr.loc;
            match self.current.kind {
                TokenKind::LeftParen => {
                    self.advance();
                    let args = self.parse_call_args();
                    expr = Expr::new(
                        loc,
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                    );
                }
                TokenKind::LeftBracket => {
                    self.advance();
                    let was_allow_in = std::mem::replace(&mut self.allow_in, true);
                    let index = self.parse_expression();
                    self.allow_in = was_allow_in;
                    self.expect(TokenKind::RightBracket, "\"]\"");
                    expr = Expr::new(
                        loc,
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index?),
                            safe: false,
                        },
                    );
                }
                TokenKind::QuestionBracket => {
                    self.advance();
                    let was_allow_in = std::mem::replace(&mut self.allow_in, true);
                    let index = self.parse_expression();
                    self.allow_in = was_allow_in;
                    self.expect(TokenKind::RightBracket, "\"]\"");
                    expr = Expr::new(
                        loc,
                        ExprKind::Index {
                            object: Box::new(expr),
                            index: Box::new(index?),
                            safe: true,
                        },
                    );
                }
                TokenKind::Dot => {
                    if !self.peek(0).kind.is_identifier_like() {
                        return Some(expr);
                    }
                    self.advance();
                    let field = self.current.text.clone();
                    self.advance();
                    expr = Expr::new(
                        loc,
                        ExprKind::Deref {
                            object: Box::new(expr),
                            op: DerefOp::Dot,
                            field,
                        },
                    );
                }
                TokenKind::Colon => {
                    // Only a colon glued to its field is a deref; a spaced
                    // colon belongs to an enclosing ternary.
                    let colon = self.current.loc;
                    let next = self.peek(0);
                    let adjacent = next.kind.is_identifier_like()
                        && next.loc.line == colon.line
                        && next.loc.column == colon.column + 1;
                    if !adjacent {
                        return Some(expr);
                    }
                    self.advance();
                    let field = self.current.text.clone();
                    self.advance();
                    expr = Expr::new(
                        loc,
                        ExprKind::Deref {
                            object: Box::new(expr),
                            op: DerefOp::Colon,
                            field,
                        },
                    );
                }
                TokenKind::DoubleColon => {
                    self.advance();
                    if !self.current.kind.is_identifier_like() {
                        self.diag
                            .emit(WarningCode::BadExpression, self.loc(), "Expected a name after \"::\"");
                        return Some(expr);
                    }
                    let field = self.current.text.clone();
                    self.advance();
                    expr = Expr::new(
                        loc,
                        ExprKind::Deref {
                            object: Box::new(expr),
                            op: DerefOp::DoubleColon,
                            field,
                        },
                    );
                }
                TokenKind::QuestionDot | TokenKind::QuestionColon => {
                    let op = if self.current.kind == TokenKind::QuestionDot {
                        DerefOp::SafeDot
                    } else {
                        DerefOp::SafeColon
                    };
                    self.advance();
                    if !self.current.kind.is_identifier_like() {
                        self.diag
                            .emit(WarningCode::BadExpression, self.loc(), "Expected a name after null-conditional access");
                        return Some(expr);
                    }
                    let field = self.current.text.clone();
                    self.advance();
                    expr = Expr::new(
                        loc,
                        ExprKind::Deref {
                            object: Box::new(expr),
                            op,
                            field,
                        },
                    );
                }
                TokenKind::Increment => {
                    self.advance();
                    expr = Expr::new(loc, ExprKind::PostIncrement(Box::new(expr)));
                }
                TokenKind::Decrement => {
                    self.advance();
                    expr = Expr::new(loc, ExprKind::PostDecrement(Box::new(expr)));
                }
                _ => return Some(expr),
            }
        }
    }

    fn parse_call_args(&mut self) -> Vec<CallArg> {
        let mut args = Vec::new();
        loop {
            while self.eat(TokenKind::Newline) {}
            if self.eat(TokenKind::RightParen) || self.at(TokenKind::EndOfFile) {
                return args;
            }
            let name = if self.current.kind.is_identifier_like() && self.peek(0).kind == TokenKind::Assign {
                let name = self.current.text.clone();
                self.advance();
                self.advance();
                Some(name)
            } else {
                None
            };
            let was_allow_in = std::mem::replace(&mut self.allow_in, true);
            let value = self.parse_expression();
            self.allow_in = was_allow_in;
            let Some(value) = value else {
                while !matches!(self.current.kind, TokenKind::RightParen | TokenKind::EndOfFile) {
                    self.advance();
                }
                self.eat(TokenKind::RightParen);
                return args;
            };
            args.push(CallArg { name, value });
            if self.eat(TokenKind::Comma) {
                continue;
            }
        }
    }

    fn parse_primary(&mut self) -> Option<Expr> {
        let loc = self.loc();
        match self.current.kind {
            TokenKind::Number => {
                let kind = match self.current.value {
                    Some(TokenValue::Int(i)) => ExprKind::Int(i),
                    Some(TokenValue::Float(f)) => ExprKind::Float(f),
                    _ => ExprKind::Int(0),
                };
                self.advance();
                Some(Expr::new(loc, kind))
            }
            TokenKind::String => {
                let token = self.current.clone();
                self.advance();
                Some(self.parse_string_literal(&token))
            }
            TokenKind::Resource => {
                let text = self.current.text.clone();
                self.advance();
                Some(Expr::new(loc, ExprKind::Resource(text)))
            }
            TokenKind::Null => {
                self.advance();
                Some(Expr::new(loc, ExprKind::Null))
            }
            TokenKind::Slash => {
                self.advance();
                let mut elements: Vec<String> = Vec::new();
                while self.is_path_element() {
                    elements.push(self.current.text.clone());
                    self.advance();
                    if !self.eat(TokenKind::Slash) {
                        break;
                    }
                }
                if elements.is_empty() {
                    self.diag
                        .emit(WarningCode::BadExpression, loc, "Expected a type path after \"/\"");
                    return None;
                }
                Some(Expr::new(loc, ExprKind::Path(crate::path::DreamPath::absolute(elements))))
            }
            TokenKind::Dot => {
                self.advance();
                if self.eat(TokenKind::LeftParen) {
                    let args = self.parse_call_args();
                    return Some(Expr::new(loc, ExprKind::SelfCall(args)));
                }
                Some(Expr::new(loc, ExprKind::DotValue))
            }
            TokenKind::DotDot => {
                self.advance();
                if self.eat(TokenKind::LeftParen) {
                    let args = self.parse_call_args();
                    return Some(Expr::new(loc, ExprKind::ParentCall(args)));
                }
                Some(Expr::new(
                    loc,
                    ExprKind::Path(crate::path::DreamPath {
                        kind: crate::path::PathKind::Upward,
                        elements: smallvec::SmallVec::new(),
                    }),
                ))
            }
            TokenKind::LeftParen => {
                self.advance();
                let was_allow_in = std::mem::replace(&mut self.allow_in, true);
                let inner = self.parse_expression();
                self.allow_in = was_allow_in;
                self.expect(TokenKind::RightParen, "\")\"");
                inner
            }
            TokenKind::New => {
                self.advance();
                self.parse_new(loc)
            }
            kind if kind.is_identifier_like() => {
                let text = self.current.text.clone();
                self.advance();
                Some(Expr::new(loc, ExprKind::Ident(text)))
            }
            _ => {
                self.diag.emit(
                    WarningCode::BadExpression,
                    loc,
                    format!("Expected an expression, found \"{}\"", self.current),
                );
                None
            }
        }
    }

    fn parse_new(&mut self, loc: Location) -> Option<Expr> {
        let type_expr = if self.at(TokenKind::Slash) {
            self.advance();
            let mut elements: Vec<String> = Vec::new();
            while self.is_path_element() {
                elements.push(self.current.text.clone());
                self.advance();
                if !self.eat(TokenKind::Slash) {
                    break;
                }
            }
            Some(Box::new(Expr::new(
                loc,
                ExprKind::Path(crate::path::DreamPath::absolute(elements)),
            )))
        } else if self.current.kind.is_identifier_like() {
            let mut elements: Vec<String> = vec![self.current.text.clone()];
            self.advance();
            while self.at(TokenKind::Slash) && self.peek(0).kind.is_identifier_like() {
                self.advance();
                elements.push(self.current.text.clone());
                self.advance();
            }
            if elements.len() == 1 {
                Some(Box::new(Expr::new(loc, ExprKind::Ident(elements.pop().expect("one element")))))
            } else {
                Some(Box::new(Expr::new(
                    loc,
                    ExprKind::Path(crate::path::DreamPath::relative(elements)),
                )))
            }
        } else {
            None
        };

        let args = if self.eat(TokenKind::LeftParen) {
            self.parse_call_args()
        } else {
            Vec::new()
        };
        Some(Expr::new(loc, ExprKind::New { type_expr, args }))
    }

    /// Builds a string or format-string expression from a raw string token.
    fn parse_string_literal(&mut self, token: &Token) -> Expr {
        let raw = &token.text;
        if !raw.contains('[') {
            let value = token.str_value().map_or_else(|| raw.clone(), ToOwned::to_owned);
            return Expr::new(token.loc, ExprKind::Str(value));
        }

        let mut parts: Vec<String> = Vec::new();
        let mut exprs: Vec<Expr> = Vec::new();
        let mut part = String::new();
        let chars: Vec<char> = raw.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '\\' && i + 1 < chars.len() {
                match chars[i + 1] {
                    'n' => part.push('\n'),
                    't' => part.push('\t'),
                    'r' => part.push('\r'),
                    '\\' => part.push('\\'),
                    '"' => part.push('"'),
                    '\'' => part.push('\''),
                    '[' => part.push('['),
                    ']' => part.push(']'),
                    other => {
                        part.push('\\');
                        part.push(other);
                    }
                }
                i += 2;
                continue;
            }
            if c == '[' {
                let mut depth = 1u32;
                let mut j = i + 1;
                while j < chars.len() && depth > 0 {
                    match chars[j] {
                        '[' => depth += 1,
                        ']' => depth -= 1,
                        _ => {}
                    }
                    if depth > 0 {
                        j += 1;
                    }
                }
                let fragment: String = chars[i + 1..j.min(chars.len())].iter().collect();
                parts.push(std::mem::take(&mut part));
                if fragment.trim().is_empty() {
                    self.diag.emit(
                        WarningCode::MissingInterpolatedExpression,
                        token.loc,
                        "Empty expression in interpolated string",
                    );
                    exprs.push(Expr::null(token.loc));
                } else {
                    let expr = parse_fragment(self.diag, &fragment, token.loc).unwrap_or_else(|| Expr::null(token.loc));
                    exprs.push(expr);
                }
                i = j + 1;
                continue;
            }
            part.push(c);
            i += 1;
        }
        parts.push(part);

        if exprs.is_empty() {
            return Expr::new(token.loc, ExprKind::Str(parts.concat()));
        }
        Expr::new(token.loc, ExprKind::FormatStr { parts, exprs })
    }
}

/// Parses an isolated expression fragment, used for `[...]` slots inside
/// interpolated strings.
pub(crate) fn parse_fragment(diag: &mut Diagnostics, source: &str, loc: Location) -> Option<Expr> {
    let mut lexer = Lexer::new(loc.file, source.to_owned(), loc.in_standard, false);
    let tokens = lexer.lex_all(diag);
    let stream = IndentLexer::new(tokens);
    let mut parser = Parser::new(diag, stream);
    parser.parse_expression()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ast::{BinaryOp, ExprKind, StmtKind};

    fn parse(source: &str) -> (Vec<Stmt>, Diagnostics) {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("test.dm");
        let tokens = Lexer::new(file, source.to_owned(), false, true).lex_all(&mut diag);
        let stream = IndentLexer::new(tokens);
        let statements = {
            let mut parser = Parser::new(&mut diag, stream);
            parser.parse_file()
        };
        (statements, diag)
    }

    fn parse_ok(source: &str) -> Vec<Stmt> {
        let (statements, diag) = parse(source);
        assert_eq!(diag.error_count(), 0, "unexpected errors: {:?}", diag.messages());
        statements
    }

    #[test]
    fn root_var_definition() {
        let statements = parse_ok("var/x = 1 + 2\n");
        assert_eq!(statements.len(), 1);
        let StmtKind::VarDef { path, name, value } = &statements[0].kind else {
            panic!("expected VarDef, got {:?}", statements[0].kind);
        };
        assert_eq!(name, "x");
        assert!(path.contains("var"));
        let value = value.as_ref().unwrap();
        assert!(matches!(value.kind, ExprKind::Binary { op: BinaryOp::Add, .. }));
    }

    #[test]
    fn object_block_with_override() {
        let statements = parse_ok("/mob/player\n\thealth = 100\n");
        let StmtKind::ObjectDef { path, body } = &statements[0].kind else {
            panic!("expected ObjectDef");
        };
        assert_eq!(path.to_string(), "/mob/player");
        assert_eq!(body.len(), 1);
        assert!(matches!(&body[0].kind, StmtKind::VarOverride { name, .. } if name == "health"));
    }

    #[test]
    fn proc_definition_with_body() {
        let statements = parse_ok("/mob/player/proc/hi()\n\treturn 42\n");
        let StmtKind::ProcDef {
            object_path,
            name,
            is_verb,
            body,
            ..
        } = &statements[0].kind
        else {
            panic!("expected ProcDef");
        };
        assert_eq!(name, "hi");
        assert!(!is_verb);
        assert!(object_path.contains("proc"));
        assert_eq!(body.len(), 1);
        assert!(matches!(&body[0].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn verb_definition() {
        let statements = parse_ok("/mob/verb/say(msg as text)\n\treturn\n");
        let StmtKind::ProcDef { name, is_verb, params, .. } = &statements[0].kind else {
            panic!("expected ProcDef");
        };
        assert_eq!(name, "say");
        assert!(*is_verb);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "msg");
        assert_eq!(params[0].as_types, vec!["text".to_owned()]);
    }

    #[test]
    fn proc_block_syntax() {
        let statements = parse_ok("mob\n\tproc\n\t\tgreet()\n\t\t\treturn 1\n");
        let StmtKind::ObjectDef { body, .. } = &statements[0].kind else {
            panic!("expected ObjectDef");
        };
        let StmtKind::ObjectDef { path, body: inner } = &body[0].kind else {
            panic!("expected proc block, got {:?}", body[0].kind);
        };
        assert_eq!(path.to_string(), "proc");
        assert!(matches!(&inner[0].kind, StmtKind::ProcDef { name, .. } if name == "greet"));
    }

    #[test]
    fn typed_parameters_with_defaults() {
        let statements = parse_ok("proc/attack(mob/target, damage = 10)\n\treturn\n");
        let StmtKind::ProcDef { params, .. } = &statements[0].kind else {
            panic!("expected ProcDef");
        };
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].type_path.as_ref().unwrap().to_string(), "/mob");
        assert!(params[1].default.is_some());
    }

    #[test]
    fn expression_precedence() {
        let statements = parse_ok("var/x = 1 + 2 * 3\n");
        let StmtKind::VarDef { value: Some(value), .. } = &statements[0].kind else {
            panic!("expected VarDef");
        };
        // Folds later; structurally must be Add(1, Mul(2, 3)).
        let ExprKind::Binary { op: BinaryOp::Add, rhs, .. } = &value.kind else {
            panic!("expected Add at the top");
        };
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn ternary_with_spaced_colon() {
        let statements = parse_ok("var/x = 1 ? 2 : 3\n");
        let StmtKind::VarDef { value: Some(value), .. } = &statements[0].kind else {
            panic!("expected VarDef");
        };
        assert!(matches!(value.kind, ExprKind::Ternary { .. }));
    }

    #[test]
    fn colon_deref_when_adjacent() {
        let statements = parse_ok("proc/f(o)\n\treturn o:field\n");
        let StmtKind::ProcDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        let StmtKind::Return(Some(value)) = &body[0].kind else {
            panic!("expected return")
        };
        assert!(matches!(&value.kind, ExprKind::Deref { op: DerefOp::Colon, field, .. } if field == "field"));
    }

    #[test]
    fn null_conditional_operators() {
        let statements = parse_ok("proc/f(o)\n\treturn o?.name\n");
        let StmtKind::ProcDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        let StmtKind::Return(Some(value)) = &body[0].kind else {
            panic!()
        };
        assert!(matches!(&value.kind, ExprKind::Deref { op: DerefOp::SafeDot, .. }));
    }

    #[test]
    fn for_in_list() {
        let statements = parse_ok("proc/f(L)\n\tfor(var/x in L)\n\t\treturn x\n");
        let StmtKind::ProcDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        let StmtKind::ForIn { decl, var, list, .. } = &body[0].kind else {
            panic!("expected ForIn, got {:?}", body[0].kind);
        };
        assert!(decl.is_some());
        assert_eq!(var, "x");
        assert!(matches!(list, ForList::Expr(_)));
    }

    #[test]
    fn for_in_range_with_step() {
        let statements = parse_ok("proc/f()\n\tfor(var/i = 1 to 10 step 2)\n\t\treturn i\n");
        let StmtKind::ProcDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        let StmtKind::ForIn { list: ForList::Range { step, .. }, .. } = &body[0].kind else {
            panic!("expected range ForIn, got {:?}", body[0].kind);
        };
        assert!(step.is_some());
    }

    #[test]
    fn c_style_for() {
        let statements = parse_ok("proc/f()\n\tfor(var/i = 0; i < 10; i++)\n\t\treturn i\n");
        let StmtKind::ProcDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        let StmtKind::For { init, cond, step, .. } = &body[0].kind else {
            panic!("expected For, got {:?}", body[0].kind);
        };
        assert!(init.is_some());
        assert!(cond.is_some());
        assert!(step.is_some());
    }

    #[test]
    fn switch_with_ranges() {
        let statements = parse_ok("proc/f(x)\n\tswitch(x)\n\t\tif(1)\n\t\t\treturn 1\n\t\tif(5 to 9)\n\t\t\treturn 2\n\t\telse\n\t\t\treturn 3\n");
        let StmtKind::ProcDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        let StmtKind::Switch { cases, default, .. } = &body[0].kind else {
            panic!("expected Switch, got {:?}", body[0].kind);
        };
        assert_eq!(cases.len(), 2);
        assert!(matches!(cases[1].values[0], SwitchValue::Range(..)));
        assert!(default.is_some());
    }

    #[test]
    fn spawn_try_catch_throw() {
        let source = "proc/f()\n\tspawn(10)\n\t\treturn\n\ttry\n\t\tthrow \"oops\"\n\tcatch(var/e)\n\t\treturn e\n";
        let statements = parse_ok(source);
        let StmtKind::ProcDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        assert!(matches!(&body[0].kind, StmtKind::Spawn { delay: Some(_), .. }));
        let StmtKind::TryCatch { catch_var, .. } = &body[1].kind else {
            panic!("expected TryCatch, got {:?}", body[1].kind);
        };
        assert_eq!(catch_var.as_deref(), Some("e"));
    }

    #[test]
    fn format_string_with_embedded_expression() {
        let statements = parse_ok("var/x = \"value: [1 + 2]!\"\n");
        let StmtKind::VarDef { value: Some(value), .. } = &statements[0].kind else {
            panic!()
        };
        let ExprKind::FormatStr { parts, exprs } = &value.kind else {
            panic!("expected FormatStr, got {:?}", value.kind);
        };
        assert_eq!(parts, &vec!["value: ".to_owned(), "!".to_owned()]);
        assert_eq!(exprs.len(), 1);
    }

    #[test]
    fn escaped_bracket_is_not_interpolation() {
        let statements = parse_ok("var/x = \"literal \\[bracket]\"\n");
        let StmtKind::VarDef { value: Some(value), .. } = &statements[0].kind else {
            panic!()
        };
        assert!(matches!(&value.kind, ExprKind::Str(s) if s == "literal [bracket]"));
    }

    #[test]
    fn parent_and_self_calls() {
        let statements = parse_ok("mob/New()\n\t..()\n\t.()\n");
        let StmtKind::ProcDef { body, name, .. } = &statements[0].kind else {
            panic!("expected ProcDef, got {:?}", statements[0].kind);
        };
        assert_eq!(name, "New");
        assert!(matches!(&body[0].kind, StmtKind::Expr(e) if matches!(e.kind, ExprKind::ParentCall(_))));
        assert!(matches!(&body[1].kind, StmtKind::Expr(e) if matches!(e.kind, ExprKind::SelfCall(_))));
    }

    #[test]
    fn new_with_path_and_args() {
        let statements = parse_ok("proc/f()\n\treturn new /obj/item(1, 2)\n");
        let StmtKind::ProcDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        let StmtKind::Return(Some(value)) = &body[0].kind else {
            panic!()
        };
        let ExprKind::New { type_expr, args } = &value.kind else {
            panic!("expected New, got {:?}", value.kind);
        };
        assert!(type_expr.is_some());
        assert_eq!(args.len(), 2);
    }

    #[test]
    fn bad_expression_recovers_and_continues() {
        let (statements, diag) = parse("var/x = +\nvar/y = 2\n");
        assert!(diag.error_count() >= 1);
        assert!(statements
            .iter()
            .any(|s| matches!(&s.kind, StmtKind::VarDef { name, .. } if name == "y")));
    }

    #[test]
    fn var_block() {
        let statements = parse_ok("mob\n\tvar\n\t\thealth = 100\n\t\tname_color\n");
        let StmtKind::ObjectDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        let StmtKind::ObjectDef { path, body: inner } = &body[0].kind else {
            panic!("expected var block, got {:?}", body[0].kind);
        };
        assert_eq!(path.to_string(), "var");
        assert_eq!(inner.len(), 2);
    }

    #[test]
    fn goto_and_label() {
        let statements = parse_ok("proc/f()\n\tgoto done\n\tdone:\n\treturn 1\n");
        let StmtKind::ProcDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        assert!(matches!(&body[0].kind, StmtKind::Goto(l) if l == "done"));
        assert!(matches!(&body[1].kind, StmtKind::Label { name, .. } if name == "done"));
    }

    #[test]
    fn set_statements() {
        let statements = parse_ok("mob/verb/hello()\n\tset name = \"Say Hello\"\n\tset src in view()\n\treturn\n");
        let StmtKind::ProcDef { body, .. } = &statements[0].kind else {
            panic!()
        };
        assert!(matches!(&body[0].kind, StmtKind::Set { attr, in_list: false, .. } if attr == "name"));
        assert!(matches!(&body[1].kind, StmtKind::Set { attr, in_list: true, .. } if attr == "src"));
    }
}
