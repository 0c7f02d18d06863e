//! The preprocessor: directive handling, macro expansion, and transitive
//! file inclusion.
//!
//! Consumes characters through a stack of per-file lexers and produces a
//! linear token stream with all directives removed, macros expanded, and
//! included files spliced in at the point of inclusion. Whitespace tokens
//! are retained for the indent layer; comments never reach this stage.
//!
//! Included `.dmm` files and the single optional interface file are
//! collected into side lists instead of being spliced.

use std::path::{Component, Path, PathBuf};

use ahash::{AHashMap, AHashSet};

use crate::{
    diagnostics::{Diagnostics, ErrorLevel, WarningCode},
    lexer::Lexer,
    location::Location,
    token::{Token, TokenKind, TokenValue},
};

/// A preprocessor macro.
#[derive(Debug, Clone)]
pub enum Macro {
    /// Plain token-sequence replacement.
    Text(Vec<Token>),
    /// Function-like macro with positional parameters.
    Function { params: Vec<String>, body: Vec<Token> },
    /// `__LINE__`, resolved against the expansion site.
    Line,
    /// `__FILE__`, resolved against the expansion site.
    File,
    /// `DM_VERSION`.
    Version,
    /// `DM_BUILD`.
    Build,
}

/// One file being read; the current file is the top of the include stack.
#[derive(Debug)]
struct FileContext {
    lexer: Lexer,
    path: PathBuf,
    dir: PathBuf,
}

/// Tracks a macro expansion whose tokens are still in the pushback buffer.
/// While active, the macro's name is not expanded again; this is what makes
/// self-referential macros terminate.
#[derive(Debug)]
struct ExpansionGuard {
    name: String,
    floor: usize,
}

/// The preprocessor. One instance persists across all root files of a
/// compilation so defines and the included-file set carry over.
#[derive(Debug)]
pub struct Preprocessor<'a> {
    diag: &'a mut Diagnostics,
    lib_paths: Vec<PathBuf>,
    dm_version: i64,
    dm_build: i64,
    stack: Vec<FileContext>,
    pushback: Vec<Token>,
    expansions: Vec<ExpansionGuard>,
    defines: AHashMap<String, Macro>,
    included: AHashSet<PathBuf>,
    path_cache: AHashMap<String, Option<PathBuf>>,
    last_ifs: Vec<bool>,
    can_use_directive: bool,
    in_standard: bool,
    /// `.dmm` files named by `#include`, in inclusion order.
    pub maps: Vec<PathBuf>,
    /// The single interface (`.dmf`) file; the latest inclusion wins.
    pub interface: Option<PathBuf>,
}

impl<'a> Preprocessor<'a> {
    #[must_use]
    pub fn new(diag: &'a mut Diagnostics, lib_paths: Vec<PathBuf>, dm_version: i64, dm_build: i64) -> Self {
        let mut defines = AHashMap::new();
        defines.insert("__LINE__".to_owned(), Macro::Line);
        defines.insert("__FILE__".to_owned(), Macro::File);
        defines.insert("DM_VERSION".to_owned(), Macro::Version);
        defines.insert("DM_BUILD".to_owned(), Macro::Build);
        Self {
            diag,
            lib_paths,
            dm_version,
            dm_build,
            stack: Vec::new(),
            pushback: Vec::new(),
            expansions: Vec::new(),
            defines,
            included: AHashSet::new(),
            path_cache: AHashMap::new(),
            last_ifs: Vec::new(),
            can_use_directive: true,
            in_standard: false,
            maps: Vec::new(),
            interface: None,
        }
    }

    /// Installs a command-line define. The value is lexed so multi-token
    /// replacements work.
    pub fn define(&mut self, name: &str, value: &str) {
        let file = self.diag.files.intern("<define>");
        let tokens: Vec<Token> = Lexer::new(file, value.to_owned(), false, false)
            .lex_all(self.diag)
            .into_iter()
            .filter(|t| t.kind != TokenKind::Whitespace && t.kind != TokenKind::Newline)
            .collect();
        self.defines.insert(name.to_owned(), Macro::Text(tokens));
    }

    pub fn undefine(&mut self, name: &str) {
        self.defines.remove(name);
    }

    #[must_use]
    pub fn is_defined(&self, name: &str) -> bool {
        self.defines.contains_key(name)
    }

    /// Preprocesses one root file, appending its tokens to `out`.
    /// Re-including a file that was already processed is a no-op.
    pub fn preprocess_file(&mut self, path: &Path, in_standard: bool, out: &mut Vec<Token>) -> bool {
        let canon = canonical(path);
        if self.included.contains(&canon) {
            return true;
        }
        self.included.insert(canon.clone());
        self.in_standard = in_standard;
        if !self.push_file(&canon, Location::INTERNAL) {
            return false;
        }
        self.run(out)
    }

    /// Preprocesses in-memory source, appending its tokens to `out`.
    ///
    /// Includes resolve relative to the current working directory.
    pub fn preprocess_source(&mut self, name: &str, source: String, in_standard: bool, out: &mut Vec<Token>) -> bool {
        self.in_standard = in_standard;
        let file = self.diag.files.intern(name);
        self.stack.push(FileContext {
            lexer: Lexer::new(file, source, in_standard, true),
            path: PathBuf::from(name),
            dir: PathBuf::from("."),
        });
        self.run(out)
    }

    fn run(&mut self, out: &mut Vec<Token>) -> bool {
        self.can_use_directive = true;
        while let Some(token) = self.next_processed() {
            out.push(token);
            if self.diag.should_abort() {
                self.stack.clear();
                self.pushback.clear();
                break;
            }
        }
        if !self.last_ifs.is_empty() {
            self.diag.error(Location::INTERNAL, "Unterminated conditional directive");
            self.last_ifs.clear();
        }
        !self.diag.should_abort()
    }

    /// Reads the next raw token: pushback buffer first, then the current
    /// file's lexer, popping finished files off the include stack.
    fn next_raw(&mut self) -> Option<Token> {
        loop {
            let len = self.pushback.len();
            self.expansions.retain(|g| len > g.floor);
            if let Some(token) = self.pushback.pop() {
                return Some(token);
            }
            let ctx = self.stack.last_mut()?;
            let token = ctx.lexer.next_token(self.diag);
            if token.kind == TokenKind::EndOfFile {
                self.stack.pop();
                self.can_use_directive = true;
                if self.stack.is_empty() {
                    return None;
                }
                continue;
            }
            return Some(token);
        }
    }

    fn next_processed(&mut self) -> Option<Token> {
        loop {
            let token = self.next_raw()?;
            match token.kind {
                TokenKind::Newline => {
                    self.can_use_directive = true;
                    return Some(token);
                }
                TokenKind::Whitespace => {
                    if self.can_use_directive {
                        // Peek past leading whitespace so an indented
                        // directive doesn't leave a stray indentation token.
                        match self.next_raw() {
                            Some(next) if next.kind.is_directive() => {
                                self.handle_directive(&next);
                                continue;
                            }
                            Some(next) => self.pushback.push(next),
                            None => {}
                        }
                    }
                    return Some(token);
                }
                kind if kind.is_directive() => {
                    if self.can_use_directive {
                        self.handle_directive(&token);
                        continue;
                    }
                    // Mid-line, a directive spelling is just an identifier.
                    let text = token.text.trim_start_matches('#').to_owned();
                    return Some(Token::new(TokenKind::Identifier, text, token.loc));
                }
                TokenKind::Identifier => {
                    self.can_use_directive = false;
                    if self.try_expand(&token) {
                        continue;
                    }
                    return Some(token);
                }
                _ => {
                    self.can_use_directive = false;
                    return Some(token);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Directives

    fn handle_directive(&mut self, token: &Token) {
        match token.kind {
            TokenKind::DirInclude => self.handle_include(token),
            TokenKind::DirDefine => self.handle_define(token),
            TokenKind::DirUndef => {
                let line = self.read_line();
                match line.first() {
                    Some(name) if name.kind.is_identifier_like() => self.undefine(&name.text),
                    _ => self.diag.emit(WarningCode::MalformedMacro, token.loc, "Expected name after #undef"),
                }
            }
            TokenKind::DirIf => {
                let line = self.read_line();
                let value = self.eval_condition(&line, token.loc);
                self.last_ifs.push(value);
                if !value {
                    self.skip_false_branch(token.loc);
                }
            }
            TokenKind::DirIfdef | TokenKind::DirIfndef => {
                let line = self.read_line();
                let defined = match line.first() {
                    Some(name) if name.kind.is_identifier_like() || TokenKind::keyword(&name.text).is_some() => {
                        self.is_defined(&name.text)
                    }
                    _ => {
                        self.diag
                            .emit(WarningCode::MalformedMacro, token.loc, "Expected name after #ifdef");
                        false
                    }
                };
                let value = defined == (token.kind == TokenKind::DirIfdef);
                self.last_ifs.push(value);
                if !value {
                    self.skip_false_branch(token.loc);
                }
            }
            TokenKind::DirElif | TokenKind::DirElse => {
                // Reaching these in normal flow means the previous branch
                // was taken; everything to the matching #endif is dead.
                self.read_line();
                if self.last_ifs.is_empty() {
                    self.diag.error(token.loc, "Unbalanced conditional directive");
                } else {
                    self.skip_to_endif(token.loc);
                }
            }
            TokenKind::DirEndif => {
                self.read_line();
                if self.last_ifs.pop().is_none() {
                    self.diag.error(token.loc, "Unbalanced #endif");
                }
            }
            TokenKind::DirError => {
                let line = self.read_line();
                let message = join_token_text(&line);
                let chain = self.include_chain();
                self.diag.error(token.loc, format!("#error {message}{chain}"));
            }
            TokenKind::DirWarning => {
                let line = self.read_line();
                self.diag.warning(format!("#warning {}", join_token_text(&line)));
            }
            TokenKind::DirPragma => self.handle_pragma(token),
            _ => unreachable!("non-directive token dispatched as directive"),
        }
    }

    fn handle_include(&mut self, token: &Token) {
        let line = self.read_line();
        let Some(path_tok) = line.iter().find(|t| t.kind == TokenKind::String) else {
            self.diag.emit(WarningCode::MalformedMacro, token.loc, "Expected file name after #include");
            return;
        };
        let raw = path_tok.str_value().unwrap_or(&path_tok.text).to_owned();
        let Some(resolved) = self.resolve_path(&raw) else {
            let chain = self.include_chain();
            self.diag
                .error(token.loc, format!("Could not find included file \"{raw}\"{chain}"));
            return;
        };

        let ext = resolved
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        match ext.as_str() {
            "dm" | "dme" => {
                let canon = canonical(&resolved);
                if self.stack.iter().any(|ctx| ctx.path == canon) {
                    let mut chain: Vec<String> = self.stack.iter().map(|c| c.path.display().to_string()).collect();
                    chain.push(canon.display().to_string());
                    self.diag
                        .error(token.loc, format!("Include cycle detected: {}", chain.join(" -> ")));
                    return;
                }
                if self.included.contains(&canon) {
                    return;
                }
                self.included.insert(canon.clone());
                self.push_file(&canon, token.loc);
            }
            "dmm" => self.maps.push(resolved),
            "dmf" => {
                if let Some(previous) = &self.interface {
                    self.diag.warning(format!(
                        "Interface file {} replaced by {}",
                        previous.display(),
                        resolved.display()
                    ));
                }
                self.interface = Some(resolved);
            }
            _ => self
                .diag
                .warning(format!("Unknown file type included: {}", resolved.display())),
        }
    }

    fn handle_define(&mut self, token: &Token) {
        let Some(name_tok) = self.next_raw_skip_ws() else {
            self.diag.emit(WarningCode::MalformedMacro, token.loc, "Expected name after #define");
            return;
        };
        if name_tok.kind == TokenKind::Newline {
            self.diag.emit(WarningCode::MalformedMacro, token.loc, "Expected name after #define");
            self.can_use_directive = true;
            return;
        }
        if !(name_tok.kind.is_identifier_like() || TokenKind::keyword(&name_tok.text).is_some()) {
            self.diag.emit(WarningCode::MalformedMacro, name_tok.loc, "Invalid macro name");
            self.read_line();
            return;
        }
        let name = name_tok.text.clone();

        // A '(' with no whitespace after the name begins a parameter list.
        let mut params = None;
        if let Some(next) = self.next_raw() {
            let adjacent = next.kind == TokenKind::LeftParen
                && next.loc.line == name_tok.loc.line
                && next.loc.column == name_tok.loc.column + u32::try_from(name.len()).unwrap_or(u32::MAX);
            if adjacent {
                params = Some(self.read_macro_params(token.loc));
            } else {
                self.pushback.push(next);
            }
        }

        let body: Vec<Token> = self
            .read_line()
            .into_iter()
            .filter(|t| t.kind != TokenKind::Whitespace)
            .collect();

        let mac = match params {
            Some(params) => Macro::Function { params, body },
            None => Macro::Text(body),
        };
        self.defines.insert(name, mac);
    }

    fn read_macro_params(&mut self, loc: Location) -> Vec<String> {
        let mut params = Vec::new();
        loop {
            let Some(token) = self.next_raw() else {
                self.diag.emit(WarningCode::MalformedMacro, loc, "Unterminated macro parameter list");
                return params;
            };
            match token.kind {
                TokenKind::RightParen => return params,
                TokenKind::Comma | TokenKind::Whitespace => {}
                TokenKind::Newline => {
                    self.diag.emit(WarningCode::MalformedMacro, loc, "Unterminated macro parameter list");
                    return params;
                }
                _ if token.kind.is_identifier_like() || token.kind == TokenKind::DotDotDot => {
                    params.push(token.text);
                }
                _ => {
                    self.diag
                        .emit(WarningCode::MalformedMacro, token.loc, "Invalid macro parameter");
                }
            }
        }
    }

    fn handle_pragma(&mut self, token: &Token) {
        let line: Vec<Token> = self
            .read_line()
            .into_iter()
            .filter(|t| t.kind != TokenKind::Whitespace)
            .collect();
        let (Some(name), Some(level)) = (line.first(), line.get(1)) else {
            self.diag
                .emit(WarningCode::MalformedMacro, token.loc, "Expected #pragma <code> <level>");
            return;
        };
        let Ok(code) = name.text.parse::<WarningCode>() else {
            self.diag
                .emit(WarningCode::MalformedMacro, name.loc, format!("Unknown pragma \"{}\"", name.text));
            return;
        };
        let Ok(level) = level.text.to_ascii_lowercase().parse::<ErrorLevel>() else {
            self.diag
                .emit(WarningCode::MalformedMacro, level.loc, format!("Unknown error level \"{}\"", level.text));
            return;
        };
        self.diag.set_pragma(code, level);
    }

    // ------------------------------------------------------------------
    // Conditionals

    /// Skips tokens after a false `#if`/`#elif` until a branch to take or
    /// the matching `#endif`.
    fn skip_false_branch(&mut self, loc: Location) {
        let mut depth = 0u32;
        loop {
            let Some(token) = self.next_raw() else {
                self.diag.error(loc, "Unterminated conditional directive");
                self.last_ifs.pop();
                return;
            };
            match token.kind {
                TokenKind::DirIf | TokenKind::DirIfdef | TokenKind::DirIfndef => depth += 1,
                TokenKind::DirEndif if depth == 0 => {
                    self.last_ifs.pop();
                    return;
                }
                TokenKind::DirEndif => depth -= 1,
                TokenKind::DirElif if depth == 0 => {
                    let line = self.read_line();
                    if self.eval_condition(&line, token.loc) {
                        if let Some(last) = self.last_ifs.last_mut() {
                            *last = true;
                        }
                        return;
                    }
                }
                TokenKind::DirElse if depth == 0 => {
                    if let Some(last) = self.last_ifs.last_mut() {
                        *last = true;
                    }
                    return;
                }
                _ => {}
            }
        }
    }

    /// Skips to the `#endif` matching the conditional currently on top of
    /// the evaluation stack, popping it.
    fn skip_to_endif(&mut self, loc: Location) {
        let mut depth = 0u32;
        loop {
            let Some(token) = self.next_raw() else {
                self.diag.error(loc, "Unterminated conditional directive");
                self.last_ifs.pop();
                return;
            };
            match token.kind {
                TokenKind::DirIf | TokenKind::DirIfdef | TokenKind::DirIfndef => depth += 1,
                TokenKind::DirEndif if depth == 0 => {
                    self.last_ifs.pop();
                    return;
                }
                TokenKind::DirEndif => depth -= 1,
                _ => {}
            }
        }
    }

    /// Evaluates a `#if` constant expression over tokens.
    fn eval_condition(&mut self, tokens: &[Token], loc: Location) -> bool {
        let mut expanded = Vec::new();
        let mut seen = AHashSet::new();
        self.expand_condition_tokens(tokens, &mut expanded, &mut seen, 0);
        let mut parser = CondParser {
            tokens: &expanded,
            pos: 0,
            failed: false,
        };
        let value = parser.parse_or();
        if parser.failed {
            self.diag
                .emit(WarningCode::MalformedMacro, loc, "Malformed conditional expression");
        }
        value != 0.0
    }

    fn expand_condition_tokens(
        &mut self,
        tokens: &[Token],
        out: &mut Vec<Token>,
        seen: &mut AHashSet<String>,
        depth: u32,
    ) {
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            if token.kind == TokenKind::Whitespace {
                i += 1;
                continue;
            }
            if token.kind == TokenKind::Identifier && token.text == "defined" {
                // defined(NAME)
                let name = tokens.get(i + 2).filter(|_| {
                    matches!(tokens.get(i + 1), Some(t) if t.kind == TokenKind::LeftParen)
                        && matches!(tokens.get(i + 3), Some(t) if t.kind == TokenKind::RightParen)
                });
                if let Some(name) = name {
                    let value = i64::from(self.is_defined(&name.text));
                    out.push(Token::with_value(TokenKind::Number, value.to_string(), token.loc, TokenValue::Int(value)));
                    i += 4;
                    continue;
                }
                self.diag
                    .emit(WarningCode::MalformedMacro, token.loc, "Expected defined(NAME)");
                i += 1;
                continue;
            }
            if token.kind == TokenKind::Identifier && depth < 32 && !seen.contains(&token.text) {
                match self.defines.get(&token.text).cloned() {
                    Some(Macro::Text(body)) => {
                        seen.insert(token.text.clone());
                        self.expand_condition_tokens(&body, out, seen, depth + 1);
                        seen.remove(&token.text);
                        i += 1;
                        continue;
                    }
                    Some(Macro::Line) => {
                        let line = i64::from(token.loc.line);
                        out.push(Token::with_value(TokenKind::Number, line.to_string(), token.loc, TokenValue::Int(line)));
                        i += 1;
                        continue;
                    }
                    Some(Macro::Version) => {
                        out.push(self.number_token(self.dm_version, token.loc));
                        i += 1;
                        continue;
                    }
                    Some(Macro::Build) => {
                        out.push(self.number_token(self.dm_build, token.loc));
                        i += 1;
                        continue;
                    }
                    Some(Macro::Function { .. } | Macro::File) | None => {
                        // Undefined names evaluate to 0 in conditionals.
                        out.push(Token::with_value(TokenKind::Number, "0", token.loc, TokenValue::Int(0)));
                        i += 1;
                        continue;
                    }
                }
            }
            out.push(token.clone());
            i += 1;
        }
    }

    fn number_token(&self, value: i64, loc: Location) -> Token {
        Token::with_value(TokenKind::Number, value.to_string(), loc, TokenValue::Int(value))
    }

    // ------------------------------------------------------------------
    // Macro expansion

    fn try_expand(&mut self, token: &Token) -> bool {
        if self.expansions.iter().any(|g| g.name == token.text) {
            return false;
        }
        let Some(mac) = self.defines.get(&token.text).cloned() else {
            return false;
        };
        match mac {
            Macro::Text(body) => {
                self.push_expansion(&token.text, body);
                true
            }
            Macro::Function { params, body } => {
                let Some(next) = self.next_raw() else {
                    return false;
                };
                if next.kind != TokenKind::LeftParen {
                    self.pushback.push(next);
                    return false;
                }
                let args = self.read_macro_args(token.loc);
                if args.len() != params.len() && !(params.is_empty() && args.len() == 1 && args[0].is_empty()) {
                    self.diag.emit(
                        WarningCode::MalformedMacro,
                        token.loc,
                        format!("Macro {} expects {} arguments, got {}", token.text, params.len(), args.len()),
                    );
                }
                let result = substitute(&params, &body, &args);
                self.push_expansion(&token.text, result);
                true
            }
            Macro::Line => {
                let line = i64::from(token.loc.line);
                self.pushback
                    .push(Token::with_value(TokenKind::Number, line.to_string(), token.loc, TokenValue::Int(line)));
                true
            }
            Macro::File => {
                let path = self.diag.files.path(token.loc.file).to_owned();
                self.pushback.push(Token::with_value(
                    TokenKind::String,
                    path.clone(),
                    token.loc,
                    TokenValue::Str(path),
                ));
                true
            }
            Macro::Version => {
                let tok = self.number_token(self.dm_version, token.loc);
                self.pushback.push(tok);
                true
            }
            Macro::Build => {
                let tok = self.number_token(self.dm_build, token.loc);
                self.pushback.push(tok);
                true
            }
        }
    }

    /// Reads a parenthesized, comma-separated argument list. Each argument
    /// is a token vector; commas nested in brackets do not split.
    fn read_macro_args(&mut self, loc: Location) -> Vec<Vec<Token>> {
        let mut args: Vec<Vec<Token>> = vec![Vec::new()];
        let mut depth = 1u32;
        loop {
            let Some(token) = self.next_raw() else {
                self.diag.emit(WarningCode::MalformedMacro, loc, "Unterminated macro argument list");
                return args;
            };
            match token.kind {
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::QuestionBracket => {
                    depth += 1;
                    args.last_mut().expect("args never empty").push(token);
                }
                TokenKind::RightParen if depth == 1 => return args,
                TokenKind::RightParen | TokenKind::RightBracket => {
                    depth = depth.saturating_sub(1);
                    args.last_mut().expect("args never empty").push(token);
                }
                TokenKind::Comma if depth == 1 => args.push(Vec::new()),
                TokenKind::Whitespace | TokenKind::Newline => {}
                _ => args.last_mut().expect("args never empty").push(token),
            }
        }
    }

    fn push_expansion(&mut self, name: &str, tokens: Vec<Token>) {
        let floor = self.pushback.len();
        for token in tokens.into_iter().rev() {
            self.pushback.push(token);
        }
        self.expansions.push(ExpansionGuard {
            name: name.to_owned(),
            floor,
        });
    }

    // ------------------------------------------------------------------
    // Helpers

    /// Reads the remaining tokens of the current line, consuming but not
    /// returning the terminating newline.
    fn read_line(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        while let Some(token) = self.next_raw() {
            if token.kind == TokenKind::Newline {
                self.can_use_directive = true;
                break;
            }
            tokens.push(token);
        }
        tokens
    }

    fn next_raw_skip_ws(&mut self) -> Option<Token> {
        loop {
            let token = self.next_raw()?;
            if token.kind != TokenKind::Whitespace {
                return Some(token);
            }
        }
    }

    fn push_file(&mut self, path: &Path, loc: Location) -> bool {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                self.diag.error(loc, format!("Failed to read {}: {err}", path.display()));
                return false;
            }
        };
        let file = self.diag.files.intern(&path.display().to_string());
        let dir = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        self.stack.push(FileContext {
            lexer: Lexer::new(file, source, self.in_standard, true),
            path: path.to_path_buf(),
            dir,
        });
        true
    }

    fn resolve_path(&mut self, raw: &str) -> Option<PathBuf> {
        let dir = self
            .stack
            .last()
            .map_or_else(|| PathBuf::from("."), |ctx| ctx.dir.clone());
        let key = format!("{}\u{0}{raw}", dir.display());
        if let Some(cached) = self.path_cache.get(&key) {
            return cached.clone();
        }
        let normalized = raw.replace('\\', "/");
        let mut candidates = vec![dir.join(&normalized)];
        for lib in &self.lib_paths {
            candidates.push(lib.join(&normalized));
        }
        let resolved = candidates.into_iter().map(normalize_lexically).find(|c| c.exists());
        self.path_cache.insert(key, resolved.clone());
        resolved
    }

    fn include_chain(&self) -> String {
        if self.stack.len() <= 1 {
            return String::new();
        }
        let chain: Vec<String> = self.stack.iter().map(|c| c.path.display().to_string()).collect();
        format!("\n    Included via: {}", chain.join(" -> "))
    }
}

/// Substitutes macro arguments into a body, handling `#param` stringification
/// and `##` token pasting.
fn substitute(params: &[String], body: &[Token], args: &[Vec<Token>]) -> Vec<Token> {
    let mut out: Vec<Token> = Vec::with_capacity(body.len());
    for token in body {
        match token.kind {
            TokenKind::Identifier => {
                if let Some(index) = params.iter().position(|p| *p == token.text) {
                    out.extend(args.get(index).cloned().unwrap_or_default());
                } else {
                    out.push(token.clone());
                }
            }
            TokenKind::Stringify => {
                if let Some(index) = params.iter().position(|p| *p == token.text) {
                    let text = args
                        .get(index)
                        .map(|arg| join_token_text(arg))
                        .unwrap_or_default();
                    out.push(Token::with_value(TokenKind::String, text.clone(), token.loc, TokenValue::Str(text)));
                } else {
                    out.push(token.clone());
                }
            }
            _ => out.push(token.clone()),
        }
    }

    // Token pasting pass.
    let mut merged: Vec<Token> = Vec::with_capacity(out.len());
    let mut iter = out.into_iter().peekable();
    while let Some(token) = iter.next() {
        if token.kind != TokenKind::TokenConcat {
            merged.push(token);
            continue;
        }
        let (Some(left), Some(right)) = (merged.pop(), iter.next()) else {
            continue;
        };
        merged.push(concat_tokens(&left, &right));
    }
    merged
}

/// Pastes two tokens into one identifier or number.
fn concat_tokens(left: &Token, right: &Token) -> Token {
    let text = format!("{}{}", left.text, right.text);
    if text.chars().all(|c| c.is_ascii_digit()) {
        let value = text.parse::<i64>().unwrap_or(0);
        return Token::with_value(TokenKind::Number, text, left.loc, TokenValue::Int(value));
    }
    let kind = TokenKind::keyword(&text).unwrap_or(TokenKind::Identifier);
    Token::new(kind, text, left.loc)
}

fn join_token_text(tokens: &[Token]) -> String {
    tokens
        .iter()
        .filter(|t| t.kind != TokenKind::Whitespace)
        .map(|t| t.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lexically resolves `.` and `..` components without touching the
/// filesystem.
fn normalize_lexically(path: PathBuf) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| normalize_lexically(path.to_path_buf()))
}

/// Parser for `#if` constant expressions; numeric, with C-like precedence.
struct CondParser<'t> {
    tokens: &'t [Token],
    pos: usize,
    failed: bool,
}

impl CondParser<'_> {
    fn peek_kind(&self) -> Option<TokenKind> {
        self.tokens.get(self.pos).map(|t| t.kind)
    }

    fn bump(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token)
    }

    fn parse_or(&mut self) -> f64 {
        let mut value = self.parse_and();
        while self.peek_kind() == Some(TokenKind::Or) {
            self.bump();
            let rhs = self.parse_and();
            value = f64::from(value != 0.0 || rhs != 0.0);
        }
        value
    }

    fn parse_and(&mut self) -> f64 {
        let mut value = self.parse_bitor();
        while self.peek_kind() == Some(TokenKind::And) {
            self.bump();
            let rhs = self.parse_bitor();
            value = f64::from(value != 0.0 && rhs != 0.0);
        }
        value
    }

    fn parse_bitor(&mut self) -> f64 {
        let mut value = self.parse_bitxor();
        while self.peek_kind() == Some(TokenKind::BitOr) {
            self.bump();
            let rhs = self.parse_bitxor();
            value = ((value as i64) | (rhs as i64)) as f64;
        }
        value
    }

    fn parse_bitxor(&mut self) -> f64 {
        let mut value = self.parse_bitand();
        while self.peek_kind() == Some(TokenKind::BitXor) {
            self.bump();
            let rhs = self.parse_bitand();
            value = ((value as i64) ^ (rhs as i64)) as f64;
        }
        value
    }

    fn parse_bitand(&mut self) -> f64 {
        let mut value = self.parse_equality();
        while self.peek_kind() == Some(TokenKind::BitAnd) {
            self.bump();
            let rhs = self.parse_equality();
            value = ((value as i64) & (rhs as i64)) as f64;
        }
        value
    }

    fn parse_equality(&mut self) -> f64 {
        let mut value = self.parse_relational();
        loop {
            match self.peek_kind() {
                Some(TokenKind::Equals) => {
                    self.bump();
                    value = f64::from(value == self.parse_relational());
                }
                Some(TokenKind::NotEquals) => {
                    self.bump();
                    value = f64::from(value != self.parse_relational());
                }
                _ => return value,
            }
        }
    }

    fn parse_relational(&mut self) -> f64 {
        let mut value = self.parse_shift();
        loop {
            match self.peek_kind() {
                Some(TokenKind::Less) => {
                    self.bump();
                    value = f64::from(value < self.parse_shift());
                }
                Some(TokenKind::LessOrEqual) => {
                    self.bump();
                    value = f64::from(value <= self.parse_shift());
                }
                Some(TokenKind::Greater) => {
                    self.bump();
                    value = f64::from(value > self.parse_shift());
                }
                Some(TokenKind::GreaterOrEqual) => {
                    self.bump();
                    value = f64::from(value >= self.parse_shift());
                }
                _ => return value,
            }
        }
    }

    fn parse_shift(&mut self) -> f64 {
        let mut value = self.parse_additive();
        loop {
            match self.peek_kind() {
                Some(TokenKind::LeftShift) => {
                    self.bump();
                    let rhs = self.parse_additive() as i64;
                    value = ((value as i64) << rhs.clamp(0, 63)) as f64;
                }
                Some(TokenKind::RightShift) => {
                    self.bump();
                    let rhs = self.parse_additive() as i64;
                    value = ((value as i64) >> rhs.clamp(0, 63)) as f64;
                }
                _ => return value,
            }
        }
    }

    fn parse_additive(&mut self) -> f64 {
        let mut value = self.parse_multiplicative();
        loop {
            match self.peek_kind() {
                Some(TokenKind::Plus) => {
                    self.bump();
                    value += self.parse_multiplicative();
                }
                Some(TokenKind::Minus) => {
                    self.bump();
                    value -= self.parse_multiplicative();
                }
                _ => return value,
            }
        }
    }

    fn parse_multiplicative(&mut self) -> f64 {
        let mut value = self.parse_unary();
        loop {
            match self.peek_kind() {
                Some(TokenKind::Star) => {
                    self.bump();
                    value *= self.parse_unary();
                }
                Some(TokenKind::Slash) => {
                    self.bump();
                    let rhs = self.parse_unary();
                    value = if rhs == 0.0 { 0.0 } else { value / rhs };
                }
                Some(TokenKind::Percent) => {
                    self.bump();
                    let rhs = self.parse_unary();
                    value = if rhs == 0.0 { 0.0 } else { ((value as i64) % (rhs as i64)) as f64 };
                }
                _ => return value,
            }
        }
    }

    fn parse_unary(&mut self) -> f64 {
        match self.peek_kind() {
            Some(TokenKind::Not) => {
                self.bump();
                f64::from(self.parse_unary() == 0.0)
            }
            Some(TokenKind::Minus) => {
                self.bump();
                -self.parse_unary()
            }
            Some(TokenKind::BitNot) => {
                self.bump();
                !(self.parse_unary() as i64) as f64
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> f64 {
        match self.peek_kind() {
            Some(TokenKind::Number) => {
                let token = self.bump().expect("peeked");
                match token.value {
                    Some(TokenValue::Int(i)) => i as f64,
                    Some(TokenValue::Float(f)) => f,
                    _ => 0.0,
                }
            }
            Some(TokenKind::LeftParen) => {
                self.bump();
                let value = self.parse_or();
                if self.peek_kind() == Some(TokenKind::RightParen) {
                    self.bump();
                } else {
                    self.failed = true;
                }
                value
            }
            _ => {
                self.failed = true;
                self.bump();
                0.0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::diagnostics::Diagnostics;

    fn preprocess(source: &str) -> (Vec<Token>, Diagnostics) {
        let mut diag = Diagnostics::new(100, false);
        let mut out = Vec::new();
        {
            let mut pp = Preprocessor::new(&mut diag, Vec::new(), 515, 1655);
            pp.preprocess_source("test.dm", source.to_owned(), false, &mut out);
        }
        (out, diag)
    }

    fn significant(tokens: &[Token]) -> Vec<String> {
        tokens
            .iter()
            .filter(|t| !matches!(t.kind, TokenKind::Whitespace | TokenKind::Newline))
            .map(|t| t.text.clone())
            .collect()
    }

    #[test]
    fn text_macro_expands() {
        let (tokens, diag) = preprocess("#define HEALTH 100\nvar/x = HEALTH\n");
        assert_eq!(diag.error_count(), 0);
        assert_eq!(significant(&tokens), vec!["var", "/", "x", "=", "100"]);
    }

    #[test]
    fn function_macro_with_multi_token_args() {
        let (tokens, _) = preprocess("#define SQ(x) ((x)*(x))\nSQ(3+1)\n");
        assert_eq!(
            significant(&tokens),
            vec!["(", "(", "3", "+", "1", ")", "*", "(", "3", "+", "1", ")", ")"]
        );
    }

    #[test]
    fn self_referential_macro_terminates() {
        let (tokens, _) = preprocess("#define X X\nX\n");
        assert_eq!(significant(&tokens), vec!["X"]);
    }

    #[test]
    fn mutually_recursive_macros_terminate() {
        let (tokens, _) = preprocess("#define A B\n#define B A\nA\n");
        assert_eq!(significant(&tokens), vec!["A"]);
    }

    #[test]
    fn conditional_false_branch_skipped() {
        let (tokens, _) = preprocess("#if 0\nvar/a = 1\n#else\nvar/b = 2\n#endif\n");
        assert_eq!(significant(&tokens), vec!["var", "/", "b", "=", "2"]);
    }

    #[test]
    fn elif_chain() {
        let (tokens, _) = preprocess("#if 0\na\n#elif 1\nb\n#elif 2\nc\n#else\nd\n#endif\n");
        assert_eq!(significant(&tokens), vec!["b"]);
    }

    #[test]
    fn nested_conditionals_skip_correctly() {
        let (tokens, _) = preprocess("#if 0\n#if 1\na\n#endif\nb\n#else\nc\n#endif\n");
        assert_eq!(significant(&tokens), vec!["c"]);
    }

    #[test]
    fn ifdef_and_defined() {
        let (tokens, _) = preprocess("#define FLAG\n#ifdef FLAG\nyes\n#endif\n#if defined(FLAG) && !defined(OTHER)\nboth\n#endif\n");
        assert_eq!(significant(&tokens), vec!["yes", "both"]);
    }

    #[test]
    fn undef_removes_definition() {
        let (tokens, _) = preprocess("#define FLAG 1\n#undef FLAG\n#ifdef FLAG\nyes\n#else\nno\n#endif\n");
        assert_eq!(significant(&tokens), vec!["no"]);
    }

    #[test]
    fn condition_arithmetic() {
        let (tokens, _) = preprocess("#if (1 + 2) * 2 > 5\nbig\n#endif\n#if 1 << 3 == 8\nshift\n#endif\n");
        assert_eq!(significant(&tokens), vec!["big", "shift"]);
    }

    #[test]
    fn stringify_and_concat() {
        let (tokens, _) = preprocess("#define NAME(a, b) #a\n#define GLUE(a, b) a##b\nNAME(hello, x)\nGLUE(var, iable)\n");
        let texts = significant(&tokens);
        assert_eq!(texts, vec!["hello", "variable"]);
        assert_eq!(tokens.iter().filter(|t| t.kind == TokenKind::String).count(), 1);
    }

    #[test]
    fn error_directive_reports() {
        let (_, diag) = preprocess("#error this is broken\n");
        assert_eq!(diag.error_count(), 1);
        assert!(diag.messages()[0].contains("this is broken"));
    }

    #[test]
    fn warning_directive_reports() {
        let (_, diag) = preprocess("#warn careful\n");
        assert_eq!(diag.warning_count(), 1);
        assert_eq!(diag.error_count(), 0);
    }

    #[test]
    fn pragma_updates_levels() {
        let (_, diag) = preprocess("#pragma UnknownVariable error\n");
        assert_eq!(diag.level_of(WarningCode::UnknownVariable), ErrorLevel::Error);
    }

    #[test]
    fn line_macro_expands_to_current_line() {
        let (tokens, _) = preprocess("\n\n__LINE__\n");
        assert_eq!(significant(&tokens), vec!["3"]);
    }

    #[test]
    fn whitespace_is_retained_for_indentation() {
        let (tokens, _) = preprocess("mob\n\thealth = 1\n");
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Whitespace && t.text == "\t"));
    }

    #[test]
    fn directive_not_at_line_start_is_identifier() {
        let (tokens, _) = preprocess("var/x = 1 ; #define Y 2\nY\n");
        // The mid-line directive does not define anything, so Y stays put.
        let texts = significant(&tokens);
        assert!(texts.contains(&"define".to_owned()));
        assert_eq!(*texts.last().unwrap(), "Y");
    }

    #[test]
    fn unbalanced_endif_reports() {
        let (_, diag) = preprocess("#endif\n");
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn unterminated_if_reports() {
        let (_, diag) = preprocess("#if 1\nx\n");
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn function_macro_without_call_stays_identifier() {
        let (tokens, _) = preprocess("#define F(x) (x)\nF\n");
        assert_eq!(significant(&tokens), vec!["F"]);
    }

    #[test]
    fn preprocessing_is_deterministic() {
        let source = "#define A 1\n#define B(x) (x+A)\nvar/y = B(2)\n";
        let (first, _) = preprocess(source);
        let (second, _) = preprocess(source);
        assert_eq!(first, second);
    }
}
