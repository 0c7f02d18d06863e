//! The character lexer: DM source text to a token stream.
//!
//! Emits newline tokens and (when asked) leading-whitespace tokens, since
//! the indent layer downstream measures them. Comments are consumed here.
//! String tokens keep the raw source text so the parser can detect embedded
//! `[expression]` slots; the processed value travels in the token payload.

use crate::{
    diagnostics::{Diagnostics, WarningCode},
    location::{FileId, Location},
    token::{Token, TokenKind, TokenValue},
};

/// Soft limit on identifier length.
pub const MAX_IDENTIFIER_LENGTH: usize = 1000;
/// Limit on string literal length (1 MiB).
pub const MAX_STRING_LENGTH: usize = 1024 * 1024;

/// Streaming lexer over one source file.
#[derive(Debug)]
pub struct Lexer {
    source: String,
    pos: usize,
    file: FileId,
    line: u32,
    column: u32,
    in_standard: bool,
    emit_whitespace: bool,
    at_line_start: bool,
    at_end: bool,
}

impl Lexer {
    #[must_use]
    pub fn new(file: FileId, source: String, in_standard: bool, emit_whitespace: bool) -> Self {
        Self {
            source,
            pos: 0,
            file,
            line: 1,
            column: 1,
            in_standard,
            emit_whitespace,
            at_line_start: true,
            at_end: false,
        }
    }

    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.at_end
    }

    fn loc(&self) -> Location {
        Location::new(self.file, self.line, self.column, self.in_standard)
    }

    fn current(&self) -> Option<u8> {
        self.source.as_bytes().get(self.pos).copied()
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.source.as_bytes().get(self.pos + offset).copied()
    }

    fn advance(&mut self) {
        if let Some(b) = self.current() {
            self.pos += 1;
            if b == b'\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }

    fn eat(&mut self, count: usize) {
        for _ in 0..count {
            self.advance();
        }
    }

    /// Returns the next token, or an end-of-file token once exhausted.
    pub fn next_token(&mut self, diag: &mut Diagnostics) -> Token {
        loop {
            let Some(b) = self.current() else {
                self.at_end = true;
                return Token::new(TokenKind::EndOfFile, "", self.loc());
            };

            // Leading whitespace becomes a token for the indent layer;
            // interior whitespace is skipped.
            if b == b' ' || b == b'\t' || b == b'\r' {
                let start = self.pos;
                let loc = self.loc();
                while matches!(self.current(), Some(b' ' | b'\t' | b'\r')) {
                    self.advance();
                }
                if self.at_line_start && self.emit_whitespace && self.current() != Some(b'\n') {
                    self.at_line_start = false;
                    let text: String = self.source[start..self.pos].chars().filter(|c| *c != '\r').collect();
                    return Token::new(TokenKind::Whitespace, text, loc);
                }
                continue;
            }

            // Line splice: backslash directly before the line break.
            if b == b'\\' && matches!(self.peek(1), Some(b'\n')) {
                self.advance();
                self.advance();
                continue;
            }
            if b == b'\\' && self.peek(1) == Some(b'\r') && self.peek(2) == Some(b'\n') {
                self.eat(3);
                continue;
            }

            if b == b'/' && self.peek(1) == Some(b'/') {
                while self.current().is_some_and(|c| c != b'\n') {
                    self.advance();
                }
                continue;
            }
            if b == b'/' && self.peek(1) == Some(b'*') {
                self.skip_block_comment();
                continue;
            }

            if b == b'\n' {
                let loc = self.loc();
                self.advance();
                self.at_line_start = true;
                return Token::new(TokenKind::Newline, "\n", loc);
            }

            self.at_line_start = false;

            if b == b'{' && self.peek(1) == Some(b'"') {
                return self.lex_multiline_string(diag);
            }
            if b == b'"' {
                return self.lex_string(diag);
            }
            if b == b'\'' {
                return self.lex_resource(diag);
            }
            if b.is_ascii_digit() || (b == b'.' && self.peek(1).is_some_and(|c| c.is_ascii_digit())) {
                return self.lex_number();
            }
            if b == b'#' {
                if let Some(token) = self.lex_hash() {
                    return token;
                }
                continue;
            }
            if is_identifier_start(b) {
                return self.lex_identifier(diag);
            }

            return self.lex_operator(diag);
        }
    }

    /// Drains the remaining tokens, excluding the trailing end-of-file.
    pub fn lex_all(&mut self, diag: &mut Diagnostics) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token(diag);
            if token.kind == TokenKind::EndOfFile {
                return tokens;
            }
            tokens.push(token);
        }
    }

    fn skip_block_comment(&mut self) {
        self.advance();
        self.advance();
        let mut depth = 1u32;
        while let Some(b) = self.current() {
            if b == b'*' && self.peek(1) == Some(b'/') {
                self.advance();
                self.advance();
                depth -= 1;
                if depth == 0 {
                    break;
                }
            } else if b == b'/' && self.peek(1) == Some(b'*') {
                self.advance();
                self.advance();
                depth += 1;
            } else {
                self.advance();
            }
        }
        // Trailing spaces after the close keep column accounting consistent
        // with the line's remaining tokens.
        while matches!(self.current(), Some(b' ' | b'\t')) {
            self.advance();
        }
    }

    fn lex_identifier(&mut self, diag: &mut Diagnostics) -> Token {
        let loc = self.loc();
        let start = self.pos;
        let mut truncated = false;
        while self.current().is_some_and(is_identifier_char) {
            if self.pos - start >= MAX_IDENTIFIER_LENGTH {
                truncated = true;
                break;
            }
            self.advance();
        }
        if truncated {
            diag.emit(WarningCode::BadToken, loc, "Identifier exceeds maximum length");
            while self.current().is_some_and(is_identifier_char) {
                self.advance();
            }
        }
        let text = &self.source[start..(start + (self.pos - start).min(MAX_IDENTIFIER_LENGTH))];
        let kind = TokenKind::keyword(text).unwrap_or(TokenKind::Identifier);
        Token::new(kind, text, loc)
    }

    fn lex_number(&mut self) -> Token {
        let loc = self.loc();
        let start = self.pos;
        let mut is_float = false;
        let mut is_hex = false;

        if self.current() == Some(b'0') && matches!(self.peek(1), Some(b'x' | b'X')) {
            is_hex = true;
            self.advance();
            self.advance();
            while self.current().is_some_and(|b| b.is_ascii_hexdigit()) {
                self.advance();
            }
        } else {
            while self.current().is_some_and(|b| b.is_ascii_digit()) {
                self.advance();
            }
            if self.current() == Some(b'.') && self.peek(1).is_some_and(|b| b.is_ascii_digit()) {
                is_float = true;
                self.advance();
                while self.current().is_some_and(|b| b.is_ascii_digit()) {
                    self.advance();
                }
            }
            if matches!(self.current(), Some(b'e' | b'E')) {
                let mut lookahead = 1;
                if matches!(self.peek(1), Some(b'+' | b'-')) {
                    lookahead = 2;
                }
                if self.peek(lookahead).is_some_and(|b| b.is_ascii_digit()) {
                    is_float = true;
                    self.eat(lookahead);
                    while self.current().is_some_and(|b| b.is_ascii_digit()) {
                        self.advance();
                    }
                }
            }
        }

        let text = self.source[start..self.pos].to_owned();
        let value = if is_float {
            TokenValue::Float(text.parse::<f64>().unwrap_or(0.0))
        } else if is_hex {
            i64::from_str_radix(&text[2..], 16).map_or_else(|_| TokenValue::Float(f64::INFINITY), TokenValue::Int)
        } else {
            text.parse::<i64>()
                .map_or_else(|_| TokenValue::Float(text.parse::<f64>().unwrap_or(f64::INFINITY)), TokenValue::Int)
        };
        Token {
            kind: TokenKind::Number,
            text,
            loc,
            value: Some(value),
        }
    }

    fn lex_string(&mut self, diag: &mut Diagnostics) -> Token {
        let loc = self.loc();
        self.advance(); // opening quote
        let start = self.pos;
        let mut terminated = false;
        while let Some(b) = self.current() {
            if b == b'"' {
                terminated = true;
                break;
            }
            if b == b'\n' {
                break;
            }
            if b == b'\\' && self.peek(1).is_some() {
                self.advance();
            }
            if self.pos - start > MAX_STRING_LENGTH {
                diag.emit(WarningCode::BadToken, loc, "String literal exceeds maximum length");
                break;
            }
            self.advance();
        }
        let raw = self.source[start..self.pos].to_owned();
        if terminated {
            self.advance(); // closing quote
        } else {
            diag.emit(WarningCode::BadToken, loc, "Unterminated string literal");
        }
        let value = TokenValue::Str(unescape(&raw));
        Token {
            kind: TokenKind::String,
            text: raw,
            loc,
            value: Some(value),
        }
    }

    fn lex_multiline_string(&mut self, diag: &mut Diagnostics) -> Token {
        let loc = self.loc();
        self.advance(); // {
        self.advance(); // "
        let start = self.pos;
        let mut terminated = false;
        while let Some(b) = self.current() {
            if b == b'"' && self.peek(1) == Some(b'}') {
                terminated = true;
                break;
            }
            if self.pos - start > MAX_STRING_LENGTH {
                diag.emit(WarningCode::BadToken, loc, "String literal exceeds maximum length");
                break;
            }
            self.advance();
        }
        let raw = self.source[start..self.pos].to_owned();
        if terminated {
            self.advance(); // "
            self.advance(); // }
        } else {
            diag.emit(WarningCode::BadToken, loc, "Unterminated multi-line string literal");
        }
        let value = TokenValue::Str(raw.clone());
        Token {
            kind: TokenKind::String,
            text: raw,
            loc,
            value: Some(value),
        }
    }

    fn lex_resource(&mut self, diag: &mut Diagnostics) -> Token {
        let loc = self.loc();
        self.advance(); // opening '
        let start = self.pos;
        let mut terminated = false;
        while let Some(b) = self.current() {
            if b == b'\'' {
                terminated = true;
                break;
            }
            if b == b'\n' {
                break;
            }
            self.advance();
        }
        let text = self.source[start..self.pos].to_owned();
        if terminated {
            self.advance();
        } else {
            diag.emit(WarningCode::BadToken, loc, "Unterminated resource literal");
        }
        let value = TokenValue::Str(text.clone());
        Token {
            kind: TokenKind::Resource,
            text,
            loc,
            value: Some(value),
        }
    }

    /// Lexes `#`-introduced tokens. `None` means the token was consumed
    /// without producing output (a stray `#`).
    fn lex_hash(&mut self) -> Option<Token> {
        let loc = self.loc();
        if self.peek(1) == Some(b'#') {
            self.advance();
            self.advance();
            return Some(Token::new(TokenKind::TokenConcat, "##", loc));
        }
        self.advance(); // #
        while matches!(self.current(), Some(b' ' | b'\t')) {
            self.advance();
        }
        let start = self.pos;
        while self.current().is_some_and(is_identifier_char) {
            self.advance();
        }
        let name = self.source[start..self.pos].to_owned();
        if name.is_empty() {
            return None;
        }
        let kind = match name.to_ascii_lowercase().as_str() {
            "include" => TokenKind::DirInclude,
            "define" => TokenKind::DirDefine,
            "undef" => TokenKind::DirUndef,
            "if" => TokenKind::DirIf,
            "ifdef" => TokenKind::DirIfdef,
            "ifndef" => TokenKind::DirIfndef,
            "elif" => TokenKind::DirElif,
            "else" => TokenKind::DirElse,
            "endif" => TokenKind::DirEndif,
            "error" => TokenKind::DirError,
            "warn" | "warning" => TokenKind::DirWarning,
            "pragma" => TokenKind::DirPragma,
            // A macro-body parameter stringification like `#x`.
            _ => return Some(Token::new(TokenKind::Stringify, name, loc)),
        };
        Some(Token::new(kind, format!("#{name}"), loc))
    }

    fn lex_operator(&mut self, diag: &mut Diagnostics) -> Token {
        let loc = self.loc();
        let b0 = self.current().unwrap_or(0);
        let b1 = self.peek(1).unwrap_or(0);
        let b2 = self.peek(2).unwrap_or(0);

        let three = match (b0, b1, b2) {
            (b'|', b'|', b'=') => Some(TokenKind::OrAssign),
            (b'&', b'&', b'=') => Some(TokenKind::AndAssign),
            (b'%', b'%', b'=') => Some(TokenKind::PercentPercentAssign),
            (b'<', b'<', b'=') => Some(TokenKind::LeftShiftAssign),
            (b'>', b'>', b'=') => Some(TokenKind::RightShiftAssign),
            (b'.', b'.', b'.') => Some(TokenKind::DotDotDot),
            _ => None,
        };
        if let Some(kind) = three {
            let text = self.source[self.pos..self.pos + 3].to_owned();
            self.eat(3);
            return Token::new(kind, text, loc);
        }

        let two = match (b0, b1) {
            (b'=', b'=') => Some(TokenKind::Equals),
            (b'!', b'=') => Some(TokenKind::NotEquals),
            (b'<', b'=') => Some(TokenKind::LessOrEqual),
            (b'>', b'=') => Some(TokenKind::GreaterOrEqual),
            (b'&', b'&') => Some(TokenKind::And),
            (b'|', b'|') => Some(TokenKind::Or),
            (b'<', b'<') => Some(TokenKind::LeftShift),
            (b'>', b'>') => Some(TokenKind::RightShift),
            (b'+', b'+') => Some(TokenKind::Increment),
            (b'-', b'-') => Some(TokenKind::Decrement),
            (b'+', b'=') => Some(TokenKind::PlusAssign),
            (b'-', b'=') => Some(TokenKind::MinusAssign),
            (b'*', b'*') => Some(TokenKind::Power),
            (b'*', b'=') => Some(TokenKind::StarAssign),
            (b'/', b'=') => Some(TokenKind::SlashAssign),
            (b'%', b'%') => Some(TokenKind::PercentPercent),
            (b'%', b'=') => Some(TokenKind::PercentAssign),
            (b'&', b'=') => Some(TokenKind::BitAndAssign),
            (b'|', b'=') => Some(TokenKind::BitOrAssign),
            (b'^', b'=') => Some(TokenKind::BitXorAssign),
            (b'~', b'=') => Some(TokenKind::TildeEquals),
            (b'~', b'!') => Some(TokenKind::TildeNotEquals),
            (b'?', b'.') => Some(TokenKind::QuestionDot),
            (b'?', b':') => Some(TokenKind::QuestionColon),
            (b'?', b'[') => Some(TokenKind::QuestionBracket),
            (b'.', b'.') => Some(TokenKind::DotDot),
            (b':', b':') => Some(TokenKind::DoubleColon),
            (b':', b'=') => Some(TokenKind::AssignInto),
            _ => None,
        };
        if let Some(kind) = two {
            let text = self.source[self.pos..self.pos + 2].to_owned();
            self.eat(2);
            return Token::new(kind, text, loc);
        }

        let kind = match b0 {
            b'(' => TokenKind::LeftParen,
            b')' => TokenKind::RightParen,
            b'[' => TokenKind::LeftBracket,
            b']' => TokenKind::RightBracket,
            b'{' => TokenKind::LeftBrace,
            b'}' => TokenKind::RightBrace,
            b';' => TokenKind::Semicolon,
            b',' => TokenKind::Comma,
            b':' => TokenKind::Colon,
            b'.' => TokenKind::Dot,
            b'?' => TokenKind::Question,
            b'=' => TokenKind::Assign,
            b'+' => TokenKind::Plus,
            b'-' => TokenKind::Minus,
            b'*' => TokenKind::Star,
            b'/' => TokenKind::Slash,
            b'%' => TokenKind::Percent,
            b'<' => TokenKind::Less,
            b'>' => TokenKind::Greater,
            b'!' => TokenKind::Not,
            b'&' => TokenKind::BitAnd,
            b'|' => TokenKind::BitOr,
            b'^' => TokenKind::BitXor,
            b'~' => TokenKind::BitNot,
            _ => {
                self.advance();
                diag.emit(WarningCode::BadToken, loc, format!("Unknown character '{}'", b0 as char));
                return Token::new(TokenKind::Unknown, (b0 as char).to_string(), loc);
            }
        };
        let text = (b0 as char).to_string();
        self.advance();
        Token::new(kind, text, loc)
    }
}

fn is_identifier_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_identifier_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Resolves the escape sequences of a raw string body.
///
/// Unrecognized escapes keep the backslash, matching BYOND's behavior for
/// text macros like `\the` which are resolved at display time.
#[must_use]
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('[') => out.push('['),
            Some(']') => out.push(']'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn lex(source: &str) -> Vec<Token> {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("test.dm");
        Lexer::new(file, source.to_owned(), false, true).lex_all(&mut diag)
    }

    fn kinds(source: &str) -> Vec<TokenKind> {
        lex(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn numbers_carry_values() {
        let tokens = lex("42 0x1F 3.5 1e3");
        assert_eq!(tokens[0].value, Some(TokenValue::Int(42)));
        assert_eq!(tokens[1].value, Some(TokenValue::Int(31)));
        assert_eq!(tokens[2].value, Some(TokenValue::Float(3.5)));
        assert_eq!(tokens[3].value, Some(TokenValue::Float(1000.0)));
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("var proc health spawn"),
            vec![TokenKind::Var, TokenKind::Proc, TokenKind::Identifier, TokenKind::Spawn]
        );
    }

    #[test]
    fn longest_match_operators() {
        assert_eq!(
            kinds("||= && <<= << <= < := :: : ~= ~! ?. ?: ?["),
            vec![
                TokenKind::OrAssign,
                TokenKind::And,
                TokenKind::LeftShiftAssign,
                TokenKind::LeftShift,
                TokenKind::LessOrEqual,
                TokenKind::Less,
                TokenKind::AssignInto,
                TokenKind::DoubleColon,
                TokenKind::Colon,
                TokenKind::TildeEquals,
                TokenKind::TildeNotEquals,
                TokenKind::QuestionDot,
                TokenKind::QuestionColon,
                TokenKind::QuestionBracket,
            ]
        );
    }

    #[test]
    fn dots_and_ellipsis() {
        assert_eq!(
            kinds(". .. ..."),
            vec![TokenKind::Dot, TokenKind::DotDot, TokenKind::DotDotDot]
        );
    }

    #[test]
    fn comments_are_consumed() {
        assert_eq!(
            kinds("a // trailing\nb /* block /* nested */ */ c"),
            vec![
                TokenKind::Identifier,
                TokenKind::Newline,
                TokenKind::Identifier,
                TokenKind::Identifier,
            ]
        );
    }

    #[test]
    fn leading_whitespace_becomes_a_token() {
        let tokens = lex("if(x)\n\treturn");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::If,
                TokenKind::LeftParen,
                TokenKind::Identifier,
                TokenKind::RightParen,
                TokenKind::Newline,
                TokenKind::Whitespace,
                TokenKind::Return,
            ]
        );
        assert_eq!(tokens[5].text, "\t");
    }

    #[test]
    fn string_keeps_raw_and_processed() {
        let tokens = lex(r#""a\nb""#);
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].text, r"a\nb");
        assert_eq!(tokens[0].str_value(), Some("a\nb"));
    }

    #[test]
    fn multiline_string_spans_lines() {
        let tokens = lex("{\"line one\nline two\"} x");
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].str_value(), Some("line one\nline two"));
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].loc.line, 2);
    }

    #[test]
    fn resource_literal() {
        let tokens = lex("'icons/mob.dmi'");
        assert_eq!(tokens[0].kind, TokenKind::Resource);
        assert_eq!(tokens[0].text, "icons/mob.dmi");
    }

    #[test]
    fn unterminated_string_reports_and_recovers() {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("test.dm");
        let tokens = Lexer::new(file, "\"abc\nx".to_owned(), false, true).lex_all(&mut diag);
        assert_eq!(diag.error_count(), 1);
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Identifier));
    }

    #[test]
    fn directives_and_stringify() {
        assert_eq!(
            kinds("#include #define #undef #ifdef #X ##"),
            vec![
                TokenKind::DirInclude,
                TokenKind::DirDefine,
                TokenKind::DirUndef,
                TokenKind::DirIfdef,
                TokenKind::Stringify,
                TokenKind::TokenConcat,
            ]
        );
    }

    #[test]
    fn line_splice_joins_lines() {
        assert_eq!(
            kinds("a \\\nb"),
            vec![TokenKind::Identifier, TokenKind::Identifier]
        );
    }

    #[test]
    fn unknown_character_resumes() {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("test.dm");
        let tokens = Lexer::new(file, "a $ b".to_owned(), false, true).lex_all(&mut diag);
        assert_eq!(diag.error_count(), 1);
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(kinds, vec![TokenKind::Identifier, TokenKind::Unknown, TokenKind::Identifier]);
    }
}
