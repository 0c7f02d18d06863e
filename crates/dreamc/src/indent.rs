//! Converts newline/whitespace tokens into INDENT/DEDENT structure.
//!
//! The parser expects explicit block delimiters in lieu of braces. This
//! layer wraps the preprocessed token stream, maintaining a stack of
//! indentation widths and a bracket-nesting counter; inside brackets,
//! newlines pass through and indentation is not tracked.

use std::collections::VecDeque;

use crate::{
    diagnostics::{Diagnostics, WarningCode},
    location::Location,
    token::{Token, TokenKind},
};

/// Streams a preprocessed token vector, injecting indent/dedent markers.
#[derive(Debug)]
pub struct IndentLexer {
    tokens: Vec<Token>,
    index: usize,
    pending: VecDeque<Token>,
    indents: Vec<usize>,
    brackets: u32,
    at_end: bool,
}

impl IndentLexer {
    #[must_use]
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            index: 0,
            pending: VecDeque::new(),
            indents: vec![0],
            brackets: 0,
            at_end: false,
        }
    }

    /// Returns the next structural token. After the underlying stream is
    /// exhausted, emits one DEDENT per open indent level and then an
    /// end-of-file token at column 0.
    pub fn next_token(&mut self, diag: &mut Diagnostics) -> Token {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return token;
            }

            if self.index >= self.tokens.len() {
                let eof_loc = self.eof_location();
                while self.indents.last().copied().unwrap_or(0) > 0 {
                    self.indents.pop();
                    self.pending.push_back(Token::new(TokenKind::Dedent, "", eof_loc));
                }
                if let Some(token) = self.pending.pop_front() {
                    return token;
                }
                self.at_end = true;
                return Token::new(TokenKind::EndOfFile, "", eof_loc);
            }

            let token = self.tokens[self.index].clone();
            self.index += 1;

            match token.kind {
                TokenKind::Newline if self.brackets == 0 => {
                    let current = self.indents.last().copied().unwrap_or(0);
                    let level = self.measure_indentation();
                    if level > current {
                        self.indents.push(level);
                        self.pending.push_back(token.clone());
                        return Token::new(TokenKind::Indent, "", token.loc);
                    }
                    if level < current {
                        self.pending.push_back(token.clone());
                        if !self.indents.contains(&level) {
                            diag.emit(
                                WarningCode::BadIndentation,
                                token.loc,
                                format!("Inconsistent indentation of {level} characters"),
                            );
                        }
                        while self.indents.last().copied().unwrap_or(0) > level {
                            self.indents.pop();
                            self.pending.push_back(Token::new(TokenKind::Dedent, "", token.loc));
                        }
                        continue;
                    }
                    return token;
                }
                TokenKind::Newline => return token,
                TokenKind::LeftParen | TokenKind::LeftBracket | TokenKind::QuestionBracket => {
                    self.brackets += 1;
                    return token;
                }
                TokenKind::RightParen | TokenKind::RightBracket => {
                    self.brackets = self.brackets.saturating_sub(1);
                    return token;
                }
                // Whitespace only matters for indentation measurement.
                TokenKind::Whitespace => continue,
                _ => return token,
            }
        }
    }

    /// Measures the indentation of the upcoming line from its leading
    /// whitespace token, consuming it. Empty lines keep the current level.
    fn measure_indentation(&mut self) -> usize {
        let current = self.indents.last().copied().unwrap_or(0);
        match self.tokens.get(self.index) {
            Some(ws) if ws.kind == TokenKind::Whitespace => {
                // A whitespace-only line does not change indentation.
                if matches!(self.tokens.get(self.index + 1), Some(next) if next.kind == TokenKind::Newline) {
                    self.index += 1;
                    return current;
                }
                let level = ws.text.chars().count();
                self.index += 1;
                level
            }
            Some(next) if next.kind == TokenKind::Newline => current,
            Some(_) => 0,
            None => current,
        }
    }

    fn eof_location(&self) -> Location {
        let mut loc = self.tokens.last().map_or(Location::INTERNAL, |t| t.loc);
        loc.column = 0;
        loc
    }

    #[must_use]
    pub fn is_at_end(&self) -> bool {
        self.at_end
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::lexer::Lexer;

    fn indent_kinds(source: &str) -> Vec<TokenKind> {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("test.dm");
        let tokens = Lexer::new(file, source.to_owned(), false, true).lex_all(&mut diag);
        let mut stream = IndentLexer::new(tokens);
        let mut kinds = Vec::new();
        loop {
            let token = stream.next_token(&mut diag);
            let kind = token.kind;
            kinds.push(kind);
            if kind == TokenKind::EndOfFile {
                return kinds;
            }
        }
    }

    #[test]
    fn simple_block_emits_indent_dedent() {
        let kinds = indent_kinds("mob\n\thealth = 5\n");
        assert_eq!(
            kinds,
            vec![
                TokenKind::Identifier,
                TokenKind::Indent,
                TokenKind::Newline,
                TokenKind::Identifier,
                TokenKind::Assign,
                TokenKind::Number,
                TokenKind::Newline,
                TokenKind::Dedent,
                TokenKind::EndOfFile,
            ]
        );
    }

    #[test]
    fn indent_dedent_balance() {
        let sources = [
            "a\n\tb\n\t\tc\nd\n",
            "a\n\tb\nc\n\td\n\t\te",
            "x",
            "",
            "a\n\tb\n\t\tc",
        ];
        for source in sources {
            let kinds = indent_kinds(source);
            let indents = kinds.iter().filter(|k| **k == TokenKind::Indent).count();
            let dedents = kinds.iter().filter(|k| **k == TokenKind::Dedent).count();
            assert_eq!(indents, dedents, "unbalanced for {source:?}");
        }
    }

    #[test]
    fn newlines_inside_brackets_pass_through() {
        let kinds = indent_kinds("f(a,\n\tb)\n");
        assert!(!kinds.contains(&TokenKind::Indent));
        assert!(!kinds.contains(&TokenKind::Dedent));
    }

    #[test]
    fn empty_lines_keep_indentation() {
        let kinds = indent_kinds("a\n\tb\n\n\tc\n");
        let indents = kinds.iter().filter(|k| **k == TokenKind::Indent).count();
        let dedents = kinds.iter().filter(|k| **k == TokenKind::Dedent).count();
        assert_eq!(indents, 1);
        assert_eq!(dedents, 1);
    }

    #[test]
    fn inconsistent_dedent_reports_error() {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("test.dm");
        let tokens = Lexer::new(file, "a\n\t\t\tb\n\tc\n".to_owned(), false, true).lex_all(&mut diag);
        let mut stream = IndentLexer::new(tokens);
        loop {
            if stream.next_token(&mut diag).kind == TokenKind::EndOfFile {
                break;
            }
        }
        assert_eq!(diag.error_count(), 1);
    }

    #[test]
    fn eof_is_at_column_zero() {
        let mut diag = Diagnostics::new(100, false);
        let file = diag.files.intern("test.dm");
        let tokens = Lexer::new(file, "a\n\tb".to_owned(), false, true).lex_all(&mut diag);
        let mut stream = IndentLexer::new(tokens);
        let mut last = stream.next_token(&mut diag);
        while last.kind != TokenKind::EndOfFile {
            last = stream.next_token(&mut diag);
        }
        assert_eq!(last.loc.column, 0);
    }
}
