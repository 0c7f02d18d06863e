//! Token kinds, values, and the tokens produced by the lexer.

use std::fmt;

use crate::location::Location;

/// The closed set of token kinds produced by the lexer and preprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TokenKind {
    Unknown,
    EndOfFile,

    Newline,
    /// A run of leading spaces/tabs at the start of a line. Retained through
    /// preprocessing because the indent layer measures it.
    Whitespace,

    Indent,
    Dedent,

    // Preprocessor directives. Only meaningful when they start a line; the
    // preprocessor demotes them to identifiers elsewhere.
    DirInclude,
    DirDefine,
    DirUndef,
    DirIf,
    DirIfdef,
    DirIfndef,
    DirElif,
    DirElse,
    DirEndif,
    DirError,
    DirWarning,
    DirPragma,
    /// `#param` inside a macro body: stringify the argument.
    Stringify,
    /// `##`: paste the neighboring tokens together.
    TokenConcat,

    // Brackets
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,

    // Punctuation
    Semicolon,
    Comma,
    Colon,
    Question,

    // Operators
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PercentPercent,
    Power,
    Equals,
    NotEquals,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    And,
    Or,
    Not,
    BitAnd,
    BitOr,
    BitXor,
    BitNot,
    LeftShift,
    RightShift,

    // Compound assignment
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    PercentPercentAssign,
    BitAndAssign,
    BitOrAssign,
    BitXorAssign,
    LeftShiftAssign,
    RightShiftAssign,
    /// `||=`
    OrAssign,
    /// `&&=`
    AndAssign,
    /// `:=`
    AssignInto,

    /// `~=` case-insensitive equivalence.
    TildeEquals,
    /// `~!` case-insensitive non-equivalence.
    TildeNotEquals,

    /// `?.` null-conditional member access.
    QuestionDot,
    /// `?:` null-conditional `:` access.
    QuestionColon,
    /// `?[` null-conditional index.
    QuestionBracket,

    Increment,
    Decrement,

    Dot,
    DotDot,
    DotDotDot,
    DoubleColon,

    // Keywords
    Var,
    Proc,
    Verb,
    If,
    Else,
    For,
    While,
    Do,
    Switch,
    Return,
    Break,
    Continue,
    Goto,
    Del,
    New,
    In,
    To,
    Step,
    As,
    Null,
    Set,
    Tmp,
    Const,
    Static,
    Global,
    Spawn,
    Try,
    Catch,
    Throw,

    // Literals
    Identifier,
    String,
    Number,
    Resource,
}

impl TokenKind {
    /// Maps a lexed identifier to its keyword kind, if any.
    #[must_use]
    pub fn keyword(ident: &str) -> Option<Self> {
        Some(match ident {
            "var" => Self::Var,
            "proc" => Self::Proc,
            "verb" => Self::Verb,
            "if" => Self::If,
            "else" => Self::Else,
            "for" => Self::For,
            "while" => Self::While,
            "do" => Self::Do,
            "switch" => Self::Switch,
            "return" => Self::Return,
            "break" => Self::Break,
            "continue" => Self::Continue,
            "goto" => Self::Goto,
            "del" => Self::Del,
            "new" => Self::New,
            "in" => Self::In,
            "to" => Self::To,
            "step" => Self::Step,
            "as" => Self::As,
            "null" => Self::Null,
            "set" => Self::Set,
            "tmp" => Self::Tmp,
            "const" => Self::Const,
            "static" => Self::Static,
            "global" => Self::Global,
            "spawn" => Self::Spawn,
            "try" => Self::Try,
            "catch" => Self::Catch,
            "throw" => Self::Throw,
            _ => return None,
        })
    }

    #[must_use]
    pub fn is_directive(self) -> bool {
        matches!(
            self,
            Self::DirInclude
                | Self::DirDefine
                | Self::DirUndef
                | Self::DirIf
                | Self::DirIfdef
                | Self::DirIfndef
                | Self::DirElif
                | Self::DirElse
                | Self::DirEndif
                | Self::DirError
                | Self::DirWarning
                | Self::DirPragma
        )
    }

    /// Keywords that may also appear as path elements or identifiers in
    /// positions where no keyword meaning applies.
    #[must_use]
    pub fn is_identifier_like(self) -> bool {
        matches!(self, Self::Identifier | Self::Step | Self::Proc)
    }
}

/// Typed payload attached to literal tokens.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum TokenValue {
    Int(i64),
    Float(f64),
    Str(String),
}

/// A single token with its kind, raw text, location, and optional value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub loc: Location,
    pub value: Option<TokenValue>,
}

impl Token {
    #[must_use]
    pub fn new(kind: TokenKind, text: impl Into<String>, loc: Location) -> Self {
        Self {
            kind,
            text: text.into(),
            loc,
            value: None,
        }
    }

    #[must_use]
    pub fn with_value(kind: TokenKind, text: impl Into<String>, loc: Location, value: TokenValue) -> Self {
        Self {
            kind,
            text: text.into(),
            loc,
            value: Some(value),
        }
    }

    /// The integer payload, converting a float payload when it is integral.
    #[must_use]
    pub fn int_value(&self) -> Option<i64> {
        match self.value {
            Some(TokenValue::Int(i)) => Some(i),
            Some(TokenValue::Float(f)) if f.fract() == 0.0 => Some(f as i64),
            _ => None,
        }
    }

    #[must_use]
    pub fn str_value(&self) -> Option<&str> {
        match &self.value {
            Some(TokenValue::Str(s)) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Newline => write!(f, "<newline>"),
            TokenKind::EndOfFile => write!(f, "<eof>"),
            TokenKind::Indent => write!(f, "<indent>"),
            TokenKind::Dedent => write!(f, "<dedent>"),
            TokenKind::String => write!(f, "\"{}\"", self.text),
            _ => write!(f, "{}", self.text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_lookup() {
        assert_eq!(TokenKind::keyword("var"), Some(TokenKind::Var));
        assert_eq!(TokenKind::keyword("spawn"), Some(TokenKind::Spawn));
        assert_eq!(TokenKind::keyword("varx"), None);
        assert_eq!(TokenKind::keyword("Var"), None);
    }

    #[test]
    fn int_value_accepts_integral_floats() {
        let tok = Token::with_value(TokenKind::Number, "3", Location::INTERNAL, TokenValue::Float(3.0));
        assert_eq!(tok.int_value(), Some(3));
        let tok = Token::with_value(TokenKind::Number, "3.5", Location::INTERNAL, TokenValue::Float(3.5));
        assert_eq!(tok.int_value(), None);
    }
}
