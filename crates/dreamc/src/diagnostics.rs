//! Diagnostic codes, levels, and the compiler-wide emission sink.
//!
//! Every component reports through a single [`Diagnostics`] value passed by
//! explicit reference. A per-code level map (the pragma table) gates
//! emission; the error budget aborts compilation once exceeded.

use ahash::{AHashMap, AHashSet};
use strum::{EnumString, IntoStaticStr};

use crate::location::{FileTable, Location};

/// Closed enumeration of diagnostic codes.
///
/// Numeric ranges: 1000s are notices, 2000s warnings, 3000s errors, and
/// 4000–4999 optional runtime error configuration that is forwarded to the
/// output JSON.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum WarningCode {
    Unknown = 0,

    SoftReservedKeyword = 1000,
    PointlessScope = 1001,
    PointlessParentCall = 1002,
    PointlessBuiltinCall = 1003,
    MissingInterpolatedExpression = 1004,

    SuspiciousMatrixCall = 2100,
    FallbackBuiltinArgument = 2101,
    MalformedRange = 2102,
    InvalidRange = 2103,
    SoftConstant = 2104,
    DuplicateVariable = 2105,
    DuplicateProcDefinition = 2106,
    MalformedMacro = 2107,
    UnknownVariable = 2108,
    UnsupportedTypeCheck = 2109,
    UnimplementedAccess = 2110,
    UnsupportedAccess = 2111,
    ConstantDivisionByZero = 2112,

    BadExpression = 3000,
    BadStatement = 3001,
    BadToken = 3002,
    BadDefinition = 3003,
    WriteToConstant = 3004,
    BadIndentation = 3005,
    HardConstant = 3006,
    ItemDoesntExist = 3007,

    RuntimeDivisionByZero = 4000,
    RuntimeNullReference = 4001,
    RuntimeBadIndex = 4002,
}

impl WarningCode {
    #[inline]
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Codes emitted at most once per compilation.
    #[must_use]
    fn is_once_only(self) -> bool {
        matches!(self, Self::UnimplementedAccess | Self::UnsupportedAccess)
    }
}

/// Severity attached to a diagnostic code by the pragma table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, EnumString, serde::Serialize, serde::Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum ErrorLevel {
    Disabled,
    Notice,
    Warning,
    Error,
}

/// A single reported diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub code: WarningCode,
    pub level: ErrorLevel,
    pub loc: Location,
    pub message: String,
    pub context: Option<String>,
}

/// The compiler-wide diagnostic sink.
///
/// Owns the file table (needed to format locations), the pragma table, the
/// error budget, and the abort flag every phase checks at loop boundaries.
#[derive(Debug)]
pub struct Diagnostics {
    pub files: FileTable,
    config: AHashMap<WarningCode, ErrorLevel>,
    emitted_once: AHashSet<WarningCode>,
    messages: Vec<String>,
    error_count: u32,
    warning_count: u32,
    max_errors: u32,
    aborted: bool,
    notices_enabled: bool,
}

impl Diagnostics {
    #[must_use]
    pub fn new(max_errors: u32, notices_enabled: bool) -> Self {
        let mut config = AHashMap::new();
        config.insert(WarningCode::UnimplementedAccess, ErrorLevel::Warning);
        config.insert(WarningCode::UnsupportedAccess, ErrorLevel::Warning);
        config.insert(WarningCode::SoftReservedKeyword, ErrorLevel::Notice);
        config.insert(WarningCode::PointlessScope, ErrorLevel::Notice);
        config.insert(WarningCode::BadExpression, ErrorLevel::Error);
        config.insert(WarningCode::BadStatement, ErrorLevel::Error);
        config.insert(WarningCode::BadToken, ErrorLevel::Error);
        config.insert(WarningCode::BadDefinition, ErrorLevel::Error);
        config.insert(WarningCode::BadIndentation, ErrorLevel::Error);
        config.insert(WarningCode::WriteToConstant, ErrorLevel::Error);
        config.insert(WarningCode::HardConstant, ErrorLevel::Error);
        config.insert(WarningCode::ItemDoesntExist, ErrorLevel::Error);
        config.insert(WarningCode::RuntimeDivisionByZero, ErrorLevel::Warning);
        config.insert(WarningCode::RuntimeNullReference, ErrorLevel::Warning);
        config.insert(WarningCode::RuntimeBadIndex, ErrorLevel::Warning);
        Self {
            files: FileTable::new(),
            config,
            emitted_once: AHashSet::new(),
            messages: Vec::new(),
            error_count: 0,
            warning_count: 0,
            max_errors,
            aborted: false,
            notices_enabled,
        }
    }

    /// Overrides a code's level, from `#pragma` directives or CLI flags.
    pub fn set_pragma(&mut self, code: WarningCode, level: ErrorLevel) {
        self.config.insert(code, level);
    }

    #[must_use]
    pub fn level_of(&self, code: WarningCode) -> ErrorLevel {
        self.config.get(&code).copied().unwrap_or(ErrorLevel::Warning)
    }

    /// Emits a diagnostic through the pragma table.
    pub fn emit(&mut self, code: WarningCode, loc: Location, message: impl Into<String>) {
        self.emit_with_context(code, loc, message, None);
    }

    pub fn emit_with_context(
        &mut self,
        code: WarningCode,
        loc: Location,
        message: impl Into<String>,
        context: Option<&str>,
    ) {
        if self.aborted {
            return;
        }
        if code.is_once_only() && !self.emitted_once.insert(code) {
            return;
        }
        let level = self.level_of(code);
        let level_str = match level {
            ErrorLevel::Disabled => return,
            ErrorLevel::Notice => {
                if !self.notices_enabled {
                    return;
                }
                "Notice"
            }
            ErrorLevel::Warning => {
                self.warning_count += 1;
                "Warning"
            }
            ErrorLevel::Error => {
                self.error_count += 1;
                "Error"
            }
        };
        let mut full = format!(
            "{}: {} DMC{}: {}",
            self.files.display(loc),
            level_str,
            code.code(),
            message.into()
        );
        if let Some(context) = context {
            full.push_str("\n    Context: ");
            full.push_str(context);
        }
        eprintln!("{full}");
        self.messages.push(full);
        self.check_budget();
    }

    /// Emits an error unconditionally, bypassing the pragma table.
    pub fn error(&mut self, loc: Location, message: impl Into<String>) {
        if self.aborted {
            return;
        }
        let full = format!("{}: Error: {}", self.files.display(loc), message.into());
        eprintln!("{full}");
        self.messages.push(full);
        self.error_count += 1;
        self.check_budget();
    }

    /// Emits a warning unconditionally, bypassing the pragma table.
    pub fn warning(&mut self, message: impl Into<String>) {
        let full = format!("Warning: {}", message.into());
        eprintln!("{full}");
        self.messages.push(full);
        self.warning_count += 1;
    }

    fn check_budget(&mut self) {
        if self.max_errors > 0 && self.error_count >= self.max_errors {
            eprintln!("Fatal: Error limit reached ({}). Aborting compilation.", self.max_errors);
            self.aborted = true;
        }
    }

    #[must_use]
    pub fn should_abort(&self) -> bool {
        self.aborted
    }

    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    #[must_use]
    pub fn warning_count(&self) -> u32 {
        self.warning_count
    }

    #[must_use]
    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// The pragma entries in the optional-error range (4000–4999), sorted by
    /// code so serialization is deterministic.
    #[must_use]
    pub fn optional_error_levels(&self) -> Vec<(u16, ErrorLevel)> {
        let mut entries: Vec<(u16, ErrorLevel)> = self
            .config
            .iter()
            .map(|(code, level)| (code.code(), *level))
            .filter(|(code, _)| (4000..=4999).contains(code))
            .collect();
        entries.sort_unstable_by_key(|(code, _)| *code);
        entries
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn pragma_names_parse() {
        assert_eq!(
            WarningCode::from_str("UnknownVariable").unwrap(),
            WarningCode::UnknownVariable
        );
        assert_eq!(ErrorLevel::from_str("error").unwrap(), ErrorLevel::Error);
        assert!(WarningCode::from_str("NotACode").is_err());
    }

    #[test]
    fn error_budget_aborts() {
        let mut diag = Diagnostics::new(2, false);
        diag.emit(WarningCode::BadToken, Location::INTERNAL, "one");
        assert!(!diag.should_abort());
        diag.emit(WarningCode::BadToken, Location::INTERNAL, "two");
        assert!(diag.should_abort());
        assert_eq!(diag.error_count(), 2);
    }

    #[test]
    fn once_only_codes_emit_once() {
        let mut diag = Diagnostics::new(100, false);
        diag.emit(WarningCode::UnimplementedAccess, Location::INTERNAL, "first");
        diag.emit(WarningCode::UnimplementedAccess, Location::INTERNAL, "second");
        assert_eq!(diag.warning_count(), 1);
    }

    #[test]
    fn disabled_codes_are_silent() {
        let mut diag = Diagnostics::new(100, false);
        diag.set_pragma(WarningCode::UnknownVariable, ErrorLevel::Disabled);
        diag.emit(WarningCode::UnknownVariable, Location::INTERNAL, "gone");
        assert_eq!(diag.warning_count(), 0);
        assert_eq!(diag.messages().len(), 0);
    }

    #[test]
    fn optional_errors_are_sorted() {
        let mut diag = Diagnostics::new(100, false);
        diag.set_pragma(WarningCode::RuntimeBadIndex, ErrorLevel::Error);
        let entries = diag.optional_error_levels();
        let codes: Vec<u16> = entries.iter().map(|(c, _)| *c).collect();
        assert_eq!(codes, vec![4000, 4001, 4002]);
    }
}
