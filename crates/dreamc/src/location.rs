//! Source locations and the file table they index.
//!
//! Every token, AST node, diagnostic, and symbol carries a [`Location`].
//! File paths are interned into a [`FileTable`] so locations stay `Copy`
//! and cheap to duplicate across token streams and expansions.

use ahash::AHashMap;

/// Index into the compiler's file table.
///
/// Uses `u32` to keep `Location` small; `u32::MAX` is reserved for the
/// internal pseudo-file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FileId(u32);

impl FileId {
    /// The pseudo-file used for compiler-generated locations.
    pub const INTERNAL: Self = Self(u32::MAX);

    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A position in source code.
///
/// Lines are 1-based, columns are 1-based. `in_standard` marks locations
/// inside the bundled standard library so diagnostics and the object tree
/// can distinguish user code from DMStandard code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Location {
    pub file: FileId,
    pub line: u32,
    pub column: u32,
    pub in_standard: bool,
}

impl Location {
    /// The location used for diagnostics that have no source position.
    pub const INTERNAL: Self = Self {
        file: FileId::INTERNAL,
        line: 0,
        column: 0,
        in_standard: false,
    };

    #[must_use]
    pub fn new(file: FileId, line: u32, column: u32, in_standard: bool) -> Self {
        Self {
            file,
            line,
            column,
            in_standard,
        }
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.file == FileId::INTERNAL
    }
}

/// Interner for source file paths.
///
/// Ids are dense and stable for the life of a compilation, so they can be
/// compared and stored freely.
#[derive(Debug, Default)]
pub struct FileTable {
    paths: Vec<String>,
    ids: AHashMap<String, FileId>,
}

impl FileTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a path, returning the existing id if it was seen before.
    pub fn intern(&mut self, path: &str) -> FileId {
        if let Some(&id) = self.ids.get(path) {
            return id;
        }
        let id = FileId(u32::try_from(self.paths.len()).expect("file table exceeds u32 range"));
        self.paths.push(path.to_owned());
        self.ids.insert(path.to_owned(), id);
        id
    }

    /// Returns the path for an id; the internal pseudo-file prints as `internal`.
    #[must_use]
    pub fn path(&self, id: FileId) -> &str {
        if id == FileId::INTERNAL {
            return "internal";
        }
        self.paths.get(id.index()).map_or("<unknown>", String::as_str)
    }

    /// Formats a location as `file:line:column` for diagnostics.
    #[must_use]
    pub fn display(&self, loc: Location) -> String {
        if loc.is_internal() {
            return "internal".to_owned();
        }
        format!("{}:{}:{}", self.path(loc.file), loc.line, loc.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let mut files = FileTable::new();
        let a = files.intern("code.dm");
        let b = files.intern("code.dm");
        let c = files.intern("other.dm");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(files.path(a), "code.dm");
    }

    #[test]
    fn internal_location_displays_without_position() {
        let files = FileTable::new();
        assert_eq!(files.display(Location::INTERNAL), "internal");
    }
}
