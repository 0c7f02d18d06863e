//! String interning for the output string table and bytecode operands.
//!
//! The compiler interns every string literal, field name, and proc name that
//! reaches bytecode; ids are dense `[0, n)` and stable for the life of a
//! compilation, which makes them directly serializable as the output
//! `Strings` array.

use ahash::AHashMap;

/// Index into a [`StringTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub struct StringId(u32);

impl StringId {
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Dense string interner backing the serialized string and resource tables.
#[derive(Debug, Default)]
pub struct StringTable {
    strings: Vec<String>,
    ids: AHashMap<String, StringId>,
}

impl StringTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a string, returning the existing id when already present.
    pub fn intern(&mut self, value: &str) -> StringId {
        if let Some(&id) = self.ids.get(value) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("string table exceeds u32 range"));
        self.strings.push(value.to_owned());
        self.ids.insert(value.to_owned(), id);
        id
    }

    #[must_use]
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }

    /// Looks up the id of an already-interned string.
    #[must_use]
    pub fn id_of(&self, value: &str) -> Option<StringId> {
        self.ids.get(value).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.strings.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_stable() {
        let mut table = StringTable::new();
        let a = table.intern("health");
        let b = table.intern("name");
        let a2 = table.intern("health");
        assert_eq!(a, a2);
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(b), "name");
    }
}
