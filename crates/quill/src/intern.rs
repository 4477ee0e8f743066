//! String interning for identifiers and string literals.
//!
//! The interner stores unique strings in a vector and hands out `StringId`
//! indices. Identifiers and literals are interned once during compilation;
//! at runtime, comparisons and environment lookups work on ids and the text
//! is only needed for error messages, printing, and heap-string interop.

use ahash::AHashMap;

/// Index into the interner's storage.
///
/// Uses `u32` to keep `Value` small; ~4 billion unique interns is more than
/// sufficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StringId(u32);

impl StringId {
    /// Interned id of `"init"`, the class initializer name.
    pub const INIT: Self = Self(0);
    /// Interned id of `"this"`, the bound receiver name.
    pub const THIS: Self = Self(1);
    /// Interned id of `"default"`, the default-export binding.
    pub const DEFAULT: Self = Self(2);
    /// Interned id of `"<module>"`, the top-level function name.
    pub const MODULE: Self = Self(3);

    /// Returns the raw index value.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Names interned at fixed ids on construction, in id order.
const PRELOADED: &[&str] = &["init", "this", "default", "<module>"];

/// Interns strings, returning stable `StringId` handles.
#[derive(Debug, Default)]
pub struct Interner {
    strings: Vec<Box<str>>,
    map: AHashMap<Box<str>, StringId>,
}

impl Interner {
    /// Creates an interner with the fixed-id names preloaded.
    pub fn new() -> Self {
        let mut interner = Self {
            strings: Vec::with_capacity(64),
            map: AHashMap::with_capacity(64),
        };
        for name in PRELOADED {
            interner.intern(name);
        }
        interner
    }

    /// Interns `text`, returning the existing id when already present.
    pub fn intern(&mut self, text: &str) -> StringId {
        if let Some(&id) = self.map.get(text) {
            return id;
        }
        let id = StringId(u32::try_from(self.strings.len()).expect("interner exceeds u32 ids"));
        let boxed: Box<str> = text.into();
        self.strings.push(boxed.clone());
        self.map.insert(boxed, id);
        id
    }

    /// Looks up an already-interned string without inserting.
    pub fn lookup(&self, text: &str) -> Option<StringId> {
        self.map.get(text).copied()
    }

    /// Returns the text for an id.
    ///
    /// # Panics
    /// Panics if `id` was not produced by this interner.
    pub fn get(&self, id: StringId) -> &str {
        &self.strings[id.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preloaded_ids_are_stable() {
        let interner = Interner::new();
        assert_eq!(interner.get(StringId::INIT), "init");
        assert_eq!(interner.get(StringId::THIS), "this");
        assert_eq!(interner.get(StringId::DEFAULT), "default");
        assert_eq!(interner.get(StringId::MODULE), "<module>");
    }

    #[test]
    fn interning_is_idempotent() {
        let mut interner = Interner::new();
        let a = interner.intern("count");
        let b = interner.intern("count");
        assert_eq!(a, b);
        assert_eq!(interner.get(a), "count");
    }
}
