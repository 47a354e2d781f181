//! Symbol interning for string and numeric bytecode operands.
//!
//! Instructions reference names and literal constants through 16-bit symbol
//! ids. The table deduplicates: interning an equal payload twice returns the
//! existing id. Id 0 is permanently reserved as the null sentinel, so a
//! successfully interned symbol never has id 0.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A 16-bit handle to an interned symbol.
///
/// Ids are stable until [`SymbolTable::clear`] and are never reassigned.
/// Id 0 is the null sentinel and resolves to no symbol.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Default)]
pub struct SymbolId(u16);

impl SymbolId {
    /// The reserved null sentinel.
    pub const NULL: SymbolId = SymbolId(0);

    /// Create a SymbolId from a raw operand value.
    #[inline]
    pub fn new(raw: u16) -> Self {
        Self(raw)
    }

    /// Raw operand value for instruction encoding.
    #[inline]
    pub fn get(self) -> u16 {
        self.0
    }

    /// Whether this is the null sentinel.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// An interned entry: a string, an unsigned literal, or a signed literal.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Symbol {
    Str(String),
    Unsigned(u64),
    Signed(i64),
}

impl Symbol {
    /// Stable hash used for deduplication.
    pub fn hash_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        match self {
            Symbol::Str(s) => {
                0u8.hash(&mut hasher);
                s.hash(&mut hasher);
            }
            Symbol::Unsigned(v) => {
                1u8.hash(&mut hasher);
                v.hash(&mut hasher);
            }
            Symbol::Signed(v) => {
                2u8.hash(&mut hasher);
                v.hash(&mut hasher);
            }
        }
        hasher.finish()
    }

    /// The string payload, if this is a string symbol.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Symbol::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Str(s) => f.write_str(s),
            Symbol::Unsigned(v) => write!(f, "{v}"),
            Symbol::Signed(v) => write!(f, "{v}"),
        }
    }
}

/// Deduplicating symbol table.
///
/// Slot 0 is always vacant so that valid ids start at 1. Lookups during
/// interning compare by hash with a linear scan; tables stay small in
/// practice (one entry per distinct name or literal in a program).
#[derive(Debug, Clone)]
pub struct SymbolTable {
    symbols: Vec<Option<Symbol>>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            symbols: vec![None],
        }
    }

    /// Intern a string, returning its id.
    pub fn intern_string(&mut self, s: &str) -> SymbolId {
        self.intern(Symbol::Str(s.to_owned()))
    }

    /// Intern an unsigned integer literal, returning its id.
    pub fn intern_unsigned(&mut self, value: u64) -> SymbolId {
        self.intern(Symbol::Unsigned(value))
    }

    /// Intern a signed integer literal, returning its id.
    pub fn intern_signed(&mut self, value: i64) -> SymbolId {
        self.intern(Symbol::Signed(value))
    }

    fn intern(&mut self, symbol: Symbol) -> SymbolId {
        let key = symbol.hash_key();
        for (index, existing) in self.symbols.iter().enumerate().skip(1) {
            if let Some(existing) = existing {
                if existing.hash_key() == key {
                    return SymbolId(index as u16);
                }
            }
        }

        let id = self.symbols.len();
        assert!(id <= u16::MAX as usize, "symbol table overflow");
        self.symbols.push(Some(symbol));
        SymbolId(id as u16)
    }

    /// Resolve an id to its symbol. The null sentinel and out-of-range ids
    /// resolve to `None`.
    #[inline]
    pub fn get(&self, id: SymbolId) -> Option<&Symbol> {
        self.symbols.get(id.0 as usize)?.as_ref()
    }

    /// Resolve an id expected to name a string symbol.
    pub fn get_string(&self, id: SymbolId) -> Option<&str> {
        self.get(id)?.as_str()
    }

    /// Resolve an id expected to hold an unsigned literal.
    pub fn get_unsigned(&self, id: SymbolId) -> Option<u64> {
        match self.get(id)? {
            Symbol::Unsigned(v) => Some(*v),
            _ => None,
        }
    }

    /// Resolve an id expected to hold a signed literal.
    pub fn get_signed(&self, id: SymbolId) -> Option<i64> {
        match self.get(id)? {
            Symbol::Signed(v) => Some(*v),
            _ => None,
        }
    }

    /// Display form of a symbol for disassembly; `<null>` for the sentinel.
    pub fn display(&self, id: SymbolId) -> String {
        match self.get(id) {
            Some(symbol) => symbol.to_string(),
            None => "<null>".to_owned(),
        }
    }

    /// Number of interned symbols, excluding the sentinel slot.
    pub fn len(&self) -> usize {
        self.symbols.len() - 1
    }

    /// Whether no symbols have been interned.
    pub fn is_empty(&self) -> bool {
        self.symbols.len() == 1
    }

    /// Drop all symbols and re-reserve the sentinel slot.
    pub fn clear(&mut self) {
        self.symbols.clear();
        self.symbols.push(None);
    }

    /// Iterate over interned symbols with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (SymbolId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|s| (SymbolId(i as u16), s)))
    }
}
