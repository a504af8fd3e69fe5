//! Global symbol table
//!
//! Name-to-value bindings with a cached length and FNV-1a hash per entry.
//! Lookups compare the hash and length before touching bytes, which is
//! the path the LOADSYMBOL/STORESYMBOL helpers take with the hash already
//! decoded from the instruction stream.

use crate::vm::value::Value;
use noct_bytecode::string_hash;

pub(crate) struct GlobalEntry {
    name: String,
    name_hash: u32,
    pub(crate) value: Value,
    removed: bool,
}

/// The VM-wide symbol table.
#[derive(Default)]
pub(crate) struct SymbolTable {
    entries: Vec<GlobalEntry>,
}

impl SymbolTable {
    /// Hash-first lookup.
    pub(crate) fn get(&mut self, name: &[u8], hash: u32) -> Option<&mut GlobalEntry> {
        self.entries.iter_mut().find(|entry| {
            !entry.removed
                && entry.name_hash == hash
                && entry.name.len() == name.len()
                && entry.name.as_bytes() == name
        })
    }

    pub(crate) fn get_by_name(&mut self, name: &str) -> Option<&mut GlobalEntry> {
        self.get(name.as_bytes(), string_hash(name.as_bytes()))
    }

    /// Bind or rebind a symbol.
    pub(crate) fn set(&mut self, name: &str, hash: u32, value: Value) {
        if let Some(entry) = self.get(name.as_bytes(), hash) {
            entry.value = value;
            return;
        }
        // Reuse a removed entry before growing.
        if let Some(entry) = self.entries.iter_mut().find(|e| e.removed) {
            entry.name = name.to_string();
            entry.name_hash = hash;
            entry.value = value;
            entry.removed = false;
            return;
        }
        self.entries.push(GlobalEntry {
            name: name.to_string(),
            name_hash: hash,
            value,
            removed: false,
        });
    }

    pub(crate) fn set_by_name(&mut self, name: &str, value: Value) {
        self.set(name, string_hash(name.as_bytes()), value);
    }

    /// Every live value slot, for root scanning and pointer fixup.
    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.entries
            .iter_mut()
            .filter(|e| !e.removed)
            .map(|e| &mut e.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let mut table = SymbolTable::default();
        table.set_by_name("answer", Value::int(42));
        let entry = table.get_by_name("answer").unwrap();
        assert_eq!(entry.value.as_int(), Some(42));
    }

    #[test]
    fn test_rebind_replaces() {
        let mut table = SymbolTable::default();
        table.set_by_name("x", Value::int(1));
        table.set_by_name("x", Value::int(2));
        assert_eq!(table.get_by_name("x").unwrap().value.as_int(), Some(2));
        assert_eq!(table.values_mut().count(), 1);
    }

    #[test]
    fn test_hash_mismatch_misses() {
        let mut table = SymbolTable::default();
        table.set_by_name("x", Value::int(1));
        assert!(table.get(b"x", 0xdead_beef).is_none());
    }
}
