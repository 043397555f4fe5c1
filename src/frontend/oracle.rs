//! Address resolution oracle.

use std::collections::BTreeMap;

/// One candidate symbol for a process address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolDescriptor {
    pub symbol: String,
    pub file: String,
    pub line: u32,
    /// The symbol belongs to the runtime library the output links against.
    pub known_library: bool,
}

/// Maps a process address to the symbols the debugger-style lookup finds.
pub trait AddressOracle {
    /// Candidates for `address`, most specific first. Empty when unknown.
    fn resolve(&self, address: u64) -> Vec<SymbolDescriptor>;
}

/// Address oracle backed by an explicit table.
#[derive(Debug, Clone, Default)]
pub struct SymbolMap {
    entries: BTreeMap<u64, Vec<SymbolDescriptor>>,
}

impl SymbolMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, address: u64, descriptor: SymbolDescriptor) {
        self.entries.entry(address).or_default().push(descriptor);
    }

    /// Shorthand for a runtime-library routine without source information.
    pub fn insert_library(&mut self, address: u64, symbol: impl Into<String>) {
        self.insert(
            address,
            SymbolDescriptor {
                symbol: symbol.into(),
                file: String::new(),
                line: 0,
                known_library: true,
            },
        );
    }

    pub fn merge(&mut self, other: SymbolMap) {
        for (address, descriptors) in other.entries {
            self.entries.entry(address).or_default().extend(descriptors);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl AddressOracle for SymbolMap {
    fn resolve(&self, address: u64) -> Vec<SymbolDescriptor> {
        self.entries.get(&address).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_in_insertion_order() {
        let mut map = SymbolMap::new();
        map.insert(
            0x40,
            SymbolDescriptor {
                symbol: "inlined_frame".into(),
                file: "a.c".into(),
                line: 3,
                known_library: false,
            },
        );
        map.insert_library(0x40, "rt_alloc");
        let found = map.resolve(0x40);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].symbol, "rt_alloc");
        assert!(map.resolve(0x80).is_empty());
    }
}
