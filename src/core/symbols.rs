//! Runtime symbol table.
//!
//! Maps process addresses of runtime-library routines and data to the names
//! the compiled object links against. Entries can be added while the
//! compiler is running; the relocation pass consults this table before the
//! address oracle.

use std::collections::BTreeMap;

/// Address overrides plus canonical names for well-known runtime routines.
#[derive(Debug, Clone)]
pub struct RuntimeSymbolTable {
    overrides: BTreeMap<u64, String>,
    aliases: BTreeMap<String, String>,
}

/// Aliases installed by default: allocation, threading and array management
/// entry points of the host runtime mapped onto the freestanding ABI.
const DEFAULT_ALIASES: &[(&str, &str)] = &[
    ("gc_pool_alloc", "rt_alloc"),
    ("gc_alloc_typed", "rt_alloc"),
    ("gc_small_alloc", "rt_alloc"),
    ("gc_big_alloc", "rt_alloc"),
    ("alloc_obj", "rt_alloc"),
    ("get_pgcstack", "rt_task_state"),
    ("get_ptls_states", "rt_task_state"),
    ("current_task", "rt_task_state"),
    ("alloc_array_1d", "rt_alloc_array_1d"),
    ("alloc_array_2d", "rt_alloc_array_2d"),
    ("array_grow_end", "rt_array_grow_end"),
    ("array_del_end", "rt_array_del_end"),
    ("throw", "rt_throw"),
];

impl Default for RuntimeSymbolTable {
    fn default() -> Self {
        let mut table = Self::empty();
        for &(name, canonical) in DEFAULT_ALIASES {
            table.add_alias(name, canonical);
        }
        table
    }
}

impl RuntimeSymbolTable {
    /// A table without the default aliases.
    pub fn empty() -> Self {
        Self {
            overrides: BTreeMap::new(),
            aliases: BTreeMap::new(),
        }
    }

    /// Bind `address` to `name`. Later bindings replace earlier ones.
    pub fn add_override(&mut self, address: u64, name: impl Into<String>) {
        let name = name.into();
        log::debug!("runtime symbol override {address:#x} -> {name}");
        self.overrides.insert(address, name);
    }

    pub fn add_alias(&mut self, name: impl Into<String>, canonical: impl Into<String>) {
        self.aliases.insert(name.into(), canonical.into());
    }

    /// Name bound to `address`, already canonicalized.
    pub fn lookup(&self, address: u64) -> Option<String> {
        self.overrides
            .get(&address)
            .map(|name| self.canonical(name).to_string())
    }

    /// Canonical link name for a runtime symbol.
    pub fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
        self.aliases.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn overrides(&self) -> impl Iterator<Item = (u64, &str)> {
        self.overrides.iter().map(|(&addr, name)| (addr, name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_are_canonicalized() {
        let mut table = RuntimeSymbolTable::default();
        table.add_override(0x1000, "gc_pool_alloc");
        table.add_override(0x2000, "my_helper");
        assert_eq!(table.lookup(0x1000).as_deref(), Some("rt_alloc"));
        assert_eq!(table.lookup(0x2000).as_deref(), Some("my_helper"));
        assert_eq!(table.lookup(0x3000), None);
    }

    #[test]
    fn empty_table_has_no_aliases() {
        let table = RuntimeSymbolTable::empty();
        assert_eq!(table.canonical("gc_pool_alloc"), "gc_pool_alloc");
    }
}
