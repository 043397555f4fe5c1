// This module provides the per-invocation compilation context for freestand. A
// CompilationContext owns everything that outlives a single pass but not a single
// compilation: the bumpalo arena backing interned strings, the CompileOptions chosen by the
// caller, the runtime symbol table and rewrite-rule table (both extensible before a run),
// the encoder registry for extension heap objects, and the caches the passes share: the
// address cache (process address -> resolved symbol), the relocation table recorded by the
// fixup passes, and the link-name cache used by the IR linker. Caches sit behind RefCell so
// every stage can take the context by shared reference. There are no process-wide mutable
// globals; two contexts never interfere. SessionStats collects counters reported by the CLI.

//! Arena-based compilation context.
//!
//! All state that a compilation accumulates lives here and is dropped with
//! the context. Strings that are looked up repeatedly (symbol names, module
//! names) are interned into the arena.

use bumpalo::Bump;
use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::symbols::RuntimeSymbolTable;
use crate::fixup::RelocationEntry;
use crate::pipeline::rewrite::RewriteTable;
use crate::serialize::EncoderRegistry;

/// What to do with a process address nothing can resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnresolvedPolicy {
    /// Abort with `RelocationResolutionFailure`.
    #[default]
    Fail,
    /// Log a warning and keep the raw address in the generated code.
    Warn,
}

/// How duplicate subroutine definitions are linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugDetail {
    /// Reference the first definition by name.
    #[default]
    Minimal,
    /// Keep every duplicate as an internal copy for debugging.
    Full,
}

/// Caller-controlled configuration of one compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub unresolved: UnresolvedPolicy,
    pub debug_detail: DebugDetail,
    /// Run the optimization passes after legalization.
    pub optimize: bool,
    /// Largest callee (in instructions) the inliner copies.
    pub inline_threshold: usize,
    pub licm: bool,
    /// Literal addresses at or above this value are treated as process
    /// addresses; smaller literals are plain integers. Negative literals
    /// (`-1` and similar sentinels) are never addresses.
    pub embed_threshold: u64,
}

impl CompileOptions {
    /// Whether a pointer-sized literal names a process address.
    pub fn is_process_address(&self, literal: u64) -> bool {
        (literal as i64) >= 0 && literal >= self.embed_threshold
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            unresolved: UnresolvedPolicy::Fail,
            debug_detail: DebugDetail::Minimal,
            optimize: true,
            inline_threshold: 16,
            licm: true,
            embed_threshold: 0x1000,
        }
    }
}

/// Outcome of resolving a process address, cached per context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedAddress<'arena> {
    /// A runtime-library symbol.
    Runtime(&'arena str),
    /// A heap object held in the named slot global.
    Embedded(&'arena str),
    /// Left as a raw address under `UnresolvedPolicy::Warn`.
    Raw,
}

/// Per-compilation context.
///
/// Configuration is mutable until the pipeline starts; afterwards every stage
/// receives `&CompilationContext` and updates the caches through interior
/// mutability.
pub struct CompilationContext<'arena> {
    /// Arena allocator for interned strings.
    arena: &'arena Bump,

    options: CompileOptions,
    symbols: RuntimeSymbolTable,
    rewrites: RewriteTable,
    encoders: EncoderRegistry,

    /// Process address -> resolution.
    address_cache: RefCell<hashbrown::HashMap<u64, ResolvedAddress<'arena>>>,

    /// Relocation table, ordered by address so reports are deterministic.
    relocations: RefCell<BTreeMap<u64, RelocationEntry>>,

    /// Function name -> module that supplied the linked definition.
    link_names: RefCell<hashbrown::HashMap<&'arena str, &'arena str>>,

    interned_strings: RefCell<hashbrown::HashSet<&'arena str>>,

    stats: RefCell<SessionStats>,
}

impl<'arena> CompilationContext<'arena> {
    /// Create a new context with default options.
    pub fn new(arena: &'arena Bump) -> Self {
        Self::with_options(arena, CompileOptions::default())
    }

    pub fn with_options(arena: &'arena Bump, options: CompileOptions) -> Self {
        Self {
            arena,
            options,
            symbols: RuntimeSymbolTable::default(),
            rewrites: RewriteTable::default(),
            encoders: EncoderRegistry::default(),
            address_cache: RefCell::new(hashbrown::HashMap::new()),
            relocations: RefCell::new(BTreeMap::new()),
            link_names: RefCell::new(hashbrown::HashMap::new()),
            interned_strings: RefCell::new(hashbrown::HashSet::new()),
            stats: RefCell::new(SessionStats::default()),
        }
    }

    pub fn arena(&self) -> &'arena Bump {
        self.arena
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut CompileOptions {
        &mut self.options
    }

    pub fn symbols(&self) -> &RuntimeSymbolTable {
        &self.symbols
    }

    pub fn symbols_mut(&mut self) -> &mut RuntimeSymbolTable {
        &mut self.symbols
    }

    pub fn rewrites(&self) -> &RewriteTable {
        &self.rewrites
    }

    pub fn rewrites_mut(&mut self) -> &mut RewriteTable {
        &mut self.rewrites
    }

    pub fn encoders(&self) -> &EncoderRegistry {
        &self.encoders
    }

    pub fn encoders_mut(&mut self) -> &mut EncoderRegistry {
        &mut self.encoders
    }

    /// Intern a string in the arena.
    pub fn intern_str(&self, s: &str) -> &'arena str {
        let mut strings = self.interned_strings.borrow_mut();
        if let Some(&interned) = strings.get(s) {
            return interned;
        }

        let interned: &'arena str = self.arena.alloc_str(s);
        strings.insert(interned);
        interned
    }

    pub fn cached_address(&self, address: u64) -> Option<ResolvedAddress<'arena>> {
        self.address_cache.borrow().get(&address).copied()
    }

    pub fn cache_address(&self, address: u64, resolved: ResolvedAddress<'arena>) {
        self.address_cache.borrow_mut().insert(address, resolved);
    }

    /// Record how an address was relocated. The first entry for an address wins.
    pub fn record_relocation(&self, address: u64, entry: RelocationEntry) {
        let mut table = self.relocations.borrow_mut();
        if !table.contains_key(&address) {
            log::debug!("relocation {address:#x}: {entry}");
            match entry {
                RelocationEntry::ExternalSymbol { .. } => self.stats.borrow_mut().external_symbols += 1,
                RelocationEntry::EmbeddedObject { .. } => self.stats.borrow_mut().embedded_objects += 1,
            }
            table.insert(address, entry);
        }
    }

    pub fn relocations(&self) -> Ref<'_, BTreeMap<u64, RelocationEntry>> {
        self.relocations.borrow()
    }

    pub fn take_relocations(&self) -> BTreeMap<u64, RelocationEntry> {
        std::mem::take(&mut *self.relocations.borrow_mut())
    }

    /// Module that supplied the definition of `function`, if linked already.
    pub fn linked_from(&self, function: &str) -> Option<&'arena str> {
        self.link_names.borrow().get(function).copied()
    }

    pub fn record_link(&self, function: &str, module: &str) {
        let function = self.intern_str(function);
        let module = self.intern_str(module);
        self.link_names.borrow_mut().entry(function).or_insert(module);
    }

    /// Update statistics in place.
    pub fn with_stats<R>(&self, update: impl FnOnce(&mut SessionStats) -> R) -> R {
        update(&mut self.stats.borrow_mut())
    }

    /// Record that a function was compiled to machine code.
    pub fn record_function_compiled(&self, name: &str, code_size: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions_compiled += 1;
        stats.total_code_size += code_size;

        if stats.largest_function_size < code_size {
            stats.largest_function_size = code_size;
            stats.largest_function_name = name.to_string();
        }
    }

    /// Record an instruction lowered by the code generator.
    pub fn record_instruction_compiled(&self, opcode: &str) {
        let mut stats = self.stats.borrow_mut();
        stats.instructions_compiled += 1;
        *stats
            .instruction_counts
            .entry(opcode.to_string())
            .or_insert(0) += 1;
    }

    /// Get compilation statistics.
    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

/// Compilation statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionStats {
    /// Number of functions compiled to machine code.
    pub functions_compiled: usize,

    /// Total code size generated (bytes).
    pub total_code_size: usize,

    pub instructions_compiled: usize,

    /// Count of each opcode lowered.
    pub instruction_counts: BTreeMap<String, usize>,

    pub largest_function_size: usize,
    pub largest_function_name: String,

    /// Addresses rewritten into external symbols.
    pub external_symbols: usize,

    /// Heap objects embedded through slots.
    pub embedded_objects: usize,

    /// Constant expressions turned into instructions.
    pub constants_materialized: usize,

    pub blob_bytes: usize,
    pub subroutines_linked: usize,
    pub debug_copies: usize,
    pub rewrites_applied: usize,
    pub functions_inlined: usize,
    pub instructions_hoisted: usize,
    pub instructions_removed: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Compilation Statistics:")?;
        writeln!(f, "  Functions compiled: {}", self.functions_compiled)?;
        writeln!(f, "  Instructions compiled: {}", self.instructions_compiled)?;
        writeln!(f, "  Total code size: {} bytes", self.total_code_size)?;
        writeln!(f, "  External symbols: {}", self.external_symbols)?;
        writeln!(f, "  Embedded objects: {}", self.embedded_objects)?;
        writeln!(f, "  Constants materialized: {}", self.constants_materialized)?;
        writeln!(f, "  Blob size: {} bytes", self.blob_bytes)?;
        writeln!(
            f,
            "  Subroutines linked: {} ({} debug copies)",
            self.subroutines_linked, self.debug_copies
        )?;
        writeln!(f, "  Rewrites applied: {}", self.rewrites_applied)?;
        writeln!(f, "  Functions inlined: {}", self.functions_inlined)?;
        writeln!(f, "  Instructions hoisted: {}", self.instructions_hoisted)?;
        writeln!(f, "  Instructions removed: {}", self.instructions_removed)?;

        if !self.largest_function_name.is_empty() {
            writeln!(
                f,
                "  Largest function: {} ({} bytes)",
                self.largest_function_name, self.largest_function_size
            )?;
        }

        if !self.instruction_counts.is_empty() {
            writeln!(f, "  Instruction breakdown:")?;
            let mut sorted: Vec<_> = self.instruction_counts.iter().collect();
            sorted.sort_by_key(|(_, count)| std::cmp::Reverse(*count));

            for (opcode, count) in sorted.into_iter().take(10) {
                writeln!(f, "    {}: {}", opcode, count)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixup::{BlobRef, RelocationEntry};

    #[test]
    fn test_string_interning() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);

        let s1 = ctx.intern_str("hello");
        let s2 = ctx.intern_str("hello");
        let s3 = ctx.intern_str("world");

        assert_eq!(s1.as_ptr(), s2.as_ptr());
        assert_ne!(s1.as_ptr(), s3.as_ptr());
    }

    #[test]
    fn test_process_address_range() {
        let options = CompileOptions::default();
        assert!(!options.is_process_address(16));
        assert!(options.is_process_address(0x1000));
        assert!(options.is_process_address(0x7f0000100000));
        assert!(!options.is_process_address(-1i64 as u64));
        assert!(!options.is_process_address(i64::MIN as u64));
    }

    #[test]
    fn test_relocation_first_entry_wins() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);

        ctx.record_relocation(
            0x7000,
            RelocationEntry::ExternalSymbol {
                name: "rt_alloc".into(),
            },
        );
        ctx.record_relocation(
            0x7000,
            RelocationEntry::EmbeddedObject {
                slot: "f_slot0".into(),
                payload: BlobRef::Offset(0),
            },
        );

        let table = ctx.relocations();
        assert_eq!(table.len(), 1);
        assert!(matches!(
            table.get(&0x7000),
            Some(RelocationEntry::ExternalSymbol { name }) if name == "rt_alloc"
        ));
        assert_eq!(ctx.stats().external_symbols, 1);
        assert_eq!(ctx.stats().embedded_objects, 0);
    }

    #[test]
    fn test_session_statistics() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);

        ctx.record_function_compiled("small", 16);
        ctx.record_function_compiled("big", 128);
        ctx.record_instruction_compiled("add");
        ctx.record_instruction_compiled("call");
        ctx.record_instruction_compiled("add");

        let stats = ctx.stats();
        assert_eq!(stats.functions_compiled, 2);
        assert_eq!(stats.total_code_size, 144);
        assert_eq!(stats.largest_function_name, "big");
        assert_eq!(stats.instruction_counts.get("add"), Some(&2));
        assert!(stats.to_string().contains("add: 2"));
    }

    #[test]
    fn test_link_names_first_wins() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        ctx.record_link("helper", "a");
        ctx.record_link("helper", "b");
        assert_eq!(ctx.linked_from("helper"), Some("a"));
        assert_eq!(ctx.linked_from("other"), None);
    }
}
