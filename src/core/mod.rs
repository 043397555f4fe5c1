// This module serves as the central hub for the freestand back end's shared infrastructure.
// It exports the compilation context (arena allocation, compile options, the caches and
// tables every stage consults, and compilation statistics), the runtime symbol table that
// identifies process addresses, the single CompileError type with its Location context, and
// the ELF assembler that turns compiled functions and globals into a relocatable object.

//! Core freestand infrastructure.
//!
//! # Key Components
//!
//! ## Session Management (`session`)
//! - Arena-based memory allocation using `bumpalo`
//! - Compile options and the unresolved-address policy
//! - Address, link and relocation caches shared by all stages
//! - Compilation statistics
//!
//! ## Runtime Symbols (`symbols`)
//! - Address to name lookup for runtime-provided functions and data
//!
//! ## ELF Assembly (`assembler`)
//! - Direct ELF object file generation
//! - Symbol and relocation management
//! - Section handling for code and data

pub mod assembler;
pub mod error;
pub mod session;
pub mod symbols;

pub use assembler::ElfAssembler;
pub use error::{CompileError, CompileResult, Location};
pub use session::{CompilationContext, CompileOptions, DebugDetail, SessionStats, UnresolvedPolicy};
pub use symbols::RuntimeSymbolTable;
