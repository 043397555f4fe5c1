//! freestand - relocation and object embedding for ahead-of-time compilation.
//!
//! A JIT-oriented front end produces IR that still points into the live
//! process that generated it: runtime routines are called through literal
//! addresses and heap objects are referenced by pointer constants. freestand
//! turns such a module into a freestanding relocatable x86-64 ELF object.
//! Runtime routine addresses become external symbols, referenced heap objects
//! are serialized into a read-only blob and rebuilt by a generated
//! initializer, and the result is compiled to machine code.
//!
//! # Primary Usage
//!
//! ```ignore
//! use bumpalo::Bump;
//! use freestand::core::CompilationContext;
//! use freestand::frontend::{EntrySignature, TextualFrontend};
//! use freestand::ir::Type;
//!
//! let mut frontend = TextualFrontend::new();
//! frontend.add_source("main", &ir_text)?;
//!
//! let arena = Bump::new();
//! let ctx = CompilationContext::new(&arena);
//! let signature = EntrySignature::new("main", vec![Type::I64], Type::I64);
//! let unit = freestand::pipeline::compile(&ctx, &frontend, &signature)?;
//! std::fs::write("main.o", &unit.object)?;
//! ```
//!
//! # Architecture
//!
//! - [`ir`] - IR data model, text format and builder
//! - [`frontend`] - front end, heap snapshot and address oracle capabilities
//! - [`serialize`] - heap object serializer
//! - [`fixup`] - relocation and global fixup passes
//! - [`passes`] - legalization and optimization
//! - [`pipeline`] - orchestration, IR linking and rewrite rules
//! - [`x64`] - x86-64 code generation
//! - [`core`] - context, errors, runtime symbols and ELF emission
//! - [`runtime`] - runtime library ABI and reference evaluator
//! - [`toolchain`] - external linker invocation

pub mod core;
pub mod fixup;
pub mod frontend;
pub mod ir;
pub mod passes;
pub mod pipeline;
pub mod runtime;
pub mod serialize;
pub mod toolchain;
pub mod x64;

pub use core::{
    CompilationContext, CompileError, CompileOptions, CompileResult, DebugDetail, Location, SessionStats,
    UnresolvedPolicy,
};
pub use frontend::{EntrySignature, Frontend, TextualFrontend};
pub use pipeline::{compile, CompiledUnit, Pipeline};
