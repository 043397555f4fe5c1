//! x86-64 architecture-specific components.
//!
//! This module contains all x86-64 specific code:
//! - Instruction encoding using iced-x86
//! - System V calling convention implementation
//! - Stack-slot code generation for IR functions

pub mod calling_convention;
pub mod encoder;
pub mod function_codegen;

pub use calling_convention::{CCAssigner, CCAssignment, FunctionFrame, SysVAssigner};
pub use encoder::{Condition, EncodedFunction, EncodingError, Reg, X64Encoder};
pub use function_codegen::FunctionCodegen;

use crate::core::error::CompileResult;
use crate::core::session::CompilationContext;
use crate::ir::{FuncId, GlobalId, Module};

/// Symbol a code placeholder refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixupTarget {
    Func(FuncId),
    Global(GlobalId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixupKind {
    /// `call rel32`; resolved through the PLT when the target is external.
    Call,
    /// RIP-relative displacement of a `lea` to a symbol defined in this object.
    PcRelative,
    /// RIP-relative displacement of a `mov` from the symbol's GOT entry.
    GotPcRelative,
}

/// A 32-bit displacement inside a function's code that the object writer
/// turns into a relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeFixup {
    /// Byte offset of the displacement from the start of the function.
    pub offset: u64,
    pub target: FixupTarget,
    pub kind: FixupKind,
}

/// Generate code for every defined function, in module order.
pub fn compile_module(
    module: &Module,
    ctx: &CompilationContext<'_>,
) -> CompileResult<Vec<(FuncId, EncodedFunction)>> {
    let mut compiled = Vec::new();
    for (idx, function) in module.functions.iter().enumerate() {
        if function.is_declaration() {
            continue;
        }
        let encoded = FunctionCodegen::new(module, function, ctx.arena())?.compile(ctx)?;
        log::debug!("x64: @{} -> {} bytes, {} fixups", function.name, encoded.code.len(), encoded.fixups.len());
        compiled.push((FuncId::new(idx), encoded));
    }
    Ok(compiled)
}
