// This module drives one compilation from front-end IR to a relocatable object. Pipeline asks
// the front end for the module holding the entry function, strips the front end's dispatch
// wrappers, pins down the single externally visible definition and renames it to the entry
// name, links in the subroutines it transitively calls, applies the signature-keyed rewrite
// rules, runs the relocation and global fixup passes that remove every process address,
// legalizes and optionally optimizes the result, verifies it and finally generates x86-64 code
// and writes the ELF object. Every stage shares the caller's CompilationContext, and the
// CompiledUnit hands back everything a caller or a test may want to inspect: the object bytes,
// the blob, the relocation table, the slots, the link plan, the final IR and the statistics.

//! Pipeline orchestration.

pub mod link;
pub mod rewrite;

pub use link::{LinkKind, LinkPlan, LinkRecord, Linker};
pub use rewrite::{RewriteTable, Signature};

use std::collections::BTreeMap;

use crate::core::assembler::ElfAssembler;
use crate::core::error::{CompileError, CompileResult, Location};
use crate::core::session::{CompilationContext, SessionStats};
use crate::fixup::{
    GlobalFixupPass, InitializerSymbols, RelocationEntry, RelocationPass, RelocationSummary, SlotInfo,
};
use crate::frontend::{EntrySignature, Frontend};
use crate::ir::{Linkage, Module, Operand};
use crate::passes::{verify_module, PassManager};
use crate::serialize::BlobWrite;

/// Everything produced by compiling one entry function.
pub struct CompiledUnit {
    /// Relocatable ELF x86-64 object.
    pub object: Vec<u8>,
    pub entry: String,
    pub init: InitializerSymbols,
    pub blob: Vec<u8>,
    pub blob_writes: Vec<BlobWrite>,
    pub relocations: BTreeMap<u64, RelocationEntry>,
    pub slots: Vec<SlotInfo>,
    pub link_plan: LinkPlan,
    pub relocation_summary: RelocationSummary,
    /// The module as it was handed to code generation.
    pub module: Module,
    pub stats: SessionStats,
}

pub struct Pipeline<'c, 'arena> {
    ctx: &'c CompilationContext<'arena>,
    frontend: &'c dyn Frontend,
}

impl<'c, 'arena> Pipeline<'c, 'arena> {
    pub fn new(ctx: &'c CompilationContext<'arena>, frontend: &'c dyn Frontend) -> Self {
        Self { ctx, frontend }
    }

    pub fn compile(&self, signature: &EntrySignature) -> CompileResult<CompiledUnit> {
        let ctx = self.ctx;
        let entry = signature.name.clone();
        log::info!("compiling entry '{entry}'");

        let mut module = self.frontend.entry_module(signature)?;
        strip_dispatch_wrappers(&mut module)?;
        select_entry(&mut module, signature)?;

        let link_plan = Linker::new(ctx, self.frontend).link(&mut module)?;
        for function in &mut module.functions {
            if function.name != entry && !function.is_declaration() {
                function.linkage = Linkage::Internal;
            }
        }

        ctx.rewrites().apply(ctx, &mut module);

        let oracle = self.frontend.oracle();
        let heap = self.frontend.heap();
        let relocation_summary = RelocationPass::new(ctx, oracle, heap).run(&mut module)?;

        let fixup = GlobalFixupPass::new(ctx, oracle, heap, entry.as_str()).run(&mut module)?;

        PassManager::for_options(ctx.options()).run(&mut module, ctx)?;
        verify_module(&module, ctx)?;

        let compiled = crate::x64::compile_module(&module, ctx)?;
        let object = ElfAssembler::emit(&module, &compiled)?;
        log::info!("object: {} bytes, {} functions", object.len(), compiled.len());

        Ok(CompiledUnit {
            object,
            entry,
            init: fixup.init,
            blob: fixup.blob,
            blob_writes: fixup.blob_writes,
            relocations: ctx.relocations().clone(),
            slots: fixup.slots,
            link_plan,
            relocation_summary,
            module,
            stats: ctx.stats(),
        })
    }
}

/// Compile `signature` with the standard pipeline.
pub fn compile(
    ctx: &CompilationContext<'_>,
    frontend: &dyn Frontend,
    signature: &EntrySignature,
) -> CompileResult<CompiledUnit> {
    Pipeline::new(ctx, frontend).compile(signature)
}

/// Remove the front end's calling-convention adapters. Nothing may still
/// refer to them.
fn strip_dispatch_wrappers(module: &mut Module) -> CompileResult<()> {
    let keep: Vec<bool> = module.functions.iter().map(|f| !f.attrs.dispatch_wrapper).collect();
    if keep.iter().all(|&k| k) {
        return Ok(());
    }

    let is_wrapper = |op: Operand| matches!(op, Operand::Func(f) if !keep[f.index()]);
    for function in module.functions.iter().filter(|f| !f.attrs.dispatch_wrapper) {
        for (_, id) in function.placed_insts() {
            if let Some(op) = function.inst(id).operands().into_iter().find(|&op| is_wrapper(op)) {
                return Err(CompileError::malformed(
                    format!(
                        "still refers to dispatch wrapper {}",
                        module.display_operand(Some(function), op)
                    ),
                    Location::in_function(function.name.clone()),
                ));
            }
        }
    }
    if module.consts.iter().any(|(_, expr)| expr.operands.iter().any(|&op| is_wrapper(op))) {
        return Err(CompileError::malformed(
            "constant expression refers to a dispatch wrapper",
            Location::default(),
        ));
    }

    let removed: Vec<&str> = module
        .functions
        .iter()
        .filter(|f| f.attrs.dispatch_wrapper)
        .map(|f| f.name.as_str())
        .collect();
    log::debug!("stripping dispatch wrappers {removed:?}");
    let keep_globals = vec![true; module.globals.len()];
    module.retain(&keep, &keep_globals);
    Ok(())
}

/// Find the unique externally visible definition and give it the entry name.
fn select_entry(module: &mut Module, signature: &EntrySignature) -> CompileResult<()> {
    let candidates: Vec<usize> = module
        .functions
        .iter()
        .enumerate()
        .filter(|(_, f)| f.linkage == Linkage::External && !f.is_declaration() && !f.attrs.generated)
        .map(|(idx, _)| idx)
        .collect();
    let &[index] = candidates.as_slice() else {
        return Err(CompileError::AmbiguousEntryPoint {
            entry: signature.name.clone(),
            candidates: candidates.iter().map(|&i| module.functions[i].name.clone()).collect(),
        });
    };

    let function = &module.functions[index];
    if function.name != signature.name {
        if let Some(other) = module.function_by_name(&signature.name) {
            return Err(CompileError::malformed(
                format!("cannot rename @{} to @{}: name is taken", function.name, signature.name),
                Location::in_function(module.func(other).name.clone()),
            ));
        }
    }
    if function.param_types() != signature.params || function.ret != signature.ret {
        log::warn!(
            "entry @{} has type ({:?}) -> {} but ({:?}) -> {} was requested",
            function.name,
            function.param_types(),
            function.ret,
            signature.params,
            signature.ret
        );
    }
    log::debug!("entry point @{} -> @{}", function.name, signature.name);
    module.functions[index].name = signature.name.clone();
    Ok(())
}
