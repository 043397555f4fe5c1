//! Global fixup pass.
//!
//! Runs after the relocation pass. Every constant chain left in a function
//! body is materialized; literal addresses that name heap objects are
//! serialized once each and read back through a per-object slot.

use super::materialize::{materialize_function, LiteralResolver, LiteralUse};
use super::relocation::{classify, Classification};
use super::routine::{self, InitializerSymbols};
use super::RelocationEntry;
use crate::core::error::{CompileError, CompileResult, Location};
use crate::core::session::{CompilationContext, ResolvedAddress};
use crate::frontend::{AddressOracle, HeapView};
use crate::ir::{FuncId, Global, GlobalId, Module, Operand};
use crate::serialize::{BlobWrite, Expr, InitStmt, Serializer};

/// One embedded object and the slot that holds it at run time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub index: usize,
    pub address: u64,
    pub name: String,
    pub global: GlobalId,
    /// Expression the deserialization routine stores into the slot.
    pub root: Expr,
}

#[derive(Debug, Clone)]
pub struct GlobalFixupOutput {
    pub slots: Vec<SlotInfo>,
    pub blob: Vec<u8>,
    pub blob_writes: Vec<BlobWrite>,
    pub stmts: Vec<InitStmt>,
    pub init: InitializerSymbols,
    /// Instructions inserted while materializing constant chains.
    pub materialized: usize,
}

pub struct GlobalFixupPass<'c, 'arena> {
    ctx: &'c CompilationContext<'arena>,
    oracle: &'c dyn AddressOracle,
    entry: String,
    serializer: Serializer<'c>,
    slots: Vec<SlotInfo>,
}

impl<'c, 'arena> GlobalFixupPass<'c, 'arena> {
    pub fn new(
        ctx: &'c CompilationContext<'arena>,
        oracle: &'c dyn AddressOracle,
        heap: &'c dyn HeapView,
        entry: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            oracle,
            entry: entry.into(),
            serializer: Serializer::new(heap, ctx.encoders()),
            slots: Vec::new(),
        }
    }

    pub fn run(mut self, module: &mut Module) -> CompileResult<GlobalFixupOutput> {
        let mut materialized = 0;
        for f in 0..module.functions.len() {
            let func = FuncId::new(f);
            let function = module.func(func);
            if function.is_declaration() || function.attrs.generated {
                continue;
            }
            log::trace!("global fixup: @{}", function.name);
            materialized += materialize_function(module, func, &mut self)?;
        }

        let (blob, stmts) = self.serializer.into_context().into_parts();
        let blob_writes = blob.writes().to_vec();
        let blob = blob.into_bytes();
        let init = routine::synthesize(module, &self.entry, &blob, &stmts, &self.slots)?;

        self.ctx.with_stats(|stats| {
            stats.constants_materialized += materialized;
            stats.blob_bytes += blob.len();
        });
        log::info!(
            "global fixup: {} slots, {} blob bytes, {} initializer calls, {} instructions materialized",
            self.slots.len(),
            blob.len(),
            stmts.len(),
            materialized
        );

        Ok(GlobalFixupOutput {
            slots: self.slots,
            blob,
            blob_writes,
            stmts,
            init,
            materialized,
        })
    }

    fn embed(&mut self, module: &mut Module, address: u64, location: &Location) -> CompileResult<GlobalId> {
        if let Some(ResolvedAddress::Embedded(slot)) = self.ctx.cached_address(address) {
            return module.global_by_name(slot).ok_or_else(|| {
                CompileError::malformed(format!("slot @{slot} is missing"), location.clone())
            });
        }

        self.serializer.set_location(location.clone());
        let root = self.serializer.serialize(address)?;

        let index = self.slots.len();
        let name = format!("{}_slot{index}", self.entry);
        let global = module.add_global(Global::zeroed(name.as_str(), 8));
        self.ctx
            .cache_address(address, ResolvedAddress::Embedded(self.ctx.intern_str(&name)));
        self.ctx.record_relocation(
            address,
            RelocationEntry::EmbeddedObject {
                slot: name.clone(),
                payload: self.serializer.payload_of(address),
            },
        );
        log::debug!("{location}: embedded {address:#x} as @{name} ({root})");

        self.slots.push(SlotInfo {
            index,
            address,
            name,
            global,
            root,
        });
        Ok(global)
    }
}

impl LiteralResolver for GlobalFixupPass<'_, '_> {
    fn resolve_literal(
        &mut self,
        module: &mut Module,
        address: u64,
        location: &Location,
    ) -> CompileResult<LiteralUse> {
        let heap = self.serializer.heap();
        match classify(self.ctx, self.oracle, heap, address, location)? {
            Classification::NotAnAddress | Classification::Raw => Ok(LiteralUse::Keep),
            Classification::Runtime(name) => {
                let operand = match module.function_by_name(name) {
                    Some(func) => Operand::Func(func),
                    None => Operand::Global(module.get_or_declare_global(name)),
                };
                self.ctx.record_relocation(
                    address,
                    RelocationEntry::ExternalSymbol {
                        name: name.to_string(),
                    },
                );
                Ok(LiteralUse::Operand(operand))
            }
            Classification::Heap => Ok(LiteralUse::LoadFrom(self.embed(module, address, location)?)),
        }
    }
}
