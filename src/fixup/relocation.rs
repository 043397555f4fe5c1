//! Relocation / symbolic fixup pass.
//!
//! Rewrites foreign calls and global loads through literal process
//! addresses into references to named external symbols.

use super::chain;
use super::RelocationEntry;
use crate::core::error::{CompileError, CompileResult, Location};
use crate::core::session::{CompilationContext, ResolvedAddress, UnresolvedPolicy};
use crate::frontend::{AddressOracle, HeapView};
use crate::ir::{ConstId, FuncId, InstId, InstKind, Module, Operand, Type};

/// How an address used at a call or load site was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification<'arena> {
    Runtime(&'arena str),
    /// A heap object; the global fixup pass embeds it.
    Heap,
    /// Below the embedding threshold: a plain integer, not an address.
    NotAnAddress,
    /// Unresolvable, kept as is under `UnresolvedPolicy::Warn`.
    Raw,
}

/// Look an address up in the runtime symbol table, then the oracle.
///
/// Results are cached in the context so that every occurrence of one address
/// resolves to the same name.
pub fn resolve_runtime<'arena>(
    ctx: &CompilationContext<'arena>,
    oracle: &dyn AddressOracle,
    address: u64,
) -> Option<&'arena str> {
    if let Some(ResolvedAddress::Runtime(name)) = ctx.cached_address(address) {
        return Some(name);
    }

    let name = ctx.symbols().lookup(address).or_else(|| {
        oracle
            .resolve(address)
            .into_iter()
            .find(|d| d.known_library)
            .map(|d| ctx.symbols().canonical(&d.symbol).to_string())
    })?;

    let name = ctx.intern_str(&name);
    ctx.cache_address(address, ResolvedAddress::Runtime(name));
    Some(name)
}

/// Classify `address` in the fixed order: symbol table, oracle, heap,
/// unresolved. Applies the unresolved policy.
pub fn classify<'arena>(
    ctx: &CompilationContext<'arena>,
    oracle: &dyn AddressOracle,
    heap: &dyn HeapView,
    address: u64,
    location: &Location,
) -> CompileResult<Classification<'arena>> {
    if !ctx.options().is_process_address(address) {
        return Ok(Classification::NotAnAddress);
    }
    match ctx.cached_address(address) {
        Some(ResolvedAddress::Embedded(_)) => return Ok(Classification::Heap),
        Some(ResolvedAddress::Raw) => return Ok(Classification::Raw),
        _ => {}
    }
    if let Some(name) = resolve_runtime(ctx, oracle, address) {
        return Ok(Classification::Runtime(name));
    }
    if heap.contains(address) {
        return Ok(Classification::Heap);
    }

    match ctx.options().unresolved {
        UnresolvedPolicy::Fail => Err(CompileError::RelocationResolutionFailure {
            address,
            location: location.clone(),
        }),
        UnresolvedPolicy::Warn => {
            log::warn!("leaving unresolved address {address:#x} at {location} in generated code");
            ctx.cache_address(address, ResolvedAddress::Raw);
            Ok(Classification::Raw)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelocationSummary {
    /// Call and load sites rewritten.
    pub sites: usize,
    /// Distinct external symbols bound.
    pub symbols: Vec<String>,
    /// Sites left for the global fixup pass.
    pub deferred: usize,
}

#[derive(Clone, Copy)]
enum Site {
    Call,
    Load,
}

pub struct RelocationPass<'c, 'arena> {
    ctx: &'c CompilationContext<'arena>,
    oracle: &'c dyn AddressOracle,
    heap: &'c dyn HeapView,
}

impl<'c, 'arena> RelocationPass<'c, 'arena> {
    pub fn new(
        ctx: &'c CompilationContext<'arena>,
        oracle: &'c dyn AddressOracle,
        heap: &'c dyn HeapView,
    ) -> Self {
        Self { ctx, oracle, heap }
    }

    pub fn run(&self, module: &mut Module) -> CompileResult<RelocationSummary> {
        let mut summary = RelocationSummary::default();

        for f in 0..module.functions.len() {
            let func = FuncId::new(f);
            if module.func(func).is_declaration() {
                continue;
            }
            let sites: Vec<_> = {
                let function = module.func(func);
                function
                    .blocks
                    .iter()
                    .flat_map(|block| {
                        block.insts.iter().enumerate().map(move |(idx, &inst)| (block, idx, inst))
                    })
                    .filter_map(|(block, idx, inst)| {
                        let i = function.inst(inst);
                        let (site, constant) = match &i.kind {
                            InstKind::Call {
                                callee: Operand::Const(c),
                                ..
                            } => (Site::Call, *c),
                            InstKind::Load {
                                ptr: Operand::Const(c),
                            } => (Site::Load, *c),
                            _ => return None,
                        };
                        let location =
                            Location::at(&function.name, &block.name, idx, i.loc.clone());
                        Some((inst, site, constant, location))
                    })
                    .collect()
            };

            for (inst, site, constant, location) in sites {
                let Some(address) = chain::leaf_address(&module.consts, constant) else {
                    continue;
                };
                match classify(self.ctx, self.oracle, self.heap, address, &location)? {
                    Classification::Runtime(name) => {
                        let replacement = self.bind(module, func, inst, site, constant, name);
                        self.replace_site(module, func, inst, replacement);
                        log::debug!("{location}: {address:#x} -> @{name}");
                        self.ctx.record_relocation(
                            address,
                            RelocationEntry::ExternalSymbol {
                                name: name.to_string(),
                            },
                        );
                        if !summary.symbols.iter().any(|s| s == name) {
                            summary.symbols.push(name.to_string());
                        }
                        summary.sites += 1;
                    }
                    Classification::Heap => summary.deferred += 1,
                    Classification::NotAnAddress | Classification::Raw => {}
                }
            }
        }

        log::info!(
            "relocation: {} sites bound to {} external symbols, {} deferred to global fixup",
            summary.sites,
            summary.symbols.len(),
            summary.deferred
        );
        Ok(summary)
    }

    /// Declare the symbol (reusing an existing declaration by name) and
    /// rebuild the operand chain around it.
    fn bind(
        &self,
        module: &mut Module,
        func: FuncId,
        inst: InstId,
        site: Site,
        constant: ConstId,
        name: &str,
    ) -> Operand {
        let target = match site {
            Site::Call => {
                let i = module.func(func).inst(inst);
                let params: Vec<Type> = match &i.kind {
                    InstKind::Call { args, .. } => args.iter().map(|(ty, _)| *ty).collect(),
                    _ => Vec::new(),
                };
                let ret = i.ty;
                Operand::Func(module.get_or_declare_function(name, &params, ret))
            }
            Site::Load => match module.function_by_name(name) {
                Some(f) => Operand::Func(f),
                None => Operand::Global(module.get_or_declare_global(name)),
            },
        };

        if chain::is_pure_cast_chain(&module.consts, constant) {
            target
        } else {
            chain::replace_leaf(&mut module.consts, constant, target)
        }
    }

    fn replace_site(&self, module: &mut Module, func: FuncId, inst: InstId, replacement: Operand) {
        match &mut module.func_mut(func).inst_mut(inst).kind {
            InstKind::Call { callee, .. } => *callee = replacement,
            InstKind::Load { ptr } => *ptr = replacement,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::{HeapImage, HeapValue, SymbolMap};
    use crate::ir::parse_module;
    use bumpalo::Bump;

    const SOURCE: &str = r#"
define @f(ptr %p) -> ptr {
entry:
    %a = call ptr bitcast(inttoptr(0x7f0000001000))(i64 16)
    %b = call ptr addrspacecast(inttoptr(0x7f0000001000), 10)(i64 32)
    call void inttoptr(0x7f0000002000)(ptr %a)
    call void inttoptr(0x7f0000002000)(ptr %b)
    %g = load ptr, gep(inttoptr(0x7f0000003000), 8)
    %h = load ptr, inttoptr(0x7f0000100000)
    ret %g
}
"#;

    fn oracle() -> SymbolMap {
        let mut map = SymbolMap::new();
        map.insert_library(0x7f0000001000, "gc_pool_alloc");
        map.insert_library(0x7f0000002000, "rt_report_oom");
        map.insert_library(0x7f0000003000, "rt_task_globals");
        map
    }

    #[test]
    fn repeated_addresses_share_one_declaration() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let mut module = parse_module(SOURCE).unwrap();
        let mut heap = HeapImage::new();
        heap.insert(0x7f0000100000, HeapValue::Text("x".into()));
        let oracle = oracle();

        let summary = RelocationPass::new(&ctx, &oracle, &heap).run(&mut module).unwrap();
        assert_eq!(summary.sites, 5);
        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.symbols, vec!["rt_alloc", "rt_report_oom", "rt_task_globals"]);

        let declared: Vec<&str> = module
            .functions
            .iter()
            .filter(|f| f.is_declaration())
            .map(|f| f.name.as_str())
            .collect();
        assert_eq!(declared, vec!["rt_alloc", "rt_report_oom"]);
        assert_eq!(module.global_by_name("rt_task_globals").map(|g| g.0), Some(0));

        let f = &module.functions[0];
        let alloc = module.function_by_name("rt_alloc").unwrap();
        assert_eq!(f.insts[0].direct_callee(), Some(alloc));
        assert_eq!(f.insts[1].direct_callee(), Some(alloc));

        // GEP chains keep their shape around the symbol.
        let InstKind::Load { ptr: Operand::Const(c) } = f.insts[4].kind else {
            panic!("expected constant gep");
        };
        assert_eq!(module.consts.get(c).op, crate::ir::ConstOp::Gep);

        let table = ctx.relocations();
        assert_eq!(table.len(), 3);
        assert!(matches!(
            table.get(&0x7f0000001000),
            Some(RelocationEntry::ExternalSymbol { name }) if name == "rt_alloc"
        ));
    }

    #[test]
    fn symbol_table_overrides_win_over_the_oracle() {
        let arena = Bump::new();
        let mut ctx = CompilationContext::new(&arena);
        ctx.symbols_mut().add_override(0x7f0000001000, "custom_alloc");
        let mut module = parse_module(SOURCE).unwrap();
        let mut heap = HeapImage::new();
        heap.insert(0x7f0000100000, HeapValue::Text("x".into()));

        RelocationPass::new(&ctx, &oracle(), &heap).run(&mut module).unwrap();
        assert!(module.function_by_name("custom_alloc").is_some());
        assert!(module.function_by_name("rt_alloc").is_none());
    }

    #[test]
    fn unresolved_addresses_fail_by_default() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let mut module = parse_module(SOURCE).unwrap();
        let err = RelocationPass::new(&ctx, &oracle(), &HeapImage::new())
            .run(&mut module)
            .unwrap_err();
        match err {
            CompileError::RelocationResolutionFailure { address, location } => {
                assert_eq!(address, 0x7f0000100000);
                assert_eq!(location.inst, Some(5));
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn warn_policy_leaves_the_address() {
        let arena = Bump::new();
        let mut ctx = CompilationContext::new(&arena);
        ctx.options_mut().unresolved = UnresolvedPolicy::Warn;
        let mut module = parse_module(SOURCE).unwrap();
        RelocationPass::new(&ctx, &oracle(), &HeapImage::new())
            .run(&mut module)
            .unwrap();
        assert_eq!(ctx.cached_address(0x7f0000100000), Some(ResolvedAddress::Raw));
    }
}
