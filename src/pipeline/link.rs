//! IR-level linking of subroutine modules.
//!
//! Declarations left in the entry module are satisfied from modules the
//! front end supplies on request, repeating until a round links nothing new.
//! The first full definition of a name wins. What happens to later
//! definitions of the same name depends on [`DebugDetail`]: with `Full` they
//! are kept as internal copies named `<name>.dup<N>`, with `Minimal` they are
//! recorded as stubs that refer to the winner by name.
//!
//! Only external names take part in that resolution. An internal function or
//! global is private to the module that defines it, so it is imported with its
//! first user under the name `<name>.<module>`.

use std::collections::BTreeSet;
use std::fmt;

use hashbrown::HashMap;

use crate::core::error::CompileResult;
use crate::core::session::{CompilationContext, DebugDetail};
use crate::frontend::Frontend;
use crate::ir::{ConstId, FuncId, Function, GlobalId, GlobalKind, Linkage, Module, Operand};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// The body was linked in as the definition.
    Full,
    /// A duplicate definition, referenced by name only.
    Stub,
    /// A duplicate definition kept as an internal copy.
    DebugCopy,
}

impl LinkKind {
    fn name(self) -> &'static str {
        match self {
            LinkKind::Full => "full",
            LinkKind::Stub => "stub",
            LinkKind::DebugCopy => "debug-copy",
        }
    }
}

/// How one definition from a subroutine module entered the entry module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRecord {
    pub function: String,
    /// Module that supplied the definition.
    pub module: String,
    pub kind: LinkKind,
    /// Name of the function in the linked module.
    pub linked_as: String,
}

/// Outcome of linking: one record per definition considered, in link order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPlan {
    pub detail: DebugDetail,
    pub records: Vec<LinkRecord>,
    /// Declarations no subroutine module defines (runtime routines).
    pub unresolved: Vec<String>,
}

impl LinkPlan {
    pub fn new(detail: DebugDetail) -> Self {
        Self {
            detail,
            records: Vec::new(),
            unresolved: Vec::new(),
        }
    }

    pub fn count(&self, kind: LinkKind) -> usize {
        self.records.iter().filter(|r| r.kind == kind).count()
    }

    /// The record of the winning definition of `function`.
    pub fn definition(&self, function: &str) -> Option<&LinkRecord> {
        self.records
            .iter()
            .find(|r| r.function == function && r.kind == LinkKind::Full)
    }
}

impl fmt::Display for LinkPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "link plan ({:?}):", self.detail)?;
        for record in &self.records {
            writeln!(
                f,
                "  {:<10} @{} from {} as @{}",
                record.kind.name(),
                record.function,
                record.module,
                record.linked_as
            )?;
        }
        if !self.unresolved.is_empty() {
            writeln!(f, "  external: {}", self.unresolved.join(", "))?;
        }
        Ok(())
    }
}

pub struct Linker<'c, 'arena> {
    ctx: &'c CompilationContext<'arena>,
    frontend: &'c dyn Frontend,
}

impl<'c, 'arena> Linker<'c, 'arena> {
    pub fn new(ctx: &'c CompilationContext<'arena>, frontend: &'c dyn Frontend) -> Self {
        Self { ctx, frontend }
    }

    pub fn link(&self, module: &mut Module) -> CompileResult<LinkPlan> {
        let detail = self.ctx.options().debug_detail;
        let mut plan = LinkPlan::new(detail);
        let mut requested: BTreeSet<String> = BTreeSet::new();
        let mut copies: HashMap<String, usize> = HashMap::new();

        loop {
            let wanted: Vec<String> = module
                .functions
                .iter()
                .filter(|f| f.is_declaration() && !requested.contains(&f.name))
                .map(|f| f.name.clone())
                .collect();
            if wanted.is_empty() {
                break;
            }
            requested.extend(wanted.iter().cloned());

            let sources = self.frontend.subroutine_modules(&wanted)?;
            log::debug!(
                "link round: {} declarations, {} candidate modules",
                wanted.len(),
                sources.len()
            );

            for source in &sources {
                let mut importer = Importer::new(source);
                for (idx, function) in source.functions.iter().enumerate() {
                    if function.is_declaration()
                        || function.linkage == Linkage::Internal
                        || !wanted.contains(&function.name)
                    {
                        continue;
                    }
                    let Some(existing) = module.function_by_name(&function.name) else {
                        continue;
                    };

                    if module.func(existing).is_declaration() {
                        let body = importer.import_function(module, FuncId::new(idx));
                        *module.func_mut(existing) = body;
                        self.ctx.record_link(&function.name, &source.name);
                        self.ctx.with_stats(|s| s.subroutines_linked += 1);
                        log::debug!("linked @{} from {}", function.name, source.name);
                        plan.records.push(LinkRecord {
                            function: function.name.clone(),
                            module: source.name.clone(),
                            kind: LinkKind::Full,
                            linked_as: function.name.clone(),
                        });
                        continue;
                    }

                    match detail {
                        DebugDetail::Full => {
                            let n = copies.entry(function.name.clone()).or_insert(0);
                            *n += 1;
                            let copy_name = format!("{}.dup{}", function.name, n);
                            let mut body = importer.import_function(module, FuncId::new(idx));
                            body.name = copy_name.clone();
                            body.linkage = Linkage::Internal;
                            module.add_function(body);
                            self.ctx.with_stats(|s| s.debug_copies += 1);
                            log::debug!(
                                "kept duplicate @{} from {} as @{copy_name}",
                                function.name,
                                source.name
                            );
                            plan.records.push(LinkRecord {
                                function: function.name.clone(),
                                module: source.name.clone(),
                                kind: LinkKind::DebugCopy,
                                linked_as: copy_name,
                            });
                        }
                        DebugDetail::Minimal => {
                            log::debug!(
                                "duplicate @{} from {} refers to the definition from {}",
                                function.name,
                                source.name,
                                self.ctx.linked_from(&function.name).unwrap_or("the entry module")
                            );
                            plan.records.push(LinkRecord {
                                function: function.name.clone(),
                                module: source.name.clone(),
                                kind: LinkKind::Stub,
                                linked_as: function.name.clone(),
                            });
                        }
                    }
                }
            }
        }

        plan.unresolved = module
            .functions
            .iter()
            .filter(|f| f.is_declaration())
            .map(|f| f.name.clone())
            .collect();
        log::info!(
            "link: {} linked, {} duplicates, {} external declarations",
            plan.count(LinkKind::Full),
            plan.count(LinkKind::Stub) + plan.count(LinkKind::DebugCopy),
            plan.unresolved.len()
        );
        Ok(plan)
    }
}

/// `<name>.<module>`, numbered further if that is taken too.
fn private_name(taken: impl Fn(&str) -> bool, name: &str, module: &str) -> String {
    let base = format!("{name}.{module}");
    let mut candidate = base.clone();
    let mut n = 1;
    while taken(&candidate) {
        candidate = format!("{base}.{n}");
        n += 1;
    }
    candidate
}

/// Copies entities from one source module into the destination. External
/// functions and globals are mapped by name, internal definitions get
/// private copies.
struct Importer<'s> {
    src: &'s Module,
    funcs: HashMap<FuncId, FuncId>,
    globals: HashMap<GlobalId, GlobalId>,
    consts: HashMap<ConstId, ConstId>,
    /// Private copies declared but not yet given their bodies.
    pending: Vec<(FuncId, FuncId)>,
}

impl<'s> Importer<'s> {
    fn new(src: &'s Module) -> Self {
        Self {
            src,
            funcs: HashMap::new(),
            globals: HashMap::new(),
            consts: HashMap::new(),
            pending: Vec::new(),
        }
    }

    /// Body of `func` rewritten into `dst`, with every internal function it
    /// reaches already copied.
    fn import_function(&mut self, dst: &mut Module, func: FuncId) -> Function {
        let body = self.import_body(dst, func);
        while let Some((src, mapped)) = self.pending.pop() {
            let mut private = self.import_body(dst, src);
            private.name = dst.func(mapped).name.clone();
            *dst.func_mut(mapped) = private;
        }
        body
    }

    fn import_body(&mut self, dst: &mut Module, func: FuncId) -> Function {
        let mut body = self.src.func(func).clone();
        for inst in &mut body.insts {
            for op in inst.operands_mut() {
                *op = self.operand(dst, *op);
            }
        }
        body
    }

    fn operand(&mut self, dst: &mut Module, op: Operand) -> Operand {
        match op {
            Operand::Func(f) => Operand::Func(self.function(dst, f)),
            Operand::Global(g) => Operand::Global(self.global(dst, g)),
            Operand::Const(c) => Operand::Const(self.constant(dst, c)),
            other => other,
        }
    }

    fn function(&mut self, dst: &mut Module, func: FuncId) -> FuncId {
        if let Some(&mapped) = self.funcs.get(&func) {
            return mapped;
        }
        let f = self.src.func(func);
        if f.linkage == Linkage::Internal && !f.is_declaration() {
            let name = private_name(|n| dst.function_by_name(n).is_some(), &f.name, &self.src.name);
            log::debug!("imported internal @{} from {} as @{name}", f.name, self.src.name);
            let mut placeholder = Function::declaration(name, &f.param_types(), f.ret);
            placeholder.linkage = Linkage::Internal;
            let mapped = dst.add_function(placeholder);
            self.funcs.insert(func, mapped);
            self.pending.push((func, mapped));
            return mapped;
        }
        let mapped = dst.get_or_declare_function(&f.name, &f.param_types(), f.ret);
        self.funcs.insert(func, mapped);
        mapped
    }

    fn global(&mut self, dst: &mut Module, global: GlobalId) -> GlobalId {
        if let Some(&mapped) = self.globals.get(&global) {
            return mapped;
        }
        let g = self.src.global(global);
        let (mapped, define) = if g.linkage == Linkage::Internal && !g.is_extern() {
            let mut private = g.clone();
            private.name = private_name(|n| dst.global_by_name(n).is_some(), &g.name, &self.src.name);
            (dst.add_global(private), true)
        } else {
            match dst.global_by_name(&g.name) {
                Some(id) => (id, dst.global(id).is_extern() && !g.is_extern()),
                None => (dst.add_global(g.clone()), !g.is_extern()),
            }
        };
        self.globals.insert(global, mapped);

        if define {
            let mut copy = g.clone();
            copy.name = dst.global(mapped).name.clone();
            if let GlobalKind::Data { relocs, .. } = &mut copy.kind {
                for reloc in relocs.iter_mut() {
                    reloc.target = self.operand(dst, reloc.target);
                }
            }
            dst.globals[mapped.index()] = copy;
        }
        mapped
    }

    fn constant(&mut self, dst: &mut Module, id: ConstId) -> ConstId {
        if let Some(&mapped) = self.consts.get(&id) {
            return mapped;
        }
        let mut expr = self.src.consts.get(id).clone();
        for op in expr.operands.iter_mut() {
            *op = self.operand(dst, *op);
        }
        let mapped = dst.intern_const(expr);
        self.consts.insert(id, mapped);
        mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::CompileOptions;
    use crate::frontend::{EntrySignature, TextualFrontend};
    use crate::ir::{InstKind, Type};
    use bumpalo::Bump;

    fn frontend() -> TextualFrontend {
        let mut fe = TextualFrontend::new();
        fe.add_source(
            "entry",
            r#"
declare @helper(i64) -> i64
define @main(i64 %n) -> i64 {
entry:
    %r = call i64 @helper(i64 %n)
    ret %r
}
"#,
        )
        .unwrap();
        fe.add_source(
            "helpers",
            r#"
global @table : data x"0100000000000000"
declare @inner(i64) -> i64
define @helper(i64 %x) -> i64 {
entry:
    %t = load i64, @table
    %y = call i64 @inner(i64 %x)
    %z = add i64 %y, %t
    ret %z
}
"#,
        )
        .unwrap();
        fe.add_source(
            "inner",
            r#"
define @inner(i64 %x) -> i64 {
entry:
    %y = mul i64 %x, 2
    ret %y
}
"#,
        )
        .unwrap();
        fe.add_source(
            "again",
            r#"
define @helper(i64 %x) -> i64 {
entry:
    ret %x
}
"#,
        )
        .unwrap();
        fe
    }

    fn link_with(detail: DebugDetail) -> (Module, LinkPlan) {
        let arena = Bump::new();
        let options = CompileOptions {
            debug_detail: detail,
            ..CompileOptions::default()
        };
        let ctx = CompilationContext::with_options(&arena, options);
        let fe = frontend();
        let mut module = fe
            .entry_module(&EntrySignature::new("main", vec![Type::I64], Type::I64))
            .unwrap();
        let plan = Linker::new(&ctx, &fe).link(&mut module).unwrap();
        assert_eq!(ctx.linked_from("helper"), Some("helpers"));
        (module, plan)
    }

    #[test]
    fn links_transitively_until_nothing_is_missing() {
        let (module, plan) = link_with(DebugDetail::Minimal);
        assert!(plan.unresolved.is_empty());
        assert_eq!(plan.definition("helper").unwrap().module, "helpers");
        assert_eq!(plan.definition("inner").unwrap().module, "inner");
        assert_eq!(plan.count(LinkKind::Stub), 1);

        let helper = module.func(module.function_by_name("helper").unwrap());
        assert!(!helper.is_declaration());
        let table = module.global_by_name("table").unwrap();
        assert!(helper.insts.iter().any(|i| i.kind
            == InstKind::Load {
                ptr: Operand::Global(table)
            }));
        assert!(module.function_by_name("helper.dup1").is_none());
    }

    #[test]
    fn internal_functions_stay_private_to_their_module() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut fe = TextualFrontend::new();
        fe.add_source(
            "entry",
            r#"
declare @helper() -> i64
define internal @aux() -> i64 {
entry:
    ret 1
}
define @main() -> i64 {
entry:
    %a = call i64 @helper()
    %b = call i64 @aux()
    %c = add i64 %a, %b
    ret %c
}
"#,
        )
        .unwrap();
        fe.add_source(
            "helpers",
            r#"
define internal @aux() -> i64 {
entry:
    ret 2
}
define @helper() -> i64 {
entry:
    %r = call i64 @aux()
    ret %r
}
"#,
        )
        .unwrap();

        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let mut module = fe
            .entry_module(&EntrySignature::new("main", vec![], Type::I64))
            .unwrap();
        let plan = Linker::new(&ctx, &fe).link(&mut module).unwrap();
        assert!(plan.unresolved.is_empty());
        assert!(plan.definition("aux").is_none());

        let private = module.function_by_name("aux.helpers").unwrap();
        assert_eq!(module.func(private).linkage, Linkage::Internal);
        assert!(!module.func(private).is_declaration());
        let helper = module.func(module.function_by_name("helper").unwrap());
        let callees: Vec<_> = helper
            .placed_insts()
            .filter_map(|(_, id)| helper.inst(id).direct_callee())
            .collect();
        assert_eq!(callees, vec![private]);

        let mut machine = crate::runtime::Machine::new(&module).unwrap();
        assert_eq!(machine.call("main", &[]).unwrap(), 3);
    }

    #[test]
    fn full_detail_keeps_internal_copies() {
        let (module, plan) = link_with(DebugDetail::Full);
        assert_eq!(plan.count(LinkKind::DebugCopy), 1);
        let copy = module.func(module.function_by_name("helper.dup1").unwrap());
        assert_eq!(copy.linkage, Linkage::Internal);
        assert!(plan.to_string().contains("debug-copy @helper from again as @helper.dup1"));
    }
}
