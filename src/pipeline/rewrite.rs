//! Signature-keyed call substitution.
//!
//! A rule says "calls to `name` with exactly these parameter types go to
//! `target` instead". The table is consulted once per module, after linking
//! and before relocation, so rewritten calls end up as ordinary runtime
//! declarations.

use std::collections::BTreeMap;

use crate::core::session::CompilationContext;
use crate::ir::{FuncId, InstKind, Module, Operand, Type};
use crate::runtime::abi::Routine;

/// Lookup key: callee name plus parameter types.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Signature {
    pub name: String,
    pub params: Vec<Type>,
}

impl Signature {
    pub fn new(name: impl Into<String>, params: &[Type]) -> Self {
        Self {
            name: name.into(),
            params: params.to_vec(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RewriteTable {
    rules: BTreeMap<Signature, String>,
}

impl Default for RewriteTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.add(Signature::new("throw", &[Type::PTR]), Routine::Throw.name());
        table.add(Signature::new("error", &[Type::PTR]), Routine::Throw.name());
        table.add(Signature::new("gc_alloc", &[Type::I64]), Routine::Alloc.name());
        table.add(
            Signature::new("out_of_memory", &[Type::I64]),
            Routine::ReportOom.name(),
        );
        table
    }
}

impl RewriteTable {
    pub fn empty() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }

    /// Add or replace a rule.
    pub fn add(&mut self, signature: Signature, target: impl Into<String>) {
        self.rules.insert(signature, target.into());
    }

    pub fn target(&self, name: &str, params: &[Type]) -> Option<&str> {
        self.rules
            .get(&Signature::new(name, params))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Redirect every matching direct call. Returns the number of call sites
    /// rewritten.
    pub fn apply(&self, ctx: &CompilationContext<'_>, module: &mut Module) -> usize {
        // Resolve each declared callee once; defined functions are never
        // substituted.
        let mut redirects: BTreeMap<FuncId, FuncId> = BTreeMap::new();
        for f in 0..module.functions.len() {
            let id = FuncId::new(f);
            let callee = module.func(id);
            if !callee.is_declaration() {
                continue;
            }
            let params = callee.param_types();
            let ret = callee.ret;
            let Some(target) = self.target(&callee.name, &params).map(str::to_string) else {
                continue;
            };
            if target == module.func(id).name {
                continue;
            }
            log::debug!("rewrite: @{} -> @{target}", module.func(id).name);
            let replacement = module.get_or_declare_function(&target, &params, ret);
            redirects.insert(id, replacement);
        }
        if redirects.is_empty() {
            log::info!("rewrite: 0 call sites redirected");
            return 0;
        }

        let mut rewritten = 0;
        for function in &mut module.functions {
            for inst in &mut function.insts {
                if let InstKind::Call {
                    callee: callee @ Operand::Func(_),
                    ..
                } = &mut inst.kind
                {
                    let Operand::Func(old) = *callee else { continue };
                    if let Some(&new) = redirects.get(&old) {
                        *callee = Operand::Func(new);
                        rewritten += 1;
                    }
                }
            }
        }

        ctx.with_stats(|stats| stats.rewrites_applied += rewritten);
        log::info!("rewrite: {rewritten} call sites redirected");
        rewritten
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;
    use bumpalo::Bump;

    #[test]
    fn matches_on_name_and_parameter_types() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let mut module = parse_module(
            r#"
declare @throw(ptr) -> void
declare @gc_alloc(i32) -> ptr

define @f(ptr %e) -> void {
entry:
    %p = call ptr @gc_alloc(i32 8)
    call void @throw(ptr %e)
    call void @throw(ptr %p)
    unreachable
}
"#,
        )
        .unwrap();
        let rewritten = ctx.rewrites().apply(&ctx, &mut module);
        assert_eq!(rewritten, 2);

        let throw = module.function_by_name("rt_throw").unwrap();
        let f = module.func(module.function_by_name("f").unwrap());
        let callees: Vec<_> = f.insts.iter().filter_map(|i| i.direct_callee()).collect();
        assert_eq!(callees[1], throw);
        assert_eq!(callees[2], throw);
        // gc_alloc(i32) does not match gc_alloc(i64).
        assert_eq!(callees[0], module.function_by_name("gc_alloc").unwrap());
        assert_eq!(ctx.stats().rewrites_applied, 2);
    }

    #[test]
    fn rules_can_be_added_at_run_time() {
        let mut table = RewriteTable::empty();
        table.add(Signature::new("sqrt", &[Type::F64]), "rt_sqrt");
        assert_eq!(table.target("sqrt", &[Type::F64]), Some("rt_sqrt"));
        assert_eq!(table.target("sqrt", &[Type::I64]), None);
    }
}
