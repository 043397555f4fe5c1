//! Lowering of front-end GC intrinsics.
//!
//! The front end leaves calls to collector hooks in the IR. Freestanding
//! code has no collector to cooperate with, so barriers, preserve markers and
//! safepoints are deleted and typed allocations become plain `rt_alloc`.

use super::ModulePass;
use crate::core::error::{CompileError, CompileResult, Location};
use crate::core::session::CompilationContext;
use crate::ir::{FuncId, InstId, InstKind, Module, Operand, Type};
use crate::runtime::abi::Routine;

/// Hooks whose calls are removed outright.
pub const DROPPED: [&str; 4] = [
    "gc_write_barrier",
    "gc_preserve_begin",
    "gc_preserve_end",
    "gc_safepoint",
];

/// `gc_alloc_obj(ptr task, i64 size, ptr type) -> ptr`
pub const ALLOC_OBJ: &str = "gc_alloc_obj";

pub struct IntrinsicLowering;

enum Lowering {
    Drop,
    Alloc,
}

impl ModulePass for IntrinsicLowering {
    fn name(&self) -> &'static str {
        "lower-intrinsics"
    }

    fn run(&self, module: &mut Module, _ctx: &CompilationContext<'_>) -> CompileResult<bool> {
        let intrinsics: Vec<(FuncId, Lowering)> = module
            .functions
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_declaration())
            .filter_map(|(idx, f)| {
                if DROPPED.contains(&f.name.as_str()) {
                    Some((FuncId::new(idx), Lowering::Drop))
                } else if f.name == ALLOC_OBJ {
                    Some((FuncId::new(idx), Lowering::Alloc))
                } else {
                    None
                }
            })
            .collect();
        if intrinsics.is_empty() {
            return Ok(false);
        }

        let alloc = module.get_or_declare_function(
            Routine::Alloc.name(),
            Routine::Alloc.params(),
            Routine::Alloc.ret(),
        );

        let mut lowered = 0;
        for function in &mut module.functions {
            let calls: Vec<(usize, InstId, FuncId)> = function
                .placed_insts()
                .filter_map(|(block, id)| {
                    function
                        .inst(id)
                        .direct_callee()
                        .map(|callee| (block.index(), id, callee))
                })
                .collect();

            for (block, id, callee) in calls {
                let Some((_, lowering)) = intrinsics.iter().find(|(f, _)| *f == callee) else {
                    continue;
                };
                match lowering {
                    Lowering::Drop => {
                        function.replace_all_uses(id, Operand::Undef);
                        function.unplace(id);
                    }
                    Lowering::Alloc => {
                        let size = match &function.inst(id).kind {
                            InstKind::Call { args, .. } => {
                                args.iter().find(|(ty, _)| *ty == Type::I64).map(|&(_, size)| size)
                            }
                            _ => None,
                        };
                        let Some(size) = size else {
                            let index = function.blocks[block]
                                .insts
                                .iter()
                                .position(|&i| i == id)
                                .unwrap_or_default();
                            return Err(CompileError::unsupported(
                                format!("{ALLOC_OBJ} call without an i64 size"),
                                Location::at(
                                    function.name.clone(),
                                    function.blocks[block].name.clone(),
                                    index,
                                    function.inst(id).loc.clone(),
                                ),
                            ));
                        };
                        let inst = function.inst_mut(id);
                        inst.kind = InstKind::Call {
                            callee: Operand::Func(alloc),
                            args: vec![(Type::I64, size)],
                        };
                        inst.ty = Type::PTR;
                    }
                }
                lowered += 1;
            }
        }

        log::debug!("lower-intrinsics: {lowered} calls lowered");
        Ok(lowered > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;
    use bumpalo::Bump;

    #[test]
    fn barriers_disappear_and_allocation_becomes_rt_alloc() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let mut module = parse_module(
            r#"
declare @gc_write_barrier(ptr, ptr) -> void
declare @gc_preserve_begin(ptr) -> ptr
declare @gc_preserve_end(ptr) -> void
declare @gc_alloc_obj(ptr, i64, ptr) -> ptr

define @main(ptr %task, ptr %ty) -> ptr {
entry:
    %tok = call ptr @gc_preserve_begin(ptr %ty)
    %obj = call ptr @gc_alloc_obj(ptr %task, i64 16, ptr %ty)
    call void @gc_write_barrier(ptr %obj, ptr %ty)
    call void @gc_preserve_end(ptr %tok)
    ret %obj
}
"#,
        )
        .unwrap();
        assert!(IntrinsicLowering.run(&mut module, &ctx).unwrap());

        let alloc = module.function_by_name("rt_alloc").unwrap();
        let main = module.func(module.function_by_name("main").unwrap());
        let placed: Vec<_> = main.placed_insts().map(|(_, id)| main.inst(id)).collect();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].direct_callee(), Some(alloc));
        assert_eq!(
            placed[0].kind,
            InstKind::Call {
                callee: Operand::Func(alloc),
                args: vec![(Type::I64, Operand::Int(16))],
            }
        );

        // Declarations stay behind but have no calls left to lower.
        assert!(!IntrinsicLowering.run(&mut module, &ctx).unwrap());
    }

    #[test]
    fn modules_without_intrinsics_are_untouched() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let mut module = parse_module("define @f() -> void {\nentry:\n    ret\n}\n").unwrap();
        assert!(!IntrinsicLowering.run(&mut module, &ctx).unwrap());
        assert!(module.function_by_name("rt_alloc").is_none());
    }
}
