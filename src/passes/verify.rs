//! Structural verification before code generation.
//!
//! Checks the properties the x86-64 back end relies on: every block ends in
//! exactly one terminator, operands refer to things that exist, no constant
//! expression survived global fixup and direct calls pass as many arguments
//! as the callee declares. A raw `inttoptr` of a process-sized literal is a
//! relocation failure unless the context allows unresolved addresses.

use hashbrown::HashSet;

use crate::core::error::{CompileError, CompileResult, Location};
use crate::core::session::{CompilationContext, UnresolvedPolicy};
use crate::ir::{CastOp, Function, InstId, InstKind, Module, Operand};

pub fn verify_module(module: &Module, ctx: &CompilationContext<'_>) -> CompileResult<()> {
    for function in module.functions.iter().filter(|f| !f.is_declaration()) {
        verify_function(module, function, ctx)?;
    }
    log::debug!("verify: {} functions ok", module.functions.len());
    Ok(())
}

fn verify_function(module: &Module, function: &Function, ctx: &CompilationContext<'_>) -> CompileResult<()> {
    let placed: HashSet<InstId> = function.placed_insts().map(|(_, id)| id).collect();
    let options = ctx.options();

    for block in &function.blocks {
        let at = |index: usize| {
            Location::at(
                function.name.clone(),
                block.name.clone(),
                index,
                block.insts.get(index).and_then(|&id| function.inst(id).loc.clone()),
            )
        };
        if block.insts.is_empty() {
            return Err(CompileError::malformed("empty block", at(0)));
        }

        for (index, &id) in block.insts.iter().enumerate() {
            let inst = function.inst(id);
            let last = index + 1 == block.insts.len();
            if inst.is_terminator() != last {
                let reason = if last {
                    "block does not end in a terminator"
                } else {
                    "terminator in the middle of a block"
                };
                return Err(CompileError::malformed(reason, at(index)));
            }

            for op in inst.operands() {
                let valid = match op {
                    Operand::Value(v) => placed.contains(&v) && !function.inst(v).ty.is_void(),
                    Operand::Arg(a) => (a as usize) < function.params.len(),
                    Operand::Func(f) => f.index() < module.functions.len(),
                    Operand::Global(g) => g.index() < module.globals.len(),
                    Operand::Const(_) => {
                        return Err(CompileError::malformed(
                            "constant expression survived global fixup",
                            at(index),
                        ))
                    }
                    Operand::Int(_) | Operand::Null | Operand::Undef => true,
                };
                if !valid {
                    return Err(CompileError::malformed(format!("invalid operand {op:?}"), at(index)));
                }
            }
            for succ in inst.successors() {
                if succ.index() >= function.blocks.len() {
                    return Err(CompileError::malformed(
                        format!("branch to missing block {}", succ.0),
                        at(index),
                    ));
                }
            }

            match &inst.kind {
                InstKind::Cast {
                    op: CastOp::IntToPtr,
                    value: Operand::Int(literal),
                    ..
                } if options.is_process_address(*literal as u64) => match options.unresolved {
                    UnresolvedPolicy::Fail => {
                        return Err(CompileError::RelocationResolutionFailure {
                            address: *literal as u64,
                            location: at(index),
                        })
                    }
                    UnresolvedPolicy::Warn => {
                        log::warn!("{}: raw address {:#x} kept in generated code", at(index), *literal as u64);
                    }
                },
                InstKind::Call { args, .. } => {
                    if let Some(callee) = inst.direct_callee() {
                        let expected = module.func(callee).params.len();
                        if args.len() != expected {
                            return Err(CompileError::malformed(
                                format!(
                                    "call to @{} passes {} arguments, expected {expected}",
                                    module.func(callee).name,
                                    args.len()
                                ),
                                at(index),
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::CompileOptions;
    use crate::ir::parse_module;
    use bumpalo::Bump;

    #[test]
    fn raw_process_address_fails_by_default() {
        let module = parse_module(
            r#"
define @f() -> ptr {
entry:
    %p = inttoptr i64 0x7f0000100000 to ptr
    ret %p
}
"#,
        )
        .unwrap();

        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let err = verify_module(&module, &ctx).unwrap_err();
        match err {
            CompileError::RelocationResolutionFailure { address, location } => {
                assert_eq!(address, 0x7f0000100000);
                assert_eq!(location.inst, Some(0));
            }
            other => panic!("unexpected error {other}"),
        }

        let options = CompileOptions {
            unresolved: UnresolvedPolicy::Warn,
            ..CompileOptions::default()
        };
        let ctx = CompilationContext::with_options(&arena, options);
        verify_module(&module, &ctx).unwrap();
    }

    #[test]
    fn small_literals_are_plain_integers() {
        let module = parse_module(
            "define @f() -> ptr {\nentry:\n    %p = inttoptr i64 16 to ptr\n    ret %p\n}\n",
        )
        .unwrap();
        let arena = Bump::new();
        verify_module(&module, &CompilationContext::new(&arena)).unwrap();
    }

    #[test]
    fn negative_sentinels_are_plain_integers() {
        let module = parse_module(
            "define @f() -> ptr {\nentry:\n    %p = inttoptr i64 -1 to ptr\n    ret %p\n}\n",
        )
        .unwrap();
        let arena = Bump::new();
        verify_module(&module, &CompilationContext::new(&arena)).unwrap();
    }

    #[test]
    fn leftover_constant_and_bad_arity_are_rejected() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let module = parse_module(
            "define @f() -> ptr {\nentry:\n    ret bitcast(null)\n}\n",
        )
        .unwrap();
        assert!(matches!(
            verify_module(&module, &ctx),
            Err(CompileError::MalformedIr { .. })
        ));

        let module = parse_module(
            r#"
declare @g(i64, i64) -> void
define @f() -> void {
entry:
    call void @g(i64 1)
    ret
}
"#,
        )
        .unwrap();
        let err = verify_module(&module, &ctx).unwrap_err();
        assert!(err.to_string().contains("expected 2"));
    }

    #[test]
    fn missing_terminator_is_reported() {
        let mut module = parse_module("define @f() -> void {\nentry:\n    ret\n}\n").unwrap();
        module.functions[0].blocks[0].insts.clear();
        let arena = Bump::new();
        let err = verify_module(&module, &CompilationContext::new(&arena)).unwrap_err();
        assert!(err.to_string().contains("empty block"));
    }
}
