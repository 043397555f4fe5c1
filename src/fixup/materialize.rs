//! Materialization of constant-expression chains into instructions.
//!
//! Every constant operand is lowered at its point of use. The walk uses an
//! explicit worklist keyed by [`ConstId`] so arbitrarily deep chains never
//! recurse: a node is lowered once all of its constant operands have been.

use hashbrown::HashMap;

use crate::core::error::{CompileError, CompileResult, Location};
use crate::ir::{
    CastOp, ConstId, ConstOp, FuncId, Function, GlobalId, Inst, InstId, InstKind, Module,
    Operand, SourceLoc, Type,
};

/// What a literal address turned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiteralUse {
    /// Leave `inttoptr <literal>` in place.
    Keep,
    /// Use this operand directly (external function or global).
    Operand(Operand),
    /// Load the object pointer from this slot.
    LoadFrom(GlobalId),
}

/// Decides what a literal address at or above the embedding threshold
/// becomes. May add declarations and globals to the module.
pub trait LiteralResolver {
    fn resolve_literal(
        &mut self,
        module: &mut Module,
        address: u64,
        location: &Location,
    ) -> CompileResult<LiteralUse>;
}

/// Lower every constant operand of `func`. Returns the number of
/// instructions inserted.
pub fn materialize_function<R: LiteralResolver>(
    module: &mut Module,
    func: FuncId,
    resolver: &mut R,
) -> CompileResult<usize> {
    // The function is taken out while its body is rewritten so the resolver
    // can add declarations to the module.
    let placeholder = Function::new(String::new(), Vec::new(), Type::Void);
    let mut function = std::mem::replace(module.func_mut(func), placeholder);
    let result = materialize_body(module, &mut function, resolver);
    *module.func_mut(func) = function;
    result
}

/// Source location stamped on instructions inserted in front of one user.
struct Pending {
    loc: Option<SourceLoc>,
}

impl Pending {
    fn new(loc: Option<SourceLoc>) -> Self {
        Self { loc }
    }

    /// Add `inst` to the arena; the caller places every instruction created
    /// for a user in one batch.
    fn push(&mut self, function: &mut Function, inst: Inst) -> Operand {
        Operand::Value(function.push_inst(inst.with_loc(self.loc.clone())))
    }
}

fn materialize_body<R: LiteralResolver>(
    module: &mut Module,
    function: &mut Function,
    resolver: &mut R,
) -> CompileResult<usize> {
    let mut inserted = 0;

    for b in 0..function.blocks.len() {
        let mut pos = 0;
        while pos < function.blocks[b].insts.len() {
            let id = function.blocks[b].insts[pos];
            let location = Location::at(
                function.name.clone(),
                function.blocks[b].name.clone(),
                pos,
                function.inst(id).loc.clone(),
            );
            let arena_before = function.insts.len();
            let mut pending = Pending::new(function.inst(id).loc.clone());
            let mut dropped = false;

            if let InstKind::Cast {
                op: CastOp::IntToPtr,
                value: Operand::Int(value),
                ..
            } = function.inst(id).kind
            {
                let ty = function.inst(id).ty;
                match resolver.resolve_literal(module, value as u64, &location)? {
                    LiteralUse::Keep => {}
                    other => {
                        let replacement = realize(function, &mut pending, other, ty);
                        function.replace_all_uses(id, replacement);
                        dropped = true;
                    }
                }
            }

            if !dropped {
                let mut memo: HashMap<ConstId, Operand> = HashMap::new();
                let operands = function.inst(id).operands();
                for (index, operand) in operands.into_iter().enumerate() {
                    let Operand::Const(top) = operand else { continue };
                    let lowered = lower_chain(
                        module,
                        function,
                        resolver,
                        &mut pending,
                        &mut memo,
                        top,
                        &location,
                    )?;
                    if let Some(slot) = function.inst_mut(id).operands_mut().into_iter().nth(index) {
                        *slot = lowered;
                    }
                }
            }

            let new_ids: Vec<_> = (arena_before..function.insts.len())
                .map(InstId::new)
                .collect();
            let count = new_ids.len();
            let block = &mut function.blocks[b].insts;
            if dropped {
                block.splice(pos..pos + 1, new_ids);
                pos += count;
            } else {
                block.splice(pos..pos, new_ids);
                pos += count + 1;
            }
            inserted += count;
        }
    }

    Ok(inserted)
}

/// Turn a resolved literal into an operand, emitting the slot load if needed.
fn realize(function: &mut Function, pending: &mut Pending, resolved: LiteralUse, ty: Type) -> Operand {
    match resolved {
        LiteralUse::Operand(op) => op,
        LiteralUse::LoadFrom(slot) => pending.push(
            function,
            Inst::new(ty, InstKind::Load {
                ptr: Operand::Global(slot),
            }),
        ),
        LiteralUse::Keep => unreachable!("kept literals are not realized"),
    }
}

/// Post-order lowering of the chain rooted at `top`.
fn lower_chain<R: LiteralResolver>(
    module: &mut Module,
    function: &mut Function,
    resolver: &mut R,
    pending: &mut Pending,
    memo: &mut HashMap<ConstId, Operand>,
    top: ConstId,
    location: &Location,
) -> CompileResult<Operand> {
    let mut worklist = vec![(top, false)];

    while let Some((id, expanded)) = worklist.pop() {
        if memo.contains_key(&id) {
            continue;
        }
        let expr = module.consts.get(id).clone();

        if !expanded {
            worklist.push((id, true));
            for operand in expr.operands.iter().rev() {
                if let Operand::Const(child) = operand {
                    if !memo.contains_key(child) {
                        worklist.push((*child, false));
                    }
                }
            }
            continue;
        }

        let operands: Vec<Operand> = expr
            .operands
            .iter()
            .map(|op| match op {
                Operand::Const(child) => memo[child],
                other => *other,
            })
            .collect();
        let ty = expr.op.result_type();

        let lowered = match (&expr.op, operands.as_slice()) {
            (ConstOp::IntToPtr, [Operand::Int(value)]) => {
                match resolver.resolve_literal(module, *value as u64, location)? {
                    LiteralUse::Keep => pending.push(
                        function,
                        Inst::new(ty, InstKind::Cast {
                            op: CastOp::IntToPtr,
                            from: Type::I64,
                            value: Operand::Int(*value),
                        }),
                    ),
                    resolved => realize(function, pending, resolved, ty),
                }
            }
            (ConstOp::IntToPtr, [value]) => {
                cast(function, pending, CastOp::IntToPtr, Type::I64, *value, ty)
            }
            (ConstOp::PtrToInt, [value]) => {
                cast(function, pending, CastOp::PtrToInt, Type::PTR, *value, ty)
            }
            (ConstOp::BitCast, [value]) => {
                cast(function, pending, CastOp::BitCast, Type::PTR, *value, ty)
            }
            (ConstOp::AddrSpaceCast(_), [value]) => {
                cast(function, pending, CastOp::AddrSpaceCast, Type::PTR, *value, ty)
            }
            (ConstOp::Gep, [base, offset]) => pending.push(
                function,
                Inst::new(ty, InstKind::Gep {
                    base: *base,
                    offset: *offset,
                }),
            ),
            (ConstOp::Other(name), _) => {
                return Err(CompileError::unsupported(
                    format!("unknown constant-expression opcode '{name}'"),
                    location.clone(),
                ))
            }
            (op, _) => {
                return Err(CompileError::malformed(
                    format!("constant {} with {} operands", op.name(), operands.len()),
                    location.clone(),
                ))
            }
        };
        memo.insert(id, lowered);
    }

    memo.get(&top).copied().ok_or_else(|| {
        CompileError::malformed("constant chain did not lower", location.clone())
    })
}

fn cast(
    function: &mut Function,
    pending: &mut Pending,
    op: CastOp,
    from: Type,
    value: Operand,
    to: Type,
) -> Operand {
    pending.push(function, Inst::new(to, InstKind::Cast { op, from, value }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{parse_module, ConstExpr, Global};

    /// Resolves a fixed address to a slot and keeps everything else.
    struct OneSlot {
        address: u64,
        slot: Option<GlobalId>,
        calls: usize,
    }

    impl LiteralResolver for OneSlot {
        fn resolve_literal(
            &mut self,
            module: &mut Module,
            address: u64,
            _location: &Location,
        ) -> CompileResult<LiteralUse> {
            self.calls += 1;
            if address != self.address {
                return Ok(LiteralUse::Keep);
            }
            let slot = *self
                .slot
                .get_or_insert_with(|| module.add_global(Global::zeroed("slot0", 8)));
            Ok(LiteralUse::LoadFrom(slot))
        }
    }

    fn opcodes(module: &Module, func: FuncId) -> Vec<&'static str> {
        let f = module.func(func);
        f.placed_insts().map(|(_, id)| f.inst(id).opcode()).collect()
    }

    #[test]
    fn chains_become_instructions_before_their_user() {
        let mut module = parse_module(
            r#"
define @f() -> ptr {
entry:
    %x = load ptr, gep(bitcast(inttoptr(0x7f0000100000)), 8)
    ret %x
}
"#,
        )
        .unwrap();
        let mut resolver = OneSlot {
            address: 0x7f0000100000,
            slot: None,
            calls: 0,
        };
        let inserted = materialize_function(&mut module, FuncId(0), &mut resolver).unwrap();
        assert_eq!(inserted, 3);
        assert_eq!(opcodes(&module, FuncId(0)), vec!["load", "bitcast", "gep", "load", "ret"]);

        let f = module.func(FuncId(0));
        let first = f.blocks[0].insts[0];
        assert_eq!(
            f.inst(first).kind,
            InstKind::Load {
                ptr: Operand::Global(GlobalId(0))
            }
        );
        assert!(f.placed_insts().all(|(_, id)| f
            .inst(id)
            .operands()
            .iter()
            .all(|op| op.as_const().is_none())));
    }

    #[test]
    fn very_deep_chains_are_lowered_without_recursion() {
        let mut module = parse_module(
            r#"
define @f() -> ptr {
entry:
    %x = load ptr, null
    ret %x
}
"#,
        )
        .unwrap();
        let depth = 100_000;
        let mut top = module.intern_const(ConstExpr::new(
            ConstOp::IntToPtr,
            vec![Operand::Int(0x7f0000100000)],
        ));
        for _ in 0..depth {
            top = module.intern_const(ConstExpr::new(ConstOp::BitCast, vec![Operand::Const(top)]));
        }
        let user = module.func(FuncId(0)).blocks[0].insts[0];
        module.func_mut(FuncId(0)).inst_mut(user).kind = InstKind::Load {
            ptr: Operand::Const(top),
        };

        let mut resolver = OneSlot {
            address: 0x7f0000100000,
            slot: None,
            calls: 0,
        };
        let inserted = materialize_function(&mut module, FuncId(0), &mut resolver).unwrap();
        assert_eq!(resolver.calls, 1);
        assert_eq!(inserted, depth + 1);

        let f = module.func(FuncId(0));
        assert_eq!(f.blocks[0].insts.len(), depth + 3);
        let first = f.blocks[0].insts[0];
        assert_eq!(
            f.inst(first).kind,
            InstKind::Load {
                ptr: Operand::Global(GlobalId(0))
            }
        );
        assert!(f.placed_insts().all(|(_, id)| f
            .inst(id)
            .operands()
            .iter()
            .all(|op| op.as_const().is_none())));
    }

    #[test]
    fn shared_subchains_lower_once_per_user() {
        let mut module = parse_module(
            r#"
define @f() -> void {
entry:
    store ptr inttoptr(0x7f0000100000), inttoptr(0x7f0000100000)
    ret
}
"#,
        )
        .unwrap();
        let mut resolver = OneSlot {
            address: 0x7f0000100000,
            slot: None,
            calls: 0,
        };
        materialize_function(&mut module, FuncId(0), &mut resolver).unwrap();
        assert_eq!(resolver.calls, 1);
        assert_eq!(opcodes(&module, FuncId(0)), vec!["load", "store", "ret"]);
    }

    #[test]
    fn literal_casts_are_rewritten_and_dropped() {
        let mut module = parse_module(
            r#"
define @f() -> ptr {
entry:
    %p = inttoptr i64 0x7f0000100000 to ptr
    %small = inttoptr i64 16 to ptr
    ret %p
}
"#,
        )
        .unwrap();
        let mut resolver = OneSlot {
            address: 0x7f0000100000,
            slot: None,
            calls: 0,
        };
        materialize_function(&mut module, FuncId(0), &mut resolver).unwrap();
        assert_eq!(opcodes(&module, FuncId(0)), vec!["load", "inttoptr", "ret"]);
        let f = module.func(FuncId(0));
        let load = f.blocks[0].insts[0];
        let ret = *f.blocks[0].insts.last().unwrap();
        assert_eq!(
            f.inst(ret).kind,
            InstKind::Ret {
                value: Some(Operand::Value(load))
            }
        );
    }

    #[test]
    fn unknown_opcodes_are_rejected_with_their_location() {
        let mut module = parse_module(
            r#"
define @f() -> i64 {
entry:
    %v = add i64 1, 2
    %x = add i64 %v, frobnicate(inttoptr(0x7f0000100000))
    ret %x
}
"#,
        )
        .unwrap();
        let mut resolver = OneSlot {
            address: 0,
            slot: None,
            calls: 0,
        };
        let err = materialize_function(&mut module, FuncId(0), &mut resolver).unwrap_err();
        match err {
            CompileError::UnsupportedConstruct { what, location } => {
                assert!(what.contains("frobnicate"));
                assert_eq!(location.inst, Some(1));
            }
            other => panic!("unexpected {other}"),
        }
        // The function is put back even on failure.
        assert_eq!(module.func(FuncId(0)).name, "f");
    }
}
