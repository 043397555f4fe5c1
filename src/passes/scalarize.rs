//! Stack-slot scalarization.
//!
//! An `alloca` whose address never escapes and whose loads and stores all sit
//! in one block is replaced by the stored values themselves. Accesses go
//! through the slot directly or through `gep` with a literal offset. Every
//! load must be preceded by a store of the same type at the same offset;
//! anything else leaves the slot in memory.

use hashbrown::HashMap;

use super::ModulePass;
use crate::core::error::CompileResult;
use crate::core::session::CompilationContext;
use crate::ir::{BlockId, Function, InstId, InstKind, Module, Operand, Type};

pub struct Scalarize;

impl ModulePass for Scalarize {
    fn name(&self) -> &'static str {
        "scalarize"
    }

    fn run(&self, module: &mut Module, ctx: &CompilationContext<'_>) -> CompileResult<bool> {
        let mut removed = 0;
        for function in module.functions.iter_mut().filter(|f| !f.is_declaration()) {
            let allocas: Vec<InstId> = function
                .placed_insts()
                .filter(|&(_, id)| matches!(function.inst(id).kind, InstKind::Alloca { .. }))
                .map(|(_, id)| id)
                .collect();
            for alloca in allocas {
                if let Some(count) = scalarize_slot(function, alloca) {
                    log::trace!("scalarize: @{} %{}", function.name, function.value_name(alloca));
                    removed += count;
                }
            }
        }
        ctx.with_stats(|stats| stats.instructions_removed += removed);
        Ok(removed > 0)
    }
}

enum Access {
    Load { offset: i64 },
    Store { offset: i64, ty: Type, value: Operand },
    Address,
}

/// Replace one slot. Returns the number of instructions removed, or `None`
/// when the slot has to stay in memory.
fn scalarize_slot(function: &mut Function, alloca: InstId) -> Option<usize> {
    let slot = Operand::Value(alloca);

    // Derived addresses: gep slot, <literal>.
    let mut offsets: HashMap<InstId, i64> = HashMap::new();
    offsets.insert(alloca, 0);
    for (_, id) in function.placed_insts() {
        let inst = function.inst(id);
        if let InstKind::Gep { base, offset } = inst.kind {
            if base == slot {
                let Operand::Int(offset) = offset else {
                    return None;
                };
                offsets.insert(id, offset);
            }
        }
    }

    let mut block: Option<BlockId> = None;
    let mut accesses: Vec<(InstId, Access)> = Vec::new();
    for (b, id) in function.placed_insts() {
        let inst = function.inst(id);
        let pointer_of = |op: Operand| op.as_value().and_then(|v| offsets.get(&v).copied());
        let access = match inst.kind {
            InstKind::Load { ptr } => pointer_of(ptr).map(|offset| Access::Load { offset }),
            InstKind::Store { ty, value, ptr } => {
                if pointer_of(value).is_some() {
                    return None;
                }
                pointer_of(ptr).map(|offset| Access::Store { offset, ty, value })
            }
            InstKind::Gep { base, .. } if base == slot => Some(Access::Address),
            _ => {
                if inst.operands().into_iter().any(|op| pointer_of(op).is_some()) {
                    return None;
                }
                None
            }
        };
        let Some(access) = access else {
            continue;
        };
        if !matches!(access, Access::Address) {
            match block {
                Some(existing) if existing != b => return None,
                _ => block = Some(b),
            }
        }
        accesses.push((id, access));
    }

    // Forward stores to loads in block order. A stored value may itself be an
    // earlier forwarded load, so it is resolved before it goes live.
    let mut live: Vec<(i64, Type, Operand)> = Vec::new();
    let mut forwarded: Vec<(InstId, Operand)> = Vec::new();
    let mut replacement: HashMap<InstId, Operand> = HashMap::new();
    for (id, access) in &accesses {
        match *access {
            Access::Store { offset, ty, value } => {
                let value = value
                    .as_value()
                    .and_then(|v| replacement.get(&v).copied())
                    .unwrap_or(value);
                let size = i64::from(ty.store_size());
                live.retain(|&(o, t, _)| {
                    o == offset || o + i64::from(t.store_size()) <= offset || offset + size <= o
                });
                match live.iter_mut().find(|(o, _, _)| *o == offset) {
                    Some(entry) => *entry = (offset, ty, value),
                    None => live.push((offset, ty, value)),
                }
            }
            Access::Load { offset } => {
                let ty = function.inst(*id).ty;
                let &(_, stored, value) = live.iter().find(|(o, _, _)| *o == offset)?;
                if stored != ty {
                    return None;
                }
                replacement.insert(*id, value);
                forwarded.push((*id, value));
            }
            Access::Address => {}
        }
    }

    for (load, value) in &forwarded {
        function.replace_all_uses(*load, *value);
    }
    let mut removed = 1;
    for (id, _) in &accesses {
        function.unplace(*id);
        removed += 1;
    }
    function.unplace(alloca);
    Some(removed)
}
