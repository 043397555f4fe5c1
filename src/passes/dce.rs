//! Dead-code elimination.
//!
//! Instruction level: results nobody reads are deleted when computing them has
//! no effect (pure operations, loads, stack slots). Module level: functions and
//! globals not reachable from an externally visible definition are dropped,
//! which also removes declarations whose last call was inlined or lowered.

use super::ModulePass;
use crate::core::error::CompileResult;
use crate::core::session::CompilationContext;
use crate::ir::{Function, GlobalKind, InstKind, Linkage, Module, Operand};

pub struct DeadCodeElimination;

impl ModulePass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dce"
    }

    fn run(&self, module: &mut Module, ctx: &CompilationContext<'_>) -> CompileResult<bool> {
        let mut removed = 0;
        for function in module.functions.iter_mut().filter(|f| !f.is_declaration()) {
            removed += remove_dead_insts(function);
        }
        ctx.with_stats(|stats| stats.instructions_removed += removed);

        let dropped = remove_unreachable_symbols(module);
        if removed + dropped > 0 {
            log::debug!("dce: {removed} instructions, {dropped} symbols removed");
        }
        Ok(removed + dropped > 0)
    }
}

fn is_removable(kind: &InstKind) -> bool {
    matches!(
        kind,
        InstKind::Binary { .. }
            | InstKind::ICmp { .. }
            | InstKind::Gep { .. }
            | InstKind::Cast { .. }
            | InstKind::Load { .. }
            | InstKind::Alloca { .. }
    )
}

fn remove_dead_insts(function: &mut Function) -> usize {
    let mut removed = 0;
    loop {
        let uses = function.use_counts();
        let dead: Vec<_> = function
            .placed_insts()
            .map(|(_, id)| id)
            .filter(|&id| uses[id.index()] == 0 && is_removable(&function.inst(id).kind))
            .collect();
        if dead.is_empty() {
            return removed;
        }
        for block in &mut function.blocks {
            block.insts.retain(|id| !dead.contains(id));
        }
        removed += dead.len();
    }
}

/// Drop functions and globals unreachable from external definitions.
/// Returns how many were dropped.
pub fn remove_unreachable_symbols(module: &mut Module) -> usize {
    let mut live_funcs = vec![false; module.functions.len()];
    let mut live_globals = vec![false; module.globals.len()];
    let mut live_consts = vec![false; module.consts.len()];
    let mut work: Vec<Operand> = Vec::new();

    for (idx, function) in module.functions.iter().enumerate() {
        if function.linkage == Linkage::External && !function.is_declaration() {
            work.push(Operand::Func(idx.into()));
        }
    }
    for (idx, global) in module.globals.iter().enumerate() {
        if global.linkage == Linkage::External && !global.is_extern() {
            work.push(Operand::Global(idx.into()));
        }
    }

    while let Some(op) = work.pop() {
        match op {
            Operand::Func(f) => {
                if std::mem::replace(&mut live_funcs[f.index()], true) {
                    continue;
                }
                let function = module.func(f);
                for (_, id) in function.placed_insts() {
                    work.extend(function.inst(id).operands());
                }
            }
            Operand::Global(g) => {
                if std::mem::replace(&mut live_globals[g.index()], true) {
                    continue;
                }
                if let GlobalKind::Data { relocs, .. } = &module.global(g).kind {
                    work.extend(relocs.iter().map(|r| r.target));
                }
            }
            Operand::Const(c) => {
                if std::mem::replace(&mut live_consts[c.index()], true) {
                    continue;
                }
                work.extend(module.consts.get(c).operands.iter().copied());
            }
            _ => {}
        }
    }

    let dropped = live_funcs.iter().filter(|l| !**l).count() + live_globals.iter().filter(|l| !**l).count();
    if dropped > 0 {
        for (function, _) in module.functions.iter().zip(&live_funcs).filter(|(_, l)| !**l) {
            log::trace!("dce: dropping @{}", function.name);
        }
        module.retain(&live_funcs, &live_globals);
    }
    dropped
}
