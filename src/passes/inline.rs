//! Inlining of small direct callees.
//!
//! A call site is inlined when the callee is defined in the module, is not
//! marked `noinline`, is not the caller itself, returns from exactly one
//! place and has at most `threshold` placed instructions. The caller's block
//! is split after the call; the callee's blocks are copied in between and its
//! `ret` becomes a jump to the continuation.

use super::ModulePass;
use crate::core::error::CompileResult;
use crate::core::session::CompilationContext;
use crate::ir::{BlockId, FuncId, Function, Inst, InstId, InstKind, Module, Operand, Type};

/// Upper bound on call sites inlined into one function per run, so mutually
/// recursive helpers cannot grow a caller without limit.
const MAX_INLINES_PER_FUNCTION: usize = 32;

pub struct Inliner {
    threshold: usize,
}

impl Inliner {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    fn is_candidate(&self, module: &Module, caller: FuncId, callee: FuncId) -> bool {
        if caller == callee {
            return false;
        }
        let function = module.func(callee);
        if function.is_declaration() || function.attrs.noinline {
            return false;
        }
        let mut size = 0;
        let mut returns = 0;
        for (_, id) in function.placed_insts() {
            size += 1;
            if matches!(function.inst(id).kind, InstKind::Ret { .. }) {
                returns += 1;
            }
        }
        returns == 1 && size <= self.threshold
    }

    /// First inlinable call site of `caller`: (block, position, call, callee).
    fn next_site(&self, module: &Module, caller: FuncId) -> Option<(usize, usize, InstId, FuncId)> {
        let function = module.func(caller);
        for (b, block) in function.blocks.iter().enumerate() {
            for (pos, &id) in block.insts.iter().enumerate() {
                let Some(callee) = function.inst(id).direct_callee() else {
                    continue;
                };
                let InstKind::Call { args, .. } = &function.inst(id).kind else {
                    continue;
                };
                if args.len() == module.func(callee).params.len()
                    && self.is_candidate(module, caller, callee)
                {
                    return Some((b, pos, id, callee));
                }
            }
        }
        None
    }
}

impl ModulePass for Inliner {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn run(&self, module: &mut Module, ctx: &CompilationContext<'_>) -> CompileResult<bool> {
        let mut inlined = 0;
        for f in 0..module.functions.len() {
            let caller = FuncId::new(f);
            if module.func(caller).is_declaration() {
                continue;
            }
            let mut count = 0;
            while count < MAX_INLINES_PER_FUNCTION {
                let Some((block, pos, call, callee)) = self.next_site(module, caller) else {
                    break;
                };
                let body = module.func(callee).clone();
                log::debug!("inline: @{} into @{}", body.name, module.func(caller).name);
                inline_call(module.func_mut(caller), block, pos, call, &body);
                count += 1;
            }
            inlined += count;
        }
        ctx.with_stats(|stats| stats.functions_inlined += inlined);
        Ok(inlined > 0)
    }
}

fn inline_call(caller: &mut Function, block: usize, pos: usize, call: InstId, callee: &Function) {
    let args: Vec<Operand> = match &caller.inst(call).kind {
        InstKind::Call { args, .. } => args.iter().map(|&(_, arg)| arg).collect(),
        _ => return,
    };

    let site = caller.blocks[block].name.clone();
    let tail = caller.blocks[block].insts.split_off(pos + 1);
    caller.blocks[block].insts.pop();
    let cont = caller.add_block(format!("{site}.{}.cont", callee.name));
    caller.blocks[cont.index()].insts = tail;

    let block_map: Vec<BlockId> = callee
        .blocks
        .iter()
        .map(|b| caller.add_block(format!("{}.{}", callee.name, b.name)))
        .collect();

    let base = caller.insts.len();
    let map_operand = |op: Operand| match op {
        Operand::Value(id) => Operand::Value(InstId::new(base + id.index())),
        Operand::Arg(idx) => args.get(idx as usize).copied().unwrap_or(Operand::Undef),
        other => other,
    };

    // Instructions dropped from the callee's blocks stay in its arena and are
    // copied only to keep ids aligned; the result comes from the placed `ret`.
    let mut placed = vec![false; callee.insts.len()];
    for (_, id) in callee.placed_insts() {
        placed[id.index()] = true;
    }
    let mut result = None;
    for (index, inst) in callee.insts.iter().enumerate() {
        let mut copy: Inst = inst.clone();
        for op in copy.operands_mut() {
            *op = map_operand(*op);
        }
        if placed[index] {
            for succ in copy.successors_mut() {
                *succ = block_map[succ.index()];
            }
            if let InstKind::Ret { value } = copy.kind {
                result = value;
                copy = Inst::new(Type::Void, InstKind::Br { target: cont }).with_loc(copy.loc);
            }
        }
        caller.push_inst(copy);
    }

    for (k, b) in callee.blocks.iter().enumerate() {
        caller.blocks[block_map[k].index()].insts = b
            .insts
            .iter()
            .map(|id| InstId::new(base + id.index()))
            .collect();
    }

    let jump = caller.push_inst(Inst::new(
        Type::Void,
        InstKind::Br {
            target: block_map[0],
        },
    ));
    caller.blocks[block].insts.push(jump);
    caller.replace_all_uses(call, result.unwrap_or(Operand::Undef));
}
