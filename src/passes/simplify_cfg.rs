//! Control-flow graph cleanup.
//!
//! Folds branches whose outcome is known, threads jumps through empty
//! forwarding blocks, merges straight-line block pairs and drops blocks that
//! are no longer reachable from the entry. The IR has no phi nodes, so none
//! of these rewrites has to patch incoming values.

use super::ModulePass;
use crate::core::error::CompileResult;
use crate::core::session::CompilationContext;
use crate::ir::{BlockId, Function, InstKind, Module, Operand};

pub struct SimplifyCfg;

impl ModulePass for SimplifyCfg {
    fn name(&self) -> &'static str {
        "simplify-cfg"
    }

    fn run(&self, module: &mut Module, _ctx: &CompilationContext<'_>) -> CompileResult<bool> {
        let mut changed = false;
        for function in module.functions.iter_mut().filter(|f| !f.is_declaration()) {
            let mut local = fold_branches(function);
            local |= thread_forwarding_blocks(function);
            while merge_one_pair(function) {
                local = true;
            }
            local |= remove_unreachable(function);
            if local {
                log::trace!("simplify-cfg: @{} now has {} blocks", function.name, function.blocks.len());
            }
            changed |= local;
        }
        Ok(changed)
    }
}

/// `condbr` on a literal or with identical targets becomes `br`.
fn fold_branches(function: &mut Function) -> bool {
    let mut changed = false;
    for b in 0..function.blocks.len() {
        let Some(&term) = function.blocks[b].insts.last() else {
            continue;
        };
        let inst = function.inst_mut(term);
        let target = match inst.kind {
            InstKind::CondBr {
                cond: Operand::Int(value),
                then_block,
                else_block,
            } => Some(if value & 1 != 0 { then_block } else { else_block }),
            InstKind::CondBr {
                then_block,
                else_block,
                ..
            } if then_block == else_block => Some(then_block),
            _ => None,
        };
        if let Some(target) = target {
            inst.kind = InstKind::Br { target };
            changed = true;
        }
    }
    changed
}

/// Redirect edges into blocks that contain nothing but `br`.
fn thread_forwarding_blocks(function: &mut Function) -> bool {
    let forward: Vec<Option<BlockId>> = (0..function.blocks.len())
        .map(|b| {
            let block = &function.blocks[b];
            match block.insts.as_slice() {
                [only] if b != 0 => match function.inst(*only).kind {
                    InstKind::Br { target } if target.index() != b => Some(target),
                    _ => None,
                },
                _ => None,
            }
        })
        .collect();

    // Follow chains of forwarders, stopping on cycles.
    let resolve = |mut block: BlockId| {
        let mut steps = 0;
        while let Some(next) = forward[block.index()] {
            block = next;
            steps += 1;
            if steps > forward.len() {
                break;
            }
        }
        block
    };

    let mut changed = false;
    for b in 0..function.blocks.len() {
        if forward[b].is_some() {
            continue;
        }
        let Some(&term) = function.blocks[b].insts.last() else {
            continue;
        };
        for succ in function.inst_mut(term).successors_mut() {
            let target = resolve(*succ);
            if target != *succ {
                *succ = target;
                changed = true;
            }
        }
    }
    changed
}

/// Append a block to its unique predecessor when that predecessor jumps
/// straight to it.
fn merge_one_pair(function: &mut Function) -> bool {
    let preds = function.predecessors();
    for b in 0..function.blocks.len() {
        let Some(&term) = function.blocks[b].insts.last() else {
            continue;
        };
        let InstKind::Br { target } = function.inst(term).kind else {
            continue;
        };
        let t = target.index();
        if t == b || t == 0 || preds[t].as_slice() != [BlockId::new(b)] {
            continue;
        }
        let moved = std::mem::take(&mut function.blocks[t].insts);
        let block = &mut function.blocks[b];
        block.insts.pop();
        block.insts.extend(moved);
        return true;
    }
    false
}

fn remove_unreachable(function: &mut Function) -> bool {
    let mut reachable = vec![false; function.blocks.len()];
    let mut stack = vec![BlockId::new(0)];
    while let Some(block) = stack.pop() {
        if std::mem::replace(&mut reachable[block.index()], true) {
            continue;
        }
        stack.extend(function.successors(block));
    }
    if reachable.iter().all(|&r| r) {
        return false;
    }
    function.retain_blocks(&reachable);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;
    use bumpalo::Bump;

    fn simplify(text: &str) -> Module {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let mut module = parse_module(text).unwrap();
        while SimplifyCfg.run(&mut module, &ctx).unwrap() {}
        module
    }

    #[test]
    fn constant_branch_collapses_to_one_block() {
        let module = simplify(
            r#"
define @f(i64 %x) -> i64 {
entry:
    condbr true, ^yes, ^no
yes:
    %a = add i64 %x, 1
    br ^done
no:
    %b = add i64 %x, 2
    br ^done
done:
    ret %a
}
"#,
        );
        let f = &module.functions[0];
        assert_eq!(f.blocks.len(), 1);
        let ops: Vec<_> = f.blocks[0].insts.iter().map(|&i| f.inst(i).opcode()).collect();
        assert_eq!(ops, vec!["add", "ret"]);
    }

    #[test]
    fn forwarding_blocks_are_threaded() {
        let module = simplify(
            r#"
define @f(i1 %c) -> void {
entry:
    condbr %c, ^hop, ^exit
hop:
    br ^exit2
exit2:
    br ^exit
exit:
    ret
}
"#,
        );
        let f = &module.functions[0];
        // hop and exit2 forward to exit; the condbr then has identical
        // targets and everything folds into one block.
        assert_eq!(f.blocks.len(), 1);
        assert_eq!(f.terminator(BlockId(0)).map(|i| i.opcode()), Some("ret"));
    }

    #[test]
    fn loops_survive() {
        let module = simplify(
            r#"
define @count(i64 %n) -> i64 {
entry:
    br ^head
head:
    %i = add i64 %i, 1
    %c = icmp slt i64 %i, %n
    condbr %c, ^head, ^exit
exit:
    ret %i
}
"#,
        );
        let f = &module.functions[0];
        assert_eq!(f.blocks.len(), 3);
        assert_eq!(f.successors(BlockId(1)), vec![BlockId(1), BlockId(2)]);
    }
}
