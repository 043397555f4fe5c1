//! Loop-invariant code motion.
//!
//! Natural loops are found from back edges (an edge whose target dominates
//! its source). Pure instructions inside a loop whose operands are all
//! defined outside of it are moved to the loop's preheader, the unique
//! outside predecessor of the header that ends in an unconditional branch.
//! Loops without such a preheader are left alone.

use std::collections::BTreeSet;

use super::ModulePass;
use crate::core::error::CompileResult;
use crate::core::session::CompilationContext;
use crate::ir::{BlockId, Function, InstId, Module, Operand};

pub struct LoopInvariantMotion;

impl ModulePass for LoopInvariantMotion {
    fn name(&self) -> &'static str {
        "licm"
    }

    fn run(&self, module: &mut Module, ctx: &CompilationContext<'_>) -> CompileResult<bool> {
        let mut hoisted = 0;
        for function in module.functions.iter_mut().filter(|f| !f.is_declaration()) {
            let doms = dominators(function);
            for (header, body) in natural_loops(function, &doms) {
                let Some(preheader) = preheader(function, header, &body) else {
                    log::trace!("licm: @{} ^{} has no preheader", function.name, function.block(header).name);
                    continue;
                };
                hoisted += hoist(function, &body, preheader);
            }
        }
        ctx.with_stats(|stats| stats.instructions_hoisted += hoisted);
        if hoisted > 0 {
            log::debug!("licm: {hoisted} instructions hoisted");
        }
        Ok(hoisted > 0)
    }
}

/// Dominator sets per block; unreachable blocks dominate nothing and are
/// dominated by everything.
pub fn dominators(function: &Function) -> Vec<BTreeSet<usize>> {
    let n = function.blocks.len();
    let preds = function.predecessors();
    let all: BTreeSet<usize> = (0..n).collect();
    let mut doms = vec![all; n];
    if n == 0 {
        return doms;
    }
    doms[0] = BTreeSet::from([0]);

    let mut changed = true;
    while changed {
        changed = false;
        for b in 1..n {
            let mut next: Option<BTreeSet<usize>> = None;
            for p in &preds[b] {
                let pd = &doms[p.index()];
                next = Some(match next {
                    None => pd.clone(),
                    Some(acc) => acc.intersection(pd).copied().collect(),
                });
            }
            let mut next = next.unwrap_or_default();
            next.insert(b);
            if next != doms[b] {
                doms[b] = next;
                changed = true;
            }
        }
    }
    doms
}

/// Natural loops as (header, body blocks). Loops sharing a header are merged.
pub fn natural_loops(function: &Function, doms: &[BTreeSet<usize>]) -> Vec<(BlockId, BTreeSet<usize>)> {
    let preds = function.predecessors();
    let mut loops: Vec<(BlockId, BTreeSet<usize>)> = Vec::new();
    for b in 0..function.blocks.len() {
        for succ in function.successors(BlockId::new(b)) {
            let h = succ.index();
            if !doms[b].contains(&h) {
                continue;
            }
            let mut body = BTreeSet::from([h]);
            let mut stack = vec![b];
            while let Some(x) = stack.pop() {
                if body.insert(x) {
                    stack.extend(preds[x].iter().map(|p| p.index()));
                }
            }
            match loops.iter_mut().find(|(header, _)| *header == succ) {
                Some((_, existing)) => existing.extend(body),
                None => loops.push((succ, body)),
            }
        }
    }
    loops
}

fn preheader(function: &Function, header: BlockId, body: &BTreeSet<usize>) -> Option<BlockId> {
    let preds = function.predecessors();
    let outside: Vec<BlockId> = preds[header.index()]
        .iter()
        .copied()
        .filter(|p| !body.contains(&p.index()))
        .collect();
    match outside.as_slice() {
        [only] if function.successors(*only) == vec![header] => Some(*only),
        _ => None,
    }
}

fn hoist(function: &mut Function, body: &BTreeSet<usize>, preheader: BlockId) -> usize {
    let mut defined: BTreeSet<InstId> = body
        .iter()
        .flat_map(|&b| function.blocks[b].insts.iter().copied())
        .collect();

    let mut moved = 0;
    loop {
        let candidate = body.iter().find_map(|&b| {
            function.blocks[b].insts.iter().copied().find(|&id| {
                let inst = function.inst(id);
                inst.is_pure()
                    && inst.operands().into_iter().all(|op| match op {
                        Operand::Value(v) => !defined.contains(&v),
                        _ => true,
                    })
            })
        });
        let Some(id) = candidate else {
            break;
        };
        function.unplace(id);
        let insts = &mut function.blocks[preheader.index()].insts;
        let at = insts.len().saturating_sub(1);
        insts.insert(at, id);
        defined.remove(&id);
        moved += 1;
    }
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;
    use bumpalo::Bump;

    const LOOP: &str = r#"
define @sum(i64 %n, i64 %k) -> i64 {
entry:
    br ^head
head:
    %i = add i64 %i, 1
    %scale = mul i64 %k, 8
    %limit = add i64 %scale, %n
    %c = icmp slt i64 %i, %limit
    condbr %c, ^head, ^exit
exit:
    ret %i
}
"#;

    #[test]
    fn finds_the_self_loop() {
        let module = parse_module(LOOP).unwrap();
        let f = &module.functions[0];
        let doms = dominators(f);
        assert_eq!(doms[2], BTreeSet::from([0, 1, 2]));
        let loops = natural_loops(f, &doms);
        assert_eq!(loops, vec![(BlockId(1), BTreeSet::from([1]))]);
    }

    #[test]
    fn invariant_chain_moves_to_preheader() {
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let mut module = parse_module(LOOP).unwrap();
        assert!(LoopInvariantMotion.run(&mut module, &ctx).unwrap());
        assert_eq!(ctx.stats().instructions_hoisted, 2);

        let f = &module.functions[0];
        let entry: Vec<_> = f.blocks[0].insts.iter().map(|&i| f.inst(i).opcode()).collect();
        assert_eq!(entry, vec!["mul", "add", "br"]);
        let head: Vec<_> = f.blocks[1].insts.iter().map(|&i| f.inst(i).opcode()).collect();
        assert_eq!(head, vec!["add", "icmp", "condbr"]);

        assert!(!LoopInvariantMotion.run(&mut module, &ctx).unwrap());
    }
}
