//! Helpers over constant-expression chains.
//!
//! A chain is a path of casts and GEPs from a top-level constant down to a
//! leaf. When the leaf is `inttoptr(<literal>)` the chain wraps a process
//! address.

use crate::ir::{ConstExpr, ConstId, ConstOp, ConstPool, Operand};

/// Follow operand 0 of each chain node; returns the node ids from `top` down
/// to and including the leaf.
fn chain_path(consts: &ConstPool, top: ConstId) -> Vec<ConstId> {
    let mut path = vec![top];
    let mut current = top;
    loop {
        let expr = consts.get(current);
        let next = match expr.op {
            ConstOp::Other(_) => None,
            _ => expr.operands.first().and_then(|op| op.as_const()),
        };
        match next {
            Some(next) => {
                path.push(next);
                current = next;
            }
            None => return path,
        }
    }
}

/// Literal address at the bottom of the chain, if the leaf is
/// `inttoptr(<integer>)`.
pub fn leaf_address(consts: &ConstPool, top: ConstId) -> Option<u64> {
    let leaf = *chain_path(consts, top).last()?;
    match consts.get(leaf) {
        ConstExpr {
            op: ConstOp::IntToPtr,
            operands,
        } => match operands.as_slice() {
            [Operand::Int(value)] => Some(*value as u64),
            _ => None,
        },
        _ => None,
    }
}

/// True when every node above the leaf is a pointer cast that does not
/// change the address (bitcast, address-space cast).
pub fn is_pure_cast_chain(consts: &ConstPool, top: ConstId) -> bool {
    let path = chain_path(consts, top);
    path[..path.len() - 1]
        .iter()
        .all(|&id| matches!(consts.get(id).op, ConstOp::BitCast | ConstOp::AddrSpaceCast(_)))
}

/// Rebuild the chain with its leaf replaced by `replacement`. The result is
/// `replacement` itself when `top` is the leaf.
pub fn replace_leaf(consts: &mut ConstPool, top: ConstId, replacement: Operand) -> Operand {
    let path = chain_path(consts, top);
    let mut current = replacement;
    for &id in path.iter().rev().skip(1) {
        let mut expr = consts.get(id).clone();
        expr.operands[0] = current;
        current = Operand::Const(consts.intern(expr));
    }
    current
}
