//! Instruction builder used by generated routines and tests.

use super::*;

/// Appends instructions to the end of a current block.
pub struct FunctionBuilder<'f> {
    function: &'f mut Function,
    current: BlockId,
    loc: Option<SourceLoc>,
}

impl<'f> FunctionBuilder<'f> {
    /// Start building at the end of `block`.
    pub fn new(function: &'f mut Function, block: BlockId) -> Self {
        Self {
            function,
            current: block,
            loc: None,
        }
    }

    /// Create the entry block of an empty function and position there.
    pub fn with_entry(function: &'f mut Function) -> Self {
        let entry = function.add_block("entry");
        Self::new(function, entry)
    }

    pub fn function(&self) -> &Function {
        self.function
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        self.function.add_block(name)
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current
    }

    /// Source location attached to subsequently built instructions.
    pub fn set_loc(&mut self, loc: Option<SourceLoc>) {
        self.loc = loc;
    }

    pub fn push(&mut self, inst: Inst) -> Operand {
        let inst = inst.with_loc(self.loc.clone());
        let id = self.function.push_inst(inst);
        self.function.blocks[self.current.index()].insts.push(id);
        Operand::Value(id)
    }

    pub fn binary(&mut self, op: BinOp, ty: Type, lhs: Operand, rhs: Operand) -> Operand {
        self.push(Inst::new(ty, InstKind::Binary { op, lhs, rhs }))
    }

    pub fn icmp(&mut self, pred: IntPredicate, ty: Type, lhs: Operand, rhs: Operand) -> Operand {
        self.push(Inst::new(Type::I1, InstKind::ICmp { pred, ty, lhs, rhs }))
    }

    pub fn load(&mut self, ty: Type, ptr: Operand) -> Operand {
        self.push(Inst::new(ty, InstKind::Load { ptr }))
    }

    pub fn store(&mut self, ty: Type, value: Operand, ptr: Operand) {
        self.push(Inst::new(Type::Void, InstKind::Store { ty, value, ptr }));
    }

    pub fn gep(&mut self, ty: Type, base: Operand, offset: Operand) -> Operand {
        self.push(Inst::new(ty, InstKind::Gep { base, offset }))
    }

    pub fn cast(&mut self, op: CastOp, from: Type, value: Operand, to: Type) -> Operand {
        self.push(Inst::new(to, InstKind::Cast { op, from, value }))
    }

    pub fn alloca(&mut self, size: u32) -> Operand {
        self.push(Inst::new(Type::PTR, InstKind::Alloca { size }))
    }

    pub fn call(&mut self, ret: Type, callee: Operand, args: Vec<(Type, Operand)>) -> Operand {
        self.push(Inst::new(ret, InstKind::Call { callee, args }))
    }

    pub fn ret(&mut self, value: Option<Operand>) {
        self.push(Inst::new(Type::Void, InstKind::Ret { value }));
    }

    pub fn br(&mut self, target: BlockId) {
        self.push(Inst::new(Type::Void, InstKind::Br { target }));
    }

    pub fn cond_br(&mut self, cond: Operand, then_block: BlockId, else_block: BlockId) {
        self.push(Inst::new(
            Type::Void,
            InstKind::CondBr {
                cond,
                then_block,
                else_block,
            },
        ));
    }

    pub fn unreachable(&mut self) {
        self.push(Inst::new(Type::Void, InstKind::Unreachable));
    }
}
