// This module defines the in-memory IR consumed by the relocation back end. A Module owns
// functions, global variables and a pool of uniqued constant expressions; each Function owns
// an instruction arena and an ordered list of basic blocks that reference instructions by id.
// Passes mutate modules in place: they splice new instructions into block lists, rewrite
// operands, and drop functions or globals through the remapping helpers at the bottom of
// this file. Constant expressions (inttoptr/bitcast/addrspacecast/gep chains) are interned
// so that structurally equal chains share one ConstId and children always precede parents.

//! Intermediate representation for freestanding compilation.
//!
//! The format is a small SSA IR that mirrors what a JIT-oriented front end
//! hands to its native back end: typed instructions, basic blocks, globals,
//! and constant-expression chains that may still wrap raw process addresses.
//!
//! # Text Format
//!
//! ```text
//! ; Comments start with semicolon
//! declare @rt_throw(ptr) -> void
//! define @answer(i64 %n) -> i64 {
//! entry:
//!     %x = add i64 %n, 42
//!     ret %x
//! }
//! ```

use std::fmt;

pub mod builder;
pub mod parser;
pub mod printer;

pub use builder::FunctionBuilder;
pub use parser::{parse_module, Cursor};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl $name {
            pub fn new(index: usize) -> Self {
                Self(index as u32)
            }

            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

entity_id!(
    /// Index of a function inside its module.
    FuncId
);
entity_id!(
    /// Index of a global variable inside its module.
    GlobalId
);
entity_id!(
    /// Index of an interned constant expression.
    ConstId
);
entity_id!(
    /// Index of a basic block inside its function.
    BlockId
);
entity_id!(
    /// Index of an instruction in its function's arena.
    InstId
);

/// Value types. Pointers are always 64 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    Void,
    Int(u8),
    F64,
    Ptr(u32),
}

impl Type {
    pub const I1: Type = Type::Int(1);
    pub const I8: Type = Type::Int(8);
    pub const I16: Type = Type::Int(16);
    pub const I32: Type = Type::Int(32);
    pub const I64: Type = Type::Int(64);
    pub const PTR: Type = Type::Ptr(0);

    /// Size in bytes when stored to memory.
    pub fn store_size(self) -> u32 {
        match self {
            Type::Void => 0,
            Type::Int(bits) => (bits as u32).div_ceil(8),
            Type::F64 | Type::Ptr(_) => 8,
        }
    }

    pub fn is_ptr(self) -> bool {
        matches!(self, Type::Ptr(_))
    }

    pub fn is_void(self) -> bool {
        matches!(self, Type::Void)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::F64 => write!(f, "f64"),
            Type::Ptr(0) => write!(f, "ptr"),
            Type::Ptr(space) => write!(f, "ptr({space})"),
        }
    }
}

/// Symbol visibility of a function or global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Linkage {
    External,
    Internal,
}

/// Source position attached to an instruction by the front end.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLoc {
    pub file: String,
    pub line: u32,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// An instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Result of an instruction in the same function.
    Value(InstId),
    /// Function parameter by position.
    Arg(u32),
    /// Integer literal; its width is implied by the using instruction.
    Int(i64),
    Null,
    Undef,
    /// Address of a function.
    Func(FuncId),
    /// Address of a global variable.
    Global(GlobalId),
    /// Constant expression from the module pool.
    Const(ConstId),
}

impl Operand {
    pub fn as_value(self) -> Option<InstId> {
        match self {
            Operand::Value(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_const(self) -> Option<ConstId> {
        match self {
            Operand::Const(id) => Some(id),
            _ => None,
        }
    }
}

/// Constant expression opcodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstOp {
    IntToPtr,
    PtrToInt,
    BitCast,
    AddrSpaceCast(u32),
    /// Byte-offset pointer arithmetic: `[base, offset]`.
    Gep,
    /// An opcode the back end does not understand.
    Other(String),
}

impl ConstOp {
    pub fn name(&self) -> &str {
        match self {
            ConstOp::IntToPtr => "inttoptr",
            ConstOp::PtrToInt => "ptrtoint",
            ConstOp::BitCast => "bitcast",
            ConstOp::AddrSpaceCast(_) => "addrspacecast",
            ConstOp::Gep => "gep",
            ConstOp::Other(name) => name,
        }
    }

    /// Result type of an expression with this opcode.
    pub fn result_type(&self) -> Type {
        match self {
            ConstOp::PtrToInt => Type::I64,
            ConstOp::AddrSpaceCast(space) => Type::Ptr(*space),
            _ => Type::PTR,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConstExpr {
    pub op: ConstOp,
    pub operands: Vec<Operand>,
}

impl ConstExpr {
    pub fn new(op: ConstOp, operands: Vec<Operand>) -> Self {
        Self { op, operands }
    }
}

/// Uniquing pool of constant expressions.
///
/// Operands referring to other expressions must already be interned, so
/// every expression's children have smaller ids than the expression itself.
#[derive(Debug, Clone, Default)]
pub struct ConstPool {
    exprs: Vec<ConstExpr>,
    index: hashbrown::HashMap<ConstExpr, ConstId>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, expr: ConstExpr) -> ConstId {
        if let Some(&id) = self.index.get(&expr) {
            return id;
        }
        let id = ConstId::new(self.exprs.len());
        self.index.insert(expr.clone(), id);
        self.exprs.push(expr);
        id
    }

    pub fn get(&self, id: ConstId) -> &ConstExpr {
        &self.exprs[id.index()]
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConstId, &ConstExpr)> {
        self.exprs
            .iter()
            .enumerate()
            .map(|(idx, expr)| (ConstId::new(idx), expr))
    }

    /// Rebuild the pool with every operand passed through `remap`.
    ///
    /// Returns the new pool and the old->new id mapping.
    pub fn remapped<F>(&self, mut remap: F) -> (ConstPool, Vec<ConstId>)
    where
        F: FnMut(Operand) -> Operand,
    {
        let mut pool = ConstPool::new();
        let mut mapping: Vec<ConstId> = Vec::with_capacity(self.exprs.len());
        for expr in &self.exprs {
            let operands = expr
                .operands
                .iter()
                .map(|&op| match op {
                    Operand::Const(child) => Operand::Const(mapping[child.index()]),
                    other => remap(other),
                })
                .collect();
            mapping.push(pool.intern(ConstExpr::new(expr.op.clone(), operands)));
        }
        (pool, mapping)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

impl BinOp {
    pub fn name(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::LShr => "lshr",
            BinOp::AShr => "ashr",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "add" => BinOp::Add,
            "sub" => BinOp::Sub,
            "mul" => BinOp::Mul,
            "and" => BinOp::And,
            "or" => BinOp::Or,
            "xor" => BinOp::Xor,
            "shl" => BinOp::Shl,
            "lshr" => BinOp::LShr,
            "ashr" => BinOp::AShr,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

impl IntPredicate {
    pub fn name(self) -> &'static str {
        match self {
            IntPredicate::Eq => "eq",
            IntPredicate::Ne => "ne",
            IntPredicate::Slt => "slt",
            IntPredicate::Sle => "sle",
            IntPredicate::Sgt => "sgt",
            IntPredicate::Sge => "sge",
            IntPredicate::Ult => "ult",
            IntPredicate::Ule => "ule",
            IntPredicate::Ugt => "ugt",
            IntPredicate::Uge => "uge",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "eq" => IntPredicate::Eq,
            "ne" => IntPredicate::Ne,
            "slt" => IntPredicate::Slt,
            "sle" => IntPredicate::Sle,
            "sgt" => IntPredicate::Sgt,
            "sge" => IntPredicate::Sge,
            "ult" => IntPredicate::Ult,
            "ule" => IntPredicate::Ule,
            "ugt" => IntPredicate::Ugt,
            "uge" => IntPredicate::Uge,
            _ => return None,
        })
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            IntPredicate::Slt | IntPredicate::Sle | IntPredicate::Sgt | IntPredicate::Sge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    BitCast,
    AddrSpaceCast,
    IntToPtr,
    PtrToInt,
    ZExt,
    SExt,
    Trunc,
}

impl CastOp {
    pub fn name(self) -> &'static str {
        match self {
            CastOp::BitCast => "bitcast",
            CastOp::AddrSpaceCast => "addrspacecast",
            CastOp::IntToPtr => "inttoptr",
            CastOp::PtrToInt => "ptrtoint",
            CastOp::ZExt => "zext",
            CastOp::SExt => "sext",
            CastOp::Trunc => "trunc",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "bitcast" => CastOp::BitCast,
            "addrspacecast" => CastOp::AddrSpaceCast,
            "inttoptr" => CastOp::IntToPtr,
            "ptrtoint" => CastOp::PtrToInt,
            "zext" => CastOp::ZExt,
            "sext" => CastOp::SExt,
            "trunc" => CastOp::Trunc,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Binary {
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    ICmp {
        pred: IntPredicate,
        /// Operand type.
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    },
    Load {
        ptr: Operand,
    },
    Store {
        ty: Type,
        value: Operand,
        ptr: Operand,
    },
    Gep {
        base: Operand,
        offset: Operand,
    },
    Cast {
        op: CastOp,
        from: Type,
        value: Operand,
    },
    Alloca {
        size: u32,
    },
    Call {
        callee: Operand,
        args: Vec<(Type, Operand)>,
    },
    Ret {
        value: Option<Operand>,
    },
    Br {
        target: BlockId,
    },
    CondBr {
        cond: Operand,
        then_block: BlockId,
        else_block: BlockId,
    },
    Unreachable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Inst {
    pub name: Option<String>,
    /// Result type; `void` for instructions without a result.
    pub ty: Type,
    pub kind: InstKind,
    pub loc: Option<SourceLoc>,
}

impl Inst {
    pub fn new(ty: Type, kind: InstKind) -> Self {
        Self {
            name: None,
            ty,
            kind,
            loc: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_loc(mut self, loc: Option<SourceLoc>) -> Self {
        self.loc = loc;
        self
    }

    pub fn opcode(&self) -> &'static str {
        match &self.kind {
            InstKind::Binary { op, .. } => op.name(),
            InstKind::ICmp { .. } => "icmp",
            InstKind::Load { .. } => "load",
            InstKind::Store { .. } => "store",
            InstKind::Gep { .. } => "gep",
            InstKind::Cast { op, .. } => op.name(),
            InstKind::Alloca { .. } => "alloca",
            InstKind::Call { .. } => "call",
            InstKind::Ret { .. } => "ret",
            InstKind::Br { .. } => "br",
            InstKind::CondBr { .. } => "condbr",
            InstKind::Unreachable => "unreachable",
        }
    }

    /// Operands in a fixed order; `operands_mut` yields the same order.
    pub fn operands(&self) -> Vec<Operand> {
        match &self.kind {
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            InstKind::Load { ptr } => vec![*ptr],
            InstKind::Store { value, ptr, .. } => vec![*value, *ptr],
            InstKind::Gep { base, offset } => vec![*base, *offset],
            InstKind::Cast { value, .. } => vec![*value],
            InstKind::Call { callee, args } => std::iter::once(*callee)
                .chain(args.iter().map(|(_, arg)| *arg))
                .collect(),
            InstKind::Ret { value } => value.iter().copied().collect(),
            InstKind::CondBr { cond, .. } => vec![*cond],
            InstKind::Alloca { .. } | InstKind::Br { .. } | InstKind::Unreachable => Vec::new(),
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Operand> {
        match &mut self.kind {
            InstKind::Binary { lhs, rhs, .. } | InstKind::ICmp { lhs, rhs, .. } => {
                vec![lhs, rhs]
            }
            InstKind::Load { ptr } => vec![ptr],
            InstKind::Store { value, ptr, .. } => vec![value, ptr],
            InstKind::Gep { base, offset } => vec![base, offset],
            InstKind::Cast { value, .. } => vec![value],
            InstKind::Call { callee, args } => std::iter::once(callee)
                .chain(args.iter_mut().map(|(_, arg)| arg))
                .collect(),
            InstKind::Ret { value } => value.iter_mut().collect(),
            InstKind::CondBr { cond, .. } => vec![cond],
            InstKind::Alloca { .. } | InstKind::Br { .. } | InstKind::Unreachable => Vec::new(),
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Ret { .. } | InstKind::Br { .. } | InstKind::CondBr { .. } | InstKind::Unreachable
        )
    }

    /// Whether removing an unused instance would change program behavior.
    pub fn has_side_effects(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Store { .. } | InstKind::Call { .. }
        ) || self.is_terminator()
    }

    /// Pure computations that may be moved or duplicated freely.
    pub fn is_pure(&self) -> bool {
        matches!(
            self.kind,
            InstKind::Binary { .. } | InstKind::ICmp { .. } | InstKind::Gep { .. } | InstKind::Cast { .. }
        )
    }

    pub fn successors(&self) -> Vec<BlockId> {
        match self.kind {
            InstKind::Br { target } => vec![target],
            InstKind::CondBr {
                then_block,
                else_block,
                ..
            } => vec![then_block, else_block],
            _ => Vec::new(),
        }
    }

    pub fn successors_mut(&mut self) -> Vec<&mut BlockId> {
        match &mut self.kind {
            InstKind::Br { target } => vec![target],
            InstKind::CondBr {
                then_block,
                else_block,
                ..
            } => vec![then_block, else_block],
            _ => Vec::new(),
        }
    }

    /// Direct callee, if this is a call to a known function.
    pub fn direct_callee(&self) -> Option<FuncId> {
        match self.kind {
            InstKind::Call {
                callee: Operand::Func(func),
                ..
            } => Some(func),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<InstId>,
}

impl Block {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            insts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuncAttrs {
    /// Calling-convention adapter emitted by the front end around the real body.
    pub dispatch_wrapper: bool,
    pub noinline: bool,
    /// Produced by this back end (initializer, deserializer).
    pub generated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub linkage: Linkage,
    pub params: Vec<Param>,
    pub ret: Type,
    pub blocks: Vec<Block>,
    pub insts: Vec<Inst>,
    pub attrs: FuncAttrs,
}

impl Function {
    pub fn new(name: impl Into<String>, params: Vec<Param>, ret: Type) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::External,
            params,
            ret,
            blocks: Vec::new(),
            insts: Vec::new(),
            attrs: FuncAttrs::default(),
        }
    }

    /// A declaration with unnamed parameters of the given types.
    pub fn declaration(name: impl Into<String>, params: &[Type], ret: Type) -> Self {
        let params = params
            .iter()
            .enumerate()
            .map(|(idx, &ty)| Param {
                name: format!("arg{idx}"),
                ty,
            })
            .collect();
        Self::new(name, params, ret)
    }

    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn param_types(&self) -> Vec<Type> {
        self.params.iter().map(|p| p.ty).collect()
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.index()]
    }

    /// Add an instruction to the arena without placing it in a block.
    pub fn push_inst(&mut self, inst: Inst) -> InstId {
        let id = InstId::new(self.insts.len());
        self.insts.push(inst);
        id
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId::new(self.blocks.len());
        self.blocks.push(Block::new(name));
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn block_by_name(&self, name: &str) -> Option<BlockId> {
        self.blocks
            .iter()
            .position(|b| b.name == name)
            .map(BlockId::new)
    }

    pub fn terminator(&self, block: BlockId) -> Option<&Inst> {
        self.blocks[block.index()]
            .insts
            .last()
            .map(|&id| self.inst(id))
            .filter(|inst| inst.is_terminator())
    }

    pub fn successors(&self, block: BlockId) -> Vec<BlockId> {
        self.terminator(block)
            .map(Inst::successors)
            .unwrap_or_default()
    }

    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for idx in 0..self.blocks.len() {
            for succ in self.successors(BlockId::new(idx)) {
                if !preds[succ.index()].contains(&BlockId::new(idx)) {
                    preds[succ.index()].push(BlockId::new(idx));
                }
            }
        }
        preds
    }

    /// Instructions currently placed in blocks, in layout order.
    pub fn placed_insts(&self) -> impl Iterator<Item = (BlockId, InstId)> + '_ {
        self.blocks.iter().enumerate().flat_map(|(b, block)| {
            block
                .insts
                .iter()
                .map(move |&inst| (BlockId::new(b), inst))
        })
    }

    /// Count of uses of every instruction result among placed instructions.
    pub fn use_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.insts.len()];
        for (_, id) in self.placed_insts() {
            for op in self.inst(id).operands() {
                if let Operand::Value(used) = op {
                    counts[used.index()] += 1;
                }
            }
        }
        counts
    }

    pub fn replace_all_uses(&mut self, from: InstId, to: Operand) {
        for inst in &mut self.insts {
            for op in inst.operands_mut() {
                if *op == Operand::Value(from) {
                    *op = to;
                }
            }
        }
    }

    /// Insert `inst` into `block` at `position`, returning its id.
    pub fn insert_inst(&mut self, block: BlockId, position: usize, inst: Inst) -> InstId {
        let id = self.push_inst(inst);
        self.blocks[block.index()].insts.insert(position, id);
        id
    }

    /// Remove `inst` from whichever block holds it. The arena slot stays.
    pub fn unplace(&mut self, inst: InstId) {
        for block in &mut self.blocks {
            block.insts.retain(|&id| id != inst);
        }
    }

    /// Drop blocks for which `keep` is false and renumber branch targets.
    pub fn retain_blocks(&mut self, keep: &[bool]) {
        let mut mapping = vec![None; self.blocks.len()];
        let mut next = 0;
        for (idx, &k) in keep.iter().enumerate() {
            if k {
                mapping[idx] = Some(BlockId::new(next));
                next += 1;
            }
        }
        let old = std::mem::take(&mut self.blocks);
        self.blocks = old
            .into_iter()
            .zip(keep.iter())
            .filter_map(|(block, &k)| k.then_some(block))
            .collect();
        for b in 0..self.blocks.len() {
            let ids = self.blocks[b].insts.clone();
            for id in ids {
                for succ in self.insts[id.index()].successors_mut() {
                    if let Some(new) = mapping[succ.index()] {
                        *succ = new;
                    }
                }
            }
        }
    }

    /// Display name for an instruction result.
    pub fn value_name(&self, id: InstId) -> String {
        match &self.inst(id).name {
            Some(name) => name.clone(),
            None => id.0.to_string(),
        }
    }
}

/// Storage of a global variable.
#[derive(Debug, Clone, PartialEq)]
pub enum GlobalKind {
    /// Provided by another object or the runtime library.
    Extern,
    /// Zero-initialized storage.
    Zeroed { size: u64 },
    /// Initialized storage with optional absolute address fixups.
    Data {
        bytes: Vec<u8>,
        readonly: bool,
        relocs: Vec<DataReloc>,
    },
}

/// 64-bit absolute reference stored inside a data global.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataReloc {
    pub offset: u64,
    /// `Operand::Func` or `Operand::Global`.
    pub target: Operand,
    pub addend: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub name: String,
    pub linkage: Linkage,
    pub kind: GlobalKind,
    pub align: u32,
}

impl Global {
    pub fn external(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::External,
            kind: GlobalKind::Extern,
            align: 8,
        }
    }

    pub fn zeroed(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::Internal,
            kind: GlobalKind::Zeroed { size },
            align: 8,
        }
    }

    pub fn data(name: impl Into<String>, bytes: Vec<u8>, readonly: bool) -> Self {
        Self {
            name: name.into(),
            linkage: Linkage::Internal,
            kind: GlobalKind::Data {
                bytes,
                readonly,
                relocs: Vec::new(),
            },
            align: 8,
        }
    }

    pub fn is_extern(&self) -> bool {
        matches!(self.kind, GlobalKind::Extern)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
    pub consts: ConstPool,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.functions[id.index()]
    }

    pub fn func_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.index()]
    }

    pub fn global(&self, id: GlobalId) -> &Global {
        &self.globals[id.index()]
    }

    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(FuncId::new)
    }

    pub fn global_by_name(&self, name: &str) -> Option<GlobalId> {
        self.globals
            .iter()
            .position(|g| g.name == name)
            .map(GlobalId::new)
    }

    pub fn add_function(&mut self, function: Function) -> FuncId {
        let id = FuncId::new(self.functions.len());
        self.functions.push(function);
        id
    }

    pub fn add_global(&mut self, global: Global) -> GlobalId {
        let id = GlobalId::new(self.globals.len());
        self.globals.push(global);
        id
    }

    /// Find a function by name or add an external declaration for it.
    pub fn get_or_declare_function(&mut self, name: &str, params: &[Type], ret: Type) -> FuncId {
        match self.function_by_name(name) {
            Some(id) => id,
            None => self.add_function(Function::declaration(name, params, ret)),
        }
    }

    /// Find a global by name or add an external declaration for it.
    pub fn get_or_declare_global(&mut self, name: &str) -> GlobalId {
        match self.global_by_name(name) {
            Some(id) => id,
            None => self.add_global(Global::external(name)),
        }
    }

    pub fn intern_const(&mut self, expr: ConstExpr) -> ConstId {
        self.consts.intern(expr)
    }

    /// Drop functions and globals whose `keep` flag is false and renumber
    /// every reference. Callers must ensure dropped entities are unused.
    pub fn retain(&mut self, keep_funcs: &[bool], keep_globals: &[bool]) {
        let func_map = compact_mapping(keep_funcs);
        let global_map = compact_mapping(keep_globals);
        let remap = |op: Operand| match op {
            Operand::Func(f) => func_map[f.index()].map_or(Operand::Undef, Operand::Func),
            Operand::Global(g) => global_map[g.index()].map_or(Operand::Undef, Operand::Global),
            other => other,
        };

        let (pool, const_map) = self.consts.remapped(remap);
        self.consts = pool;

        let remap_operand = |op: &mut Operand| {
            *op = match *op {
                Operand::Const(c) => Operand::Const(const_map[c.index()]),
                other => remap(other),
            };
        };

        let functions = std::mem::take(&mut self.functions);
        self.functions = functions
            .into_iter()
            .zip(keep_funcs.iter())
            .filter_map(|(f, &k)| k.then_some(f))
            .collect();
        for function in &mut self.functions {
            for inst in &mut function.insts {
                for op in inst.operands_mut() {
                    remap_operand(op);
                }
            }
        }

        let globals = std::mem::take(&mut self.globals);
        self.globals = globals
            .into_iter()
            .zip(keep_globals.iter())
            .filter_map(|(g, &k)| k.then_some(g))
            .collect();
        for global in &mut self.globals {
            if let GlobalKind::Data { relocs, .. } = &mut global.kind {
                for reloc in relocs {
                    remap_operand(&mut reloc.target);
                }
            }
        }
    }
}

fn compact_mapping<T: From<usize>>(keep: &[bool]) -> Vec<Option<T>>
where
    T: Copy,
{
    let mut next = 0usize;
    keep.iter()
        .map(|&k| {
            if k {
                next += 1;
                Some(T::from(next - 1))
            } else {
                None
            }
        })
        .collect()
}

impl From<usize> for FuncId {
    fn from(index: usize) -> Self {
        FuncId::new(index)
    }
}

impl From<usize> for GlobalId {
    fn from(index: usize) -> Self {
        GlobalId::new(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_pool_uniques_structurally_equal_expressions() {
        let mut pool = ConstPool::new();
        let a = pool.intern(ConstExpr::new(ConstOp::IntToPtr, vec![Operand::Int(0x7000)]));
        let b = pool.intern(ConstExpr::new(ConstOp::IntToPtr, vec![Operand::Int(0x7000)]));
        let c = pool.intern(ConstExpr::new(ConstOp::BitCast, vec![Operand::Const(a)]));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn retain_renumbers_function_references() {
        let mut module = Module::new("m");
        let dead = module.add_function(Function::declaration("dead", &[], Type::Void));
        let live = module.add_function(Function::declaration("live", &[], Type::Void));
        let mut caller = Function::new("caller", Vec::new(), Type::Void);
        let entry = caller.add_block("entry");
        caller.insert_inst(
            entry,
            0,
            Inst::new(
                Type::Void,
                InstKind::Call {
                    callee: Operand::Func(live),
                    args: Vec::new(),
                },
            ),
        );
        module.add_function(caller);
        let cast = module.intern_const(ConstExpr::new(ConstOp::BitCast, vec![Operand::Func(live)]));
        assert_eq!(cast, ConstId(0));

        module.retain(&[false, true, true], &[]);
        assert_eq!(module.functions.len(), 2);
        let _ = dead;
        let caller = &module.functions[1];
        assert_eq!(caller.insts[0].direct_callee(), Some(FuncId(0)));
        assert_eq!(
            module.consts.get(ConstId(0)).operands[0],
            Operand::Func(FuncId(0))
        );
    }

    #[test]
    fn type_sizes() {
        assert_eq!(Type::I1.store_size(), 1);
        assert_eq!(Type::I32.store_size(), 4);
        assert_eq!(Type::Ptr(11).store_size(), 8);
        assert_eq!(Type::Ptr(11).to_string(), "ptr(11)");
    }
}
