// This module lowers one IR function to x86-64 machine code. FunctionCodegen ties together
// SysVAssigner (where arguments live), FunctionFrame (where every value lives) and X64Encoder
// (the bytes). Code generation is deliberately simple: every parameter and every instruction
// result owns an 8-byte home slot below RBP, each instruction loads its operands into RAX and
// RCX, computes, and writes the result back to its slot. Values are kept zero-extended to their
// IR width in their slots so comparisons and wider uses never see stale upper bits; signed
// operations sign-extend on the fly. References to functions and globals become placeholder
// instructions whose displacements the object writer relocates.

//! Function code generation with calling conventions.
//!
//! This module provides the bridge between the IR, the calling convention and
//! machine code generation, implementing System V compatible prologues,
//! epilogues and calls.

use bumpalo::Bump;

use super::calling_convention::{CCAssigner, FunctionFrame, SysVAssigner};
use super::encoder::{Condition, EncodedFunction, Reg, X64Encoder};
use super::FixupTarget;
use crate::core::error::{CompileError, CompileResult, Location};
use crate::core::session::CompilationContext;
use crate::ir::{
    BinOp, BlockId, CastOp, Function, Inst, InstId, InstKind, IntPredicate, Linkage, Module, Operand,
    Type,
};

/// Function code generator.
pub struct FunctionCodegen<'a, 'm> {
    module: &'m Module,
    function: &'m Function,
    encoder: X64Encoder,
    frame: FunctionFrame<'a>,
}

fn width(ty: Type) -> u32 {
    match ty {
        Type::Int(bits) => bits as u32,
        _ => 64,
    }
}

fn supported_width(ty: Type) -> bool {
    match ty {
        Type::Int(bits) => matches!(bits, 1 | 8 | 16 | 32 | 64),
        _ => true,
    }
}

/// Truncate a literal to `bits`, as it would sit in a normalized slot.
fn normalize_literal(value: i64, bits: u32) -> i64 {
    if bits >= 64 {
        value
    } else {
        ((value as u64) & ((1u64 << bits) - 1)) as i64
    }
}

fn condition(pred: IntPredicate) -> Condition {
    match pred {
        IntPredicate::Eq => Condition::Equal,
        IntPredicate::Ne => Condition::NotEqual,
        IntPredicate::Slt => Condition::Less,
        IntPredicate::Sle => Condition::LessEqual,
        IntPredicate::Sgt => Condition::Greater,
        IntPredicate::Sge => Condition::GreaterEqual,
        IntPredicate::Ult => Condition::Below,
        IntPredicate::Ule => Condition::BelowEqual,
        IntPredicate::Ugt => Condition::Above,
        IntPredicate::Uge => Condition::AboveEqual,
    }
}

impl<'a, 'm> FunctionCodegen<'a, 'm> {
    pub fn new(module: &'m Module, function: &'m Function, arena: &'a Bump) -> CompileResult<Self> {
        Ok(Self {
            module,
            function,
            encoder: X64Encoder::new()?,
            frame: FunctionFrame::new(arena, function.insts.len()),
        })
    }

    fn location(&self, block: BlockId, index: usize, inst: &Inst) -> Location {
        Location::at(
            self.function.name.clone(),
            self.function.block(block).name.clone(),
            index,
            inst.loc.clone(),
        )
    }

    /// Assign home slots to parameters, results and stack allocations.
    fn layout_frame(&mut self) -> CompileResult<()> {
        for param in &self.function.params {
            if param.ty == Type::F64 || !supported_width(param.ty) {
                return Err(CompileError::unsupported(
                    format!("parameter %{} of type {}", param.name, param.ty),
                    Location::in_function(self.function.name.clone()),
                ));
            }
            let slot = self.frame.allocate_slot(8);
            self.frame.param_slots.push(slot);
        }
        for (block, id) in self.function.placed_insts() {
            let inst = self.function.inst(id);
            if let InstKind::Alloca { size } = inst.kind {
                self.frame.alloca_areas[id.index()] = Some(self.frame.allocate_slot(size));
            } else if !inst.ty.is_void() {
                if !supported_width(inst.ty) {
                    let index = self.function.block(block).insts.iter().position(|&i| i == id).unwrap_or(0);
                    return Err(CompileError::unsupported(
                        format!("value of type {}", inst.ty),
                        self.location(block, index, inst),
                    ));
                }
                self.frame.value_slots[id.index()] = Some(self.frame.allocate_slot(8));
            }
        }
        self.frame.calculate_frame_size();
        Ok(())
    }

    /// Store incoming arguments to their home slots, normalized.
    fn spill_arguments(&mut self) -> CompileResult<()> {
        let mut cc = SysVAssigner::new();
        let assignments = cc.assign_all(self.function.params.len());
        for (idx, (param, assignment)) in self.function.params.iter().zip(assignments).enumerate() {
            let home = self.frame.param_slots[idx];
            let reg = match (assignment.reg, assignment.stack_off) {
                (Some(reg), _) => reg,
                (None, Some(off)) => {
                    self.encoder.load(8, Reg::RAX, Reg::RBP, FunctionFrame::incoming_arg(off))?;
                    Reg::RAX
                }
                (None, None) => return Err(CompileError::codegen("argument without a location")),
            };
            self.encoder.zero_extend(reg, width(param.ty))?;
            self.encoder.store(8, Reg::RBP, home, reg)?;
        }
        Ok(())
    }

    /// Compile the function body and return its code and fixups.
    pub fn compile(mut self, ctx: &CompilationContext<'_>) -> CompileResult<EncodedFunction> {
        self.layout_frame()?;
        log::trace!(
            "x64: @{} frame {} bytes, {} params",
            self.function.name,
            self.frame.frame_size,
            self.function.params.len()
        );
        self.encoder.emit_prologue(self.frame.frame_size)?;
        self.spill_arguments()?;

        let function = self.function;
        for (b, block) in function.blocks.iter().enumerate() {
            self.encoder.place_label_for_block(b)?;
            let next = BlockId::new(b + 1);
            for (index, &id) in block.insts.iter().enumerate() {
                let inst = function.inst(id);
                self.lower(id, inst, next)
                    .map_err(|err| self.attach_location(err, BlockId::new(b), index, inst))?;
                ctx.record_instruction_compiled(inst.opcode());
            }
        }

        let encoded = self.encoder.finalize()?;
        ctx.record_function_compiled(&function.name, encoded.code.len());
        Ok(encoded)
    }

    fn attach_location(&self, err: CompileError, block: BlockId, index: usize, inst: &Inst) -> CompileError {
        match err {
            CompileError::UnsupportedConstruct { what, location } if location.function.is_none() => {
                CompileError::unsupported(what, self.location(block, index, inst))
            }
            CompileError::CodeGeneration { reason } => CompileError::codegen(format!(
                "{}: {reason}",
                self.location(block, index, inst)
            )),
            other => other,
        }
    }

    /// Materialize `op` of type `ty` in `reg`.
    fn load_operand(&mut self, reg: Reg, op: Operand, ty: Type) -> CompileResult<()> {
        match op {
            Operand::Value(v) => {
                if let Some(area) = self.frame.alloca_areas[v.index()] {
                    self.encoder.lea(reg, Reg::RBP, area)?;
                } else {
                    let slot = self.frame.value_slots[v.index()]
                        .ok_or_else(|| CompileError::codegen(format!("{} has no value", self.function.value_name(v))))?;
                    self.encoder.load(8, reg, Reg::RBP, slot)?;
                }
            }
            Operand::Arg(a) => {
                let slot = *self
                    .frame
                    .param_slots
                    .get(a as usize)
                    .ok_or_else(|| CompileError::codegen(format!("argument {a} out of range")))?;
                self.encoder.load(8, reg, Reg::RBP, slot)?;
            }
            Operand::Int(value) => self.encoder.mov_reg_imm(reg, normalize_literal(value, width(ty)))?,
            Operand::Null | Operand::Undef => self.encoder.mov_reg_imm(reg, 0)?,
            Operand::Func(_) | Operand::Global(_) => self.load_address(reg, op)?,
            Operand::Const(_) => {
                return Err(CompileError::codegen("constant expression reached code generation"));
            }
        }
        Ok(())
    }

    /// Symbols defined locally are addressed directly; anything another
    /// object may define goes through the GOT.
    fn load_address(&mut self, reg: Reg, op: Operand) -> CompileResult<()> {
        let (target, local) = match op {
            Operand::Func(f) => {
                let callee = self.module.func(f);
                (FixupTarget::Func(f), callee.linkage == Linkage::Internal && !callee.is_declaration())
            }
            Operand::Global(g) => {
                let global = self.module.global(g);
                (FixupTarget::Global(g), global.linkage == Linkage::Internal && !global.is_extern())
            }
            _ => return Err(CompileError::codegen(format!("{op:?} is not a symbol"))),
        };
        if local {
            self.encoder.lea_symbol(reg, target)?;
        } else {
            self.encoder.load_symbol_got(reg, target)?;
        }
        Ok(())
    }

    fn store_result(&mut self, id: InstId, reg: Reg) -> CompileResult<()> {
        let slot = self.frame.value_slots[id.index()]
            .ok_or_else(|| CompileError::codegen(format!("{} has no slot", self.function.value_name(id))))?;
        self.encoder.store(8, Reg::RBP, slot, reg)?;
        Ok(())
    }

    fn lower(&mut self, id: InstId, inst: &Inst, next: BlockId) -> CompileResult<()> {
        match &inst.kind {
            InstKind::Binary { op, lhs, rhs } => {
                if inst.ty == Type::F64 {
                    return Err(CompileError::unsupported(
                        format!("floating-point {}", op.name()),
                        Location::default(),
                    ));
                }
                let bits = width(inst.ty);
                self.load_operand(Reg::RAX, *lhs, inst.ty)?;
                self.load_operand(Reg::RCX, *rhs, inst.ty)?;
                match op {
                    BinOp::Add => self.encoder.add_reg_reg(Reg::RAX, Reg::RCX)?,
                    BinOp::Sub => self.encoder.sub_reg_reg(Reg::RAX, Reg::RCX)?,
                    BinOp::Mul => self.encoder.imul_reg_reg(Reg::RAX, Reg::RCX)?,
                    BinOp::And => self.encoder.and_reg_reg(Reg::RAX, Reg::RCX)?,
                    BinOp::Or => self.encoder.or_reg_reg(Reg::RAX, Reg::RCX)?,
                    BinOp::Xor => self.encoder.xor_reg_reg(Reg::RAX, Reg::RCX)?,
                    BinOp::Shl => self.encoder.shl_reg_cl(Reg::RAX)?,
                    BinOp::LShr => self.encoder.shr_reg_cl(Reg::RAX)?,
                    BinOp::AShr => {
                        self.encoder.sign_extend(Reg::RAX, bits)?;
                        self.encoder.sar_reg_cl(Reg::RAX)?;
                    }
                }
                self.encoder.zero_extend(Reg::RAX, bits)?;
                self.store_result(id, Reg::RAX)
            }
            InstKind::ICmp { pred, ty, lhs, rhs } => {
                self.load_operand(Reg::RAX, *lhs, *ty)?;
                self.load_operand(Reg::RCX, *rhs, *ty)?;
                if pred.is_signed() {
                    self.encoder.sign_extend(Reg::RAX, width(*ty))?;
                    self.encoder.sign_extend(Reg::RCX, width(*ty))?;
                }
                self.encoder.cmp_reg_reg(Reg::RAX, Reg::RCX)?;
                self.encoder.set_condition(condition(*pred), Reg::RAX)?;
                self.store_result(id, Reg::RAX)
            }
            InstKind::Load { ptr } => {
                self.load_operand(Reg::RCX, *ptr, Type::PTR)?;
                self.encoder.load(inst.ty.store_size(), Reg::RAX, Reg::RCX, 0)?;
                self.encoder.zero_extend(Reg::RAX, width(inst.ty))?;
                self.store_result(id, Reg::RAX)
            }
            InstKind::Store { ty, value, ptr } => {
                self.load_operand(Reg::RAX, *value, *ty)?;
                self.load_operand(Reg::RCX, *ptr, Type::PTR)?;
                self.encoder.store(ty.store_size(), Reg::RCX, 0, Reg::RAX)?;
                Ok(())
            }
            InstKind::Gep { base, offset } => {
                self.load_operand(Reg::RAX, *base, Type::PTR)?;
                self.load_operand(Reg::RCX, *offset, Type::I64)?;
                self.encoder.add_reg_reg(Reg::RAX, Reg::RCX)?;
                self.store_result(id, Reg::RAX)
            }
            InstKind::Cast { op, from, value } => {
                self.load_operand(Reg::RAX, *value, *from)?;
                if *op == CastOp::SExt {
                    self.encoder.sign_extend(Reg::RAX, width(*from))?;
                }
                self.encoder.zero_extend(Reg::RAX, width(inst.ty))?;
                self.store_result(id, Reg::RAX)
            }
            // The address is formed at each use.
            InstKind::Alloca { .. } => Ok(()),
            InstKind::Call { callee, args } => self.lower_call(id, inst, *callee, args),
            InstKind::Ret { value } => {
                if let Some(value) = value {
                    self.load_operand(SysVAssigner::RET_REG, *value, self.function.ret)?;
                }
                self.encoder.emit_epilogue()?;
                Ok(())
            }
            InstKind::Br { target } => {
                if *target != next {
                    self.encoder.jmp_to_block(target.index())?;
                }
                Ok(())
            }
            InstKind::CondBr {
                cond,
                then_block,
                else_block,
            } => {
                self.load_operand(Reg::RAX, *cond, Type::I1)?;
                self.encoder.test_reg_reg(Reg::RAX, Reg::RAX)?;
                if *then_block == next {
                    self.encoder.jcc_to_block(Condition::Equal, else_block.index())?;
                } else {
                    self.encoder.jcc_to_block(Condition::NotEqual, then_block.index())?;
                    if *else_block != next {
                        self.encoder.jmp_to_block(else_block.index())?;
                    }
                }
                Ok(())
            }
            InstKind::Unreachable => {
                self.encoder.ud2()?;
                Ok(())
            }
        }
    }

    fn lower_call(&mut self, id: InstId, inst: &Inst, callee: Operand, args: &[(Type, Operand)]) -> CompileResult<()> {
        if inst.ty == Type::F64 || args.iter().any(|(ty, _)| *ty == Type::F64) {
            return Err(CompileError::unsupported(
                "floating-point call arguments or results",
                Location::default(),
            ));
        }

        let mut cc = SysVAssigner::new();
        let assignments = cc.assign_all(args.len());
        let stack_args: Vec<usize> = (0..args.len()).filter(|&i| assignments[i].reg.is_none()).collect();

        // RSP is 16-byte aligned here; keep it aligned at the call.
        let padding = if stack_args.len() % 2 == 1 { 8 } else { 0 };
        if padding > 0 {
            self.encoder.sub_reg_imm(Reg::RSP, padding)?;
        }
        for &i in stack_args.iter().rev() {
            let (ty, op) = args[i];
            self.load_operand(Reg::RAX, op, ty)?;
            self.encoder.push_reg(Reg::RAX)?;
        }
        for (i, (ty, op)) in args.iter().enumerate() {
            if let Some(reg) = assignments[i].reg {
                self.load_operand(reg, *op, *ty)?;
            }
        }

        match callee {
            Operand::Func(f) => self.encoder.call_symbol(FixupTarget::Func(f))?,
            other => {
                self.load_operand(Reg::R11, other, Type::PTR)?;
                self.encoder.call_reg(Reg::R11)?;
            }
        }
        if let Operand::Func(f) = callee {
            log::trace!("x64: @{} calls @{}", self.function.name, self.module.func(f).name);
        }

        let cleanup = cc.get_stack_size() as i32 + padding;
        if cleanup > 0 {
            self.encoder.add_reg_imm(Reg::RSP, cleanup)?;
        }
        if !inst.ty.is_void() {
            self.encoder.zero_extend(SysVAssigner::RET_REG, width(inst.ty))?;
            self.store_result(id, SysVAssigner::RET_REG)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::parse_module;
    use crate::x64::FixupKind;
    use bumpalo::Bump;

    fn compile(src: &str, name: &str) -> CompileResult<EncodedFunction> {
        let module = parse_module(src).unwrap();
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let id = module.function_by_name(name).unwrap();
        let result = FunctionCodegen::new(&module, module.func(id), &arena)?.compile(&ctx);
        result
    }

    #[test]
    fn test_simple_function_codegen() {
        let encoded = compile(
            "define @add(i64 %a, i64 %b) -> i64 {\nentry:\n    %s = add i64 %a, %b\n    ret %s\n}\n",
            "add",
        )
        .unwrap();
        // push rbp; mov rbp, rsp
        assert_eq!(&encoded.code[..4], &[0x55, 0x48, 0x89, 0xE5]);
        // mov rsp, rbp; pop rbp; ret
        assert!(encoded.code.ends_with(&[0x48, 0x89, 0xEC, 0x5D, 0xC3]));
        assert!(encoded.fixups.is_empty());
    }

    #[test]
    fn test_calls_and_symbol_references() {
        let src = r#"
declare @callee(ptr, i64) -> i64
global @counter : zeroed 8
define @f() -> i64 {
entry:
    %r = call i64 @callee(ptr @counter, i64 7)
    ret %r
}
"#;
        let encoded = compile(src, "f").unwrap();
        assert_eq!(encoded.fixups.len(), 2);
        assert_eq!(encoded.fixups[0].kind, FixupKind::GotPcRelative);
        assert_eq!(encoded.fixups[0].target, FixupTarget::Global(crate::ir::GlobalId(0)));
        assert_eq!(encoded.fixups[1].kind, FixupKind::Call);
        assert_eq!(encoded.fixups[1].target, FixupTarget::Func(crate::ir::FuncId(0)));
        let call = encoded.fixups[1].offset as usize;
        assert_eq!(encoded.code[call - 1], 0xE8);
    }

    #[test]
    fn test_many_arguments() {
        let src = r#"
declare @sink(i64, i64, i64, i64, i64, i64, i64) -> void
define @f(i64 %a, i64 %b, i64 %c, i64 %d, i64 %e, i64 %g, i64 %h) -> void {
entry:
    call void @sink(i64 %a, i64 %b, i64 %c, i64 %d, i64 %e, i64 %g, i64 %h)
    ret
}
"#;
        let arena = Bump::new();
        let ctx = CompilationContext::new(&arena);
        let module = parse_module(src).unwrap();
        let id = module.function_by_name("f").unwrap();
        let encoded = FunctionCodegen::new(&module, module.func(id), &arena)
            .unwrap()
            .compile(&ctx)
            .unwrap();
        // sub rsp, 8 pads the single stack argument
        let pad = [0x48, 0x83, 0xEC, 0x08];
        assert!(encoded.code.windows(4).any(|w| w == pad));
        // add rsp, 16 after the call
        let cleanup = [0x48, 0x83, 0xC4, 0x10];
        assert!(encoded.code.windows(4).any(|w| w == cleanup));
        assert_eq!(ctx.stats().functions_compiled, 1);
        assert_eq!(ctx.stats().instruction_counts.get("call"), Some(&1));
    }

    #[test]
    fn test_float_arithmetic_is_unsupported() {
        let src = "define @f(ptr %p) -> void {\nentry:\n    %x = load f64, %p\n    %y = add f64 %x, %x\n    ret\n}\n";
        match compile(src, "f") {
            Err(CompileError::UnsupportedConstruct { location, .. }) => {
                assert_eq!(location.function.as_deref(), Some("f"));
                assert_eq!(location.inst, Some(1));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_literal_normalization() {
        assert_eq!(normalize_literal(-1, 8), 0xFF);
        assert_eq!(normalize_literal(-1, 1), 1);
        assert_eq!(normalize_literal(-1, 64), -1);
        assert_eq!(normalize_literal(0x1_0000_0005, 32), 5);
    }
}
