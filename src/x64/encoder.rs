// This module provides x86-64 instruction encoding for the freestand code generator using the
// iced-x86 CodeAssembler. X64Encoder converts Reg references into machine code for the
// instruction shapes the stack-slot code generator needs: sized moves between registers and
// frame memory (with zero and sign extension), integer arithmetic and shifts, comparisons with
// SETcc materialization, block labels for forward and backward jumps, and the System V
// prologue/epilogue. References to other symbols are emitted as fixed-size placeholders
// (CALL rel32 and LEA reg, [RIP+disp32]) whose positions are recovered after assembly through
// the block encoder's instruction offsets, so the object writer can attach relocations to
// exactly the displacement bytes.

//! x86-64 instruction encoding using iced-x86.

use iced_x86::code_asm::{registers::cl, *};
use iced_x86::BlockEncoderOptions;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use super::{CodeFixup, FixupKind, FixupTarget};
use crate::core::error::CompileError;

/// Error types for instruction encoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Invalid register for operation")]
    InvalidRegister,
    #[error("Unsupported operand width {0}")]
    UnsupportedWidth(u32),
    #[error("Assembly error: {0}")]
    AssemblyError(String),
}

impl From<IcedError> for EncodingError {
    fn from(e: IcedError) -> Self {
        EncodingError::AssemblyError(e.to_string())
    }
}

impl From<EncodingError> for CompileError {
    fn from(e: EncodingError) -> Self {
        CompileError::codegen(e.to_string())
    }
}

/// General-purpose register, numbered as in the ModRM encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reg(pub u8);

impl Reg {
    pub const RAX: Reg = Reg(0);
    pub const RCX: Reg = Reg(1);
    pub const RDX: Reg = Reg(2);
    pub const RSP: Reg = Reg(4);
    pub const RBP: Reg = Reg(5);
    pub const RSI: Reg = Reg(6);
    pub const RDI: Reg = Reg(7);
    pub const R8: Reg = Reg(8);
    pub const R9: Reg = Reg(9);
    pub const R11: Reg = Reg(11);

    fn needs_rex(self) -> bool {
        self.0 >= 8
    }
}

const GP64_REGS: [AsmRegister64; 16] = [
    rax, rcx, rdx, rbx, rsp, rbp, rsi, rdi, r8, r9, r10, r11, r12, r13, r14, r15,
];
const GP32_REGS: [AsmRegister32; 16] = [
    eax, ecx, edx, ebx, esp, ebp, esi, edi, r8d, r9d, r10d, r11d, r12d, r13d, r14d, r15d,
];
const GP16_REGS: [AsmRegister16; 16] = [
    ax, cx, dx, bx, sp, bp, si, di, r8w, r9w, r10w, r11w, r12w, r13w, r14w, r15w,
];
const GP8_REGS: [AsmRegister8; 16] = [
    al, cl, dl, bl, spl, bpl, sil, dil, r8b, r9b, r10b, r11b, r12b, r13b, r14b, r15b,
];

/// Condition codes used by SETcc and Jcc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Below,
    BelowEqual,
    Above,
    AboveEqual,
}

/// A placeholder whose displacement gets a relocation.
struct PendingFixup {
    /// Index of the placeholder in the assembler's instruction list.
    inst: usize,
    /// Byte offset of the displacement inside the placeholder.
    field: u64,
    target: FixupTarget,
    kind: FixupKind,
}

/// Machine code for one function plus the relocations it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFunction {
    pub code: Vec<u8>,
    pub fixups: Vec<CodeFixup>,
}

/// x86-64 instruction encoder using iced-x86.
pub struct X64Encoder {
    assembler: CodeAssembler,
    /// Labels for basic blocks to enable forward and backward jumps.
    block_labels: HashMap<usize, CodeLabel>,
    placed_blocks: HashSet<usize>,
    /// Instruction count when the most recent label was placed.
    label_at: Option<usize>,
    fixups: Vec<PendingFixup>,
}

impl X64Encoder {
    pub fn new() -> Result<Self, EncodingError> {
        Ok(Self {
            assembler: CodeAssembler::new(64)?,
            block_labels: HashMap::new(),
            placed_blocks: HashSet::new(),
            label_at: None,
            fixups: Vec::new(),
        })
    }

    fn gp64(reg: Reg) -> Result<AsmRegister64, EncodingError> {
        GP64_REGS.get(reg.0 as usize).copied().ok_or(EncodingError::InvalidRegister)
    }

    fn gp32(reg: Reg) -> Result<AsmRegister32, EncodingError> {
        GP32_REGS.get(reg.0 as usize).copied().ok_or(EncodingError::InvalidRegister)
    }

    fn gp16(reg: Reg) -> Result<AsmRegister16, EncodingError> {
        GP16_REGS.get(reg.0 as usize).copied().ok_or(EncodingError::InvalidRegister)
    }

    fn gp8(reg: Reg) -> Result<AsmRegister8, EncodingError> {
        GP8_REGS.get(reg.0 as usize).copied().ok_or(EncodingError::InvalidRegister)
    }

    // ==== MOVES ====

    pub fn mov_reg_reg(&mut self, dst: Reg, src: Reg) -> Result<(), EncodingError> {
        self.assembler.mov(Self::gp64(dst)?, Self::gp64(src)?)?;
        Ok(())
    }

    pub fn mov_reg_imm(&mut self, dst: Reg, imm: i64) -> Result<(), EncodingError> {
        if imm == 0 {
            let dst = Self::gp32(dst)?;
            self.assembler.xor(dst, dst)?;
        } else {
            self.assembler.mov(Self::gp64(dst)?, imm)?;
        }
        Ok(())
    }

    /// Load `bytes` from `[base + offset]`, zero-extending to 64 bits.
    pub fn load(&mut self, bytes: u32, dst: Reg, base: Reg, offset: i32) -> Result<(), EncodingError> {
        let base = Self::gp64(base)?;
        match bytes {
            1 => self.assembler.movzx(Self::gp32(dst)?, byte_ptr(base + offset))?,
            2 => self.assembler.movzx(Self::gp32(dst)?, word_ptr(base + offset))?,
            4 => self.assembler.mov(Self::gp32(dst)?, dword_ptr(base + offset))?,
            8 => self.assembler.mov(Self::gp64(dst)?, qword_ptr(base + offset))?,
            other => return Err(EncodingError::UnsupportedWidth(other * 8)),
        }
        Ok(())
    }

    /// Store the low `bytes` of `src` to `[base + offset]`.
    pub fn store(&mut self, bytes: u32, base: Reg, offset: i32, src: Reg) -> Result<(), EncodingError> {
        let base = Self::gp64(base)?;
        match bytes {
            1 => self.assembler.mov(byte_ptr(base + offset), Self::gp8(src)?)?,
            2 => self.assembler.mov(word_ptr(base + offset), Self::gp16(src)?)?,
            4 => self.assembler.mov(dword_ptr(base + offset), Self::gp32(src)?)?,
            8 => self.assembler.mov(qword_ptr(base + offset), Self::gp64(src)?)?,
            other => return Err(EncodingError::UnsupportedWidth(other * 8)),
        }
        Ok(())
    }

    /// `lea dst, [base + offset]`
    pub fn lea(&mut self, dst: Reg, base: Reg, offset: i32) -> Result<(), EncodingError> {
        self.assembler.lea(Self::gp64(dst)?, qword_ptr(Self::gp64(base)? + offset))?;
        Ok(())
    }

    /// Clear everything above the low `bits` of `reg`.
    pub fn zero_extend(&mut self, reg: Reg, bits: u32) -> Result<(), EncodingError> {
        match bits {
            64 => {}
            32 => {
                let r = Self::gp32(reg)?;
                self.assembler.mov(r, r)?;
            }
            16 => self.assembler.movzx(Self::gp32(reg)?, Self::gp16(reg)?)?,
            8 => self.assembler.movzx(Self::gp32(reg)?, Self::gp8(reg)?)?,
            1 => self.assembler.and(Self::gp32(reg)?, 1)?,
            other => return Err(EncodingError::UnsupportedWidth(other)),
        }
        Ok(())
    }

    /// Replicate bit `bits - 1` of `reg` into the upper bits.
    pub fn sign_extend(&mut self, reg: Reg, bits: u32) -> Result<(), EncodingError> {
        let r64 = Self::gp64(reg)?;
        match bits {
            64 => {}
            32 => self.assembler.movsxd(r64, Self::gp32(reg)?)?,
            16 => self.assembler.movsx(r64, Self::gp16(reg)?)?,
            8 => self.assembler.movsx(r64, Self::gp8(reg)?)?,
            1 => {
                self.assembler.shl(r64, 63)?;
                self.assembler.sar(r64, 63)?;
            }
            other => return Err(EncodingError::UnsupportedWidth(other)),
        }
        Ok(())
    }

    // ==== ARITHMETIC ====

    pub fn add_reg_reg(&mut self, dst: Reg, src: Reg) -> Result<(), EncodingError> {
        self.assembler.add(Self::gp64(dst)?, Self::gp64(src)?)?;
        Ok(())
    }

    pub fn add_reg_imm(&mut self, dst: Reg, imm: i32) -> Result<(), EncodingError> {
        self.assembler.add(Self::gp64(dst)?, imm)?;
        Ok(())
    }

    pub fn sub_reg_reg(&mut self, dst: Reg, src: Reg) -> Result<(), EncodingError> {
        self.assembler.sub(Self::gp64(dst)?, Self::gp64(src)?)?;
        Ok(())
    }

    pub fn sub_reg_imm(&mut self, dst: Reg, imm: i32) -> Result<(), EncodingError> {
        self.assembler.sub(Self::gp64(dst)?, imm)?;
        Ok(())
    }

    /// IMUL with two operands: `dst = dst * src`.
    pub fn imul_reg_reg(&mut self, dst: Reg, src: Reg) -> Result<(), EncodingError> {
        self.assembler.imul_2(Self::gp64(dst)?, Self::gp64(src)?)?;
        Ok(())
    }

    pub fn and_reg_reg(&mut self, dst: Reg, src: Reg) -> Result<(), EncodingError> {
        self.assembler.and(Self::gp64(dst)?, Self::gp64(src)?)?;
        Ok(())
    }

    pub fn or_reg_reg(&mut self, dst: Reg, src: Reg) -> Result<(), EncodingError> {
        self.assembler.or(Self::gp64(dst)?, Self::gp64(src)?)?;
        Ok(())
    }

    pub fn xor_reg_reg(&mut self, dst: Reg, src: Reg) -> Result<(), EncodingError> {
        self.assembler.xor(Self::gp64(dst)?, Self::gp64(src)?)?;
        Ok(())
    }

    /// Shifts take their count in CL.
    pub fn shl_reg_cl(&mut self, dst: Reg) -> Result<(), EncodingError> {
        self.assembler.shl(Self::gp64(dst)?, cl)?;
        Ok(())
    }

    pub fn shr_reg_cl(&mut self, dst: Reg) -> Result<(), EncodingError> {
        self.assembler.shr(Self::gp64(dst)?, cl)?;
        Ok(())
    }

    pub fn sar_reg_cl(&mut self, dst: Reg) -> Result<(), EncodingError> {
        self.assembler.sar(Self::gp64(dst)?, cl)?;
        Ok(())
    }

    // ==== COMPARISONS ====

    pub fn cmp_reg_reg(&mut self, left: Reg, right: Reg) -> Result<(), EncodingError> {
        self.assembler.cmp(Self::gp64(left)?, Self::gp64(right)?)?;
        Ok(())
    }

    pub fn test_reg_reg(&mut self, left: Reg, right: Reg) -> Result<(), EncodingError> {
        self.assembler.test(Self::gp64(left)?, Self::gp64(right)?)?;
        Ok(())
    }

    /// SETcc into the low byte of `dst`, then zero-extend the byte.
    pub fn set_condition(&mut self, condition: Condition, dst: Reg) -> Result<(), EncodingError> {
        let byte = Self::gp8(dst)?;
        match condition {
            Condition::Equal => self.assembler.sete(byte)?,
            Condition::NotEqual => self.assembler.setne(byte)?,
            Condition::Less => self.assembler.setl(byte)?,
            Condition::LessEqual => self.assembler.setle(byte)?,
            Condition::Greater => self.assembler.setg(byte)?,
            Condition::GreaterEqual => self.assembler.setge(byte)?,
            Condition::Below => self.assembler.setb(byte)?,
            Condition::BelowEqual => self.assembler.setbe(byte)?,
            Condition::Above => self.assembler.seta(byte)?,
            Condition::AboveEqual => self.assembler.setae(byte)?,
        }
        self.assembler.movzx(Self::gp32(dst)?, byte)?;
        Ok(())
    }

    // ==== STACK ====

    pub fn push_reg(&mut self, reg: Reg) -> Result<(), EncodingError> {
        self.assembler.push(Self::gp64(reg)?)?;
        Ok(())
    }

    pub fn pop_reg(&mut self, reg: Reg) -> Result<(), EncodingError> {
        self.assembler.pop(Self::gp64(reg)?)?;
        Ok(())
    }

    // ==== CONTROL FLOW ====

    pub fn ret(&mut self) -> Result<(), EncodingError> {
        self.assembler.ret()?;
        Ok(())
    }

    pub fn ud2(&mut self) -> Result<(), EncodingError> {
        self.assembler.ud2()?;
        Ok(())
    }

    pub fn call_reg(&mut self, reg: Reg) -> Result<(), EncodingError> {
        self.assembler.call(Self::gp64(reg)?)?;
        Ok(())
    }

    /// `call rel32` to a symbol, resolved by a PLT-relative relocation.
    pub fn call_symbol(&mut self, target: FixupTarget) -> Result<(), EncodingError> {
        self.placeholder(&[0xE8, 0, 0, 0, 0], 1, target, FixupKind::Call)
    }

    /// `lea dst, [rip + disp32]` with the displacement relocated to `target`.
    pub fn lea_symbol(&mut self, dst: Reg, target: FixupTarget) -> Result<(), EncodingError> {
        let rex = 0x48 | if dst.needs_rex() { 0x04 } else { 0 };
        let modrm = 0x05 | ((dst.0 & 7) << 3);
        self.placeholder(&[rex, 0x8D, modrm, 0, 0, 0, 0], 3, target, FixupKind::PcRelative)
    }

    /// `mov dst, [rip + disp32]` loading the address of `target` from its GOT entry.
    pub fn load_symbol_got(&mut self, dst: Reg, target: FixupTarget) -> Result<(), EncodingError> {
        let rex = 0x48 | if dst.needs_rex() { 0x04 } else { 0 };
        let modrm = 0x05 | ((dst.0 & 7) << 3);
        self.placeholder(&[rex, 0x8B, modrm, 0, 0, 0, 0], 3, target, FixupKind::GotPcRelative)
    }

    fn placeholder(
        &mut self,
        bytes: &[u8],
        field: u64,
        target: FixupTarget,
        kind: FixupKind,
    ) -> Result<(), EncodingError> {
        let inst = self.assembler.instructions().len();
        self.assembler.db(bytes)?;
        self.fixups.push(PendingFixup {
            inst,
            field,
            target,
            kind,
        });
        Ok(())
    }

    pub fn get_or_create_label_for_block(&mut self, block_id: usize) -> CodeLabel {
        if let Some(&label) = self.block_labels.get(&block_id) {
            label
        } else {
            let label = self.assembler.create_label();
            self.block_labels.insert(block_id, label);
            label
        }
    }

    /// Place a label for a basic block at the current position.
    pub fn place_label_for_block(&mut self, block_id: usize) -> Result<(), EncodingError> {
        // Two labels may not share an instruction.
        let count = self.assembler.instructions().len();
        if self.label_at == Some(count) {
            self.assembler.nop()?;
        }
        let mut label = self.get_or_create_label_for_block(block_id);
        self.assembler.set_label(&mut label)?;
        self.label_at = Some(self.assembler.instructions().len());
        self.placed_blocks.insert(block_id);
        Ok(())
    }

    pub fn jmp_to_block(&mut self, target_block: usize) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_block(target_block);
        self.assembler.jmp(label)?;
        Ok(())
    }

    pub fn jcc_to_block(&mut self, condition: Condition, target_block: usize) -> Result<(), EncodingError> {
        let label = self.get_or_create_label_for_block(target_block);
        match condition {
            Condition::Equal => self.assembler.je(label)?,
            Condition::NotEqual => self.assembler.jne(label)?,
            Condition::Less => self.assembler.jl(label)?,
            Condition::LessEqual => self.assembler.jle(label)?,
            Condition::Greater => self.assembler.jg(label)?,
            Condition::GreaterEqual => self.assembler.jge(label)?,
            Condition::Below => self.assembler.jb(label)?,
            Condition::BelowEqual => self.assembler.jbe(label)?,
            Condition::Above => self.assembler.ja(label)?,
            Condition::AboveEqual => self.assembler.jae(label)?,
        }
        Ok(())
    }

    // ==== FRAME ====

    /// `push rbp; mov rbp, rsp; sub rsp, frame_size`
    pub fn emit_prologue(&mut self, frame_size: u32) -> Result<(), EncodingError> {
        self.push_reg(Reg::RBP)?;
        self.mov_reg_reg(Reg::RBP, Reg::RSP)?;
        if frame_size > 0 {
            self.sub_reg_imm(Reg::RSP, frame_size as i32)?;
        }
        Ok(())
    }

    /// `mov rsp, rbp; pop rbp; ret`
    pub fn emit_epilogue(&mut self) -> Result<(), EncodingError> {
        self.mov_reg_reg(Reg::RSP, Reg::RBP)?;
        self.pop_reg(Reg::RBP)?;
        self.ret()
    }

    /// Assemble at offset zero and resolve placeholder positions.
    pub fn finalize(mut self) -> Result<EncodedFunction, EncodingError> {
        let unplaced: Vec<usize> = self
            .block_labels
            .keys()
            .filter(|block| !self.placed_blocks.contains(block))
            .copied()
            .collect();
        if !unplaced.is_empty() {
            return Err(EncodingError::AssemblyError(format!(
                "jump to unplaced blocks {unplaced:?}"
            )));
        }
        if self.label_at == Some(self.assembler.instructions().len()) {
            self.assembler.ud2()?;
        }

        let result = self
            .assembler
            .assemble_options(0, BlockEncoderOptions::RETURN_NEW_INSTRUCTION_OFFSETS)?;
        let offsets = &result.inner.new_instruction_offsets;
        let mut fixups = Vec::with_capacity(self.fixups.len());
        for pending in &self.fixups {
            let start = offsets.get(pending.inst).copied().ok_or_else(|| {
                EncodingError::AssemblyError("placeholder was not encoded".into())
            })?;
            fixups.push(CodeFixup {
                offset: u64::from(start) + pending.field,
                target: pending.target,
                kind: pending.kind,
            });
        }
        Ok(EncodedFunction {
            code: result.inner.code_buffer,
            fixups,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FuncId, GlobalId};

    #[test]
    fn test_basic_instructions() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.mov_reg_reg(Reg::RAX, Reg::RCX).unwrap();
        encoder.add_reg_reg(Reg::RAX, Reg::RDX).unwrap();
        encoder.ret().unwrap();
        let encoded = encoder.finalize().unwrap();
        // mov rax, rcx; add rax, rdx; ret
        assert_eq!(encoded.code, vec![0x48, 0x89, 0xC8, 0x48, 0x01, 0xD0, 0xC3]);
        assert!(encoded.fixups.is_empty());
    }

    #[test]
    fn placeholders_report_displacement_offsets() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.emit_prologue(16).unwrap();
        encoder.call_symbol(FixupTarget::Func(FuncId(3))).unwrap();
        encoder.lea_symbol(Reg::R11, FixupTarget::Global(GlobalId(1))).unwrap();
        encoder.load_symbol_got(Reg::RAX, FixupTarget::Global(GlobalId(2))).unwrap();
        encoder.emit_epilogue().unwrap();
        let encoded = encoder.finalize().unwrap();

        // push rbp (1) + mov rbp, rsp (3) + sub rsp, 16 (4)
        assert_eq!(encoded.fixups[0].offset, 9);
        assert_eq!(encoded.fixups[0].kind, FixupKind::Call);
        assert_eq!(&encoded.code[8..13], &[0xE8, 0, 0, 0, 0]);
        assert_eq!(encoded.fixups[1].offset, 16);
        assert_eq!(&encoded.code[13..16], &[0x4C, 0x8D, 0x1D]);
        assert_eq!(encoded.fixups[2].offset, 23);
        assert_eq!(encoded.fixups[2].kind, FixupKind::GotPcRelative);
        assert_eq!(&encoded.code[20..23], &[0x48, 0x8B, 0x05]);
    }

    #[test]
    fn consecutive_labels_get_separate_instructions() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.place_label_for_block(0).unwrap();
        encoder.place_label_for_block(1).unwrap();
        encoder.jmp_to_block(0).unwrap();
        let encoded = encoder.finalize().unwrap();
        // nop; jmp short -3
        assert_eq!(encoded.code, vec![0x90, 0xEB, 0xFD]);
    }

    #[test]
    fn jump_to_missing_block_is_an_error() {
        let mut encoder = X64Encoder::new().unwrap();
        encoder.jmp_to_block(7).unwrap();
        assert!(encoder.finalize().is_err());
    }
}
