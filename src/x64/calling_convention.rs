// This module implements the System V AMD64 calling convention for the freestand code
// generator. CCAssigner and SysVAssigner decide where arguments and return values live: the
// first six integer or pointer arguments pass in RDI, RSI, RDX, RCX, R8 and R9, the rest go on
// the stack in 8-byte slots, and results return in RAX. Every value in this IR is an integer or
// pointer of at most 64 bits, so only the general-purpose bank is modeled and a result always
// fits one register. FunctionFrame lays out the stack frame of one function: an 8-byte home
// slot per parameter and per instruction result, plus a fixed area per stack allocation,
// addressed relative to RBP and padded so RSP stays 16-byte aligned at call sites.

//! System V x86-64 calling convention implementation.

use bumpalo::{collections::Vec as BumpVec, Bump};

use super::encoder::Reg;

/// Argument assignment result from calling convention analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CCAssignment {
    /// Size of the argument in bytes.
    pub size: u32,
    /// Assigned register (if any).
    pub reg: Option<Reg>,
    /// Offset in the outgoing argument area (if assigned to stack).
    pub stack_off: Option<u32>,
}

impl CCAssignment {
    pub fn new(size: u32) -> Self {
        Self {
            size,
            reg: None,
            stack_off: None,
        }
    }
}

/// Trait for calling convention argument assignment.
pub trait CCAssigner {
    /// Assign an argument according to the calling convention.
    fn assign_arg(&mut self, arg: &mut CCAssignment);

    /// Bytes of stack used by arguments so far, unaligned.
    fn get_stack_size(&self) -> u32;
}

/// System V x86-64 calling convention assigner.
#[derive(Debug, Default)]
pub struct SysVAssigner {
    gp_cnt: usize,
    stack: u32,
}

impl SysVAssigner {
    /// System V x86-64 GP argument registers.
    pub const GP_ARG_REGS: [Reg; 6] = [Reg::RDI, Reg::RSI, Reg::RDX, Reg::RCX, Reg::R8, Reg::R9];

    /// Every result fits one register.
    pub const RET_REG: Reg = Reg::RAX;

    pub fn new() -> Self {
        Self::default()
    }

    /// Assign `count` pointer-sized arguments in order.
    pub fn assign_all(&mut self, count: usize) -> Vec<CCAssignment> {
        (0..count)
            .map(|_| {
                let mut arg = CCAssignment::new(8);
                self.assign_arg(&mut arg);
                arg
            })
            .collect()
    }
}

impl CCAssigner for SysVAssigner {
    fn assign_arg(&mut self, arg: &mut CCAssignment) {
        if self.gp_cnt < Self::GP_ARG_REGS.len() {
            arg.reg = Some(Self::GP_ARG_REGS[self.gp_cnt]);
            self.gp_cnt += 1;
        } else {
            // Each stack slot is 8 bytes in System V.
            arg.stack_off = Some(self.stack);
            self.stack += 8;
        }
    }

    fn get_stack_size(&self) -> u32 {
        self.stack
    }
}

/// Stack frame of one function.
///
/// ```text
/// rbp + 16 + 8*i: stack-passed argument i
/// rbp + 8:        return address
/// rbp:            saved rbp
/// rbp - X:        parameter and value slots, stack allocations
/// ```
#[derive(Debug)]
pub struct FunctionFrame<'a> {
    /// Home slot of each parameter, relative to RBP.
    pub param_slots: BumpVec<'a, i32>,
    /// Home slot of each instruction result, indexed by instruction id.
    pub value_slots: BumpVec<'a, Option<i32>>,
    /// Start of the area reserved by each `alloca`, indexed by instruction id.
    pub alloca_areas: BumpVec<'a, Option<i32>>,
    /// Total size of the stack frame below RBP, 16-byte aligned.
    pub frame_size: u32,
    /// Lowest offset handed out so far.
    spill_offset: i32,
}

impl<'a> FunctionFrame<'a> {
    pub fn new(arena: &'a Bump, insts: usize) -> Self {
        let mut value_slots = BumpVec::with_capacity_in(insts, arena);
        value_slots.resize(insts, None);
        let mut alloca_areas = BumpVec::with_capacity_in(insts, arena);
        alloca_areas.resize(insts, None);
        Self {
            param_slots: BumpVec::new_in(arena),
            value_slots,
            alloca_areas,
            frame_size: 0,
            spill_offset: 0,
        }
    }

    /// Allocate a slot of `size` bytes (rounded up to 8) and return its
    /// offset from RBP.
    pub fn allocate_slot(&mut self, size: u32) -> i32 {
        let aligned_size = size.max(1).div_ceil(8) * 8;
        self.spill_offset -= aligned_size as i32;
        self.spill_offset
    }

    /// Round the frame up so that RSP is 16-byte aligned after the prologue.
    pub fn calculate_frame_size(&mut self) {
        self.frame_size = ((-self.spill_offset) as u32).div_ceil(16) * 16;
    }

    /// RBP-relative offset of stack-passed incoming argument `stack_off`.
    pub fn incoming_arg(stack_off: u32) -> i32 {
        16 + stack_off as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    #[test]
    fn test_sysv_gp_argument_assignment() {
        let mut assigner = SysVAssigner::new();
        let args = assigner.assign_all(8);
        for (i, arg) in args.iter().take(6).enumerate() {
            assert_eq!(arg.reg, Some(SysVAssigner::GP_ARG_REGS[i]));
            assert!(arg.stack_off.is_none());
        }
        assert_eq!(args[6].reg, None);
        assert_eq!(args[6].stack_off, Some(0));
        assert_eq!(args[7].stack_off, Some(8));
        assert_eq!(assigner.get_stack_size(), 16);
    }

    #[test]
    fn test_sysv_stack_only_after_registers_run_out() {
        let mut assigner = SysVAssigner::new();
        let first = assigner.assign_all(6);
        assert!(first.iter().all(|arg| arg.stack_off.is_none()));
        assert_eq!(assigner.get_stack_size(), 0);
        let mut arg = CCAssignment::new(8);
        assigner.assign_arg(&mut arg);
        assert!(arg.reg.is_none());
        assert_eq!(arg.stack_off, Some(0));
    }

    #[test]
    fn test_function_frame_slots() {
        let arena = Bump::new();
        let mut frame = FunctionFrame::new(&arena, 4);
        let slot1 = frame.allocate_slot(8);
        let slot2 = frame.allocate_slot(4);
        let area = frame.allocate_slot(20);
        assert_eq!(slot1, -8);
        assert_eq!(slot2, -16);
        assert_eq!(area, -40);
        frame.calculate_frame_size();
        assert_eq!(frame.frame_size, 48);
        assert_eq!(frame.value_slots.len(), 4);
        assert_eq!(FunctionFrame::incoming_arg(8), 24);
    }
}
