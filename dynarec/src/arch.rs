//! What the core needs to know about a guest instruction set.

use std::fmt;

use bitflags::bitflags;

use crate::error::MemoryFault;
use crate::memory::GuestMemory;
use crate::regset::RegSet;

/// Largest number of registers one instruction may read, across all register files.
pub const MAX_REGS_IN: usize = 4;
/// Largest number of registers one instruction may write, across all register files.
pub const MAX_REGS_OUT: usize = 2;

bitflags! {
    /// Condition-flag groups an instruction reads or writes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FlagGroups: u8 {
        const CARRY = 1 << 0;
        const COMPARE = 1 << 1;
        const OVERFLOW = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpFlags: u16 {
        /// May transfer control out of the straight-line sequence
        const END_BLOCK = 1 << 0;
        /// The transfer depends on a runtime condition
        const CONDITIONAL = 1 << 1;
        /// The following instruction executes before the transfer takes effect
        const DELAY_SLOT = 1 << 2;
        /// The delay slot is only executed when the branch is taken
        const LIKELY = 1 << 3;
        /// May raise a guest exception
        const EXCEPTION = 1 << 4;
        /// Must stay in program order relative to its neighbours
        const NO_REORDER = 1 << 5;
        const STORE = 1 << 6;
        /// Writes a return address
        const CALL = 1 << 7;
        const RETURN = 1 << 8;
    }
}

/// Static metadata for one decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpInfo {
    pub name: &'static str,
    pub regs_in: RegSet,
    pub regs_out: RegSet,
    pub fregs_in: RegSet,
    pub fregs_out: RegSet,
    pub flags_in: FlagGroups,
    pub flags_out: FlagGroups,
    pub flags: OpFlags,
    pub branch_target: Option<u32>,
    pub cycles: u32,
}

impl OpInfo {
    pub fn new(name: &'static str) -> Self {
        OpInfo { name, cycles: 1, ..Default::default() }
    }

    pub fn reads(mut self, reg: usize) -> Self {
        self.regs_in.insert(reg);
        self
    }

    pub fn writes(mut self, reg: usize) -> Self {
        self.regs_out.insert(reg);
        self
    }

    pub fn reads_fpr(mut self, reg: usize) -> Self {
        self.fregs_in.insert(reg);
        self
    }

    pub fn writes_fpr(mut self, reg: usize) -> Self {
        self.fregs_out.insert(reg);
        self
    }

    pub fn with_flags(mut self, flags: OpFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn flag_groups(mut self, read: FlagGroups, written: FlagGroups) -> Self {
        self.flags_in |= read;
        self.flags_out |= written;
        self
    }

    pub fn target(mut self, address: u32) -> Self {
        self.branch_target = Some(address);
        self
    }

    pub fn cycles(mut self, cycles: u32) -> Self {
        self.cycles = cycles;
        self
    }

    pub fn can_end_block(&self) -> bool {
        self.flags.contains(OpFlags::END_BLOCK)
    }

    pub fn may_except(&self) -> bool {
        self.flags.contains(OpFlags::EXCEPTION)
    }

    fn check_bounds(&self) {
        debug_assert!(
            self.regs_in.len() + self.fregs_in.len() <= MAX_REGS_IN,
            "{} reads too many registers", self.name
        );
        debug_assert!(
            self.regs_out.len() + self.fregs_out.len() <= MAX_REGS_OUT,
            "{} writes too many registers", self.name
        );
    }
}

/// A guest instruction set with fixed-width encodings.
pub trait Architecture {
    type Instruction: Copy + fmt::Debug;

    /// Registers in the general-purpose file, including any extra cached registers
    const GPR_COUNT: usize;
    const FPR_COUNT: usize;
    const INSTRUCTION_SIZE: u32;

    fn decode(&self, memory: &mut dyn GuestMemory, address: u32) -> Result<Self::Instruction, MemoryFault>;

    fn info(&self, inst: &Self::Instruction, address: u32) -> OpInfo;

    /// The raw encoding, handed to the runtime interpreter fallback
    fn encoding(&self, inst: &Self::Instruction) -> u32;

    fn disassemble(&self, inst: &Self::Instruction, address: u32) -> String;

    /// `info` with the register count limits checked in debug builds
    fn checked_info(&self, inst: &Self::Instruction, address: u32) -> OpInfo {
        let info = self.info(inst, address);
        info.check_bounds();
        info
    }
}
