use std::ops::Range;

use crate::arch::{FlagGroups, OpFlags, OpInfo};
use crate::regset::RegSet;

/// One analyzed guest instruction.
#[derive(Debug, Clone)]
pub struct CodeOp<I> {
    pub instruction: I,
    pub address: u32,
    pub name: &'static str,
    pub flags: OpFlags,
    pub branch_target: Option<u32>,
    /// Some other instruction of the same block branches here
    pub is_branch_target: bool,
    pub regs_in: RegSet,
    pub regs_out: RegSet,
    pub fregs_in: RegSet,
    pub fregs_out: RegSet,
    pub wants_flags: FlagGroups,
    pub sets_flags: FlagGroups,
    /// Flag groups this op produces that a later op (or a block exit) still needs
    pub flags_in_use: FlagGroups,
    pub can_end_block: bool,
    pub can_cause_exception: bool,
    pub in_delay_slot: bool,
    /// An unconditional branch the analyzer followed; it produces no exit
    pub followed: bool,
    /// Neutralized by the analyzer (a branch inside a delay slot)
    pub skip: bool,
    pub is_idle_loop: bool,
    /// GPRs whose current value is read later in the block before being overwritten
    pub gpr_in_use: RegSet,
    pub fpr_in_use: RegSet,
    pub cycles: u32,
}

impl<I> CodeOp<I> {
    pub fn new(instruction: I, address: u32, info: &OpInfo) -> Self {
        CodeOp {
            instruction,
            address,
            name: info.name,
            flags: info.flags,
            branch_target: info.branch_target,
            is_branch_target: false,
            regs_in: info.regs_in,
            regs_out: info.regs_out,
            fregs_in: info.fregs_in,
            fregs_out: info.fregs_out,
            wants_flags: info.flags_in,
            sets_flags: info.flags_out,
            flags_in_use: FlagGroups::empty(),
            can_end_block: info.can_end_block(),
            can_cause_exception: info.may_except(),
            in_delay_slot: false,
            followed: false,
            skip: false,
            is_idle_loop: false,
            gpr_in_use: RegSet::EMPTY,
            fpr_in_use: RegSet::EMPTY,
            cycles: info.cycles,
        }
    }

    pub fn is_conditional(&self) -> bool {
        self.flags.contains(OpFlags::CONDITIONAL)
    }

    pub fn has_delay_slot(&self) -> bool {
        self.flags.contains(OpFlags::DELAY_SLOT)
    }

    /// A branch, jump, call or return, as opposed to an op that only ends the block by
    /// raising an exception
    pub fn transfers_control(&self) -> bool {
        self.branch_target.is_some()
            || self.flags.intersects(OpFlags::CONDITIONAL | OpFlags::DELAY_SLOT | OpFlags::CALL | OpFlags::RETURN)
    }
}

/// Per-register usage positions within a block, indexed by instruction position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRegStats {
    first_read: Vec<Option<usize>>,
    first_write: Vec<Option<usize>>,
    last_read: Vec<Option<usize>>,
    last_write: Vec<Option<usize>>,
    read_count: Vec<u32>,
    write_count: Vec<u32>,
}

impl BlockRegStats {
    pub fn new(count: usize) -> Self {
        BlockRegStats {
            first_read: vec![None; count],
            first_write: vec![None; count],
            last_read: vec![None; count],
            last_write: vec![None; count],
            read_count: vec![0; count],
            write_count: vec![0; count],
        }
    }

    /// Number of registers tracked
    pub fn len(&self) -> usize {
        self.read_count.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_count.is_empty()
    }

    pub fn record_read(&mut self, reg: usize, index: usize) {
        self.first_read[reg].get_or_insert(index);
        self.last_read[reg] = Some(index);
        self.read_count[reg] += 1;
    }

    pub fn record_write(&mut self, reg: usize, index: usize) {
        self.first_write[reg].get_or_insert(index);
        self.last_write[reg] = Some(index);
        self.write_count[reg] += 1;
    }

    pub fn first_read(&self, reg: usize) -> Option<usize> { self.first_read[reg] }
    pub fn first_write(&self, reg: usize) -> Option<usize> { self.first_write[reg] }
    pub fn last_read(&self, reg: usize) -> Option<usize> { self.last_read[reg] }
    pub fn last_write(&self, reg: usize) -> Option<usize> { self.last_write[reg] }
    pub fn read_count(&self, reg: usize) -> u32 { self.read_count[reg] }
    pub fn write_count(&self, reg: usize) -> u32 { self.write_count[reg] }

    pub fn is_used(&self, reg: usize) -> bool {
        self.read_count[reg] + self.write_count[reg] != 0
    }

    pub fn use_count(&self, reg: usize) -> u32 {
        self.read_count[reg] + self.write_count[reg]
    }

    /// Distance between the first and last touch of `reg`
    pub fn use_range(&self, reg: usize) -> usize {
        let first = match (self.first_read[reg], self.first_write[reg]) {
            (Some(r), Some(w)) => r.min(w),
            (Some(x), None) | (None, Some(x)) => x,
            (None, None) => return 0,
        };
        let last = self.last_read[reg].max(self.last_write[reg]).unwrap_or(first);
        last - first
    }

    /// Read before any write in the block, so the value comes from outside
    pub fn is_input(&self, reg: usize) -> bool {
        match (self.first_read[reg], self.first_write[reg]) {
            (Some(r), Some(w)) => r <= w,
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// The result of analyzing one guest basic block.
#[derive(Debug, Clone)]
pub struct CodeBlock<I> {
    pub start_address: u32,
    pub ops: Vec<CodeOp<I>>,
    /// Where execution continues when the block falls through
    pub next_address: u32,
    pub is_function_entry: bool,
    pub is_function_exit: bool,
    pub had_memory_exception: bool,
    /// Ended because of the size limit, not a block-ending instruction
    pub broken: bool,
    pub gpr_stats: BlockRegStats,
    pub fpr_stats: BlockRegStats,
    pub gpr_inputs: RegSet,
    pub fpr_inputs: RegSet,
    pub cycles: u32,
}

impl<I> CodeBlock<I> {
    pub fn new(start_address: u32, gprs: usize, fprs: usize) -> Self {
        CodeBlock {
            start_address,
            ops: Vec::new(),
            next_address: start_address,
            is_function_entry: false,
            is_function_exit: false,
            had_memory_exception: false,
            broken: false,
            gpr_stats: BlockRegStats::new(gprs),
            fpr_stats: BlockRegStats::new(fprs),
            gpr_inputs: RegSet::EMPTY,
            fpr_inputs: RegSet::EMPTY,
            cycles: 0,
        }
    }

    pub fn instruction_count(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Guest address ranges covered by the block's instructions, merged where contiguous.
    pub fn extents(&self, instruction_size: u32) -> Vec<Range<u32>> {
        let mut addresses: Vec<u32> = self.ops.iter().map(|op| op.address).collect();
        addresses.sort_unstable();
        addresses.dedup();

        let mut extents: Vec<Range<u32>> = Vec::new();
        for address in addresses {
            // The last word of the address space ends the range at u32::MAX
            let end = address.saturating_add(instruction_size);
            match extents.last_mut() {
                Some(last) if last.end == address => last.end = end,
                _ => extents.push(address..end),
            }
        }
        extents
    }
}
