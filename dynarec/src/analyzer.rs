//! Turns a run of guest instructions into a [`CodeBlock`]: discovers the block end, reorders
//! adjacent instructions to bring flag producers next to their consumers, and computes
//! per-instruction register liveness.

use std::collections::{BTreeSet, HashSet};

use bitflags::bitflags;
use log::{debug, trace, warn};

use crate::arch::{Architecture, FlagGroups, OpFlags};
use crate::block::{CodeBlock, CodeOp};
use crate::memory::GuestMemory;
use crate::regset::RegSet;

/// How many unconditional branches a single block may follow
pub const BRANCH_FOLLOW_LIMIT: usize = 2;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AnalyzerOptions: u32 {
        /// Keep going past conditional branches instead of ending the block
        const CONDITIONAL_CONTINUE = 1 << 0;
        /// Move compares next to the branch that reads them
        const BRANCH_MERGE = 1 << 1;
        /// Move carry producers and consumers next to each other
        const CARRY_MERGE = 1 << 2;
        /// Continue the block at the target of unconditional direct branches
        const BRANCH_FOLLOW = 1 << 3;
    }
}

impl Default for AnalyzerOptions {
    fn default() -> Self {
        AnalyzerOptions::all()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReorderKind {
    Carry,
    Compare,
}

/// What happens once the delay slot of the previous instruction has been added
#[derive(Debug, Clone, Copy)]
enum AfterSlot {
    End,
    Continue,
    Follow(u32),
}

#[derive(Debug, Clone, Default)]
pub struct Analyzer {
    options: AnalyzerOptions,
    function_entries: BTreeSet<u32>,
}

impl Analyzer {
    pub fn new(options: AnalyzerOptions) -> Self {
        Analyzer {
            options,
            function_entries: BTreeSet::new(),
        }
    }

    pub fn options(&self) -> AnalyzerOptions {
        self.options
    }

    pub fn set_options(&mut self, options: AnalyzerOptions) {
        self.options = options;
    }

    /// Call targets seen so far; blocks starting at one are function entries
    pub fn mark_function_entry(&mut self, address: u32) {
        self.function_entries.insert(address);
    }

    pub fn is_function_entry(&self, address: u32) -> bool {
        self.function_entries.contains(&address)
    }

    pub fn analyze<A: Architecture>(
        &mut self,
        arch: &A,
        memory: &mut dyn GuestMemory,
        start: u32,
        max_instructions: usize,
    ) -> CodeBlock<A::Instruction> {
        let max_instructions = max_instructions.max(1);
        let size = A::INSTRUCTION_SIZE;
        let mut block = CodeBlock::new(start, A::GPR_COUNT, A::FPR_COUNT);

        let mut address = start;
        let mut after_slot: Option<AfterSlot> = None;
        let mut follows = 0;
        let mut found_exit = false;

        loop {
            if after_slot.is_none() && block.ops.len() >= max_instructions {
                break;
            }

            let inst = match arch.decode(memory, address) {
                Ok(inst) => inst,
                Err(fault) => {
                    debug!("analysis of {start:#010x} stopped: {fault}");
                    if after_slot.is_some() {
                        // A branch can't be compiled without its delay slot
                        if let Some(branch) = block.ops.pop() {
                            address = branch.address;
                        }
                    }
                    if block.ops.is_empty() {
                        block.had_memory_exception = true;
                    }
                    break;
                }
            };

            let info = arch.checked_info(&inst, address);
            let mut op = CodeOp::new(inst, address, &info);
            let next = address.wrapping_add(size);

            if let Some(then) = after_slot.take() {
                op.in_delay_slot = true;
                if op.can_end_block {
                    warn!("{address:#010x}: {} in a delay slot is ignored", op.name);
                    neutralize(&mut op);
                }
                block.ops.push(op);
                match then {
                    AfterSlot::End => {
                        address = next;
                        found_exit = true;
                        break;
                    }
                    AfterSlot::Continue => address = next,
                    AfterSlot::Follow(target) => address = target,
                }
                continue;
            }

            if op.flags.contains(OpFlags::CALL) {
                if let Some(target) = op.branch_target {
                    self.function_entries.insert(target);
                }
            }

            if !op.can_end_block {
                block.ops.push(op);
                address = next;
                continue;
            }

            let follow_target = op.branch_target.filter(|_| {
                self.options.contains(AnalyzerOptions::BRANCH_FOLLOW)
                    && !op.is_conditional()
                    && follows < BRANCH_FOLLOW_LIMIT
                    && max_instructions > 1
            });

            if let Some(target) = follow_target {
                trace!("{address:#010x}: following {} to {target:#010x}", op.name);
                follows += 1;
                op.followed = true;
                if op.has_delay_slot() {
                    after_slot = Some(AfterSlot::Follow(target));
                    address = next;
                } else {
                    address = target;
                }
            } else if op.is_conditional() && self.options.contains(AnalyzerOptions::CONDITIONAL_CONTINUE) {
                if op.has_delay_slot() {
                    after_slot = Some(AfterSlot::Continue);
                }
                address = next;
            } else if op.has_delay_slot() {
                after_slot = Some(AfterSlot::End);
                address = next;
            } else {
                block.ops.push(op);
                address = next;
                found_exit = true;
                break;
            }
            block.ops.push(op);
        }

        block.next_address = address;
        block.broken = !found_exit;
        if block.ops.is_empty() {
            return block;
        }

        if block.ops.len() > 1 {
            self.reorder(&mut block.ops);
        }
        self.finish(&mut block);

        debug!(
            "analyzed {start:#010x}: {} instructions, next {:#010x}{}",
            block.ops.len(),
            block.next_address,
            if block.broken { " (broken)" } else { "" }
        );
        block
    }

    fn reorder<I>(&self, ops: &mut [CodeOp<I>]) {
        if self.options.contains(AnalyzerOptions::CARRY_MERGE) {
            // Bubble towards each other; one direction is often not enough to pair them up
            reorder_core(ops, false, ReorderKind::Carry);
            reorder_core(ops, true, ReorderKind::Carry);
        }
        if self.options.contains(AnalyzerOptions::BRANCH_MERGE) {
            reorder_core(ops, false, ReorderKind::Compare);
        }
    }

    fn finish<I>(&self, block: &mut CodeBlock<I>) {
        let targets: HashSet<u32> = block.ops.iter().filter_map(|op| op.branch_target).collect();

        for (index, op) in block.ops.iter_mut().enumerate() {
            op.is_branch_target = targets.contains(&op.address);
            for reg in op.regs_in.iter() {
                block.gpr_stats.record_read(reg, index);
            }
            for reg in op.regs_out.iter() {
                block.gpr_stats.record_write(reg, index);
            }
            for reg in op.fregs_in.iter() {
                block.fpr_stats.record_read(reg, index);
            }
            for reg in op.fregs_out.iter() {
                block.fpr_stats.record_write(reg, index);
            }
            block.cycles += op.cycles;
        }

        block.gpr_inputs = (0..block.gpr_stats.len())
            .filter(|&reg| block.gpr_stats.is_input(reg))
            .collect();
        block.fpr_inputs = (0..block.fpr_stats.len())
            .filter(|&reg| block.fpr_stats.is_input(reg))
            .collect();

        compute_liveness(&mut block.ops);

        block.is_function_entry = self.function_entries.contains(&block.start_address);
        block.is_function_exit = block
            .ops
            .iter()
            .rev()
            .find(|op| !op.in_delay_slot)
            .map_or(false, |op| op.flags.contains(OpFlags::RETURN));

        if let Some(branch) = busy_wait_branch(block) {
            debug!("{:#010x}: idle loop", block.start_address);
            block.ops[branch].is_idle_loop = true;
        }
    }
}

/// Turns an instruction into one that has no effect besides its cycle cost
fn neutralize<I>(op: &mut CodeOp<I>) {
    op.skip = true;
    op.can_end_block = false;
    op.can_cause_exception = false;
    op.branch_target = None;
    op.flags = OpFlags::empty();
    op.regs_in = RegSet::EMPTY;
    op.regs_out = RegSet::EMPTY;
    op.fregs_in = RegSet::EMPTY;
    op.fregs_out = RegSet::EMPTY;
    op.wants_flags = FlagGroups::empty();
    op.sets_flags = FlagGroups::empty();
}

/// Backward pass: what is still needed after each instruction.
fn compute_liveness<I>(ops: &mut [CodeOp<I>]) {
    let mut gprs = RegSet::EMPTY;
    let mut fprs = RegSet::EMPTY;
    // The next block may read any flag
    let mut flags = FlagGroups::all();

    for op in ops.iter_mut().rev() {
        if op.can_end_block {
            flags = FlagGroups::all();
        }
        op.gpr_in_use = gprs;
        op.fpr_in_use = fprs;
        op.flags_in_use = flags & op.sets_flags;

        gprs = (gprs - op.regs_out) | op.regs_in;
        fprs = (fprs - op.fregs_out) | op.fregs_in;
        flags = (flags - op.sets_flags) | op.wants_flags;
        if op.can_cause_exception {
            // The exception handler observes the flags as they were before this op
            flags = FlagGroups::all();
        }
    }
}

/// Whether `a` followed by `b` may be executed as `b` followed by `a`.
pub fn can_swap_adjacent<I>(a: &CodeOp<I>, b: &CodeOp<I>) -> bool {
    if a.can_cause_exception || b.can_cause_exception {
        return false;
    }
    if a.can_end_block || b.can_end_block {
        return false;
    }
    if a.in_delay_slot || b.in_delay_slot || a.skip || b.skip {
        return false;
    }
    if (a.flags | b.flags).contains(OpFlags::NO_REORDER) {
        return false;
    }
    let a_touches = a.wants_flags | a.sets_flags;
    let b_touches = b.wants_flags | b.sets_flags;
    if a_touches.intersects(b_touches) {
        return false;
    }

    // b writes one of a's inputs, a writes one of b's inputs, or both write the same register
    if b.regs_out.intersects(a.regs_in) || a.regs_out.intersects(b.regs_in) || a.regs_out.intersects(b.regs_out) {
        return false;
    }
    if b.fregs_out.intersects(a.fregs_in)
        || a.fregs_out.intersects(b.fregs_in)
        || a.fregs_out.intersects(b.fregs_out)
    {
        return false;
    }
    true
}

fn reorder_core<I>(ops: &mut [CodeOp<I>], reverse: bool, kind: ReorderKind) {
    let count = ops.len() as isize;
    let start = if reverse { count - 1 } else { 0 };
    let end = if reverse { 0 } else { count - 1 };
    let increment: isize = if reverse { -1 } else { 1 };

    let mut i = start;
    let mut next = start;
    let mut go_backwards = false;

    loop {
        if go_backwards {
            i -= increment;
            go_backwards = false;
        } else {
            i = next;
            next += increment;
        }

        if i == end {
            break;
        }

        let a = &ops[i as usize];
        let b = &ops[(i + increment) as usize];

        let candidate = match kind {
            ReorderKind::Carry => a.sets_flags.contains(FlagGroups::CARRY),
            ReorderKind::Compare => a.sets_flags.contains(FlagGroups::COMPARE),
        };
        if !candidate {
            continue;
        }

        if kind == ReorderKind::Carry && i != start {
            // Once next to another carry op, stay there
            let previous = &ops[(i - increment) as usize];
            if (previous.wants_flags | previous.sets_flags).contains(FlagGroups::CARRY) {
                continue;
            }
        }

        if can_swap_adjacent(a, b) {
            ops.swap(i as usize, (i + increment) as usize);
            if i != start {
                // The op we just moved may unlock a swap for its new neighbour
                go_backwards = true;
            }
        }
    }
}

/// Index of the branch closing a loop that cannot make progress without outside help.
///
/// The loop must branch back to the block start, contain no stores or other branches, and
/// only read registers it wrote earlier in the same iteration (or never writes them).
fn busy_wait_branch<I>(block: &CodeBlock<I>) -> Option<usize> {
    let mut write_disallowed = RegSet::EMPTY;
    let mut written = RegSet::EMPTY;
    let mut branch = None;

    for (index, op) in block.ops.iter().enumerate() {
        if branch.is_some() && !op.in_delay_slot {
            return None;
        }
        if op.flags.intersects(OpFlags::STORE | OpFlags::NO_REORDER | OpFlags::CALL) || op.followed {
            return None;
        }
        if op.can_end_block {
            if op.branch_target != Some(block.start_address) {
                return None;
            }
            branch = Some(index);
        }
        write_disallowed |= op.regs_in - written;
        if write_disallowed.intersects(op.regs_out) {
            return None;
        }
        written |= op.regs_out;
    }
    branch
}
