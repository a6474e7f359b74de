//! Turns an analyzed [`CodeBlock`] into a [`CompiledUnit`]: walks the ops, lets the guest
//! frontend emit code for each, and writes the block exits.

use log::trace;

use crate::arch::Architecture;
use crate::block::{CodeBlock, CodeOp};
use crate::block_cache::{CompiledUnit, ExitSite};
use crate::bytecode::{BytecodeEmitter, Label};
use crate::error::CompileError;
use crate::memory::Interpreter;
use crate::regcache::{EvictionPolicy, FlushMode, GuestReg, HostConfig, HostReg, RegCache, RegLayout};

pub type Inst<F> = <<F as Frontend>::Arch as Architecture>::Instruction;

/// A guest instruction set's code generator.
pub trait Frontend {
    type Arch: Architecture;
    type Eviction: EvictionPolicy + Default;

    fn arch(&self) -> &Self::Arch;
    fn reg_layout(&self) -> &RegLayout;
    fn host_config(&self) -> &HostConfig;
    /// Executes one instruction word when compiled code falls back to interpretation
    fn interpreter(&self) -> Interpreter;

    /// Emits code for one op. An `Err` must be returned before anything is emitted or taken
    /// from the register cache.
    fn compile_op(
        &mut self,
        ctx: &mut CompileContext<Self::Eviction>,
        op: &CodeOp<Inst<Self>>,
    ) -> Result<Emitted, CompileError>;
}

/// A branch condition held in a scratch register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Condition {
    pub reg: HostReg,
    /// Taken when the register is zero rather than non-zero
    pub taken_when_zero: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchTarget {
    Static(u32),
    /// A scratch register holding the destination
    Register(HostReg),
}

/// A control transfer whose exit the driver writes once the delay slot is compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingBranch {
    pub condition: Option<Condition>,
    pub target: BranchTarget,
    /// The delay slot only runs when the branch is taken
    pub likely: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emitted {
    Done,
    Branch(PendingBranch),
}

/// Host registers bound to one instruction's operands.
#[derive(Debug)]
pub struct Bound {
    pub dst: Option<HostReg>,
    pub srcs: Vec<HostReg>,
    taken: Vec<GuestReg>,
    dst_reg: Option<GuestReg>,
}

impl Bound {
    /// The destination's host register
    pub fn out(&self) -> HostReg {
        match self.dst {
            Some(host) => host,
            None => panic!("no destination register was bound"),
        }
    }
}

/// Codegen state for the unit being compiled.
pub struct CompileContext<P: EvictionPolicy> {
    pub regs: RegCache<P>,
    pub emit: BytecodeEmitter,
    start: u32,
    exits: Vec<(Label, Option<u32>)>,
    scratch: Vec<HostReg>,
    cycles: u32,
    terminated: bool,
}

impl<P: EvictionPolicy + Default> CompileContext<P> {
    pub fn new(layout: &RegLayout, config: &HostConfig, start: u32) -> Self {
        CompileContext {
            regs: RegCache::new(layout, config),
            emit: BytecodeEmitter::new(),
            start,
            exits: Vec::new(),
            scratch: Vec::new(),
            cycles: 0,
            terminated: false,
        }
    }
}

impl<P: EvictionPolicy> CompileContext<P> {
    pub fn start(&self) -> u32 {
        self.start
    }

    /// Cycles of the ops compiled so far, what an exit written now charges
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// A host register for temporaries, kept away from the register cache until released.
    pub fn scratch(&mut self) -> HostReg {
        let host = self.regs.get_free_host_reg(&mut self.emit);
        self.scratch.push(host);
        host
    }

    pub fn release_scratch(&mut self, host: HostReg) {
        self.regs.release(host);
        self.scratch.retain(|&h| h != host);
    }

    fn release_all_scratch(&mut self) {
        for host in std::mem::take(&mut self.scratch) {
            self.regs.release(host);
        }
    }

    /// Takes every source loaded and `dst` for writing. A register named more than once is
    /// taken once. Full-width registers only.
    pub fn bind(&mut self, dst: Option<GuestReg>, srcs: &[GuestReg]) -> Bound {
        let mut taken: Vec<(GuestReg, HostReg)> = Vec::new();
        let mut hosts = Vec::with_capacity(srcs.len());
        for &reg in srcs {
            let host = match taken.iter().find(|&&(r, _)| r == reg) {
                Some(&(_, host)) => host,
                None => {
                    let op = self.regs.get_location(&mut self.emit, reg, true);
                    assert!(op.full, "bind takes whole registers");
                    taken.push((reg, op.host));
                    op.host
                }
            };
            hosts.push(host);
        }
        let dst_host = dst.map(|reg| match taken.iter().find(|&&(r, _)| r == reg) {
            Some(&(_, host)) => host,
            None => {
                let op = self.regs.get_location(&mut self.emit, reg, false);
                assert!(op.full, "bind takes whole registers");
                taken.push((reg, op.host));
                op.host
            }
        });
        Bound {
            dst: dst_host,
            srcs: hosts,
            taken: taken.into_iter().map(|(reg, _)| reg).collect(),
            dst_reg: dst,
        }
    }

    pub fn unbind(&mut self, bound: Bound) {
        for reg in bound.taken {
            self.regs.put_back(reg, Some(reg) == bound.dst_reg);
        }
    }

    /// Emits, in far code, a path that writes back the guest state as it is right now and
    /// reports the pending fault for `pc`.
    pub fn fault_path(&mut self, pc: u32) -> Label {
        self.emit.switch_to_far();
        let label = self.emit.here();
        self.regs.flush_all(&mut self.emit, FlushMode::MaintainState);
        self.emit.fault_exit(pc);
        self.emit.switch_to_near();
        label
    }

    fn next_exit(&self) -> u16 {
        self.exits.len() as u16
    }

    /// Writes back everything and leaves for `target`.
    pub fn write_exit(&mut self, target: u32, idle: bool) {
        self.regs.flush_all(&mut self.emit, FlushMode::Full);
        let exit = self.next_exit();
        let label = self.emit.exit(target, self.cycles, exit, idle);
        self.exits.push((label, Some(target)));
        self.terminated = true;
    }

    /// Leaves for `target` when `condition` holds; otherwise compilation continues with the
    /// register state unchanged.
    pub fn write_exit_if(&mut self, condition: Condition, target: u32, idle: bool) {
        let skip = self.emit.jump_if(condition.reg, !condition.taken_when_zero);
        self.regs.flush_all(&mut self.emit, FlushMode::MaintainState);
        let exit = self.next_exit();
        let label = self.emit.exit(target, self.cycles, exit, idle);
        self.exits.push((label, Some(target)));
        self.emit.set_jump_target(skip);
    }

    /// Leaves for the address in `src`, which must be a scratch register.
    pub fn write_exit_indirect(&mut self, src: HostReg) {
        self.regs.flush_all(&mut self.emit, FlushMode::Full);
        let exit = self.next_exit();
        let label = self.emit.exit_indirect(src, self.cycles, exit);
        self.exits.push((label, None));
        self.terminated = true;
    }

    /// Runs `op` through the runtime interpreter: the guest context is brought up to date
    /// first and cached copies of whatever it writes are dropped afterwards.
    pub fn fallback_to_interpreter<I>(&mut self, word: u32, op: &CodeOp<I>) {
        self.regs.flush_all(&mut self.emit, FlushMode::KeepResident);
        for reg in op.regs_out.iter() {
            if reg < self.regs.layout().len() {
                self.regs.discard(reg);
            }
        }
        self.regs.save_caller_saved(&mut self.emit);
        let fault = self.fault_path(op.address);
        self.emit.interpret(word, op.address, fault);
        self.regs.restore_caller_saved(&mut self.emit);
    }

    fn into_unit<I>(self, block: &CodeBlock<I>, instruction_size: u32) -> CompiledUnit {
        let exits = self
            .exits
            .iter()
            .map(|&(label, target)| ExitSite { record: self.emit.resolve(label), target })
            .collect();
        CompiledUnit {
            start: block.start_address,
            code: self.emit.seal(),
            exits,
            extents: block.extents(instruction_size),
            cycles: block.cycles,
            instruction_count: block.instruction_count(),
        }
    }
}

/// Compiles a whole analyzed block.
pub fn compile<F: Frontend>(frontend: &mut F, block: &CodeBlock<Inst<F>>) -> Result<CompiledUnit, CompileError> {
    if block.is_empty() {
        return Err(CompileError::EmptyBlock(block.start_address));
    }
    let mut ctx = CompileContext::<F::Eviction>::new(frontend.reg_layout(), frontend.host_config(), block.start_address);
    ctx.regs.load_all(&mut ctx.emit);

    let ops = &block.ops;
    let mut i = 0;
    while i < ops.len() && !ctx.terminated {
        let op = &ops[i];
        i += 1;
        let Some(branch) = compile_one(frontend, &mut ctx, op)? else {
            continue;
        };
        let slot = if op.has_delay_slot() && i < ops.len() && ops[i].in_delay_slot {
            i += 1;
            Some(&ops[i - 1])
        } else {
            None
        };
        finish_branch(frontend, &mut ctx, block, op, branch, slot)?;
    }

    if !ctx.terminated {
        ctx.write_exit(block.next_address, false);
    }
    Ok(ctx.into_unit(block, <F::Arch as Architecture>::INSTRUCTION_SIZE))
}

/// Compiles one op, returning the branch it leaves pending.
fn compile_one<F: Frontend>(
    frontend: &mut F,
    ctx: &mut CompileContext<F::Eviction>,
    op: &CodeOp<Inst<F>>,
) -> Result<Option<PendingBranch>, CompileError> {
    ctx.cycles += op.cycles;
    if op.skip {
        return Ok(None);
    }
    trace!("{:#010x}: {}", op.address, frontend.arch().disassemble(&op.instruction, op.address));
    ctx.regs.set_live_hint(op.gpr_in_use);
    match frontend.compile_op(ctx, op)? {
        Emitted::Done => Ok(None),
        Emitted::Branch(branch) => Ok(Some(branch)),
    }
}

fn compile_delay_slot<F: Frontend>(
    frontend: &mut F,
    ctx: &mut CompileContext<F::Eviction>,
    slot: Option<&CodeOp<Inst<F>>>,
) -> Result<(), CompileError> {
    let Some(slot) = slot else {
        return Ok(());
    };
    if compile_one(frontend, ctx, slot)?.is_some() {
        return Err(CompileError::Unsupported { address: slot.address, name: slot.name });
    }
    Ok(())
}

fn finish_branch<F: Frontend>(
    frontend: &mut F,
    ctx: &mut CompileContext<F::Eviction>,
    block: &CodeBlock<Inst<F>>,
    op: &CodeOp<Inst<F>>,
    branch: PendingBranch,
    slot: Option<&CodeOp<Inst<F>>>,
) -> Result<(), CompileError> {
    let idle_target = |target: u32| op.is_idle_loop && target == block.start_address;

    match (branch.condition, branch.target) {
        (None, BranchTarget::Static(target)) => {
            compile_delay_slot(frontend, ctx, slot)?;
            if !op.followed {
                ctx.write_exit(target, idle_target(target));
            }
        }
        (None, BranchTarget::Register(host)) => {
            compile_delay_slot(frontend, ctx, slot)?;
            ctx.write_exit_indirect(host);
        }
        (Some(condition), BranchTarget::Static(target)) if branch.likely => {
            // Not taken: skip the delay slot and keep compiling under the state from before it
            let not_taken = ctx.emit.jump_if(condition.reg, !condition.taken_when_zero);
            let rest = ctx.regs.fork();
            let cycles = ctx.cycles;
            if let Err(error) = compile_delay_slot(frontend, ctx, slot) {
                rest.discard_arm();
                return Err(error);
            }
            ctx.write_exit(target, idle_target(target));
            let taken = std::mem::replace(&mut ctx.regs, rest);
            drop(taken);
            ctx.regs.continue_unmerged();
            ctx.cycles = cycles;
            ctx.terminated = false;
            ctx.emit.set_jump_target(not_taken);
        }
        (Some(condition), BranchTarget::Static(target)) => {
            compile_delay_slot(frontend, ctx, slot)?;
            ctx.write_exit_if(condition, target, idle_target(target));
        }
        (Some(_), BranchTarget::Register(_)) => {
            return Err(CompileError::Unsupported { address: op.address, name: op.name });
        }
    }
    ctx.release_all_scratch();
    Ok(())
}

/// A unit that runs only the first instruction of `block` through the interpreter. For when
/// the frontend cannot compile the block.
pub fn compile_interpreted<F: Frontend>(
    frontend: &F,
    block: &CodeBlock<Inst<F>>,
) -> Result<CompiledUnit, CompileError> {
    let Some(op) = block.ops.first() else {
        return Err(CompileError::EmptyBlock(block.start_address));
    };
    if op.transfers_control() {
        return Err(CompileError::Unsupported { address: op.address, name: op.name });
    }
    let size = <F::Arch as Architecture>::INSTRUCTION_SIZE;
    let word = frontend.arch().encoding(&op.instruction);

    let mut ctx = CompileContext::<F::Eviction>::new(frontend.reg_layout(), frontend.host_config(), op.address);
    ctx.regs.load_all(&mut ctx.emit);
    ctx.cycles = op.cycles;
    ctx.fallback_to_interpreter(word, op);
    ctx.write_exit(op.address.wrapping_add(size), false);

    let mut single = CodeBlock::new(op.address, 0, 0);
    single.ops.push(op.clone());
    single.cycles = op.cycles;
    Ok(ctx.into_unit(&single, size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::{Analyzer, AnalyzerOptions};
    use crate::bytecode::{Exit, Runtime};
    use crate::memory::{GuestContext, GuestMemory};
    use crate::testing::*;

    fn build(words: &[u32], options: AnalyzerOptions) -> (CompiledUnit, VecMemory) {
        let mut memory = VecMemory::from_words(words);
        memory.bytes.resize(0x400, 0);
        let mut frontend = ToyFrontend::new();
        let block = Analyzer::new(options).analyze(&ToyArch, &mut memory, 0, 32);
        let unit = compile(&mut frontend, &block).unwrap();
        (unit, memory)
    }

    fn run(unit: &CompiledUnit, memory: &mut VecMemory, ctx: &mut GuestContext) -> Exit {
        let frontend = ToyFrontend::new();
        let mut rt = Runtime::new(ctx, memory, toy_interpreter, frontend.host_config());
        let exit = unit.code.execute(&mut rt);
        assert!(rt.save_area.is_empty());
        exit
    }

    #[test]
    fn straight_line_block() {
        let (unit, mut memory) = build(
            &[enc(LI, 1, 0, 5), enc(LI, 2, 0, 7), enc(ADD, 3, 1, 2), enc(B, 0, 0, 0x40)],
            AnalyzerOptions::empty(),
        );
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        ctx.downcount = 100;

        let exit = run(&unit, &mut memory, &mut ctx);
        assert_eq!(exit, Exit::Jump { pc: 0x100, exit: 0, link: None });
        assert_eq!(ctx.regs[1..4], [5, 7, 12]);
        assert_eq!(ctx.pc, 0x100);
        assert_eq!(ctx.downcount, 96);
        assert_eq!(unit.exits, vec![ExitSite { record: unit.exits[0].record, target: Some(0x100) }]);
        assert_eq!(unit.extents, vec![0..16]);
    }

    #[test]
    fn conditional_branch_evaluates_before_its_delay_slot() {
        // bnzd r1 -> 0x40 with a delay slot that clears r1
        let (unit, mut memory) = build(
            &[enc(BNZD, 0, 1, 0x10), enc(LI, 1, 0, 0), enc(LI, 2, 0, 9), enc(B, 0, 0, 0x20)],
            AnalyzerOptions::CONDITIONAL_CONTINUE,
        );

        let mut taken = GuestContext::new(TOY_SLOTS, 0);
        taken.regs[1] = 3;
        assert_eq!(run(&unit, &mut memory, &mut taken), Exit::Jump { pc: 0x40, exit: 0, link: None });
        assert_eq!(taken.regs[1], 0);
        assert_eq!(taken.regs[2], 0);

        let mut fallthrough = GuestContext::new(TOY_SLOTS, 0);
        assert_eq!(run(&unit, &mut memory, &mut fallthrough), Exit::Jump { pc: 0x80, exit: 1, link: None });
        assert_eq!(fallthrough.regs[2], 9);
    }

    #[test]
    fn interpreter_fallback_keeps_cached_values() {
        // addc goes through the interpreter; r1 and r2 stay cached across the call
        let (unit, mut memory) = build(
            &[enc(LI, 1, 0, 2), enc(LI, 2, 0, 3), enc(ADDC, 3, 1, 2), enc(ADD, 4, 1, 2), enc(ADD, 5, 3, 3), enc(B, 0, 0, 0)],
            AnalyzerOptions::empty(),
        );
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        run(&unit, &mut memory, &mut ctx);
        assert_eq!(ctx.regs[3], 6);
        assert_eq!(ctx.regs[4], 5);
        assert_eq!(ctx.regs[5], 12);
    }

    #[test]
    fn memory_fault_writes_back_state() {
        let (unit, mut memory) = build(
            &[enc(LI, 1, 0, 0x55), enc(LI, 3, 0x10, 0), enc(LD, 2, 3, 0), enc(LI, 4, 0, 1), enc(B, 0, 0, 0)],
            AnalyzerOptions::empty(),
        );
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        ctx.regs[2] = 0x77;
        let exit = run(&unit, &mut memory, &mut ctx);
        assert_eq!(exit, Exit::MemoryFault { pc: 8, address: 0x1000 });
        assert_eq!(ctx.regs[1], 0x55);
        assert_eq!(ctx.regs[2], 0x77);
        assert_eq!(ctx.regs[3], 0x1000);
        assert_eq!(ctx.regs[4], 0);
        assert_eq!(ctx.pc, 8);
    }

    #[test]
    fn guest_exception_from_the_interpreter() {
        let (unit, mut memory) = build(&[enc(LI, 1, 0, 1), enc(SYS, 0, 0, 0)], AnalyzerOptions::empty());
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        let exit = run(&unit, &mut memory, &mut ctx);
        assert_eq!(exit, Exit::Exception(crate::error::GuestException { code: TOY_SYSCALL, pc: 4 }));
        assert_eq!(ctx.regs[1], 1);
    }

    #[test]
    fn indirect_return_is_never_linked() {
        let (unit, mut memory) = build(&[enc(RET, 0, 0, 0)], AnalyzerOptions::empty());
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        ctx.regs[LINK_REG] = 0x123;
        assert_eq!(run(&unit, &mut memory, &mut ctx), Exit::Jump { pc: 0x123, exit: 0, link: None });
        assert_eq!(unit.exits[0].target, None);
    }

    #[test]
    fn followed_branch_writes_no_exit() {
        let mut words = vec![enc(LI, 1, 0, 4), enc(B, 0, 0, 8), enc(NOP, 0, 0, 0)];
        words.resize(8, enc(NOP, 0, 0, 0));
        words.extend([enc(ADD, 1, 1, 1), enc(RET, 0, 0, 0)]);
        let (unit, mut memory) = build(&words, AnalyzerOptions::BRANCH_FOLLOW);
        assert_eq!(unit.exits.len(), 1);
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        run(&unit, &mut memory, &mut ctx);
        assert_eq!(ctx.regs[1], 8);
    }

    #[test]
    fn idle_loop_exit_skips_ahead() {
        // ld r1, [r2]; bnzd r1 -> 0 with a nop in the slot
        let (unit, mut memory) = build(
            &[enc(LD, 1, 2, 0x40), enc(BNZD, 0, 1, 0), enc(NOP, 0, 0, 0)],
            AnalyzerOptions::empty(),
        );
        memory.write_u32(0x40, 1).unwrap();
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        ctx.downcount = 1000;
        assert_eq!(run(&unit, &mut memory, &mut ctx), Exit::Jump { pc: 0, exit: 0, link: None });
        assert_eq!(ctx.downcount, 0);
    }

    #[test]
    fn disassembly_lists_every_record() {
        let (unit, _) = build(&[enc(LI, 1, 0, 5), enc(LD, 2, 1, 0), enc(B, 0, 0, 0)], AnalyzerOptions::empty());
        let mut text = String::new();
        let count = unit.code.disassemble(&mut text).unwrap();
        assert_eq!(count, unit.code.len());
        assert!(text.contains("li "));
        assert!(text.contains("ldw"));
        assert!(text.contains("exit    0x00000000"));
        assert!(text.contains("fault   0x00000004"));
    }

    #[test]
    fn interpreted_fallback_unit() {
        let mut memory = VecMemory::from_words(&[enc(SUBC, 1, 2, 3)]);
        let frontend = ToyFrontend::new();
        let block = Analyzer::default().analyze(&ToyArch, &mut memory, 0, 1);
        let unit = compile_interpreted(&frontend, &block).unwrap();
        let mut ctx = GuestContext::new(TOY_SLOTS, 0);
        ctx.regs[2] = 10;
        ctx.regs[3] = 4;
        assert_eq!(run(&unit, &mut memory, &mut ctx), Exit::Jump { pc: 4, exit: 0, link: None });
        assert_eq!(ctx.regs[1], 6);

        let mut memory = VecMemory::from_words(&[enc(B, 0, 0, 0)]);
        let block = Analyzer::default().analyze(&ToyArch, &mut memory, 0, 1);
        assert!(compile_interpreted(&frontend, &block).is_err());
    }
}
