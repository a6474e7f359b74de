//! The VR4300 code generator.
//!
//! Integer ALU ops, HI/LO moves, loads, stores, branches and DIV/DIVU are compiled. The
//! multiplies, the trapping adds and everything touching COP1 go through the interpreter.

use dynarec::block::CodeOp;
use dynarec::bytecode::{AluOp, MemSize};
use dynarec::compiler::{BranchTarget, Condition, PendingBranch};
use dynarec::regcache::{DeadFirst, Emitter, GuestReg, HostConfig, RegLayout};
use dynarec::{CompileContext, CompileError, Emitted, Frontend, Interpreter};

use crate::instructions::{Instruction, Op, Vr4300, GPR_SLOTS, HI, LO, MIPS_REG_NAMES, RA};
use crate::interpreter::interpret;

type Ctx = CompileContext<DeadFirst>;

pub struct Recompiler {
    arch: Vr4300,
    layout: RegLayout,
    host: HostConfig,
}

impl Recompiler {
    /// Eight host registers, the upper four preserved across interpreter calls
    pub fn new() -> Recompiler {
        let mut layout = RegLayout::new();
        for (i, &name) in MIPS_REG_NAMES.iter().chain(&["hi", "lo"]).enumerate() {
            layout = layout.primary(name, i as u16, 64);
        }
        debug_assert_eq!(layout.len(), GPR_SLOTS);
        Recompiler { arch: Vr4300, layout, host: HostConfig::new(8, &[4, 5, 6, 7]) }
    }
}

impl Default for Recompiler {
    fn default() -> Self {
        Recompiler::new()
    }
}

impl Frontend for Recompiler {
    type Arch = Vr4300;
    type Eviction = DeadFirst;

    fn arch(&self) -> &Vr4300 {
        &self.arch
    }

    fn reg_layout(&self) -> &RegLayout {
        &self.layout
    }

    fn host_config(&self) -> &HostConfig {
        &self.host
    }

    fn interpreter(&self) -> Interpreter {
        interpret
    }

    fn compile_op(&mut self, ctx: &mut Ctx, op: &CodeOp<Instruction>) -> Result<Emitted, CompileError> {
        let inst = op.instruction;
        let (rs, rt, rd) = (inst.rs(), inst.rt(), inst.rd());
        let sa = inst.sa() as u64;
        let simm = inst.simm() as i64 as u64;
        let zimm = inst.imm() as u64;
        let link = op.address.wrapping_add(8) as i32 as i64 as u64;
        let target = inst.branch_target(op.address);

        match inst.op() {
            Op::Sll => alu_imm(ctx, AluOp::Sll32, rd, rt, sa),
            Op::Srl => alu_imm(ctx, AluOp::Srl32, rd, rt, sa),
            Op::Sra => alu_imm(ctx, AluOp::Sra32, rd, rt, sa),
            Op::Dsll => alu_imm(ctx, AluOp::Sll64, rd, rt, sa),
            Op::Dsrl => alu_imm(ctx, AluOp::Srl64, rd, rt, sa),
            Op::Dsra => alu_imm(ctx, AluOp::Sra64, rd, rt, sa),
            Op::Dsll32 => alu_imm(ctx, AluOp::Sll64, rd, rt, sa + 32),
            Op::Dsrl32 => alu_imm(ctx, AluOp::Srl64, rd, rt, sa + 32),
            Op::Dsra32 => alu_imm(ctx, AluOp::Sra64, rd, rt, sa + 32),
            // Shift amount in rs
            Op::Sllv => alu(ctx, AluOp::Sll32, rd, rt, rs),
            Op::Srlv => alu(ctx, AluOp::Srl32, rd, rt, rs),
            Op::Srav => alu(ctx, AluOp::Sra32, rd, rt, rs),
            Op::Dsllv => alu(ctx, AluOp::Sll64, rd, rt, rs),
            Op::Dsrlv => alu(ctx, AluOp::Srl64, rd, rt, rs),
            Op::Dsrav => alu(ctx, AluOp::Sra64, rd, rt, rs),

            Op::Addu => alu(ctx, AluOp::Add32, rd, rs, rt),
            Op::Subu => alu(ctx, AluOp::Sub32, rd, rs, rt),
            Op::Daddu => alu(ctx, AluOp::Add64, rd, rs, rt),
            Op::Dsubu => alu(ctx, AluOp::Sub64, rd, rs, rt),
            Op::And => alu(ctx, AluOp::And, rd, rs, rt),
            Op::Or => alu(ctx, AluOp::Or, rd, rs, rt),
            Op::Xor => alu(ctx, AluOp::Xor, rd, rs, rt),
            Op::Nor => alu(ctx, AluOp::Nor, rd, rs, rt),
            Op::Slt => alu(ctx, AluOp::Slt, rd, rs, rt),
            Op::Sltu => alu(ctx, AluOp::Sltu, rd, rs, rt),
            Op::Addiu => alu_imm(ctx, AluOp::Add32, rt, rs, simm),
            Op::Daddiu => alu_imm(ctx, AluOp::Add64, rt, rs, simm),
            Op::Slti => alu_imm(ctx, AluOp::Slt, rt, rs, simm),
            Op::Sltiu => alu_imm(ctx, AluOp::Sltu, rt, rs, simm),
            Op::Andi => alu_imm(ctx, AluOp::And, rt, rs, zimm),
            Op::Ori => alu_imm(ctx, AluOp::Or, rt, rs, zimm),
            Op::Xori => alu_imm(ctx, AluOp::Xor, rt, rs, zimm),
            Op::Lui => set_imm(ctx, rt, (zimm << 16) as u32 as i32 as i64 as u64),

            Op::Mfhi => mov(ctx, rd, HI),
            Op::Mflo => mov(ctx, rd, LO),
            Op::Mthi => mov(ctx, HI, rs),
            Op::Mtlo => mov(ctx, LO, rs),
            Op::Div => divide(ctx, op, AluOp::DivS32, AluOp::RemS32),
            Op::Divu => divide(ctx, op, AluOp::DivU32, AluOp::RemU32),

            Op::Lb => load(ctx, op, MemSize::Byte, true),
            Op::Lbu => load(ctx, op, MemSize::Byte, false),
            Op::Lh => load(ctx, op, MemSize::Half, true),
            Op::Lhu => load(ctx, op, MemSize::Half, false),
            Op::Lw => load(ctx, op, MemSize::Word, true),
            Op::Lwu => load(ctx, op, MemSize::Word, false),
            Op::Sb => store(ctx, op, MemSize::Byte),
            Op::Sh => store(ctx, op, MemSize::Half),
            Op::Sw => store(ctx, op, MemSize::Word),
            Op::Sync | Op::Cache => {}

            Op::J => return Ok(jump(None, BranchTarget::Static(inst.jump_target(op.address)), false)),
            Op::Jal => {
                set_imm(ctx, RA, link);
                return Ok(jump(None, BranchTarget::Static(inst.jump_target(op.address)), false));
            }
            Op::Jr | Op::Jalr => {
                // The target is read before the link is written, for `jalr $ra, $ra`
                let dest = ctx.scratch();
                ctx.regs.read_into(&mut ctx.emit, rs, dest, false);
                if inst.op() == Op::Jalr {
                    set_imm(ctx, rd, link);
                }
                return Ok(jump(None, BranchTarget::Register(dest), false));
            }
            Op::Beq | Op::Bne | Op::Beql | Op::Bnel => {
                let compare = if matches!(inst.op(), Op::Beq | Op::Beql) { AluOp::Eq } else { AluOp::Ne };
                let condition = condition(ctx, compare, rs, Some(rt), false);
                let likely = matches!(inst.op(), Op::Beql | Op::Bnel);
                return Ok(jump(Some(condition), BranchTarget::Static(target), likely));
            }
            Op::Blez | Op::Bgtz | Op::Blezl | Op::Bgtzl => {
                // rs > 0, inverted for the "less or equal" forms
                let inverted = matches!(inst.op(), Op::Blez | Op::Blezl);
                let condition = condition(ctx, AluOp::Sgt, rs, None, inverted);
                let likely = matches!(inst.op(), Op::Blezl | Op::Bgtzl);
                return Ok(jump(Some(condition), BranchTarget::Static(target), likely));
            }
            Op::Bltz | Op::Bgez | Op::Bltzl | Op::Bgezl | Op::Bltzal | Op::Bgezal => {
                let inverted = matches!(inst.op(), Op::Bgez | Op::Bgezl | Op::Bgezal);
                let condition = condition(ctx, AluOp::Slt, rs, None, inverted);
                if matches!(inst.op(), Op::Bltzal | Op::Bgezal) {
                    set_imm(ctx, RA, link);
                }
                let likely = matches!(inst.op(), Op::Bltzl | Op::Bgezl);
                return Ok(jump(Some(condition), BranchTarget::Static(target), likely));
            }

            Op::Add | Op::Sub | Op::Addi | Op::Mult | Op::Multu => ctx.fallback_to_interpreter(inst.word(), op),
            Op::Lwc1 | Op::Swc1 | Op::Mfc1 | Op::Mtc1 => ctx.fallback_to_interpreter(inst.word(), op),
            Op::Syscall | Op::Break | Op::Reserved => ctx.fallback_to_interpreter(inst.word(), op),
        }
        Ok(Emitted::Done)
    }
}

fn jump(condition: Option<Condition>, target: BranchTarget, likely: bool) -> Emitted {
    Emitted::Branch(PendingBranch { condition, target, likely })
}

fn alu(ctx: &mut Ctx, op: AluOp, dst: GuestReg, a: GuestReg, b: GuestReg) {
    if dst == 0 {
        return;
    }
    let bound = ctx.bind(Some(dst), &[a, b]);
    ctx.emit.alu(op, bound.out(), bound.srcs[0], bound.srcs[1]);
    ctx.unbind(bound);
}

fn alu_imm(ctx: &mut Ctx, op: AluOp, dst: GuestReg, a: GuestReg, imm: u64) {
    if dst == 0 {
        return;
    }
    let bound = ctx.bind(Some(dst), &[a]);
    ctx.emit.alu_imm(op, bound.out(), bound.srcs[0], imm);
    ctx.unbind(bound);
}

fn mov(ctx: &mut Ctx, dst: GuestReg, src: GuestReg) {
    if dst == 0 {
        return;
    }
    let bound = ctx.bind(Some(dst), &[src]);
    if bound.out() != bound.srcs[0] {
        ctx.emit.mov(bound.out(), bound.srcs[0]);
    }
    ctx.unbind(bound);
}

fn set_imm(ctx: &mut Ctx, dst: GuestReg, value: u64) {
    if dst == 0 {
        return;
    }
    let bound = ctx.bind(Some(dst), &[]);
    ctx.emit.load_imm(bound.out(), value);
    ctx.unbind(bound);
}

/// Compares `a` with `b` (or zero) into a scratch register.
fn condition(ctx: &mut Ctx, op: AluOp, a: GuestReg, b: Option<GuestReg>, taken_when_zero: bool) -> Condition {
    let reg = ctx.scratch();
    match b {
        Some(b) => {
            let bound = ctx.bind(None, &[a, b]);
            ctx.emit.alu(op, reg, bound.srcs[0], bound.srcs[1]);
            ctx.unbind(bound);
        }
        None => {
            let bound = ctx.bind(None, &[a]);
            ctx.emit.alu_imm(op, reg, bound.srcs[0], 0);
            ctx.unbind(bound);
        }
    }
    Condition { reg, taken_when_zero }
}

fn load(ctx: &mut Ctx, op: &CodeOp<Instruction>, size: MemSize, signed: bool) {
    let inst = op.instruction;
    let (base, rt) = (inst.rs(), inst.rt());
    if rt == 0 {
        // Still performed, it can fault
        let dst = ctx.scratch();
        let bound = ctx.bind(None, &[base]);
        let fault = ctx.fault_path(op.address);
        ctx.emit.load_mem(dst, bound.srcs[0], inst.simm(), size, signed, op.address, fault);
        ctx.unbind(bound);
        ctx.release_scratch(dst);
        return;
    }
    let bound = ctx.bind(Some(rt), &[base]);
    let fault = ctx.fault_path(op.address);
    ctx.emit.load_mem(bound.out(), bound.srcs[0], inst.simm(), size, signed, op.address, fault);
    ctx.unbind(bound);
}

fn store(ctx: &mut Ctx, op: &CodeOp<Instruction>, size: MemSize) {
    let inst = op.instruction;
    let bound = ctx.bind(None, &[inst.rs(), inst.rt()]);
    let fault = ctx.fault_path(op.address);
    ctx.emit.store_mem(bound.srcs[1], bound.srcs[0], inst.simm(), size, op.address, fault);
    ctx.unbind(bound);
}

/// A zero divisor leaves the quotient and remainder to the interpreter. Both arms rejoin
/// with the register state of the compiled one.
fn divide(ctx: &mut Ctx, op: &CodeOp<Instruction>, quotient: AluOp, remainder: AluOp) {
    let inst = op.instruction;
    let (rs, rt) = (inst.rs(), inst.rt());

    let operands = ctx.bind(None, &[rs, rt]);
    let by_zero = ctx.emit.jump_if(operands.srcs[1], true);
    ctx.unbind(operands);
    let zero_arm = ctx.regs.fork();

    let lo = ctx.bind(Some(LO), &[rs, rt]);
    let hi = ctx.regs.get_location(&mut ctx.emit, HI, false);
    ctx.emit.alu(remainder, hi.host, lo.srcs[0], lo.srcs[1]);
    ctx.emit.alu(quotient, lo.out(), lo.srcs[0], lo.srcs[1]);
    ctx.regs.put_back(HI, true);
    ctx.unbind(lo);
    let done = ctx.emit.jump();

    ctx.emit.set_jump_target(by_zero);
    let divided = std::mem::replace(&mut ctx.regs, zero_arm);
    ctx.fallback_to_interpreter(inst.word(), op);
    ctx.regs.flush_regs(&mut ctx.emit, &divided);
    let merged = std::mem::replace(&mut ctx.regs, divided);
    drop(merged);
    ctx.emit.set_jump_target(done);
}
