//! A tiny fixed-width instruction set and memory used by the unit tests of the core.
//!
//! Encoding: `op << 24 | a << 16 | b << 8 | c`. Branch targets are `c * 4`.

use crate::arch::{Architecture, FlagGroups, OpFlags, OpInfo};
use crate::block::CodeOp;
use crate::bytecode::{AluOp, MemSize};
use crate::compiler::{BranchTarget, CompileContext, Condition, Emitted, Frontend, PendingBranch};
use crate::error::{CompileError, GuestException, MemoryFault};
use crate::memory::{GuestContext, GuestMemory, Interpreter};
use crate::regcache::{HostConfig, OldestUse, RegLayout};

pub const NOP: u32 = 0x00;
pub const LI: u32 = 0x01;
pub const ADD: u32 = 0x02;
pub const MOV: u32 = 0x03;
pub const ADDC: u32 = 0x04;
pub const SUBC: u32 = 0x05;
pub const CMP: u32 = 0x06;
pub const BC: u32 = 0x07;
pub const B: u32 = 0x08;
pub const LD: u32 = 0x09;
pub const ST: u32 = 0x0a;
pub const SYS: u32 = 0x0b;
pub const BD: u32 = 0x0c;
pub const FLD: u32 = 0x0d;
pub const FMOV: u32 = 0x0e;
pub const CALL: u32 = 0x0f;
pub const RET: u32 = 0x10;
pub const BNZD: u32 = 0x11;

pub const LINK_REG: usize = 15;

pub fn enc(op: u32, a: u32, b: u32, c: u32) -> u32 {
    op << 24 | (a & 0xff) << 16 | (b & 0xff) << 8 | (c & 0xff)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ToyArch;

impl Architecture for ToyArch {
    type Instruction = u32;

    const GPR_COUNT: usize = 16;
    const FPR_COUNT: usize = 8;
    const INSTRUCTION_SIZE: u32 = 4;

    fn decode(&self, memory: &mut dyn GuestMemory, address: u32) -> Result<u32, MemoryFault> {
        memory.read_code(address)
    }

    fn info(&self, inst: &u32, _address: u32) -> OpInfo {
        let op = inst >> 24;
        let a = ((inst >> 16) & 0xff) as usize;
        let b = ((inst >> 8) & 0xff) as usize;
        let c = (inst & 0xff) as usize;
        let target = (c as u32) * 4;
        match op {
            NOP => OpInfo::new("nop"),
            LI => OpInfo::new("li").writes(a),
            ADD => OpInfo::new("add").reads(b).reads(c).writes(a),
            MOV => OpInfo::new("mov").reads(b).writes(a),
            ADDC => OpInfo::new("addc").reads(b).reads(c).writes(a)
                .flag_groups(FlagGroups::CARRY, FlagGroups::CARRY),
            SUBC => OpInfo::new("subc").reads(b).reads(c).writes(a)
                .flag_groups(FlagGroups::empty(), FlagGroups::CARRY),
            CMP => OpInfo::new("cmp").reads(b).reads(c)
                .flag_groups(FlagGroups::empty(), FlagGroups::COMPARE),
            BC => OpInfo::new("bc").flag_groups(FlagGroups::COMPARE, FlagGroups::empty())
                .with_flags(OpFlags::END_BLOCK | OpFlags::CONDITIONAL).target(target),
            B => OpInfo::new("b").with_flags(OpFlags::END_BLOCK).target(target),
            LD => OpInfo::new("ld").reads(b).writes(a).with_flags(OpFlags::EXCEPTION).cycles(3),
            ST => OpInfo::new("st").reads(b).reads(c).with_flags(OpFlags::STORE | OpFlags::EXCEPTION),
            SYS => OpInfo::new("sys")
                .with_flags(OpFlags::END_BLOCK | OpFlags::EXCEPTION | OpFlags::NO_REORDER),
            BD => OpInfo::new("bd").with_flags(OpFlags::END_BLOCK | OpFlags::DELAY_SLOT).target(target),
            FLD => OpInfo::new("fld").reads(b).writes_fpr(a).with_flags(OpFlags::EXCEPTION),
            FMOV => OpInfo::new("fmov").reads_fpr(b).writes_fpr(a),
            CALL => OpInfo::new("call").writes(LINK_REG)
                .with_flags(OpFlags::END_BLOCK | OpFlags::CALL).target(target),
            RET => OpInfo::new("ret").reads(LINK_REG).with_flags(OpFlags::END_BLOCK | OpFlags::RETURN),
            BNZD => OpInfo::new("bnzd").reads(b)
                .with_flags(OpFlags::END_BLOCK | OpFlags::CONDITIONAL | OpFlags::DELAY_SLOT)
                .target(target),
            _ => OpInfo::new("illegal")
                .with_flags(OpFlags::END_BLOCK | OpFlags::EXCEPTION | OpFlags::NO_REORDER),
        }
    }

    fn encoding(&self, inst: &u32) -> u32 {
        *inst
    }

    fn disassemble(&self, inst: &u32, address: u32) -> String {
        let info = self.info(inst, address);
        format!("{} {:06x}", info.name, inst & 0xff_ffff)
    }
}

/// Big-endian memory starting at address zero.
#[derive(Debug, Clone, Default)]
pub struct VecMemory {
    pub bytes: Vec<u8>,
}

impl VecMemory {
    pub fn new(size: usize) -> Self {
        VecMemory { bytes: vec![0; size] }
    }

    pub fn from_words(words: &[u32]) -> Self {
        VecMemory {
            bytes: words.iter().flat_map(|w| w.to_be_bytes()).collect(),
        }
    }

    fn range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>, MemoryFault> {
        let start = address as usize;
        if start % len != 0 || start + len > self.bytes.len() {
            return Err(MemoryFault { address });
        }
        Ok(start..start + len)
    }
}

impl GuestMemory for VecMemory {
    fn read_u8(&mut self, address: u32) -> Result<u8, MemoryFault> {
        let range = self.range(address, 1)?;
        Ok(self.bytes[range.start])
    }

    fn read_u16(&mut self, address: u32) -> Result<u16, MemoryFault> {
        let range = self.range(address, 2)?;
        Ok(u16::from_be_bytes([self.bytes[range.start], self.bytes[range.start + 1]]))
    }

    fn read_u32(&mut self, address: u32) -> Result<u32, MemoryFault> {
        let range = self.range(address, 4)?;
        let mut word = [0; 4];
        word.copy_from_slice(&self.bytes[range]);
        Ok(u32::from_be_bytes(word))
    }

    fn write_u8(&mut self, address: u32, value: u8) -> Result<(), MemoryFault> {
        let range = self.range(address, 1)?;
        self.bytes[range.start] = value;
        Ok(())
    }

    fn write_u16(&mut self, address: u32, value: u16) -> Result<(), MemoryFault> {
        let range = self.range(address, 2)?;
        self.bytes[range].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn write_u32(&mut self, address: u32, value: u32) -> Result<(), MemoryFault> {
        let range = self.range(address, 4)?;
        self.bytes[range].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }
}

/// 16 GPRs, then the 8 FPRs the register cache never holds
pub const TOY_SLOTS: usize = 24;
pub const TOY_SYSCALL: u32 = 8;
pub const TOY_ILLEGAL: u32 = 10;

const TOY_REG_NAMES: [&str; 16] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13", "r14", "r15",
];

fn fields(inst: u32) -> (u32, usize, usize, usize) {
    (inst >> 24, ((inst >> 16) & 0xff) as usize, ((inst >> 8) & 0xff) as usize, (inst & 0xff) as usize)
}

/// What the toy frontend leaves to the interpreter.
pub fn toy_interpreter(
    ctx: &mut GuestContext,
    memory: &mut dyn GuestMemory,
    word: u32,
    pc: u32,
) -> Result<(), GuestException> {
    let (op, a, b, c) = fields(word);
    match op {
        ADDC => ctx.regs[a] = ctx.regs[b].wrapping_add(ctx.regs[c]).wrapping_add(1),
        SUBC => ctx.regs[a] = ctx.regs[b].wrapping_sub(ctx.regs[c]),
        CMP | NOP => {}
        FLD => {
            let value = memory
                .read_u32(ctx.regs[b] as u32)
                .map_err(|_| GuestException { code: TOY_ILLEGAL, pc })?;
            ctx.regs[16 + a] = value as u64;
        }
        FMOV => ctx.regs[16 + a] = ctx.regs[16 + b],
        SYS => return Err(GuestException { code: TOY_SYSCALL, pc }),
        _ => return Err(GuestException { code: TOY_ILLEGAL, pc }),
    }
    Ok(())
}

/// Compiles the toy set onto four host registers, two of them call-preserved.
pub struct ToyFrontend {
    arch: ToyArch,
    layout: RegLayout,
    host: HostConfig,
}

impl ToyFrontend {
    pub fn new() -> Self {
        let layout = TOY_REG_NAMES
            .iter()
            .enumerate()
            .fold(RegLayout::new(), |layout, (i, &name)| layout.primary(name, i as u16, 64));
        ToyFrontend { arch: ToyArch, layout, host: HostConfig::new(4, &[2, 3]) }
    }
}

impl Frontend for ToyFrontend {
    type Arch = ToyArch;
    type Eviction = OldestUse;

    fn arch(&self) -> &ToyArch {
        &self.arch
    }

    fn reg_layout(&self) -> &RegLayout {
        &self.layout
    }

    fn host_config(&self) -> &HostConfig {
        &self.host
    }

    fn interpreter(&self) -> Interpreter {
        toy_interpreter
    }

    fn compile_op(&mut self, ctx: &mut CompileContext<OldestUse>, op: &CodeOp<u32>) -> Result<Emitted, CompileError> {
        let (code, a, b, c) = fields(op.instruction);
        let target = op.branch_target.unwrap_or(0);
        match code {
            NOP => {}
            LI => {
                let bound = ctx.bind(Some(a), &[]);
                ctx.emit.load_imm(bound.dst.unwrap(), (b << 8 | c) as u64);
                ctx.unbind(bound);
            }
            ADD => {
                let bound = ctx.bind(Some(a), &[b, c]);
                ctx.emit.alu(AluOp::Add64, bound.dst.unwrap(), bound.srcs[0], bound.srcs[1]);
                ctx.unbind(bound);
            }
            MOV => {
                let bound = ctx.bind(Some(a), &[b]);
                ctx.emit.alu_imm(AluOp::Or, bound.dst.unwrap(), bound.srcs[0], 0);
                ctx.unbind(bound);
            }
            LD => {
                let bound = ctx.bind(Some(a), &[b]);
                let fault = ctx.fault_path(op.address);
                ctx.emit.load_mem(bound.dst.unwrap(), bound.srcs[0], c as i32, MemSize::Word, false, op.address, fault);
                ctx.unbind(bound);
            }
            ST => {
                let bound = ctx.bind(None, &[b, c]);
                let fault = ctx.fault_path(op.address);
                ctx.emit.store_mem(bound.srcs[1], bound.srcs[0], 0, MemSize::Word, op.address, fault);
                ctx.unbind(bound);
            }
            B | BD => return Ok(branch(None, BranchTarget::Static(target))),
            CALL => {
                let bound = ctx.bind(Some(LINK_REG), &[]);
                ctx.emit.load_imm(bound.dst.unwrap(), op.address.wrapping_add(4) as u64);
                ctx.unbind(bound);
                return Ok(branch(None, BranchTarget::Static(target)));
            }
            RET => {
                let dest = ctx.scratch();
                ctx.regs.read_into(&mut ctx.emit, LINK_REG, dest, false);
                return Ok(branch(None, BranchTarget::Register(dest)));
            }
            BNZD => {
                let cond = ctx.scratch();
                ctx.regs.read_into(&mut ctx.emit, b, cond, false);
                let condition = Condition { reg: cond, taken_when_zero: false };
                return Ok(branch(Some(condition), BranchTarget::Static(target)));
            }
            BC => return Err(CompileError::Unsupported { address: op.address, name: op.name }),
            _ => ctx.fallback_to_interpreter(op.instruction, op),
        }
        Ok(Emitted::Done)
    }
}

fn branch(condition: Option<Condition>, target: BranchTarget) -> Emitted {
    Emitted::Branch(PendingBranch { condition, target, likely: false })
}
