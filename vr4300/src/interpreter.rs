//! Executes single instruction words against the guest context. The recompiled code calls
//! in here for everything it does not translate itself.

use dynarec::{GuestContext, GuestException, GuestMemory};

use crate::instructions::{decode, Op, FPR_BASE, HI, LO};

pub const EXC_ADEL: u32 = 4;
pub const EXC_ADES: u32 = 5;
pub const EXC_SYSCALL: u32 = 8;
pub const EXC_BREAK: u32 = 9;
pub const EXC_RESERVED: u32 = 10;
pub const EXC_OVERFLOW: u32 = 12;

fn sext32(value: u32) -> u64 {
    value as i32 as i64 as u64
}

struct Regs<'a>(&'a mut GuestContext);

impl Regs<'_> {
    fn get(&self, reg: usize) -> u64 {
        self.0.regs[reg]
    }

    fn set(&mut self, reg: usize, value: u64) {
        // $zero stays zero
        if reg != 0 {
            self.0.regs[reg] = value;
        }
    }
}

/// Runs `word`, the instruction at `pc`. Control transfers are always compiled and never
/// reach this function.
pub fn interpret(
    ctx: &mut GuestContext,
    memory: &mut dyn GuestMemory,
    word: u32,
    pc: u32,
) -> Result<(), GuestException> {
    use Op::*;

    let inst = decode(word);
    let (rs, rt, rd) = (inst.rs(), inst.rt(), inst.rd());
    let exception = |code| GuestException { code, pc };
    let mut regs = Regs(ctx);
    let address = (regs.get(rs) as u32).wrapping_add(inst.simm() as u32);

    match inst.op() {
        Sll => regs.set(rd, sext32((regs.get(rt) as u32) << inst.sa())),
        Srl => regs.set(rd, sext32((regs.get(rt) as u32) >> inst.sa())),
        Sra => regs.set(rd, sext32(((regs.get(rt) as i32) >> inst.sa()) as u32)),
        Sllv => regs.set(rd, sext32((regs.get(rt) as u32) << (regs.get(rs) & 0x1f))),
        Srlv => regs.set(rd, sext32((regs.get(rt) as u32) >> (regs.get(rs) & 0x1f))),
        Srav => regs.set(rd, sext32(((regs.get(rt) as i32) >> (regs.get(rs) & 0x1f)) as u32)),
        Dsll => regs.set(rd, regs.get(rt) << inst.sa()),
        Dsrl => regs.set(rd, regs.get(rt) >> inst.sa()),
        Dsra => regs.set(rd, ((regs.get(rt) as i64) >> inst.sa()) as u64),
        Dsll32 => regs.set(rd, regs.get(rt) << (inst.sa() + 32)),
        Dsrl32 => regs.set(rd, regs.get(rt) >> (inst.sa() + 32)),
        Dsra32 => regs.set(rd, ((regs.get(rt) as i64) >> (inst.sa() + 32)) as u64),
        Dsllv => regs.set(rd, regs.get(rt) << (regs.get(rs) & 0x3f)),
        Dsrlv => regs.set(rd, regs.get(rt) >> (regs.get(rs) & 0x3f)),
        Dsrav => regs.set(rd, ((regs.get(rt) as i64) >> (regs.get(rs) & 0x3f)) as u64),

        Add => {
            let sum = (regs.get(rs) as i32).checked_add(regs.get(rt) as i32).ok_or(exception(EXC_OVERFLOW))?;
            regs.set(rd, sum as i64 as u64);
        }
        Sub => {
            let diff = (regs.get(rs) as i32).checked_sub(regs.get(rt) as i32).ok_or(exception(EXC_OVERFLOW))?;
            regs.set(rd, diff as i64 as u64);
        }
        Addi => {
            let sum = (regs.get(rs) as i32).checked_add(inst.simm()).ok_or(exception(EXC_OVERFLOW))?;
            regs.set(rt, sum as i64 as u64);
        }
        Addu => regs.set(rd, sext32((regs.get(rs) as u32).wrapping_add(regs.get(rt) as u32))),
        Subu => regs.set(rd, sext32((regs.get(rs) as u32).wrapping_sub(regs.get(rt) as u32))),
        Daddu => regs.set(rd, regs.get(rs).wrapping_add(regs.get(rt))),
        Dsubu => regs.set(rd, regs.get(rs).wrapping_sub(regs.get(rt))),
        And => regs.set(rd, regs.get(rs) & regs.get(rt)),
        Or => regs.set(rd, regs.get(rs) | regs.get(rt)),
        Xor => regs.set(rd, regs.get(rs) ^ regs.get(rt)),
        Nor => regs.set(rd, !(regs.get(rs) | regs.get(rt))),
        Slt => regs.set(rd, ((regs.get(rs) as i64) < (regs.get(rt) as i64)) as u64),
        Sltu => regs.set(rd, (regs.get(rs) < regs.get(rt)) as u64),
        Addiu => regs.set(rt, sext32((regs.get(rs) as u32).wrapping_add(inst.simm() as u32))),
        Daddiu => regs.set(rt, regs.get(rs).wrapping_add(inst.simm() as i64 as u64)),
        Slti => regs.set(rt, ((regs.get(rs) as i64) < inst.simm() as i64) as u64),
        Sltiu => regs.set(rt, (regs.get(rs) < inst.simm() as i64 as u64) as u64),
        Andi => regs.set(rt, regs.get(rs) & inst.imm() as u64),
        Ori => regs.set(rt, regs.get(rs) | inst.imm() as u64),
        Xori => regs.set(rt, regs.get(rs) ^ inst.imm() as u64),
        Lui => regs.set(rt, sext32((inst.imm() as u32) << 16)),

        Mfhi => regs.set(rd, regs.get(HI)),
        Mflo => regs.set(rd, regs.get(LO)),
        Mthi => regs.set(HI, regs.get(rs)),
        Mtlo => regs.set(LO, regs.get(rs)),
        Mult => {
            let product = (regs.get(rs) as i32 as i64) * (regs.get(rt) as i32 as i64);
            regs.set(LO, sext32(product as u32));
            regs.set(HI, sext32((product >> 32) as u32));
        }
        Multu => {
            let product = (regs.get(rs) as u32 as u64) * (regs.get(rt) as u32 as u64);
            regs.set(LO, sext32(product as u32));
            regs.set(HI, sext32((product >> 32) as u32));
        }
        Div => {
            let (n, d) = (regs.get(rs) as i32, regs.get(rt) as i32);
            if d == 0 {
                regs.set(LO, if n < 0 { 1 } else { u64::MAX });
                regs.set(HI, n as i64 as u64);
            } else {
                regs.set(LO, n.wrapping_div(d) as i64 as u64);
                regs.set(HI, n.wrapping_rem(d) as i64 as u64);
            }
        }
        Divu => {
            let (n, d) = (regs.get(rs) as u32, regs.get(rt) as u32);
            if d == 0 {
                regs.set(LO, u64::MAX);
                regs.set(HI, sext32(n));
            } else {
                regs.set(LO, sext32(n / d));
                regs.set(HI, sext32(n % d));
            }
        }

        Lb => regs.set(rt, memory.read_u8(address).map_err(|_| exception(EXC_ADEL))? as i8 as i64 as u64),
        Lbu => regs.set(rt, memory.read_u8(address).map_err(|_| exception(EXC_ADEL))? as u64),
        Lh => regs.set(rt, memory.read_u16(address).map_err(|_| exception(EXC_ADEL))? as i16 as i64 as u64),
        Lhu => regs.set(rt, memory.read_u16(address).map_err(|_| exception(EXC_ADEL))? as u64),
        Lw => regs.set(rt, sext32(memory.read_u32(address).map_err(|_| exception(EXC_ADEL))?)),
        Lwu => regs.set(rt, memory.read_u32(address).map_err(|_| exception(EXC_ADEL))? as u64),
        Sb => memory.write_u8(address, regs.get(rt) as u8).map_err(|_| exception(EXC_ADES))?,
        Sh => memory.write_u16(address, regs.get(rt) as u16).map_err(|_| exception(EXC_ADES))?,
        Sw => memory.write_u32(address, regs.get(rt) as u32).map_err(|_| exception(EXC_ADES))?,

        Lwc1 => {
            let value = memory.read_u32(address).map_err(|_| exception(EXC_ADEL))?;
            regs.0.regs[FPR_BASE + rt] = value as u64;
        }
        Swc1 => {
            let value = regs.0.regs[FPR_BASE + rt] as u32;
            memory.write_u32(address, value).map_err(|_| exception(EXC_ADES))?;
        }
        Mfc1 => regs.set(rt, sext32(regs.0.regs[FPR_BASE + rd] as u32)),
        Mtc1 => {
            let value = regs.get(rt) as u32;
            regs.0.regs[FPR_BASE + rd] = value as u64;
        }

        Sync | Cache => {}
        Syscall => return Err(exception(EXC_SYSCALL)),
        Break => return Err(exception(EXC_BREAK)),
        Reserved => return Err(exception(EXC_RESERVED)),

        J | Jal | Jr | Jalr | Beq | Bne | Blez | Bgtz | Beql | Bnel | Blezl | Bgtzl | Bltz | Bgez | Bltzl
        | Bgezl | Bltzal | Bgezal => {
            panic!("{} at {pc:#010x} reached the interpreter", inst.name())
        }
    }
    Ok(())
}
