use std::fmt;

use common::util::BitMask64;

use super::{Callback, Exit, Flow, Operands, Operation, PendingFault, Runtime};
use crate::block_cache::BlockId;
use crate::regcache::HostReg;

fn byte(word: u64, n: u32) -> u8 {
    (word >> (n * 8)) as u8
}

fn host(word: u64, n: u32) -> HostReg {
    HostReg(byte(word, n))
}

fn sext32(value: u32) -> u64 {
    value as i32 as i64 as u64
}

impl Runtime<'_> {
    pub fn get(&self, reg: HostReg) -> u64 {
        self.host[reg.index()]
    }

    pub fn set(&mut self, reg: HostReg, value: u64) {
        self.host[reg.index()] = value;
    }
}

/// Two-operand arithmetic on host register values. The `32` forms work on the low word and
/// sign-extend their result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add32,
    Sub32,
    Add64,
    Sub64,
    And,
    Or,
    Xor,
    Nor,
    Slt,
    Sltu,
    Sgt,
    Eq,
    Ne,
    Sll32,
    Srl32,
    Sra32,
    Sll64,
    Srl64,
    Sra64,
    /// Division by zero yields zero here; guests with defined results must guard it
    DivS32,
    DivU32,
    RemS32,
    RemU32,
}

impl AluOp {
    const ALL: [AluOp; 23] = [
        AluOp::Add32, AluOp::Sub32, AluOp::Add64, AluOp::Sub64, AluOp::And, AluOp::Or,
        AluOp::Xor, AluOp::Nor, AluOp::Slt, AluOp::Sltu, AluOp::Sgt, AluOp::Eq, AluOp::Ne,
        AluOp::Sll32, AluOp::Srl32, AluOp::Sra32, AluOp::Sll64, AluOp::Srl64, AluOp::Sra64,
        AluOp::DivS32, AluOp::DivU32, AluOp::RemS32, AluOp::RemU32,
    ];

    fn from_byte(value: u8) -> AluOp {
        Self::ALL[value as usize]
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            AluOp::Add32 => "add32",
            AluOp::Sub32 => "sub32",
            AluOp::Add64 => "add",
            AluOp::Sub64 => "sub",
            AluOp::And => "and",
            AluOp::Or => "or",
            AluOp::Xor => "xor",
            AluOp::Nor => "nor",
            AluOp::Slt => "slt",
            AluOp::Sltu => "sltu",
            AluOp::Sgt => "sgt",
            AluOp::Eq => "seq",
            AluOp::Ne => "sne",
            AluOp::Sll32 => "sll32",
            AluOp::Srl32 => "srl32",
            AluOp::Sra32 => "sra32",
            AluOp::Sll64 => "sll",
            AluOp::Srl64 => "srl",
            AluOp::Sra64 => "sra",
            AluOp::DivS32 => "div32",
            AluOp::DivU32 => "divu32",
            AluOp::RemS32 => "rem32",
            AluOp::RemU32 => "remu32",
        }
    }

    pub fn eval(self, a: u64, b: u64) -> u64 {
        let shift32 = (b & 31) as u32;
        let shift64 = (b & 63) as u32;
        match self {
            AluOp::Add32 => sext32((a as u32).wrapping_add(b as u32)),
            AluOp::Sub32 => sext32((a as u32).wrapping_sub(b as u32)),
            AluOp::Add64 => a.wrapping_add(b),
            AluOp::Sub64 => a.wrapping_sub(b),
            AluOp::And => a & b,
            AluOp::Or => a | b,
            AluOp::Xor => a ^ b,
            AluOp::Nor => !(a | b),
            AluOp::Slt => ((a as i64) < (b as i64)) as u64,
            AluOp::Sltu => (a < b) as u64,
            AluOp::Sgt => ((a as i64) > (b as i64)) as u64,
            AluOp::Eq => (a == b) as u64,
            AluOp::Ne => (a != b) as u64,
            AluOp::Sll32 => sext32((a as u32) << shift32),
            AluOp::Srl32 => sext32((a as u32) >> shift32),
            AluOp::Sra32 => sext32(((a as u32 as i32) >> shift32) as u32),
            AluOp::Sll64 => a << shift64,
            AluOp::Srl64 => a >> shift64,
            AluOp::Sra64 => ((a as i64) >> shift64) as u64,
            AluOp::DivS32 => match b as i32 {
                0 => 0,
                divisor => sext32((a as i32).wrapping_div(divisor) as u32),
            },
            AluOp::RemS32 => match b as i32 {
                0 => 0,
                divisor => sext32((a as i32).wrapping_rem(divisor) as u32),
            },
            AluOp::DivU32 => sext32((a as u32).checked_div(b as u32).unwrap_or(0)),
            AluOp::RemU32 => sext32((a as u32).checked_rem(b as u32).unwrap_or(0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemSize {
    Byte,
    Half,
    Word,
}

impl MemSize {
    fn from_byte(value: u8) -> MemSize {
        match value {
            0 => MemSize::Byte,
            1 => MemSize::Half,
            _ => MemSize::Word,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            MemSize::Byte => "b",
            MemSize::Half => "h",
            MemSize::Word => "w",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSlot {
    pub dst: HostReg,
    pub slot: u16,
}

impl Operation for LoadSlot {
    const CALLBACK: Callback = load_slot;

    fn pack(self) -> Operands {
        Operands([self.dst.0 as u64 | (self.slot as u64) << 8, 0, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        let w = operands.0[0];
        LoadSlot { dst: host(w, 0), slot: (w >> 8) as u16 }
    }
}

impl fmt::Display for LoadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ldctx   {}, ctx[{}]", self.dst, self.slot)
    }
}

#[inline(never)]
fn load_slot(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = LoadSlot::unpack(operands);
    let value = rt.context.regs[op.slot as usize];
    rt.set(op.dst, value);
    Flow::Continue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSlot {
    pub slot: u16,
    pub src: HostReg,
}

impl Operation for StoreSlot {
    const CALLBACK: Callback = store_slot;

    fn pack(self) -> Operands {
        Operands([self.src.0 as u64 | (self.slot as u64) << 8, 0, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        let w = operands.0[0];
        StoreSlot { src: host(w, 0), slot: (w >> 8) as u16 }
    }
}

impl fmt::Display for StoreSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stctx   ctx[{}], {}", self.slot, self.src)
    }
}

#[inline(never)]
fn store_slot(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = StoreSlot::unpack(operands);
    rt.context.regs[op.slot as usize] = rt.get(op.src);
    Flow::Continue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Move {
    pub dst: HostReg,
    pub src: HostReg,
}

impl Operation for Move {
    const CALLBACK: Callback = move_reg;

    fn pack(self) -> Operands {
        Operands([self.dst.0 as u64 | (self.src.0 as u64) << 8, 0, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        let w = operands.0[0];
        Move { dst: host(w, 0), src: host(w, 1) }
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mov     {}, {}", self.dst, self.src)
    }
}

#[inline(never)]
fn move_reg(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = Move::unpack(operands);
    let value = rt.get(op.src);
    rt.set(op.dst, value);
    Flow::Continue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadImm {
    pub dst: HostReg,
    pub imm: u64,
}

impl Operation for LoadImm {
    const CALLBACK: Callback = load_imm;

    fn pack(self) -> Operands {
        Operands([self.dst.0 as u64, self.imm, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        LoadImm { dst: host(operands.0[0], 0), imm: operands.0[1] }
    }
}

impl fmt::Display for LoadImm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "li      {}, {:#x}", self.dst, self.imm)
    }
}

#[inline(never)]
fn load_imm(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = LoadImm::unpack(operands);
    rt.set(op.dst, op.imm);
    Flow::Continue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alu {
    pub op: AluOp,
    pub dst: HostReg,
    pub a: HostReg,
    pub b: HostReg,
}

impl Operation for Alu {
    const CALLBACK: Callback = alu;

    fn pack(self) -> Operands {
        Operands([
            self.op as u64 | (self.dst.0 as u64) << 8 | (self.a.0 as u64) << 16 | (self.b.0 as u64) << 24,
            0,
            0,
        ])
    }

    fn unpack(operands: &Operands) -> Self {
        let w = operands.0[0];
        Alu { op: AluOp::from_byte(byte(w, 0)), dst: host(w, 1), a: host(w, 2), b: host(w, 3) }
    }
}

impl fmt::Display for Alu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<8}{}, {}, {}", self.op.mnemonic(), self.dst, self.a, self.b)
    }
}

#[inline(never)]
fn alu(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = Alu::unpack(operands);
    let value = op.op.eval(rt.get(op.a), rt.get(op.b));
    rt.set(op.dst, value);
    Flow::Continue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AluImm {
    pub op: AluOp,
    pub dst: HostReg,
    pub a: HostReg,
    pub imm: u64,
}

impl Operation for AluImm {
    const CALLBACK: Callback = alu_imm;

    fn pack(self) -> Operands {
        Operands([self.op as u64 | (self.dst.0 as u64) << 8 | (self.a.0 as u64) << 16, self.imm, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        let w = operands.0[0];
        AluImm { op: AluOp::from_byte(byte(w, 0)), dst: host(w, 1), a: host(w, 2), imm: operands.0[1] }
    }
}

impl fmt::Display for AluImm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<8}{}, {}, #{:#x}", self.op.mnemonic(), self.dst, self.a, self.imm)
    }
}

#[inline(never)]
fn alu_imm(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = AluImm::unpack(operands);
    let value = op.op.eval(rt.get(op.a), op.imm);
    rt.set(op.dst, value);
    Flow::Continue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extract {
    pub dst: HostReg,
    pub src: HostReg,
    pub shift: u8,
    pub width: u8,
    pub signed: bool,
}

impl Operation for Extract {
    const CALLBACK: Callback = extract;

    fn pack(self) -> Operands {
        Operands([
            self.dst.0 as u64
                | (self.src.0 as u64) << 8
                | (self.shift as u64) << 16
                | (self.width as u64) << 24
                | (self.signed as u64) << 32,
            0,
            0,
        ])
    }

    fn unpack(operands: &Operands) -> Self {
        let w = operands.0[0];
        Extract { dst: host(w, 0), src: host(w, 1), shift: byte(w, 2), width: byte(w, 3), signed: byte(w, 4) != 0 }
    }
}

impl fmt::Display for Extract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.signed { "extr.s" } else { "extr" };
        write!(f, "{name:<8}{}, {}, {}:{}", self.dst, self.src, self.shift, self.width)
    }
}

#[inline(never)]
fn extract(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = Extract::unpack(operands);
    let mask = BitMask64::new(op.width, op.shift);
    let source = rt.get(op.src);
    let value = if op.signed { mask.extract_signed(source) } else { mask.extract(source) };
    rt.set(op.dst, value);
    Flow::Continue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Insert {
    pub dst: HostReg,
    pub src: HostReg,
    pub shift: u8,
    pub width: u8,
}

impl Operation for Insert {
    const CALLBACK: Callback = insert;

    fn pack(self) -> Operands {
        Operands([
            self.dst.0 as u64 | (self.src.0 as u64) << 8 | (self.shift as u64) << 16 | (self.width as u64) << 24,
            0,
            0,
        ])
    }

    fn unpack(operands: &Operands) -> Self {
        let w = operands.0[0];
        Insert { dst: host(w, 0), src: host(w, 1), shift: byte(w, 2), width: byte(w, 3) }
    }
}

impl fmt::Display for Insert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ins     {}:{}:{}, {}", self.dst, self.shift, self.width, self.src)
    }
}

#[inline(never)]
fn insert(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = Insert::unpack(operands);
    let mut value = rt.get(op.dst);
    BitMask64::new(op.width, op.shift).masked_insert(&mut value, rt.get(op.src));
    rt.set(op.dst, value);
    Flow::Continue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Push {
    pub src: HostReg,
}

impl Operation for Push {
    const CALLBACK: Callback = push;

    fn pack(self) -> Operands {
        Operands([self.src.0 as u64, 0, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        Push { src: host(operands.0[0], 0) }
    }
}

impl fmt::Display for Push {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "push    {}", self.src)
    }
}

#[inline(never)]
fn push(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = Push::unpack(operands);
    let value = rt.get(op.src);
    rt.save_area.push(value);
    Flow::Continue
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pop {
    pub dst: HostReg,
}

impl Operation for Pop {
    const CALLBACK: Callback = pop;

    fn pack(self) -> Operands {
        Operands([self.dst.0 as u64, 0, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        Pop { dst: host(operands.0[0], 0) }
    }
}

impl fmt::Display for Pop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pop     {}", self.dst)
    }
}

#[inline(never)]
fn pop(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = Pop::unpack(operands);
    let Some(value) = rt.save_area.pop() else {
        panic!("pop into {} from an empty save area", op.dst);
    };
    rt.set(op.dst, value);
    Flow::Continue
}

/// A guest memory read of `base + offset`. On a fault it records the address and jumps to
/// `fault`, a path that writes back guest state and leaves the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadMem {
    pub dst: HostReg,
    pub base: HostReg,
    pub size: MemSize,
    pub signed: bool,
    pub offset: i32,
    pub pc: u32,
    pub fault: u32,
}

impl Operation for LoadMem {
    const CALLBACK: Callback = load_mem;

    fn pack(self) -> Operands {
        Operands([
            self.dst.0 as u64 | (self.base.0 as u64) << 8 | (self.size as u64) << 16 | (self.signed as u64) << 24,
            self.offset as u32 as u64 | (self.pc as u64) << 32,
            self.fault as u64,
        ])
    }

    fn unpack(operands: &Operands) -> Self {
        let [w0, w1, w2] = operands.0;
        LoadMem {
            dst: host(w0, 0),
            base: host(w0, 1),
            size: MemSize::from_byte(byte(w0, 2)),
            signed: byte(w0, 3) != 0,
            offset: w1 as u32 as i32,
            pc: (w1 >> 32) as u32,
            fault: w2 as u32,
        }
    }
}

impl fmt::Display for LoadMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("ld{}{}", self.size.suffix(), if self.signed { "" } else { "u" });
        write!(f, "{name:<8}{}, {}({}) ; pc {:#010x}, fault @{}", self.dst, self.offset, self.base, self.pc, self.fault)
    }
}

#[inline(never)]
fn load_mem(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = LoadMem::unpack(operands);
    let address = (rt.get(op.base) as u32).wrapping_add(op.offset as u32);
    let result = match (op.size, op.signed) {
        (MemSize::Byte, false) => rt.memory.read_u8(address).map(u64::from),
        (MemSize::Byte, true) => rt.memory.read_u8(address).map(|v| v as i8 as i64 as u64),
        (MemSize::Half, false) => rt.memory.read_u16(address).map(u64::from),
        (MemSize::Half, true) => rt.memory.read_u16(address).map(|v| v as i16 as i64 as u64),
        (MemSize::Word, false) => rt.memory.read_u32(address).map(u64::from),
        (MemSize::Word, true) => rt.memory.read_u32(address).map(sext32),
    };
    match result {
        Ok(value) => {
            rt.set(op.dst, value);
            Flow::Continue
        }
        Err(fault) => {
            rt.fault = Some(PendingFault::Memory(fault.address));
            Flow::Jump(op.fault as usize)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreMem {
    pub src: HostReg,
    pub base: HostReg,
    pub size: MemSize,
    pub offset: i32,
    pub pc: u32,
    pub fault: u32,
}

impl Operation for StoreMem {
    const CALLBACK: Callback = store_mem;

    fn pack(self) -> Operands {
        Operands([
            self.src.0 as u64 | (self.base.0 as u64) << 8 | (self.size as u64) << 16,
            self.offset as u32 as u64 | (self.pc as u64) << 32,
            self.fault as u64,
        ])
    }

    fn unpack(operands: &Operands) -> Self {
        let [w0, w1, w2] = operands.0;
        StoreMem {
            src: host(w0, 0),
            base: host(w0, 1),
            size: MemSize::from_byte(byte(w0, 2)),
            offset: w1 as u32 as i32,
            pc: (w1 >> 32) as u32,
            fault: w2 as u32,
        }
    }
}

impl fmt::Display for StoreMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = format!("st{}", self.size.suffix());
        write!(f, "{name:<8}{}({}), {} ; pc {:#010x}, fault @{}", self.offset, self.base, self.src, self.pc, self.fault)
    }
}

#[inline(never)]
fn store_mem(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = StoreMem::unpack(operands);
    let address = (rt.get(op.base) as u32).wrapping_add(op.offset as u32);
    let value = rt.get(op.src);
    let result = match op.size {
        MemSize::Byte => rt.memory.write_u8(address, value as u8),
        MemSize::Half => rt.memory.write_u16(address, value as u16),
        MemSize::Word => rt.memory.write_u32(address, value as u32),
    };
    match result {
        Ok(()) => Flow::Continue,
        Err(fault) => {
            rt.fault = Some(PendingFault::Memory(fault.address));
            Flow::Jump(op.fault as usize)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jump {
    pub target: u32,
}

impl Operation for Jump {
    const CALLBACK: Callback = jump;

    fn pack(self) -> Operands {
        Operands([self.target as u64, 0, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        Jump { target: operands.0[0] as u32 }
    }
}

impl fmt::Display for Jump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "jmp     @{}", self.target)
    }
}

#[inline(never)]
fn jump(_rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    Flow::Jump(Jump::unpack(operands).target as usize)
}

/// Jumps when `cond` is non-zero, or zero with `when_zero`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpIf {
    pub cond: HostReg,
    pub when_zero: bool,
    pub target: u32,
}

impl Operation for JumpIf {
    const CALLBACK: Callback = jump_if;

    fn pack(self) -> Operands {
        Operands([self.cond.0 as u64 | (self.when_zero as u64) << 8, self.target as u64, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        let w = operands.0[0];
        JumpIf { cond: host(w, 0), when_zero: byte(w, 1) != 0, target: operands.0[1] as u32 }
    }
}

impl fmt::Display for JumpIf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if self.when_zero { "jz" } else { "jnz" };
        write!(f, "{name:<8}{}, @{}", self.cond, self.target)
    }
}

#[inline(never)]
fn jump_if(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = JumpIf::unpack(operands);
    if (rt.get(op.cond) == 0) == op.when_zero {
        Flow::Jump(op.target as usize)
    } else {
        Flow::Continue
    }
}

/// Runs one guest instruction through the interpreter fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interpret {
    pub word: u32,
    pub pc: u32,
    pub fault: u32,
}

impl Operation for Interpret {
    const CALLBACK: Callback = interpret;

    fn pack(self) -> Operands {
        Operands([self.word as u64 | (self.pc as u64) << 32, self.fault as u64, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        let w = operands.0[0];
        Interpret { word: w as u32, pc: (w >> 32) as u32, fault: operands.0[1] as u32 }
    }
}

impl fmt::Display for Interpret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interp  {:#010x} ; pc {:#010x}, fault @{}", self.word, self.pc, self.fault)
    }
}

#[inline(never)]
fn interpret(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = Interpret::unpack(operands);
    match rt.call_interpreter(op.word, op.pc) {
        Ok(()) => Flow::Continue,
        Err(exception) => {
            rt.fault = Some(PendingFault::Exception(exception));
            Flow::Jump(op.fault as usize)
        }
    }
}

/// Leaves the unit for a statically known address, charging the cycles executed on the way.
///
/// `link` is filled in when the block cache patches this site to enter the target directly.
/// `idle` marks the taken edge of a busy-wait loop, which skips ahead to the next event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitBlock {
    pub pc: u32,
    pub cycles: u32,
    pub exit: u16,
    pub idle: bool,
    pub link: Option<BlockId>,
}

impl Operation for ExitBlock {
    const CALLBACK: Callback = exit_block;

    fn pack(self) -> Operands {
        Operands([
            self.pc as u64 | (self.cycles as u64) << 32,
            self.exit as u64 | (self.idle as u64) << 16,
            self.link.map_or(0, BlockId::to_bits),
        ])
    }

    fn unpack(operands: &Operands) -> Self {
        let [w0, w1, w2] = operands.0;
        ExitBlock {
            pc: w0 as u32,
            cycles: (w0 >> 32) as u32,
            exit: w1 as u16,
            idle: (w1 >> 16) & 1 != 0,
            link: BlockId::from_bits(w2),
        }
    }
}

impl fmt::Display for ExitBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit    {:#010x} ; #{} cycles {}", self.pc, self.exit, self.cycles)?;
        if self.idle {
            write!(f, " idle")?;
        }
        if let Some(link) = self.link {
            write!(f, " -> {link}")?;
        }
        Ok(())
    }
}

#[inline(never)]
fn exit_block(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = ExitBlock::unpack(operands);
    rt.context.downcount -= op.cycles as i64;
    if op.idle && rt.context.downcount > 0 {
        rt.context.downcount = 0;
    }
    rt.context.pc = op.pc;
    Flow::Exit(Exit::Jump { pc: op.pc, exit: op.exit, link: op.link })
}

/// Leaves the unit for the address held in `src`. Never linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitIndirect {
    pub src: HostReg,
    pub cycles: u32,
    pub exit: u16,
}

impl Operation for ExitIndirect {
    const CALLBACK: Callback = exit_indirect;

    fn pack(self) -> Operands {
        Operands([self.src.0 as u64 | (self.exit as u64) << 8 | (self.cycles as u64) << 32, 0, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        let w = operands.0[0];
        ExitIndirect { src: host(w, 0), exit: (w >> 8) as u16, cycles: (w >> 32) as u32 }
    }
}

impl fmt::Display for ExitIndirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit    {} ; #{} cycles {}", self.src, self.exit, self.cycles)
    }
}

#[inline(never)]
fn exit_indirect(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = ExitIndirect::unpack(operands);
    let pc = rt.get(op.src) as u32;
    rt.context.downcount -= op.cycles as i64;
    rt.context.pc = pc;
    Flow::Exit(Exit::Jump { pc, exit: op.exit, link: None })
}

/// The end of a fault path: reports the fault a previous record left pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultExit {
    pub pc: u32,
}

impl Operation for FaultExit {
    const CALLBACK: Callback = fault_exit;

    fn pack(self) -> Operands {
        Operands([self.pc as u64, 0, 0])
    }

    fn unpack(operands: &Operands) -> Self {
        FaultExit { pc: operands.0[0] as u32 }
    }
}

impl fmt::Display for FaultExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fault   {:#010x}", self.pc)
    }
}

#[inline(never)]
fn fault_exit(rt: &mut Runtime<'_>, operands: &Operands) -> Flow {
    let op = FaultExit::unpack(operands);
    rt.context.pc = op.pc;
    // The unit is abandoned along with anything it pushed
    rt.save_area.clear();
    let exit = match rt.fault.take() {
        Some(PendingFault::Memory(address)) => Exit::MemoryFault { pc: op.pc, address },
        Some(PendingFault::Exception(exception)) => Exit::Exception(exception),
        None => panic!("fault path at {:#010x} entered with nothing pending", op.pc),
    };
    Flow::Exit(exit)
}
