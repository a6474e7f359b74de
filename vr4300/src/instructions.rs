use modular_bitfield::{bitfield, specifiers::*};

use dynarec::{Architecture, GuestMemory, MemoryFault, OpFlags, OpInfo};

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone)]
pub struct IType {
    pub imm: B16,
    pub rt: B5,
    pub rs: B5,
    op: B6,
}

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone)]
pub struct JType {
    pub target: B26,
    op: B6,
}

#[bitfield(bits = 32)]
#[derive(Debug, Copy, Clone)]
pub struct RType {
    pub funct: B6,
    pub sa: B5,
    pub rd: B5,
    pub rt: B5,
    pub rs: B5,
    op: B6,
}

impl IType {
    pub fn encode(op: u8, rs: u8, rt: u8, imm: u16) -> u32 {
        let i = IType::new().with_op(op & 0x3f).with_rs(rs & 0x1f).with_rt(rt & 0x1f).with_imm(imm);
        u32::from_le_bytes(i.into_bytes())
    }
}

impl JType {
    pub fn encode(op: u8, target: u32) -> u32 {
        let j = JType::new().with_op(op & 0x3f).with_target(target & 0x03ff_ffff);
        u32::from_le_bytes(j.into_bytes())
    }
}

impl RType {
    pub fn encode(op: u8, rs: u8, rt: u8, rd: u8, sa: u8, funct: u8) -> u32 {
        let r = RType::new()
            .with_op(op & 0x3f)
            .with_rs(rs & 0x1f)
            .with_rt(rt & 0x1f)
            .with_rd(rd & 0x1f)
            .with_sa(sa & 0x1f)
            .with_funct(funct & 0x3f);
        u32::from_le_bytes(r.into_bytes())
    }
}

pub const MIPS_REG_NAMES: [&str; 32] = [
    "$zero", // Always 0
    "$at",   // r1 - Reserved for assembler
    "$v0", "$v1", // r2-r3 - Function return values
    "$a0", "$a1", "$a2", "$a3", // r4-r7 - function arguments
    "$t0", "$t1", "$t2", "$t3", "$t4", "$t5", "$t6",
    "$t7", // r8-r15 - Temporaries (Caller saved)
    "$s0", "$s1", "$s2", "$s3", "$s4", "$s5", "$s6", "$s7", // r16-r23 - Saved  (Callee saved)
    "$t8", "$t9", // r24-r25 - Caller-saved temporaries
    "$k0", "$k1", // Reserved for OS kernel
    "$gp", // r28 - Global pointer
    "$sp", // r29 - Stack pointer
    "$fp", // r30 - Frame pointer
    "$ra", // r31 - Return address
];

pub const RA: usize = 31;
/// HI and LO follow the GPRs in the register file the recompiler caches
pub const HI: usize = 32;
pub const LO: usize = 33;
pub const GPR_SLOTS: usize = 34;
pub const FPR_SLOTS: usize = 32;
/// Context slot of FPR 0
pub const FPR_BASE: usize = GPR_SLOTS;
pub const CONTEXT_SLOTS: usize = FPR_BASE + FPR_SLOTS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Sll, Srl, Sra, Sllv, Srlv, Srav,
    Jr, Jalr,
    Syscall, Break, Sync,
    Mfhi, Mthi, Mflo, Mtlo,
    Dsllv, Dsrlv, Dsrav,
    Mult, Multu, Div, Divu,
    Add, Addu, Sub, Subu, And, Or, Xor, Nor, Slt, Sltu,
    Daddu, Dsubu,
    Dsll, Dsrl, Dsra, Dsll32, Dsrl32, Dsra32,

    Bltz, Bgez, Bltzl, Bgezl, Bltzal, Bgezal,

    J, Jal,
    Beq, Bne, Blez, Bgtz,
    Addi, Addiu, Slti, Sltiu, Andi, Ori, Xori, Lui,
    Beql, Bnel, Blezl, Bgtzl,
    Daddiu,
    Lb, Lh, Lw, Lbu, Lhu, Lwu,
    Sb, Sh, Sw,
    Cache,
    Lwc1, Swc1,
    Mfc1, Mtc1,

    Reserved,
}

#[derive(Debug, Clone, Copy)]
enum Entry {
    Reserved,
    Special,
    RegImm,
    Cop1,
    Op(&'static str, Op),
}

/// One decoded instruction word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    word: u32,
    op: Op,
    name: &'static str,
}

impl Instruction {
    pub fn word(self) -> u32 {
        self.word
    }

    pub fn op(self) -> Op {
        self.op
    }

    pub fn name(self) -> &'static str {
        self.name
    }

    pub fn i(self) -> IType {
        IType::from_bytes(self.word.to_le_bytes())
    }

    pub fn j(self) -> JType {
        JType::from_bytes(self.word.to_le_bytes())
    }

    pub fn r(self) -> RType {
        RType::from_bytes(self.word.to_le_bytes())
    }

    pub fn rs(self) -> usize {
        self.r().rs() as usize
    }

    pub fn rt(self) -> usize {
        self.r().rt() as usize
    }

    pub fn rd(self) -> usize {
        self.r().rd() as usize
    }

    pub fn sa(self) -> u32 {
        self.r().sa() as u32
    }

    pub fn imm(self) -> u16 {
        self.i().imm()
    }

    pub fn simm(self) -> i32 {
        self.imm() as i16 as i32
    }

    /// Relative branches count from the delay slot
    pub fn branch_target(self, address: u32) -> u32 {
        address.wrapping_add(4).wrapping_add((self.simm() << 2) as u32)
    }

    /// J and JAL replace the low 28 bits of the delay slot's address
    pub fn jump_target(self, address: u32) -> u32 {
        (address.wrapping_add(4) & 0xf000_0000) | (self.j().target() << 2)
    }

    /// Provides a string representation of the instruction (as disassembly)
    pub fn disassemble(self, address: u32) -> String {
        use Op::*;

        if self.word == 0 {
            return "nop".to_owned();
        }
        let reg = |r: usize| MIPS_REG_NAMES[r];
        let (rs, rt, rd) = (self.rs(), self.rt(), self.rd());

        let args = match self.op {
            Add | Addu | Sub | Subu | And | Or | Xor | Nor | Slt | Sltu | Daddu | Dsubu => {
                format!("{}, {}, {}", reg(rd), reg(rs), reg(rt))
            }
            Sll | Srl | Sra | Dsll | Dsrl | Dsra | Dsll32 | Dsrl32 | Dsra32 => {
                format!("{}, {}, {}", reg(rd), reg(rt), self.sa())
            }
            Sllv | Srlv | Srav | Dsllv | Dsrlv | Dsrav => format!("{}, {}, {}", reg(rd), reg(rt), reg(rs)),
            Addi | Addiu | Slti | Sltiu | Daddiu => format!("{}, {}, {}", reg(rt), reg(rs), self.simm()),
            Andi | Ori | Xori => format!("{}, {}, {:#x}", reg(rt), reg(rs), self.imm()),
            Lui => format!("{}, {:#x}", reg(rt), self.imm()),
            Lb | Lh | Lw | Lbu | Lhu | Lwu | Sb | Sh | Sw => {
                format!("{}, {}({})", reg(rt), self.simm(), reg(rs))
            }
            Lwc1 | Swc1 => format!("f{rt}, {}({})", self.simm(), reg(rs)),
            Cache => format!("{rt:#04x}, {}({})", self.simm(), reg(rs)),
            Beq | Bne | Beql | Bnel => {
                format!("{}, {}, {:#010x}", reg(rs), reg(rt), self.branch_target(address))
            }
            Blez | Bgtz | Blezl | Bgtzl | Bltz | Bgez | Bltzl | Bgezl | Bltzal | Bgezal => {
                format!("{}, {:#010x}", reg(rs), self.branch_target(address))
            }
            J | Jal => format!("{:#010x}", self.jump_target(address)),
            Jr | Mthi | Mtlo => reg(rs).to_owned(),
            Jalr => format!("{}, {}", reg(rd), reg(rs)),
            Mfhi | Mflo => reg(rd).to_owned(),
            Mult | Multu | Div | Divu => format!("{}, {}", reg(rs), reg(rt)),
            Mfc1 | Mtc1 => format!("{}, f{rd}", reg(rt)),
            Syscall | Break | Sync => return self.name.to_owned(),
            Reserved => return format!("{} {:#010x}", self.name, self.word),
        };
        format!("{:<7} {}", self.name, args)
    }
}

pub fn decode(word: u32) -> Instruction {
    let mut entry = PRIMARY_TABLE[(word >> 26) as usize];

    loop {
        entry = match entry {
            Entry::Special => SPECIAL_TABLE[(word & 0x3f) as usize],
            Entry::RegImm => REGIMM_TABLE[((word >> 16) & 0x1f) as usize],
            Entry::Cop1 => match (word >> 21) & 0x1f {
                0x0 => Entry::Op("mfc1", Op::Mfc1),
                0x4 => Entry::Op("mtc1", Op::Mtc1),
                _ => Entry::Reserved,
            },
            Entry::Op(name, op) => return Instruction { word, op, name },
            Entry::Reserved => return Instruction { word, op: Op::Reserved, name: "reserved" },
        };
    }
}

/// Register operands as the core tracks them. `$zero` is never an input or an output.
trait GprInfo {
    fn gpr_in(self, reg: usize) -> Self;
    fn gpr_out(self, reg: usize) -> Self;
}

impl GprInfo for OpInfo {
    fn gpr_in(self, reg: usize) -> Self {
        if reg == 0 { self } else { self.reads(reg) }
    }

    fn gpr_out(self, reg: usize) -> Self {
        if reg == 0 { self } else { self.writes(reg) }
    }
}

pub fn info(inst: Instruction, address: u32) -> OpInfo {
    use Op::*;

    let (rs, rt, rd) = (inst.rs(), inst.rt(), inst.rd());
    let base = OpInfo::new(inst.name());
    let branch = OpFlags::END_BLOCK | OpFlags::DELAY_SLOT;
    let conditional = branch | OpFlags::CONDITIONAL;
    let likely = conditional | OpFlags::LIKELY;
    let trap = OpFlags::END_BLOCK | OpFlags::EXCEPTION | OpFlags::NO_REORDER;

    match inst.op() {
        Add | Sub => base.gpr_in(rs).gpr_in(rt).gpr_out(rd).with_flags(OpFlags::EXCEPTION),
        Addu | Subu | And | Or | Xor | Nor | Slt | Sltu | Daddu | Dsubu => {
            base.gpr_in(rs).gpr_in(rt).gpr_out(rd)
        }
        Sll | Srl | Sra | Dsll | Dsrl | Dsra | Dsll32 | Dsrl32 | Dsra32 => base.gpr_in(rt).gpr_out(rd),
        Sllv | Srlv | Srav | Dsllv | Dsrlv | Dsrav => base.gpr_in(rt).gpr_in(rs).gpr_out(rd),
        Addi => base.gpr_in(rs).gpr_out(rt).with_flags(OpFlags::EXCEPTION),
        Addiu | Slti | Sltiu | Andi | Ori | Xori | Daddiu => base.gpr_in(rs).gpr_out(rt),
        Lui => base.gpr_out(rt),

        Mfhi => base.reads(HI).gpr_out(rd),
        Mflo => base.reads(LO).gpr_out(rd),
        Mthi => base.gpr_in(rs).writes(HI),
        Mtlo => base.gpr_in(rs).writes(LO),
        Mult | Multu => base.gpr_in(rs).gpr_in(rt).writes(HI).writes(LO).cycles(5),
        Div | Divu => base.gpr_in(rs).gpr_in(rt).writes(HI).writes(LO).cycles(37),

        Lb | Lh | Lw | Lbu | Lhu | Lwu => base.gpr_in(rs).gpr_out(rt).with_flags(OpFlags::EXCEPTION),
        Sb | Sh | Sw => base.gpr_in(rs).gpr_in(rt).with_flags(OpFlags::STORE | OpFlags::EXCEPTION),
        Lwc1 => base.gpr_in(rs).writes_fpr(rt).with_flags(OpFlags::EXCEPTION),
        Swc1 => base.gpr_in(rs).reads_fpr(rt).with_flags(OpFlags::STORE | OpFlags::EXCEPTION),
        Mfc1 => base.reads_fpr(rd).gpr_out(rt),
        Mtc1 => base.gpr_in(rt).writes_fpr(rd),
        Sync | Cache => base.with_flags(OpFlags::NO_REORDER),

        J => base.with_flags(branch).target(inst.jump_target(address)),
        Jal => base.gpr_out(RA).with_flags(branch | OpFlags::CALL).target(inst.jump_target(address)),
        Jr if rs == RA => base.gpr_in(rs).with_flags(branch | OpFlags::RETURN),
        Jr => base.gpr_in(rs).with_flags(branch),
        Jalr => base.gpr_in(rs).gpr_out(rd).with_flags(branch | OpFlags::CALL),
        Beq | Bne => base.gpr_in(rs).gpr_in(rt).with_flags(conditional).target(inst.branch_target(address)),
        Beql | Bnel => base.gpr_in(rs).gpr_in(rt).with_flags(likely).target(inst.branch_target(address)),
        Blez | Bgtz | Bltz | Bgez => base.gpr_in(rs).with_flags(conditional).target(inst.branch_target(address)),
        Blezl | Bgtzl | Bltzl | Bgezl => base.gpr_in(rs).with_flags(likely).target(inst.branch_target(address)),
        Bltzal | Bgezal => base
            .gpr_in(rs)
            .gpr_out(RA)
            .with_flags(conditional | OpFlags::CALL)
            .target(inst.branch_target(address)),

        Syscall | Break | Reserved => base.with_flags(trap),
    }
}

/// The VR4300's integer pipeline as the recompiler sees it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Vr4300;

impl Architecture for Vr4300 {
    type Instruction = Instruction;

    const GPR_COUNT: usize = GPR_SLOTS;
    const FPR_COUNT: usize = FPR_SLOTS;
    const INSTRUCTION_SIZE: u32 = 4;

    fn decode(&self, memory: &mut dyn GuestMemory, address: u32) -> Result<Instruction, MemoryFault> {
        memory.read_code(address).map(decode)
    }

    fn info(&self, inst: &Instruction, address: u32) -> OpInfo {
        info(*inst, address)
    }

    fn encoding(&self, inst: &Instruction) -> u32 {
        inst.word()
    }

    fn disassemble(&self, inst: &Instruction, address: u32) -> String {
        inst.disassemble(address)
    }
}

const fn build_primary_table() -> [Entry; 64] {
    use Entry::*;

    [
        Special,
        RegImm,
        Op("j", self::Op::J),
        Op("jal", self::Op::Jal),
        Op("beq", self::Op::Beq),
        Op("bne", self::Op::Bne),
        Op("blez", self::Op::Blez),
        Op("bgtz", self::Op::Bgtz),
        Op("addi", self::Op::Addi),
        Op("addiu", self::Op::Addiu),
        Op("slti", self::Op::Slti),
        Op("sltiu", self::Op::Sltiu),
        Op("andi", self::Op::Andi),
        Op("ori", self::Op::Ori),
        Op("xori", self::Op::Xori),
        Op("lui", self::Op::Lui),
        // 0x10: COP0, COP1, COP2
        Reserved,
        Cop1,
        Reserved,
        Reserved,
        Op("beql", self::Op::Beql),
        Op("bnel", self::Op::Bnel),
        Op("blezl", self::Op::Blezl),
        Op("bgtzl", self::Op::Bgtzl),
        // DADDI needs 64-bit overflow detection
        Reserved,
        Op("daddiu", self::Op::Daddiu),
        // LDL, LDR
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        // 0x20
        Op("lb", self::Op::Lb),
        Op("lh", self::Op::Lh),
        Reserved, // LWL
        Op("lw", self::Op::Lw),
        Op("lbu", self::Op::Lbu),
        Op("lhu", self::Op::Lhu),
        Reserved, // LWR
        Op("lwu", self::Op::Lwu),
        Op("sb", self::Op::Sb),
        Op("sh", self::Op::Sh),
        Reserved, // SWL
        Op("sw", self::Op::Sw),
        Reserved, // SDL
        Reserved, // SDR
        Reserved, // SWR
        Op("cache", self::Op::Cache),
        // 0x30
        Reserved, // LL
        Op("lwc1", self::Op::Lwc1),
        Reserved,
        Reserved,
        Reserved, // LLD
        Reserved, // LDC1
        Reserved,
        Reserved, // LD
        Reserved, // SC
        Op("swc1", self::Op::Swc1),
        Reserved,
        Reserved,
        Reserved, // SCD
        Reserved, // SDC1
        Reserved,
        Reserved, // SD
    ]
}

const fn build_special_table() -> [Entry; 64] {
    use Entry::*;

    [
        // 0
        Op("sll", self::Op::Sll),
        Reserved,
        Op("srl", self::Op::Srl),
        Op("sra", self::Op::Sra),
        Op("sllv", self::Op::Sllv),
        Reserved,
        Op("srlv", self::Op::Srlv),
        Op("srav", self::Op::Srav),
        // 1
        Op("jr", self::Op::Jr),
        Op("jalr", self::Op::Jalr),
        Reserved,
        Reserved,
        Op("syscall", self::Op::Syscall),
        Op("break", self::Op::Break),
        Reserved,
        Op("sync", self::Op::Sync),
        // 2
        Op("mfhi", self::Op::Mfhi),
        Op("mthi", self::Op::Mthi),
        Op("mflo", self::Op::Mflo),
        Op("mtlo", self::Op::Mtlo),
        Op("dsllv", self::Op::Dsllv),
        Reserved,
        Op("dsrlv", self::Op::Dsrlv),
        Op("dsrav", self::Op::Dsrav),
        // 3
        Op("mult", self::Op::Mult),
        Op("multu", self::Op::Multu),
        Op("div", self::Op::Div),
        Op("divu", self::Op::Divu),
        Reserved, // DMULT
        Reserved, // DMULTU
        Reserved, // DDIV
        Reserved, // DDIVU
        // 4
        Op("add", self::Op::Add),
        Op("addu", self::Op::Addu),
        Op("sub", self::Op::Sub),
        Op("subu", self::Op::Subu),
        Op("and", self::Op::And),
        Op("or", self::Op::Or),
        Op("xor", self::Op::Xor),
        Op("nor", self::Op::Nor),
        // 5
        Reserved,
        Reserved,
        Op("slt", self::Op::Slt),
        Op("sltu", self::Op::Sltu),
        Reserved, // DADD
        Op("daddu", self::Op::Daddu),
        Reserved, // DSUB
        Op("dsubu", self::Op::Dsubu),
        // 6: traps
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        Reserved,
        // 7
        Op("dsll", self::Op::Dsll),
        Reserved,
        Op("dsrl", self::Op::Dsrl),
        Op("dsra", self::Op::Dsra),
        Op("dsll32", self::Op::Dsll32),
        Reserved,
        Op("dsrl32", self::Op::Dsrl32),
        Op("dsra32", self::Op::Dsra32),
    ]
}

const fn build_regimm_table() -> [Entry; 32] {
    use Entry::*;

    let mut table = [Reserved; 32];
    table[0x00] = Op("bltz", self::Op::Bltz);
    table[0x01] = Op("bgez", self::Op::Bgez);
    table[0x02] = Op("bltzl", self::Op::Bltzl);
    table[0x03] = Op("bgezl", self::Op::Bgezl);
    table[0x10] = Op("bltzal", self::Op::Bltzal);
    table[0x11] = Op("bgezal", self::Op::Bgezal);
    table
}

const PRIMARY_TABLE: [Entry; 64] = build_primary_table();
const SPECIAL_TABLE: [Entry; 64] = build_special_table();
const REGIMM_TABLE: [Entry; 32] = build_regimm_table();
