//! Encoders for the instructions the core decodes, for building guest programs in code.
//!
//! Registers are plain numbers. Branch offsets count instructions from the delay slot.

use crate::instructions::{IType, JType, RType};

fn special(rs: u8, rt: u8, rd: u8, sa: u8, funct: u8) -> u32 {
    RType::encode(0x00, rs, rt, rd, sa, funct)
}

fn imm(op: u8, rs: u8, rt: u8, value: i16) -> u32 {
    IType::encode(op, rs, rt, value as u16)
}

fn uimm(op: u8, rs: u8, rt: u8, value: u16) -> u32 {
    IType::encode(op, rs, rt, value)
}

fn regimm(rs: u8, kind: u8, offset: i16) -> u32 {
    IType::encode(0x01, rs, kind, offset as u16)
}

pub fn nop() -> u32 {
    0
}

pub fn sll(rd: u8, rt: u8, sa: u8) -> u32 {
    special(0, rt, rd, sa, 0x00)
}

pub fn srl(rd: u8, rt: u8, sa: u8) -> u32 {
    special(0, rt, rd, sa, 0x02)
}

pub fn sra(rd: u8, rt: u8, sa: u8) -> u32 {
    special(0, rt, rd, sa, 0x03)
}

pub fn sllv(rd: u8, rt: u8, rs: u8) -> u32 {
    special(rs, rt, rd, 0, 0x04)
}

pub fn srav(rd: u8, rt: u8, rs: u8) -> u32 {
    special(rs, rt, rd, 0, 0x07)
}

pub fn jr(rs: u8) -> u32 {
    special(rs, 0, 0, 0, 0x08)
}

pub fn jalr(rd: u8, rs: u8) -> u32 {
    special(rs, 0, rd, 0, 0x09)
}

pub fn syscall() -> u32 {
    special(0, 0, 0, 0, 0x0c)
}

pub fn brk() -> u32 {
    special(0, 0, 0, 0, 0x0d)
}

pub fn mfhi(rd: u8) -> u32 {
    special(0, 0, rd, 0, 0x10)
}

pub fn mthi(rs: u8) -> u32 {
    special(rs, 0, 0, 0, 0x11)
}

pub fn mflo(rd: u8) -> u32 {
    special(0, 0, rd, 0, 0x12)
}

pub fn mtlo(rs: u8) -> u32 {
    special(rs, 0, 0, 0, 0x13)
}

pub fn mult(rs: u8, rt: u8) -> u32 {
    special(rs, rt, 0, 0, 0x18)
}

pub fn multu(rs: u8, rt: u8) -> u32 {
    special(rs, rt, 0, 0, 0x19)
}

pub fn div(rs: u8, rt: u8) -> u32 {
    special(rs, rt, 0, 0, 0x1a)
}

pub fn divu(rs: u8, rt: u8) -> u32 {
    special(rs, rt, 0, 0, 0x1b)
}

pub fn add(rd: u8, rs: u8, rt: u8) -> u32 {
    special(rs, rt, rd, 0, 0x20)
}

pub fn addu(rd: u8, rs: u8, rt: u8) -> u32 {
    special(rs, rt, rd, 0, 0x21)
}

pub fn sub(rd: u8, rs: u8, rt: u8) -> u32 {
    special(rs, rt, rd, 0, 0x22)
}

pub fn subu(rd: u8, rs: u8, rt: u8) -> u32 {
    special(rs, rt, rd, 0, 0x23)
}

pub fn and(rd: u8, rs: u8, rt: u8) -> u32 {
    special(rs, rt, rd, 0, 0x24)
}

pub fn or(rd: u8, rs: u8, rt: u8) -> u32 {
    special(rs, rt, rd, 0, 0x25)
}

pub fn xor(rd: u8, rs: u8, rt: u8) -> u32 {
    special(rs, rt, rd, 0, 0x26)
}

pub fn nor(rd: u8, rs: u8, rt: u8) -> u32 {
    special(rs, rt, rd, 0, 0x27)
}

pub fn slt(rd: u8, rs: u8, rt: u8) -> u32 {
    special(rs, rt, rd, 0, 0x2a)
}

pub fn sltu(rd: u8, rs: u8, rt: u8) -> u32 {
    special(rs, rt, rd, 0, 0x2b)
}

pub fn daddu(rd: u8, rs: u8, rt: u8) -> u32 {
    special(rs, rt, rd, 0, 0x2d)
}

pub fn dsll32(rd: u8, rt: u8, sa: u8) -> u32 {
    special(0, rt, rd, sa, 0x3c)
}

pub fn dsra32(rd: u8, rt: u8, sa: u8) -> u32 {
    special(0, rt, rd, sa, 0x3f)
}

pub fn bltz(rs: u8, offset: i16) -> u32 {
    regimm(rs, 0x00, offset)
}

pub fn bgez(rs: u8, offset: i16) -> u32 {
    regimm(rs, 0x01, offset)
}

pub fn bltzl(rs: u8, offset: i16) -> u32 {
    regimm(rs, 0x02, offset)
}

pub fn bgezl(rs: u8, offset: i16) -> u32 {
    regimm(rs, 0x03, offset)
}

pub fn bgezal(rs: u8, offset: i16) -> u32 {
    regimm(rs, 0x11, offset)
}

pub fn j(target: u32) -> u32 {
    JType::encode(0x02, target >> 2)
}

pub fn jal(target: u32) -> u32 {
    JType::encode(0x03, target >> 2)
}

pub fn beq(rs: u8, rt: u8, offset: i16) -> u32 {
    imm(0x04, rs, rt, offset)
}

pub fn bne(rs: u8, rt: u8, offset: i16) -> u32 {
    imm(0x05, rs, rt, offset)
}

pub fn blez(rs: u8, offset: i16) -> u32 {
    imm(0x06, rs, 0, offset)
}

pub fn bgtz(rs: u8, offset: i16) -> u32 {
    imm(0x07, rs, 0, offset)
}

pub fn addi(rt: u8, rs: u8, value: i16) -> u32 {
    imm(0x08, rs, rt, value)
}

pub fn addiu(rt: u8, rs: u8, value: i16) -> u32 {
    imm(0x09, rs, rt, value)
}

pub fn slti(rt: u8, rs: u8, value: i16) -> u32 {
    imm(0x0a, rs, rt, value)
}

pub fn sltiu(rt: u8, rs: u8, value: i16) -> u32 {
    imm(0x0b, rs, rt, value)
}

pub fn andi(rt: u8, rs: u8, value: u16) -> u32 {
    uimm(0x0c, rs, rt, value)
}

pub fn ori(rt: u8, rs: u8, value: u16) -> u32 {
    uimm(0x0d, rs, rt, value)
}

pub fn xori(rt: u8, rs: u8, value: u16) -> u32 {
    uimm(0x0e, rs, rt, value)
}

pub fn lui(rt: u8, value: u16) -> u32 {
    uimm(0x0f, 0, rt, value)
}

pub fn beql(rs: u8, rt: u8, offset: i16) -> u32 {
    imm(0x14, rs, rt, offset)
}

pub fn bnel(rs: u8, rt: u8, offset: i16) -> u32 {
    imm(0x15, rs, rt, offset)
}

pub fn daddiu(rt: u8, rs: u8, value: i16) -> u32 {
    imm(0x19, rs, rt, value)
}

pub fn lb(rt: u8, offset: i16, base: u8) -> u32 {
    imm(0x20, base, rt, offset)
}

pub fn lh(rt: u8, offset: i16, base: u8) -> u32 {
    imm(0x21, base, rt, offset)
}

pub fn lw(rt: u8, offset: i16, base: u8) -> u32 {
    imm(0x23, base, rt, offset)
}

pub fn lbu(rt: u8, offset: i16, base: u8) -> u32 {
    imm(0x24, base, rt, offset)
}

pub fn lhu(rt: u8, offset: i16, base: u8) -> u32 {
    imm(0x25, base, rt, offset)
}

pub fn lwu(rt: u8, offset: i16, base: u8) -> u32 {
    imm(0x27, base, rt, offset)
}

pub fn sb(rt: u8, offset: i16, base: u8) -> u32 {
    imm(0x28, base, rt, offset)
}

pub fn sh(rt: u8, offset: i16, base: u8) -> u32 {
    imm(0x29, base, rt, offset)
}

pub fn sw(rt: u8, offset: i16, base: u8) -> u32 {
    imm(0x2b, base, rt, offset)
}

pub fn lwc1(ft: u8, offset: i16, base: u8) -> u32 {
    imm(0x31, base, ft, offset)
}

pub fn swc1(ft: u8, offset: i16, base: u8) -> u32 {
    imm(0x39, base, ft, offset)
}

pub fn mfc1(rt: u8, fs: u8) -> u32 {
    RType::encode(0x11, 0x00, rt, fs, 0, 0)
}

pub fn mtc1(rt: u8, fs: u8) -> u32 {
    RType::encode(0x11, 0x04, rt, fs, 0, 0)
}
