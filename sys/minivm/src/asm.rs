// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Programmatic instruction builders.
//!
//! The text assembler lives in the toolchain; this module is the
//! word-level encoding layer it (and every test in this workspace) sits
//! on. Builders panic on out-of-range operands -- they are called with
//! literals, and a silent truncation would just move the failure into a
//! running guest.

use crate::isa::{Instr, Opcode};

fn reg(r: u8) -> u8 {
    assert!(r < 16, "register r{r} out of range");
    r
}

fn simm12(v: i32) -> u16 {
    assert!((-2048..=2047).contains(&v), "immediate {v} exceeds 12 bits");
    (v & 0xFFF) as u16
}

fn uimm12(v: u32) -> u16 {
    assert!(v <= 0xFFF, "address {v:#x} exceeds 12 bits");
    v as u16
}

fn rrr(opcode: Opcode, rd: u8, rs1: u8, rs2: u8) -> u32 {
    Instr {
        opcode,
        rd: reg(rd),
        rs1: reg(rs1),
        rs2: reg(rs2),
        imm_form: false,
        imm12: 0,
    }
    .encode()
}

fn rri(opcode: Opcode, rd: u8, rs1: u8, imm: i32) -> u32 {
    Instr {
        opcode,
        rd: reg(rd),
        rs1: reg(rs1),
        rs2: 0,
        imm_form: true,
        imm12: simm12(imm),
    }
    .encode()
}

macro_rules! alu_builders {
    ($(($name:ident, $namei:ident, $op:ident),)*) => {
        $(
            pub fn $name(rd: u8, rs1: u8, rs2: u8) -> u32 {
                rrr(Opcode::$op, rd, rs1, rs2)
            }
            pub fn $namei(rd: u8, rs1: u8, imm: i32) -> u32 {
                rri(Opcode::$op, rd, rs1, imm)
            }
        )*
    };
}

alu_builders! {
    (add, addi, Add),
    (sub, subi, Sub),
    (mul, muli, Mul),
    (div, divi, Div),
    (rem, remi, Mod),
    (and, andi, And),
    (or, ori, Or),
    (xor, xori, Xor),
    (shl, shli, Shl),
    (shr, shri, Shr),
    (sar, sari, Sar),
    (adc, adci, Adc),
    (sbc, sbci, Sbc),
}

pub fn not(rd: u8, rs1: u8) -> u32 {
    rrr(Opcode::Not, rd, rs1, 0)
}

pub fn cmp(rs1: u8, rs2: u8) -> u32 {
    rrr(Opcode::Cmp, 0, rs1, rs2)
}

pub fn cmpi(rs1: u8, imm: i32) -> u32 {
    rri(Opcode::Cmp, 0, rs1, imm)
}

/// `rd = sign_extend(imm12)`.
pub fn ldi(rd: u8, imm: i32) -> u32 {
    rri(Opcode::Ldi, rd, 0, imm)
}

/// Full-width immediate load; occupies two words.
pub fn ldi32(rd: u8, value: u32) -> [u32; 2] {
    [
        Instr {
            opcode: Opcode::Ldi32,
            rd: reg(rd),
            rs1: 0,
            rs2: 0,
            imm_form: true,
            imm12: 0,
        }
        .encode(),
        value,
    ]
}

/// `rd = [rs1 + disp]`.
pub fn ld(rd: u8, rs1: u8, disp: i32) -> u32 {
    rri(Opcode::Ld, rd, rs1, disp)
}

/// `[rs1 + disp] = rd`.
pub fn st(rs1: u8, disp: i32, rd: u8) -> u32 {
    rri(Opcode::St, rd, rs1, disp)
}

/// Absolute jump to a code offset.
pub fn jmp(target: u32) -> u32 {
    Instr {
        opcode: Opcode::Jmp,
        rd: 0,
        rs1: 0,
        rs2: 0,
        imm_form: true,
        imm12: uimm12(target),
    }
    .encode()
}

/// Jump to `target` when `reg[rd] == 0`.
pub fn jz(rd: u8, target: u32) -> u32 {
    Instr {
        opcode: Opcode::Jz,
        rd: reg(rd),
        rs1: 0,
        rs2: 0,
        imm_form: true,
        imm12: uimm12(target),
    }
    .encode()
}

/// Jump to `target` when `reg[rd] != 0`.
pub fn jnz(rd: u8, target: u32) -> u32 {
    Instr {
        opcode: Opcode::Jnz,
        rd: reg(rd),
        rs1: 0,
        rs2: 0,
        imm_form: true,
        imm12: uimm12(target),
    }
    .encode()
}

/// PC-relative call; `offset` is relative to the CALL's own address.
pub fn call(offset: i32) -> u32 {
    Instr {
        opcode: Opcode::Call,
        rd: 0,
        rs1: 0,
        rs2: 0,
        imm_form: true,
        imm12: simm12(offset),
    }
    .encode()
}

/// Indirect call through `rs1`.
pub fn callr(rs1: u8) -> u32 {
    rrr(Opcode::Callr, 0, rs1, 0)
}

pub fn ret() -> u32 {
    rrr(Opcode::Ret, 0, 0, 0)
}

pub fn push(rd: u8) -> u32 {
    rrr(Opcode::Push, rd, 0, 0)
}

pub fn pop(rd: u8) -> u32 {
    rrr(Opcode::Pop, rd, 0, 0)
}

pub fn brk() -> u32 {
    rrr(Opcode::Brk, 0, 0, 0)
}

/// System call trap for `(module, function)`.
pub fn svc(module: u8, function: u8) -> u32 {
    Instr {
        opcode: Opcode::Svc,
        rd: 0,
        rs1: 0,
        rs2: 0,
        imm_form: true,
        imm12: hsx_abi::svc_imm(module, function),
    }
    .encode()
}

macro_rules! float_builders {
    ($(($name:ident, $op:ident),)*) => {
        $(
            pub fn $name(rd: u8, rs1: u8, rs2: u8) -> u32 {
                rrr(Opcode::$op, rd, rs1, rs2)
            }
        )*
    };
}

float_builders! {
    (fadd, Fadd),
    (fsub, Fsub),
    (fmul, Fmul),
    (fdiv, Fdiv),
}

pub fn f2i(rd: u8, rs1: u8) -> u32 {
    rrr(Opcode::F2i, rd, rs1, 0)
}

pub fn i2f(rd: u8, rs1: u8) -> u32 {
    rrr(Opcode::I2f, rd, rs1, 0)
}

pub fn h2f(rd: u8, rs1: u8) -> u32 {
    rrr(Opcode::H2f, rd, rs1, 0)
}

pub fn f2h(rd: u8, rs1: u8) -> u32 {
    rrr(Opcode::F2h, rd, rs1, 0)
}

/// Flattens a word program into the byte layout the loader expects.
pub fn words_to_bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}
