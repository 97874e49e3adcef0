// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The fetch/decode/execute core.

use hsx_abi::{svc_split, FaultKind};

use crate::float::{f2h, h2f};
use crate::isa::{Instr, Opcode};
use crate::psw::Psw;
use crate::ram::Ram;
use crate::StepOutcome;

/// Everything the VM needs to run one task, bound by reference at each
/// step. Context switch is reassignment of which `TaskContext` gets
/// passed in; nothing is copied.
#[derive(Copy, Clone, Debug)]
pub struct TaskContext {
    /// Byte offset into the task's code section.
    pub pc: u32,
    pub psw: Psw,
    /// 16-bit guest stack pointer: a two's-complement displacement from
    /// `stack_base`, 0 when the stack is empty.
    pub sp16: u16,
    /// RAM address of the 16-word register bank.
    pub reg_base: u32,
    /// RAM address of the initial stack top (highest address, exclusive
    /// end of the stack slice).
    pub stack_base: u32,
    /// Low guard; pushes below this address fault.
    pub stack_limit: u32,
}

impl TaskContext {
    /// Absolute address of the current stack top.
    pub fn sp_abs(&self) -> u32 {
        self.stack_base.wrapping_add(self.sp16 as i16 as i32 as u32)
    }

    pub fn reg_addr(&self, r: u8) -> u32 {
        self.reg_base + 4 * u32::from(r)
    }
}

/// Executes exactly one instruction for the bound context.
pub fn step(ctx: &mut TaskContext, ram: &mut Ram, code: &[u8]) -> StepOutcome {
    match step_inner(ctx, ram, code) {
        Ok(outcome) => outcome,
        Err(fault) => StepOutcome::Fault(fault),
    }
}

fn fetch(code: &[u8], pc: u32) -> Result<u32, FaultKind> {
    if pc % 4 != 0 {
        return Err(FaultKind::UnalignedAccess { addr: pc });
    }
    let end = pc.checked_add(4).ok_or(FaultKind::PcOutOfRange { pc })?;
    if end as usize > code.len() {
        return Err(FaultKind::PcOutOfRange { pc });
    }
    let i = pc as usize;
    Ok(u32::from_le_bytes([
        code[i],
        code[i + 1],
        code[i + 2],
        code[i + 3],
    ]))
}

fn reg(ctx: &TaskContext, ram: &Ram, r: u8) -> Result<u32, FaultKind> {
    Ok(ram.read_u32(ctx.reg_addr(r))?)
}

fn set_reg(
    ctx: &TaskContext,
    ram: &mut Ram,
    r: u8,
    v: u32,
) -> Result<(), FaultKind> {
    Ok(ram.write_u32(ctx.reg_addr(r), v)?)
}

fn step_inner(
    ctx: &mut TaskContext,
    ram: &mut Ram,
    code: &[u8],
) -> Result<StepOutcome, FaultKind> {
    let word = fetch(code, ctx.pc)?;
    let instr = Instr::decode(word)
        .map_err(|opcode| FaultKind::UnknownOpcode { opcode })?;

    use Opcode::*;
    match instr.opcode {
        Add | Sub | Mul | Div | Mod | And | Or | Xor | Shl | Shr | Sar
        | Adc | Sbc | Cmp => {
            let a = reg(ctx, ram, instr.rs1)?;
            let b = if instr.imm_form {
                instr.simm() as u32
            } else {
                reg(ctx, ram, instr.rs2)?
            };
            let result = alu(instr.opcode, a, b, &mut ctx.psw)?;
            if instr.opcode != Cmp {
                set_reg(ctx, ram, instr.rd, result)?;
            }
            ctx.pc += 4;
        }
        Not => {
            let a = reg(ctx, ram, instr.rs1)?;
            let result = !a;
            ctx.psw.set_zncv(result, false, false);
            set_reg(ctx, ram, instr.rd, result)?;
            ctx.pc += 4;
        }
        Ldi => {
            set_reg(ctx, ram, instr.rd, instr.simm() as u32)?;
            ctx.pc += 4;
        }
        Ldi32 => {
            let value = fetch(code, ctx.pc + 4)?;
            set_reg(ctx, ram, instr.rd, value)?;
            ctx.pc += 8;
        }
        Ld => {
            let addr = reg(ctx, ram, instr.rs1)?.wrapping_add(instr.simm() as u32);
            let value = ram.read_u32(addr)?;
            set_reg(ctx, ram, instr.rd, value)?;
            ctx.pc += 4;
        }
        St => {
            let addr = reg(ctx, ram, instr.rs1)?.wrapping_add(instr.simm() as u32);
            let value = reg(ctx, ram, instr.rd)?;
            ram.write_u32(addr, value)?;
            ctx.pc += 4;
        }
        Jmp => {
            // Absolute, zero-extended. Range is validated at next fetch.
            ctx.pc = instr.uimm();
        }
        Jz => {
            if reg(ctx, ram, instr.rd)? == 0 {
                ctx.pc = instr.uimm();
            } else {
                ctx.pc += 4;
            }
        }
        Jnz => {
            if reg(ctx, ram, instr.rd)? != 0 {
                ctx.pc = instr.uimm();
            } else {
                ctx.pc += 4;
            }
        }
        Call => {
            push(ctx, ram, ctx.pc + 4)?;
            ctx.pc = ctx.pc.wrapping_add(instr.simm() as u32) & 0xFFFF;
        }
        Callr => {
            let target = reg(ctx, ram, instr.rs1)?;
            push(ctx, ram, ctx.pc + 4)?;
            ctx.pc = target;
        }
        Ret => {
            ctx.pc = pop(ctx, ram)?;
        }
        Push => {
            let value = reg(ctx, ram, instr.rd)?;
            push(ctx, ram, value)?;
            ctx.pc += 4;
        }
        Pop => {
            let value = pop(ctx, ram)?;
            set_reg(ctx, ram, instr.rd, value)?;
            ctx.pc += 4;
        }
        Brk => {
            // pc intentionally left at the BRK so a debugger sees the
            // trap site; the executive resumes past it.
            return Ok(StepOutcome::BrkTrap);
        }
        Svc => {
            let (module, function) = svc_split(instr.imm12);
            // pc advances first: the task resumes after the trap.
            ctx.pc += 4;
            return Ok(StepOutcome::SvcTrap { module, function });
        }
        Fadd | Fsub | Fmul | Fdiv => {
            let a = h2f(reg(ctx, ram, instr.rs1)? as u16);
            let b = h2f(reg(ctx, ram, instr.rs2)? as u16);
            let r = match instr.opcode {
                Fadd => a + b,
                Fsub => a - b,
                Fmul => a * b,
                _ => a / b, // IEEE semantics; division by zero is inf/NaN
            };
            let bits = f2h(r);
            set_reg(ctx, ram, instr.rd, u32::from(bits))?;
            ctx.psw.set_flags(
                bits & 0x7FFF == 0,
                bits & 0x8000 != 0,
                false,
                false,
            );
            ctx.pc += 4;
        }
        F2i => {
            let value = h2f(reg(ctx, ram, instr.rs1)? as u16);
            // Saturating truncation; NaN becomes 0.
            set_reg(ctx, ram, instr.rd, value as i32 as u32)?;
            ctx.pc += 4;
        }
        I2f => {
            let value = reg(ctx, ram, instr.rs1)? as i32;
            set_reg(ctx, ram, instr.rd, u32::from(f2h(value as f32)))?;
            ctx.pc += 4;
        }
        H2f => {
            let value = h2f(reg(ctx, ram, instr.rs1)? as u16);
            set_reg(ctx, ram, instr.rd, value.to_bits())?;
            ctx.pc += 4;
        }
        F2h => {
            let value = f32::from_bits(reg(ctx, ram, instr.rs1)?);
            set_reg(ctx, ram, instr.rd, u32::from(f2h(value)))?;
            ctx.pc += 4;
        }
    }
    Ok(StepOutcome::Ok)
}

/// Integer ALU with the PSW update rules.
fn alu(op: Opcode, a: u32, b: u32, psw: &mut Psw) -> Result<u32, FaultKind> {
    use Opcode::*;
    let result = match op {
        Add => {
            let (r, carry) = a.overflowing_add(b);
            let v = (!(a ^ b) & (a ^ r)) >> 31 != 0;
            psw.set_zncv(r, carry, v);
            r
        }
        Adc => {
            let cin = u32::from(psw.c());
            let wide = u64::from(a) + u64::from(b) + u64::from(cin);
            let r = wide as u32;
            let signed = i64::from(a as i32) + i64::from(b as i32) + i64::from(cin);
            psw.set_zncv(
                r,
                wide > u64::from(u32::MAX),
                signed != i64::from(r as i32),
            );
            r
        }
        Sub | Cmp => {
            let (r, borrow) = a.overflowing_sub(b);
            let v = ((a ^ b) & (a ^ r)) >> 31 != 0;
            psw.set_zncv(r, borrow, v);
            r
        }
        Sbc => {
            let bin = u64::from(psw.c());
            let r = a.wrapping_sub(b).wrapping_sub(bin as u32);
            let borrow = u64::from(a) < u64::from(b) + bin;
            let signed = i64::from(a as i32) - i64::from(b as i32) - bin as i64;
            psw.set_zncv(r, borrow, signed != i64::from(r as i32));
            r
        }
        Mul => {
            let wide = i64::from(a as i32) * i64::from(b as i32);
            let r = wide as u32;
            psw.set_zncv(r, false, wide != i64::from(r as i32));
            r
        }
        Div => {
            if b == 0 {
                return Err(FaultKind::DivideByZero);
            }
            let overflow = a as i32 == i32::MIN && b as i32 == -1;
            let r = (a as i32).wrapping_div(b as i32) as u32;
            psw.set_zncv(r, false, overflow);
            r
        }
        Mod => {
            if b == 0 {
                return Err(FaultKind::DivideByZero);
            }
            let r = (a as i32).wrapping_rem(b as i32) as u32;
            psw.set_zncv(r, false, false);
            r
        }
        And => logic(psw, a & b),
        Or => logic(psw, a | b),
        Xor => logic(psw, a ^ b),
        Shl => {
            let amt = b & 31;
            let r = a << amt;
            let carry = amt > 0 && (a >> (32 - amt)) & 1 != 0;
            psw.set_zncv(r, carry, false);
            r
        }
        Shr => {
            let amt = b & 31;
            let r = a >> amt;
            let carry = amt > 0 && (a >> (amt - 1)) & 1 != 0;
            psw.set_zncv(r, carry, false);
            r
        }
        Sar => {
            let amt = b & 31;
            let r = ((a as i32) >> amt) as u32;
            let carry = amt > 0 && (a >> (amt - 1)) & 1 != 0;
            psw.set_zncv(r, carry, false);
            r
        }
        _ => unreachable!("non-ALU opcode routed to alu()"),
    };
    Ok(result)
}

fn logic(psw: &mut Psw, r: u32) -> u32 {
    psw.set_zncv(r, false, false);
    r
}

/// Stack push with the guard check. `sp16` only moves once the write is
/// known to land inside the stack slice.
fn push(ctx: &mut TaskContext, ram: &mut Ram, value: u32) -> Result<(), FaultKind> {
    let new_sp = ctx.sp16.wrapping_sub(4);
    let addr = ctx.stack_base.wrapping_add(new_sp as i16 as i32 as u32);
    if addr < ctx.stack_limit || addr >= ctx.stack_base {
        return Err(FaultKind::StackOverflow { addr });
    }
    ram.write_u32(addr, value)?;
    ctx.sp16 = new_sp;
    Ok(())
}

/// Stack pop; underflow is popping with nothing pushed.
fn pop(ctx: &mut TaskContext, ram: &mut Ram) -> Result<u32, FaultKind> {
    if ctx.sp16 == 0 {
        return Err(FaultKind::StackUnderflow);
    }
    let value = ram.read_u32(ctx.sp_abs())?;
    ctx.sp16 = ctx.sp16.wrapping_add(4);
    Ok(value)
}
