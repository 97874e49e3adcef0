// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Instruction rendering for the debug surface.
//!
//! Output follows the assembler's canonical operand forms. Absolute
//! control transfers show both the raw 12-bit field and the effective
//! 32-bit target; CALL resolves its pc-relative target from the address
//! being disassembled.

use crate::isa::{Instr, Opcode};

/// One rendered instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Line {
    pub text: String,
    /// Words consumed: 1, or 2 for LDI32.
    pub words: usize,
}

/// Renders the instruction at code offset `pc`. `next_word` supplies the
/// immediate word for LDI32 when available.
pub fn disasm_at(pc: u32, word: u32, next_word: Option<u32>) -> Line {
    let instr = match Instr::decode(word) {
        Ok(i) => i,
        Err(op) => {
            return Line {
                text: format!(".word {word:#010x} ; unknown opcode {op:#04x}"),
                words: 1,
            }
        }
    };

    use Opcode::*;
    let m = instr.opcode.mnemonic();
    let (text, words) = match instr.opcode {
        Add | Sub | Mul | Div | Mod | And | Or | Xor | Shl | Shr | Sar
        | Adc | Sbc => (
            format!("{m} r{}, r{}, {}", instr.rd, instr.rs1, operand2(&instr)),
            1,
        ),
        Not => (format!("{m} r{}, r{}", instr.rd, instr.rs1), 1),
        Cmp => (format!("{m} r{}, {}", instr.rs1, operand2(&instr)), 1),
        Ldi => (format!("{m} r{}, #{}", instr.rd, instr.simm()), 1),
        Ldi32 => match next_word {
            Some(v) => (format!("{m} r{}, #{v:#x}", instr.rd), 2),
            None => (format!("{m} r{}, <truncated>", instr.rd), 2),
        },
        Ld => (
            format!("{m} r{}, [r{}{}]", instr.rd, instr.rs1, disp(&instr)),
            1,
        ),
        St => (
            format!("{m} [r{}{}], r{}", instr.rs1, disp(&instr), instr.rd),
            1,
        ),
        Jmp => (
            format!("{m} {:#x} ; target={:#010x}", instr.uimm(), instr.uimm()),
            1,
        ),
        Jz | Jnz => (
            format!(
                "{m} r{}, {:#x} ; target={:#010x}",
                instr.rd,
                instr.uimm(),
                instr.uimm()
            ),
            1,
        ),
        Call => {
            let target = pc.wrapping_add(instr.simm() as u32) & 0xFFFF;
            (format!("{m} {} ; target={target:#010x}", instr.simm()), 1)
        }
        Callr => (format!("{m} r{}", instr.rs1), 1),
        Ret | Brk => (m.to_string(), 1),
        Push | Pop => (format!("{m} r{}", instr.rd), 1),
        Svc => {
            let (module, function) = hsx_abi::svc_split(instr.imm12);
            (format!("{m} {module:#04x}, {function}"), 1)
        }
        Fadd | Fsub | Fmul | Fdiv => (
            format!("{m} r{}, r{}, r{}", instr.rd, instr.rs1, instr.rs2),
            1,
        ),
        F2i | I2f | H2f | F2h => {
            (format!("{m} r{}, r{}", instr.rd, instr.rs1), 1)
        }
    };
    Line { text, words }
}

/// Disassembles a run of code words starting at `base`, yielding
/// `(offset, text)` pairs.
pub fn disasm_range(base: u32, words: &[u32]) -> Vec<(u32, String)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < words.len() {
        let pc = base + 4 * i as u32;
        let line = disasm_at(pc, words[i], words.get(i + 1).copied());
        out.push((pc, line.text));
        i += line.words;
    }
    out
}

fn operand2(instr: &Instr) -> String {
    if instr.imm_form {
        format!("#{}", instr.simm())
    } else {
        format!("r{}", instr.rs2)
    }
}

fn disp(instr: &Instr) -> String {
    let d = instr.simm();
    if d >= 0 {
        format!("+{d}")
    } else {
        format!("{d}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm;

    #[test]
    fn renders_alu_forms() {
        assert_eq!(disasm_at(0, asm::add(1, 2, 3), None).text, "add r1, r2, r3");
        assert_eq!(
            disasm_at(0, asm::subi(1, 2, -5), None).text,
            "sub r1, r2, #-5"
        );
        assert_eq!(disasm_at(0, asm::cmpi(4, 9), None).text, "cmp r4, #9");
        assert_eq!(disasm_at(0, asm::not(1, 2), None).text, "not r1, r2");
    }

    #[test]
    fn renders_memory_forms() {
        assert_eq!(disasm_at(0, asm::ld(1, 2, 8), None).text, "ld r1, [r2+8]");
        assert_eq!(
            disasm_at(0, asm::st(2, -4, 1), None).text,
            "st [r2-4], r1"
        );
    }

    #[test]
    fn jmp_shows_raw_and_effective() {
        assert_eq!(
            disasm_at(0, asm::jmp(0xA10), None).text,
            "jmp 0xa10 ; target=0x00000a10"
        );
        assert_eq!(
            disasm_at(0, asm::jz(3, 0x20), None).text,
            "jz r3, 0x20 ; target=0x00000020"
        );
    }

    #[test]
    fn call_resolves_relative_target() {
        assert_eq!(
            disasm_at(0x081C, asm::call(-1620), None).text,
            "call -1620 ; target=0x000001c8"
        );
    }

    #[test]
    fn ldi32_consumes_two_words() {
        let [w0, w1] = asm::ldi32(2, 0xDEAD_BEEF);
        let line = disasm_at(0, w0, Some(w1));
        assert_eq!(line.text, "ldi32 r2, #0xdeadbeef");
        assert_eq!(line.words, 2);
    }

    #[test]
    fn svc_shows_module_and_function() {
        assert_eq!(disasm_at(0, asm::svc(0x05, 3), None).text, "svc 0x05, 3");
    }

    #[test]
    fn range_walk_steps_over_wide_instructions() {
        let mut words = vec![asm::ldi(1, 4)];
        words.extend(asm::ldi32(2, 77));
        words.push(asm::ret());
        let lines = disasm_range(0, &words);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].0, 0);
        assert_eq!(lines[1].0, 4);
        assert_eq!(lines[2].0, 12);
        assert_eq!(lines[2].1, "ret");
    }

    #[test]
    fn unknown_words_render_as_data() {
        let line = disasm_at(0, 0x3F << 26, None);
        assert!(line.text.starts_with(".word"));
    }
}
