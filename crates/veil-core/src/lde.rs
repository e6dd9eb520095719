//! Length-disassembler
//!
//! Pure instruction-length computation over a byte slice, covering the
//! encodings that appear in function prologues: legacy and REX prefixes,
//! the common one-byte opcode map, conditional/unconditional branches, the
//! ModR/M groups, and the `0F 38`/`0F 3A` escapes. A return of 0 means the
//! first instruction could not be classified; callers must treat that as a
//! hard failure rather than guessing.

/// Instruction length in bytes, or 0 when the leading opcode is not in the
/// covered set or the slice is too short to hold the full instruction.
pub fn length(bytes: &[u8], bitness: u32) -> usize {
    let mut i = 0;
    let mut operand_16 = false;
    let mut rex_w = false;

    // Prefixes: segment overrides, size overrides, LOCK/REP, and REX on
    // 64-bit.
    loop {
        let Some(&b) = bytes.get(i) else { return 0 };
        match b {
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x67 | 0xF0 | 0xF2 | 0xF3 => i += 1,
            0x66 => {
                operand_16 = true;
                i += 1;
            }
            0x40..=0x4F if bitness == 64 => {
                rex_w = b & 0x08 != 0;
                i += 1;
            }
            _ => break,
        }
    }

    let imm_z = if operand_16 { 2 } else { 4 };

    let Some(&opcode) = bytes.get(i) else { return 0 };
    i += 1;

    let total = match opcode {
        0x0F => {
            let Some(&second) = bytes.get(i) else { return 0 };
            i += 1;
            match second {
                // Conditional near jumps
                0x80..=0x8F => Some(i + 4),
                // Three-byte escapes always carry ModR/M; 0F 3A adds imm8
                0x38 => {
                    i += 1; // third opcode byte
                    modrm_len(bytes, i).map(|m| i + m)
                }
                0x3A => {
                    i += 1;
                    modrm_len(bytes, i).map(|m| i + m + 1)
                }
                // Anything else in the two-byte map is out of the covered
                // set; refuse rather than under-count.
                _ => None,
            }
        }

        // Single-byte instructions. 0x40-0x4F only reaches here on 32-bit,
        // where it is the INC/DEC register row rather than a REX prefix.
        0x40..=0x4F | 0x50..=0x5F | 0x90..=0x99 | 0xC3 | 0xC9 | 0xCB | 0xCC => Some(i),

        // Relative branches
        0xE8 | 0xE9 => Some(i + 4),
        0xEB | 0x70..=0x7F => Some(i + 1),

        // Push immediates
        0x6A => Some(i + 1),
        0x68 => Some(i + imm_z),

        // MOV reg, imm
        0xB0..=0xB7 => Some(i + 1),
        0xB8..=0xBF => Some(i + if rex_w { 8 } else { imm_z }),

        // RET imm16
        0xC2 => Some(i + 2),

        // ALU r/m <-> reg block, TEST/XCHG, MOV, LEA
        0x00..=0x03
        | 0x08..=0x0B
        | 0x10..=0x13
        | 0x18..=0x1B
        | 0x20..=0x23
        | 0x28..=0x2B
        | 0x30..=0x33
        | 0x38..=0x3B
        | 0x84..=0x8B
        | 0x8D => modrm_len(bytes, i).map(|m| i + m),

        // Group 1: immediate width by opcode (0x81 takes the full
        // immediate, the rest take imm8)
        0x80 | 0x82 | 0x83 => modrm_len(bytes, i).map(|m| i + m + 1),
        0x81 => modrm_len(bytes, i).map(|m| i + m + imm_z),

        // MOV r/m, imm
        0xC6 => modrm_len(bytes, i).map(|m| i + m + 1),
        0xC7 => modrm_len(bytes, i).map(|m| i + m + imm_z),

        // Shift group
        0xC0 | 0xC1 => modrm_len(bytes, i).map(|m| i + m + 1),
        0xD0..=0xD3 => modrm_len(bytes, i).map(|m| i + m),

        // Group 3: TEST (/0, /1) carries an immediate
        0xF6 | 0xF7 => match bytes.get(i) {
            Some(modrm) => {
                let reg = (modrm >> 3) & 7;
                let imm = match reg {
                    0 | 1 if opcode == 0xF6 => 1,
                    0 | 1 => imm_z,
                    _ => 0,
                };
                modrm_len(bytes, i).map(|m| i + m + imm)
            }
            None => None,
        },

        // INC/DEC/CALL/JMP/PUSH group
        0xFE | 0xFF => modrm_len(bytes, i).map(|m| i + m),

        _ => None,
    };

    match total {
        Some(len) if len <= bytes.len() => len,
        _ => 0,
    }
}

/// ModR/M byte plus SIB and displacement, per the standard table.
fn modrm_len(bytes: &[u8], index: usize) -> Option<usize> {
    let modrm = *bytes.get(index)?;
    let mode = modrm >> 6;
    let rm = modrm & 7;

    let mut len = 1;
    if mode != 3 && rm == 4 {
        let sib = *bytes.get(index + 1)?;
        len += 1;
        // SIB with no base under mod=00 carries disp32
        if mode == 0 && (sib & 7) == 5 {
            len += 4;
        }
    }
    match mode {
        0 if rm == 5 => len += 4,
        1 => len += 1,
        2 => len += 4,
        _ => {}
    }
    Some(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iced_x86::{Decoder, DecoderOptions};

    #[test]
    fn test_single_byte_opcodes() {
        assert_eq!(length(&[0x90], 64), 1); // nop
        assert_eq!(length(&[0xC3], 64), 1); // ret
        assert_eq!(length(&[0xCB], 64), 1); // retf
        assert_eq!(length(&[0xCC], 64), 1); // int3
        assert_eq!(length(&[0x55], 64), 1); // push rbp
        assert_eq!(length(&[0x5D], 64), 1); // pop rbp
    }

    #[test]
    fn test_standard_prologue() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20
        assert_eq!(length(&[0x55], 64), 1);
        assert_eq!(length(&[0x48, 0x89, 0xE5], 64), 3);
        assert_eq!(length(&[0x48, 0x83, 0xEC, 0x20], 64), 4);
    }

    #[test]
    fn test_relative_branches() {
        assert_eq!(length(&[0xE8, 0, 0, 0, 0], 64), 5); // call rel32
        assert_eq!(length(&[0xE9, 0, 0, 0, 0], 64), 5); // jmp rel32
        assert_eq!(length(&[0xEB, 0x10], 64), 2); // jmp rel8
        assert_eq!(length(&[0x74, 0x05], 64), 2); // je rel8
        assert_eq!(length(&[0x0F, 0x84, 0, 0, 0, 0], 64), 6); // je rel32
    }

    #[test]
    fn test_immediates() {
        assert_eq!(length(&[0x6A, 0x01], 64), 2); // push imm8
        assert_eq!(length(&[0x68, 1, 0, 0, 0], 64), 5); // push imm32
        assert_eq!(length(&[0xB0, 0x7F], 64), 2); // mov al, imm8
        assert_eq!(length(&[0xB8, 1, 0, 0, 0], 64), 5); // mov eax, imm32
        assert_eq!(length(&[0xC2, 0x08, 0x00], 64), 3); // ret imm16
    }

    #[test]
    fn test_rex_w_movabs() {
        let bytes = [0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8];
        assert_eq!(length(&bytes, 64), 10);
        // REX is not a prefix on 32-bit: 0x48 decodes as dec eax there.
        assert_eq!(length(&[0x48], 32), 1);
    }

    #[test]
    fn test_modrm_forms() {
        assert_eq!(length(&[0x8B, 0xC1], 64), 2); // mov eax, ecx
        assert_eq!(length(&[0x8B, 0x45, 0xFC], 64), 3); // mov eax, [rbp-4]
        assert_eq!(length(&[0x89, 0x04, 0x24], 64), 3); // mov [rsp], eax
        assert_eq!(length(&[0x8B, 0x80, 0, 1, 0, 0], 64), 6); // mov eax, [rax+0x100]
        assert_eq!(length(&[0x48, 0x8B, 0x05, 0, 0, 0, 0], 64), 7); // mov rax, [rip+0]
        assert_eq!(length(&[0xFF, 0x25, 0, 0, 0, 0], 64), 6); // jmp [rip+0]
        assert_eq!(length(&[0x8B, 0x04, 0x25, 0, 0, 0, 0], 64), 7); // mov eax, [disp32]
    }

    #[test]
    fn test_group_immediates() {
        assert_eq!(length(&[0x83, 0xEC, 0x20], 64), 3); // sub esp, imm8
        assert_eq!(length(&[0x81, 0xEC, 0, 1, 0, 0], 64), 6); // sub esp, imm32
        assert_eq!(length(&[0xC6, 0x00, 0x7F], 64), 3); // mov byte [rax], imm8
        assert_eq!(length(&[0xC7, 0x00, 1, 0, 0, 0], 64), 6); // mov dword [rax], imm32
        assert_eq!(length(&[0xC1, 0xE0, 0x04], 64), 3); // shl eax, 4
        assert_eq!(length(&[0xF7, 0xD8], 64), 2); // neg eax
        assert_eq!(length(&[0xF7, 0xC0, 1, 0, 0, 0], 64), 6); // test eax, imm32
        assert_eq!(length(&[0xF6, 0xC1, 0x01], 64), 3); // test cl, imm8
    }

    #[test]
    fn test_operand_size_override() {
        assert_eq!(length(&[0x66, 0x90], 64), 2); // xchg ax, ax
        assert_eq!(length(&[0x66, 0xB8, 0x34, 0x12], 64), 4); // mov ax, imm16
        assert_eq!(length(&[0x66, 0x68, 0x34, 0x12], 64), 4); // push imm16
    }

    #[test]
    fn test_three_byte_escapes() {
        // 0F 38 00 /r: pshufb mm, mm/m64
        assert_eq!(length(&[0x0F, 0x38, 0x00, 0xC1], 64), 4);
        // 0F 3A 0F /r imm8: palignr
        assert_eq!(length(&[0x0F, 0x3A, 0x0F, 0xC1, 0x04], 64), 5);
    }

    #[test]
    fn test_uncovered_opcodes_return_zero() {
        assert_eq!(length(&[0x0F, 0x1F, 0x40, 0x00], 64), 0); // multi-byte nop
        assert_eq!(length(&[0x0F, 0x05], 64), 0); // syscall
        assert_eq!(length(&[0xD8, 0xC0], 64), 0); // x87
        assert_eq!(length(&[], 64), 0);
    }

    #[test]
    fn test_truncated_instruction_returns_zero() {
        assert_eq!(length(&[0xE8, 0, 0], 64), 0);
        assert_eq!(length(&[0x8B], 64), 0);
        assert_eq!(length(&[0x48], 64), 0); // lone REX
    }

    #[test]
    fn test_lengths_match_reference_decoder() {
        // Every covered stream must size exactly as a full decoder does.
        let streams: &[&[u8]] = &[
            &[0x55],
            &[0x48, 0x89, 0xE5],
            &[0x48, 0x83, 0xEC, 0x20],
            &[0x48, 0x8B, 0x05, 0x11, 0x22, 0x33, 0x44],
            &[0x89, 0x44, 0x24, 0x08],
            &[0x8B, 0x84, 0x24, 0x00, 0x01, 0x00, 0x00],
            &[0xE8, 0x10, 0x00, 0x00, 0x00],
            &[0xE9, 0xFE, 0xFF, 0xFF, 0xFF],
            &[0x0F, 0x85, 0x00, 0x01, 0x00, 0x00],
            &[0x68, 0x78, 0x56, 0x34, 0x12],
            &[0xB8, 0x78, 0x56, 0x34, 0x12],
            &[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8],
            &[0xC2, 0x10, 0x00],
            &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00],
            &[0xFF, 0xD0],
            &[0xF7, 0xC0, 0x01, 0x00, 0x00, 0x00],
            &[0x83, 0xF8, 0x01],
            &[0xC7, 0x45, 0xFC, 0x00, 0x00, 0x00, 0x00],
        ];

        for stream in streams {
            let mut decoder = Decoder::new(64, stream, DecoderOptions::NONE);
            let instruction = decoder.decode();
            assert!(!instruction.is_invalid(), "reference rejected {:02X?}", stream);
            assert_eq!(
                length(stream, 64),
                instruction.len(),
                "length mismatch for {:02X?}",
                stream
            );
        }
    }
}
