//! Display disassembler
//!
//! Decodes a bounded run of instructions into UI-renderable form. Coverage
//! is the common integer subset; anything else is emitted as a `db 0xNN`
//! byte so the listing always makes forward progress. Relative branch
//! targets are resolved against the next instruction's address.

use tracing::trace;
use veil_common::Instruction;

/// Hard cap on instructions per request.
pub const MAX_INSTRUCTIONS: usize = 100;

const REG64: [&str; 16] = [
    "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15",
];
const REG32: [&str; 16] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "r8d", "r9d", "r10d", "r11d", "r12d",
    "r13d", "r14d", "r15d",
];
const REG8: [&str; 16] = [
    "al", "cl", "dl", "bl", "ah", "ch", "dh", "bh", "r8b", "r9b", "r10b", "r11b", "r12b", "r13b",
    "r14b", "r15b",
];

const JCC_NAMES: [&str; 16] = [
    "jo", "jno", "jb", "jae", "je", "jne", "jbe", "ja", "js", "jns", "jp", "jnp", "jl", "jge",
    "jle", "jg",
];

#[derive(Clone, Copy, Default)]
struct Rex {
    w: bool,
    r: bool,
    b: bool,
}

/// Disassemble up to `MAX_INSTRUCTIONS` from `bytes`, which were read at
/// `base` in the host's address space.
pub fn disassemble(bytes: &[u8], base: usize, bitness: u32) -> Vec<Instruction> {
    let mut instructions = Vec::new();
    let mut offset = 0;

    while offset < bytes.len() && instructions.len() < MAX_INSTRUCTIONS {
        let address = base + offset;
        let insn = decode_one(&bytes[offset..], address, bitness).unwrap_or_else(|| {
            // Unknown byte: keep the listing moving.
            Instruction {
                address,
                bytes: vec![bytes[offset]],
                mnemonic: "db".to_string(),
                operands: format!("{:#04x}", bytes[offset]),
                length: 1,
                is_jump: false,
                is_call: false,
                is_ret: false,
                target: None,
            }
        });
        offset += insn.length;
        instructions.push(insn);
    }

    trace!(target: "veil_core::disasm", base = format!("{:#x}", base), count = instructions.len(), "disassembled run");
    instructions
}

fn plain(address: usize, bytes: &[u8], mnemonic: &str, operands: String) -> Instruction {
    Instruction {
        address,
        bytes: bytes.to_vec(),
        mnemonic: mnemonic.to_string(),
        operands,
        length: bytes.len(),
        is_jump: false,
        is_call: false,
        is_ret: false,
        target: None,
    }
}

fn gpr(index: usize, wide: bool) -> &'static str {
    if wide {
        REG64[index & 15]
    } else {
        REG32[index & 15]
    }
}

fn read_i8(bytes: &[u8], at: usize) -> Option<i8> {
    bytes.get(at).map(|&b| b as i8)
}

// Rust's `{:#x}` renders negative integers as their bit pattern; render
// signed values explicitly instead.
fn imm_str(value: i64) -> String {
    if value < 0 {
        format!("-{:#x}", value.unsigned_abs())
    } else {
        format!("{:#x}", value)
    }
}

fn disp_str(value: i64) -> String {
    if value < 0 {
        format!("-{:#x}", value.unsigned_abs())
    } else {
        format!("+{:#x}", value)
    }
}

fn read_i32(bytes: &[u8], at: usize) -> Option<i32> {
    let slice = bytes.get(at..at + 4)?;
    Some(i32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn decode_one(bytes: &[u8], address: usize, bitness: u32) -> Option<Instruction> {
    let mut i = 0;
    let mut rex = Rex::default();

    if bitness == 64 {
        if let Some(&b) = bytes.first() {
            if (0x40..=0x4F).contains(&b) {
                rex = Rex {
                    w: b & 8 != 0,
                    r: b & 4 != 0,
                    b: b & 1 != 0,
                };
                i = 1;
            }
        }
    }

    let opcode = *bytes.get(i)?;
    i += 1;

    // In 64-bit mode push/pop are always full width; data ops widen only
    // under REX.W.
    let stack_wide = bitness == 64;
    let data_wide = bitness == 64 && rex.w;

    match opcode {
        0x90 => Some(plain(address, &bytes[..i], "nop", String::new())),
        0xCC => Some(plain(address, &bytes[..i], "int3", String::new())),
        0xC3 => {
            let mut insn = plain(address, &bytes[..i], "ret", String::new());
            insn.is_ret = true;
            Some(insn)
        }
        0xCB => {
            let mut insn = plain(address, &bytes[..i], "retf", String::new());
            insn.is_ret = true;
            Some(insn)
        }
        0xC2 => {
            let imm = u16::from_le_bytes([*bytes.get(i)?, *bytes.get(i + 1)?]);
            let mut insn = plain(address, &bytes[..i + 2], "ret", format!("{:#x}", imm));
            insn.is_ret = true;
            Some(insn)
        }

        0x50..=0x57 => {
            let reg = (opcode - 0x50) as usize + if rex.b { 8 } else { 0 };
            Some(plain(
                address,
                &bytes[..i],
                "push",
                gpr(reg, stack_wide).to_string(),
            ))
        }
        0x58..=0x5F => {
            let reg = (opcode - 0x58) as usize + if rex.b { 8 } else { 0 };
            Some(plain(
                address,
                &bytes[..i],
                "pop",
                gpr(reg, stack_wide).to_string(),
            ))
        }

        0x6A => {
            let imm = read_i8(bytes, i)?;
            Some(plain(address, &bytes[..i + 1], "push", imm_str(imm as i64)))
        }
        0x68 => {
            let imm = read_i32(bytes, i)?;
            Some(plain(address, &bytes[..i + 4], "push", imm_str(imm as i64)))
        }

        0xB0..=0xB7 => {
            let reg = (opcode - 0xB0) as usize + if rex.b { 8 } else { 0 };
            let imm = *bytes.get(i)?;
            Some(plain(
                address,
                &bytes[..i + 1],
                "mov",
                format!("{}, {:#x}", REG8[reg], imm),
            ))
        }
        0xB8..=0xBF => {
            let reg = (opcode - 0xB8) as usize + if rex.b { 8 } else { 0 };
            if rex.w {
                let slice = bytes.get(i..i + 8)?;
                let imm = u64::from_le_bytes(slice.try_into().ok()?);
                Some(plain(
                    address,
                    &bytes[..i + 8],
                    "mov",
                    format!("{}, {:#x}", gpr(reg, true), imm),
                ))
            } else {
                let imm = read_i32(bytes, i)? as u32;
                Some(plain(
                    address,
                    &bytes[..i + 4],
                    "mov",
                    format!("{}, {:#x}", gpr(reg, false), imm),
                ))
            }
        }

        // r/m <-> reg data ops
        0x01 | 0x03 | 0x29 | 0x2B | 0x39 | 0x3B | 0x85 | 0x89 | 0x8B => {
            let mnemonic = match opcode {
                0x01 | 0x03 => "add",
                0x29 | 0x2B => "sub",
                0x39 | 0x3B => "cmp",
                0x85 => "test",
                _ => "mov",
            };
            // Odd "direction": 0x03/0x2B/0x3B/0x8B read reg <- r/m.
            let reg_is_dest = matches!(opcode, 0x03 | 0x2B | 0x3B | 0x8B);
            let (operands, consumed) =
                modrm_operands(bytes, i, rex, data_wide, bitness, reg_is_dest)?;
            Some(plain(address, &bytes[..i + consumed], mnemonic, operands))
        }

        0xE8 | 0xE9 => {
            let rel = read_i32(bytes, i)?;
            let length = i + 4;
            let target = (address + length).wrapping_add(rel as usize);
            let mut insn = plain(
                address,
                &bytes[..length],
                if opcode == 0xE8 { "call" } else { "jmp" },
                format!("{:#x}", target),
            );
            insn.is_call = opcode == 0xE8;
            insn.is_jump = opcode == 0xE9;
            insn.target = Some(target);
            Some(insn)
        }
        0xEB => {
            let rel = read_i8(bytes, i)?;
            let length = i + 1;
            let target = (address + length).wrapping_add(rel as usize);
            let mut insn = plain(address, &bytes[..length], "jmp", format!("{:#x}", target));
            insn.is_jump = true;
            insn.target = Some(target);
            Some(insn)
        }
        0x70..=0x7F => {
            let rel = read_i8(bytes, i)?;
            let length = i + 1;
            let target = (address + length).wrapping_add(rel as usize);
            let name = JCC_NAMES[(opcode - 0x70) as usize];
            let mut insn = plain(address, &bytes[..length], name, format!("{:#x}", target));
            insn.is_jump = true;
            insn.target = Some(target);
            Some(insn)
        }

        0x0F => {
            let second = *bytes.get(i)?;
            if (0x80..=0x8F).contains(&second) {
                let rel = read_i32(bytes, i + 1)?;
                let length = i + 5;
                let target = (address + length).wrapping_add(rel as usize);
                let name = JCC_NAMES[(second - 0x80) as usize];
                let mut insn = plain(address, &bytes[..length], name, format!("{:#x}", target));
                insn.is_jump = true;
                insn.target = Some(target);
                Some(insn)
            } else {
                None
            }
        }

        0xFF => {
            let modrm = *bytes.get(i)?;
            let ext = (modrm >> 3) & 7;
            let mnemonic = match ext {
                2 => "call",
                4 => "jmp",
                _ => return None,
            };
            let (operand, consumed) = modrm_rm_operand(bytes, i, rex, bitness == 64, bitness)?;
            let mut insn = plain(address, &bytes[..i + consumed], mnemonic, operand);
            insn.is_call = ext == 2;
            insn.is_jump = ext == 4;
            Some(insn)
        }

        _ => None,
    }
}

/// Render both ModR/M operands. Returns the operand string and the number
/// of bytes consumed starting at the ModR/M byte.
fn modrm_operands(
    bytes: &[u8],
    at: usize,
    rex: Rex,
    wide: bool,
    bitness: u32,
    reg_is_dest: bool,
) -> Option<(String, usize)> {
    let modrm = *bytes.get(at)?;
    let reg = ((modrm >> 3) & 7) as usize + if rex.r { 8 } else { 0 };
    let reg_name = gpr(reg, wide).to_string();
    let (rm_name, consumed) = modrm_rm_operand(bytes, at, rex, wide, bitness)?;

    let operands = if reg_is_dest {
        format!("{}, {}", reg_name, rm_name)
    } else {
        format!("{}, {}", rm_name, reg_name)
    };
    Some((operands, consumed))
}

/// Render the r/m operand alone (memory or register form).
fn modrm_rm_operand(
    bytes: &[u8],
    at: usize,
    rex: Rex,
    wide: bool,
    bitness: u32,
) -> Option<(String, usize)> {
    let modrm = *bytes.get(at)?;
    let mode = modrm >> 6;
    let rm = (modrm & 7) as usize;
    let rm_ext = rm + if rex.b { 8 } else { 0 };
    let mut consumed = 1;

    if mode == 3 {
        return Some((gpr(rm_ext, wide).to_string(), consumed));
    }

    // Addresses are always full width in memory operands.
    let addr_wide = bitness == 64;

    let mut base = if rm == 4 {
        // SIB byte
        let sib = *bytes.get(at + consumed)?;
        consumed += 1;
        let index = ((sib >> 3) & 7) as usize;
        let scale = 1usize << (sib >> 6);
        let sib_base = (sib & 7) as usize;

        let base_part = if mode == 0 && sib_base == 5 {
            let disp = read_i32(bytes, at + consumed)?;
            consumed += 4;
            imm_str(disp as i64)
        } else {
            gpr(sib_base + if rex.b { 8 } else { 0 }, addr_wide).to_string()
        };

        if index == 4 {
            base_part
        } else {
            format!("{}+{}*{}", base_part, gpr(index, addr_wide), scale)
        }
    } else if mode == 0 && rm == 5 {
        let disp = read_i32(bytes, at + consumed)?;
        consumed += 4;
        if bitness == 64 {
            format!("rip{}", disp_str(disp as i64))
        } else {
            imm_str(disp as i64)
        }
    } else {
        gpr(rm_ext, addr_wide).to_string()
    };

    match mode {
        1 => {
            let disp = read_i8(bytes, at + consumed)?;
            consumed += 1;
            if disp != 0 {
                base = format!("{}{}", base, disp_str(disp as i64));
            }
        }
        2 => {
            let disp = read_i32(bytes, at + consumed)?;
            consumed += 4;
            if disp != 0 {
                base = format!("{}{}", base, disp_str(disp as i64));
            }
        }
        _ => {}
    }

    Some((format!("[{}]", base), consumed))
}
