//! Inline detour engine
//!
//! Installs a jump at a target address and builds a trampoline that replays
//! the displaced prologue before continuing into the original body. The
//! prologue boundary comes from the length-disassembler; an instruction it
//! cannot classify aborts the install. Callers serialize all mutation
//! through the hook registry lock and must arrange thread quiescence
//! themselves.

use crate::{access, lde, sys};
use tracing::{debug, info};
use veil_common::{Error, HookType, Result};

/// Space reserved for the trampoline's continuation jump. The jump itself
/// is a 5-byte `E9 rel32`; the reserve covers the 14-byte absolute fallback
/// used on 64-bit when the allocation lands outside rel32 range.
pub const BACK_JMP_RESERVE: usize = if cfg!(target_pointer_width = "64") { 14 } else { 5 };

/// Upper bound on displaced prologue bytes.
const MAX_PROLOGUE: usize = 32;

const NOP: u8 = 0x90;

/// A live detour as tracked by the registry.
#[derive(Debug, Clone)]
pub struct InstalledDetour {
    pub target: usize,
    pub detour: usize,
    pub trampoline: usize,
    pub trampoline_size: usize,
    pub original_bytes: Vec<u8>,
    pub prologue_len: usize,
    /// Resolved hook type, never `Auto`
    pub hook_type: HookType,
    /// 32-bit absolute hooks jump through a pointer; the pointer lives in
    /// the trampoline block, never on a stack frame.
    pub literal_slot: Option<usize>,
}

/// Resolve `Auto` to the encoding appropriate for the host bitness.
pub fn resolve_hook_type(hook_type: HookType) -> HookType {
    match hook_type {
        HookType::Auto => {
            if sys::is_64_bit() {
                HookType::JmpAbsolute
            } else {
                HookType::JmpRelative
            }
        }
        other => other,
    }
}

/// Patch size at the target for a resolved hook type.
pub fn hook_size(hook_type: HookType) -> usize {
    match hook_type {
        HookType::JmpRelative => 5,
        HookType::JmpAbsolute => {
            if sys::is_64_bit() {
                14
            } else {
                6
            }
        }
        HookType::PushRet => 6,
        HookType::Auto => hook_size(resolve_hook_type(HookType::Auto)),
    }
}

/// `E9 rel32`. On 64-bit the displacement must fit in 32 bits; on 32-bit
/// the arithmetic wraps modulo 2^32, so every target is reachable.
pub fn encode_jmp_relative(from: usize, to: usize) -> Result<[u8; 5]> {
    let rel32 = if sys::is_64_bit() {
        let displacement = (to as i64).wrapping_sub(from as i64 + 5);
        i32::try_from(displacement).map_err(|_| {
            Error::Internal(format!(
                "relative jump {:#x} -> {:#x} exceeds 32-bit displacement",
                from, to
            ))
        })?
    } else {
        to.wrapping_sub(from.wrapping_add(5)) as u32 as i32
    };
    let mut bytes = [0u8; 5];
    bytes[0] = 0xE9;
    bytes[1..5].copy_from_slice(&rel32.to_le_bytes());
    Ok(bytes)
}

/// 64-bit `FF 25 00 00 00 00` followed by the 8-byte literal destination.
pub fn encode_jmp_absolute64(to: usize) -> [u8; 14] {
    let mut bytes = [0u8; 14];
    bytes[0] = 0xFF;
    bytes[1] = 0x25;
    bytes[6..14].copy_from_slice(&(to as u64).to_le_bytes());
    bytes
}

/// 32-bit `FF 25 <ptr32>`: indirect jump through a stable pointer slot.
pub fn encode_jmp_absolute32(slot: usize) -> [u8; 6] {
    let mut bytes = [0u8; 6];
    bytes[0] = 0xFF;
    bytes[1] = 0x25;
    bytes[2..6].copy_from_slice(&(slot as u32).to_le_bytes());
    bytes
}

/// `68 imm32; C3` — 32-bit only, there is no single-push of a 64-bit
/// immediate.
pub fn encode_push_ret(to: usize) -> Result<[u8; 6]> {
    if sys::is_64_bit() {
        return Err(Error::NotSupported(
            "push_ret hooks are not encodable on 64-bit".into(),
        ));
    }
    let mut bytes = [0u8; 6];
    bytes[0] = 0x68;
    bytes[1..5].copy_from_slice(&(to as u32).to_le_bytes());
    bytes[5] = 0xC3;
    Ok(bytes)
}

/// Opcode byte after any legacy/REX prefixes, with its offset.
fn first_opcode_byte(bytes: &[u8], bitness: u32) -> Option<(usize, u8)> {
    let mut i = 0;
    loop {
        let &b = bytes.get(i)?;
        let is_prefix = matches!(
            b,
            0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0x66 | 0x67 | 0xF0 | 0xF2 | 0xF3
        ) || (bitness == 64 && (0x40..=0x4F).contains(&b));
        if !is_prefix {
            return Some((i, b));
        }
        i += 1;
    }
}

/// Measure how many whole instructions must be displaced to fit
/// `needed` patch bytes. Fails on undecodable instructions and on
/// short-form relative branches, which cannot be relocated without
/// opcode rewriting.
fn measure_prologue(code: &[u8], needed: usize, bitness: u32) -> Result<usize> {
    let mut displaced = 0;
    while displaced < needed {
        let slice = &code[displaced..];
        let len = lde::length(slice, bitness);
        if len == 0 {
            return Err(Error::Decode(format!(
                "unrecognized instruction at prologue offset {}",
                displaced
            )));
        }
        if let Some((_, opcode)) = first_opcode_byte(slice, bitness) {
            if opcode == 0xEB || (0x70..=0x7F).contains(&opcode) || (0xE0..=0xE3).contains(&opcode)
            {
                return Err(Error::Decode(format!(
                    "short relative branch at prologue offset {}",
                    displaced
                )));
            }
        }
        displaced += len;
    }
    Ok(displaced)
}

/// Relocate control-transfer displacements inside the copied prologue.
/// `E8`/`E9` and `0F 8x` keep their rel32 as the final four instruction
/// bytes, so the next-instruction math is identical for all three forms.
fn relocate_prologue(
    buffer: &mut [u8],
    prologue_len: usize,
    old_base: usize,
    new_base: usize,
    bitness: u32,
) -> Result<()> {
    let mut offset = 0;
    while offset < prologue_len {
        let len = lde::length(&buffer[offset..prologue_len], bitness);
        if len == 0 {
            return Err(Error::Decode(format!(
                "prologue re-decode failed at offset {}",
                offset
            )));
        }

        let needs_fix = match first_opcode_byte(&buffer[offset..], bitness) {
            Some((pos, 0xE8)) | Some((pos, 0xE9)) => pos + 5 == len,
            Some((pos, 0x0F)) => {
                let second = buffer.get(offset + pos + 1).copied().unwrap_or(0);
                (0x80..=0x8F).contains(&second) && pos + 6 == len
            }
            _ => false,
        };

        if needs_fix {
            let rel_at = offset + len - 4;
            let old_rel = i32::from_le_bytes(
                buffer[rel_at..rel_at + 4]
                    .try_into()
                    .map_err(|_| Error::Internal("prologue slice underflow".into()))?,
            );
            let old_next = old_base + offset + len;
            let destination = (old_next as i64).wrapping_add(old_rel as i64);
            let new_next = new_base + offset + len;
            let new_rel =
                i32::try_from(destination.wrapping_sub(new_next as i64)).map_err(|_| {
                    Error::Internal(format!(
                        "relocated branch at {:#x} exceeds 32-bit displacement",
                        old_base + offset
                    ))
                })?;
            buffer[rel_at..rel_at + 4].copy_from_slice(&new_rel.to_le_bytes());
        }

        offset += len;
    }
    Ok(())
}

/// Encode the patch written over the target's first bytes, NOP-padded out
/// to the displaced prologue length.
fn build_hook_patch(entry: &InstalledDetour) -> Result<Vec<u8>> {
    let mut patch = match entry.hook_type {
        HookType::JmpRelative => encode_jmp_relative(entry.target, entry.detour)?.to_vec(),
        HookType::JmpAbsolute => {
            if sys::is_64_bit() {
                encode_jmp_absolute64(entry.detour).to_vec()
            } else {
                let slot = entry
                    .literal_slot
                    .ok_or_else(|| Error::Internal("absolute hook without literal slot".into()))?;
                encode_jmp_absolute32(slot).to_vec()
            }
        }
        HookType::PushRet => encode_push_ret(entry.detour)?.to_vec(),
        HookType::Auto => return Err(Error::Internal("unresolved hook type".into())),
    };
    patch.resize(entry.prologue_len, NOP);
    Ok(patch)
}

/// Build the trampoline and patch the target. On success the returned
/// entry is active; the trampoline address is the caller's
/// original-function pointer.
pub fn install(target: usize, detour: usize, hook_type: HookType) -> Result<InstalledDetour> {
    let bitness = sys::pointer_width();
    let hook_type = resolve_hook_type(hook_type);
    if hook_type == HookType::PushRet && sys::is_64_bit() {
        return Err(Error::NotSupported(
            "push_ret hooks are not encodable on 64-bit".into(),
        ));
    }
    let patch_size = hook_size(hook_type);

    // Read enough of the target to cover the longest possible prologue,
    // clamped to its region.
    let region = sys::query_region(target).ok_or(Error::InvalidAddress(target))?;
    if !region.contains(target, patch_size) {
        return Err(Error::InvalidAddress(target));
    }
    let readable = (region.end() - target).min(MAX_PROLOGUE);
    let code = access::read_bytes(target, readable);
    if code.len() < patch_size {
        return Err(Error::MemoryAccess {
            address: target,
            message: "target prologue is not readable".into(),
        });
    }

    let prologue_len = measure_prologue(&code, patch_size, bitness)?;
    let original_bytes = code[..prologue_len].to_vec();

    // 32-bit absolute hooks keep their pointer literal behind the back
    // jump inside the same allocation.
    let needs_slot = hook_type == HookType::JmpAbsolute && !sys::is_64_bit();
    let trampoline_size = prologue_len + BACK_JMP_RESERVE + if needs_slot { 4 } else { 0 };
    let trampoline = sys::allocate_executable(trampoline_size)?;

    let built = build_trampoline(
        trampoline,
        trampoline_size,
        target,
        detour,
        &original_bytes,
        needs_slot,
        bitness,
    );
    let entry = match built {
        Ok(literal_slot) => InstalledDetour {
            target,
            detour,
            trampoline,
            trampoline_size,
            original_bytes,
            prologue_len,
            hook_type,
            literal_slot,
        },
        Err(e) => {
            let _ = sys::free(trampoline);
            return Err(e);
        }
    };

    if let Err(e) = write_hook(&entry) {
        let _ = sys::free(trampoline);
        return Err(e);
    }

    info!(target: "veil_core::detour",
        address = format!("{:#x}", target),
        detour = format!("{:#x}", detour),
        trampoline = format!("{:#x}", trampoline),
        prologue_len,
        hook_type = %hook_type,
        "detour installed");
    Ok(entry)
}

fn build_trampoline(
    trampoline: usize,
    trampoline_size: usize,
    target: usize,
    detour: usize,
    original_bytes: &[u8],
    needs_slot: bool,
    bitness: u32,
) -> Result<Option<usize>> {
    let prologue_len = original_bytes.len();
    let mut buffer = vec![0u8; trampoline_size];
    buffer[..prologue_len].copy_from_slice(original_bytes);
    relocate_prologue(&mut buffer, prologue_len, target, trampoline, bitness)?;

    // Continuation jump back into the original body: a relative jump,
    // widened to the absolute form only when the trampoline landed outside
    // rel32 range of the target (possible on 64-bit).
    let continuation = target + prologue_len;
    match encode_jmp_relative(trampoline + prologue_len, continuation) {
        Ok(jump) => buffer[prologue_len..prologue_len + jump.len()].copy_from_slice(&jump),
        Err(_) if sys::is_64_bit() => {
            buffer[prologue_len..prologue_len + 14]
                .copy_from_slice(&encode_jmp_absolute64(continuation));
        }
        Err(e) => return Err(e),
    }

    let literal_slot = if needs_slot {
        let slot = trampoline + prologue_len + BACK_JMP_RESERVE;
        let at = slot - trampoline;
        buffer[at..at + 4].copy_from_slice(&(detour as u32).to_le_bytes());
        Some(slot)
    } else {
        None
    };

    if !access::write_bytes(trampoline, &buffer) {
        return Err(Error::MemoryAccess {
            address: trampoline,
            message: "trampoline write failed".into(),
        });
    }
    sys::flush_instruction_cache(trampoline, trampoline_size);
    Ok(literal_slot)
}

/// (Re-)write the hook bytes over the target prologue.
pub fn write_hook(entry: &InstalledDetour) -> Result<()> {
    let patch = build_hook_patch(entry)?;
    if !access::write_bytes(entry.target, &patch) {
        return Err(Error::MemoryAccess {
            address: entry.target,
            message: "hook patch write failed".into(),
        });
    }
    sys::flush_instruction_cache(entry.target, patch.len());
    Ok(())
}

/// Put the saved prologue back in place. The entry (and its trampoline)
/// stay valid, so the hook can be re-written cheaply.
pub fn restore_original(entry: &InstalledDetour) -> Result<()> {
    if !access::write_bytes(entry.target, &entry.original_bytes) {
        return Err(Error::MemoryAccess {
            address: entry.target,
            message: "prologue restore failed".into(),
        });
    }
    sys::flush_instruction_cache(entry.target, entry.original_bytes.len());
    Ok(())
}

/// Restore the prologue and release the trampoline.
pub fn remove(entry: &InstalledDetour) -> Result<()> {
    restore_original(entry)?;
    sys::free(entry.trampoline)?;
    debug!(target: "veil_core::detour",
        address = format!("{:#x}", entry.target),
        "detour removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_target(code: &[u8]) -> usize {
        let addr = sys::allocate_executable(4096).unwrap();
        assert!(access::write_bytes(addr, code));
        addr
    }

    // mov eax, imm32 three times then ret: 16 bytes of prologue material,
    // enough for any hook encoding.
    fn returns_42() -> Vec<u8> {
        let mut code = Vec::new();
        for imm in [1i32, 2, 42] {
            code.push(0xB8);
            code.extend_from_slice(&imm.to_le_bytes());
        }
        code.push(0xC3);
        code
    }

    #[test]
    fn test_resolve_auto() {
        let resolved = resolve_hook_type(HookType::Auto);
        if sys::is_64_bit() {
            assert_eq!(resolved, HookType::JmpAbsolute);
        } else {
            assert_eq!(resolved, HookType::JmpRelative);
        }
    }

    #[test]
    fn test_encode_jmp_relative() {
        let bytes = encode_jmp_relative(0x140001000, 0x140001100).unwrap();
        assert_eq!(bytes[0], 0xE9);
        let rel = i32::from_le_bytes(bytes[1..5].try_into().unwrap());
        assert_eq!(rel, 0x100 - 5);
    }

    #[test]
    fn test_encode_jmp_relative_out_of_range() {
        if sys::is_64_bit() {
            assert!(encode_jmp_relative(0x140001000, 0x7FF700000000).is_err());
        }
    }

    #[test]
    fn test_encode_jmp_absolute64() {
        let target = 0x00007FF712345678usize;
        let bytes = encode_jmp_absolute64(target);
        assert_eq!(&bytes[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(
            u64::from_le_bytes(bytes[6..14].try_into().unwrap()),
            target as u64
        );
    }

    #[test]
    fn test_measure_prologue_standard() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20; then padding
        let mut code = vec![0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20];
        code.extend_from_slice(&[0x90; 24]);
        // 5 patch bytes displace push+mov+sub = 8
        assert_eq!(measure_prologue(&code, 5, 64).unwrap(), 8);
        // exactly one instruction
        assert_eq!(measure_prologue(&code, 1, 64).unwrap(), 1);
    }

    #[test]
    fn test_measure_prologue_rejects_short_branch() {
        let code = [0xEB, 0x10, 0x90, 0x90, 0x90, 0x90];
        assert!(matches!(
            measure_prologue(&code, 2, 64),
            Err(Error::Decode(_))
        ));
        let code = [0x74, 0x10, 0x90, 0x90, 0x90, 0x90];
        assert!(matches!(
            measure_prologue(&code, 2, 64),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_measure_prologue_rejects_unknown_bytes() {
        let code = [0x0F, 0x05, 0x90, 0x90, 0x90];
        assert!(matches!(
            measure_prologue(&code, 2, 64),
            Err(Error::Decode(_))
        ));
    }

    #[test]
    fn test_install_patches_and_remove_restores() {
        let code = returns_42();
        let target = make_target(&code);
        let detour = make_target(&[0xB8, 0x07, 0x00, 0x00, 0x00, 0xC3]);

        let entry = install(target, detour, HookType::Auto).unwrap();
        assert_eq!(entry.original_bytes, &code[..entry.prologue_len]);

        let patched = access::read_bytes(target, code.len());
        assert_ne!(patched, code);
        if sys::is_64_bit() {
            // FF 25 00 00 00 00 + detour, NOP-padded to the prologue.
            assert_eq!(&patched[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
            assert_eq!(
                u64::from_le_bytes(patched[6..14].try_into().unwrap()),
                detour as u64
            );
            for &b in &patched[14..entry.prologue_len] {
                assert_eq!(b, 0x90);
            }
        }

        remove(&entry).unwrap();
        assert_eq!(access::read_bytes(target, code.len()), code);

        sys::free(target).unwrap();
        sys::free(detour).unwrap();
    }

    #[test]
    fn test_trampoline_back_jump_targets_continuation() {
        let code = returns_42();
        let target = make_target(&code);
        let detour = make_target(&[0xC3]);

        let entry = install(target, detour, HookType::Auto).unwrap();
        let tramp = access::read_bytes(entry.trampoline, entry.trampoline_size);

        // Displaced prologue is copied verbatim (no relative operands here).
        assert_eq!(&tramp[..entry.prologue_len], &code[..entry.prologue_len]);

        // Continuation jump is the relative form and lands on
        // target + prologue_len.
        let back = &tramp[entry.prologue_len..];
        assert_eq!(back[0], 0xE9);
        let rel = i32::from_le_bytes(back[1..5].try_into().unwrap());
        let reached = (entry.trampoline + entry.prologue_len) as i64 + 5 + rel as i64;
        assert_eq!(reached as usize, target + entry.prologue_len);

        remove(&entry).unwrap();
        sys::free(target).unwrap();
        sys::free(detour).unwrap();
    }

    #[test]
    fn test_prologue_branch_relocation() {
        // Target starts with call rel32 into later code; the relocated
        // copy must still reach the same absolute destination.
        let mut code = vec![0xE8, 0x20, 0x00, 0x00, 0x00]; // call target+0x25
        code.extend_from_slice(&returns_42());
        let target = make_target(&code);
        let detour = make_target(&[0xC3]);

        let entry = install(target, detour, HookType::Auto).unwrap();
        let tramp = access::read_bytes(entry.trampoline, entry.trampoline_size);

        assert_eq!(tramp[0], 0xE8);
        let new_rel = i32::from_le_bytes(tramp[1..5].try_into().unwrap());
        let reached = (entry.trampoline as i64 + 5).wrapping_add(new_rel as i64) as usize;
        assert_eq!(reached, target + 0x25);

        remove(&entry).unwrap();
        sys::free(target).unwrap();
        sys::free(detour).unwrap();
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_hook_redirects_and_trampoline_preserves_original() {
        let target = make_target(&returns_42());
        let detour = make_target(&[0xB8, 0x07, 0x00, 0x00, 0x00, 0xC3]); // mov eax, 7; ret

        let call = |addr: usize| -> i32 {
            let f: extern "C" fn() -> i32 = unsafe { std::mem::transmute(addr) };
            f()
        };

        assert_eq!(call(target), 42);

        let entry = install(target, detour, HookType::Auto).unwrap();
        assert_eq!(call(target), 7); // redirected
        assert_eq!(call(entry.trampoline), 42); // original behavior preserved

        remove(&entry).unwrap();
        assert_eq!(call(target), 42);

        sys::free(target).unwrap();
        sys::free(detour).unwrap();
    }
}
