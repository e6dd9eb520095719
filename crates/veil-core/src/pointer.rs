//! Pointer chain following and reverse pointer search

use crate::{access, scanner};
use veil_common::{Error, MemoryRegion, Result, ScanOptions, ScanResult};

const WORD: usize = std::mem::size_of::<usize>();

/// Follow `base -> [off0, off1, ...]`: each step reads a pointer-sized word
/// at the current address and adds the offset to it. The value after the
/// last add is returned without a trailing dereference. Any unreadable
/// intermediate fails the whole chain.
pub fn follow_chain(base: usize, offsets: &[usize]) -> Result<usize> {
    let mut current = base;

    for &offset in offsets {
        if !access::is_readable(current, WORD) {
            return Err(Error::MemoryAccess {
                address: current,
                message: "pointer chain step not readable".into(),
            });
        }
        let bytes = access::read_bytes(current, WORD);
        let word: [u8; WORD] = bytes
            .try_into()
            .map_err(|_| Error::MemoryAccess {
                address: current,
                message: "pointer chain read failed".into(),
            })?;
        current = usize::from_le_bytes(word).wrapping_add(offset);
    }

    Ok(current)
}

/// Find addresses holding the pointer-sized little-endian encoding of
/// `target` — i.e. every candidate pointer to it in the filtered regions.
pub fn find_pointers_to(
    regions: &[MemoryRegion],
    target: usize,
    options: &ScanOptions,
) -> Vec<ScanResult> {
    let needle = target.to_le_bytes();
    scanner::scan_for_bytes(regions, &needle, options, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys;
    use veil_common::TriState;

    #[test]
    fn test_follow_single_offset_dereferences_once() {
        let addr = sys::allocate(4096, 0x04).unwrap();
        // *addr = addr + 16; chain [0x0] must yield addr + 16 undereferenced.
        assert!(access::write_bytes(addr, &(addr + 16).to_le_bytes()));
        let result = follow_chain(addr, &[0]).unwrap();
        assert_eq!(result, addr + 16);
        sys::free(addr).unwrap();
    }

    #[test]
    fn test_follow_manual_chain() {
        let addr = sys::allocate(4096, 0x04).unwrap();
        // addr -> addr+0x100 -> addr+0x200; final hop adds 0x8.
        assert!(access::write_bytes(addr, &(addr + 0x100).to_le_bytes()));
        assert!(access::write_bytes(addr + 0x100, &(addr + 0x200).to_le_bytes()));
        let result = follow_chain(addr, &[0, 0x8]).unwrap();
        assert_eq!(result, addr + 0x208);
        sys::free(addr).unwrap();
    }

    #[test]
    fn test_follow_unreadable_base_fails() {
        assert!(follow_chain(0x10, &[0]).is_err());
    }

    #[test]
    fn test_follow_unreadable_intermediate_fails() {
        let addr = sys::allocate(4096, 0x04).unwrap();
        // Pointer into unmapped space makes the second hop fail.
        assert!(access::write_bytes(addr, &0x10usize.to_le_bytes()));
        assert!(follow_chain(addr, &[0, 0]).is_err());
        sys::free(addr).unwrap();
    }

    #[test]
    fn test_follow_empty_offsets_returns_base() {
        let result = follow_chain(0x1234, &[]).unwrap();
        assert_eq!(result, 0x1234);
    }

    #[test]
    fn test_find_pointers_to_target() {
        let addr = sys::allocate(4096, 0x04).unwrap();
        let region = sys::query_region(addr).unwrap();
        let target = addr + 0x800;
        assert!(access::write_bytes(addr + 64, &target.to_le_bytes()));

        let options = ScanOptions {
            start_address: addr,
            end_address: addr + 4096,
            filter_writable: TriState::Any,
            ..Default::default()
        };
        let pointers = find_pointers_to(&[region], target, &options);
        assert_eq!(pointers.len(), 1);
        assert_eq!(pointers[0].address, addr + 64);
        sys::free(addr).unwrap();
    }
}
