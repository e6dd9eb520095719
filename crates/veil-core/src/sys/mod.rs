//! Host OS surface
//!
//! Everything the engine needs from the kernel: region queries, module
//! enumeration, protection changes and executable allocation. The Windows
//! backend is the primary target; the Unix backend keeps the engine and its
//! test suite functional on other hosts.

use veil_common::{Module, Result};

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::*;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use self::unix::*;

/// Opaque previous-protection token returned by [`set_protection_rwx`],
/// consumed by [`restore_protection`].
#[derive(Debug, Clone, Copy)]
pub struct PrevProtection(pub(crate) u32);

/// Native pointer width of this process, in bits.
pub const fn pointer_width() -> u32 {
    (std::mem::size_of::<usize>() * 8) as u32
}

pub const fn is_64_bit() -> bool {
    pointer_width() == 64
}

/// `read`/`write`/`execute` protection, the default for allocations.
pub const PROTECTION_RWX: u32 = 0x40;

/// Allocate committed executable memory, e.g. for a trampoline.
pub fn allocate_executable(size: usize) -> Result<usize> {
    allocate(size, PROTECTION_RWX)
}

/// The first loaded image, i.e. the host executable.
pub fn main_module() -> Option<Module> {
    enumerate_modules().into_iter().next()
}

/// Short host process name for display.
pub fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_default()
}

/// True when one committed region covers `[address, address + size)`.
pub fn is_committed(address: usize, size: usize) -> bool {
    if address == 0 {
        return false;
    }
    match query_region(address) {
        Some(region) => region.contains(address, size.max(1)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_width_matches_usize() {
        assert_eq!(pointer_width() as usize, std::mem::size_of::<usize>() * 8);
    }

    #[test]
    fn test_query_region_finds_own_stack_or_data() {
        let local = 0u64;
        let addr = &local as *const u64 as usize;
        let region = query_region(addr).expect("stack must be mapped");
        assert!(region.contains(addr, 8));
        assert!(region.protection.read);
    }

    #[test]
    fn test_enumerate_regions_nonempty_and_sorted() {
        let regions = enumerate_regions();
        assert!(!regions.is_empty());
        for pair in regions.windows(2) {
            assert!(pair[0].base <= pair[1].base);
        }
    }

    #[test]
    fn test_enumerate_modules_contains_main() {
        let modules = enumerate_modules();
        assert!(!modules.is_empty());
        let main = main_module().unwrap();
        assert!(main.size > 0);
    }

    #[test]
    fn test_allocate_and_free_executable() {
        let addr = allocate_executable(4096).unwrap();
        assert_ne!(addr, 0);
        assert!(is_committed(addr, 4096));
        free(addr).unwrap();
    }

    #[test]
    fn test_protection_toggle_roundtrip() {
        let addr = allocate(4096, 0x04).unwrap(); // read/write
        let prev = set_protection_rwx(addr, 4096).unwrap();
        let region = query_region(addr).unwrap();
        assert!(region.protection.execute);
        restore_protection(addr, 4096, prev).unwrap();
        let region = query_region(addr).unwrap();
        assert!(!region.protection.execute);
        free(addr).unwrap();
    }

    #[test]
    fn test_is_committed_rejects_null() {
        assert!(!is_committed(0, 8));
    }
}
