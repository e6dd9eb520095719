//! Fault-safe memory access layer
//!
//! Every read and write is gated by a region query issued immediately
//! before the copy. The copy itself is performed by the kernel against our
//! own process (`process_vm_readv`/`process_vm_writev` on Linux,
//! `ReadProcessMemory`/`WriteProcessMemory` on Windows), so an access
//! fault comes back as an error return instead of a signal or structured
//! exception. Protection can still change between the gate and the copy;
//! the kernel-mediated copy bounds that race to a clean failure.

use crate::sys;
use crate::value::{self, STRING_READ_LIMIT};
use tracing::trace;
use veil_common::ValueType;

/// Number of bytes returned for an untyped `bytes` value read.
const BYTES_READ_LEN: usize = 16;

/// True when `[address, address + size)` lies inside one committed region.
pub fn is_valid(address: usize, size: usize) -> bool {
    if address == 0 {
        return false;
    }
    match sys::query_region(address) {
        Some(region) => region.contains(address, size.max(1)),
        None => false,
    }
}

pub fn is_readable(address: usize, size: usize) -> bool {
    if address == 0 {
        return false;
    }
    match sys::query_region(address) {
        Some(region) => region.protection.read && region.contains(address, size.max(1)),
        None => false,
    }
}

pub fn is_writable(address: usize, size: usize) -> bool {
    if address == 0 {
        return false;
    }
    match sys::query_region(address) {
        Some(region) => region.protection.write && region.contains(address, size.max(1)),
        None => false,
    }
}

// Fault-guarded copies. The kernel walks the source/destination pages on
// our behalf and reports an unmapped or protected page as EFAULT or a
// short transfer; nothing is delivered to the process. Partial transfers
// count as failure, so callers see either the full payload or nothing.

#[cfg(unix)]
fn guarded_read(dst: &mut [u8], src: usize) -> bool {
    let local = libc::iovec {
        iov_base: dst.as_mut_ptr() as *mut libc::c_void,
        iov_len: dst.len(),
    };
    let remote = libc::iovec {
        iov_base: src as *mut libc::c_void,
        iov_len: dst.len(),
    };
    let copied = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    copied == dst.len() as isize
}

#[cfg(unix)]
fn guarded_write(dst: usize, src: &[u8]) -> bool {
    let local = libc::iovec {
        iov_base: src.as_ptr() as *mut libc::c_void,
        iov_len: src.len(),
    };
    let remote = libc::iovec {
        iov_base: dst as *mut libc::c_void,
        iov_len: src.len(),
    };
    let copied = unsafe { libc::process_vm_writev(libc::getpid(), &local, 1, &remote, 1, 0) };
    copied == src.len() as isize
}

#[cfg(windows)]
fn guarded_read(dst: &mut [u8], src: usize) -> bool {
    use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;
    use windows::Win32::System::Threading::GetCurrentProcess;

    let mut copied = 0usize;
    unsafe {
        ReadProcessMemory(
            GetCurrentProcess(),
            src as *const _,
            dst.as_mut_ptr() as *mut _,
            dst.len(),
            Some(&mut copied),
        )
        .is_ok()
            && copied == dst.len()
    }
}

#[cfg(windows)]
fn guarded_write(dst: usize, src: &[u8]) -> bool {
    use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;
    use windows::Win32::System::Threading::GetCurrentProcess;

    let mut copied = 0usize;
    unsafe {
        WriteProcessMemory(
            GetCurrentProcess(),
            dst as *const _,
            src.as_ptr() as *const _,
            src.len(),
            Some(&mut copied),
        )
        .is_ok()
            && copied == src.len()
    }
}

/// Read `size` bytes at `address`. Returns an empty vector on any failure;
/// no partial reads.
pub fn read_bytes(address: usize, size: usize) -> Vec<u8> {
    if size == 0 || !is_readable(address, size) {
        return Vec::new();
    }

    let mut buffer = vec![0u8; size];
    if guarded_read(&mut buffer, address) {
        buffer
    } else {
        trace!(target: "veil_core::access", address = format!("{:#x}", address), size, "read faulted");
        Vec::new()
    }
}

/// Write `bytes` at `address`, toggling protection when the target region
/// is not writable. Returns false on any failure. A fault in the middle of
/// the toggle-copy-restore sequence can leave the region with elevated
/// protection; that is the accepted hazard of writing to unsafe targets.
pub fn write_bytes(address: usize, bytes: &[u8]) -> bool {
    if bytes.is_empty() || !is_valid(address, bytes.len()) {
        return false;
    }

    if is_writable(address, bytes.len()) {
        return guarded_write(address, bytes);
    }

    let prev = match sys::set_protection_rwx(address, bytes.len()) {
        Ok(prev) => prev,
        Err(_) => return false,
    };
    let copied = guarded_write(address, bytes);
    let restored = sys::restore_protection(address, bytes.len(), prev).is_ok();
    if copied {
        sys::flush_instruction_cache(address, bytes.len());
    }
    copied && restored
}

/// Typed read: the encoding of the value at `address` per `value_type`,
/// or `None` when the bytes cannot be read.
pub fn read_value(address: usize, value_type: ValueType) -> Option<Vec<u8>> {
    match value_type {
        ValueType::Int32 | ValueType::Float => read_exact(address, 4),
        ValueType::Int64 | ValueType::Double => read_exact(address, 8),
        ValueType::Byte => read_exact(address, 1),
        ValueType::String => {
            // Clamp to the region end so short strings near a boundary
            // still resolve.
            let region = sys::query_region(address)?;
            if !region.protection.read || address >= region.end() {
                return None;
            }
            let avail = (region.end() - address).min(STRING_READ_LIMIT);
            let bytes = read_bytes(address, avail);
            if bytes.is_empty() {
                return None;
            }
            let terminator = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            Some(bytes[..terminator].to_vec())
        }
        ValueType::Bytes => read_exact(address, BYTES_READ_LEN),
    }
}

fn read_exact(address: usize, size: usize) -> Option<Vec<u8>> {
    let bytes = read_bytes(address, size);
    (bytes.len() == size).then_some(bytes)
}

/// Typed write: parse `literal` per `value_type` and write its encoding.
pub fn write_value(address: usize, literal: &str, value_type: ValueType) -> bool {
    match value::value_to_bytes(literal, value_type) {
        Ok(bytes) => write_bytes(address, &bytes),
        Err(_) => false,
    }
}
