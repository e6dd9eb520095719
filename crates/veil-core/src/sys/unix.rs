//! Unix backend: `/proc/self/maps` parsing plus mprotect/mmap.
//!
//! Raw protection is encoded as `PROT_READ | PROT_WRITE | PROT_EXEC` bits.

use super::PrevProtection;
use std::collections::HashMap;
use std::fs;
use std::sync::Mutex;
use veil_common::{Error, MemoryRegion, Module, Protection, Result};

/// mmap has no free-with-size-0; remember allocation lengths for munmap.
static ALLOCATIONS: Mutex<Option<HashMap<usize, usize>>> = Mutex::new(None);

struct MapsLine<'a> {
    start: usize,
    end: usize,
    flags: &'a str,
    pathname: &'a str,
}

fn parse_line(line: &str) -> Option<MapsLine<'_>> {
    let mut parts = line.split_ascii_whitespace();
    let range = parts.next()?;
    let flags = parts.next()?;
    let _offset = parts.next()?;
    let _dev = parts.next()?;
    let _inode = parts.next()?;
    let pathname = parts.next().unwrap_or("");

    let (start, end) = range.split_once('-')?;
    Some(MapsLine {
        start: usize::from_str_radix(start, 16).ok()?,
        end: usize::from_str_radix(end, 16).ok()?,
        flags,
        pathname,
    })
}

fn raw_protection(flags: &str) -> u32 {
    let bytes = flags.as_bytes();
    let mut raw = 0u32;
    if bytes.first() == Some(&b'r') {
        raw |= libc::PROT_READ as u32;
    }
    if bytes.get(1) == Some(&b'w') {
        raw |= libc::PROT_WRITE as u32;
    }
    if bytes.get(2) == Some(&b'x') {
        raw |= libc::PROT_EXEC as u32;
    }
    raw
}

fn region_from_line(line: &MapsLine<'_>) -> MemoryRegion {
    let file_backed = line.pathname.starts_with('/');
    let module_name = if file_backed {
        std::path::Path::new(line.pathname)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
    } else {
        None
    };
    MemoryRegion {
        base: line.start,
        size: line.end - line.start,
        raw_protection: raw_protection(line.flags),
        protection: Protection::from_unix_flags(line.flags, file_backed),
        module_name,
    }
}

pub fn query_region(address: usize) -> Option<MemoryRegion> {
    let maps = fs::read_to_string("/proc/self/maps").ok()?;
    maps.lines()
        .filter_map(parse_line)
        .find(|line| address >= line.start && address < line.end)
        .map(|line| region_from_line(&line))
}

pub fn enumerate_regions() -> Vec<MemoryRegion> {
    let Ok(maps) = fs::read_to_string("/proc/self/maps") else {
        return Vec::new();
    };
    maps.lines()
        .filter_map(parse_line)
        .map(|line| region_from_line(&line))
        .collect()
}

/// Distinct file-backed images, merged across their consecutive mappings.
/// The host executable is reported first.
pub fn enumerate_modules() -> Vec<Module> {
    let Ok(maps) = fs::read_to_string("/proc/self/maps") else {
        return Vec::new();
    };

    let mut modules: Vec<Module> = Vec::new();
    for line in maps.lines().filter_map(parse_line) {
        if !line.pathname.starts_with('/') {
            continue;
        }
        match modules.last_mut() {
            Some(last) if last.path == line.pathname => {
                last.size = line.end - last.base;
            }
            _ => {
                let name = std::path::Path::new(line.pathname)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| line.pathname.to_string());
                modules.push(Module {
                    name,
                    path: line.pathname.to_string(),
                    base: line.start,
                    size: line.end - line.start,
                });
            }
        }
    }

    // The command surface treats the first entry as the main module.
    if let Ok(exe) = fs::read_link("/proc/self/exe") {
        let exe = exe.to_string_lossy().to_string();
        if let Some(pos) = modules.iter().position(|m| m.path == exe) {
            modules.swap(0, pos);
        }
    }

    modules
}

fn page_span(address: usize, len: usize) -> (usize, usize) {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
    let start = address & !(page - 1);
    let end = (address + len.max(1) + page - 1) & !(page - 1);
    (start, end - start)
}

pub fn set_protection_rwx(address: usize, len: usize) -> Result<PrevProtection> {
    let prev = query_region(address).ok_or(Error::InvalidAddress(address))?;
    let (start, span) = page_span(address, len);
    let rc = unsafe {
        libc::mprotect(
            start as *mut _,
            span,
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        )
    };
    if rc != 0 {
        return Err(Error::MemoryAccess {
            address,
            message: "mprotect failed".into(),
        });
    }
    Ok(PrevProtection(prev.raw_protection))
}

pub fn restore_protection(address: usize, len: usize, prev: PrevProtection) -> Result<()> {
    let (start, span) = page_span(address, len);
    let rc = unsafe { libc::mprotect(start as *mut _, span, prev.0 as i32) };
    if rc != 0 {
        return Err(Error::MemoryAccess {
            address,
            message: "mprotect restore failed".into(),
        });
    }
    Ok(())
}

/// Map fresh anonymous pages. `protection` uses the Windows constants the
/// wire protocol speaks; it is translated to PROT bits here.
pub fn allocate(size: usize, protection: u32) -> Result<usize> {
    let decoded = Protection::from_windows(protection);
    let mut prot = 0;
    if decoded.read {
        prot |= libc::PROT_READ;
    }
    if decoded.write {
        prot |= libc::PROT_WRITE;
    }
    if decoded.execute {
        prot |= libc::PROT_EXEC;
    }
    if prot == 0 {
        prot = libc::PROT_READ | libc::PROT_WRITE;
    }

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(Error::Allocation(format!("mmap of {} bytes failed", size)));
    }

    let mut guard = ALLOCATIONS.lock().unwrap_or_else(|e| e.into_inner());
    guard
        .get_or_insert_with(HashMap::new)
        .insert(addr as usize, size);
    Ok(addr as usize)
}

pub fn free(address: usize) -> Result<()> {
    let size = {
        let mut guard = ALLOCATIONS.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_mut()
            .and_then(|map| map.remove(&address))
            .ok_or(Error::InvalidAddress(address))?
    };
    let rc = unsafe { libc::munmap(address as *mut _, size) };
    if rc != 0 {
        return Err(Error::Allocation("munmap failed".into()));
    }
    Ok(())
}

pub fn flush_instruction_cache(_address: usize, _len: usize) {
    // Coherent I/D caches on x86; nothing to do.
}
