//! Windows backend: VirtualQuery / VirtualProtect / VirtualAlloc and the
//! PSAPI module snapshot.

use super::PrevProtection;
use veil_common::{Error, MemoryRegion, Module, Protection, Result};
use windows::Win32::Foundation::HMODULE;
use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT,
    MEM_RELEASE, MEM_RESERVE, PAGE_PROTECTION_FLAGS,
};
use windows::Win32::System::ProcessStatus::{
    EnumProcessModules, GetModuleBaseNameW, GetModuleFileNameExW, GetModuleInformation, MODULEINFO,
};
use windows::Win32::System::Threading::GetCurrentProcess;

fn region_from_mbi(mbi: &MEMORY_BASIC_INFORMATION) -> MemoryRegion {
    let raw = mbi.Protect.0;
    MemoryRegion {
        base: mbi.BaseAddress as usize,
        size: mbi.RegionSize,
        raw_protection: raw,
        protection: Protection::from_windows(raw),
        module_name: None,
    }
}

/// Query the committed region containing `address`.
pub fn query_region(address: usize) -> Option<MemoryRegion> {
    unsafe {
        let mut mbi = MEMORY_BASIC_INFORMATION::default();
        let written = VirtualQuery(
            Some(address as *const _),
            &mut mbi,
            std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        );
        if written == 0 || mbi.State != MEM_COMMIT {
            return None;
        }
        Some(region_from_mbi(&mbi))
    }
}

/// Walk the whole address space, returning committed regions in order.
pub fn enumerate_regions() -> Vec<MemoryRegion> {
    let mut regions = Vec::new();
    let mut address: usize = 0;

    unsafe {
        loop {
            let mut mbi = MEMORY_BASIC_INFORMATION::default();
            let written = VirtualQuery(
                Some(address as *const _),
                &mut mbi,
                std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            );
            if written == 0 {
                break;
            }

            if mbi.State == MEM_COMMIT {
                regions.push(region_from_mbi(&mbi));
            }

            let next = (mbi.BaseAddress as usize).wrapping_add(mbi.RegionSize);
            if next <= address {
                break;
            }
            address = next;
        }
    }

    regions
}

/// Snapshot of all loaded modules; index 0 is the host executable.
pub fn enumerate_modules() -> Vec<Module> {
    let mut modules = Vec::new();

    unsafe {
        let process = GetCurrentProcess();
        let mut handles: [HMODULE; 1024] = [HMODULE::default(); 1024];
        let mut cb_needed: u32 = 0;

        if EnumProcessModules(
            process,
            handles.as_mut_ptr(),
            std::mem::size_of_val(&handles) as u32,
            &mut cb_needed,
        )
        .is_err()
        {
            return modules;
        }

        let count = cb_needed as usize / std::mem::size_of::<HMODULE>();
        for hmod in handles.iter().take(count).copied() {
            let mut name_buf = [0u16; 260];
            let len = GetModuleBaseNameW(process, hmod, &mut name_buf);
            if len == 0 {
                continue;
            }
            let name = String::from_utf16_lossy(&name_buf[..len as usize]);

            let mut info = MODULEINFO::default();
            if GetModuleInformation(
                process,
                hmod,
                &mut info,
                std::mem::size_of::<MODULEINFO>() as u32,
            )
            .is_err()
            {
                continue;
            }

            let path = {
                let mut path_buf = [0u16; 260];
                let path_len = GetModuleFileNameExW(process, hmod, &mut path_buf);
                if path_len > 0 {
                    String::from_utf16_lossy(&path_buf[..path_len as usize])
                } else {
                    name.clone()
                }
            };

            modules.push(Module {
                name,
                path,
                base: info.lpBaseOfDll as usize,
                size: info.SizeOfImage as usize,
            });
        }
    }

    modules
}

/// Raise protection of `[address, address + len)` to RWX, returning the
/// previous protection.
pub fn set_protection_rwx(address: usize, len: usize) -> Result<PrevProtection> {
    unsafe {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        VirtualProtect(
            address as *const _,
            len,
            PAGE_PROTECTION_FLAGS(super::PROTECTION_RWX),
            &mut old,
        )
        .map_err(|e| Error::MemoryAccess {
            address,
            message: format!("VirtualProtect failed: {}", e),
        })?;
        Ok(PrevProtection(old.0))
    }
}

pub fn restore_protection(address: usize, len: usize, prev: PrevProtection) -> Result<()> {
    unsafe {
        let mut old = PAGE_PROTECTION_FLAGS::default();
        VirtualProtect(address as *const _, len, PAGE_PROTECTION_FLAGS(prev.0), &mut old).map_err(
            |e| Error::MemoryAccess {
                address,
                message: format!("VirtualProtect restore failed: {}", e),
            },
        )
    }
}

/// Commit fresh pages with the given Windows protection constant.
pub fn allocate(size: usize, protection: u32) -> Result<usize> {
    unsafe {
        let addr = VirtualAlloc(
            None,
            size,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_PROTECTION_FLAGS(protection),
        );
        if addr.is_null() {
            return Err(Error::Allocation(format!(
                "VirtualAlloc of {} bytes failed",
                size
            )));
        }
        Ok(addr as usize)
    }
}

pub fn free(address: usize) -> Result<()> {
    unsafe {
        VirtualFree(address as *mut _, 0, MEM_RELEASE)
            .map_err(|e| Error::Allocation(format!("VirtualFree failed: {}", e)))
    }
}

pub fn flush_instruction_cache(address: usize, len: usize) {
    unsafe {
        let _ = FlushInstructionCache(GetCurrentProcess(), Some(address as *const _), len);
    }
}
