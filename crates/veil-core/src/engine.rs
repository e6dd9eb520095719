//! Engine handle
//!
//! One `MemoryEngine` owns the caches, the hook registry and the tracked
//! allocations. The agent holds a single shared instance and passes it to
//! the command surface; there are no process-wide singletons. Shutdown
//! removes every hook and frees every tracked allocation.

use crate::regions::{ModuleCache, RegionCache};
use crate::registry::HookRegistry;
use crate::{access, pattern, pointer, scanner, sys};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use crate::pattern::Pattern;
use veil_common::{
    Error, HookRecord, HookType, MemoryRegion, Module, Result, ScanOptions, ScanResult, ScanType,
    ValueType,
};

/// Aggregate process facts for `process.info`.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub pointer_width: u32,
    pub main_module: Option<Module>,
    pub total_bytes: usize,
    pub writable_bytes: usize,
    pub executable_bytes: usize,
}

pub struct MemoryEngine {
    regions: RegionCache,
    modules: ModuleCache,
    hooks: HookRegistry,
    /// Addresses handed out by `memory.allocate`, freed at shutdown.
    allocations: Mutex<HashSet<usize>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            regions: RegionCache::new(),
            modules: ModuleCache::new(),
            hooks: HookRegistry::new(),
            allocations: Mutex::new(HashSet::new()),
        }
    }

    // ------------------------------------------------------------------
    // Regions and modules
    // ------------------------------------------------------------------

    pub fn region_snapshot(&self) -> Arc<Vec<MemoryRegion>> {
        self.regions.snapshot(&self.modules)
    }

    pub fn query_region(&self, address: usize) -> Option<MemoryRegion> {
        sys::query_region(address)
    }

    pub fn modules(&self) -> Arc<Vec<Module>> {
        self.modules.snapshot()
    }

    pub fn module_by_name(&self, name: &str) -> Option<Module> {
        self.modules.find(name)
    }

    pub fn main_module(&self) -> Option<Module> {
        self.modules.main()
    }

    pub fn module_info_for_address(&self, address: usize) -> Option<String> {
        self.modules.info_for_address(address)
    }

    pub fn process_info(&self) -> ProcessInfo {
        let regions = self.region_snapshot();
        let mut total = 0usize;
        let mut writable = 0usize;
        let mut executable = 0usize;
        for region in regions.iter() {
            total += region.size;
            if region.protection.write {
                writable += region.size;
            }
            if region.protection.execute {
                executable += region.size;
            }
        }

        ProcessInfo {
            pid: std::process::id(),
            name: sys::process_name(),
            pointer_width: sys::pointer_width(),
            main_module: self.main_module(),
            total_bytes: total,
            writable_bytes: writable,
            executable_bytes: executable,
        }
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    pub fn first_scan(
        &self,
        literal: &str,
        value_type: ValueType,
        options: &ScanOptions,
    ) -> Result<Vec<ScanResult>> {
        let regions = self.region_snapshot();
        scanner::first_scan(&regions, literal, value_type, options)
    }

    pub fn next_scan(
        &self,
        scan_type: ScanType,
        literal: Option<&str>,
        previous: &[ScanResult],
        value_type: ValueType,
    ) -> Result<Vec<ScanResult>> {
        scanner::next_scan(scan_type, literal, previous, value_type)
    }

    /// AOB scan over `[start, end)`; zero bounds default to the main
    /// module's range.
    pub fn pattern_scan_all(&self, pattern: &Pattern, start: usize, end: usize) -> Vec<usize> {
        let (start, end) = self.pattern_bounds(start, end);
        let regions = self.region_snapshot();
        pattern::scan_all(&regions, pattern, start, end)
    }

    pub fn pattern_scan_first(
        &self,
        pattern: &Pattern,
        start: usize,
        end: usize,
    ) -> Option<usize> {
        let (start, end) = self.pattern_bounds(start, end);
        let regions = self.region_snapshot();
        pattern::scan_first(&regions, pattern, start, end)
    }

    fn pattern_bounds(&self, start: usize, end: usize) -> (usize, usize) {
        match (start, end) {
            (0, 0) => match self.main_module() {
                Some(main) => (main.base, main.end()),
                None => (0, usize::MAX),
            },
            (s, 0) => (s, usize::MAX),
            (s, e) => (s, e),
        }
    }

    pub fn follow_pointer_chain(&self, base: usize, offsets: &[usize]) -> Result<usize> {
        pointer::follow_chain(base, offsets)
    }

    pub fn find_pointers_to(&self, target: usize, options: &ScanOptions) -> Vec<ScanResult> {
        let regions = self.region_snapshot();
        pointer::find_pointers_to(&regions, target, options)
    }

    // ------------------------------------------------------------------
    // Patching
    // ------------------------------------------------------------------

    /// Verify-then-write: the patch applies only when the bytes currently
    /// at `address` equal `original`.
    pub fn patch_bytes(&self, address: usize, original: &[u8], replacement: &[u8]) -> Result<()> {
        let current = access::read_bytes(address, original.len());
        if current.is_empty() {
            return Err(Error::MemoryAccess {
                address,
                message: "patch target not readable".into(),
            });
        }
        if current != original {
            return Err(Error::InvalidParameter(
                "original bytes do not match the patch target".into(),
            ));
        }
        if !access::write_bytes(address, replacement) {
            return Err(Error::MemoryAccess {
                address,
                message: "patch write failed".into(),
            });
        }
        Ok(())
    }

    /// Overwrite `size` bytes with NOPs.
    pub fn nop(&self, address: usize, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidParameter("NOP size must be non-zero".into()));
        }
        let nops = vec![0x90u8; size];
        if !access::write_bytes(address, &nops) {
            return Err(Error::MemoryAccess {
                address,
                message: "NOP write failed".into(),
            });
        }
        Ok(())
    }

    pub fn restore_bytes(&self, address: usize, original: &[u8]) -> Result<()> {
        if !access::write_bytes(address, original) {
            return Err(Error::MemoryAccess {
                address,
                message: "restore write failed".into(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Allocations
    // ------------------------------------------------------------------

    pub fn allocate(&self, size: usize, protection: u32) -> Result<usize> {
        if size == 0 {
            return Err(Error::InvalidParameter("Allocation size must be non-zero".into()));
        }
        let address = sys::allocate(size, protection)?;
        self.allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address);
        self.regions.invalidate();
        Ok(address)
    }

    pub fn free(&self, address: usize) -> Result<()> {
        sys::free(address)?;
        self.allocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&address);
        self.regions.invalidate();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Hooks
    // ------------------------------------------------------------------

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn install_hook(
        &self,
        name: &str,
        target: usize,
        detour: usize,
        hook_type: HookType,
    ) -> Result<HookRecord> {
        self.hooks.install(name, target, detour, hook_type)
    }

    pub fn remove_hook(&self, name: &str) -> Result<()> {
        self.hooks.remove(name)
    }

    pub fn toggle_hook(&self, name: &str) -> Result<bool> {
        self.hooks.toggle(name)
    }

    pub fn list_hooks(&self) -> Vec<HookRecord> {
        self.hooks.list()
    }

    pub fn is_hooked(&self, address: usize) -> bool {
        self.hooks.is_hooked(address)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Remove every hook and free every tracked allocation. Best-effort;
    /// failures are logged and the teardown continues.
    pub fn shutdown(&self) {
        if !self.hooks.remove_all() {
            warn!(target: "veil_core::engine", "some hooks could not be removed at shutdown");
        }

        let addresses: Vec<usize> = {
            let guard = self.allocations.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().copied().collect()
        };
        for address in addresses {
            if let Err(e) = self.free(address) {
                warn!(target: "veil_core::engine", address = format!("{:#x}", address), error = %e, "allocation leak at shutdown");
            }
        }

        info!(target: "veil_core::engine", "engine shut down");
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
