//! Region and module caches
//!
//! Enumeration walks the whole address space, which is too slow to repeat
//! for every scan-result display. Snapshots are cached and refreshed once
//! they are older than [`CACHE_TTL`]; refreshes are idempotent and the last
//! writer wins, so readers may observe entries up to the TTL stale.

use crate::sys;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use veil_common::{MemoryRegion, Module};

/// How long a cached snapshot stays trusted.
pub const CACHE_TTL: Duration = Duration::from_secs(5);

struct Stamped<T> {
    taken_at: Instant,
    data: Arc<T>,
}

/// Cached snapshot of all committed regions, with owning-module names
/// resolved against the module list.
pub struct RegionCache {
    inner: Mutex<Option<Stamped<Vec<MemoryRegion>>>>,
}

impl Default for RegionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RegionCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn snapshot(&self, modules: &ModuleCache) -> Arc<Vec<MemoryRegion>> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stamped) = guard.as_ref() {
            if stamped.taken_at.elapsed() < CACHE_TTL {
                return Arc::clone(&stamped.data);
            }
        }

        let module_list = modules.snapshot();
        let mut regions = sys::enumerate_regions();
        for region in &mut regions {
            if region.module_name.is_none() {
                region.module_name = module_list
                    .iter()
                    .find(|m| m.contains(region.base))
                    .map(|m| m.name.clone());
            }
        }
        debug!(target: "veil_core::regions", count = regions.len(), "region snapshot refreshed");

        let data = Arc::new(regions);
        *guard = Some(Stamped {
            taken_at: Instant::now(),
            data: Arc::clone(&data),
        });
        data
    }

    pub fn invalidate(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }
}

/// Cached snapshot of loaded modules.
pub struct ModuleCache {
    inner: Mutex<Option<Stamped<Vec<Module>>>>,
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<Module>> {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stamped) = guard.as_ref() {
            if stamped.taken_at.elapsed() < CACHE_TTL {
                return Arc::clone(&stamped.data);
            }
        }

        let modules = sys::enumerate_modules();
        debug!(target: "veil_core::regions", count = modules.len(), "module snapshot refreshed");

        let data = Arc::new(modules);
        *guard = Some(Stamped {
            taken_at: Instant::now(),
            data: Arc::clone(&data),
        });
        data
    }

    pub fn invalidate(&self) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = None;
    }

    /// `"module+0xoffset"` for display, or `None` outside any image.
    pub fn info_for_address(&self, address: usize) -> Option<String> {
        let modules = self.snapshot();
        modules
            .iter()
            .find(|m| m.contains(address))
            .map(|m| format!("{}+{:#x}", m.name, address - m.base))
    }

    /// Case-insensitive lookup by module file name.
    pub fn find(&self, name: &str) -> Option<Module> {
        let needle = name.to_lowercase();
        self.snapshot()
            .iter()
            .find(|m| m.name.to_lowercase() == needle)
            .cloned()
    }

    pub fn main(&self) -> Option<Module> {
        self.snapshot().first().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reused_within_ttl() {
        let modules = ModuleCache::new();
        let first = modules.snapshot();
        let second = modules.snapshot();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_invalidate_forces_refresh() {
        let modules = ModuleCache::new();
        let first = modules.snapshot();
        modules.invalidate();
        let second = modules.snapshot();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_region_snapshot_covers_own_data() {
        let modules = ModuleCache::new();
        let regions = RegionCache::new();
        let local = 7u64;
        let addr = &local as *const u64 as usize;
        let snapshot = regions.snapshot(&modules);
        assert!(snapshot.iter().any(|r| r.contains(addr, 8)));
    }

    #[test]
    fn test_info_for_address_inside_main_module() {
        let modules = ModuleCache::new();
        let main = modules.main().expect("main module");
        let info = modules.info_for_address(main.base + 0x10).unwrap();
        assert!(info.starts_with(&main.name));
        assert!(info.ends_with("+0x10"));
    }

    #[test]
    fn test_info_for_address_outside_modules() {
        let modules = ModuleCache::new();
        // The zero page is never part of a loaded image.
        assert!(modules.info_for_address(0x10).is_none());
    }
}
