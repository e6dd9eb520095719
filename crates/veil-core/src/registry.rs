//! Hook registry
//!
//! Named hooks with a secondary address index. One mutex guards both maps
//! and every detour mutation, so install/remove/enable/disable against the
//! same address are globally ordered. Names are unique, and so are target
//! addresses: one hook per address.

use crate::detour::{self, InstalledDetour};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};
use veil_common::{Error, HookRecord, HookType, Result};

struct HookEntry {
    detour: InstalledDetour,
    active: bool,
}

#[derive(Default)]
struct RegistryState {
    by_name: HashMap<String, HookEntry>,
    name_by_address: HashMap<usize, String>,
}

pub struct HookRegistry {
    state: Mutex<RegistryState>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn record(name: &str, entry: &HookEntry) -> HookRecord {
        HookRecord {
            name: name.to_string(),
            target: entry.detour.target,
            detour: entry.detour.detour,
            trampoline: entry.detour.trampoline,
            original_bytes: entry.detour.original_bytes.clone(),
            prologue_len: entry.detour.prologue_len,
            hook_type: entry.detour.hook_type,
            active: entry.active,
        }
    }

    /// Install a named hook. Returns the record whose `trampoline` is the
    /// caller's original-function pointer.
    pub fn install(
        &self,
        name: &str,
        target: usize,
        detour_address: usize,
        hook_type: HookType,
    ) -> Result<HookRecord> {
        if name.is_empty() {
            return Err(Error::InvalidParameter("Hook name must not be empty".into()));
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.by_name.contains_key(name) {
            return Err(Error::HookConflict(format!(
                "hook '{}' already exists",
                name
            )));
        }
        if state.name_by_address.contains_key(&target) {
            return Err(Error::HookConflict(format!(
                "address {:#x} is already hooked",
                target
            )));
        }

        let installed = detour::install(target, detour_address, hook_type)?;
        let entry = HookEntry {
            detour: installed,
            active: true,
        };
        let record = Self::record(name, &entry);

        state.name_by_address.insert(target, name.to_string());
        state.by_name.insert(name.to_string(), entry);
        info!(target: "veil_core::registry", name, address = format!("{:#x}", target), "hook registered");
        Ok(record)
    }

    /// Remove a hook: restore the prologue, free the trampoline, drop the
    /// entry. On failure the entry stays registered.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state
            .by_name
            .get(name)
            .ok_or_else(|| Error::HookNotFound(name.to_string()))?;

        detour::remove(&entry.detour)?;
        let target = entry.detour.target;
        state.by_name.remove(name);
        state.name_by_address.remove(&target);
        info!(target: "veil_core::registry", name, "hook removed");
        Ok(())
    }

    /// Re-write the hook bytes for a disabled hook.
    pub fn enable(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state
            .by_name
            .get_mut(name)
            .ok_or_else(|| Error::HookNotFound(name.to_string()))?;
        if !entry.active {
            detour::write_hook(&entry.detour)?;
            entry.active = true;
        }
        Ok(entry.active)
    }

    /// Restore the prologue in place; the entry and trampoline stay.
    pub fn disable(&self, name: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entry = state
            .by_name
            .get_mut(name)
            .ok_or_else(|| Error::HookNotFound(name.to_string()))?;
        if entry.active {
            detour::restore_original(&entry.detour)?;
            entry.active = false;
        }
        Ok(entry.active)
    }

    /// Flip to the opposite state; returns the new active flag.
    pub fn toggle(&self, name: &str) -> Result<bool> {
        let currently_active = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .by_name
                .get(name)
                .map(|entry| entry.active)
                .ok_or_else(|| Error::HookNotFound(name.to_string()))?
        };
        if currently_active {
            self.disable(name)
        } else {
            self.enable(name)
        }
    }

    pub fn is_hooked(&self, address: usize) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.name_by_address.contains_key(&address)
    }

    pub fn get(&self, name: &str) -> Option<HookRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.by_name.get(name).map(|e| Self::record(name, e))
    }

    pub fn list(&self) -> Vec<HookRecord> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<HookRecord> = state
            .by_name
            .iter()
            .map(|(name, entry)| Self::record(name, entry))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    /// Best-effort teardown: keeps going past individual failures and
    /// reports whether every removal succeeded.
    pub fn remove_all(&self) -> bool {
        let names: Vec<String> = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.by_name.keys().cloned().collect()
        };

        let mut all_ok = true;
        for name in names {
            if let Err(e) = self.remove(&name) {
                warn!(target: "veil_core::registry", name = %name, error = %e, "hook removal failed");
                all_ok = false;
            }
        }
        all_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{access, sys};

    fn target_function() -> usize {
        let addr = sys::allocate_executable(4096).unwrap();
        let mut code = Vec::new();
        for imm in [1i32, 2, 42] {
            code.push(0xB8);
            code.extend_from_slice(&imm.to_le_bytes());
        }
        code.push(0xC3);
        assert!(access::write_bytes(addr, &code));
        addr
    }

    fn ret_stub() -> usize {
        let addr = sys::allocate_executable(16).unwrap();
        assert!(access::write_bytes(addr, &[0xC3]));
        addr
    }

    #[test]
    fn test_install_and_lookup() {
        let registry = HookRegistry::new();
        let target = target_function();
        let detour = ret_stub();

        let record = registry
            .install("lookup", target, detour, HookType::Auto)
            .unwrap();
        assert!(record.active);
        assert_ne!(record.trampoline, 0);
        assert!(registry.is_hooked(target));
        assert!(registry.get("lookup").is_some());
        assert_eq!(registry.list().len(), 1);

        registry.remove("lookup").unwrap();
        assert!(!registry.is_hooked(target));
        assert!(registry.get("lookup").is_none());

        sys::free(target).unwrap();
        sys::free(detour).unwrap();
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = HookRegistry::new();
        let first = target_function();
        let second = target_function();
        let detour = ret_stub();

        registry
            .install("dup", first, detour, HookType::Auto)
            .unwrap();
        assert!(matches!(
            registry.install("dup", second, detour, HookType::Auto),
            Err(Error::HookConflict(_))
        ));

        assert!(registry.remove_all());
        sys::free(first).unwrap();
        sys::free(second).unwrap();
        sys::free(detour).unwrap();
    }

    #[test]
    fn test_duplicate_address_rejected() {
        let registry = HookRegistry::new();
        let target = target_function();
        let detour = ret_stub();

        registry
            .install("one", target, detour, HookType::Auto)
            .unwrap();
        assert!(matches!(
            registry.install("two", target, detour, HookType::Auto),
            Err(Error::HookConflict(_))
        ));

        assert!(registry.remove_all());
        sys::free(target).unwrap();
        sys::free(detour).unwrap();
    }

    #[test]
    fn test_disable_restores_and_enable_rewrites() {
        let registry = HookRegistry::new();
        let target = target_function();
        let detour = ret_stub();
        let original = access::read_bytes(target, 16);

        registry
            .install("flip", target, detour, HookType::Auto)
            .unwrap();
        let hooked = access::read_bytes(target, 16);
        assert_ne!(hooked, original);

        assert!(!registry.disable("flip").unwrap());
        assert_eq!(access::read_bytes(target, 16), original);

        // Enable must re-write the hook bytes, not just flip the flag.
        assert!(registry.enable("flip").unwrap());
        assert_eq!(access::read_bytes(target, 16), hooked);

        assert!(registry.toggle("flip").is_ok_and(|active| !active));
        assert_eq!(access::read_bytes(target, 16), original);

        registry.remove("flip").unwrap();
        sys::free(target).unwrap();
        sys::free(detour).unwrap();
    }

    #[test]
    fn test_remove_all_clears_registry() {
        let registry = HookRegistry::new();
        let a = target_function();
        let b = target_function();
        let detour = ret_stub();

        registry.install("a", a, detour, HookType::Auto).unwrap();
        registry.install("b", b, detour, HookType::Auto).unwrap();
        assert!(registry.remove_all());
        assert!(registry.list().is_empty());
        assert!(!registry.is_hooked(a));
        assert!(!registry.is_hooked(b));

        sys::free(a).unwrap();
        sys::free(b).unwrap();
        sys::free(detour).unwrap();
    }

    #[test]
    fn test_unknown_name_errors() {
        let registry = HookRegistry::new();
        assert!(matches!(
            registry.remove("missing"),
            Err(Error::HookNotFound(_))
        ));
        assert!(matches!(
            registry.toggle("missing"),
            Err(Error::HookNotFound(_))
        ));
    }
}
