//! Module-related types

use serde::{Deserialize, Serialize};

/// Loaded image information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub path: String,
    pub base: usize,
    pub size: usize,
}

impl Module {
    pub fn end(&self) -> usize {
        self.base.saturating_add(self.size)
    }

    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_contains() {
        let module = Module {
            name: "host.exe".to_string(),
            path: "C:\\host.exe".to_string(),
            base: 0x140000000,
            size: 0x10000,
        };
        assert!(module.contains(0x140000000));
        assert!(module.contains(0x14000FFFF));
        assert!(!module.contains(0x140010000));
        assert!(!module.contains(0x13FFFFFFF));
    }

    #[test]
    fn test_module_serialization() {
        let module = Module {
            name: "libm.so".to_string(),
            path: "/usr/lib/libm.so".to_string(),
            base: 0x7F0000000000,
            size: 0x2000,
        };
        let json = serde_json::to_string(&module).unwrap();
        let parsed: Module = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.name, "libm.so");
        assert_eq!(parsed.end(), 0x7F0000002000);
    }
}
