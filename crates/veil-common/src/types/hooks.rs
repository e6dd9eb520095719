//! Hook types

use serde::{Deserialize, Serialize};

/// Inline hook encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    /// 5-byte `E9 rel32`
    JmpRelative,
    /// 14 bytes on 64-bit (`FF 25` + abs64), 6 bytes on 32-bit (`FF 25` + ptr32)
    JmpAbsolute,
    /// 6-byte `68 imm32; C3`, 32-bit only
    PushRet,
    /// Pick by host bitness: absolute on 64-bit, relative on 32-bit
    Auto,
}

impl HookType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "jmp_relative" | "relative" | "rel" => Some(HookType::JmpRelative),
            "jmp_absolute" | "absolute" | "abs" => Some(HookType::JmpAbsolute),
            "push_ret" | "pushret" => Some(HookType::PushRet),
            "auto" | "" => Some(HookType::Auto),
            _ => None,
        }
    }
}

impl std::fmt::Display for HookType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HookType::JmpRelative => "jmp_relative",
            HookType::JmpAbsolute => "jmp_absolute",
            HookType::PushRet => "push_ret",
            HookType::Auto => "auto",
        };
        write!(f, "{}", name)
    }
}

/// Serializable snapshot of an installed hook, as reported by `hook.list`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookRecord {
    pub name: String,
    pub target: usize,
    pub detour: usize,
    pub trampoline: usize,
    pub original_bytes: Vec<u8>,
    pub prologue_len: usize,
    pub hook_type: HookType,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_type_parse() {
        assert_eq!(HookType::parse("jmp_relative"), Some(HookType::JmpRelative));
        assert_eq!(HookType::parse("jmp_absolute"), Some(HookType::JmpAbsolute));
        assert_eq!(HookType::parse("push_ret"), Some(HookType::PushRet));
        assert_eq!(HookType::parse("auto"), Some(HookType::Auto));
        assert_eq!(HookType::parse(""), Some(HookType::Auto));
        assert_eq!(HookType::parse("iat"), None);
    }

    #[test]
    fn test_hook_type_display_roundtrip() {
        for ty in [
            HookType::JmpRelative,
            HookType::JmpAbsolute,
            HookType::PushRet,
            HookType::Auto,
        ] {
            assert_eq!(HookType::parse(&ty.to_string()), Some(ty));
        }
    }

    #[test]
    fn test_hook_record_serialization() {
        let record = HookRecord {
            name: "t".to_string(),
            target: 0x1000,
            detour: 0x2000,
            trampoline: 0x3000,
            original_bytes: vec![0x55, 0x48, 0x89, 0xE5],
            prologue_len: 4,
            hook_type: HookType::JmpAbsolute,
            active: true,
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("jmp_absolute"));
        let parsed: HookRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.target, 0x1000);
        assert!(parsed.active);
    }
}
