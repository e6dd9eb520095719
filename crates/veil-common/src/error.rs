//! Error types for Veil

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Memory access error at {address:#x}: {message}")]
    MemoryAccess { address: usize, message: String },

    #[error("Invalid address: {0:#x}")]
    InvalidAddress(usize),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Instruction decode failed: {0}")]
    Decode(String),

    #[error("Hook conflict: {0}")]
    HookConflict(String),

    #[error("Hook not found: {0}")]
    HookNotFound(String),

    #[error("Allocation failed: {0}")]
    Allocation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_access_error_display() {
        let err = Error::MemoryAccess {
            address: 0x140001000,
            message: "region not readable".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("0x140001000"));
        assert!(msg.contains("region not readable"));
    }

    #[test]
    fn test_invalid_address_error_display() {
        let err = Error::InvalidAddress(0xDEADBEEF);
        let msg = format!("{}", err);
        assert!(msg.contains("0xdeadbeef"));
    }

    #[test]
    fn test_hook_conflict_error_display() {
        let err = Error::HookConflict("address 0x1000 already hooked".to_string());
        assert!(format!("{}", err).contains("already hooked"));
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }
}
