//! Scanner types

use super::memory::TriState;
use serde::{Deserialize, Serialize};

/// Value type tag for typed memory operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Int32,
    Int64,
    Float,
    Double,
    Byte,
    String,
    Bytes,
}

impl ValueType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "int32" | "int" => Some(ValueType::Int32),
            "int64" | "long" => Some(ValueType::Int64),
            "float" => Some(ValueType::Float),
            "double" => Some(ValueType::Double),
            "byte" => Some(ValueType::Byte),
            "string" | "str" => Some(ValueType::String),
            "bytes" | "aob" => Some(ValueType::Bytes),
            _ => None,
        }
    }

    /// Fixed encoding width, `None` for variable-length types
    pub fn size_hint(&self) -> Option<usize> {
        match self {
            ValueType::Int32 | ValueType::Float => Some(4),
            ValueType::Int64 | ValueType::Double => Some(8),
            ValueType::Byte => Some(1),
            ValueType::String | ValueType::Bytes => None,
        }
    }

    /// Whether ordered (increased/decreased) comparisons are defined
    pub fn is_numeric(&self) -> bool {
        !matches!(self, ValueType::String | ValueType::Bytes)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueType::Int32 => "int32",
            ValueType::Int64 => "int64",
            ValueType::Float => "float",
            ValueType::Double => "double",
            ValueType::Byte => "byte",
            ValueType::String => "string",
            ValueType::Bytes => "bytes",
        }
    }
}

/// Follow-up scan filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Exact,
    Unchanged,
    Changed,
    Increased,
    Decreased,
}

impl ScanType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "exact" => Some(ScanType::Exact),
            "unchanged" => Some(ScanType::Unchanged),
            "changed" => Some(ScanType::Changed),
            "increased" => Some(ScanType::Increased),
            "decreased" => Some(ScanType::Decreased),
            _ => None,
        }
    }
}

/// Options controlling a value or pointer scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Inclusive lower bound; 0 means unbounded
    pub start_address: usize,
    /// Exclusive upper bound; 0 means unbounded
    pub end_address: usize,
    /// Scan position stride, minimum 1
    pub alignment: usize,
    pub filter_writable: TriState,
    pub filter_executable: TriState,
    pub filter_copy_on_write: TriState,
    pub case_sensitive: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            start_address: 0,
            end_address: 0,
            alignment: 1,
            filter_writable: TriState::Yes,
            filter_executable: TriState::Any,
            filter_copy_on_write: TriState::Any,
            case_sensitive: true,
        }
    }
}

impl ScanOptions {
    pub fn step(&self) -> usize {
        self.alignment.max(1)
    }
}

/// One scanner hit: the address, its current bytes and (for next scans)
/// the bytes observed by the previous pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub address: usize,
    pub value: Vec<u8>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_value: Vec<u8>,
}

impl ScanResult {
    pub fn new(address: usize, value: Vec<u8>) -> Self {
        Self {
            address,
            value,
            previous_value: Vec::new(),
        }
    }
}
