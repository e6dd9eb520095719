//! Typed value codec
//!
//! Parse, format and compare the tagged value payloads that flow through
//! the scanner and the command surface. All encodings are little-endian;
//! floats use the host's IEEE-754 representation.

use veil_common::{Error, Result, ValueType};

/// Strings read from memory stop at the first NUL, capped at this length.
pub const STRING_READ_LIMIT: usize = 256;

/// Parse a wire literal into its byte encoding.
pub fn value_to_bytes(literal: &str, value_type: ValueType) -> Result<Vec<u8>> {
    match value_type {
        ValueType::Int32 => {
            let v: i32 = literal
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("Invalid int32 value: {}", literal)))?;
            Ok(v.to_le_bytes().to_vec())
        }
        ValueType::Int64 => {
            let v: i64 = literal
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("Invalid int64 value: {}", literal)))?;
            Ok(v.to_le_bytes().to_vec())
        }
        ValueType::Float => {
            let v: f32 = literal
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("Invalid float value: {}", literal)))?;
            Ok(v.to_le_bytes().to_vec())
        }
        ValueType::Double => {
            let v: f64 = literal.parse().map_err(|_| {
                Error::InvalidParameter(format!("Invalid double value: {}", literal))
            })?;
            Ok(v.to_le_bytes().to_vec())
        }
        ValueType::Byte => {
            let v: u8 = literal
                .parse()
                .map_err(|_| Error::InvalidParameter(format!("Invalid byte value: {}", literal)))?;
            Ok(vec![v])
        }
        ValueType::String => Ok(literal.as_bytes().to_vec()),
        ValueType::Bytes => parse_hex_bytes(literal),
    }
}

/// Parse a hex byte string, either whitespace-separated (`"48 8B 05"`) or
/// contiguous (`"488B05"`).
pub fn parse_hex_bytes(literal: &str) -> Result<Vec<u8>> {
    let trimmed = literal.trim();
    if !trimmed.contains(char::is_whitespace) && trimmed.len() > 2 {
        return hex::decode(trimmed)
            .map_err(|e| Error::InvalidParameter(format!("Invalid hex string: {}", e)));
    }

    let mut bytes = Vec::new();
    for part in trimmed.split_whitespace() {
        let byte = u8::from_str_radix(part, 16)
            .map_err(|_| Error::InvalidParameter(format!("Invalid hex byte: {}", part)))?;
        bytes.push(byte);
    }
    if bytes.is_empty() {
        return Err(Error::InvalidParameter("Empty byte string".into()));
    }
    Ok(bytes)
}

/// Render a byte payload for the UI per its type tag.
pub fn bytes_to_display(bytes: &[u8], value_type: ValueType) -> String {
    match value_type {
        ValueType::Int32 if bytes.len() >= 4 => {
            i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).to_string()
        }
        ValueType::Int64 if bytes.len() >= 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            i64::from_le_bytes(buf).to_string()
        }
        ValueType::Float if bytes.len() >= 4 => {
            f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]).to_string()
        }
        ValueType::Double if bytes.len() >= 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            f64::from_le_bytes(buf).to_string()
        }
        ValueType::Byte if !bytes.is_empty() => bytes[0].to_string(),
        ValueType::String => String::from_utf8_lossy(bytes).to_string(),
        _ => to_hex_string(bytes),
    }
}

/// Uppercase space-separated hex, the canonical `bytes` rendering.
pub fn to_hex_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Ordered comparison of two encoded values: 1 if `a > b`, -1 if `a < b`,
/// 0 otherwise. Floats use raw IEEE ordering, so a NaN operand compares as
/// neither greater nor less.
pub fn compare_values(a: &[u8], b: &[u8], value_type: ValueType) -> i32 {
    fn ord<T: PartialOrd>(a: T, b: T) -> i32 {
        if a > b {
            1
        } else if a < b {
            -1
        } else {
            0
        }
    }

    match value_type {
        ValueType::Int32 => {
            if a.len() < 4 || b.len() < 4 {
                return 0;
            }
            ord(
                i32::from_le_bytes([a[0], a[1], a[2], a[3]]),
                i32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            )
        }
        ValueType::Int64 => {
            if a.len() < 8 || b.len() < 8 {
                return 0;
            }
            let mut pa = [0u8; 8];
            let mut pb = [0u8; 8];
            pa.copy_from_slice(&a[..8]);
            pb.copy_from_slice(&b[..8]);
            ord(i64::from_le_bytes(pa), i64::from_le_bytes(pb))
        }
        ValueType::Float => {
            if a.len() < 4 || b.len() < 4 {
                return 0;
            }
            ord(
                f32::from_le_bytes([a[0], a[1], a[2], a[3]]),
                f32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            )
        }
        ValueType::Double => {
            if a.len() < 8 || b.len() < 8 {
                return 0;
            }
            let mut pa = [0u8; 8];
            let mut pb = [0u8; 8];
            pa.copy_from_slice(&a[..8]);
            pb.copy_from_slice(&b[..8]);
            ord(f64::from_le_bytes(pa), f64::from_le_bytes(pb))
        }
        ValueType::Byte => {
            if a.is_empty() || b.is_empty() {
                return 0;
            }
            ord(a[0], b[0])
        }
        // Lexicographic fallback; the scanner rejects ordered comparisons
        // for these tags before getting here.
        ValueType::String | ValueType::Bytes => ord(a, b),
    }
}
