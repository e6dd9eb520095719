//! AOB pattern scanning
//!
//! Patterns arrive as space-separated hex bytes with `?`/`??` wildcards and
//! are compiled into a byte vector plus an equal-length mask (`b'x'` match,
//! `b'?'` wildcard). Matching slides a window at stride 1 over every
//! readable region in the requested range.

use crate::access;
use rayon::prelude::*;
use tracing::info;
use veil_common::{Error, MemoryRegion, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    pub bytes: Vec<u8>,
    pub mask: Vec<u8>,
}

impl Pattern {
    /// Parse an AOB string such as `"48 8B ?? 05 ? E8"`.
    pub fn parse(text: &str) -> Result<Self> {
        let mut bytes = Vec::new();
        let mut mask = Vec::new();

        for atom in text.split_whitespace() {
            if atom == "?" || atom == "??" {
                bytes.push(0);
                mask.push(b'?');
            } else {
                let byte = u8::from_str_radix(atom, 16).map_err(|_| {
                    Error::InvalidParameter(format!("Invalid pattern atom: {}", atom))
                })?;
                bytes.push(byte);
                mask.push(b'x');
            }
        }

        if bytes.is_empty() {
            return Err(Error::InvalidParameter("Empty pattern".into()));
        }
        Ok(Self { bytes, mask })
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn matches(&self, window: &[u8]) -> bool {
        if window.len() < self.len() {
            return false;
        }
        self.mask
            .iter()
            .zip(self.bytes.iter())
            .zip(window.iter())
            .all(|((&m, &p), &b)| m != b'x' || p == b)
    }
}

/// Find every occurrence of `pattern` within `[start, end)`, walking the
/// readable regions that intersect the range. Results are ordered by
/// address.
pub fn scan_all(
    regions: &[MemoryRegion],
    pattern: &Pattern,
    start: usize,
    end: usize,
) -> Vec<usize> {
    let hits: Vec<usize> = regions
        .par_iter()
        .filter(|region| region.protection.read)
        .flat_map(|region| {
            let lo = region.base.max(start);
            let hi = region.end().min(end);
            if lo >= hi {
                return Vec::new();
            }
            let data = access::read_bytes(lo, hi - lo);
            if data.len() < pattern.len() {
                return Vec::new();
            }

            let mut found = Vec::new();
            for i in 0..=data.len() - pattern.len() {
                if pattern.matches(&data[i..i + pattern.len()]) {
                    found.push(lo + i);
                }
            }
            found
        })
        .collect();

    info!(target: "veil_core::pattern",
        pattern_len = pattern.len(),
        matches = hits.len(),
        "pattern scan complete");
    hits
}

pub fn scan_first(
    regions: &[MemoryRegion],
    pattern: &Pattern,
    start: usize,
    end: usize,
) -> Option<usize> {
    scan_all(regions, pattern, start, end).into_iter().next()
}
