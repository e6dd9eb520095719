//! Value scanner
//!
//! First scans seed a result set from a typed literal over the filtered
//! regions; next scans re-read the seeded addresses and keep the entries
//! whose change matches the requested predicate. Regions are read in one
//! block each and fan out across the rayon pool.

use crate::access;
use crate::value::{self, compare_values};
use rayon::prelude::*;
use tracing::{debug, info};
use veil_common::{
    Error, MemoryRegion, Result, ScanOptions, ScanResult, ScanType, ValueType,
};

/// Region filter: readable, plus the three tri-state protection filters.
pub fn region_scannable(region: &MemoryRegion, options: &ScanOptions) -> bool {
    region.protection.read
        && options.filter_writable.accepts(region.protection.write)
        && options.filter_executable.accepts(region.protection.execute)
        && options
            .filter_copy_on_write
            .accepts(region.protection.copy_on_write)
}

/// Clamp a region against the scan bounds; `None` when nothing remains.
fn clamp(region: &MemoryRegion, options: &ScanOptions) -> Option<(usize, usize)> {
    let start = region.base.max(options.start_address);
    let end = if options.end_address == 0 {
        region.end()
    } else {
        region.end().min(options.end_address)
    };
    (start < end).then_some((start, end))
}

fn window_matches(window: &[u8], needle: &[u8], case_sensitive: bool) -> bool {
    if case_sensitive {
        window == needle
    } else {
        window.eq_ignore_ascii_case(needle)
    }
}

/// Scan the given regions for an exact byte needle. The stored value is the
/// bytes actually observed at the match, which differ from the needle only
/// for case-insensitive string scans.
pub fn scan_for_bytes(
    regions: &[MemoryRegion],
    needle: &[u8],
    options: &ScanOptions,
    case_sensitive: bool,
) -> Vec<ScanResult> {
    if needle.is_empty() {
        return Vec::new();
    }
    let step = options.step();

    regions
        .par_iter()
        .filter(|region| region_scannable(region, options))
        .flat_map(|region| {
            let Some((start, end)) = clamp(region, options) else {
                return Vec::new();
            };
            let data = access::read_bytes(start, end - start);
            if data.len() < needle.len() {
                return Vec::new();
            }

            let mut hits = Vec::new();
            let mut i = 0;
            while i + needle.len() <= data.len() {
                let window = &data[i..i + needle.len()];
                if window_matches(window, needle, case_sensitive) {
                    hits.push(ScanResult::new(start + i, window.to_vec()));
                }
                i += step;
            }
            hits
        })
        .collect()
}

/// First scan: parse the literal per its type tag and collect every match.
pub fn first_scan(
    regions: &[MemoryRegion],
    literal: &str,
    value_type: ValueType,
    options: &ScanOptions,
) -> Result<Vec<ScanResult>> {
    let needle = value::value_to_bytes(literal, value_type)?;
    if needle.is_empty() {
        return Err(Error::InvalidParameter("Empty scan value".into()));
    }

    let case_sensitive = value_type != ValueType::String || options.case_sensitive;
    let results = scan_for_bytes(regions, &needle, options, case_sensitive);
    info!(target: "veil_core::scanner",
        value = literal,
        value_type = value_type.name(),
        results = results.len(),
        "first scan complete");
    Ok(results)
}

/// Next scan: re-read each previous address and keep the survivors that
/// match the predicate. Addresses that became unreadable are dropped
/// silently; the surviving set is the result.
pub fn next_scan(
    scan_type: ScanType,
    literal: Option<&str>,
    previous: &[ScanResult],
    value_type: ValueType,
) -> Result<Vec<ScanResult>> {
    if matches!(scan_type, ScanType::Increased | ScanType::Decreased) && !value_type.is_numeric() {
        return Err(Error::InvalidParameter(format!(
            "{} values do not support ordered comparisons",
            value_type.name()
        )));
    }

    let target = match scan_type {
        ScanType::Exact => {
            let literal = literal
                .ok_or_else(|| Error::InvalidParameter("Missing value for exact scan".into()))?;
            Some(value::value_to_bytes(literal, value_type)?)
        }
        _ => None,
    };

    let mut results = Vec::new();
    for prev in previous {
        let size = prev.value.len();
        if size == 0 {
            continue;
        }
        let current = access::read_bytes(prev.address, size);
        if current.len() != size {
            continue;
        }

        let include = match scan_type {
            ScanType::Exact => target.as_deref() == Some(current.as_slice()),
            ScanType::Unchanged => current == prev.value,
            ScanType::Changed => current != prev.value,
            ScanType::Increased => compare_values(&current, &prev.value, value_type) > 0,
            ScanType::Decreased => compare_values(&current, &prev.value, value_type) < 0,
        };

        if include {
            results.push(ScanResult {
                address: prev.address,
                value: current,
                previous_value: prev.value.clone(),
            });
        }
    }

    debug!(target: "veil_core::scanner",
        scan_type = ?scan_type,
        previous = previous.len(),
        surviving = results.len(),
        "next scan complete");
    Ok(results)
}
