//! Command surface
//!
//! Fixed method table invoked by the transport. Every handler takes the
//! shared engine plus the request's loose JSON parameters and produces a
//! data payload; errors become the failure envelope. A panic anywhere in a
//! handler is caught at the dispatch boundary.

use serde_json::{json, Value};
use tracing::{debug, warn};
use veil_core::disasm;
use veil_core::engine::ProcessInfo;
use veil_core::value::{bytes_to_display, parse_hex_bytes, value_to_bytes};
use veil_core::{access, sys, MemoryEngine, Pattern};
use veil_common::{
    Error, HookType, Request, Response, Result, ScanOptions, ScanResult, ScanType, TriState,
    ValueType,
};

/// Cap applied to pattern and pointer result listings.
const RESULT_CAP: usize = 100;

/// Dispatch one request. Never panics into the caller; never leaks an
/// error except through the response envelope.
pub fn dispatch(engine: &MemoryEngine, request: &Request) -> Response {
    let id = request.id.clone();
    debug!(target: "veil_agent::commands", command = %request.command, "dispatching");

    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        dispatch_inner(engine, request)
    }));

    match outcome {
        Ok(Ok(data)) => Response::ok(id, data),
        Ok(Err(e)) => Response::fail(id, e.to_string()),
        Err(_) => {
            warn!(target: "veil_agent::commands", command = %request.command, "handler panicked");
            Response::fail(id, "Internal error while handling command")
        }
    }
}

fn dispatch_inner(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    match request.command.as_str() {
        "memory.read" => memory_read(request),
        "memory.write" => memory_write(request),
        "memory.read_value" => memory_read_value(request),
        "memory.scan" => memory_scan(engine, request),
        "memory.regions" => memory_regions(engine, request),
        "memory.validate" => memory_validate(engine, request),
        "memory.allocate" => memory_allocate(engine, request),
        "memory.free" => memory_free(engine, request),
        "memory.patch" => memory_patch(engine, request),
        "memory.nop" => memory_nop(engine, request),
        "memory.disassemble" => memory_disassemble(request),
        "pattern.scan" => pattern_scan(engine, request, true),
        "pattern.scanall" => pattern_scan(engine, request, false),
        "pointer.chain" => pointer_chain(engine, request),
        "pointer.find" => pointer_find(engine, request),
        "module.list" => module_list(engine),
        "module.info" => module_info(engine, request),
        "module.from_address" => module_from_address(engine, request),
        "process.info" => process_info(engine),
        "hook.install" => hook_install(engine, request),
        "hook.remove" => hook_remove(engine, request),
        "hook.list" => hook_list(engine),
        "hook.toggle" => hook_toggle(engine, request),
        other => Err(Error::InvalidParameter(format!("Unknown command: {}", other))),
    }
}

// ----------------------------------------------------------------------
// Parameter parsing
// ----------------------------------------------------------------------

/// Addresses arrive as hex strings (`0x` prefixed or bare) or as JSON
/// numbers.
fn parse_address(value: &Value) -> Result<usize> {
    if let Some(n) = value.as_u64() {
        return Ok(n as usize);
    }
    if let Some(s) = value.as_str() {
        return parse_address_str(s);
    }
    Err(Error::InvalidParameter(format!(
        "Invalid address: {}",
        value
    )))
}

fn parse_address_str(s: &str) -> Result<usize> {
    let trimmed = s.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    usize::from_str_radix(digits, 16)
        .map_err(|_| Error::InvalidParameter(format!("Invalid address: {}", s)))
}

/// Sizes and counts are decimal strings or JSON numbers.
fn parse_size(value: &Value) -> Result<usize> {
    if let Some(n) = value.as_u64() {
        return Ok(n as usize);
    }
    if let Some(s) = value.as_str() {
        return s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidParameter(format!("Invalid size: {}", s)));
    }
    Err(Error::InvalidParameter(format!("Invalid size: {}", value)))
}

fn require<'a>(request: &'a Request, key: &str) -> Result<&'a Value> {
    request
        .param(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| Error::InvalidParameter(format!("Missing {} parameter", key)))
}

fn require_str<'a>(request: &'a Request, key: &str) -> Result<&'a str> {
    require(request, key)?
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidParameter(format!("Missing {} parameter", key)))
}

fn optional_str<'a>(request: &'a Request, key: &str) -> Option<&'a str> {
    request
        .param(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
}

fn optional_address(request: &Request, key: &str) -> Result<usize> {
    match request.param(key) {
        Some(value) if !value.is_null() => parse_address(value),
        _ => Ok(0),
    }
}

fn flag(request: &Request, key: &str) -> bool {
    match request.param(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn parse_value_type(request: &Request, key: &str) -> Result<ValueType> {
    let tag = require_str(request, key)?;
    ValueType::parse(tag).ok_or_else(|| Error::InvalidParameter(format!("Unknown type: {}", tag)))
}

fn hex_addr(address: usize) -> String {
    format!("{:#x}", address)
}

// ----------------------------------------------------------------------
// memory.*
// ----------------------------------------------------------------------

fn memory_read(request: &Request) -> Result<Value> {
    let address = parse_address(require(request, "address")?)?;
    let size = parse_size(require(request, "size")?)?;

    if !access::is_valid(address, size) {
        return Err(Error::InvalidAddress(address));
    }
    if !access::is_readable(address, size) {
        return Err(Error::MemoryAccess {
            address,
            message: "address is not readable".into(),
        });
    }

    match optional_str(request, "type") {
        None | Some("bytes") => {
            let bytes = access::read_bytes(address, size);
            if bytes.is_empty() {
                return Err(Error::MemoryAccess {
                    address,
                    message: "read failed".into(),
                });
            }
            Ok(json!(bytes))
        }
        Some(tag) => {
            let value_type = ValueType::parse(tag)
                .ok_or_else(|| Error::InvalidParameter(format!("Unknown type: {}", tag)))?;
            let bytes = access::read_value(address, value_type).ok_or(Error::MemoryAccess {
                address,
                message: "typed read failed".into(),
            })?;
            Ok(json!(bytes_to_display(&bytes, value_type)))
        }
    }
}

fn memory_write(request: &Request) -> Result<Value> {
    let address = parse_address(require(request, "address")?)?;
    let literal = require_str(request, "value")?;
    let value_type = parse_value_type(request, "type")?;

    let bytes = value_to_bytes(literal, value_type)?;
    if !access::write_bytes(address, &bytes) {
        return Err(Error::MemoryAccess {
            address,
            message: "write failed, address may not be writable".into(),
        });
    }
    Ok(json!({}))
}

fn memory_read_value(request: &Request) -> Result<Value> {
    let address = parse_address(require(request, "address")?)?;
    let value_type = parse_value_type(request, "type")?;

    let bytes = access::read_value(address, value_type).ok_or(Error::MemoryAccess {
        address,
        message: "value is not readable".into(),
    })?;
    Ok(json!(bytes_to_display(&bytes, value_type)))
}

fn scan_options_from(request: &Request) -> Result<ScanOptions> {
    let tri = |key: &str| {
        optional_str(request, key)
            .map(TriState::parse)
            .unwrap_or(TriState::Any)
    };

    let alignment = match request.param("alignment") {
        Some(value) if !value.is_null() => parse_size(value)?.max(1),
        _ => 1,
    };

    Ok(ScanOptions {
        start_address: optional_address(request, "startAddress")?,
        end_address: optional_address(request, "endAddress")?,
        alignment,
        filter_writable: tri("writable"),
        filter_executable: tri("executable"),
        filter_copy_on_write: tri("copyOnWrite"),
        case_sensitive: !request
            .param("caseSensitive")
            .map(|v| v == &Value::Bool(false) || v.as_str() == Some("false"))
            .unwrap_or(false),
    })
}

fn parse_previous_results(request: &Request, value_type: ValueType) -> Result<Vec<ScanResult>> {
    let list = require(request, "previousResults")?
        .as_array()
        .ok_or_else(|| Error::InvalidParameter("previousResults must be an array".into()))?;

    let mut previous = Vec::with_capacity(list.len());
    for item in list {
        let address = match item.get("address") {
            Some(value) => parse_address(value)?,
            None => continue,
        };
        let literal = item.get("value").and_then(|v| v.as_str()).unwrap_or("");
        let value = value_to_bytes(literal, value_type)?;
        previous.push(ScanResult::new(address, value));
    }
    Ok(previous)
}

fn render_scan_results(engine: &MemoryEngine, results: &[ScanResult], value_type: ValueType) -> Value {
    let rendered: Vec<Value> = results
        .iter()
        .map(|result| {
            let mut entry = json!({
                "address": hex_addr(result.address),
                "value": bytes_to_display(&result.value, value_type),
            });
            if !result.previous_value.is_empty() {
                entry["previousValue"] =
                    json!(bytes_to_display(&result.previous_value, value_type));
            }
            if let Some(module) = engine.module_info_for_address(result.address) {
                entry["module"] = json!(module);
            }
            entry
        })
        .collect();
    Value::Array(rendered)
}

fn memory_scan(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let value_type = parse_value_type(request, "valueType")?;
    let first_scan = flag(request, "firstScan");

    let results = if first_scan {
        let literal = require_str(request, "value")?;
        let options = scan_options_from(request)?;
        engine.first_scan(literal, value_type, &options)?
    } else {
        let scan_type_str = require_str(request, "scanType")?;
        let scan_type = ScanType::parse(scan_type_str).ok_or_else(|| {
            Error::InvalidParameter(format!("Unknown scanType: {}", scan_type_str))
        })?;
        let previous = parse_previous_results(request, value_type)?;
        let literal = optional_str(request, "value");
        engine.next_scan(scan_type, literal, &previous, value_type)?
    };

    Ok(render_scan_results(engine, &results, value_type))
}

fn memory_regions(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let filter = optional_str(request, "filter");
    let snapshot = engine.region_snapshot();

    let regions: Vec<Value> = snapshot
        .iter()
        .filter(|region| match filter {
            Some("readable") => region.protection.read,
            Some("writable") => region.protection.write,
            Some("executable") => region.protection.execute,
            Some(_) | None => true,
        })
        .map(|region| {
            json!({
                "baseAddress": hex_addr(region.base),
                "size": region.size,
                "protection": region.raw_protection,
                "readable": region.protection.read,
                "writable": region.protection.write,
                "executable": region.protection.execute,
                "copyOnWrite": region.protection.copy_on_write,
                "moduleName": region.module_name.clone().unwrap_or_default(),
            })
        })
        .collect();

    Ok(Value::Array(regions))
}

fn memory_validate(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let address = parse_address(require(request, "address")?)?;
    let size = match request.param("size") {
        Some(value) if !value.is_null() => parse_size(value)?,
        _ => 1,
    };

    let mut data = json!({
        "valid": access::is_valid(address, size),
        "readable": access::is_readable(address, size),
        "writable": access::is_writable(address, size),
    });

    if let Some(region) = engine.query_region(address) {
        data["region"] = json!({
            "baseAddress": hex_addr(region.base),
            "size": region.size,
            "protection": region.raw_protection,
            "moduleName": region.module_name.unwrap_or_default(),
        });
    }

    Ok(data)
}

fn memory_allocate(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let size = parse_size(require(request, "size")?)?;
    let protection = match optional_str(request, "protection") {
        Some(s) => u32::from_str_radix(s.trim_start_matches("0x"), 16)
            .map_err(|_| Error::InvalidParameter(format!("Invalid protection: {}", s)))?,
        None => sys::PROTECTION_RWX,
    };

    let address = engine.allocate(size, protection)?;
    Ok(json!(hex_addr(address)))
}

fn memory_free(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let address = parse_address(require(request, "address")?)?;
    engine.free(address)?;
    Ok(json!({}))
}

fn memory_patch(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let address = parse_address(require(request, "address")?)?;
    let original = parse_hex_bytes(require_str(request, "original")?)?;
    let replacement = parse_hex_bytes(require_str(request, "new")?)?;
    engine.patch_bytes(address, &original, &replacement)?;
    Ok(json!({}))
}

fn memory_nop(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let address = parse_address(require(request, "address")?)?;
    let size = parse_size(require(request, "size")?)?;
    engine.nop(address, size)?;
    Ok(json!({}))
}

fn memory_disassemble(request: &Request) -> Result<Value> {
    let address = parse_address(require(request, "address")?)?;
    let size = parse_size(require(request, "size")?)?;

    if !access::is_readable(address, size) {
        return Err(Error::MemoryAccess {
            address,
            message: "address is not readable".into(),
        });
    }
    let bytes = access::read_bytes(address, size);
    if bytes.is_empty() {
        return Err(Error::MemoryAccess {
            address,
            message: "read for disassembly failed".into(),
        });
    }

    let listing = disasm::disassemble(&bytes, address, sys::pointer_width());
    let rendered: Vec<Value> = listing
        .iter()
        .map(|insn| {
            let mut entry = json!({
                "address": hex_addr(insn.address),
                "bytes": insn
                    .bytes
                    .iter()
                    .map(|b| format!("{:02X}", b))
                    .collect::<Vec<_>>()
                    .join(" "),
                "mnemonic": insn.mnemonic,
                "operands": insn.operands,
                "length": insn.length,
                "isJump": insn.is_jump,
                "isCall": insn.is_call,
                "isRet": insn.is_ret,
            });
            if let Some(target) = insn.target {
                entry["target"] = json!(hex_addr(target));
            }
            entry
        })
        .collect();

    Ok(Value::Array(rendered))
}

// ----------------------------------------------------------------------
// pattern.* / pointer.*
// ----------------------------------------------------------------------

fn pattern_scan(engine: &MemoryEngine, request: &Request, first_only: bool) -> Result<Value> {
    let pattern = Pattern::parse(require_str(request, "pattern")?)?;
    let start = optional_address(request, "start")?;
    let end = optional_address(request, "end")?;

    if first_only {
        match engine.pattern_scan_first(&pattern, start, end) {
            Some(address) => Ok(json!(hex_addr(address))),
            None => Err(Error::InvalidParameter("Pattern not found".into())),
        }
    } else {
        let matches = engine.pattern_scan_all(&pattern, start, end);
        let capped: Vec<String> = matches.iter().take(RESULT_CAP).map(|&a| hex_addr(a)).collect();
        Ok(json!(capped))
    }
}

fn pointer_chain(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let base = parse_address(require(request, "base")?)?;
    let offsets = parse_offsets(require(request, "offsets")?)?;
    let address = engine.follow_pointer_chain(base, &offsets)?;
    Ok(json!(hex_addr(address)))
}

/// Offsets come as a JSON array of hex strings or as one bracketed
/// `"[0x10, 0x20]"` string.
fn parse_offsets(value: &Value) -> Result<Vec<usize>> {
    if let Some(list) = value.as_array() {
        return list.iter().map(parse_address).collect();
    }
    if let Some(text) = value.as_str() {
        let inner = text.trim().trim_start_matches('[').trim_end_matches(']');
        return inner
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(parse_address_str)
            .collect();
    }
    Err(Error::InvalidParameter("Invalid offsets parameter".into()))
}

fn pointer_find(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let target = parse_address(require(request, "target")?)?;
    // Pointers live in writable memory; the default filter keeps it that way.
    let options = ScanOptions {
        start_address: optional_address(request, "start")?,
        end_address: optional_address(request, "end")?,
        ..Default::default()
    };

    let pointers = engine.find_pointers_to(target, &options);
    let capped: Vec<String> = pointers
        .iter()
        .take(RESULT_CAP)
        .map(|r| hex_addr(r.address))
        .collect();
    Ok(json!(capped))
}

// ----------------------------------------------------------------------
// module.* / process.*
// ----------------------------------------------------------------------

fn module_list(engine: &MemoryEngine) -> Result<Value> {
    let modules: Vec<Value> = engine
        .modules()
        .iter()
        .map(|module| {
            json!({
                "name": module.name,
                "path": module.path,
                "base": hex_addr(module.base),
                "size": module.size,
            })
        })
        .collect();
    Ok(Value::Array(modules))
}

fn module_info(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let name = require_str(request, "name")?;
    let module = engine
        .module_by_name(name)
        .ok_or_else(|| Error::ModuleNotFound(name.to_string()))?;

    Ok(json!({
        "name": module.name,
        "baseAddress": hex_addr(module.base),
        "size": module.size,
        "endAddress": hex_addr(module.end()),
        "path": module.path,
    }))
}

fn module_from_address(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let address = parse_address(require(request, "address")?)?;
    let module = engine
        .modules()
        .iter()
        .find(|m| m.contains(address))
        .cloned()
        .ok_or_else(|| {
            Error::InvalidParameter("Address not found in any loaded module".into())
        })?;

    let offset = address - module.base;
    Ok(json!({
        "moduleName": module.name,
        "baseAddress": hex_addr(module.base),
        "offset": hex_addr(offset),
        "displayName": format!("{}+{:#x}", module.name, offset),
    }))
}

fn process_info(engine: &MemoryEngine) -> Result<Value> {
    let ProcessInfo {
        pid,
        name,
        pointer_width,
        main_module,
        total_bytes,
        writable_bytes,
        executable_bytes,
    } = engine.process_info();

    let main = main_module
        .map(|m| json!({"baseAddress": hex_addr(m.base), "size": m.size}))
        .unwrap_or(Value::Null);

    Ok(json!({
        "pid": pid,
        "name": name,
        "platform": if pointer_width == 64 { "x64" } else { "x86" },
        "addressWidth": pointer_width,
        "mainModule": main,
        "memoryMetrics": {
            "total": total_bytes,
            "writable": writable_bytes,
            "executable": executable_bytes,
        },
    }))
}

// ----------------------------------------------------------------------
// hook.*
// ----------------------------------------------------------------------

fn hook_install(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let name = require_str(request, "name")?;
    let target = parse_address(require(request, "target")?)?;
    let detour = parse_address(require(request, "detour")?)?;
    let hook_type = match optional_str(request, "type") {
        Some(tag) => HookType::parse(tag)
            .ok_or_else(|| Error::InvalidParameter(format!("Unknown hook type: {}", tag)))?,
        None => HookType::Auto,
    };

    let record = engine.install_hook(name, target, detour, hook_type)?;
    Ok(json!({
        "name": record.name,
        "trampoline": hex_addr(record.trampoline),
        "prologueLength": record.prologue_len,
        "hookType": record.hook_type.to_string(),
    }))
}

fn hook_remove(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let name = require_str(request, "name")?;
    engine.remove_hook(name)?;
    Ok(json!({}))
}

fn hook_list(engine: &MemoryEngine) -> Result<Value> {
    let hooks: Vec<Value> = engine
        .list_hooks()
        .iter()
        .map(|hook| {
            json!({
                "name": hook.name,
                "target": hex_addr(hook.target),
                "detour": hex_addr(hook.detour),
                "trampoline": hex_addr(hook.trampoline),
                "active": hook.active,
                "type": hook.hook_type.to_string(),
            })
        })
        .collect();
    Ok(Value::Array(hooks))
}

fn hook_toggle(engine: &MemoryEngine, request: &Request) -> Result<Value> {
    let name = require_str(request, "name")?;
    let active = engine.toggle_hook(name)?;
    Ok(json!({"active": active}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address_forms() {
        assert_eq!(parse_address(&json!("0x1000")).unwrap(), 0x1000);
        assert_eq!(parse_address(&json!("1000")).unwrap(), 0x1000);
        assert_eq!(parse_address(&json!(4096)).unwrap(), 4096);
        assert!(parse_address(&json!("zz")).is_err());
        assert!(parse_address(&json!(null)).is_err());
    }

    #[test]
    fn test_parse_size_is_decimal() {
        assert_eq!(parse_size(&json!("100")).unwrap(), 100);
        assert_eq!(parse_size(&json!(64)).unwrap(), 64);
        assert!(parse_size(&json!("0x10")).is_err());
    }

    #[test]
    fn test_parse_offsets_bracketed_string() {
        let offsets = parse_offsets(&json!("[0x10, 0x20, 30]")).unwrap();
        assert_eq!(offsets, vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn test_parse_offsets_array() {
        let offsets = parse_offsets(&json!(["0x8", "0x10"])).unwrap();
        assert_eq!(offsets, vec![0x8, 0x10]);
    }

    #[test]
    fn test_unknown_command_fails_cleanly() {
        let engine = MemoryEngine::new();
        let response = dispatch(&engine, &Request::new("memory.explode"));
        assert!(!response.success);
        assert!(response.error.unwrap().contains("Unknown command"));
    }

    #[test]
    fn test_id_echoed_back() {
        let engine = MemoryEngine::new();
        let mut request = Request::new("process.info");
        request.id = Some("42".to_string());
        let response = dispatch(&engine, &request);
        assert!(response.success);
        assert_eq!(response.id.as_deref(), Some("42"));
    }
}
