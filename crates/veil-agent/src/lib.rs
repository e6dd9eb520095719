//! Veil Agent
//!
//! Injectable library that runs the engine inside a host process and
//! serves the command surface on a loopback socket.
//!
//! # Safety
//! On Windows, `DllMain` returns immediately and defers all work to a
//! worker thread; nothing here runs under the loader lock. Shutdown
//! removes every installed hook before the engine goes away.

pub mod commands;
pub mod config;
pub mod server;

use config::AgentConfig;
use server::AgentServer;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use veil_common::{error, info, init_logging};
use veil_core::MemoryEngine;

static AGENT_RUNNING: AtomicBool = AtomicBool::new(false);

/// Log panics instead of unwinding into the host process.
fn install_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "veil_agent::panic",
            message = %payload,
            location = %location,
            "PANIC in veil-agent"
        );
    }));
}

/// Worker entry point: build the engine, then serve until detach.
fn agent_main() {
    let config = AgentConfig::load_or_default("veil.toml");
    init_logging(&config.log);
    install_panic_handler();
    info!(target: "veil_agent", port = config.port, "agent starting");

    let engine = Arc::new(MemoryEngine::new());

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(target: "veil_agent", error = %e, "failed to create runtime");
            return;
        }
    };

    let server = AgentServer::new(Arc::clone(&engine));
    let result = runtime.block_on(server.run(config.port));
    if let Err(e) = result {
        error!(target: "veil_agent", error = %e, "server exited with error");
    }

    engine.shutdown();
    info!(target: "veil_agent", "agent stopped");
}

/// Start the agent on a background thread. Idempotent.
pub fn start() {
    if AGENT_RUNNING.swap(true, Ordering::SeqCst) {
        return;
    }
    std::thread::spawn(agent_main);
}

/// Exported start hook for loaders on non-Windows hosts.
#[no_mangle]
pub extern "C" fn veil_agent_start() {
    start();
}

#[cfg(windows)]
mod dll {
    use super::start;
    use std::ffi::c_void;
    use veil_common::info;
    use windows::Win32::Foundation::HINSTANCE;
    use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

    /// DLL entry point.
    ///
    /// # Safety
    /// Called by the Windows loader; must return quickly and must not
    /// call LoadLibrary.
    #[no_mangle]
    #[allow(non_snake_case)]
    pub unsafe extern "system" fn DllMain(
        _hinst: HINSTANCE,
        reason: u32,
        _reserved: *mut c_void,
    ) -> i32 {
        match reason {
            DLL_PROCESS_ATTACH => {
                start();
                1
            }
            DLL_PROCESS_DETACH => {
                info!(target: "veil_agent", "agent detaching");
                1
            }
            _ => 1,
        }
    }
}
