//! Logging bootstrap for Veil
//!
//! The agent runs inside a foreign process, so the default configuration
//! writes to a per-process log file and leaves the host's console alone.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration matching the optional `veil.toml` structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable console (stderr) logging
    #[serde(default)]
    pub console_enabled: bool,

    /// Enable file logging
    #[serde(default = "default_true")]
    pub file_enabled: bool,

    /// Log file path; empty selects `veil-agent-{pid}.log` in the cwd
    #[serde(default)]
    pub file_path: String,

    /// Include module target
    #[serde(default = "default_true")]
    pub show_target: bool,

    /// Use ANSI colors (console only)
    #[serde(default)]
    pub ansi_colors: bool,

    /// Log level as string
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: false,
            file_enabled: true,
            file_path: String::new(),
            show_target: true,
            ansi_colors: false,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Console-only configuration, useful for tests and host tooling
    pub fn console() -> Self {
        Self {
            console_enabled: true,
            file_enabled: false,
            ansi_colors: true,
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    fn resolved_file_path(&self) -> PathBuf {
        if self.file_path.is_empty() {
            let mut path = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            path.push(format!("veil-agent-{}.log", std::process::id()));
            path
        } else {
            PathBuf::from(&self.file_path)
        }
    }
}

/// Initialize logging with the given configuration.
///
/// Can be called more than once; only the first call installs the
/// subscriber.
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    if config.file_enabled {
        let path = config.resolved_file_path();
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_target(config.show_target)
                .with_writer(std::sync::Mutex::new(file))
                .finish();
            let _ = tracing::subscriber::set_global_default(subscriber);
            return;
        }
        // Fall through to console if the file cannot be opened.
    }

    let _ = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(config.ansi_colors)
        .with_target(config.show_target)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Initialize logging for the injected agent.
///
/// File log beside the host's working directory, no console output; the
/// host process owns stdout/stderr.
pub fn init_agent_logging() {
    init_logging(&LogConfig::default());
}
