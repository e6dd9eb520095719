//! Agent configuration
//!
//! An optional `veil.toml` in the host's working directory overrides the
//! listener port and logging. Absence of the file is the normal case.

use serde::{Deserialize, Serialize};
use std::path::Path;
use veil_common::LogConfig;

pub const DEFAULT_PORT: u16 = 17771;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub log: LogConfig,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log: LogConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Read the config file, falling back to defaults when it is missing
    /// or malformed. A bad config must never keep the agent from coming
    /// up inside the host.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port() {
        assert_eq!(AgentConfig::default().port, DEFAULT_PORT);
    }

    #[test]
    fn test_missing_file_yields_default() {
        let config = AgentConfig::load_or_default("/nonexistent/veil.toml");
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_port_override() {
        let config: AgentConfig = toml::from_str("port = 4242\n").unwrap();
        assert_eq!(config.port, 4242);
    }

    #[test]
    fn test_parse_with_log_section() {
        let text = "port = 9000\n\n[log]\nlevel = \"debug\"\nfile_enabled = false\n";
        let config: AgentConfig = toml::from_str(text).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.log.level, "debug");
        assert!(!config.log.file_enabled);
    }
}
