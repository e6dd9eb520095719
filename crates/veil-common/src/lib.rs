//! Veil Common Types
//!
//! Shared types, the error type and the logging bootstrap used by the
//! engine crate and the injectable agent.

pub mod error;
pub mod logging;
pub mod types;

pub use error::{Error, Result};
pub use logging::{init_agent_logging, init_logging, LogConfig};
pub use types::*;

// Re-export tracing macros for convenience
pub use tracing::{debug, error, info, trace, warn};
