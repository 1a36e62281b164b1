//! Sky Harness Common Library
//!
//! Shared types, the newline-delimited JSON harness protocol, and an async
//! client used by drivers and engines to talk to the harness daemon.

pub mod client;
pub mod error;
pub mod protocol;
pub mod types;

// Re-export commonly used types
pub use client::HarnessClient;
pub use error::{Error, Result};
pub use types::*;

/// Sky Harness version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default runtime directory
///
/// Prefers `$XDG_RUNTIME_DIR`, falling back to `~/.sky-harness`.
pub fn default_runtime_dir() -> std::path::PathBuf {
    if let Some(dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return std::path::PathBuf::from(dir).join("sky-harness");
    }
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".sky-harness")
}

/// Default socket path for the harness interface
pub fn default_socket_path() -> std::path::PathBuf {
    default_runtime_dir().join("harness.sock")
}

/// Default configuration file path
pub fn default_config_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".sky-harness")
        .join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
