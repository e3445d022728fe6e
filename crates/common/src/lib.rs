//! crossrun Common Library
//!
//! Shared types, error taxonomy, retry policy and tunnel-binary archive
//! helpers used by the engine and the CLI.

pub mod archive;
pub mod error;
pub mod retry;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use retry::{retry_until, Attempt, RetryPolicy};
pub use types::*;

/// crossrun version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".crossrun")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
