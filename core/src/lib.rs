//! Casket Core - Foundational Types
//!
//! Error taxonomy and configuration shared by the casket runtime and CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{CasketConfig, Keyword, LayerCompression};
pub use error::{CasketError, Result};

/// Casket version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
