//! nbridge Configuration System
//!
//! Provides configuration management for nbridge hosts including:
//! - Project configuration (nbridge.toml)
//! - Global user configuration (~/.nbridge/config.toml)
//! - Environment overrides (NBRIDGE_*)
//! - Configuration precedence and merging
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded and merged in the following order (later overrides earlier):
//! 1. Global config (~/.nbridge/config.toml)
//! 2. Project config (./nbridge.toml)
//! 3. Environment variables (NBRIDGE_*)
//! 4. CLI flags
//!
//! # Example
//!
//! ```no_run
//! use nbridge_config::ConfigLoader;
//! use std::path::Path;
//!
//! let mut loader = ConfigLoader::new();
//! let config = loader.load_from_directory(Path::new(".")).unwrap();
//! println!("{:?}", config.library_name());
//! ```

pub mod global;
pub mod loader;
pub mod project;

use std::path::PathBuf;
use thiserror::Error;

/// Default name of the export that releases result buffers
pub const DEFAULT_RELEASE_SYMBOL: &str = "nbridge_text_free";

/// Argument passed to the startup function when none is configured
pub const DEFAULT_STARTUP_ARGUMENT: &str = "World";

/// Log filter used when none is configured
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML syntax in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Home directory not found")]
    HomeNotFound,
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

// Re-export main types
pub use global::GlobalConfig;
pub use loader::{Config, ConfigLoader, Overrides};
pub use project::{ProjectConfig, ThreadSafety};

/// Check that `name` is a logical library name rather than a path
pub fn validate_library_name(field: &str, name: &str) -> ConfigResult<()> {
    let reason = if name.is_empty() {
        "name cannot be empty"
    } else if name.contains(['/', '\\', '\0']) {
        "expected a library name, not a path"
    } else {
        return Ok(());
    };
    Err(ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.to_string(),
    })
}

/// Check that a symbol-like setting is non-empty
pub(crate) fn validate_non_empty(field: &str, value: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            reason: "value cannot be empty".to_string(),
        });
    }
    Ok(())
}
