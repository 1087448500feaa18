//! Project Configuration (nbridge.toml)
//!
//! Handles project-level configuration stored in `nbridge.toml` at the project root.

use crate::{validate_library_name, validate_non_empty, ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Project configuration from nbridge.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct ProjectConfig {
    /// Native library settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<LibraryConfig>,

    /// Startup hook settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup: Option<StartupConfig>,

    /// Logging configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Native library configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LibraryConfig {
    /// Logical library name (e.g., "greeter" for libgreeter.so)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Directories searched before the system loader
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,

    /// Export used to release result buffers (default: "nbridge_text_free")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_symbol: Option<String>,

    /// Whether the library tolerates concurrent calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_safety: Option<ThreadSafety>,
}

/// Startup hook configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct StartupConfig {
    /// Function called once the library is loaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,

    /// Argument for the startup function (default: "World")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub argument: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log filter directive (e.g., "info", "nbridge_runtime=debug")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Concurrency declaration for a native library
///
/// Calls into a `Serialized` library hold a per-library lock; `Reentrant`
/// libraries are called without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadSafety {
    #[default]
    Serialized,
    Reentrant,
}

impl ThreadSafety {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadSafety::Serialized => "serialized",
            ThreadSafety::Reentrant => "reentrant",
        }
    }
}

impl fmt::Display for ThreadSafety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadSafety {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serialized" => Ok(ThreadSafety::Serialized),
            "reentrant" => Ok(ThreadSafety::Reentrant),
            other => Err(ConfigError::InvalidValue {
                field: "thread_safety".to_string(),
                reason: format!("must be 'serialized' or 'reentrant', got '{}'", other),
            }),
        }
    }
}

impl ProjectConfig {
    /// Load project configuration from a file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::IoError(e)
            }
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            file: path.to_path_buf(),
            error: e,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the project configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(library) = &self.library {
            if let Some(name) = &library.name {
                validate_library_name("library.name", name)?;
            }
            if let Some(symbol) = &library.release_symbol {
                validate_non_empty("library.release_symbol", symbol)?;
            }
        }

        if let Some(function) = self.startup.as_ref().and_then(|s| s.function.as_deref()) {
            validate_non_empty("startup.function", function)?;
        }

        if let Some(level) = self.logging.as_ref().and_then(|l| l.level.as_deref()) {
            validate_non_empty("logging.level", level)?;
        }

        Ok(())
    }

    /// Resolve relative search paths against the project root
    pub fn resolve_paths(&mut self, root: &Path) {
        if let Some(library) = self.library.as_mut() {
            for path in library.search_paths.iter_mut() {
                if path.is_relative() {
                    *path = root.join(&*path);
                }
            }
        }
    }

    /// Get the library name, if present
    pub fn library_name(&self) -> Option<&str> {
        self.library.as_ref().and_then(|l| l.name.as_deref())
    }

    /// Get the configured search paths
    pub fn search_paths(&self) -> &[PathBuf] {
        self.library
            .as_ref()
            .map(|l| l.search_paths.as_slice())
            .unwrap_or(&[])
    }

    pub fn release_symbol(&self) -> Option<&str> {
        self.library
            .as_ref()
            .and_then(|l| l.release_symbol.as_deref())
    }

    pub fn thread_safety(&self) -> Option<ThreadSafety> {
        self.library.as_ref().and_then(|l| l.thread_safety)
    }

    pub fn startup_function(&self) -> Option<&str> {
        self.startup.as_ref().and_then(|s| s.function.as_deref())
    }

    pub fn startup_argument(&self) -> Option<&str> {
        self.startup.as_ref().and_then(|s| s.argument.as_deref())
    }

    pub fn log_level(&self) -> Option<&str> {
        self.logging.as_ref().and_then(|l| l.level.as_deref())
    }

    /// Library section, created on first use
    pub fn library_mut(&mut self) -> &mut LibraryConfig {
        self.library.get_or_insert_with(LibraryConfig::default)
    }

    /// Startup section, created on first use
    pub fn startup_mut(&mut self) -> &mut StartupConfig {
        self.startup.get_or_insert_with(StartupConfig::default)
    }

    /// Logging section, created on first use
    pub fn logging_mut(&mut self) -> &mut LoggingConfig {
        self.logging.get_or_insert_with(LoggingConfig::default)
    }
}
