//! Global Configuration (~/.nbridge/config.toml)
//!
//! Handles user-level configuration stored in `~/.nbridge/config.toml`.

use crate::project::{LoggingConfig, ThreadSafety};
use crate::{validate_library_name, validate_non_empty, ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Global user configuration from ~/.nbridge/config.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct GlobalConfig {
    /// Default settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub defaults: Option<DefaultsConfig>,

    /// Logging preferences
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Defaults used when a project does not say otherwise
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct DefaultsConfig {
    /// Default library name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub library: Option<String>,

    /// Default startup function
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,

    /// Search paths appended after project paths
    #[serde(default)]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<PathBuf>,

    /// Default concurrency declaration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_safety: Option<ThreadSafety>,
}

impl GlobalConfig {
    /// Parse a global config file
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

    /// Check the defaults section for unusable values
    pub fn validate(&self) -> ConfigResult<()> {
        if let Some(defaults) = &self.defaults {
            if let Some(library) = &defaults.library {
                validate_library_name("defaults.library", library)?;
            }
            if let Some(function) = &defaults.function {
                validate_non_empty("defaults.function", function)?;
            }
        }

        if let Some(level) = self.log_level() {
            validate_non_empty("logging.level", level)?;
        }

        Ok(())
    }

    /// Get the global config directory (~/.nbridge)
    pub fn global_config_dir() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeNotFound)?;
        Ok(home.join(".nbridge"))
    }

    /// Get the global config file path (~/.nbridge/config.toml)
    pub fn global_config_path() -> ConfigResult<PathBuf> {
        Ok(Self::global_config_dir()?.join("config.toml"))
    }

    pub fn default_library(&self) -> Option<&str> {
        self.defaults.as_ref().and_then(|d| d.library.as_deref())
    }

    pub fn default_function(&self) -> Option<&str> {
        self.defaults.as_ref().and_then(|d| d.function.as_deref())
    }

    pub fn default_search_paths(&self) -> &[PathBuf] {
        self.defaults
            .as_ref()
            .map(|d| d.search_paths.as_slice())
            .unwrap_or(&[])
    }

    pub fn default_thread_safety(&self) -> Option<ThreadSafety> {
        self.defaults.as_ref().and_then(|d| d.thread_safety)
    }

    pub fn log_level(&self) -> Option<&str> {
        self.logging.as_ref().and_then(|l| l.level.as_deref())
    }
}
