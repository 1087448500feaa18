//! Locating, reading and layering nbridge configuration
//!
//! Later layers win: global file, project file, `NBRIDGE_*` variables, CLI flags.

use crate::global::GlobalConfig;
use crate::project::{ProjectConfig, ThreadSafety};
use crate::{
    validate_library_name, validate_non_empty, ConfigError, ConfigResult, DEFAULT_LOG_LEVEL,
    DEFAULT_RELEASE_SYMBOL, DEFAULT_STARTUP_ARGUMENT,
};
use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Name of the project configuration file
pub const PROJECT_FILE: &str = "nbridge.toml";

/// Builds a [`Config`] from every source that applies
///
/// Precedence, lowest first:
/// 1. Global config (~/.nbridge/config.toml) - lowest priority
/// 2. Project config (./nbridge.toml) - overrides global
/// 3. Environment variables (NBRIDGE_*) - overrides project
/// 4. CLI flags - highest priority (applied by the caller through [`Overrides`])
pub struct ConfigLoader {
    /// Overrides `~/.nbridge/config.toml` when set
    global_config_path: Option<PathBuf>,
}

/// Layered view of every configuration source
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Project configuration, with environment and caller overrides applied
    pub project: ProjectConfig,

    /// Global configuration
    pub global: GlobalConfig,

    /// Project root directory (where nbridge.toml was found)
    pub project_root: Option<PathBuf>,
}

/// Settings layered over loaded files
///
/// Built from the environment by the loader, and from flags by the CLI.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub library: Option<String>,
    /// Prepended to the configured search paths, in order
    pub search_paths: Vec<PathBuf>,
    pub function: Option<String>,
    pub argument: Option<String>,
    pub thread_safety: Option<ThreadSafety>,
    pub log_level: Option<String>,
}

impl Overrides {
    /// Read overrides from the process environment
    ///
    /// - `NBRIDGE_LIBRARY`: library name
    /// - `NBRIDGE_LIBRARY_PATH`: search paths, in the platform path-list syntax
    /// - `NBRIDGE_FUNCTION` / `NBRIDGE_ARGUMENT`: startup call
    /// - `NBRIDGE_THREAD_SAFETY`: `serialized` or `reentrant`
    /// - `NBRIDGE_LOG`: log filter
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| env::var_os(key))
    }

    /// Read overrides through an arbitrary variable lookup
    ///
    /// Text values must be valid UTF-8 and are never substituted; search
    /// paths are taken as raw platform strings.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> ConfigResult<Self> {
        let text = |key: &str| -> ConfigResult<Option<String>> {
            lookup(key)
                .map(|value| {
                    value.into_string().map_err(|_| ConfigError::InvalidValue {
                        field: key.to_string(),
                        reason: "value is not valid UTF-8".to_string(),
                    })
                })
                .transpose()
        };
        let non_empty = |key: &str| -> ConfigResult<Option<String>> {
            Ok(text(key)?.filter(|value| !value.is_empty()))
        };

        let library = non_empty("NBRIDGE_LIBRARY")?;
        if let Some(name) = &library {
            validate_library_name("NBRIDGE_LIBRARY", name)?;
        }

        let search_paths = lookup("NBRIDGE_LIBRARY_PATH")
            .map(|paths| {
                env::split_paths(&paths)
                    .filter(|path| !path.as_os_str().is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let function = non_empty("NBRIDGE_FUNCTION")?;
        if let Some(function) = &function {
            validate_non_empty("NBRIDGE_FUNCTION", function)?;
        }

        let thread_safety = non_empty("NBRIDGE_THREAD_SAFETY")?
            .map(|value| value.parse::<ThreadSafety>())
            .transpose()?;

        Ok(Self {
            library,
            search_paths,
            function,
            // An empty argument is a legitimate value
            argument: text("NBRIDGE_ARGUMENT")?,
            thread_safety,
            log_level: non_empty("NBRIDGE_LOG")?,
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl ConfigLoader {
    /// Loader reading the global file from its usual location
    pub fn new() -> Self {
        Self {
            global_config_path: None,
        }
    }

    /// Use `path` instead of ~/.nbridge/config.toml
    pub fn with_global_config_path(mut self, path: PathBuf) -> Self {
        self.global_config_path = Some(path);
        self
    }

    /// Resolve configuration for a working directory
    ///
    /// The nearest nbridge.toml at or above `start_dir` is the project file;
    /// a missing global file is not an error.
    pub fn load_from_directory(&mut self, start_dir: &Path) -> ConfigResult<Config> {
        // Find project root (directory containing nbridge.toml)
        let (project_root, project_config) = self.find_project_config(start_dir)?;

        let global_config = self.load_global_config()?;

        let mut config = Config {
            project: project_config,
            global: global_config,
            project_root,
        };

        config.apply(&Overrides::from_env()?);
        Ok(config)
    }

    /// Resolve configuration with an explicit project file (`--config`)
    pub fn load_from_file(&mut self, config_path: &Path) -> ConfigResult<Config> {
        let mut project_config = ProjectConfig::load_from_file(config_path)?;
        let global_config = self.load_global_config()?;

        let project_root = config_path.parent().map(|p| p.to_path_buf());
        if let Some(root) = &project_root {
            project_config.resolve_paths(root);
        }

        let mut config = Config {
            project: project_config,
            global: global_config,
            project_root,
        };
        config.apply(&Overrides::from_env()?);
        Ok(config)
    }

    /// Nearest nbridge.toml at or above `start_dir`
    ///
    /// Returns (project_root, project_config); the default config when none is found
    fn find_project_config(
        &self,
        start_dir: &Path,
    ) -> ConfigResult<(Option<PathBuf>, ProjectConfig)> {
        let mut current = start_dir.to_path_buf();

        loop {
            let config_path = current.join(PROJECT_FILE);

            if config_path.is_file() {
                let mut project_config = ProjectConfig::load_from_file(&config_path)?;
                project_config.resolve_paths(&current);
                return Ok((Some(current), project_config));
            }

            // Try parent directory
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => return Ok((None, ProjectConfig::default())),
            }
        }
    }

    /// Load global configuration from ~/.nbridge/config.toml
    ///
    /// A missing file, or a missing home directory, yields the default.
    fn load_global_config(&mut self) -> ConfigResult<GlobalConfig> {
        let path = match &self.global_config_path {
            Some(path) => path.clone(),
            None => match GlobalConfig::global_config_path() {
                Ok(path) => {
                    self.global_config_path = Some(path.clone());
                    path
                }
                Err(_) => return Ok(GlobalConfig::default()),
            },
        };

        if !path.exists() {
            return Ok(GlobalConfig::default());
        }

        GlobalConfig::load_from_file(&path)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Layer `overrides` over the loaded configuration
    pub fn apply(&mut self, overrides: &Overrides) {
        let project = &mut self.project;

        if let Some(library) = &overrides.library {
            project.library_mut().name = Some(library.clone());
        }
        if !overrides.search_paths.is_empty() {
            let library = project.library_mut();
            let mut paths = overrides.search_paths.clone();
            paths.append(&mut library.search_paths);
            library.search_paths = paths;
        }
        if let Some(thread_safety) = overrides.thread_safety {
            project.library_mut().thread_safety = Some(thread_safety);
        }
        if let Some(function) = &overrides.function {
            project.startup_mut().function = Some(function.clone());
        }
        if let Some(argument) = &overrides.argument {
            project.startup_mut().argument = Some(argument.clone());
        }
        if let Some(level) = &overrides.log_level {
            project.logging_mut().level = Some(level.clone());
        }
    }

    /// Get the effective library name (project > global)
    pub fn library_name(&self) -> Option<&str> {
        self.project
            .library_name()
            .or_else(|| self.global.default_library())
    }

    /// Search paths in lookup order: project paths, then global defaults
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.project
            .search_paths()
            .iter()
            .chain(self.global.default_search_paths())
            .cloned()
            .collect()
    }

    pub fn release_symbol(&self) -> &str {
        self.project
            .release_symbol()
            .unwrap_or(DEFAULT_RELEASE_SYMBOL)
    }

    /// Get the effective concurrency declaration (project > global > serialized)
    pub fn thread_safety(&self) -> ThreadSafety {
        self.project
            .thread_safety()
            .or_else(|| self.global.default_thread_safety())
            .unwrap_or_default()
    }

    pub fn startup_function(&self) -> Option<&str> {
        self.project
            .startup_function()
            .or_else(|| self.global.default_function())
    }

    pub fn startup_argument(&self) -> &str {
        self.project
            .startup_argument()
            .unwrap_or(DEFAULT_STARTUP_ARGUMENT)
    }

    /// Get the effective log filter (project > global > "info")
    pub fn log_level(&self) -> &str {
        self.project
            .log_level()
            .or_else(|| self.global.log_level())
            .unwrap_or(DEFAULT_LOG_LEVEL)
    }

    /// Directory holding the project file, if one was found
    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Check if this is a project (has nbridge.toml)
    pub fn is_project(&self) -> bool {
        self.project_root.is_some()
    }
}
