//! Command implementations

pub mod call;
pub mod check;
pub mod run;

use anyhow::{anyhow, Context, Result};
use nbridge_config::{Config, ConfigLoader, Overrides};
use nbridge_runtime::{LibraryHandle, LibraryLoader};
use std::path::Path;

/// Load configuration and layer the command-line overrides on top
pub fn load_config(config_file: Option<&Path>, overrides: &Overrides) -> Result<Config> {
    let mut loader = ConfigLoader::new();
    let mut config = match config_file {
        Some(path) => loader
            .load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => {
            let cwd = std::env::current_dir().context("Failed to read working directory")?;
            loader
                .load_from_directory(&cwd)
                .context("Failed to load configuration")?
        }
    };
    config.apply(overrides);
    Ok(config)
}

/// Install the process-wide loader built from `config`
pub fn install_loader(config: &Config) -> Result<&'static LibraryLoader> {
    LibraryLoader::install_global(LibraryLoader::from_config(config))
        .map_err(|_| anyhow!("Library loader was already initialized"))
}

/// Load the configured library through the process-wide loader
pub fn load_library(config: &Config) -> Result<LibraryHandle> {
    let name = config.library_name().context(
        "No library configured (set [library].name in nbridge.toml, NBRIDGE_LIBRARY or --library)",
    )?;
    install_loader(config)?;
    nbridge_runtime::load(name).with_context(|| format!("Failed to load library '{}'", name))
}
