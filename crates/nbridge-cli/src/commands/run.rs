//! Run command - the startup hook
//!
//! Loads the configured library, calls the configured startup function with
//! the configured argument and reports the result.

use anyhow::{Context, Result};
use nbridge_config::Config;
use tracing::info;

pub fn run(config: &Config) -> Result<()> {
    let function = config.startup_function().context(
        "No startup function configured (set [startup].function in nbridge.toml, NBRIDGE_FUNCTION or --function)",
    )?;
    let argument = config.startup_argument();

    let handle = super::load_library(config)?;
    let result = nbridge_runtime::call(&handle, function, argument)
        .with_context(|| format!("Startup call '{}' failed", function))?;

    info!(
        library = handle.name(),
        function,
        result = %result,
        "startup call completed"
    );
    println!("{}", result);
    Ok(())
}
