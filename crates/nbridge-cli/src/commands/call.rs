//! Call command - invoke one text function of a native library

use anyhow::{Context, Result};
use nbridge_config::Config;
use serde_json::json;

pub fn run(config: &Config, function: &str, argument: Option<&str>, json: bool) -> Result<()> {
    let argument = argument.unwrap_or_else(|| config.startup_argument());

    let handle = super::load_library(config)?;
    let result = handle
        .call(function, argument)
        .with_context(|| format!("Call to '{}' in '{}' failed", function, handle.name()))?;

    if json {
        let output = json!({
            "library": handle.name(),
            "function": function,
            "result": result,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{}", result);
    }
    Ok(())
}
