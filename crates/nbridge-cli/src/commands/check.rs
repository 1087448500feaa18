//! Check command - load a library and resolve symbols without calling them

use anyhow::{bail, Result};
use nbridge_config::Config;
use nbridge_runtime::ffi::abi;

/// Load the configured library and resolve each of `symbols`
///
/// Fails if the library cannot be loaded or any symbol is missing.
pub fn run(config: &Config, symbols: &[String]) -> Result<()> {
    let handle = super::load_library(config)?;

    println!(
        "{}: loaded from {} ({})",
        handle.name(),
        handle.location().display(),
        handle.thread_safety()
    );
    if let Ok(Some(artifact)) = abi::read_artifact(handle.location()) {
        println!("  abi: {}", artifact);
    }

    let mut missing = 0;
    for symbol in symbols {
        match handle.resolve(symbol) {
            Ok(_) => println!("  ok       {}", symbol),
            Err(e) => {
                missing += 1;
                println!("  missing  {} ({})", symbol, e);
            }
        }
    }

    if missing > 0 {
        bail!("{} of {} symbol(s) not found", missing, symbols.len());
    }
    Ok(())
}
