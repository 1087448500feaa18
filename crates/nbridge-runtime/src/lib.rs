//! nbridge runtime - loading native libraries and calling their text exports
//!
//! This library provides:
//! - One-time loading of native libraries by logical name
//! - Symbol resolution and per-library call serialization
//! - UTF-8 marshaling of one text argument and one text result
//!
//! ```no_run
//! let greeter = nbridge_runtime::load("greeter")?;
//! let greeting = nbridge_runtime::call(&greeter, "hello", "World")?;
//! println!("{}", greeting);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// nbridge runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod ffi;

pub use ffi::{
    CallError, CallPhase, Direction, ExportedFunction, LibraryHandle, LibraryLoader, LoadError,
    NativeFault,
};
pub use nbridge_config::ThreadSafety;

/// Load a library through the process-wide loader
pub fn load(name: &str) -> Result<LibraryHandle, LoadError> {
    LibraryLoader::global().load(name)
}

/// Call a text export of a loaded library
pub fn call(
    handle: &LibraryHandle,
    function: &str,
    argument: impl AsRef<[u8]>,
) -> Result<String, CallError> {
    handle.call(function, argument)
}
