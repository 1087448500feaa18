//! Foreign Function Interface (FFI) infrastructure
//!
//! Bridges host text to native libraries via:
//! - Pre-flight ABI checks on library files (`abi`)
//! - Dynamic library loading, once per library name (`loader`)
//! - Mapped images shared by every loader in the process (`image`)
//! - Symbol resolution on loaded libraries (`handle`)
//! - Text marshaling across the boundary (`marshal`)
//! - Calls through the fixed text signature (`caller`)
//!
//! # Safety
//!
//! FFI operations involve `unsafe` code and careful memory management.
//! All unsafe code is isolated in this module with safe wrappers.

pub mod abi;
pub mod caller;
pub mod handle;
pub(crate) mod image;
pub mod loader;
pub mod marshal;
pub mod safety;
pub mod types;

pub use caller::{CallError, ExportedFunction, NativeFault};
pub use handle::LibraryHandle;
pub use loader::{LibraryLoader, LoadError};
pub use marshal::NativeText;
pub use types::{BoundaryText, CallPhase, Direction, Encoding, ReleaseFn, TextFn};
