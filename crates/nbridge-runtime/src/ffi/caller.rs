//! Native function calling using direct function pointers
//!
//! Every export the bridge calls has the single text signature from
//! [`crate::ffi::types`], so the resolved address is cast to [`TextFn`]
//! directly; no dynamic call-frame construction is needed.
//!
//! A call moves through [`CallPhase`]s: the symbol is resolved, the argument is
//! encoded, the function is invoked and the result is decoded. Any step can
//! fail with a [`CallError`]; nothing is retried.
//!
//! # Process boundary
//!
//! A callee that aborts, faults or unwinds across the boundary takes the
//! process down with it. Only failures reported through the status return are
//! recoverable.

use crate::ffi::handle::LibraryHandle;
use crate::ffi::marshal::{encode_argument, NativeText};
use crate::ffi::types::{CallPhase, Direction, ReleaseFn, TextFn, STATUS_OK};
use std::fmt;
use thiserror::Error;
use tracing::trace;

/// How a native function reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeFault {
    /// Non-zero status return
    Status(i32),
    /// Success status but a null buffer with a non-zero length
    NullBuffer { len: usize },
    /// Reported length larger than any buffer can be
    OversizedBuffer { len: usize },
}

impl fmt::Display for NativeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeFault::Status(code) => write!(f, "status {}", code),
            NativeFault::NullBuffer { len } => {
                write!(f, "null result buffer with length {}", len)
            }
            NativeFault::OversizedBuffer { len } => {
                write!(f, "result buffer length {} is out of range", len)
            }
        }
    }
}

/// Call errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// Export absent from the loaded library
    #[error("Symbol '{0}' not found")]
    SymbolNotFound(String),

    /// Text that is not valid UTF-8, in either direction
    #[error("Invalid UTF-8 in {direction} after {valid_up_to} valid byte(s)")]
    EncodingInvalid {
        direction: Direction,
        valid_up_to: usize,
    },

    /// The callee reported an internal failure
    #[error("Native function '{function}' failed: {fault}")]
    NativeInvocationFailed { function: String, fault: NativeFault },

    /// The owning library was unloaded through the loader
    #[error("Library '{0}' has been unloaded")]
    LibraryUnloaded(String),
}

impl CallError {
    /// Last phase the call completed before this error
    pub fn phase(&self) -> CallPhase {
        match self {
            CallError::SymbolNotFound(_) | CallError::LibraryUnloaded(_) => CallPhase::NotStarted,
            CallError::EncodingInvalid {
                direction: Direction::Argument,
                ..
            } => CallPhase::SymbolResolved,
            CallError::EncodingInvalid {
                direction: Direction::Result,
                ..
            }
            | CallError::NativeInvocationFailed { .. } => CallPhase::Invoked,
        }
    }
}

/// Per-call state machine
#[derive(Debug)]
struct CallState<'a> {
    function: &'a str,
    phase: CallPhase,
}

impl<'a> CallState<'a> {
    fn resolved(function: &'a str) -> Self {
        Self {
            function,
            phase: CallPhase::SymbolResolved,
        }
    }

    fn advance(&mut self, to: CallPhase) {
        debug_assert!(
            self.phase.can_transition(to),
            "illegal call transition {} -> {}",
            self.phase,
            to
        );
        trace!(function = self.function, from = %self.phase, to = %to, "call phase");
        self.phase = to;
    }

    fn fail(&mut self, error: CallError) -> CallError {
        self.advance(CallPhase::Failed);
        error
    }
}

/// Marshal `argument`, call `func`, and decode its result
///
/// This is the whole marshalling path; [`ExportedFunction::call`] adds symbol
/// lifetime and call serialization around it.
///
/// # Safety
///
/// `func` and `release` must honour the calling contract in
/// [`crate::ffi::types`] and stay valid for the duration of the call.
pub unsafe fn invoke(
    function: &str,
    func: TextFn,
    release: ReleaseFn,
    argument: &[u8],
) -> Result<String, CallError> {
    let mut state = CallState::resolved(function);

    let text = match encode_argument(argument) {
        Ok(text) => text,
        Err(e) => return Err(state.fail(e)),
    };
    state.advance(CallPhase::ArgumentEncoded);

    let mut out_ptr: *mut u8 = std::ptr::null_mut();
    let mut out_len: usize = 0;
    let status = func(text.as_ptr(), text.len(), &mut out_ptr, &mut out_len);
    // Owned from here on; dropped on every path below.
    let result = NativeText::from_raw(out_ptr, out_len, release);
    state.advance(CallPhase::Invoked);

    if status != STATUS_OK {
        return Err(state.fail(CallError::NativeInvocationFailed {
            function: function.to_string(),
            fault: NativeFault::Status(status),
        }));
    }

    match result.decode(function) {
        Ok(decoded) => {
            state.advance(CallPhase::ResultDecoded);
            Ok(decoded)
        }
        Err(e) => Err(state.fail(e)),
    }
}

/// Resolved addresses of a text export and the library's release export
#[derive(Clone, Copy)]
pub(crate) struct ResolvedSymbols {
    pub(crate) func: TextFn,
    pub(crate) release: ReleaseFn,
}

/// Exported text function bound to its library
///
/// Holds a clone of the owning [`LibraryHandle`], so the code it points into
/// stays mapped for as long as the function is reachable.
#[derive(Clone)]
pub struct ExportedFunction {
    name: String,
    symbols: ResolvedSymbols,
    library: LibraryHandle,
}

impl ExportedFunction {
    pub(crate) fn new(name: String, symbols: ResolvedSymbols, library: LibraryHandle) -> Self {
        Self {
            name,
            symbols,
            library,
        }
    }

    /// Symbol name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Library this function was resolved from
    pub fn library(&self) -> &LibraryHandle {
        &self.library
    }

    /// Call the function with one text argument
    ///
    /// `argument` is validated as UTF-8 before anything crosses the boundary.
    /// Calls are serialized per library unless it was loaded as reentrant.
    pub fn call(&self, argument: impl AsRef<[u8]>) -> Result<String, CallError> {
        if !self.library.is_loaded() {
            return Err(CallError::LibraryUnloaded(self.library.name().to_string()));
        }

        let _serial = self.library.serialize_call();
        trace!(
            library = self.library.name(),
            function = %self.name,
            "invoking native function"
        );
        // SAFETY: the symbols were resolved from `self.library`, which is kept
        // alive by this struct, and loading the library accepted its contract.
        unsafe {
            invoke(
                &self.name,
                self.symbols.func,
                self.symbols.release,
                argument.as_ref(),
            )
        }
    }
}

impl fmt::Debug for ExportedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedFunction")
            .field("name", &self.name)
            .field("library", &self.library.name())
            .finish()
    }
}
