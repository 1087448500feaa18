//! Boundary types - the representation of text on the native side
//!
//! Defines:
//! - `Encoding`: the encoding tag carried by every value crossing the boundary
//! - `BoundaryText`: a validated, length-delimited view of an argument
//! - `TextFn` / `ReleaseFn`: the only two native signatures the bridge invokes
//! - `CallPhase`: the per-call state machine
//!
//! # Calling contract
//!
//! ```c
//! int32_t fn(const uint8_t *arg_ptr, size_t arg_len,
//!            uint8_t **out_ptr, size_t *out_len);
//! void nbridge_text_free(uint8_t *ptr, size_t len);
//! ```
//!
//! Arguments are borrowed for the duration of the call. Results are owned by
//! the callee until returned, then owned by the caller, which hands them back
//! through the release export exactly once. Text is UTF-8 and delimited by its
//! length in both directions; no terminator is written or expected.

use std::fmt;

/// Native text function: `(arg_ptr, arg_len, out_ptr, out_len) -> status`
pub type TextFn = unsafe extern "C" fn(*const u8, usize, *mut *mut u8, *mut usize) -> i32;

/// Native release function for result buffers: `(ptr, len)`
pub type ReleaseFn = unsafe extern "C" fn(*mut u8, usize);

/// Status returned by a native text function on success
pub const STATUS_OK: i32 = 0;

/// Default name of the release export
pub const DEFAULT_RELEASE_SYMBOL: &str = nbridge_config::DEFAULT_RELEASE_SYMBOL;

/// Encoding of text crossing the boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Utf8,
}

/// Which way a value was travelling when it was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host → native
    Argument,
    /// Native → host
    Result,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Argument => write!(f, "argument"),
            Direction::Result => write!(f, "result"),
        }
    }
}

/// Text encoded for crossing the boundary
///
/// Borrows the caller's buffer: the caller keeps ownership and the buffer
/// outlives the native call because the view cannot outlive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryText<'a> {
    bytes: &'a [u8],
    encoding: Encoding,
}

impl<'a> BoundaryText<'a> {
    /// Validate `bytes` as UTF-8 and wrap them for the boundary
    ///
    /// Returns the offset of the first invalid sequence on failure. Nothing is
    /// replaced or truncated.
    pub fn encode(bytes: &'a [u8]) -> Result<Self, usize> {
        std::str::from_utf8(bytes).map_err(|e| e.valid_up_to())?;
        Ok(Self {
            bytes,
            encoding: Encoding::Utf8,
        })
    }

    /// Wrap text that is already known to be UTF-8
    pub fn from_text(text: &'a str) -> Self {
        Self {
            bytes: text.as_bytes(),
            encoding: Encoding::Utf8,
        }
    }

    /// Pointer handed to the native side (never null, even when empty)
    pub fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the text is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

/// Progress of a single call through the marshaller
///
/// `NotStarted → SymbolResolved → ArgumentEncoded → Invoked → ResultDecoded`,
/// with `Failed` reachable from every non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    NotStarted,
    SymbolResolved,
    ArgumentEncoded,
    Invoked,
    ResultDecoded,
    Failed,
}

impl CallPhase {
    /// The phase a successful step moves to, if any
    pub fn next(self) -> Option<CallPhase> {
        match self {
            CallPhase::NotStarted => Some(CallPhase::SymbolResolved),
            CallPhase::SymbolResolved => Some(CallPhase::ArgumentEncoded),
            CallPhase::ArgumentEncoded => Some(CallPhase::Invoked),
            CallPhase::Invoked => Some(CallPhase::ResultDecoded),
            CallPhase::ResultDecoded | CallPhase::Failed => None,
        }
    }

    /// Check if no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, CallPhase::ResultDecoded | CallPhase::Failed)
    }

    /// Check if `to` is a legal transition from this phase
    pub fn can_transition(self, to: CallPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == CallPhase::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallPhase::NotStarted => "not started",
            CallPhase::SymbolResolved => "symbol resolved",
            CallPhase::ArgumentEncoded => "argument encoded",
            CallPhase::Invoked => "invoked",
            CallPhase::ResultDecoded => "result decoded",
            CallPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}
