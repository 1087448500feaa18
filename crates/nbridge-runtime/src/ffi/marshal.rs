//! Text marshaling - host ↔ native conversions
//!
//! - `encode_argument()`: validate host bytes and borrow them for the call
//! - `NativeText`: the callee's result buffer, released on drop
//!
//! # Memory Safety
//!
//! - Arguments are never copied or owned by the native side
//! - Result buffers are handed back through the library's release export
//!   exactly once, whichever way the call ends
//! - Null pointers are only accepted together with a zero length

use crate::ffi::caller::{CallError, NativeFault};
use crate::ffi::safety::{NativeSpan, PointerError};
use crate::ffi::types::{BoundaryText, Direction, ReleaseFn};

/// Encode an argument for the boundary
///
/// Invalid UTF-8 is rejected with the offset of the first bad sequence.
pub fn encode_argument(argument: &[u8]) -> Result<BoundaryText<'_>, CallError> {
    BoundaryText::encode(argument).map_err(|valid_up_to| CallError::EncodingInvalid {
        direction: Direction::Argument,
        valid_up_to,
    })
}

/// Result buffer returned by a native text function
///
/// Owns `(ptr, len)` from the moment the native call returns. Dropping it
/// calls the release export unless the pointer is null.
pub struct NativeText {
    ptr: *mut u8,
    len: usize,
    release: ReleaseFn,
}

impl NativeText {
    /// Take ownership of a native result buffer
    ///
    /// # Safety
    ///
    /// `ptr`/`len` must come from the native function paired with `release`,
    /// and must not be released by anyone else.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize, release: ReleaseFn) -> Self {
        Self { ptr, len, release }
    }

    /// Length in bytes as reported by the callee
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    /// Copy the buffer into host text, validating UTF-8
    ///
    /// `function` names the export for error reporting.
    pub fn decode(&self, function: &str) -> Result<String, CallError> {
        let span = NativeSpan::new(self.ptr, self.len).map_err(|e| {
            let fault = match e {
                PointerError::NullWithLength(len) => NativeFault::NullBuffer { len },
                PointerError::LengthOverflow(len) => NativeFault::OversizedBuffer { len },
            };
            CallError::NativeInvocationFailed {
                function: function.to_string(),
                fault,
            }
        })?;

        // SAFETY: the callee promised `len` readable bytes at `ptr`, and the
        // buffer stays alive until `self` is dropped.
        let bytes = unsafe { span.bytes() };
        match std::str::from_utf8(bytes) {
            Ok(text) => Ok(text.to_owned()),
            Err(e) => Err(CallError::EncodingInvalid {
                direction: Direction::Result,
                valid_up_to: e.valid_up_to(),
            }),
        }
    }
}

impl Drop for NativeText {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: ownership was transferred in `from_raw` and this is the
            // only release of the buffer.
            unsafe { (self.release)(self.ptr, self.len) };
        }
    }
}

impl std::fmt::Debug for NativeText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeText")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
