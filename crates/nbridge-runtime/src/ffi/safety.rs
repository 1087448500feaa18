//! Pointer checks for values handed back by native code
//!
//! Export addresses and result buffers are validated here before anything
//! dereferences or transmutes them.

use std::ffi::c_void;
use std::ptr::NonNull;
use thiserror::Error;

/// Why a native pointer/length pair cannot be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PointerError {
    #[error("null pointer with length {0}")]
    NullWithLength(usize),
    #[error("length {0} exceeds the addressable range")]
    LengthOverflow(usize),
}

/// Non-null export address
///
/// Some loaders report a symbol that exists but resolves to address zero
/// (weak or absolute symbols); those cannot be called.
pub fn export_address(address: *mut c_void) -> Option<NonNull<c_void>> {
    NonNull::new(address)
}

/// Readable span of callee-owned bytes
///
/// A zero length is always readable, whatever the pointer.
#[derive(Debug, Clone, Copy)]
pub struct NativeSpan {
    ptr: *const u8,
    len: usize,
}

impl NativeSpan {
    pub fn new(ptr: *const u8, len: usize) -> Result<Self, PointerError> {
        if len == 0 {
            return Ok(Self { ptr, len });
        }
        if ptr.is_null() {
            return Err(PointerError::NullWithLength(len));
        }
        if len > isize::MAX as usize {
            return Err(PointerError::LengthOverflow(len));
        }
        Ok(Self { ptr, len })
    }

    /// Borrow the span's bytes
    ///
    /// # Safety
    ///
    /// The callee must have written `len` bytes at `ptr`, and they must stay
    /// untouched while the returned slice is alive.
    pub unsafe fn bytes(&self) -> &[u8] {
        match self.len {
            0 => &[],
            len => std::slice::from_raw_parts(self.ptr, len),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
