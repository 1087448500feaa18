//! Library handles - the capability for resolving and calling exports
//!
//! A [`LibraryHandle`] only exists for a library that loaded successfully.
//! Handles from every loader that resolved the same file share one
//! [`Image`]; the image is unmapped once the last handle (or
//! [`ExportedFunction`]) onto it is gone.

use crate::ffi::caller::{CallError, ExportedFunction, ResolvedSymbols};
use crate::ffi::image::{CallGuard, Image};
use nbridge_config::ThreadSafety;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

struct Attachment {
    name: String,
    location: PathBuf,
    release_symbol: String,
    thread_safety: ThreadSafety,
    image: Arc<Image>,
    detached: AtomicBool,
}

/// Handle to a loaded native library
#[derive(Clone)]
pub struct LibraryHandle {
    inner: Arc<Attachment>,
}

impl LibraryHandle {
    pub(crate) fn new(
        name: &str,
        location: PathBuf,
        image: Arc<Image>,
        release_symbol: &str,
        thread_safety: ThreadSafety,
    ) -> Self {
        Self {
            inner: Arc::new(Attachment {
                name: name.to_string(),
                location,
                release_symbol: release_symbol.to_string(),
                thread_safety,
                image,
                detached: AtomicBool::new(false),
            }),
        }
    }

    /// Logical name the library was loaded under
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Path the library was opened from, or the bare file name when the
    /// system loader located it
    pub fn location(&self) -> &Path {
        &self.inner.location
    }

    pub fn thread_safety(&self) -> ThreadSafety {
        self.inner.thread_safety
    }

    /// Name of the export used to release result buffers
    pub fn release_symbol(&self) -> &str {
        &self.inner.release_symbol
    }

    /// False once the loader has unloaded this library
    pub fn is_loaded(&self) -> bool {
        !self.inner.detached.load(Ordering::Acquire)
    }

    /// Check if both handles refer to the same mapped image
    ///
    /// True across loaders, and across an unload and reload while an older
    /// handle kept the image mapped.
    pub fn same_library(&self, other: &LibraryHandle) -> bool {
        Arc::ptr_eq(&self.inner.image, &other.inner.image)
    }

    /// Check if both handles come from the same load
    pub fn same_handle(&self, other: &LibraryHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of text exports of the image resolved and cached so far
    pub fn cached_functions(&self) -> usize {
        self.inner.image.cached_functions()
    }

    /// Resolve a text export, caching it for later calls
    ///
    /// Failed lookups are not cached and leave the handle usable.
    pub fn resolve(&self, function: &str) -> Result<ExportedFunction, CallError> {
        if !self.is_loaded() {
            return Err(CallError::LibraryUnloaded(self.inner.name.clone()));
        }

        let release = self.inner.image.release_fn(&self.inner.release_symbol)?;
        let (func, resolved) = self.inner.image.text_fn(function)?;
        if resolved {
            debug!(library = %self.inner.name, function, "resolved native function");
        }

        Ok(ExportedFunction::new(
            function.to_string(),
            ResolvedSymbols { func, release },
            self.clone(),
        ))
    }

    /// Resolve `function` and call it with one text argument
    pub fn call(&self, function: &str, argument: impl AsRef<[u8]>) -> Result<String, CallError> {
        self.resolve(function)?.call(argument)
    }

    /// Guard held for the duration of a native call
    ///
    /// Serialized handles exclude all other calls into the image, whichever
    /// loader they came from.
    pub(crate) fn serialize_call(&self) -> CallGuard<'_> {
        self.inner.image.enter(self.inner.thread_safety)
    }

    pub(crate) fn detach(&self) {
        self.inner.detached.store(true, Ordering::Release);
        debug!(library = %self.inner.name, "detached library handle");
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("name", &self.inner.name)
            .field("location", &self.inner.location)
            .field("image", &self.inner.image.key())
            .field("thread_safety", &self.inner.thread_safety)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
