//! Mapped library images, shared process-wide
//!
//! The platform loader maps a file once per process no matter how many
//! [`LibraryLoader`](crate::ffi::loader::LibraryLoader)s ask for it, so the
//! state tied to that mapping lives here rather than in a loader: the open
//! itself, the symbol cache and the gate that serializes calls.
//!
//! Images are keyed by the canonical path of the file, or by the bare file
//! name when the system loader located it.

use crate::ffi::caller::CallError;
use crate::ffi::handle::lock;
use crate::ffi::safety::export_address;
use crate::ffi::types::{ReleaseFn, TextFn};
use libloading::Library;
use nbridge_config::ThreadSafety;
use std::collections::HashMap;
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::sync::{
    Arc, Mutex, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};

type ImageSlot = Arc<Mutex<Weak<Image>>>;

static IMAGES: OnceLock<Mutex<HashMap<PathBuf, ImageSlot>>> = OnceLock::new();

fn images() -> &'static Mutex<HashMap<PathBuf, ImageSlot>> {
    IMAGES.get_or_init(Default::default)
}

/// One mapped library and the state every handle onto it shares
pub(crate) struct Image {
    key: PathBuf,
    library: Library,
    functions: Mutex<HashMap<String, TextFn>>,
    releases: Mutex<HashMap<String, ReleaseFn>>,
    /// Serialized calls take it exclusively, reentrant ones shared
    gate: RwLock<()>,
}

/// Held for the duration of one native call
pub(crate) struct CallGuard<'a> {
    _exclusive: Option<RwLockWriteGuard<'a, ()>>,
    _shared: Option<RwLockReadGuard<'a, ()>>,
}

impl Image {
    pub(crate) fn new(key: PathBuf, library: Library) -> Self {
        Self {
            key,
            library,
            functions: Mutex::new(HashMap::new()),
            releases: Mutex::new(HashMap::new()),
            gate: RwLock::new(()),
        }
    }

    /// Registry key this image was opened under
    pub(crate) fn key(&self) -> &Path {
        &self.key
    }

    pub(crate) fn cached_functions(&self) -> usize {
        lock(&self.functions).len()
    }

    /// Resolve a text export; the second value is true on a cache miss
    pub(crate) fn text_fn(&self, symbol: &str) -> Result<(TextFn, bool), CallError> {
        if let Some(func) = lock(&self.functions).get(symbol) {
            return Ok((*func, false));
        }
        let address = self.lookup(symbol)?;
        // SAFETY: exports called through the bridge have the `TextFn`
        // signature by contract; the address is non-null.
        let func = unsafe { std::mem::transmute::<*mut c_void, TextFn>(address) };
        lock(&self.functions).insert(symbol.to_string(), func);
        Ok((func, true))
    }

    pub(crate) fn release_fn(&self, symbol: &str) -> Result<ReleaseFn, CallError> {
        if let Some(release) = lock(&self.releases).get(symbol) {
            return Ok(*release);
        }
        let address = self.lookup(symbol)?;
        // SAFETY: the release export has the `ReleaseFn` signature by
        // contract; the address is non-null.
        let release = unsafe { std::mem::transmute::<*mut c_void, ReleaseFn>(address) };
        lock(&self.releases).insert(symbol.to_string(), release);
        Ok(release)
    }

    fn lookup(&self, symbol: &str) -> Result<*mut c_void, CallError> {
        // SAFETY: the symbol is read as an untyped address and only cast once
        // it is known to be non-null.
        let address = unsafe { self.library.get::<*mut c_void>(symbol.as_bytes()) }
            .map(|sym| *sym)
            .map_err(|_| CallError::SymbolNotFound(symbol.to_string()))?;
        export_address(address)
            .map(|address| address.as_ptr())
            .ok_or_else(|| CallError::SymbolNotFound(symbol.to_string()))
    }

    /// Enter the call gate
    ///
    /// A serialized call excludes every other call into this image, including
    /// calls made through handles declared reentrant.
    pub(crate) fn enter(&self, thread_safety: ThreadSafety) -> CallGuard<'_> {
        match thread_safety {
            ThreadSafety::Serialized => CallGuard {
                _exclusive: Some(self.gate.write().unwrap_or_else(PoisonError::into_inner)),
                _shared: None,
            },
            ThreadSafety::Reentrant => CallGuard {
                _exclusive: None,
                _shared: Some(self.gate.read().unwrap_or_else(PoisonError::into_inner)),
            },
        }
    }
}

/// Share the live image registered under `key`, or map it with `open`
///
/// `open` runs only when no handle keeps an image for `key` alive, and never
/// concurrently for the same key. The flag is true when this call mapped it.
pub(crate) fn open_shared<E>(
    key: &Path,
    open: impl FnOnce() -> Result<Library, E>,
) -> Result<(Arc<Image>, bool), E> {
    let slot = {
        let mut images = lock(images());
        // Slots are only cloned under this lock, so a count of one means the
        // slot is idle and its lock is free.
        images.retain(|_, slot| Arc::strong_count(slot) > 1 || lock(slot).strong_count() > 0);
        Arc::clone(images.entry(key.to_path_buf()).or_default())
    };

    let mut current = lock(&slot);
    if let Some(image) = current.upgrade() {
        return Ok((image, false));
    }

    let image = Arc::new(Image::new(key.to_path_buf(), open()?));
    *current = Arc::downgrade(&image);
    Ok((image, true))
}
