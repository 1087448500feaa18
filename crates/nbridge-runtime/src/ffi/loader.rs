//! Dynamic library loading
//!
//! Provides cross-platform dynamic library loading using `libloading`.
//! Handles platform-specific library naming conventions, search paths, the
//! one-time load guarantee and classification of loader failures.

use crate::ffi::abi;
use crate::ffi::handle::{lock, LibraryHandle};
use crate::ffi::image;
use crate::ffi::types::DEFAULT_RELEASE_SYMBOL;
use libloading::Library;
use nbridge_config::{Config, ThreadSafety};
use std::collections::HashMap;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;
use tracing::debug;

/// Library loading errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The name is a path or otherwise not a logical library name
    #[error("Invalid library name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// Library file not found in search paths or by the system loader
    #[error("Library '{name}' not found (searched {} path(s) and the system loader)", .searched.len())]
    NotFound { name: String, searched: Vec<PathBuf> },

    /// Library found but could not be initialized
    #[error("Library '{name}' failed to load: {reason}")]
    InitFailed {
        name: String,
        path: Option<PathBuf>,
        reason: String,
    },

    /// Library built for a different platform than this process
    #[error("Library '{name}' is incompatible with this process: expected {expected}, found {found}")]
    AbiMismatch {
        name: String,
        path: Option<PathBuf>,
        expected: String,
        found: String,
    },
}

impl LoadError {
    /// Name the load was requested for
    pub fn library(&self) -> &str {
        match self {
            LoadError::InvalidName { name, .. }
            | LoadError::NotFound { name, .. }
            | LoadError::InitFailed { name, .. }
            | LoadError::AbiMismatch { name, .. } => name,
        }
    }
}

/// Loader messages meaning the image was built for another platform
///
/// Only trusted when no header check vouched for the file. Messages that
/// merely say the file is not an object ("invalid ELF header", "Exec format
/// error") are left out: linker scripts and corrupt files produce them too.
const ABI_MARKERS: &[&str] = &[
    "wrong elf class",
    "elf file's phentsize not the expected size",
    "incompatible architecture",
    "wrong architecture",
    "not a valid win32 application",
    "os error 193",
];

/// Loader messages meaning some file could not be found
const MISSING_MARKERS: &[&str] = &[
    "cannot open shared object file",
    "no such file",
    "image not found",
    "could not be found",
    "os error 126",
];

/// Loader messages blaming a dependency rather than the requested file
const DEPENDENCY_MARKERS: &[&str] = &["library not loaded", "needed by"];

type Slot = Arc<Mutex<Option<LibraryHandle>>>;

static GLOBAL: OnceLock<LibraryLoader> = OnceLock::new();

/// Dynamic library loader with one-time loading per library name
///
/// # Safety
///
/// Loading a dynamic library runs its initializers in this process. Loaders
/// share mapped images, so they run once per file for as long as any handle
/// keeps it mapped, whichever loader asked; nothing makes them trustworthy.
pub struct LibraryLoader {
    /// Directories searched before the system loader, in order
    search_paths: Vec<PathBuf>,
    release_symbol: String,
    thread_safety: ThreadSafety,
    /// One slot per logical name; the slot lock serializes its first load
    slots: Mutex<HashMap<String, Slot>>,
    /// Names attached to an image by this loader
    loads: AtomicUsize,
}

impl LibraryLoader {
    /// Create a new library loader with default search paths
    pub fn new() -> Self {
        Self {
            search_paths: Self::default_search_paths(),
            release_symbol: DEFAULT_RELEASE_SYMBOL.to_string(),
            thread_safety: ThreadSafety::default(),
            slots: Mutex::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        }
    }

    /// Create a loader from merged configuration
    ///
    /// Configured search paths come first, followed by the defaults.
    pub fn from_config(config: &Config) -> Self {
        let mut loader = Self::new();
        let mut paths = config.search_paths();
        paths.append(&mut loader.search_paths);
        loader.search_paths = paths;
        loader.release_symbol = config.release_symbol().to_string();
        loader.thread_safety = config.thread_safety();
        loader
    }

    /// Process-wide loader, created on first use
    pub fn global() -> &'static LibraryLoader {
        GLOBAL.get_or_init(LibraryLoader::new)
    }

    /// Install `loader` as the process-wide loader
    ///
    /// Fails, handing the loader back, if the global loader already exists.
    pub fn install_global(loader: LibraryLoader) -> Result<&'static LibraryLoader, LibraryLoader> {
        GLOBAL.set(loader)?;
        Ok(Self::global())
    }

    /// Default search paths
    ///
    /// The directory of the running executable, then the current working
    /// directory. Platform locations are left to the system loader.
    fn default_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
        {
            paths.push(dir);
        }

        if let Ok(cwd) = std::env::current_dir() {
            if !paths.contains(&cwd) {
                paths.push(cwd);
            }
        }

        paths
    }

    /// Add a custom search path (prepended to search list)
    pub fn add_search_path(&mut self, path: PathBuf) {
        self.search_paths.insert(0, path);
    }

    /// Builder form of [`add_search_path`](Self::add_search_path)
    pub fn with_search_path(mut self, path: PathBuf) -> Self {
        self.add_search_path(path);
        self
    }

    pub fn with_thread_safety(mut self, thread_safety: ThreadSafety) -> Self {
        self.thread_safety = thread_safety;
        self
    }

    pub fn with_release_symbol(mut self, symbol: &str) -> Self {
        self.release_symbol = symbol.to_string();
        self
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Load a library by logical name
    ///
    /// The first successful call for a name attaches it to an image; later
    /// and concurrent calls wait for it and share the same handle. The image
    /// is shared with every other loader that resolves the same file, so its
    /// initializers run once per process. Failures are not cached.
    pub fn load(&self, name: &str) -> Result<LibraryHandle, LoadError> {
        validate_name(name)?;

        let cell = self.slot(name);
        let mut slot = lock(&cell);
        if let Some(handle) = slot.as_ref() {
            debug!(library = name, "reusing loaded library");
            return Ok(handle.clone());
        }

        let handle = match self.open(name) {
            Ok(handle) => handle,
            Err(e) => {
                drop(slot);
                self.forget_slot(name, &cell);
                return Err(e);
            }
        };
        self.loads.fetch_add(1, Ordering::SeqCst);
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Unload a library by logical name
    ///
    /// Outstanding handles are detached and refuse further calls; the image
    /// is unmapped when the last of them is dropped. Returns whether the
    /// library was loaded.
    pub fn unload(&self, name: &str) -> bool {
        let slot = match lock(&self.slots).get(name) {
            Some(slot) => Arc::clone(slot),
            None => return false,
        };
        let handle = lock(&slot).take();
        self.forget_slot(name, &slot);
        match handle {
            Some(handle) => {
                handle.detach();
                true
            }
            None => false,
        }
    }

    /// Check if a library is currently loaded under `name`
    pub fn is_loaded(&self, name: &str) -> bool {
        let slot = lock(&self.slots).get(name).cloned();
        slot.map(|slot| lock(&slot).is_some()).unwrap_or(false)
    }

    /// Get the number of loaded libraries
    pub fn loaded_count(&self) -> usize {
        let slots: Vec<Slot> = lock(&self.slots).values().cloned().collect();
        slots.iter().filter(|slot| lock(slot).is_some()).count()
    }

    /// Get the number of times this loader attached a name to an image
    ///
    /// Reloading after [`unload`](Self::unload) counts again; loads served
    /// from the slot do not.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn slot(&self, name: &str) -> Slot {
        let mut slots = lock(&self.slots);
        Arc::clone(slots.entry(name.to_string()).or_default())
    }

    /// Drop the slot for `name` if it is empty and nobody else holds it
    ///
    /// Slots are only cloned under the map lock, so the count cannot grow
    /// while it is held.
    fn forget_slot(&self, name: &str, cell: &Slot) {
        let mut slots = lock(&self.slots);
        let idle = Arc::strong_count(cell) == 2 && lock(cell).is_none();
        if idle && slots.get(name).is_some_and(|slot| Arc::ptr_eq(slot, cell)) {
            slots.remove(name);
        }
    }

    /// Number of names with a slot, loaded or being loaded
    #[cfg(test)]
    fn slot_count(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Resolve a logical name to a file in the search paths
    fn resolve_library_path(&self, name: &str) -> Option<PathBuf> {
        let file_names = candidate_file_names(name);
        self.search_paths.iter().find_map(|dir| {
            file_names
                .iter()
                .map(|file| dir.join(file))
                .find(|path| path.is_file())
        })
    }

    fn open(&self, name: &str) -> Result<LibraryHandle, LoadError> {
        let file_names = candidate_file_names(name);

        let (location, key, found) = match self.resolve_library_path(name) {
            Some(path) => {
                let verified = abi::preflight(&path).map_err(|mismatch| {
                    LoadError::AbiMismatch {
                        name: name.to_string(),
                        path: Some(path.clone()),
                        expected: mismatch.expected,
                        found: mismatch.found,
                    }
                })?;
                let key = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
                (path, key, Some(verified.is_some()))
            }
            None => {
                let bare = PathBuf::from(&file_names[0]);
                (bare.clone(), bare, None)
            }
        };

        let (image, mapped) = image::open_shared(&key, || {
            // SAFETY: loading runs the library's initializers; accepting that
            // is the point of calling `load`. The image registry ensures it
            // happens once per file while any handle keeps it mapped.
            unsafe { Library::new(&location) }.map_err(|e| {
                classify_failure(
                    name,
                    found.map(|_| location.clone()),
                    found == Some(true),
                    &file_names,
                    &self.search_paths,
                    &e.to_string(),
                )
            })
        })?;

        debug!(
            library = name,
            location = %location.display(),
            mapped,
            "attached native library"
        );
        Ok(LibraryHandle::new(
            name,
            location,
            image,
            &self.release_symbol,
            self.thread_safety,
        ))
    }
}

impl Default for LibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// File names a logical name may have on this platform, preferred first
///
/// - Linux: lib{name}.so, {name}.so
/// - macOS: lib{name}.dylib, {name}.dylib
/// - Windows: {name}.dll
pub fn candidate_file_names(name: &str) -> Vec<String> {
    let mut names = vec![format!("{}{}{}", DLL_PREFIX, name, DLL_SUFFIX)];
    if !DLL_PREFIX.is_empty() {
        names.push(format!("{}{}", name, DLL_SUFFIX));
    }
    names
}

fn validate_name(name: &str) -> Result<(), LoadError> {
    let reason = if name.is_empty() {
        "name is empty"
    } else if name.contains('\0') {
        "name contains a NUL byte"
    } else if name.contains('/') || name.contains('\\') {
        "expected a library name, not a path"
    } else if name == "." || name == ".." {
        "expected a library name, not a path"
    } else {
        return Ok(());
    };
    Err(LoadError::InvalidName {
        name: name.to_string(),
        reason,
    })
}

/// Map a platform loader message onto a `LoadError` kind
///
/// `verified` is true when the file's header was read and matched this
/// process; the loader's complaint is then about something else.
fn classify_failure(
    name: &str,
    path: Option<PathBuf>,
    verified: bool,
    file_names: &[String],
    searched: &[PathBuf],
    message: &str,
) -> LoadError {
    let lower = message.to_ascii_lowercase();

    if !verified && ABI_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return LoadError::AbiMismatch {
            name: name.to_string(),
            path,
            expected: abi::host_description(),
            found: message.to_string(),
        };
    }

    let missing = MISSING_MARKERS.iter().any(|marker| lower.contains(marker));
    if missing && path.is_none() && blames_requested_file(message, file_names) {
        return LoadError::NotFound {
            name: name.to_string(),
            searched: searched.to_vec(),
        };
    }

    LoadError::InitFailed {
        name: name.to_string(),
        path,
        reason: message.to_string(),
    }
}

/// Check if a "not found" message is about the requested file itself
fn blames_requested_file(message: &str, file_names: &[String]) -> bool {
    let lower = message.to_ascii_lowercase();
    if DEPENDENCY_MARKERS.iter().any(|marker| lower.contains(marker)) {
        return false;
    }
    // glibc and bionic: "<file>: cannot open shared object file: ..."
    if lower.contains("cannot open shared object file") {
        let subject = message.split(": ").next().unwrap_or_default();
        return file_names.iter().any(|file| subject.ends_with(file.as_str()));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::fs;
    use tempfile::TempDir;

    fn file_names() -> Vec<String> {
        vec!["libgreeter.so".to_string(), "greeter.so".to_string()]
    }

    #[test]
    fn test_default_search_paths_not_empty() {
        let paths = LibraryLoader::default_search_paths();
        assert!(!paths.is_empty());

        if let Ok(cwd) = std::env::current_dir() {
            assert!(paths.contains(&cwd));
        }
    }

    #[test]
    fn test_add_custom_search_path() {
        let mut loader = LibraryLoader::new();
        let custom_path = PathBuf::from("/custom/path");
        loader.add_search_path(custom_path.clone());

        // Custom path should be first
        assert_eq!(loader.search_paths()[0], custom_path);
    }

    #[test]
    fn test_candidate_file_names() {
        let names = candidate_file_names("greeter");
        assert_eq!(names[0], format!("{}greeter{}", DLL_PREFIX, DLL_SUFFIX));
        if cfg!(target_os = "windows") {
            assert_eq!(names, vec!["greeter.dll".to_string()]);
        } else {
            assert_eq!(names.len(), 2);
        }
    }

    #[rstest]
    #[case("")]
    #[case("../evil")]
    #[case("/usr/lib/libc.so")]
    #[case("dir\\lib")]
    #[case("nul\0byte")]
    #[case("..")]
    fn test_invalid_names(#[case] name: &str) {
        let loader = LibraryLoader::new();
        let result = loader.load(name);
        assert!(matches!(result, Err(LoadError::InvalidName { .. })));
    }

    #[test]
    fn test_library_not_found() {
        let loader = LibraryLoader::new();
        let result = loader.load("nbridge_nonexistent_library_xyz");
        assert!(
            matches!(result, Err(LoadError::NotFound { .. })),
            "unexpected: {:?}",
            result
        );
        assert_eq!(loader.load_count(), 0);
        assert_eq!(loader.loaded_count(), 0);
    }

    #[test]
    fn test_not_found_error_is_not_cached() {
        let loader = LibraryLoader::new();
        assert!(loader.load("nbridge_missing_twice").is_err());
        assert!(loader.load("nbridge_missing_twice").is_err());
        assert!(!loader.is_loaded("nbridge_missing_twice"));
    }

    #[test]
    fn test_wrong_architecture_file_is_abi_mismatch() {
        let dir = TempDir::new().unwrap();
        // A machine no supported host uses
        let header = abi::elf_header(64, abi::Endian::Little, 0x7777);
        let file = &candidate_file_names("foreign")[0];
        fs::write(dir.path().join(file), header).unwrap();

        let loader = LibraryLoader::new().with_search_path(dir.path().to_path_buf());
        let result = loader.load("foreign");
        match result {
            Err(LoadError::AbiMismatch { path, .. }) => {
                assert_eq!(path, Some(dir.path().join(file)));
            }
            other => panic!("expected AbiMismatch, got {:?}", other),
        }
        assert_eq!(loader.load_count(), 0);
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn test_broken_library_is_init_failed() {
        let Some(machine) = abi::host_elf_machine() else {
            return;
        };
        let bits = if cfg!(target_pointer_width = "64") { 64 } else { 32 };
        let endian = if cfg!(target_endian = "big") {
            abi::Endian::Big
        } else {
            abi::Endian::Little
        };

        // Correct header for this host, but no program headers behind it
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("libtruncated.so"),
            abi::elf_header(bits, endian, machine),
        )
        .unwrap();

        let loader = LibraryLoader::new().with_search_path(dir.path().to_path_buf());
        let result = loader.load("truncated");
        assert!(
            matches!(result, Err(LoadError::InitFailed { path: Some(_), .. })),
            "unexpected: {:?}",
            result
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_linker_script_is_init_failed() {
        let dir = TempDir::new().unwrap();
        let script = "/* GNU ld script */\nGROUP ( /lib/libc.so.6 )\n".repeat(8);
        fs::write(dir.path().join("libscript.so"), script).unwrap();

        let loader = LibraryLoader::new().with_search_path(dir.path().to_path_buf());
        match loader.load("script") {
            Err(LoadError::InitFailed { path, .. }) => {
                assert_eq!(path, Some(dir.path().join("libscript.so")));
            }
            other => panic!("expected InitFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_failed_loads_leave_no_slots() {
        let loader = LibraryLoader::new();
        assert!(loader.load("nbridge_missing_one").is_err());
        assert!(loader.load("nbridge_missing_two").is_err());
        assert!(loader.load("not/a/name").is_err());
        assert_eq!(loader.slot_count(), 0);
    }

    #[test]
    fn test_unload_unknown_library() {
        let loader = LibraryLoader::new();
        assert!(!loader.unload("never_loaded"));
    }

    #[test]
    fn test_classify_missing_requested_file() {
        let err = classify_failure(
            "greeter",
            None,
            false,
            &file_names(),
            &[],
            "libgreeter.so: cannot open shared object file: No such file or directory",
        );
        assert!(matches!(err, LoadError::NotFound { .. }));
    }

    #[test]
    fn test_classify_missing_dependency() {
        let err = classify_failure(
            "greeter",
            None,
            false,
            &file_names(),
            &[],
            "libcrypto.so.3: cannot open shared object file: No such file or directory",
        );
        assert!(matches!(err, LoadError::InitFailed { .. }));
    }

    #[test]
    fn test_classify_missing_dependency_of_found_file() {
        let err = classify_failure(
            "greeter",
            Some(PathBuf::from("/opt/app/libgreeter.so")),
            false,
            &file_names(),
            &[],
            "libgreeter.so: cannot open shared object file: No such file or directory",
        );
        assert!(matches!(err, LoadError::InitFailed { path: Some(_), .. }));
    }

    #[test]
    fn test_classify_macos_dependency() {
        let err = classify_failure(
            "greeter",
            None,
            false,
            &file_names(),
            &[],
            "dlopen(libgreeter.dylib, 0x0005): Library not loaded: @rpath/libdep.dylib (no such file)",
        );
        assert!(matches!(err, LoadError::InitFailed { .. }));
    }

    #[test]
    fn test_classify_musl_dependency() {
        let err = classify_failure(
            "greeter",
            None,
            false,
            &file_names(),
            &[],
            "Error loading shared library libdep.so: No such file or directory (needed by /lib/libgreeter.so)",
        );
        assert!(matches!(err, LoadError::InitFailed { .. }));
    }

    #[rstest]
    #[case("/lib/libgreeter.so: wrong ELF class: ELFCLASS32")]
    #[case("dlopen(libgreeter.dylib, 1): tried: 'libgreeter.dylib' (mach-o file, but is an incompatible architecture (have 'x86_64', need 'arm64'))")]
    #[case("LoadLibraryExW failed: %1 is not a valid Win32 application. (os error 193)")]
    fn test_classify_abi_mismatch(#[case] message: &str) {
        let err = classify_failure("greeter", None, false, &file_names(), &[], message);
        match err {
            LoadError::AbiMismatch {
                expected, found, ..
            } => {
                assert_eq!(expected, abi::host_description());
                assert_eq!(found, message);
            }
            other => panic!("expected AbiMismatch, got {:?}", other),
        }
    }

    #[rstest]
    #[case("/lib/libgreeter.so: invalid ELF header")]
    #[case("Error loading shared library /lib/libgreeter.so: Exec format error")]
    fn test_classify_not_an_object_file(#[case] message: &str) {
        let err = classify_failure("greeter", None, false, &file_names(), &[], message);
        assert!(matches!(err, LoadError::InitFailed { .. }), "{:?}", err);
    }

    #[test]
    fn test_classify_ignores_abi_markers_after_header_check() {
        let err = classify_failure(
            "greeter",
            Some(PathBuf::from("/opt/libgreeter.so")),
            true,
            &file_names(),
            &[],
            "/opt/libgreeter.so: wrong ELF class: ELFCLASS32",
        );
        assert!(matches!(err, LoadError::InitFailed { path: Some(_), .. }));
    }

    #[test]
    fn test_classify_undefined_symbol() {
        let err = classify_failure(
            "greeter",
            Some(PathBuf::from("/opt/libgreeter.so")),
            false,
            &file_names(),
            &[],
            "/opt/libgreeter.so: undefined symbol: missing_init",
        );
        assert!(matches!(err, LoadError::InitFailed { .. }));
    }

    #[test]
    fn test_load_error_display() {
        let err = LoadError::NotFound {
            name: "greeter".to_string(),
            searched: vec![PathBuf::from("/a"), PathBuf::from("/b")],
        };
        insta::assert_snapshot!(
            err.to_string(),
            @"Library 'greeter' not found (searched 2 path(s) and the system loader)"
        );
        assert_eq!(err.library(), "greeter");
    }
}
