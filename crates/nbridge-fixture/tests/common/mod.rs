//! Shared helpers for tests that load the fixture as a real native library
//!
//! The fixture's cdylib is built alongside the test binary. Tests load it by
//! logical name from the directory that holds it, and read its counters
//! through the same mapped image the bridge uses.

#![allow(dead_code)]

use libloading::Library;
use nbridge_runtime::LibraryLoader;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tempfile::TempDir;

pub const FIXTURE: &str = "nbridge_fixture";

struct Located {
    dir: PathBuf,
    // Keeps a renamed copy alive for the whole test run
    _copy: Option<TempDir>,
}

static LOCATED: OnceLock<Located> = OnceLock::new();

/// File name the loader looks for first
pub fn fixture_file_name() -> String {
    format!("{}{}{}", DLL_PREFIX, FIXTURE, DLL_SUFFIX)
}

/// Directory holding the fixture under its plain platform file name
pub fn fixture_dir() -> &'static Path {
    &LOCATED.get_or_init(locate).dir
}

pub fn fixture_path() -> PathBuf {
    fixture_dir().join(fixture_file_name())
}

fn locate() -> Located {
    let exe = std::env::current_exe().expect("test executable path");
    let deps = exe.parent().expect("test executable directory").to_path_buf();
    let file = fixture_file_name();

    for dir in [Some(deps.as_path()), deps.parent()].into_iter().flatten() {
        if dir.join(&file).is_file() {
            return Located {
                dir: dir.to_path_buf(),
                _copy: None,
            };
        }
    }

    // Only a hashed artifact exists (lib<name>-<hash>.so); copy it under the
    // plain name.
    let hashed = fs::read_dir(&deps)
        .expect("read target directory")
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map(|name| {
                    name.starts_with(&format!("{}{}-", DLL_PREFIX, FIXTURE))
                        && name.ends_with(DLL_SUFFIX)
                })
                .unwrap_or(false)
        })
        .unwrap_or_else(|| panic!("{} was not built in {}", file, deps.display()));

    let copy = TempDir::new().expect("temp dir");
    fs::copy(&hashed, copy.path().join(&file)).expect("copy fixture");
    Located {
        dir: copy.path().to_path_buf(),
        _copy: Some(copy),
    }
}

/// Fresh loader that searches the fixture directory first
pub fn loader() -> LibraryLoader {
    LibraryLoader::new().with_search_path(fixture_dir().to_path_buf())
}

/// Call a counter export of the mapped fixture image
fn counter<T>(symbol: &[u8]) -> T {
    unsafe {
        let library = Library::new(fixture_path()).expect("open fixture");
        let read = library
            .get::<unsafe extern "C" fn() -> T>(symbol)
            .expect("fixture counter export");
        read()
    }
}

/// Runs of the fixture's static initializer in the current mapping
pub fn initializations() -> usize {
    counter(b"nbridge_fixture_initializations")
}

/// Result buffers handed out and not yet released
pub fn outstanding() -> isize {
    counter(b"nbridge_fixture_outstanding")
}

/// Calls that reached a fixture export body
pub fn calls() -> usize {
    counter(b"nbridge_fixture_calls")
}

/// Most `exclusive` calls in flight at once since the last reset
pub fn max_in_flight() -> usize {
    counter(b"nbridge_fixture_max_in_flight")
}

pub fn reset_in_flight() {
    counter::<()>(b"nbridge_fixture_reset_in_flight")
}
