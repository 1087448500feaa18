// Loader behavior that needs no real native library.

use nbridge_runtime::{LibraryLoader, LoadError, ThreadSafety};
use pretty_assertions::assert_eq;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::fs;
use tempfile::TempDir;

/// ELF header for a 64-bit little-endian shared object on `machine`
fn foreign_elf(machine: u16) -> Vec<u8> {
    let mut header = vec![0u8; 64];
    header[..4].copy_from_slice(b"\x7fELF");
    header[4] = 2;
    header[5] = 1;
    header[6] = 1;
    header[16] = 3;
    header[18..20].copy_from_slice(&machine.to_le_bytes());
    header
}

#[test]
fn test_missing_library_lists_search_paths() {
    let dir = TempDir::new().unwrap();
    let loader = LibraryLoader::new().with_search_path(dir.path().to_path_buf());

    match loader.load("nbridge_absent") {
        Err(LoadError::NotFound { name, searched }) => {
            assert_eq!(name, "nbridge_absent");
            assert_eq!(searched[0], dir.path());
        }
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[test]
fn test_foreign_architecture_is_rejected_before_loading() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join(format!("{}alien{}", DLL_PREFIX, DLL_SUFFIX));
    // EM_SPARCV9: not a host any supported target runs on
    fs::write(&file, foreign_elf(43)).unwrap();

    let loader = LibraryLoader::new().with_search_path(dir.path().to_path_buf());
    let err = loader.load("alien").unwrap_err();
    match &err {
        LoadError::AbiMismatch { found, path, .. } => {
            assert_eq!(found, "elf64-le machine 0x2b");
            assert_eq!(path.as_deref(), Some(file.as_path()));
        }
        other => panic!("expected AbiMismatch, got {:?}", other),
    }
    assert_eq!(err.library(), "alien");
    assert_eq!(loader.loaded_count(), 0);
    assert_eq!(loader.load_count(), 0);
}

#[test]
fn test_builder_configuration() {
    let loader = LibraryLoader::new()
        .with_search_path("/first".into())
        .with_search_path("/second".into())
        .with_thread_safety(ThreadSafety::Reentrant)
        .with_release_symbol("my_free");

    assert_eq!(loader.search_paths()[0], std::path::Path::new("/second"));
    assert_eq!(loader.search_paths()[1], std::path::Path::new("/first"));
}

#[test]
fn test_path_instead_of_name() {
    let loader = LibraryLoader::new();
    let err = loader.load("./libgreeter.so").unwrap_err();
    assert!(matches!(err, LoadError::InvalidName { .. }));
    assert!(err.to_string().contains("not a path"));
}
