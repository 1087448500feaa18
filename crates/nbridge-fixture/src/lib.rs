//! Native fixture library for nbridge.
//!
//! Every text export has the bridge signature
//! `int32_t f(const uint8_t *arg, size_t arg_len, uint8_t **out_ptr, size_t *out_len)`.
//! Result buffers are boxed byte slices handed out with `Box::into_raw` and
//! reclaimed by [`nbridge_text_free`]. Counters let tests observe the library
//! from outside: how often its static initializer ran, buffers still
//! outstanding, calls made and the highest number of calls that were ever in
//! flight at once.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

pub const STATUS_OK: i32 = 0;
/// A required pointer was null
pub const STATUS_NULL_POINTER: i32 = 1;
/// Returned by `always_fails`
pub const STATUS_REFUSED: i32 = 3;
/// Returned by `fail_with_buffer`
pub const STATUS_PARTIAL: i32 = 4;
/// The export panicked; the panic did not cross the boundary
pub const STATUS_PANICKED: i32 = -1;

static INITIALIZED: AtomicUsize = AtomicUsize::new(0);
static OUTSTANDING: AtomicIsize = AtomicIsize::new(0);
static CALLS: AtomicUsize = AtomicUsize::new(0);
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);
static MAX_IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

// ---------------------------------------------------------------------------
// Static initializer
// ---------------------------------------------------------------------------

/// Runs when the platform loader maps the library, before `dlopen` returns
extern "C" fn initialize() {
    INITIALIZED.fetch_add(1, Ordering::SeqCst);
}

#[used]
#[cfg_attr(
    any(target_os = "linux", target_os = "android", target_os = "freebsd"),
    link_section = ".init_array"
)]
#[cfg_attr(target_vendor = "apple", link_section = "__DATA,__mod_init_func")]
#[cfg_attr(target_os = "windows", link_section = ".CRT$XCU")]
static INITIALIZER: extern "C" fn() = initialize;

/// Borrow the caller's argument bytes
///
/// Null is accepted only for an empty argument.
unsafe fn argument<'a>(arg: *const u8, arg_len: usize) -> Option<&'a [u8]> {
    if arg_len == 0 {
        Some(&[])
    } else if arg.is_null() {
        None
    } else {
        Some(std::slice::from_raw_parts(arg, arg_len))
    }
}

/// Transfer `bytes` to the caller
unsafe fn hand_out(bytes: Vec<u8>, out_ptr: *mut *mut u8, out_len: *mut usize) {
    let boxed = bytes.into_boxed_slice();
    *out_len = boxed.len();
    *out_ptr = Box::into_raw(boxed) as *mut u8;
    OUTSTANDING.fetch_add(1, Ordering::SeqCst);
}

/// Common prologue: validate pointers, clear outputs, count the call and
/// keep panics on this side of the boundary
unsafe fn export(
    arg: *const u8,
    arg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
    body: impl FnOnce(&[u8], *mut *mut u8, *mut usize) -> i32,
) -> i32 {
    if out_ptr.is_null() || out_len.is_null() {
        return STATUS_NULL_POINTER;
    }
    *out_ptr = std::ptr::null_mut();
    *out_len = 0;

    let input = match argument(arg, arg_len) {
        Some(input) => input,
        None => return STATUS_NULL_POINTER,
    };
    CALLS.fetch_add(1, Ordering::SeqCst);

    catch_unwind(AssertUnwindSafe(|| body(input, out_ptr, out_len))).unwrap_or(STATUS_PANICKED)
}

// ---------------------------------------------------------------------------
// Text exports
// ---------------------------------------------------------------------------

/// "Hello " followed by the argument
#[no_mangle]
pub unsafe extern "C" fn hello(
    arg: *const u8,
    arg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    export(arg, arg_len, out_ptr, out_len, |input, out_ptr, out_len| {
        let mut greeting = b"Hello ".to_vec();
        greeting.extend_from_slice(input);
        hand_out(greeting, out_ptr, out_len);
        STATUS_OK
    })
}

/// The argument, unchanged
#[no_mangle]
pub unsafe extern "C" fn echo(
    arg: *const u8,
    arg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    export(arg, arg_len, out_ptr, out_len, |input, out_ptr, out_len| {
        hand_out(input.to_vec(), out_ptr, out_len);
        STATUS_OK
    })
}

/// Empty result as a null buffer
#[no_mangle]
pub unsafe extern "C" fn empty(
    arg: *const u8,
    arg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    export(arg, arg_len, out_ptr, out_len, |_, _, _| STATUS_OK)
}

/// Fails without producing a buffer
#[no_mangle]
pub unsafe extern "C" fn always_fails(
    arg: *const u8,
    arg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    export(arg, arg_len, out_ptr, out_len, |_, _, _| STATUS_REFUSED)
}

/// Fails after producing a buffer the caller still has to release
#[no_mangle]
pub unsafe extern "C" fn fail_with_buffer(
    arg: *const u8,
    arg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    export(arg, arg_len, out_ptr, out_len, |_, out_ptr, out_len| {
        hand_out(b"partial result".to_vec(), out_ptr, out_len);
        STATUS_PARTIAL
    })
}

/// Succeeds with bytes that are not UTF-8
#[no_mangle]
pub unsafe extern "C" fn invalid_utf8(
    arg: *const u8,
    arg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    export(arg, arg_len, out_ptr, out_len, |_, out_ptr, out_len| {
        hand_out(vec![b'o', b'k', 0xff, 0xfe], out_ptr, out_len);
        STATUS_OK
    })
}

/// Succeeds with a null buffer but a non-zero length
#[no_mangle]
pub unsafe extern "C" fn null_with_length(
    arg: *const u8,
    arg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    export(arg, arg_len, out_ptr, out_len, |_, _, out_len| {
        *out_len = 8;
        STATUS_OK
    })
}

/// Panics internally; reported as a status
#[no_mangle]
pub unsafe extern "C" fn panics(
    arg: *const u8,
    arg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    export(arg, arg_len, out_ptr, out_len, |_, _, _| {
        panic!("fixture panic");
    })
}

/// Echo that records how many calls overlap with it
#[no_mangle]
pub unsafe extern "C" fn exclusive(
    arg: *const u8,
    arg_len: usize,
    out_ptr: *mut *mut u8,
    out_len: *mut usize,
) -> i32 {
    export(arg, arg_len, out_ptr, out_len, |input, out_ptr, out_len| {
        let now = IN_FLIGHT.fetch_add(1, Ordering::SeqCst) + 1;
        MAX_IN_FLIGHT.fetch_max(now, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1));
        hand_out(input.to_vec(), out_ptr, out_len);
        IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
        STATUS_OK
    })
}

// ---------------------------------------------------------------------------
// Release exports
// ---------------------------------------------------------------------------

/// Release a buffer handed out by any text export
#[no_mangle]
pub unsafe extern "C" fn nbridge_text_free(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(ptr, len)));
    OUTSTANDING.fetch_sub(1, Ordering::SeqCst);
}

/// Same as [`nbridge_text_free`], under a library-specific name
#[no_mangle]
pub unsafe extern "C" fn fixture_release(ptr: *mut u8, len: usize) {
    nbridge_text_free(ptr, len)
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Times the static initializer ran in this mapping
#[no_mangle]
pub extern "C" fn nbridge_fixture_initializations() -> usize {
    INITIALIZED.load(Ordering::SeqCst)
}

/// Buffers handed out and not yet released
#[no_mangle]
pub extern "C" fn nbridge_fixture_outstanding() -> isize {
    OUTSTANDING.load(Ordering::SeqCst)
}

/// Text calls that reached an export body
#[no_mangle]
pub extern "C" fn nbridge_fixture_calls() -> usize {
    CALLS.load(Ordering::SeqCst)
}

/// Most `exclusive` calls ever in flight at once
#[no_mangle]
pub extern "C" fn nbridge_fixture_max_in_flight() -> usize {
    MAX_IN_FLIGHT.load(Ordering::SeqCst)
}

#[no_mangle]
pub extern "C" fn nbridge_fixture_reset_in_flight() {
    MAX_IN_FLIGHT.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    type TextFn = unsafe extern "C" fn(*const u8, usize, *mut *mut u8, *mut usize) -> i32;

    /// Call `func` and copy out its result, releasing the buffer
    fn call(func: TextFn, input: &[u8]) -> (i32, Option<Vec<u8>>, usize) {
        let mut ptr = std::ptr::null_mut();
        let mut len = 0;
        let status = unsafe { func(input.as_ptr(), input.len(), &mut ptr, &mut len) };
        let bytes = if ptr.is_null() {
            None
        } else {
            let bytes = unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec();
            unsafe { nbridge_text_free(ptr, len) };
            Some(bytes)
        };
        (status, bytes, len)
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_initializer_runs_once() {
        assert_eq!(nbridge_fixture_initializations(), 1);
    }

    #[test]
    fn test_hello() {
        let (status, bytes, _) = call(hello, b"World");
        assert_eq!(status, STATUS_OK);
        assert_eq!(bytes.as_deref(), Some(&b"Hello World"[..]));
    }

    #[test]
    fn test_empty_argument_may_be_null() {
        let mut ptr = std::ptr::null_mut();
        let mut len = 0;
        let status = unsafe { echo(std::ptr::null(), 0, &mut ptr, &mut len) };
        assert_eq!(status, STATUS_OK);
        assert_eq!(len, 0);
        unsafe { nbridge_text_free(ptr, len) };
    }

    #[test]
    fn test_null_argument_with_length_rejected() {
        let mut ptr = std::ptr::null_mut();
        let mut len = 0;
        let status = unsafe { echo(std::ptr::null(), 3, &mut ptr, &mut len) };
        assert_eq!(status, STATUS_NULL_POINTER);
        assert!(ptr.is_null());
    }

    #[test]
    fn test_null_outputs_rejected() {
        let status = unsafe { hello(b"x".as_ptr(), 1, std::ptr::null_mut(), std::ptr::null_mut()) };
        assert_eq!(status, STATUS_NULL_POINTER);
    }

    #[test]
    fn test_failure_modes() {
        assert_eq!(call(always_fails, b"").0, STATUS_REFUSED);
        assert_eq!(call(panics, b"").0, STATUS_PANICKED);

        let (status, bytes, _) = call(fail_with_buffer, b"");
        assert_eq!(status, STATUS_PARTIAL);
        assert!(bytes.is_some());

        let (status, bytes, len) = call(null_with_length, b"");
        assert_eq!(status, STATUS_OK);
        assert_eq!((bytes, len), (None, 8));
    }

    #[test]
    fn test_invalid_utf8_output() {
        let (_, bytes, _) = call(invalid_utf8, b"");
        assert!(std::str::from_utf8(&bytes.unwrap()).is_err());
    }
}
