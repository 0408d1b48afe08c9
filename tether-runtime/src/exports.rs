//! # Native Exports
//!
//! C-compatible entry points for native code holding handle words.
//!
//! ## Design
//!
//! Native code has no way to name a particular [`HandleBridge`], so the
//! exports operate on one process-wide bridge installed with
//! [`install_bridge`]. Every export returns a status code from
//! [`codes`](crate::error::codes) (or a sentinel for functions returning a
//! word) and records it for [`tether_last_error`] on the calling thread.
//!
//! ## Usage
//!
//! Build as a cdylib or staticlib:
//! ```toml
//! [lib]
//! crate-type = ["cdylib", "staticlib", "rlib"]
//! ```
//!
//! Then link native code with `-ltether_runtime` and declare:
//!
//! ```c
//! int      tether_is_handle(uint64_t word);
//! int      tether_release_handle(uint64_t word);
//! int      tether_deref_load(uint64_t word, void *out, size_t width);
//! int      tether_deref_store(uint64_t word, const void *src, size_t width);
//! uint64_t tether_handle_offset(uint64_t word, int64_t delta);
//! int      tether_last_error(void);
//! ```

use std::cell::Cell;
use std::ffi::{c_int, c_void};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::debug;

use crate::bridge::HandleBridge;
use crate::deref::DerefAccess;
use crate::error::{codes, HandleResult};
use crate::runtime::ManagedRuntime;
use crate::tag::HandleWord;

/// The bridge operations native code can reach, with the runtime type
/// erased.
pub trait NativeSurface: Send + Sync {
    /// See [`HandleBridge::is_handle`].
    fn is_handle(&self, word: HandleWord) -> bool;
    /// See [`HandleBridge::release`].
    fn release(&self, word: HandleWord) -> HandleResult<()>;
    /// Read `width` bytes at the word's offset.
    fn load(&self, word: HandleWord, width: usize) -> HandleResult<Vec<u8>>;
    /// Write `bytes` at the word's offset.
    fn store(&self, word: HandleWord, bytes: &[u8]) -> HandleResult<()>;
    /// See [`HandleBridge::offset_by`].
    fn offset_by(&self, word: HandleWord, delta: i64) -> HandleResult<HandleWord>;
}

impl<R: ManagedRuntime> NativeSurface for HandleBridge<R> {
    fn is_handle(&self, word: HandleWord) -> bool {
        HandleBridge::is_handle(self, word)
    }

    fn release(&self, word: HandleWord) -> HandleResult<()> {
        HandleBridge::release(self, word)
    }

    fn load(&self, word: HandleWord, width: usize) -> HandleResult<Vec<u8>> {
        self.read(word, 0, width)
    }

    fn store(&self, word: HandleWord, bytes: &[u8]) -> HandleResult<()> {
        self.write(word, 0, bytes)
    }

    fn offset_by(&self, word: HandleWord, delta: i64) -> HandleResult<HandleWord> {
        HandleBridge::offset_by(self, word, delta)
    }
}

// ============================================================================
// Bridge Installation
// ============================================================================

type Installed = RwLock<Option<Arc<dyn NativeSurface>>>;

static INSTALLED: OnceLock<Installed> = OnceLock::new();

fn installed() -> &'static Installed {
    INSTALLED.get_or_init(|| RwLock::new(None))
}

/// Make `surface` the bridge the native exports operate on.
///
/// Returns the previously installed bridge, if any.
pub fn install_bridge(surface: Arc<dyn NativeSurface>) -> Option<Arc<dyn NativeSurface>> {
    debug!("installing native bridge");
    installed().write().replace(surface)
}

/// Remove the installed bridge. Exports fail with `NO_BRIDGE` afterwards.
pub fn uninstall_bridge() -> Option<Arc<dyn NativeSurface>> {
    installed().write().take()
}

/// The installed bridge, if any.
pub fn current_bridge() -> Option<Arc<dyn NativeSurface>> {
    installed().read().clone()
}

thread_local! {
    static LAST_ERROR: Cell<c_int> = const { Cell::new(codes::OK) };
}

fn set_last_error(code: c_int) {
    LAST_ERROR.with(|last| last.set(code));
}

/// Run `f` against the installed bridge and record the outcome.
fn with_bridge<T>(f: impl FnOnce(&dyn NativeSurface) -> HandleResult<T>) -> Result<T, c_int> {
    // The install lock is not held across `f`.
    let Some(surface) = current_bridge() else {
        set_last_error(codes::NO_BRIDGE);
        return Err(codes::NO_BRIDGE);
    };
    match f(&*surface) {
        Ok(value) => {
            set_last_error(codes::OK);
            Ok(value)
        }
        Err(err) => {
            let code = err.code();
            set_last_error(code);
            Err(code)
        }
    }
}

fn status(result: Result<(), c_int>) -> c_int {
    match result {
        Ok(()) => codes::OK,
        Err(code) => code,
    }
}

// ============================================================================
// Handle Lifecycle
// ============================================================================

/// Check whether a word is a live handle.
///
/// Returns 1 for a live handle and 0 otherwise, including when no bridge is
/// installed.
#[no_mangle]
pub extern "C" fn tether_is_handle(word: u64) -> c_int {
    match with_bridge(|bridge| Ok(bridge.is_handle(HandleWord::from_raw(word)))) {
        Ok(true) => 1,
        _ => 0,
    }
}

/// Release one reference to a handle.
///
/// Returns 0 on success or a negative error code.
#[no_mangle]
pub extern "C" fn tether_release_handle(word: u64) -> c_int {
    status(with_bridge(|bridge| bridge.release(HandleWord::from_raw(word))))
}

// ============================================================================
// Deref Access
// ============================================================================

/// Copy `width` bytes at the word's offset into `out`.
///
/// Returns 0 on success or a negative error code; `out` is untouched on
/// failure.
///
/// # Safety
/// `out` must be valid for `width` bytes of writes.
#[no_mangle]
pub unsafe extern "C" fn tether_deref_load(word: u64, out: *mut c_void, width: usize) -> c_int {
    if out.is_null() {
        set_last_error(codes::NULL_POINTER);
        return codes::NULL_POINTER;
    }
    status(with_bridge(|bridge| {
        let bytes = bridge.load(HandleWord::from_raw(word), width)?;
        // SAFETY: the caller guarantees `out` is writable for `width` bytes,
        // and a successful load returns exactly `width` bytes.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), out.cast::<u8>(), bytes.len()) };
        Ok(())
    }))
}

/// Copy `width` bytes from `src` into the object at the word's offset.
///
/// Returns 0 on success or a negative error code.
///
/// # Safety
/// `src` must be valid for `width` bytes of reads.
#[no_mangle]
pub unsafe extern "C" fn tether_deref_store(word: u64, src: *const c_void, width: usize) -> c_int {
    if src.is_null() {
        set_last_error(codes::NULL_POINTER);
        return codes::NULL_POINTER;
    }
    // SAFETY: `src` is non-null and the caller guarantees it is readable for
    // `width` bytes.
    let bytes = unsafe { std::slice::from_raw_parts(src.cast::<u8>(), width) };
    status(with_bridge(|bridge| bridge.store(HandleWord::from_raw(word), bytes)))
}

/// Pointer arithmetic on a deref handle.
///
/// Returns the moved word, or 0 on failure (see [`tether_last_error`]).
#[no_mangle]
pub extern "C" fn tether_handle_offset(word: u64, delta: i64) -> u64 {
    with_bridge(|bridge| bridge.offset_by(HandleWord::from_raw(word), delta))
        .map(HandleWord::raw)
        .unwrap_or(0)
}

/// Status of the last export called on this thread.
#[no_mangle]
pub extern "C" fn tether_last_error() -> c_int {
    LAST_ERROR.with(|last| last.get())
}
