//! In-process reference implementation of the native ABI.
//!
//! Everything in this module speaks the C calling convention and only exchanges
//! opaque pointers, plain scalars and `#[repr(C)]` buffers with the safe layer.
//! The functions fall into four families:
//!
//! - constructors and destructors (`*_new`, `*_delete`), returning a [`ReturnCode`]
//!   and writing the created object through an out-pointer
//! - getters that copy a value out through an out-pointer
//! - pumps that drive a graph (`mp_graph_start_run`, `mp_graph_wait_until_done`, ...)
//!   and report a status object
//! - callback registration (`mp_graph_observe_output_stream`,
//!   `mp_resource_set_provider`, GPU buffer deletion callbacks)
//!
//! Nothing here panics across the boundary: every entry point runs inside
//! [`guard`], which maps failures to [`ReturnCode::StandardError`] and panics to
//! [`ReturnCode::UnknownError`].
//!
//! Application code should use the safe wrappers ([`crate::Packet`],
//! [`crate::CalculatorGraph`], ...). The raw functions are public so that a host
//! embedding the runtime through another FFI layer sees the same surface.

use std::ffi::{CStr, c_char};
use std::panic::{self, AssertUnwindSafe};

use tracing::error;

use crate::error::{BridgeError, Result};

mod buffer;
mod calculator;
mod gl;
mod graph;
mod image_frame;
mod packet;
mod packet_map;
mod resource;
mod status;

pub use buffer::*;
pub use gl::*;
pub use graph::*;
pub use image_frame::*;
pub use packet::*;
pub use packet_map::*;
pub use resource::*;
pub use status::*;

/// Outcome of a native call, independent of any status object it produced.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnCode {
    Success = 0,
    StandardError = 1,
    UnknownError = 70,
    Unset = 128,
    Aborted = 134,
}

impl ReturnCode {
    pub fn is_success(self) -> bool {
        self == ReturnCode::Success
    }

    /// Converts a failed call into [`BridgeError::NativeCall`].
    pub fn check(self, operation: &'static str) -> Result<()> {
        if self.is_success() { Ok(()) } else { Err(BridgeError::native_call(operation, self)) }
    }
}

/// Runs a native entry point, turning errors and panics into return codes.
pub(crate) fn guard<F>(operation: &'static str, f: F) -> ReturnCode
where
    F: FnOnce() -> std::result::Result<(), String>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => ReturnCode::Success,
        Ok(Err(message)) => {
            error!(operation, %message, "native call failed");
            ReturnCode::StandardError
        }
        Err(_) => {
            error!(operation, "native call panicked");
            ReturnCode::UnknownError
        }
    }
}

/// Borrows a native object behind an opaque pointer.
pub(crate) unsafe fn deref<'a, T>(ptr: *const T, what: &str) -> std::result::Result<&'a T, String> {
    // SAFETY: caller guarantees `ptr` is null or points to a live `T`.
    unsafe { ptr.as_ref() }.ok_or_else(|| format!("{what} is null"))
}

/// Mutably borrows a native object behind an opaque pointer.
pub(crate) unsafe fn deref_mut<'a, T>(
    ptr: *mut T,
    what: &str,
) -> std::result::Result<&'a mut T, String> {
    // SAFETY: caller guarantees `ptr` is null or points to a live `T` with no other borrows.
    unsafe { ptr.as_mut() }.ok_or_else(|| format!("{what} is null"))
}

/// Writes a value through an out-pointer.
pub(crate) unsafe fn write_out<T>(out: *mut T, value: T) -> std::result::Result<(), String> {
    if out.is_null() {
        return Err("output pointer is null".to_string());
    }
    // SAFETY: `out` is non-null and the caller guarantees it is valid for writes.
    unsafe { out.write(value) };
    Ok(())
}

/// Reads a NUL-terminated UTF-8 string passed from the managed side.
pub(crate) unsafe fn read_str(ptr: *const c_char) -> std::result::Result<String, String> {
    if ptr.is_null() {
        return Err("string pointer is null".to_string());
    }
    // SAFETY: caller guarantees a NUL-terminated string.
    let raw = unsafe { CStr::from_ptr(ptr) };
    raw.to_str().map(str::to_owned).map_err(|e| format!("string is not UTF-8: {e}"))
}
