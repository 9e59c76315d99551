use std::ffi::c_char;
use std::ptr;

use super::buffer::{alloc_cstring, mp_cstring_delete};
use super::{ReturnCode, deref, guard, read_str, write_out};

/// Native status object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeStatus {
    pub(crate) code: i32,
    pub(crate) message: String,
}

impl NativeStatus {
    pub(crate) fn ok() -> Self {
        Self { code: 0, message: String::new() }
    }

    pub(crate) fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub(crate) fn cancelled(message: impl Into<String>) -> Self {
        Self::new(1, message)
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(3, message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(5, message)
    }

    pub(crate) fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(9, message)
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(13, message)
    }

    pub(crate) fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub(crate) fn into_raw(self) -> *mut NativeStatus {
        Box::into_raw(Box::new(self))
    }
}

/// Status as returned by a managed callback.
///
/// `message` is null or a string allocated by the managed side with
/// [`alloc_cstring`](super::buffer); native frees it after reading.
#[repr(C)]
#[derive(Debug)]
pub struct StatusArgs {
    pub code: i32,
    pub message: *mut c_char,
}

impl StatusArgs {
    /// Converts into a native status, freeing the message.
    ///
    /// # Safety
    /// `message` must be null or owned by this value.
    pub(crate) unsafe fn into_native(self) -> NativeStatus {
        let message = if self.message.is_null() {
            String::new()
        } else {
            // SAFETY: non-null and NUL-terminated per the callback contract.
            let text = unsafe { read_str(self.message) }.unwrap_or_default();
            // SAFETY: ownership was transferred to native with the return value.
            unsafe { mp_cstring_delete(self.message) };
            text
        };
        NativeStatus { code: self.code, message }
    }
}

/// # Safety
/// `message` must be null or NUL-terminated; `out` must be valid for writes.
pub unsafe extern "C" fn mp_status_new(
    code: i32,
    message: *const c_char,
    out: *mut *mut NativeStatus,
) -> ReturnCode {
    guard("mp_status_new", || {
        // SAFETY: strings are NUL-terminated; out-pointers are valid for writes and null is rejected.
        let message =
            if message.is_null() { String::new() } else { unsafe { read_str(message) }? };
        unsafe { write_out(out, NativeStatus::new(code, message).into_raw()) }
    })
}

/// # Safety
/// `status` must be null or come from a native constructor and not be freed yet.
pub unsafe extern "C" fn mp_status_delete(status: *mut NativeStatus) {
    if !status.is_null() {
        // SAFETY: allocated with `Box::into_raw`.
        drop(unsafe { Box::from_raw(status) });
    }
}

/// # Safety
/// `status` must point to a live status.
pub unsafe extern "C" fn mp_status_ok(status: *const NativeStatus) -> bool {
    unsafe { deref(status, "status") }.map(NativeStatus::is_ok).unwrap_or(false)
}

/// # Safety
/// `status` must point to a live status.
pub unsafe extern "C" fn mp_status_raw_code(status: *const NativeStatus) -> i32 {
    unsafe { deref(status, "status") }.map(|s| s.code).unwrap_or(2)
}

/// Writes a newly allocated message string; free it with `mp_cstring_delete`.
///
/// # Safety
/// `status` must point to a live status; `out` must be valid for writes.
pub unsafe extern "C" fn mp_status_message(
    status: *const NativeStatus,
    out: *mut *mut c_char,
) -> ReturnCode {
    guard("mp_status_message", || {
        // SAFETY: the caller passes live objects or null.
        let status = unsafe { deref(status, "status") }?;
        let raw = alloc_cstring(&status.message);
        if raw.is_null() {
            return Err("failed to allocate message".to_string());
        }
        // SAFETY: out-pointers are valid for writes and null is rejected.
        unsafe { write_out(out, raw) }
    })
}

pub(crate) fn null_status() -> *mut NativeStatus {
    ptr::null_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    #[test]
    fn status_accessors() {
        let msg = CString::new("missing").unwrap();
        let mut status = null_status();
        let code = unsafe { mp_status_new(5, msg.as_ptr(), &mut status) };
        assert_eq!(code, ReturnCode::Success);
        assert!(!unsafe { mp_status_ok(status) });
        assert_eq!(unsafe { mp_status_raw_code(status) }, 5);
        unsafe { mp_status_delete(status) };
    }

    #[test]
    fn status_args_free_their_message() {
        let args = StatusArgs { code: 13, message: alloc_cstring("callback failed") };
        let status = unsafe { args.into_native() };
        assert_eq!(status, NativeStatus::internal("callback failed"));
    }
}
