//! Status objects reported by native operations.

use std::ffi::c_void;
use std::fmt;

use crate::error::{BridgeError, Result};
use crate::handle::{NativeHandle, ResourceHandle};
use crate::marshal;
use crate::native::{self, NativeStatus};

pub use crate::native::StatusArgs;

/// Canonical status codes.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl StatusCode {
    /// Maps a raw code; anything out of range becomes [`StatusCode::Unknown`].
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::Cancelled,
            3 => StatusCode::InvalidArgument,
            4 => StatusCode::DeadlineExceeded,
            5 => StatusCode::NotFound,
            6 => StatusCode::AlreadyExists,
            7 => StatusCode::PermissionDenied,
            8 => StatusCode::ResourceExhausted,
            9 => StatusCode::FailedPrecondition,
            10 => StatusCode::Aborted,
            11 => StatusCode::OutOfRange,
            12 => StatusCode::Unimplemented,
            13 => StatusCode::Internal,
            14 => StatusCode::Unavailable,
            15 => StatusCode::DataLoss,
            16 => StatusCode::Unauthenticated,
            _ => StatusCode::Unknown,
        }
    }
}

unsafe fn delete_status(ptr: *mut c_void) {
    // SAFETY: only installed as the deleter of handles that own this object.
    unsafe { native::mp_status_delete(ptr.cast()) }
}

/// An owned native status object.
pub struct Status {
    handle: NativeHandle,
}

impl Status {
    /// Creates a new status on the native side.
    pub fn build(code: StatusCode, message: &str) -> Result<Self> {
        let message = marshal::to_cstring(message)?;
        // SAFETY: the constructor writes a fresh status that we take ownership of.
        unsafe {
            let handle = NativeHandle::create("Status", delete_status, |out| {
                native::mp_status_new(code as i32, message.as_ptr(), out.cast())
            })?;
            Ok(Self { handle })
        }
    }

    pub fn ok() -> Result<Self> {
        Self::build(StatusCode::Ok, "")
    }

    pub fn failed_precondition(message: &str) -> Result<Self> {
        Self::build(StatusCode::FailedPrecondition, message)
    }

    /// Takes ownership of a status returned through an out-pointer.
    ///
    /// # Safety
    /// `ptr` must be a live native status that nothing else frees.
    pub(crate) unsafe fn from_owned(ptr: *mut NativeStatus) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        let handle = unsafe { NativeHandle::from_owned(ptr.cast(), "Status", delete_status) }?;
        Ok(Self { handle })
    }

    fn ptr(&self) -> Result<*const NativeStatus> {
        Ok(self.handle.as_ptr()?.cast_const().cast())
    }

    pub fn is_ok(&self) -> Result<bool> {
        // SAFETY: the pointer is live until the handle is disposed.
        Ok(unsafe { native::mp_status_ok(self.ptr()?) })
    }

    pub fn raw_code(&self) -> Result<i32> {
        // SAFETY: the pointer is live until the handle is disposed.
        Ok(unsafe { native::mp_status_raw_code(self.ptr()?) })
    }

    pub fn code(&self) -> Result<StatusCode> {
        self.raw_code().map(StatusCode::from_raw)
    }

    pub fn message(&self) -> Result<String> {
        let ptr = self.ptr()?;
        // SAFETY: the getter allocates a string that `take_cstring` frees.
        unsafe { marshal::take_cstring("mp_status_message", |out| native::mp_status_message(ptr, out)) }
    }

    /// Converts a non-OK status into [`BridgeError::BadStatus`].
    pub fn to_result(&self) -> Result<()> {
        if self.is_ok()? {
            return Ok(());
        }
        Err(BridgeError::bad_status(self.code()?, self.message()?))
    }

    /// Runs a native pump that reports a status, disposing the status afterwards.
    ///
    /// # Safety
    /// `call` must write either null or a fresh status through its argument.
    pub(crate) unsafe fn check(
        operation: &'static str,
        call: impl FnOnce(*mut *mut NativeStatus) -> native::ReturnCode,
    ) -> Result<()> {
        let mut raw = std::ptr::null_mut();
        call(&mut raw).check(operation)?;
        // SAFETY: a successful call wrote a fresh object that nothing else owns.
        let mut status = unsafe { Self::from_owned(raw) }?;
        let result = status.to_result();
        status.dispose();
        result
    }
}

impl ResourceHandle for Status {
    fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut NativeHandle {
        &mut self.handle
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code(), self.message()) {
            (Ok(code), Ok(message)) => write!(f, "Status({code:?}: {message})"),
            _ => write!(f, "Status(<disposed>)"),
        }
    }
}

impl StatusArgs {
    pub fn ok() -> Self {
        Self { code: StatusCode::Ok as i32, message: std::ptr::null_mut() }
    }

    /// Builds a non-OK status. The message is freed by native after it reads it.
    pub fn error(code: StatusCode, message: &str) -> Self {
        Self { code: code as i32, message: native::alloc_cstring(message) }
    }

    pub fn not_found(message: &str) -> Self {
        Self::error(StatusCode::NotFound, message)
    }

    pub fn invalid_argument(message: &str) -> Self {
        Self::error(StatusCode::InvalidArgument, message)
    }

    pub fn internal(message: &str) -> Self {
        Self::error(StatusCode::Internal, message)
    }
}
