//! Ownership of native objects.
//!
//! A [`NativeHandle`] wraps an opaque pointer and knows whether the managed side
//! owns it. Owned pointers are freed exactly once: either by an explicit
//! [`ResourceHandle::dispose`] or, as a safety net, when the handle is dropped.
//! After disposal every accessor fails with [`BridgeError::UseAfterFree`].

use std::ffi::c_void;
use std::fmt;
use std::ptr;

use tracing::trace;

use crate::error::{BridgeError, Result};
use crate::native::ReturnCode;

/// Frees the object behind an owned pointer.
pub type Deleter = unsafe fn(*mut c_void);

pub struct NativeHandle {
    ptr: *mut c_void,
    owns_resource: bool,
    disposed: bool,
    type_name: &'static str,
    deleter: Option<Deleter>,
}

// SAFETY: the native objects behind these pointers are internally synchronized,
// and mutation of the handle itself requires `&mut`.
unsafe impl Send for NativeHandle {}
unsafe impl Sync for NativeHandle {}

impl NativeHandle {
    /// Runs a native constructor and takes ownership of the object it writes.
    ///
    /// # Safety
    /// `ctor` must write a freshly allocated object (or null on failure) that
    /// `deleter` can free.
    pub unsafe fn create(
        type_name: &'static str,
        deleter: Deleter,
        ctor: impl FnOnce(*mut *mut c_void) -> ReturnCode,
    ) -> Result<Self> {
        let mut raw = ptr::null_mut();
        ctor(&mut raw).check(type_name)?;
        // SAFETY: a successful call wrote a fresh object that nothing else owns.
        unsafe { Self::from_owned(raw, type_name, deleter) }
    }

    /// Takes ownership of an existing pointer.
    ///
    /// # Safety
    /// `ptr` must be a live object that `deleter` can free and that nobody else frees.
    pub unsafe fn from_owned(ptr: *mut c_void, type_name: &'static str, deleter: Deleter) -> Result<Self> {
        if ptr.is_null() {
            return Err(BridgeError::invalid_argument(format!("native {type_name} pointer is null")));
        }
        trace!(type_name, address = ptr as usize, "taking ownership");
        Ok(Self { ptr, owns_resource: true, disposed: false, type_name, deleter: Some(deleter) })
    }

    /// Wraps a pointer owned by native. Disposing the handle never frees it.
    ///
    /// # Safety
    /// `ptr` must stay valid for as long as the handle is used.
    pub unsafe fn borrowed(ptr: *mut c_void, type_name: &'static str) -> Self {
        Self { ptr, owns_resource: false, disposed: false, type_name, deleter: None }
    }

    pub fn as_ptr(&self) -> Result<*mut c_void> {
        if self.disposed {
            return Err(BridgeError::use_after_free(self.type_name));
        }
        Ok(self.ptr)
    }

    /// Like [`as_ptr`](Self::as_ptr), for callers that treat a disposed handle as a bug.
    ///
    /// # Panics
    /// If the handle has been disposed.
    #[track_caller]
    pub fn ptr_or_panic(&self) -> *mut c_void {
        match self.as_ptr() {
            Ok(ptr) => ptr,
            Err(err) => panic!("{err}"),
        }
    }

    pub fn address(&self) -> usize {
        self.ptr as usize
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn owns_resource(&self) -> bool {
        self.owns_resource && !self.disposed && !self.ptr.is_null()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Frees the native object if owned. Safe to call any number of times.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        if self.owns_resource && !self.ptr.is_null() {
            if let Some(deleter) = self.deleter.take() {
                trace!(type_name = self.type_name, address = self.ptr as usize, "deleting native object");
                // SAFETY: we own the pointer and mark it disposed before freeing, so it is freed once.
                unsafe { deleter(self.ptr) };
            }
        }
        self.owns_resource = false;
    }

    /// Gives up ownership without freeing, for calls that move the object into native.
    ///
    /// The handle is disposed afterwards.
    pub fn release(&mut self) -> Result<*mut c_void> {
        let ptr = self.as_ptr()?;
        if !self.owns_resource {
            return Err(BridgeError::invalid_argument(format!(
                "{} is not owned and cannot be moved",
                self.type_name
            )));
        }
        self.owns_resource = false;
        self.disposed = true;
        self.deleter = None;
        Ok(ptr)
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeHandle")
            .field("type_name", &self.type_name)
            .field("address", &format_args!("{:#x}", self.ptr as usize))
            .field("owns_resource", &self.owns_resource)
            .field("disposed", &self.disposed)
            .finish()
    }
}

/// Implemented by every wrapper around a native object.
pub trait ResourceHandle {
    fn handle(&self) -> &NativeHandle;

    fn handle_mut(&mut self) -> &mut NativeHandle;

    fn dispose(&mut self) {
        self.handle_mut().dispose();
    }

    fn is_disposed(&self) -> bool {
        self.handle().is_disposed()
    }

    fn owns_resource(&self) -> bool {
        self.handle().owns_resource()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    unsafe fn delete_counter(ptr: *mut c_void) {
        let counter = unsafe { Box::from_raw(ptr.cast::<Arc<AtomicUsize>>()) };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn owned(counter: &Arc<AtomicUsize>) -> NativeHandle {
        let raw = Box::into_raw(Box::new(Arc::clone(counter))).cast::<c_void>();
        unsafe { NativeHandle::from_owned(raw, "Counter", delete_counter) }.unwrap()
    }

    #[test]
    fn dispose_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handle = owned(&counter);
        assert!(handle.owns_resource());
        handle.dispose();
        handle.dispose();
        drop(handle);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_frees_undisposed_handles() {
        let counter = Arc::new(AtomicUsize::new(0));
        drop(owned(&counter));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn access_after_dispose_fails() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handle = owned(&counter);
        handle.dispose();
        assert!(handle.is_disposed());
        assert!(!handle.owns_resource());
        assert!(matches!(handle.as_ptr(), Err(BridgeError::UseAfterFree { type_name: "Counter" })));
    }

    #[test]
    #[should_panic(expected = "Counter has already been disposed")]
    fn ptr_or_panic_fails_fast_after_dispose() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handle = owned(&counter);
        assert!(!handle.ptr_or_panic().is_null());
        handle.dispose();
        handle.ptr_or_panic();
    }

    #[test]
    fn release_moves_ownership_out() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handle = owned(&counter);
        let raw = handle.release().unwrap();
        drop(handle);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        unsafe { delete_counter(raw) };
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn borrowed_handles_never_free() {
        let mut value = 5u32;
        let mut handle = unsafe { NativeHandle::borrowed((&mut value as *mut u32).cast(), "u32") };
        assert!(!handle.owns_resource());
        assert!(handle.release().is_err());
        handle.dispose();
        assert_eq!(value, 5);
    }

    #[test]
    fn null_pointers_are_rejected() {
        let result = unsafe { NativeHandle::from_owned(ptr::null_mut(), "Null", delete_counter) };
        assert!(matches!(result, Err(BridgeError::InvalidArgument { .. })));
    }
}
