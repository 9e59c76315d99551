use std::ffi::c_void;
use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::handle::{NativeHandle, ResourceHandle};
use crate::native::{self, SharedGlSyncToken};

unsafe fn delete_sync_token(ptr: *mut c_void) {
    // SAFETY: only installed as the deleter of handles that own this object.
    unsafe { native::mp_gl_sync_token_delete(ptr.cast()) }
}

/// A GPU fence. Waiting on it guarantees that the commands issued before it
/// have completed.
pub struct GlSyncPoint {
    handle: NativeHandle,
}

impl GlSyncPoint {
    /// # Safety
    /// `ptr` must be a live sync token that nothing else frees.
    pub(crate) unsafe fn from_owned(ptr: *mut SharedGlSyncToken) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        let handle = unsafe { NativeHandle::from_owned(ptr.cast(), "GlSyncPoint", delete_sync_token) }?;
        Ok(Self { handle })
    }

    fn ptr(&self) -> Result<*const SharedGlSyncToken> {
        Ok(self.handle.as_ptr()?.cast_const().cast())
    }

    /// Blocks the calling thread until the fence signals.
    pub fn wait(&self) -> Result<()> {
        // SAFETY: `ptr` fails instead of returning a disposed object.
        unsafe { native::mp_gl_sync_point_wait(self.ptr()?) }.check("mp_gl_sync_point_wait")
    }

    /// Blocks for at most `timeout`; returns whether the fence signaled.
    pub fn wait_for(&self, timeout: Duration) -> Result<bool> {
        let mut ready = false;
        // SAFETY: `ptr` fails instead of returning a disposed object.
        unsafe { native::mp_gl_sync_point_wait_for(self.ptr()?, timeout.as_millis() as u64, &mut ready) }
            .check("mp_gl_sync_point_wait_for")?;
        Ok(ready)
    }

    /// Makes the current context wait for the fence without blocking the CPU.
    pub fn wait_on_gpu(&self) -> Result<()> {
        // SAFETY: `ptr` fails instead of returning a disposed object.
        unsafe { native::mp_gl_sync_point_wait_on_gpu(self.ptr()?) }.check("mp_gl_sync_point_wait_on_gpu")
    }

    pub fn is_ready(&self) -> Result<bool> {
        // SAFETY: `ptr` fails instead of returning a disposed object.
        Ok(unsafe { native::mp_gl_sync_point_is_ready(self.ptr()?) })
    }
}

impl ResourceHandle for GlSyncPoint {
    fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut NativeHandle {
        &mut self.handle
    }
}

impl fmt::Debug for GlSyncPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlSyncPoint").field("ready", &self.is_ready().ok()).finish()
    }
}
