use std::ffi::c_void;
use std::fmt;

use tracing::debug;

use super::GlSyncPoint;
use crate::error::Result;
use crate::handle::{NativeHandle, ResourceHandle};
use crate::native::{self, SharedGlContext};

unsafe fn delete_shared_context(ptr: *mut c_void) {
    // SAFETY: only installed as the deleter of owned context references.
    unsafe { native::mp_shared_gl_context_delete(ptr.cast()) }
}

/// A shared reference to a native GL context.
///
/// Each `GlContext` owns one reference; the context itself lives until the
/// last reference on either side is gone.
pub struct GlContext {
    handle: NativeHandle,
}

impl GlContext {
    pub fn create() -> Result<Self> {
        // SAFETY: the constructor writes a fresh shared reference.
        let handle = unsafe {
            NativeHandle::create("GlContext", delete_shared_context, |out| {
                native::mp_gl_context_create(out.cast())
            })
        }?;
        let context = Self { handle };
        debug!(context_id = context.id()?, "GL context created");
        Ok(context)
    }

    /// The context current on the calling thread, if any.
    pub fn current() -> Result<Option<Self>> {
        let mut raw: *mut SharedGlContext = std::ptr::null_mut();
        // SAFETY: `raw` is valid for writes.
        unsafe { native::mp_gl_context_get_current(&mut raw) }.check("mp_gl_context_get_current")?;
        if raw.is_null() {
            return Ok(None);
        }
        // SAFETY: the getter wrote a new shared reference we now own.
        let handle = unsafe { NativeHandle::from_owned(raw.cast(), "GlContext", delete_shared_context) }?;
        Ok(Some(Self { handle }))
    }

    /// Another reference to the same context.
    pub fn try_clone(&self) -> Result<Self> {
        let ptr = self.shared_ptr()?;
        // SAFETY: `ptr` is live; the copy is a new reference we own.
        let handle = unsafe {
            NativeHandle::create("GlContext", delete_shared_context, |out| {
                native::mp_shared_gl_context_copy(ptr, out.cast())
            })
        }?;
        Ok(Self { handle })
    }

    pub(crate) fn shared_ptr(&self) -> Result<*const SharedGlContext> {
        Ok(self.handle.as_ptr()?.cast_const().cast())
    }

    pub fn make_current(&self) -> Result<()> {
        // SAFETY: `shared_ptr` only returns live references.
        unsafe { native::mp_gl_context_make_current(self.shared_ptr()?) }.check("mp_gl_context_make_current")
    }

    pub fn clear_current() {
        native::mp_gl_context_clear_current();
    }

    pub fn is_current(&self) -> Result<bool> {
        // SAFETY: `shared_ptr` only returns live references.
        Ok(unsafe { native::mp_gl_context_is_current(self.shared_ptr()?) })
    }

    pub fn id(&self) -> Result<u64> {
        // SAFETY: `shared_ptr` only returns live references.
        Ok(unsafe { native::mp_gl_context_id(self.shared_ptr()?) })
    }

    pub fn gl_major_version(&self) -> Result<i32> {
        // SAFETY: `shared_ptr` only returns live references.
        Ok(unsafe { native::mp_gl_context_major_version(self.shared_ptr()?) })
    }

    pub fn gl_minor_version(&self) -> Result<i32> {
        // SAFETY: `shared_ptr` only returns live references.
        Ok(unsafe { native::mp_gl_context_minor_version(self.shared_ptr()?) })
    }

    pub fn gl_finish_count(&self) -> Result<i64> {
        // SAFETY: `shared_ptr` only returns live references.
        Ok(unsafe { native::mp_gl_context_finish_count(self.shared_ptr()?) })
    }

    /// Blocks until all commands issued on this context have completed.
    pub fn finish(&self) -> Result<()> {
        // SAFETY: `shared_ptr` only returns live references.
        unsafe { native::mp_gl_context_finish(self.shared_ptr()?) }.check("mp_gl_context_finish")
    }

    /// Inserts a fence after the commands issued so far.
    pub fn create_sync_point(&self) -> Result<GlSyncPoint> {
        let ptr = self.shared_ptr()?;
        let mut raw = std::ptr::null_mut();
        // SAFETY: `ptr` is live and `raw` is valid for writes.
        unsafe { native::mp_gl_context_create_sync_token(ptr, &mut raw) }
            .check("mp_gl_context_create_sync_token")?;
        // SAFETY: the constructor wrote a fresh token.
        unsafe { GlSyncPoint::from_owned(raw.cast()) }
    }

    /// Allocates a texture name unique across every context.
    pub fn gen_texture(&self) -> Result<u32> {
        let mut name = 0;
        // SAFETY: the context is live and `name` is valid for writes.
        unsafe { native::mp_gl_context_gen_texture(self.shared_ptr()?, &mut name) }
            .check("mp_gl_context_gen_texture")?;
        Ok(name)
    }

    pub fn delete_texture(&self, name: u32) -> Result<()> {
        // SAFETY: the context is live.
        unsafe { native::mp_gl_context_delete_texture(self.shared_ptr()?, name) }
            .check("mp_gl_context_delete_texture")
    }
}

impl ResourceHandle for GlContext {
    fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut NativeHandle {
        &mut self.handle
    }
}

impl fmt::Debug for GlContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlContext").field("id", &self.id().ok()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BridgeError;

    #[test]
    fn current_context_is_per_thread() {
        let context = GlContext::create().unwrap();
        context.make_current().unwrap();
        assert!(context.is_current().unwrap());
        let current = GlContext::current().unwrap().unwrap();
        assert_eq!(current.id().unwrap(), context.id().unwrap());

        std::thread::spawn(|| assert!(GlContext::current().unwrap().is_none())).join().unwrap();

        GlContext::clear_current();
        assert!(!context.is_current().unwrap());
    }

    #[test]
    fn clones_share_the_context() {
        let context = GlContext::create().unwrap();
        let mut clone = context.try_clone().unwrap();
        assert_eq!(clone.id().unwrap(), context.id().unwrap());
        clone.dispose();
        assert!(matches!(clone.id(), Err(BridgeError::UseAfterFree { .. })));
        assert!(context.gl_major_version().unwrap() >= 3);
    }

    #[test]
    fn finish_is_counted() {
        let context = GlContext::create().unwrap();
        let before = context.gl_finish_count().unwrap();
        context.finish().unwrap();
        assert_eq!(context.gl_finish_count().unwrap(), before + 1);
    }
}
