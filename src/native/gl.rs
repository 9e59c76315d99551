//! Simulated GL objects: contexts, fences and texture buffers.
//!
//! Contexts and texture buffers are shared (`Arc`) on the native side; the safe
//! layer holds them through a boxed `Arc` so that dropping its handle releases
//! exactly one reference.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::{ReturnCode, deref, guard, write_out};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<NativeGlContext>>> = const { RefCell::new(None) };
}

/// A simulated GL context.
#[derive(Debug)]
pub struct NativeGlContext {
    id: u64,
    major: i32,
    minor: i32,
    finish_count: AtomicI64,
}

/// Texture names are shared by every context, as in a single share group.
#[derive(Debug)]
struct TextureNames {
    next: u32,
    free: Vec<u32>,
    live: BTreeSet<u32>,
}

static TEXTURE_NAMES: Mutex<TextureNames> =
    parking_lot::const_mutex(TextureNames { next: 1, free: Vec::new(), live: BTreeSet::new() });

impl NativeGlContext {
    fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            major: 3,
            minor: 2,
            finish_count: AtomicI64::new(0),
        }
    }

    /// Allocates a texture name, recycling deleted names like a GL driver does.
    fn gen_texture(&self) -> u32 {
        let mut names = TEXTURE_NAMES.lock();
        let name = match names.free.pop() {
            Some(name) => name,
            None => {
                let name = names.next;
                names.next += 1;
                name
            }
        };
        names.live.insert(name);
        name
    }

    fn delete_texture(&self, name: u32) -> bool {
        let mut names = TEXTURE_NAMES.lock();
        if names.live.remove(&name) {
            names.free.push(name);
            true
        } else {
            false
        }
    }
}

pub type SharedGlContext = Arc<NativeGlContext>;

/// # Safety
/// `out` must be valid for writes.
pub unsafe extern "C" fn mp_gl_context_create(out: *mut *mut SharedGlContext) -> ReturnCode {
    guard("mp_gl_context_create", || {
        let context = Arc::new(NativeGlContext::new());
        debug!(context_id = context.id, "created GL context");
        // SAFETY: out-pointers are valid for writes and null is rejected.
        unsafe { write_out(out, Box::into_raw(Box::new(context))) }
    })
}

/// Writes the calling thread's current context, or null if there is none.
///
/// # Safety
/// `out` must be valid for writes.
pub unsafe extern "C" fn mp_gl_context_get_current(out: *mut *mut SharedGlContext) -> ReturnCode {
    guard("mp_gl_context_get_current", || {
        let current = CURRENT.with(|c| c.borrow().clone());
        let raw = current.map_or(std::ptr::null_mut(), |ctx| Box::into_raw(Box::new(ctx)));
        // SAFETY: out-pointers are valid for writes and null is rejected.
        unsafe { write_out(out, raw) }
    })
}

/// # Safety
/// `context` must point to a live shared context.
pub unsafe extern "C" fn mp_gl_context_make_current(context: *const SharedGlContext) -> ReturnCode {
    guard("mp_gl_context_make_current", || {
        let context = unsafe { deref(context, "GL context") }?;
        CURRENT.with(|c| *c.borrow_mut() = Some(Arc::clone(context)));
        Ok(())
    })
}

pub extern "C" fn mp_gl_context_clear_current() {
    CURRENT.with(|c| *c.borrow_mut() = None);
}

/// # Safety
/// `context` must point to a live shared context.
pub unsafe extern "C" fn mp_gl_context_is_current(context: *const SharedGlContext) -> bool {
    let Ok(context) = (unsafe { deref(context, "GL context") }) else {
        return false;
    };
    CURRENT.with(|c| c.borrow().as_ref().is_some_and(|current| Arc::ptr_eq(current, context)))
}

/// # Safety
/// `context` must point to a live shared context; `out` must be valid for writes.
pub unsafe extern "C" fn mp_shared_gl_context_copy(
    context: *const SharedGlContext,
    out: *mut *mut SharedGlContext,
) -> ReturnCode {
    guard("mp_shared_gl_context_copy", || {
        // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
        let context = unsafe { deref(context, "GL context") }?;
        unsafe { write_out(out, Box::into_raw(Box::new(Arc::clone(context)))) }
    })
}

/// # Safety
/// `context` must be null or a live shared context not freed yet.
pub unsafe extern "C" fn mp_shared_gl_context_delete(context: *mut SharedGlContext) {
    if !context.is_null() {
        // SAFETY: allocated with `Box::into_raw`.
        drop(unsafe { Box::from_raw(context) });
    }
}

/// # Safety
/// `context` must point to a live shared context.
pub unsafe extern "C" fn mp_gl_context_id(context: *const SharedGlContext) -> u64 {
    unsafe { deref(context, "GL context") }.map(|c| c.id).unwrap_or(0)
}

/// # Safety
/// `context` must point to a live shared context.
pub unsafe extern "C" fn mp_gl_context_major_version(context: *const SharedGlContext) -> i32 {
    unsafe { deref(context, "GL context") }.map(|c| c.major).unwrap_or(0)
}

/// # Safety
/// `context` must point to a live shared context.
pub unsafe extern "C" fn mp_gl_context_minor_version(context: *const SharedGlContext) -> i32 {
    unsafe { deref(context, "GL context") }.map(|c| c.minor).unwrap_or(0)
}

/// # Safety
/// `context` must point to a live shared context.
pub unsafe extern "C" fn mp_gl_context_finish_count(context: *const SharedGlContext) -> i64 {
    unsafe { deref(context, "GL context") }
        .map(|c| c.finish_count.load(Ordering::Acquire))
        .unwrap_or(0)
}

/// # Safety
/// `context` must point to a live shared context.
pub unsafe extern "C" fn mp_gl_context_finish(context: *const SharedGlContext) -> ReturnCode {
    guard("mp_gl_context_finish", || {
        let context = unsafe { deref(context, "GL context") }?;
        context.finish_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    })
}

/// # Safety
/// `context` must point to a live shared context; `out` must be valid for writes.
pub unsafe extern "C" fn mp_gl_context_gen_texture(
    context: *const SharedGlContext,
    out: *mut u32,
) -> ReturnCode {
    guard("mp_gl_context_gen_texture", || {
        // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
        let context = unsafe { deref(context, "GL context") }?;
        unsafe { write_out(out, context.gen_texture()) }
    })
}

/// # Safety
/// `context` must point to a live shared context.
pub unsafe extern "C" fn mp_gl_context_delete_texture(
    context: *const SharedGlContext,
    name: u32,
) -> ReturnCode {
    guard("mp_gl_context_delete_texture", || {
        // SAFETY: the caller passes live objects or null.
        let context = unsafe { deref(context, "GL context") }?;
        if !context.delete_texture(name) {
            warn!(texture = name, "deleting a texture name that is not live");
        }
        Ok(())
    })
}

/// A GPU fence.
#[derive(Debug, Default)]
pub struct Fence {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Fence {
    pub(crate) fn signaled() -> Arc<Self> {
        Arc::new(Self { signaled: Mutex::new(true), cond: Condvar::new() })
    }

    pub(crate) fn pending() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn signal(&self) {
        *self.signaled.lock() = true;
        self.cond.notify_all();
    }

    fn is_ready(&self) -> bool {
        *self.signaled.lock()
    }

    fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        if !*signaled {
            self.cond.wait_for(&mut signaled, timeout);
        }
        *signaled
    }
}

pub type SharedGlSyncToken = Arc<Fence>;

/// Inserts a fence into `context`'s command stream.
///
/// # Safety
/// `context` must point to a live shared context; `out` must be valid for writes.
pub unsafe extern "C" fn mp_gl_context_create_sync_token(
    context: *const SharedGlContext,
    out: *mut *mut SharedGlSyncToken,
) -> ReturnCode {
    guard("mp_gl_context_create_sync_token", || {
        // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
        let _context = unsafe { deref(context, "GL context") }?;
        unsafe { write_out(out, Box::into_raw(Box::new(Fence::signaled()))) }
    })
}

/// # Safety
/// `token` must be null or a live sync token not freed yet.
pub unsafe extern "C" fn mp_gl_sync_token_delete(token: *mut SharedGlSyncToken) {
    if !token.is_null() {
        // SAFETY: allocated with `Box::into_raw`.
        drop(unsafe { Box::from_raw(token) });
    }
}

/// Blocks the calling thread until the fence is signaled.
///
/// # Safety
/// `token` must point to a live sync token.
pub unsafe extern "C" fn mp_gl_sync_point_wait(token: *const SharedGlSyncToken) -> ReturnCode {
    guard("mp_gl_sync_point_wait", || {
        unsafe { deref(token, "sync token") }?.wait();
        Ok(())
    })
}

/// Blocks for at most `timeout_ms` and reports whether the fence was signaled.
///
/// # Safety
/// `token` must point to a live sync token; `out` must be valid for writes.
pub unsafe extern "C" fn mp_gl_sync_point_wait_for(
    token: *const SharedGlSyncToken,
    timeout_ms: u64,
    out: *mut bool,
) -> ReturnCode {
    guard("mp_gl_sync_point_wait_for", || {
        // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
        let token = unsafe { deref(token, "sync token") }?;
        let ready = token.wait_for(Duration::from_millis(timeout_ms));
        unsafe { write_out(out, ready) }
    })
}

/// Makes the current context's command stream wait for the fence without
/// blocking the CPU.
///
/// # Safety
/// `token` must point to a live sync token.
pub unsafe extern "C" fn mp_gl_sync_point_wait_on_gpu(token: *const SharedGlSyncToken) -> ReturnCode {
    guard("mp_gl_sync_point_wait_on_gpu", || {
        unsafe { deref(token, "sync token") }?;
        Ok(())
    })
}

/// # Safety
/// `token` must point to a live sync token.
pub unsafe extern "C" fn mp_gl_sync_point_is_ready(token: *const SharedGlSyncToken) -> bool {
    unsafe { deref(token, "sync token") }.map(|t| t.is_ready()).unwrap_or(false)
}

/// Invoked when the last reference to a texture buffer is released.
///
/// The callee owns `sync_token` and must free it with `mp_gl_sync_token_delete`.
pub type TextureDeletionCallback = unsafe extern "C" fn(name: u32, sync_token: *mut c_void);

/// A texture owned by the host and lent to the pipeline.
#[derive(Debug)]
pub struct NativeGlTextureBuffer {
    pub(crate) name: u32,
    pub(crate) width: i32,
    pub(crate) height: i32,
    pub(crate) format: i32,
    deletion_callback: Option<TextureDeletionCallback>,
    producer_context: Option<SharedGlContext>,
    consumer_token: Mutex<Option<SharedGlSyncToken>>,
}

impl NativeGlTextureBuffer {
    /// Records that a consumer has read (or will read) the texture once `token` signals.
    pub(crate) fn did_read(&self, token: SharedGlSyncToken) {
        *self.consumer_token.lock() = Some(token);
    }
}

impl Drop for NativeGlTextureBuffer {
    fn drop(&mut self) {
        let Some(callback) = self.deletion_callback.take() else {
            return;
        };
        let token = self.consumer_token.lock().take().unwrap_or_else(Fence::signaled);
        let token = Box::into_raw(Box::new(token));
        debug!(
            texture = self.name,
            producer = self.producer_context.as_ref().map(|c| c.id),
            "texture buffer released"
        );
        // SAFETY: the callback contract takes ownership of `token`.
        unsafe { callback(self.name, token.cast()) };
    }
}

pub type SharedGlTextureBuffer = Arc<NativeGlTextureBuffer>;

/// Wraps an existing texture name. The deletion callback runs once every
/// reference, including the ones held inside packets, is gone.
///
/// # Safety
/// `context` must be null or a live shared context; `out` must be valid for writes.
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn mp_gl_texture_buffer_new(
    name: u32,
    width: i32,
    height: i32,
    format: i32,
    deletion_callback: Option<TextureDeletionCallback>,
    context: *const SharedGlContext,
    out: *mut *mut SharedGlTextureBuffer,
) -> ReturnCode {
    guard("mp_gl_texture_buffer_new", || {
        if width <= 0 || height <= 0 {
            return Err(format!("invalid texture size {width}x{height}"));
        }
        // SAFETY: null is allowed; otherwise the caller guarantees a live context.
        let producer_context = unsafe { context.as_ref() }.map(Arc::clone);
        let buffer = NativeGlTextureBuffer {
            name,
            width,
            height,
            format,
            deletion_callback,
            producer_context,
            consumer_token: Mutex::new(None),
        };
        // SAFETY: out-pointers are valid for writes and null is rejected.
        unsafe { write_out(out, Box::into_raw(Box::new(Arc::new(buffer)))) }
    })
}

/// # Safety
/// `buffer` must be null or a live shared texture buffer not freed yet.
pub unsafe extern "C" fn mp_shared_gl_texture_buffer_delete(buffer: *mut SharedGlTextureBuffer) {
    if !buffer.is_null() {
        // SAFETY: allocated with `Box::into_raw`.
        drop(unsafe { Box::from_raw(buffer) });
    }
}

/// A GPU buffer payload: a shared reference to a texture buffer.
#[derive(Debug, Clone)]
pub struct NativeGpuBuffer(pub(crate) SharedGlTextureBuffer);

/// # Safety
/// `buffer` must point to a live shared texture buffer; `out` must be valid for writes.
pub unsafe extern "C" fn mp_gpu_buffer_new(
    buffer: *const SharedGlTextureBuffer,
    out: *mut *mut NativeGpuBuffer,
) -> ReturnCode {
    guard("mp_gpu_buffer_new", || {
        // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
        let buffer = unsafe { deref(buffer, "texture buffer") }?;
        let gpu = NativeGpuBuffer(Arc::clone(buffer));
        unsafe { write_out(out, Box::into_raw(Box::new(gpu))) }
    })
}

/// # Safety
/// `buffer` must be null or a live GPU buffer not freed yet.
pub unsafe extern "C" fn mp_gpu_buffer_delete(buffer: *mut NativeGpuBuffer) {
    if !buffer.is_null() {
        // SAFETY: allocated with `Box::into_raw`.
        drop(unsafe { Box::from_raw(buffer) });
    }
}

macro_rules! gpu_buffer_getter {
    ($name:ident, $field:ident, $ty:ty) => {
        /// # Safety
        /// `buffer` must point to a live GPU buffer.
        pub unsafe extern "C" fn $name(buffer: *const NativeGpuBuffer) -> $ty {
            unsafe { deref(buffer, "GPU buffer") }.map(|b| b.0.$field).unwrap_or_default()
        }
    };
}

gpu_buffer_getter!(mp_gpu_buffer_texture_name, name, u32);
gpu_buffer_getter!(mp_gpu_buffer_width, width, i32);
gpu_buffer_getter!(mp_gpu_buffer_height, height, i32);
gpu_buffer_getter!(mp_gpu_buffer_format, format, i32);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn texture_names_are_shared_across_contexts() {
        let context = NativeGlContext::new();
        let other = NativeGlContext::new();
        let a = context.gen_texture();
        let b = other.gen_texture();
        assert_ne!(a, b);
        assert!(other.delete_texture(a));
        assert!(context.delete_texture(b));
    }

    #[test]
    fn fences_block_until_signaled() {
        let fence = Fence::pending();
        assert!(!fence.wait_for(Duration::from_millis(5)));
        let signaler = Arc::clone(&fence);
        let handle = std::thread::spawn(move || signaler.signal());
        fence.wait();
        handle.join().unwrap();
        assert!(fence.is_ready());
    }

    static RELEASED: AtomicU32 = AtomicU32::new(0);

    unsafe extern "C" fn record_release(name: u32, token: *mut c_void) {
        RELEASED.store(name, Ordering::SeqCst);
        unsafe { mp_gl_sync_token_delete(token.cast()) };
    }

    #[test]
    fn deletion_callback_fires_after_last_reference() {
        let mut buffer = std::ptr::null_mut();
        let code = unsafe {
            mp_gl_texture_buffer_new(
                4242,
                8,
                8,
                0,
                Some(record_release),
                std::ptr::null(),
                &mut buffer,
            )
        };
        assert_eq!(code, ReturnCode::Success);
        let mut gpu = std::ptr::null_mut();
        unsafe { mp_gpu_buffer_new(buffer, &mut gpu) };
        unsafe { mp_shared_gl_texture_buffer_delete(buffer) };
        assert_ne!(RELEASED.load(Ordering::SeqCst), 4242);
        unsafe { mp_gpu_buffer_delete(gpu) };
        assert_eq!(RELEASED.load(Ordering::SeqCst), 4242);
    }
}
