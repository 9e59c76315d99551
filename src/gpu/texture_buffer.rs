use std::ffi::c_void;
use std::fmt;

use super::GlContext;
use crate::error::Result;
use crate::handle::{NativeHandle, ResourceHandle};
use crate::native::{self, NativeGpuBuffer, SharedGlTextureBuffer, TextureDeletionCallback};

const fn fourcc(code: &[u8; 4]) -> i32 {
    (code[0] as i32) | (code[1] as i32) << 8 | (code[2] as i32) << 16 | (code[3] as i32) << 24
}

/// Pixel format of a GPU texture.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuBufferFormat {
    Unknown = 0,
    Bgra32 = fourcc(b"BGRA"),
    Rgba32 = fourcc(b"RGBA"),
    OneComponent8 = fourcc(b"L008"),
    GrayFloat32 = fourcc(b"L00f"),
}

impl GpuBufferFormat {
    pub fn from_raw(raw: i32) -> Self {
        [Self::Bgra32, Self::Rgba32, Self::OneComponent8, Self::GrayFloat32]
            .into_iter()
            .find(|format| *format as i32 == raw)
            .unwrap_or(Self::Unknown)
    }
}

unsafe fn delete_texture_buffer(ptr: *mut c_void) {
    // SAFETY: only installed as the deleter of handles that own this object.
    unsafe { native::mp_shared_gl_texture_buffer_delete(ptr.cast()) }
}

unsafe fn delete_gpu_buffer(ptr: *mut c_void) {
    // SAFETY: only installed as the deleter of handles that own this object.
    unsafe { native::mp_gpu_buffer_delete(ptr.cast()) }
}

/// An existing GL texture lent to the pipeline.
///
/// When the pipeline drops its last reference, `deletion_callback` is called
/// with the texture name and a sync token guarding the last read.
pub struct GlTextureBuffer {
    handle: NativeHandle,
}

impl GlTextureBuffer {
    pub fn wrap(
        name: u32,
        width: u32,
        height: u32,
        format: GpuBufferFormat,
        deletion_callback: Option<TextureDeletionCallback>,
        producer: Option<&GlContext>,
    ) -> Result<Self> {
        let context = match producer {
            Some(context) => context.shared_ptr()?,
            None => std::ptr::null(),
        };
        // SAFETY: `context` is null or live for the duration of the call.
        let handle = unsafe {
            NativeHandle::create("GlTextureBuffer", delete_texture_buffer, |out| {
                native::mp_gl_texture_buffer_new(
                    name,
                    width as i32,
                    height as i32,
                    format as i32,
                    deletion_callback,
                    context,
                    out.cast(),
                )
            })
        }?;
        Ok(Self { handle })
    }

    pub(crate) fn shared_ptr(&self) -> Result<*const SharedGlTextureBuffer> {
        Ok(self.handle.as_ptr()?.cast_const().cast())
    }
}

impl ResourceHandle for GlTextureBuffer {
    fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut NativeHandle {
        &mut self.handle
    }
}

/// GPU image payload referring to a [`GlTextureBuffer`].
pub struct GpuBuffer {
    handle: NativeHandle,
}

impl GpuBuffer {
    pub fn new(buffer: &GlTextureBuffer) -> Result<Self> {
        let ptr = buffer.shared_ptr()?;
        // SAFETY: `ptr` is live; the new GPU buffer holds its own reference.
        let handle = unsafe {
            NativeHandle::create("GpuBuffer", delete_gpu_buffer, |out| native::mp_gpu_buffer_new(ptr, out.cast()))
        }?;
        Ok(Self { handle })
    }

    /// # Safety
    /// `ptr` must be a live GPU buffer that nothing else frees.
    pub(crate) unsafe fn from_owned(ptr: *mut NativeGpuBuffer) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        let handle = unsafe { NativeHandle::from_owned(ptr.cast(), "GpuBuffer", delete_gpu_buffer) }?;
        Ok(Self { handle })
    }

    pub(crate) fn into_raw(mut self) -> Result<*mut NativeGpuBuffer> {
        Ok(self.handle.release()?.cast())
    }

    fn ptr(&self) -> Result<*const NativeGpuBuffer> {
        Ok(self.handle.as_ptr()?.cast_const().cast())
    }

    pub fn texture_name(&self) -> Result<u32> {
        // SAFETY: `ptr` fails instead of returning a disposed object.
        Ok(unsafe { native::mp_gpu_buffer_texture_name(self.ptr()?) })
    }

    pub fn width(&self) -> Result<u32> {
        // SAFETY: `ptr` fails instead of returning a disposed object.
        Ok(unsafe { native::mp_gpu_buffer_width(self.ptr()?) } as u32)
    }

    pub fn height(&self) -> Result<u32> {
        // SAFETY: `ptr` fails instead of returning a disposed object.
        Ok(unsafe { native::mp_gpu_buffer_height(self.ptr()?) } as u32)
    }

    pub fn format(&self) -> Result<GpuBufferFormat> {
        // SAFETY: `ptr` fails instead of returning a disposed object.
        Ok(GpuBufferFormat::from_raw(unsafe { native::mp_gpu_buffer_format(self.ptr()?) }))
    }
}

impl ResourceHandle for GpuBuffer {
    fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut NativeHandle {
        &mut self.handle
    }
}

impl fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuBuffer")
            .field("texture_name", &self.texture_name().ok())
            .field("width", &self.width().ok())
            .field("height", &self.height().ok())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_formats_round_trip() {
        assert_eq!(GpuBufferFormat::from_raw(GpuBufferFormat::Bgra32 as i32), GpuBufferFormat::Bgra32);
        assert_eq!(GpuBufferFormat::from_raw(42), GpuBufferFormat::Unknown);
    }

    #[test]
    fn gpu_buffer_reports_texture() {
        let context = GlContext::create().unwrap();
        let texture = GlTextureBuffer::wrap(7, 64, 32, GpuBufferFormat::Rgba32, None, Some(&context)).unwrap();
        let gpu = GpuBuffer::new(&texture).unwrap();
        drop(texture);
        assert_eq!(gpu.texture_name().unwrap(), 7);
        assert_eq!((gpu.width().unwrap(), gpu.height().unwrap()), (64, 32));
        assert_eq!(gpu.format().unwrap(), GpuBufferFormat::Rgba32);
    }
}
