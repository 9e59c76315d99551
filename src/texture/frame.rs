use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};
use uuid::Uuid;

use super::registry::{self, registry};
use crate::error::{BridgeError, Result};
use crate::gpu::{GlContext, GlSyncPoint, GlTextureBuffer, GpuBuffer, GpuBufferFormat};
use crate::image_frame::{ImageFormat, ImageFrame};

/// Pixel layout of a texture frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureFormat {
    #[default]
    Rgba32,
    Bgra32,
    Rgb24,
    Alpha8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba32 | Self::Bgra32 => 4,
            Self::Rgb24 => 3,
            Self::Alpha8 => 1,
        }
    }

    /// Image format of a CPU copy of this frame.
    pub fn image_format(self) -> ImageFormat {
        match self {
            Self::Rgba32 => ImageFormat::Srgba,
            Self::Bgra32 => ImageFormat::Sbgra,
            Self::Rgb24 => ImageFormat::Srgb,
            Self::Alpha8 => ImageFormat::Gray8,
        }
    }

    /// GPU buffer format, or `Unknown` when the layout has no texture equivalent.
    pub fn gpu_buffer_format(self) -> GpuBufferFormat {
        match self {
            Self::Rgba32 => GpuBufferFormat::Rgba32,
            Self::Bgra32 => GpuBufferFormat::Bgra32,
            Self::Alpha8 => GpuBufferFormat::OneComponent8,
            Self::Rgb24 => GpuBufferFormat::Unknown,
        }
    }
}

/// Dimensions and format a frame was allocated with.
///
/// Pools compare descriptors to decide whether a returned frame can be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameDescriptor {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

impl FrameDescriptor {
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Self {
        Self { width, height, format }
    }

    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(BridgeError::invalid_argument(format!("texture frame size {self} is empty")));
        }
        Ok(())
    }
}

impl fmt::Display for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {:?}", self.width, self.height, self.format)
    }
}

pub(crate) type ReleaseListener = Arc<dyn Fn(Uuid) + Send + Sync>;

struct BoundTexture {
    name: u32,
    context: GlContext,
}

/// State shared by every lease of one frame.
pub(crate) struct FrameCore {
    id: Uuid,
    descriptor: FrameDescriptor,
    pixels: Mutex<Vec<u8>>,
    texture: Mutex<Option<BoundTexture>>,
    sync_point: Mutex<Option<GlSyncPoint>>,
    listeners: Mutex<Vec<ReleaseListener>>,
}

impl FrameCore {
    pub(crate) fn create(descriptor: FrameDescriptor) -> Result<Arc<Self>> {
        descriptor.validate()?;
        let core = Arc::new(Self {
            id: Uuid::new_v4(),
            descriptor,
            pixels: Mutex::new(vec![0; descriptor.byte_len()]),
            texture: Mutex::new(None),
            sync_point: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        });
        registry().register(&core)?;
        trace!(frame = %core.id, %descriptor, "texture frame created");
        Ok(core)
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    pub(crate) fn descriptor(&self) -> FrameDescriptor {
        self.descriptor
    }

    pub(crate) fn add_listener(&self, listener: ReleaseListener) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn texture_name(&self) -> Option<u32> {
        self.texture.lock().as_ref().map(|bound| bound.name)
    }

    /// Returns the frame's texture name, allocating and claiming one on first use.
    fn bind_texture(&self, context: &GlContext) -> Result<u32> {
        let mut texture = self.texture.lock();
        if let Some(bound) = texture.as_ref() {
            return Ok(bound.name);
        }
        let context = context.try_clone()?;
        let name = context.gen_texture()?;
        if let Err(err) = registry().claim_name(name, self.id) {
            context.delete_texture(name)?;
            return Err(err);
        }
        trace!(frame = %self.id, texture = name, "texture name bound");
        *texture = Some(BoundTexture { name, context });
        Ok(name)
    }

    /// Stores the consumer's sync token and notifies listeners.
    pub(crate) fn release(&self, sync_point: Option<GlSyncPoint>) {
        *self.sync_point.lock() = sync_point;
        let listeners = self.listeners.lock().clone();
        trace!(frame = %self.id, listeners = listeners.len(), "texture frame released");
        for listener in listeners {
            listener(self.id);
        }
    }

    /// Blocks until the last consumer has finished reading the texture.
    pub(crate) fn wait_until_released(&self) -> Result<()> {
        let sync_point = self.sync_point.lock().take();
        if let Some(sync_point) = sync_point {
            trace!(frame = %self.id, "waiting for previous consumer");
            sync_point.wait()?;
        }
        Ok(())
    }
}

impl Drop for FrameCore {
    fn drop(&mut self) {
        if let Some(bound) = self.texture.get_mut().take() {
            registry().release_name(bound.name, self.id);
            if let Err(err) = bound.context.delete_texture(bound.name) {
                warn!(frame = %self.id, texture = bound.name, error = %err, "failed to delete texture");
            }
        }
        registry().unregister(&self.id);
        trace!(frame = %self.id, "texture frame destroyed");
    }
}

/// A lease on a texture frame.
///
/// Exactly one `TextureFrame` exists per lease. Releasing it, dropping it, or
/// handing it to the pipeline with [`build_gpu_buffer`](Self::build_gpu_buffer)
/// ends the lease.
pub struct TextureFrame {
    core: Arc<FrameCore>,
    leased: bool,
}

impl TextureFrame {
    /// A frame that belongs to no pool.
    pub fn new(width: u32, height: u32, format: TextureFormat) -> Result<Self> {
        let core = FrameCore::create(FrameDescriptor::new(width, height, format))?;
        Ok(Self::lease(core))
    }

    pub(crate) fn lease(core: Arc<FrameCore>) -> Self {
        Self { core, leased: true }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn descriptor(&self) -> FrameDescriptor {
        self.core.descriptor
    }

    pub fn width(&self) -> u32 {
        self.core.descriptor.width
    }

    pub fn height(&self) -> u32 {
        self.core.descriptor.height
    }

    pub fn format(&self) -> TextureFormat {
        self.core.descriptor.format
    }

    /// Texture name bound to this frame, if one has been allocated.
    pub fn native_texture_name(&self) -> Option<u32> {
        self.core.texture_name()
    }

    /// Texture name for this frame, allocated in `context` on first use.
    ///
    /// Fails if another live frame already claims the name.
    pub fn texture_name(&mut self, context: &GlContext) -> Result<u32> {
        self.core.bind_texture(context)
    }

    /// Replaces the frame's pixels. `data` must hold exactly one frame.
    pub fn set_pixels(&mut self, data: &[u8]) -> Result<()> {
        let expected = self.core.descriptor.byte_len();
        if data.len() != expected {
            return Err(BridgeError::invalid_argument(format!(
                "expected {expected} bytes for a {} frame, got {}",
                self.core.descriptor,
                data.len()
            )));
        }
        self.core.pixels.lock().copy_from_slice(data);
        Ok(())
    }

    /// Writes into the pixel buffer in place.
    pub fn with_pixels_mut<R>(&mut self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(self.core.pixels.lock().as_mut_slice())
    }

    pub fn pixels(&self) -> Vec<u8> {
        self.core.pixels.lock().clone()
    }

    /// Registers a listener called with the frame id each time the frame is released.
    pub fn on_release(&self, listener: impl Fn(Uuid) + Send + Sync + 'static) {
        self.core.add_listener(Arc::new(listener));
    }

    /// Copies the pixels into a CPU image.
    pub fn build_image_frame(&self) -> Result<ImageFrame> {
        let descriptor = self.core.descriptor;
        let pixels = self.core.pixels.lock();
        ImageFrame::new(descriptor.format.image_format(), descriptor.width, descriptor.height, &pixels)
    }

    /// Lends the frame's texture to the pipeline.
    ///
    /// The lease moves into the returned buffer: the frame is released, with
    /// the pipeline's sync token, once every reference to the buffer is gone.
    pub fn build_gpu_buffer(mut self, context: &GlContext) -> Result<GpuBuffer> {
        let descriptor = self.core.descriptor;
        let format = descriptor.format.gpu_buffer_format();
        if format == GpuBufferFormat::Unknown {
            return Err(BridgeError::format_mismatch("a GPU texture format", format!("{:?}", descriptor.format)));
        }
        let name = self.texture_name(context)?;
        let texture = GlTextureBuffer::wrap(
            name,
            descriptor.width,
            descriptor.height,
            format,
            Some(registry::on_texture_buffer_released),
            Some(context),
        )?;
        let buffer = GpuBuffer::new(&texture)?;
        registry().hand_off(name, Arc::clone(&self.core));
        self.leased = false;
        trace!(frame = %self.core.id, texture = name, "texture frame handed to the pipeline");
        Ok(buffer)
    }

    /// Ends the lease. `sync_point`, if any, guards the last read of the texture.
    pub fn release(mut self, sync_point: Option<GlSyncPoint>) {
        self.leased = false;
        self.core.release(sync_point);
    }
}

impl Drop for TextureFrame {
    fn drop(&mut self) {
        if self.leased {
            self.core.release(None);
        }
    }
}

impl fmt::Debug for TextureFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureFrame")
            .field("id", &self.core.id)
            .field("descriptor", &self.core.descriptor)
            .field("texture_name", &self.native_texture_name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::ResourceHandle;
    use crate::native::{self, Fence};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn empty_frames_are_rejected() {
        assert!(matches!(TextureFrame::new(0, 4, TextureFormat::Rgba32), Err(BridgeError::InvalidArgument { .. })));
    }

    #[test]
    fn pixels_must_match_the_descriptor() {
        let mut frame = TextureFrame::new(2, 2, TextureFormat::Rgb24).unwrap();
        assert!(frame.set_pixels(&[0; 11]).is_err());
        frame.set_pixels(&[7; 12]).unwrap();
        assert_eq!(frame.pixels(), vec![7; 12]);

        let image = frame.build_image_frame().unwrap();
        assert_eq!(image.format().unwrap(), ImageFormat::Srgb);
        assert_eq!(image.copy_to_vec::<u8>().unwrap(), vec![7; 12]);
    }

    #[test]
    fn texture_name_is_bound_once() {
        let context = GlContext::create().unwrap();
        let mut frame = TextureFrame::new(4, 4, TextureFormat::Rgba32).unwrap();
        assert_eq!(frame.native_texture_name(), None);
        let name = frame.texture_name(&context).unwrap();
        assert_eq!(frame.texture_name(&context).unwrap(), name);
        assert_eq!(frame.native_texture_name(), Some(name));
    }

    #[test]
    fn frames_never_share_a_texture_name() {
        let context = GlContext::create().unwrap();
        let mut a = TextureFrame::new(4, 4, TextureFormat::Rgba32).unwrap();
        let mut b = TextureFrame::new(4, 4, TextureFormat::Rgba32).unwrap();
        let name = a.texture_name(&context).unwrap();
        assert_ne!(b.texture_name(&context).unwrap(), name);
        assert!(registry().claim_name(name, b.id()).is_err());
    }

    #[test]
    fn listeners_fire_on_release_and_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let frame = TextureFrame::new(1, 1, TextureFormat::Alpha8).unwrap();
        let counter = Arc::clone(&released);
        frame.on_release(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        frame.release(None);
        assert_eq!(released.load(Ordering::SeqCst), 1);

        let frame = TextureFrame::new(1, 1, TextureFormat::Alpha8).unwrap();
        let counter = Arc::clone(&released);
        frame.on_release(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(frame);
        assert_eq!(released.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn gpu_buffer_release_carries_the_sync_token() {
        let context = GlContext::create().unwrap();
        let frame = TextureFrame::new(8, 8, TextureFormat::Bgra32).unwrap();
        let id = frame.id();
        let core = Arc::clone(&frame.core);
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        frame.on_release(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut buffer = frame.build_gpu_buffer(&context).unwrap();
        assert_eq!(buffer.format().unwrap(), GpuBufferFormat::Bgra32);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(registry().owner_of(buffer.texture_name().unwrap()), Some(id));

        buffer.dispose();
        assert_eq!(released.load(Ordering::SeqCst), 1);
        core.wait_until_released().unwrap();
    }

    #[test]
    fn rgb_frames_cannot_become_gpu_buffers() {
        let context = GlContext::create().unwrap();
        let frame = TextureFrame::new(2, 2, TextureFormat::Rgb24).unwrap();
        assert!(matches!(frame.build_gpu_buffer(&context), Err(BridgeError::FormatMismatch { .. })));
    }

    #[test]
    fn waiting_blocks_on_a_pending_token() {
        let frame = TextureFrame::new(1, 1, TextureFormat::Alpha8).unwrap();
        let core = Arc::clone(&frame.core);
        let fence = Fence::pending();
        let token: *mut native::SharedGlSyncToken = Box::into_raw(Box::new(Arc::clone(&fence)));
        let sync_point = unsafe { GlSyncPoint::from_owned(token) }.unwrap();
        frame.release(Some(sync_point));

        let signaler = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            fence.signal();
        });
        core.wait_until_released().unwrap();
        signaler.join().unwrap();
    }
}
