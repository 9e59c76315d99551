//! CPU image payloads.

use std::ffi::c_void;
use std::fmt;

use crate::error::{BridgeError, Result};
use crate::handle::{NativeHandle, ResourceHandle};
use crate::marshal;
use crate::native::{self, NativeImageFrame};

/// Pixel layout of an [`ImageFrame`].
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Unknown = 0,
    Srgb = 1,
    Srgba = 2,
    Gray8 = 3,
    Gray16 = 4,
    Srgb48 = 7,
    Srgba64 = 8,
    Vec32f1 = 9,
    Lab8 = 10,
    Sbgra = 11,
    Vec32f2 = 12,
}

impl ImageFormat {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => ImageFormat::Srgb,
            2 => ImageFormat::Srgba,
            3 => ImageFormat::Gray8,
            4 => ImageFormat::Gray16,
            7 => ImageFormat::Srgb48,
            8 => ImageFormat::Srgba64,
            9 => ImageFormat::Vec32f1,
            10 => ImageFormat::Lab8,
            11 => ImageFormat::Sbgra,
            12 => ImageFormat::Vec32f2,
            _ => ImageFormat::Unknown,
        }
    }

    pub fn number_of_channels(self) -> usize {
        match self {
            ImageFormat::Gray8 | ImageFormat::Gray16 | ImageFormat::Vec32f1 => 1,
            ImageFormat::Vec32f2 => 2,
            ImageFormat::Srgb | ImageFormat::Srgb48 | ImageFormat::Lab8 => 3,
            ImageFormat::Srgba | ImageFormat::Srgba64 | ImageFormat::Sbgra => 4,
            ImageFormat::Unknown => 0,
        }
    }

    /// Bytes per channel component.
    pub fn byte_depth(self) -> usize {
        match self {
            ImageFormat::Srgb
            | ImageFormat::Srgba
            | ImageFormat::Gray8
            | ImageFormat::Lab8
            | ImageFormat::Sbgra => 1,
            ImageFormat::Gray16 | ImageFormat::Srgb48 | ImageFormat::Srgba64 => 2,
            ImageFormat::Vec32f1 | ImageFormat::Vec32f2 => 4,
            ImageFormat::Unknown => 0,
        }
    }

    pub fn pixel_bytes(self) -> usize {
        self.number_of_channels() * self.byte_depth()
    }
}

/// A channel component type that image data can be copied into.
pub trait PixelComponent: Copy {
    const BYTE_DEPTH: usize;
    const NAME: &'static str;

    fn from_ne_slice(bytes: &[u8]) -> Self;
}

impl PixelComponent for u8 {
    const BYTE_DEPTH: usize = 1;
    const NAME: &'static str = "u8";

    fn from_ne_slice(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl PixelComponent for u16 {
    const BYTE_DEPTH: usize = 2;
    const NAME: &'static str = "u16";

    fn from_ne_slice(bytes: &[u8]) -> Self {
        u16::from_ne_bytes([bytes[0], bytes[1]])
    }
}

impl PixelComponent for f32 {
    const BYTE_DEPTH: usize = 4;
    const NAME: &'static str = "f32";

    fn from_ne_slice(bytes: &[u8]) -> Self {
        f32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

unsafe fn delete_image_frame(ptr: *mut c_void) {
    // SAFETY: only installed as the deleter of handles that own this object.
    unsafe { native::mp_image_frame_delete(ptr.cast()) }
}

/// Pixel data owned by the native side.
pub struct ImageFrame {
    handle: NativeHandle,
}

impl ImageFrame {
    /// Copies tightly packed `pixels` into a new frame.
    pub fn new(format: ImageFormat, width: u32, height: u32, pixels: &[u8]) -> Result<Self> {
        let width_step = width as usize * format.pixel_bytes();
        Self::with_width_step(format, width, height, width_step, pixels)
    }

    /// Copies `pixels` whose rows are `width_step` bytes apart.
    pub fn with_width_step(
        format: ImageFormat,
        width: u32,
        height: u32,
        width_step: usize,
        pixels: &[u8],
    ) -> Result<Self> {
        if format == ImageFormat::Unknown {
            return Err(BridgeError::invalid_argument("image format is unknown"));
        }
        let row = width as usize * format.pixel_bytes();
        if width_step < row {
            return Err(BridgeError::invalid_argument(format!(
                "width step {width_step} is smaller than a row ({row} bytes)"
            )));
        }
        let expected = width_step * height as usize;
        if pixels.len() < expected {
            return Err(BridgeError::invalid_argument(format!(
                "pixel buffer holds {} bytes, {expected} required",
                pixels.len()
            )));
        }
        let len = marshal::native_len(pixels.len())?;
        // SAFETY: `pixels` is valid for `len` reads for the duration of the call.
        let handle = unsafe {
            NativeHandle::create("ImageFrame", delete_image_frame, |out| {
                native::mp_image_frame_new(
                    format as i32,
                    width as i32,
                    height as i32,
                    width_step as i32,
                    pixels.as_ptr(),
                    len,
                    out.cast(),
                )
            })
        }?;
        Ok(Self { handle })
    }

    /// # Safety
    /// `ptr` must be a live native image frame that nothing else frees.
    pub(crate) unsafe fn from_owned(ptr: *mut NativeImageFrame) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        let handle = unsafe { NativeHandle::from_owned(ptr.cast(), "ImageFrame", delete_image_frame) }?;
        Ok(Self { handle })
    }

    /// Hands the native frame over to a packet constructor.
    pub(crate) fn into_raw(mut self) -> Result<*mut NativeImageFrame> {
        Ok(self.handle.release()?.cast())
    }

    fn ptr(&self) -> Result<*const NativeImageFrame> {
        Ok(self.handle.as_ptr()?.cast_const().cast())
    }

    pub fn format(&self) -> Result<ImageFormat> {
        // SAFETY: live until disposed.
        Ok(ImageFormat::from_raw(unsafe { native::mp_image_frame_format(self.ptr()?) }))
    }

    pub fn width(&self) -> Result<u32> {
        // SAFETY: `ptr` fails instead of returning a disposed object.
        Ok(unsafe { native::mp_image_frame_width(self.ptr()?) } as u32)
    }

    pub fn height(&self) -> Result<u32> {
        // SAFETY: `ptr` fails instead of returning a disposed object.
        Ok(unsafe { native::mp_image_frame_height(self.ptr()?) } as u32)
    }

    pub fn width_step(&self) -> Result<usize> {
        // SAFETY: `ptr` fails instead of returning a disposed object.
        Ok(unsafe { native::mp_image_frame_width_step(self.ptr()?) } as usize)
    }

    pub fn byte_depth(&self) -> Result<usize> {
        Ok(self.format()?.byte_depth())
    }

    pub fn number_of_channels(&self) -> Result<usize> {
        Ok(self.format()?.number_of_channels())
    }

    /// Raw bytes, including any row padding.
    pub fn pixel_data(&self) -> Result<Vec<u8>> {
        let ptr = self.ptr()?;
        // SAFETY: the getter allocates a buffer that `take_buffer` frees.
        unsafe { marshal::take_buffer("mp_image_frame_pixel_data", |out| native::mp_image_frame_pixel_data(ptr, out)) }
    }

    /// Copies the channel components row by row, dropping row padding.
    ///
    /// Fails with [`BridgeError::FormatMismatch`] if `P` does not match the
    /// format's byte depth.
    pub fn copy_to_vec<P: PixelComponent>(&self) -> Result<Vec<P>> {
        let format = self.format()?;
        if format.byte_depth() != P::BYTE_DEPTH {
            return Err(BridgeError::format_mismatch(
                format!("{}-byte components for {format:?}", format.byte_depth()),
                P::NAME,
            ));
        }
        let width = self.width()? as usize;
        let height = self.height()? as usize;
        let width_step = self.width_step()?;
        let row = width * format.pixel_bytes();
        let data = self.pixel_data()?;

        let mut out = Vec::with_capacity(width * height * format.number_of_channels());
        for y in 0..height {
            let start = y * width_step;
            let row_bytes = data.get(start..start + row).ok_or_else(|| {
                BridgeError::invalid_argument(format!("row {y} is outside the pixel buffer"))
            })?;
            out.extend(row_bytes.chunks_exact(P::BYTE_DEPTH).map(P::from_ne_slice));
        }
        Ok(out)
    }
}

impl ResourceHandle for ImageFrame {
    fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut NativeHandle {
        &mut self.handle
    }
}

impl fmt::Debug for ImageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.format(), self.width(), self.height()) {
            (Ok(format), Ok(w), Ok(h)) => write!(f, "ImageFrame({format:?} {w}x{h})"),
            _ => write!(f, "ImageFrame(<disposed>)"),
        }
    }
}
