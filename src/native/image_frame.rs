use super::buffer::SerializedBuffer;
use super::{ReturnCode, deref, guard, write_out};

/// CPU image storage. `format` is the raw [`crate::ImageFormat`] discriminant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeImageFrame {
    pub(crate) format: i32,
    pub(crate) width: i32,
    pub(crate) height: i32,
    pub(crate) width_step: i32,
    pub(crate) pixels: Vec<u8>,
}

/// Copies `len` bytes of pixel data into a new image frame.
///
/// # Safety
/// `pixels` must be valid for `len` reads; `out` must be valid for writes.
pub unsafe extern "C" fn mp_image_frame_new(
    format: i32,
    width: i32,
    height: i32,
    width_step: i32,
    pixels: *const u8,
    len: i32,
    out: *mut *mut NativeImageFrame,
) -> ReturnCode {
    guard("mp_image_frame_new", || {
        if width <= 0 || height <= 0 || width_step <= 0 {
            return Err(format!("invalid dimensions {width}x{height} step {width_step}"));
        }
        let expected = width_step as usize * height as usize;
        if len < 0 || (len as usize) < expected {
            return Err(format!("pixel buffer holds {len} bytes, {expected} required"));
        }
        if pixels.is_null() {
            return Err("pixel pointer is null".to_string());
        }
        // SAFETY: caller guarantees `len` readable bytes.
        let data = unsafe { std::slice::from_raw_parts(pixels, expected) }.to_vec();
        let frame = NativeImageFrame { format, width, height, width_step, pixels: data };
        unsafe { write_out(out, Box::into_raw(Box::new(frame))) }
    })
}

/// # Safety
/// `frame` must be null or a live image frame that is not referenced elsewhere.
pub unsafe extern "C" fn mp_image_frame_delete(frame: *mut NativeImageFrame) {
    if !frame.is_null() {
        // SAFETY: allocated with `Box::into_raw`.
        drop(unsafe { Box::from_raw(frame) });
    }
}

macro_rules! image_frame_getter {
    ($name:ident, $field:ident) => {
        /// # Safety
        /// `frame` must point to a live image frame.
        pub unsafe extern "C" fn $name(frame: *const NativeImageFrame) -> i32 {
            unsafe { deref(frame, "image frame") }.map(|f| f.$field).unwrap_or(0)
        }
    };
}

image_frame_getter!(mp_image_frame_format, format);
image_frame_getter!(mp_image_frame_width, width);
image_frame_getter!(mp_image_frame_height, height);
image_frame_getter!(mp_image_frame_width_step, width_step);

/// Copies the pixel bytes; free the buffer with `mp_serialized_buffer_delete`.
///
/// # Safety
/// `frame` must point to a live image frame; `out` must be valid for writes.
pub unsafe extern "C" fn mp_image_frame_pixel_data(
    frame: *const NativeImageFrame,
    out: *mut SerializedBuffer,
) -> ReturnCode {
    guard("mp_image_frame_pixel_data", || {
        // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
        let frame = unsafe { deref(frame, "image frame") }?;
        unsafe { write_out(out, SerializedBuffer::alloc(frame.pixels.clone())?) }
    })
}
