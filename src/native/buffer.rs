//! Byte buffers handed across the boundary.
//!
//! Native allocates, the safe layer copies the bytes into its own memory, then
//! hands the allocation back to the matching `*_delete` function.

use std::ffi::{CString, c_char};
use std::ptr;

/// A native-owned byte run (a serialized message or a string).
#[repr(C)]
#[derive(Debug)]
pub struct SerializedBuffer {
    pub data: *mut u8,
    pub len: i32,
}

/// A native-owned array of [`SerializedBuffer`]s.
#[repr(C)]
#[derive(Debug)]
pub struct SerializedBufferVec {
    pub data: *mut SerializedBuffer,
    pub size: i32,
}

/// A native-owned `f32` array.
#[repr(C)]
#[derive(Debug)]
pub struct FloatArray {
    pub data: *mut f32,
    pub size: i32,
}

impl SerializedBuffer {
    pub const fn null() -> Self {
        Self { data: ptr::null_mut(), len: 0 }
    }

    pub(crate) fn alloc(bytes: Vec<u8>) -> Result<Self, String> {
        let len = native_len(bytes.len(), "byte buffer")?;
        let data = Box::into_raw(bytes.into_boxed_slice()) as *mut u8;
        Ok(Self { data, len })
    }
}

impl SerializedBufferVec {
    pub const fn null() -> Self {
        Self { data: ptr::null_mut(), size: 0 }
    }

    pub(crate) fn alloc(items: Vec<Vec<u8>>) -> Result<Self, String> {
        let size = native_len(items.len(), "message vector")?;
        // Checked up front so a failure never strands buffers allocated earlier.
        for item in &items {
            native_len(item.len(), "message")?;
        }
        let buffers = items.into_iter().map(SerializedBuffer::alloc).collect::<Result<Vec<_>, _>>()?;
        let data = Box::into_raw(buffers.into_boxed_slice()) as *mut SerializedBuffer;
        Ok(Self { data, size })
    }
}

impl FloatArray {
    pub const fn null() -> Self {
        Self { data: ptr::null_mut(), size: 0 }
    }

    pub(crate) fn alloc(values: Vec<f32>) -> Result<Self, String> {
        let size = native_len(values.len(), "float array")?;
        let data = Box::into_raw(values.into_boxed_slice()) as *mut f32;
        Ok(Self { data, size })
    }
}

/// Converts a length to the `i32` the ABI carries, refusing anything that does not fit.
pub(crate) fn native_len(len: usize, what: &str) -> Result<i32, String> {
    i32::try_from(len).map_err(|_| format!("{what} of {len} elements is too large to hand across the boundary"))
}

/// Frees a buffer produced by [`SerializedBuffer::alloc`].
///
/// # Safety
/// `data`/`len` must come from a single native allocation that was not freed yet.
pub unsafe extern "C" fn mp_serialized_buffer_delete(data: *mut u8, len: i32) {
    if data.is_null() {
        return;
    }
    // SAFETY: allocated as a boxed slice of exactly `len` bytes.
    drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(data, len as usize)) });
}

/// Frees a buffer vector and every buffer it contains.
///
/// # Safety
/// `data`/`size` must come from a single native allocation that was not freed yet.
pub unsafe extern "C" fn mp_serialized_buffer_vec_delete(data: *mut SerializedBuffer, size: i32) {
    if data.is_null() {
        return;
    }
    // SAFETY: allocated as a boxed slice of exactly `size` buffers.
    let buffers = unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(data, size as usize)) };
    for buffer in buffers.iter() {
        // SAFETY: each element owns its own allocation.
        unsafe { mp_serialized_buffer_delete(buffer.data, buffer.len) };
    }
}

/// # Safety
/// `data`/`size` must come from a single native allocation that was not freed yet.
pub unsafe extern "C" fn mp_float_array_delete(data: *mut f32, size: i32) {
    if data.is_null() {
        return;
    }
    // SAFETY: allocated as a boxed slice of exactly `size` floats.
    drop(unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(data, size as usize)) });
}

/// Frees a string returned by a native getter or passed in a [`crate::status::StatusArgs`].
///
/// # Safety
/// `ptr` must be null or come from [`alloc_cstring`].
pub unsafe extern "C" fn mp_cstring_delete(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    // SAFETY: created by `CString::into_raw`.
    drop(unsafe { CString::from_raw(ptr) });
}

/// Allocates a NUL-terminated copy of `s`; interior NULs are replaced.
pub(crate) fn alloc_cstring(s: &str) -> *mut c_char {
    let cleaned = s.replace('\0', "\u{FFFD}");
    match CString::new(cleaned) {
        Ok(c) => c.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_round_trip_and_free() {
        let buffer = SerializedBuffer::alloc(vec![1, 2, 3]).unwrap();
        assert_eq!(buffer.len, 3);
        let copy = unsafe { std::slice::from_raw_parts(buffer.data, buffer.len as usize) }.to_vec();
        assert_eq!(copy, vec![1, 2, 3]);
        unsafe { mp_serialized_buffer_delete(buffer.data, buffer.len) };
    }

    #[test]
    fn empty_vectors_are_safe_to_free() {
        let vec = SerializedBufferVec::alloc(Vec::new()).unwrap();
        assert_eq!(vec.size, 0);
        unsafe { mp_serialized_buffer_vec_delete(vec.data, vec.size) };
        unsafe { mp_serialized_buffer_delete(ptr::null_mut(), 0) };
        unsafe { mp_cstring_delete(ptr::null_mut()) };
    }

    #[test]
    fn lengths_beyond_i32_are_refused() {
        assert_eq!(native_len(i32::MAX as usize, "buffer"), Ok(i32::MAX));
        let err = native_len(i32::MAX as usize + 1, "buffer").unwrap_err();
        assert!(err.contains("too large"), "{err}");
    }

    #[test]
    fn cstrings_replace_interior_nul() {
        let raw = alloc_cstring("a\0b");
        let owned = unsafe { CString::from_raw(raw) };
        assert_eq!(owned.to_str().unwrap(), "a\u{FFFD}b");
    }
}
