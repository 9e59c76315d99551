//! Copy-then-free helpers for data returned by native getters.

use std::ffi::{CStr, CString, c_char};

use crate::error::{BridgeError, Result};
use crate::native::{self, FloatArray, ReturnCode, SerializedBuffer, SerializedBufferVec};

pub(crate) fn to_cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| BridgeError::invalid_argument(format!("{s:?} contains a NUL byte")))
}

/// Length of a buffer handed to native, which counts in `i32`.
pub(crate) fn native_len(len: usize) -> Result<i32> {
    i32::try_from(len)
        .map_err(|_| BridgeError::invalid_argument(format!("{len} elements do not fit in a native length")))
}

/// Copies a native buffer into managed memory and frees the native allocation.
///
/// # Safety
/// `buffer` must come from a native getter and not be freed yet.
pub(crate) unsafe fn copy_and_free(buffer: SerializedBuffer) -> Vec<u8> {
    let bytes = if buffer.data.is_null() || buffer.len <= 0 {
        Vec::new()
    } else {
        // SAFETY: native guarantees `len` readable bytes.
        unsafe { std::slice::from_raw_parts(buffer.data, buffer.len as usize) }.to_vec()
    };
    // SAFETY: the allocation came from native and is freed exactly once, here.
    unsafe { native::mp_serialized_buffer_delete(buffer.data, buffer.len) };
    bytes
}

/// Calls a getter that writes a [`SerializedBuffer`] and returns a managed copy.
///
/// # Safety
/// `call` must write a native-allocated buffer on success.
pub(crate) unsafe fn take_buffer(
    operation: &'static str,
    call: impl FnOnce(*mut SerializedBuffer) -> ReturnCode,
) -> Result<Vec<u8>> {
    let mut buffer = SerializedBuffer::null();
    call(&mut buffer).check(operation)?;
    // SAFETY: the getter succeeded, so `buffer` is a fresh native allocation.
    Ok(unsafe { copy_and_free(buffer) })
}

/// Calls a getter that writes a [`SerializedBufferVec`] and returns managed copies.
///
/// # Safety
/// `call` must write a native-allocated buffer vector on success.
pub(crate) unsafe fn take_buffer_vec(
    operation: &'static str,
    call: impl FnOnce(*mut SerializedBufferVec) -> ReturnCode,
) -> Result<Vec<Vec<u8>>> {
    let mut vec = SerializedBufferVec::null();
    call(&mut vec).check(operation)?;
    let mut items = Vec::with_capacity(vec.size.max(0) as usize);
    if !vec.data.is_null() {
        // SAFETY: native guarantees `size` buffers.
        let buffers = unsafe { std::slice::from_raw_parts(vec.data, vec.size as usize) };
        for buffer in buffers {
            if buffer.data.is_null() || buffer.len <= 0 {
                items.push(Vec::new());
                continue;
            }
            // SAFETY: each buffer stays valid until the vector is freed below.
            items.push(unsafe { std::slice::from_raw_parts(buffer.data, buffer.len as usize) }.to_vec());
        }
    }
    // SAFETY: the allocation came from native and is freed exactly once, here.
    unsafe { native::mp_serialized_buffer_vec_delete(vec.data, vec.size) };
    Ok(items)
}

/// # Safety
/// `call` must write a native-allocated float array on success.
pub(crate) unsafe fn take_floats(
    operation: &'static str,
    call: impl FnOnce(*mut FloatArray) -> ReturnCode,
) -> Result<Vec<f32>> {
    let mut array = FloatArray::null();
    call(&mut array).check(operation)?;
    let values = if array.data.is_null() || array.size <= 0 {
        Vec::new()
    } else {
        // SAFETY: native guarantees `size` floats.
        unsafe { std::slice::from_raw_parts(array.data, array.size as usize) }.to_vec()
    };
    // SAFETY: the allocation came from native and is freed exactly once, here.
    unsafe { native::mp_float_array_delete(array.data, array.size) };
    Ok(values)
}

/// Calls a getter that writes a native-allocated C string.
///
/// # Safety
/// `call` must write null or a string allocated by native.
pub(crate) unsafe fn take_cstring(
    operation: &'static str,
    call: impl FnOnce(*mut *mut c_char) -> ReturnCode,
) -> Result<String> {
    let mut raw: *mut c_char = std::ptr::null_mut();
    call(&mut raw).check(operation)?;
    if raw.is_null() {
        return Ok(String::new());
    }
    // SAFETY: NUL-terminated per the getter contract.
    let text = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
    unsafe { native::mp_cstring_delete(raw) };
    Ok(text)
}
