//! Native packets: an optional shared payload plus a timestamp.
//!
//! Copies made with [`mp_packet_at`] share the payload. Consuming a payload
//! moves it out and is only allowed while a single packet refers to it.

use std::ffi::c_char;
use std::fmt;
use std::sync::Arc;

use super::buffer::{FloatArray, SerializedBuffer, SerializedBufferVec, alloc_cstring};
use super::gl::{NativeGpuBuffer, SharedGlTextureBuffer};
use super::image_frame::NativeImageFrame;
use super::status::NativeStatus;
use super::{ReturnCode, deref, deref_mut, guard, read_str, write_out};

/// Payload stored in a native packet.
pub(crate) enum NativeValue {
    Bool(bool),
    Int(i32),
    Float(f32),
    Double(f64),
    String(Vec<u8>),
    FloatVector(Vec<f32>),
    Proto { type_name: String, bytes: Vec<u8> },
    ProtoVector { type_name: String, items: Vec<Vec<u8>> },
    ImageFrame(NativeImageFrame),
    GpuBuffer(SharedGlTextureBuffer),
}

impl NativeValue {
    pub(crate) fn type_name(&self) -> String {
        match self {
            NativeValue::Bool(_) => "bool".to_string(),
            NativeValue::Int(_) => "int".to_string(),
            NativeValue::Float(_) => "float".to_string(),
            NativeValue::Double(_) => "double".to_string(),
            NativeValue::String(_) => "std::string".to_string(),
            NativeValue::FloatVector(_) => "std::vector<float>".to_string(),
            NativeValue::Proto { type_name, .. } => type_name.clone(),
            NativeValue::ProtoVector { type_name, .. } => format!("std::vector<{type_name}>"),
            NativeValue::ImageFrame(_) => "mediapipe::ImageFrame".to_string(),
            NativeValue::GpuBuffer(_) => "mediapipe::GpuBuffer".to_string(),
        }
    }
}

impl fmt::Debug for NativeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeValue::Bool(v) => write!(f, "{v}"),
            NativeValue::Int(v) => write!(f, "{v}"),
            NativeValue::Float(v) => write!(f, "{v}"),
            NativeValue::Double(v) => write!(f, "{v}"),
            NativeValue::String(v) => write!(f, "{:?}", String::from_utf8_lossy(v)),
            NativeValue::FloatVector(v) => write!(f, "{v:?}"),
            NativeValue::Proto { bytes, .. } => write!(f, "<{} bytes>", bytes.len()),
            NativeValue::ProtoVector { items, .. } => write!(f, "<{} messages>", items.len()),
            NativeValue::ImageFrame(frame) => write!(f, "{}x{}", frame.width, frame.height),
            NativeValue::GpuBuffer(buffer) => write!(f, "texture {}", buffer.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NativePacket {
    pub(crate) holder: Option<Arc<NativeValue>>,
    pub(crate) timestamp: i64,
}

impl NativePacket {
    pub(crate) fn new(value: NativeValue, timestamp: i64) -> Self {
        Self { holder: Some(Arc::new(value)), timestamp }
    }

    pub(crate) fn empty(timestamp: i64) -> Self {
        Self { holder: None, timestamp }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.holder.is_none()
    }

    pub(crate) fn value(&self) -> Result<&NativeValue, String> {
        self.holder.as_deref().ok_or_else(|| "packet is empty".to_string())
    }

    pub(crate) fn into_raw(self) -> *mut NativePacket {
        Box::into_raw(Box::new(self))
    }
}

impl fmt::Display for NativePacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.holder {
            Some(value) => write!(
                f,
                "mediapipe::Packet with timestamp: {} and type: {} ({value:?})",
                self.timestamp,
                value.type_name()
            ),
            None => write!(f, "mediapipe::Packet with timestamp: {} and no data", self.timestamp),
        }
    }
}

fn mismatch(expected: &str, value: &NativeValue) -> String {
    format!("packet holds {}, not {expected}", value.type_name())
}

/// # Safety
/// `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_new_empty(timestamp: i64, out: *mut *mut NativePacket) -> ReturnCode {
    guard("mp_packet_new_empty", || unsafe { write_out(out, NativePacket::empty(timestamp).into_raw()) })
}

macro_rules! scalar_packet {
    ($make:ident, $get:ident, $variant:ident, $ty:ty, $label:literal) => {
        /// # Safety
        /// `out` must be valid for writes.
        pub unsafe extern "C" fn $make(value: $ty, timestamp: i64, out: *mut *mut NativePacket) -> ReturnCode {
            guard(stringify!($make), || {
                let packet = NativePacket::new(NativeValue::$variant(value), timestamp);
                // SAFETY: out-pointers are valid for writes and null is rejected.
                unsafe { write_out(out, packet.into_raw()) }
            })
        }

        /// # Safety
        /// `packet` must point to a live packet; `out` must be valid for writes.
        pub unsafe extern "C" fn $get(packet: *const NativePacket, out: *mut $ty) -> ReturnCode {
            guard(stringify!($get), || {
                let value = unsafe { deref(packet, "packet") }?.value()?;
                match value {
                    // SAFETY: out-pointers are valid for writes and null is rejected.
                    NativeValue::$variant(v) => unsafe { write_out(out, *v) },
                    other => Err(mismatch($label, other)),
                }
            })
        }
    };
}

scalar_packet!(mp_packet_make_bool, mp_packet_get_bool, Bool, bool, "bool");
scalar_packet!(mp_packet_make_int, mp_packet_get_int, Int, i32, "int");
scalar_packet!(mp_packet_make_float, mp_packet_get_float, Float, f32, "float");
scalar_packet!(mp_packet_make_double, mp_packet_get_double, Double, f64, "double");

unsafe fn copy_slice<T: Clone>(data: *const T, len: i32) -> Result<Vec<T>, String> {
    if len < 0 {
        return Err(format!("negative length {len}"));
    }
    if len == 0 {
        return Ok(Vec::new());
    }
    if data.is_null() {
        return Err("data pointer is null".to_string());
    }
    // SAFETY: caller guarantees `len` readable elements.
    Ok(unsafe { std::slice::from_raw_parts(data, len as usize) }.to_vec())
}

/// # Safety
/// `data` must be valid for `len` reads; `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_make_string(
    data: *const u8,
    len: i32,
    timestamp: i64,
    out: *mut *mut NativePacket,
) -> ReturnCode {
    guard("mp_packet_make_string", || {
        // SAFETY: input buffers hold the stated number of items; out-pointers are valid for writes and null is rejected.
        let bytes = unsafe { copy_slice(data, len) }?;
        unsafe { write_out(out, NativePacket::new(NativeValue::String(bytes), timestamp).into_raw()) }
    })
}

/// # Safety
/// `data` must be valid for `len` reads; `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_make_float_vector(
    data: *const f32,
    len: i32,
    timestamp: i64,
    out: *mut *mut NativePacket,
) -> ReturnCode {
    guard("mp_packet_make_float_vector", || {
        // SAFETY: input buffers hold the stated number of items; out-pointers are valid for writes and null is rejected.
        let values = unsafe { copy_slice(data, len) }?;
        let packet = NativePacket::new(NativeValue::FloatVector(values), timestamp);
        unsafe { write_out(out, packet.into_raw()) }
    })
}

/// # Safety
/// `type_name` must be NUL-terminated; `data` must be valid for `len` reads.
pub unsafe extern "C" fn mp_packet_make_proto(
    type_name: *const c_char,
    data: *const u8,
    len: i32,
    timestamp: i64,
    out: *mut *mut NativePacket,
) -> ReturnCode {
    guard("mp_packet_make_proto", || {
        // SAFETY: strings are NUL-terminated and buffers hold the stated number of items; out-pointers are valid for writes and null is rejected.
        let type_name = unsafe { read_str(type_name) }?;
        let bytes = unsafe { copy_slice(data, len) }?;
        let packet = NativePacket::new(NativeValue::Proto { type_name, bytes }, timestamp);
        unsafe { write_out(out, packet.into_raw()) }
    })
}

/// Copies `size` serialized messages. The buffers stay owned by the caller.
///
/// # Safety
/// `items` must be valid for `size` reads and each buffer for its own length.
pub unsafe extern "C" fn mp_packet_make_proto_vector(
    type_name: *const c_char,
    items: *const SerializedBuffer,
    size: i32,
    timestamp: i64,
    out: *mut *mut NativePacket,
) -> ReturnCode {
    guard("mp_packet_make_proto_vector", || {
        // SAFETY: strings are NUL-terminated and buffers hold the stated number of items.
        let type_name = unsafe { read_str(type_name) }?;
        let buffers = unsafe { copy_slice(items.cast::<RawBuffer>(), size) }?;
        let mut copied = Vec::with_capacity(buffers.len());
        for buffer in buffers {
            // SAFETY: input buffers hold the stated number of items.
            copied.push(unsafe { copy_slice(buffer.data, buffer.len) }?);
        }
        let packet = NativePacket::new(NativeValue::ProtoVector { type_name, items: copied }, timestamp);
        // SAFETY: out-pointers are valid for writes and null is rejected.
        unsafe { write_out(out, packet.into_raw()) }
    })
}

/// Plain-data view of a [`SerializedBuffer`] so it can be copied without moving ownership.
#[repr(C)]
#[derive(Clone, Copy)]
struct RawBuffer {
    data: *const u8,
    len: i32,
}

/// Moves an image frame into a new packet.
///
/// # Safety
/// `frame` must be a live image frame; it is freed by this call.
pub unsafe extern "C" fn mp_packet_make_image_frame(
    frame: *mut NativeImageFrame,
    timestamp: i64,
    out: *mut *mut NativePacket,
) -> ReturnCode {
    guard("mp_packet_make_image_frame", || {
        if frame.is_null() {
            return Err("image frame is null".to_string());
        }
        // SAFETY: ownership moves into the packet.
        let frame = unsafe { Box::from_raw(frame) };
        let packet = NativePacket::new(NativeValue::ImageFrame(*frame), timestamp);
        unsafe { write_out(out, packet.into_raw()) }
    })
}

/// Moves a GPU buffer into a new packet.
///
/// # Safety
/// `buffer` must be a live GPU buffer; it is freed by this call.
pub unsafe extern "C" fn mp_packet_make_gpu_buffer(
    buffer: *mut NativeGpuBuffer,
    timestamp: i64,
    out: *mut *mut NativePacket,
) -> ReturnCode {
    guard("mp_packet_make_gpu_buffer", || {
        if buffer.is_null() {
            return Err("GPU buffer is null".to_string());
        }
        // SAFETY: ownership moves into the packet.
        let buffer = unsafe { Box::from_raw(buffer) };
        let packet = NativePacket::new(NativeValue::GpuBuffer(buffer.0), timestamp);
        unsafe { write_out(out, packet.into_raw()) }
    })
}

/// # Safety
/// `packet` must be null or a live packet not freed yet.
pub unsafe extern "C" fn mp_packet_delete(packet: *mut NativePacket) {
    if !packet.is_null() {
        // SAFETY: allocated with `Box::into_raw`.
        drop(unsafe { Box::from_raw(packet) });
    }
}

/// # Safety
/// `packet` must point to a live packet.
pub unsafe extern "C" fn mp_packet_is_empty(packet: *const NativePacket) -> bool {
    unsafe { deref(packet, "packet") }.map(NativePacket::is_empty).unwrap_or(true)
}

/// # Safety
/// `packet` must point to a live packet.
pub unsafe extern "C" fn mp_packet_timestamp(packet: *const NativePacket) -> i64 {
    unsafe { deref(packet, "packet") }.map(|p| p.timestamp).unwrap_or(i64::MIN)
}

/// Creates a packet that shares the payload of `packet` at a new timestamp.
///
/// # Safety
/// `packet` must point to a live packet; `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_at(
    packet: *const NativePacket,
    timestamp: i64,
    out: *mut *mut NativePacket,
) -> ReturnCode {
    guard("mp_packet_at", || {
        // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
        let packet = unsafe { deref(packet, "packet") }?;
        let copy = NativePacket { holder: packet.holder.clone(), timestamp };
        unsafe { write_out(out, copy.into_raw()) }
    })
}

/// Moves the payload out of `packet` into a new packet.
///
/// Fails with a FailedPrecondition status if the packet is empty or shares its
/// payload with another packet. On success `packet` is left empty.
///
/// # Safety
/// `packet` must point to a live packet; both out-pointers must be valid for writes.
pub unsafe extern "C" fn mp_packet_consume(
    packet: *mut NativePacket,
    status_out: *mut *mut NativeStatus,
    value_out: *mut *mut NativePacket,
) -> ReturnCode {
    guard("mp_packet_consume", || {
        // SAFETY: the caller passes live objects or null.
        let packet = unsafe { deref_mut(packet, "packet") }?;
        let shared = packet.holder.as_ref().map(|holder| Arc::strong_count(holder) > 1);
        let status = match shared {
            None => NativeStatus::failed_precondition("packet is empty"),
            Some(true) => NativeStatus::failed_precondition(
                "packet payload is shared with another packet and cannot be consumed",
            ),
            Some(false) => {
                let taken = NativePacket { holder: packet.holder.take(), timestamp: packet.timestamp };
                // SAFETY: out-pointers are valid for writes and null is rejected.
                unsafe { write_out(value_out, taken.into_raw()) }?;
                NativeStatus::ok()
            }
        };
        // SAFETY: out-pointers are valid for writes and null is rejected.
        unsafe { write_out(status_out, status.into_raw()) }
    })
}

/// # Safety
/// `packet` must point to a live packet; `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_registered_type_name(
    packet: *const NativePacket,
    out: *mut *mut c_char,
) -> ReturnCode {
    guard("mp_packet_registered_type_name", || {
        // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
        let packet = unsafe { deref(packet, "packet") }?;
        let name = packet.holder.as_ref().map(|v| v.type_name()).unwrap_or_default();
        unsafe { write_out(out, alloc_cstring(&name)) }
    })
}

/// # Safety
/// `packet` must point to a live packet; `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_debug_string(
    packet: *const NativePacket,
    out: *mut *mut c_char,
) -> ReturnCode {
    guard("mp_packet_debug_string", || {
        // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
        let packet = unsafe { deref(packet, "packet") }?;
        unsafe { write_out(out, alloc_cstring(&packet.to_string())) }
    })
}

/// # Safety
/// `packet` must point to a live packet; `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_get_string(
    packet: *const NativePacket,
    out: *mut SerializedBuffer,
) -> ReturnCode {
    // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
    guard("mp_packet_get_string", || match unsafe { deref(packet, "packet") }?.value()? {
        NativeValue::String(bytes) => unsafe { write_out(out, SerializedBuffer::alloc(bytes.clone())?) },
        other => Err(mismatch("std::string", other)),
    })
}

/// # Safety
/// `packet` must point to a live packet; `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_get_float_vector(
    packet: *const NativePacket,
    out: *mut FloatArray,
) -> ReturnCode {
    // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
    guard("mp_packet_get_float_vector", || match unsafe { deref(packet, "packet") }?.value()? {
        NativeValue::FloatVector(values) => unsafe { write_out(out, FloatArray::alloc(values.clone())?) },
        other => Err(mismatch("std::vector<float>", other)),
    })
}

/// # Safety
/// `packet` must point to a live packet; `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_get_proto(
    packet: *const NativePacket,
    out: *mut SerializedBuffer,
) -> ReturnCode {
    // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
    guard("mp_packet_get_proto", || match unsafe { deref(packet, "packet") }?.value()? {
        NativeValue::Proto { bytes, .. } => unsafe { write_out(out, SerializedBuffer::alloc(bytes.clone())?) },
        other => Err(mismatch("a serialized message", other)),
    })
}

/// # Safety
/// `packet` must point to a live packet; `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_get_proto_vector(
    packet: *const NativePacket,
    out: *mut SerializedBufferVec,
) -> ReturnCode {
    // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
    guard("mp_packet_get_proto_vector", || match unsafe { deref(packet, "packet") }?.value()? {
        NativeValue::ProtoVector { items, .. } => {
            unsafe { write_out(out, SerializedBufferVec::alloc(items.clone())?) }
        }
        other => Err(mismatch("a message vector", other)),
    })
}

/// Writes a copy of the image frame payload.
///
/// # Safety
/// `packet` must point to a live packet; `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_get_image_frame(
    packet: *const NativePacket,
    out: *mut *mut NativeImageFrame,
) -> ReturnCode {
    // SAFETY: the caller passes live objects or null; out-pointers are valid for writes and null is rejected.
    guard("mp_packet_get_image_frame", || match unsafe { deref(packet, "packet") }?.value()? {
        NativeValue::ImageFrame(frame) => unsafe { write_out(out, Box::into_raw(Box::new(frame.clone()))) },
        other => Err(mismatch("mediapipe::ImageFrame", other)),
    })
}

/// Writes a new reference to the GPU buffer payload.
///
/// # Safety
/// `packet` must point to a live packet; `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_get_gpu_buffer(
    packet: *const NativePacket,
    out: *mut *mut NativeGpuBuffer,
) -> ReturnCode {
    // SAFETY: the caller passes live objects or null.
    guard("mp_packet_get_gpu_buffer", || match unsafe { deref(packet, "packet") }?.value()? {
        NativeValue::GpuBuffer(buffer) => {
            let gpu = NativeGpuBuffer(Arc::clone(buffer));
            // SAFETY: out-pointers are valid for writes and null is rejected.
            unsafe { write_out(out, Box::into_raw(Box::new(gpu))) }
        }
        other => Err(mismatch("mediapipe::GpuBuffer", other)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::status::{mp_status_delete, mp_status_ok};
    use std::ptr;

    fn make_int(value: i32) -> *mut NativePacket {
        let mut packet = ptr::null_mut();
        assert_eq!(unsafe { mp_packet_make_int(value, 10, &mut packet) }, ReturnCode::Success);
        packet
    }

    #[test]
    fn getters_reject_other_types() {
        let packet = make_int(7);
        let mut out = false;
        assert_eq!(unsafe { mp_packet_get_bool(packet, &mut out) }, ReturnCode::StandardError);
        let mut value = 0;
        assert_eq!(unsafe { mp_packet_get_int(packet, &mut value) }, ReturnCode::Success);
        assert_eq!(value, 7);
        unsafe { mp_packet_delete(packet) };
    }

    #[test]
    fn consume_requires_sole_ownership() {
        let packet = make_int(3);
        let mut copy = ptr::null_mut();
        unsafe { mp_packet_at(packet, 20, &mut copy) };

        let mut status = ptr::null_mut();
        let mut taken = ptr::null_mut();
        unsafe { mp_packet_consume(packet, &mut status, &mut taken) };
        assert!(!unsafe { mp_status_ok(status) });
        assert!(taken.is_null());
        unsafe { mp_status_delete(status) };

        unsafe { mp_packet_delete(copy) };
        unsafe { mp_packet_consume(packet, &mut status, &mut taken) };
        assert!(unsafe { mp_status_ok(status) });
        assert!(unsafe { mp_packet_is_empty(packet) });
        assert_eq!(unsafe { mp_packet_timestamp(taken) }, 10);
        unsafe {
            mp_status_delete(status);
            mp_packet_delete(taken);
            mp_packet_delete(packet);
        }
    }

    #[test]
    fn debug_string_mentions_type_and_timestamp() {
        let packet = make_int(1);
        assert!(unsafe { &*packet }.to_string().contains("type: int"));
        assert!(unsafe { &*packet }.to_string().contains("timestamp: 10"));
        unsafe { mp_packet_delete(packet) };
    }
}
