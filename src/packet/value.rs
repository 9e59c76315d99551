//! Conversions between managed values and native packet payloads.

use prost::Message as _;

use crate::error::{BridgeError, Result};
use crate::gpu::GpuBuffer;
use crate::image_frame::ImageFrame;
use crate::marshal;
use crate::native::{self, NativePacket, SerializedBuffer};
use crate::proto::NamedMessage;
use crate::timestamp::Timestamp;

/// Broad category of a packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Scalar,
    Message,
    MessageVector,
    Image,
    GpuBuffer,
}

/// A value that can travel inside a [`Packet`](super::Packet).
pub trait PacketValue: Sized {
    const KIND: PayloadKind;

    /// Name the native side registers this payload type under.
    fn type_name() -> String;

    /// Allocates a native packet holding `self`. The caller owns the result.
    fn into_native(self, timestamp: Timestamp) -> Result<*mut NativePacket>;

    /// Copies the payload out of a live, non-empty native packet.
    ///
    /// # Safety
    /// `packet` must point to a live native packet.
    unsafe fn read(packet: *const NativePacket) -> Result<Self>;
}

fn new_packet(
    operation: &'static str,
    make: impl FnOnce(*mut *mut NativePacket) -> native::ReturnCode,
) -> Result<*mut NativePacket> {
    let mut raw = std::ptr::null_mut();
    make(&mut raw).check(operation)?;
    Ok(raw)
}

macro_rules! scalar_value {
    ($ty:ty, $name:literal, $make:ident, $get:ident) => {
        impl PacketValue for $ty {
            const KIND: PayloadKind = PayloadKind::Scalar;

            fn type_name() -> String {
                $name.to_string()
            }

            fn into_native(self, timestamp: Timestamp) -> Result<*mut NativePacket> {
                // SAFETY: `out` is valid for writes.
                new_packet(stringify!($make), |out| unsafe { native::$make(self, timestamp.micros(), out) })
            }

            unsafe fn read(packet: *const NativePacket) -> Result<Self> {
                let mut value = <$ty>::default();
                // SAFETY: `packet` is live per the caller; `value` is valid for writes.
                unsafe { native::$get(packet, &mut value) }.check(stringify!($get))?;
                Ok(value)
            }
        }
    };
}

scalar_value!(bool, "bool", mp_packet_make_bool, mp_packet_get_bool);
scalar_value!(i32, "int", mp_packet_make_int, mp_packet_get_int);
scalar_value!(f32, "float", mp_packet_make_float, mp_packet_get_float);
scalar_value!(f64, "double", mp_packet_make_double, mp_packet_get_double);

impl PacketValue for String {
    const KIND: PayloadKind = PayloadKind::Scalar;

    fn type_name() -> String {
        "std::string".to_string()
    }

    fn into_native(self, timestamp: Timestamp) -> Result<*mut NativePacket> {
        let bytes = self.as_bytes();
        let len = marshal::native_len(bytes.len())?;
        // SAFETY: `bytes` outlives the call; native copies it.
        new_packet("mp_packet_make_string", |out| unsafe {
            native::mp_packet_make_string(bytes.as_ptr(), len, timestamp.micros(), out)
        })
    }

    unsafe fn read(packet: *const NativePacket) -> Result<Self> {
        // SAFETY: `packet` is live per the caller.
        let bytes =
            unsafe { marshal::take_buffer("mp_packet_get_string", |out| native::mp_packet_get_string(packet, out)) }?;
        String::from_utf8(bytes).map_err(|e| BridgeError::format_mismatch("UTF-8 string", e.to_string()))
    }
}

impl PacketValue for Vec<f32> {
    const KIND: PayloadKind = PayloadKind::Scalar;

    fn type_name() -> String {
        "std::vector<float>".to_string()
    }

    fn into_native(self, timestamp: Timestamp) -> Result<*mut NativePacket> {
        let len = marshal::native_len(self.len())?;
        // SAFETY: `self` outlives the call; native copies it.
        new_packet("mp_packet_make_float_vector", |out| unsafe {
            native::mp_packet_make_float_vector(self.as_ptr(), len, timestamp.micros(), out)
        })
    }

    unsafe fn read(packet: *const NativePacket) -> Result<Self> {
        // SAFETY: `packet` is live per the caller.
        unsafe {
            marshal::take_floats("mp_packet_get_float_vector", |out| native::mp_packet_get_float_vector(packet, out))
        }
    }
}

impl PacketValue for ImageFrame {
    const KIND: PayloadKind = PayloadKind::Image;

    fn type_name() -> String {
        "mediapipe::ImageFrame".to_string()
    }

    fn into_native(self, timestamp: Timestamp) -> Result<*mut NativePacket> {
        let frame = self.into_raw()?;
        // SAFETY: ownership of `frame` moves into the packet.
        new_packet("mp_packet_make_image_frame", |out| unsafe {
            native::mp_packet_make_image_frame(frame, timestamp.micros(), out)
        })
    }

    unsafe fn read(packet: *const NativePacket) -> Result<Self> {
        let mut raw = std::ptr::null_mut();
        // SAFETY: `packet` is live per the caller; `raw` is valid for writes.
        unsafe { native::mp_packet_get_image_frame(packet, &mut raw) }.check("mp_packet_get_image_frame")?;
        // SAFETY: the getter wrote a new frame reference that we now own.
        unsafe { ImageFrame::from_owned(raw) }
    }
}

impl PacketValue for GpuBuffer {
    const KIND: PayloadKind = PayloadKind::GpuBuffer;

    fn type_name() -> String {
        "mediapipe::GpuBuffer".to_string()
    }

    fn into_native(self, timestamp: Timestamp) -> Result<*mut NativePacket> {
        let buffer = self.into_raw()?;
        // SAFETY: ownership of `buffer` moves into the packet.
        new_packet("mp_packet_make_gpu_buffer", |out| unsafe {
            native::mp_packet_make_gpu_buffer(buffer, timestamp.micros(), out)
        })
    }

    unsafe fn read(packet: *const NativePacket) -> Result<Self> {
        let mut raw = std::ptr::null_mut();
        // SAFETY: `packet` is live per the caller; `raw` is valid for writes.
        unsafe { native::mp_packet_get_gpu_buffer(packet, &mut raw) }.check("mp_packet_get_gpu_buffer")?;
        // SAFETY: the getter wrote a new buffer reference that we now own.
        unsafe { GpuBuffer::from_owned(raw) }
    }
}

pub(crate) fn message_into_native<M: NamedMessage>(message: &M, timestamp: Timestamp) -> Result<*mut NativePacket> {
    let type_name = marshal::to_cstring(M::TYPE_NAME)?;
    let bytes = message.encode_to_vec();
    let len = marshal::native_len(bytes.len())?;
    // SAFETY: both buffers outlive the call; native copies them.
    new_packet("mp_packet_make_proto", |out| unsafe {
        native::mp_packet_make_proto(type_name.as_ptr(), bytes.as_ptr(), len, timestamp.micros(), out)
    })
}

/// # Safety
/// `packet` must point to a live native packet.
pub(crate) unsafe fn message_read<M: NamedMessage>(packet: *const NativePacket) -> Result<M> {
    // SAFETY: `packet` is live per the caller.
    let bytes = unsafe { marshal::take_buffer("mp_packet_get_proto", |out| native::mp_packet_get_proto(packet, out)) }?;
    M::decode(bytes.as_slice()).map_err(|e| BridgeError::format_mismatch(M::TYPE_NAME, e.to_string()))
}

pub(crate) fn messages_into_native<M: NamedMessage>(
    messages: &[M],
    timestamp: Timestamp,
) -> Result<*mut NativePacket> {
    let type_name = marshal::to_cstring(M::TYPE_NAME)?;
    let encoded: Vec<Vec<u8>> = messages.iter().map(|m| m.encode_to_vec()).collect();
    let views = encoded
        .iter()
        .map(|bytes| Ok(SerializedBuffer { data: bytes.as_ptr().cast_mut(), len: marshal::native_len(bytes.len())? }))
        .collect::<Result<Vec<_>>>()?;
    let count = marshal::native_len(views.len())?;
    // SAFETY: `encoded` and `views` outlive the call; native only reads them.
    new_packet("mp_packet_make_proto_vector", |out| unsafe {
        native::mp_packet_make_proto_vector(
            type_name.as_ptr(),
            views.as_ptr(),
            count,
            timestamp.micros(),
            out,
        )
    })
}

/// # Safety
/// `packet` must point to a live native packet.
pub(crate) unsafe fn messages_read<M: NamedMessage>(packet: *const NativePacket) -> Result<Vec<M>> {
    // SAFETY: `packet` is live per the caller.
    let items = unsafe {
        marshal::take_buffer_vec("mp_packet_get_proto_vector", |out| native::mp_packet_get_proto_vector(packet, out))
    }?;
    items
        .iter()
        .map(|bytes| {
            M::decode(bytes.as_slice()).map_err(|e| BridgeError::format_mismatch(M::TYPE_NAME, e.to_string()))
        })
        .collect()
}

/// Implements [`PacketValue`] for message types and vectors of them.
macro_rules! message_payload {
    ($($ty:ty),* $(,)?) => {
        $(
            impl $crate::packet::PacketValue for $ty {
                const KIND: $crate::packet::PayloadKind = $crate::packet::PayloadKind::Message;

                fn type_name() -> String {
                    <$ty as $crate::proto::NamedMessage>::TYPE_NAME.to_string()
                }

                fn into_native(
                    self,
                    timestamp: $crate::Timestamp,
                ) -> $crate::Result<*mut $crate::native::NativePacket> {
                    $crate::packet::value::message_into_native(&self, timestamp)
                }

                unsafe fn read(packet: *const $crate::native::NativePacket) -> $crate::Result<Self> {
                    // SAFETY: forwarded from the caller.
                    unsafe { $crate::packet::value::message_read(packet) }
                }
            }

            impl $crate::packet::PacketValue for Vec<$ty> {
                const KIND: $crate::packet::PayloadKind = $crate::packet::PayloadKind::MessageVector;

                fn type_name() -> String {
                    format!("std::vector<{}>", <$ty as $crate::proto::NamedMessage>::TYPE_NAME)
                }

                fn into_native(
                    self,
                    timestamp: $crate::Timestamp,
                ) -> $crate::Result<*mut $crate::native::NativePacket> {
                    $crate::packet::value::messages_into_native(&self, timestamp)
                }

                unsafe fn read(packet: *const $crate::native::NativePacket) -> $crate::Result<Self> {
                    // SAFETY: forwarded from the caller.
                    unsafe { $crate::packet::value::messages_read(packet) }
                }
            }
        )*
    };
}

pub(crate) use message_payload;
