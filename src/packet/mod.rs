//! Typed packets.
//!
//! A [`Packet<T>`] owns (or, inside a stream callback, borrows) a native packet
//! whose payload is a `T`. Reading copies the payload into managed memory;
//! [`Packet::consume`] moves it out and leaves the packet disposed.

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;

use crate::error::{BridgeError, Result};
use crate::handle::{NativeHandle, ResourceHandle};
use crate::marshal;
use crate::native::{self, NativePacket};
use crate::status::Status;
use crate::timestamp::Timestamp;

mod map;
pub(crate) mod value;

pub use map::{PacketMap, SidePacket};
pub(crate) use value::message_payload;
pub use value::{PacketValue, PayloadKind};

unsafe fn delete_packet(ptr: *mut c_void) {
    // SAFETY: only installed as the deleter of owned packet handles.
    unsafe { native::mp_packet_delete(ptr.cast()) }
}

pub struct Packet<T> {
    handle: NativeHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: PacketValue> Packet<T> {
    /// Wraps `value` in a packet without a timestamp.
    pub fn new(value: T) -> Result<Self> {
        Self::new_at(value, Timestamp::UNSET)
    }

    pub fn new_at(value: T, timestamp: Timestamp) -> Result<Self> {
        let raw = value.into_native(timestamp)?;
        // SAFETY: `into_native` returns a fresh packet owned by the caller.
        unsafe { Self::from_owned(raw) }
    }

    /// A packet without payload.
    pub fn empty() -> Result<Self> {
        Self::empty_at(Timestamp::UNSET)
    }

    pub fn empty_at(timestamp: Timestamp) -> Result<Self> {
        // SAFETY: the constructor writes a fresh packet.
        let handle = unsafe {
            NativeHandle::create("Packet", delete_packet, |out| {
                native::mp_packet_new_empty(timestamp.micros(), out.cast())
            })
        }?;
        Ok(Self { handle, _marker: PhantomData })
    }

    /// # Safety
    /// `raw` must be a live native packet that nothing else frees.
    pub(crate) unsafe fn from_owned(raw: *mut NativePacket) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        let handle = unsafe { NativeHandle::from_owned(raw.cast(), "Packet", delete_packet) }?;
        Ok(Self { handle, _marker: PhantomData })
    }

    /// Wraps a packet owned by native, such as the one passed to a stream callback.
    ///
    /// # Safety
    /// `raw` must stay valid while the returned packet is used.
    pub(crate) unsafe fn borrowed(raw: *const NativePacket) -> Self {
        // SAFETY: forwarded from the caller; a borrowed handle never frees `raw`.
        let handle = unsafe { NativeHandle::borrowed(raw.cast_mut().cast(), "Packet") };
        Self { handle, _marker: PhantomData }
    }

    pub(crate) fn ptr(&self) -> Result<*mut NativePacket> {
        Ok(self.handle.as_ptr()?.cast())
    }

    /// Hands the native packet over to a call that takes ownership of it.
    pub(crate) fn into_raw(mut self) -> Result<*mut NativePacket> {
        Ok(self.handle.release()?.cast())
    }

    pub fn is_empty(&self) -> Result<bool> {
        // SAFETY: live until disposed.
        Ok(unsafe { native::mp_packet_is_empty(self.ptr()?) })
    }

    pub fn timestamp(&self) -> Result<Timestamp> {
        // SAFETY: live until disposed.
        Ok(Timestamp::new(unsafe { native::mp_packet_timestamp(self.ptr()?) }))
    }

    /// Copies the payload.
    pub fn get(&self) -> Result<T> {
        let ptr = self.ptr()?;
        if self.is_empty()? {
            return Err(BridgeError::EmptyPacket);
        }
        // SAFETY: `ptr` is live and non-empty.
        unsafe { T::read(ptr) }.map_err(|e| self.explain(e))
    }

    /// Copies the payload, treating any failure as a bug.
    ///
    /// # Panics
    /// If the packet is disposed or empty, or holds something other than `T`.
    #[track_caller]
    pub fn value(&self) -> T {
        match self.get() {
            Ok(value) => value,
            Err(err) => panic!("Packet<{}>: {err}", T::type_name()),
        }
    }

    /// Moves the payload out. Only succeeds while no other packet shares it;
    /// afterwards this packet is disposed.
    pub fn consume(&mut self) -> Result<T> {
        let ptr = self.ptr()?;
        if !self.handle.owns_resource() {
            return Err(BridgeError::invalid_argument("a borrowed packet cannot be consumed"));
        }
        self.validate_as_type()?;

        let mut status = std::ptr::null_mut();
        let mut taken = std::ptr::null_mut();
        // SAFETY: `ptr` is live; both out-pointers are valid for writes.
        unsafe { native::mp_packet_consume(ptr, &mut status, &mut taken) }.check("mp_packet_consume")?;
        // SAFETY: a successful call always writes a fresh status.
        let status = unsafe { Status::from_owned(status) }?;
        status.to_result()?;

        // SAFETY: on an OK status `taken` is a fresh packet holding the moved payload.
        let holder = unsafe { Self::from_owned(taken) }?;
        // SAFETY: `holder` is live and was validated as `T` above.
        let value = unsafe { T::read(holder.ptr()?) };
        self.handle.dispose();
        value
    }

    /// A new packet sharing this payload at `timestamp`.
    pub fn at(&self, timestamp: Timestamp) -> Result<Packet<T>> {
        let ptr = self.ptr()?;
        // SAFETY: `ptr` is live; the copy is a fresh packet.
        let handle = unsafe {
            NativeHandle::create("Packet", delete_packet, |out| {
                native::mp_packet_at(ptr, timestamp.micros(), out.cast())
            })
        }?;
        Ok(Self { handle, _marker: PhantomData })
    }

    /// Checks that the payload was registered as `T`.
    pub fn validate_as_type(&self) -> Result<()> {
        if self.is_empty()? {
            return Err(BridgeError::EmptyPacket);
        }
        let actual = self.registered_type_name()?;
        let expected = T::type_name();
        if actual != expected {
            return Err(BridgeError::format_mismatch(expected, actual));
        }
        Ok(())
    }

    pub fn registered_type_name(&self) -> Result<String> {
        let ptr = self.ptr()?;
        // SAFETY: `ptr` is live; the getter writes a native-allocated string.
        unsafe {
            marshal::take_cstring("mp_packet_registered_type_name", |out| {
                native::mp_packet_registered_type_name(ptr, out)
            })
        }
    }

    pub fn debug_string(&self) -> Result<String> {
        let ptr = self.ptr()?;
        // SAFETY: `ptr` is live; the getter writes a native-allocated string.
        unsafe { marshal::take_cstring("mp_packet_debug_string", |out| native::mp_packet_debug_string(ptr, out)) }
    }

    pub fn kind(&self) -> PayloadKind {
        T::KIND
    }

    fn explain(&self, error: BridgeError) -> BridgeError {
        match error {
            BridgeError::NativeCall { .. } => match self.registered_type_name() {
                Ok(actual) => BridgeError::format_mismatch(T::type_name(), actual),
                Err(e) => e,
            },
            other => other,
        }
    }
}

impl<T> ResourceHandle for Packet<T> {
    fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut NativeHandle {
        &mut self.handle
    }
}

impl<T: PacketValue> fmt::Debug for Packet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.debug_string() {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "Packet<{}>(<disposed>)", T::type_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_frame::{ImageFormat, ImageFrame};
    use crate::proto::{Detection, Landmark, LandmarkList, LocationData, RelativeBoundingBox};
    use proptest::prelude::*;

    #[test]
    fn scalar_packets_keep_value_and_timestamp() {
        let packet = Packet::new_at(42i32, Timestamp::new(7)).unwrap();
        assert_eq!(packet.get().unwrap(), 42);
        assert_eq!(packet.timestamp().unwrap(), Timestamp::new(7));
        assert!(!packet.is_empty().unwrap());
        assert_eq!(packet.registered_type_name().unwrap(), "int");
        assert_eq!(packet.kind(), PayloadKind::Scalar);
    }

    #[test]
    fn empty_packets_raise_empty_packet() {
        let packet = Packet::<bool>::empty().unwrap();
        assert!(packet.is_empty().unwrap());
        assert!(matches!(packet.get(), Err(BridgeError::EmptyPacket)));
        assert!(matches!(packet.validate_as_type(), Err(BridgeError::EmptyPacket)));
    }

    #[test]
    fn consume_disposes_the_packet() {
        let mut packet = Packet::new("hello".to_string()).unwrap();
        assert_eq!(packet.consume().unwrap(), "hello");
        assert!(packet.is_disposed());
        assert!(matches!(packet.get(), Err(BridgeError::UseAfterFree { type_name: "Packet" })));
        assert!(matches!(packet.consume(), Err(BridgeError::UseAfterFree { .. })));
    }

    #[test]
    fn consume_fails_while_payload_is_shared() {
        let mut packet = Packet::new(vec![1.0f32, 2.0]).unwrap();
        let copy = packet.at(Timestamp::new(3)).unwrap();
        match packet.consume() {
            Err(BridgeError::BadStatus { code, .. }) => {
                assert_eq!(code, crate::StatusCode::FailedPrecondition)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(packet.get().unwrap(), vec![1.0, 2.0]);
        drop(copy);
        assert_eq!(packet.consume().unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn at_copies_keep_the_payload() {
        let packet = Packet::new(true).unwrap();
        let copy = packet.at(Timestamp::new(100)).unwrap();
        drop(packet);
        assert!(copy.get().unwrap());
        assert_eq!(copy.timestamp().unwrap(), Timestamp::new(100));
    }

    #[test]
    fn wrong_type_is_a_format_mismatch() {
        let packet = Packet::new(1.5f64).unwrap();
        let packet: Packet<f32> = Packet { handle: packet.handle, _marker: PhantomData };
        match packet.get() {
            Err(BridgeError::FormatMismatch { expected, actual }) => {
                assert_eq!(expected, "float");
                assert_eq!(actual, "double");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(packet.validate_as_type().is_err());
    }

    #[test]
    fn message_vectors_round_trip() {
        let detections = vec![
            Detection {
                label: vec!["face".into()],
                score: vec![0.9],
                location_data: Some(LocationData {
                    relative_bounding_box: Some(RelativeBoundingBox {
                        xmin: 0.25,
                        ymin: 0.5,
                        width: 0.125,
                        height: 0.0625,
                    }),
                    relative_keypoints: vec![],
                }),
                ..Default::default()
            },
            Detection::default(),
        ];
        let packet = Packet::new(detections.clone()).unwrap();
        assert_eq!(packet.registered_type_name().unwrap(), "std::vector<mediapipe.Detection>");
        assert_eq!(packet.get().unwrap(), detections);
        assert_eq!(packet.kind(), PayloadKind::MessageVector);
    }

    #[test]
    fn image_frames_move_into_packets() {
        let frame = ImageFrame::new(ImageFormat::Gray8, 2, 1, &[10, 20]).unwrap();
        let packet = Packet::new(frame).unwrap();
        let copy = packet.get().unwrap();
        assert_eq!(copy.copy_to_vec::<u8>().unwrap(), vec![10, 20]);
        assert!(packet.debug_string().unwrap().contains("mediapipe::ImageFrame"));
    }

    #[test]
    fn value_reads_like_get() {
        let packet = Packet::new_at(2.5f64, Timestamp::new(4)).unwrap();
        assert_eq!(packet.value(), 2.5);
    }

    #[test]
    #[should_panic(expected = "disposed")]
    fn value_panics_after_dispose() {
        let mut packet = Packet::new(1i32).unwrap();
        packet.dispose();
        packet.value();
    }

    #[test]
    #[should_panic(expected = "empty")]
    fn value_panics_on_empty_packets() {
        Packet::<String>::empty().unwrap().value();
    }

    #[test]
    fn dispose_twice_is_harmless() {
        let mut packet = Packet::new(1i32).unwrap();
        packet.dispose();
        packet.dispose();
        assert!(packet.is_disposed());
        assert!(!packet.owns_resource());
    }

    // Non-optional fields equal to zero are not encoded, so -0.0 comes back as 0.0.
    fn coordinate() -> impl Strategy<Value = f32> {
        any::<f32>().prop_map(|v| if v == 0.0 { 0.0 } else { v })
    }

    fn landmark() -> impl Strategy<Value = Landmark> {
        (coordinate(), coordinate(), coordinate(), proptest::option::of(any::<f32>())).prop_map(
            |(x, y, z, visibility)| Landmark { x, y, z, visibility, presence: None },
        )
    }

    proptest! {
        #[test]
        fn landmark_lists_survive_the_byte_boundary_bit_for_bit(
            landmarks in prop::collection::vec(landmark(), 0..16),
            micros in 0i64..1_000_000,
        ) {
            let list = LandmarkList { landmark: landmarks };
            let packet = Packet::new_at(list.clone(), Timestamp::new(micros)).unwrap();
            let decoded = packet.get().unwrap();
            prop_assert_eq!(decoded.landmark.len(), list.landmark.len());
            for (a, b) in decoded.landmark.iter().zip(&list.landmark) {
                prop_assert_eq!(a.x.to_bits(), b.x.to_bits());
                prop_assert_eq!(a.y.to_bits(), b.y.to_bits());
                prop_assert_eq!(a.z.to_bits(), b.z.to_bits());
                prop_assert_eq!(a.visibility.map(f32::to_bits), b.visibility.map(f32::to_bits));
            }
            prop_assert_eq!(packet.timestamp().unwrap(), Timestamp::new(micros));
        }

        #[test]
        fn strings_survive_the_byte_boundary(text in ".*") {
            let packet = Packet::new(text.clone()).unwrap();
            prop_assert_eq!(packet.get().unwrap(), text);
        }
    }
}
