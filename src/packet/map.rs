use std::ffi::c_void;
use std::fmt;

use crate::error::Result;
use crate::handle::{NativeHandle, ResourceHandle};
use crate::marshal;
use crate::native::{self, NativePacket, NativePacketMap};

use super::{Packet, PacketValue};

unsafe fn delete_packet_map(ptr: *mut c_void) {
    // SAFETY: only installed as the deleter of owned packet maps.
    unsafe { native::mp_packet_map_delete(ptr.cast()) }
}

/// Packets stored by name, whatever their payload type.
///
/// The map does not remember what type each entry was stored as. Reading an
/// entry as the wrong `T` fails with
/// [`BridgeError::FormatMismatch`](crate::BridgeError::FormatMismatch) when the
/// packet is read.
pub struct PacketMap {
    handle: NativeHandle,
}

/// Packets handed to a graph when its run starts.
pub type SidePacket = PacketMap;

impl PacketMap {
    pub fn new() -> Result<Self> {
        // SAFETY: the constructor writes a fresh map.
        let handle = unsafe {
            NativeHandle::create("PacketMap", delete_packet_map, |out| native::mp_packet_map_new(out.cast()))
        }?;
        Ok(Self { handle })
    }

    pub(crate) fn ptr(&self) -> Result<*mut NativePacketMap> {
        Ok(self.handle.as_ptr()?.cast())
    }

    /// Moves `packet` into the map under `key`, replacing any previous entry.
    pub fn emplace<T: PacketValue>(&mut self, key: &str, packet: Packet<T>) -> Result<()> {
        let map = self.ptr()?;
        let key = marshal::to_cstring(key)?;
        let packet = packet.into_raw()?;
        // SAFETY: `map` is live and ownership of `packet` moves into it.
        unsafe { native::mp_packet_map_emplace(map, key.as_ptr(), packet) }.check("mp_packet_map_emplace")
    }

    /// Wraps `value` in a packet and stores it under `key`.
    pub fn insert<T: PacketValue>(&mut self, key: &str, value: T) -> Result<()> {
        self.emplace(key, Packet::new(value)?)
    }

    /// A packet sharing the payload stored under `key`.
    pub fn get<T: PacketValue>(&self, key: &str) -> Result<Option<Packet<T>>> {
        let map = self.ptr()?;
        let key = marshal::to_cstring(key)?;
        let mut raw: *mut NativePacket = std::ptr::null_mut();
        // SAFETY: `map` is live and `raw` is valid for writes.
        unsafe { native::mp_packet_map_find(map, key.as_ptr(), &mut raw) }.check("mp_packet_map_find")?;
        if raw.is_null() {
            return Ok(None);
        }
        // SAFETY: a found entry is written as a fresh copy we now own.
        unsafe { Packet::from_owned(raw) }.map(Some)
    }

    /// Removes `key`, returning how many entries were removed.
    pub fn erase(&mut self, key: &str) -> Result<usize> {
        let map = self.ptr()?;
        let key = marshal::to_cstring(key)?;
        let mut count = 0;
        // SAFETY: `map` is live and `count` is valid for writes.
        unsafe { native::mp_packet_map_erase(map, key.as_ptr(), &mut count) }.check("mp_packet_map_erase")?;
        Ok(count.max(0) as usize)
    }

    pub fn clear(&mut self) -> Result<()> {
        // SAFETY: `ptr` fails instead of returning a disposed map.
        unsafe { native::mp_packet_map_clear(self.ptr()?) };
        Ok(())
    }

    pub fn len(&self) -> Result<usize> {
        // SAFETY: `ptr` fails instead of returning a disposed map.
        Ok(unsafe { native::mp_packet_map_size(self.ptr()?) }.max(0) as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl ResourceHandle for PacketMap {
    fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut NativeHandle {
        &mut self.handle
    }
}

impl fmt::Debug for PacketMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketMap")
            .field("len", &self.len().ok())
            .field("disposed", &self.handle.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::timestamp::Timestamp;

    #[test]
    fn entries_of_different_types_share_one_map() {
        let mut map = SidePacket::new().unwrap();
        assert!(map.is_empty().unwrap());
        map.insert("scale", 0.5f32).unwrap();
        map.emplace("label", Packet::new_at("face".to_string(), Timestamp::new(3)).unwrap()).unwrap();
        assert_eq!(map.len().unwrap(), 2);

        assert_eq!(map.get::<f32>("scale").unwrap().unwrap().value(), 0.5);
        let label = map.get::<String>("label").unwrap().unwrap();
        assert_eq!(label.value(), "face");
        assert_eq!(label.timestamp().unwrap(), Timestamp::new(3));
        assert!(map.get::<i32>("missing").unwrap().is_none());
    }

    #[test]
    fn lookups_leave_the_entry_in_place() {
        let mut map = PacketMap::new().unwrap();
        map.insert("n", 7i32).unwrap();
        drop(map.get::<i32>("n").unwrap());
        assert_eq!(map.get::<i32>("n").unwrap().unwrap().value(), 7);
        map.insert("n", 8i32).unwrap();
        assert_eq!(map.len().unwrap(), 1);
        assert_eq!(map.get::<i32>("n").unwrap().unwrap().value(), 8);
    }

    #[test]
    fn erase_and_clear_remove_entries() {
        let mut map = PacketMap::new().unwrap();
        map.insert("a", true).unwrap();
        map.insert("b", false).unwrap();
        assert_eq!(map.erase("a").unwrap(), 1);
        assert_eq!(map.erase("a").unwrap(), 0);
        map.clear().unwrap();
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn reading_as_another_type_is_a_format_mismatch() {
        let mut map = PacketMap::new().unwrap();
        map.insert("x", 1.5f64).unwrap();
        let packet = map.get::<i32>("x").unwrap().unwrap();
        assert!(matches!(packet.get(), Err(BridgeError::FormatMismatch { .. })));
    }

    #[test]
    fn disposed_maps_report_use_after_free() {
        let mut map = PacketMap::new().unwrap();
        map.dispose();
        assert!(matches!(map.len(), Err(BridgeError::UseAfterFree { type_name: "PacketMap" })));
        assert!(matches!(map.insert("k", 1i32), Err(BridgeError::UseAfterFree { .. })));
    }
}
