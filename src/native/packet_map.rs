//! Named packets, used for the side packets a graph receives when it starts.
//!
//! The map owns its packets. Lookups hand out copies that share the payload,
//! so the map stays intact until it is cleared or freed.

use std::collections::BTreeMap;
use std::ffi::c_char;

use super::packet::NativePacket;
use super::{ReturnCode, deref, deref_mut, guard, read_str, write_out};

#[derive(Debug, Default, Clone)]
pub struct NativePacketMap {
    pub(crate) packets: BTreeMap<String, NativePacket>,
}

/// # Safety
/// `out` must be valid for writes.
pub unsafe extern "C" fn mp_packet_map_new(out: *mut *mut NativePacketMap) -> ReturnCode {
    guard("mp_packet_map_new", || unsafe {
        write_out(out, Box::into_raw(Box::new(NativePacketMap::default())))
    })
}

/// # Safety
/// `map` must be null or a live map not freed yet.
pub unsafe extern "C" fn mp_packet_map_delete(map: *mut NativePacketMap) {
    if !map.is_null() {
        // SAFETY: allocated with `Box::into_raw`.
        drop(unsafe { Box::from_raw(map) });
    }
}

/// Moves `packet` into the map under `key`, replacing any previous entry.
/// The packet is consumed even on failure.
///
/// # Safety
/// `map` must point to a live map, `key` must be NUL-terminated and `packet`
/// must be a live packet that the caller no longer uses.
pub unsafe extern "C" fn mp_packet_map_emplace(
    map: *mut NativePacketMap,
    key: *const c_char,
    packet: *mut NativePacket,
) -> ReturnCode {
    guard("mp_packet_map_emplace", || {
        if packet.is_null() {
            return Err("packet is null".to_string());
        }
        // SAFETY: ownership moves into the map.
        let packet = unsafe { *Box::from_raw(packet) };
        let map = unsafe { deref_mut(map, "packet map") }?;
        let key = unsafe { read_str(key) }?;
        map.packets.insert(key, packet);
        Ok(())
    })
}

/// Writes a copy of the packet stored under `key`, or null if there is none.
///
/// # Safety
/// `map` must point to a live map, `key` must be NUL-terminated and `out`
/// valid for writes.
pub unsafe extern "C" fn mp_packet_map_find(
    map: *const NativePacketMap,
    key: *const c_char,
    out: *mut *mut NativePacket,
) -> ReturnCode {
    guard("mp_packet_map_find", || {
        // SAFETY: the caller passes live objects or null; keys are NUL-terminated; out-pointers are valid for writes and null is rejected.
        let map = unsafe { deref(map, "packet map") }?;
        let key = unsafe { read_str(key) }?;
        let found = map.packets.get(&key).map_or(std::ptr::null_mut(), |packet| packet.clone().into_raw());
        unsafe { write_out(out, found) }
    })
}

/// Removes `key` and writes how many entries were removed.
///
/// # Safety
/// `map` must point to a live map, `key` must be NUL-terminated and `count`
/// valid for writes.
pub unsafe extern "C" fn mp_packet_map_erase(
    map: *mut NativePacketMap,
    key: *const c_char,
    count: *mut i32,
) -> ReturnCode {
    guard("mp_packet_map_erase", || {
        // SAFETY: the caller passes live objects or null; keys are NUL-terminated; out-pointers are valid for writes and null is rejected.
        let map = unsafe { deref_mut(map, "packet map") }?;
        let key = unsafe { read_str(key) }?;
        let removed = i32::from(map.packets.remove(&key).is_some());
        unsafe { write_out(count, removed) }
    })
}

/// # Safety
/// `map` must point to a live map.
pub unsafe extern "C" fn mp_packet_map_size(map: *const NativePacketMap) -> i32 {
    unsafe { deref(map, "packet map") }.map(|m| m.packets.len().min(i32::MAX as usize) as i32).unwrap_or(0)
}

/// # Safety
/// `map` must point to a live map.
pub unsafe extern "C" fn mp_packet_map_clear(map: *mut NativePacketMap) {
    if let Ok(map) = unsafe { deref_mut(map, "packet map") } {
        map.packets.clear();
    }
}
