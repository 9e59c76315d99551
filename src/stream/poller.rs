use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;

use super::Next;
use crate::error::Result;
use crate::handle::{NativeHandle, ResourceHandle};
use crate::native::{self, NativePoller};
use crate::packet::{Packet, PacketValue};

unsafe fn delete_poller(ptr: *mut c_void) {
    // SAFETY: only installed as the deleter of handles that own this object.
    unsafe { native::mp_poller_delete(ptr.cast()) }
}

/// Pulls the packets of one output stream in the order the graph produced them.
pub struct OutputStreamPoller<T> {
    handle: NativeHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: PacketValue> OutputStreamPoller<T> {
    /// # Safety
    /// `ptr` must be a live poller that nothing else frees.
    pub(crate) unsafe fn from_owned(ptr: *mut NativePoller) -> Result<Self> {
        // SAFETY: forwarded from the caller.
        let handle = unsafe { NativeHandle::from_owned(ptr.cast(), "OutputStreamPoller", delete_poller) }?;
        Ok(Self { handle, _marker: PhantomData })
    }

    fn ptr(&self) -> Result<*mut NativePoller> {
        Ok(self.handle.as_ptr()?.cast())
    }

    /// Blocks until the next packet arrives. `None` once the stream is closed and drained.
    pub fn next(&mut self) -> Result<Option<Packet<T>>> {
        let poller = self.ptr()?;
        let packet = Packet::<T>::empty()?;
        let mut received = false;
        // SAFETY: the poller and the target packet are both live for the call.
        unsafe { native::mp_poller_next(poller, packet.ptr()?, &mut received) }.check("mp_poller_next")?;
        Ok(received.then_some(packet))
    }

    /// Returns the next packet if one is already queued.
    pub fn try_next(&mut self) -> Result<Next<Packet<T>>> {
        let poller = self.ptr()?;
        let packet = Packet::<T>::empty()?;
        let mut state = 0;
        // SAFETY: the poller and the target packet are both live for the call.
        unsafe { native::mp_poller_try_next(poller, packet.ptr()?, &mut state) }.check("mp_poller_try_next")?;
        Ok(match state {
            1 => Next::Ready(packet),
            0 => Next::NotReady,
            _ => Next::Closed,
        })
    }

    pub fn queue_size(&self) -> Result<usize> {
        // SAFETY: `ptr` fails instead of returning a disposed object.
        Ok(unsafe { native::mp_poller_queue_size(self.ptr()?) }.max(0) as usize)
    }
}

impl<T> ResourceHandle for OutputStreamPoller<T> {
    fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut NativeHandle {
        &mut self.handle
    }
}

impl<T> fmt::Debug for OutputStreamPoller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStreamPoller").field("handle", &self.handle).finish()
    }
}
