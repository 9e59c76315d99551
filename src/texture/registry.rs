//! Process-wide bookkeeping for texture frames.
//!
//! The pipeline identifies a returned texture only by its name, so the
//! deletion trampoline looks the frame up here.

use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::{error, trace, warn};
use uuid::Uuid;

use super::MAX_TOTAL_FRAMES;
use super::frame::FrameCore;
use crate::error::{BridgeError, Result};
use crate::gpu::GlSyncPoint;
use crate::table::InstanceTable;

pub(crate) struct TextureRegistry {
    frames: InstanceTable<Uuid, FrameCore>,
    names: Mutex<HashMap<u32, Uuid>>,
    handed_off: Mutex<HashMap<u32, Arc<FrameCore>>>,
}

lazy_static! {
    static ref REGISTRY: TextureRegistry = TextureRegistry::new(MAX_TOTAL_FRAMES);
}

pub(crate) fn registry() -> &'static TextureRegistry {
    &REGISTRY
}

/// Changes how many frames may be alive at once across all pools.
pub fn set_max_frames(max_frames: usize) {
    REGISTRY.frames.set_max_size(max_frames);
}

/// Number of texture frames currently alive.
pub fn live_frames() -> usize {
    REGISTRY.frames.len()
}

impl TextureRegistry {
    fn new(max_frames: usize) -> Self {
        Self {
            frames: InstanceTable::new("texture_frames", max_frames),
            names: Mutex::new(HashMap::new()),
            handed_off: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(&self, frame: &Arc<FrameCore>) -> Result<()> {
        self.frames.insert(frame.id(), frame)
    }

    pub(crate) fn unregister(&self, id: &Uuid) {
        self.frames.remove(id);
    }

    /// Records `id` as the owner of texture `name`.
    ///
    /// Fails while another live frame holds the same name.
    pub(crate) fn claim_name(&self, name: u32, id: Uuid) -> Result<()> {
        let mut names = self.names.lock();
        if let Some(owner) = names.get(&name) {
            if *owner != id && self.frames.contains_key(owner) {
                return Err(BridgeError::invalid_argument(format!(
                    "texture {name} is already claimed by frame {owner}"
                )));
            }
        }
        names.insert(name, id);
        Ok(())
    }

    pub(crate) fn release_name(&self, name: u32, id: Uuid) {
        let mut names = self.names.lock();
        if names.get(&name) == Some(&id) {
            names.remove(&name);
        }
    }

    pub(crate) fn owner_of(&self, name: u32) -> Option<Uuid> {
        self.names.lock().get(&name).copied()
    }

    /// Keeps `frame` alive while the pipeline holds its texture.
    pub(crate) fn hand_off(&self, name: u32, frame: Arc<FrameCore>) {
        let previous = self.handed_off.lock().insert(name, frame);
        if let Some(previous) = previous {
            warn!(texture = name, frame = %previous.id(), "texture was already handed off");
        }
    }

    fn take_handed_off(&self, name: u32) -> Option<Arc<FrameCore>> {
        self.handed_off.lock().remove(&name)
    }
}

/// Called by the pipeline when the last reference to a lent texture is gone.
///
/// # Safety
/// `sync_token` must be null or a sync token whose ownership passes to this call.
pub(crate) unsafe extern "C" fn on_texture_buffer_released(name: u32, sync_token: *mut c_void) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let sync_point = if sync_token.is_null() {
            None
        } else {
            // SAFETY: the caller hands over ownership of the token.
            unsafe { GlSyncPoint::from_owned(sync_token.cast()) }.ok()
        };
        match registry().take_handed_off(name) {
            Some(frame) => {
                trace!(texture = name, frame = %frame.id(), "pipeline released texture");
                frame.release(sync_point);
            }
            None => warn!(texture = name, "released texture does not belong to any frame"),
        }
    }));
    if result.is_err() {
        error!(texture = name, "texture release callback panicked");
    }
}
