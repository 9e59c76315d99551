//! GPU-backed frames lent between an image source and the pipeline.
//!
//! A [`TextureFramePool`] hands out [`TextureFrame`] leases. A lease returns
//! to its pool when it is released explicitly, when it is dropped, or when the
//! pipeline drops the last reference to a [`GpuBuffer`](crate::gpu::GpuBuffer)
//! built from it. In the last case the pipeline's sync token rides along, and
//! the next acquirer waits on it before touching the texture.

mod frame;
mod pool;
mod registry;

pub use frame::{FrameDescriptor, TextureFormat, TextureFrame};
pub use pool::{PoolStats, TextureFramePool};
pub use registry::{live_frames, set_max_frames};

/// Upper bound on frames alive across every pool in the process.
pub const MAX_TOTAL_FRAMES: usize = 100;
