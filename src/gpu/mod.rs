//! GPU interop: GL contexts, fences and texture buffers lent to the pipeline.

mod context;
mod sync_point;
mod texture_buffer;

pub use context::GlContext;
pub use sync_point::GlSyncPoint;
pub use texture_buffer::{GlTextureBuffer, GpuBuffer, GpuBufferFormat};
