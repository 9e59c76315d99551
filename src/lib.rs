//! Lifetime-safe bridge between a host application and a native media pipeline.
//!
//! mpbridge wraps the objects a graph-based pipeline hands across the
//! managed/native boundary (packets, GPU textures, fences, status objects)
//! in owning Rust types that release them exactly once, and retrieves graph
//! output either by polling or through listeners running on the graph's
//! worker thread.
//!
//! # Features
//!
//! - **Typed packets**: [`Packet<T>`] for scalars, vectors, images, GPU buffers and protobuf messages
//! - **Texture pooling**: [`TextureFramePool`] recycles GPU textures and honours GPU fences
//! - **Output streams**: [`OutputStream`] in polling or callback mode, with async subscriptions
//! - **Deterministic release**: every native object is freed on `dispose()` or drop, never twice
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mpbridge::{CalculatorGraph, GraphConfig, NodeConfig, Next, OutputStream, OutputStreamConfig, Packet, Timestamp};
//!
//! fn main() -> mpbridge::Result<()> {
//!     let graph = CalculatorGraph::new(
//!         GraphConfig::new()
//!             .input_stream("in")
//!             .output_stream("out")
//!             .node(NodeConfig::new("PassThroughCalculator", "in", "out")),
//!     )?;
//!     let mut output = OutputStream::<f32>::polling(&graph, "out", &OutputStreamConfig::default())?;
//!     graph.start_run()?;
//!
//!     graph.add_packet_to_input_stream("in", Packet::new_at(0.5f32, Timestamp::new(1))?)?;
//!     graph.close_all_packet_sources()?;
//!
//!     while let Next::Ready(mut packet) = output.try_get_next(true) {
//!         let timestamp = packet.timestamp()?;
//!         println!("{} at {timestamp}", packet.consume()?);
//!     }
//!     graph.wait_until_done()
//! }
//! ```

// Core types and error handling
mod error;
pub mod handle;
pub(crate) mod marshal;
pub mod status;
pub mod table;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;
pub mod timestamp;

// Payloads
pub mod image_frame;
pub mod packet;
pub mod proto;

// GPU interop
pub mod gpu;
pub mod texture;

// Graph driving and output retrieval
pub mod graph;
pub mod resource;
pub mod stream;

// Native runtime
pub mod native;

// Ambient
pub mod config;
pub mod logging;

// Core exports
pub use error::*;
pub use handle::{NativeHandle, ResourceHandle};
pub use status::{Status, StatusArgs, StatusCode};
pub use table::{CallbackKey, CallbackTable, InstanceTable};
pub use timestamp::Timestamp;

// Payload exports
pub use image_frame::{ImageFormat, ImageFrame};
pub use packet::{Packet, PacketMap, PacketValue, PayloadKind, SidePacket};

// GPU exports
pub use gpu::{GlContext, GlSyncPoint, GlTextureBuffer, GpuBuffer, GpuBufferFormat};
pub use texture::{FrameDescriptor, PoolStats, TextureFormat, TextureFrame, TextureFramePool};

// Graph and stream exports
pub use config::{BridgeConfig, OutputStreamConfig, TableConfig, TexturePoolConfig};
pub use graph::{CalculatorGraph, GraphConfig, NodeConfig};
pub use resource::{LocalResourceManager, ResourceManager};
pub use stream::{Next, OutputStream, OutputStreamPoller, StreamMode, UpdateRate, ValueStream};
