//! Built-in calculators understood by the native graph.

use tracing::debug;

use super::gl::Fence;
use super::packet::{NativePacket, NativeValue};
use super::packet_map::NativePacketMap;
use super::resource;
use super::status::NativeStatus;
use crate::graph::NodeConfig;

pub(crate) trait Calculator: Send {
    fn open(&mut self) -> Result<(), NativeStatus> {
        Ok(())
    }

    /// Returns `None` when no output is produced for this input timestamp.
    fn process(&mut self, input: &NativePacket) -> Result<Option<NativePacket>, NativeStatus>;
}

pub(crate) fn build(node: &NodeConfig, side_packets: &NativePacketMap) -> Result<Box<dyn Calculator>, NativeStatus> {
    match node.calculator.as_str() {
        "PassThroughCalculator" => Ok(Box::new(PassThroughCalculator)),
        "SidePacketToStreamCalculator" => {
            let name = node.side_packet.as_deref().ok_or_else(|| {
                NativeStatus::invalid_argument("SidePacketToStreamCalculator requires a side packet")
            })?;
            let packet = side_packets
                .packets
                .get(name)
                .ok_or_else(|| NativeStatus::not_found(format!("side packet '{name}' was not provided")))?;
            Ok(Box::new(SidePacketToStreamCalculator { packet: packet.clone() }))
        }
        "ResourceSizeCalculator" => {
            let resource = node.resource.clone().ok_or_else(|| {
                NativeStatus::invalid_argument("ResourceSizeCalculator requires a resource")
            })?;
            Ok(Box::new(ResourceSizeCalculator { resource, size: 0 }))
        }
        other => Err(NativeStatus::invalid_argument(format!("unknown calculator '{other}'"))),
    }
}

/// Forwards every packet unchanged. GPU buffers are marked as read.
struct PassThroughCalculator;

impl Calculator for PassThroughCalculator {
    fn process(&mut self, input: &NativePacket) -> Result<Option<NativePacket>, NativeStatus> {
        let Some(value) = input.holder.as_deref() else {
            return Ok(None);
        };
        if let NativeValue::GpuBuffer(buffer) = value {
            let fence = Fence::pending();
            buffer.did_read(fence.clone());
            fence.signal();
        }
        Ok(Some(input.clone()))
    }
}

/// Emits its side packet at the timestamp of every non-empty input.
struct SidePacketToStreamCalculator {
    packet: NativePacket,
}

impl Calculator for SidePacketToStreamCalculator {
    fn process(&mut self, input: &NativePacket) -> Result<Option<NativePacket>, NativeStatus> {
        if input.is_empty() {
            return Ok(None);
        }
        Ok(Some(NativePacket { holder: self.packet.holder.clone(), timestamp: input.timestamp }))
    }
}

/// Emits the byte length of a resource for every non-empty input.
struct ResourceSizeCalculator {
    resource: String,
    size: i32,
}

impl Calculator for ResourceSizeCalculator {
    fn open(&mut self) -> Result<(), NativeStatus> {
        let bytes = resource::load(&self.resource).map_err(NativeStatus::not_found)?;
        self.size = i32::try_from(bytes.len()).map_err(|_| {
            NativeStatus::invalid_argument(format!("resource '{}' is too large to measure", self.resource))
        })?;
        debug!(resource = %self.resource, size = self.size, "opened ResourceSizeCalculator");
        Ok(())
    }

    fn process(&mut self, input: &NativePacket) -> Result<Option<NativePacket>, NativeStatus> {
        if input.is_empty() {
            return Ok(None);
        }
        Ok(Some(NativePacket::new(NativeValue::Int(self.size), input.timestamp)))
    }
}
