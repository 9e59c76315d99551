//! Driving a calculator graph.
//!
//! [`CalculatorGraph`] owns a native graph and exposes its pumps: feeding
//! input packets, closing sources and waiting for the run to finish. All
//! methods take `&self`, so a graph can be shared between a producer thread
//! and the threads that wait on it.

mod config;

use std::ffi::c_void;
use std::fmt;

use tracing::{debug, info, trace};

pub use config::{GraphConfig, NodeConfig};

use crate::error::Result;
use crate::handle::{NativeHandle, ResourceHandle};
use crate::marshal;
use crate::native::{self, NativeGraph, NativePoller, PacketCallback};
use crate::packet::{Packet, PacketValue, SidePacket};
use crate::status::Status;
use crate::stream::OutputStreamPoller;
use crate::table::CallbackKey;

unsafe fn delete_graph(ptr: *mut c_void) {
    // SAFETY: only installed as the deleter of owned graph handles.
    unsafe { native::mp_graph_delete(ptr.cast()) }
}

pub struct CalculatorGraph {
    handle: NativeHandle,
    config: GraphConfig,
}

impl CalculatorGraph {
    pub fn new(config: GraphConfig) -> Result<Self> {
        config.validate()?;
        let yaml = config.to_yaml()?;
        let len = marshal::native_len(yaml.len())?;
        // SAFETY: `yaml` outlives the call; the constructor writes a fresh graph.
        let handle = unsafe {
            NativeHandle::create("CalculatorGraph", delete_graph, |out| {
                native::mp_graph_new(yaml.as_ptr(), len, out.cast())
            })
        }?;
        info!(
            inputs = ?config.input_streams,
            outputs = ?config.output_streams,
            nodes = config.nodes.len(),
            "calculator graph created"
        );
        Ok(Self { handle, config })
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Self::new(GraphConfig::from_yaml_str(yaml)?)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    fn ptr(&self) -> Result<*mut NativeGraph> {
        Ok(self.handle.as_ptr()?.cast())
    }

    /// Opens every calculator and starts the worker.
    ///
    /// Observers and pollers must be registered before this call.
    pub fn start_run(&self) -> Result<()> {
        let graph = self.ptr()?;
        // SAFETY: `graph` is live and `out` is valid for writes.
        unsafe { Status::check("mp_graph_start_run", |out| native::mp_graph_start_run(graph, out)) }?;
        debug!("graph run started");
        Ok(())
    }

    /// Like [`start_run`](Self::start_run), with `side_packets` available to
    /// calculators that read one. The map is left untouched.
    pub fn start_run_with(&self, side_packets: &SidePacket) -> Result<()> {
        let graph = self.ptr()?;
        let side_packets = side_packets.ptr()?;
        // SAFETY: `graph` and `side_packets` are live and `out` is valid for writes.
        unsafe {
            Status::check("mp_graph_start_run_with_side_packets", |out| {
                native::mp_graph_start_run_with_side_packets(graph, side_packets, out)
            })
        }?;
        debug!("graph run started with side packets");
        Ok(())
    }

    /// Moves `packet` into the graph. The packet is consumed even if the call fails.
    pub fn add_packet_to_input_stream<T: PacketValue>(&self, stream: &str, packet: Packet<T>) -> Result<()> {
        let graph = self.ptr()?;
        let name = marshal::to_cstring(stream)?;
        let packet = packet.into_raw()?;
        trace!(stream, "adding packet to input stream");
        // SAFETY: ownership of `packet` moves into the graph.
        unsafe {
            Status::check("mp_graph_add_packet_to_input_stream", |out| {
                native::mp_graph_add_packet_to_input_stream(graph, name.as_ptr(), packet, out)
            })
        }
    }

    pub fn close_input_stream(&self, stream: &str) -> Result<()> {
        let graph = self.ptr()?;
        let name = marshal::to_cstring(stream)?;
        // SAFETY: `graph` and `name` are live for the call.
        unsafe {
            Status::check("mp_graph_close_input_stream", |out| {
                native::mp_graph_close_input_stream(graph, name.as_ptr(), out)
            })
        }
    }

    pub fn close_all_packet_sources(&self) -> Result<()> {
        let graph = self.ptr()?;
        // SAFETY: `graph` is live and `out` is valid for writes.
        unsafe {
            Status::check("mp_graph_close_all_packet_sources", |out| {
                native::mp_graph_close_all_packet_sources(graph, out)
            })
        }
    }

    /// Blocks until every queued input has been processed.
    pub fn wait_until_idle(&self) -> Result<()> {
        let graph = self.ptr()?;
        // SAFETY: `graph` is live and `out` is valid for writes.
        unsafe { Status::check("mp_graph_wait_until_idle", |out| native::mp_graph_wait_until_idle(graph, out)) }
    }

    /// Blocks until the run has finished and returns its final status.
    pub fn wait_until_done(&self) -> Result<()> {
        let graph = self.ptr()?;
        // SAFETY: `graph` is live and `out` is valid for writes.
        let result =
            unsafe { Status::check("mp_graph_wait_until_done", |out| native::mp_graph_wait_until_done(graph, out)) };
        debug!(ok = result.is_ok(), "graph run finished");
        result
    }

    pub fn has_error(&self) -> Result<bool> {
        // SAFETY: `ptr` fails instead of returning a disposed graph.
        Ok(unsafe { native::mp_graph_has_error(self.ptr()?) })
    }

    /// Aborts the run. Blocked pollers see their streams close.
    pub fn cancel(&self) -> Result<()> {
        // SAFETY: `ptr` fails instead of returning a disposed graph.
        unsafe { native::mp_graph_cancel(self.ptr()?) }.check("mp_graph_cancel")
    }

    /// Creates a poller for `stream`.
    pub fn add_output_stream_poller<T: PacketValue>(
        &self,
        stream: &str,
        observe_timestamp_bounds: bool,
    ) -> Result<OutputStreamPoller<T>> {
        let graph = self.ptr()?;
        let name = marshal::to_cstring(stream)?;
        let mut poller: *mut NativePoller = std::ptr::null_mut();
        // SAFETY: `graph` and `name` are live; both out-pointers are valid for writes.
        unsafe {
            Status::check("mp_graph_add_output_stream_poller", |out| {
                native::mp_graph_add_output_stream_poller(graph, name.as_ptr(), observe_timestamp_bounds, out, &mut poller)
            })
        }?;
        // SAFETY: the poller is only written on success and we now own it.
        unsafe { OutputStreamPoller::from_owned(poller) }
    }

    /// Registers `callback` for `stream`. Native hands `key` back on every call.
    pub fn observe_output_stream(
        &self,
        stream: &str,
        key: CallbackKey,
        callback: PacketCallback,
        observe_timestamp_bounds: bool,
    ) -> Result<()> {
        let graph = self.ptr()?;
        let name = marshal::to_cstring(stream)?;
        // SAFETY: `graph` and `name` are live; `callback` is a static trampoline.
        unsafe {
            Status::check("mp_graph_observe_output_stream", |out| {
                native::mp_graph_observe_output_stream(
                    graph,
                    name.as_ptr(),
                    key.as_raw(),
                    callback,
                    observe_timestamp_bounds,
                    out,
                )
            })
        }
    }
}

impl ResourceHandle for CalculatorGraph {
    fn handle(&self) -> &NativeHandle {
        &self.handle
    }

    fn handle_mut(&mut self) -> &mut NativeHandle {
        &mut self.handle
    }
}

impl fmt::Debug for CalculatorGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculatorGraph")
            .field("config", &self.config)
            .field("disposed", &self.handle.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BridgeError;
    use crate::status::StatusCode;
    use crate::test_utils;
    use crate::timestamp::Timestamp;

    fn pass_through() -> CalculatorGraph {
        test_utils::pass_through_graph("in", "out").unwrap()
    }

    fn status_code(result: Result<()>) -> StatusCode {
        match result {
            Err(BridgeError::BadStatus { code, .. }) => code,
            other => panic!("expected a bad status, got {other:?}"),
        }
    }

    #[test]
    fn runs_to_completion() {
        let graph = pass_through();
        graph.start_run().unwrap();
        for t in 0..3 {
            graph.add_packet_to_input_stream("in", Packet::new_at(t, Timestamp::new(t as i64)).unwrap()).unwrap();
        }
        graph.wait_until_idle().unwrap();
        graph.close_input_stream("in").unwrap();
        graph.wait_until_done().unwrap();
        assert!(!graph.has_error().unwrap());
    }

    #[test]
    fn pumps_check_the_phase() {
        let graph = pass_through();
        assert_eq!(status_code(graph.wait_until_done()), StatusCode::FailedPrecondition);
        assert_eq!(
            status_code(graph.add_packet_to_input_stream("in", Packet::new(1).unwrap())),
            StatusCode::FailedPrecondition
        );
        graph.start_run().unwrap();
        assert_eq!(status_code(graph.start_run()), StatusCode::FailedPrecondition);
        assert_eq!(
            status_code(graph.add_packet_to_input_stream("nope", Packet::new(1).unwrap())),
            StatusCode::NotFound
        );
        graph.close_all_packet_sources().unwrap();
        graph.wait_until_done().unwrap();
    }

    #[test]
    fn observers_need_a_known_stream() {
        let graph = pass_through();
        assert!(matches!(
            graph.add_output_stream_poller::<i32>("missing", false),
            Err(BridgeError::BadStatus { code: StatusCode::NotFound, .. })
        ));
        graph.start_run().unwrap();
        assert!(graph.add_output_stream_poller::<i32>("out", false).is_err());
    }

    #[test]
    fn unknown_calculator_fails_to_start() {
        let graph = CalculatorGraph::new(
            GraphConfig::new().input_stream("in").node(NodeConfig::new("MagicCalculator", "in", "out")),
        )
        .unwrap();
        assert_eq!(status_code(graph.start_run()), StatusCode::InvalidArgument);
        assert!(graph.has_error().unwrap());
    }

    #[test]
    fn missing_resource_fails_to_start() {
        let graph = CalculatorGraph::new(
            GraphConfig::new()
                .input_stream("in")
                .node(NodeConfig::new("ResourceSizeCalculator", "in", "size").with_resource("no/such/model.tflite")),
        )
        .unwrap();
        assert_eq!(status_code(graph.start_run()), StatusCode::NotFound);
    }

    fn side_packet_graph() -> CalculatorGraph {
        CalculatorGraph::new(
            GraphConfig::new()
                .input_stream("tick")
                .output_stream("label")
                .node(NodeConfig::new("SidePacketToStreamCalculator", "tick", "label").with_side_packet("model_label")),
        )
        .unwrap()
    }

    #[test]
    fn side_packets_reach_calculators() {
        let graph = side_packet_graph();
        let mut output = graph.add_output_stream_poller::<String>("label", false).unwrap();
        let mut side_packets = SidePacket::new().unwrap();
        side_packets.insert("model_label", "hand".to_string()).unwrap();
        graph.start_run_with(&side_packets).unwrap();
        assert_eq!(side_packets.len().unwrap(), 1);

        for t in [10, 20] {
            graph.add_packet_to_input_stream("tick", Packet::new_at(true, Timestamp::new(t)).unwrap()).unwrap();
        }
        graph.close_all_packet_sources().unwrap();
        graph.wait_until_done().unwrap();

        let mut seen = Vec::new();
        while let Ok(Some(packet)) = output.next() {
            seen.push((packet.timestamp().unwrap().micros(), packet.value()));
        }
        assert_eq!(seen, vec![(10, "hand".to_string()), (20, "hand".to_string())]);
    }

    #[test]
    fn missing_side_packet_fails_to_start() {
        let graph = side_packet_graph();
        assert_eq!(status_code(graph.start_run()), StatusCode::NotFound);
    }

    #[test]
    fn cancel_ends_the_run() {
        let graph = pass_through();
        graph.start_run().unwrap();
        graph.cancel().unwrap();
        assert_eq!(status_code(graph.wait_until_done()), StatusCode::Cancelled);
    }

    #[test]
    fn disposed_graph_reports_use_after_free() {
        let mut graph = pass_through();
        graph.dispose();
        graph.dispose();
        assert!(matches!(graph.start_run(), Err(BridgeError::UseAfterFree { .. })));
    }
}
