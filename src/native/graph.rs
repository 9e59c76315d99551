//! Native graph runtime.
//!
//! A started graph owns one worker thread. Input packets are queued on a
//! crossbeam channel and routed through the configured calculators; every
//! packet that reaches an observed stream is handed to pollers (through their
//! own channel) or to registered callbacks, in the order the worker produced it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::c_char;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use super::calculator::{self, Calculator};
use super::packet::NativePacket;
use super::packet_map::NativePacketMap;
use super::status::{NativeStatus, StatusArgs};
use super::{ReturnCode, deref, guard, read_str, write_out};
use crate::graph::GraphConfig;

/// Called on the graph's worker thread for each packet of an observed stream.
///
/// `packet` is only valid for the duration of the call. Once the run has
/// finished, failed or been cancelled, every observer gets one last call with
/// a null `packet` and is never called again. The returned message string, if
/// any, is freed by native.
pub type PacketCallback =
    unsafe extern "C" fn(graph: *mut NativeGraph, stream_id: i32, packet: *const NativePacket) -> StatusArgs;

pub struct NativeGraph {
    shared: Arc<GraphShared>,
}

struct GraphShared {
    config: GraphConfig,
    state: Mutex<GraphState>,
    changed: Condvar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initialized,
    Running,
    Done,
}

struct GraphState {
    phase: Phase,
    observers: HashMap<String, Vec<Observer>>,
    input: Option<Sender<Command>>,
    open_inputs: HashSet<String>,
    pending: usize,
    error: Option<NativeStatus>,
    cancelled: bool,
    worker: Option<JoinHandle<()>>,
}

enum Observer {
    Poller { tx: Sender<NativePacket>, observe_bounds: bool },
    Callback { stream_id: i32, callback: PacketCallback, observe_bounds: bool },
}

impl Observer {
    /// Tells a callback observer that its stream has ended. Pollers learn it
    /// from their channel disconnecting.
    fn close(&self, graph: usize) {
        if let Observer::Callback { stream_id, callback, .. } = self {
            // SAFETY: a null packet is the documented end-of-stream call.
            let args = unsafe { callback(graph as *mut NativeGraph, *stream_id, std::ptr::null()) };
            // SAFETY: the message belongs to us once the callback returns.
            let status = unsafe { args.into_native() };
            if !status.is_ok() {
                trace!(stream_id, code = status.code, "observer rejected the end of its stream");
            }
        }
    }

    fn accepts(&self, packet: &NativePacket) -> bool {
        let observe_bounds = match self {
            Observer::Poller { observe_bounds, .. } | Observer::Callback { observe_bounds, .. } => {
                *observe_bounds
            }
        };
        observe_bounds || !packet.is_empty()
    }
}

struct Command {
    stream: String,
    packet: NativePacket,
}

struct Node {
    input: String,
    output: String,
    calculator: Box<dyn Calculator>,
}

fn close_observers(graph: usize, observers: HashMap<String, Vec<Observer>>) {
    for observer in observers.values().flatten() {
        observer.close(graph);
    }
}

/// Routes packets on the worker thread.
struct Router {
    graph: usize,
    nodes: Vec<Node>,
    observers: HashMap<String, Vec<Observer>>,
}

impl Router {
    fn route(&mut self, stream: String, packet: NativePacket) -> Result<(), NativeStatus> {
        let mut queue = VecDeque::from([(stream, packet)]);
        while let Some((stream, packet)) = queue.pop_front() {
            self.deliver(&stream, &packet)?;
            for node in self.nodes.iter_mut().filter(|node| node.input == stream) {
                let output = node
                    .calculator
                    .process(&packet)?
                    .unwrap_or_else(|| NativePacket::empty(packet.timestamp));
                queue.push_back((node.output.clone(), output));
            }
        }
        Ok(())
    }

    fn deliver(&self, stream: &str, packet: &NativePacket) -> Result<(), NativeStatus> {
        let Some(observers) = self.observers.get(stream) else {
            return Ok(());
        };
        for observer in observers.iter().filter(|o| o.accepts(packet)) {
            match observer {
                Observer::Poller { tx, .. } => {
                    if tx.send(packet.clone()).is_err() {
                        trace!(stream, "poller was dropped");
                    }
                }
                Observer::Callback { stream_id, callback, .. } => {
                    // SAFETY: `packet` outlives the call; the callback contract forbids retaining it.
                    let args = unsafe { callback(self.graph as *mut NativeGraph, *stream_id, packet) };
                    // SAFETY: the message belongs to us once the callback returns.
                    let status = unsafe { args.into_native() };
                    if !status.is_ok() {
                        return Err(status);
                    }
                }
            }
        }
        Ok(())
    }
}

impl GraphShared {
    fn known_stream(&self, name: &str) -> bool {
        self.config.input_streams.iter().any(|s| s == name)
            || self.config.nodes.iter().any(|n| n.input_stream == name || n.output_stream == name)
    }

    fn add_observer(&self, name: &str, observer: Observer) -> NativeStatus {
        let mut state = self.state.lock();
        if state.phase != Phase::Initialized {
            return NativeStatus::failed_precondition("observers must be added before the graph starts");
        }
        if !self.known_stream(name) {
            return NativeStatus::not_found(format!("no stream named '{name}'"));
        }
        state.observers.entry(name.to_string()).or_default().push(observer);
        NativeStatus::ok()
    }

    fn start_run(self: &Arc<Self>, graph: usize, side_packets: &NativePacketMap) -> NativeStatus {
        let mut state = self.state.lock();
        if state.phase != Phase::Initialized {
            return NativeStatus::failed_precondition("graph has already been started");
        }

        let mut nodes = Vec::with_capacity(self.config.nodes.len());
        for node in &self.config.nodes {
            let built = calculator::build(node, side_packets).and_then(|mut calculator| {
                calculator.open()?;
                Ok(calculator)
            });
            match built {
                Ok(calculator) => nodes.push(Node {
                    input: node.input_stream.clone(),
                    output: node.output_stream.clone(),
                    calculator,
                }),
                Err(status) => {
                    warn!(calculator = %node.calculator, message = %status.message, "failed to open calculator");
                    state.phase = Phase::Done;
                    let observers = std::mem::take(&mut state.observers);
                    state.error = Some(status.clone());
                    self.changed.notify_all();
                    drop(state);
                    close_observers(graph, observers);
                    return status;
                }
            }
        }

        let (tx, rx) = match self.config.max_queue_size {
            0 => crossbeam_channel::unbounded(),
            bound => crossbeam_channel::bounded(bound),
        };
        state.open_inputs = self.config.input_streams.iter().cloned().collect();
        state.input = (!state.open_inputs.is_empty()).then_some(tx);
        state.phase = Phase::Running;

        let router = Router { graph, nodes, observers: std::mem::take(&mut state.observers) };
        let shared = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("mp-graph-worker".to_string())
            .spawn(move || shared.run(router, rx));
        match spawned {
            Ok(handle) => {
                state.worker = Some(handle);
                info!(nodes = self.config.nodes.len(), "graph started");
                NativeStatus::ok()
            }
            Err(e) => {
                state.phase = Phase::Done;
                state.input = None;
                let status = NativeStatus::internal(format!("failed to spawn graph worker: {e}"));
                state.error = Some(status.clone());
                status
            }
        }
    }

    fn run(&self, mut router: Router, rx: Receiver<Command>) {
        for command in rx.iter() {
            if self.state.lock().cancelled {
                break;
            }
            let result = router.route(command.stream, command.packet);
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
            if let Err(status) = result {
                warn!(code = status.code, message = %status.message, "graph run failed");
                state.error.get_or_insert(status);
                state.input = None;
                state.open_inputs.clear();
                self.changed.notify_all();
                break;
            }
            self.changed.notify_all();
        }
        // Observers learn about the end before `wait_until_done` returns.
        // Dropping the router closes every poller channel.
        close_observers(router.graph, std::mem::take(&mut router.observers));
        drop(router);
        let mut state = self.state.lock();
        state.phase = Phase::Done;
        state.input = None;
        state.pending = 0;
        self.changed.notify_all();
        debug!(failed = state.error.is_some(), "graph worker finished");
    }

    fn add_packet(&self, name: &str, packet: NativePacket) -> NativeStatus {
        let tx = {
            let mut state = self.state.lock();
            if state.phase != Phase::Running {
                return NativeStatus::failed_precondition("graph is not running");
            }
            if !self.config.input_streams.iter().any(|s| s == name) {
                return NativeStatus::not_found(format!("no input stream named '{name}'"));
            }
            if !state.open_inputs.contains(name) {
                return NativeStatus::failed_precondition(format!("input stream '{name}' is closed"));
            }
            let Some(tx) = state.input.clone() else {
                return NativeStatus::failed_precondition("graph is shutting down");
            };
            state.pending += 1;
            tx
        };
        // Sending outside the lock: a bounded queue may block until the worker catches up.
        if tx.send(Command { stream: name.to_string(), packet }).is_err() {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
            return NativeStatus::failed_precondition("graph is shutting down");
        }
        NativeStatus::ok()
    }

    fn close_input_stream(&self, name: &str) -> NativeStatus {
        let mut state = self.state.lock();
        if !self.config.input_streams.iter().any(|s| s == name) {
            return NativeStatus::not_found(format!("no input stream named '{name}'"));
        }
        state.open_inputs.remove(name);
        if state.open_inputs.is_empty() {
            state.input = None;
        }
        NativeStatus::ok()
    }

    fn close_all_packet_sources(&self) -> NativeStatus {
        let mut state = self.state.lock();
        state.open_inputs.clear();
        state.input = None;
        NativeStatus::ok()
    }

    fn final_status(state: &GraphState) -> NativeStatus {
        state.error.clone().unwrap_or_else(NativeStatus::ok)
    }

    fn wait_until_idle(&self) -> NativeStatus {
        let mut state = self.state.lock();
        while state.phase == Phase::Running && state.pending > 0 {
            self.changed.wait(&mut state);
        }
        Self::final_status(&state)
    }

    fn wait_until_done(&self) -> NativeStatus {
        let worker = {
            let mut state = self.state.lock();
            if state.phase == Phase::Initialized {
                return NativeStatus::failed_precondition("graph has not been started");
            }
            while state.phase == Phase::Running {
                self.changed.wait(&mut state);
            }
            state.worker.take()
        };
        join_worker(worker);
        Self::final_status(&self.state.lock())
    }

    /// Stops the run. A running worker closes its observers on the way out;
    /// observers of a graph that never started are closed here.
    fn cancel(&self, graph: usize) {
        let mut state = self.state.lock();
        if state.phase == Phase::Done {
            return;
        }
        state.cancelled = true;
        state.input = None;
        state.open_inputs.clear();
        state.error.get_or_insert_with(|| NativeStatus::cancelled("graph run was cancelled"));
        let observers = if state.phase == Phase::Initialized {
            state.phase = Phase::Done;
            std::mem::take(&mut state.observers)
        } else {
            HashMap::new()
        };
        self.changed.notify_all();
        drop(state);
        close_observers(graph, observers);
    }
}

fn join_worker(worker: Option<JoinHandle<()>>) {
    let Some(worker) = worker else { return };
    if worker.thread().id() == thread::current().id() {
        return;
    }
    if worker.join().is_err() {
        warn!("graph worker panicked");
    }
}

impl Drop for NativeGraph {
    fn drop(&mut self) {
        let graph = self as *mut NativeGraph as usize;
        self.shared.cancel(graph);
        let worker = self.shared.state.lock().worker.take();
        join_worker(worker);
    }
}

/// Pulls packets of one output stream.
pub struct NativePoller {
    rx: Receiver<NativePacket>,
}

unsafe fn graph_ref<'a>(graph: *const NativeGraph) -> Result<&'a NativeGraph, String> {
    // SAFETY: the caller passes live objects or null.
    unsafe { deref(graph, "graph") }
}

unsafe fn report(
    operation: &'static str,
    status_out: *mut *mut NativeStatus,
    f: impl FnOnce() -> Result<NativeStatus, String>,
) -> ReturnCode {
    guard(operation, || {
        let status = f()?;
        // SAFETY: out-pointers are valid for writes and null is rejected.
        unsafe { write_out(status_out, status.into_raw()) }
    })
}

/// Parses a YAML graph description.
///
/// # Safety
/// `config` must be valid for `len` reads; `out` must be valid for writes.
pub unsafe extern "C" fn mp_graph_new(config: *const u8, len: i32, out: *mut *mut NativeGraph) -> ReturnCode {
    guard("mp_graph_new", || {
        if config.is_null() || len < 0 {
            return Err("graph config is null".to_string());
        }
        // SAFETY: caller guarantees `len` readable bytes.
        let bytes = unsafe { std::slice::from_raw_parts(config, len as usize) };
        let config: GraphConfig =
            serde_yaml_ng::from_slice(bytes).map_err(|e| format!("invalid graph config: {e}"))?;
        config.validate().map_err(|e| e.to_string())?;
        let state = GraphState {
            phase: Phase::Initialized,
            observers: HashMap::new(),
            input: None,
            open_inputs: HashSet::new(),
            pending: 0,
            error: None,
            cancelled: false,
            worker: None,
        };
        let graph = NativeGraph {
            shared: Arc::new(GraphShared { config, state: Mutex::new(state), changed: Condvar::new() }),
        };
        // SAFETY: out-pointers are valid for writes and null is rejected.
        unsafe { write_out(out, Box::into_raw(Box::new(graph))) }
    })
}

/// Cancels a running graph, waits for its worker and frees it.
///
/// # Safety
/// `graph` must be null or a live graph not freed yet. Must not be called from a
/// callback of the same graph.
pub unsafe extern "C" fn mp_graph_delete(graph: *mut NativeGraph) {
    if !graph.is_null() {
        // SAFETY: allocated with `Box::into_raw`.
        drop(unsafe { Box::from_raw(graph) });
    }
}

/// Registers `callback` for every packet of `stream_name`.
///
/// # Safety
/// `graph` must point to a live graph, `stream_name` must be NUL-terminated and
/// `status_out` valid for writes.
pub unsafe extern "C" fn mp_graph_observe_output_stream(
    graph: *mut NativeGraph,
    stream_name: *const c_char,
    stream_id: i32,
    callback: PacketCallback,
    observe_timestamp_bounds: bool,
    status_out: *mut *mut NativeStatus,
) -> ReturnCode {
    // SAFETY: the pointers meet this function's `# Safety` contract.
    unsafe {
        report("mp_graph_observe_output_stream", status_out, || {
            let graph = graph_ref(graph)?;
            let name = read_str(stream_name)?;
            let observer =
                Observer::Callback { stream_id, callback, observe_bounds: observe_timestamp_bounds };
            Ok(graph.shared.add_observer(&name, observer))
        })
    }
}

/// Creates a poller for `stream_name`. `poller_out` is only written on success.
///
/// # Safety
/// `graph` must point to a live graph, `stream_name` must be NUL-terminated and
/// both out-pointers valid for writes.
pub unsafe extern "C" fn mp_graph_add_output_stream_poller(
    graph: *mut NativeGraph,
    stream_name: *const c_char,
    observe_timestamp_bounds: bool,
    status_out: *mut *mut NativeStatus,
    poller_out: *mut *mut NativePoller,
) -> ReturnCode {
    // SAFETY: the pointers meet this function's `# Safety` contract.
    unsafe {
        report("mp_graph_add_output_stream_poller", status_out, || {
            let graph = graph_ref(graph)?;
            let name = read_str(stream_name)?;
            let (tx, rx) = crossbeam_channel::unbounded();
            let status = graph
                .shared
                .add_observer(&name, Observer::Poller { tx, observe_bounds: observe_timestamp_bounds });
            if status.is_ok() {
                write_out(poller_out, Box::into_raw(Box::new(NativePoller { rx })))?;
            }
            Ok(status)
        })
    }
}

/// # Safety
/// `graph` must point to a live graph; `status_out` must be valid for writes.
pub unsafe extern "C" fn mp_graph_start_run(graph: *mut NativeGraph, status_out: *mut *mut NativeStatus) -> ReturnCode {
    unsafe {
        report("mp_graph_start_run", status_out, || {
            let shared = &graph_ref(graph)?.shared;
            Ok(shared.start_run(graph as usize, &NativePacketMap::default()))
        })
    }
}

/// Starts the run with `side_packets` available to every calculator. The map
/// is only read; calculators keep their own copies of the packets they use.
///
/// # Safety
/// `graph` and `side_packets` must be live; `status_out` must be valid for writes.
pub unsafe extern "C" fn mp_graph_start_run_with_side_packets(
    graph: *mut NativeGraph,
    side_packets: *const NativePacketMap,
    status_out: *mut *mut NativeStatus,
) -> ReturnCode {
    // SAFETY: the pointers meet this function's `# Safety` contract.
    unsafe {
        report("mp_graph_start_run_with_side_packets", status_out, || {
            let shared = &graph_ref(graph)?.shared;
            let side_packets = deref(side_packets, "side packets")?;
            Ok(shared.start_run(graph as usize, side_packets))
        })
    }
}

/// Moves `packet` into the input queue. The packet is consumed even on failure.
///
/// # Safety
/// `graph` must point to a live graph; `packet` must be a live packet that the
/// caller no longer uses; `status_out` must be valid for writes.
pub unsafe extern "C" fn mp_graph_add_packet_to_input_stream(
    graph: *mut NativeGraph,
    stream_name: *const c_char,
    packet: *mut NativePacket,
    status_out: *mut *mut NativeStatus,
) -> ReturnCode {
    // SAFETY: the pointers meet this function's `# Safety` contract.
    unsafe {
        report("mp_graph_add_packet_to_input_stream", status_out, || {
            if packet.is_null() {
                return Err("packet is null".to_string());
            }
            // SAFETY: ownership moves into the graph.
            let packet = *Box::from_raw(packet);
            let graph = graph_ref(graph)?;
            let name = read_str(stream_name)?;
            Ok(graph.shared.add_packet(&name, packet))
        })
    }
}

/// # Safety
/// `graph` must point to a live graph; `status_out` must be valid for writes.
pub unsafe extern "C" fn mp_graph_close_input_stream(
    graph: *mut NativeGraph,
    stream_name: *const c_char,
    status_out: *mut *mut NativeStatus,
) -> ReturnCode {
    // SAFETY: the pointers meet this function's `# Safety` contract.
    unsafe {
        report("mp_graph_close_input_stream", status_out, || {
            let graph = graph_ref(graph)?;
            let name = read_str(stream_name)?;
            Ok(graph.shared.close_input_stream(&name))
        })
    }
}

macro_rules! graph_pump {
    ($name:ident, $method:ident) => {
        /// # Safety
        /// `graph` must point to a live graph; `status_out` must be valid for writes.
        pub unsafe extern "C" fn $name(graph: *mut NativeGraph, status_out: *mut *mut NativeStatus) -> ReturnCode {
            unsafe { report(stringify!($name), status_out, || Ok(graph_ref(graph)?.shared.$method())) }
        }
    };
}

graph_pump!(mp_graph_close_all_packet_sources, close_all_packet_sources);
graph_pump!(mp_graph_wait_until_idle, wait_until_idle);
graph_pump!(mp_graph_wait_until_done, wait_until_done);

/// # Safety
/// `graph` must point to a live graph.
pub unsafe extern "C" fn mp_graph_has_error(graph: *const NativeGraph) -> bool {
    unsafe { graph_ref(graph) }.map(|g| g.shared.state.lock().error.is_some()).unwrap_or(true)
}

/// # Safety
/// `graph` must point to a live graph.
pub unsafe extern "C" fn mp_graph_cancel(graph: *mut NativeGraph) -> ReturnCode {
    guard("mp_graph_cancel", || {
        unsafe { graph_ref(graph) }?.shared.cancel(graph as usize);
        Ok(())
    })
}

/// # Safety
/// `poller` must be null or a live poller not freed yet.
pub unsafe extern "C" fn mp_poller_delete(poller: *mut NativePoller) {
    if !poller.is_null() {
        // SAFETY: allocated with `Box::into_raw`.
        drop(unsafe { Box::from_raw(poller) });
    }
}

/// Blocks until the next packet arrives and overwrites `packet` with it.
/// `out` is set to false once the stream is closed and drained.
///
/// # Safety
/// `poller` and `packet` must be live; `out` must be valid for writes.
pub unsafe extern "C" fn mp_poller_next(
    poller: *mut NativePoller,
    packet: *mut NativePacket,
    out: *mut bool,
) -> ReturnCode {
    guard("mp_poller_next", || {
        // SAFETY: the caller passes live objects or null.
        let poller = unsafe { deref(poller, "poller") }?;
        let target = unsafe { super::deref_mut(packet, "packet") }?;
        let received = match poller.rx.recv() {
            Ok(next) => {
                *target = next;
                true
            }
            Err(_) => false,
        };
        // SAFETY: out-pointers are valid for writes and null is rejected.
        unsafe { write_out(out, received) }
    })
}

/// Non-blocking variant of [`mp_poller_next`]. Writes 1 after overwriting
/// `packet`, 0 when nothing is queued and -1 once the stream is closed and drained.
///
/// # Safety
/// `poller` and `packet` must be live; `out` must be valid for writes.
pub unsafe extern "C" fn mp_poller_try_next(
    poller: *mut NativePoller,
    packet: *mut NativePacket,
    out: *mut i32,
) -> ReturnCode {
    guard("mp_poller_try_next", || {
        // SAFETY: the caller passes live objects or null.
        let poller = unsafe { deref(poller, "poller") }?;
        let target = unsafe { super::deref_mut(packet, "packet") }?;
        let state = match poller.rx.try_recv() {
            Ok(next) => {
                *target = next;
                1
            }
            Err(TryRecvError::Empty) => 0,
            Err(TryRecvError::Disconnected) => -1,
        };
        // SAFETY: out-pointers are valid for writes and null is rejected.
        unsafe { write_out(out, state) }
    })
}

/// # Safety
/// `poller` must point to a live poller.
pub unsafe extern "C" fn mp_poller_queue_size(poller: *const NativePoller) -> i32 {
    unsafe { deref(poller, "poller") }.map(|p| p.rx.len() as i32).unwrap_or(0)
}
