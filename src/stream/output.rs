use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::Stream;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, trace, warn};

use super::{Next, OutputStreamPoller, ThrottleExt, TimestampFilter, UpdateRate};
use crate::config::OutputStreamConfig;
use crate::error::{BridgeError, Result};
use crate::graph::CalculatorGraph;
use crate::handle::ResourceHandle;
use crate::native::{NativeGraph, NativePacket, StatusArgs};
use crate::packet::{Packet, PacketValue};
use crate::table::{CallbackKey, CallbackTable};
use crate::timestamp::Timestamp;

/// Values of a subscribed output stream.
pub type ValueStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

type Listener<T> = Arc<dyn Fn(&Packet<T>) + Send + Sync>;

trait PacketDispatch: Send + Sync {
    fn dispatch(&self, graph: usize, packet: *const NativePacket) -> StatusArgs;
}

lazy_static! {
    static ref OUTPUT_STREAMS: CallbackTable<dyn PacketDispatch> = CallbackTable::new("output_streams", 20);
}

/// Limits how many callback-mode streams may be open at once.
pub fn set_max_streams(max_streams: usize) {
    OUTPUT_STREAMS.set_max_size(max_streams);
}

/// Entry point native calls for every packet of an observed stream.
unsafe extern "C" fn dispatch_packet(graph: *mut NativeGraph, stream_id: i32, packet: *const NativePacket) -> StatusArgs {
    let dispatched = catch_unwind(AssertUnwindSafe(|| match OUTPUT_STREAMS.lookup(CallbackKey::from_raw(stream_id)) {
        Some(stream) => stream.dispatch(graph as usize, packet),
        None => StatusArgs::not_found(&format!("no output stream is registered under id {stream_id}")),
    }));
    dispatched.unwrap_or_else(|_| {
        error!(stream_id, "output stream listener panicked");
        StatusArgs::internal("output stream listener panicked")
    })
}

struct StreamShared<T> {
    name: String,
    graph: usize,
    filter: Mutex<TimestampFilter>,
    closed: AtomicBool,
    listeners: Mutex<Vec<Listener<T>>>,
    in_flight: Mutex<()>,
}

impl<T: PacketValue> StreamShared<T> {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(stream = %self.name, "output stream closed");
        }
    }

    fn admit(&self, packet: &Packet<T>) -> bool {
        match (packet.timestamp(), packet.is_empty()) {
            (Ok(timestamp), Ok(is_empty)) => {
                let admitted = self.filter.lock().admit(timestamp, is_empty);
                if !admitted {
                    trace!(stream = %self.name, %timestamp, is_empty, "dropping packet that does not advance the stream");
                }
                admitted
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(stream = %self.name, error = %err, "unreadable packet");
                false
            }
        }
    }
}

impl<T: PacketValue> PacketDispatch for StreamShared<T> {
    fn dispatch(&self, graph: usize, packet: *const NativePacket) -> StatusArgs {
        if graph != self.graph {
            return StatusArgs::invalid_argument(&format!(
                "output stream '{}' belongs to a different graph",
                self.name
            ));
        }
        let _in_flight = self.in_flight.lock();
        if packet.is_null() {
            // The run is over. Dropping the listeners ends every subscription.
            self.mark_closed();
            self.listeners.lock().clear();
            return StatusArgs::ok();
        }
        if self.is_closed() {
            return StatusArgs::ok();
        }
        // SAFETY: native keeps the packet alive until the callback returns.
        let packet = unsafe { Packet::<T>::borrowed(packet) };
        if !self.admit(&packet) {
            return StatusArgs::ok();
        }
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            listener(&packet);
        }
        StatusArgs::ok()
    }
}

/// How an [`OutputStream`] receives its packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// The consumer pulls with [`OutputStream::try_get_next`].
    Polling,
    /// Listeners run on the graph's worker thread.
    Callback,
}

/// One output of a running graph.
///
/// A stream is opened before [`CalculatorGraph::start_run`] and closes for
/// good when the graph finishes, fails or is cancelled, or when
/// [`close`](Self::close) is called. Once closed, every retrieval reports
/// [`Next::Closed`].
pub struct OutputStream<T: PacketValue + 'static> {
    shared: Arc<StreamShared<T>>,
    mode: StreamMode,
    poller: Option<OutputStreamPoller<T>>,
    key: Option<CallbackKey>,
}

impl<T: PacketValue + 'static> OutputStream<T> {
    pub fn new(graph: &CalculatorGraph, name: &str, mode: StreamMode, config: &OutputStreamConfig) -> Result<Self> {
        let shared = Arc::new(StreamShared {
            name: name.to_string(),
            graph: graph.handle().address(),
            filter: Mutex::new(TimestampFilter::new(config.timeout_micros)),
            closed: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            in_flight: Mutex::new(()),
        });
        let mut stream = Self { shared, mode, poller: None, key: None };
        match mode {
            StreamMode::Polling => {
                stream.poller = Some(graph.add_output_stream_poller(name, config.observe_timestamp_bounds)?);
            }
            StreamMode::Callback => {
                let dispatch: Arc<dyn PacketDispatch> = stream.shared.clone();
                let key = OUTPUT_STREAMS.register(dispatch)?;
                // Dropping `stream` on failure unregisters the key.
                stream.key = Some(key);
                graph.observe_output_stream(name, key, dispatch_packet, config.observe_timestamp_bounds)?;
            }
        }
        debug!(stream = name, ?mode, "output stream opened");
        Ok(stream)
    }

    pub fn polling(graph: &CalculatorGraph, name: &str, config: &OutputStreamConfig) -> Result<Self> {
        Self::new(graph, name, StreamMode::Polling, config)
    }

    pub fn callback(graph: &CalculatorGraph, name: &str, config: &OutputStreamConfig) -> Result<Self> {
        Self::new(graph, name, StreamMode::Callback, config)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.shared.filter.lock().last_timestamp()
    }

    /// Returns the next packet that advances the stream.
    ///
    /// With `block` the call waits for the graph; without it, `NotReady` means
    /// nothing is queued yet. Failures close the stream instead of surfacing.
    /// A callback-mode stream cannot be polled and always reports `NotReady`.
    pub fn try_get_next(&mut self, block: bool) -> Next<Packet<T>> {
        if self.shared.is_closed() {
            return Next::Closed;
        }
        let Some(poller) = self.poller.as_mut() else {
            warn!(stream = %self.shared.name, "listener streams cannot be polled");
            return Next::NotReady;
        };
        loop {
            let next = if block {
                poller.next().map(|packet| packet.map_or(Next::Closed, Next::Ready))
            } else {
                poller.try_next()
            };
            match next {
                Ok(Next::Ready(packet)) => {
                    if self.shared.admit(&packet) {
                        return Next::Ready(packet);
                    }
                }
                Ok(Next::NotReady) => return Next::NotReady,
                Ok(Next::Closed) => {
                    self.shared.mark_closed();
                    return Next::Closed;
                }
                Err(err) => {
                    warn!(stream = %self.shared.name, error = %err, "polling failed");
                    self.shared.mark_closed();
                    return Next::Closed;
                }
            }
        }
    }

    /// Like [`try_get_next`](Self::try_get_next), but drops packets stamped
    /// before `threshold` instead of returning them.
    pub fn try_get_next_after(&mut self, threshold: Timestamp, block: bool) -> Next<Packet<T>> {
        loop {
            match self.try_get_next(block) {
                Next::Ready(packet) => match packet.timestamp() {
                    Ok(timestamp) if timestamp < threshold => {
                        trace!(stream = %self.shared.name, %timestamp, %threshold, "dropping packet below threshold");
                    }
                    _ => return Next::Ready(packet),
                },
                other => return other,
            }
        }
    }

    /// Like [`try_get_next`](Self::try_get_next), but moves the value out of the packet.
    pub fn try_consume_next(&mut self, block: bool) -> Next<Result<T>> {
        self.try_get_next(block).map(|mut packet| packet.consume())
    }

    /// Runs `listener` for every admitted packet, on the graph's worker thread.
    ///
    /// The packet is only valid during the call.
    pub fn add_listener(&self, listener: impl Fn(&Packet<T>) + Send + Sync + 'static) -> Result<()> {
        if self.mode != StreamMode::Callback {
            return Err(BridgeError::invalid_argument(format!(
                "output stream '{}' is polled and takes no listeners",
                self.shared.name
            )));
        }
        if self.shared.is_closed() {
            return Err(BridgeError::stream_closed(self.shared.name.clone()));
        }
        self.shared.listeners.lock().push(Arc::new(listener));
        Ok(())
    }

    pub fn remove_all_listeners(&self) {
        let removed = std::mem::take(&mut *self.shared.listeners.lock());
        trace!(stream = %self.shared.name, count = removed.len(), "listeners removed");
    }

    /// Streams the values of non-empty packets until the stream closes.
    ///
    /// A throttled subscription must be created inside a Tokio runtime.
    pub fn subscribe(&self, rate: UpdateRate) -> Result<ValueStream<T>>
    where
        T: Send,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = self.shared.name.clone();
        self.add_listener(move |packet: &Packet<T>| {
            if packet.is_empty().unwrap_or(true) {
                return;
            }
            match packet.get() {
                Ok(value) => {
                    if tx.send(value).is_err() {
                        trace!(stream = %name, "subscriber went away");
                    }
                }
                Err(err) => warn!(stream = %name, error = %err, "failed to read packet"),
            }
        })?;

        let values = UnboundedReceiverStream::new(rx);
        let stream: ValueStream<T> = match rate.interval() {
            Some(period) => Box::pin(values.throttle(period)),
            None => Box::pin(values),
        };
        Ok(stream)
    }

    /// Moves the timestamp reference to `now` if the stream has been silent for longer than `timeout_micros`.
    pub fn reset_timestamp_if_timed_out(&self, now: Timestamp, timeout_micros: i64) -> bool {
        self.shared.filter.lock().reset_if_timed_out(now, timeout_micros)
    }

    /// Stops delivery. In-flight listener calls finish; nothing is delivered afterwards.
    pub fn close(&mut self) {
        self.shared.mark_closed();
        self.remove_all_listeners();
        if let Some(mut poller) = self.poller.take() {
            poller.dispose();
        }
    }
}

impl<T: PacketValue + 'static> Drop for OutputStream<T> {
    fn drop(&mut self) {
        self.close();
        if let Some(key) = self.key.take() {
            OUTPUT_STREAMS.remove(key);
        }
    }
}

impl<T: PacketValue + 'static> fmt::Debug for OutputStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputStream")
            .field("name", &self.shared.name)
            .field("mode", &self.mode)
            .field("closed", &self.shared.is_closed())
            .field("last_timestamp", &self.last_timestamp())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use crate::status::StatusCode;
    use futures::StreamExt;
    use std::time::Duration;

    fn pass_through() -> CalculatorGraph {
        test_utils::pass_through_graph("in", "out").unwrap()
    }

    fn feed(graph: &CalculatorGraph, timestamps: &[i64]) {
        for &t in timestamps {
            graph.add_packet_to_input_stream("in", Packet::new_at(t as i32, Timestamp::new(t)).unwrap()).unwrap();
        }
    }

    #[test]
    fn polling_skips_timestamps_that_do_not_advance() {
        let graph = pass_through();
        let mut stream = OutputStream::<i32>::polling(&graph, "out", &OutputStreamConfig::default()).unwrap();
        graph.start_run().unwrap();
        assert!(matches!(stream.try_get_next(false), Next::NotReady));

        feed(&graph, &[5, 3, 7, 7, 9]);
        graph.close_all_packet_sources().unwrap();
        graph.wait_until_done().unwrap();

        let mut values = Vec::new();
        while let Next::Ready(mut packet) = stream.try_get_next(true) {
            values.push(packet.consume().unwrap());
        }
        assert_eq!(values, vec![5, 7, 9]);
        assert!(stream.is_closed());
        assert!(matches!(stream.try_get_next(false), Next::Closed));
        assert!(matches!(stream.try_consume_next(true), Next::Closed));
    }

    #[test]
    fn listeners_see_timestamps_in_order() {
        let graph = pass_through();
        let stream = OutputStream::<i32>::callback(&graph, "out", &OutputStreamConfig::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        stream.add_listener(move |packet| sink.lock().push(packet.timestamp().unwrap().micros())).unwrap();

        graph.start_run().unwrap();
        feed(&graph, &[5, 3, 7, 7, 9]);
        graph.close_all_packet_sources().unwrap();
        graph.wait_until_done().unwrap();

        assert_eq!(*seen.lock(), vec![5, 7, 9]);
        assert_eq!(stream.last_timestamp(), Some(Timestamp::new(9)));
    }

    #[test]
    fn timestamp_bounds_respect_the_timeout() {
        let graph = pass_through();
        let config = OutputStreamConfig { observe_timestamp_bounds: true, timeout_micros: 100 };
        let stream = OutputStream::<i32>::callback(&graph, "out", &config).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        stream
            .add_listener(move |packet| {
                sink.lock().push((packet.timestamp().unwrap().micros(), packet.is_empty().unwrap()))
            })
            .unwrap();

        graph.start_run().unwrap();
        graph.add_packet_to_input_stream("in", Packet::new_at(1, Timestamp::new(1_000)).unwrap()).unwrap();
        graph.add_packet_to_input_stream("in", Packet::<i32>::empty_at(Timestamp::new(1_050)).unwrap()).unwrap();
        graph.add_packet_to_input_stream("in", Packet::<i32>::empty_at(Timestamp::new(1_200)).unwrap()).unwrap();
        graph.close_all_packet_sources().unwrap();
        graph.wait_until_done().unwrap();

        assert_eq!(*seen.lock(), vec![(1_000, false), (1_200, true)]);
    }

    #[test]
    fn modes_reject_the_other_consumer() {
        let graph = pass_through();
        let polled = OutputStream::<i32>::polling(&graph, "out", &OutputStreamConfig::default()).unwrap();
        assert!(matches!(polled.add_listener(|_| {}), Err(BridgeError::InvalidArgument { .. })));

        let mut observed = OutputStream::<i32>::callback(&graph, "out", &OutputStreamConfig::default()).unwrap();
        assert!(matches!(observed.try_get_next(false), Next::NotReady));
        assert!(!observed.is_closed());
        observed.close();
        observed.close();
        assert!(matches!(observed.add_listener(|_| {}), Err(BridgeError::StreamClosed { .. })));
    }

    #[test]
    fn cancelling_the_graph_closes_a_blocked_stream() {
        let graph = pass_through();
        let mut stream = OutputStream::<i32>::polling(&graph, "out", &OutputStreamConfig::default()).unwrap();
        graph.start_run().unwrap();

        let waiter = std::thread::spawn(move || {
            let next = stream.try_get_next(true);
            (next.is_closed(), stream.is_closed())
        });
        std::thread::sleep(Duration::from_millis(20));
        graph.cancel().unwrap();
        assert_eq!(waiter.join().unwrap(), (true, true));
    }

    #[test]
    fn unknown_stream_ids_are_not_found() {
        // SAFETY: the packet pointer is never read for an unknown id.
        let args = unsafe { dispatch_packet(std::ptr::null_mut(), i32::MAX, std::ptr::null()) };
        let status = unsafe { args.into_native() };
        assert_eq!(status.code, StatusCode::NotFound as i32);
    }

    #[test]
    fn dispatch_rejects_a_foreign_graph() {
        let graph = pass_through();
        let stream = OutputStream::<i32>::callback(&graph, "out", &OutputStreamConfig::default()).unwrap();
        let args = stream.shared.dispatch(graph.handle().address() + 8, std::ptr::null());
        let status = unsafe { args.into_native() };
        assert_eq!(status.code, StatusCode::InvalidArgument as i32);
    }

    #[test]
    fn dropped_streams_free_their_slot() {
        let graph = pass_through();
        let before = OUTPUT_STREAMS.len();
        let stream = OutputStream::<i32>::callback(&graph, "out", &OutputStreamConfig::default()).unwrap();
        let key = stream.key.unwrap();
        assert!(OUTPUT_STREAMS.lookup(key).is_some());
        drop(stream);
        assert!(OUTPUT_STREAMS.lookup(key).is_none());
        assert!(OUTPUT_STREAMS.len() <= before + 1);
    }

    #[test]
    fn threshold_polling_skips_older_packets() {
        let graph = pass_through();
        let mut stream = OutputStream::<i32>::polling(&graph, "out", &OutputStreamConfig::default()).unwrap();
        graph.start_run().unwrap();
        feed(&graph, &[1, 2, 3, 4]);
        graph.close_all_packet_sources().unwrap();
        graph.wait_until_done().unwrap();

        let Next::Ready(packet) = stream.try_get_next_after(Timestamp::new(3), true) else {
            panic!("expected a packet at or after the threshold");
        };
        assert_eq!(packet.value(), 3);
        assert_eq!(stream.last_timestamp(), Some(Timestamp::new(3)));
        assert!(matches!(stream.try_get_next_after(Timestamp::new(10), true), Next::Closed));
    }

    #[test]
    fn callback_streams_close_when_the_run_finishes() {
        let graph = pass_through();
        let stream = OutputStream::<i32>::callback(&graph, "out", &OutputStreamConfig::default()).unwrap();
        stream.add_listener(|_| {}).unwrap();

        graph.start_run().unwrap();
        feed(&graph, &[1]);
        assert!(!stream.is_closed());
        graph.close_all_packet_sources().unwrap();
        graph.wait_until_done().unwrap();

        assert!(stream.is_closed());
        assert!(matches!(stream.add_listener(|_| {}), Err(BridgeError::StreamClosed { .. })));
    }

    #[test]
    fn callback_streams_close_when_the_run_fails() {
        let graph = pass_through();
        let stream = OutputStream::<i32>::callback(&graph, "out", &OutputStreamConfig::default()).unwrap();
        stream
            .add_listener(|packet| {
                if packet.value() == 2 {
                    panic!("listener gave up");
                }
            })
            .unwrap();

        graph.start_run().unwrap();
        feed(&graph, &[1, 2]);
        assert!(matches!(
            graph.wait_until_done(),
            Err(BridgeError::BadStatus { code: StatusCode::Internal, .. })
        ));
        assert!(stream.is_closed());
    }

    #[test]
    fn cancelling_an_unstarted_graph_closes_its_streams() {
        let graph = pass_through();
        let stream = OutputStream::<i32>::callback(&graph, "out", &OutputStreamConfig::default()).unwrap();
        graph.cancel().unwrap();
        assert!(stream.is_closed());
    }

    #[tokio::test]
    async fn subscriptions_end_with_the_run() {
        let graph = pass_through();
        let stream = OutputStream::<i32>::callback(&graph, "out", &OutputStreamConfig::default()).unwrap();
        let values = stream.subscribe(UpdateRate::Native).unwrap();

        graph.start_run().unwrap();
        feed(&graph, &[1, 2, 3]);
        graph.close_all_packet_sources().unwrap();
        graph.wait_until_done().unwrap();

        assert_eq!(values.collect::<Vec<_>>().await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn subscriptions_end_when_the_graph_is_cancelled() {
        let graph = pass_through();
        let stream = OutputStream::<i32>::callback(&graph, "out", &OutputStreamConfig::default()).unwrap();
        let values = stream.subscribe(UpdateRate::Native).unwrap();

        graph.start_run().unwrap();
        feed(&graph, &[1]);
        graph.cancel().unwrap();
        assert!(matches!(
            graph.wait_until_done(),
            Err(BridgeError::BadStatus { code: StatusCode::Cancelled, .. })
        ));
        assert!(stream.is_closed());

        let received = tokio::time::timeout(Duration::from_secs(1), values.collect::<Vec<_>>()).await.unwrap();
        assert!(received.len() <= 1);
    }

    #[tokio::test]
    async fn throttled_subscriptions_keep_the_latest_value() {
        let graph = pass_through();
        let stream = OutputStream::<i32>::callback(&graph, "out", &OutputStreamConfig::default()).unwrap();
        let values = stream.subscribe(UpdateRate::Max(1_000)).unwrap();

        graph.start_run().unwrap();
        feed(&graph, &[1, 2, 3]);
        graph.close_all_packet_sources().unwrap();
        graph.wait_until_done().unwrap();

        assert_eq!(values.collect::<Vec<_>>().await, vec![3]);
    }
}
