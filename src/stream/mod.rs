//! Retrieving results from a running graph.
//!
//! An [`OutputStream`] delivers the packets of one graph output either to a
//! consumer that polls it once per tick, or to listeners invoked on the
//! graph's worker thread. Both paths pass through a [`TimestampFilter`], so a
//! consumer never sees a timestamp twice or out of order.

mod filter;
mod output;
mod poller;
mod throttle;

pub use filter::TimestampFilter;
pub use output::{OutputStream, StreamMode, ValueStream, set_max_streams};
pub use poller::OutputStreamPoller;
pub use throttle::{Throttle, ThrottleExt, UpdateRate};

/// Outcome of a non-terminal retrieval attempt.
#[derive(Debug)]
pub enum Next<T> {
    Ready(T),
    /// Nothing is available yet; try again later.
    NotReady,
    /// The stream has ended and will never yield again.
    Closed,
}

impl<T> Next<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Next::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Next::Closed)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Next<U> {
        match self {
            Next::Ready(value) => Next::Ready(f(value)),
            Next::NotReady => Next::NotReady,
            Next::Closed => Next::Closed,
        }
    }
}
