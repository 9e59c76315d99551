//! Stream throttling for value subscriptions.

use futures::{Stream, ready};
use pin_project_lite::pin_project;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior, interval};

/// How often a subscription may yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateRate {
    /// Every value the graph produces.
    #[default]
    Native,

    /// At most this many values per second; `Max(0)` behaves like `Native`.
    Max(u32),
}

impl UpdateRate {
    /// Minimum spacing between values, if throttled.
    pub fn interval(self) -> Option<Duration> {
        match self {
            UpdateRate::Native | UpdateRate::Max(0) => None,
            UpdateRate::Max(hz) => Some(Duration::from_secs_f64(1.0 / hz as f64)),
        }
    }
}

/// Extension trait to add throttling to any Stream
pub trait ThrottleExt: Stream {
    /// Emit at most once per `period`, keeping only the latest item of each period.
    fn throttle(self, period: Duration) -> Throttle<Self>
    where
        Self: Sized,
    {
        Throttle::new(self, period)
    }
}

impl<T: Stream> ThrottleExt for T {}

pin_project! {
    /// A stream combinator with latest-wins rate limiting.
    pub struct Throttle<S: Stream> {
        #[pin]
        stream: S,
        interval: Interval,
        pending: Option<S::Item>,
        ticked: bool,
        done: bool,
    }
}

impl<S: Stream> Throttle<S> {
    pub fn new(stream: S, period: Duration) -> Self {
        let mut interval = interval(period);
        // Delay instead of bursting after a slow consumer.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self { stream, interval, pending: None, ticked: false, done: false }
    }
}

impl<S: Stream> Stream for Throttle<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.done {
            return Poll::Ready(this.pending.take());
        }

        if !*this.ticked {
            ready!(this.interval.poll_tick(cx));
            *this.ticked = true;
        }

        // Drain everything queued since the last emission, keeping the latest.
        loop {
            match this.stream.as_mut().poll_next(cx) {
                Poll::Ready(Some(item)) => {
                    *this.pending = Some(item);
                }
                Poll::Ready(None) => {
                    *this.done = true;
                    return Poll::Ready(this.pending.take());
                }
                Poll::Pending => {
                    return match this.pending.take() {
                        Some(item) => {
                            *this.ticked = false;
                            Poll::Ready(Some(item))
                        }
                        None => Poll::Pending,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn update_rate_intervals() {
        assert_eq!(UpdateRate::Native.interval(), None);
        assert_eq!(UpdateRate::Max(0).interval(), None);
        assert_eq!(UpdateRate::Max(4).interval(), Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn keeps_only_the_latest_item() {
        let items: Vec<i32> = futures::stream::iter(0..10).throttle(Duration::from_millis(5)).collect().await;
        assert_eq!(items, vec![9]);
    }

    #[tokio::test]
    async fn waits_for_items_without_ending() {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let mut throttled = Box::pin(tokio_stream::wrappers::UnboundedReceiverStream::new(rx).throttle(Duration::from_millis(5)));

        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tx.send(1).unwrap();
        });
        assert_eq!(throttled.next().await, Some(1));
        producer.await.unwrap();
        assert_eq!(throttled.next().await, None);
    }
}
