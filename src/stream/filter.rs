use crate::timestamp::Timestamp;

/// Drops deliveries that do not advance a stream's timestamp.
///
/// A packet with a value is admitted iff its timestamp is greater than the
/// last admitted one. An empty packet (a timestamp bound) must additionally be
/// at least `timeout_micros` past it, so a consumer only hears "no output"
/// once the output has really gone away.
#[derive(Debug, Clone)]
pub struct TimestampFilter {
    last: Option<Timestamp>,
    timeout_micros: i64,
}

impl TimestampFilter {
    pub fn new(timeout_micros: i64) -> Self {
        Self { last: None, timeout_micros: timeout_micros.max(0) }
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.last
    }

    /// Decides whether to deliver a packet, advancing the filter if so.
    pub fn admit(&mut self, timestamp: Timestamp, is_empty: bool) -> bool {
        if self.last.is_some_and(|last| timestamp <= last) {
            return false;
        }
        if is_empty {
            let reference = self.last.map_or(0, Timestamp::micros);
            if timestamp.micros().saturating_sub(reference) < self.timeout_micros {
                return false;
            }
        }
        self.last = Some(timestamp);
        true
    }

    /// Moves the reference point to `now` if nothing was admitted for longer than `timeout_micros`.
    pub fn reset_if_timed_out(&mut self, now: Timestamp, timeout_micros: i64) -> bool {
        let reference = self.last.map_or(0, Timestamp::micros);
        if now.micros().saturating_sub(reference) <= timeout_micros {
            return false;
        }
        self.last = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn admitted(filter: &mut TimestampFilter, timestamps: &[i64]) -> Vec<i64> {
        timestamps.iter().copied().filter(|&t| filter.admit(Timestamp::new(t), false)).collect()
    }

    #[test]
    fn drops_stale_and_duplicate_timestamps() {
        let mut filter = TimestampFilter::new(0);
        assert_eq!(admitted(&mut filter, &[5, 3, 7, 7, 9]), vec![5, 7, 9]);
        assert_eq!(filter.last_timestamp(), Some(Timestamp::new(9)));
    }

    #[test]
    fn empty_packets_wait_for_the_timeout() {
        let mut filter = TimestampFilter::new(100);
        assert!(filter.admit(Timestamp::new(1_000), false));
        assert!(!filter.admit(Timestamp::new(1_050), true));
        assert_eq!(filter.last_timestamp(), Some(Timestamp::new(1_000)));
        assert!(filter.admit(Timestamp::new(1_100), true));
        assert!(filter.admit(Timestamp::new(1_101), false));
    }

    #[test]
    fn reset_only_after_timeout() {
        let mut filter = TimestampFilter::new(0);
        filter.admit(Timestamp::new(100), false);
        assert!(!filter.reset_if_timed_out(Timestamp::new(150), 50));
        assert!(filter.reset_if_timed_out(Timestamp::new(151), 50));
        assert_eq!(filter.last_timestamp(), Some(Timestamp::new(151)));
        assert!(!filter.admit(Timestamp::new(151), false));
    }

    proptest! {
        #[test]
        fn admitted_timestamps_strictly_increase(timestamps in prop::collection::vec(-1_000i64..1_000, 0..64)) {
            let mut filter = TimestampFilter::new(0);
            let delivered = admitted(&mut filter, &timestamps);
            prop_assert!(delivered.windows(2).all(|w| w[0] < w[1]));
            let max = timestamps.iter().copied().max();
            prop_assert_eq!(delivered.last().copied(), max);
        }
    }
}
