//! Logical packet timestamps in microseconds.

use std::fmt;

/// A logical timestamp, in microseconds. The extreme values are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const UNSET: Timestamp = Timestamp(i64::MIN);
    pub const UNSTARTED: Timestamp = Timestamp(i64::MIN + 1);
    pub const PRE_STREAM: Timestamp = Timestamp(i64::MIN + 2);
    pub const MIN: Timestamp = Timestamp(i64::MIN + 3);
    pub const MAX: Timestamp = Timestamp(i64::MAX - 3);
    pub const POST_STREAM: Timestamp = Timestamp(i64::MAX - 2);
    pub const ONE_OVER_POST_STREAM: Timestamp = Timestamp(i64::MAX - 1);
    pub const DONE: Timestamp = Timestamp(i64::MAX);

    pub const fn new(micros: i64) -> Self {
        Timestamp(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn seconds(self) -> f64 {
        self.0 as f64 / 1_000_000.0
    }

    /// Rounds to the nearest microsecond.
    pub fn from_seconds(seconds: f64) -> Self {
        Timestamp((seconds * 1_000_000.0).round() as i64)
    }

    pub fn is_special_value(self) -> bool {
        self <= Self::MIN || self >= Self::MAX
    }

    /// True for values a packet may carry, including the range limits.
    pub fn is_range_value(self) -> bool {
        (Self::MIN..=Self::MAX).contains(&self)
    }

    /// True if a packet with this timestamp may be added to a stream.
    pub fn is_allowed_in_stream(self) -> bool {
        self.is_range_value() || self == Self::PRE_STREAM || self == Self::POST_STREAM
    }

    /// The smallest timestamp allowed after a packet at `self`.
    pub fn next_allowed_in_stream(self) -> Self {
        if self >= Self::MAX || self == Self::PRE_STREAM {
            Self::ONE_OVER_POST_STREAM
        } else {
            Timestamp(self.0 + 1)
        }
    }

    /// The largest timestamp allowed before a packet at `self`.
    pub fn previous_allowed_in_stream(self) -> Self {
        if self <= Self::MIN || self == Self::POST_STREAM {
            Self::UNSTARTED
        } else {
            Timestamp(self.0 - 1)
        }
    }
}

impl From<i64> for Timestamp {
    fn from(micros: i64) -> Self {
        Timestamp(micros)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::UNSET => f.write_str("Timestamp::Unset()"),
            Self::UNSTARTED => f.write_str("Timestamp::Unstarted()"),
            Self::PRE_STREAM => f.write_str("Timestamp::PreStream()"),
            Self::MIN => f.write_str("Timestamp::Min()"),
            Self::MAX => f.write_str("Timestamp::Max()"),
            Self::POST_STREAM => f.write_str("Timestamp::PostStream()"),
            Self::ONE_OVER_POST_STREAM => f.write_str("Timestamp::OneOverPostStream()"),
            Self::DONE => f.write_str("Timestamp::Done()"),
            Timestamp(micros) => write!(f, "{micros}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn special_values_are_ordered() {
        assert!(Timestamp::UNSET < Timestamp::UNSTARTED);
        assert!(Timestamp::PRE_STREAM < Timestamp::MIN);
        assert!(Timestamp::MAX < Timestamp::POST_STREAM);
        assert!(Timestamp::ONE_OVER_POST_STREAM < Timestamp::DONE);
        assert!(Timestamp::UNSET.is_special_value());
        assert!(!Timestamp::new(0).is_special_value());
    }

    #[test]
    fn stream_bounds() {
        assert!(Timestamp::PRE_STREAM.is_allowed_in_stream());
        assert!(Timestamp::POST_STREAM.is_allowed_in_stream());
        assert!(!Timestamp::UNSET.is_allowed_in_stream());
        assert_eq!(Timestamp::PRE_STREAM.next_allowed_in_stream(), Timestamp::ONE_OVER_POST_STREAM);
        assert_eq!(Timestamp::MIN.previous_allowed_in_stream(), Timestamp::UNSTARTED);
        assert_eq!(Timestamp::new(5).next_allowed_in_stream(), Timestamp::new(6));
    }

    #[test]
    fn display_names_special_values() {
        assert_eq!(Timestamp::DONE.to_string(), "Timestamp::Done()");
        assert_eq!(Timestamp::new(42).to_string(), "42");
    }

    proptest! {
        #[test]
        fn seconds_round_trip(micros in -1_000_000_000_000i64..1_000_000_000_000i64) {
            let ts = Timestamp::new(micros);
            prop_assert_eq!(Timestamp::from_seconds(ts.seconds()), ts);
        }

        #[test]
        fn next_is_greater_for_range_values(micros in -1_000_000i64..1_000_000i64) {
            let ts = Timestamp::new(micros);
            prop_assert!(ts.next_allowed_in_stream() > ts);
            prop_assert!(ts.previous_allowed_in_stream() < ts);
        }
    }
}
