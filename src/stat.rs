//! Sliding-window statistics.
//!
//! The engine is layered leaf-first:
//! - [`MetricBucket`]: one time slice of atomic counters.
//! - [`LeapArray`] / [`BucketArray`]: a fixed circular array of time-indexed buckets with
//!   lock-free bucket replacement when a slot's window has expired.
//! - [`SlidingWindowMetric`]: a read-only view aggregating a trailing sub-range of a
//!   `BucketArray` into sums, QPS and RT figures.
//! - [`ResourceNode`]: per-resource statistics plus live concurrency, shared through the
//!   [`ResourceNodeRegistry`].
//!
//! Writers to the same bucket race on atomic adds. A writer finding a stale bucket races the
//! others on a single compare-and-swap of the slot; losers yield and re-read. Readers never
//! block.

pub mod bucket;
pub mod leap_array;
pub mod node;
pub mod registry;
pub mod sliding_window;
pub mod slot;

pub use bucket::MetricBucket;
pub use leap_array::{BucketArray, BucketWrap, LeapArray};
pub use node::{ResourceNode, StatNode};
pub use registry::{global_registry, inbound_node, ResourceNodeRegistry};
pub use sliding_window::{check_validity_for_reuse_statistic, SlidingWindowMetric};
pub use slot::{ResourceNodePrepareSlot, StatisticSlot};

use crate::error::StatError;

/// Upper bound (and initial value) for a bucket's minimum RT, in milliseconds.
pub const DEFAULT_STATISTIC_MAX_RT: i64 = 60_000;

/// Kinds of events counted per bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricEvent {
    /// Entry admitted.
    Pass,
    /// Entry rejected by a rule.
    Block,
    /// Admitted entry finished.
    Complete,
    /// Admitted entry finished with a business error.
    Error,
    /// Accumulated response time of completed entries, in milliseconds.
    Rt,
}

impl MetricEvent {
    /// Number of event kinds; the size of a bucket's counter array.
    pub const COUNT: usize = 5;

    pub const ALL: [MetricEvent; MetricEvent::COUNT] =
        [MetricEvent::Pass, MetricEvent::Block, MetricEvent::Complete, MetricEvent::Error, MetricEvent::Rt];

    pub(crate) fn index(self) -> usize {
        match self {
            MetricEvent::Pass => 0,
            MetricEvent::Block => 1,
            MetricEvent::Complete => 2,
            MetricEvent::Error => 3,
            MetricEvent::Rt => 4,
        }
    }
}

impl TryFrom<u8> for MetricEvent {
    type Error = StatError;

    fn try_from(value: u8) -> Result<Self, StatError> {
        MetricEvent::ALL.get(usize::from(value)).copied().ok_or(StatError::UnknownEvent(value))
    }
}

/// A validated `(sample_count, interval_ms)` pair: both non-zero and the interval divisible by
/// the sample count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowShape {
    sample_count: u32,
    interval_ms: u32,
}

impl WindowShape {
    pub fn new(sample_count: u32, interval_ms: u32) -> Result<Self, StatError> {
        if sample_count == 0 || interval_ms == 0 || interval_ms % sample_count != 0 {
            return Err(StatError::IllegalParams { sample_count, interval_ms });
        }
        Ok(Self { sample_count, interval_ms })
    }

    /// For shapes known valid at compile time.
    pub(crate) const fn new_unchecked(sample_count: u32, interval_ms: u32) -> Self {
        Self { sample_count, interval_ms }
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    pub fn bucket_length_ms(&self) -> u32 {
        self.interval_ms / self.sample_count
    }
}

/// Start of the bucket containing `time_ms` for buckets `bucket_length_ms` long.
pub(crate) fn calculate_start_time(time_ms: u64, bucket_length_ms: u64) -> u64 {
    time_ms - time_ms % bucket_length_ms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_event_round_trips_through_index() {
        for event in MetricEvent::ALL {
            let raw = u8::try_from(event.index()).unwrap();
            assert_eq!(MetricEvent::try_from(raw).unwrap(), event);
        }
        assert_eq!(MetricEvent::try_from(5), Err(StatError::UnknownEvent(5)));
    }

    #[test]
    fn window_shape_validates() {
        assert!(WindowShape::new(0, 1000).is_err());
        assert!(WindowShape::new(3, 1000).is_err());
        let shape = WindowShape::new(20, 10_000).unwrap();
        assert_eq!(shape.bucket_length_ms(), 500);
    }

    #[test]
    fn start_time_truncates_to_bucket() {
        assert_eq!(calculate_start_time(1_234, 500), 1_000);
        assert_eq!(calculate_start_time(1_500, 500), 1_500);
    }
}
