//! Read-only views over a [`BucketArray`].

use super::{
    calculate_start_time, BucketArray, MetricBucket, MetricEvent, WindowShape, DEFAULT_STATISTIC_MAX_RT,
};
use crate::clock::{system_clock, Clock};
use crate::error::StatError;
use std::sync::Arc;

/// Check that a `(sample_count, interval_ms)` view can be served from a parent array shaped
/// `(parent_sample_count, parent_interval_ms)`.
///
/// The view must be well formed itself, its interval must evenly divide the parent interval,
/// and its buckets must be whole multiples of the parent's buckets.
pub fn check_validity_for_reuse_statistic(
    sample_count: u32,
    interval_ms: u32,
    parent_sample_count: u32,
    parent_interval_ms: u32,
) -> Result<(), StatError> {
    if sample_count == 0 || interval_ms == 0 || interval_ms % sample_count != 0 {
        return Err(StatError::IllegalParams { sample_count, interval_ms });
    }
    if parent_sample_count == 0
        || parent_interval_ms == 0
        || parent_interval_ms % parent_sample_count != 0
    {
        return Err(StatError::IllegalParentParams {
            sample_count: parent_sample_count,
            interval_ms: parent_interval_ms,
        });
    }
    let bucket_length_ms = interval_ms / sample_count;
    let parent_bucket_length_ms = parent_interval_ms / parent_sample_count;
    if parent_interval_ms % interval_ms != 0 || bucket_length_ms % parent_bucket_length_ms != 0 {
        return Err(StatError::NonReusable {
            sample_count,
            interval_ms,
            parent_sample_count,
            parent_interval_ms,
        });
    }
    Ok(())
}

/// Aggregates the trailing `interval_ms` of an underlying [`BucketArray`].
///
/// Never writes to the array. The view's window may be shorter than the array's, which lets
/// several strategies with different windows share one set of counters.
#[derive(Debug, Clone)]
pub struct SlidingWindowMetric {
    bucket_length_ms: u32,
    sample_count: u32,
    interval_ms: u32,
    real: Arc<BucketArray>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowMetric {
    pub fn new(sample_count: u32, interval_ms: u32, real: Arc<BucketArray>) -> Result<Self, StatError> {
        check_validity_for_reuse_statistic(
            sample_count,
            interval_ms,
            real.sample_count(),
            real.interval_ms(),
        )?;
        Ok(Self {
            bucket_length_ms: interval_ms / sample_count,
            sample_count,
            interval_ms,
            real,
            clock: system_clock(),
        })
    }

    /// A view covering the whole parent array; always reusable.
    pub fn full(real: Arc<BucketArray>) -> Self {
        Self {
            bucket_length_ms: real.bucket_length_ms(),
            sample_count: real.sample_count(),
            interval_ms: real.interval_ms(),
            real,
            clock: system_clock(),
        }
    }

    /// Build a view for a shape already checked with [`check_validity_for_reuse_statistic`]
    /// against `real`, falling back to the full array if it does not fit after all.
    pub(crate) fn reusing(shape: WindowShape, real: Arc<BucketArray>) -> Self {
        match Self::new(shape.sample_count(), shape.interval_ms(), real.clone()) {
            Ok(view) => view,
            Err(err) => {
                tracing::warn!(error = %err, "statistic view not reusable, reading full window");
                Self::full(real)
            }
        }
    }

    /// Override the clock used by the time-less read methods.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    pub fn bucket_length_ms(&self) -> u32 {
        self.bucket_length_ms
    }

    /// Inclusive range of parent bucket starts that belong to the view at `now`.
    fn bucket_start_range(&self, now: u64) -> (u64, u64) {
        let parent_len = u64::from(self.real.bucket_length_ms());
        let end = calculate_start_time(now, parent_len);
        let start = (end + parent_len).saturating_sub(u64::from(self.interval_ms));
        (start, end)
    }

    fn interval_secs(&self) -> f64 {
        f64::from(self.interval_ms) / 1000.0
    }

    fn satisfied_buckets(&self, now: u64) -> Vec<Arc<super::BucketWrap<MetricBucket>>> {
        let (start, end) = self.bucket_start_range(now);
        self.real.values_conditional(now, |ws| ws >= start && ws <= end)
    }

    pub fn sum_with_time(&self, event: MetricEvent, now: u64) -> i64 {
        self.satisfied_buckets(now).iter().map(|w| w.value().get(event)).sum()
    }

    pub fn qps_with_time(&self, event: MetricEvent, now: u64) -> f64 {
        self.sum_with_time(event, now) as f64 / self.interval_secs()
    }

    /// Average RT of completed entries; 0 when nothing completed.
    pub fn avg_rt_with_time(&self, now: u64) -> f64 {
        let complete = self.sum_with_time(MetricEvent::Complete, now);
        if complete <= 0 {
            return 0.0;
        }
        self.sum_with_time(MetricEvent::Rt, now) as f64 / complete as f64
    }

    /// Minimum RT across the view, never below 1.
    pub fn min_rt_with_time(&self, now: u64) -> f64 {
        let min = self
            .satisfied_buckets(now)
            .iter()
            .map(|w| w.value().min_rt())
            .fold(DEFAULT_STATISTIC_MAX_RT, i64::min);
        min.max(1) as f64
    }

    pub fn max_of_single_bucket_with_time(&self, event: MetricEvent, now: u64) -> i64 {
        self.satisfied_buckets(now).iter().map(|w| w.value().get(event)).max().unwrap_or(0)
    }

    pub fn sum(&self, event: MetricEvent) -> i64 {
        self.sum_with_time(event, self.clock.now_millis())
    }

    pub fn qps(&self, event: MetricEvent) -> f64 {
        self.qps_with_time(event, self.clock.now_millis())
    }

    pub fn avg_rt(&self) -> f64 {
        self.avg_rt_with_time(self.clock.now_millis())
    }

    pub fn min_rt(&self) -> f64 {
        self.min_rt_with_time(self.clock.now_millis())
    }

    pub fn max_of_single_bucket(&self, event: MetricEvent) -> i64 {
        self.max_of_single_bucket_with_time(event, self.clock.now_millis())
    }
}
