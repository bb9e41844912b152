//! Circular, time-indexed bucket storage.
//!
//! Every slot is an independently atomic cell holding an immutable `(start, bucket)` pair. A
//! slot whose window has expired is replaced wholesale with one compare-and-swap, so a reader
//! sees either the old start with the old counters or the new start with fresh ones, never a
//! mix. At most `sample_count` wraps are live per array.

use super::{calculate_start_time, MetricBucket, MetricEvent, WindowShape};
use crate::error::StatError;
use arc_swap::ArcSwapOption;
use std::sync::Arc;
use std::thread;

/// A bucket tagged with the start of the window it covers.
#[derive(Debug)]
pub struct BucketWrap<T> {
    start: u64,
    value: T,
}

impl<T: Default> BucketWrap<T> {
    fn fresh(start: u64) -> Self {
        Self { start, value: T::default() }
    }
}

impl<T> BucketWrap<T> {
    /// Window start in milliseconds.
    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn value(&self) -> &T {
        &self.value
    }
}

/// Generic leap array over any bucket type that can be created empty.
#[derive(Debug)]
pub struct LeapArray<T> {
    bucket_length_ms: u32,
    sample_count: u32,
    interval_ms: u32,
    slots: Box<[ArcSwapOption<BucketWrap<T>>]>,
}

fn same_wrap<T>(a: &Option<Arc<BucketWrap<T>>>, b: &Option<Arc<BucketWrap<T>>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

impl<T: Default> LeapArray<T> {
    /// Create an array of `sample_count` buckets spanning `interval_ms`.
    ///
    /// Errors if either value is zero or `interval_ms` is not divisible by `sample_count`.
    pub fn new(sample_count: u32, interval_ms: u32) -> Result<Self, StatError> {
        WindowShape::new(sample_count, interval_ms).map(Self::with_shape)
    }

    pub fn with_shape(shape: WindowShape) -> Self {
        let slots = (0..shape.sample_count()).map(|_| ArcSwapOption::empty()).collect();
        Self {
            bucket_length_ms: shape.bucket_length_ms(),
            sample_count: shape.sample_count(),
            interval_ms: shape.interval_ms(),
            slots,
        }
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

    fn time_index(&self, now: u64) -> usize {
        let idx = (now / u64::from(self.bucket_length_ms)) % u64::from(self.sample_count);
        // idx < sample_count, which is a u32
        idx as usize
    }

    /// Resolve the bucket responsible for `now`, installing or replacing it if needed.
    ///
    /// Fails with [`StatError::TimeBehindBucket`] if the slot already holds a newer window,
    /// which means `now` went backwards relative to another writer.
    pub fn current_bucket(&self, now: u64) -> Result<Arc<BucketWrap<T>>, StatError> {
        let slot = &self.slots[self.time_index(now)];
        let window_start = calculate_start_time(now, u64::from(self.bucket_length_ms));

        loop {
            let old = slot.load_full();
            match &old {
                None => {
                    let fresh = Arc::new(BucketWrap::fresh(window_start));
                    let prev = slot.compare_and_swap(&old, Some(fresh.clone()));
                    if same_wrap(&*prev, &old) {
                        return Ok(fresh);
                    }
                    thread::yield_now();
                }
                Some(cur) if cur.start == window_start => return Ok(cur.clone()),
                Some(cur) if cur.start < window_start => {
                    let fresh = Arc::new(BucketWrap::fresh(window_start));
                    let prev = slot.compare_and_swap(&old, Some(fresh.clone()));
                    if same_wrap(&*prev, &old) {
                        return Ok(fresh);
                    }
                    // another writer replaced it; re-read and use theirs
                    thread::yield_now();
                }
                Some(cur) => {
                    if self.sample_count == 1 {
                        return Ok(cur.clone());
                    }
                    return Err(StatError::TimeBehindBucket {
                        window_start,
                        bucket_start: cur.start,
                    });
                }
            }
        }
    }

    /// Whether the wrap starting at `start` lies outside the trailing interval of `now`.
    fn is_deprecated(&self, now: u64, start: u64) -> bool {
        now < start || now - start > u64::from(self.interval_ms)
    }

    /// All buckets still inside the trailing interval of `now`.
    pub fn values(&self, now: u64) -> Vec<Arc<BucketWrap<T>>> {
        self.values_conditional(now, |_| true)
    }

    /// All buckets still inside the trailing interval of `now` whose start satisfies
    /// `predicate`.
    pub fn values_conditional<P>(&self, now: u64, predicate: P) -> Vec<Arc<BucketWrap<T>>>
    where
        P: Fn(u64) -> bool,
    {
        self.slots
            .iter()
            .filter_map(|slot| slot.load_full())
            .filter(|wrap| !self.is_deprecated(now, wrap.start) && predicate(wrap.start))
            .collect()
    }

    /// Drop every bucket; the next write reinstalls fresh ones.
    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.store(None);
        }
    }
}

/// Leap array of [`MetricBucket`]s with event-level helpers.
#[derive(Debug)]
pub struct BucketArray {
    data: LeapArray<MetricBucket>,
}

impl BucketArray {
    pub fn new(sample_count: u32, interval_ms: u32) -> Result<Self, StatError> {
        Ok(Self { data: LeapArray::new(sample_count, interval_ms)? })
    }

    pub fn with_shape(shape: WindowShape) -> Self {
        Self { data: LeapArray::with_shape(shape) }
    }

    pub fn sample_count(&self) -> u32 {
        self.data.sample_count()
    }

    pub fn interval_ms(&self) -> u32 {
        self.data.interval_ms()
    }

    pub fn bucket_length_ms(&self) -> u32 {
        self.data.bucket_length_ms()
    }

    pub fn current_bucket(&self, now: u64) -> Result<Arc<BucketWrap<MetricBucket>>, StatError> {
        self.data.current_bucket(now)
    }

    /// Add `count` of `event` to the bucket for `now`.
    pub fn add_count(&self, event: MetricEvent, count: i64, now: u64) -> Result<(), StatError> {
        self.data.current_bucket(now)?.value().add(event, count);
        Ok(())
    }

    /// Accumulate `rt` into the bucket for `now`, lowering its minimum RT.
    pub fn add_rt(&self, rt: i64, now: u64) -> Result<(), StatError> {
        self.data.current_bucket(now)?.value().add_rt(rt);
        Ok(())
    }

    /// Sum of `event` across every bucket inside the trailing interval of `now`.
    pub fn count(&self, event: MetricEvent, now: u64) -> i64 {
        // Refresh the slot for `now` so a stale bucket sharing its index is not summed.
        if let Err(err) = self.data.current_bucket(now) {
            tracing::debug!(error = %err, "count read behind the current bucket");
        }
        self.data.values(now).iter().map(|wrap| wrap.value().get(event)).sum()
    }

    /// Smallest per-bucket minimum RT inside the trailing interval of `now`.
    pub fn min_rt(&self, now: u64) -> i64 {
        self.data
            .values(now)
            .iter()
            .map(|wrap| wrap.value().min_rt())
            .min()
            .unwrap_or(super::DEFAULT_STATISTIC_MAX_RT)
    }

    pub fn values(&self, now: u64) -> Vec<Arc<BucketWrap<MetricBucket>>> {
        self.data.values(now)
    }

    pub fn values_conditional<P>(&self, now: u64, predicate: P) -> Vec<Arc<BucketWrap<MetricBucket>>>
    where
        P: Fn(u64) -> bool,
    {
        self.data.values_conditional(now, predicate)
    }

    pub fn reset(&self) {
        self.data.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    // Aligned to both 500ms and 10s boundaries.
    const T0: u64 = 1_700_000_000_000;

    #[test]
    fn rejects_invalid_shapes() {
        assert!(BucketArray::new(0, 1000).is_err());
        assert!(BucketArray::new(3, 1000).is_err());
        assert_eq!(
            BucketArray::new(4, 0).unwrap_err(),
            StatError::IllegalParams { sample_count: 4, interval_ms: 0 }
        );
        let arr = BucketArray::new(20, 10_000).unwrap();
        assert_eq!(arr.bucket_length_ms(), 500);
    }

    #[test]
    fn same_window_returns_same_bucket() {
        let arr = BucketArray::new(20, 10_000).unwrap();
        let a = arr.current_bucket(T0 + 10).unwrap();
        let b = arr.current_bucket(T0 + 499).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.start(), T0);
        let c = arr.current_bucket(T0 + 500).unwrap();
        assert_eq!(c.start(), T0 + 500);
    }

    #[test]
    fn window_rotates_out_after_interval() {
        let arr = BucketArray::new(20, 10_000).unwrap();
        arr.add_count(MetricEvent::Pass, 1, T0).unwrap();
        assert_eq!(arr.count(MetricEvent::Pass, T0 + 9_999), 1);
        assert_eq!(arr.count(MetricEvent::Pass, T0 + 10_001), 0);
    }

    #[test]
    fn stale_slot_is_replaced_not_accumulated() {
        let arr = BucketArray::new(2, 1_000).unwrap();
        arr.add_count(MetricEvent::Pass, 5, T0).unwrap();
        // same slot index one full cycle later
        arr.add_count(MetricEvent::Pass, 2, T0 + 1_000).unwrap();
        let wrap = arr.current_bucket(T0 + 1_000).unwrap();
        assert_eq!(wrap.value().get(MetricEvent::Pass), 2);
        assert_eq!(arr.count(MetricEvent::Pass, T0 + 1_000), 2);
    }

    #[test]
    fn writing_behind_a_newer_bucket_is_an_error() {
        let arr = BucketArray::new(2, 1_000).unwrap();
        arr.add_count(MetricEvent::Pass, 1, T0 + 1_000).unwrap();
        let err = arr.add_count(MetricEvent::Pass, 1, T0).unwrap_err();
        assert_eq!(err, StatError::TimeBehindBucket { window_start: T0, bucket_start: T0 + 1_000 });
    }

    #[test]
    fn single_bucket_array_tolerates_going_backwards() {
        let arr = BucketArray::new(1, 1_000).unwrap();
        arr.add_count(MetricEvent::Pass, 1, T0 + 1_000).unwrap();
        arr.add_count(MetricEvent::Pass, 1, T0).unwrap();
        assert_eq!(arr.current_bucket(T0 + 1_000).unwrap().value().get(MetricEvent::Pass), 2);
    }

    #[test]
    fn values_conditional_filters_by_start() {
        let arr = BucketArray::new(4, 2_000).unwrap();
        for i in 0..4 {
            arr.add_count(MetricEvent::Pass, 1, T0 + i * 500).unwrap();
        }
        let now = T0 + 1_999;
        assert_eq!(arr.values(now).len(), 4);
        let recent = arr.values_conditional(now, |start| start >= T0 + 1_000);
        assert_eq!(recent.len(), 2);
    }

    #[test]
    fn min_rt_spans_live_buckets() {
        let arr = BucketArray::new(4, 2_000).unwrap();
        arr.add_rt(40, T0).unwrap();
        arr.add_count(MetricEvent::Rt, 15, T0 + 600).unwrap();
        assert_eq!(arr.min_rt(T0 + 700), 15);
        assert_eq!(arr.min_rt(T0 + 100_000), crate::stat::DEFAULT_STATISTIC_MAX_RT);
    }

    #[test]
    fn reset_drops_all_buckets() {
        let arr = BucketArray::new(4, 2_000).unwrap();
        arr.add_count(MetricEvent::Pass, 3, T0).unwrap();
        arr.reset();
        assert!(arr.values(T0).is_empty());
        assert_eq!(arr.count(MetricEvent::Pass, T0), 0);
    }

    #[test]
    fn concurrent_adds_in_one_window_are_linearizable() {
        let arr = Arc::new(BucketArray::new(20, 10_000).unwrap());
        let threads = 8;
        let per_thread = 2_000;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let arr = arr.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..per_thread {
                        arr.add_count(MetricEvent::Pass, 1, T0 + 100).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(arr.count(MetricEvent::Pass, T0 + 200), (threads * per_thread) as i64);
    }

    #[test]
    fn concurrent_rollover_installs_exactly_one_bucket() {
        let arr = Arc::new(BucketArray::new(2, 1_000).unwrap());
        arr.add_count(MetricEvent::Pass, 100, T0).unwrap();
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let arr = arr.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..500 {
                        arr.add_count(MetricEvent::Pass, 1, T0 + 1_000).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let wrap = arr.current_bucket(T0 + 1_000).unwrap();
        assert_eq!(wrap.value().get(MetricEvent::Pass), 4_000);
    }
}
