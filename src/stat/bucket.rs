//! One time slice of counters.

use super::{MetricEvent, DEFAULT_STATISTIC_MAX_RT};
use std::sync::atomic::{AtomicI64, Ordering};

/// Counter set for a single bucket window. All operations are lock-free and safe for any
/// number of concurrent callers.
#[derive(Debug)]
pub struct MetricBucket {
    counters: [AtomicI64; MetricEvent::COUNT],
    min_rt: AtomicI64,
}

impl Default for MetricBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricBucket {
    pub fn new() -> Self {
        Self {
            counters: std::array::from_fn(|_| AtomicI64::new(0)),
            min_rt: AtomicI64::new(DEFAULT_STATISTIC_MAX_RT),
        }
    }

    /// Add `count` to the counter for `event`. Adding to [`MetricEvent::Rt`] also maintains the
    /// minimum RT.
    pub fn add(&self, event: MetricEvent, count: i64) {
        if event == MetricEvent::Rt {
            self.add_rt(count);
            return;
        }
        self.counters[event.index()].fetch_add(count, Ordering::Relaxed);
    }

    pub fn get(&self, event: MetricEvent) -> i64 {
        self.counters[event.index()].load(Ordering::Relaxed)
    }

    /// Accumulate `rt` and lower the bucket minimum if `rt` is smaller.
    pub fn add_rt(&self, rt: i64) {
        self.counters[MetricEvent::Rt.index()].fetch_add(rt, Ordering::Relaxed);
        self.min_rt.fetch_min(rt, Ordering::AcqRel);
    }

    pub fn min_rt(&self) -> i64 {
        self.min_rt.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
        self.min_rt.store(DEFAULT_STATISTIC_MAX_RT, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counts_accumulate_per_event() {
        let bucket = MetricBucket::new();
        for n in [1, 2, 3] {
            bucket.add(MetricEvent::Pass, n);
        }
        bucket.add(MetricEvent::Block, 4);
        assert_eq!(bucket.get(MetricEvent::Pass), 6);
        assert_eq!(bucket.get(MetricEvent::Block), 4);
        assert_eq!(bucket.get(MetricEvent::Complete), 0);
    }

    #[test]
    fn min_rt_only_decreases() {
        let bucket = MetricBucket::new();
        assert_eq!(bucket.min_rt(), DEFAULT_STATISTIC_MAX_RT);
        for rt in [50, 10, 80, 5] {
            bucket.add_rt(rt);
        }
        assert_eq!(bucket.min_rt(), 5);
        assert_eq!(bucket.get(MetricEvent::Rt), 145);
    }

    #[test]
    fn adding_rt_event_routes_through_min_rt() {
        let bucket = MetricBucket::new();
        bucket.add(MetricEvent::Rt, 30);
        assert_eq!(bucket.min_rt(), 30);
    }

    #[test]
    fn reset_clears_everything() {
        let bucket = MetricBucket::new();
        bucket.add(MetricEvent::Error, 3);
        bucket.add_rt(7);
        bucket.reset();
        for event in MetricEvent::ALL {
            assert_eq!(bucket.get(event), 0);
        }
        assert_eq!(bucket.min_rt(), DEFAULT_STATISTIC_MAX_RT);
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let bucket = Arc::new(MetricBucket::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let bucket = bucket.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        bucket.add(MetricEvent::Complete, 1);
                    }
                    bucket.add_rt(100 + i);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(bucket.get(MetricEvent::Complete), 8_000);
        assert_eq!(bucket.min_rt(), 100);
    }
}
