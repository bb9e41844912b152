//! Per-resource statistics.

use super::{check_validity_for_reuse_statistic, BucketArray, MetricEvent, SlidingWindowMetric, WindowShape};
use crate::clock::{system_clock, Clock};
use crate::config::{self, Config};
use crate::error::StatError;
use crate::resource::ResourceType;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

/// Read/write contract that control strategies use against a resource's live statistics.
///
/// Reads without an explicit window go through the node's default metric view (the configured
/// metric window). Writes go to the node's full bucket array at the node clock's current time.
pub trait StatNode: Send + Sync + fmt::Debug {
    /// Events per second over the default metric window.
    fn qps(&self, event: MetricEvent) -> f64;
    /// Total count of `event` over the default metric window.
    fn sum(&self, event: MetricEvent) -> i64;
    fn avg_rt(&self) -> f64;
    fn min_rt(&self) -> f64;
    /// Largest single-bucket count of `event`, scaled to a per-second rate.
    fn max_avg(&self, event: MetricEvent) -> f64;
    /// Entries admitted but not yet exited.
    fn current_concurrency(&self) -> u32;

    fn add_count(&self, event: MetricEvent, count: i64);
    /// Record one batch completion: `rt` into the RT sum and `count` completions.
    fn add_rt_and_complete(&self, rt: i64, count: i64);
    fn increase_concurrency(&self);
    /// Saturates at zero; an unmatched decrement is logged and ignored.
    fn decrease_concurrency(&self);
    /// Drop every accumulated count. Live concurrency is left as is.
    fn reset(&self);

    /// Cached view over the node's counters for the given window, created on first use.
    fn generate_read_stat(
        &self,
        sample_count: u32,
        interval_ms: u32,
    ) -> Result<Arc<SlidingWindowMetric>, StatError>;
    /// View used by the time-less read methods.
    fn default_metric(&self) -> &SlidingWindowMetric;
    /// Clock the node writes with; strategies reading it should agree on time.
    fn clock(&self) -> &Arc<dyn Clock>;
}

/// Statistics for one named resource.
pub struct ResourceNode {
    name: String,
    resource_type: ResourceType,
    concurrency: AtomicU32,
    array: Arc<BucketArray>,
    default_metric: SlidingWindowMetric,
    views: RwLock<HashMap<WindowShape, Arc<SlidingWindowMetric>>>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ResourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceNode")
            .field("name", &self.name)
            .field("resource_type", &self.resource_type)
            .field("concurrency", &self.current_concurrency())
            .field("sample_count", &self.array.sample_count())
            .field("interval_ms", &self.array.interval_ms())
            .finish()
    }
}

impl ResourceNode {
    /// Node shaped by the process-wide config, on the system clock.
    pub fn new(name: impl Into<String>, resource_type: ResourceType) -> Self {
        Self::with_config(name, resource_type, &config::global(), system_clock())
    }

    pub fn with_config(
        name: impl Into<String>,
        resource_type: ResourceType,
        config: &Config,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let array = Arc::new(BucketArray::with_shape(config.global_window()));
        let default_metric = SlidingWindowMetric::reusing(config.metric_window(), array.clone())
            .with_clock(clock.clone());
        Self {
            name: name.into(),
            resource_type,
            concurrency: AtomicU32::new(0),
            array,
            default_metric,
            views: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn resource_name(&self) -> &str {
        &self.name
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    /// Backing counters at the global window shape.
    pub fn bucket_array(&self) -> &Arc<BucketArray> {
        &self.array
    }

    fn warn_dropped(&self, event: MetricEvent, err: &StatError) {
        tracing::warn!(resource = %self.name, ?event, error = %err, "dropping statistic sample");
    }
}

impl StatNode for ResourceNode {
    fn qps(&self, event: MetricEvent) -> f64 {
        self.default_metric.qps(event)
    }

    fn sum(&self, event: MetricEvent) -> i64 {
        self.default_metric.sum(event)
    }

    fn avg_rt(&self) -> f64 {
        self.default_metric.avg_rt()
    }

    fn min_rt(&self) -> f64 {
        self.default_metric.min_rt()
    }

    fn max_avg(&self, event: MetricEvent) -> f64 {
        let metric = &self.default_metric;
        metric.max_of_single_bucket(event) as f64 * f64::from(metric.sample_count()) * 1000.0
            / f64::from(metric.interval_ms())
    }

    fn current_concurrency(&self) -> u32 {
        self.concurrency.load(Ordering::Acquire)
    }

    fn add_count(&self, event: MetricEvent, count: i64) {
        if let Err(err) = self.array.add_count(event, count, self.clock.now_millis()) {
            self.warn_dropped(event, &err);
        }
    }

    fn add_rt_and_complete(&self, rt: i64, count: i64) {
        match self.array.current_bucket(self.clock.now_millis()) {
            Ok(wrap) => {
                wrap.value().add_rt(rt);
                wrap.value().add(MetricEvent::Complete, count);
            }
            Err(err) => self.warn_dropped(MetricEvent::Complete, &err),
        }
    }

    fn increase_concurrency(&self) {
        self.concurrency.fetch_add(1, Ordering::AcqRel);
    }

    fn decrease_concurrency(&self) {
        let result = self
            .concurrency
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if result.is_err() {
            tracing::warn!(resource = %self.name, "concurrency decrement without matching increment");
        }
    }

    fn reset(&self) {
        self.array.reset();
    }

    fn generate_read_stat(
        &self,
        sample_count: u32,
        interval_ms: u32,
    ) -> Result<Arc<SlidingWindowMetric>, StatError> {
        let shape = WindowShape::new(sample_count, interval_ms)?;
        {
            let views = self.views.read().unwrap_or_else(|e| e.into_inner());
            if let Some(view) = views.get(&shape) {
                return Ok(view.clone());
            }
        }
        check_validity_for_reuse_statistic(
            sample_count,
            interval_ms,
            self.array.sample_count(),
            self.array.interval_ms(),
        )?;
        let mut views = self.views.write().unwrap_or_else(|e| e.into_inner());
        if let Some(view) = views.get(&shape) {
            return Ok(view.clone());
        }
        let view = Arc::new(
            SlidingWindowMetric::new(sample_count, interval_ms, self.array.clone())?
                .with_clock(self.clock.clone()),
        );
        views.insert(shape, view.clone());
        Ok(view)
    }

    fn default_metric(&self) -> &SlidingWindowMetric {
        &self.default_metric
    }

    fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Barrier;
    use std::thread;

    const T0: u64 = 1_700_000_000_000;

    fn node(clock: &ManualClock) -> ResourceNode {
        ResourceNode::with_config("abc", ResourceType::Common, &Config::default(), Arc::new(clock.clone()))
    }

    #[test]
    fn reads_through_default_metric_window() {
        let clock = ManualClock::new(T0);
        let node = node(&clock);
        node.add_count(MetricEvent::Pass, 3);
        clock.advance(500);
        node.add_count(MetricEvent::Pass, 1);
        assert_eq!(node.sum(MetricEvent::Pass), 4);
        assert_eq!(node.qps(MetricEvent::Pass), 4.0);
        // one 500ms bucket holding 3 is 6/s
        assert_eq!(node.max_avg(MetricEvent::Pass), 6.0);

        clock.advance(1_000);
        assert_eq!(node.sum(MetricEvent::Pass), 0);
        assert_eq!(node.bucket_array().count(MetricEvent::Pass, clock.now_millis()), 4);
    }

    #[test]
    fn rt_and_complete_recorded_together() {
        let clock = ManualClock::new(T0);
        let node = node(&clock);
        node.add_rt_and_complete(40, 1);
        node.add_rt_and_complete(20, 1);
        assert_eq!(node.sum(MetricEvent::Complete), 2);
        assert_eq!(node.avg_rt(), 30.0);
        assert_eq!(node.min_rt(), 20.0);
    }

    #[test]
    fn concurrency_never_goes_negative() {
        let clock = ManualClock::new(T0);
        let node = node(&clock);
        node.increase_concurrency();
        node.decrease_concurrency();
        node.decrease_concurrency();
        assert_eq!(node.current_concurrency(), 0);
    }

    #[test]
    fn generate_read_stat_caches_by_shape() {
        let clock = ManualClock::new(T0);
        let node = node(&clock);
        let a = node.generate_read_stat(4, 2_000).unwrap();
        let b = node.generate_read_stat(4, 2_000).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(node.generate_read_stat(4, 2_001), Err(StatError::IllegalParams { .. })));
        assert!(matches!(node.generate_read_stat(4, 1_000), Err(StatError::NonReusable { .. })));

        node.add_count(MetricEvent::Block, 2);
        assert_eq!(a.sum(MetricEvent::Block), 2);
    }

    #[test]
    fn concurrent_first_use_yields_one_view() {
        let clock = ManualClock::new(T0);
        let node = Arc::new(node(&clock));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let node = node.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    node.generate_read_stat(10, 5_000).unwrap()
                })
            })
            .collect();
        let views: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(views.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn reset_clears_counts() {
        let clock = ManualClock::new(T0);
        let node = node(&clock);
        node.add_count(MetricEvent::Error, 5);
        node.reset();
        assert_eq!(node.sum(MetricEvent::Error), 0);
    }
}
