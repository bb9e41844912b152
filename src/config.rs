//! Runtime configuration.
//!
//! [`Config`] is always valid: it can only be produced by [`ConfigBuilder::build`] (or by
//! deserialising through the builder with the `serde` feature). The process-wide value lives
//! in a [`DynamicConfig`], read lock-free on the hot path.

use crate::error::ConfigError;
use crate::stat::{check_validity_for_reuse_statistic, WindowShape};
use arc_swap::ArcSwap;
use std::sync::{Arc, OnceLock};

pub const DEFAULT_SAMPLE_COUNT_TOTAL: u32 = 20;
pub const DEFAULT_INTERVAL_MS_TOTAL: u32 = 10_000;
pub const DEFAULT_METRIC_SAMPLE_COUNT: u32 = 2;
pub const DEFAULT_METRIC_INTERVAL_MS: u32 = 1_000;
pub const DEFAULT_MAX_RESOURCE_AMOUNT: usize = 10_000;
pub const DEFAULT_CONTEXT_POOL_CAPACITY: usize = 1_024;

/// Validated runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize, serde::Serialize),
    serde(try_from = "ConfigBuilder", into = "ConfigBuilder")
)]
pub struct Config {
    global_window: WindowShape,
    metric_window: WindowShape,
    max_resource_amount: usize,
    context_pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            global_window: WindowShape::new_unchecked(
                DEFAULT_SAMPLE_COUNT_TOTAL,
                DEFAULT_INTERVAL_MS_TOTAL,
            ),
            metric_window: WindowShape::new_unchecked(
                DEFAULT_METRIC_SAMPLE_COUNT,
                DEFAULT_METRIC_INTERVAL_MS,
            ),
            max_resource_amount: DEFAULT_MAX_RESOURCE_AMOUNT,
            context_pool_capacity: DEFAULT_CONTEXT_POOL_CAPACITY,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Shape of every resource node's backing bucket array.
    pub fn global_window(&self) -> WindowShape {
        self.global_window
    }

    /// Shape of the default read view each resource node exposes.
    pub fn metric_window(&self) -> WindowShape {
        self.metric_window
    }

    /// Resource cardinality above which the registry warns.
    pub fn max_resource_amount(&self) -> usize {
        self.max_resource_amount
    }

    /// Idle entry contexts kept per slot chain.
    pub fn context_pool_capacity(&self) -> usize {
        self.context_pool_capacity
    }
}

/// Raw, unvalidated settings. Also the serde representation of [`Config`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize), serde(default))]
pub struct ConfigBuilder {
    pub global_statistic_sample_count_total: u32,
    pub global_statistic_interval_ms_total: u32,
    pub metric_statistic_sample_count: u32,
    pub metric_statistic_interval_ms: u32,
    pub max_resource_amount: usize,
    pub context_pool_capacity: usize,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            global_statistic_sample_count_total: DEFAULT_SAMPLE_COUNT_TOTAL,
            global_statistic_interval_ms_total: DEFAULT_INTERVAL_MS_TOTAL,
            metric_statistic_sample_count: DEFAULT_METRIC_SAMPLE_COUNT,
            metric_statistic_interval_ms: DEFAULT_METRIC_INTERVAL_MS,
            max_resource_amount: DEFAULT_MAX_RESOURCE_AMOUNT,
            context_pool_capacity: DEFAULT_CONTEXT_POOL_CAPACITY,
        }
    }
}

impl ConfigBuilder {
    pub fn global_statistic(mut self, sample_count: u32, interval_ms: u32) -> Self {
        self.global_statistic_sample_count_total = sample_count;
        self.global_statistic_interval_ms_total = interval_ms;
        self
    }

    pub fn metric_statistic(mut self, sample_count: u32, interval_ms: u32) -> Self {
        self.metric_statistic_sample_count = sample_count;
        self.metric_statistic_interval_ms = interval_ms;
        self
    }

    pub fn max_resource_amount(mut self, amount: usize) -> Self {
        self.max_resource_amount = amount;
        self
    }

    pub fn context_pool_capacity(mut self, capacity: usize) -> Self {
        self.context_pool_capacity = capacity;
        self
    }

    /// Validate and produce a [`Config`].
    ///
    /// The metric window must be servable from the global window, the same rule every
    /// strategy-level view obeys.
    pub fn build(self) -> Result<Config, ConfigError> {
        let global_window = WindowShape::new(
            self.global_statistic_sample_count_total,
            self.global_statistic_interval_ms_total,
        )
        .map_err(ConfigError::GlobalStatistic)?;
        check_validity_for_reuse_statistic(
            self.metric_statistic_sample_count,
            self.metric_statistic_interval_ms,
            global_window.sample_count(),
            global_window.interval_ms(),
        )
        .map_err(ConfigError::MetricStatistic)?;
        let metric_window =
            WindowShape::new(self.metric_statistic_sample_count, self.metric_statistic_interval_ms)
                .map_err(ConfigError::MetricStatistic)?;
        if self.max_resource_amount == 0 {
            return Err(ConfigError::ZeroResourceAmount);
        }
        Ok(Config {
            global_window,
            metric_window,
            max_resource_amount: self.max_resource_amount,
            context_pool_capacity: self.context_pool_capacity,
        })
    }
}

impl TryFrom<ConfigBuilder> for Config {
    type Error = ConfigError;

    fn try_from(builder: ConfigBuilder) -> Result<Self, ConfigError> {
        builder.build()
    }
}

impl From<Config> for ConfigBuilder {
    fn from(config: Config) -> Self {
        Self {
            global_statistic_sample_count_total: config.global_window.sample_count(),
            global_statistic_interval_ms_total: config.global_window.interval_ms(),
            metric_statistic_sample_count: config.metric_window.sample_count(),
            metric_statistic_interval_ms: config.metric_window.interval_ms(),
            max_resource_amount: config.max_resource_amount,
            context_pool_capacity: config.context_pool_capacity,
        }
    }
}

/// `DynamicConfig<T>` gives cheap reads and controlled updates for shared config.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
    }

    /// Snapshot the current value (cheap clone of Arc).
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the value entirely.
    pub fn set(&self, value: T) {
        self.inner.store(Arc::new(value));
    }

    /// Update via closure.
    pub fn update<F>(&self, f: F)
    where
        F: Fn(&T) -> T,
    {
        self.inner.rcu(|cur| f(cur));
    }
}

fn global_holder() -> &'static DynamicConfig<Config> {
    static GLOBAL: OnceLock<DynamicConfig<Config>> = OnceLock::new();
    GLOBAL.get_or_init(|| DynamicConfig::new(Config::default()))
}

/// Current process-wide configuration.
pub fn global() -> Arc<Config> {
    global_holder().get()
}

/// Replace the process-wide configuration. Existing resource nodes keep the window they were
/// created with; new nodes pick up the new shape.
pub fn set_global(config: Config) {
    global_holder().set(config);
}
