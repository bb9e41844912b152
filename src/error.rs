//! Error types for the traffic-control runtime.
//!
//! Blocking is a normal control-flow outcome and is surfaced as [`BlockError`]. Everything else
//! here is either a programmer error caught at construction time or a recoverable ordering
//! violation on a statistics write path.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Boxed error used for business errors traced onto an entry and for exit handler failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why an entry was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Unknown,
    Flow,
    Isolation,
    CircuitBreaking,
    System,
    HotSpotParamFlow,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockType::Unknown => "Unknown",
            BlockType::Flow => "FlowControl",
            BlockType::Isolation => "Isolation",
            BlockType::CircuitBreaking => "CircuitBreaking",
            BlockType::System => "System",
            BlockType::HotSpotParamFlow => "HotSpotParamFlow",
        };
        f.write_str(name)
    }
}

/// A rule that can be reported as the trigger of a block.
pub trait SentinelRule: fmt::Debug + Send + Sync {
    /// Resource the rule protects.
    fn resource_name(&self) -> &str;
}

/// Value surfaced to the caller when an entry is rejected.
///
/// Detached from the pipeline: holding a `BlockError` keeps no context or pool slot alive.
#[derive(Debug, Clone)]
pub struct BlockError {
    block_type: BlockType,
    block_msg: String,
    rule: Option<Arc<dyn SentinelRule>>,
    snapshot_value: Option<Arc<dyn Any + Send + Sync>>,
}

impl BlockError {
    pub fn new(block_type: BlockType) -> Self {
        Self { block_type, block_msg: String::new(), rule: None, snapshot_value: None }
    }

    pub fn with_message(block_type: BlockType, msg: impl Into<String>) -> Self {
        Self { block_msg: msg.into(), ..Self::new(block_type) }
    }

    /// Full constructor used by rule checkers: message, triggering rule and the metric value
    /// that tripped it.
    pub fn with_cause(
        block_type: BlockType,
        msg: impl Into<String>,
        rule: Arc<dyn SentinelRule>,
        snapshot_value: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            block_type,
            block_msg: msg.into(),
            rule: Some(rule),
            snapshot_value: Some(snapshot_value),
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn block_msg(&self) -> &str {
        &self.block_msg
    }

    pub fn triggered_rule(&self) -> Option<&Arc<dyn SentinelRule>> {
        self.rule.as_ref()
    }

    pub fn triggered_value(&self) -> Option<&(dyn Any + Send + Sync)> {
        self.snapshot_value.as_deref()
    }

    /// Downcast the snapshot value, e.g. `err.triggered_value_as::<f64>()` for a flow block.
    pub fn triggered_value_as<T: 'static>(&self) -> Option<&T> {
        self.triggered_value().and_then(|v| v.downcast_ref::<T>())
    }
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.block_msg.is_empty() {
            write!(f, "SentinelBlockError: {}", self.block_type)
        } else {
            write!(f, "SentinelBlockError: {}, message: {}", self.block_type, self.block_msg)
        }
    }
}

impl std::error::Error for BlockError {}

/// Outcome of running guarded work through [`crate::api::EntryBuilder::execute`] or the tower
/// layer.
#[derive(Debug)]
pub enum GuardError<E> {
    /// The entry was rejected; the operation never ran.
    Blocked(BlockError),
    /// The operation ran and failed.
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for GuardError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked(e) => write!(f, "{}", e),
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Blocked(e) => Some(e),
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E> From<BlockError> for GuardError<E> {
    fn from(e: BlockError) -> Self {
        Self::Blocked(e)
    }
}

impl<E> GuardError<E> {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }

    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    pub fn block_error(&self) -> Option<&BlockError> {
        match self {
            Self::Blocked(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }
}

/// Errors from the statistics engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatError {
    /// Sample count or interval is zero, or the interval is not divisible by the sample count.
    #[error("illegal statistic params: sample_count={sample_count}, interval_ms={interval_ms}")]
    IllegalParams { sample_count: u32, interval_ms: u32 },
    /// The underlying bucket array has an invalid shape.
    #[error(
        "illegal parent statistic params: sample_count={sample_count}, interval_ms={interval_ms}"
    )]
    IllegalParentParams { sample_count: u32, interval_ms: u32 },
    /// A view cannot be derived from the parent array's bucket layout.
    #[error(
        "statistic ({sample_count}, {interval_ms}ms) cannot reuse parent ({parent_sample_count}, {parent_interval_ms}ms)"
    )]
    NonReusable {
        sample_count: u32,
        interval_ms: u32,
        parent_sample_count: u32,
        parent_interval_ms: u32,
    },
    /// A write targeted a window older than the bucket currently occupying its slot.
    #[error("provided time {window_start} is already behind bucket start {bucket_start}")]
    TimeBehindBucket { window_start: u64, bucket_start: u64 },
    /// A raw metric event index outside the known range.
    #[error("unknown metric event index {0}")]
    UnknownEvent(u8),
}

/// Errors raised while registering slots into a chain.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SlotChainError {
    #[error("{kind} slot '{name}' is already registered")]
    DuplicateSlot { kind: &'static str, name: String },
}

/// Rule validation failures.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuleError {
    #[error("rule resource name is empty")]
    EmptyResource,
    #[error("invalid threshold {threshold} for resource '{resource}'")]
    InvalidThreshold { resource: String, threshold: f64 },
    #[error("invalid rule for resource '{resource}': {reason}")]
    Invalid { resource: String, reason: String },
    #[error(transparent)]
    Stat(#[from] StatError),
}

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("global statistic window invalid: {0}")]
    GlobalStatistic(StatError),
    #[error("metric statistic window invalid: {0}")]
    MetricStatistic(StatError),
    #[error("max_resource_amount must be > 0")]
    ZeroResourceAmount,
}
