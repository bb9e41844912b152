//! Circuit breaking with lock-free atomics.
//!
//! Each [`Rule`] gets a [`CircuitBreaker`] whose state lives in an `AtomicU8` and only moves
//! by compare-and-swap:
//!
//! - **Closed** passes everything and opens once the windowed slow/error ratio exceeds the
//!   threshold, or the error count reaches it (given at least `min_request_amount` requests).
//! - **Open** blocks until `retry_timeout_ms` has elapsed, then lets exactly one trial through
//!   by winning Open → HalfOpen.
//! - **HalfOpen** blocks everything else; the trial's outcome closes or reopens the breaker.

use crate::clock::{system_clock, Clock};
use crate::context::EntryContext;
use crate::error::{BlockError, BlockType, RuleError, SentinelRule};
use crate::slot_chain::{BaseSlot, RuleCheckSlot, StatSlot};
use crate::stat::LeapArray;
use crate::token::TokenResult;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, RwLock};

pub use crate::circuit_breaker_registry::{global_rule_manager, load_rules, RuleManager};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the retry timeout elapses.
    Open,
    /// One trial is in flight; everything else is rejected.
    HalfOpen,
}

impl State {
    fn to_u8(self) -> u8 {
        match self {
            State::Closed => STATE_CLOSED,
            State::Open => STATE_OPEN,
            State::HalfOpen => STATE_HALF_OPEN,
        }
    }

    fn from_u8(v: u8) -> State {
        match v {
            STATE_OPEN => State::Open,
            STATE_HALF_OPEN => State::HalfOpen,
            _ => State::Closed,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Closed => f.write_str("Closed"),
            State::Open => f.write_str("Open"),
            State::HalfOpen => f.write_str("HalfOpen"),
        }
    }
}

/// What a breaker measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Share of requests slower than `max_allowed_rt_ms`; threshold in `[0, 1]`.
    SlowRequestRatio,
    /// Share of requests that traced an error; threshold in `[0, 1]`.
    ErrorRatio,
    /// Number of requests that traced an error.
    ErrorCount,
}

/// Circuit-breaking rule for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: String,
    pub resource: String,
    pub strategy: Strategy,
    /// How long the breaker stays open before a trial is allowed.
    pub retry_timeout_ms: u32,
    /// Requests needed in the window before the breaker may open.
    pub min_request_amount: u64,
    pub stat_interval_ms: u32,
    /// Buckets in the statistic window; 0 means one bucket.
    pub stat_sliding_window_bucket_count: u32,
    /// Slow-request cut-off for [`Strategy::SlowRequestRatio`].
    pub max_allowed_rt_ms: u64,
    pub threshold: f64,
}

impl Rule {
    pub fn new(resource: impl Into<String>, strategy: Strategy, threshold: f64) -> Self {
        Self {
            id: String::new(),
            resource: resource.into(),
            strategy,
            retry_timeout_ms: 3_000,
            min_request_amount: 5,
            stat_interval_ms: 1_000,
            stat_sliding_window_bucket_count: 1,
            max_allowed_rt_ms: 0,
            threshold,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_retry_timeout_ms(mut self, ms: u32) -> Self {
        self.retry_timeout_ms = ms;
        self
    }

    pub fn with_min_request_amount(mut self, amount: u64) -> Self {
        self.min_request_amount = amount;
        self
    }

    pub fn with_stat_interval_ms(mut self, ms: u32) -> Self {
        self.stat_interval_ms = ms;
        self
    }

    pub fn with_bucket_count(mut self, count: u32) -> Self {
        self.stat_sliding_window_bucket_count = count;
        self
    }

    pub fn with_max_allowed_rt_ms(mut self, ms: u64) -> Self {
        self.max_allowed_rt_ms = ms;
        self
    }

    fn bucket_count(&self) -> u32 {
        self.stat_sliding_window_bucket_count.max(1)
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.resource.is_empty() {
            return Err(RuleError::EmptyResource);
        }
        let invalid = |reason: &str| RuleError::Invalid { resource: self.resource.clone(), reason: reason.into() };
        if self.stat_interval_ms == 0 {
            return Err(invalid("stat_interval_ms must be > 0"));
        }
        if self.stat_interval_ms % self.bucket_count() != 0 {
            return Err(invalid("stat_interval_ms must be divisible by the bucket count"));
        }
        let ratio = matches!(self.strategy, Strategy::SlowRequestRatio | Strategy::ErrorRatio);
        if !self.threshold.is_finite() || self.threshold < 0.0 || (ratio && self.threshold > 1.0) {
            return Err(RuleError::InvalidThreshold {
                resource: self.resource.clone(),
                threshold: self.threshold,
            });
        }
        Ok(())
    }
}

impl SentinelRule for Rule {
    fn resource_name(&self) -> &str {
        &self.resource
    }
}

/// Notified on every state transition, after it happened.
pub trait StateChangeListener: Send + Sync {
    fn on_transform_to_closed(&self, prev: State, rule: &Rule);
    /// `snapshot` is the ratio or count that tripped the breaker.
    fn on_transform_to_open(&self, prev: State, rule: &Rule, snapshot: f64);
    fn on_transform_to_half_open(&self, prev: State, rule: &Rule);
}

pub(crate) type SharedListeners = Arc<RwLock<Vec<Arc<dyn StateChangeListener>>>>;

/// Per-bucket counters: requests seen and requests that hit the strategy's target condition.
#[derive(Debug, Default)]
pub struct BreakerCounter {
    total: AtomicU64,
    target: AtomicU64,
}

impl BreakerCounter {
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn target(&self) -> u64 {
        self.target.load(Ordering::Acquire)
    }
}

/// Breaker bound to one rule.
pub struct CircuitBreaker {
    rule: Arc<Rule>,
    state: AtomicU8,
    next_retry_timestamp_ms: AtomicU64,
    stat: LeapArray<BreakerCounter>,
    clock: Arc<dyn Clock>,
    listeners: SharedListeners,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("rule", &self.rule)
            .field("state", &self.current_state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Standalone breaker on the system clock with no listeners.
    pub fn new(rule: Rule) -> Result<Self, RuleError> {
        Self::with_parts(rule, system_clock(), SharedListeners::default())
    }

    pub(crate) fn with_parts(
        rule: Rule,
        clock: Arc<dyn Clock>,
        listeners: SharedListeners,
    ) -> Result<Self, RuleError> {
        rule.validate()?;
        let stat = LeapArray::new(rule.bucket_count(), rule.stat_interval_ms)?;
        Ok(Self {
            rule: Arc::new(rule),
            state: AtomicU8::new(STATE_CLOSED),
            next_retry_timestamp_ms: AtomicU64::new(0),
            stat,
            clock,
            listeners,
        })
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    pub fn current_state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the calling entry may proceed. Winning Open → HalfOpen makes the caller the
    /// trial; if a later slot blocks the trial, the breaker goes back to Open at exit.
    pub fn try_pass(self: &Arc<Self>, ctx: &mut EntryContext) -> bool {
        match self.current_state() {
            State::Closed => true,
            State::Open => self.retry_timeout_arrived() && self.from_open_to_half_open(ctx),
            State::HalfOpen => false,
        }
    }

    fn retry_timeout_arrived(&self) -> bool {
        self.clock.now_millis() >= self.next_retry_timestamp_ms.load(Ordering::Acquire)
    }

    fn update_next_retry_timestamp(&self) {
        let next = self.clock.now_millis() + u64::from(self.rule.retry_timeout_ms);
        self.next_retry_timestamp_ms.store(next, Ordering::Release);
    }

    fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from.to_u8(), to.to_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn listeners(&self) -> Vec<Arc<dyn StateChangeListener>> {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn from_closed_to_open(&self, snapshot: f64) -> bool {
        if !self.transition(State::Closed, State::Open) {
            return false;
        }
        self.update_next_retry_timestamp();
        tracing::warn!(resource = %self.rule.resource, snapshot, "circuit breaker → open");
        for l in self.listeners() {
            l.on_transform_to_open(State::Closed, &self.rule, snapshot);
        }
        true
    }

    fn from_open_to_half_open(self: &Arc<Self>, ctx: &mut EntryContext) -> bool {
        if !self.transition(State::Open, State::HalfOpen) {
            return false;
        }
        tracing::info!(resource = %self.rule.resource, "circuit breaker → half-open");
        for l in self.listeners() {
            l.on_transform_to_half_open(State::Open, &self.rule);
        }
        let breaker = Arc::clone(self);
        ctx.when_exit(move |ctx| {
            if ctx.is_blocked() {
                breaker.from_half_open_to_open(1.0);
            }
            Ok(())
        });
        true
    }

    fn from_half_open_to_open(&self, snapshot: f64) -> bool {
        if !self.transition(State::HalfOpen, State::Open) {
            return false;
        }
        self.update_next_retry_timestamp();
        tracing::warn!(resource = %self.rule.resource, snapshot, "circuit breaker: trial failed → open");
        for l in self.listeners() {
            l.on_transform_to_open(State::HalfOpen, &self.rule, snapshot);
        }
        true
    }

    fn from_half_open_to_closed(&self) -> bool {
        if !self.transition(State::HalfOpen, State::Closed) {
            return false;
        }
        tracing::info!(resource = %self.rule.resource, "circuit breaker → closed");
        for l in self.listeners() {
            l.on_transform_to_closed(State::HalfOpen, &self.rule);
        }
        true
    }

    /// Record a finished request and move the state machine.
    pub fn on_request_complete(&self, rt_ms: u64, failed: bool) {
        let hit = match self.rule.strategy {
            Strategy::SlowRequestRatio => rt_ms > self.rule.max_allowed_rt_ms,
            Strategy::ErrorRatio | Strategy::ErrorCount => failed,
        };
        let now = self.clock.now_millis();
        match self.stat.current_bucket(now) {
            Ok(bucket) => {
                if hit {
                    bucket.value().target.fetch_add(1, Ordering::AcqRel);
                }
                bucket.value().total.fetch_add(1, Ordering::AcqRel);
            }
            Err(err) => {
                tracing::warn!(resource = %self.rule.resource, error = %err, "dropping breaker statistic sample");
                return;
            }
        }

        match self.current_state() {
            State::Open => {}
            State::HalfOpen => {
                if hit {
                    self.from_half_open_to_open(1.0);
                } else if self.from_half_open_to_closed() {
                    self.stat.reset();
                }
            }
            State::Closed => {
                let (target, total) = self
                    .stat
                    .values(now)
                    .iter()
                    .fold((0, 0), |(t, n), b| (t + b.value().target(), n + b.value().total()));
                if total < self.rule.min_request_amount {
                    return;
                }
                let (snapshot, tripped) = match self.rule.strategy {
                    Strategy::ErrorCount => {
                        let count = target as f64;
                        (count, count >= self.rule.threshold)
                    }
                    Strategy::SlowRequestRatio | Strategy::ErrorRatio => {
                        let ratio = target as f64 / total as f64;
                        (ratio, ratio > self.rule.threshold)
                    }
                };
                if tripped {
                    self.from_closed_to_open(snapshot);
                }
            }
        }
    }

    /// Force Closed and drop all counters.
    pub fn reset(&self) {
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.next_retry_timestamp_ms.store(0, Ordering::Release);
        self.stat.reset();
    }
}

/// Rule check consulting every breaker of the entry's resource.
#[derive(Debug, Clone)]
pub struct Slot {
    manager: Arc<RuleManager>,
}

impl Slot {
    pub const NAME: &'static str = "circuit-breaker";
    pub const ORDER: u32 = 5000;

    pub fn new(manager: Arc<RuleManager>) -> Self {
        Self { manager }
    }
}

impl Default for Slot {
    fn default() -> Self {
        Self::new(global_rule_manager())
    }
}

impl BaseSlot for Slot {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn order(&self) -> u32 {
        Self::ORDER
    }
}

impl RuleCheckSlot for Slot {
    fn check(&self, ctx: &mut EntryContext) -> TokenResult {
        let Some(resource) = ctx.resource() else {
            return TokenResult::Pass;
        };
        let breakers = self.manager.breakers_of(resource.name());
        for breaker in breakers {
            if !breaker.try_pass(ctx) {
                let state = breaker.current_state();
                return TokenResult::Blocked(BlockError::with_cause(
                    BlockType::CircuitBreaking,
                    "circuit breaker check blocked",
                    breaker.rule().clone(),
                    Arc::new(state),
                ));
            }
        }
        TokenResult::Pass
    }
}

/// Feeds breakers with the outcome of every admitted entry.
#[derive(Debug, Clone)]
pub struct MetricStatSlot {
    manager: Arc<RuleManager>,
}

impl MetricStatSlot {
    pub const NAME: &'static str = "circuit-breaker-metric-stat";
    pub const ORDER: u32 = 5000;

    pub fn new(manager: Arc<RuleManager>) -> Self {
        Self { manager }
    }
}

impl Default for MetricStatSlot {
    fn default() -> Self {
        Self::new(global_rule_manager())
    }
}

impl BaseSlot for MetricStatSlot {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn order(&self) -> u32 {
        Self::ORDER
    }
}

impl StatSlot for MetricStatSlot {
    fn on_entry_passed(&self, _ctx: &EntryContext) {}

    fn on_entry_blocked(&self, _ctx: &EntryContext, _block_error: &BlockError) {}

    fn on_completed(&self, ctx: &EntryContext) {
        let Some(resource) = ctx.resource() else {
            return;
        };
        let failed = ctx.error().is_some();
        for breaker in self.manager.breakers_of(resource.name()) {
            breaker.on_request_complete(ctx.rt(), failed);
        }
    }
}
