//! Flow control: reject entries once a resource's pass count over a statistic interval reaches
//! a threshold.
//!
//! A rule whose interval matches the metric window reads the resource node's default view. An
//! interval the node's bucket array can serve gets a cached view over the node's counters. Any
//! other interval gets a standalone bucket array fed by [`StandaloneStatSlot`].

use crate::clock::Clock;
use crate::context::EntryContext;
use crate::error::{BlockError, BlockType, RuleError, SentinelRule};
use crate::slot_chain::{BaseSlot, RuleCheckSlot, StatSlot};
use crate::stat::{
    check_validity_for_reuse_statistic, global_registry, BucketArray, MetricEvent, ResourceNodeRegistry,
    SlidingWindowMetric, StatNode,
};
use crate::token::TokenResult;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Allow at most `threshold` passes of `resource` per `stat_interval_ms`. An interval of 0 uses
/// the configured metric window, where the threshold reads as QPS.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub id: String,
    pub resource: String,
    pub threshold: f64,
    pub stat_interval_ms: u32,
}

impl Rule {
    pub fn new(resource: impl Into<String>, threshold: f64) -> Self {
        Self { id: String::new(), resource: resource.into(), threshold, stat_interval_ms: 0 }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_stat_interval_ms(mut self, interval_ms: u32) -> Self {
        self.stat_interval_ms = interval_ms;
        self
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.resource.is_empty() {
            return Err(RuleError::EmptyResource);
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
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

#[derive(Debug)]
enum RuleStat {
    /// Reads counters the resource node already keeps.
    Reused(Arc<SlidingWindowMetric>),
    /// Own counters, written on every pass of the resource.
    Standalone { array: Arc<BucketArray>, view: SlidingWindowMetric, clock: Arc<dyn Clock> },
}

/// Checker bound to one rule and its statistic.
#[derive(Debug)]
pub struct TrafficController {
    rule: Arc<Rule>,
    stat: RuleStat,
}

impl TrafficController {
    fn build(rule: Rule, registry: &ResourceNodeRegistry) -> Result<Self, RuleError> {
        let config = registry.config();
        let metric_interval = config.metric_window().interval_ms();
        let interval = rule.stat_interval_ms;
        let node = registry.get_or_create(&rule.resource, Default::default());
        if interval == 0 || interval == metric_interval {
            let view = Arc::new(node.default_metric().clone());
            return Ok(Self { rule: Arc::new(rule), stat: RuleStat::Reused(view) });
        }

        let global = config.global_window();
        let bucket_len = global.bucket_length_ms();
        let sample_count = if interval > global.interval_ms() || interval < bucket_len || interval % bucket_len != 0 {
            1
        } else {
            interval / bucket_len
        };
        if check_validity_for_reuse_statistic(sample_count, interval, global.sample_count(), global.interval_ms())
            .is_ok()
        {
            let view = node.generate_read_stat(sample_count, interval)?;
            return Ok(Self { rule: Arc::new(rule), stat: RuleStat::Reused(view) });
        }

        let array = Arc::new(BucketArray::new(sample_count, interval)?);
        let clock = registry.clock().clone();
        let view = SlidingWindowMetric::new(sample_count, interval, array.clone())?.with_clock(clock.clone());
        Ok(Self { rule: Arc::new(rule), stat: RuleStat::Standalone { array, view, clock } })
    }

    pub fn rule(&self) -> &Arc<Rule> {
        &self.rule
    }

    /// Whether this controller keeps its own counters.
    pub fn is_standalone(&self) -> bool {
        matches!(self.stat, RuleStat::Standalone { .. })
    }

    /// Passes counted inside the rule's interval.
    pub fn current_count(&self) -> f64 {
        match &self.stat {
            RuleStat::Reused(view) => view.sum(MetricEvent::Pass) as f64,
            RuleStat::Standalone { view, .. } => view.sum(MetricEvent::Pass) as f64,
        }
    }

    pub fn check(&self, batch_count: u32) -> TokenResult {
        let current = self.current_count();
        if current + f64::from(batch_count) > self.rule.threshold {
            return TokenResult::Blocked(BlockError::with_cause(
                BlockType::Flow,
                "flow reject check blocked",
                self.rule.clone(),
                Arc::new(current),
            ));
        }
        TokenResult::Pass
    }

    fn record_pass(&self, batch_count: u32) {
        if let RuleStat::Standalone { array, clock, .. } = &self.stat {
            if let Err(err) = array.add_count(MetricEvent::Pass, i64::from(batch_count), clock.now_millis()) {
                tracing::warn!(resource = %self.rule.resource, error = %err, "dropping flow statistic sample");
            }
        }
    }
}

type ControllerMap = HashMap<String, Vec<Arc<TrafficController>>>;

/// Holds the active flow rules and their controllers, indexed by resource.
#[derive(Debug)]
pub struct RuleManager {
    controllers: ArcSwap<ControllerMap>,
    loaded: Mutex<Vec<Rule>>,
    registry: Arc<ResourceNodeRegistry>,
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleManager {
    /// Manager reading resource statistics from the global registry.
    pub fn new() -> Self {
        Self::with_registry(global_registry())
    }

    pub fn with_registry(registry: Arc<ResourceNodeRegistry>) -> Self {
        Self { controllers: ArcSwap::default(), loaded: Mutex::new(Vec::new()), registry }
    }

    /// Replace every rule. Returns `Ok(false)` when `rules` equals what is already loaded.
    ///
    /// A rule identical to a loaded one keeps its controller, and with it any standalone
    /// counters. An invalid rule rejects the whole batch.
    pub fn load_rules(&self, rules: Vec<Rule>) -> Result<bool, RuleError> {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if *loaded == rules {
            tracing::debug!("flow rules unchanged");
            return Ok(false);
        }
        for rule in &rules {
            rule.validate()?;
        }
        let current = self.controllers.load();
        let mut next = ControllerMap::new();
        for rule in &rules {
            let taken = next.get(&rule.resource);
            let reused = current.get(&rule.resource).and_then(|tcs| {
                tcs.iter()
                    .find(|tc| {
                        *tc.rule == *rule
                            && !taken.map_or(false, |v| v.iter().any(|n| Arc::ptr_eq(n, tc)))
                    })
                    .cloned()
            });
            let tc = match reused {
                Some(tc) => tc,
                None => Arc::new(TrafficController::build(rule.clone(), &self.registry)?),
            };
            next.entry(rule.resource.clone()).or_default().push(tc);
        }
        self.controllers.store(Arc::new(next));
        tracing::info!(count = rules.len(), "flow rules loaded");
        *loaded = rules;
        Ok(true)
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn rules_of(&self, resource: &str) -> Vec<Rule> {
        self.controllers_of(resource).iter().map(|tc| tc.rule.as_ref().clone()).collect()
    }

    pub fn controllers_of(&self, resource: &str) -> Vec<Arc<TrafficController>> {
        self.controllers.load().get(resource).cloned().unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        loaded.clear();
        self.controllers.store(Arc::new(ControllerMap::new()));
    }
}

/// Process-wide flow rules used by the default chain.
pub fn global_rule_manager() -> Arc<RuleManager> {
    static MANAGER: OnceLock<Arc<RuleManager>> = OnceLock::new();
    MANAGER.get_or_init(|| Arc::new(RuleManager::new())).clone()
}

/// Load rules into the process-wide manager.
pub fn load_rules(rules: Vec<Rule>) -> Result<bool, RuleError> {
    global_rule_manager().load_rules(rules)
}

/// Rule check running every controller of the entry's resource.
#[derive(Debug, Clone)]
pub struct Slot {
    manager: Arc<RuleManager>,
}

impl Slot {
    pub const NAME: &'static str = "flow";
    pub const ORDER: u32 = 2000;

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
        let snapshot = self.manager.controllers.load();
        let Some(controllers) = snapshot.get(resource.name()) else {
            return TokenResult::Pass;
        };
        let batch = ctx.input().batch_count;
        for tc in controllers {
            let result = tc.check(batch);
            if result.is_blocked() {
                return result;
            }
        }
        TokenResult::Pass
    }
}

/// Feeds standalone flow statistics with every admitted entry.
#[derive(Debug, Clone)]
pub struct StandaloneStatSlot {
    manager: Arc<RuleManager>,
}

impl StandaloneStatSlot {
    pub const NAME: &'static str = "flow-standalone-stat";
    pub const ORDER: u32 = 3000;

    pub fn new(manager: Arc<RuleManager>) -> Self {
        Self { manager }
    }
}

impl Default for StandaloneStatSlot {
    fn default() -> Self {
        Self::new(global_rule_manager())
    }
}

impl BaseSlot for StandaloneStatSlot {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn order(&self) -> u32 {
        Self::ORDER
    }
}

impl StatSlot for StandaloneStatSlot {
    fn on_entry_passed(&self, ctx: &EntryContext) {
        let Some(resource) = ctx.resource() else {
            return;
        };
        if let Some(controllers) = self.manager.controllers.load().get(resource.name()) {
            for tc in controllers {
                tc.record_pass(ctx.input().batch_count);
            }
        }
    }

    fn on_entry_blocked(&self, _ctx: &EntryContext, _block_error: &BlockError) {}

    fn on_completed(&self, _ctx: &EntryContext) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::resource::{ResourceType, ResourceWrapper, TrafficType};

    const T0: u64 = 1_700_000_000_000;

    fn setup() -> (Arc<RuleManager>, Arc<ResourceNodeRegistry>, ManualClock) {
        let clock = ManualClock::new(T0);
        let registry = Arc::new(ResourceNodeRegistry::with_config(Config::default(), Arc::new(clock.clone())));
        (Arc::new(RuleManager::with_registry(registry.clone())), registry, clock)
    }

    fn ctx(batch: u32) -> EntryContext {
        let mut ctx = EntryContext::new();
        ctx.set_resource(ResourceWrapper::new("orders", ResourceType::Common, TrafficType::Outbound));
        ctx.input_mut().batch_count = batch;
        ctx
    }

    #[test]
    fn validation() {
        assert_eq!(Rule::new("", 1.0).validate(), Err(RuleError::EmptyResource));
        assert!(Rule::new("a", -1.0).validate().is_err());
        assert!(Rule::new("a", f64::NAN).validate().is_err());
        assert!(Rule::new("a", 0.0).validate().is_ok());
    }

    #[test]
    fn statistic_selection_by_interval() {
        let (manager, _, _) = setup();
        manager
            .load_rules(vec![
                Rule::new("orders", 10.0),
                Rule::new("orders", 10.0).with_stat_interval_ms(5_000),
                Rule::new("orders", 10.0).with_stat_interval_ms(1_200),
                Rule::new("orders", 10.0).with_stat_interval_ms(60_000),
            ])
            .unwrap();
        let standalone: Vec<bool> = manager.controllers_of("orders").iter().map(|tc| tc.is_standalone()).collect();
        assert_eq!(standalone, [false, false, true, true]);
    }

    #[test]
    fn blocks_on_node_pass_count() {
        let (manager, registry, _) = setup();
        manager.load_rules(vec![Rule::new("orders", 3.0)]).unwrap();
        let slot = Slot::new(manager);
        let node = registry.get_or_create("orders", ResourceType::Common);
        node.add_count(MetricEvent::Pass, 2);

        assert!(slot.check(&mut ctx(1)).is_pass());
        let blocked = slot.check(&mut ctx(2));
        let err = blocked.block_error().unwrap();
        assert_eq!(err.block_type(), BlockType::Flow);
        assert_eq!(err.triggered_value_as::<f64>(), Some(&2.0));
    }

    #[test]
    fn standalone_counts_through_stat_slot() {
        let (manager, _, clock) = setup();
        manager.load_rules(vec![Rule::new("orders", 2.0).with_stat_interval_ms(60_000)]).unwrap();
        let slot = Slot::new(manager.clone());
        let stat = StandaloneStatSlot::new(manager);
        for _ in 0..2 {
            let mut c = ctx(1);
            assert!(slot.check(&mut c).is_pass());
            stat.on_entry_passed(&c);
        }
        assert!(slot.check(&mut ctx(1)).is_blocked());
        clock.advance(61_000);
        assert!(slot.check(&mut ctx(1)).is_pass());
    }

    #[test]
    fn identical_rules_keep_their_controller() {
        let (manager, _, _) = setup();
        let rule = Rule::new("orders", 1.0).with_stat_interval_ms(60_000);
        manager.load_rules(vec![rule.clone()]).unwrap();
        let before = manager.controllers_of("orders");
        manager.load_rules(vec![rule, Rule::new("orders", 5.0)]).unwrap();
        let after = manager.controllers_of("orders");
        assert!(Arc::ptr_eq(&before[0], &after[0]));
        assert_eq!(manager.rules_of("orders").len(), 2);
    }
}
