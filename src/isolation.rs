//! Concurrency isolation: cap the number of in-flight entries per resource.

use crate::context::EntryContext;
use crate::error::{BlockType, RuleError, SentinelRule};
use crate::slot_chain::{BaseSlot, RuleCheckSlot};
use crate::token::TokenResult;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// Block entries once `threshold` entries of `resource` are in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub id: String,
    pub resource: String,
    pub threshold: u32,
}

impl Rule {
    pub fn new(resource: impl Into<String>, threshold: u32) -> Self {
        Self { id: String::new(), resource: resource.into(), threshold }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn validate(&self) -> Result<(), RuleError> {
        if self.resource.is_empty() {
            return Err(RuleError::EmptyResource);
        }
        if self.threshold == 0 {
            return Err(RuleError::InvalidThreshold {
                resource: self.resource.clone(),
                threshold: 0.0,
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

type RuleMap = HashMap<String, Vec<Arc<Rule>>>;

/// Holds the active isolation rules, indexed by resource.
#[derive(Debug, Default)]
pub struct RuleManager {
    by_resource: ArcSwap<RuleMap>,
    loaded: Mutex<Vec<Rule>>,
}

impl RuleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace every rule. Returns `Ok(false)` when `rules` equals what is already loaded.
    /// An invalid rule rejects the whole batch and leaves the current rules in place.
    pub fn load_rules(&self, rules: Vec<Rule>) -> Result<bool, RuleError> {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if *loaded == rules {
            tracing::debug!("isolation rules unchanged");
            return Ok(false);
        }
        for rule in &rules {
            rule.validate()?;
        }
        let mut map = RuleMap::new();
        for rule in &rules {
            map.entry(rule.resource.clone()).or_default().push(Arc::new(rule.clone()));
        }
        self.by_resource.store(Arc::new(map));
        tracing::info!(count = rules.len(), "isolation rules loaded");
        *loaded = rules;
        Ok(true)
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn rules_of(&self, resource: &str) -> Vec<Arc<Rule>> {
        self.by_resource.load().get(resource).cloned().unwrap_or_default()
    }

    pub fn clear(&self) {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        loaded.clear();
        self.by_resource.store(Arc::new(RuleMap::new()));
    }
}

/// Process-wide isolation rules used by the default chain.
pub fn global_rule_manager() -> Arc<RuleManager> {
    static MANAGER: OnceLock<Arc<RuleManager>> = OnceLock::new();
    MANAGER.get_or_init(|| Arc::new(RuleManager::new())).clone()
}

/// Load rules into the process-wide manager.
pub fn load_rules(rules: Vec<Rule>) -> Result<bool, RuleError> {
    global_rule_manager().load_rules(rules)
}

/// Rule check comparing live concurrency with each rule's threshold.
#[derive(Debug, Clone)]
pub struct Slot {
    manager: Arc<RuleManager>,
}

impl Slot {
    pub const NAME: &'static str = "isolation";
    pub const ORDER: u32 = 3000;

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
        let snapshot = self.manager.by_resource.load();
        let Some(rules) = snapshot.get(resource.name()) else {
            return TokenResult::Pass;
        };
        let Some(node) = ctx.stat_node() else {
            tracing::debug!(resource = %resource.name(), "no statistic node, skipping isolation");
            return TokenResult::Pass;
        };
        let current = node.current_concurrency();
        let batch = ctx.input().batch_count;
        for rule in rules {
            if u64::from(current) + u64::from(batch) > u64::from(rule.threshold) {
                return TokenResult::blocked_with_cause(
                    BlockType::Isolation,
                    "concurrency exceeds threshold",
                    rule.clone(),
                    Arc::new(current),
                );
            }
        }
        TokenResult::Pass
    }
}
