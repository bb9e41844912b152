//! Registry of circuit-breaking rules and their breakers, plus state-change listeners.
//!
//! Breakers are looked up per resource on every entry from a lock-free snapshot; loading rules
//! swaps in a new snapshot.

use crate::circuit_breaker::{CircuitBreaker, Rule, SharedListeners, State, StateChangeListener};
use crate::clock::{system_clock, Clock};
use crate::error::RuleError;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::warn;

type BreakerMap = HashMap<String, Vec<Arc<CircuitBreaker>>>;

/// Holds the active circuit-breaking rules.
pub struct RuleManager {
    breakers: ArcSwap<BreakerMap>,
    loaded: Mutex<Vec<Rule>>,
    listeners: SharedListeners,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for RuleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleManager")
            .field("breakers", &self.breakers)
            .field("listeners", &self.listeners.read().map(|l| l.len()).unwrap_or(0))
            .finish()
    }
}

impl Default for RuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleManager {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Manager whose breakers measure time with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: ArcSwap::default(),
            loaded: Mutex::new(Vec::new()),
            listeners: SharedListeners::default(),
            clock,
        }
    }

    /// Replace every rule. Returns `Ok(false)` when `rules` equals what is already loaded.
    ///
    /// A rule identical to a loaded one keeps its breaker and state. When two rules share a
    /// non-empty id the later one wins. An invalid rule rejects the whole batch.
    pub fn load_rules(&self, rules: Vec<Rule>) -> Result<bool, RuleError> {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if *loaded == rules {
            tracing::debug!("circuit breaker rules unchanged");
            return Ok(false);
        }
        for rule in &rules {
            rule.validate()?;
        }

        let mut effective: Vec<&Rule> = Vec::with_capacity(rules.len());
        for rule in &rules {
            if !rule.id.is_empty() {
                if let Some(pos) = effective.iter().position(|r| r.id == rule.id) {
                    warn!(id = %rule.id, "circuit breaker rule id replaced; last registration wins");
                    effective.remove(pos);
                }
            }
            effective.push(rule);
        }

        let current = self.breakers.load();
        let mut next = BreakerMap::new();
        for rule in effective {
            let taken = next.get(&rule.resource);
            let reused = current.get(&rule.resource).and_then(|cbs| {
                cbs.iter()
                    .find(|cb| {
                        **cb.rule() == *rule
                            && !taken.map_or(false, |v| v.iter().any(|n| Arc::ptr_eq(n, cb)))
                    })
                    .cloned()
            });
            let breaker = match reused {
                Some(cb) => cb,
                None => Arc::new(CircuitBreaker::with_parts(
                    rule.clone(),
                    self.clock.clone(),
                    self.listeners.clone(),
                )?),
            };
            next.entry(rule.resource.clone()).or_default().push(breaker);
        }
        self.breakers.store(Arc::new(next));
        tracing::info!(count = rules.len(), "circuit breaker rules loaded");
        *loaded = rules;
        Ok(true)
    }

    pub fn rules(&self) -> Vec<Rule> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn rules_of(&self, resource: &str) -> Vec<Rule> {
        self.breakers_of(resource).iter().map(|cb| cb.rule().as_ref().clone()).collect()
    }

    pub fn breakers_of(&self, resource: &str) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.load().get(resource).cloned().unwrap_or_default()
    }

    /// Breaker states sorted by resource, in rule order within a resource.
    pub fn snapshot(&self) -> Vec<(String, State)> {
        let breakers = self.breakers.load();
        let mut entries: Vec<(String, State)> = breakers
            .iter()
            .flat_map(|(res, cbs)| cbs.iter().map(move |cb| (res.clone(), cb.current_state())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn clear(&self) {
        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        loaded.clear();
        self.breakers.store(Arc::new(BreakerMap::new()));
    }

    /// Add listeners notified by every breaker of this manager, existing ones included.
    pub fn register_state_change_listeners(&self, listeners: Vec<Arc<dyn StateChangeListener>>) {
        self.listeners.write().unwrap_or_else(|e| e.into_inner()).extend(listeners);
    }

    pub fn clear_state_change_listeners(&self) {
        self.listeners.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// Process-wide circuit-breaking rules used by the default chain.
pub fn global_rule_manager() -> Arc<RuleManager> {
    static MANAGER: OnceLock<Arc<RuleManager>> = OnceLock::new();
    MANAGER.get_or_init(|| Arc::new(RuleManager::new())).clone()
}

/// Load rules into the process-wide manager.
pub fn load_rules(rules: Vec<Rule>) -> Result<bool, RuleError> {
    global_rule_manager().load_rules(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::Strategy;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Opens(AtomicUsize);

    impl StateChangeListener for Opens {
        fn on_transform_to_closed(&self, _prev: State, _rule: &Rule) {}
        fn on_transform_to_open(&self, _prev: State, _rule: &Rule, _snapshot: f64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
        fn on_transform_to_half_open(&self, _prev: State, _rule: &Rule) {}
    }

    fn count_rule(resource: &str) -> Rule {
        Rule::new(resource, Strategy::ErrorCount, 1.0).with_min_request_amount(1)
    }

    #[test]
    fn duplicate_ids_warn_and_last_wins() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let manager = RuleManager::new();
        manager
            .load_rules(vec![count_rule("a").with_id("cb-1"), count_rule("b").with_id("cb-1")])
            .unwrap();
        assert!(manager.breakers_of("a").is_empty());
        assert_eq!(manager.breakers_of("b").len(), 1);

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("circuit breaker rule id replaced"));
    }

    #[test]
    fn unchanged_rules_keep_breaker_state() {
        let manager = RuleManager::with_clock(Arc::new(ManualClock::new(1_000)));
        assert!(manager.load_rules(vec![count_rule("a")]).unwrap());
        manager.breakers_of("a")[0].on_request_complete(1, true);
        assert!(!manager.load_rules(vec![count_rule("a")]).unwrap());
        manager.load_rules(vec![count_rule("a"), count_rule("c")]).unwrap();
        assert_eq!(manager.snapshot(), [("a".to_string(), State::Open), ("c".to_string(), State::Closed)]);
    }

    #[test]
    fn invalid_batch_is_rejected() {
        let manager = RuleManager::new();
        manager.load_rules(vec![count_rule("a")]).unwrap();
        let err = manager.load_rules(vec![count_rule("")]).unwrap_err();
        assert_eq!(err, RuleError::EmptyResource);
        assert_eq!(manager.rules().len(), 1);
        manager.clear();
        assert!(manager.rules_of("a").is_empty());
    }

    #[test]
    fn listeners_registered_later_are_notified() {
        let manager = RuleManager::with_clock(Arc::new(ManualClock::new(1_000)));
        manager.load_rules(vec![count_rule("a")]).unwrap();
        let opens = Arc::new(Opens::default());
        manager.register_state_change_listeners(vec![opens.clone() as Arc<dyn StateChangeListener>]);
        manager.breakers_of("a")[0].on_request_complete(1, true);
        assert_eq!(opens.0.load(Ordering::SeqCst), 1);
        manager.clear_state_change_listeners();
    }
}
