//! Ordered prepare → rule-check → statistic pipeline.
//!
//! A [`SlotChain`] holds three ordered slot lists. Each admission runs every
//! [`StatPrepareSlot`], then the [`RuleCheckSlot`]s until one blocks, then every [`StatSlot`]
//! with the pass or block outcome. Exiting an admitted entry runs every
//! [`StatSlot::on_completed`]. Slots are registered by name and sorted by [`BaseSlot::order`];
//! registration swaps in a new snapshot so traffic never waits on it.

use crate::clock::{system_clock, Clock};
use crate::config;
use crate::context::{ContextPool, EntryContext};
use crate::error::{BlockError, SlotChainError};
use crate::token::TokenResult;
use arc_swap::ArcSwap;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// Identity and position shared by every slot kind.
pub trait BaseSlot: Send + Sync {
    /// Unique within its kind on one chain.
    fn name(&self) -> &str;
    /// Ascending execution order; equal orders keep registration order.
    fn order(&self) -> u32;
}

/// Prepares the context before any rule is checked, e.g. attaching the statistic node.
pub trait StatPrepareSlot: BaseSlot {
    fn prepare(&self, ctx: &mut EntryContext);
}

/// Decides whether an entry may proceed.
pub trait RuleCheckSlot: BaseSlot {
    fn check(&self, ctx: &mut EntryContext) -> TokenResult;
}

/// Records the outcome of admission and completion.
pub trait StatSlot: BaseSlot {
    fn on_entry_passed(&self, ctx: &EntryContext);
    fn on_entry_blocked(&self, ctx: &EntryContext, block_error: &BlockError);
    /// Runs at exit, only for entries that were not blocked.
    fn on_completed(&self, ctx: &EntryContext);
}

#[derive(Clone, Default)]
struct SlotSet {
    prepare: Vec<Arc<dyn StatPrepareSlot>>,
    check: Vec<Arc<dyn RuleCheckSlot>>,
    stat: Vec<Arc<dyn StatSlot>>,
}

fn insert_sorted<S>(slots: &mut Vec<Arc<S>>, slot: Arc<S>, kind: &'static str) -> Result<(), SlotChainError>
where
    S: BaseSlot + ?Sized,
{
    if slots.iter().any(|s| s.name() == slot.name()) {
        return Err(SlotChainError::DuplicateSlot { kind, name: slot.name().to_string() });
    }
    let pos = slots.partition_point(|s| s.order() <= slot.order());
    slots.insert(pos, slot);
    Ok(())
}

fn names<S: BaseSlot + ?Sized>(slots: &[Arc<S>]) -> Vec<String> {
    slots.iter().map(|s| s.name().to_string()).collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Slot pipeline plus its entry-context pool.
pub struct SlotChain {
    slots: ArcSwap<SlotSet>,
    writer: Mutex<()>,
    pool: ContextPool,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for SlotChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.load();
        f.debug_struct("SlotChain")
            .field("prepare", &names(&slots.prepare))
            .field("check", &names(&slots.check))
            .field("stat", &names(&slots.stat))
            .field("pool", &self.pool)
            .finish()
    }
}

impl Default for SlotChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotChain {
    /// Empty chain with a pool sized by the global config.
    pub fn new() -> Self {
        Self::with_pool_capacity(config::global().context_pool_capacity())
    }

    pub fn with_pool_capacity(capacity: usize) -> Self {
        Self {
            slots: ArcSwap::from_pointee(SlotSet::default()),
            writer: Mutex::new(()),
            pool: ContextPool::new(capacity),
            clock: system_clock(),
        }
    }

    /// Clock used to stamp start times and compute response times.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn update<F>(&self, f: F) -> Result<(), SlotChainError>
    where
        F: FnOnce(&mut SlotSet) -> Result<(), SlotChainError>,
    {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let mut next = SlotSet::clone(&self.slots.load());
        f(&mut next)?;
        self.slots.store(Arc::new(next));
        Ok(())
    }

    pub fn add_stat_prepare_slot(&self, slot: Arc<dyn StatPrepareSlot>) -> Result<(), SlotChainError> {
        self.update(|set| insert_sorted(&mut set.prepare, slot, "prepare"))
    }

    pub fn add_rule_check_slot(&self, slot: Arc<dyn RuleCheckSlot>) -> Result<(), SlotChainError> {
        self.update(|set| insert_sorted(&mut set.check, slot, "rule check"))
    }

    pub fn add_stat_slot(&self, slot: Arc<dyn StatSlot>) -> Result<(), SlotChainError> {
        self.update(|set| insert_sorted(&mut set.stat, slot, "stat"))
    }

    pub fn stat_prepare_slot_names(&self) -> Vec<String> {
        names(&self.slots.load().prepare)
    }

    pub fn rule_check_slot_names(&self) -> Vec<String> {
        names(&self.slots.load().check)
    }

    pub fn stat_slot_names(&self) -> Vec<String> {
        names(&self.slots.load().stat)
    }

    /// Take a clean context from the pool (or allocate one) and stamp its start time.
    pub fn get_pooled_context(&self) -> EntryContext {
        let mut ctx = self.pool.get();
        ctx.set_start_time(self.clock.now_millis());
        ctx
    }

    /// Reset `ctx` and return it to the pool.
    pub fn refurbish_context(&self, ctx: EntryContext) {
        self.pool.put(ctx);
    }

    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    /// Run admission for `ctx`.
    ///
    /// Returns the final result, also stored on the context. A panic in any slot is logged
    /// and yields `None`: the outcome is indeterminate and callers let the entry pass.
    pub fn entry(&self, ctx: &mut EntryContext) -> Option<TokenResult> {
        let slots = self.slots.load_full();
        match panic::catch_unwind(AssertUnwindSafe(|| run_entry(&slots, ctx))) {
            Ok(()) => Some(ctx.rule_check_result().clone()),
            Err(payload) => {
                tracing::error!(
                    resource = ?ctx.resource().map(|r| r.name()),
                    panic = %panic_message(payload.as_ref()),
                    "slot chain entry panicked"
                );
                None
            }
        }
    }

    /// Complete an admitted entry: compute its response time and run every stat slot's
    /// completion hook. Blocked entries are left untouched.
    pub fn exit(&self, ctx: &mut EntryContext) {
        if ctx.is_blocked() {
            return;
        }
        ctx.set_rt(self.clock.now_millis().saturating_sub(ctx.start_time()));
        let slots = self.slots.load_full();
        let ctx = &*ctx;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            for slot in &slots.stat {
                slot.on_completed(ctx);
            }
        }));
        if let Err(payload) = outcome {
            tracing::error!(
                resource = ?ctx.resource().map(|r| r.name()),
                panic = %panic_message(payload.as_ref()),
                "slot chain exit panicked"
            );
        }
    }
}

fn run_entry(slots: &SlotSet, ctx: &mut EntryContext) {
    for slot in &slots.prepare {
        slot.prepare(ctx);
    }
    for slot in &slots.check {
        match slot.check(ctx) {
            TokenResult::Pass => {}
            wait @ TokenResult::Wait(_) => {
                tracing::debug!(slot = slot.name(), "rule check asked to wait");
                ctx.set_rule_check_result(wait);
            }
            blocked @ TokenResult::Blocked(_) => {
                tracing::debug!(slot = slot.name(), "rule check blocked entry");
                ctx.set_rule_check_result(blocked);
                break;
            }
        }
    }
    let ctx = &*ctx;
    match ctx.rule_check_result() {
        TokenResult::Blocked(err) => {
            for slot in &slots.stat {
                slot.on_entry_blocked(ctx, err);
            }
        }
        _ => {
            for slot in &slots.stat {
                slot.on_entry_passed(ctx);
            }
        }
    }
}
