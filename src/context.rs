//! Per-entry state carried through the slot chain, and the pool that recycles it.

use crate::error::BoxError;
use crate::resource::ResourceWrapper;
use crate::stat::StatNode;
use crate::token::TokenResult;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Callback run once when an entry exits, before the statistic slots complete it.
pub type ExitHandler = Box<dyn FnOnce(&EntryContext) -> Result<(), BoxError> + Send>;

/// Opaque caller value carried by an entry; slots downcast what they understand.
pub type InputValue = Arc<dyn Any + Send + Sync>;

/// Caller-supplied parameters of an entry.
#[derive(Clone)]
pub struct EntryInput {
    /// Tokens acquired by this entry; every counter it touches moves by this much.
    pub batch_count: u32,
    pub flag: i32,
    pub args: Vec<InputValue>,
    pub attachments: HashMap<String, InputValue>,
}

impl fmt::Debug for EntryInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryInput")
            .field("batch_count", &self.batch_count)
            .field("flag", &self.flag)
            .field("args", &self.args.len())
            .field("attachment_keys", &self.attachments.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for EntryInput {
    fn default() -> Self {
        Self { batch_count: 1, flag: 0, args: Vec::new(), attachments: HashMap::new() }
    }
}

impl EntryInput {
    /// The positional argument at `index`, if present and of type `T`.
    pub fn arg<T: Any>(&self, index: usize) -> Option<&T> {
        self.args.get(index).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn attachment<T: Any>(&self, key: &str) -> Option<&T> {
        self.attachments.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    fn reset(&mut self) {
        self.batch_count = 1;
        self.flag = 0;
        self.args.clear();
        self.attachments.clear();
    }
}

/// Mutable state of one entry from admission to exit.
///
/// Contexts are pooled by their [`crate::slot_chain::SlotChain`]; nothing from a previous
/// entry survives [`EntryContext::reset`].
#[derive(Default)]
pub struct EntryContext {
    start_time: u64,
    rt: u64,
    resource: Option<ResourceWrapper>,
    stat_node: Option<Arc<dyn StatNode>>,
    input: EntryInput,
    rule_check_result: TokenResult,
    data: HashMap<String, Box<dyn Any + Send + Sync>>,
    error: Option<BoxError>,
    exit_handlers: Vec<ExitHandler>,
}

impl fmt::Debug for EntryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryContext")
            .field("start_time", &self.start_time)
            .field("rt", &self.rt)
            .field("resource", &self.resource)
            .field("input", &self.input)
            .field("rule_check_result", &self.rule_check_result)
            .field("data_keys", &self.data.keys().collect::<Vec<_>>())
            .field("error", &self.error.as_ref().map(|e| e.to_string()))
            .field("exit_handlers", &self.exit_handlers.len())
            .finish()
    }
}

impl EntryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admission time in milliseconds, stamped when the context leaves the pool.
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    pub fn set_start_time(&mut self, millis: u64) {
        self.start_time = millis;
    }

    /// Response time in milliseconds; set by the chain on exit.
    pub fn rt(&self) -> u64 {
        self.rt
    }

    pub fn set_rt(&mut self, rt: u64) {
        self.rt = rt;
    }

    pub fn resource(&self) -> Option<&ResourceWrapper> {
        self.resource.as_ref()
    }

    pub fn set_resource(&mut self, resource: ResourceWrapper) {
        self.resource = Some(resource);
    }

    pub fn stat_node(&self) -> Option<&Arc<dyn StatNode>> {
        self.stat_node.as_ref()
    }

    pub fn set_stat_node(&mut self, node: Arc<dyn StatNode>) {
        self.stat_node = Some(node);
    }

    pub fn input(&self) -> &EntryInput {
        &self.input
    }

    pub fn input_mut(&mut self) -> &mut EntryInput {
        &mut self.input
    }

    pub fn rule_check_result(&self) -> &TokenResult {
        &self.rule_check_result
    }

    pub fn set_rule_check_result(&mut self, result: TokenResult) {
        self.rule_check_result = result;
    }

    pub fn is_blocked(&self) -> bool {
        self.rule_check_result.is_blocked()
    }

    /// Attach arbitrary slot-private data for the lifetime of the entry.
    pub fn set_data<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.data.insert(key.into(), Box::new(value));
    }

    pub fn data<T: Any>(&self, key: &str) -> Option<&T> {
        self.data.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn remove_data(&mut self, key: &str) -> Option<Box<dyn Any + Send + Sync>> {
        self.data.remove(key)
    }

    /// Business error traced on the entry, if any.
    pub fn error(&self) -> Option<&BoxError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, err: BoxError) {
        self.error = Some(err);
    }

    /// Register a callback to run when the entry exits.
    pub fn when_exit<F>(&mut self, handler: F)
    where
        F: FnOnce(&EntryContext) -> Result<(), BoxError> + Send + 'static,
    {
        self.exit_handlers.push(Box::new(handler));
    }

    pub(crate) fn take_exit_handlers(&mut self) -> Vec<ExitHandler> {
        std::mem::take(&mut self.exit_handlers)
    }

    /// Clear every field so the context can serve an unrelated entry. Buffers keep their
    /// capacity.
    pub fn reset(&mut self) {
        let Self {
            start_time,
            rt,
            resource,
            stat_node,
            input,
            rule_check_result,
            data,
            error,
            exit_handlers,
        } = self;
        *start_time = 0;
        *rt = 0;
        *resource = None;
        *stat_node = None;
        input.reset();
        *rule_check_result = TokenResult::Pass;
        data.clear();
        *error = None;
        exit_handlers.clear();
    }
}

/// Bounded free list of [`EntryContext`]s.
#[derive(Debug)]
pub struct ContextPool {
    idle: Mutex<Vec<EntryContext>>,
    capacity: usize,
}

impl ContextPool {
    pub fn new(capacity: usize) -> Self {
        Self { idle: Mutex::new(Vec::new()), capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of contexts waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn get(&self) -> EntryContext {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop().unwrap_or_default()
    }

    /// Reset `ctx` and keep it for reuse, or drop it if the pool is full.
    pub fn put(&self, mut ctx: EntryContext) {
        ctx.reset();
        let mut idle = self.idle.lock().unwrap_or_else(|e| e.into_inner());
        if idle.len() < self.capacity {
            idle.push(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BlockError, BlockType};
    use crate::resource::{ResourceType, TrafficType};

    fn dirty() -> EntryContext {
        let mut ctx = EntryContext::new();
        ctx.set_start_time(42);
        ctx.set_rt(7);
        ctx.set_resource(ResourceWrapper::new("r", ResourceType::Web, TrafficType::Inbound));
        ctx.input_mut().batch_count = 5;
        ctx.input_mut().flag = 3;
        ctx.input_mut().args.push(Arc::new("a"));
        ctx.input_mut().attachments.insert("k".into(), Arc::new(7_u16));
        ctx.set_rule_check_result(TokenResult::Blocked(BlockError::new(BlockType::Flow)));
        ctx.set_data("key", 1_u32);
        ctx.set_error("boom".into());
        ctx.when_exit(|_| Ok(()));
        ctx
    }

    #[test]
    fn reset_clears_every_field() {
        let mut ctx = dirty();
        ctx.reset();
        assert_eq!(ctx.start_time(), 0);
        assert_eq!(ctx.rt(), 0);
        assert!(ctx.resource().is_none());
        assert!(ctx.stat_node().is_none());
        let input = ctx.input();
        assert_eq!((input.batch_count, input.flag), (1, 0));
        assert!(input.args.is_empty());
        assert!(input.attachments.is_empty());
        assert!(ctx.rule_check_result().is_pass());
        assert!(ctx.data::<u32>("key").is_none());
        assert!(ctx.error().is_none());
        assert!(ctx.take_exit_handlers().is_empty());
    }

    #[test]
    fn typed_data_access() {
        let mut ctx = EntryContext::new();
        ctx.set_data("n", 9_u64);
        assert_eq!(ctx.data::<u64>("n"), Some(&9));
        assert!(ctx.data::<i32>("n").is_none());
        assert!(ctx.remove_data("n").is_some());
    }

    #[test]
    fn input_values_downcast_by_type() {
        let ctx = dirty();
        let input = ctx.input();
        assert_eq!(input.arg::<&str>(0), Some(&"a"));
        assert!(input.arg::<String>(0).is_none());
        assert!(input.arg::<&str>(1).is_none());
        assert_eq!(input.attachment::<u16>("k"), Some(&7));
        assert!(input.attachment::<u32>("k").is_none());
    }

    #[test]
    fn pool_recycles_clean_contexts() {
        let pool = ContextPool::new(1);
        pool.put(dirty());
        assert_eq!(pool.idle(), 1);
        let ctx = pool.get();
        assert!(ctx.resource().is_none());
        assert_eq!(ctx.input().batch_count, 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn pool_drops_excess() {
        let pool = ContextPool::new(2);
        for _ in 0..5 {
            pool.put(EntryContext::new());
        }
        assert_eq!(pool.idle(), 2);
    }
}
