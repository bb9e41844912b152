//! Entry points: building entries, the global slot chain and initialisation.
//!
//! ```no_run
//! use slotguard::{entry, ResourceType, TrafficType};
//!
//! slotguard::init_default();
//! match entry("GET:/users")
//!     .with_resource_type(ResourceType::Web)
//!     .with_traffic_type(TrafficType::Inbound)
//!     .build()
//! {
//!     Ok(guard) => {
//!         // guarded work
//!         guard.exit();
//!     }
//!     Err(blocked) => eprintln!("rejected: {blocked}"),
//! }
//! ```

use crate::circuit_breaker;
use crate::config::{self, Config};
use crate::context::InputValue;
use crate::entry::SentinelEntry;
use crate::error::{BlockError, GuardError};
use crate::flow;
use crate::isolation;
use crate::resource::{ResourceType, ResourceWrapper, TrafficType};
use crate::slot_chain::SlotChain;
use crate::stat::{ResourceNodePrepareSlot, StatisticSlot};
use crate::token::TokenResult;
use arc_swap::ArcSwap;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, OnceLock};

/// Chain wired with the built-in slots, all bound to the process-wide registries.
pub fn build_default_slot_chain() -> SlotChain {
    let chain = SlotChain::new();
    let registered = chain
        .add_stat_prepare_slot(Arc::new(ResourceNodePrepareSlot::default()))
        .and_then(|_| chain.add_rule_check_slot(Arc::new(flow::Slot::default())))
        .and_then(|_| chain.add_rule_check_slot(Arc::new(isolation::Slot::default())))
        .and_then(|_| chain.add_rule_check_slot(Arc::new(circuit_breaker::Slot::default())))
        .and_then(|_| chain.add_stat_slot(Arc::new(StatisticSlot::default())))
        .and_then(|_| chain.add_stat_slot(Arc::new(flow::StandaloneStatSlot::default())))
        .and_then(|_| chain.add_stat_slot(Arc::new(circuit_breaker::MetricStatSlot::default())));
    if let Err(err) = registered {
        tracing::error!(error = %err, "default slot chain incomplete");
    }
    chain
}

fn chain_holder() -> &'static ArcSwap<SlotChain> {
    static CHAIN: OnceLock<ArcSwap<SlotChain>> = OnceLock::new();
    CHAIN.get_or_init(|| ArcSwap::from_pointee(build_default_slot_chain()))
}

/// Chain used by entries that do not name one; built with the default slots on first use.
pub fn global_slot_chain() -> Arc<SlotChain> {
    chain_holder().load_full()
}

/// Swap the chain used by entries that do not name one. Entries already admitted exit through
/// the chain they entered.
pub fn set_global_slot_chain(chain: Arc<SlotChain>) {
    chain_holder().store(chain);
}

/// Install `config` process-wide and rebuild the global chain under it.
pub fn init(config: Config) {
    tracing::info!(
        global_window = ?config.global_window(),
        metric_window = ?config.metric_window(),
        "slotguard initialised"
    );
    config::set_global(config);
    set_global_slot_chain(Arc::new(build_default_slot_chain()));
}

pub fn init_default() {
    init(Config::default());
}

/// Start building an entry for `resource`.
pub fn entry(resource: impl Into<String>) -> EntryBuilder {
    EntryBuilder::new(resource)
}

/// Options for a single entry.
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    resource: String,
    resource_type: ResourceType,
    traffic_type: TrafficType,
    batch_count: u32,
    flag: i32,
    args: Vec<InputValue>,
    attachments: HashMap<String, InputValue>,
    slot_chain: Option<Arc<SlotChain>>,
}

impl EntryBuilder {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            resource_type: ResourceType::default(),
            traffic_type: TrafficType::default(),
            batch_count: 1,
            flag: 0,
            args: Vec::new(),
            attachments: HashMap::new(),
            slot_chain: None,
        }
    }

    pub fn with_resource_type(mut self, resource_type: ResourceType) -> Self {
        self.resource_type = resource_type;
        self
    }

    pub fn with_traffic_type(mut self, traffic_type: TrafficType) -> Self {
        self.traffic_type = traffic_type;
        self
    }

    /// Tokens this entry acquires. Defaults to 1.
    pub fn with_acquire_count(mut self, count: u32) -> Self {
        self.batch_count = count;
        self
    }

    pub fn with_flag(mut self, flag: i32) -> Self {
        self.flag = flag;
        self
    }

    /// Positional arguments visible to the slots through [`crate::context::EntryInput::arg`].
    pub fn with_args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Any + Send + Sync,
    {
        self.args = args.into_iter().map(|arg| Arc::new(arg) as InputValue).collect();
        self
    }

    /// Append one argument that is already shared.
    pub fn with_arg_value(mut self, arg: InputValue) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_attachment(mut self, key: impl Into<String>, value: impl Any + Send + Sync) -> Self {
        self.attachments.insert(key.into(), Arc::new(value));
        self
    }

    pub fn with_attachments(mut self, attachments: HashMap<String, InputValue>) -> Self {
        self.attachments.extend(attachments);
        self
    }

    /// Run through `chain` instead of the global one.
    pub fn with_slot_chain(mut self, chain: Arc<SlotChain>) -> Self {
        self.slot_chain = Some(chain);
        self
    }

    /// Run admission. On a block the context is released before the error is returned.
    pub fn build(self) -> Result<SentinelEntry, BlockError> {
        let chain = self.slot_chain.unwrap_or_else(global_slot_chain);
        let resource = ResourceWrapper::new(self.resource, self.resource_type, self.traffic_type);
        let mut ctx = chain.get_pooled_context();
        ctx.set_resource(resource.clone());
        {
            let input = ctx.input_mut();
            input.batch_count = self.batch_count;
            input.flag = self.flag;
            input.args = self.args;
            input.attachments = self.attachments;
        }
        let result = chain.entry(&mut ctx);
        let entry = SentinelEntry::new(resource, ctx, chain);
        match result {
            Some(TokenResult::Blocked(err)) => {
                entry.exit();
                Err(err)
            }
            _ => Ok(entry),
        }
    }

    /// Admit, run `op`, then exit. An `Err` from `op` is traced on the entry as a business
    /// error before exiting.
    pub async fn execute<T, E, Fut, Op>(self, op: Op) -> Result<T, GuardError<E>>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let guard = self.build()?;
        let result = op().await;
        if let Err(err) = &result {
            guard.trace_error(err.to_string());
        }
        guard.exit();
        result.map_err(GuardError::Inner)
    }
}
