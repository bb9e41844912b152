#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # slotguard
//!
//! In-process traffic control: every guarded call passes through a slot chain that prepares
//! statistics, checks rules and records the outcome into lock-free sliding windows.
//!
//! ## Features
//!
//! - **Slot chain** with ordered prepare, rule-check and stat slots, swappable at runtime
//! - **Sliding-window statistics** per resource, with derived views sharing one bucket array
//! - **Flow control** by request count per statistic interval
//! - **Concurrency isolation** per resource
//! - **Circuit breaking** on slow-request ratio, error ratio or error count
//! - **Tower layer** guarding any `Service`
//!
//! ## Quick Start
//!
//! ```rust
//! use slotguard::{entry, flow, TrafficType};
//!
//! slotguard::init_default();
//! flow::load_rules(vec![flow::Rule::new("checkout", 100.0)]).unwrap();
//!
//! match entry("checkout").with_traffic_type(TrafficType::Inbound).build() {
//!     Ok(guard) => {
//!         // guarded work
//!         guard.exit();
//!     }
//!     Err(blocked) => println!("rejected: {blocked}"),
//! }
//! ```

pub mod api;
pub mod circuit_breaker;
pub mod circuit_breaker_registry;
pub mod clock;
pub mod config;
pub mod context;
pub mod entry;
pub mod error;
pub mod flow;
pub mod isolation;
pub mod layer;
pub mod prelude;
pub mod resource;
pub mod slot_chain;
pub mod stat;
pub mod token;

// Re-exports
pub use api::{
    build_default_slot_chain, entry, global_slot_chain, init, init_default, set_global_slot_chain,
    EntryBuilder,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigBuilder, DynamicConfig};
pub use context::{ContextPool, EntryContext, EntryInput};
pub use entry::SentinelEntry;
pub use error::{
    BlockError, BlockType, BoxError, ConfigError, GuardError, RuleError, SentinelRule,
    SlotChainError, StatError,
};
pub use layer::{GuardLayer, GuardService};
pub use resource::{ResourceType, ResourceWrapper, TrafficType};
pub use slot_chain::{BaseSlot, RuleCheckSlot, SlotChain, StatPrepareSlot, StatSlot};
pub use stat::{MetricEvent, ResourceNode, StatNode};
pub use token::TokenResult;
