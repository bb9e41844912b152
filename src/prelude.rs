//! Convenient re-exports for guarding calls and writing custom slots.
pub use crate::{
    api::{entry, init, init_default, EntryBuilder},
    circuit_breaker::{self, StateChangeListener},
    context::EntryContext,
    entry::SentinelEntry,
    error::{BlockError, BlockType, GuardError},
    flow, isolation,
    layer::GuardLayer,
    resource::{ResourceType, TrafficType},
    slot_chain::{BaseSlot, RuleCheckSlot, SlotChain, StatPrepareSlot, StatSlot},
    stat::StatNode,
    token::TokenResult,
};
