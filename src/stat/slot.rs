//! Slots that attach and feed resource statistics.

use super::{global_registry, inbound_node, MetricEvent, ResourceNode, ResourceNodeRegistry, StatNode};
use crate::context::EntryContext;
use crate::error::BlockError;
use crate::resource::TrafficType;
use crate::slot_chain::{BaseSlot, StatPrepareSlot, StatSlot};
use std::sync::Arc;

/// Attaches the entry's [`ResourceNode`], creating it on first use.
#[derive(Debug, Clone)]
pub struct ResourceNodePrepareSlot {
    registry: Arc<ResourceNodeRegistry>,
}

impl ResourceNodePrepareSlot {
    pub const NAME: &'static str = "resource-node-prepare";
    pub const ORDER: u32 = 1000;

    pub fn new(registry: Arc<ResourceNodeRegistry>) -> Self {
        Self { registry }
    }
}

impl Default for ResourceNodePrepareSlot {
    fn default() -> Self {
        Self::new(global_registry())
    }
}

impl BaseSlot for ResourceNodePrepareSlot {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn order(&self) -> u32 {
        Self::ORDER
    }
}

impl StatPrepareSlot for ResourceNodePrepareSlot {
    fn prepare(&self, ctx: &mut EntryContext) {
        let node = match ctx.resource() {
            Some(res) => self.registry.get_or_create(res.name(), res.resource_type()),
            None => return,
        };
        ctx.set_stat_node(node);
    }
}

/// Records pass, block and completion on the entry's node, and on the inbound aggregate for
/// inbound traffic.
#[derive(Debug, Clone)]
pub struct StatisticSlot {
    inbound: Option<Arc<ResourceNode>>,
}

impl StatisticSlot {
    pub const NAME: &'static str = "statistic";
    pub const ORDER: u32 = 1000;

    /// Slot recording inbound traffic on the process-wide inbound node.
    pub fn new() -> Self {
        Self { inbound: Some(inbound_node().clone()) }
    }

    /// Slot recording inbound traffic on `node` instead.
    pub fn with_inbound_node(node: Arc<ResourceNode>) -> Self {
        Self { inbound: Some(node) }
    }

    /// Slot that only records on per-resource nodes.
    pub fn without_inbound() -> Self {
        Self { inbound: None }
    }

    fn targets<'a>(&'a self, ctx: &'a EntryContext) -> impl Iterator<Item = &'a dyn StatNode> + 'a {
        let inbound: Option<&'a dyn StatNode> = match ctx.resource().map(|r| r.traffic_type()) {
            Some(TrafficType::Inbound) => self.inbound.as_deref().map(|n| n as &dyn StatNode),
            _ => None,
        };
        let own: Option<&'a dyn StatNode> = ctx.stat_node().map(|n| &**n as &dyn StatNode);
        own.into_iter().chain(inbound)
    }
}

impl Default for StatisticSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl BaseSlot for StatisticSlot {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn order(&self) -> u32 {
        Self::ORDER
    }
}

impl StatSlot for StatisticSlot {
    fn on_entry_passed(&self, ctx: &EntryContext) {
        let batch = i64::from(ctx.input().batch_count);
        for node in self.targets(ctx) {
            node.increase_concurrency();
            node.add_count(MetricEvent::Pass, batch);
        }
    }

    fn on_entry_blocked(&self, ctx: &EntryContext, _block_error: &BlockError) {
        let batch = i64::from(ctx.input().batch_count);
        for node in self.targets(ctx) {
            node.add_count(MetricEvent::Block, batch);
        }
    }

    fn on_completed(&self, ctx: &EntryContext) {
        let batch = i64::from(ctx.input().batch_count);
        let rt = i64::try_from(ctx.rt()).unwrap_or(i64::MAX);
        for node in self.targets(ctx) {
            node.add_rt_and_complete(rt, batch);
            if ctx.error().is_some() {
                node.add_count(MetricEvent::Error, batch);
            }
            node.decrease_concurrency();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::error::BlockType;
    use crate::resource::{ResourceType, ResourceWrapper};

    const T0: u64 = 1_700_000_000_000;

    fn setup() -> (Arc<ResourceNodeRegistry>, Arc<ResourceNode>, ManualClock) {
        let clock = ManualClock::new(T0);
        let registry = Arc::new(ResourceNodeRegistry::with_config(Config::default(), Arc::new(clock.clone())));
        let inbound = Arc::new(ResourceNode::with_config(
            "inbound",
            ResourceType::Common,
            &Config::default(),
            Arc::new(clock.clone()),
        ));
        (registry, inbound, clock)
    }

    fn ctx(traffic: TrafficType) -> EntryContext {
        let mut ctx = EntryContext::new();
        ctx.set_resource(ResourceWrapper::new("svc", ResourceType::Rpc, traffic));
        ctx.input_mut().batch_count = 2;
        ctx
    }

    #[test]
    fn prepare_attaches_shared_node() {
        let (registry, _, _) = setup();
        let slot = ResourceNodePrepareSlot::new(registry.clone());
        let mut a = ctx(TrafficType::Outbound);
        let mut b = ctx(TrafficType::Outbound);
        slot.prepare(&mut a);
        slot.prepare(&mut b);
        let node = registry.get("svc").unwrap();
        assert_eq!(node.resource_type(), ResourceType::Rpc);
        assert_eq!(a.stat_node().unwrap().current_concurrency(), 0);
        assert!(Arc::ptr_eq(a.stat_node().unwrap(), b.stat_node().unwrap()));
    }

    #[test]
    fn prepare_without_resource_is_noop() {
        let (registry, _, _) = setup();
        let mut ctx = EntryContext::new();
        ResourceNodePrepareSlot::new(registry.clone()).prepare(&mut ctx);
        assert!(ctx.stat_node().is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn records_full_lifecycle_with_batch() {
        let (registry, inbound, clock) = setup();
        let prepare = ResourceNodePrepareSlot::new(registry.clone());
        let stat = StatisticSlot::with_inbound_node(inbound.clone());
        let mut ctx = ctx(TrafficType::Inbound);
        prepare.prepare(&mut ctx);

        stat.on_entry_passed(&ctx);
        let node = registry.get("svc").unwrap();
        assert_eq!(node.current_concurrency(), 1);
        assert_eq!(node.sum(MetricEvent::Pass), 2);
        assert_eq!(inbound.sum(MetricEvent::Pass), 2);

        clock.advance(30);
        ctx.set_rt(30);
        ctx.set_error("failed".into());
        stat.on_completed(&ctx);
        assert_eq!(node.current_concurrency(), 0);
        assert_eq!(node.sum(MetricEvent::Complete), 2);
        assert_eq!(node.sum(MetricEvent::Error), 2);
        assert_eq!(node.sum(MetricEvent::Rt), 30);
        assert_eq!(inbound.current_concurrency(), 0);
    }

    #[test]
    fn blocked_outbound_skips_inbound_node() {
        let (registry, inbound, _) = setup();
        let stat = StatisticSlot::with_inbound_node(inbound.clone());
        let mut ctx = ctx(TrafficType::Outbound);
        ResourceNodePrepareSlot::new(registry.clone()).prepare(&mut ctx);
        stat.on_entry_blocked(&ctx, &BlockError::new(BlockType::Flow));
        assert_eq!(registry.get("svc").unwrap().sum(MetricEvent::Block), 2);
        assert_eq!(inbound.sum(MetricEvent::Block), 0);
    }
}
