//! Process-wide map from resource name to its statistics node.

use super::ResourceNode;
use crate::clock::{system_clock, Clock};
use crate::config::{self, Config};
use crate::resource::ResourceType;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

/// Name of the aggregate node that every inbound entry is also recorded on.
pub const TOTAL_INBOUND_RESOURCE_NAME: &str = "__total_inbound_traffic__";

/// Registry of [`ResourceNode`]s; exactly one node per distinct resource name.
#[derive(Debug)]
pub struct ResourceNodeRegistry {
    nodes: RwLock<HashMap<String, Arc<ResourceNode>>>,
    config: Option<Arc<Config>>,
    clock: Arc<dyn Clock>,
}

impl Default for ResourceNodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceNodeRegistry {
    /// Registry that shapes new nodes with whatever [`config::global`] holds at creation time.
    pub fn new() -> Self {
        Self { nodes: RwLock::new(HashMap::new()), config: None, clock: system_clock() }
    }

    /// Registry pinned to `config` and `clock`, used by tests and embedded chains.
    pub fn with_config(config: Config, clock: Arc<dyn Clock>) -> Self {
        Self { nodes: RwLock::new(HashMap::new()), config: Some(Arc::new(config)), clock }
    }

    /// Clock handed to every node this registry creates.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Config new nodes are shaped with.
    pub fn config(&self) -> Arc<Config> {
        self.config.clone().unwrap_or_else(config::global)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ResourceNode>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).get(name).cloned()
    }

    /// Look the node up under the read lock; on a miss, re-check and insert under the write lock.
    pub fn get_or_create(&self, name: &str, resource_type: ResourceType) -> Arc<ResourceNode> {
        if let Some(node) = self.get(name) {
            return node;
        }
        let config = self.config();
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(node) = nodes.get(name) {
            return node.clone();
        }
        if nodes.len() >= config.max_resource_amount() {
            tracing::warn!(
                resource = %name,
                amount = nodes.len(),
                max = config.max_resource_amount(),
                "resource amount exceeds the threshold"
            );
        }
        let node = Arc::new(ResourceNode::with_config(name, resource_type, &config, self.clock.clone()));
        nodes.insert(name.to_string(), node.clone());
        node
    }

    /// Snapshot of every registered node.
    pub fn nodes(&self) -> Vec<Arc<ResourceNode>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every node. Entries in flight keep the node they attached to.
    pub fn reset(&self) {
        self.nodes.write().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

/// The process-wide registry.
pub fn global_registry() -> Arc<ResourceNodeRegistry> {
    static REGISTRY: OnceLock<Arc<ResourceNodeRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(ResourceNodeRegistry::new())).clone()
}

/// Aggregate statistics for all inbound traffic.
pub fn inbound_node() -> &'static Arc<ResourceNode> {
    static INBOUND: OnceLock<Arc<ResourceNode>> = OnceLock::new();
    INBOUND.get_or_init(|| Arc::new(ResourceNode::new(TOTAL_INBOUND_RESOURCE_NAME, ResourceType::Common)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::{Barrier, Mutex};
    use std::thread;
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
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn registry(max: usize) -> ResourceNodeRegistry {
        let config = Config::builder().max_resource_amount(max).build().unwrap();
        ResourceNodeRegistry::with_config(config, Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn one_node_per_name() {
        let registry = registry(10);
        let a = registry.get_or_create("a", ResourceType::Web);
        let again = registry.get_or_create("a", ResourceType::Rpc);
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(again.resource_type(), ResourceType::Web);
        assert!(registry.get("b").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn concurrent_creation_converges() {
        let registry = Arc::new(registry(10));
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create("hot", ResourceType::Common)
                })
            })
            .collect();
        let nodes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(nodes.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.nodes().len(), 1);
    }

    #[test]
    fn warns_past_soft_cap_but_still_creates() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let registry = registry(2);
        for name in ["a", "b", "c"] {
            registry.get_or_create(name, ResourceType::Common);
        }
        assert_eq!(registry.len(), 3);
        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("resource amount exceeds the threshold"));
    }

    #[test]
    fn reset_drops_nodes() {
        let registry = registry(10);
        let old = registry.get_or_create("a", ResourceType::Common);
        registry.reset();
        assert!(registry.is_empty());
        let new = registry.get_or_create("a", ResourceType::Common);
        assert!(!Arc::ptr_eq(&old, &new));
    }
}
