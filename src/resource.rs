//! Resource descriptors.

use std::fmt;

/// Classification of a guarded resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResourceType {
    #[default]
    Common,
    Web,
    Rpc,
    ApiGateway,
    DbSql,
    Cache,
    Mq,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceType::Common => "Common",
            ResourceType::Web => "Web",
            ResourceType::Rpc => "RPC",
            ResourceType::ApiGateway => "APIGateway",
            ResourceType::DbSql => "DBSQL",
            ResourceType::Cache => "Cache",
            ResourceType::Mq => "MQ",
        };
        f.write_str(name)
    }
}

/// Direction of the traffic passing through an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TrafficType {
    /// Requests served by this process; also recorded on the global inbound node.
    Inbound,
    #[default]
    Outbound,
}

impl fmt::Display for TrafficType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrafficType::Inbound => f.write_str("Inbound"),
            TrafficType::Outbound => f.write_str("Outbound"),
        }
    }
}

/// Name, classification and direction of the resource an entry targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceWrapper {
    name: String,
    resource_type: ResourceType,
    traffic_type: TrafficType,
}

impl ResourceWrapper {
    pub fn new(name: impl Into<String>, resource_type: ResourceType, traffic_type: TrafficType) -> Self {
        Self { name: name.into(), resource_type, traffic_type }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    pub fn traffic_type(&self) -> TrafficType {
        self.traffic_type
    }
}

impl fmt::Display for ResourceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ResourceWrapper{{name={}, type={}, traffic={}}}",
            self.name, self.resource_type, self.traffic_type
        )
    }
}
