use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::NodeDescriptor;
use crate::FleetResult;

/// 一次成功探测读取到的远端负载
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProbeReport {
    pub active_item_count: Option<u32>,
    pub latency: Duration,
}

/// 两个节点之间的存活探测链路
///
/// 不可达时返回 `FleetError::NodeUnreachable`
#[async_trait]
pub trait HeartbeatLink: Send + Sync {
    async fn probe(&self, node: &NodeDescriptor) -> FleetResult<ProbeReport>;
}

/// 对等节点发现来源，返回当前可达的节点描述
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn discover(&self) -> FleetResult<Vec<NodeDescriptor>>;
}
