//! 进程内的心跳链路、发现来源，用于单机部署和测试

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{Discovery, FleetError, FleetResult, HeartbeatLink, NodeDescriptor, ProbeReport};
use tokio::sync::RwLock;

/// 可由调用方控制的心跳链路：未标记为可达的节点一律探测失败
#[derive(Debug, Default)]
pub struct InMemoryHeartbeatLink {
    reachable: RwLock<HashMap<String, Option<u32>>>,
}

impl InMemoryHeartbeatLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 标记节点可达，并设置探测时返回的负载
    pub async fn set_reachable(&self, node_id: &str, active_item_count: Option<u32>) {
        self.reachable
            .write()
            .await
            .insert(node_id.to_string(), active_item_count);
    }

    pub async fn set_unreachable(&self, node_id: &str) {
        self.reachable.write().await.remove(node_id);
    }
}

#[async_trait]
impl HeartbeatLink for InMemoryHeartbeatLink {
    async fn probe(&self, node: &NodeDescriptor) -> FleetResult<ProbeReport> {
        match self.reachable.read().await.get(&node.id) {
            Some(load) => Ok(ProbeReport {
                active_item_count: *load,
                latency: Duration::ZERO,
            }),
            None => Err(FleetError::node_unreachable(&node.id, "链路断开")),
        }
    }
}

/// 固定的节点列表，可在运行时追加
#[derive(Debug, Default)]
pub struct StaticDiscovery {
    peers: RwLock<Vec<NodeDescriptor>>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<NodeDescriptor>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    pub async fn add_peer(&self, peer: NodeDescriptor) {
        self.peers.write().await.push(peer);
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn discover(&self) -> FleetResult<Vec<NodeDescriptor>> {
        Ok(self.peers.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::NodeRole;

    #[tokio::test]
    async fn test_in_memory_link_reachability() {
        let link = InMemoryHeartbeatLink::new();
        let node = NodeDescriptor::new("a", "mem://a", NodeRole::Full, Vec::<String>::new());

        assert!(link.probe(&node).await.is_err());

        link.set_reachable("a", Some(2)).await;
        let report = link.probe(&node).await.unwrap();
        assert_eq!(report.active_item_count, Some(2));

        link.set_unreachable("a").await;
        assert!(matches!(
            link.probe(&node).await,
            Err(FleetError::NodeUnreachable { .. })
        ));
    }
}
