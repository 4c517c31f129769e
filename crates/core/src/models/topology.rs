use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::node::{Node, NodeId, NodeStatus};

/// 拓扑快照：节点表的不可变副本，每次变化都会生成新的快照
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopologySnapshot {
    /// 单调递增的修订号
    pub revision: u64,
    pub nodes: BTreeMap<NodeId, Node>,
}

impl TopologySnapshot {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn is_healthy(&self, id: &str) -> bool {
        self.nodes.get(id).is_some_and(Node::is_healthy)
    }

    pub fn healthy_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.is_healthy())
    }

    pub fn clients(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.is_client())
    }

    /// 节点 -> 健康状态
    pub fn statuses(&self) -> BTreeMap<NodeId, NodeStatus> {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.status))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// 拓扑变化事件，按检测顺序发布
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TopologyEvent {
    NodeJoined { node: Node },
    NodeLeft { node_id: NodeId },
    HealthChanged { node_id: NodeId, status: NodeStatus },
}

impl TopologyEvent {
    pub fn node_id(&self) -> &str {
        match self {
            TopologyEvent::NodeJoined { node } => &node.id,
            TopologyEvent::NodeLeft { node_id } => node_id,
            TopologyEvent::HealthChanged { node_id, .. } => node_id,
        }
    }
}
