use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 节点标识（唯一的名称）
pub type NodeId = String;

/// 节点角色
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// 只接收配置下发的客户端节点
    Client,
    /// 运行完整控制平面的节点
    Full,
}

/// 节点健康状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Healthy,
    Unhealthy,
}

/// 节点负载指标
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadMetrics {
    pub active_item_count: u32,
}

/// 节点自我描述，在加入、发现和心跳时携带
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeDescriptor {
    pub id: NodeId,
    /// 节点API的基础地址，例如 `http://10.0.0.5:8080`
    pub address: String,
    pub role: NodeRole,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl NodeDescriptor {
    pub fn new<I, S>(id: &str, address: &str, role: NodeRole, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.to_string(),
            address: address.to_string(),
            role,
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }
}

/// 集群节点信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub address: String,
    pub role: NodeRole,
    pub capabilities: BTreeSet<String>,
    pub status: NodeStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub load: LoadMetrics,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub consecutive_probe_failures: u32,
}

/// 节点主动上报的心跳
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAnnouncement {
    pub descriptor: NodeDescriptor,
    pub active_item_count: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl Node {
    /// 根据描述创建新的健康节点
    pub fn new(descriptor: NodeDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: descriptor.id,
            address: descriptor.address,
            role: descriptor.role,
            capabilities: descriptor.capabilities,
            status: NodeStatus::Healthy,
            last_heartbeat: now,
            load: LoadMetrics::default(),
            joined_at: now,
            consecutive_probe_failures: 0,
        }
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor {
            id: self.id.clone(),
            address: self.address.clone(),
            role: self.role,
            capabilities: self.capabilities.clone(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, NodeStatus::Healthy)
    }

    pub fn is_client(&self) -> bool {
        matches!(self.role, NodeRole::Client)
    }

    /// 节点能力集合是否为所需能力的超集
    pub fn has_capabilities(&self, required: &BTreeSet<String>) -> bool {
        required.is_subset(&self.capabilities)
    }

    /// 距离上次成功心跳是否已经超过不健康阈值
    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat >= timeout
    }

    /// 用新的描述覆盖地址、角色和能力
    pub fn update_descriptor(&mut self, descriptor: NodeDescriptor) {
        self.address = descriptor.address;
        self.role = descriptor.role;
        self.capabilities = descriptor.capabilities;
    }
}
