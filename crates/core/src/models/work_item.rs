use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::node::NodeId;

/// 工作项标识
pub type ItemId = String;

/// 工作项优先级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// 出队排序用的等级，数值越小越先出队
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }
}

/// 工作项状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

/// 工作项
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub item_type: String,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: ItemStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub assigned_node: Option<NodeId>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub processing_duration_ms: Option<u64>,
    #[serde(default)]
    pub requeue_count: u32,
}

impl WorkItem {
    pub fn new(item_type: &str, payload: serde_json::Value, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            item_type: item_type.to_string(),
            payload,
            priority,
            status: ItemStatus::Pending,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_node: None,
            result: None,
            error: None,
            processing_duration_ms: None,
            requeue_count: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ItemStatus::Pending
    }

    pub fn is_active(&self) -> bool {
        self.status == ItemStatus::Active
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.status, ItemStatus::Completed | ItemStatus::Failed)
    }

    /// 分配给消费节点
    pub fn assign(&mut self, node: &str, now: DateTime<Utc>) {
        self.status = ItemStatus::Active;
        self.assigned_node = Some(node.to_string());
        self.started_at = Some(now);
    }

    /// 孤儿回收：重置为待处理
    pub fn reset_to_pending(&mut self) {
        self.status = ItemStatus::Pending;
        self.assigned_node = None;
        self.started_at = None;
        self.requeue_count += 1;
    }

    pub fn complete(&mut self, result: serde_json::Value, duration_ms: u64, now: DateTime<Utc>) {
        self.status = ItemStatus::Completed;
        self.result = Some(result);
        self.processing_duration_ms = Some(duration_ms);
        self.completed_at = Some(now);
    }

    pub fn fail(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = ItemStatus::Failed;
        self.error = Some(error.to_string());
        self.completed_at = Some(now);
    }
}

/// 队列状态统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub active_count: usize,
    pub completed_count: u64,
    pub failed_count: u64,
    pub avg_duration_ms: f64,
    pub total_submitted: u64,
}
