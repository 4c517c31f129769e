use async_trait::async_trait;
use tracing::warn;

use crate::FleetResult;

/// 审计事件类型
pub mod event_types {
    pub const NODE_JOINED: &str = "node_joined";
    pub const NODE_LEFT: &str = "node_left";
    pub const ITEM_SUBMITTED: &str = "item_submitted";
    pub const ITEM_COMPLETED: &str = "item_completed";
    pub const ITEM_FAILED: &str = "item_failed";
    pub const CONFIG_PUBLISHED: &str = "config_published";
    pub const CONFIG_APPLIED: &str = "config_applied";
    pub const CONFIG_APPLY_FAILED: &str = "config_apply_failed";
}

/// 只追加的审计事件接收端
///
/// 调用方不关心写入结果，失败只记录日志，不重试
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_event(&self, event_type: &str, data: serde_json::Value) -> FleetResult<()>;
}

/// 写入审计事件，失败时只记录告警
pub async fn emit_audit(sink: &dyn AuditSink, event_type: &str, data: serde_json::Value) {
    if let Err(e) = sink.record_event(event_type, data).await {
        warn!("写入审计事件 {} 失败: {}", event_type, e);
    }
}
