//! HTTP 接口的请求/响应结构，服务端和各类 HTTP 客户端共用

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::node::NodeId;
use super::work_item::ItemId;

/// 统一的响应包装
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn success_with_message(data: T, message: String) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message),
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            timestamp: Utc::now(),
        }
    }
}

/// 消费者拉取请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestItemsRequest {
    pub node_id: NodeId,
    pub max_count: usize,
    /// 无可用工作项时的最长等待时间
    #[serde(default)]
    pub wait_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteItemRequest {
    #[serde(default)]
    pub result: serde_json::Value,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailItemRequest {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitItemRequest {
    pub item_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitItemResponse {
    pub item_id: ItemId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelItemResponse {
    pub cancelled: bool,
}

/// 发布配置请求，内容按文本上传
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub content: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// 健康检查的返回内容，也是心跳探测读取的负载报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub node_id: NodeId,
    pub active_item_count: u32,
    pub timestamp: DateTime<Utc>,
}
