use std::time::Duration;

use async_trait::async_trait;

use crate::models::WorkItem;
use crate::FleetResult;

/// 消费者视角的工作来源，可以是进程内的生产者也可以是远端生产者
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// 拉取最多 `max_count` 个工作项，没有可用项时最多等待 `wait`
    async fn request_items(
        &self,
        node_id: &str,
        max_count: usize,
        wait: Duration,
    ) -> FleetResult<Vec<WorkItem>>;

    async fn report_completion(
        &self,
        item_id: &str,
        result: serde_json::Value,
        duration_ms: u64,
    ) -> FleetResult<()>;

    async fn report_failure(&self, item_id: &str, error: &str) -> FleetResult<()>;
}
