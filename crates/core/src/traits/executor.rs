//! 工作项执行器接口
//!
//! 每种 `item_type` 对应一个执行器，消费者按类型查找执行器处理工作项。
//! 执行器只接收数据（payload），不做任何代码求值。

use async_trait::async_trait;

use crate::models::WorkItem;
use crate::FleetResult;

#[async_trait]
pub trait ItemExecutor: Send + Sync {
    /// 执行工作项，返回结果数据
    async fn execute(&self, item: &WorkItem) -> FleetResult<serde_json::Value>;

    fn name(&self) -> &str;

    /// 支持的工作项类型
    fn supported_item_types(&self) -> Vec<String>;

    fn supports_item_type(&self, item_type: &str) -> bool {
        self.supported_item_types().iter().any(|t| t == item_type)
    }
}
