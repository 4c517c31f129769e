use async_trait::async_trait;

use crate::models::{ConfigBundle, Node};
use crate::FleetResult;

/// 向客户端节点下发配置包的回调
#[async_trait]
pub trait ConfigClient: Send + Sync {
    async fn apply(&self, node: &Node, bundle: &ConfigBundle) -> FleetResult<()>;
}
