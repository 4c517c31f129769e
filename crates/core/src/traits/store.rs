use async_trait::async_trait;

use crate::models::{ConfigBundle, Node};
use crate::FleetResult;

/// 节点注册表的持久化
#[async_trait]
pub trait NodeRegistryStore: Send + Sync {
    async fn load_nodes(&self) -> FleetResult<Vec<Node>>;
    async fn save_nodes(&self, nodes: &[Node]) -> FleetResult<()>;
}

/// 当前配置包的持久化
#[async_trait]
pub trait BundleStore: Send + Sync {
    async fn load_bundle(&self) -> FleetResult<Option<ConfigBundle>>;
    async fn save_bundle(&self, bundle: &ConfigBundle) -> FleetResult<()>;
}
