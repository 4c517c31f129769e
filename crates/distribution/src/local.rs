use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{ConfigBundle, ConfigClient, FleetError, FleetResult, Node, NodeId};
use tokio::sync::RwLock;

use crate::applier::ConfigApplier;

/// 进程内的配置下发，按节点ID直接调用对应的应用器
///
/// 单进程部署和测试使用；跨进程下发用 HTTP 客户端
#[derive(Default)]
pub struct LocalConfigClient {
    appliers: RwLock<HashMap<NodeId, Arc<ConfigApplier>>>,
}

impl LocalConfigClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, applier: Arc<ConfigApplier>) {
        self.appliers
            .write()
            .await
            .insert(applier.node_id().to_string(), applier);
    }

    pub async fn detach(&self, node_id: &str) -> bool {
        self.appliers.write().await.remove(node_id).is_some()
    }
}

#[async_trait]
impl ConfigClient for LocalConfigClient {
    async fn apply(&self, node: &Node, bundle: &ConfigBundle) -> FleetResult<()> {
        let applier = self
            .appliers
            .read()
            .await
            .get(&node.id)
            .cloned()
            .ok_or_else(|| FleetError::node_unreachable(&node.id, "本进程中没有该节点的配置应用器"))?;
        applier.apply(bundle).await.map(|_| ())
    }
}
