use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::traits::ItemExecutor;
use crate::{FleetError, FleetResult};

/// 按工作项类型索引的执行器注册表
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn ItemExecutor>>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// 为执行器声明的每个类型注册，后注册的覆盖先注册的
    pub async fn register(&self, executor: Arc<dyn ItemExecutor>) {
        let mut registry = self.executors.write().await;
        for item_type in executor.supported_item_types() {
            registry.insert(item_type, Arc::clone(&executor));
        }
    }

    pub async fn unregister(&self, item_type: &str) -> bool {
        let mut registry = self.executors.write().await;
        registry.remove(item_type).is_some()
    }

    pub async fn get(&self, item_type: &str) -> FleetResult<Arc<dyn ItemExecutor>> {
        let registry = self.executors.read().await;
        registry
            .get(item_type)
            .cloned()
            .ok_or_else(|| FleetError::ExecutorNotFound {
                item_type: item_type.to_string(),
            })
    }

    pub async fn contains(&self, item_type: &str) -> bool {
        let registry = self.executors.read().await;
        registry.contains_key(item_type)
    }

    pub async fn item_types(&self) -> Vec<String> {
        let registry = self.executors.read().await;
        let mut types: Vec<String> = registry.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
