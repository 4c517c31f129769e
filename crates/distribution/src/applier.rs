//! 客户端的配置应用
//!
//! 配置包只包含数据，由一组固定注册的处理器解释，不执行任何下发的代码。

use std::sync::Arc;

use async_trait::async_trait;
use fleet_core::{BundleStore, ConfigBundle, FleetError, FleetResult, NodeId};
use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// 应用结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// 重复应用当前版本，没有任何变化
    AlreadyCurrent,
}

/// 解释配置包内容的处理器
///
/// `prepare` 只做检查，任何一个处理器拒绝都会让整个配置包被拒绝；
/// 全部通过后才依次调用 `commit`。
#[async_trait]
pub trait BundleHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn prepare(&self, bundle: &ConfigBundle) -> FleetResult<()>;

    async fn commit(&self, bundle: &ConfigBundle) -> FleetResult<()>;
}

/// 客户端持有的当前配置
pub struct ConfigApplier {
    node_id: NodeId,
    current: Mutex<Option<ConfigBundle>>,
    handlers: Vec<Arc<dyn BundleHandler>>,
    store: Option<Arc<dyn BundleStore>>,
}

impl ConfigApplier {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            current: Mutex::new(None),
            handlers: Vec::new(),
            store: None,
        }
    }

    pub fn with_handler(mut self, handler: Arc<dyn BundleHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn BundleStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn current_version(&self) -> Option<String> {
        self.current.lock().await.as_ref().map(|b| b.version.clone())
    }

    pub async fn current_bundle(&self) -> Option<ConfigBundle> {
        self.current.lock().await.clone()
    }

    /// 校验并应用配置包
    ///
    /// 校验和不符、版本过旧、处理器拒绝或持久化失败时返回错误，当前版本
    /// 和处理器状态都保持不变。顺序为检查、持久化、提交。
    ///
    /// 整个过程持有 `current` 锁，同一客户端上的应用串行执行。
    pub async fn apply(&self, bundle: &ConfigBundle) -> FleetResult<ApplyOutcome> {
        bundle.validate()?;
        bundle.verify_checksum()?;

        let mut current = self.current.lock().await;
        if let Some(existing) = current.as_ref() {
            if existing.version == bundle.version {
                if existing.checksum.eq_ignore_ascii_case(&bundle.checksum) {
                    debug!("配置版本 {} 已是当前版本", bundle.version);
                    return Ok(ApplyOutcome::AlreadyCurrent);
                }
                return Err(FleetError::InvalidBundle(format!(
                    "版本 {} 的内容与已应用的内容不同",
                    bundle.version
                )));
            }
            if !bundle.is_newer_than(&existing.version) {
                return Err(FleetError::StaleVersion {
                    version: bundle.version.clone(),
                    current: existing.version.clone(),
                });
            }
        }

        self.prepare_all(bundle).await?;
        if let Some(store) = &self.store {
            store.save_bundle(bundle).await?;
        }
        self.commit_all(bundle).await?;
        *current = Some(bundle.clone());

        info!(
            "节点 {} 已应用配置版本 {} (来源: {})",
            self.node_id, bundle.version, bundle.source_node
        );
        Ok(ApplyOutcome::Applied)
    }

    /// 从存储恢复上次应用的配置并重新交给处理器
    pub async fn restore(&self) -> FleetResult<Option<String>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(bundle) = store.load_bundle().await? else {
            return Ok(None);
        };
        bundle.validate()?;
        bundle.verify_checksum()?;

        let mut current = self.current.lock().await;
        self.prepare_all(&bundle).await?;
        self.commit_all(&bundle).await?;
        let version = bundle.version.clone();
        *current = Some(bundle);
        info!("节点 {} 恢复配置版本 {}", self.node_id, version);
        Ok(Some(version))
    }

    async fn prepare_all(&self, bundle: &ConfigBundle) -> FleetResult<()> {
        for handler in &self.handlers {
            if let Err(e) = handler.prepare(bundle).await {
                warn!(
                    "处理器 {} 拒绝配置版本 {}: {}",
                    handler.name(),
                    bundle.version,
                    e
                );
                return Err(e);
            }
        }
        Ok(())
    }

    async fn commit_all(&self, bundle: &ConfigBundle) -> FleetResult<()> {
        for handler in &self.handlers {
            handler.commit(bundle).await?;
        }
        Ok(())
    }
}

/// 把配置内容解析为 JSON 对象并通过 watch 通道发布
pub struct SettingsHandler {
    sender: watch::Sender<Arc<Map<String, Value>>>,
}

impl SettingsHandler {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Arc::new(Map::new()));
        Self { sender }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Map<String, Value>>> {
        self.sender.subscribe()
    }

    pub fn settings(&self) -> Arc<Map<String, Value>> {
        self.sender.borrow().clone()
    }

    fn parse(bundle: &ConfigBundle) -> FleetResult<Map<String, Value>> {
        match serde_json::from_slice::<Value>(&bundle.content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(FleetError::InvalidBundle(
                "配置内容必须是JSON对象".to_string(),
            )),
            Err(e) => Err(FleetError::InvalidBundle(format!("配置内容不是合法JSON: {e}"))),
        }
    }
}

impl Default for SettingsHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BundleHandler for SettingsHandler {
    fn name(&self) -> &str {
        "settings"
    }

    async fn prepare(&self, bundle: &ConfigBundle) -> FleetResult<()> {
        Self::parse(bundle).map(|_| ())
    }

    async fn commit(&self, bundle: &ConfigBundle) -> FleetResult<()> {
        let settings = Self::parse(bundle)?;
        self.sender.send_replace(Arc::new(settings));
        Ok(())
    }
}
