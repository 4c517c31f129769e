use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_core::{
    config::DistributionConfig, default_version, emit_audit, event_types, AuditSink,
    BundleStore, ClientRegistration, ConfigBundle, ConfigClient, DistributionRecord, FleetError,
    FleetResult, NodeId, NodeStatus, TopologyEvent,
};
use fleet_topology::TopologyManager;
use futures::future::join_all;
use metrics::{counter, gauge};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// 配置分发服务的运行参数
#[derive(Debug, Clone)]
pub struct DistributionServiceConfig {
    /// 本节点 ID，写入配置包的来源字段
    pub source_node: NodeId,
    /// 单个客户端应用配置的超时时间
    pub apply_timeout: Duration,
    /// 保留的下发记录条数
    pub history_capacity: usize,
}

impl DistributionServiceConfig {
    pub fn new(source_node: impl Into<NodeId>) -> Self {
        Self {
            source_node: source_node.into(),
            apply_timeout: Duration::from_secs(5),
            history_capacity: 500,
        }
    }

    pub fn from_config(source_node: impl Into<NodeId>, config: &DistributionConfig) -> Self {
        Self {
            source_node: source_node.into(),
            apply_timeout: Duration::from_secs(config.apply_timeout_seconds),
            history_capacity: config.history_capacity,
        }
    }
}

#[derive(Default)]
struct DistributionState {
    current: Option<ConfigBundle>,
    registrations: BTreeMap<NodeId, ClientRegistration>,
    history: VecDeque<DistributionRecord>,
}

/// 控制端的配置分发服务
pub struct DistributionService {
    state: Mutex<DistributionState>,
    /// 串行化发布，保证版本单调且推送不交错
    publish_lock: Mutex<()>,
    topology: Arc<TopologyManager>,
    client: Arc<dyn ConfigClient>,
    store: Option<Arc<dyn BundleStore>>,
    audit: Arc<dyn AuditSink>,
    config: DistributionServiceConfig,
}

impl DistributionService {
    pub fn new(
        topology: Arc<TopologyManager>,
        client: Arc<dyn ConfigClient>,
        audit: Arc<dyn AuditSink>,
        config: DistributionServiceConfig,
    ) -> Self {
        Self {
            state: Mutex::new(DistributionState::default()),
            publish_lock: Mutex::new(()),
            topology,
            client,
            store: None,
            audit,
            config,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn BundleStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 从存储恢复当前配置包，返回恢复的版本
    pub async fn restore(&self) -> FleetResult<Option<String>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let Some(bundle) = store.load_bundle().await? else {
            return Ok(None);
        };
        bundle.validate()?;
        bundle.verify_checksum()?;

        let version = bundle.version.clone();
        self.state.lock().await.current = Some(bundle);
        info!("恢复配置包版本 {}", version);
        Ok(Some(version))
    }

    /// 发布新配置并推送给所有客户端
    ///
    /// 版本不比当前版本新时返回 `StaleVersion`。配置包先持久化，之后才成为当前版本。
    pub async fn publish(&self, content: Vec<u8>, version: Option<String>) -> FleetResult<ConfigBundle> {
        let _publishing = self.publish_lock.lock().await;

        let version = version.unwrap_or_else(|| default_version(Utc::now()));
        let bundle = ConfigBundle::new(&version, content, &self.config.source_node);
        bundle.validate()?;

        if let Some(current) = self.current_bundle().await {
            if !bundle.is_newer_than(&current.version) {
                return Err(FleetError::StaleVersion {
                    version,
                    current: current.version,
                });
            }
        }

        if let Some(store) = &self.store {
            store.save_bundle(&bundle).await?;
        }
        self.state.lock().await.current = Some(bundle.clone());

        counter!("fleet_config_published_total").increment(1);
        info!(
            "发布配置版本 {} ({} 字节, 校验和 {})",
            bundle.version,
            bundle.content.len(),
            bundle.checksum
        );
        emit_audit(
            self.audit.as_ref(),
            event_types::CONFIG_PUBLISHED,
            serde_json::json!({
                "version": bundle.version,
                "checksum": bundle.checksum,
                "size": bundle.content.len(),
            }),
        )
        .await;

        let targets = self.targets().await;
        let records = self.deliver(&bundle, targets).await;
        let succeeded = records.iter().filter(|r| r.success).count();
        info!(
            "配置版本 {} 下发完成: 成功 {}/{}",
            bundle.version,
            succeeded,
            records.len()
        );

        Ok(bundle)
    }

    /// 注册客户端，重复注册不改变已有记录。新注册的客户端会立即收到当前配置
    pub async fn register(&self, node_id: &str) -> FleetResult<ClientRegistration> {
        if node_id.trim().is_empty() {
            return Err(FleetError::invalid_argument("节点ID不能为空"));
        }

        let newly_registered = {
            let mut state = self.state.lock().await;
            let newly_registered = !state.registrations.contains_key(node_id);
            if newly_registered {
                state
                    .registrations
                    .insert(node_id.to_string(), ClientRegistration::new(node_id));
                gauge!("fleet_config_registered_clients").set(state.registrations.len() as f64);
            }
            newly_registered
        };

        if newly_registered {
            info!("注册配置客户端 {}", node_id);
            let _publishing = self.publish_lock.lock().await;
            // 等待发布锁期间可能有新版本发布，取锁后再读当前版本
            if let Some(bundle) = self.current_bundle().await {
                self.deliver(&bundle, BTreeSet::from([node_id.to_string()]))
                    .await;
            }
        }

        self.registration(node_id)
            .await
            .ok_or_else(|| FleetError::node_not_found(node_id))
    }

    /// 注销客户端，返回之前是否已注册
    pub async fn deregister(&self, node_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.registrations.remove(node_id).is_some();
        if removed {
            gauge!("fleet_config_registered_clients").set(state.registrations.len() as f64);
            info!("注销配置客户端 {}", node_id);
        }
        removed
    }

    /// 向单个节点补发当前配置
    ///
    /// 节点既未注册也不是拓扑中的客户端时返回 `NodeNotFound`
    pub async fn sync_to(&self, node_id: &str) -> FleetResult<DistributionRecord> {
        let _publishing = self.publish_lock.lock().await;
        let bundle = self
            .current_bundle()
            .await
            .ok_or_else(|| FleetError::invalid_argument("尚未发布任何配置"))?;

        let is_client = self
            .topology
            .snapshot()
            .node(node_id)
            .is_some_and(|n| n.is_client());
        if !is_client && self.registration(node_id).await.is_none() {
            return Err(FleetError::node_not_found(node_id));
        }

        self.deliver(&bundle, BTreeSet::from([node_id.to_string()]))
            .await
            .pop()
            .ok_or_else(|| FleetError::Internal(format!("未生成节点 {node_id} 的下发记录")))
    }

    pub async fn get_distribution_history(&self) -> Vec<DistributionRecord> {
        self.state.lock().await.history.iter().cloned().collect()
    }

    pub async fn current_bundle(&self) -> Option<ConfigBundle> {
        self.state.lock().await.current.clone()
    }

    pub async fn registrations(&self) -> Vec<ClientRegistration> {
        self.state.lock().await.registrations.values().cloned().collect()
    }

    pub async fn registration(&self, node_id: &str) -> Option<ClientRegistration> {
        self.state.lock().await.registrations.get(node_id).cloned()
    }

    /// 拓扑中的客户端节点加上已注册的节点
    async fn targets(&self) -> BTreeSet<NodeId> {
        let snapshot = self.topology.snapshot();
        let mut targets: BTreeSet<NodeId> = snapshot.clients().map(|n| n.id.clone()).collect();
        targets.extend(self.state.lock().await.registrations.keys().cloned());
        targets
    }

    /// 并发推送配置包并记录每次尝试。不健康或未知的节点直接记为失败，不做联系
    async fn deliver(&self, bundle: &ConfigBundle, targets: BTreeSet<NodeId>) -> Vec<DistributionRecord> {
        if targets.is_empty() {
            return Vec::new();
        }

        let snapshot = self.topology.snapshot();
        let client = self.client.as_ref();
        let apply_timeout = self.config.apply_timeout;

        let attempts = targets.into_iter().map(|node_id| {
            let node = snapshot.node(&node_id).cloned();
            async move {
                let outcome = match node {
                    Some(node) if node.is_healthy() => {
                        match tokio::time::timeout(apply_timeout, client.apply(&node, bundle)).await {
                            Ok(Ok(())) => Ok(()),
                            Ok(Err(e)) => Err(e.to_string()),
                            Err(_) => Err(format!("应用配置超时 ({apply_timeout:?})")),
                        }
                    }
                    Some(_) => Err("节点不健康，未下发".to_string()),
                    None => Err("节点不在拓扑中，未下发".to_string()),
                };
                (node_id, outcome)
            }
        });
        let outcomes = join_all(attempts).await;

        let now = Utc::now();
        let records: Vec<DistributionRecord> = {
            // 下发期间离开或注销的节点不再恢复登记，只留下历史记录
            let latest = self.topology.snapshot();
            let mut state = self.state.lock().await;
            let mut records = Vec::with_capacity(outcomes.len());
            for (node_id, outcome) in outcomes {
                if !state.registrations.contains_key(&node_id)
                    && latest.node(&node_id).is_some_and(|n| n.is_client())
                {
                    state
                        .registrations
                        .insert(node_id.clone(), ClientRegistration::new(&node_id));
                }
                if let Some(registration) = state.registrations.get_mut(&node_id) {
                    match &outcome {
                        Ok(()) => registration.record_success(&bundle.version, now),
                        Err(_) => registration.record_failure(now),
                    }
                }

                let record = DistributionRecord {
                    node: node_id,
                    version: bundle.version.clone(),
                    success: outcome.is_ok(),
                    error: outcome.err(),
                    attempted_at: now,
                };
                state.history.push_back(record.clone());
                records.push(record);
            }
            while state.history.len() > self.config.history_capacity {
                state.history.pop_front();
            }
            gauge!("fleet_config_registered_clients").set(state.registrations.len() as f64);
            records
        };

        for record in &records {
            if record.success {
                counter!("fleet_config_apply_total", "result" => "success").increment(1);
                debug!("节点 {} 已应用配置版本 {}", record.node, record.version);
                emit_audit(
                    self.audit.as_ref(),
                    event_types::CONFIG_APPLIED,
                    serde_json::json!({"node": record.node, "version": record.version}),
                )
                .await;
            } else {
                counter!("fleet_config_apply_total", "result" => "failure").increment(1);
                warn!(
                    "节点 {} 应用配置版本 {} 失败: {}",
                    record.node,
                    record.version,
                    record.error.as_deref().unwrap_or_default()
                );
                emit_audit(
                    self.audit.as_ref(),
                    event_types::CONFIG_APPLY_FAILED,
                    serde_json::json!({
                        "node": record.node,
                        "version": record.version,
                        "error": record.error,
                    }),
                )
                .await;
            }
        }

        records
    }

    /// 客户端节点加入时注册，离开时注销，恢复健康且版本落后时补发
    pub async fn run_topology_listener(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> FleetResult<()> {
        let mut events = self.topology.subscribe();
        self.register_known_clients().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(TopologyEvent::NodeJoined { node }) if node.is_client() => {
                        if let Err(e) = self.register(&node.id).await {
                            error!("注册配置客户端 {} 失败: {}", node.id, e);
                        }
                    }
                    Ok(TopologyEvent::NodeLeft { node_id }) => {
                        self.deregister(&node_id).await;
                    }
                    Ok(TopologyEvent::HealthChanged { node_id, status: NodeStatus::Healthy }) => {
                        self.resync_if_stale(&node_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("拓扑事件积压，跳过了 {} 个事件，重新注册客户端", skipped);
                        self.register_known_clients().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("拓扑事件通道已关闭，退出配置分发监听");
                        return Ok(());
                    }
                },
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出配置分发拓扑监听");
                    return Ok(());
                }
            }
        }
    }

    async fn register_known_clients(&self) {
        let snapshot = self.topology.snapshot();
        for node in snapshot.clients() {
            if let Err(e) = self.register(&node.id).await {
                error!("注册配置客户端 {} 失败: {}", node.id, e);
            }
        }
    }

    async fn resync_if_stale(&self, node_id: &str) {
        let stale = {
            let state = self.state.lock().await;
            match (state.registrations.get(node_id), &state.current) {
                (Some(registration), Some(current)) => {
                    registration.last_applied_version.as_deref() != Some(current.version.as_str())
                }
                _ => false,
            }
        };
        if stale {
            info!("节点 {} 恢复健康，补发当前配置", node_id);
            if let Err(e) = self.sync_to(node_id).await {
                warn!("向节点 {} 补发配置失败: {}", node_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fleet_core::{FleetResult, HeartbeatLink, Node, NodeDescriptor, NodeRole, ProbeReport};
    use fleet_topology::TopologyManagerConfig;

    struct NoopLink;

    #[async_trait]
    impl HeartbeatLink for NoopLink {
        async fn probe(&self, _node: &NodeDescriptor) -> FleetResult<ProbeReport> {
            Ok(ProbeReport {
                active_item_count: None,
                latency: Duration::ZERO,
            })
        }
    }

    struct NoopAudit;

    #[async_trait]
    impl AuditSink for NoopAudit {
        async fn record_event(&self, _event_type: &str, _data: serde_json::Value) -> FleetResult<()> {
            Ok(())
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl ConfigClient for AcceptAll {
        async fn apply(&self, _node: &Node, _bundle: &ConfigBundle) -> FleetResult<()> {
            Ok(())
        }
    }

    fn service(history_capacity: usize) -> (Arc<TopologyManager>, DistributionService) {
        let topology = Arc::new(TopologyManager::new(
            Arc::new(NoopLink),
            Arc::new(NoopAudit),
            TopologyManagerConfig::default(),
        ));
        let mut config = DistributionServiceConfig::new("control");
        config.history_capacity = history_capacity;
        let service = DistributionService::new(
            topology.clone(),
            Arc::new(AcceptAll),
            Arc::new(NoopAudit),
            config,
        );
        (topology, service)
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (topology, service) = service(2);
        topology
            .join(NodeDescriptor::new(
                "c1",
                "http://c1",
                NodeRole::Client,
                Vec::<String>::new(),
            ))
            .await
            .unwrap();

        for version in ["v1", "v2", "v3"] {
            service
                .publish(b"{}".to_vec(), Some(version.to_string()))
                .await
                .unwrap();
        }

        let history = service.get_distribution_history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, "v2");
        assert_eq!(history[1].version, "v3");
    }

    #[tokio::test]
    async fn test_generated_version_is_used_when_missing() {
        let (_, service) = service(10);
        let bundle = service.publish(b"{}".to_vec(), None).await.unwrap();
        assert_eq!(bundle.version.len(), 17);
        assert!(bundle.version.chars().all(|c| c.is_ascii_digit()));
        assert_eq!(bundle.source_node, "control");
    }

    #[tokio::test]
    async fn test_sync_without_bundle_is_rejected() {
        let (_, service) = service(10);
        assert!(matches!(
            service.sync_to("c1").await,
            Err(FleetError::InvalidArgument(_))
        ));
    }
}
