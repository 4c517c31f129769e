use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{
    event_types, BundleStore, ConfigBundle, ConfigClient, FleetError, FleetResult, Node,
    NodeDescriptor, NodeRole,
};
use fleet_distribution::{
    ConfigApplier, DistributionService, DistributionServiceConfig, LocalConfigClient,
    SettingsHandler,
};
use fleet_infrastructure::{InMemoryAuditSink, InMemoryHeartbeatLink, JsonBundleStore};
use fleet_topology::{TopologyManager, TopologyManagerConfig};
use tokio::sync::{broadcast, Notify};

struct Harness {
    topology: Arc<TopologyManager>,
    link: Arc<InMemoryHeartbeatLink>,
    audit: Arc<InMemoryAuditSink>,
    local: Arc<LocalConfigClient>,
    service: Arc<DistributionService>,
}

fn harness() -> Harness {
    harness_with_client(None)
}

fn harness_with_client(client: Option<Arc<dyn ConfigClient>>) -> Harness {
    let link = Arc::new(InMemoryHeartbeatLink::new());
    let audit = Arc::new(InMemoryAuditSink::new());
    let mut topology_config = TopologyManagerConfig::default();
    topology_config.unhealthy_timeout = Duration::ZERO;
    let topology = Arc::new(TopologyManager::new(
        link.clone(),
        audit.clone(),
        topology_config,
    ));
    let local = Arc::new(LocalConfigClient::new());
    let client = client.unwrap_or_else(|| local.clone() as Arc<dyn ConfigClient>);
    let mut config = DistributionServiceConfig::new("control");
    config.apply_timeout = Duration::from_millis(500);
    let service = Arc::new(DistributionService::new(
        topology.clone(),
        client,
        audit.clone(),
        config,
    ));
    Harness {
        topology,
        link,
        audit,
        local,
        service,
    }
}

impl Harness {
    /// 加入一个客户端节点并挂上进程内的应用器
    async fn add_client(&self, id: &str) -> Arc<ConfigApplier> {
        let applier = Arc::new(
            ConfigApplier::new(id).with_handler(Arc::new(SettingsHandler::new())),
        );
        self.local.attach(applier.clone()).await;
        self.topology
            .join(NodeDescriptor::new(
                id,
                &format!("http://{id}:8080"),
                NodeRole::Client,
                Vec::<String>::new(),
            ))
            .await
            .unwrap();
        self.link.set_reachable(id, None).await;
        applier
    }

    async fn mark_unhealthy(&self, id: &str) {
        self.link.set_unreachable(id).await;
        self.topology.probe_all().await;
        assert!(!self.topology.snapshot().is_healthy(id));
    }
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("条件未在预期时间内满足");
}

#[tokio::test]
async fn test_publish_skips_unhealthy_client() {
    let h = harness();
    let a = h.add_client("a").await;
    let b = h.add_client("b").await;
    let c = h.add_client("c").await;
    h.mark_unhealthy("c").await;

    h.service
        .publish(br#"{"feature":true}"#.to_vec(), Some("v2".to_string()))
        .await
        .unwrap();

    let history = h.service.get_distribution_history().await;
    assert_eq!(history.len(), 3);
    assert_eq!(history.iter().filter(|r| r.success).count(), 2);
    let failed: Vec<_> = history.iter().filter(|r| !r.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].node, "c");

    let registration = h.service.registration("c").await.unwrap();
    assert_eq!(registration.consecutive_failure_count, 1);
    assert_eq!(registration.last_applied_version, None);

    assert_eq!(a.current_version().await.as_deref(), Some("v2"));
    assert_eq!(b.current_version().await.as_deref(), Some("v2"));
    assert_eq!(c.current_version().await, None);

    assert_eq!(h.audit.count(event_types::CONFIG_PUBLISHED).await, 1);
    assert_eq!(h.audit.count(event_types::CONFIG_APPLIED).await, 2);
    assert_eq!(h.audit.count(event_types::CONFIG_APPLY_FAILED).await, 1);
}

#[tokio::test]
async fn test_stale_version_rejected() {
    let h = harness();
    h.service
        .publish(b"{}".to_vec(), Some("v10".to_string()))
        .await
        .unwrap();

    for stale in ["v10", "v9"] {
        assert!(matches!(
            h.service.publish(b"{}".to_vec(), Some(stale.to_string())).await,
            Err(FleetError::StaleVersion { .. })
        ));
    }
    assert_eq!(h.service.current_bundle().await.unwrap().version, "v10");
}

#[tokio::test]
async fn test_register_is_idempotent_and_pushes_current_bundle() {
    let h = harness();
    h.service
        .publish(b"{}".to_vec(), Some("v1".to_string()))
        .await
        .unwrap();
    let applier = h.add_client("late").await;

    let first = h.service.register("late").await.unwrap();
    let second = h.service.register("late").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.last_applied_version.as_deref(), Some("v1"));
    assert_eq!(h.service.registrations().await.len(), 1);
    assert_eq!(applier.current_version().await.as_deref(), Some("v1"));
    assert_eq!(h.service.get_distribution_history().await.len(), 1);

    assert!(h.service.deregister("late").await);
    assert!(!h.service.deregister("late").await);
}

/// 传输途中篡改内容的客户端
struct TamperingClient {
    inner: Arc<LocalConfigClient>,
}

#[async_trait]
impl ConfigClient for TamperingClient {
    async fn apply(&self, node: &Node, bundle: &ConfigBundle) -> FleetResult<()> {
        let mut tampered = bundle.clone();
        tampered.content.extend_from_slice(b" ");
        self.inner.apply(node, &tampered).await
    }
}

#[tokio::test]
async fn test_tampered_delivery_is_recorded_as_failure() {
    let local = Arc::new(LocalConfigClient::new());
    let client: Arc<dyn ConfigClient> = Arc::new(TamperingClient {
        inner: local.clone(),
    });
    let h = harness_with_client(Some(client));
    h.topology
        .join(NodeDescriptor::new(
            "a",
            "http://a:8080",
            NodeRole::Client,
            Vec::<String>::new(),
        ))
        .await
        .unwrap();
    let applier = Arc::new(ConfigApplier::new("a"));
    local.attach(applier.clone()).await;

    h.service
        .publish(b"{}".to_vec(), Some("v1".to_string()))
        .await
        .unwrap();

    let history = h.service.get_distribution_history().await;
    assert!(!history[0].success);
    assert!(history[0].error.as_deref().unwrap().contains("校验和"));
    assert_eq!(applier.current_version().await, None);
}

/// 在节点上挂起，直到测试放行
struct GatedClient {
    inner: Arc<LocalConfigClient>,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl ConfigClient for GatedClient {
    async fn apply(&self, node: &Node, bundle: &ConfigBundle) -> FleetResult<()> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.apply(node, bundle).await
    }
}

#[tokio::test]
async fn test_client_leaving_mid_delivery_is_not_reregistered() {
    let local = Arc::new(LocalConfigClient::new());
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let client: Arc<dyn ConfigClient> = Arc::new(GatedClient {
        inner: local.clone(),
        entered: entered.clone(),
        release: release.clone(),
    });
    let h = harness_with_client(Some(client));
    h.topology
        .join(NodeDescriptor::new(
            "c1",
            "http://c1:8080",
            NodeRole::Client,
            Vec::<String>::new(),
        ))
        .await
        .unwrap();
    h.link.set_reachable("c1", None).await;
    local.attach(Arc::new(ConfigApplier::new("c1"))).await;

    let service = h.service.clone();
    let publishing =
        tokio::spawn(async move { service.publish(b"{}".to_vec(), Some("v1".to_string())).await });

    entered.notified().await;
    h.topology.leave("c1").await.unwrap();
    h.service.deregister("c1").await;
    release.notify_one();
    publishing.await.unwrap().unwrap();

    assert!(h.service.registrations().await.is_empty());
    let history = h.service.get_distribution_history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].node, "c1");
}

#[tokio::test]
async fn test_sync_to_unknown_node_is_rejected() {
    let h = harness();
    h.add_client("a").await;
    h.service
        .publish(b"{}".to_vec(), Some("v1".to_string()))
        .await
        .unwrap();

    assert!(matches!(
        h.service.sync_to("ghost").await,
        Err(FleetError::NodeNotFound { .. })
    ));
    assert!(h.service.registration("ghost").await.is_none());
    assert_eq!(h.service.get_distribution_history().await.len(), 1);
}

/// 保存指定版本时挂起，直到测试放行
struct GatedStore {
    gated_version: String,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl BundleStore for GatedStore {
    async fn load_bundle(&self) -> FleetResult<Option<ConfigBundle>> {
        Ok(None)
    }

    async fn save_bundle(&self, bundle: &ConfigBundle) -> FleetResult<()> {
        if bundle.version == self.gated_version {
            self.entered.notify_one();
            self.release.notified().await;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_register_during_publish_receives_newest_version() {
    let h = harness();
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let mut config = DistributionServiceConfig::new("control");
    config.apply_timeout = Duration::from_millis(500);
    let service = Arc::new(
        DistributionService::new(h.topology.clone(), h.local.clone(), h.audit.clone(), config)
            .with_store(Arc::new(GatedStore {
                gated_version: "v2".to_string(),
                entered: entered.clone(),
                release: release.clone(),
            })),
    );
    service
        .publish(b"{}".to_vec(), Some("v1".to_string()))
        .await
        .unwrap();

    let publisher = service.clone();
    let publishing =
        tokio::spawn(async move { publisher.publish(b"{}".to_vec(), Some("v2".to_string())).await });
    entered.notified().await;

    let registrar = service.clone();
    let registering = tokio::spawn(async move { registrar.register("late").await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    release.notify_one();

    publishing.await.unwrap().unwrap();
    registering.await.unwrap().unwrap();

    let deliveries: Vec<_> = service
        .get_distribution_history()
        .await
        .into_iter()
        .filter(|r| r.node == "late")
        .collect();
    assert!(!deliveries.is_empty());
    assert!(deliveries.iter().all(|r| r.version == "v2"));
}

#[tokio::test]
async fn test_sync_to_recovers_failed_client() {
    let h = harness();
    let applier = h.add_client("a").await;
    h.mark_unhealthy("a").await;
    h.service
        .publish(b"{}".to_vec(), Some("v1".to_string()))
        .await
        .unwrap();
    assert_eq!(applier.current_version().await, None);

    h.link.set_reachable("a", None).await;
    h.topology.probe_all().await;
    let record = h.service.sync_to("a").await.unwrap();

    assert!(record.success);
    assert_eq!(applier.current_version().await.as_deref(), Some("v1"));
    let registration = h.service.registration("a").await.unwrap();
    assert_eq!(registration.consecutive_failure_count, 0);
}

#[tokio::test]
async fn test_topology_listener_tracks_clients() {
    let h = harness();
    h.service
        .publish(b"{}".to_vec(), Some("v1".to_string()))
        .await
        .unwrap();

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(h.service.clone().run_topology_listener(shutdown_rx));
    // 等监听器订阅完成
    tokio::time::sleep(Duration::from_millis(50)).await;

    let applier = h.add_client("a").await;
    h.topology
        .join(NodeDescriptor::new(
            "full",
            "http://full:8080",
            NodeRole::Full,
            Vec::<String>::new(),
        ))
        .await
        .unwrap();

    let service = h.service.clone();
    eventually(|| {
        let service = service.clone();
        async move { service.registration("a").await.is_some() }
    })
    .await;
    eventually(|| {
        let applier = applier.clone();
        async move { applier.current_version().await.as_deref() == Some("v1") }
    })
    .await;
    assert!(h.service.registration("full").await.is_none());

    h.topology.leave("a").await.unwrap();
    let service = h.service.clone();
    eventually(|| {
        let service = service.clone();
        async move { service.registration("a").await.is_none() }
    })
    .await;
}

#[tokio::test]
async fn test_listener_resyncs_client_on_recovery() {
    let h = harness();
    let applier = h.add_client("a").await;
    h.mark_unhealthy("a").await;
    h.service
        .publish(b"{}".to_vec(), Some("v1".to_string()))
        .await
        .unwrap();

    let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(h.service.clone().run_topology_listener(shutdown_rx));
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.link.set_reachable("a", None).await;
    h.topology.probe_all().await;

    eventually(|| {
        let applier = applier.clone();
        async move { applier.current_version().await.as_deref() == Some("v1") }
    })
    .await;
}

#[tokio::test]
async fn test_bundle_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonBundleStore::in_dir(dir.path()));

    let h = harness();
    let service = DistributionService::new(
        h.topology.clone(),
        h.local.clone(),
        h.audit.clone(),
        DistributionServiceConfig::new("control"),
    )
    .with_store(store.clone());
    service
        .publish(br#"{"k":"v"}"#.to_vec(), Some("v7".to_string()))
        .await
        .unwrap();

    let restarted = DistributionService::new(
        h.topology.clone(),
        h.local.clone(),
        h.audit.clone(),
        DistributionServiceConfig::new("control"),
    )
    .with_store(store.clone());
    assert_eq!(restarted.restore().await.unwrap().as_deref(), Some("v7"));
    assert!(matches!(
        restarted.publish(b"{}".to_vec(), Some("v6".to_string())).await,
        Err(FleetError::StaleVersion { .. })
    ));

    // 客户端侧同样从存储恢复
    let client_dir = tempfile::tempdir().unwrap();
    let client_store = Arc::new(JsonBundleStore::in_dir(client_dir.path()));
    let settings = Arc::new(SettingsHandler::new());
    let applier = ConfigApplier::new("a")
        .with_handler(settings.clone())
        .with_store(client_store.clone());
    let bundle = store.load_bundle().await.unwrap().unwrap();
    applier.apply(&bundle).await.unwrap();

    let settings = Arc::new(SettingsHandler::new());
    let reloaded = ConfigApplier::new("a")
        .with_handler(settings.clone())
        .with_store(client_store);
    assert_eq!(reloaded.restore().await.unwrap().as_deref(), Some("v7"));
    assert_eq!(settings.settings()["k"], "v");
}
