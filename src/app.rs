use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use fleet_api::{create_app, AppState};
use fleet_core::{
    AppConfig, AuditSink, ExecutorRegistry, FleetError, FleetResult, HeartbeatAnnouncement,
    NodeDescriptor, NodeRole, WorkSource,
};
use fleet_distribution::{
    ConfigApplier, DistributionService, DistributionServiceConfig, SettingsHandler,
};
use fleet_infrastructure::{
    HttpConfigClient, HttpHeartbeatAnnouncer, HttpHeartbeatLink, JsonBundleStore,
    JsonLinesAuditSink, JsonNodeRegistryStore, SeedDiscovery, TracingAuditSink,
};
use fleet_queue::{WorkQueueConfig, WorkQueueProducer};
use fleet_supervisor::{SupervisionPolicy, Supervisor};
use fleet_topology::{TopologyManager, TopologyManagerConfig};
use fleet_worker::{HttpWorkSource, ShellExecutor, WorkConsumer, WorkConsumerConfig};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// 控制平面发布的配置包单独存放，避免和客户端侧已应用的配置包混在一起
const PUBLISHED_BUNDLE_FILE: &str = "published_bundle.json";

/// 一个节点进程
///
/// 按角色装配组件：完整节点运行拓扑管理、工作队列和配置分发，客户端节点
/// 只应用下发的配置并向种子节点上报心跳。所有长期运行的循环都交给监督者。
pub struct Application {
    config: AppConfig,
    node: NodeDescriptor,
    supervisor: Arc<Supervisor>,
    topology: Option<Arc<TopologyManager>>,
    queue: Option<Arc<WorkQueueProducer>>,
    distribution: Option<Arc<DistributionService>>,
    applier: Option<Arc<ConfigApplier>>,
    settings: Option<Arc<SettingsHandler>>,
    consumer: Option<Arc<WorkConsumer>>,
}

impl Application {
    /// 创建新的应用实例并从数据目录恢复状态
    pub async fn new(config: AppConfig) -> Result<Self> {
        let node = node_descriptor(&config)?;
        info!("初始化节点 {}，角色: {:?}", node.id, node.role);

        let data_dir = PathBuf::from(&config.storage.data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("创建数据目录失败: {}", data_dir.display()))?;

        let audit: Arc<dyn AuditSink> = match &config.storage.audit_log {
            Some(path) => Arc::new(JsonLinesAuditSink::new(path)),
            None => Arc::new(TracingAuditSink),
        };

        let supervisor = Arc::new(Supervisor::new(SupervisionPolicy::from_config(
            &config.supervisor,
        )));

        let mut app = Self {
            config,
            node,
            supervisor,
            topology: None,
            queue: None,
            distribution: None,
            applier: None,
            settings: None,
            consumer: None,
        };

        match app.node.role {
            NodeRole::Full => app.build_control_plane(audit, &data_dir).await?,
            NodeRole::Client => app.build_client(&data_dir).await?,
        }
        if app.config.worker.enabled {
            app.build_consumer().await?;
        }

        Ok(app)
    }

    async fn build_control_plane(&mut self, audit: Arc<dyn AuditSink>, data_dir: &Path) -> Result<()> {
        let topology_config = &self.config.topology;
        let mut topology = TopologyManager::new(
            Arc::new(HttpHeartbeatLink::new()),
            audit.clone(),
            TopologyManagerConfig::from_config(topology_config),
        )
        .with_store(Arc::new(JsonNodeRegistryStore::in_dir(data_dir)));
        if !topology_config.seeds.is_empty() {
            topology = topology.with_discovery(Arc::new(SeedDiscovery::new(
                topology_config.seeds.clone(),
                Duration::from_secs(topology_config.probe_timeout_seconds),
            )));
        }
        let topology = Arc::new(topology);

        let restored = topology.restore().await.context("恢复节点注册表失败")?;
        debug!("恢复了 {} 个节点", restored);
        topology
            .join(self.node.clone())
            .await
            .context("本节点加入拓扑失败")?;

        let queue = Arc::new(WorkQueueProducer::new(
            topology.clone(),
            audit.clone(),
            WorkQueueConfig::from_config(&self.config.queue),
        ));

        let distribution = Arc::new(
            DistributionService::new(
                topology.clone(),
                Arc::new(HttpConfigClient::new()),
                audit,
                DistributionServiceConfig::from_config(
                    self.node.id.clone(),
                    &self.config.distribution,
                ),
            )
            .with_store(Arc::new(JsonBundleStore::new(
                data_dir.join(PUBLISHED_BUNDLE_FILE),
            ))),
        );
        if let Some(version) = distribution
            .restore()
            .await
            .context("恢复已发布的配置失败")?
        {
            info!("当前发布的配置版本: {}", version);
        }

        self.topology = Some(topology);
        self.queue = Some(queue);
        self.distribution = Some(distribution);
        Ok(())
    }

    async fn build_client(&mut self, data_dir: &Path) -> Result<()> {
        let settings = Arc::new(SettingsHandler::new());
        let applier = Arc::new(
            ConfigApplier::new(self.node.id.clone())
                .with_handler(settings.clone())
                .with_store(Arc::new(JsonBundleStore::in_dir(data_dir))),
        );
        // 本地配置损坏时从空配置开始，等待控制平面重新下发
        match applier.restore().await {
            Ok(Some(version)) => info!("客户端恢复配置版本 {}", version),
            Ok(None) => debug!("本地没有已应用的配置"),
            Err(e) => warn!("恢复本地配置失败，等待重新下发: {}", e),
        }

        self.applier = Some(applier);
        self.settings = Some(settings);
        Ok(())
    }

    async fn build_consumer(&mut self) -> Result<()> {
        let worker_config = &self.config.worker;
        let executors = Arc::new(ExecutorRegistry::new());
        executors
            .register(Arc::new(ShellExecutor::new(Duration::from_secs(
                worker_config.shell_timeout_seconds,
            ))))
            .await;

        let source: Arc<dyn WorkSource> = match (&worker_config.producer_url, &self.queue) {
            (Some(url), _) => Arc::new(HttpWorkSource::new(url)),
            (None, Some(queue)) => queue.clone() as Arc<dyn WorkSource>,
            (None, None) => match self.config.topology.seeds.first() {
                Some(seed) => Arc::new(HttpWorkSource::new(seed)),
                None => {
                    return Err(anyhow::anyhow!(
                        "客户端节点启用Worker时需要配置 worker.producer_url 或种子节点"
                    ))
                }
            },
        };

        self.consumer = Some(Arc::new(WorkConsumer::new(
            source,
            executors,
            WorkConsumerConfig::from_config(self.node.id.clone(), worker_config),
        )));
        Ok(())
    }

    /// 把所有长期运行的循环交给监督者启动
    pub async fn start(&self) -> Result<()> {
        let supervisor = &self.supervisor;

        if let Some(topology) = &self.topology {
            let t = topology.clone();
            supervisor
                .spawn("topology-heartbeat", move |rx| t.clone().run_heartbeat_loop(rx))
                .await;
            if !self.config.topology.seeds.is_empty() {
                let t = topology.clone();
                supervisor
                    .spawn("topology-discovery", move |rx| t.clone().run_discovery_loop(rx))
                    .await;
            }
        }

        if let Some(queue) = &self.queue {
            let q = queue.clone();
            supervisor
                .spawn("queue-topology-listener", move |rx| q.clone().run_topology_listener(rx))
                .await;
            let q = queue.clone();
            supervisor
                .spawn("queue-maintenance", move |rx| q.clone().run_maintenance_loop(rx))
                .await;
        }

        if let Some(distribution) = &self.distribution {
            let d = distribution.clone();
            supervisor
                .spawn("distribution-topology-listener", move |rx| {
                    d.clone().run_topology_listener(rx)
                })
                .await;
        }

        if let Some(consumer) = &self.consumer {
            let c = consumer.clone();
            supervisor
                .spawn("work-consumer", move |rx| c.clone().run(rx))
                .await;
        }

        if self.node.role == NodeRole::Client && !self.config.topology.seeds.is_empty() {
            let announcer = Arc::new(HttpHeartbeatAnnouncer::new(
                self.config.topology.seeds.clone(),
                Duration::from_secs(self.config.topology.probe_timeout_seconds),
            ));
            let node = self.node.clone();
            let consumer = self.consumer.clone();
            let interval = Duration::from_secs(self.config.topology.heartbeat_interval_seconds);
            supervisor
                .spawn("heartbeat-announcer", move |rx| {
                    run_announcer(
                        announcer.clone(),
                        node.clone(),
                        consumer.clone(),
                        interval,
                        rx,
                    )
                })
                .await;
        }

        if self.config.api.enabled {
            let state = self.app_state();
            let bind_address = self.config.api.bind_address.clone();
            let cors_enabled = self.config.api.cors_enabled;
            supervisor
                .spawn("api-server", move |rx| {
                    serve_api(state.clone(), bind_address.clone(), cors_enabled, rx)
                })
                .await;
        }

        info!("节点 {} 已启动", self.node.id);
        Ok(())
    }

    /// 路由共享状态
    pub fn app_state(&self) -> AppState {
        let mut state = AppState::new(self.node.clone()).with_supervisor(self.supervisor.clone());
        if let Some(topology) = &self.topology {
            state = state.with_topology(topology.clone());
        }
        if let Some(queue) = &self.queue {
            state = state.with_queue(queue.clone());
        }
        if let Some(distribution) = &self.distribution {
            state = state.with_distribution(distribution.clone());
        }
        if let Some(applier) = &self.applier {
            state = state.with_applier(applier.clone());
        }
        if let Some(consumer) = &self.consumer {
            state = state.with_consumer(consumer.clone());
        }
        state
    }

    /// 停止所有受监督进程，返回是否在超时前全部停止
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        info!("开始关闭节点 {}", self.node.id);
        self.supervisor.shutdown(timeout).await
    }

    pub fn node(&self) -> &NodeDescriptor {
        &self.node
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn topology(&self) -> Option<&Arc<TopologyManager>> {
        self.topology.as_ref()
    }

    pub fn queue(&self) -> Option<&Arc<WorkQueueProducer>> {
        self.queue.as_ref()
    }

    pub fn distribution(&self) -> Option<&Arc<DistributionService>> {
        self.distribution.as_ref()
    }

    pub fn applier(&self) -> Option<&Arc<ConfigApplier>> {
        self.applier.as_ref()
    }

    /// 客户端节点当前生效的配置项
    pub fn settings(&self) -> Option<&Arc<SettingsHandler>> {
        self.settings.as_ref()
    }

    pub fn consumer(&self) -> Option<&Arc<WorkConsumer>> {
        self.consumer.as_ref()
    }
}

/// 节点身份，配置中未指定ID时使用主机名
pub fn node_descriptor(config: &AppConfig) -> Result<NodeDescriptor> {
    let id = if config.node.id.trim().is_empty() {
        hostname::get()
            .context("获取主机名失败")?
            .to_string_lossy()
            .into_owned()
    } else {
        config.node.id.trim().to_string()
    };

    Ok(NodeDescriptor::new(
        &id,
        &config.node.address,
        config.node.role,
        config.node.capabilities.iter().cloned(),
    ))
}

/// 客户端节点定期向种子节点上报心跳，顺带报告当前负载
async fn run_announcer(
    announcer: Arc<HttpHeartbeatAnnouncer>,
    node: NodeDescriptor,
    consumer: Option<Arc<WorkConsumer>>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> FleetResult<()> {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let announcement = HeartbeatAnnouncement {
                    descriptor: node.clone(),
                    active_item_count: consumer.as_ref().map(|c| c.in_flight() as u32),
                    timestamp: Utc::now(),
                };
                if announcer.announce(&announcement).await == 0 {
                    warn!("心跳未送达任何种子节点");
                }
            }
            _ = shutdown.recv() => {
                info!("收到停止信号，退出心跳上报循环");
                return Ok(());
            }
        }
    }
}

async fn serve_api(
    state: AppState,
    bind_address: String,
    cors_enabled: bool,
    mut shutdown: broadcast::Receiver<()>,
) -> FleetResult<()> {
    let listener = TcpListener::bind(&bind_address)
        .await
        .map_err(|e| FleetError::Network(format!("绑定API地址 {bind_address} 失败: {e}")))?;
    info!("API服务器监听于 {}", bind_address);

    axum::serve(listener, create_app(state, cors_enabled))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("API服务器正在关闭");
        })
        .await
        .map_err(|e| FleetError::Internal(format!("API服务器异常退出: {e}")))
}
