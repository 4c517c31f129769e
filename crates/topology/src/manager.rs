use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::{
    config::TopologyConfig, emit_audit, event_types, AuditSink, Discovery, FleetError,
    FleetResult, HeartbeatAnnouncement, HeartbeatLink, Node, NodeDescriptor, NodeId,
    NodeRegistryStore, NodeStatus, ProbeReport, TopologyEvent, TopologySnapshot,
};
use futures::future::join_all;
use metrics::{counter, gauge};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::routing::select_least_loaded;

/// 拓扑管理配置
#[derive(Debug, Clone)]
pub struct TopologyManagerConfig {
    /// 心跳探测间隔
    pub heartbeat_interval: Duration,
    /// 距上次成功心跳超过该时长且探测失败时，节点被标记为不健康
    pub unhealthy_timeout: Duration,
    /// 发现扫描间隔
    pub discovery_interval: Duration,
    /// 单次探测超时
    pub probe_timeout: Duration,
    /// 事件通道容量
    pub event_capacity: usize,
}

impl Default for TopologyManagerConfig {
    fn default() -> Self {
        Self::from_heartbeat_interval(Duration::from_secs(15))
    }
}

impl TopologyManagerConfig {
    /// 不健康超时取心跳间隔的2倍，发现间隔取4倍
    pub fn from_heartbeat_interval(heartbeat_interval: Duration) -> Self {
        Self {
            heartbeat_interval,
            unhealthy_timeout: heartbeat_interval * 2,
            discovery_interval: heartbeat_interval * 4,
            probe_timeout: Duration::from_secs(3),
            event_capacity: 256,
        }
    }

    pub fn from_config(config: &TopologyConfig) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds),
            unhealthy_timeout: Duration::from_secs(config.unhealthy_timeout()),
            discovery_interval: Duration::from_secs(config.discovery_interval()),
            probe_timeout: Duration::from_secs(config.probe_timeout_seconds),
            event_capacity: 256,
        }
    }
}

/// 一轮探测的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub probed: usize,
    pub failed: usize,
    pub became_unhealthy: Vec<NodeId>,
    pub became_healthy: Vec<NodeId>,
}

#[derive(Default)]
struct TopologyState {
    nodes: BTreeMap<NodeId, Node>,
    revision: u64,
}

/// 集群拓扑管理器
///
/// 维护节点成员、健康状态和负载，是"谁存活、谁可路由"的唯一来源。
/// 每次变化都会生成新的不可变快照（watch 通道），成员和健康变化按检测顺序
/// 以事件形式广播给工作队列和配置分发服务。
pub struct TopologyManager {
    state: RwLock<TopologyState>,
    link: Arc<dyn HeartbeatLink>,
    discovery: Option<Arc<dyn Discovery>>,
    store: Option<Arc<dyn NodeRegistryStore>>,
    audit: Arc<dyn AuditSink>,
    events: broadcast::Sender<TopologyEvent>,
    snapshot_tx: watch::Sender<Arc<TopologySnapshot>>,
    persist_lock: Mutex<()>,
    config: TopologyManagerConfig,
}

impl TopologyManager {
    pub fn new(
        link: Arc<dyn HeartbeatLink>,
        audit: Arc<dyn AuditSink>,
        config: TopologyManagerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (snapshot_tx, _) = watch::channel(Arc::new(TopologySnapshot::default()));
        Self {
            state: RwLock::new(TopologyState::default()),
            link,
            discovery: None,
            store: None,
            audit,
            events,
            snapshot_tx,
            persist_lock: Mutex::new(()),
            config,
        }
    }

    pub fn with_discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn NodeRegistryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &TopologyManagerConfig {
        &self.config
    }

    /// 订阅拓扑事件
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.events.subscribe()
    }

    /// 订阅拓扑快照
    pub fn watch(&self) -> watch::Receiver<Arc<TopologySnapshot>> {
        self.snapshot_tx.subscribe()
    }

    /// 最新的拓扑快照
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    /// 节点 -> 健康状态
    pub fn get_topology(&self) -> BTreeMap<NodeId, NodeStatus> {
        self.snapshot().statuses()
    }

    pub fn nodes(&self) -> Vec<Node> {
        self.snapshot().nodes.values().cloned().collect()
    }

    pub fn node(&self, id: &str) -> Option<Node> {
        self.snapshot().node(id).cloned()
    }

    /// 选择满足能力要求且负载最低的健康节点
    pub fn route_to(&self, required_capabilities: &BTreeSet<String>) -> Option<Node> {
        let snapshot = self.snapshot();
        select_least_loaded(snapshot.nodes.values(), required_capabilities).cloned()
    }

    /// 显式加入（或重新加入）集群
    pub async fn join(&self, descriptor: NodeDescriptor) -> FleetResult<Node> {
        self.upsert(descriptor, None).await
    }

    /// 处理节点主动上报的心跳，未知节点会被加入
    pub async fn record_heartbeat(&self, announcement: HeartbeatAnnouncement) -> FleetResult<Node> {
        self.upsert(announcement.descriptor, announcement.active_item_count)
            .await
    }

    async fn upsert(&self, descriptor: NodeDescriptor, load: Option<u32>) -> FleetResult<Node> {
        if descriptor.id.trim().is_empty() {
            return Err(FleetError::invalid_argument("节点ID不能为空"));
        }

        let now = Utc::now();
        let (node, joined, membership_changed) = {
            let mut state = self.state.write().await;
            let mut events = Vec::new();

            let (node, joined, membership_changed) = match state.nodes.get_mut(&descriptor.id) {
                Some(existing) => {
                    let descriptor_changed = existing.descriptor() != descriptor;
                    existing.update_descriptor(descriptor);
                    if let Some(status) = record_success(existing, load, now) {
                        events.push(TopologyEvent::HealthChanged {
                            node_id: existing.id.clone(),
                            status,
                        });
                    }
                    (existing.clone(), false, descriptor_changed)
                }
                None => {
                    let mut node = Node::new(descriptor);
                    if let Some(count) = load {
                        node.load.active_item_count = count;
                    }
                    state.nodes.insert(node.id.clone(), node.clone());
                    events.push(TopologyEvent::NodeJoined { node: node.clone() });
                    (node, true, true)
                }
            };

            self.publish(&mut state, events);
            (node, joined, membership_changed)
        };

        if joined {
            info!("节点 {} 加入集群 (地址: {}, 角色: {:?})", node.id, node.address, node.role);
            emit_audit(
                self.audit.as_ref(),
                event_types::NODE_JOINED,
                serde_json::json!({
                    "node": node.id,
                    "address": node.address,
                    "role": node.role,
                    "capabilities": node.capabilities,
                }),
            )
            .await;
        }
        if membership_changed {
            self.persist().await;
        }

        Ok(node)
    }

    /// 显式离开集群，只有这里会删除节点记录
    pub async fn leave(&self, node_id: &str) -> FleetResult<Node> {
        let node = {
            let mut state = self.state.write().await;
            let node = state
                .nodes
                .remove(node_id)
                .ok_or_else(|| FleetError::node_not_found(node_id))?;
            self.publish(
                &mut state,
                vec![TopologyEvent::NodeLeft {
                    node_id: node.id.clone(),
                }],
            );
            node
        };

        info!("节点 {} 离开集群", node.id);
        emit_audit(
            self.audit.as_ref(),
            event_types::NODE_LEFT,
            serde_json::json!({ "node": node.id }),
        )
        .await;
        self.persist().await;

        Ok(node)
    }

    /// 更新节点负载，不产生事件
    pub async fn report_load(&self, node_id: &str, active_item_count: u32) -> FleetResult<()> {
        let mut state = self.state.write().await;
        let node = state
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| FleetError::node_not_found(node_id))?;
        if node.load.active_item_count != active_item_count {
            node.load.active_item_count = active_item_count;
            self.publish(&mut state, Vec::new());
        }
        Ok(())
    }

    /// 从持久化存储恢复节点注册表
    ///
    /// 恢复的节点一律先标记为不健康，等待第一次成功探测
    pub async fn restore(&self) -> FleetResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let nodes = store.load_nodes().await?;
        let count = nodes.len();
        {
            let mut state = self.state.write().await;
            for mut node in nodes {
                node.status = NodeStatus::Unhealthy;
                node.consecutive_probe_failures = 0;
                node.load = Default::default();
                state.nodes.insert(node.id.clone(), node);
            }
            self.publish(&mut state, Vec::new());
        }

        info!("从存储恢复了 {} 个节点", count);
        Ok(count)
    }

    /// 并发探测所有已知节点，单个探测失败不影响其他节点
    pub async fn probe_all(&self) -> ProbeSummary {
        let targets: Vec<NodeDescriptor> = self
            .snapshot()
            .nodes
            .values()
            .map(Node::descriptor)
            .collect();

        if targets.is_empty() {
            return ProbeSummary::default();
        }

        let probe_timeout = self.config.probe_timeout;
        let probes = targets.iter().map(|descriptor| async move {
            let outcome = match tokio::time::timeout(probe_timeout, self.link.probe(descriptor)).await
            {
                Ok(result) => result,
                Err(_) => Err(FleetError::Timeout(format!(
                    "探测节点 {} 超过 {:?}",
                    descriptor.id, probe_timeout
                ))),
            };
            (descriptor.id.clone(), outcome)
        });
        let outcomes = join_all(probes).await;

        let now = Utc::now();
        let unhealthy_timeout = chrono::Duration::from_std(self.config.unhealthy_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(365));

        let mut summary = ProbeSummary {
            probed: outcomes.len(),
            ..Default::default()
        };

        {
            let mut state = self.state.write().await;
            let mut events = Vec::new();

            for (node_id, outcome) in &outcomes {
                // 探测期间节点可能已经离开
                let Some(node) = state.nodes.get_mut(node_id) else {
                    continue;
                };

                if let Err(e) = outcome {
                    summary.failed += 1;
                    debug!("探测节点 {} 失败: {}", node_id, e);
                }

                if let Some(status) = evaluate_probe(node, outcome, now, unhealthy_timeout) {
                    match status {
                        NodeStatus::Healthy => {
                            info!("节点 {} 恢复健康", node_id);
                            summary.became_healthy.push(node_id.clone());
                        }
                        NodeStatus::Unhealthy => {
                            warn!(
                                "节点 {} 被标记为不健康 (连续失败 {} 次, 上次心跳: {})",
                                node_id,
                                node.consecutive_probe_failures,
                                node.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
                            );
                            summary.became_unhealthy.push(node_id.clone());
                        }
                    }
                    events.push(TopologyEvent::HealthChanged {
                        node_id: node_id.clone(),
                        status,
                    });
                }
            }

            self.publish(&mut state, events);
        }

        if summary.failed > 0 {
            counter!("fleet_topology_probe_failures_total").increment(summary.failed as u64);
        }
        summary
    }

    /// 执行一次发现扫描，自动加入新发现的节点
    pub async fn discover_once(&self) -> FleetResult<Vec<NodeId>> {
        let Some(discovery) = &self.discovery else {
            return Ok(Vec::new());
        };

        let found = discovery.discover().await?;
        let snapshot = self.snapshot();
        let mut joined = Vec::new();

        for descriptor in found {
            if snapshot.node(&descriptor.id).is_some() {
                continue;
            }
            let id = descriptor.id.clone();
            match self.join(descriptor).await {
                Ok(_) => joined.push(id),
                Err(e) => warn!("自动加入发现的节点 {} 失败: {}", id, e),
            }
        }

        if !joined.is_empty() {
            info!("发现扫描加入了 {} 个新节点: {:?}", joined.len(), joined);
        }
        Ok(joined)
    }

    /// 心跳探测循环，直到收到停机信号
    pub async fn run_heartbeat_loop(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> FleetResult<()> {
        info!("启动心跳探测循环，间隔 {:?}", self.config.heartbeat_interval);
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let summary = self.probe_all().await;
                    debug!(
                        "完成一轮心跳探测: 探测 {} 个节点, 失败 {} 个",
                        summary.probed, summary.failed
                    );
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出心跳探测循环");
                    return Ok(());
                }
            }
        }
    }

    /// 发现扫描循环
    pub async fn run_discovery_loop(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> FleetResult<()> {
        if self.discovery.is_none() {
            debug!("未配置发现来源，跳过发现扫描");
            return Ok(());
        }

        info!("启动发现扫描循环，间隔 {:?}", self.config.discovery_interval);
        let mut interval = tokio::time::interval(self.config.discovery_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.discover_once().await {
                        error!("发现扫描时出错: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出发现扫描循环");
                    return Ok(());
                }
            }
        }
    }

    /// 在持有写锁的情况下发布新快照和事件，保证事件顺序与检测顺序一致
    fn publish(&self, state: &mut TopologyState, events: Vec<TopologyEvent>) {
        state.revision += 1;
        let snapshot = Arc::new(TopologySnapshot {
            revision: state.revision,
            nodes: state.nodes.clone(),
        });

        gauge!("fleet_topology_nodes").set(snapshot.len() as f64);
        gauge!("fleet_topology_healthy_nodes").set(snapshot.healthy_nodes().count() as f64);

        self.snapshot_tx.send_replace(snapshot);
        for event in events {
            // 没有订阅者时发送失败是正常的
            let _ = self.events.send(event);
        }
    }

    /// 保存最新的节点表，持久化失败只记录日志
    async fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };

        let _guard = self.persist_lock.lock().await;
        let nodes: Vec<Node> = self.snapshot().nodes.values().cloned().collect();
        if let Err(e) = store.save_nodes(&nodes).await {
            error!("保存节点注册表失败: {}", e);
        }
    }
}

/// 记录一次成功的心跳，返回变化后的状态（如果发生了变化）
fn record_success(node: &mut Node, load: Option<u32>, now: DateTime<Utc>) -> Option<NodeStatus> {
    node.last_heartbeat = now;
    node.consecutive_probe_failures = 0;
    if let Some(count) = load {
        node.load.active_item_count = count;
    }
    if node.is_healthy() {
        None
    } else {
        node.status = NodeStatus::Healthy;
        Some(NodeStatus::Healthy)
    }
}

/// 根据探测结果更新节点，返回变化后的状态（如果发生了变化）
///
/// 一次成功即恢复健康；失败只累加计数，距上次成功心跳达到不健康超时才翻转
fn evaluate_probe(
    node: &mut Node,
    outcome: &FleetResult<ProbeReport>,
    now: DateTime<Utc>,
    unhealthy_timeout: chrono::Duration,
) -> Option<NodeStatus> {
    match outcome {
        Ok(report) => record_success(node, report.active_item_count, now),
        Err(_) => {
            node.consecutive_probe_failures += 1;
            if node.is_healthy() && node.is_heartbeat_expired(now, unhealthy_timeout) {
                node.status = NodeStatus::Unhealthy;
                Some(NodeStatus::Unhealthy)
            } else {
                None
            }
        }
    }
}
