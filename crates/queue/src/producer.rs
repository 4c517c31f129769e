use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{
    config::QueueConfig, emit_audit, event_types, payload_digest, AuditSink, FleetError,
    FleetResult, ItemId, Node, NodeId, NodeStatus, QueueStatus, TopologyEvent, WorkItem,
    WorkSource,
};
use fleet_topology::TopologyManager;
use metrics::{counter, gauge, histogram};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::priority::PriorityTable;

const CANCELLED_ERROR: &str = "cancelled";
const REQUEUE_LIMIT_ERROR: &str = "requeue limit exceeded";

/// 工作队列配置
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// 已完成/失败工作项的历史容量
    pub history_capacity: usize,
    /// 历史记录保留时长
    pub history_retention: Duration,
    /// 重新入队次数上限，None 表示不限制
    pub max_requeues: Option<u32>,
    /// 历史清理间隔
    pub maintenance_interval: Duration,
    pub priorities: PriorityTable,
    /// 工作项类型 -> 消费节点必须具备的能力
    pub required_capabilities: BTreeMap<String, BTreeSet<String>>,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            history_retention: Duration::from_secs(3600),
            max_requeues: None,
            maintenance_interval: Duration::from_secs(60),
            priorities: PriorityTable::default(),
            required_capabilities: BTreeMap::new(),
        }
    }
}

impl WorkQueueConfig {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            history_capacity: config.history_capacity,
            history_retention: Duration::from_secs(config.history_retention_seconds),
            max_requeues: config.max_requeues,
            maintenance_interval: Duration::from_secs(config.maintenance_interval_seconds),
            priorities: PriorityTable::new(config.priorities.clone()),
            required_capabilities: config.required_capabilities.clone(),
        }
    }
}

struct QueueEntry {
    item: WorkItem,
    /// 提交序号，同优先级内按此先进先出
    seq: u64,
}

#[derive(Default)]
struct QueueState {
    /// 待处理和处理中的工作项
    items: HashMap<ItemId, QueueEntry>,
    /// (优先级等级, 提交序号) -> 工作项
    pending: BTreeMap<(u8, u64), ItemId>,
    active_by_node: HashMap<NodeId, BTreeSet<ItemId>>,
    history: VecDeque<WorkItem>,
    next_seq: u64,
    total_submitted: u64,
    completed_count: u64,
    failed_count: u64,
    avg_duration_ms: f64,
    duration_samples: u64,
}

impl QueueState {
    fn status(&self) -> QueueStatus {
        QueueStatus {
            pending_count: self.pending.len(),
            active_count: self.items.len() - self.pending.len(),
            completed_count: self.completed_count,
            failed_count: self.failed_count,
            avg_duration_ms: self.avg_duration_ms,
            total_submitted: self.total_submitted,
        }
    }

    fn active_count_for(&self, node_id: &str) -> u32 {
        self.active_by_node
            .get(node_id)
            .map(|items| items.len() as u32)
            .unwrap_or(0)
    }

    /// 取出处理中的工作项并解除与节点的关联
    fn take_active(&mut self, item_id: &str) -> FleetResult<WorkItem> {
        match self.items.get(item_id) {
            Some(entry) if entry.item.is_active() => {}
            _ => return Err(FleetError::item_not_found(item_id)),
        }
        let entry = self
            .items
            .remove(item_id)
            .ok_or_else(|| FleetError::item_not_found(item_id))?;

        if let Some(node) = entry.item.assigned_node.as_deref() {
            if let Some(active) = self.active_by_node.get_mut(node) {
                active.remove(item_id);
                if active.is_empty() {
                    self.active_by_node.remove(node);
                }
            }
        }
        Ok(entry.item)
    }

    fn archive(&mut self, item: WorkItem, capacity: usize) {
        self.history.push_back(item);
        while self.history.len() > capacity {
            self.history.pop_front();
        }
    }

    /// 滚动平均: new = (old * n + sample) / (n + 1)
    fn record_duration(&mut self, duration_ms: u64) {
        let n = self.duration_samples as f64;
        self.avg_duration_ms = (self.avg_duration_ms * n + duration_ms as f64) / (n + 1.0);
        self.duration_samples += 1;
    }
}

/// 已解决工作项的审计信息
struct Resolution {
    item: WorkItem,
    node: Option<NodeId>,
    node_load: Option<u32>,
}

/// 工作队列生产者
///
/// 持有待处理和处理中的工作项，响应消费者的拉取请求。只有在最新拓扑快照中
/// 健康的节点可以领取工作项；节点变为不健康或离开时，其处理中的工作项
/// 被原子地放回待处理队列。
pub struct WorkQueueProducer {
    state: Mutex<QueueState>,
    available: Notify,
    topology: Arc<TopologyManager>,
    audit: Arc<dyn AuditSink>,
    config: WorkQueueConfig,
}

impl WorkQueueProducer {
    pub fn new(
        topology: Arc<TopologyManager>,
        audit: Arc<dyn AuditSink>,
        config: WorkQueueConfig,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            topology,
            audit,
            config,
        }
    }

    /// 提交工作项，优先级由类型决定
    pub async fn submit(&self, item_type: &str, payload: serde_json::Value) -> FleetResult<ItemId> {
        if item_type.trim().is_empty() {
            return Err(FleetError::invalid_argument("工作项类型不能为空"));
        }

        let priority = self.config.priorities.priority_for(item_type);
        let item = WorkItem::new(item_type, payload, priority);
        let item_id = item.id.clone();
        let digest = payload_digest(&item.payload);

        {
            let mut state = self.state.lock().await;
            let seq = state.next_seq;
            state.next_seq += 1;
            state.total_submitted += 1;
            state.pending.insert((priority.rank(), seq), item_id.clone());
            state.items.insert(item_id.clone(), QueueEntry { item, seq });
            self.update_gauges(&state);
        }
        self.available.notify_waiters();

        counter!("fleet_queue_submitted_total").increment(1);
        debug!("提交工作项 {} (类型: {}, 优先级: {:?})", item_id, item_type, priority);
        emit_audit(
            self.audit.as_ref(),
            event_types::ITEM_SUBMITTED,
            serde_json::json!({
                "item_id": item_id,
                "item_type": item_type,
                "priority": priority,
                "payload_sha256": digest,
            }),
        )
        .await;

        Ok(item_id)
    }

    /// 为消费节点拉取最多 `max_count` 个工作项
    ///
    /// 没有可领取的工作项时挂起，直到有新工作项或等待超时（返回空批次）。
    /// 未知或不健康的节点返回 `NodeUnavailable`。
    pub async fn request_items(
        &self,
        node_id: &str,
        max_count: usize,
        wait: Duration,
    ) -> FleetResult<Vec<WorkItem>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + wait;
        loop {
            // 先登记等待再检查队列，避免错过检查和等待之间的通知
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = {
                let mut state = self.state.lock().await;
                // 持有队列锁后再读取快照，健康状态变更后的回收由 reconcile 兜底
                let snapshot = self.topology.snapshot();
                let node = snapshot
                    .node(node_id)
                    .filter(|n| n.is_healthy())
                    .ok_or_else(|| FleetError::node_unavailable(node_id))?;

                let selected = self.select_eligible(&state, node, max_count);
                if selected.is_empty() {
                    Vec::new()
                } else {
                    // 先上报负载再分配，分配之后不再有挂起点
                    let load = state.active_count_for(node_id) + selected.len() as u32;
                    self.report_load(node_id, load).await;
                    let batch = Self::assign_selected(&mut state, node, selected);
                    self.update_gauges(&state);
                    batch
                }
            };

            if !batch.is_empty() {
                debug!("向节点 {} 分配了 {} 个工作项", node_id, batch.len());
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// 按优先级和提交顺序挑选节点能处理的工作项；不满足能力要求的保持原位
    fn select_eligible(
        &self,
        state: &QueueState,
        node: &Node,
        max_count: usize,
    ) -> Vec<((u8, u64), ItemId)> {
        state
            .pending
            .iter()
            .filter(|(_, item_id)| {
                state
                    .items
                    .get(*item_id)
                    .is_some_and(|entry| self.can_consume(node, &entry.item.item_type))
            })
            .take(max_count)
            .map(|(key, item_id)| (*key, item_id.clone()))
            .collect()
    }

    fn assign_selected(
        state: &mut QueueState,
        node: &Node,
        selected: Vec<((u8, u64), ItemId)>,
    ) -> Vec<WorkItem> {
        let now = Utc::now();
        let mut batch = Vec::with_capacity(selected.len());
        for (key, item_id) in selected {
            state.pending.remove(&key);
            if let Some(entry) = state.items.get_mut(&item_id) {
                entry.item.assign(&node.id, now);
                batch.push(entry.item.clone());
            }
            state
                .active_by_node
                .entry(node.id.clone())
                .or_default()
                .insert(item_id);
        }
        batch
    }

    fn can_consume(&self, node: &Node, item_type: &str) -> bool {
        self.config
            .required_capabilities
            .get(item_type)
            .map_or(true, |required| node.has_capabilities(required))
    }

    /// 上报工作项完成
    pub async fn report_completion(
        &self,
        item_id: &str,
        result: serde_json::Value,
        duration_ms: u64,
    ) -> FleetResult<()> {
        let resolution = {
            let mut state = self.state.lock().await;
            let mut item = state.take_active(item_id)?;
            item.complete(result, duration_ms, Utc::now());
            state.completed_count += 1;
            state.record_duration(duration_ms);
            let resolution = self.resolve(&mut state, item);
            self.update_gauges(&state);
            resolution
        };

        counter!("fleet_queue_completed_total").increment(1);
        histogram!("fleet_queue_item_duration_ms").record(duration_ms as f64);
        debug!("工作项 {} 已完成，耗时 {}ms", item_id, duration_ms);

        emit_audit(
            self.audit.as_ref(),
            event_types::ITEM_COMPLETED,
            serde_json::json!({
                "item_id": resolution.item.id,
                "item_type": resolution.item.item_type,
                "node": resolution.node,
                "duration_ms": duration_ms,
            }),
        )
        .await;
        self.report_resolution_load(&resolution).await;
        Ok(())
    }

    /// 上报工作项失败
    pub async fn report_failure(&self, item_id: &str, error: &str) -> FleetResult<()> {
        let resolution = {
            let mut state = self.state.lock().await;
            let mut item = state.take_active(item_id)?;
            item.fail(error, Utc::now());
            state.failed_count += 1;
            let resolution = self.resolve(&mut state, item);
            self.update_gauges(&state);
            resolution
        };

        counter!("fleet_queue_failed_total").increment(1);
        warn!("工作项 {} 执行失败: {}", item_id, error);

        self.audit_failure(&resolution.item, resolution.node.as_deref())
            .await;
        self.report_resolution_load(&resolution).await;
        Ok(())
    }

    fn resolve(&self, state: &mut QueueState, item: WorkItem) -> Resolution {
        let node = item.assigned_node.clone();
        let node_load = node.as_deref().map(|n| state.active_count_for(n));
        state.archive(item.clone(), self.config.history_capacity);
        Resolution {
            item,
            node,
            node_load,
        }
    }

    /// 取消待处理的工作项
    ///
    /// 只有 pending 状态可以取消（转为 failed，错误为 `cancelled`）；处理中的工作项返回 false
    pub async fn cancel(&self, item_id: &str) -> FleetResult<bool> {
        let cancelled = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.items.get(item_id) else {
                return Err(FleetError::item_not_found(item_id));
            };
            if entry.item.is_active() {
                debug!("工作项 {} 正在处理中，无法取消", item_id);
                return Ok(false);
            }

            let key = (entry.item.priority.rank(), entry.seq);
            state.pending.remove(&key);
            let Some(mut entry) = state.items.remove(item_id) else {
                return Err(FleetError::item_not_found(item_id));
            };
            entry.item.fail(CANCELLED_ERROR, Utc::now());
            state.failed_count += 1;
            state.archive(entry.item.clone(), self.config.history_capacity);
            self.update_gauges(&state);
            entry.item
        };

        counter!("fleet_queue_failed_total").increment(1);
        info!("工作项 {} 已取消", item_id);
        self.audit_failure(&cancelled, None).await;
        Ok(true)
    }

    /// 查询工作项，包括仍在历史记录中的已解决工作项
    pub async fn get_item(&self, item_id: &str) -> Option<WorkItem> {
        let state = self.state.lock().await;
        if let Some(entry) = state.items.get(item_id) {
            return Some(entry.item.clone());
        }
        state
            .history
            .iter()
            .rev()
            .find(|item| item.id == item_id)
            .cloned()
    }

    pub async fn get_status(&self) -> QueueStatus {
        self.state.lock().await.status()
    }

    /// 已完成/失败工作项的历史，按解决顺序
    pub async fn history(&self) -> Vec<WorkItem> {
        self.state.lock().await.history.iter().cloned().collect()
    }

    /// 把节点上所有处理中的工作项放回待处理队列，返回被重新入队的工作项
    ///
    /// 超过重新入队上限的工作项转为失败（死信）
    pub async fn requeue_node(&self, node_id: &str) -> Vec<ItemId> {
        let (requeued, dead_lettered) = {
            let mut state = self.state.lock().await;
            let Some(active) = state.active_by_node.remove(node_id) else {
                return Vec::new();
            };

            let now = Utc::now();
            let mut requeued = Vec::new();
            let mut dead_lettered = Vec::new();

            for item_id in active {
                let Some(entry) = state.items.get_mut(&item_id) else {
                    continue;
                };
                let limit_reached = self
                    .config
                    .max_requeues
                    .is_some_and(|max| entry.item.requeue_count >= max);

                if limit_reached {
                    if let Some(mut entry) = state.items.remove(&item_id) {
                        entry.item.fail(REQUEUE_LIMIT_ERROR, now);
                        state.failed_count += 1;
                        state.archive(entry.item.clone(), self.config.history_capacity);
                        dead_lettered.push(entry.item);
                    }
                } else {
                    entry.item.reset_to_pending();
                    let key = (entry.item.priority.rank(), entry.seq);
                    state.pending.insert(key, item_id.clone());
                    requeued.push(item_id);
                }
            }

            self.update_gauges(&state);
            (requeued, dead_lettered)
        };

        if !requeued.is_empty() {
            self.available.notify_waiters();
            counter!("fleet_queue_requeued_total").increment(requeued.len() as u64);
            warn!(
                "节点 {} 不可用，{} 个工作项重新入队",
                node_id,
                requeued.len()
            );
        }
        for item in &dead_lettered {
            counter!("fleet_queue_failed_total").increment(1);
            error!("工作项 {} 超过重新入队上限，转为失败", item.id);
            self.audit_failure(item, Some(node_id)).await;
        }
        self.report_load(node_id, 0).await;

        requeued
    }

    /// 对照最新拓扑快照，回收分配给不健康或已离开节点的工作项
    pub async fn reconcile(&self) -> usize {
        let snapshot = self.topology.snapshot();
        let orphaned_nodes: Vec<NodeId> = {
            let state = self.state.lock().await;
            state
                .active_by_node
                .keys()
                .filter(|node| !snapshot.is_healthy(node))
                .cloned()
                .collect()
        };

        let mut total = 0;
        for node in orphaned_nodes {
            total += self.requeue_node(&node).await.len();
        }
        total
    }

    /// 清理超过保留时长的历史记录
    pub async fn prune_history(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.config.history_retention)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = now - retention;

        let mut state = self.state.lock().await;
        let before = state.history.len();
        state
            .history
            .retain(|item| item.completed_at.map_or(true, |at| at >= cutoff));
        let removed = before - state.history.len();
        if removed > 0 {
            debug!("清理了 {} 条过期的工作项历史", removed);
        }
        removed
    }

    /// 监听拓扑事件，节点不健康或离开时回收其工作项
    pub async fn run_topology_listener(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> FleetResult<()> {
        let mut events = self.topology.subscribe();
        // 订阅之前发生的变化通过对照快照补齐
        let recovered = self.reconcile().await;
        if recovered > 0 {
            info!("启动时回收了 {} 个孤儿工作项", recovered);
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(TopologyEvent::HealthChanged { node_id, status: NodeStatus::Unhealthy })
                    | Ok(TopologyEvent::NodeLeft { node_id }) => {
                        self.requeue_node(&node_id).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("拓扑事件积压，跳过了 {} 个事件，对照快照重新校验", skipped);
                        self.reconcile().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("拓扑事件通道已关闭，退出工作队列监听");
                        return Ok(());
                    }
                },
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出工作队列拓扑监听");
                    return Ok(());
                }
            }
        }
    }

    /// 周期性维护：回收不健康节点上的工作项并清理历史记录
    pub async fn run_maintenance_loop(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> FleetResult<()> {
        let mut interval = tokio::time::interval(self.config.maintenance_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let requeued = self.reconcile().await;
                    if requeued > 0 {
                        debug!("维护循环回收了 {} 个工作项", requeued);
                    }
                    self.prune_history(Utc::now()).await;
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出工作队列维护循环");
                    return Ok(());
                }
            }
        }
    }

    async fn audit_failure(&self, item: &WorkItem, node: Option<&str>) {
        emit_audit(
            self.audit.as_ref(),
            event_types::ITEM_FAILED,
            serde_json::json!({
                "item_id": item.id,
                "item_type": item.item_type,
                "node": node,
                "error": item.error,
            }),
        )
        .await;
    }

    async fn report_resolution_load(&self, resolution: &Resolution) {
        if let (Some(node), Some(load)) = (resolution.node.as_deref(), resolution.node_load) {
            self.report_load(node, load).await;
        }
    }

    async fn report_load(&self, node_id: &str, load: u32) {
        if let Err(e) = self.topology.report_load(node_id, load).await {
            debug!("上报节点 {} 负载失败: {}", node_id, e);
        }
    }

    fn update_gauges(&self, state: &QueueState) {
        let status = state.status();
        gauge!("fleet_queue_pending").set(status.pending_count as f64);
        gauge!("fleet_queue_active").set(status.active_count as f64);
        gauge!("fleet_queue_history").set(state.history.len() as f64);
    }
}

#[async_trait]
impl WorkSource for WorkQueueProducer {
    async fn request_items(
        &self,
        node_id: &str,
        max_count: usize,
        wait: Duration,
    ) -> FleetResult<Vec<WorkItem>> {
        WorkQueueProducer::request_items(self, node_id, max_count, wait).await
    }

    async fn report_completion(
        &self,
        item_id: &str,
        result: serde_json::Value,
        duration_ms: u64,
    ) -> FleetResult<()> {
        WorkQueueProducer::report_completion(self, item_id, result, duration_ms).await
    }

    async fn report_failure(&self, item_id: &str, error: &str) -> FleetResult<()> {
        WorkQueueProducer::report_failure(self, item_id, error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_average() {
        let mut state = QueueState::default();
        state.record_duration(100);
        state.record_duration(200);
        state.record_duration(300);
        assert!((state.avg_duration_ms - 200.0).abs() < f64::EPSILON);
        assert_eq!(state.duration_samples, 3);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = QueueState::default();
        for i in 0..5 {
            let item = WorkItem::new(&format!("t{i}"), serde_json::Value::Null, fleet_core::Priority::Low);
            state.archive(item, 3);
        }
        assert_eq!(state.history.len(), 3);
        assert_eq!(state.history.front().unwrap().item_type, "t2");
    }
}
