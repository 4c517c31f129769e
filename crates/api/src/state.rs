use std::sync::Arc;

use fleet_core::NodeDescriptor;
use fleet_distribution::{ConfigApplier, DistributionService};
use fleet_queue::WorkQueueProducer;
use fleet_supervisor::Supervisor;
use fleet_topology::TopologyManager;
use fleet_worker::WorkConsumer;

use crate::error::ApiError;

/// 路由共享状态。节点按角色只启用部分组件，未启用的组件对应接口返回 503
#[derive(Clone)]
pub struct AppState {
    pub node: NodeDescriptor,
    pub topology: Option<Arc<TopologyManager>>,
    pub queue: Option<Arc<WorkQueueProducer>>,
    pub distribution: Option<Arc<DistributionService>>,
    pub applier: Option<Arc<ConfigApplier>>,
    pub consumer: Option<Arc<WorkConsumer>>,
    pub supervisor: Option<Arc<Supervisor>>,
}

impl AppState {
    pub fn new(node: NodeDescriptor) -> Self {
        Self {
            node,
            topology: None,
            queue: None,
            distribution: None,
            applier: None,
            consumer: None,
            supervisor: None,
        }
    }

    pub fn with_topology(mut self, topology: Arc<TopologyManager>) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn with_queue(mut self, queue: Arc<WorkQueueProducer>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_distribution(mut self, distribution: Arc<DistributionService>) -> Self {
        self.distribution = Some(distribution);
        self
    }

    pub fn with_applier(mut self, applier: Arc<ConfigApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<WorkConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub(crate) fn topology(&self) -> Result<&Arc<TopologyManager>, ApiError> {
        self.topology
            .as_ref()
            .ok_or(ApiError::ComponentDisabled("拓扑管理"))
    }

    pub(crate) fn queue(&self) -> Result<&Arc<WorkQueueProducer>, ApiError> {
        self.queue.as_ref().ok_or(ApiError::ComponentDisabled("工作队列"))
    }

    pub(crate) fn distribution(&self) -> Result<&Arc<DistributionService>, ApiError> {
        self.distribution
            .as_ref()
            .ok_or(ApiError::ComponentDisabled("配置分发"))
    }

    pub(crate) fn applier(&self) -> Result<&Arc<ConfigApplier>, ApiError> {
        self.applier
            .as_ref()
            .ok_or(ApiError::ComponentDisabled("配置应用"))
    }

    /// 本节点正在执行的工作项数
    pub fn active_item_count(&self) -> u32 {
        self.consumer
            .as_ref()
            .map(|c| c.in_flight() as u32)
            .unwrap_or(0)
    }
}
