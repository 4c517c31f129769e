use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_core::config::WorkerConfig;
use fleet_core::{ExecutorRegistry, FleetResult, WorkItem, WorkSource};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

/// 消费者运行参数
#[derive(Debug, Clone)]
pub struct WorkConsumerConfig {
    pub node_id: String,
    pub max_concurrent_items: usize,
    /// 单次拉取的最长等待时间
    pub poll_wait: Duration,
    /// 暂时性错误后的退避时间
    pub error_backoff: Duration,
    /// 停机时等待在途工作项的最长时间
    pub drain_timeout: Duration,
}

impl WorkConsumerConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            max_concurrent_items: 4,
            poll_wait: Duration::from_secs(10),
            error_backoff: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(node_id: impl Into<String>, config: &WorkerConfig) -> Self {
        Self {
            max_concurrent_items: config.max_concurrent_items.max(1),
            poll_wait: Duration::from_secs(config.poll_wait_seconds),
            ..Self::new(node_id)
        }
    }
}

/// 从工作来源拉取工作项并交给执行器，并发数受信号量限制
pub struct WorkConsumer {
    source: Arc<dyn WorkSource>,
    executors: Arc<ExecutorRegistry>,
    config: WorkConsumerConfig,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl WorkConsumer {
    pub fn new(
        source: Arc<dyn WorkSource>,
        executors: Arc<ExecutorRegistry>,
        config: WorkConsumerConfig,
    ) -> Self {
        let permits = config.max_concurrent_items.max(1);
        Self {
            source,
            executors,
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// 当前正在执行的工作项数量
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// 拉取一批工作项并各自启动执行，返回本次拉到的数量。
    /// 至少等到一个空闲槽位后才发起请求，请求数不超过空闲槽位数。
    pub async fn poll_once(&self) -> FleetResult<usize> {
        let first = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|e| fleet_core::FleetError::Internal(format!("信号量已关闭: {e}")))?;
        let mut permits = vec![first];
        while let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            permits.push(permit);
        }

        let items = self
            .source
            .request_items(&self.config.node_id, permits.len(), self.config.poll_wait)
            .await?;
        let fetched = items.len();
        if fetched > 0 {
            debug!("节点 {} 拉取到 {} 个工作项", self.config.node_id, fetched);
        }

        // 多余的槽位随 permits 一起释放
        for (item, permit) in items.into_iter().zip(permits) {
            let source = Arc::clone(&self.source);
            let executors = Arc::clone(&self.executors);
            let in_flight = Arc::clone(&self.in_flight);
            in_flight.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                process_item(source, executors, item).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        Ok(fetched)
    }

    /// 消费循环。暂时性错误退避后重试，其他错误返回给上层监督者处理
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> FleetResult<()> {
        info!(
            "工作消费者启动: node_id={}, 最大并发={}",
            self.config.node_id, self.config.max_concurrent_items
        );

        loop {
            tokio::select! {
                result = self.poll_once() => {
                    if let Err(e) = result {
                        if e.is_transient() {
                            warn!("拉取工作项失败，{:?} 后重试: {}", self.config.error_backoff, e);
                            tokio::select! {
                                _ = tokio::time::sleep(self.config.error_backoff) => {}
                                _ = shutdown.recv() => break,
                            }
                        } else {
                            error!("工作消费者遇到不可恢复错误: {}", e);
                            return Err(e);
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }
        }

        self.drain().await;
        info!("工作消费者已停止: node_id={}", self.config.node_id);
        Ok(())
    }

    /// 等待在途工作项结束
    async fn drain(&self) {
        let deadline = Instant::now() + self.config.drain_timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                warn!("停机等待超时，仍有 {} 个工作项在执行", self.in_flight());
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

async fn process_item(
    source: Arc<dyn WorkSource>,
    executors: Arc<ExecutorRegistry>,
    item: WorkItem,
) {
    let started = Instant::now();
    let outcome = match executors.get(&item.item_type).await {
        Ok(executor) => executor.execute(&item).await,
        Err(e) => Err(e),
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    let report = match outcome {
        Ok(result) => {
            info!("工作项 {} 执行完成，耗时 {}ms", item.id, duration_ms);
            source.report_completion(&item.id, result, duration_ms).await
        }
        Err(e) => {
            warn!("工作项 {} 执行失败: {}", item.id, e);
            source.report_failure(&item.id, &e.to_string()).await
        }
    };

    if let Err(e) = report {
        error!("上报工作项 {} 结果失败: {}", item.id, e);
    }
}
