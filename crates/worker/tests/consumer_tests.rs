use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{
    ExecutorRegistry, FleetError, FleetResult, ItemExecutor, ItemStatus, NodeDescriptor,
    NodeRole, WorkItem,
};
use fleet_infrastructure::{InMemoryAuditSink, InMemoryHeartbeatLink};
use fleet_queue::{WorkQueueConfig, WorkQueueProducer};
use fleet_topology::{TopologyManager, TopologyManagerConfig};
use fleet_worker::{ShellExecutor, WorkConsumer, WorkConsumerConfig};
use tokio::sync::broadcast;

struct UppercaseExecutor;

#[async_trait]
impl ItemExecutor for UppercaseExecutor {
    async fn execute(&self, item: &WorkItem) -> FleetResult<serde_json::Value> {
        let text = item.payload["text"]
            .as_str()
            .ok_or_else(|| FleetError::invalid_argument("缺少 text 字段"))?;
        Ok(serde_json::json!({ "text": text.to_uppercase() }))
    }

    fn name(&self) -> &str {
        "uppercase"
    }

    fn supported_item_types(&self) -> Vec<String> {
        vec!["uppercase".to_string()]
    }
}

async fn setup() -> (Arc<WorkQueueProducer>, Arc<WorkConsumer>) {
    let link = Arc::new(InMemoryHeartbeatLink::new());
    let audit = Arc::new(InMemoryAuditSink::new());
    let topology = Arc::new(TopologyManager::new(
        link.clone(),
        audit.clone(),
        TopologyManagerConfig::default(),
    ));
    topology
        .join(NodeDescriptor::new(
            "worker-1",
            "http://worker-1:8080",
            NodeRole::Client,
            Vec::<&str>::new(),
        ))
        .await
        .unwrap();
    link.set_reachable("worker-1", None).await;

    let producer = Arc::new(WorkQueueProducer::new(
        topology,
        audit,
        WorkQueueConfig::default(),
    ));

    let registry = Arc::new(ExecutorRegistry::new());
    registry.register(Arc::new(UppercaseExecutor)).await;
    registry.register(Arc::new(ShellExecutor::default())).await;

    let mut config = WorkConsumerConfig::new("worker-1");
    config.max_concurrent_items = 2;
    config.poll_wait = Duration::from_millis(50);
    let consumer = Arc::new(WorkConsumer::new(producer.clone(), registry, config));
    (producer, consumer)
}

async fn wait_until_resolved(producer: &WorkQueueProducer, expected: u64) {
    for _ in 0..200 {
        let status = producer.get_status().await;
        if status.completed_count + status.failed_count >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("工作项未在预期时间内完成");
}

#[tokio::test]
async fn test_consumer_drains_queue_through_producer() {
    let (producer, consumer) = setup().await;
    let ok = producer
        .submit("uppercase", serde_json::json!({"text": "fleet"}))
        .await
        .unwrap();
    let bad = producer
        .submit("uppercase", serde_json::json!({}))
        .await
        .unwrap();
    let orphan = producer
        .submit("no_such_type", serde_json::json!({}))
        .await
        .unwrap();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(consumer.clone().run(shutdown_rx));

    wait_until_resolved(&producer, 3).await;
    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let done = producer.get_item(&ok).await.unwrap();
    assert_eq!(done.status, ItemStatus::Completed);
    assert_eq!(done.result.unwrap()["text"], "FLEET");
    assert_eq!(done.assigned_node.as_deref(), Some("worker-1"));

    assert_eq!(
        producer.get_item(&bad).await.unwrap().status,
        ItemStatus::Failed
    );
    let orphan = producer.get_item(&orphan).await.unwrap();
    assert_eq!(orphan.status, ItemStatus::Failed);
    assert!(orphan.error.unwrap().contains("no_such_type"));

    let status = producer.get_status().await;
    assert_eq!(status.active_count, 0);
    assert_eq!(status.pending_count, 0);
    assert_eq!(status.total_submitted, 3);
}

#[tokio::test]
async fn test_shell_item_runs_end_to_end() {
    let (producer, consumer) = setup().await;
    let id = producer
        .submit(
            "shell",
            serde_json::json!({"command": "sh", "args": ["-c", "echo done"]}),
        )
        .await
        .unwrap();

    assert_eq!(consumer.poll_once().await.unwrap(), 1);
    wait_until_resolved(&producer, 1).await;

    let item = producer.get_item(&id).await.unwrap();
    assert_eq!(item.status, ItemStatus::Completed);
    assert_eq!(item.result.unwrap()["stdout"], "done");
}

#[tokio::test]
async fn test_unknown_consumer_is_rejected_as_transient() {
    let (producer, _) = setup().await;
    let registry = Arc::new(ExecutorRegistry::new());
    let stranger = WorkConsumer::new(
        producer.clone(),
        registry,
        WorkConsumerConfig::new("stranger"),
    );

    let err = stranger.poll_once().await.unwrap_err();
    assert!(matches!(err, FleetError::NodeUnavailable { .. }));
    assert!(err.is_transient());
}
