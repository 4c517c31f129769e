use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{AuditSink, FleetResult};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

/// 一条审计记录
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub event_type: String,
    pub data: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    fn new(event_type: &str, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            data,
            recorded_at: Utc::now(),
        }
    }
}

/// 以结构化日志输出审计事件
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record_event(&self, event_type: &str, data: serde_json::Value) -> FleetResult<()> {
        info!(target: "fleet::audit", event = event_type, data = %data, "审计事件");
        Ok(())
    }
}

/// 只追加的 JSON Lines 文件
pub struct JsonLinesAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl AuditSink for JsonLinesAuditSink {
    async fn record_event(&self, event_type: &str, data: serde_json::Value) -> FleetResult<()> {
        let mut line = serde_json::to_vec(&AuditRecord::new(event_type, data))?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// 内存中的审计记录，测试和调试用
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }

    pub async fn events_of(&self, event_type: &str) -> Vec<AuditRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.event_type == event_type)
            .cloned()
            .collect()
    }

    pub async fn count(&self, event_type: &str) -> usize {
        self.events_of(event_type).await.len()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record_event(&self, event_type: &str, data: serde_json::Value) -> FleetResult<()> {
        self.records
            .lock()
            .await
            .push(AuditRecord::new(event_type, data));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::event_types;

    #[tokio::test]
    async fn test_json_lines_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("events.jsonl");
        let sink = JsonLinesAuditSink::new(&path);

        sink.record_event(event_types::NODE_JOINED, serde_json::json!({"node": "a"}))
            .await
            .unwrap();
        sink.record_event(event_types::NODE_LEFT, serde_json::json!({"node": "a"}))
            .await
            .unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let records: Vec<AuditRecord> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event_type, "node_joined");
        assert_eq!(records[1].event_type, "node_left");
    }

    #[tokio::test]
    async fn test_in_memory_filtering() {
        let sink = InMemoryAuditSink::new();
        sink.record_event(event_types::ITEM_SUBMITTED, serde_json::json!({}))
            .await
            .unwrap();
        sink.record_event(event_types::ITEM_COMPLETED, serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(sink.count(event_types::ITEM_SUBMITTED).await, 1);
        assert_eq!(sink.records().await.len(), 2);
    }
}
