//! 基于 reqwest 的节点间 HTTP 客户端：心跳探测、种子发现、心跳上报和配置下发

use std::time::{Duration, Instant};

use async_trait::async_trait;
use fleet_core::{
    ApiResponse, ConfigBundle, ConfigClient, Discovery, FleetError, FleetResult,
    HeartbeatAnnouncement, HeartbeatLink, HealthReport, Node, NodeDescriptor, ProbeReport,
    TopologySnapshot,
};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

fn base_url(address: &str) -> &str {
    address.trim_end_matches('/')
}

fn build_client(timeout: Option<Duration>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().unwrap_or_else(|e| {
        warn!("创建HTTP客户端失败，使用默认配置: {}", e);
        reqwest::Client::new()
    })
}

/// 解析统一响应包装，非 2xx 时带上服务端消息
async fn read_envelope<T: DeserializeOwned>(
    node: &str,
    response: reqwest::Response,
) -> FleetResult<Option<T>> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiResponse<serde_json::Value>>(&body)
            .ok()
            .and_then(|r| r.message)
            .unwrap_or(body);
        return Err(FleetError::Execution(format!(
            "节点 {node} 返回 HTTP {status}: {message}"
        )));
    }

    let envelope: ApiResponse<T> = response
        .json()
        .await
        .map_err(|e| FleetError::Serialization(format!("解析节点 {node} 响应失败: {e}")))?;
    Ok(envelope.data)
}

/// 通过 `GET /health` 探测节点
pub struct HttpHeartbeatLink {
    http_client: reqwest::Client,
}

impl HttpHeartbeatLink {
    pub fn new() -> Self {
        Self {
            http_client: build_client(None),
        }
    }
}

impl Default for HttpHeartbeatLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HeartbeatLink for HttpHeartbeatLink {
    async fn probe(&self, node: &NodeDescriptor) -> FleetResult<ProbeReport> {
        let url = format!("{}/health", base_url(&node.address));
        let started = Instant::now();

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| FleetError::node_unreachable(&node.id, e.to_string()))?;

        if !response.status().is_success() {
            return Err(FleetError::node_unreachable(
                &node.id,
                format!("HTTP {}", response.status()),
            ));
        }

        // 负载报告是可选的，解析失败不影响存活判断
        let report = response
            .json::<ApiResponse<HealthReport>>()
            .await
            .ok()
            .and_then(|r| r.data);

        Ok(ProbeReport {
            active_item_count: report.map(|r| r.active_item_count),
            latency: started.elapsed(),
        })
    }
}

/// 从种子节点发现对等节点
///
/// 每个种子返回自身描述（`GET /api/node`）以及它所知道的健康节点（`GET /api/topology`）
pub struct SeedDiscovery {
    seeds: Vec<String>,
    http_client: reqwest::Client,
}

impl SeedDiscovery {
    pub fn new(seeds: Vec<String>, timeout: Duration) -> Self {
        Self {
            seeds,
            http_client: build_client(Some(timeout)),
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, seed: &str, path: &str) -> FleetResult<Option<T>> {
        let url = format!("{}{}", base_url(seed), path);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| FleetError::node_unreachable(seed, e.to_string()))?;
        read_envelope(seed, response).await
    }
}

#[async_trait]
impl Discovery for SeedDiscovery {
    async fn discover(&self) -> FleetResult<Vec<NodeDescriptor>> {
        let mut found: Vec<NodeDescriptor> = Vec::new();

        for seed in &self.seeds {
            match self.fetch::<NodeDescriptor>(seed, "/api/node").await {
                Ok(Some(descriptor)) => found.push(descriptor),
                Ok(None) => {}
                Err(e) => {
                    debug!("种子节点 {} 不可达: {}", seed, e);
                    continue;
                }
            }

            match self.fetch::<TopologySnapshot>(seed, "/api/topology").await {
                Ok(Some(snapshot)) => {
                    found.extend(snapshot.healthy_nodes().map(Node::descriptor));
                }
                Ok(None) => {}
                Err(e) => debug!("读取种子节点 {} 的拓扑失败: {}", seed, e),
            }
        }

        found.sort_by(|a, b| a.id.cmp(&b.id));
        found.dedup_by(|a, b| a.id == b.id);
        Ok(found)
    }
}

/// 客户端节点向种子节点上报心跳
pub struct HttpHeartbeatAnnouncer {
    seeds: Vec<String>,
    http_client: reqwest::Client,
}

impl HttpHeartbeatAnnouncer {
    pub fn new(seeds: Vec<String>, timeout: Duration) -> Self {
        Self {
            seeds,
            http_client: build_client(Some(timeout)),
        }
    }

    /// 向所有种子上报，返回成功的数量
    pub async fn announce(&self, announcement: &HeartbeatAnnouncement) -> usize {
        let mut delivered = 0;
        for seed in &self.seeds {
            let url = format!("{}/api/topology/heartbeat", base_url(seed));
            match self.http_client.post(&url).json(announcement).send().await {
                Ok(response) if response.status().is_success() => delivered += 1,
                Ok(response) => warn!("向 {} 上报心跳失败: HTTP {}", seed, response.status()),
                Err(e) => debug!("向 {} 上报心跳失败: {}", seed, e),
            }
        }
        delivered
    }
}

/// 通过 `POST /api/config/apply` 向客户端下发配置包
pub struct HttpConfigClient {
    http_client: reqwest::Client,
}

impl HttpConfigClient {
    pub fn new() -> Self {
        Self {
            http_client: build_client(None),
        }
    }
}

impl Default for HttpConfigClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigClient for HttpConfigClient {
    async fn apply(&self, node: &Node, bundle: &ConfigBundle) -> FleetResult<()> {
        let url = format!("{}/api/config/apply", base_url(&node.address));
        let response = self
            .http_client
            .post(&url)
            .json(bundle)
            .send()
            .await
            .map_err(|e| FleetError::node_unreachable(&node.id, e.to_string()))?;

        read_envelope::<serde_json::Value>(&node.id, response).await?;
        debug!("节点 {} 已应用配置版本 {}", node.id, bundle.version);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::NodeRole;

    #[test]
    fn test_base_url_trims_trailing_slash() {
        assert_eq!(base_url("http://a:8080/"), "http://a:8080");
        assert_eq!(base_url("http://a:8080"), "http://a:8080");
    }

    #[tokio::test]
    async fn test_probe_unreachable_address() {
        let link = HttpHeartbeatLink::new();
        // 端口 1 上没有服务
        let descriptor = NodeDescriptor::new(
            "ghost",
            "http://127.0.0.1:1",
            NodeRole::Full,
            Vec::<String>::new(),
        );
        let result = link.probe(&descriptor).await;
        assert!(matches!(result, Err(FleetError::NodeUnreachable { .. })));
    }

    #[tokio::test]
    async fn test_discovery_skips_unreachable_seeds() {
        let discovery = SeedDiscovery::new(
            vec!["http://127.0.0.1:1".to_string()],
            Duration::from_millis(500),
        );
        let found = discovery.discover().await.unwrap();
        assert!(found.is_empty());
    }
}
