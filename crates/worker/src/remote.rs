//! 通过 HTTP 访问远端生产者的工作来源

use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{
    ApiResponse, CompleteItemRequest, FailItemRequest, FleetError, FleetResult,
    RequestItemsRequest, WorkItem, WorkSource,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// 远端生产者客户端
pub struct HttpWorkSource {
    producer_url: String,
    http_client: reqwest::Client,
    request_timeout: Duration,
}

impl HttpWorkSource {
    pub fn new(producer_url: impl Into<String>) -> Self {
        Self {
            producer_url: producer_url.into().trim_end_matches('/').to_string(),
            http_client: reqwest::Client::new(),
            request_timeout: Duration::from_secs(10),
        }
    }

    /// 普通请求的超时时间，拉取请求会在此基础上加上等待时间
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn producer_url(&self) -> &str {
        &self.producer_url
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
        item_id: Option<&str>,
    ) -> FleetResult<Option<T>> {
        let url = format!("{}{}", self.producer_url, path);
        let response = self
            .http_client
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FleetError::Timeout(format!("请求生产者超时: {url}"))
                } else {
                    FleetError::Network(format!("连接生产者失败: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let envelope: ApiResponse<T> = response
                .json()
                .await
                .map_err(|e| FleetError::Serialization(format!("解析生产者响应失败: {e}")))?;
            return Ok(envelope.data);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiResponse<serde_json::Value>>(&body)
            .ok()
            .and_then(|r| r.message)
            .unwrap_or(body);
        warn!("生产者返回 HTTP {}: {}", status, message);

        Err(match status {
            StatusCode::NOT_FOUND => match item_id {
                Some(id) => FleetError::item_not_found(id),
                None => FleetError::Execution(message),
            },
            StatusCode::SERVICE_UNAVAILABLE => FleetError::NodeUnavailable { id: message },
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                FleetError::InvalidArgument(message)
            }
            _ => FleetError::Network(format!("HTTP {status}: {message}")),
        })
    }
}

#[async_trait]
impl WorkSource for HttpWorkSource {
    async fn request_items(
        &self,
        node_id: &str,
        max_count: usize,
        wait: Duration,
    ) -> FleetResult<Vec<WorkItem>> {
        let request = RequestItemsRequest {
            node_id: node_id.to_string(),
            max_count,
            wait_ms: wait.as_millis() as u64,
        };
        let items: Option<Vec<WorkItem>> = self
            .post(
                "/api/queue/request",
                &request,
                self.request_timeout + wait,
                None,
            )
            .await?;
        let items = items.unwrap_or_default();
        debug!("从 {} 拉取到 {} 个工作项", self.producer_url, items.len());
        Ok(items)
    }

    async fn report_completion(
        &self,
        item_id: &str,
        result: serde_json::Value,
        duration_ms: u64,
    ) -> FleetResult<()> {
        let request = CompleteItemRequest {
            result,
            duration_ms,
        };
        let _: Option<serde_json::Value> = self
            .post(
                &format!("/api/items/{item_id}/complete"),
                &request,
                self.request_timeout,
                Some(item_id),
            )
            .await?;
        Ok(())
    }

    async fn report_failure(&self, item_id: &str, error: &str) -> FleetResult<()> {
        let request = FailItemRequest {
            error: error.to_string(),
        };
        let _: Option<serde_json::Value> = self
            .post(
                &format!("/api/items/{item_id}/fail"),
                &request,
                self.request_timeout,
                Some(item_id),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_producer_url_is_normalized() {
        let source = HttpWorkSource::new("http://producer:8080/");
        assert_eq!(source.producer_url(), "http://producer:8080");
    }

    #[tokio::test]
    async fn test_unreachable_producer_is_transient() {
        let source = HttpWorkSource::new("http://127.0.0.1:1")
            .with_request_timeout(Duration::from_millis(500));
        let err = source
            .request_items("worker-1", 1, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
