use std::net::SocketAddr;

use anyhow::{Context, Result};
use tracing::info;

/// 安装 Prometheus 导出器并在指定地址提供抓取端点
pub fn init_metrics(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;

    let (recorder, exporter) = metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .build()
        .map_err(|e| anyhow::anyhow!("创建Prometheus导出器失败: {}", e))?;

    metrics::set_global_recorder(recorder)
        .map_err(|e| anyhow::anyhow!("安装指标记录器失败: {}", e))?;
    tokio::spawn(exporter);

    info!("Prometheus指标已启用，监听地址 {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_address() {
        assert!(init_metrics("not-an-address").is_err());
    }
}
