use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::models::{NodeRole, Priority};

/// 本节点身份
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 为空时使用主机名
    pub id: String,
    /// 对外公布的API地址
    pub address: String,
    pub role: NodeRole,
    pub capabilities: BTreeSet<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            address: "http://127.0.0.1:8080".to_string(),
            role: NodeRole::Full,
            capabilities: BTreeSet::new(),
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.address.starts_with("http://") && !self.address.starts_with("https://") {
            return Err(anyhow::anyhow!("节点地址必须以 http:// 或 https:// 开头: {}", self.address));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub heartbeat_interval_seconds: u64,
    /// 默认为心跳间隔的2倍
    pub unhealthy_timeout_seconds: Option<u64>,
    /// 默认为心跳间隔的4倍
    pub discovery_interval_seconds: Option<u64>,
    pub probe_timeout_seconds: u64,
    /// 发现扫描时访问的种子节点地址
    pub seeds: Vec<String>,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 15,
            unhealthy_timeout_seconds: None,
            discovery_interval_seconds: None,
            probe_timeout_seconds: 3,
            seeds: Vec::new(),
        }
    }
}

impl TopologyConfig {
    pub fn unhealthy_timeout(&self) -> u64 {
        self.unhealthy_timeout_seconds
            .unwrap_or(self.heartbeat_interval_seconds * 2)
    }

    pub fn discovery_interval(&self) -> u64 {
        self.discovery_interval_seconds
            .unwrap_or(self.heartbeat_interval_seconds * 4)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }
        if self.probe_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("探测超时时间必须大于0"));
        }
        if self.unhealthy_timeout() < self.heartbeat_interval_seconds {
            return Err(anyhow::anyhow!("不健康超时不能小于心跳间隔"));
        }
        if self.discovery_interval() == 0 {
            return Err(anyhow::anyhow!("发现间隔必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub history_capacity: usize,
    pub history_retention_seconds: u64,
    /// 未设置时不限制重新入队次数
    pub max_requeues: Option<u32>,
    pub maintenance_interval_seconds: u64,
    /// 覆盖默认的类型优先级表
    pub priorities: BTreeMap<String, Priority>,
    /// 工作项类型 -> 消费节点必须具备的能力
    pub required_capabilities: BTreeMap<String, BTreeSet<String>>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            history_retention_seconds: 3600,
            max_requeues: None,
            maintenance_interval_seconds: 60,
            priorities: BTreeMap::new(),
            required_capabilities: BTreeMap::new(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.history_capacity == 0 {
            return Err(anyhow::anyhow!("历史记录容量必须大于0"));
        }
        if self.maintenance_interval_seconds == 0 {
            return Err(anyhow::anyhow!("维护间隔必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub max_concurrent_items: usize,
    pub poll_wait_seconds: u64,
    /// 远端生产者地址，未设置时使用本进程内的生产者
    pub producer_url: Option<String>,
    pub shell_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_items: 4,
            poll_wait_seconds: 10,
            producer_url: None,
            shell_timeout_seconds: 300,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrent_items == 0 {
            return Err(anyhow::anyhow!("最大并发工作项数必须大于0"));
        }
        if self.shell_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Shell执行超时时间必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
    pub apply_timeout_seconds: u64,
    pub history_capacity: usize,
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            apply_timeout_seconds: 5,
            history_capacity: 500,
        }
    }
}

impl DistributionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.apply_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("配置下发超时时间必须大于0"));
        }
        if self.history_capacity == 0 {
            return Err(anyhow::anyhow!("下发历史容量必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub max_restarts: u32,
    pub restart_window_seconds: u64,
    pub restart_delay_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            restart_window_seconds: 60,
            restart_delay_ms: 200,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.restart_window_seconds == 0 {
            return Err(anyhow::anyhow!("重启窗口必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
            cors_enabled: true,
        }
    }
}

impl ApiConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("绑定地址不能为空"));
        }
        if !self.bind_address.contains(':') {
            return Err(anyhow::anyhow!("绑定地址格式无效: {}", self.bind_address));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_enabled: bool,
    pub metrics_bind_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_bind_address: "0.0.0.0:9090".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                valid_levels
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 节点注册表和配置包的存放目录
    pub data_dir: String,
    /// 审计日志文件，未设置时审计事件写入 tracing
    pub audit_log: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            audit_log: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.data_dir.is_empty() {
            return Err(anyhow::anyhow!("数据目录不能为空"));
        }
        Ok(())
    }
}
