use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{FleetError, FleetResult, ItemExecutor, WorkItem};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

/// Shell工作项参数，取自工作项的 payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellItemParams {
    /// 要执行的命令
    pub command: String,
    /// 命令参数
    #[serde(default)]
    pub args: Vec<String>,
    /// 工作目录
    pub working_dir: Option<String>,
    /// 环境变量
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// Shell执行器：直接启动进程，不经过 shell 解释
pub struct ShellExecutor {
    timeout: Duration,
    item_types: Vec<String>,
}

impl ShellExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            item_types: vec!["shell".to_string()],
        }
    }

    /// 额外处理其他类型的工作项
    pub fn with_item_types(mut self, item_types: Vec<String>) -> Self {
        self.item_types = item_types;
        self
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[async_trait]
impl ItemExecutor for ShellExecutor {
    async fn execute(&self, item: &WorkItem) -> FleetResult<serde_json::Value> {
        let params: ShellItemParams = serde_json::from_value(item.payload.clone())
            .map_err(|e| FleetError::invalid_argument(format!("解析Shell工作项参数失败: {e}")))?;

        info!(
            "执行Shell工作项: item_id={}, command={}, args={:?}",
            item.id, params.command, params.args
        );

        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref dir) = params.working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&params.env_vars);

        // 超时后 future 被丢弃，子进程随之被杀掉
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                warn!("Shell工作项 {} 执行超时 ({:?})", item.id, self.timeout);
                FleetError::Timeout(format!("Shell命令执行超过 {:?}", self.timeout))
            })?
            .map_err(|e| FleetError::Execution(format!("启动Shell命令失败: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let exit_code = output.status.code();

        if !output.status.success() {
            let detail = if stderr.is_empty() {
                format!("命令执行失败，退出码: {exit_code:?}")
            } else {
                stderr
            };
            return Err(FleetError::Execution(detail));
        }

        Ok(serde_json::json!({
            "exit_code": exit_code,
            "stdout": stdout,
            "stderr": stderr,
        }))
    }

    fn name(&self) -> &str {
        "shell"
    }

    fn supported_item_types(&self) -> Vec<String> {
        self.item_types.clone()
    }
}
