use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_core::{config::SupervisorConfig, FleetError, FleetResult};
use futures::future::join_all;
use metrics::{counter, gauge};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::budget::RestartBudget;
use crate::shutdown::ShutdownManager;

/// 重启策略
#[derive(Debug, Clone)]
pub struct SupervisionPolicy {
    pub max_restarts: u32,
    pub restart_window: Duration,
    /// 两次启动之间的基础延迟，实际延迟再加上最多一半的随机抖动
    pub restart_delay: Duration,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            restart_window: Duration::from_secs(60),
            restart_delay: Duration::from_millis(200),
        }
    }
}

impl SupervisionPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            restart_window: Duration::from_secs(config.restart_window_seconds),
            restart_delay: Duration::from_millis(config.restart_delay_ms),
        }
    }

    fn next_delay(&self) -> Duration {
        let base = self.restart_delay.as_millis() as u64;
        let jitter = rand::rng().random_range(0..=base / 2);
        Duration::from_millis(base + jitter)
    }
}

/// 受监督进程的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Crashed,
    Restarting,
    /// 正常退出或收到停机信号
    Stopped,
    /// 重启预算耗尽，不再重启
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub name: String,
    pub state: ProcessState,
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_exit_at: Option<DateTime<Utc>>,
}

/// 需要运维介入的告警
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alarm {
    pub process: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// 进程监督者
///
/// 每个进程由一个监督任务负责：进程返回错误或 panic 视为崩溃，
/// 在重启预算内延迟后重启，预算耗尽则停在 `Failed` 并发出告警。
pub struct Supervisor {
    policy: SupervisionPolicy,
    shutdown: ShutdownManager,
    processes: RwLock<BTreeMap<String, ProcessInfo>>,
    alarms: RwLock<Vec<Alarm>>,
    alarm_tx: broadcast::Sender<Alarm>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(policy: SupervisionPolicy) -> Self {
        Self::with_shutdown(policy, ShutdownManager::new())
    }

    pub fn with_shutdown(policy: SupervisionPolicy, shutdown: ShutdownManager) -> Self {
        let (alarm_tx, _) = broadcast::channel(64);
        Self {
            policy,
            shutdown,
            processes: RwLock::new(BTreeMap::new()),
            alarms: RwLock::new(Vec::new()),
            alarm_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// 启动一个受监督的进程
    ///
    /// `factory` 每次（重新）启动时调用一次，传入停机信号的接收端
    pub async fn spawn<F, Fut>(self: &Arc<Self>, name: &str, factory: F)
    where
        F: Fn(broadcast::Receiver<()>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FleetResult<()>> + Send + 'static,
    {
        let name = name.to_string();
        self.processes.write().await.insert(
            name.clone(),
            ProcessInfo {
                name: name.clone(),
                state: ProcessState::Running,
                restart_count: 0,
                last_error: None,
                started_at: Utc::now(),
                last_exit_at: None,
            },
        );

        let supervisor = Arc::clone(self);
        let handle = tokio::spawn(async move { supervisor.supervise(name, factory).await });
        self.handles.lock().await.push(handle);
    }

    async fn supervise<F, Fut>(self: Arc<Self>, name: String, factory: F)
    where
        F: Fn(broadcast::Receiver<()>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FleetResult<()>> + Send + 'static,
    {
        let mut budget = RestartBudget::new(self.policy.max_restarts, self.policy.restart_window);

        loop {
            let shutdown_rx = self.shutdown.subscribe().await;
            if self.shutdown.is_shutdown().await {
                self.mark_exit(&name, ProcessState::Stopped, None).await;
                return;
            }

            self.update(&name, |info| {
                info.state = ProcessState::Running;
                info.started_at = Utc::now();
            })
            .await;
            info!("进程 {} 已启动", name);

            let reason = match tokio::spawn(factory(shutdown_rx)).await {
                Ok(Ok(())) => {
                    info!("进程 {} 已停止", name);
                    self.mark_exit(&name, ProcessState::Stopped, None).await;
                    return;
                }
                Ok(Err(e)) => e.to_string(),
                Err(e) => describe_join_error(e),
            };

            if self.shutdown.is_shutdown().await {
                self.mark_exit(&name, ProcessState::Stopped, Some(reason)).await;
                return;
            }

            error!("进程 {} 崩溃: {}", name, reason);
            counter!("fleet_supervisor_crashes_total", "process" => name.clone()).increment(1);
            self.mark_exit(&name, ProcessState::Crashed, Some(reason.clone()))
                .await;

            if !budget.try_acquire(Instant::now()) {
                let exceeded = FleetError::RestartBudgetExceeded {
                    process: name.clone(),
                    max_restarts: budget.max_restarts(),
                    window_seconds: budget.window().as_secs(),
                };
                self.mark_exit(&name, ProcessState::Failed, Some(reason)).await;
                self.raise_alarm(&name, exceeded.to_string()).await;
                return;
            }

            self.update(&name, |info| {
                info.state = ProcessState::Restarting;
                info.restart_count += 1;
            })
            .await;
            let delay = self.policy.next_delay();
            warn!(
                "进程 {} 将在 {:?} 后重启 (窗口内第 {} 次)",
                name,
                delay,
                budget.used()
            );

            let mut shutdown_rx = self.shutdown.subscribe().await;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_rx.recv() => {
                    self.mark_exit(&name, ProcessState::Stopped, None).await;
                    return;
                }
            }
        }
    }

    async fn update(&self, name: &str, apply: impl FnOnce(&mut ProcessInfo)) {
        let mut processes = self.processes.write().await;
        if let Some(info) = processes.get_mut(name) {
            apply(info);
        }
        let running = processes
            .values()
            .filter(|p| p.state == ProcessState::Running)
            .count();
        gauge!("fleet_supervisor_running_processes").set(running as f64);
    }

    async fn mark_exit(&self, name: &str, state: ProcessState, error: Option<String>) {
        self.update(name, |info| {
            info.state = state;
            info.last_exit_at = Some(Utc::now());
            if error.is_some() {
                info.last_error = error;
            }
        })
        .await;
    }

    async fn raise_alarm(&self, process: &str, message: String) {
        error!("告警: 进程 {} 已停止重启: {}", process, message);
        counter!("fleet_supervisor_alarms_total").increment(1);
        let alarm = Alarm {
            process: process.to_string(),
            message,
            raised_at: Utc::now(),
        };
        self.alarms.write().await.push(alarm.clone());
        let _ = self.alarm_tx.send(alarm);
    }

    pub async fn process(&self, name: &str) -> Option<ProcessInfo> {
        self.processes.read().await.get(name).cloned()
    }

    pub async fn processes(&self) -> Vec<ProcessInfo> {
        self.processes.read().await.values().cloned().collect()
    }

    pub async fn alarms(&self) -> Vec<Alarm> {
        self.alarms.read().await.clone()
    }

    pub fn subscribe_alarms(&self) -> broadcast::Receiver<Alarm> {
        self.alarm_tx.subscribe()
    }

    /// 等待所有监督任务结束
    pub async fn wait(&self) {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("监督任务异常结束: {}", e);
            }
        }
    }

    /// 发送停机信号并等待所有进程退出，超时后放弃等待
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.shutdown().await;
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(()) => {
                info!("所有受监督进程已停止");
                true
            }
            Err(_) => {
                warn!("等待受监督进程停止超时 ({:?})", timeout);
                false
            }
        }
    }
}

fn describe_join_error(error: JoinError) -> String {
    if error.is_panic() {
        let panic = error.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "未知原因".to_string());
        format!("panic: {message}")
    } else {
        format!("任务被取消: {error}")
    }
}
