use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

/// 滑动窗口内的重启次数上限
#[derive(Debug, Clone)]
pub struct RestartBudget {
    max_restarts: u32,
    window: Duration,
    restarts: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
            restarts: VecDeque::new(),
        }
    }

    /// 尝试占用一次重启额度，窗口内已用完时返回 false
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.restarts.front() {
            if now.duration_since(oldest) >= self.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        if self.restarts.len() >= self.max_restarts as usize {
            return false;
        }
        self.restarts.push_back(now);
        true
    }

    /// 窗口内已使用的重启次数
    pub fn used(&self) -> usize {
        self.restarts.len()
    }

    pub fn max_restarts(&self) -> u32 {
        self.max_restarts
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}
