use crate::config::RetryConfig;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "attempt", rename_all = "snake_case")]
pub enum RetryState {
    Idle,
    Attempting(u32),
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 等待 `delay` 后进行第 `attempt` 次重启
    Restart { attempt: u32, max: u32, delay: Duration },
    Exhausted,
}

/// 连续重启计数
///
/// 计数只在收到"已稳定运行"信号时清零, 不会因时间流逝自动恢复。
/// `Exhausted` 只作用于当前这一场直播, 由 `reset` 解除。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    state: RetryState,
    max_attempts: u32,
    interval: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            state: RetryState::Idle,
            max_attempts,
            interval,
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(cfg.max_attempts, Duration::from_secs(cfg.interval_sec))
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == RetryState::Exhausted
    }

    /// 记录一次崩溃或启动失败
    pub fn on_failure(&mut self) -> RetryDecision {
        let next = match self.state {
            RetryState::Idle => 1,
            RetryState::Attempting(n) if n < self.max_attempts => n + 1,
            RetryState::Attempting(_) | RetryState::Exhausted => {
                self.state = RetryState::Exhausted;
                return RetryDecision::Exhausted;
            }
        };
        self.state = RetryState::Attempting(next);
        RetryDecision::Restart {
            attempt: next,
            max: self.max_attempts,
            delay: self.interval,
        }
    }

    /// 进程在一个监控周期内保持存活, 返回计数是否被清零
    pub fn mark_healthy(&mut self) -> bool {
        match self.state {
            RetryState::Attempting(_) => {
                self.state = RetryState::Idle;
                true
            }
            RetryState::Idle | RetryState::Exhausted => false,
        }
    }

    pub fn reset(&mut self) {
        self.state = RetryState::Idle;
    }
}
