//! 响应信号 - 单槽存活锁存器
//!
//! 入站消息处理器调用 `set()`，检查器在发送探测前 `clear()`，
//! 然后 `wait()` 等待信号或超时。只保留当前状态，不排队。

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};

/// 等待结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// 超时前收到信号
    Signaled,
    /// 超时
    TimedOut,
}

/// 响应信号
#[derive(Debug)]
pub struct ResponseSignal {
    state: watch::Sender<bool>,
}

impl ResponseSignal {
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self { state }
    }

    /// 重置为未触发
    pub fn clear(&self) {
        self.state.send_replace(false);
    }

    /// 标记为已触发（幂等）
    pub fn set(&self) {
        self.state.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    /// 等待信号，最多等待 `timeout`
    ///
    /// 截止时刻与信号同时就绪时判为超时。
    pub async fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut receiver = self.state.subscribe();

        tokio::select! {
            biased;
            _ = sleep_until(deadline) => WaitOutcome::TimedOut,
            result = receiver.wait_for(|signaled| *signaled) => match result {
                Ok(_) => WaitOutcome::Signaled,
                // 发送端由 self 持有，不会先于接收端释放
                Err(_) => WaitOutcome::TimedOut,
            },
        }
    }
}

impl Default for ResponseSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out_without_signal() {
        let signal = ResponseSignal::new();
        let started = Instant::now();

        assert_eq!(signal.wait(Duration::from_secs(60)).await, WaitOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_wakes_on_set() {
        let signal = Arc::new(ResponseSignal::new());
        let setter = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            setter.set();
        });

        let started = Instant::now();
        assert_eq!(signal.wait(Duration::from_secs(60)).await, WaitOutcome::Signaled);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_set_returns_immediately() {
        let signal = ResponseSignal::new();
        signal.set();
        signal.set();

        assert!(signal.is_set());
        assert_eq!(signal.wait(Duration::from_secs(1)).await, WaitOutcome::Signaled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_resets_latch() {
        let signal = ResponseSignal::new();
        signal.set();
        signal.clear();

        assert!(!signal.is_set());
        assert_eq!(signal.wait(Duration::from_secs(1)).await, WaitOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signal_at_deadline_counts_as_timeout() {
        let signal = Arc::new(ResponseSignal::new());
        let setter = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            setter.set();
        });

        assert_eq!(signal.wait(Duration::from_secs(60)).await, WaitOutcome::TimedOut);
    }
}
