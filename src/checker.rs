//! 存活检查 - 发送一次探测并等待响应

use crate::config::MonitorConfig;
use crate::notification::{AlertDispatcher, SendResult};
use crate::signal::{ResponseSignal, WaitOutcome};
use crate::transport::{Transport, TransportError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// 一次检查的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    /// 超时前收到响应
    Responded { elapsed: Duration },
    /// 超时，已触发告警
    TimedOut { alerts: Vec<(String, SendResult)> },
    /// 探测发送失败（不告警）
    SendFailed(String),
    /// 被限流，已等待指定时间（不告警）
    RateLimited(Duration),
    /// 等待期间监控被停止
    Stopped,
}

impl CheckOutcome {
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Responded { .. })
    }
}

/// 存活检查器
pub struct LivenessChecker {
    transport: Arc<dyn Transport>,
    signal: Arc<ResponseSignal>,
    alerts: AlertDispatcher,
    running: Arc<AtomicBool>,
    target: String,
    probe: String,
    response_timeout: Duration,
}

impl LivenessChecker {
    pub fn new(
        transport: Arc<dyn Transport>,
        signal: Arc<ResponseSignal>,
        running: Arc<AtomicBool>,
        config: &MonitorConfig,
    ) -> Self {
        Self {
            alerts: AlertDispatcher::new(Arc::clone(&transport), config),
            transport,
            signal,
            running,
            target: config.target.clone(),
            probe: config.templates.probe.clone(),
            response_timeout: config.response_timeout,
        }
    }

    /// 设置告警 dry-run 模式
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.alerts = self.alerts.with_dry_run(dry_run);
        self
    }

    /// 执行一次检查
    ///
    /// 所有错误都在这里处理并记录，不向上传播。
    pub async fn check(&self) -> CheckOutcome {
        self.signal.clear();
        let started = Instant::now();

        match self.transport.send_message(&self.target, &self.probe).await {
            Ok(()) => info!(bot = %self.target, "Sent check command"),
            Err(TransportError::RateLimited { retry_after }) => {
                warn!(seconds = retry_after.as_secs(), "Hit rate limit, waiting");
                tokio::time::sleep(retry_after).await;
                return CheckOutcome::RateLimited(retry_after);
            }
            Err(e) => {
                error!(bot = %self.target, error = %e, "Failed to send check command");
                return CheckOutcome::SendFailed(e.to_string());
            }
        }

        match self.signal.wait(self.response_timeout).await {
            WaitOutcome::Signaled if !self.running.load(Ordering::SeqCst) => {
                info!("Check interrupted by shutdown");
                CheckOutcome::Stopped
            }
            WaitOutcome::Signaled => {
                let elapsed = started.elapsed();
                info!(elapsed_ms = elapsed.as_millis() as u64, "Bot responded within timeout");
                CheckOutcome::Responded { elapsed }
            }
            WaitOutcome::TimedOut => {
                warn!(
                    bot = %self.target,
                    timeout_secs = self.response_timeout.as_secs(),
                    "Bot did not respond within timeout"
                );
                let alerts = self.alerts.send_alerts().await;
                CheckOutcome::TimedOut { alerts }
            }
        }
    }
}
