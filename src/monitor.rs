//! 监控循环 - 按固定节奏驱动存活检查
//!
//! 状态机只有两个状态：运行中 / 已停止。`stop()` 之后不会再回到运行状态。

use crate::checker::{CheckOutcome, LivenessChecker};
use crate::config::MonitorConfig;
use crate::signal::ResponseSignal;
use crate::transport::{panic_message, InboundMessage, SenderFilter, Transport};
use anyhow::{bail, Result};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info};

/// Bot 监控器
pub struct BotMonitor {
    transport: Arc<dyn Transport>,
    config: Arc<MonitorConfig>,
    signal: Arc<ResponseSignal>,
    running: Arc<AtomicBool>,
    subscribed: AtomicBool,
    stop_requested: Notify,
    checker: LivenessChecker,
}

impl BotMonitor {
    pub fn new(transport: Arc<dyn Transport>, config: Arc<MonitorConfig>) -> Self {
        let signal = Arc::new(ResponseSignal::new());
        let running = Arc::new(AtomicBool::new(true));
        let checker = LivenessChecker::new(
            Arc::clone(&transport),
            Arc::clone(&signal),
            Arc::clone(&running),
            &config,
        );

        Self {
            transport,
            config,
            signal,
            running,
            subscribed: AtomicBool::new(false),
            stop_requested: Notify::new(),
            checker,
        }
    }

    /// 设置告警 dry-run 模式
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.checker = self.checker.with_dry_run(dry_run);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 请求停止，并唤醒正在等待的检查
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Monitor stop requested");
        }
        self.signal.set();
        self.stop_requested.notify_one();
    }

    /// 两次检查之间的等待，`stop()` 会提前结束
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.stop_requested.notified() => {}
        }
    }

    /// 注册目标 bot 的入站消息处理器（只注册一次）
    fn register_handler(&self) {
        if self.subscribed.swap(true, Ordering::SeqCst) {
            return;
        }

        let signal = Arc::clone(&self.signal);
        self.transport.subscribe(
            SenderFilter::parse(&self.config.target),
            Arc::new(move |message: &InboundMessage| {
                signal.set();
                info!(sender = message.sender.id, "Received response from bot");
            }),
        );
    }

    /// 执行单次检查（不进入循环）
    pub async fn run_once(&self) -> CheckOutcome {
        self.register_handler();
        self.checker.check().await
    }

    /// 运行监控循环，直到 `stop()` 或会话断开
    ///
    /// 会话断开时返回错误，由外层重建会话。
    pub async fn run(&self) -> Result<()> {
        self.register_handler();
        info!(
            bot = %self.config.target,
            recipients = self.config.recipients.len(),
            timeout_secs = self.config.response_timeout.as_secs(),
            interval_secs = self.config.check_interval.as_secs(),
            "Monitor started"
        );

        while self.is_running() {
            if !self.transport.is_connected() {
                bail!("transport session {} is disconnected", self.transport.name());
            }

            match AssertUnwindSafe(self.checker.check()).catch_unwind().await {
                Ok(CheckOutcome::Stopped) => break,
                // 限流等待已在检查内完成，代替本轮的检查间隔
                Ok(CheckOutcome::RateLimited(_)) => continue,
                Ok(_) => self.pause(self.config.check_interval).await,
                Err(payload) => {
                    error!(error = %panic_message(payload.as_ref()), "Error in monitor loop");
                    self.pause(self.config.error_backoff).await;
                }
            }
        }

        info!(bot = %self.config.target, "Monitor stopped");
        Ok(())
    }
}
