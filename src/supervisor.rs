//! 进程监管 - 建立会话、运行监控循环，出错后固定延迟整体重启
//!
//! 每次重启都重新建立会话，而不是恢复旧循环。中断信号触发优雅退出。

use crate::config::MonitorConfig;
use crate::monitor::BotMonitor;
use crate::transport::SessionConnector;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// 重启策略：固定延迟，可选次数上限
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    pub delay: Duration,
    /// `None` 表示无限重启
    pub max_restarts: Option<u32>,
}

impl RestartPolicy {
    pub fn unbounded(delay: Duration) -> Self {
        Self {
            delay,
            max_restarts: None,
        }
    }

    pub fn from_config(config: &MonitorConfig) -> Self {
        Self {
            delay: config.restart_delay,
            max_restarts: config.max_restarts,
        }
    }

    /// 已重启 `restarts` 次后是否还允许重启
    pub fn allows(&self, restarts: u32) -> bool {
        self.max_restarts.map_or(true, |max| restarts < max)
    }
}

/// 监管循环退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// 收到中断信号
    Interrupted,
    /// 重启次数用尽
    RestartsExhausted,
}

/// 单次会话的结束方式
enum SessionEnd {
    Interrupted,
    Finished,
}

/// 进程监管器
pub struct Supervisor {
    connector: Arc<dyn SessionConnector>,
    config: Arc<MonitorConfig>,
    policy: RestartPolicy,
    dry_run: bool,
}

impl Supervisor {
    pub fn new(connector: Arc<dyn SessionConnector>, config: Arc<MonitorConfig>) -> Self {
        let policy = RestartPolicy::from_config(&config);
        Self {
            connector,
            config,
            policy,
            dry_run: false,
        }
    }

    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 设置告警 dry-run 模式
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// 运行监管循环，直到 `shutdown` 完成或重启次数用尽
    pub async fn run<F>(&self, shutdown: F) -> SupervisorExit
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut restarts = 0u32;

        loop {
            if let SessionEnd::Interrupted = self.run_session(&mut shutdown).await {
                info!("Program terminated by user");
                return SupervisorExit::Interrupted;
            }

            if !self.policy.allows(restarts) {
                warn!(restarts, "Restart limit reached, giving up");
                return SupervisorExit::RestartsExhausted;
            }
            restarts += 1;

            info!(delay_secs = self.policy.delay.as_secs(), restarts, "Restarting after delay");
            tokio::select! {
                _ = tokio::time::sleep(self.policy.delay) => {}
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    return SupervisorExit::Interrupted;
                }
            }
        }
    }

    /// 建立一个会话并运行监控，结束后总是关闭会话
    async fn run_session<F>(&self, shutdown: &mut std::pin::Pin<&mut F>) -> SessionEnd
    where
        F: Future<Output = ()>,
    {
        let transport = tokio::select! {
            result = self.connector.connect() => match result {
                Ok(transport) => transport,
                Err(e) => {
                    error!(error = ?e, "Failed to establish transport session");
                    return SessionEnd::Finished;
                }
            },
            _ = shutdown.as_mut() => {
                info!("Received shutdown signal");
                return SessionEnd::Interrupted;
            }
        };

        let monitor = BotMonitor::new(Arc::clone(&transport), Arc::clone(&self.config))
            .with_dry_run(self.dry_run);

        let end = tokio::select! {
            result = monitor.run() => {
                match result {
                    Ok(()) => warn!("Monitor loop exited"),
                    Err(e) => error!(error = ?e, "Unexpected error in monitor loop"),
                }
                SessionEnd::Finished
            }
            _ = shutdown.as_mut() => {
                info!("Received shutdown signal");
                monitor.stop();
                SessionEnd::Interrupted
            }
        };

        if let Err(e) = transport.disconnect().await {
            warn!(error = %e, "Failed to close transport session");
        }

        end
    }
}
