//! 告警分发器 - 逐个接收者发送告警

use crate::config::MonitorConfig;
use crate::transport::Transport;
use std::sync::Arc;
use tracing::{error, info};

/// 发送结果
#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    /// 发送成功
    Sent,
    /// 跳过（dry-run）
    Skipped(String),
    /// 发送失败
    Failed(String),
}

/// 告警分发器
///
/// 按配置顺序向每个接收者发送告警。单个接收者失败只记录日志，
/// 不影响其余接收者，也不重试。
pub struct AlertDispatcher {
    transport: Arc<dyn Transport>,
    recipients: Vec<String>,
    /// 已渲染的告警内容
    message: String,
    /// 是否为 dry-run 模式
    dry_run: bool,
}

impl AlertDispatcher {
    /// 创建新的分发器
    pub fn new(transport: Arc<dyn Transport>, config: &MonitorConfig) -> Self {
        Self {
            transport,
            recipients: config.recipients.clone(),
            message: config
                .templates
                .render_alert(&config.target, config.response_timeout),
            dry_run: false,
        }
    }

    /// 设置 dry-run 模式
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// 告警内容
    pub fn message(&self) -> &str {
        &self.message
    }

    /// 向所有接收者发送告警
    pub async fn send_alerts(&self) -> Vec<(String, SendResult)> {
        let mut results = Vec::with_capacity(self.recipients.len());

        for recipient in &self.recipients {
            if self.dry_run {
                info!(recipient = %recipient, "[DRY-RUN] Would send alert");
                results.push((recipient.clone(), SendResult::Skipped("dry-run".to_string())));
                continue;
            }

            let result = match self.transport.send_message(recipient, &self.message).await {
                Ok(()) => {
                    info!(recipient = %recipient, "Alert sent to user");
                    SendResult::Sent
                }
                Err(e) => {
                    error!(recipient = %recipient, error = %e, "Failed to send alert to user");
                    SendResult::Failed(e.to_string())
                }
            };

            results.push((recipient.clone(), result));
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use std::time::Duration;

    fn config(recipients: &[&str]) -> MonitorConfig {
        MonitorConfig::new(
            "@status_bot",
            recipients.iter().map(|r| r.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn test_send_alerts_to_every_recipient_in_order() {
        let transport = Arc::new(MemoryTransport::new());
        let dispatcher = AlertDispatcher::new(transport.clone(), &config(&["1", "2", "3"]));

        let results = dispatcher.send_alerts().await;

        assert_eq!(
            results,
            vec![
                ("1".to_string(), SendResult::Sent),
                ("2".to_string(), SendResult::Sent),
                ("3".to_string(), SendResult::Sent),
            ]
        );
        let destinations: Vec<_> = transport.sent().into_iter().map(|m| m.destination).collect();
        assert_eq!(destinations, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_failed_recipient_does_not_stop_the_rest() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_destination("1");
        let dispatcher = AlertDispatcher::new(transport.clone(), &config(&["1", "2"]));

        let results = dispatcher.send_alerts().await;

        assert!(matches!(results[0].1, SendResult::Failed(_)));
        assert_eq!(results[1].1, SendResult::Sent);
        assert_eq!(transport.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_dry_run_skips_sending() {
        let transport = Arc::new(MemoryTransport::new());
        let dispatcher =
            AlertDispatcher::new(transport.clone(), &config(&["1"])).with_dry_run(true);

        let results = dispatcher.send_alerts().await;

        assert_eq!(results[0].1, SendResult::Skipped("dry-run".to_string()));
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_message_uses_target_and_timeout() {
        let mut config = config(&["1"]);
        config.response_timeout = Duration::from_secs(45);
        let dispatcher = AlertDispatcher::new(Arc::new(MemoryTransport::new()), &config);

        assert!(dispatcher.message().contains("@status_bot"));
        assert!(dispatcher.message().contains("45"));
    }
}
