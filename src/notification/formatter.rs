//! 消息模板 - 探测命令与告警消息
//!
//! 模板在启动时从配置构造，注入到检查器和告警分发器，不使用全局可变状态。

use std::time::Duration;

/// 默认探测命令
pub const DEFAULT_PROBE_COMMAND: &str = "/check";

/// 默认告警模板，`{bot}` 和 `{timeout}` 为占位符
pub const DEFAULT_ALERT_TEMPLATE: &str = "⚠️ Warning: Bot {bot} has not responded for {timeout} seconds!";

/// 探测与告警消息模板
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageTemplates {
    /// 发给目标 bot 的探测命令
    pub probe: String,
    /// 告警模板
    pub alert: String,
}

impl MessageTemplates {
    /// 渲染告警消息
    pub fn render_alert(&self, bot: &str, timeout: Duration) -> String {
        self.alert
            .replace("{bot}", bot)
            .replace("{timeout}", &timeout.as_secs().to_string())
    }
}

impl Default for MessageTemplates {
    fn default() -> Self {
        Self {
            probe: DEFAULT_PROBE_COMMAND.to_string(),
            alert: DEFAULT_ALERT_TEMPLATE.to_string(),
        }
    }
}
