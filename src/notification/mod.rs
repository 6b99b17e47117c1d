//! 告警通知 - 消息模板与告警分发

pub mod dispatcher;
pub mod formatter;

pub use dispatcher::{AlertDispatcher, SendResult};
pub use formatter::{MessageTemplates, DEFAULT_ALERT_TEMPLATE, DEFAULT_PROBE_COMMAND};
