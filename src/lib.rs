//! Bot Liveness Monitor - 监控 Telegram bot 是否响应，超时向指定用户告警

pub mod checker;
pub mod config;
pub mod monitor;
pub mod notification;
pub mod signal;
pub mod supervisor;
pub mod transport;

pub use checker::{CheckOutcome, LivenessChecker};
pub use config::{AppConfig, ConfigError, Credentials, FileConfig, MonitorConfig};
pub use monitor::BotMonitor;
pub use notification::{AlertDispatcher, MessageTemplates, SendResult};
pub use signal::{ResponseSignal, WaitOutcome};
pub use supervisor::{RestartPolicy, Supervisor, SupervisorExit};
pub use transport::{
    InboundMessage, MemoryTransport, MessageHandler, Sender, SenderFilter, SessionConnector,
    TelegramConnector, TelegramSession, Transport, TransportError,
};
