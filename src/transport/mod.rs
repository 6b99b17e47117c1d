//! 消息传输层 - 发送消息、订阅入站消息
//!
//! 监控逻辑只依赖 `Transport` trait；具体实现：
//! - `telegram::TelegramSession` - 以用户账号登录的 Telegram MTProto 会话
//! - `memory::MemoryTransport` - 内存实现，用于测试和本地演练

pub mod memory;
pub mod telegram;

use async_trait::async_trait;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::error;

pub use memory::MemoryTransport;
pub use telegram::{TelegramConnector, TelegramSession};

/// 传输错误
#[derive(Debug, Error)]
pub enum TransportError {
    /// 服务端限流，需等待指定时间后再发送
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },
    #[error("transport session is disconnected")]
    Disconnected,
    #[error("api error {code}: {description}")]
    Api { code: i64, description: String },
    /// 用户名或 ID 无法解析为可发送的对话
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("request failed: {0}")]
    Network(#[source] grammers_client::InvocationError),
}

/// 消息发送者
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sender {
    pub id: i64,
    pub username: Option<String>,
}

/// 入站消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: Sender,
    pub chat_id: i64,
    pub text: Option<String>,
}

/// 入站消息处理器
pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

/// 发送者过滤条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderFilter {
    /// 数字 ID
    Id(i64),
    /// 用户名（小写，不含 `@`）
    Username(String),
}

impl SenderFilter {
    /// 解析目标标识：纯数字为 ID，否则为用户名（`@` 可选，不区分大小写）
    pub fn parse(target: &str) -> Self {
        let target = target.trim();
        match target.parse::<i64>() {
            Ok(id) => Self::Id(id),
            Err(_) => Self::Username(target.trim_start_matches('@').to_lowercase()),
        }
    }

    pub fn matches(&self, sender: &Sender) -> bool {
        match self {
            Self::Id(id) => sender.id == *id,
            Self::Username(name) => sender
                .username
                .as_deref()
                .map(|u| u.trim_start_matches('@').eq_ignore_ascii_case(name))
                .unwrap_or(false),
        }
    }
}

/// 消息传输能力
#[async_trait]
pub trait Transport: Send + Sync {
    /// 会话名称（用于日志）
    fn name(&self) -> &str;

    /// 发送文本消息
    async fn send_message(&self, destination: &str, text: &str) -> Result<(), TransportError>;

    /// 订阅来自指定发送者的入站消息
    fn subscribe(&self, sender: SenderFilter, handler: MessageHandler);

    /// 会话是否仍然可用
    fn is_connected(&self) -> bool;

    /// 关闭会话，可重复调用
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// 会话建立器，每次调用建立一个全新的会话
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Transport>>;
}

/// 订阅表
#[derive(Default)]
pub struct Subscriptions {
    entries: Mutex<Vec<(SenderFilter, MessageHandler)>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, filter: SenderFilter, handler: MessageHandler) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((filter, handler));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 把消息分发给匹配的处理器，返回调用的处理器数量
    ///
    /// 处理器 panic 会被捕获并记录，不影响其他处理器和轮询任务。
    pub fn dispatch(&self, message: &InboundMessage) -> usize {
        let handlers: Vec<MessageHandler> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(filter, _)| filter.matches(&message.sender))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        for handler in &handlers {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| handler(message))) {
                error!(
                    sender = message.sender.id,
                    error = %panic_message(payload.as_ref()),
                    "Error in inbound message handler"
                );
            }
        }

        handlers.len()
    }
}

/// 提取 panic 信息
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
