//! 内存传输 - 记录所有发送，可脚本化模拟回复、限流和失败

use super::{InboundMessage, MessageHandler, Sender, SenderFilter, Subscriptions, Transport, TransportError};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// 一次发送尝试
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub destination: String,
    pub text: String,
    pub at: Instant,
    /// 是否被接受（限流/失败时为 false）
    pub delivered: bool,
}

/// 自动回复：向 `trigger` 发送消息后，`delay` 时间后以 `from` 身份回复
#[derive(Debug, Clone)]
struct AutoReply {
    trigger: String,
    from: Sender,
    delay: Duration,
}

/// 内存传输
pub struct MemoryTransport {
    name: String,
    subscriptions: Arc<Subscriptions>,
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<HashSet<String>>,
    rate_limits: Mutex<VecDeque<Duration>>,
    auto_reply: Mutex<Option<AutoReply>>,
    connected: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            name: "memory".to_string(),
            subscriptions: Arc::new(Subscriptions::new()),
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            rate_limits: Mutex::new(VecDeque::new()),
            auto_reply: Mutex::new(None),
            connected: AtomicBool::new(true),
        }
    }

    /// 每次向 `trigger` 发送后，经过 `delay` 以 `from` 身份回复
    pub fn reply_after(&self, trigger: impl Into<String>, from: Sender, delay: Duration) {
        *self.auto_reply.lock().unwrap_or_else(|e| e.into_inner()) = Some(AutoReply {
            trigger: trigger.into(),
            from,
            delay,
        });
    }

    /// 发往 `destination` 的消息都失败
    pub fn fail_destination(&self, destination: impl Into<String>) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(destination.into());
    }

    /// 下一次发送返回限流错误
    pub fn rate_limit_next(&self, retry_after: Duration) {
        self.rate_limits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(retry_after);
    }

    /// 模拟会话断开
    pub fn drop_connection(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// 所有发送尝试
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 发往指定目标的发送尝试
    pub fn sent_to(&self, destination: &str) -> Vec<SentMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.destination == destination)
            .collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn record(&self, destination: &str, text: &str, delivered: bool) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(SentMessage {
                destination: destination.to_string(),
                text: text.to_string(),
                at: Instant::now(),
                delivered,
            });
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            self.record(destination, text, false);
            return Err(TransportError::Disconnected);
        }

        let rate_limit = self
            .rate_limits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(retry_after) = rate_limit {
            self.record(destination, text, false);
            return Err(TransportError::RateLimited { retry_after });
        }

        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(destination);
        if failing {
            self.record(destination, text, false);
            return Err(TransportError::Api {
                code: 400,
                description: "Bad Request: chat not found".to_string(),
            });
        }

        self.record(destination, text, true);
        debug!(destination = %destination, "Recorded message");

        let reply = self
            .auto_reply
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|r| r.trigger == destination);
        if let Some(reply) = reply {
            let subscriptions = Arc::clone(&self.subscriptions);
            tokio::spawn(async move {
                tokio::time::sleep(reply.delay).await;
                let message = InboundMessage {
                    chat_id: reply.from.id,
                    sender: reply.from,
                    text: Some("ok".to_string()),
                };
                subscriptions.dispatch(&message);
            });
        }

        Ok(())
    }

    fn subscribe(&self, sender: SenderFilter, handler: MessageHandler) {
        self.subscriptions.add(sender, handler);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn test_auto_reply_reaches_subscriber() {
        let transport = MemoryTransport::new();
        let bot = Sender {
            id: 5,
            username: Some("status_bot".to_string()),
        };
        transport.reply_after("@status_bot", bot, Duration::from_secs(2));

        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        transport.subscribe(
            SenderFilter::parse("@status_bot"),
            Arc::new(move |_: &InboundMessage| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        );

        transport.send_message("@status_bot", "/check").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let transport = MemoryTransport::new();
        transport.rate_limit_next(Duration::from_secs(3));
        transport.fail_destination("bad");

        let err = transport.send_message("x", "1").await.unwrap_err();
        assert!(matches!(err, TransportError::RateLimited { retry_after } if retry_after == Duration::from_secs(3)));
        assert!(transport.send_message("x", "2").await.is_ok());
        assert!(transport.send_message("bad", "3").await.is_err());

        transport.disconnect().await.unwrap();
        assert!(matches!(
            transport.send_message("x", "4").await,
            Err(TransportError::Disconnected)
        ));

        let delivered: Vec<_> = transport.sent().iter().map(|m| m.delivered).collect();
        assert_eq!(delivered, vec![false, true, false, false]);
    }
}
