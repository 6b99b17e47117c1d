//! Telegram 会话 - 以用户账号登录 MTProto，发送消息并接收更新
//!
//! 用 `api_id` / `api_hash` 建立连接，首次运行时用手机号请求验证码登录，
//! 登录状态保存在会话文件中，之后的重启直接复用。
//! `FLOOD_WAIT` 等限流错误映射为 `TransportError::RateLimited`。

use super::{
    InboundMessage, MessageHandler, Sender, SenderFilter, SessionConnector, Subscriptions, Transport,
    TransportError,
};
use crate::config::{AppConfig, Credentials};
use anyhow::{Context, Result};
use async_trait::async_trait;
use dialoguer::{Input, Password};
use grammers_client::session::Session;
use grammers_client::types::Chat;
use grammers_client::{Client, Config, InvocationError, SignInError, Update};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 会话建立器
pub struct TelegramConnector {
    credentials: Credentials,
    session_name: String,
    session_path: PathBuf,
}

impl TelegramConnector {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let session_path = config
            .session_path()
            .context("无法确定会话文件路径（HOME 未设置）")?;
        Ok(Self {
            credentials: config.credentials.clone(),
            session_name: config.session_name.clone(),
            session_path,
        })
    }
}

#[async_trait]
impl SessionConnector for TelegramConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        let session =
            TelegramSession::connect(&self.session_name, &self.session_path, &self.credentials).await?;
        Ok(Arc::new(session))
    }
}

/// 会话内共享状态（更新任务与发送方共用）
struct Shared {
    client: Client,
    subscriptions: Subscriptions,
    connected: AtomicBool,
    /// 目标键（小写用户名或数字 ID）到对话的缓存
    peers: Mutex<HashMap<String, Chat>>,
}

/// Telegram 会话
pub struct TelegramSession {
    name: String,
    session_path: PathBuf,
    shared: Arc<Shared>,
    updates: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramSession {
    /// 连接、按需登录，并启动更新接收任务
    pub async fn connect(name: &str, session_path: &Path, credentials: &Credentials) -> Result<Self> {
        if let Some(dir) = session_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("创建会话目录失败: {}", dir.display()))?;
        }
        let session = Session::load_file_or_create(session_path)
            .with_context(|| format!("加载会话文件失败: {}", session_path.display()))?;

        let client = Client::connect(Config {
            session,
            api_id: credentials.api_id,
            api_hash: credentials.api_hash.clone(),
            params: Default::default(),
        })
        .await
        .context("连接 Telegram 失败")?;

        authorize(&client, credentials).await?;
        client
            .session()
            .save_to_file(session_path)
            .with_context(|| format!("保存会话文件失败: {}", session_path.display()))?;

        let me = client.get_me().await.context("获取当前账号失败")?;
        info!(
            session = %name,
            account = %credentials.phone_number,
            user_id = me.id(),
            username = ?me.username(),
            "Transport session established"
        );

        let shared = Arc::new(Shared {
            client,
            subscriptions: Subscriptions::new(),
            connected: AtomicBool::new(true),
            peers: Mutex::new(HashMap::new()),
        });
        let updates = tokio::spawn(receive_updates(Arc::clone(&shared)));

        Ok(Self {
            name: name.to_string(),
            session_path: session_path.to_path_buf(),
            shared,
            updates: Mutex::new(Some(updates)),
        })
    }

    /// 解析目标为对话：用户名走 `resolve_username`，数字 ID 从对话列表中查找
    async fn resolve(&self, destination: &str) -> Result<Chat, TransportError> {
        let key = peer_key(destination);
        if let Some(chat) = self.cached_peer(&key) {
            return Ok(chat);
        }

        if key.parse::<i64>().is_ok() {
            self.refresh_dialogs().await?;
        } else {
            let chat = self
                .shared
                .client
                .resolve_username(&key)
                .await
                .map_err(map_invocation_error)?;
            if let Some(chat) = chat {
                self.cache_peer(chat);
            }
        }

        self.cached_peer(&key)
            .ok_or_else(|| TransportError::UnknownPeer(destination.to_string()))
    }

    /// 从对话列表刷新 ID 缓存（数字 ID 需要已有对话才能发送）
    async fn refresh_dialogs(&self) -> Result<(), TransportError> {
        let mut dialogs = self.shared.client.iter_dialogs();
        let mut count = 0usize;
        while let Some(dialog) = dialogs.next().await.map_err(map_invocation_error)? {
            self.cache_peer(dialog.chat().clone());
            count += 1;
        }
        debug!(session = %self.name, dialogs = count, "Refreshed peer cache from dialogs");
        Ok(())
    }

    fn cached_peer(&self, key: &str) -> Option<Chat> {
        self.shared
            .peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    fn cache_peer(&self, chat: Chat) {
        let mut peers = self.shared.peers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(username) = chat.username() {
            peers.insert(username.to_lowercase(), chat.clone());
        }
        peers.insert(chat.id().to_string(), chat);
    }

    fn stop_updates(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.updates.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for TelegramSession {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_message(&self, destination: &str, text: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let chat = self.resolve(destination).await?;
        self.shared
            .client
            .send_message(&chat, text)
            .await
            .map_err(map_invocation_error)?;
        Ok(())
    }

    fn subscribe(&self, sender: SenderFilter, handler: MessageHandler) {
        debug!(session = %self.name, filter = ?sender, "Registering inbound handler");
        self.shared.subscriptions.add(sender, handler);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stop_updates();
        if let Err(e) = self.shared.client.session().save_to_file(&self.session_path) {
            warn!(session = %self.name, error = %e, "Failed to save session file");
        }
        info!(session = %self.name, "Transport session closed");
        Ok(())
    }
}

impl Drop for TelegramSession {
    fn drop(&mut self) {
        self.stop_updates();
    }
}

/// 未授权时用手机号登录，必要时输入两步验证密码
async fn authorize(client: &Client, credentials: &Credentials) -> Result<()> {
    if client.is_authorized().await.context("检查登录状态失败")? {
        return Ok(());
    }

    info!(account = %credentials.phone_number, "Session not authorized, requesting login code");
    let token = client
        .request_login_code(&credentials.phone_number)
        .await
        .context("请求登录验证码失败")?;
    let code = prompt("Login code", false).await?;

    match client.sign_in(&token, code.trim()).await {
        Ok(_) => {}
        Err(SignInError::PasswordRequired(password_token)) => {
            let password = prompt("Two-step verification password", true).await?;
            client
                .check_password(password_token, password.trim())
                .await
                .context("两步验证失败")?;
        }
        Err(e) => return Err(e).context("登录失败"),
    }

    info!(account = %credentials.phone_number, "Signed in");
    Ok(())
}

/// 在阻塞线程中读取终端输入
async fn prompt(label: &'static str, secret: bool) -> Result<String> {
    let answer = tokio::task::spawn_blocking(move || {
        if secret {
            Password::new().with_prompt(label).interact()
        } else {
            Input::<String>::new().with_prompt(label).interact_text()
        }
    })
    .await
    .context("输入任务异常退出")?;
    answer.with_context(|| format!("读取 {} 失败（需要交互式终端，可先运行 botwatch login）", label))
}

/// 接收更新并把入站消息分发给订阅者；连接出错时标记会话断开
async fn receive_updates(shared: Arc<Shared>) {
    while shared.connected.load(Ordering::SeqCst) {
        match shared.client.next_update().await {
            Ok(Update::NewMessage(message)) if !message.outgoing() => {
                let Some(sender) = message.sender() else {
                    continue;
                };
                let inbound = InboundMessage {
                    sender: Sender {
                        id: sender.id(),
                        username: sender.username().map(str::to_string),
                    },
                    chat_id: message.chat().id(),
                    text: Some(message.text().to_string()),
                };
                shared.subscriptions.dispatch(&inbound);
            }
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "Update stream failed, marking session disconnected");
                shared.connected.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
}

fn map_invocation_error(e: InvocationError) -> TransportError {
    match e {
        InvocationError::Rpc(rpc) => map_rpc_error(rpc.code, &rpc.name, rpc.value),
        other => TransportError::Network(other),
    }
}

/// RPC 错误映射：`FLOOD_WAIT_X` 一类带等待秒数的错误为限流
fn map_rpc_error(code: i32, name: &str, value: Option<u32>) -> TransportError {
    let wait = code == 420 || matches!(name, "FLOOD_WAIT" | "FLOOD_PREMIUM_WAIT" | "SLOWMODE_WAIT");
    if wait {
        return TransportError::RateLimited {
            retry_after: Duration::from_secs(u64::from(value.unwrap_or(1))),
        };
    }

    let description = match value {
        Some(v) => format!("{}_{}", name, v),
        None => name.to_string(),
    };
    match code {
        400 if matches!(name, "USERNAME_NOT_OCCUPIED" | "USERNAME_INVALID" | "PEER_ID_INVALID") => {
            TransportError::UnknownPeer(description)
        }
        _ => TransportError::Api {
            code: i64::from(code),
            description,
        },
    }
}

/// 缓存键：数字 ID 原样保留，用户名去掉 `@` 并转小写
fn peer_key(destination: &str) -> String {
    let destination = destination.trim();
    match destination.parse::<i64>() {
        Ok(id) => id.to_string(),
        Err(_) => destination.trim_start_matches('@').to_lowercase(),
    }
}
