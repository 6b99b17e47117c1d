//! 监控配置 - 从环境变量、配置文件和默认值加载
//!
//! 读取优先级：
//! 1. 命令行参数（由 `main` 在加载后覆盖）
//! 2. 环境变量 `TELEGRAM_API_ID`、`TARGET_BOT` 等
//! 3. 配置文件 `~/.config/botwatch/config.json`（或 `--config` 指定的路径）
//! 4. 内置默认值
//!
//! 配置只在启动时加载一次，之后以 `Arc` 共享，不再修改。

use crate::notification::formatter::{MessageTemplates, DEFAULT_ALERT_TEMPLATE, DEFAULT_PROBE_COMMAND};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// 等待响应超时（秒）
pub const DEFAULT_RESPONSE_TIMEOUT_SECS: u64 = 60;
/// 检查间隔（秒）
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 10;
/// 出错后的退避时间（秒），避免紧密失败循环
pub const DEFAULT_ERROR_BACKOFF_SECS: u64 = 1;
/// 崩溃后重启延迟（秒）
pub const DEFAULT_RESTART_DELAY_SECS: u64 = 5;
/// 默认会话名称
pub const DEFAULT_SESSION_NAME: &str = "bot_monitor_session";

pub const ENV_API_ID: &str = "TELEGRAM_API_ID";
pub const ENV_API_HASH: &str = "TELEGRAM_API_HASH";
pub const ENV_PHONE_NUMBER: &str = "TELEGRAM_PHONE_NUMBER";
pub const ENV_TARGET_BOT: &str = "TARGET_BOT";
pub const ENV_ALERT_USER_IDS: &str = "ALERT_USER_IDS";
pub const ENV_SESSION_NAME: &str = "SESSION_NAME";
pub const ENV_RESPONSE_TIMEOUT: &str = "RESPONSE_TIMEOUT_SECS";
pub const ENV_CHECK_INTERVAL: &str = "CHECK_INTERVAL_SECS";
pub const ENV_ERROR_BACKOFF: &str = "ERROR_BACKOFF_SECS";
pub const ENV_RESTART_DELAY: &str = "RESTART_DELAY_SECS";
pub const ENV_MAX_RESTARTS: &str = "MAX_RESTARTS";
pub const ENV_PROBE_COMMAND: &str = "PROBE_COMMAND";
pub const ENV_ALERT_TEMPLATE: &str = "ALERT_TEMPLATE";

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("failed to read config file {}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// 客户端凭据
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// 数字客户端 ID
    pub api_id: i32,
    /// 客户端密钥
    pub api_hash: String,
    /// 账号（手机号）
    pub phone_number: String,
}

// 密钥不进日志
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_id", &self.api_id)
            .field("api_hash", &"<redacted>")
            .field("phone_number", &self.phone_number)
            .finish()
    }
}

/// 监控配置（启动后不可变）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// 被监控的 bot（如 `@my_bot`）
    pub target: String,
    /// 告警接收者，按配置顺序发送
    pub recipients: Vec<String>,
    /// 等待响应的超时时间
    pub response_timeout: Duration,
    /// 两次检查之间的间隔
    pub check_interval: Duration,
    /// 监控循环出错后的退避时间
    pub error_backoff: Duration,
    /// 会话崩溃后的重启延迟
    pub restart_delay: Duration,
    /// 最大重启次数，`None` 表示无限重启
    pub max_restarts: Option<u32>,
    /// 探测与告警消息模板
    pub templates: MessageTemplates,
}

impl MonitorConfig {
    /// 用默认时间参数创建配置
    pub fn new(target: impl Into<String>, recipients: Vec<String>) -> Self {
        Self {
            target: target.into(),
            recipients,
            response_timeout: Duration::from_secs(DEFAULT_RESPONSE_TIMEOUT_SECS),
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            error_backoff: Duration::from_secs(DEFAULT_ERROR_BACKOFF_SECS),
            restart_delay: Duration::from_secs(DEFAULT_RESTART_DELAY_SECS),
            max_restarts: None,
            templates: MessageTemplates::default(),
        }
    }
}

/// 完整应用配置
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub credentials: Credentials,
    pub monitor: MonitorConfig,
    /// 会话名称，登录状态保存在 `session_path()`
    pub session_name: String,
}

/// 配置文件内容（所有字段可选）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub api_id: Option<i32>,
    pub api_hash: Option<String>,
    pub phone_number: Option<String>,
    pub target_bot: Option<String>,
    pub alert_user_ids: Option<Vec<String>>,
    pub session_name: Option<String>,
    pub response_timeout_secs: Option<u64>,
    pub check_interval_secs: Option<u64>,
    pub error_backoff_secs: Option<u64>,
    pub restart_delay_secs: Option<u64>,
    pub max_restarts: Option<u32>,
    pub probe_command: Option<String>,
    pub alert_template: Option<String>,
}

impl FileConfig {
    /// 默认配置文件路径
    pub fn default_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.json"))
    }

    /// 加载配置文件
    ///
    /// 显式指定的路径必须存在；默认路径不存在时返回空配置。
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match Self::default_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if required {
                return Err(ConfigError::File {
                    path,
                    source: "file does not exist".into(),
                });
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::File {
            path: path.clone(),
            source: e.into(),
        })?;
        let config = serde_json::from_str(&content).map_err(|e| ConfigError::File {
            path: path.clone(),
            source: e.into(),
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }
}

impl AppConfig {
    /// 从进程环境和配置文件加载
    pub fn load(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = FileConfig::load(config_path)?;
        Self::from_sources(|key| std::env::var(key).ok(), &file)
    }

    /// 从任意键值来源加载（测试时不必修改进程环境）
    pub fn from_sources<F>(lookup: F, file: &FileConfig) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = Source { lookup };

        let api_id_raw = source.string(ENV_API_ID, file.api_id.map(|id| id.to_string()));
        let api_hash = source.string(ENV_API_HASH, file.api_hash.clone());
        let phone_number = source.string(ENV_PHONE_NUMBER, file.phone_number.clone());
        let target = source.string(ENV_TARGET_BOT, file.target_bot.clone());
        let recipients = match (source.lookup)(ENV_ALERT_USER_IDS) {
            Some(raw) if !raw.trim().is_empty() => parse_recipients(&raw),
            _ => file
                .alert_user_ids
                .iter()
                .flatten()
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .collect(),
        };

        let mut missing = Vec::new();
        if api_id_raw.is_none() {
            missing.push(ENV_API_ID);
        }
        if api_hash.is_none() {
            missing.push(ENV_API_HASH);
        }
        if phone_number.is_none() {
            missing.push(ENV_PHONE_NUMBER);
        }
        if target.is_none() {
            missing.push(ENV_TARGET_BOT);
        }
        if recipients.is_empty() {
            missing.push(ENV_ALERT_USER_IDS);
        }

        let (Some(api_id_raw), Some(api_hash), Some(phone_number), Some(target)) =
            (api_id_raw, api_hash, phone_number, target)
        else {
            return Err(ConfigError::Missing(missing));
        };
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let api_id = api_id_raw.parse::<i32>().map_err(|e| ConfigError::Invalid {
            key: ENV_API_ID,
            value: api_id_raw.clone(),
            reason: e.to_string(),
        })?;

        let response_timeout =
            source.secs(ENV_RESPONSE_TIMEOUT, file.response_timeout_secs, DEFAULT_RESPONSE_TIMEOUT_SECS)?;
        if response_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                key: ENV_RESPONSE_TIMEOUT,
                value: "0".to_string(),
                reason: "timeout must be positive".to_string(),
            });
        }

        let max_restarts = match (source.lookup)(ENV_MAX_RESTARTS).filter(|v| !v.trim().is_empty()) {
            Some(raw) => Some(raw.trim().parse::<u32>().map_err(|e| ConfigError::Invalid {
                key: ENV_MAX_RESTARTS,
                value: raw.clone(),
                reason: e.to_string(),
            })?),
            None => file.max_restarts,
        };

        let templates = MessageTemplates {
            probe: source
                .string(ENV_PROBE_COMMAND, file.probe_command.clone())
                .unwrap_or_else(|| DEFAULT_PROBE_COMMAND.to_string()),
            alert: source
                .string(ENV_ALERT_TEMPLATE, file.alert_template.clone())
                .unwrap_or_else(|| DEFAULT_ALERT_TEMPLATE.to_string()),
        };

        let monitor = MonitorConfig {
            target,
            recipients,
            response_timeout,
            check_interval: source.secs(ENV_CHECK_INTERVAL, file.check_interval_secs, DEFAULT_CHECK_INTERVAL_SECS)?,
            error_backoff: source.secs(ENV_ERROR_BACKOFF, file.error_backoff_secs, DEFAULT_ERROR_BACKOFF_SECS)?,
            restart_delay: source.secs(ENV_RESTART_DELAY, file.restart_delay_secs, DEFAULT_RESTART_DELAY_SECS)?,
            max_restarts,
            templates,
        };

        Ok(Self {
            credentials: Credentials {
                api_id,
                api_hash,
                phone_number,
            },
            monitor,
            session_name: source
                .string(ENV_SESSION_NAME, file.session_name.clone())
                .unwrap_or_else(|| DEFAULT_SESSION_NAME.to_string()),
        })
    }

    /// 会话文件路径
    ///
    /// 名称含路径分隔符或扩展名时按路径使用，否则放在 `~/.config/botwatch/<name>.session`。
    pub fn session_path(&self) -> Option<PathBuf> {
        let name = Path::new(&self.session_name);
        if name.components().count() > 1 || name.extension().is_some() {
            return Some(name.to_path_buf());
        }
        config_dir().map(|dir| dir.join(format!("{}.session", self.session_name)))
    }

    /// 可展示的配置（密钥脱敏）
    pub fn redacted_view(&self) -> serde_json::Value {
        serde_json::json!({
            "api_id": self.credentials.api_id,
            "api_hash": "<redacted>",
            "phone_number": self.credentials.phone_number,
            "session_name": self.session_name,
            "session_path": self.session_path().map(|p| p.display().to_string()),
            "target_bot": self.monitor.target,
            "alert_user_ids": self.monitor.recipients,
            "response_timeout_secs": self.monitor.response_timeout.as_secs(),
            "check_interval_secs": self.monitor.check_interval.as_secs(),
            "error_backoff_secs": self.monitor.error_backoff.as_secs(),
            "restart_delay_secs": self.monitor.restart_delay.as_secs(),
            "max_restarts": self.monitor.max_restarts,
            "probe_command": self.monitor.templates.probe,
            "alert_template": self.monitor.templates.alert,
        })
    }
}

/// `~/.config/botwatch`
fn config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("botwatch"))
}

/// 拆分逗号分隔的接收者列表，忽略空项
pub fn parse_recipients(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(str::to_string)
        .collect()
}

struct Source<F> {
    lookup: F,
}

impl<F> Source<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// 环境变量优先，空字符串视为未设置
    fn string(&self, key: &str, fallback: Option<String>) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| fallback.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
    }

    fn secs(&self, key: &'static str, fallback: Option<u64>, default: u64) -> Result<Duration, ConfigError> {
        match (self.lookup)(key).filter(|v| !v.trim().is_empty()) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| ConfigError::Invalid {
                    key,
                    value: raw.clone(),
                    reason: e.to_string(),
                }),
            None => Ok(Duration::from_secs(fallback.unwrap_or(default))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn full_env() -> Vec<(&'static str, &'static str)> {
        vec![
            (ENV_API_ID, "12345"),
            (ENV_API_HASH, "secret"),
            (ENV_PHONE_NUMBER, "+15550001111"),
            (ENV_TARGET_BOT, "@status_bot"),
            (ENV_ALERT_USER_IDS, "111, 222"),
        ]
    }

    #[test]
    fn test_load_with_defaults() {
        let config = AppConfig::from_sources(env(&full_env()), &FileConfig::default()).unwrap();

        assert_eq!(config.credentials.api_id, 12345);
        assert_eq!(config.monitor.target, "@status_bot");
        assert_eq!(config.monitor.recipients, vec!["111", "222"]);
        assert_eq!(config.monitor.response_timeout, Duration::from_secs(60));
        assert_eq!(config.monitor.check_interval, Duration::from_secs(10));
        assert_eq!(config.monitor.error_backoff, Duration::from_secs(1));
        assert_eq!(config.monitor.restart_delay, Duration::from_secs(5));
        assert_eq!(config.monitor.max_restarts, None);
        assert_eq!(config.monitor.templates.probe, "/check");
        assert_eq!(config.session_name, DEFAULT_SESSION_NAME);
    }

    #[test]
    fn test_missing_values_are_all_reported() {
        let result = AppConfig::from_sources(env(&[(ENV_API_ID, "1")]), &FileConfig::default());

        match result {
            Err(ConfigError::Missing(keys)) => {
                assert_eq!(
                    keys,
                    vec![ENV_API_HASH, ENV_PHONE_NUMBER, ENV_TARGET_BOT, ENV_ALERT_USER_IDS]
                );
            }
            other => panic!("expected Missing, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_target_only() {
        let pairs: Vec<_> = full_env()
            .into_iter()
            .filter(|(k, _)| *k != ENV_TARGET_BOT)
            .collect();
        let err = AppConfig::from_sources(env(&pairs), &FileConfig::default()).unwrap_err();
        assert!(err.to_string().contains(ENV_TARGET_BOT));
    }

    #[test]
    fn test_blank_recipient_list_counts_as_missing() {
        let mut pairs = full_env();
        pairs.retain(|(k, _)| *k != ENV_ALERT_USER_IDS);
        pairs.push((ENV_ALERT_USER_IDS, " , ,"));

        let err = AppConfig::from_sources(env(&pairs), &FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(ref keys) if keys == &vec![ENV_ALERT_USER_IDS]));
    }

    #[test]
    fn test_non_numeric_api_id_is_invalid() {
        let mut pairs = full_env();
        pairs.retain(|(k, _)| *k != ENV_API_ID);
        pairs.push((ENV_API_ID, "abc"));

        let err = AppConfig::from_sources(env(&pairs), &FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_API_ID, .. }));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut pairs = full_env();
        pairs.push((ENV_RESPONSE_TIMEOUT, "0"));

        let err = AppConfig::from_sources(env(&pairs), &FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_RESPONSE_TIMEOUT, .. }));
    }

    #[test]
    fn test_env_overrides_file() {
        let file = FileConfig {
            target_bot: Some("@file_bot".to_string()),
            response_timeout_secs: Some(30),
            alert_user_ids: Some(vec!["999".to_string()]),
            max_restarts: Some(3),
            ..Default::default()
        };

        let config = AppConfig::from_sources(env(&full_env()), &file).unwrap();
        assert_eq!(config.monitor.target, "@status_bot");
        assert_eq!(config.monitor.recipients, vec!["111", "222"]);
        assert_eq!(config.monitor.response_timeout, Duration::from_secs(30));
        assert_eq!(config.monitor.max_restarts, Some(3));
    }

    #[test]
    fn test_file_supplies_required_values() {
        let file = FileConfig {
            api_id: Some(7),
            api_hash: Some("hash".to_string()),
            phone_number: Some("+1".to_string()),
            target_bot: Some("@file_bot".to_string()),
            alert_user_ids: Some(vec!["1".to_string(), " ".to_string(), "2".to_string()]),
            ..Default::default()
        };

        let config = AppConfig::from_sources(env(&[]), &file).unwrap();
        assert_eq!(config.credentials.api_id, 7);
        assert_eq!(config.credentials.api_hash, "hash");
        assert_eq!(config.monitor.recipients, vec!["1", "2"]);
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"target_bot": "@json_bot", "check_interval_secs": 15}"#).unwrap();

        let file = FileConfig::load(Some(&path)).unwrap();
        assert_eq!(file.target_bot.as_deref(), Some("@json_bot"));
        assert_eq!(file.check_interval_secs, Some(15));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileConfig::load(Some(&dir.path().join("nope.json")));
        assert!(matches!(result, Err(ConfigError::File { .. })));
    }

    #[test]
    fn test_malformed_file_keeps_parse_error_as_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = FileConfig::load(Some(&path)).unwrap_err();
        let source = std::error::Error::source(&err).expect("parse error should be kept");
        assert!(source.downcast_ref::<serde_json::Error>().is_some());
    }

    #[test]
    fn test_session_path() {
        let mut config = AppConfig::from_sources(env(&full_env()), &FileConfig::default()).unwrap();
        let default = config.session_path().unwrap();
        assert!(default.ends_with(".config/botwatch/bot_monitor_session.session"));

        config.session_name = "/var/lib/botwatch/main.session".to_string();
        assert_eq!(
            config.session_path(),
            Some(PathBuf::from("/var/lib/botwatch/main.session"))
        );
    }

    #[test]
    fn test_api_id_out_of_range_is_invalid() {
        let mut pairs = full_env();
        pairs.retain(|(k, _)| *k != ENV_API_ID);
        pairs.push((ENV_API_ID, "99999999999"));

        let err = AppConfig::from_sources(env(&pairs), &FileConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: ENV_API_ID, .. }));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let config = AppConfig::from_sources(env(&full_env()), &FileConfig::default()).unwrap();
        let debug = format!("{:?}", config.credentials);
        assert!(!debug.contains("secret"));
        assert_eq!(config.redacted_view()["api_hash"], "<redacted>");
    }

    #[test]
    fn test_parse_recipients() {
        assert_eq!(parse_recipients("1,2 , 3,,"), vec!["1", "2", "3"]);
        assert!(parse_recipients("").is_empty());
    }
}
