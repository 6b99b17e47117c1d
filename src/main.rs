//! Bot Liveness Monitor CLI
//!
//! 定期向目标 bot 发送探测命令，超时未响应时向告警接收者发送警告。

use anyhow::Result;
use bot_liveness_monitor::{
    AppConfig, BotMonitor, CheckOutcome, SessionConnector, Supervisor, SupervisorExit,
    TelegramConnector,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "botwatch")]
#[command(about = "Bot Liveness Monitor - 监控 bot 是否响应并告警")]
#[command(version)]
struct Cli {
    /// 配置文件路径（默认 ~/.config/botwatch/config.json）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// 持续监控（默认命令）
    Run {
        /// 只记录告警，不实际发送
        #[arg(long)]
        dry_run: bool,
        /// 响应超时（秒），覆盖配置
        #[arg(long)]
        timeout: Option<u64>,
        /// 检查间隔（秒），覆盖配置
        #[arg(long, short)]
        interval: Option<u64>,
    },
    /// 执行一次检查后退出（响应为 0，否则为 2）
    Check {
        /// 超时时实际发送告警
        #[arg(long)]
        alert: bool,
        /// 响应超时（秒），覆盖配置
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// 交互式登录并保存会话文件，之后 run/check 无需再输入验证码
    Login,
    /// 显示生效的配置（密钥脱敏）
    Config {
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
}

/// 加载配置，缺失必填项时以退出码 1 终止
fn load_config(path: Option<&std::path::Path>) -> AppConfig {
    match AppConfig::load(path) {
        Ok(config) => config,
        Err(e) => {
            let e = anyhow::Error::from(e);
            error!(error = %format!("{:#}", e), "Missing or invalid configuration");
            eprintln!("配置错误: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// 等待 Ctrl+C（Unix 下也响应 SIGTERM）
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Received shutdown signal");
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Commands::Run {
        dry_run: false,
        timeout: None,
        interval: None,
    }) {
        Commands::Run {
            dry_run,
            timeout,
            interval,
        } => {
            let mut config = load_config(cli.config.as_deref());
            if let Some(secs) = timeout {
                config.monitor.response_timeout = Duration::from_secs(secs.max(1));
            }
            if let Some(secs) = interval {
                config.monitor.check_interval = Duration::from_secs(secs);
            }

            let connector: Arc<dyn SessionConnector> = Arc::new(TelegramConnector::new(&config)?);
            let supervisor = Supervisor::new(connector, Arc::new(config.monitor))
                .with_dry_run(dry_run);

            match supervisor.run(shutdown_signal()).await {
                SupervisorExit::Interrupted => info!("Shutdown complete"),
                SupervisorExit::RestartsExhausted => {
                    anyhow::bail!("monitor stopped after exhausting restarts")
                }
            }
        }
        Commands::Check { alert, timeout } => {
            let mut config = load_config(cli.config.as_deref());
            if let Some(secs) = timeout {
                config.monitor.response_timeout = Duration::from_secs(secs.max(1));
            }

            let connector = TelegramConnector::new(&config)?;
            let transport = connector.connect().await?;
            let monitor = BotMonitor::new(Arc::clone(&transport), Arc::new(config.monitor))
                .with_dry_run(!alert);

            let outcome = monitor.run_once().await;
            if let Err(e) = transport.disconnect().await {
                error!(error = %e, "Failed to close transport session");
            }

            match &outcome {
                CheckOutcome::Responded { elapsed } => {
                    println!("✅ 已响应 ({} ms)", elapsed.as_millis());
                }
                CheckOutcome::TimedOut { alerts } => {
                    println!("❌ 超时未响应");
                    for (recipient, result) in alerts {
                        println!("  {} -> {:?}", recipient, result);
                    }
                }
                CheckOutcome::SendFailed(reason) => println!("❌ 探测发送失败: {}", reason),
                CheckOutcome::RateLimited(wait) => println!("⏳ 被限流，等待 {} 秒", wait.as_secs()),
                CheckOutcome::Stopped => println!("已停止"),
            }

            if !outcome.is_alive() {
                std::process::exit(2);
            }
        }
        Commands::Login => {
            let config = load_config(cli.config.as_deref());
            let connector = TelegramConnector::new(&config)?;
            let transport = connector.connect().await?;
            transport.disconnect().await?;
            if let Some(path) = config.session_path() {
                println!("✅ 已登录，会话保存在 {}", path.display());
            }
        }
        Commands::Config { json } => {
            let config = load_config(cli.config.as_deref());
            let view = config.redacted_view();
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else if let Some(fields) = view.as_object() {
                for (key, value) in fields {
                    println!("  {}: {}", key, value);
                }
            }
        }
    }

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // 工作目录下的 .env 只补充未设置的变量，已有环境变量优先
    let dotenv = dotenvy::dotenv();

    // 通过 RUST_LOG 环境变量控制日志级别，默认为 info
    // 例如: RUST_LOG=debug botwatch run
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bot_liveness_monitor=info,botwatch=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .init();

    match dotenv {
        Ok(path) => debug!(path = %path.display(), "Loaded .env file"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "Failed to load .env file"),
    }

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        error!(error = ?e, "Fatal error");
        std::process::exit(1);
    }
}
