#![forbid(unsafe_code)]

//! `discodex`: console front-end for the agent bridge.
//!
//! Reads prompts from stdin, one per line, and prints the agent's replies.
//! `/reset` starts a new conversation; `/quit` exits.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

use discodex::bridge::observer::BridgeObserver;
use discodex::config::{default_config_path, Transport};
use discodex::runner::{build_runner, ChatRunner, TurnContext};
use discodex::text::{split_message, CHAT_MESSAGE_LIMIT};
use discodex::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum TransportArg {
    Rpc,
    Tail,
    Echo,
}

impl From<TransportArg> for Transport {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Rpc => Self::Rpc,
            TransportArg::Tail => Self::Tail,
            TransportArg::Echo => Self::Echo,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "discodex", about = "Chat with a Codex agent from the console", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Channel id whose settings apply to this console.
    #[arg(long, default_value = "console")]
    channel: String,

    /// Override the configured transport.
    #[arg(long, value_enum)]
    transport: Option<TransportArg>,

    /// User tag forwarded with every prompt.
    #[arg(long, env = "USER")]
    user: Option<String>,
}

/// Prints reply chunks as they stream in.
struct ConsoleObserver;

impl BridgeObserver for ConsoleObserver {
    fn on_reasoning(&self, owner: &str, text: &str) {
        debug!(owner, text, "thinking");
    }

    fn on_stream_delta(&self, _owner: &str, _request_id: u64, delta: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(delta.as_bytes());
        let _ = out.flush();
    }

    fn on_stream_done(&self, _owner: &str, _request_id: u64, _text: &str) {
        println!();
    }

    fn on_process_up(&self) {
        info!("agent online");
    }

    fn on_process_down(&self) {
        info!("agent offline");
    }

    fn streams_replies(&self) -> bool {
        true
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("discodex console bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    // ── Load configuration ──────────────────────────────
    let mut config = load_config(args.config.as_deref())?;
    if let Some(transport) = args.transport {
        config.codex.transport = transport.into();
    }
    let channel = config.channel(&args.channel);
    info!(
        channel = %channel.channel_id,
        mapped = config.is_mapped(&channel.channel_id),
        transport = ?config.codex.transport,
        "configuration loaded"
    );

    let runner = build_runner(&config, Arc::new(ConsoleObserver));

    // ── Prompt loop ─────────────────────────────────────
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            () = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            info!("stdin closed");
            break;
        };

        match line.trim() {
            "" => {}
            "/quit" => break,
            "/reset" => {
                runner.reset(&channel.channel_id).await;
                println!("(conversation reset)");
            }
            prompt => {
                let ctx = TurnContext {
                    user_tag: args.user.clone(),
                    ..TurnContext::default()
                };
                let turn = runner.chat_multi(&channel, prompt, &ctx);
                tokio::pin!(turn);
                let result = tokio::select! {
                    result = &mut turn => result,
                    () = &mut shutdown => {
                        ctx.cancel.cancel();
                        let _ = turn.await;
                        info!("shutdown signal received during turn");
                        break;
                    }
                };
                print_turn(result);
            }
        }
    }

    runner.close().await;
    info!("discodex shut down");
    Ok(())
}

fn print_turn(result: Result<Vec<String>>) {
    match result {
        Ok(messages) => {
            for message in &messages {
                for chunk in split_message(message, CHAT_MESSAGE_LIMIT) {
                    println!("{chunk}");
                }
            }
        }
        Err(err) => {
            error!(%err, "turn failed");
            println!("[error] {err}");
        }
    }
}

/// Explicit path, else `$DISCODEX_CONFIG` / `discodex.toml` if present,
/// else built-in defaults.
fn load_config(explicit: Option<&std::path::Path>) -> Result<GlobalConfig> {
    if let Some(path) = explicit {
        return GlobalConfig::load_from_path(path);
    }
    let path = default_config_path();
    if path.exists() {
        GlobalConfig::load_from_path(&path)
    } else {
        debug!(path = %path.display(), "no config file, using defaults");
        GlobalConfig::from_toml_str("")
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
