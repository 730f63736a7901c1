//! rho Telegram bridge — a single-tenant Telegram frontend for the `pi`
//! agent, speaking the raw Bot API over long polling and the agent's
//! line-delimited JSON RPC protocol over a subprocess pipe.

mod client;
mod format;
mod supervisor;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use client::{HttpTelegramClient, TelegramClient};
use rho_bridge_core::rpc::{RpcConfig, RpcRuntime};
use rho_bridge_core::stt::{ElevenLabsStt, SttProvider};
use rho_bridge_core::tts::{ElevenLabsTts, TtsProvider};
use rho_bridge_core::{paths, DataPaths, Settings};
use tracing_subscriber::prelude::*;
use worker::WorkerRuntime;

/// rho Telegram bridge — AI agent Telegram interface
#[derive(Parser)]
#[command(name = "rho-telegram")]
struct Args {
    /// Path to a custom config file (overrides default search locations)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

const BOT_TOKEN_ENV_VAR: &str = "TELEGRAM_BOT_TOKEN";
const RPC_DISABLE_ENV_VAR: &str = "RHO_TELEGRAM_DISABLE";
const DEFAULT_AGENT_BINARY: &str = "pi";

/// Default tracing directives enabling info-level logs for this crate and rho-bridge-core.
const DEFAULT_DIRECTIVES: &[&str] = &["rho_telegram=info", "rho_bridge_core=info"];

/// Build the default `EnvFilter`: RUST_LOG (if set) plus our default directives.
fn default_env_filter() -> anyhow::Result<tracing_subscriber::EnvFilter> {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in DEFAULT_DIRECTIVES {
        filter = filter.add_directive(directive.parse()?);
    }
    Ok(filter)
}

/// Initialize the tracing subscriber. Stdout-only unless `[logging]` names a
/// directory, in which case a rolling file layer is added alongside stdout.
///
/// Returns the non-blocking writer guard, which must be held for the
/// process's lifetime.
fn init_tracing(settings: &Settings) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(directory) = &settings.logging.directory else {
        tracing_subscriber::fmt().with_env_filter(default_env_filter()?).init();
        return Ok(None);
    };

    if let Err(e) = std::fs::create_dir_all(directory) {
        eprintln!("Warning: failed to create log directory '{}': {e}. Falling back to stdout-only.", directory.display());
        tracing_subscriber::fmt().with_env_filter(default_env_filter()?).init();
        return Ok(None);
    }

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("rho-telegram")
        .filename_suffix("log")
        .max_log_files(settings.logging.max_files as usize)
        .build(directory)
        .context("failed to create rolling file appender")?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = default_env_filter()?;
    let stdout_layer = tracing_subscriber::fmt::layer();
    let file_layer = tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false);

    tracing_subscriber::registry().with(env_filter).with(stdout_layer).with(file_layer).init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => Settings::load_from(path).context("failed to load config")?,
        None => Settings::load().context("failed to load config")?,
    };

    let _guard = init_tracing(&settings)?;
    tracing::info!("starting rho-telegram");

    let token = settings
        .bot_token(BOT_TOKEN_ENV_VAR)
        .context("bot token required: set TELEGRAM_BOT_TOKEN env var or bot_token in config")?;

    let root = settings.data_root.clone().unwrap_or_else(DataPaths::default_root);
    paths::ensure_root_exists(&root).context("creating data root")?;
    let data_paths = DataPaths::new(root);

    let client = Arc::new(HttpTelegramClient::new(token));

    let mut bot_username = settings.bot_username.clone();
    if bot_username.is_empty() {
        bot_username = client.get_me_username().await.context("fetching bot identity")?;
        tracing::info!(bot_username, "resolved bot username via getMe");
    }

    let rpc_config = RpcConfig {
        agent_binary: settings.agent_binary.clone().unwrap_or_else(|| DEFAULT_AGENT_BINARY.to_string()),
        disable_env_var: RPC_DISABLE_ENV_VAR.to_string(),
    };
    let rpc = Arc::new(RpcRuntime::new(rpc_config, bot_username.clone()));

    let stt: Option<Arc<dyn SttProvider>> = settings
        .stt
        .api_key
        .clone()
        .filter(|key| !key.is_empty())
        .map(|key| {
            let model = settings.stt.model.clone().unwrap_or_else(|| "scribe_v1".to_string());
            Arc::new(ElevenLabsStt::new(key, model)) as Arc<dyn SttProvider>
        });
    if stt.is_none() {
        tracing::warn!("no STT API key configured — voice messages will be rejected");
    }

    let tts: Option<Arc<dyn TtsProvider>> = settings
        .tts
        .api_key
        .clone()
        .filter(|key| !key.is_empty())
        .zip(settings.tts.voice_id.clone())
        .map(|(key, voice_id)| Arc::new(ElevenLabsTts::new(key, voice_id)) as Arc<dyn TtsProvider>);
    if tts.is_none() {
        tracing::warn!("no TTS credentials configured — /tts requests will be rejected");
    }

    let worker = Arc::new(WorkerRuntime::new(
        client,
        rpc.clone(),
        stt,
        tts,
        settings.clone(),
        data_paths.clone(),
        bot_username,
    ));

    supervisor::run(worker, rpc, &settings, &data_paths).await
}
