//! Settings: operator configuration loaded from TOML.
//!
//! Priority order mirrors the teacher's `Config::load()`: an env var
//! override, then a local file, then a user config directory, then
//! defaults. CRUD over this file by the operator is explicitly out of
//! scope; only loading is implemented here.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Settings {
    /// Telegram bot token. Usually left unset here and sourced from
    /// `TELEGRAM_BOT_TOKEN` instead; see [`Settings::bot_token`].
    #[serde(default)]
    pub bot_token: Option<String>,

    #[serde(default)]
    pub bot_username: String,

    #[serde(default)]
    pub allowed_chat_ids: Vec<i64>,

    #[serde(default)]
    pub allowed_user_ids: Vec<i64>,

    #[serde(default)]
    pub strict_allowlist: bool,

    #[serde(default)]
    pub require_mention_in_groups: bool,

    #[serde(default)]
    pub threaded_mode: bool,

    #[serde(default = "default_poll_timeout_seconds")]
    pub poll_timeout_seconds: u64,

    #[serde(default = "default_rpc_prompt_timeout_seconds")]
    pub rpc_prompt_timeout_seconds: u64,

    #[serde(default = "default_lock_refresh_ms")]
    pub lock_refresh_ms: i64,

    #[serde(default = "default_lock_stale_ms")]
    pub lock_stale_ms: i64,

    #[serde(default)]
    pub data_root: Option<PathBuf>,

    #[serde(default)]
    pub agent_binary: Option<String>,

    /// Working directory handed to the agent subprocess and used to derive
    /// its session directory. Defaults to the worker's own cwd at startup.
    #[serde(default)]
    pub agent_cwd: Option<PathBuf>,

    /// Root directory for agent session JSONL files. Defaults to
    /// [`crate::paths::default_sessions_root`].
    #[serde(default)]
    pub sessions_root: Option<PathBuf>,

    #[serde(default)]
    pub stt: SttSettings,

    #[serde(default)]
    pub tts: TtsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SttSettings {
    #[serde(default = "default_stt_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TtsSettings {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub voice_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_log_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_log_max_files")]
    pub max_files: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: None,
            max_bytes: default_log_max_bytes(),
            max_files: default_log_max_files(),
        }
    }
}

fn default_poll_timeout_seconds() -> u64 {
    30
}
fn default_rpc_prompt_timeout_seconds() -> u64 {
    60
}
fn default_lock_refresh_ms() -> i64 {
    15_000
}
fn default_lock_stale_ms() -> i64 {
    90_000
}
fn default_stt_provider() -> String {
    "elevenlabs".to_string()
}
fn default_log_max_bytes() -> u64 {
    5 * 1024 * 1024
}
fn default_log_max_files() -> u32 {
    5
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bot_token: None,
            bot_username: String::new(),
            allowed_chat_ids: Vec::new(),
            allowed_user_ids: Vec::new(),
            strict_allowlist: false,
            require_mention_in_groups: true,
            threaded_mode: false,
            poll_timeout_seconds: default_poll_timeout_seconds(),
            rpc_prompt_timeout_seconds: default_rpc_prompt_timeout_seconds(),
            lock_refresh_ms: default_lock_refresh_ms(),
            lock_stale_ms: default_lock_stale_ms(),
            data_root: None,
            agent_binary: None,
            agent_cwd: None,
            sessions_root: None,
            stt: SttSettings::default(),
            tts: TtsSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    /// Load configuration.
    ///
    /// Priority:
    /// 1. `RHO_TELEGRAM_CONFIG` environment variable
    /// 2. `./config.toml`
    /// 3. `~/.config/rho/telegram.toml`
    /// 4. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var("RHO_TELEGRAM_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                return Self::load_from(p);
            }
        }

        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Self::load_from(local);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config/rho/telegram.toml");
            if user_config.exists() {
                return Self::load_from(user_config);
            }
        }

        Ok(Self::default())
    }

    pub fn load_from(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::ParseError {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Resolve the bot token: env var (name configurable, default
    /// `TELEGRAM_BOT_TOKEN`) takes priority over the config file.
    pub fn bot_token(&self, env_var_name: &str) -> Option<String> {
        std::env::var(env_var_name).ok().or_else(|| self.bot_token.clone())
    }

    /// Working directory to hand the agent subprocess. Falls back to the
    /// worker process's own current directory.
    pub fn resolved_agent_cwd(&self) -> std::io::Result<PathBuf> {
        match &self.agent_cwd {
            Some(dir) => Ok(dir.clone()),
            None => std::env::current_dir(),
        }
    }

    /// Root directory for agent session JSONL files.
    pub fn resolved_sessions_root(&self) -> PathBuf {
        self.sessions_root.clone().unwrap_or_else(crate::paths::default_sessions_root)
    }
}
