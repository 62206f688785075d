//! Daemon configuration.
//!
//! Loaded from `{config-dir}/config.toml`, overridable field-by-field with
//! `WARDEN_*` environment variables. Credentials never appear in `Debug`
//! output or logs; on unix the config file must be mode 0600.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::paths;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    Missing(PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("config file {0} must be mode 0600 (run `warden doctor --fix`)")]
    Permissions(PathBuf),
    #[error("unknown channel kind '{0}'")]
    UnknownChannel(String),
    #[error("channel '{channel}' selected but {field} is not configured")]
    MissingCredential {
        channel: &'static str,
        field: &'static str,
    },
}

/// A credential that must never leak through Debug/Display.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Which transport carries prompts to the remote human.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    #[default]
    Telegram,
    /// Local operator terminal; no network. Used for trials and tests.
    Console,
    /// Telegram plus console echo.
    Multi,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Telegram => "telegram",
            ChannelKind::Console => "console",
            ChannelKind::Multi => "multi",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "telegram" => Ok(ChannelKind::Telegram),
            "console" => Ok(ChannelKind::Console),
            "multi" => Ok(ChannelKind::Multi),
            other => Err(ConfigError::UnknownChannel(other.to_string())),
        }
    }
}

/// OFF / ASSIST / FULL — whether policy decisions are executed automatically.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutonomyMode {
    Off,
    #[default]
    Assist,
    Full,
}

impl AutonomyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutonomyMode::Off => "off",
            AutonomyMode::Assist => "assist",
            AutonomyMode::Full => "full",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(AutonomyMode::Off),
            "assist" => Some(AutonomyMode::Assist),
            "full" => Some(AutonomyMode::Full),
            _ => None,
        }
    }
}

impl std::fmt::Display for AutonomyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_timeout_seconds() -> u64 {
    600
}

fn default_silence_seconds() -> f64 {
    2.0
}

fn default_echo_suppress_ms() -> u64 {
    500
}

fn default_max_rows() -> u64 {
    10_000
}

fn default_policy_path() -> PathBuf {
    paths::default_policy_file()
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptSettings {
    /// TTL for a prompt awaiting a human reply.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Output silence before the idle watchdog fires.
    #[serde(default = "default_silence_seconds")]
    pub silence_seconds: f64,
    /// Whether free-text replies from the channel are accepted at all.
    #[serde(default)]
    pub free_text_enabled: bool,
    /// Whether password prompts may be answered from the channel. Off by
    /// default; the reply value is injected straight into the child and
    /// only its length is ever persisted.
    #[serde(default)]
    pub password_reply_enabled: bool,
    /// Echo-suppression window after an injection.
    #[serde(default = "default_echo_suppress_ms")]
    pub echo_suppress_ms: u64,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
            silence_seconds: default_silence_seconds(),
            free_text_enabled: false,
            password_reply_enabled: false,
            echo_suppress_ms: default_echo_suppress_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramSettings {
    #[serde(default)]
    pub bot_token: Secret,
    /// Chat the daemon sends prompts to.
    #[serde(default)]
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicySettings {
    #[serde(default = "default_policy_path")]
    pub path: PathBuf,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            path: default_policy_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditSettings {
    /// Rows kept in `audit_events` before `db archive` prunes.
    #[serde(default = "default_max_rows")]
    pub max_rows: u64,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            max_rows: default_max_rows(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AutopilotSettings {
    #[serde(default)]
    pub mode: AutonomyMode,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelKind,
    /// Channel identities allowed to answer prompts.
    #[serde(default)]
    pub allowed_identities: Vec<String>,
    #[serde(default)]
    pub telegram: TelegramSettings,
    #[serde(default)]
    pub prompt: PromptSettings,
    #[serde(default)]
    pub policy: PolicySettings,
    #[serde(default)]
    pub audit: AuditSettings,
    #[serde(default)]
    pub autopilot: AutopilotSettings,
}

impl Config {
    /// Load from the standard location, or error if absent.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&paths::config_file())
    }

    /// Load, falling back to defaults when no file exists (read-only verbs).
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::load() {
            Ok(c) => Ok(c),
            Err(ConfigError::Missing(_)) => Ok(Self::apply_env(Self::default())),
            Err(e) => Err(e),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        check_permissions(path)?;
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::apply_env(config))
    }

    /// Environment overrides, applied after file parsing.
    fn apply_env(mut config: Self) -> Self {
        let env: HashMap<String, String> = std::env::vars().collect();
        if let Some(v) = env.get("WARDEN_CHANNEL") {
            if let Ok(kind) = ChannelKind::parse(v) {
                config.channel = kind;
            }
        }
        if let Some(v) = env.get("WARDEN_TELEGRAM_BOT_TOKEN") {
            config.telegram.bot_token = Secret::new(v.clone());
        }
        if let Some(v) = env.get("WARDEN_TELEGRAM_CHAT_ID") {
            config.telegram.chat_id = v.clone();
        }
        if let Some(v) = env.get("WARDEN_AUTOPILOT_MODE") {
            if let Some(mode) = AutonomyMode::parse(v) {
                config.autopilot.mode = mode;
            }
        }
        if let Some(v) = env.get("WARDEN_POLICY_PATH") {
            config.policy.path = PathBuf::from(v);
        }
        if let Some(v) = env.get("WARDEN_PROMPT_TIMEOUT_SECONDS") {
            if let Ok(secs) = v.parse() {
                config.prompt.timeout_seconds = secs;
            }
        }
        config
    }
}

#[cfg(unix)]
fn check_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    let meta = std::fs::metadata(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.permissions().mode() & 0o077 != 0 {
        return Err(ConfigError::Permissions(path.to_path_buf()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

/// Tighten config file permissions to 0600 (doctor --fix, setup).
#[cfg(unix)]
pub fn fix_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub fn fix_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
