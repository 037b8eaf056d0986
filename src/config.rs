//! Global configuration parsing and validation.

use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "DISCODEX_CONFIG";

/// Environment variable that force-enables wire debug logging.
pub const DEBUG_ENV: &str = "DISCODEX_DEBUG";

/// Configuration file used when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "discodex.toml";

/// Request timeout applied when `timeout_seconds` is zero or absent.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 180;

/// Which bridge implementation drives the agent.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    /// Long-lived `codex mcp` process spoken to over stdio JSON-RPC.
    #[default]
    Rpc,
    /// Interactive `codex` process whose output is recovered from its session log.
    Tail,
    /// Canned echo replies; no agent process at all.
    Echo,
}

/// Agent-wide policy shared by every channel.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CodexConfig {
    /// Bridge implementation.
    #[serde(default)]
    pub transport: Transport,
    /// Global command override; empty means the built-in invocation.
    #[serde(default)]
    pub command: String,
    /// Root of the agent's session logs (tail transport only).
    #[serde(default)]
    pub session_root: String,
    /// Per-request timeout; zero means [`DEFAULT_TIMEOUT_SECONDS`].
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Shut the agent down after this many idle seconds; zero disables.
    #[serde(default)]
    pub idle_seconds: u64,
    /// Text prepended to the first prompt of every conversation.
    #[serde(default)]
    pub preamble: String,
    /// Log raw protocol lines.
    #[serde(default)]
    pub debug: bool,
}

fn default_timeout_seconds() -> u64 {
    DEFAULT_TIMEOUT_SECONDS
}

impl Default for CodexConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            command: String::new(),
            session_root: String::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            idle_seconds: 0,
            preamble: String::new(),
            debug: false,
        }
    }
}

impl CodexConfig {
    /// Effective per-request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        if self.timeout_seconds == 0 {
            Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)
        } else {
            Duration::from_secs(self.timeout_seconds)
        }
    }

    /// Idle shutdown threshold, if enabled.
    #[must_use]
    pub fn idle_threshold(&self) -> Option<Duration> {
        (self.idle_seconds > 0).then(|| Duration::from_secs(self.idle_seconds))
    }

    /// Trimmed global command override, if any.
    #[must_use]
    pub fn command_override(&self) -> Option<&str> {
        non_blank(&self.command)
    }
}

/// Per-channel execution settings. The channel id is the bridge's owner key.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ChannelConfig {
    /// Chat channel identifier.
    pub channel_id: String,
    /// Command override for this channel.
    #[serde(default)]
    pub command: String,
    /// Working directory for the agent process.
    #[serde(default)]
    pub workdir: String,
    /// Environment variables layered over the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ChannelConfig {
    /// A channel with no overrides.
    #[must_use]
    pub fn ad_hoc(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            ..Self::default()
        }
    }

    /// Trimmed per-channel command override, if any.
    #[must_use]
    pub fn command_override(&self) -> Option<&str> {
        non_blank(&self.command)
    }

    /// Working directory override, if any.
    #[must_use]
    pub fn workdir(&self) -> Option<&Path> {
        non_blank(&self.workdir).map(Path::new)
    }
}

/// Global configuration parsed from `discodex.toml`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Agent policy.
    #[serde(default)]
    pub codex: CodexConfig,
    /// Channels with dedicated settings.
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl GlobalConfig {
    /// Load the file named by [`CONFIG_ENV`], or [`DEFAULT_CONFIG_PATH`].
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or is invalid.
    pub fn load_default() -> Result<Self> {
        Self::load_from_path(default_config_path())
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// The [`DEBUG_ENV`] variable, when truthy, turns on `codex.debug`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw)?;
        config.validate()?;
        if !config.codex.debug {
            config.codex.debug = env::var(DEBUG_ENV).is_ok_and(|v| is_truthy(&v));
        }
        Ok(config)
    }

    /// Settings for `channel_id`, or an override-free channel if unmapped.
    #[must_use]
    pub fn channel(&self, channel_id: &str) -> ChannelConfig {
        self.channels
            .iter()
            .find(|ch| ch.channel_id == channel_id)
            .cloned()
            .unwrap_or_else(|| ChannelConfig::ad_hoc(channel_id))
    }

    /// Whether `channel_id` has dedicated settings.
    #[must_use]
    pub fn is_mapped(&self, channel_id: &str) -> bool {
        self.channels.iter().any(|ch| ch.channel_id == channel_id)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for (i, ch) in self.channels.iter().enumerate() {
            if ch.channel_id.trim().is_empty() {
                return Err(AppError::Config(format!("channels[{i}].channel_id is empty")));
            }
            if !seen.insert(ch.channel_id.as_str()) {
                return Err(AppError::Config(format!(
                    "channels[{i}].channel_id '{}' is duplicated",
                    ch.channel_id
                )));
            }
        }
        Ok(())
    }
}

/// Path named by [`CONFIG_ENV`], falling back to [`DEFAULT_CONFIG_PATH`].
#[must_use]
pub fn default_config_path() -> PathBuf {
    env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
}

/// `""`, `"0"` and `"false"` are off; anything else is on.
#[must_use]
pub fn is_truthy(value: &str) -> bool {
    let v = value.trim().to_ascii_lowercase();
    !v.is_empty() && v != "0" && v != "false"
}

fn non_blank(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
