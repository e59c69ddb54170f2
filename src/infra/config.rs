// src/infra/config.rs — Configuration loading (TOML) and env credentials

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::infra::errors::CollectorError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory all session data lands under.
    pub data_root: PathBuf,

    #[serde(default)]
    pub streams: StreamsConfig,

    #[serde(default)]
    pub helix: HelixConfig,

    #[serde(default)]
    pub irc: IrcConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamsConfig {
    /// Channel logins to track. Normalized on load (lowercase, no '#').
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HelixConfig {
    /// Seconds between live-status polls.
    pub poll_seconds: u64,
    /// Max logins per /streams request (Helix caps query params at 100).
    pub batch_size: usize,
}

impl Default for HelixConfig {
    fn default() -> Self {
        Self {
            poll_seconds: 60,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IrcConfig {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    /// Pause after each JOIN so a burst of went-live channels doesn't trip
    /// the server's join-flood limit.
    pub join_delay_s: f64,
}

impl Default for IrcConfig {
    fn default() -> Self {
        Self {
            server: "irc.chat.twitch.tv".into(),
            port: 6697,
            use_tls: true,
            join_delay_s: 1.2,
        }
    }
}

impl Config {
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;

        config.streams.channels = config
            .streams
            .channels
            .iter()
            .map(|c| normalize_channel(c))
            .filter(|c| !c.is_empty())
            .collect();

        if config.helix.batch_size == 0 {
            anyhow::bail!("helix.batch_size must be at least 1");
        }
        if config.helix.poll_seconds == 0 {
            anyhow::bail!("helix.poll_seconds must be at least 1");
        }

        Ok(config)
    }
}

/// Canonical channel form used everywhere: lowercase login, no leading '#'.
pub fn normalize_channel(raw: &str) -> String {
    raw.trim().trim_start_matches('#').to_lowercase()
}

/// Helix app credentials, read from the environment (never the config file).
#[derive(Debug, Clone)]
pub struct HelixCredentials {
    pub client_id: String,
    pub client_secret: String,
}

impl HelixCredentials {
    pub fn from_env() -> Result<Self, CollectorError> {
        Ok(Self {
            client_id: require_env("TWITCH_CLIENT_ID")?,
            client_secret: require_env("TWITCH_CLIENT_SECRET")?,
        })
    }
}

/// IRC login credentials: the bot nick and its `oauth:...` password.
#[derive(Debug, Clone)]
pub struct IrcCredentials {
    pub nick: String,
    pub oauth: String,
}

impl IrcCredentials {
    pub fn from_env() -> Result<Self, CollectorError> {
        Ok(Self {
            nick: require_env("TWITCH_IRC_NICK")?,
            oauth: require_env("TWITCH_IRC_OAUTH")?,
        })
    }
}

fn require_env(key: &'static str) -> Result<String, CollectorError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(CollectorError::MissingCredentials(key)),
    }
}
