//! # configs
//!
//! Runtime settings for a feedboard node.
//!
//! Sources, later ones winning:
//! 1. built-in defaults
//! 2. `config/default.toml` (optional)
//! 3. `config/local.toml` (optional)
//! 4. environment variables prefixed `FEEDBOARD__`, e.g.
//!    `FEEDBOARD__NODE__TOPIC=b`
//!
//! A `.env` file is loaded into the environment first.

use config::{Config, Environment, File, FileFormat};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub node: NodeSettings,
    pub board: BoardSettings,
    pub identity: IdentitySettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Board namespace; peers on different topics never share events
    pub topic: String,
    pub group_id: String,
    pub sync_interval_ms: u64,
    pub max_invalid_per_peer: u32,
    /// Oldest claimed time, relative to now, an event is still admitted at
    pub max_event_age_secs: u64,
    /// How far ahead of the local clock a claimed time may be
    pub max_clock_skew_secs: u64,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            topic: "feedboard".into(),
            group_id: "1000".into(),
            sync_interval_ms: 1000,
            max_invalid_per_peer: 16,
            max_event_age_secs: 7 * 86400,
            max_clock_skew_secs: 60,
        }
    }
}

/// One rate limit: `message_limit` events per `epoch_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LimitSettings {
    pub epoch_secs: u64,
    pub message_limit: u32,
}

impl LimitSettings {
    const fn new(epoch_secs: u64, message_limit: u32) -> Self {
        Self {
            epoch_secs,
            message_limit,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BoardSettings {
    pub max_threads: usize,
    pub max_post_size: usize,
    pub max_attachment_size: usize,
    pub orphan_grace_secs: u64,
    pub thread_limits: Vec<LimitSettings>,
    pub post_limits: Vec<LimitSettings>,
}

impl Default for BoardSettings {
    fn default() -> Self {
        Self {
            max_threads: 256,
            max_post_size: 8192,
            max_attachment_size: 10 * 1024 * 1024,
            orphan_grace_secs: 600,
            thread_limits: vec![LimitSettings::new(1000, 1), LimitSettings::new(86400, 16)],
            post_limits: vec![LimitSettings::new(10, 1), LimitSettings::new(86400, 2048)],
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct IdentitySettings {
    /// Membership secret. Empty means "generate one for this run".
    #[serde(default = "empty_secret", deserialize_with = "secret_from_string")]
    pub secret: SecretString,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        Self {
            secret: empty_secret(),
        }
    }
}

fn empty_secret() -> SecretString {
    SecretString::from(String::new())
}

fn secret_from_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<SecretString, D::Error> {
    String::deserialize(deserializer).map(SecretString::from)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "info".into(),
            json: false,
        }
    }
}

impl Settings {
    /// Loads `.env`, the config files and the environment.
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FEEDBOARD")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Self::finish(config)
    }

    /// Parses settings from TOML text, on top of the defaults.
    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        Self::finish(config)
    }

    fn finish(config: Config) -> Result<Self, SettingsError> {
        let settings: Settings = config.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |msg: &str| Err(SettingsError::Invalid(msg.to_string()));
        if self.node.topic.is_empty() {
            return invalid("node.topic must not be empty");
        }
        if self.node.sync_interval_ms == 0 {
            return invalid("node.sync_interval_ms must be positive");
        }
        if self.node.max_invalid_per_peer == 0 {
            return invalid("node.max_invalid_per_peer must be positive");
        }
        let longest_epoch = self
            .board
            .thread_limits
            .iter()
            .chain(&self.board.post_limits)
            .map(|l| l.epoch_secs)
            .max()
            .unwrap_or(0);
        if self.node.max_event_age_secs < longest_epoch {
            return invalid("node.max_event_age_secs must cover the longest rate-limit epoch");
        }
        if self.board.max_threads == 0 {
            return invalid("board.max_threads must be positive");
        }
        if self.board.max_post_size == 0 || self.board.max_attachment_size == 0 {
            return invalid("board size limits must be positive");
        }
        for (name, limits) in [
            ("board.thread_limits", &self.board.thread_limits),
            ("board.post_limits", &self.board.post_limits),
        ] {
            if limits.is_empty() {
                return Err(SettingsError::Invalid(format!("{name} must not be empty")));
            }
            if limits.iter().any(|l| l.epoch_secs == 0 || l.message_limit == 0) {
                return Err(SettingsError::Invalid(format!(
                    "{name} entries need a positive epoch and limit"
                )));
            }
        }
        Ok(())
    }
}
