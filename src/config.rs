//! Configuration types for chat-history-dl
//!
//! Settings are layered: defaults, then an optional TOML file, then environment
//! variables (after `.env` has been loaded), then command-line flags applied by
//! the binary. Durations are written as (fractional) seconds.

use crate::error::{Error, Result};
use crate::types::{ChatTarget, Direction};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the user-mode API id
pub const ENV_API_ID: &str = "API_ID";
/// Environment variable holding the user-mode API hash
pub const ENV_API_HASH: &str = "API_HASH";
/// Environment variable holding the session name
pub const ENV_SESSION: &str = "TG_SESSION";
/// Environment variable holding a bot token
pub const ENV_BOT_TOKEN: &str = "BOT_TOKEN";
/// Environment variable holding the history gateway URL
pub const ENV_API_URL: &str = "CHAT_API_URL";

/// Pacing rules applied by the throttle controller
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Delay inserted after every message (default: none)
    #[serde(default, with = "duration_serde")]
    pub sleep_per_message: Duration,

    /// Insert a longer pause every N messages (0 = disabled)
    #[serde(default)]
    pub sleep_every: u64,

    /// Length of the periodic pause
    #[serde(default, with = "duration_serde")]
    pub sleep_every_duration: Duration,

    /// Provider flood waits shorter than this are slept through automatically (default: 300s)
    #[serde(default = "default_flood_threshold", with = "duration_serde")]
    pub flood_threshold: Duration,

    /// Upper bound on any single flood wait (default: 3600s)
    #[serde(default = "default_flood_ceiling", with = "duration_serde")]
    pub flood_wait_ceiling: Duration,

    /// Escalated flood waits tolerated in a row before the run stops as partial (default: 3)
    #[serde(default = "default_max_escalations")]
    pub max_throttle_escalations: u32,

    /// Flood waits of any length tolerated in a row without a message getting through (default: 10)
    #[serde(default = "default_max_flood_waits")]
    pub max_consecutive_flood_waits: u32,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            sleep_per_message: Duration::ZERO,
            sleep_every: 0,
            sleep_every_duration: Duration::ZERO,
            flood_threshold: default_flood_threshold(),
            flood_wait_ceiling: default_flood_ceiling(),
            max_throttle_escalations: default_max_escalations(),
            max_consecutive_flood_waits: default_max_flood_waits(),
        }
    }
}

/// Retry behavior for attachment downloads
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 means exactly one attempt (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry; 0 retries immediately (default: 1.5s)
    #[serde(default = "default_initial_backoff", with = "duration_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on a single backoff (default: 60s)
    #[serde(default = "default_max_backoff", with = "duration_serde")]
    pub max_backoff: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: false,
        }
    }
}

/// How to log in to the provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AuthMode {
    /// Interactive user session; a login code may be requested on first use
    User {
        /// Application id
        api_id: i64,
        /// Application hash
        api_hash: String,
        /// Session name, reused across runs
        #[serde(default = "default_session")]
        session: String,
    },
    /// Bot token (history limits apply)
    Bot {
        /// Bot token
        token: String,
    },
}

impl AuthMode {
    /// Build user-mode credentials from `API_ID`, `API_HASH` and `TG_SESSION`
    pub fn user_from_env() -> Result<Self> {
        let api_id = std::env::var(ENV_API_ID)
            .map_err(|_| Error::config("api_id", format!("{ENV_API_ID} is not set")))?;
        let api_id = api_id
            .trim()
            .parse::<i64>()
            .map_err(|e| Error::config("api_id", format!("{ENV_API_ID} is not a number: {e}")))?;
        let api_hash = std::env::var(ENV_API_HASH)
            .map_err(|_| Error::config("api_hash", format!("{ENV_API_HASH} is not set")))?;
        let session = std::env::var(ENV_SESSION).unwrap_or_else(|_| default_session());
        Ok(AuthMode::User {
            api_id,
            api_hash,
            session,
        })
    }
}

/// Where and how to reach the history provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the history gateway
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout (default: 30s)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub timeout: Duration,

    /// Messages requested per page (default: 100)
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout: default_request_timeout(),
            page_size: default_page_size(),
        }
    }
}

/// Full configuration for one export run
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Chat to export (may be left for the command line to supply)
    #[serde(default)]
    pub chat: ChatTarget,

    /// Output path; with batching this is the base for `<stem>_partNNNNN.json` (default: "messages.jsonl")
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Download attachments into this directory (None = no downloads)
    #[serde(default)]
    pub media_dir: Option<PathBuf>,

    /// Export order (default: newest first)
    #[serde(default)]
    pub direction: Direction,

    /// Stop after this many messages (None = everything)
    #[serde(default)]
    pub max_messages: Option<u64>,

    /// Records per batch file (None = one unbounded file)
    #[serde(default)]
    pub batch_size: Option<u64>,

    /// Pacing and flood-wait handling
    #[serde(default)]
    pub pacing: PacingConfig,

    /// Attachment retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Provider connection
    #[serde(default)]
    pub source: SourceConfig,

    /// Credentials; filled from the environment when absent
    #[serde(default)]
    pub auth: Option<AuthMode>,
}

impl ExportConfig {
    /// Configuration with defaults for everything but the chat
    pub fn new(chat: impl Into<String>) -> Self {
        Self {
            chat: ChatTarget(chat.into()),
            output: default_output(),
            media_dir: None,
            direction: Direction::default(),
            max_messages: None,
            batch_size: None,
            pacing: PacingConfig::default(),
            retry: RetryConfig::default(),
            source: SourceConfig::default(),
            auth: None,
        }
    }

    /// Load a TOML configuration file
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parse TOML configuration text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config {
            message: e.to_string(),
            key: None,
        })
    }

    /// Fill unset values from the environment
    ///
    /// `CHAT_API_URL` overrides the gateway URL. When no credentials are
    /// configured, `BOT_TOKEN` selects bot mode, otherwise user mode is built
    /// from `API_ID`/`API_HASH`/`TG_SESSION`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            self.source.base_url = url;
        }
        if self.auth.is_none() {
            self.auth = Some(match std::env::var(ENV_BOT_TOKEN) {
                Ok(token) if !token.trim().is_empty() => AuthMode::Bot { token },
                _ => AuthMode::user_from_env()?,
            });
        }
        Ok(())
    }

    /// Reject settings that cannot produce a meaningful export
    pub fn validate(&self) -> Result<()> {
        if self.chat.0.trim().is_empty() {
            return Err(Error::config("chat", "chat target must not be empty"));
        }
        if self.batch_size == Some(0) {
            return Err(Error::config(
                "batch_size",
                "batch size must be at least 1 (omit it to disable batching)",
            ));
        }
        if self.max_messages == Some(0) {
            return Err(Error::config(
                "max_messages",
                "max messages must be at least 1 (omit it for no limit)",
            ));
        }
        if self.source.page_size == 0 {
            return Err(Error::config("page_size", "page size must be at least 1"));
        }
        if !(self.retry.backoff_multiplier.is_finite() && self.retry.backoff_multiplier >= 1.0) {
            return Err(Error::config(
                "backoff_multiplier",
                "backoff multiplier must be a finite number >= 1",
            ));
        }
        if self.output.file_name().is_none() {
            return Err(Error::config("output", "output path must name a file"));
        }
        url::Url::parse(&self.source.base_url)
            .map_err(|e| Error::config("base_url", format!("invalid gateway URL: {e}")))?;
        Ok(())
    }
}

fn default_output() -> PathBuf {
    PathBuf::from("messages.jsonl")
}

fn default_flood_threshold() -> Duration {
    Duration::from_secs(300)
}

fn default_flood_ceiling() -> Duration {
    Duration::from_secs(3600)
}

fn default_max_escalations() -> u32 {
    3
}

fn default_max_flood_waits() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(1500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_session() -> String {
    "tg_history".to_string()
}

fn default_base_url() -> String {
    "http://127.0.0.1:8081".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_page_size() -> u32 {
    100
}

// Duration as fractional seconds
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        // SAFETY: tests touching the environment are serialized
        unsafe {
            for key in [ENV_API_ID, ENV_API_HASH, ENV_SESSION, ENV_BOT_TOKEN, ENV_API_URL] {
                std::env::remove_var(key);
            }
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ExportConfig::new("@chat");
        assert_eq!(config.output, PathBuf::from("messages.jsonl"));
        assert_eq!(config.direction, Direction::NewestFirst);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(1500));
        assert_eq!(config.pacing.flood_threshold, Duration::from_secs(300));
        assert_eq!(config.pacing.sleep_every, 0);
        assert_eq!(config.pacing.max_consecutive_flood_waits, 10);
        assert_eq!(config.source.page_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_with_fractional_seconds() {
        let config = ExportConfig::from_toml_str(
            r#"
            chat = "@rustlang"
            output = "out/history.jsonl"
            media_dir = "out/media"
            direction = "oldest_first"
            batch_size = 1000

            [pacing]
            sleep_per_message = 0.25
            sleep_every = 500
            sleep_every_duration = 30

            [retry]
            max_retries = 5
            initial_backoff = 0.5

            [auth]
            mode = "bot"
            token = "123:abc"
            "#,
        )
        .unwrap();

        assert_eq!(config.chat, ChatTarget("@rustlang".into()));
        assert_eq!(config.direction, Direction::OldestFirst);
        assert_eq!(config.batch_size, Some(1000));
        assert_eq!(config.pacing.sleep_per_message, Duration::from_millis(250));
        assert_eq!(config.pacing.sleep_every_duration, Duration::from_secs(30));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_backoff, Duration::from_millis(500));
        assert_eq!(
            config.auth,
            Some(AuthMode::Bot {
                token: "123:abc".into()
            })
        );
    }

    #[test]
    fn negative_duration_is_rejected() {
        let err = ExportConfig::from_toml_str(
            r#"
            chat = "1"
            [pacing]
            sleep_per_message = -1.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn validate_rejects_zero_batch_and_limit() {
        let mut config = ExportConfig::new("@chat");
        config.batch_size = Some(0);
        assert!(matches!(
            config.validate(),
            Err(Error::Config { key: Some(k), .. }) if k == "batch_size"
        ));

        let mut config = ExportConfig::new("@chat");
        config.max_messages = Some(0);
        assert!(config.validate().is_err());

        let config = ExportConfig::new("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_gateway_url() {
        let mut config = ExportConfig::new("@chat");
        config.source.base_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn env_prefers_bot_token() {
        clear_env();
        // SAFETY: serialized test
        unsafe {
            std::env::set_var(ENV_BOT_TOKEN, "42:token");
            std::env::set_var(ENV_API_URL, "http://gateway.local:9000");
        }
        let mut config = ExportConfig::new("@chat");
        config.apply_env().unwrap();
        assert_eq!(
            config.auth,
            Some(AuthMode::Bot {
                token: "42:token".into()
            })
        );
        assert_eq!(config.source.base_url, "http://gateway.local:9000");
        clear_env();
    }

    #[test]
    #[serial]
    fn env_builds_user_session() {
        clear_env();
        // SAFETY: serialized test
        unsafe {
            std::env::set_var(ENV_API_ID, "12345");
            std::env::set_var(ENV_API_HASH, "deadbeef");
        }
        let mut config = ExportConfig::new("@chat");
        config.apply_env().unwrap();
        assert_eq!(
            config.auth,
            Some(AuthMode::User {
                api_id: 12345,
                api_hash: "deadbeef".into(),
                session: "tg_history".into(),
            })
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn env_without_credentials_is_config_error() {
        clear_env();
        let mut config = ExportConfig::new("@chat");
        let err = config.apply_env().unwrap_err();
        assert!(matches!(err, Error::Config { key: Some(k), .. } if k == "api_id"));
    }

    #[test]
    #[serial]
    fn explicit_auth_is_not_overridden() {
        clear_env();
        // SAFETY: serialized test
        unsafe {
            std::env::set_var(ENV_BOT_TOKEN, "ignored");
        }
        let mut config = ExportConfig::new("@chat");
        config.auth = Some(AuthMode::Bot {
            token: "explicit".into(),
        });
        config.apply_env().unwrap();
        assert_eq!(
            config.auth,
            Some(AuthMode::Bot {
                token: "explicit".into()
            })
        );
        clear_env();
    }
}
