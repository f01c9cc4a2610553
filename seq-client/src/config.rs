//! Client configuration.
//!
//! Loaded from TOML by the CLI; every field except `server_url` and
//! `user_id` has a default.
//!
//! ```toml
//! server_url = "http://localhost:8080"
//! user_id = "6f1c..."
//! chats = ["0b7e..."]
//! cursor_dir = ".chatseq"
//! page_size = 100
//!
//! [retry]
//! initial_delay_ms = 500
//! max_delay_ms = 20000
//! attempt_timeout_ms = 10000
//! fallback_ceiling = 5
//! ```

use seq_core::RetryPolicy;
use seq_types::{ChatId, DeviceId, UserId, DEFAULT_SYNC_LIMIT, MAX_SYNC_LIMIT};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Base HTTP URL of the server.
    pub server_url: String,
    /// Caller identity.
    pub user_id: UserId,
    /// Device identity; generated and kept in `cursor_dir` when absent.
    #[serde(default)]
    pub device_id: Option<DeviceId>,
    /// Chats to follow.
    #[serde(default)]
    pub chats: Vec<ChatId>,
    /// Directory holding cursor files.
    #[serde(default = "default_cursor_dir")]
    pub cursor_dir: PathBuf,
    /// Fallback page size.
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Also subscribe to the user's notification channel.
    #[serde(default)]
    pub notifications: bool,
    /// Retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Backoff settings for reconnects and fallback fetches.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// First retry delay in milliseconds (default: 500).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Retry delay cap in milliseconds (default: 20000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Bound on each connect cycle and each page fetch (default: 10000).
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
    /// Consecutive fallback failures before a chat is flagged (default: 5).
    #[serde(default = "default_fallback_ceiling")]
    pub fallback_ceiling: u32,
    /// Stop reconnecting after this many failed cycles (default: never).
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_cursor_dir() -> PathBuf {
    PathBuf::from(".chatseq")
}

fn default_page_size() -> u32 {
    DEFAULT_SYNC_LIMIT
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    20_000
}

fn default_attempt_timeout_ms() -> u64 {
    10_000
}

fn default_fallback_ceiling() -> u32 {
    5
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
            fallback_ceiling: default_fallback_ceiling(),
            max_attempts: None,
        }
    }
}

impl RetryConfig {
    /// The retry policy these settings describe.
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            attempt_timeout: Duration::from_millis(self.attempt_timeout_ms),
            max_attempts: self.max_attempts,
            ..RetryPolicy::default()
        }
    }
}

impl ClientConfig {
    /// Minimal configuration for `user_id` against `server_url`.
    pub fn new(server_url: impl Into<String>, user_id: UserId) -> Self {
        Self {
            server_url: server_url.into(),
            user_id,
            device_id: None,
            chats: Vec::new(),
            cursor_dir: default_cursor_dir(),
            page_size: default_page_size(),
            notifications: false,
            retry: RetryConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "server_url",
                reason: "must start with http:// or https://".into(),
            });
        }
        if self.page_size == 0 || self.page_size > MAX_SYNC_LIMIT {
            return Err(ConfigError::Invalid {
                field: "page_size",
                reason: format!("must be between 1 and {MAX_SYNC_LIMIT}"),
            });
        }
        if self.retry.initial_delay_ms == 0 || self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(ConfigError::Invalid {
                field: "retry",
                reason: "need 0 < initial_delay_ms <= max_delay_ms".into(),
            });
        }
        if self.retry.fallback_ceiling == 0 {
            return Err(ConfigError::Invalid {
                field: "retry.fallback_ceiling",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// WebSocket URL of the broker gateway for this user.
    pub fn broker_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws}/ws?user_id={}", self.user_id)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config: {0}")]
    ReadError(String),

    /// Failed to parse config file.
    #[error("failed to parse config: {0}")]
    ParseError(String),

    /// A value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let user = UserId::new();
        let toml = format!("server_url = \"http://localhost:8080\"\nuser_id = \"{user}\"\n");
        let config: ClientConfig = toml::from_str(&toml).unwrap();

        assert_eq!(config.user_id, user);
        assert_eq!(config.page_size, 100);
        assert_eq!(config.retry.fallback_ceiling, 5);
        assert!(config.chats.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn parse_retry_table() {
        let toml = format!(
            r#"
server_url = "http://localhost:8080"
user_id = "{}"
chats = ["{}"]

[retry]
initial_delay_ms = 100
max_delay_ms = 1000
attempt_timeout_ms = 2000
fallback_ceiling = 3
"#,
            UserId::new(),
            ChatId::new()
        );
        let config: ClientConfig = toml::from_str(&toml).unwrap();
        let policy = config.retry.policy();

        assert_eq!(config.chats.len(), 1);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(1));
        assert_eq!(policy.attempt_timeout, Duration::from_secs(2));
        assert_eq!(config.retry.fallback_ceiling, 3);
    }

    #[test]
    fn broker_url_uses_ws_scheme() {
        let user = UserId::new();
        let config = ClientConfig::new("http://localhost:8080/", user);
        assert_eq!(config.broker_url(), format!("ws://localhost:8080/ws?user_id={user}"));

        let config = ClientConfig::new("https://chat.example", user);
        assert!(config.broker_url().starts_with("wss://chat.example/ws"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = ClientConfig::new("localhost:8080", UserId::new());
        assert!(config.validate().is_err());

        config.server_url = "http://localhost:8080".into();
        config.page_size = 5000;
        assert!(config.validate().is_err());
    }
}
