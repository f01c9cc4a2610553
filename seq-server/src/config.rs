//! Configuration loading for chatseq-server.
//!
//! Configuration is loaded from a TOML file (default: `chatseq-server.toml`).
//! Every section and field is optional.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for chatseq-server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Sequence store configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Sync endpoint paging.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Broker history and live buffers.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// History sweeper configuration.
    #[serde(default)]
    pub sweeper: SweeperConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP + WebSocket listener (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Sequence store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Maximum message content length in bytes (default: 16 KiB).
    #[serde(default = "default_max_content_len")]
    pub max_content_len: usize,
}

/// Sync endpoint paging.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Page size when the caller sends no `limit` (default: 100).
    #[serde(default = "default_sync_limit")]
    pub default_limit: u32,
    /// Largest page served (default: 1000).
    #[serde(default = "default_max_sync_limit")]
    pub max_limit: u32,
}

/// Broker history bounds.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Publications kept per channel for replay (default: 100).
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    /// Age after which a publication leaves replay history (default: 300s).
    #[serde(default = "default_history_ttl_secs")]
    pub history_ttl_secs: u64,
    /// Live publications buffered per subscriber before it is dropped (default: 1024).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Appends per user per minute (default: 600).
    #[serde(default = "default_appends_per_minute")]
    pub appends_per_minute: u32,
    /// Appends per second across all users (default: 1000).
    #[serde(default = "default_global_appends_per_second")]
    pub global_appends_per_second: u32,
}

/// History sweeper configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SweeperConfig {
    /// Enable the sweeper task (default: true).
    #[serde(default = "default_sweeper_enabled")]
    pub enabled: bool,
    /// Sweep interval in seconds (default: 30).
    #[serde(default = "default_sweeper_interval")]
    pub interval_secs: u64,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("chatseq.db")
}

fn default_max_content_len() -> usize {
    16 * 1024
}

fn default_sync_limit() -> u32 {
    seq_types::DEFAULT_SYNC_LIMIT
}

fn default_max_sync_limit() -> u32 {
    seq_types::MAX_SYNC_LIMIT
}

fn default_history_size() -> usize {
    100
}

fn default_history_ttl_secs() -> u64 {
    300 // 5 minutes
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_appends_per_minute() -> u32 {
    600
}

fn default_global_appends_per_second() -> u32 {
    1000
}

fn default_sweeper_enabled() -> bool {
    true
}

fn default_sweeper_interval() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_content_len: default_max_content_len(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_limit: default_sync_limit(),
            max_limit: default_max_sync_limit(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
            history_ttl_secs: default_history_ttl_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            appends_per_minute: default_appends_per_minute(),
            global_appends_per_second: default_global_appends_per_second(),
        }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweeper_enabled(),
            interval_secs: default_sweeper_interval(),
        }
    }
}

impl BrokerConfig {
    /// History age bound as a duration.
    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs)
    }
}

impl SyncConfig {
    /// Page size actually served for a requested `limit`.
    ///
    /// Missing or zero means the default; anything above the maximum is capped.
    pub fn clamp(&self, requested: Option<u32>) -> u32 {
        match requested {
            None | Some(0) => self.default_limit.min(self.max_limit),
            Some(limit) => limit.min(self.max_limit),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("limits.appends_per_minute", self.limits.appends_per_minute as u64),
            (
                "limits.global_appends_per_second",
                self.limits.global_appends_per_second as u64,
            ),
            ("sync.max_limit", self.sync.max_limit as u64),
            ("broker.history_size", self.broker.history_size as u64),
            ("broker.channel_capacity", self.broker.channel_capacity as u64),
            ("storage.max_content_len", self.storage.max_content_len as u64),
        ];
        for (field, value) in checks {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid config value {field}: {reason}")]
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
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.storage.max_content_len, 16 * 1024);
        assert_eq!(config.sync.default_limit, 100);
        assert_eq!(config.broker.history_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:5000"

[storage]
database = "/data/chat.db"

[broker]
history_size = 3
history_ttl_secs = 60

[limits]
appends_per_minute = 5

[sweeper]
interval_secs = 10
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:5000");
        assert_eq!(config.storage.database, PathBuf::from("/data/chat.db"));
        assert_eq!(config.broker.history_size, 3);
        assert_eq!(config.broker.history_ttl(), Duration::from_secs(60));
        assert_eq!(config.limits.appends_per_minute, 5);
        assert_eq!(config.sweeper.interval_secs, 10);
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sync.max_limit, 1000);
        assert_eq!(config.broker.channel_capacity, 1024);
        assert!(config.sweeper.enabled);
    }

    #[test]
    fn zero_quota_is_rejected() {
        let config: Config = toml::from_str("[limits]\nappends_per_minute = 0\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("limits.appends_per_minute"));
    }

    #[test]
    fn sync_limit_clamping() {
        let sync = SyncConfig::default();
        assert_eq!(sync.clamp(None), 100);
        assert_eq!(sync.clamp(Some(0)), 100);
        assert_eq!(sync.clamp(Some(25)), 25);
        assert_eq!(sync.clamp(Some(5000)), 1000);
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = Config::from_file(std::path::Path::new("/nonexistent/chatseq.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError { .. }));
    }

    #[test]
    fn from_file_reads_tempfile() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chatseq-server.toml");
        std::fs::write(&path, "[sync]\ndefault_limit = 50\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.sync.default_limit, 50);
    }
}
