//! Configuration management for callwire
//!
//! Configuration comes from a TOML file or from `CALLWIRE_*` environment
//! variables layered over the defaults. Durations are written in humantime
//! form (`60s`, `24h`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub signaling: SignalingConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// How connections prove who they are
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Trust a user id header set by an authenticating proxy
    #[default]
    TrustedHeader,
    /// Look bearer tokens up in `server.tokens`
    Tokens,
}

/// HTTP / WebSocket server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: SocketAddr,

    /// Time given to open connections after a shutdown signal
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    pub auth_mode: AuthMode,

    /// Header carrying the user id in `trusted_header` mode
    pub user_header: String,

    /// Token -> user id, for `tokens` mode
    pub tokens: BTreeMap<String, String>,

    /// Maximum rows returned by the call history endpoint
    pub history_limit: usize,
}

/// Timing of the call lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Lifetime of an unanswered call request
    #[serde(with = "humantime_serde")]
    pub request_ttl: Duration,

    /// How long a call survives a participant's disconnect
    #[serde(with = "humantime_serde")]
    pub disconnect_grace: Duration,

    /// Delay before a disconnected user's outgoing requests are cancelled
    #[serde(with = "humantime_serde")]
    pub cleanup_grace: Duration,

    /// Lifetime of a cached friend set while its owner is offline
    #[serde(with = "humantime_serde")]
    pub friend_cache_ttl: Duration,

    /// Interval of the expiry sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

/// Durable store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file; in-memory when unset
    pub sqlite_path: Option<PathBuf>,

    /// Connection pool size for file databases
    pub pool_size: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Serve Prometheus metrics
    pub enabled: bool,
    pub bind_address: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 8080)),
            shutdown_timeout: Duration::from_secs(10),
            auth_mode: AuthMode::TrustedHeader,
            user_header: "x-user-id".to_string(),
            tokens: BTreeMap::new(),
            history_limit: 50,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            request_ttl: Duration::from_secs(60),
            disconnect_grace: Duration::from_secs(60),
            cleanup_grace: Duration::from_secs(10),
            friend_cache_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(5),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { sqlite_path: None, pool_size: 8 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: false, bind_address: SocketAddr::from((Ipv4Addr::LOCALHOST, 9090)) }
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e| ConfigError::InvalidValue(format!("{}: {}", key, e)))
}

fn parse_duration(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(raw)
        .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", key, e)))
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: CALLWIRE_<SECTION>_<KEY>
    /// Example: CALLWIRE_SERVER_BIND_ADDRESS=0.0.0.0:8080
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any `CALLWIRE_*` key source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `CALLWIRE_*` values on top of this configuration
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        const K: &str = "CALLWIRE_";
        let get = |key: &str| lookup(&format!("{}{}", K, key));

        // Server
        if let Some(v) = get("SERVER_BIND_ADDRESS") {
            self.server.bind_address = parse_value("SERVER_BIND_ADDRESS", &v)?;
        }
        if let Some(v) = get("SERVER_SHUTDOWN_TIMEOUT") {
            self.server.shutdown_timeout = parse_duration("SERVER_SHUTDOWN_TIMEOUT", &v)?;
        }
        if let Some(v) = get("SERVER_AUTH_MODE") {
            self.server.auth_mode = match v.as_str() {
                "trusted_header" => AuthMode::TrustedHeader,
                "tokens" => AuthMode::Tokens,
                other => {
                    return Err(ConfigError::InvalidValue(format!(
                        "SERVER_AUTH_MODE: unknown mode '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(v) = get("SERVER_USER_HEADER") {
            self.server.user_header = v;
        }
        if let Some(v) = get("SERVER_HISTORY_LIMIT") {
            self.server.history_limit = parse_value("SERVER_HISTORY_LIMIT", &v)?;
        }

        // Signaling
        if let Some(v) = get("SIGNALING_REQUEST_TTL") {
            self.signaling.request_ttl = parse_duration("SIGNALING_REQUEST_TTL", &v)?;
        }
        if let Some(v) = get("SIGNALING_DISCONNECT_GRACE") {
            self.signaling.disconnect_grace = parse_duration("SIGNALING_DISCONNECT_GRACE", &v)?;
        }
        if let Some(v) = get("SIGNALING_CLEANUP_GRACE") {
            self.signaling.cleanup_grace = parse_duration("SIGNALING_CLEANUP_GRACE", &v)?;
        }
        if let Some(v) = get("SIGNALING_FRIEND_CACHE_TTL") {
            self.signaling.friend_cache_ttl = parse_duration("SIGNALING_FRIEND_CACHE_TTL", &v)?;
        }
        if let Some(v) = get("SIGNALING_SWEEP_INTERVAL") {
            self.signaling.sweep_interval = parse_duration("SIGNALING_SWEEP_INTERVAL", &v)?;
        }

        // Storage
        if let Some(v) = get("STORAGE_SQLITE_PATH") {
            self.storage.sqlite_path = if v.is_empty() { None } else { Some(PathBuf::from(v)) };
        }
        if let Some(v) = get("STORAGE_POOL_SIZE") {
            self.storage.pool_size = parse_value("STORAGE_POOL_SIZE", &v)?;
        }

        // Logging
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("LOG_JSON") {
            self.logging.json_format = parse_value("LOG_JSON", &v)?;
        }

        // Metrics
        if let Some(v) = get("METRICS_ENABLED") {
            self.metrics.enabled = parse_value("METRICS_ENABLED", &v)?;
        }
        if let Some(v) = get("METRICS_BIND_ADDRESS") {
            self.metrics.bind_address = parse_value("METRICS_BIND_ADDRESS", &v)?;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("signaling.request_ttl", self.signaling.request_ttl),
            ("signaling.disconnect_grace", self.signaling.disconnect_grace),
            ("signaling.cleanup_grace", self.signaling.cleanup_grace),
            ("signaling.friend_cache_ttl", self.signaling.friend_cache_ttl),
            ("signaling.sweep_interval", self.signaling.sweep_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.storage.pool_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "storage.pool_size must be greater than 0".to_string(),
            ));
        }

        if self.server.history_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "server.history_limit must be greater than 0".to_string(),
            ));
        }

        match self.server.auth_mode {
            AuthMode::TrustedHeader if self.server.user_header.trim().is_empty() => {
                return Err(ConfigError::ValidationFailed(
                    "trusted_header auth requires server.user_header".to_string(),
                ));
            }
            AuthMode::Tokens if self.server.tokens.is_empty() => {
                return Err(ConfigError::ValidationFailed(
                    "tokens auth requires at least one entry in server.tokens".to_string(),
                ));
            }
            _ => {}
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        if self.metrics.enabled && self.metrics.bind_address == self.server.bind_address {
            return Err(ConfigError::ValidationFailed(
                "metrics.bind_address must differ from server.bind_address".to_string(),
            ));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signaling.request_ttl, Duration::from_secs(60));
        assert_eq!(config.signaling.disconnect_grace, Duration::from_secs(60));
        assert_eq!(config.signaling.cleanup_grace, Duration::from_secs(10));
        assert_eq!(config.signaling.friend_cache_ttl, Duration::from_secs(86_400));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("CALLWIRE_SERVER_BIND_ADDRESS", "0.0.0.0:9000"),
            ("CALLWIRE_SIGNALING_DISCONNECT_GRACE", "90s"),
            ("CALLWIRE_STORAGE_SQLITE_PATH", "/tmp/callwire.db"),
            ("CALLWIRE_LOG_LEVEL", "debug"),
        ]))
        .unwrap();

        assert_eq!(config.server.bind_address.port(), 9000);
        assert_eq!(config.signaling.disconnect_grace, Duration::from_secs(90));
        assert_eq!(config.storage.sqlite_path, Some(PathBuf::from("/tmp/callwire.db")));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_bad_env_values() {
        let err = Config::from_lookup(lookup(&[("CALLWIRE_SIGNALING_REQUEST_TTL", "soon")]));
        assert!(matches!(err, Err(ConfigError::InvalidValue(_))));

        let err = Config::from_lookup(lookup(&[("CALLWIRE_SERVER_AUTH_MODE", "magic")]));
        assert!(matches!(err, Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.signaling.request_ttl = Duration::ZERO;
        assert!(config.validate().is_err());

        config = Config::default();
        config.server.auth_mode = AuthMode::Tokens;
        assert!(config.validate().is_err());
        config.server.tokens.insert("t".into(), "alice".into());
        assert!(config.validate().is_ok());

        config = Config::default();
        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("callwire.toml");

        let mut config = Config::default();
        config.signaling.sweep_interval = Duration::from_secs(2);
        config.storage.sqlite_path = Some(PathBuf::from("calls.db"));
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.signaling.sweep_interval, Duration::from_secs(2));
        assert_eq!(loaded.storage.sqlite_path, Some(PathBuf::from("calls.db")));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.toml");
        std::fs::write(&path, "[signaling]\nrequest_ttl = \"30s\"\n").unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.signaling.request_ttl, Duration::from_secs(30));
        assert_eq!(loaded.signaling.disconnect_grace, Duration::from_secs(60));
    }
}
