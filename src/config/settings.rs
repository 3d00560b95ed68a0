//! Configuration structures for deserialisation.
//!
//! These structures map directly to the JSON configuration file format. Every
//! section is optional; an empty object is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::moku::cache::{default_cache_path, DEFAULT_DEVICE_PORT};
use crate::moku::discovery::MOKU_SERVICE_TYPE;

/// Upper bound on a discovery window.
pub const MAX_DISCOVERY_TIMEOUT_SECS: u64 = 60;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Root configuration structure.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional JSON schema reference (ignored during parsing).
    #[serde(rename = "$schema", default)]
    _schema: Option<String>,

    /// Optional comment field (ignored during parsing).
    #[serde(rename = "_comment", default)]
    _comment: Option<String>,

    /// Path of the device cache file. Defaults to
    /// `~/.moku-mcp/device_cache.json`.
    #[serde(default)]
    pub cache_path: Option<PathBuf>,

    /// Discovery settings.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Device connection settings.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any validation checks fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.service_type.trim().is_empty() {
            return Err(ConfigError::ValidationError {
                message: "discovery.service_type must not be empty".to_string(),
            });
        }

        if self.discovery.default_timeout_secs > MAX_DISCOVERY_TIMEOUT_SECS {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "discovery.default_timeout_secs is {}, maximum is {MAX_DISCOVERY_TIMEOUT_SECS}",
                    self.discovery.default_timeout_secs
                ),
            });
        }

        if self.device.http_port == 0 {
            return Err(ConfigError::ValidationError {
                message: "device.http_port must be non-zero".to_string(),
            });
        }

        if self.device.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError {
                message: "device.request_timeout_ms must be non-zero".to_string(),
            });
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::ValidationError {
                message: format!(
                    "Invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    LOG_LEVELS.join(", ")
                ),
            });
        }

        Ok(())
    }

    /// Cache file to use: the configured path or the default location.
    ///
    /// A leading `~` in the configured path is the home directory.
    #[must_use]
    pub fn resolved_cache_path(&self) -> Option<PathBuf> {
        match &self.cache_path {
            Some(path) => Some(expand_home(path)),
            None => default_cache_path(),
        }
    }
}

/// Discovery configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    /// DNS-SD service type to browse.
    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// Browse window used when `discover_mokus` is called without a timeout.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Briefly connect to each discovered device to read its metadata.
    #[serde(default = "default_true")]
    pub enrich_metadata: bool,
}

impl DiscoveryConfig {
    /// Default browse window.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            default_timeout_secs: default_timeout_secs(),
            enrich_metadata: default_true(),
        }
    }
}

fn default_service_type() -> String {
    MOKU_SERVICE_TYPE.to_string()
}

const fn default_timeout_secs() -> u64 {
    2
}

const fn default_true() -> bool {
    true
}

/// Device connection configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Port used when an identifier carries no port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Timeout for a single REST call, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl DeviceConfig {
    /// Timeout for a single REST call.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

const fn default_http_port() -> u16 {
    DEFAULT_DEVICE_PORT
}

const fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let json = r"{}";
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.service_type, "_moku._tcp.local.");
        assert_eq!(config.device.http_port, 80);
        assert!(config.discovery.enrich_metadata);
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "_comment": "Bench setup",
            "cache_path": "/tmp/moku/cache.json",
            "discovery": {
                "service_type": "_moku._tcp.local.",
                "default_timeout_secs": 5,
                "enrich_metadata": false
            },
            "device": {
                "http_port": 8090,
                "request_timeout_ms": 2500
            },
            "logging": {
                "level": "debug"
            }
        }"#;

        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(
            config.resolved_cache_path(),
            Some(PathBuf::from("/tmp/moku/cache.json"))
        );
        assert_eq!(config.discovery.default_timeout(), Duration::from_secs(5));
        assert!(!config.discovery.enrich_metadata);
        assert_eq!(config.device.http_port, 8090);
        assert_eq!(config.device.request_timeout(), Duration::from_millis(2500));
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn default_cache_path_used_when_unset() {
        let config = Config::default();
        let path = config.resolved_cache_path().unwrap();
        assert!(path.ends_with("device_cache.json"));
    }

    #[test]
    fn cache_path_expands_home() {
        let config: Config =
            serde_json::from_str(r#"{"cache_path": "~/.moku-mcp/device_cache.json"}"#).unwrap();
        let resolved = config.resolved_cache_path().unwrap();

        if let Some(home) = dirs::home_dir() {
            assert_eq!(resolved, home.join(".moku-mcp").join("device_cache.json"));
            assert!(!resolved.starts_with("~"));
        }

        let config: Config = serde_json::from_str(r#"{"cache_path": "~other/cache.json"}"#).unwrap();
        assert_eq!(
            config.resolved_cache_path(),
            Some(PathBuf::from("~other/cache.json"))
        );
    }

    #[test]
    fn reject_invalid_log_level() {
        let json = r#"{ "logging": { "level": "loud" } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_excessive_timeout() {
        let json = r#"{ "discovery": { "default_timeout_secs": 600 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_zero_port() {
        let json = r#"{ "device": { "http_port": 0 } }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn reject_unknown_fields() {
        let json = r#"{
            "unknown_field": "value"
        }"#;

        let result: Result<Config, _> = serde_json::from_str(json);
        assert!(result.is_err());
    }
}
