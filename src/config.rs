//! Daemon configuration.
//!
//! Loads configuration from YAML files with a cascading priority system:
//! 1. `./aitf.yaml` (current directory - highest priority)
//! 2. `~/.config/aitf/aitf.yaml` (user config directory)
//! 3. `/etc/aitf/aitf.yaml` (system - lowest priority)
//!
//! Values from higher priority files override those from lower priority
//! files.
//!
//! # YAML Structure
//!
//! ```yaml
//! mode: comply
//! key: "0102030405060708090a"
//! bind_addr: "0.0.0.0"
//! port: 54321
//! filters:
//!   long_secs: 120
//!   pending_ttl_secs: 30
//!   shadow_ttl_secs: 600
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::NonceAuthenticator;
use crate::engine::{ComplianceMode, Timings};
use crate::protocol::AITF_PORT;

/// Default config filename.
const CONFIG_FILENAME: &str = "aitf.yaml";

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("no pre-shared key configured (set `key` to a hex string)")]
    MissingKey,

    #[error("invalid pre-shared key: {0}")]
    InvalidKey(#[from] hex::FromHexError),

    #[error("invalid bind address: {0}")]
    InvalidBindAddr(std::net::AddrParseError),
}

/// Filter durations and table TTLs (`filters.*`), in seconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiltersConfig {
    /// How long installed blocks last absent an early uninstall.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub long_secs: Option<u64>,

    /// How long an answered handshake waits for its Ack.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_ttl_secs: Option<u64>,

    /// How long a relinquished flow is remembered for escalation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_ttl_secs: Option<u64>,
}

impl FiltersConfig {
    fn merge(&mut self, other: FiltersConfig) {
        if other.long_secs.is_some() {
            self.long_secs = other.long_secs;
        }
        if other.pending_ttl_secs.is_some() {
            self.pending_ttl_secs = other.pending_ttl_secs;
        }
        if other.shadow_ttl_secs.is_some() {
            self.shadow_ttl_secs = other.shadow_ttl_secs;
        }
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Compliance mode (`mode`). Defaults to `comply`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ComplianceMode>,

    /// Pre-shared nonce key as a hex string (`key`). Required to run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Address to bind the protocol socket on (`bind_addr`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_addr: Option<String>,

    /// UDP port (`port`). Defaults to the well-known protocol port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Filter durations and TTLs (`filters.*`).
    #[serde(default)]
    pub filters: FiltersConfig,
}

impl Config {
    /// Create a new empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from the standard search paths.
    ///
    /// Files are loaded in reverse priority order and merged. Returns the
    /// merged config and the paths that were actually loaded.
    pub fn load() -> Result<(Self, Vec<PathBuf>), ConfigError> {
        Self::load_from_paths(&Self::search_paths())
    }

    /// Load configuration from specific paths.
    ///
    /// Paths are processed in order, with later paths overriding earlier
    /// ones.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<(Self, Vec<PathBuf>), ConfigError> {
        let mut config = Config::default();
        let mut loaded_paths = Vec::new();

        for path in paths {
            if path.exists() {
                let file_config = Self::load_file(path)?;
                config.merge(file_config);
                loaded_paths.push(path.clone());
            }
        }

        Ok((config, loaded_paths))
    }

    /// Load configuration from a single file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source: e,
        })?;

        serde_yaml::from_str(&contents).map_err(|e| ConfigError::ParseYaml {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the standard search paths in priority order (lowest to
    /// highest).
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        // System config (lowest priority)
        paths.push(PathBuf::from("/etc/aitf").join(CONFIG_FILENAME));

        // User config directory
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("aitf").join(CONFIG_FILENAME));
        }

        // Current directory (highest priority)
        paths.push(PathBuf::from(".").join(CONFIG_FILENAME));

        paths
    }

    /// Merge another configuration into this one.
    ///
    /// Values from `other` override values in `self` when present.
    pub fn merge(&mut self, other: Config) {
        if other.mode.is_some() {
            self.mode = other.mode;
        }
        if other.key.is_some() {
            self.key = other.key;
        }
        if other.bind_addr.is_some() {
            self.bind_addr = other.bind_addr;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        self.filters.merge(other.filters);
    }

    /// The effective compliance mode.
    pub fn mode(&self) -> ComplianceMode {
        self.mode.unwrap_or(ComplianceMode::Comply)
    }

    /// The effective socket address to bind.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = self.bind_addr.as_deref().unwrap_or("0.0.0.0");
        let ip = addr.parse().map_err(ConfigError::InvalidBindAddr)?;
        Ok(SocketAddr::new(ip, self.port.unwrap_or(AITF_PORT)))
    }

    /// Build the nonce authenticator from the configured key.
    pub fn authenticator(&self) -> Result<NonceAuthenticator, ConfigError> {
        let hex_key = self.key.as_deref().ok_or(ConfigError::MissingKey)?;
        let key = hex::decode(hex_key)?;
        Ok(NonceAuthenticator::new(key))
    }

    /// The effective engine timings.
    pub fn timings(&self) -> Timings {
        let defaults = Timings::default();
        let secs = |v: Option<u64>, fallback: u64| v.map(|s| s * 1_000).unwrap_or(fallback);

        Timings {
            long_filter_ms: secs(self.filters.long_secs, defaults.long_filter_ms),
            pending_ttl_ms: secs(self.filters.pending_ttl_secs, defaults.pending_ttl_ms),
            shadow_ttl_ms: secs(self.filters.shadow_ttl_secs, defaults.shadow_ttl_ms),
        }
    }

    /// Serialize this configuration to YAML.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_defaults() {
        let config = Config::new();
        assert_eq!(config.mode(), ComplianceMode::Comply);
        assert_eq!(
            config.socket_addr().unwrap(),
            format!("0.0.0.0:{}", AITF_PORT).parse().unwrap()
        );
        assert!(matches!(
            config.authenticator(),
            Err(ConfigError::MissingKey)
        ));
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
mode: lie
key: "0102030405060708090a"
bind_addr: "127.0.0.1"
port: 4000
filters:
  long_secs: 60
  shadow_ttl_secs: 300
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.mode(), ComplianceMode::Lie);
        assert_eq!(config.socket_addr().unwrap(), "127.0.0.1:4000".parse().unwrap());

        let timings = config.timings();
        assert_eq!(timings.long_filter_ms, 60_000);
        assert_eq!(timings.shadow_ttl_ms, 300_000);
        assert_eq!(timings.pending_ttl_ms, Timings::default().pending_ttl_ms);

        config.authenticator().unwrap();
    }

    #[test]
    fn test_key_decodes_hex() {
        let config = Config {
            key: Some("0102030405060708090a".into()),
            ..Config::default()
        };
        let auth = config.authenticator().unwrap();

        let reference = NonceAuthenticator::new(vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(auth.nonce(&[8, 8, 8, 8]), reference.nonce(&[8, 8, 8, 8]));
    }

    #[test]
    fn test_invalid_key_rejected() {
        let config = Config {
            key: Some("not hex".into()),
            ..Config::default()
        };
        assert!(matches!(
            config.authenticator(),
            Err(ConfigError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_invalid_bind_addr_rejected() {
        let config = Config {
            bind_addr: Some("nowhere".into()),
            ..Config::default()
        };
        assert!(matches!(
            config.socket_addr(),
            Err(ConfigError::InvalidBindAddr(_))
        ));
    }

    #[test]
    fn test_merge_overrides_present_values_only() {
        let mut base: Config = serde_yaml::from_str(
            r#"
mode: comply
key: "01"
port: 4000
filters:
  long_secs: 60
"#,
        )
        .unwrap();
        let overlay: Config = serde_yaml::from_str(
            r#"
mode: ignore
filters:
  pending_ttl_secs: 5
"#,
        )
        .unwrap();

        base.merge(overlay);

        assert_eq!(base.mode(), ComplianceMode::Ignore);
        assert_eq!(base.key.as_deref(), Some("01"));
        assert_eq!(base.port, Some(4000));
        assert_eq!(base.filters.long_secs, Some(60));
        assert_eq!(base.filters.pending_ttl_secs, Some(5));
    }

    #[test]
    fn test_load_from_paths_cascades() {
        let dir = TempDir::new().unwrap();
        let low = dir.path().join("system.yaml");
        let high = dir.path().join("local.yaml");
        let missing = dir.path().join("absent.yaml");

        fs::write(&low, "mode: comply\nkey: \"01\"\n").unwrap();
        fs::write(&high, "mode: lie\n").unwrap();

        let (config, loaded) =
            Config::load_from_paths(&[low.clone(), missing, high.clone()]).unwrap();

        assert_eq!(loaded, vec![low, high]);
        assert_eq!(config.mode(), ComplianceMode::Lie);
        assert_eq!(config.key.as_deref(), Some("01"));
    }

    #[test]
    fn test_load_file_reports_parse_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "mode: [not, a, mode]\n").unwrap();

        assert!(matches!(
            Config::load_file(&path),
            Err(ConfigError::ParseYaml { .. })
        ));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config: Config = serde_yaml::from_str("mode: ignore\nport: 4000\n").unwrap();
        let yaml = config.to_yaml().unwrap();
        let reparsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(reparsed.mode(), ComplianceMode::Ignore);
        assert_eq!(reparsed.port, Some(4000));
    }
}
