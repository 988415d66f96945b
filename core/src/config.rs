//! Layered configuration: built-in defaults, an optional TOML file, then
//! `DIVELOG_`-prefixed environment variables (`__` separates sections).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "DIVELOG_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub transport: TransportConfig,
    pub storage: StorageConfig,
    pub ble: BleConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Upper bound for a single bounded read.
    pub full_read_timeout_ms: u64,
    /// Idle gap after which a read returns the bytes gathered so far.
    pub partial_read_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            full_read_timeout_ms: 30_000,
            partial_read_timeout_ms: 2_000,
            poll_interval_ms: 20,
        }
    }
}

impl TransportConfig {
    pub fn full_read_timeout(&self) -> Duration {
        Duration::from_millis(self.full_read_timeout_ms)
    }

    pub fn partial_read_timeout(&self) -> Duration {
        Duration::from_millis(self.partial_read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("divelog-state.json"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl BleConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Config {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Invalid(Box::new(e)))
    }

    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()
            .map_err(|e| ConfigError::Invalid(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.transport.full_read_timeout(), Duration::from_secs(30));
        assert_eq!(config.transport.poll_interval(), Duration::from_millis(20));
        assert_eq!(config.storage.path, PathBuf::from("divelog-state.json"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [transport]
            partial_read_timeout_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.transport.partial_read_timeout_ms, 500);
        assert_eq!(config.transport.full_read_timeout_ms, 30_000);
        assert_eq!(config.ble, BleConfig::default());
    }

    #[test]
    fn test_invalid_toml_value() {
        let result = Config::from_toml_str("[transport]\npoll_interval_ms = \"fast\"\n");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[storage]\npath = \"/tmp/dives.json\"").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.storage.path, PathBuf::from("/tmp/dives.json"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Some(Path::new("/nonexistent/divelog.toml")));
        assert!(matches!(result, Err(ConfigError::Missing(_))));
    }
}
