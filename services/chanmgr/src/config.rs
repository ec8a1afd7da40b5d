//! Channel manager configuration
//!
//! Priority (highest to lowest):
//! 1. Environment variables prefixed `CHANMGR_` (nested keys split on `__`,
//!    e.g. `CHANMGR_LOGGING__LEVEL=debug`)
//! 2. Config file (YAML, TOML or JSON, picked by extension)
//! 3. Default values

use figment::providers::{Env, Format, Json, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::core::{ReaderFactoryKind, DEFAULT_STOP_TIMEOUT_MS};
use crate::error::{ChannelManagerError, Result};
use crate::log_limiter::DEFAULT_SUPPRESSION_INTERVAL_MS;
use crate::types::{AppId, ChannelLocator, DeviceLocator, Direction, Sampling};

pub const ENV_PREFIX: &str = "CHANMGR_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelManagerConfig {
    /// Reader thread grouping used unless overridden per driver
    pub reader_factory: ReaderFactoryKind,

    /// Driver id to reader thread grouping
    pub driver_reader_factories: HashMap<String, ReaderFactoryKind>,

    pub log_suppression_interval_ms: u64,

    pub reader_stop_timeout_ms: u64,

    /// Bound on synchronous discovery; unbounded when absent
    pub discovery_timeout_ms: Option<u64>,

    pub logging: LoggingConfig,

    /// Channels opened by the service binary at startup
    pub channels: Vec<ChannelSpec>,
}

impl Default for ChannelManagerConfig {
    fn default() -> Self {
        Self {
            reader_factory: ReaderFactoryKind::default(),
            driver_reader_factories: HashMap::new(),
            log_suppression_interval_ms: DEFAULT_SUPPRESSION_INTERVAL_MS,
            reader_stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            discovery_timeout_ms: None,
            logging: LoggingConfig::default(),
            channels: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
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
    "info".to_string()
}

fn default_app() -> String {
    "chanmgr".to_string()
}

/// One channel to open at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub driver: String,
    pub interface: String,
    pub device: String,
    pub address: String,
    #[serde(default)]
    pub direction: Direction,
    /// Period in ms, `-1` for listen, `0` for on demand
    #[serde(default = "default_sampling")]
    pub sampling: Sampling,
    #[serde(default = "default_app")]
    pub app: String,
}

fn default_sampling() -> Sampling {
    Sampling::OnDemand
}

impl ChannelSpec {
    pub fn locator(&self) -> ChannelLocator {
        DeviceLocator::new(&self.driver, &self.interface, &self.device).channel(&self.address)
    }

    pub fn app_id(&self) -> AppId {
        AppId::new(&self.app)
    }
}

impl ChannelManagerConfig {
    /// Load from an optional file plus `CHANMGR_` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    pub(crate) fn load_with_env_prefix(path: Option<&Path>, prefix: &str) -> Result<Self> {
        let mut figment = Figment::new();
        if let Some(path) = path {
            figment = merge_file(figment, path)?;
        }
        figment = figment.merge(Env::prefixed(prefix).split("__"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reader_stop_timeout_ms == 0 {
            return Err(ChannelManagerError::Config(
                "reader_stop_timeout_ms must be positive".to_string(),
            ));
        }
        if self.discovery_timeout_ms == Some(0) {
            return Err(ChannelManagerError::Config(
                "discovery_timeout_ms must be positive when set".to_string(),
            ));
        }
        for spec in &self.channels {
            if spec.driver.is_empty() || spec.address.is_empty() {
                return Err(ChannelManagerError::Config(format!(
                    "Channel entry needs driver and address: {:?}",
                    spec
                )));
            }
        }
        Ok(())
    }
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    if !path.exists() {
        return Err(ChannelManagerError::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| ChannelManagerError::Config("Config file must have an extension".to_string()))?;

    match extension {
        "toml" => Ok(figment.merge(Toml::file(path))),
        "yaml" | "yml" => Ok(figment.merge(Yaml::file(path))),
        "json" => Ok(figment.merge(Json::file(path))),
        _ => Err(ChannelManagerError::Config(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    fn write_config(suffix: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = ChannelManagerConfig::load_with_env_prefix(None, "CHANMGR_TEST_DEFAULTS_").unwrap();
        assert_eq!(config, ChannelManagerConfig::default());
        assert_eq!(config.log_suppression_interval_ms, 500);
        assert_eq!(config.reader_stop_timeout_ms, 2000);
        assert_eq!(config.reader_factory, ReaderFactoryKind::PerDevice);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_yaml_file() {
        let file = write_config(
            ".yaml",
            r#"
reader_factory: per_driver
driver_reader_factories:
  modbus: per_device
discovery_timeout_ms: 3000
logging:
  level: debug
channels:
  - driver: sim
    interface: bus0
    device: p1
    address: temp
    direction: in_out
    sampling: 1000
  - driver: sim
    interface: bus0
    device: p1
    address: alarm
    sampling: -1
"#,
        );
        let config =
            ChannelManagerConfig::load_with_env_prefix(Some(file.path()), "CHANMGR_TEST_YAML_").unwrap();
        assert_eq!(config.reader_factory, ReaderFactoryKind::PerDriver);
        assert_eq!(
            config.driver_reader_factories.get("modbus"),
            Some(&ReaderFactoryKind::PerDevice)
        );
        assert_eq!(config.discovery_timeout_ms, Some(3000));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].direction, Direction::InOut);
        assert_eq!(config.channels[0].sampling, Sampling::Period(1000));
        assert_eq!(config.channels[1].sampling, Sampling::Listen);
        assert_eq!(config.channels[1].direction, Direction::Input);
        assert_eq!(config.channels[1].app, "chanmgr");
        assert_eq!(config.channels[0].locator().to_string(), "sim:bus0:p1/temp");
    }

    #[test]
    fn test_toml_file() {
        let file = write_config(
            ".toml",
            r#"
log_suppression_interval_ms = 100
reader_stop_timeout_ms = 250
"#,
        );
        let config =
            ChannelManagerConfig::load_with_env_prefix(Some(file.path()), "CHANMGR_TEST_TOML_").unwrap();
        assert_eq!(config.log_suppression_interval_ms, 100);
        assert_eq!(config.reader_stop_timeout_ms, 250);
    }

    #[test]
    fn test_env_overrides_file() {
        let file = write_config(".json", r#"{ "logging": { "level": "warn" } }"#);
        std::env::set_var("CHANMGR_TEST_ENV_LOGGING__LEVEL", "trace");
        std::env::set_var("CHANMGR_TEST_ENV_READER_FACTORY", "per_driver");
        let config =
            ChannelManagerConfig::load_with_env_prefix(Some(file.path()), "CHANMGR_TEST_ENV_").unwrap();
        std::env::remove_var("CHANMGR_TEST_ENV_LOGGING__LEVEL");
        std::env::remove_var("CHANMGR_TEST_ENV_READER_FACTORY");
        assert_eq!(config.logging.level, "trace");
        assert_eq!(config.reader_factory, ReaderFactoryKind::PerDriver);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let file = write_config(".yaml", "reader_stop_timeout_ms: 0\n");
        let err = ChannelManagerConfig::load_with_env_prefix(Some(file.path()), "CHANMGR_TEST_BAD_")
            .unwrap_err();
        assert!(matches!(err, ChannelManagerError::Config(_)));

        let file = write_config(".ini", "x=1\n");
        assert!(ChannelManagerConfig::load_with_env_prefix(Some(file.path()), "CHANMGR_TEST_INI_").is_err());

        let missing = Path::new("/nonexistent/chanmgr.yaml");
        assert!(ChannelManagerConfig::load(Some(missing)).is_err());
    }
}
