//! Configuration management for Tor61 nodes
//!
//! Defaults, TOML files and `TOR61_*` environment overrides, all passed
//! through [`Config::validate`] before use.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

use crate::core_directory::RouterDescriptor;
use crate::logging::LogLevel;

/// Highest group or instance number a router name can carry
pub const MAX_NAME_NUMBER: u16 = 9999;

/// Main node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub circuit: CircuitConfig,
    pub registry: RegistryConfig,
    pub logging: LoggingConfig,
}

/// Identity and listening ports of this router
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub group: u16,
    pub instance: u16,

    /// Port other routers connect to (0 = ephemeral)
    pub peer_port: u16,

    /// Port of the local HTTP proxy
    pub proxy_port: u16,

    /// Pause before a node is started again after a fatal error
    #[serde(with = "humantime_serde")]
    pub reboot_delay: Duration,
}

/// Entry circuit construction and health checking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Number of EXTENDs after the first hop
    pub hops: usize,

    /// How long to wait for OPENED, CREATED and EXTENDED
    #[serde(with = "humantime_serde")]
    pub reply_timeout: Duration,

    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// `host:port` that must fail to BEGIN
    pub bogus_host: String,

    /// `host:port` that must BEGIN successfully
    pub known_host: String,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Pause between failed build attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Consecutive failed builds before the node gives up (0 = never)
    pub max_rebuild_attempts: u32,
}

/// Where the router list comes from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// `host:port` of the registration service; without one the static
    /// `routers` list is used
    pub address: Option<String>,

    /// Prefix of the registered router name
    pub name_prefix: String,

    /// Host recorded for routers in registry listings
    pub router_host: String,

    /// Static router list
    pub routers: Vec<RouterDescriptor>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            group: 1,
            instance: 1,
            peer_port: 0,
            proxy_port: 8080,
            reboot_delay: Duration::from_secs(2),
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            hops: 2,
            reply_timeout: Duration::from_millis(1500),
            probe_interval: Duration::from_millis(7000),
            probe_timeout: Duration::from_millis(1500),
            bogus_host: "tor61.bogus.invalid:80".to_string(),
            known_host: "www.example.com:80".to_string(),
            connect_timeout: Duration::from_millis(3000),
            retry_delay: Duration::from_millis(500),
            max_rebuild_attempts: 0,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            address: None,
            name_prefix: "Tor61".to_string(),
            router_host: "127.0.0.1".to_string(),
            routers: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ConfigError::BadOverride {
            var: name.to_string(),
            reason: format!("`{}`: {}", value, e),
        })
}

fn check_host(field: &str, host: &str) -> Result<(), ConfigError> {
    let well_formed = host.is_ascii()
        && !host.contains('\0')
        && host
            .rsplit_once(':')
            .is_some_and(|(name, port)| !name.is_empty() && port.parse::<u16>().is_ok());
    if well_formed {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} must be host:port, got `{}`",
            field, host
        )))
    }
}

fn check_nonzero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::Invalid(format!(
            "{} must be greater than 0",
            field
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern `TOR61_<KEY>`, e.g.
    /// `TOR61_PROXY_PORT=8080` or `TOR61_REGISTRY_ADDRESS=127.0.0.1:1337`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_overrides(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TOR61_*` overrides looked up through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("TOR61_GROUP") {
            self.node.group = parse_var("TOR61_GROUP", &v)?;
        }
        if let Some(v) = lookup("TOR61_INSTANCE") {
            self.node.instance = parse_var("TOR61_INSTANCE", &v)?;
        }
        if let Some(v) = lookup("TOR61_PEER_PORT") {
            self.node.peer_port = parse_var("TOR61_PEER_PORT", &v)?;
        }
        if let Some(v) = lookup("TOR61_PROXY_PORT") {
            self.node.proxy_port = parse_var("TOR61_PROXY_PORT", &v)?;
        }

        if let Some(v) = lookup("TOR61_CIRCUIT_HOPS") {
            self.circuit.hops = parse_var("TOR61_CIRCUIT_HOPS", &v)?;
        }
        if let Some(v) = lookup("TOR61_KNOWN_HOST") {
            self.circuit.known_host = v;
        }
        if let Some(v) = lookup("TOR61_BOGUS_HOST") {
            self.circuit.bogus_host = v;
        }

        if let Some(v) = lookup("TOR61_REGISTRY_ADDRESS") {
            self.registry.address = Some(v);
        }

        if let Some(v) = lookup("TOR61_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("TOR61_LOG_JSON") {
            self.logging.json_format = parse_var("TOR61_LOG_JSON", &v)?;
        }
        Ok(())
    }

    /// Read a TOML file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.group > MAX_NAME_NUMBER || self.node.instance > MAX_NAME_NUMBER {
            return Err(ConfigError::Invalid(format!(
                "group and instance must be at most {}",
                MAX_NAME_NUMBER
            )));
        }

        if self.circuit.hops == 0 {
            return Err(ConfigError::Invalid("hops must be at least 1".to_string()));
        }
        check_nonzero("reply_timeout", self.circuit.reply_timeout)?;
        check_nonzero("probe_interval", self.circuit.probe_interval)?;
        check_nonzero("probe_timeout", self.circuit.probe_timeout)?;
        check_nonzero("connect_timeout", self.circuit.connect_timeout)?;
        check_host("bogus_host", &self.circuit.bogus_host)?;
        check_host("known_host", &self.circuit.known_host)?;

        if self.logging.level.parse::<LogLevel>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level `{}`",
                self.logging.level
            )));
        }

        Ok(())
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit.hops, 2);
        assert_eq!(config.circuit.reply_timeout, Duration::from_millis(1500));
        assert_eq!(config.circuit.probe_interval, Duration::from_millis(7000));
        assert_eq!(config.registry.name_prefix, "Tor61");
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.circuit.hops = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.circuit.reply_timeout = Duration::ZERO;
        assert!(config.validate().is_err());

        config = Config::default();
        config.node.instance = 10_000;
        assert!(config.validate().is_err());

        config = Config::default();
        config.circuit.bogus_host = "no-port".to_string();
        assert!(config.validate().is_err());

        config = Config::default();
        config.circuit.known_host = "bad\0host:80".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("TOR61_GROUP", "12"),
            ("TOR61_INSTANCE", "3"),
            ("TOR61_PROXY_PORT", "9000"),
            ("TOR61_REGISTRY_ADDRESS", "127.0.0.1:1337"),
            ("TOR61_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config
            .apply_overrides(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.node.group, 12);
        assert_eq!(config.node.instance, 3);
        assert_eq!(config.node.proxy_port, 9000);
        assert_eq!(config.registry.address.as_deref(), Some("127.0.0.1:1337"));
        assert!(config.logging.json_format);
    }

    #[test]
    fn test_bad_override() {
        let mut config = Config::default();
        let result = config.apply_overrides(|name| {
            (name == "TOR61_PEER_PORT").then(|| "seventy".to_string())
        });
        assert!(matches!(result, Err(ConfigError::BadOverride { .. })));
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tor61.toml");

        let mut config = Config::default();
        config.node.group = 7;
        config.circuit.probe_interval = Duration::from_secs(10);
        config.registry.routers = vec![RouterDescriptor::new("10.0.0.1", 4000, 65537)];
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.node.group, 7);
        assert_eq!(loaded.circuit.probe_interval, Duration::from_secs(10));
        assert_eq!(loaded.registry.routers, config.registry.routers);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tor61.toml");
        std::fs::write(&path, "[node]\ngroup = 5\n\n[circuit]\nprobe_interval = \"3s\"\n").unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.node.group, 5);
        assert_eq!(loaded.node.proxy_port, 8080);
        assert_eq!(loaded.circuit.probe_interval, Duration::from_secs(3));
        assert_eq!(loaded.circuit.hops, 2);
    }

    #[test]
    fn test_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tor61.toml");
        std::fs::write(&path, "[circuit]\nhops = 0\n").unwrap();
        assert!(matches!(
            Config::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Config::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
