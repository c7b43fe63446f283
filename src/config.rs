//! Configuration for the celery bridge
//!
//! The configuration file is JSON with PascalCase keys (`Cafile`, `Keyfile`,
//! `Certfile`, `Username`, `Password`, `Host`, `Port`, `CN`). Files ending in
//! `.toml` are accepted with the same key names. When no file is supplied, or
//! the supplied path does not exist, built-in defaults are used.

use crate::transport::session::ReconnectConfig;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Complete bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct BridgeConfig {
    /// PEM file with the CA certificate(s) the broker certificate must chain to
    pub cafile: PathBuf,
    /// PEM file with the client private key
    pub keyfile: PathBuf,
    /// PEM file with the client certificate chain
    pub certfile: PathBuf,
    pub username: String,
    pub password: String,
    /// Broker host to connect to
    pub host: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub port: u16,
    /// Identity expected in the broker certificate
    #[serde(rename = "CN")]
    pub cn: String,
    #[serde(default = "default_vhost")]
    pub vhost: String,
    #[serde(default)]
    pub exchange: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    /// HTTP listen address
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_publish_timeout_secs")]
    pub publish_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Escalating reconnect delays; empty keeps the fixed delay
    #[serde(default)]
    pub reconnect_backoff_ms: Vec<u64>,
}

fn default_vhost() -> String {
    "/".to_string()
}

fn default_routing_key() -> String {
    "celery".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_publish_timeout_secs() -> u64 {
    10
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

/// Accept both `"5671"` and `5671`
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortValue {
        Number(u16),
        Text(String),
    }

    match PortValue::deserialize(deserializer)? {
        PortValue::Number(port) => Ok(port),
        PortValue::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port '{text}'"))),
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            cafile: PathBuf::from("/vagrant/ssl/cacert.pem"),
            keyfile: PathBuf::from("/vagrant/ssl/key.pem"),
            certfile: PathBuf::from("/vagrant/ssl/cert.pem"),
            username: "admin".to_string(),
            password: "admin".to_string(),
            host: "proxy".to_string(),
            port: 5671,
            cn: "rabbit".to_string(),
            vhost: default_vhost(),
            exchange: String::new(),
            routing_key: default_routing_key(),
            listen: default_listen(),
            publish_timeout_secs: default_publish_timeout_secs(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_backoff_ms: Vec::new(),
        }
    }
}

/// Trust material that could not be loaded
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialError {
    /// What the file was supposed to contain, e.g. "CA certificate"
    pub role: &'static str,
    pub path: PathBuf,
    pub reason: String,
}

impl fmt::Display for MaterialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.role, self.path.display(), self.reason)
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse JSON config: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Failed to parse TOML config: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Unusable trust material: {}", join_failures(.0))]
    TrustMaterial(Vec<MaterialError>),
    #[error("Failed to build TLS client configuration: {0}")]
    Tls(String),
    #[error("Invalid broker URI: {0}")]
    InvalidUri(String),
}

fn join_failures(failures: &[MaterialError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl BridgeConfig {
    /// Load configuration, falling back to defaults when no usable path is given
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if path.exists() => {
                info!("Config file found - loading configuration from {}", path.display());
                Self::load_from_file(path)
            }
            Some(path) => {
                warn!(
                    "Config file {} does not exist, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            None => {
                info!("No config file given, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

        let config: BridgeConfig = if is_toml {
            toml::from_str(&content)?
        } else {
            serde_json::from_str(&content)?
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a working bridge
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("Host", &self.host),
            ("Username", &self.username),
            ("CN", &self.cn),
            ("RoutingKey", &self.routing_key),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!("{key} must not be empty")));
            }
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "Port must be greater than 0".to_string(),
            ));
        }

        if self.publish_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "PublishTimeoutSecs must be greater than 0".to_string(),
            ));
        }

        self.listen_addr()?;
        self.reconnect_config()
            .validate()
            .map_err(ConfigError::InvalidConfig)?;

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::InvalidConfig(format!("invalid Listen address '{}'", self.listen)))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig {
            delay_ms: self.reconnect_delay_ms,
            backoff_pattern: self.reconnect_backoff_ms.clone(),
        }
    }

    /// Copy safe to print or log
    pub fn redacted(&self) -> Self {
        Self {
            password: "***".to_string(),
            ..self.clone()
        }
    }

    /// Create a test configuration pointing at the bundled PEM fixtures
    #[cfg(test)]
    pub fn test_config() -> Self {
        let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
        Self {
            cafile: fixtures.join("cacert.pem"),
            keyfile: fixtures.join("key.pem"),
            certfile: fixtures.join("cert.pem"),
            host: "localhost".to_string(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_JSON: &str = r#"{
        "Cafile": "/etc/ssl/ca.pem",
        "Keyfile": "/etc/ssl/key.pem",
        "Certfile": "/etc/ssl/cert.pem",
        "Username": "bridge",
        "Password": "s3cret",
        "Host": "rabbit.internal",
        "Port": "5671",
        "CN": "rabbit"
    }"#;

    #[test]
    fn test_parse_original_keys() {
        let config: BridgeConfig = serde_json::from_str(FULL_JSON).unwrap();
        assert_eq!(config.cafile, PathBuf::from("/etc/ssl/ca.pem"));
        assert_eq!(config.username, "bridge");
        assert_eq!(config.host, "rabbit.internal");
        assert_eq!(config.port, 5671);
        assert_eq!(config.cn, "rabbit");

        // Extended keys fall back to defaults
        assert_eq!(config.vhost, "/");
        assert_eq!(config.exchange, "");
        assert_eq!(config.routing_key, "celery");
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.publish_timeout_secs, 10);
        assert_eq!(config.reconnect_delay_ms, 1000);
        assert!(config.reconnect_backoff_ms.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_numeric_port() {
        let json = FULL_JSON.replace("\"5671\"", "5672");
        let config: BridgeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.port, 5672);
    }

    #[test]
    fn test_invalid_port_text() {
        let json = FULL_JSON.replace("\"5671\"", "\"amqps\"");
        let result: Result<BridgeConfig, _> = serde_json::from_str(&json);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_required_key() {
        let json = FULL_JSON.replace("\"Host\": \"rabbit.internal\",", "");
        let result: Result<BridgeConfig, _> = serde_json::from_str(&json);
        assert!(result.is_err());
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.host, "proxy");
        assert_eq!(config.port, 5671);
        assert_eq!(config.username, "admin");
        assert_eq!(config.cn, "rabbit");
        assert_eq!(config.cafile, PathBuf::from("/vagrant/ssl/cacert.pem"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let config = BridgeConfig {
            host: " ".to_string(),
            ..BridgeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(msg)) if msg.contains("Host")
        ));
    }

    #[test]
    fn test_validate_rejects_zero_port() {
        let config = BridgeConfig {
            port: 0,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_listen() {
        let config = BridgeConfig {
            listen: "not-an-address".to_string(),
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = BridgeConfig {
            publish_timeout_secs: 0,
            ..BridgeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_config_mapping() {
        let config = BridgeConfig {
            reconnect_delay_ms: 500,
            reconnect_backoff_ms: vec![100, 200],
            ..BridgeConfig::default()
        };
        let reconnect = config.reconnect_config();
        assert_eq!(reconnect.delay_ms, 500);
        assert_eq!(reconnect.backoff_pattern, vec![100, 200]);
    }

    #[test]
    fn test_redacted_hides_password() {
        let config = BridgeConfig::default().redacted();
        assert_eq!(config.password, "***");
        assert_eq!(config.username, "admin");
    }

    #[test]
    fn test_trust_material_error_lists_every_file() {
        let error = ConfigError::TrustMaterial(vec![
            MaterialError {
                role: "CA certificate",
                path: PathBuf::from("/missing/ca.pem"),
                reason: "No such file or directory".to_string(),
            },
            MaterialError {
                role: "client key",
                path: PathBuf::from("/missing/key.pem"),
                reason: "No such file or directory".to_string(),
            },
        ]);

        let message = error.to_string();
        assert!(message.contains("/missing/ca.pem"));
        assert!(message.contains("/missing/key.pem"));
    }
}
