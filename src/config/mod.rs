//! Application configuration.
//!
//! Loaded from YAML files and `ANGZARR_RPC__*` environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, RpcError};
use crate::server::ServerOptions;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "angzarr-rpc.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "ANGZARR_RPC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "ANGZARR_RPC";

/// Broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    pub url: String,
    pub pool_size: usize,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout applied to calls without their own, in milliseconds.
    pub default_ttl_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: 5000,
        }
    }
}

impl ClientConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub service_name: String,
    pub auto_ack: bool,
    /// Unbounded when absent.
    pub max_concurrent_requests: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service_name: "echo".to_string(),
            auto_ack: false,
            max_concurrent_requests: None,
        }
    }
}

impl ServerConfig {
    pub fn options(&self) -> ServerOptions {
        ServerOptions {
            auto_ack: self.auto_ack,
            max_concurrent_requests: self.max_concurrent_requests,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub amqp: AmqpSettings,
    pub client: ClientConfig,
    pub server: ServerConfig,
}

impl RpcConfig {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `angzarr-rpc.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `ANGZARR_RPC_CONFIG` (if set)
    /// 4. Environment variables prefixed `ANGZARR_RPC__`, e.g.
    ///    `ANGZARR_RPC__AMQP__URL`
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: RpcConfig = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RpcError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.client.default_ttl_ms == 0 {
            return Err(RpcError::Config(
                "client.default_ttl_ms must be greater than zero".to_string(),
            ));
        }
        if self.server.service_name.is_empty() {
            return Err(RpcError::Config(
                "server.service_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn yaml_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_config_default() {
        let config = RpcConfig::default();
        assert_eq!(config.amqp.url, "amqp://localhost:5672");
        assert_eq!(config.amqp.pool_size, 10);
        assert_eq!(config.client.default_ttl(), Duration::from_secs(5));
        assert_eq!(config.server.options(), ServerOptions::default());
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let file = yaml_file(
            r#"
amqp:
  url: amqp://rabbit:5672
client:
  default_ttl_ms: 250
server:
  service_name: calculator
  max_concurrent_requests: 8
"#,
        );

        let config = RpcConfig::load(file.path().to_str()).unwrap();

        assert_eq!(config.amqp.url, "amqp://rabbit:5672");
        assert_eq!(config.amqp.pool_size, 10);
        assert_eq!(config.client.default_ttl(), Duration::from_millis(250));
        assert_eq!(config.server.service_name, "calculator");
        assert_eq!(config.server.options().max_concurrent_requests, Some(8));
        assert!(!config.server.options().auto_ack);
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = yaml_file("server:\n  service_name: calculator\n");
        std::env::set_var("ANGZARR_RPC__SERVER__AUTO_ACK", "true");
        std::env::set_var("ANGZARR_RPC__AMQP__POOL_SIZE", "3");

        let result = RpcConfig::load(file.path().to_str());

        std::env::remove_var("ANGZARR_RPC__SERVER__AUTO_ACK");
        std::env::remove_var("ANGZARR_RPC__AMQP__POOL_SIZE");

        let config = result.unwrap();
        assert_eq!(config.server.service_name, "calculator");
        assert!(config.server.auto_ack);
        assert_eq!(config.amqp.pool_size, 3);
    }

    #[test]
    #[serial]
    fn test_zero_ttl_rejected() {
        let file = yaml_file("client:\n  default_ttl_ms: 0\n");
        let result = RpcConfig::load(file.path().to_str());
        assert!(matches!(result, Err(RpcError::Config(_))));
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        let result = RpcConfig::load(Some("/nonexistent/angzarr-rpc.yaml"));
        assert!(matches!(result, Err(RpcError::Config(_))));
    }
}
