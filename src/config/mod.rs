//! Configuration Module
//!
//! TOML configuration for pubgate, layered as:
//! - built-in defaults
//! - the config file, with `${VAR}` / `${VAR:-default}` substitution
//! - `PUBGATE__SECTION__KEY` environment overrides
//! - the flat `PORT`, `BROKER_URL`, `NAME` and `DEBUG` variables

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::client::{self, MqttClientConfig, ProtocolVersion, QoS};
use crate::pool::PoolConfig;

#[cfg(test)]
mod tests;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").expect("env var pattern is valid");
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Broker connection configuration
    pub broker: BrokerConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Ceiling on handling a single request (e.g., "60s")
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,
    /// How long in-flight requests may run after a shutdown signal
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            request_timeout: default_request_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Broker connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker URL (mqtt://host:port)
    pub url: String,
    /// Client display name; each connection's client id is derived from it
    pub client_name: String,
    /// MQTT protocol version: "v5" or "v311"
    pub protocol: ProtocolVersion,
    /// Keep alive in seconds (0 disables)
    pub keep_alive: u16,
    /// Bound on TCP connect and CONNACK
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Publish QoS (0 or 1)
    pub qos: u8,
    /// QoS 1 publishes awaiting PUBACK per connection
    pub max_inflight: u16,
    /// Reconnect attempts after a dropped session before giving up
    pub reconnect_attempts: u32,
    /// First reconnect delay, doubled after each failure
    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,
    /// Upper bound on the reconnect delay
    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".to_string(),
            client_name: "publisher".to_string(),
            protocol: ProtocolVersion::V5,
            keep_alive: 60,
            connect_timeout: Duration::from_secs(10),
            qos: 0,
            max_inflight: 32,
            reconnect_attempts: 3,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    /// Settings for the MQTT client
    pub fn client_config(&self) -> MqttClientConfig {
        MqttClientConfig {
            protocol: self.protocol,
            keep_alive: self.keep_alive,
            connect_timeout: self.connect_timeout,
            qos: QoS::from_u8(self.qos).unwrap_or_default(),
            max_inflight: self.max_inflight,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_interval: self.reconnect_interval,
            max_reconnect_interval: self.max_reconnect_interval,
        }
    }

    /// Settings for the connection pool
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            url: self.url.clone(),
            client_name: self.client_name.clone(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports three forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `PUBGATE__` prefix with double underscores for nesting:
    ///    - `PUBGATE__SERVER__BIND=0.0.0.0:9090` overrides `server.bind`
    ///    - `PUBGATE__BROKER__URL=mqtt://broker:1883` overrides `broker.url`
    /// 3. The flat variables `PORT`, `BROKER_URL`, `NAME` and `DEBUG=true`,
    ///    which take precedence over everything else
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Load configuration with environment variable overrides only (no file).
    ///
    /// Useful for containerized deployments where all config comes from env vars.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    fn load_with<P, F>(path: P, lookup: F) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("server.bind", "0.0.0.0:8080")?
            .set_default("server.request_timeout", "60s")?
            .set_default("server.shutdown_timeout", "10s")?
            .set_default("broker.url", "mqtt://localhost:1883")?
            .set_default("broker.client_name", "publisher")?
            .set_default("broker.protocol", "v5")?
            .set_default("broker.keep_alive", 60)?
            .set_default("broker.connect_timeout", "10s")?
            .set_default("broker.qos", 0)?
            .set_default("broker.max_inflight", 32)?
            .set_default("broker.reconnect_attempts", 3)?
            .set_default("broker.reconnect_interval", "1s")?
            .set_default("broker.max_reconnect_interval", "30s")?;

        // Load from file with env var substitution
        let path = path.as_ref();
        if !path.as_os_str().is_empty() {
            match std::fs::read_to_string(path) {
                Ok(content) => {
                    let substituted = substitute_env_vars(&content);
                    builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // File doesn't exist, use defaults
                }
                Err(e) => return Err(ConfigError::Io(e)),
            }
        }

        // Override with environment variables (PUBGATE__SERVER__BIND, etc.)
        // Double underscore separates nested keys, single underscore preserved in field names
        builder = builder.add_source(
            Environment::with_prefix("PUBGATE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = apply_flat_env(builder, lookup)?.build()?;
        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (for testing, no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.qos > 1 {
            return Err(ConfigError::Validation(
                "broker.qos must be 0 or 1".to_string(),
            ));
        }

        if self.broker.max_inflight == 0 {
            return Err(ConfigError::Validation(
                "broker.max_inflight must be greater than 0".to_string(),
            ));
        }

        if self.broker.url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "broker.url must not be empty".to_string(),
            ));
        }
        if let Err(e) = client::parse_url(&self.broker.url) {
            return Err(ConfigError::Validation(format!("broker.url: {}", e)));
        }

        if self.broker.client_name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "broker.client_name must not be empty".to_string(),
            ));
        }

        if self.server.request_timeout.is_zero() {
            return Err(ConfigError::Validation(
                "server.request_timeout must be greater than zero".to_string(),
            ));
        }

        if self.broker.max_reconnect_interval < self.broker.reconnect_interval {
            return Err(ConfigError::Validation(
                "broker.max_reconnect_interval must not be below broker.reconnect_interval"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Apply `PORT`, `BROKER_URL`, `NAME` and `DEBUG` on top of the other sources
fn apply_flat_env<F>(
    builder: ConfigBuilder<DefaultState>,
    lookup: F,
) -> Result<ConfigBuilder<DefaultState>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let port = match lookup("PORT") {
        Some(port) => Some(port.trim().parse::<u16>().map_err(|_| {
            ConfigError::Validation(format!("PORT must be a port number, got '{}'", port))
        })?),
        None => None,
    };
    let debug = lookup("DEBUG").is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));

    Ok(builder
        .set_override_option("server.bind", port.map(|p| format!("0.0.0.0:{}", p)))?
        .set_override_option("broker.url", lookup("BROKER_URL"))?
        .set_override_option("broker.client_name", lookup("NAME"))?
        .set_override_option("log.level", debug.then(|| "debug".to_string()))?)
}
