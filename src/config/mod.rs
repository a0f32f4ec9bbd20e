//! Application configuration.
//!
//! Aggregates configuration for every transport, the error surface, the
//! queue and named driver connections into a single `Config` that can be
//! loaded from YAML files and environment variables.

mod drivers;

pub use drivers::{
    ConnectionStore, DriverConstructor, DriverError, DriverRegistry, DriverSettings,
    DriversConfig,
};

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EVENTLINE_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EVENTLINE";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EVENTLINE_LOG";

/// Default `source` attribute stamped on outgoing events.
pub const DEFAULT_SOURCE: &str = "urn:eventline:sender";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application identity.
    pub app: AppConfig,
    /// Receiver server configuration.
    pub server: ServerConfig,
    /// Transport configuration.
    pub messaging: MessagingConfig,
    /// Error surface configuration.
    pub errors: ErrorSurfaceConfig,
    /// Queue defaults.
    pub queue: QueueConfig,
    /// Named driver connections.
    pub drivers: DriversConfig,
}

/// Application identity, handed to driver constructors.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub name: String,
    pub env: String,
    pub debug: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "eventline".to_string(),
            env: "local".to_string(),
            debug: false,
        }
    }
}

/// Receiver server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind the HTTP receiver to.
    pub host: String,
    /// Port for the HTTP receiver.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// Socket address string for binding.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// `source` attribute assigned by the event factories.
    pub source: String,
    /// HTTP webhook transport.
    pub http: HttpConfig,
    /// Kafka transport.
    pub kafka: KafkaConfig,
    /// gRPC transport.
    pub rpc: RpcConfig,
    /// In-process channel transport.
    pub channel: ChannelConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            http: HttpConfig::default(),
            kafka: KafkaConfig::default(),
            rpc: RpcConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

/// HTTP transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Request timeout in seconds.
    pub timeout_secs: u64,
    /// Additional headers sent with every request.
    pub headers: HashMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            headers: HashMap::new(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Kafka-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Message delivery timeout in seconds.
    pub timeout_secs: u64,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            timeout_secs: 5,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
        }
    }
}

impl KafkaConfig {
    /// Config pointing at the given brokers with default settings.
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            ..Default::default()
        }
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// gRPC transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
    /// Connect timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            connect_timeout_secs: 5,
        }
    }
}

/// In-process channel configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Broadcast channel capacity.
    pub capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self { capacity: 1024 }
    }
}

/// Error surface configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ErrorSurfaceConfig {
    /// Maximum number of undrained errors held by the surface.
    pub capacity: usize,
}

impl Default for ErrorSurfaceConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

/// Queue defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long an idle consumer waits before polling again, in milliseconds.
    pub poll_interval_ms: u64,
    /// Default delay between failed attempts, in seconds.
    pub sleep_secs: u64,
    /// Default total attempts per message.
    pub retry_limit: u32,
    /// Default per-attempt timeout in seconds (0 = unbounded).
    pub timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            sleep_secs: 1,
            retry_limit: 3,
            timeout_secs: 30,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. Compiled-in defaults
    /// 2. `config.yaml` in current directory (if exists)
    /// 3. File specified by `path` argument (if provided)
    /// 4. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 5. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self::default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.app.name, "eventline");
        assert_eq!(config.messaging.source, DEFAULT_SOURCE);
        assert_eq!(config.messaging.kafka.bootstrap_servers, "localhost:9092");
        assert_eq!(config.messaging.channel.capacity, 1024);
        assert_eq!(config.errors.capacity, 64);
        assert_eq!(config.queue.retry_limit, 3);
        assert!(config.drivers.connections.is_empty());
    }

    #[test]
    fn test_server_addr() {
        let server = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 9000,
        };
        assert_eq!(server.addr(), "127.0.0.1:9000");
    }

    #[test]
    fn test_kafka_sasl_sets_protocol() {
        let kafka = KafkaConfig::new("broker:9092").with_sasl("user", "pass", "PLAIN");
        assert_eq!(kafka.bootstrap_servers, "broker:9092");
        assert_eq!(kafka.sasl_mechanism.as_deref(), Some("PLAIN"));
        assert_eq!(kafka.security_protocol.as_deref(), Some("SASL_SSL"));
    }

    #[test]
    fn test_queue_poll_interval() {
        let queue = QueueConfig {
            poll_interval_ms: 250,
            ..Default::default()
        };
        assert_eq!(queue.poll_interval(), Duration::from_millis(250));
    }
}
