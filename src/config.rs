//! # Configuration Management
//!
//! Centralized configuration for game servers and bot clients.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment overrides via `from_env()`
//! - Direct instantiation with defaults
//!
//! Durations are written as whole seconds. A zero read or write timeout
//! disables that deadline; the authentication grace window must be non-zero.
//!
//! ```toml
//! [server]
//! address = "0.0.0.0:9000"
//! network = "websocket"
//! websocket_path = "/ws"
//! auth_timeout = 10
//!
//! [server.tls]
//! cert_file = "cert.pem"
//! key_file = "key.pem"
//! ```

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::{ProtocolError, Result};
use crate::transport::tls::{TlsClientConfig, TlsServerConfig};
use crate::transport::{ConnTimeouts, DialOptions, KcpMode, ListenOptions, TransportKind};
use crate::utils::timeout;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults overridden by `GAMENET_*` environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("GAMENET_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(network) = std::env::var("GAMENET_NETWORK") {
            let kind = network.parse::<TransportKind>()?;
            config.server.network = kind;
            config.client.network = kind;
        }

        if let Ok(mode) = std::env::var("GAMENET_KCP_MODE") {
            let mode = mode.parse::<KcpMode>()?;
            config.server.kcp_mode = mode;
            config.client.kcp_mode = mode;
        }

        if let Ok(val) = std::env::var("GAMENET_MAX_CONNECTIONS") {
            if let Ok(val) = val.parse::<usize>() {
                config.server.max_connections = val;
            }
        }

        if let Ok(val) = std::env::var("GAMENET_AUTH_TIMEOUT_SECS") {
            if let Ok(val) = val.parse::<u64>() {
                config.server.auth_timeout = Duration::from_secs(val);
            }
        }

        if let Ok(val) = std::env::var("GAMENET_READ_TIMEOUT_SECS") {
            if let Ok(val) = val.parse::<u64>() {
                config.server.read_timeout = Duration::from_secs(val);
                config.client.read_timeout = Duration::from_secs(val);
            }
        }

        if let Ok(val) = std::env::var("GAMENET_WRITE_TIMEOUT_SECS") {
            if let Ok(val) = val.parse::<u64>() {
                config.server.write_timeout = Duration::from_secs(val);
                config.client.write_timeout = Duration::from_secs(val);
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Certificate and key files for a TLS listener
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsFiles {
    pub cert_file: String,
    pub key_file: String,
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Free-form build or protocol version reported in logs
    pub version: String,

    /// Listen address (e.g., "0.0.0.0:9000")
    pub address: String,

    pub network: TransportKind,

    /// HTTP path served by the WebSocket transport
    pub websocket_path: String,

    pub kcp_mode: KcpMode,

    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,

    /// Concurrent connections admitted by the accept loop
    pub max_connections: usize,

    /// Grace window for a new connection to authenticate
    #[serde(with = "duration_secs")]
    pub auth_timeout: Duration,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsFiles>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: String::new(),
            address: String::from("127.0.0.1:9000"),
            network: TransportKind::Tcp,
            websocket_path: String::from("/ws"),
            kcp_mode: KcpMode::Fast,
            read_timeout: timeout::DEFAULT_READ_TIMEOUT,
            write_timeout: timeout::DEFAULT_WRITE_TIMEOUT,
            max_connections: 10_000,
            auth_timeout: timeout::DEFAULT_AUTH_TIMEOUT,
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if !self.websocket_path.starts_with('/') {
            errors.push(format!(
                "WebSocket path must start with '/': '{}'",
                self.websocket_path
            ));
        }

        errors.extend(validate_timeouts(self.read_timeout, self.write_timeout));

        if self.auth_timeout.is_zero() {
            errors.push("Authentication timeout must be greater than 0".to_string());
        } else if self.auth_timeout.as_secs() > 300 {
            errors.push("Authentication timeout too long (maximum: 300s)".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 1_000_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if let Some(tls) = &self.tls {
            if tls.cert_file.is_empty() || tls.key_file.is_empty() {
                errors.push("TLS requires both cert_file and key_file".to_string());
            }
        }

        errors
    }

    pub fn timeouts(&self) -> ConnTimeouts {
        ConnTimeouts::new(self.read_timeout, self.write_timeout)
    }

    /// Build listener options, loading TLS material if configured.
    pub fn listen_options(&self) -> Result<ListenOptions> {
        let mut options = ListenOptions::new(self.address.clone())
            .with_timeouts(self.timeouts())
            .with_kcp_mode(self.kcp_mode)
            .with_websocket_path(self.websocket_path.clone());

        if let Some(tls) = &self.tls {
            let server_config = TlsServerConfig::new(&tls.cert_file, &tls.key_file);
            options = options.with_tls(Arc::new(server_config.load_server_config()?));
        }
        Ok(options)
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    pub network: TransportKind,

    pub websocket_path: String,

    pub kcp_mode: KcpMode,

    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub write_timeout: Duration,

    /// Server name to verify; enables TLS when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_server_name: Option<String>,

    /// Skip certificate verification (development only)
    pub tls_insecure: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            network: TransportKind::Tcp,
            websocket_path: String::from("/ws"),
            kcp_mode: KcpMode::Fast,
            read_timeout: Duration::ZERO,
            write_timeout: timeout::DEFAULT_WRITE_TIMEOUT,
            tls_server_name: None,
            tls_insecure: false,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if !self.address.contains(':') {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: 'example.com:8080')",
                self.address
            ));
        }

        if !self.websocket_path.starts_with('/') {
            errors.push(format!(
                "WebSocket path must start with '/': '{}'",
                self.websocket_path
            ));
        }

        errors.extend(validate_timeouts(self.read_timeout, self.write_timeout));
        errors
    }

    /// Build dial options, constructing a TLS client config if configured.
    pub fn dial_options(&self) -> Result<DialOptions> {
        let mut options = DialOptions::new(self.address.clone())
            .with_timeouts(ConnTimeouts::new(self.read_timeout, self.write_timeout))
            .with_kcp_mode(self.kcp_mode)
            .with_websocket_path(self.websocket_path.clone());

        if let Some(name) = &self.tls_server_name {
            let mut tls = TlsClientConfig::new(name.clone());
            if self.tls_insecure {
                tls = tls.insecure();
            }
            options = options.with_tls(Arc::new(tls.load_client_config()?), tls.server_name()?);
        }
        Ok(options)
    }
}

fn validate_timeouts(read: Duration, write: Duration) -> Vec<String> {
    let mut errors = Vec::new();
    if read.as_secs() > 3600 {
        errors.push("Read timeout too long (maximum: 1 hour)".to_string());
    }
    if write.as_secs() > 3600 {
        errors.push("Write timeout too long (maximum: 1 hour)".to_string());
    }
    errors
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Default level when `RUST_LOG` is unset
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    pub json_format: bool,

    pub with_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("gamenet"),
            log_level: Level::INFO,
            json_format: false,
            with_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Durations as whole seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}
