use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top level configuration shared by gateways, workers and clients
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub broker: BrokerConfig,
    pub throttle: ThrottleConfig,
    pub worker: WorkerConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Look up a value by dotted key, e.g. `gateway.port`
    pub fn get_value(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["gateway", "host"] => Some(self.gateway.host.clone()),
            ["gateway", "port"] => Some(self.gateway.port.to_string()),
            ["gateway", "max_connections"] => Some(self.gateway.max_connections.to_string()),
            ["broker", "url"] => Some(self.broker.url.clone()),
            ["broker", "reconnect_delay_ms"] => Some(self.broker.reconnect_delay_ms.to_string()),
            ["broker", "close_grace_ms"] => Some(self.broker.close_grace_ms.to_string()),
            ["broker", "work_exchange"] => Some(self.broker.work_exchange.clone()),
            ["broker", "publish_exchange"] => Some(self.broker.publish_exchange.clone()),
            ["broker", "message_ttl_ms"] => Some(self.broker.message_ttl_ms.to_string()),
            ["throttle", "period_ms"] => Some(self.throttle.period_ms.to_string()),
            ["throttle", "per_connection"] => Some(self.throttle.per_connection.to_string()),
            ["throttle", "total"] => Some(self.throttle.total.to_string()),
            ["worker", "group"] => self.worker.group.clone(),
            ["worker", "prefetch"] => Some(self.worker.prefetch.to_string()),
            ["worker", "auto_retry"] => Some(self.worker.auto_retry.to_string()),
            ["worker", "stats_interval_secs"] => Some(self.worker.stats_interval_secs.to_string()),
            ["client", "request_timeout_ms"] => Some(self.client.request_timeout_ms.to_string()),
            ["logging", "level"] => Some(self.logging.level.as_str().to_string()),
            ["logging", "json"] => Some(self.logging.json.to_string()),
            _ => None,
        }
    }

    /// Set a value by dotted key
    pub fn set_value(&mut self, key: &str, value: &str) -> ConfigResult<()> {
        let parts: Vec<&str> = key.split('.').collect();
        match parts.as_slice() {
            ["gateway", "host"] => self.gateway.host = value.to_string(),
            ["gateway", "port"] => self.gateway.port = parse_number(value)?,
            ["gateway", "max_connections"] => self.gateway.max_connections = parse_number(value)?,
            ["broker", "url"] => self.broker.url = value.to_string(),
            ["broker", "reconnect_delay_ms"] => self.broker.reconnect_delay_ms = parse_number(value)?,
            ["broker", "close_grace_ms"] => self.broker.close_grace_ms = parse_number(value)?,
            ["broker", "work_exchange"] => self.broker.work_exchange = value.to_string(),
            ["broker", "publish_exchange"] => self.broker.publish_exchange = value.to_string(),
            ["broker", "message_ttl_ms"] => self.broker.message_ttl_ms = parse_number(value)?,
            ["throttle", "period_ms"] => self.throttle.period_ms = parse_number(value)?,
            ["throttle", "per_connection"] => self.throttle.per_connection = parse_number(value)?,
            ["throttle", "total"] => self.throttle.total = parse_number(value)?,
            ["worker", "group"] => {
                self.worker.group = Some(value.to_string()).filter(|group| !group.is_empty());
            }
            ["worker", "bindings"] => {
                self.worker.bindings = value
                    .split(',')
                    .map(str::trim)
                    .filter(|binding| !binding.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            ["worker", "prefetch"] => self.worker.prefetch = parse_number(value)?,
            ["worker", "auto_retry"] => {
                self.worker.auto_retry = value.parse().map_err(|_| {
                    ConfigError::Validation(format!("Invalid boolean: {}", value))
                })?;
            }
            ["worker", "stats_interval_secs"] => {
                self.worker.stats_interval_secs = parse_number(value)?;
            }
            ["client", "request_timeout_ms"] => {
                self.client.request_timeout_ms = parse_number(value)?;
            }
            ["logging", "level"] => self.logging.level = value.parse()?,
            ["logging", "json"] => {
                self.logging.json = value.parse().map_err(|_| {
                    ConfigError::Validation(format!("Invalid boolean: {}", value))
                })?;
            }
            _ => return Err(ConfigError::KeyNotFound(key.to_string())),
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(value: &str) -> ConfigResult<T> {
    value
        .parse()
        .map_err(|_| ConfigError::Validation(format!("Invalid number: {}", value)))
}

/// Gateway listener settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Connections beyond this are refused with an error frame
    pub max_connections: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10002,
            max_connections: 1000,
        }
    }
}

impl GatewayConfig {
    /// `host:port` bind address
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Broker connection and topology settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    /// Fixed delay between reconnect attempts
    pub reconnect_delay_ms: u64,
    /// Delay before a closing connection is torn down
    pub close_grace_ms: u64,
    pub work_exchange: String,
    pub publish_exchange: String,
    /// TTL of messages waiting in work queues
    pub message_ttl_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost".to_string(),
            reconnect_delay_ms: 3000,
            close_grace_ms: 2500,
            work_exchange: "work_exchange".to_string(),
            publish_exchange: "publish_exchange".to_string(),
            message_ttl_ms: 90_000,
        }
    }
}

impl BrokerConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_millis(self.message_ttl_ms)
    }
}

/// Admission control limits, per gateway instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Window length
    pub period_ms: u64,
    /// In-flight calls allowed per connection within one window
    pub per_connection: u32,
    /// In-flight calls allowed across all connections within one window
    pub total: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            period_ms: 1000,
            per_connection: 5,
            total: 20,
        }
    }
}

impl ThrottleConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Worker consumer settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Competing consumer group; `None` gives every worker its own queue
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Explicit binding patterns; derived from registered topics when empty
    pub bindings: Vec<String>,
    /// Maximum unacknowledged deliveries per consumer
    pub prefetch: u16,
    /// Requeue failed messages once
    pub auto_retry: bool,
    pub stats_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            group: None,
            bindings: Vec::new(),
            prefetch: 4,
            auto_retry: false,
            stats_interval_secs: 3,
        }
    }
}

impl WorkerConfig {
    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

/// Client side settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 3000,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> ConfigResult<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::Validation(format!("Invalid log level: {}", s))),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
    /// Per-module overrides, e.g. `{"microman_broker": "debug"}`
    pub module_levels: HashMap<String, LogLevel>,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.gateway.port, 10002);
        assert_eq!(config.broker.reconnect_delay(), Duration::from_secs(3));
        assert_eq!(config.broker.message_ttl_ms, 90_000);
        assert_eq!(config.throttle.per_connection, 5);
        assert_eq!(config.throttle.total, 20);
        assert_eq!(config.worker.prefetch, 4);
        assert!(!config.worker.auto_retry);
        assert_eq!(config.client.request_timeout_ms, 3000);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"gateway": {"port": 9000}, "worker": {"group": "echo"}}"#)
                .unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.worker.group.as_deref(), Some("echo"));
        assert_eq!(config.broker, BrokerConfig::default());
    }

    #[test]
    fn test_get_and_set_value() {
        let mut config = Config::default();
        config.set_value("gateway.port", "8443").unwrap();
        config.set_value("worker.bindings", "echo.*, signup").unwrap();
        config.set_value("logging.level", "WARNING").unwrap();

        assert_eq!(config.get_value("gateway.port").as_deref(), Some("8443"));
        assert_eq!(config.worker.bindings, vec!["echo.*", "signup"]);
        assert_eq!(config.logging.level, LogLevel::Warn);

        assert!(config.set_value("gateway.port", "nope").is_err());
        assert!(matches!(
            config.set_value("gateway.tls", "x"),
            Err(ConfigError::KeyNotFound(_))
        ));
    }
}
