use crate::error::{ConnectorError, Result};
use crate::types::Credentials;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// CoIoT multicast group generation 1 devices publish to
pub const COIOT_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);

/// CoIoT multicast port
pub const COIOT_PORT: u16 = 5683;

fn default_listen_window_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_coiot_group() -> Ipv4Addr {
    COIOT_GROUP
}

fn default_coiot_port() -> u16 {
    COIOT_PORT
}

fn default_state_reading_delay_ms() -> u64 {
    120_000
}

fn default_http_timeout_ms() -> u64 {
    5_000
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_max_backoff_ms() -> u64 {
    60_000
}

fn default_tick_ms() -> u64 {
    10
}

fn default_startup_delay_ms() -> u64 {
    5_000
}

fn default_debounce_ms() -> u64 {
    5_000
}

/// Connector configuration
///
/// Every field has a default, so an empty JSON object is a valid
/// configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub gen1: Gen1Config,
    #[serde(default)]
    pub gen2: Gen2Config,
    #[serde(default)]
    pub writer: WriterConfig,
    /// Credentials used when a device has none of its own
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// How long to collect mDNS answers
    #[serde(default = "default_listen_window_ms")]
    pub listen_window_ms: u64,
    /// Upper bound for each HTTP probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listen_window_ms: default_listen_window_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl DiscoveryConfig {
    pub fn listen_window(&self) -> Duration {
        Duration::from_millis(self.listen_window_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gen1Config {
    #[serde(default = "default_coiot_group")]
    pub coiot_group: Ipv4Addr,
    #[serde(default = "default_coiot_port")]
    pub coiot_port: u16,
    /// Status polling interval for devices without their own delay
    #[serde(default = "default_state_reading_delay_ms")]
    pub state_reading_delay_ms: u64,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

impl Default for Gen1Config {
    fn default() -> Self {
        Self {
            coiot_group: default_coiot_group(),
            coiot_port: default_coiot_port(),
            state_reading_delay_ms: default_state_reading_delay_ms(),
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

impl Gen1Config {
    pub fn state_reading_delay(&self) -> Duration {
        Duration::from_millis(self.state_reading_delay_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gen2Config {
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_reconnect_max_backoff_ms")]
    pub reconnect_max_backoff_ms: u64,
}

impl Default for Gen2Config {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
            reconnect_max_backoff_ms: default_reconnect_max_backoff_ms(),
        }
    }
}

impl Gen2Config {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn reconnect_max_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_backoff_ms)
    }
}

/// Write-back strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterMode {
    /// Scan for pending properties on a short tick
    #[default]
    Periodic,
    /// React to property store change notifications
    Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    #[serde(default)]
    pub mode: WriterMode,
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_startup_delay_ms")]
    pub startup_delay_ms: u64,
    /// Minimum spacing between attempts for one property
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            mode: WriterMode::default(),
            tick_ms: default_tick_ms(),
            startup_delay_ms: default_startup_delay_ms(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl WriterConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl ConnectorConfig {
    /// Parse configuration from JSON text
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        tracing::debug!("Loaded connector configuration from {}", path.display());
        Self::from_json_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.writer.tick_ms == 0 {
            return Err(ConnectorError::Configuration(
                "writer.tick_ms must be greater than zero".to_string(),
            ));
        }
        if self.gen2.call_timeout_ms == 0 {
            return Err(ConnectorError::Configuration(
                "gen2.call_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = ConnectorConfig::from_json_str("{}").unwrap();
        assert_eq!(config.writer.debounce(), Duration::from_millis(5000));
        assert_eq!(config.writer.tick(), Duration::from_millis(10));
        assert_eq!(config.writer.mode, WriterMode::Periodic);
        assert_eq!(config.gen1.coiot_group, COIOT_GROUP);
        assert_eq!(config.gen1.state_reading_delay(), Duration::from_secs(120));
        assert_eq!(config.gen2.call_timeout(), Duration::from_secs(10));
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let config = ConnectorConfig::from_json_str(
            r#"{
                "writer": {"mode": "event", "debounce_ms": 2000},
                "credentials": {"username": "admin", "password": "secret"}
            }"#,
        )
        .unwrap();
        assert_eq!(config.writer.mode, WriterMode::Event);
        assert_eq!(config.writer.debounce_ms, 2000);
        assert_eq!(config.writer.tick_ms, 10);
        assert_eq!(config.credentials.unwrap().username, "admin");
    }

    #[test]
    fn test_rejects_zero_tick() {
        let result = ConnectorConfig::from_json_str(r#"{"writer": {"tick_ms": 0}}"#);
        assert!(matches!(result, Err(ConnectorError::Configuration(_))));
    }
}
