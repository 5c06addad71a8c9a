//! Channel configuration and file loading
//!
//! Options are plain serde structs so they can come from TOML/YAML/JSON files
//! with environment overrides layered on top through figment.

use crate::error::{LinkError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Kind of byte pipe a channel runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    TcpClient,
    TcpServer,
    Udp,
    Serial,
    /// Caller-supplied transport (in-memory pipes, custom links)
    Other,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportKind::TcpClient => "TCP",
            TransportKind::TcpServer => "TCP-SERVER",
            TransportKind::Udp => "UDP",
            TransportKind::Serial => "SERIAL",
            TransportKind::Other => "OTHER",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialOptions {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

/// Delay schedule between reconnection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectStrategy {
    /// Fixed `base_interval` between attempts
    #[default]
    Simple,
    /// `base_interval * multiplier^(attempt-1)`, capped at `max_interval`
    ExponentialBackoff,
    /// `base_interval + (attempt-1) * multiplier` milliseconds, capped at `max_interval`
    LinearBackoff,
}

/// Reconnection supervisor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectOptions {
    pub enabled: bool,
    pub strategy: ReconnectStrategy,
    pub base_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    /// Negative means retry forever
    pub max_retry_count: i32,
    /// Add up to +-25% random jitter to every delay
    pub jitter: bool,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: ReconnectStrategy::Simple,
            base_interval_ms: 1000,
            max_interval_ms: 30_000,
            multiplier: 2.0,
            max_retry_count: -1,
            jitter: false,
        }
    }
}

impl ReconnectOptions {
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

/// Channel settings, immutable once the channel is built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Name used in log records
    pub name: String,
    pub kind: TransportKind,
    /// `host:port` for TCP/UDP clients, bind address for TCP servers
    pub endpoint: String,
    pub serial: Option<SerialOptions>,
    /// Request timeout
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Max in-flight requests per link
    pub max_concurrent_count: usize,
    /// Max age of an incomplete frame in the reassembly buffer
    pub cache_timeout_ms: u64,
    /// Default DTU addressed by requests on a server channel
    pub dtu_id: Option<String>,
    /// Fixed DTU id length in the registration packet; without it the id
    /// ends at the first CR, LF or NUL (or with the first chunk)
    pub dtu_id_length: Option<usize>,
    /// Heartbeat payload sent by DTUs, never handed to the frame adapter
    pub heartbeat: Option<String>,
    /// Idle-session reap interval on server channels
    pub check_clear_time_ms: u64,
    pub reconnect: ReconnectOptions,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            name: "channel".to_string(),
            kind: TransportKind::TcpClient,
            endpoint: String::new(),
            serial: None,
            timeout_ms: 3000,
            connect_timeout_ms: 5000,
            max_concurrent_count: 1,
            cache_timeout_ms: 1000,
            dtu_id: None,
            dtu_id_length: None,
            heartbeat: None,
            check_clear_time_ms: 60_000,
            reconnect: ReconnectOptions::default(),
        }
    }
}

impl ChannelOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn cache_timeout(&self) -> Duration {
        Duration::from_millis(self.cache_timeout_ms)
    }

    pub fn check_clear_time(&self) -> Duration {
        Duration::from_millis(self.check_clear_time_ms)
    }

    /// Reject settings a channel cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_count == 0 {
            return Err(LinkError::config("max_concurrent_count must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(LinkError::config("timeout_ms must be greater than 0"));
        }
        if self.dtu_id_length == Some(0) {
            return Err(LinkError::config("dtu_id_length must be at least 1"));
        }
        match self.kind {
            TransportKind::TcpClient | TransportKind::TcpServer | TransportKind::Udp => {
                if self.endpoint.trim().is_empty() {
                    return Err(LinkError::config(format!(
                        "{} channel '{}' needs an endpoint",
                        self.kind, self.name
                    )));
                }
            },
            TransportKind::Serial => match &self.serial {
                Some(serial) if !serial.port.is_empty() => {},
                _ => {
                    return Err(LinkError::config(format!(
                        "Serial channel '{}' needs a port",
                        self.name
                    )))
                },
            },
            TransportKind::Other => {},
        }
        if self.kind == TransportKind::TcpServer && self.check_clear_time_ms == 0 {
            return Err(LinkError::config(
                "check_clear_time_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

fn file_figment(path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .ok_or_else(|| LinkError::config("Config file must have an extension"))?;

    match extension {
        "toml" => Ok(Figment::new().merge(Toml::file(path))),
        "yaml" | "yml" => Ok(Figment::new().merge(Yaml::file(path))),
        "json" => Ok(Figment::new().merge(Json::file(path))),
        _ => Err(LinkError::config(format!(
            "Unsupported config file format: {}",
            extension
        ))),
    }
}

/// Load configuration from a specific file
pub fn load_config_from_file<T, P>(path: P) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.exists() {
        return Err(LinkError::config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    file_figment(path)?
        .extract()
        .map_err(|e| LinkError::config(format!("Failed to load configuration from file: {}", e)))
}

/// Load a file, then merge `PREFIX_SECTION__KEY` environment overrides
pub fn load_config_with_env<T, P>(path: P, prefix: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    if !path.exists() {
        return Err(LinkError::config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    file_figment(path)?
        .merge(Env::prefixed(prefix).split("__"))
        .extract()
        .map_err(|e| LinkError::config(format!("Failed to load configuration: {}", e)))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_file(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_yaml_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "channel.yaml",
            "name: plc1\nendpoint: 127.0.0.1:502\nmax_concurrent_count: 4\nreconnect:\n  strategy: exponential_backoff\n  base_interval_ms: 100\n",
        );

        let options: ChannelOptions = load_config_from_file(&path).unwrap();
        assert_eq!(options.name, "plc1");
        assert_eq!(options.kind, TransportKind::TcpClient);
        assert_eq!(options.max_concurrent_count, 4);
        assert_eq!(options.timeout_ms, 3000);
        assert_eq!(
            options.reconnect.strategy,
            ReconnectStrategy::ExponentialBackoff
        );
        assert_eq!(options.reconnect.base_interval_ms, 100);
        assert_eq!(options.reconnect.max_retry_count, -1);
        options.validate().unwrap();
    }

    #[test]
    fn test_load_toml_serial() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "meter.toml",
            "name = \"meter\"\nkind = \"serial\"\n\n[serial]\nport = \"/dev/ttyUSB0\"\nbaud_rate = 2400\nparity = \"even\"\n",
        );

        let options: ChannelOptions = load_config_from_file(&path).unwrap();
        let serial = options.serial.clone().unwrap();
        assert_eq!(serial.baud_rate, 2400);
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.data_bits, 8);
        options.validate().unwrap();
    }

    #[test]
    fn test_env_override() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "channel.json",
            r#"{"name": "plc2", "endpoint": "10.0.0.2:502", "timeout_ms": 1000}"#,
        );

        figment::Jail::expect_with(|jail| {
            jail.set_env("FGTEST_TIMEOUT_MS", "250");
            jail.set_env("FGTEST_RECONNECT__MAX_RETRY_COUNT", "3");
            let options: ChannelOptions = load_config_with_env(&path, "FGTEST_").unwrap();
            assert_eq!(options.timeout_ms, 250);
            assert_eq!(options.reconnect.max_retry_count, 3);
            assert_eq!(options.name, "plc2");
            Ok(())
        });
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "channel.ini", "name=x");
        let err = load_config_from_file::<ChannelOptions, _>(&path).unwrap_err();
        assert!(matches!(err, LinkError::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        let options = ChannelOptions {
            max_concurrent_count: 0,
            endpoint: "127.0.0.1:502".to_string(),
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = ChannelOptions::default();
        assert!(options.validate().is_err(), "TCP client without endpoint");

        let options = ChannelOptions {
            kind: TransportKind::Serial,
            ..Default::default()
        };
        assert!(options.validate().is_err());

        let options = ChannelOptions {
            kind: TransportKind::Other,
            ..Default::default()
        };
        assert!(options.validate().is_ok());
    }
}
