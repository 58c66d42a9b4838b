//! Monitor configuration
//!
//! Loaded from an optional TOML file and overridden by `OBD_MONITOR_*`
//! environment variables, e.g. `OBD_MONITOR_TARGET=192.168.0.10:35000` or
//! `OBD_MONITOR_POLLING__CYCLE_INTERVAL_MS=250`.

use std::sync::Arc;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use obd_protocol::transport::mock::MockConnector;
use obd_protocol::{Connector, InitConfig, ObdProtocol, Pid, SerialConnector, TcpConnector};
use obd_scheduler::{MonitorConfig, SchedulerConfig};
use serde::Deserialize;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_VAR: &str = "OBD_MONITOR_CONFIG";
const DEFAULT_CONFIG_NAME: &str = "obd-monitor";
const ENV_PREFIX: &str = "OBD_MONITOR";

/// How to reach the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Serial device, including Bluetooth SPP bound to `/dev/rfcommN`
    #[default]
    Serial,
    /// Wi-Fi adapter at `host:port`
    Tcp,
    /// Built-in emulated adapter
    Mock,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub transport: TransportKind,
    /// Device path or `host:port`
    pub target: String,
    pub baud_rate: u32,
    pub log_level: String,
    pub protocol: ObdProtocol,
    pub pids: Vec<Pid>,
    pub timeouts: Timeouts,
    pub polling: Polling,
    pub init: Init,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub command_ms: u64,
    pub attention_ms: u64,
    pub connect_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Polling {
    pub request_gap_ms: u64,
    pub cycle_interval_ms: u64,
    pub failure_warn_threshold: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Init {
    pub pacing_ms: u64,
    pub max_consecutive_timeouts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: TransportKind::Serial,
            target: "/dev/rfcomm0".to_string(),
            baud_rate: obd_protocol::transport::DEFAULT_BAUD_RATE,
            log_level: "info".to_string(),
            protocol: ObdProtocol::Auto,
            pids: vec![Pid::Rpm, Pid::Speed, Pid::CoolantTemp],
            timeouts: Timeouts::default(),
            polling: Polling::default(),
            init: Init::default(),
        }
    }
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_ms: 1000,
            attention_ms: 3000,
            connect_ms: 5000,
        }
    }
}

impl Default for Polling {
    fn default() -> Self {
        Self {
            request_gap_ms: 50,
            cycle_interval_ms: 500,
            failure_warn_threshold: 3,
        }
    }
}

impl Default for Init {
    fn default() -> Self {
        Self {
            pacing_ms: 100,
            max_consecutive_timeouts: 3,
        }
    }
}

impl Settings {
    /// Load from the file named by `OBD_MONITOR_CONFIG` (default
    /// `obd-monitor.toml`, optional) and the environment
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_NAME.to_string());
        Config::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse TOML text, without environment overrides
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            init: InitConfig {
                protocol: self.protocol,
                pacing: Duration::from_millis(self.init.pacing_ms),
                command_timeout: Duration::from_millis(self.timeouts.attention_ms),
                max_consecutive_timeouts: self.init.max_consecutive_timeouts,
            },
            scheduler: SchedulerConfig {
                request_gap: Duration::from_millis(self.polling.request_gap_ms),
                cycle_interval: Duration::from_millis(self.polling.cycle_interval_ms),
                failure_warn_threshold: self.polling.failure_warn_threshold,
            },
            pids: self.pids.clone(),
            command_timeout: Duration::from_millis(self.timeouts.command_ms),
            ..MonitorConfig::default()
        }
    }

    /// Connector for the configured transport
    pub fn connector(&self) -> Arc<dyn Connector> {
        match self.transport {
            TransportKind::Serial => Arc::new(SerialConnector::new(self.baud_rate)),
            TransportKind::Tcp => {
                Arc::new(TcpConnector::new(Duration::from_millis(self.timeouts.connect_ms)))
            }
            TransportKind::Mock => {
                Arc::new(MockConnector::elm327().with_latency(Duration::from_millis(20)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.transport, TransportKind::Serial);
        assert_eq!(settings.target, "/dev/rfcomm0");
        assert_eq!(settings.baud_rate, 38400);
        assert_eq!(settings.pids, vec![Pid::Rpm, Pid::Speed, Pid::CoolantTemp]);

        let config = settings.monitor_config();
        assert_eq!(config.command_timeout, Duration::from_millis(1000));
        assert_eq!(config.init.command_timeout, Duration::from_millis(3000));
        assert_eq!(config.scheduler.cycle_interval, Duration::from_millis(500));
        assert_eq!(config.init.protocol, ObdProtocol::Auto);
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_toml(
            r#"
            transport = "tcp"
            target = "192.168.0.10:35000"
            protocol = "can11_bit500"
            pids = ["rpm", "throttle_position"]

            [polling]
            cycle_interval_ms = 250

            [init]
            max_consecutive_timeouts = 5
            "#,
        )
        .unwrap();

        assert_eq!(settings.transport, TransportKind::Tcp);
        assert_eq!(settings.target, "192.168.0.10:35000");
        assert_eq!(settings.protocol, ObdProtocol::Can11Bit500);

        let config = settings.monitor_config();
        assert_eq!(config.pids, vec![Pid::Rpm, Pid::ThrottlePosition]);
        assert_eq!(config.scheduler.cycle_interval, Duration::from_millis(250));
        assert_eq!(config.scheduler.request_gap, Duration::from_millis(50));
        assert_eq!(config.init.max_consecutive_timeouts, 5);
    }

    #[test]
    fn test_unknown_transport_rejected() {
        assert!(Settings::from_toml(r#"transport = "usb""#).is_err());
    }
}
