//! Gateway configuration: CLI flags with environment-variable fallbacks.
//!
//! Every flag can also be supplied through a `CAN_SERVER_*` variable; an
//! explicitly passed flag always wins over the environment. Durations are
//! millisecond integers.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::core::error::{GatewayError, Result};
use crate::hub::BackpressurePolicy;
use crate::server::ServerConfig;

/// Which CAN backend feeds the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// Serial UART adapter.
    Serial,
    /// SocketCAN raw socket (Linux).
    Socketcan,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The default `tracing` filter directive for this level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Backpressure policy flag value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PolicyArg {
    Drop,
    Kick,
}

impl From<PolicyArg> for BackpressurePolicy {
    fn from(p: PolicyArg) -> Self {
        match p {
            PolicyArg::Drop => BackpressurePolicy::Drop,
            PolicyArg::Kick => BackpressurePolicy::Kick,
        }
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "cangw", version, about = "CAN to TCP gateway (Cannelloni wire format)")]
pub struct AppConfig {
    /// Serial device path (when --backend=serial)
    #[arg(long = "serial", default_value = "/dev/ttyUSB0", env = "CAN_SERVER_SERIAL")]
    pub serial_dev: String,

    /// Serial baud rate
    #[arg(long, default_value_t = 115_200, env = "CAN_SERVER_BAUD")]
    pub baud: u32,

    /// TCP listen address
    #[arg(long = "listen", default_value = "0.0.0.0:20000", env = "CAN_SERVER_LISTEN")]
    pub listen_addr: String,

    /// Serial read timeout in milliseconds
    #[arg(
        long = "serial-read-timeout-ms",
        default_value_t = 50,
        env = "CAN_SERVER_SERIAL_READ_TIMEOUT_MS"
    )]
    pub serial_read_timeout_ms: u64,

    /// Log format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, env = "CAN_SERVER_LOG_FORMAT")]
    pub log_format: LogFormat,

    /// Log level
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info, env = "CAN_SERVER_LOG_LEVEL")]
    pub log_level: LogLevel,

    /// Per-client hub buffer (frames)
    #[arg(long = "hub-buffer", default_value_t = 512, env = "CAN_SERVER_HUB_BUFFER")]
    pub hub_buffer: usize,

    /// Backpressure policy for slow clients
    #[arg(long = "hub-policy", value_enum, default_value_t = PolicyArg::Drop, env = "CAN_SERVER_HUB_POLICY")]
    pub hub_policy: PolicyArg,

    /// If > 0, periodically log metrics counters at this interval (ms)
    #[arg(
        long = "log-metrics-interval-ms",
        default_value_t = 0,
        env = "CAN_SERVER_LOG_METRICS_INTERVAL_MS"
    )]
    pub log_metrics_interval_ms: u64,

    /// CAN backend
    #[arg(long, value_enum, default_value_t = BackendKind::Socketcan, env = "CAN_SERVER_BACKEND")]
    pub backend: BackendKind,

    /// SocketCAN interface (when --backend=socketcan)
    #[arg(long = "can-if", default_value = "can0", env = "CAN_SERVER_IF")]
    pub can_if: String,

    /// Maximum simultaneous TCP clients (0 = unlimited)
    #[arg(long = "max-clients", default_value_t = 0, env = "CAN_SERVER_MAX_CLIENTS")]
    pub max_clients: usize,

    /// Client handshake timeout in milliseconds
    #[arg(
        long = "handshake-timeout-ms",
        default_value_t = 3_000,
        env = "CAN_SERVER_HANDSHAKE_TIMEOUT_MS"
    )]
    pub handshake_timeout_ms: u64,

    /// Per-connection read deadline in milliseconds
    #[arg(
        long = "client-read-timeout-ms",
        default_value_t = 60_000,
        env = "CAN_SERVER_CLIENT_READ_TIMEOUT_MS"
    )]
    pub client_read_timeout_ms: u64,
}

impl AppConfig {
    /// Semantic validation beyond what flag parsing enforces. Checks values
    /// and ranges only; devices and listeners are opened later.
    pub fn validate(&self) -> Result<()> {
        if self.hub_buffer == 0 {
            return Err(GatewayError::Config("hub-buffer must be > 0".to_string()));
        }
        if self.baud == 0 {
            return Err(GatewayError::Config("baud must be > 0".to_string()));
        }
        if self.serial_read_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "serial-read-timeout-ms must be > 0".to_string(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "handshake-timeout-ms must be > 0".to_string(),
            ));
        }
        if self.client_read_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "client-read-timeout-ms must be > 0".to_string(),
            ));
        }
        if self.listen_addr.trim().is_empty() {
            return Err(GatewayError::Config("listen address is empty".to_string()));
        }
        Ok(())
    }

    /// The backpressure policy as the hub understands it.
    pub fn policy(&self) -> BackpressurePolicy {
        self.hub_policy.into()
    }

    /// The server tuning derived from this configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            listen_addr: self.listen_addr.clone(),
            read_deadline: Duration::from_millis(self.client_read_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_clients: self.max_clients,
            ..ServerConfig::default()
        }
    }
}
