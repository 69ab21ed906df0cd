//! Server configuration.
//!
//! Configuration can be loaded from:
//! - The first existing file among `airwave.toml`, `/etc/airwave/airwave.toml`
//!   and `~/.config/airwave/airwave.toml`
//! - Environment variables (`AIRWAVE_*`, nested keys joined with `__`,
//!   e.g. `AIRWAVE_RADIO__TICK_INTERVAL_MS`)
//! - An explicit file given with `--config`

use airwave_core::{BusConfig, RadioConfig};
use airwave_transport::{FanoutConfig, WebSocketConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "airwave.toml",
    "/etc/airwave/airwave.toml",
    "~/.config/airwave/airwave.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Song and playlist library (TOML).
    #[serde(default)]
    pub library: Option<PathBuf>,

    /// Playback timeline.
    #[serde(default)]
    pub radio: RadioSettings,

    /// Event bus.
    #[serde(default)]
    pub bus: BusSettings,

    /// Connection fan-out.
    #[serde(default)]
    pub broadcast: BroadcastSettings,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// `[radio]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RadioSettings {
    /// Interval between timeline ticks in milliseconds.
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,

    /// Length of the auto-generated library queue.
    #[serde(default = "default_library_queue_len")]
    pub library_queue_len: usize,

    /// Playlist to start with. Uses the library queue when unset.
    #[serde(default)]
    pub initial_playlist: Option<String>,

    /// Pending command capacity.
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

/// `[bus]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Maximum handler invocations running at once.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Deadline for one handler invocation in milliseconds.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_ms: u64,
}

/// `[broadcast]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastSettings {
    /// Frames queued per connection before it is dropped as too slow.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,

    /// Deadline for one write in milliseconds.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Time given to writers and handlers to finish on shutdown.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Suggested client ping interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// A connection that sends nothing for this long is closed.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often bus and fan-out counters are sampled, in milliseconds.
    #[serde(default = "default_report_interval")]
    pub report_interval_ms: u64,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_tick_interval() -> u64 {
    1_000
}

fn default_library_queue_len() -> usize {
    50
}

fn default_command_capacity() -> usize {
    64
}

fn default_max_in_flight() -> usize {
    1024
}

fn default_dispatch_timeout() -> u64 {
    5_000
}

fn default_outbox_capacity() -> usize {
    256
}

fn default_send_timeout() -> u64 {
    5_000
}

fn default_shutdown_grace() -> u64 {
    2_000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    90_000 // 90 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_report_interval() -> u64 {
    5_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            library: None,
            radio: RadioSettings::default(),
            bus: BusSettings::default(),
            broadcast: BroadcastSettings::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for RadioSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval(),
            library_queue_len: default_library_queue_len(),
            initial_playlist: None,
            command_capacity: default_command_capacity(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            dispatch_timeout_ms: default_dispatch_timeout(),
        }
    }
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            outbox_capacity: default_outbox_capacity(),
            send_timeout_ms: default_send_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            report_interval_ms: default_report_interval(),
        }
    }
}

impl Config {
    /// Load configuration from the default paths, layered with `AIRWAVE_*`
    /// environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// environment override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());

        Self::layered(file.as_deref(), env_source())
    }

    fn layered(file: Option<&Path>, env: ::config::Environment) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                ::config::File::from(path).format(::config::FileFormat::Toml),
            );
        }

        builder
            .add_source(env)
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Settings for the radio actor.
    #[must_use]
    pub fn radio_config(&self) -> RadioConfig {
        RadioConfig {
            tick_interval: Duration::from_millis(self.radio.tick_interval_ms.max(1)),
            command_capacity: self.radio.command_capacity,
            library_queue_len: self.radio.library_queue_len,
            initial_playlist: self.radio.initial_playlist.clone(),
        }
    }

    /// Settings for the event bus.
    #[must_use]
    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            max_in_flight: self.bus.max_in_flight,
            dispatch_timeout: Duration::from_millis(self.bus.dispatch_timeout_ms),
        }
    }

    /// Settings for the broadcaster.
    #[must_use]
    pub fn fanout_config(&self) -> FanoutConfig {
        FanoutConfig {
            outbox_capacity: self.broadcast.outbox_capacity,
            send_timeout: Duration::from_millis(self.broadcast.send_timeout_ms),
            max_connections: self.limits.max_connections,
        }
    }

    /// Settings for WebSocket connections, with the given outbound encoding.
    #[must_use]
    pub fn websocket_config(&self, encoding: airwave_protocol::Encoding) -> WebSocketConfig {
        WebSocketConfig {
            max_message_size: self.limits.max_message_size,
            encoding,
        }
    }

    /// Grace period for shutdown.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.broadcast.shutdown_grace_ms)
    }
}

fn env_source() -> ::config::Environment {
    ::config::Environment::with_prefix("AIRWAVE")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(vars: &[(&str, &str)]) -> ::config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        env_source().source(Some(map))
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.websocket_path, "/ws");
        assert!(config.library.is_none());
        assert_eq!(config.radio_config().tick_interval, Duration::from_secs(1));
        assert_eq!(config.fanout_config().outbox_capacity, 256);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 8080);

        let bad = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000
            library = "/srv/radio/library.toml"

            [radio]
            tick_interval_ms = 500
            initial_playlist = "morning"

            [broadcast]
            outbox_capacity = 32

            [limits]
            max_connections = 50000
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.library, Some(PathBuf::from("/srv/radio/library.toml")));
        assert_eq!(config.limits.max_connections, 50000);

        let radio = config.radio_config();
        assert_eq!(radio.tick_interval, Duration::from_millis(500));
        assert_eq!(radio.initial_playlist.as_deref(), Some("morning"));
        assert_eq!(radio.library_queue_len, 50);

        let fanout = config.fanout_config();
        assert_eq!(fanout.outbox_capacity, 32);
        assert_eq!(fanout.max_connections, 50000);
    }

    #[test]
    fn test_environment_overrides() {
        let config = Config::layered(
            None,
            env(&[
                ("AIRWAVE_PORT", "7000"),
                ("AIRWAVE_RADIO__LIBRARY_QUEUE_LEN", "10"),
                ("AIRWAVE_BUS__MAX_IN_FLIGHT", "4"),
            ]),
        )
        .unwrap();

        assert_eq!(config.port, 7000);
        assert_eq!(config.radio.library_queue_len, 10);
        assert_eq!(config.bus_config().max_in_flight, 4);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn test_double_underscore_after_prefix_is_not_a_key() {
        let config = Config::layered(None, env(&[("AIRWAVE__PORT", "7000")])).unwrap();
        assert_eq!(config.port, Config::default().port);
    }

    #[test]
    fn test_missing_file_is_reported() {
        let err = Config::from_file("/nonexistent/airwave.toml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
