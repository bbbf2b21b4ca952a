//! Configuration handling for the SCP node.
//!
//! Settings come from an optional YAML file, then `SCP_*` environment
//! variables, then command-line flags (applied in `main`).

use anyhow::{Context, Result};
use scp_session::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// SCP node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identifier announced as `SID` (serve) or `CID` (call)
    pub identifier: Option<String>,
    /// Listen address for `serve`
    pub listen: SocketAddr,
    /// Server address for `call`
    pub server: SocketAddr,
    /// Interval between `tick` broadcasts; disabled when unset
    #[serde(with = "humantime_serde_opt")]
    pub tick_interval: Option<Duration>,
    /// Per-connection settings
    pub connection: ConnectionSettings,
    /// TLS configuration
    pub tls: TlsConfig,
}

/// Per-connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Frames buffered per incoming exchange body
    pub read_buffer_frames: usize,
    /// Frames buffered per outgoing exchange
    pub write_buffer_frames: usize,
    /// Outgoing exchanges allowed to wait for the connection
    pub max_queued_exchanges: usize,
    /// Largest buffered body accepted by REPLY handlers
    pub max_body_bytes: usize,
    /// Idle heartbeat interval; disabled when unset
    #[serde(with = "humantime_serde_opt")]
    pub heartbeat_interval: Option<Duration>,
}

/// TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Whether TLS is enabled
    pub enabled: bool,
    /// Path to certificate file
    pub cert_file: Option<PathBuf>,
    /// Path to private key file
    pub key_file: Option<PathBuf>,
    /// Path to CA certificate file
    pub ca_file: Option<PathBuf>,
    /// Server name for SNI on outbound connections
    pub server_name: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            read_buffer_frames: defaults.read_buffer_frames,
            write_buffer_frames: defaults.write_buffer_frames,
            max_queued_exchanges: defaults.max_queued_exchanges,
            max_body_bytes: defaults.max_body_bytes,
            heartbeat_interval: defaults.heartbeat_interval,
        }
    }
}

impl From<&ConnectionSettings> for ConnectionConfig {
    fn from(settings: &ConnectionSettings) -> Self {
        ConnectionConfig {
            read_buffer_frames: settings.read_buffer_frames,
            write_buffer_frames: settings.write_buffer_frames,
            max_queued_exchanges: settings.max_queued_exchanges,
            max_body_bytes: settings.max_body_bytes,
            heartbeat_interval: settings.heartbeat_interval,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identifier: None,
            listen: SocketAddr::from(([0, 0, 0, 0], 7700)),
            server: SocketAddr::from(([127, 0, 0, 1], 7700)),
            tick_interval: Some(Duration::from_secs(5)),
            connection: ConnectionSettings::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file yields the defaults; a file that does not parse is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: NodeConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_environment_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `SCP_*` overrides looked up through `lookup`
    fn apply_environment_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(identifier) = lookup("SCP_IDENTIFIER") {
            info!("Identifier overridden by environment: {}", identifier);
            self.identifier = Some(identifier);
        }

        if let Some(listen) = lookup("SCP_LISTEN") {
            match listen.parse() {
                Ok(addr) => {
                    self.listen = addr;
                    info!("Listen address overridden by environment: {}", addr);
                }
                Err(e) => warn!("Ignoring SCP_LISTEN={}: {}", listen, e),
            }
        }

        if let Some(server) = lookup("SCP_SERVER") {
            match server.parse() {
                Ok(addr) => {
                    self.server = addr;
                    info!("Server address overridden by environment: {}", addr);
                }
                Err(e) => warn!("Ignoring SCP_SERVER={}: {}", server, e),
            }
        }

        if let Some(interval) = lookup("SCP_HEARTBEAT_INTERVAL") {
            match parse_optional_duration(&interval) {
                Ok(interval) => self.connection.heartbeat_interval = interval,
                Err(e) => warn!("Ignoring SCP_HEARTBEAT_INTERVAL={}: {}", interval, e),
            }
        }

        if let Some(interval) = lookup("SCP_TICK_INTERVAL") {
            match parse_optional_duration(&interval) {
                Ok(interval) => self.tick_interval = interval,
                Err(e) => warn!("Ignoring SCP_TICK_INTERVAL={}: {}", interval, e),
            }
        }

        if let Some(enabled) = lookup("SCP_TLS_ENABLED") {
            self.tls.enabled = enabled.eq_ignore_ascii_case("true");
        }
    }

    /// Connection settings in the form the library crates take
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::from(&self.connection)
    }
}

/// Parse a humantime duration; `off` and `0` disable the timer
pub fn parse_optional_duration(value: &str) -> Result<Option<Duration>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("off") || value == "0" {
        return Ok(None);
    }
    let duration = humantime::parse_duration(value)
        .with_context(|| format!("Invalid duration {:?}", value))?;
    Ok(Some(duration))
}

mod humantime_serde_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => {
                serializer.serialize_str(&humantime::format_duration(*duration).to_string())
            }
            None => serializer.serialize_str("off"),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_optional_duration(&raw).map_err(serde::de::Error::custom)
    }
}
