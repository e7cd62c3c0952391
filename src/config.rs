//! Server configuration
//!
//! Every field has a default, so an empty YAML document (or no file at all)
//! yields a server listening on port 502 for both TCP and UDP.
//!
//! ```yaml
//! port: 5020
//! max_connections: 4
//! idle_timeout_ms: 30000
//! data_plane:
//!   holding_registers: 1024
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::data_plane::ImageSize;
use crate::error::{ModbusError, ModbusResult};
use crate::logging::LogFormat;

/// Sizes of the in-memory process image used by the standalone binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataPlaneConfig {
    pub coils: usize,
    pub discrete_inputs: usize,
    pub holding_registers: usize,
    pub input_registers: usize,
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        let size = ImageSize::default();
        Self {
            coils: size.coils,
            discrete_inputs: size.discrete_inputs,
            holding_registers: size.holding_registers,
            input_registers: size.input_registers,
        }
    }
}

impl From<DataPlaneConfig> for ImageSize {
    fn from(config: DataPlaneConfig) -> Self {
        ImageSize {
            coils: config.coils,
            discrete_inputs: config.discrete_inputs,
            holding_registers: config.holding_registers,
            input_registers: config.input_registers,
        }
    }
}

/// Runtime configuration for [`crate::ModbusServer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    pub tcp_enabled: bool,
    pub udp_enabled: bool,
    /// Listen backlog
    pub backlog: u32,
    /// Concurrent TCP connections before new ones are rejected
    pub max_connections: usize,
    /// How long a connection may sit without starting a request
    pub idle_timeout_ms: u64,
    /// How long the rest of a request may take once its header arrived
    pub body_timeout_ms: u64,
    /// Short header reads tolerated before a connection is dropped
    pub max_invalid_headers: u32,
    /// How long shutdown waits for busy connections before aborting them
    pub shutdown_grace_ms: u64,
    pub udp_buffer_size: usize,
    /// Trace every frame as hex
    pub packet_logging: bool,
    pub log_level: String,
    pub log_format: LogFormat,
    pub data_plane: DataPlaneConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: MODBUS_PORT,
            tcp_enabled: true,
            udp_enabled: true,
            backlog: DEFAULT_BACKLOG,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT.as_millis() as u64,
            body_timeout_ms: DEFAULT_BODY_TIMEOUT.as_millis() as u64,
            max_invalid_headers: MAX_INVALID_HEADERS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE.as_millis() as u64,
            udp_buffer_size: MAX_MB_BUFFER_SIZE,
            packet_logging: false,
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
            data_plane: DataPlaneConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load from a YAML file and validate.
    pub fn load(path: impl AsRef<Path>) -> ModbusResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ModbusError::io(format!("reading {}", path.display()), e))?;
        Self::from_yaml(&text)
    }

    /// Parse YAML text and validate.
    pub fn from_yaml(text: &str) -> ModbusResult<Self> {
        let config: Self = serde_yaml::from_str(text)
            .map_err(|e| ModbusError::configuration(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the servers cannot run with.
    pub fn validate(&self) -> ModbusResult<()> {
        if !self.tcp_enabled && !self.udp_enabled {
            return Err(ModbusError::configuration(
                "at least one of tcp_enabled and udp_enabled must be set",
            ));
        }
        if self.backlog == 0 {
            return Err(ModbusError::configuration("backlog must be non-zero"));
        }
        if self.max_connections == 0 {
            return Err(ModbusError::configuration(
                "max_connections must be non-zero",
            ));
        }
        if self.idle_timeout_ms == 0 || self.body_timeout_ms == 0 {
            return Err(ModbusError::configuration("timeouts must be non-zero"));
        }
        if self.udp_buffer_size < MAX_FRAME_SIZE || self.udp_buffer_size > MAX_MB_BUFFER_SIZE {
            return Err(ModbusError::configuration(format!(
                "udp_buffer_size must be between {} and {}, got {}",
                MAX_FRAME_SIZE, MAX_MB_BUFFER_SIZE, self.udp_buffer_size
            )));
        }
        Ok(())
    }

    /// Address both transports bind to.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn body_timeout(&self) -> Duration {
        Duration::from_millis(self.body_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
