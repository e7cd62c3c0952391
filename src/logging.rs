//! Logging setup and packet tracing
//!
//! The library itself only emits `tracing` events. Binaries call
//! [`init_logging`] once at startup; `RUST_LOG` takes precedence over the
//! configured level when it is set.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::trace;
use tracing_subscriber::EnvFilter;

use crate::error::{ModbusError, ModbusResult};

/// Console output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, human oriented
    Pretty,
    /// One line per event
    #[default]
    Compact,
    /// Newline-delimited JSON
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "unknown log format '{}' (expected pretty, compact or json)",
                other
            )),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pretty => "pretty",
            Self::Compact => "compact",
            Self::Json => "json",
        };
        f.write_str(name)
    }
}

/// Install the global subscriber.
///
/// Fails if `level` is not a valid filter directive or a subscriber is
/// already installed.
pub fn init_logging(level: &str, format: LogFormat) -> ModbusResult<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level).map_err(|e| {
            ModbusError::configuration(format!("invalid log level '{}': {}", level, e))
        })?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    let result = match format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.map_err(|e| ModbusError::configuration(format!("failed to install logger: {}", e)))
}

/// Format bytes as space-separated upper-case hex.
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Trace one frame on the wire, e.g. `[MODBUS-TCP] RX 00 01 00 00 00 06 01 03`.
pub fn log_packet(direction: &str, transport: &str, data: &[u8]) {
    trace!("[MODBUS-{}] {} {}", transport, direction, format_hex_packet(data));
}
