//! Error types for the Modbus server
//!
//! Protocol *semantic* failures (bad address, bad quantity, unknown function)
//! are not errors at this level: the dispatch table turns them into exception
//! frames. `ModbusError` covers what cannot be answered on the wire: transport
//! failures, malformed frames, configuration mistakes and broken handlers.

use std::io;

use thiserror::Error;

/// Result alias used across the crate.
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Header validation failures.
///
/// A header that fails here cannot be trusted enough to build a correlated
/// response, so TCP closes the connection and UDP drops the datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Protocol identifier must always be 0 for Modbus.
    #[error("non-zero protocol id: 0x{0:04X}")]
    NonZeroProtocolId(u16),

    /// Length field exceeds the 255 byte limit.
    #[error("length field too large: {0} (max 255)")]
    LengthTooLarge(u16),
}

/// Main error type.
#[derive(Debug, Error)]
pub enum ModbusError {
    /// Socket level I/O failure
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: io::Error,
    },

    /// Frame too short or otherwise malformed
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Request handler failed in a way that cannot be answered
    #[error("Processing error: {message}")]
    Processing { message: String },

    /// Invalid configuration value
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl ModbusError {
    /// Wrap an I/O error with context.
    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Create a frame error.
    pub fn frame(message: impl Into<String>) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    /// Create a processing error.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}
