//! # mbserver - Modbus TCP/UDP Slave Server
//!
//! An async MODBUS/TCP and MODBUS/UDP slave for fieldbus couplers. Requests
//! are decoded, validated and answered from a pluggable process image (the
//! [`DataPlane`]); protocol violations are answered with exception frames or
//! closed connections exactly as a coupler would.
//!
//! ## Features
//!
//! - **Concurrent TCP**: one task per connection, explicit connection cap,
//!   idle and body timeouts, graceful shutdown
//! - **Stateless UDP**: one datagram per request, malformed datagrams dropped
//! - **Serialised data plane**: every handler runs under one lock, so
//!   read-modify-write functions are atomic across connections
//! - **Statistics**: per-category request and transport counters
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Server |
//! |------|----------|--------|
//! | 0x01 | Read Coils | ✅ |
//! | 0x02 | Read Input Discretes | ✅ |
//! | 0x03 | Read Multiple Registers | ✅ |
//! | 0x04 | Read Input Registers | ✅ |
//! | 0x05 | Write Coil | ✅ |
//! | 0x06 | Write Single Register | ✅ |
//! | 0x07 | Read Exception Status | ✅ |
//! | 0x0B | Get Comm Event Counter | ✅ |
//! | 0x0F | Force Multiple Coils | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ |
//! | 0x16 | Mask Write Register | ✅ |
//! | 0x17 | Read/Write Registers | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mbserver::{MemoryDataPlane, ModbusResult, ModbusServer, ServerConfig, SharedDataPlane};
//!
//! #[tokio::main]
//! async fn main() -> ModbusResult<()> {
//!     let config = ServerConfig {
//!         port: 5020,
//!         ..ServerConfig::default()
//!     };
//!     let image = SharedDataPlane::new(MemoryDataPlane::default());
//!
//!     let server = ModbusServer::bind(&config, image).await?;
//!     let shutdown = server.shutdown_token();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.cancel();
//!     });
//!
//!     server.run().await
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Core error types and result handling
pub mod error;

/// Wire sizes, limits and code values
pub mod constants;

/// Function codes, exception codes and the request header
pub mod protocol;

/// In-place request/response frame buffer
pub mod frame;

// ============================================================================
// Request processing
// ============================================================================

/// Process image backend consulted by the handlers
pub mod data_plane;

/// Function dispatch table and handlers
pub mod dispatch;

/// Server statistics
pub mod stats;

// ============================================================================
// Transports
// ============================================================================

/// TCP connection worker
pub mod connection;

/// MODBUS/TCP server
pub mod tcp;

/// MODBUS/UDP server
pub mod udp;

/// Combined TCP + UDP server
pub mod server;

// ============================================================================
// Runtime support
// ============================================================================

/// Server configuration
pub mod config;

/// Logging setup and packet tracing
pub mod logging;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime ===
pub use tokio;

// === Server API ===
pub use config::{DataPlaneConfig, ServerConfig};
pub use server::ModbusServer;
pub use tcp::ModbusTcpServer;
pub use udp::ModbusUdpServer;

// === Error handling ===
pub use error::{ModbusError, ModbusResult, ProtocolError};

// === Core types ===
pub use data_plane::{Area, DataPlane, Fault, ImageSize, MemoryDataPlane, SharedDataPlane};
pub use dispatch::FunctionTable;
pub use frame::{build_exception, Frame};
pub use protocol::{validate_header, ExceptionCode, ModbusFunction, ModbusHeader, UnitId};

// === Monitoring ===
pub use stats::{ModbusStatistics, StatisticsSnapshot};

// === Logging ===
pub use logging::{init_logging, LogFormat};

/// Modbus TCP default port
pub const DEFAULT_TCP_PORT: u16 = constants::MODBUS_PORT;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("mbserver v{} - Modbus TCP/UDP slave server", VERSION)
}
