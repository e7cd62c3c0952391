//! Modbus server constants
//!
//! Frame sizes, per-function limits, function codes and exception codes used
//! by the header codec and the dispatch table. The limits are tighter than the
//! general Modbus specification allows: they describe what this server accepts
//! in a single request.

use std::time::Duration;

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Header bytes read before the length field is known.
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) = 6 bytes
pub const LENGTH_TO_UNIT_ID: usize = 6;

/// Full header length including Unit ID and Function Code.
/// Format: Transaction ID(2) + Protocol ID(2) + Length(2) + Unit ID(1) + FC(1)
pub const MODBUS_HEADER_LENGTH: usize = 8;

/// Largest accepted value of the header length field.
pub const MAX_LENGTH_FIELD: u16 = 255;

/// Smallest length field that still carries a unit id and a function code.
pub const MIN_LENGTH_FIELD: u16 = 2;

/// Largest request frame the server can receive: 6 + 255 bytes.
pub const MAX_FRAME_SIZE: usize = LENGTH_TO_UNIT_ID + MAX_LENGTH_FIELD as usize;

/// Request/response buffer size, shared by TCP connections and the UDP loop.
pub const MAX_MB_BUFFER_SIZE: usize = 1500;

/// Exception responses are always header + one exception byte.
pub const EXCEPTION_LENGTH: usize = 9;

// ============================================================================
// Response Lengths
// ============================================================================

/// Read responses without their data bytes (header + byte count).
pub const READ_RESPONSE_LENGTH: usize = 9;

/// Echo responses of FC05, FC06, FC15 and FC16 (header + address + value/count).
pub const WRITE_RESPONSE_LENGTH: usize = 12;

/// FC22 echoes address, AND mask and OR mask.
pub const MASK_WRITE_REGISTER_RESPONSE_LENGTH: usize = 14;

/// FC11 response: header + status word + event count.
pub const GET_COMM_EVENT_COUNTER_LENGTH: usize = 12;

/// FC07 response: header + one status byte.
pub const READ_EXCEPTION_STATUS_LENGTH: usize = 9;

// ============================================================================
// Per-Function Limits
// ============================================================================

/// Maximum registers per FC03/FC04 read and the read half of FC23.
pub const READ_REGS_MAX: u16 = 125;

/// Maximum registers per FC16 write and the write half of FC23.
pub const WRITE_REGS_MAX: u16 = 100;

/// Maximum coils per FC15.
pub const FORCE_COILS_MAX: u16 = 800;

/// Maximum bits per FC01/FC02.
pub const READ_COILS_MAX: u16 = 2000;

/// Coil ON value for FC05.
pub const COIL_ON: u16 = 0xFF00;

/// Coil OFF value for FC05.
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Modbus Function Codes
// ============================================================================

/// Read Coils (FC01)
pub const FC_READ_COILS: u8 = 0x01;

/// Read Input Discretes (FC02)
pub const FC_READ_INPUT_DISCRETES: u8 = 0x02;

/// Read Multiple Registers (FC03)
pub const FC_READ_MULTIPLE_REGISTERS: u8 = 0x03;

/// Read Input Registers (FC04)
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;

/// Write Coil (FC05)
pub const FC_WRITE_COIL: u8 = 0x05;

/// Write Single Register (FC06)
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

/// Read Exception Status (FC07)
pub const FC_READ_EXCEPTION_STATUS: u8 = 0x07;

/// Get Comm Event Counter (FC11)
pub const FC_GET_COMM_EVENT_COUNTER: u8 = 0x0B;

/// Force Multiple Coils (FC15)
pub const FC_FORCE_MULTIPLE_COILS: u8 = 0x0F;

/// Write Multiple Registers (FC16)
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Mask Write Register (FC22)
pub const FC_MASK_WRITE_REGISTER: u8 = 0x16;

/// Read/Write Registers (FC23)
pub const FC_READ_WRITE_REGISTERS: u8 = 0x17;

/// High bit set on the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Modbus Exception Codes
// ============================================================================

/// Illegal Function
pub const EXCEPTION_ILLEGAL_FUNCTION: u8 = 0x01;

/// Illegal Data Address
pub const EXCEPTION_ILLEGAL_DATA_ADDRESS: u8 = 0x02;

/// Illegal Data Value
pub const EXCEPTION_ILLEGAL_DATA_VALUE: u8 = 0x03;

/// Server Failure
pub const EXCEPTION_SERVER_FAILURE: u8 = 0x04;

/// Slave Device Busy
pub const EXCEPTION_SLAVE_DEVICE_BUSY: u8 = 0x06;

// ============================================================================
// Network Defaults
// ============================================================================

/// Standard Modbus port, used for both TCP and UDP.
pub const MODBUS_PORT: u16 = 502;

/// Default `listen()` backlog.
pub const DEFAULT_BACKLOG: u32 = 5;

/// Default cap on concurrently served TCP connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// How long a connection may sit idle waiting for the next request header.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(100);

/// How long the rest of a request may take once its header has arrived.
pub const DEFAULT_BODY_TIMEOUT: Duration = Duration::from_secs(10);

/// Short header reads tolerated on one connection before it is dropped.
pub const MAX_INVALID_HEADERS: u32 = 25;

/// Time workers get to finish after shutdown is requested.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Pause after a failed `accept()`, e.g. when out of file descriptors.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
