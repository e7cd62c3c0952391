//! Modbus protocol definitions: function codes, exception codes and the
//! 8-byte request header.
//!
//! All multi-byte fields are big-endian on the wire. Headers are decoded field
//! by field from byte slices; nothing is cast or overlaid.

use bytes::{Buf, BufMut};

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult, ProtocolError};

/// Slave/unit address as carried in the header.
pub type UnitId = u8;

/// Function codes served by the dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModbusFunction {
    ReadCoils,
    ReadInputDiscretes,
    ReadMultipleRegisters,
    ReadInputRegisters,
    WriteCoil,
    WriteSingleRegister,
    ReadExceptionStatus,
    GetCommEventCounter,
    ForceMultipleCoils,
    WriteMultipleRegisters,
    MaskWriteRegister,
    ReadWriteRegisters,
}

impl ModbusFunction {
    /// Every supported function, in function code order.
    pub const ALL: [ModbusFunction; 12] = [
        Self::ReadCoils,
        Self::ReadInputDiscretes,
        Self::ReadMultipleRegisters,
        Self::ReadInputRegisters,
        Self::WriteCoil,
        Self::WriteSingleRegister,
        Self::ReadExceptionStatus,
        Self::GetCommEventCounter,
        Self::ForceMultipleCoils,
        Self::WriteMultipleRegisters,
        Self::MaskWriteRegister,
        Self::ReadWriteRegisters,
    ];

    /// Look up a function code; `None` for codes this server does not serve.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            FC_READ_COILS => Some(Self::ReadCoils),
            FC_READ_INPUT_DISCRETES => Some(Self::ReadInputDiscretes),
            FC_READ_MULTIPLE_REGISTERS => Some(Self::ReadMultipleRegisters),
            FC_READ_INPUT_REGISTERS => Some(Self::ReadInputRegisters),
            FC_WRITE_COIL => Some(Self::WriteCoil),
            FC_WRITE_SINGLE_REGISTER => Some(Self::WriteSingleRegister),
            FC_READ_EXCEPTION_STATUS => Some(Self::ReadExceptionStatus),
            FC_GET_COMM_EVENT_COUNTER => Some(Self::GetCommEventCounter),
            FC_FORCE_MULTIPLE_COILS => Some(Self::ForceMultipleCoils),
            FC_WRITE_MULTIPLE_REGISTERS => Some(Self::WriteMultipleRegisters),
            FC_MASK_WRITE_REGISTER => Some(Self::MaskWriteRegister),
            FC_READ_WRITE_REGISTERS => Some(Self::ReadWriteRegisters),
            _ => None,
        }
    }

    /// Wire value of the function code.
    pub fn to_u8(self) -> u8 {
        match self {
            Self::ReadCoils => FC_READ_COILS,
            Self::ReadInputDiscretes => FC_READ_INPUT_DISCRETES,
            Self::ReadMultipleRegisters => FC_READ_MULTIPLE_REGISTERS,
            Self::ReadInputRegisters => FC_READ_INPUT_REGISTERS,
            Self::WriteCoil => FC_WRITE_COIL,
            Self::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
            Self::ReadExceptionStatus => FC_READ_EXCEPTION_STATUS,
            Self::GetCommEventCounter => FC_GET_COMM_EVENT_COUNTER,
            Self::ForceMultipleCoils => FC_FORCE_MULTIPLE_COILS,
            Self::WriteMultipleRegisters => FC_WRITE_MULTIPLE_REGISTERS,
            Self::MaskWriteRegister => FC_MASK_WRITE_REGISTER,
            Self::ReadWriteRegisters => FC_READ_WRITE_REGISTERS,
        }
    }

    /// Human-readable name, used in log lines.
    pub fn description(self) -> &'static str {
        match self {
            Self::ReadCoils => "Read Coils",
            Self::ReadInputDiscretes => "Read Input Discretes",
            Self::ReadMultipleRegisters => "Read Multiple Registers",
            Self::ReadInputRegisters => "Read Input Registers",
            Self::WriteCoil => "Write Coil",
            Self::WriteSingleRegister => "Write Single Register",
            Self::ReadExceptionStatus => "Read Exception Status",
            Self::GetCommEventCounter => "Get Comm Event Counter",
            Self::ForceMultipleCoils => "Force Multiple Coils",
            Self::WriteMultipleRegisters => "Write Multiple Registers",
            Self::MaskWriteRegister => "Mask Write Register",
            Self::ReadWriteRegisters => "Read/Write Registers",
        }
    }
}

/// Exception codes sent back in exception frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = EXCEPTION_ILLEGAL_FUNCTION,
    IllegalDataAddress = EXCEPTION_ILLEGAL_DATA_ADDRESS,
    IllegalDataValue = EXCEPTION_ILLEGAL_DATA_VALUE,
    ServerFailure = EXCEPTION_SERVER_FAILURE,
    SlaveDeviceBusy = EXCEPTION_SLAVE_DEVICE_BUSY,
}

impl ExceptionCode {
    /// Wire value of the exception code.
    #[inline]
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse an exception byte.
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            EXCEPTION_ILLEGAL_FUNCTION => Some(Self::IllegalFunction),
            EXCEPTION_ILLEGAL_DATA_ADDRESS => Some(Self::IllegalDataAddress),
            EXCEPTION_ILLEGAL_DATA_VALUE => Some(Self::IllegalDataValue),
            EXCEPTION_SERVER_FAILURE => Some(Self::ServerFailure),
            EXCEPTION_SLAVE_DEVICE_BUSY => Some(Self::SlaveDeviceBusy),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::IllegalFunction => "ILLEGAL_FUNCTION",
            Self::IllegalDataAddress => "ILLEGAL_DATA_ADDRESS",
            Self::IllegalDataValue => "ILLEGAL_DATA_VALUE",
            Self::ServerFailure => "SERVER_FAILURE",
            Self::SlaveDeviceBusy => "SLAVE_DEVICE_BUSY",
        };
        write!(f, "{} (0x{:02X})", name, self.to_u8())
    }
}

/// The 8-byte header that prefixes every request and response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModbusHeader {
    /// Client correlation id, echoed back unchanged.
    pub transaction_id: u16,
    /// Always 0 for valid frames.
    pub protocol_id: u16,
    /// Bytes following the length field (unit id + function code + data).
    pub length: u16,
    /// Slave address, echoed back unchanged.
    pub unit_id: UnitId,
    /// Selects the handler.
    pub function_code: u8,
}

impl ModbusHeader {
    /// Decode the full 8-byte header.
    pub fn decode(bytes: &[u8]) -> ModbusResult<Self> {
        if bytes.len() < MODBUS_HEADER_LENGTH {
            return Err(ModbusError::frame(format!(
                "header needs {} bytes, got {}",
                MODBUS_HEADER_LENGTH,
                bytes.len()
            )));
        }
        let mut buf = &bytes[..MODBUS_HEADER_LENGTH];
        Ok(Self {
            transaction_id: buf.get_u16(),
            protocol_id: buf.get_u16(),
            length: buf.get_u16(),
            unit_id: buf.get_u8(),
            function_code: buf.get_u8(),
        })
    }

    /// Encode into the first 8 bytes of `out`.
    pub fn encode(&self, out: &mut [u8]) -> ModbusResult<()> {
        if out.len() < MODBUS_HEADER_LENGTH {
            return Err(ModbusError::frame(format!(
                "header needs {} bytes, buffer has {}",
                MODBUS_HEADER_LENGTH,
                out.len()
            )));
        }
        let mut buf = &mut out[..MODBUS_HEADER_LENGTH];
        buf.put_u16(self.transaction_id);
        buf.put_u16(self.protocol_id);
        buf.put_u16(self.length);
        buf.put_u8(self.unit_id);
        buf.put_u8(self.function_code);
        Ok(())
    }

    /// Total frame size announced by this header: `6 + length`.
    #[inline]
    pub fn frame_len(&self) -> usize {
        LENGTH_TO_UNIT_ID + self.length as usize
    }
}

/// Validate the fixed part of a header and return its length field.
///
/// Only the first six bytes are inspected (transaction id, protocol id,
/// length), which is all a TCP connection has read at this point. The
/// returned length is the number of bytes still to be read: unit id,
/// function code and data.
pub fn validate_header(bytes: &[u8; LENGTH_TO_UNIT_ID]) -> Result<u16, ProtocolError> {
    let protocol_id = u16::from_be_bytes([bytes[2], bytes[3]]);
    let length = u16::from_be_bytes([bytes[4], bytes[5]]);

    if protocol_id != 0 {
        return Err(ProtocolError::NonZeroProtocolId(protocol_id));
    }
    if length > MAX_LENGTH_FIELD {
        return Err(ProtocolError::LengthTooLarge(length));
    }
    Ok(length)
}

/// [`validate_header`] over the front of an arbitrary slice.
///
/// Returns `None` when fewer than six bytes are available.
pub fn validate_header_prefix(bytes: &[u8]) -> Option<Result<u16, ProtocolError>> {
    let prefix: &[u8; LENGTH_TO_UNIT_ID] = bytes.get(..LENGTH_TO_UNIT_ID)?.try_into().ok()?;
    Some(validate_header(prefix))
}
