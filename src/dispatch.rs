//! Function dispatch table
//!
//! Maps a function code to its handler. Each handler validates its own request
//! length, quantity and address range, calls the data plane, and rewrites the
//! frame in place with the response. Anything the client got wrong becomes an
//! exception frame; only failures that cannot be answered (a frame too short to
//! carry a header, a response that does not fit) come back as `Err`.
//!
//! | Code | Function | Limit |
//! |------|----------|-------|
//! | 0x01 | Read Coils | 2000 bits |
//! | 0x02 | Read Input Discretes | 2000 bits |
//! | 0x03 | Read Multiple Registers | 125 registers |
//! | 0x04 | Read Input Registers | 125 registers |
//! | 0x05 | Write Coil | - |
//! | 0x06 | Write Single Register | - |
//! | 0x07 | Read Exception Status | - |
//! | 0x0B | Get Comm Event Counter | - |
//! | 0x0F | Force Multiple Coils | 800 bits |
//! | 0x10 | Write Multiple Registers | 100 registers |
//! | 0x16 | Mask Write Register | - |
//! | 0x17 | Read/Write Registers | 125 read / 100 write |

use std::sync::Arc;

use tracing::debug;

use crate::constants::*;
use crate::data_plane::{Area, DataPlane, Fault, SharedDataPlane};
use crate::error::{ModbusError, ModbusResult};
use crate::frame::Frame;
use crate::protocol::{ExceptionCode, ModbusFunction, ModbusHeader};
use crate::stats::ModbusStatistics;

/// Why a handler did not produce a normal response.
#[derive(Debug)]
enum Reject {
    /// Answer with an exception frame.
    Exception(ExceptionCode),
    /// Cannot be answered at all.
    Internal(ModbusError),
}

impl From<Fault> for Reject {
    fn from(fault: Fault) -> Self {
        debug!("Data plane fault: {}", fault);
        Reject::Exception(fault.exception_code())
    }
}

impl From<ModbusError> for Reject {
    fn from(err: ModbusError) -> Self {
        Reject::Internal(err)
    }
}

type HandlerResult = Result<usize, Reject>;

/// Everything a handler gets to work with for one request.
struct Request<'a> {
    header: ModbusHeader,
    frame: &'a mut Frame,
    data_plane: &'a mut dyn DataPlane,
    stats: &'a ModbusStatistics,
}

impl Request<'_> {
    /// Require an exact length field.
    fn expect_length(&self, expected: u16) -> Result<(), Reject> {
        if self.header.length != expected {
            debug!(
                "Bad length for FC={:02X}: {} (expected {})",
                self.header.function_code, self.header.length, expected
            );
            self.stats.record_bad_length();
            return Err(Reject::Exception(ExceptionCode::IllegalDataValue));
        }
        Ok(())
    }

    /// Require at least `minimum` in the length field.
    fn expect_min_length(&self, minimum: u16) -> Result<(), Reject> {
        if self.header.length < minimum {
            self.stats.record_bad_length();
            return Err(Reject::Exception(ExceptionCode::IllegalDataValue));
        }
        Ok(())
    }

    fn u16_at(&self, offset: usize) -> Result<u16, Reject> {
        self.frame
            .payload_u16(offset)
            .ok_or(Reject::Exception(ExceptionCode::IllegalDataValue))
    }

    fn u8_at(&self, offset: usize) -> Result<u8, Reject> {
        self.frame
            .payload_u8(offset)
            .ok_or(Reject::Exception(ExceptionCode::IllegalDataValue))
    }

    /// Quantity must be 1..=max; over-limit requests are counted separately.
    fn check_quantity(&self, count: u16, max: u16, bits: bool) -> Result<(), Reject> {
        if count == 0 {
            return Err(Reject::Exception(ExceptionCode::IllegalDataValue));
        }
        if count > max {
            debug!("Quantity {} exceeds limit {}", count, max);
            if bits {
                self.stats.record_too_many_bits();
            } else {
                self.stats.record_too_many_registers();
            }
            return Err(Reject::Exception(ExceptionCode::IllegalDataValue));
        }
        Ok(())
    }

    /// `start..start + count` must lie inside `area`.
    fn check_range(&self, area: Area, start: u16, count: u16) -> Result<(), Reject> {
        let end = start as usize + count as usize;
        if end > self.data_plane.capacity(area) {
            debug!(
                "Range {}..{} outside {:?} (capacity {})",
                start,
                end,
                area,
                self.data_plane.capacity(area)
            );
            return Err(Reject::Exception(ExceptionCode::IllegalDataAddress));
        }
        Ok(())
    }
}

type Handler = fn(&mut Request<'_>) -> HandlerResult;

/// Function code to handler mapping.
const FUNCTION_TABLE: [(ModbusFunction, Handler); 12] = [
    (ModbusFunction::ReadCoils, read_coils),
    (ModbusFunction::ReadInputDiscretes, read_input_discretes),
    (ModbusFunction::ReadMultipleRegisters, read_multiple_registers),
    (ModbusFunction::ReadInputRegisters, read_input_registers),
    (ModbusFunction::WriteCoil, write_coil),
    (ModbusFunction::WriteSingleRegister, write_single_register),
    (ModbusFunction::ReadExceptionStatus, read_exception_status),
    (ModbusFunction::GetCommEventCounter, get_comm_event_counter),
    (ModbusFunction::ForceMultipleCoils, force_multiple_coils),
    (ModbusFunction::WriteMultipleRegisters, write_multiple_registers),
    (ModbusFunction::MaskWriteRegister, mask_write_register),
    (ModbusFunction::ReadWriteRegisters, read_write_registers),
];

fn lookup(function_code: u8) -> Option<Handler> {
    FUNCTION_TABLE
        .iter()
        .find(|(function, _)| function.to_u8() == function_code)
        .map(|(_, handler)| *handler)
}

/// The dispatch table bound to a data plane and a statistics block.
#[derive(Debug, Clone)]
pub struct FunctionTable {
    data_plane: SharedDataPlane,
    stats: Arc<ModbusStatistics>,
}

impl FunctionTable {
    /// Create a table serving `data_plane`.
    pub fn new(data_plane: SharedDataPlane, stats: Arc<ModbusStatistics>) -> Self {
        Self { data_plane, stats }
    }

    /// Statistics shared with the transports.
    pub fn stats(&self) -> &Arc<ModbusStatistics> {
        &self.stats
    }

    /// The shared data plane.
    pub fn data_plane(&self) -> &SharedDataPlane {
        &self.data_plane
    }

    /// Process one complete request frame and overwrite it with the response.
    ///
    /// Returns the number of response bytes now in `frame`, header included.
    /// `Err` means no response can be built; TCP callers close the connection.
    pub fn dispatch(&self, frame: &mut Frame) -> ModbusResult<usize> {
        let header = frame.header()?;
        if frame.len() != header.frame_len() {
            return Err(ModbusError::frame(format!(
                "frame holds {} bytes but header announces {}",
                frame.len(),
                header.frame_len()
            )));
        }
        self.stats.record_message();
        debug!(
            "Dispatching tid={} unit={} {}",
            header.transaction_id,
            header.unit_id,
            frame.describe()
        );

        let Some(handler) = lookup(header.function_code) else {
            debug!("Unsupported function code: 0x{:02X}", header.function_code);
            return Ok(self.exception(frame, ExceptionCode::IllegalFunction));
        };

        let outcome = {
            let mut data_plane = self.data_plane.lock();
            let mut request = Request {
                header,
                frame: &mut *frame,
                data_plane: &mut *data_plane,
                stats: &self.stats,
            };
            handler(&mut request)
        };

        match outcome {
            Ok(len) => Ok(len),
            Err(Reject::Exception(code)) => Ok(self.exception(frame, code)),
            Err(Reject::Internal(err)) => Err(err),
        }
    }

    fn exception(&self, frame: &mut Frame, code: ExceptionCode) -> usize {
        self.stats.record_exception(code);
        debug!(
            "Exception {} for FC={:02X}",
            code,
            frame.function_code().unwrap_or(0)
        );
        frame.set_exception(code)
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Pack bits LSB-first into bytes.
fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; bits.len().div_ceil(8)];
    for (i, &bit) in bits.iter().enumerate() {
        if bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

/// Unpack `count` LSB-first bits.
fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect()
}

fn read_bits(req: &mut Request<'_>, area: Area) -> HandlerResult {
    req.expect_length(6)?;
    let start = req.u16_at(0)?;
    let count = req.u16_at(2)?;
    req.check_quantity(count, READ_COILS_MAX, true)?;
    req.check_range(area, start, count)?;

    let bits = req.data_plane.read_bits(area, start, count)?;
    let packed = pack_bits(&bits);

    let mut writer = req.frame.begin_response()?;
    writer.push(packed.len() as u8)?;
    writer.extend(&packed)?;
    Ok(writer.finish())
}

fn read_registers(req: &mut Request<'_>, area: Area) -> HandlerResult {
    req.expect_length(6)?;
    let start = req.u16_at(0)?;
    let count = req.u16_at(2)?;
    req.check_quantity(count, READ_REGS_MAX, false)?;
    req.check_range(area, start, count)?;

    let registers = req.data_plane.read_registers(area, start, count)?;

    let mut writer = req.frame.begin_response()?;
    writer.push((registers.len() * 2) as u8)?;
    for value in registers {
        writer.push_u16(value)?;
    }
    Ok(writer.finish())
}

fn read_coils(req: &mut Request<'_>) -> HandlerResult {
    read_bits(req, Area::Coils)
}

fn read_input_discretes(req: &mut Request<'_>) -> HandlerResult {
    read_bits(req, Area::DiscreteInputs)
}

fn read_multiple_registers(req: &mut Request<'_>) -> HandlerResult {
    read_registers(req, Area::HoldingRegisters)
}

fn read_input_registers(req: &mut Request<'_>) -> HandlerResult {
    read_registers(req, Area::InputRegisters)
}

fn write_coil(req: &mut Request<'_>) -> HandlerResult {
    req.expect_length(6)?;
    let address = req.u16_at(0)?;
    let value = req.u16_at(2)?;
    let on = match value {
        COIL_ON => true,
        COIL_OFF => false,
        _ => return Err(Reject::Exception(ExceptionCode::IllegalDataValue)),
    };
    req.check_range(Area::Coils, address, 1)?;

    req.data_plane.write_coil(address, on)?;

    let mut writer = req.frame.begin_response()?;
    writer.push_u16(address)?;
    writer.push_u16(value)?;
    Ok(writer.finish())
}

fn write_single_register(req: &mut Request<'_>) -> HandlerResult {
    req.expect_length(6)?;
    let address = req.u16_at(0)?;
    let value = req.u16_at(2)?;
    req.check_range(Area::HoldingRegisters, address, 1)?;

    req.data_plane.write_registers(address, &[value])?;

    let mut writer = req.frame.begin_response()?;
    writer.push_u16(address)?;
    writer.push_u16(value)?;
    Ok(writer.finish())
}

fn read_exception_status(req: &mut Request<'_>) -> HandlerResult {
    req.expect_length(2)?;
    let status = req.data_plane.exception_status()?;

    let mut writer = req.frame.begin_response()?;
    writer.push(status)?;
    Ok(writer.finish())
}

fn get_comm_event_counter(req: &mut Request<'_>) -> HandlerResult {
    req.expect_length(2)?;
    let (status, count) = req.data_plane.comm_event_counter()?;

    let mut writer = req.frame.begin_response()?;
    writer.push_u16(status)?;
    writer.push_u16(count)?;
    Ok(writer.finish())
}

fn force_multiple_coils(req: &mut Request<'_>) -> HandlerResult {
    req.expect_min_length(7)?;
    let start = req.u16_at(0)?;
    let count = req.u16_at(2)?;
    let byte_count = req.u8_at(4)?;
    req.check_quantity(count, FORCE_COILS_MAX, true)?;
    if byte_count as usize != (count as usize).div_ceil(8) {
        return Err(Reject::Exception(ExceptionCode::IllegalDataValue));
    }
    req.expect_length(7 + byte_count as u16)?;
    req.check_range(Area::Coils, start, count)?;

    let values = unpack_bits(&req.frame.payload()[5..], count as usize);
    req.data_plane.write_coils(start, &values)?;

    let mut writer = req.frame.begin_response()?;
    writer.push_u16(start)?;
    writer.push_u16(count)?;
    Ok(writer.finish())
}

fn write_multiple_registers(req: &mut Request<'_>) -> HandlerResult {
    req.expect_min_length(7)?;
    let start = req.u16_at(0)?;
    let count = req.u16_at(2)?;
    let byte_count = req.u8_at(4)?;
    req.check_quantity(count, WRITE_REGS_MAX, false)?;
    if byte_count as usize != count as usize * 2 {
        return Err(Reject::Exception(ExceptionCode::IllegalDataValue));
    }
    req.expect_length(7 + byte_count as u16)?;
    req.check_range(Area::HoldingRegisters, start, count)?;

    let values = (0..count as usize)
        .map(|i| req.u16_at(5 + i * 2))
        .collect::<Result<Vec<u16>, Reject>>()?;
    req.data_plane.write_registers(start, &values)?;

    let mut writer = req.frame.begin_response()?;
    writer.push_u16(start)?;
    writer.push_u16(count)?;
    Ok(writer.finish())
}

fn mask_write_register(req: &mut Request<'_>) -> HandlerResult {
    req.expect_length(8)?;
    let address = req.u16_at(0)?;
    let and_mask = req.u16_at(2)?;
    let or_mask = req.u16_at(4)?;
    req.check_range(Area::HoldingRegisters, address, 1)?;

    let current = req
        .data_plane
        .read_registers(Area::HoldingRegisters, address, 1)?
        .first()
        .copied()
        .ok_or(Reject::Exception(ExceptionCode::ServerFailure))?;
    let updated = (current & and_mask) | (or_mask & !and_mask);
    req.data_plane.write_registers(address, &[updated])?;

    let mut writer = req.frame.begin_response()?;
    writer.push_u16(address)?;
    writer.push_u16(and_mask)?;
    writer.push_u16(or_mask)?;
    Ok(writer.finish())
}

fn read_write_registers(req: &mut Request<'_>) -> HandlerResult {
    req.expect_min_length(11)?;
    let read_start = req.u16_at(0)?;
    let read_count = req.u16_at(2)?;
    let write_start = req.u16_at(4)?;
    let write_count = req.u16_at(6)?;
    let byte_count = req.u8_at(8)?;
    req.check_quantity(read_count, READ_REGS_MAX, false)?;
    req.check_quantity(write_count, WRITE_REGS_MAX, false)?;
    if byte_count as usize != write_count as usize * 2 {
        return Err(Reject::Exception(ExceptionCode::IllegalDataValue));
    }
    req.expect_length(11 + byte_count as u16)?;
    req.check_range(Area::HoldingRegisters, read_start, read_count)?;
    req.check_range(Area::HoldingRegisters, write_start, write_count)?;

    // Write happens before the read
    let values = (0..write_count as usize)
        .map(|i| req.u16_at(9 + i * 2))
        .collect::<Result<Vec<u16>, Reject>>()?;
    req.data_plane.write_registers(write_start, &values)?;
    let registers = req
        .data_plane
        .read_registers(Area::HoldingRegisters, read_start, read_count)?;

    let mut writer = req.frame.begin_response()?;
    writer.push((registers.len() * 2) as u8)?;
    for value in registers {
        writer.push_u16(value)?;
    }
    Ok(writer.finish())
}
