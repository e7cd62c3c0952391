//! Request/response frame buffer
//!
//! A [`Frame`] holds one header-prefixed Modbus frame in a fixed-size buffer.
//! The same buffer receives the request and is then overwritten in place with
//! the response, so each connection (or the UDP loop) owns exactly one frame
//! and never shares it.

use tracing::debug;

use crate::constants::*;
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{ExceptionCode, ModbusFunction, ModbusHeader};

/// Fixed-size frame buffer with a fill length.
#[derive(Clone)]
pub struct Frame {
    data: Box<[u8; MAX_MB_BUFFER_SIZE]>,
    len: usize,
}

impl Frame {
    /// Create an empty frame.
    pub fn new() -> Self {
        Self {
            data: Box::new([0; MAX_MB_BUFFER_SIZE]),
            len: 0,
        }
    }

    /// Create a frame holding a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> ModbusResult<Self> {
        let mut frame = Self::new();
        frame.load(bytes)?;
        Ok(frame)
    }

    /// Replace the contents with `bytes`.
    pub fn load(&mut self, bytes: &[u8]) -> ModbusResult<()> {
        if bytes.len() > MAX_MB_BUFFER_SIZE {
            return Err(ModbusError::frame(format!(
                "frame too large: {} bytes (max {})",
                bytes.len(),
                MAX_MB_BUFFER_SIZE
            )));
        }
        self.data[..bytes.len()].copy_from_slice(bytes);
        self.len = bytes.len();
        Ok(())
    }

    /// Filled part of the buffer.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Whole buffer, for socket reads.
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Current fill length.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the fill length after reading into [`Frame::buffer_mut`].
    pub fn set_len(&mut self, len: usize) -> ModbusResult<()> {
        if len > MAX_MB_BUFFER_SIZE {
            return Err(ModbusError::frame(format!(
                "frame length {} exceeds buffer size {}",
                len, MAX_MB_BUFFER_SIZE
            )));
        }
        self.len = len;
        Ok(())
    }

    /// Clear the frame.
    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Decode the 8-byte header at the front of the frame.
    pub fn header(&self) -> ModbusResult<ModbusHeader> {
        ModbusHeader::decode(self.as_slice())
    }

    /// Function code byte, if the frame is long enough to carry one.
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        if self.len >= MODBUS_HEADER_LENGTH {
            Some(self.data[MODBUS_HEADER_LENGTH - 1])
        } else {
            None
        }
    }

    /// Request data following the function code.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        if self.len > MODBUS_HEADER_LENGTH {
            &self.data[MODBUS_HEADER_LENGTH..self.len]
        } else {
            &[]
        }
    }

    /// Read a big-endian u16 from the payload at `offset`.
    #[inline]
    pub fn payload_u16(&self, offset: usize) -> Option<u16> {
        let payload = self.payload();
        let bytes = payload.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Read one payload byte.
    #[inline]
    pub fn payload_u8(&self, offset: usize) -> Option<u8> {
        self.payload().get(offset).copied()
    }

    /// Whether the high bit of the function code is set.
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }

    /// Exception code of an exception response.
    #[inline]
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() && self.len >= EXCEPTION_LENGTH {
            Some(self.data[MODBUS_HEADER_LENGTH])
        } else {
            None
        }
    }

    /// Start a response in place: keep transaction id, protocol id and unit id,
    /// and reset the fill length to the header.
    ///
    /// The length field is written by [`ResponseWriter::finish`].
    pub fn begin_response(&mut self) -> ModbusResult<ResponseWriter<'_>> {
        if self.len < MODBUS_HEADER_LENGTH {
            return Err(ModbusError::frame(format!(
                "cannot respond to a {} byte frame",
                self.len
            )));
        }
        self.len = MODBUS_HEADER_LENGTH;
        Ok(ResponseWriter { frame: self })
    }

    /// Overwrite the frame with an exception response for its own header.
    ///
    /// Returns the response length (always 9).
    pub fn set_exception(&mut self, code: ExceptionCode) -> usize {
        let header = self.partial_header();
        let bytes = build_exception(&header, code);
        self.data[..EXCEPTION_LENGTH].copy_from_slice(&bytes);
        self.len = EXCEPTION_LENGTH;
        EXCEPTION_LENGTH
    }

    /// Header fields as far as they were received; missing bytes read as 0.
    fn partial_header(&self) -> ModbusHeader {
        let mut raw = [0u8; MODBUS_HEADER_LENGTH];
        let n = self.len.min(MODBUS_HEADER_LENGTH);
        raw[..n].copy_from_slice(&self.data[..n]);
        ModbusHeader {
            transaction_id: u16::from_be_bytes([raw[0], raw[1]]),
            protocol_id: u16::from_be_bytes([raw[2], raw[3]]),
            length: u16::from_be_bytes([raw[4], raw[5]]),
            unit_id: raw[6],
            function_code: raw[7],
        }
    }

    /// Short human-readable summary for debug logs.
    pub fn describe(&self) -> String {
        match self.function_code() {
            Some(fc) if fc & EXCEPTION_FLAG != 0 => format!(
                "FC={:02X} (Exception), exception_code={:02X}",
                fc,
                self.exception_code().unwrap_or(0)
            ),
            Some(fc) => format!(
                "FC={:02X} ({}), len={}",
                fc,
                ModbusFunction::from_u8(fc)
                    .map(|f| f.description())
                    .unwrap_or("Unknown Function"),
                self.len
            ),
            None => format!("incomplete frame, len={}", self.len),
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.len)
            .field("data", &self.as_slice())
            .finish()
    }
}

/// Appends response data after the header of a frame being rewritten.
pub struct ResponseWriter<'a> {
    frame: &'a mut Frame,
}

impl ResponseWriter<'_> {
    /// Push a single byte.
    #[inline]
    pub fn push(&mut self, byte: u8) -> ModbusResult<()> {
        if self.frame.len >= MAX_MB_BUFFER_SIZE {
            return Err(ModbusError::frame("response buffer full"));
        }
        self.frame.data[self.frame.len] = byte;
        self.frame.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian.
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> ModbusResult<()> {
        self.push((value >> 8) as u8)?;
        self.push((value & 0xFF) as u8)?;
        Ok(())
    }

    /// Extend with a byte slice.
    pub fn extend(&mut self, data: &[u8]) -> ModbusResult<()> {
        let end = self.frame.len + data.len();
        if end > MAX_MB_BUFFER_SIZE {
            return Err(ModbusError::frame(format!(
                "response would exceed buffer: {} + {} > {}",
                self.frame.len,
                data.len(),
                MAX_MB_BUFFER_SIZE
            )));
        }
        self.frame.data[self.frame.len..end].copy_from_slice(data);
        self.frame.len = end;
        Ok(())
    }

    /// Write the length field and return the total response size.
    pub fn finish(self) -> usize {
        let length = (self.frame.len - LENGTH_TO_UNIT_ID) as u16;
        self.frame.data[4..6].copy_from_slice(&length.to_be_bytes());
        debug!("Response built: {}", self.frame.describe());
        self.frame.len
    }
}

/// Build the 9-byte exception frame answering `request`.
///
/// Transaction id and unit id are copied, the protocol id is 0, the length is
/// 3 and the function code gets its high bit set.
pub fn build_exception(request: &ModbusHeader, code: ExceptionCode) -> [u8; EXCEPTION_LENGTH] {
    let [tid_hi, tid_lo] = request.transaction_id.to_be_bytes();
    [
        tid_hi,
        tid_lo,
        0x00,
        0x00,
        0x00,
        0x03,
        request.unit_id,
        request.function_code | EXCEPTION_FLAG,
        code.to_u8(),
    ]
}
