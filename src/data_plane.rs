//! Data plane: the process image the server exposes
//!
//! The dispatch table never stores I/O values itself. It calls a [`DataPlane`]
//! that owns coils, discrete inputs and registers; on a coupler that is the
//! fieldbus process image, in tests and in the standalone binary it is the
//! vector-backed [`MemoryDataPlane`].
//!
//! Calls are synchronous and may be slow (they can touch physical I/O). All
//! access from the servers goes through [`SharedDataPlane`], which serialises
//! concurrent connections behind one mutex.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tracing::warn;

use crate::protocol::ExceptionCode;

/// Address spaces of the process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Area {
    /// Read/write bits (FC01, FC05, FC15)
    Coils,
    /// Read-only bits (FC02)
    DiscreteInputs,
    /// Read/write words (FC03, FC06, FC16, FC22, FC23)
    HoldingRegisters,
    /// Read-only words (FC04)
    InputRegisters,
}

/// Data plane access failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
    /// Address outside what the backend maps.
    #[error("illegal address {address} in {area:?}")]
    IllegalAddress { area: Area, address: u16 },

    /// Backend I/O failed.
    #[error("device failure: {0}")]
    DeviceFailure(String),

    /// Backend temporarily unable to serve the request.
    #[error("device busy")]
    Busy,
}

impl Fault {
    /// Exception code reported to the client for this fault.
    pub fn exception_code(&self) -> ExceptionCode {
        match self {
            Fault::IllegalAddress { .. } => ExceptionCode::IllegalDataAddress,
            Fault::DeviceFailure(_) => ExceptionCode::ServerFailure,
            Fault::Busy => ExceptionCode::SlaveDeviceBusy,
        }
    }
}

/// Result alias for data plane calls.
pub type FaultResult<T> = Result<T, Fault>;

/// Backend consulted by the function handlers.
///
/// Handlers check address ranges against [`DataPlane::capacity`] before any
/// read or write, so implementations only see in-range requests unless the
/// mapping changes underneath them.
pub trait DataPlane: Send {
    /// Number of addressable items in `area`.
    fn capacity(&self, area: Area) -> usize;

    /// Read `count` bits from a bit area.
    fn read_bits(&mut self, area: Area, start: u16, count: u16) -> FaultResult<Vec<bool>>;

    /// Read `count` words from a register area.
    fn read_registers(&mut self, area: Area, start: u16, count: u16) -> FaultResult<Vec<u16>>;

    /// Set a single coil.
    fn write_coil(&mut self, address: u16, value: bool) -> FaultResult<()>;

    /// Set consecutive coils.
    fn write_coils(&mut self, start: u16, values: &[bool]) -> FaultResult<()>;

    /// Write consecutive holding registers.
    fn write_registers(&mut self, start: u16, values: &[u16]) -> FaultResult<()>;

    /// Eight status bits returned by Read Exception Status.
    fn exception_status(&mut self) -> FaultResult<u8> {
        Ok(0)
    }

    /// Status word and event count returned by Get Comm Event Counter.
    fn comm_event_counter(&mut self) -> FaultResult<(u16, u16)>;
}

/// A data plane shared by every connection, serialised by one mutex.
pub struct SharedDataPlane {
    inner: Arc<Mutex<dyn DataPlane>>,
}

impl SharedDataPlane {
    /// Wrap a backend for shared use.
    pub fn new<D: DataPlane + 'static>(data_plane: D) -> Self {
        Self {
            inner: Arc::new(Mutex::new(data_plane)),
        }
    }

    /// Lock the backend for the duration of one request.
    ///
    /// A poisoned lock means a handler panicked mid-request. The process image
    /// itself is still consistent at word granularity, so the guard is
    /// recovered rather than failing every later request.
    pub fn lock(&self) -> MutexGuard<'_, dyn DataPlane + 'static> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Data plane lock poisoned by a failed handler, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl Clone for SharedDataPlane {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for SharedDataPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDataPlane").finish_non_exhaustive()
    }
}

/// Sizes of the in-memory process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub coils: usize,
    pub discrete_inputs: usize,
    pub holding_registers: usize,
    pub input_registers: usize,
}

impl Default for ImageSize {
    fn default() -> Self {
        Self {
            coils: 4096,
            discrete_inputs: 4096,
            holding_registers: 4096,
            input_registers: 4096,
        }
    }
}

/// Vector-backed process image.
///
/// Every successful write operation bumps the comm event counter, mirroring
/// how a device counts completed message events.
#[derive(Debug, Clone)]
pub struct MemoryDataPlane {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding_registers: Vec<u16>,
    input_registers: Vec<u16>,
    exception_status: u8,
    event_count: u16,
}

impl MemoryDataPlane {
    /// Zero-filled image of the given size.
    pub fn new(size: ImageSize) -> Self {
        Self {
            coils: vec![false; size.coils],
            discrete_inputs: vec![false; size.discrete_inputs],
            holding_registers: vec![0; size.holding_registers],
            input_registers: vec![0; size.input_registers],
            exception_status: 0,
            event_count: 0,
        }
    }

    /// Preload discrete inputs, as the fieldbus would.
    pub fn set_discrete_inputs(&mut self, start: u16, values: &[bool]) -> FaultResult<()> {
        let range = Self::range(Area::DiscreteInputs, &self.discrete_inputs, start, values.len())?;
        self.discrete_inputs[range].copy_from_slice(values);
        Ok(())
    }

    /// Preload input registers, as the fieldbus would.
    pub fn set_input_registers(&mut self, start: u16, values: &[u16]) -> FaultResult<()> {
        let range = Self::range(Area::InputRegisters, &self.input_registers, start, values.len())?;
        self.input_registers[range].copy_from_slice(values);
        Ok(())
    }

    /// Set the byte returned by Read Exception Status.
    pub fn set_exception_status(&mut self, status: u8) {
        self.exception_status = status;
    }

    fn range<T>(
        area: Area,
        items: &[T],
        start: u16,
        count: usize,
    ) -> FaultResult<std::ops::Range<usize>> {
        let begin = start as usize;
        let end = begin + count;
        if end > items.len() {
            return Err(Fault::IllegalAddress {
                area,
                address: start,
            });
        }
        Ok(begin..end)
    }

    fn bump_events(&mut self) {
        self.event_count = self.event_count.wrapping_add(1);
    }
}

impl Default for MemoryDataPlane {
    fn default() -> Self {
        Self::new(ImageSize::default())
    }
}

impl DataPlane for MemoryDataPlane {
    fn capacity(&self, area: Area) -> usize {
        match area {
            Area::Coils => self.coils.len(),
            Area::DiscreteInputs => self.discrete_inputs.len(),
            Area::HoldingRegisters => self.holding_registers.len(),
            Area::InputRegisters => self.input_registers.len(),
        }
    }

    fn read_bits(&mut self, area: Area, start: u16, count: u16) -> FaultResult<Vec<bool>> {
        let bits = match area {
            Area::Coils => &self.coils,
            Area::DiscreteInputs => &self.discrete_inputs,
            _ => {
                return Err(Fault::IllegalAddress {
                    area,
                    address: start,
                })
            }
        };
        let range = Self::range(area, bits, start, count as usize)?;
        Ok(bits[range].to_vec())
    }

    fn read_registers(&mut self, area: Area, start: u16, count: u16) -> FaultResult<Vec<u16>> {
        let words = match area {
            Area::HoldingRegisters => &self.holding_registers,
            Area::InputRegisters => &self.input_registers,
            _ => {
                return Err(Fault::IllegalAddress {
                    area,
                    address: start,
                })
            }
        };
        let range = Self::range(area, words, start, count as usize)?;
        Ok(words[range].to_vec())
    }

    fn write_coil(&mut self, address: u16, value: bool) -> FaultResult<()> {
        let range = Self::range(Area::Coils, &self.coils, address, 1)?;
        self.coils[range.start] = value;
        self.bump_events();
        Ok(())
    }

    fn write_coils(&mut self, start: u16, values: &[bool]) -> FaultResult<()> {
        let range = Self::range(Area::Coils, &self.coils, start, values.len())?;
        self.coils[range].copy_from_slice(values);
        self.bump_events();
        Ok(())
    }

    fn write_registers(&mut self, start: u16, values: &[u16]) -> FaultResult<()> {
        let range = Self::range(
            Area::HoldingRegisters,
            &self.holding_registers,
            start,
            values.len(),
        )?;
        self.holding_registers[range].copy_from_slice(values);
        self.bump_events();
        Ok(())
    }

    fn exception_status(&mut self) -> FaultResult<u8> {
        Ok(self.exception_status)
    }

    fn comm_event_counter(&mut self) -> FaultResult<(u16, u16)> {
        // Status 0x0000: no command in progress
        Ok((0x0000, self.event_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_image() -> MemoryDataPlane {
        MemoryDataPlane::new(ImageSize {
            coils: 16,
            discrete_inputs: 16,
            holding_registers: 8,
            input_registers: 8,
        })
    }

    #[test]
    fn test_fault_exception_mapping() {
        let fault = Fault::IllegalAddress {
            area: Area::Coils,
            address: 3,
        };
        assert_eq!(fault.exception_code(), ExceptionCode::IllegalDataAddress);
        assert_eq!(
            Fault::DeviceFailure("kbus".into()).exception_code(),
            ExceptionCode::ServerFailure
        );
        assert_eq!(Fault::Busy.exception_code(), ExceptionCode::SlaveDeviceBusy);
    }

    #[test]
    fn test_register_write_and_read() {
        let mut image = small_image();
        image.write_registers(2, &[0x1111, 0x2222]).unwrap();
        assert_eq!(
            image.read_registers(Area::HoldingRegisters, 1, 3).unwrap(),
            vec![0, 0x1111, 0x2222]
        );
        assert_eq!(image.comm_event_counter().unwrap(), (0, 1));
    }

    #[test]
    fn test_out_of_range_access() {
        let mut image = small_image();
        assert!(matches!(
            image.read_registers(Area::InputRegisters, 7, 2),
            Err(Fault::IllegalAddress { .. })
        ));
        assert!(image.write_coil(16, true).is_err());
        assert!(image.read_bits(Area::HoldingRegisters, 0, 1).is_err());
        // Failed writes do not count as events
        assert_eq!(image.comm_event_counter().unwrap(), (0, 0));
    }

    #[test]
    fn test_coils_and_inputs() {
        let mut image = small_image();
        image.write_coils(0, &[true, false, true]).unwrap();
        image.write_coil(15, true).unwrap();
        image.set_discrete_inputs(4, &[true, true]).unwrap();

        assert_eq!(
            image.read_bits(Area::Coils, 0, 3).unwrap(),
            vec![true, false, true]
        );
        assert_eq!(image.read_bits(Area::Coils, 15, 1).unwrap(), vec![true]);
        assert_eq!(
            image.read_bits(Area::DiscreteInputs, 3, 3).unwrap(),
            vec![false, true, true]
        );
    }

    #[test]
    fn test_shared_data_plane_recovers_from_poison() {
        let shared = SharedDataPlane::new(small_image());
        let clone = shared.clone();
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock();
            panic!("handler failure");
        })
        .join();

        let mut guard = shared.lock();
        assert_eq!(guard.capacity(Area::HoldingRegisters), 8);
        assert!(guard.write_registers(0, &[7]).is_ok());
    }
}
