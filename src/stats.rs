//! Server statistics
//!
//! Lock-free counters shared by the dispatch table and both transports.
//! Request counters follow the classic Modbus diagnostic categories
//! (bad protocol, bad length, bad function, ...); transport counters track
//! connections and datagrams.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::ExceptionCode;

/// Shared counters. Cheap to update from any task or blocking thread.
#[derive(Debug)]
pub struct ModbusStatistics {
    started_at: DateTime<Utc>,

    message_counter: AtomicU64,
    bad_protocol: AtomicU64,
    bad_length: AtomicU64,
    bad_function: AtomicU64,
    bad_address: AtomicU64,
    bad_data: AtomicU64,
    too_many_registers: AtomicU64,
    too_many_bits: AtomicU64,
    slave_device_failure: AtomicU64,
    slave_device_busy: AtomicU64,

    tcp_connections_accepted: AtomicU64,
    tcp_connections_rejected: AtomicU64,
    tcp_connections_active: AtomicU64,
    udp_datagrams_received: AtomicU64,
    udp_datagrams_dropped: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

/// Point-in-time copy of [`ModbusStatistics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatisticsSnapshot {
    pub started_at: Option<DateTime<Utc>>,
    pub uptime_seconds: u64,
    pub message_counter: u64,
    pub bad_protocol: u64,
    pub bad_length: u64,
    pub bad_function: u64,
    pub bad_address: u64,
    pub bad_data: u64,
    pub too_many_registers: u64,
    pub too_many_bits: u64,
    pub slave_device_failure: u64,
    pub slave_device_busy: u64,
    pub tcp_connections_accepted: u64,
    pub tcp_connections_rejected: u64,
    pub tcp_connections_active: u64,
    pub udp_datagrams_received: u64,
    pub udp_datagrams_dropped: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl ModbusStatistics {
    /// Fresh counters, started now.
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            message_counter: AtomicU64::new(0),
            bad_protocol: AtomicU64::new(0),
            bad_length: AtomicU64::new(0),
            bad_function: AtomicU64::new(0),
            bad_address: AtomicU64::new(0),
            bad_data: AtomicU64::new(0),
            too_many_registers: AtomicU64::new(0),
            too_many_bits: AtomicU64::new(0),
            slave_device_failure: AtomicU64::new(0),
            slave_device_busy: AtomicU64::new(0),
            tcp_connections_accepted: AtomicU64::new(0),
            tcp_connections_rejected: AtomicU64::new(0),
            tcp_connections_active: AtomicU64::new(0),
            udp_datagrams_received: AtomicU64::new(0),
            udp_datagrams_dropped: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// A request reached the dispatch table.
    pub fn record_message(&self) {
        bump(&self.message_counter);
    }

    /// A header failed validation.
    pub fn record_bad_protocol(&self) {
        bump(&self.bad_protocol);
    }

    /// Request length did not match what its function requires.
    pub fn record_bad_length(&self) {
        bump(&self.bad_length);
    }

    /// More registers requested than the per-function limit.
    pub fn record_too_many_registers(&self) {
        bump(&self.too_many_registers);
    }

    /// More bits requested than the per-function limit.
    pub fn record_too_many_bits(&self) {
        bump(&self.too_many_bits);
    }

    /// Count an exception response by its code.
    pub fn record_exception(&self, code: ExceptionCode) {
        match code {
            ExceptionCode::IllegalFunction => bump(&self.bad_function),
            ExceptionCode::IllegalDataAddress => bump(&self.bad_address),
            ExceptionCode::IllegalDataValue => bump(&self.bad_data),
            ExceptionCode::ServerFailure => bump(&self.slave_device_failure),
            ExceptionCode::SlaveDeviceBusy => bump(&self.slave_device_busy),
        }
    }

    /// A TCP connection was handed to a worker.
    pub fn connection_opened(&self) {
        bump(&self.tcp_connections_accepted);
        self.tcp_connections_active.fetch_add(1, Ordering::Relaxed);
    }

    /// A TCP worker finished.
    pub fn connection_closed(&self) {
        self.tcp_connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// A TCP connection was refused because the cap was reached.
    pub fn connection_rejected(&self) {
        bump(&self.tcp_connections_rejected);
    }

    /// A datagram arrived.
    pub fn datagram_received(&self) {
        bump(&self.udp_datagrams_received);
    }

    /// A datagram was discarded without reply.
    pub fn datagram_dropped(&self) {
        bump(&self.udp_datagrams_dropped);
    }

    /// Account received bytes.
    pub fn add_bytes_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Account sent bytes.
    pub fn add_bytes_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> u64 {
        self.tcp_connections_active.load(Ordering::Relaxed)
    }

    /// Copy all counters.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let uptime = (Utc::now() - self.started_at).num_seconds().max(0) as u64;
        StatisticsSnapshot {
            started_at: Some(self.started_at),
            uptime_seconds: uptime,
            message_counter: load(&self.message_counter),
            bad_protocol: load(&self.bad_protocol),
            bad_length: load(&self.bad_length),
            bad_function: load(&self.bad_function),
            bad_address: load(&self.bad_address),
            bad_data: load(&self.bad_data),
            too_many_registers: load(&self.too_many_registers),
            too_many_bits: load(&self.too_many_bits),
            slave_device_failure: load(&self.slave_device_failure),
            slave_device_busy: load(&self.slave_device_busy),
            tcp_connections_accepted: load(&self.tcp_connections_accepted),
            tcp_connections_rejected: load(&self.tcp_connections_rejected),
            tcp_connections_active: load(&self.tcp_connections_active),
            udp_datagrams_received: load(&self.udp_datagrams_received),
            udp_datagrams_dropped: load(&self.udp_datagrams_dropped),
            bytes_received: load(&self.bytes_received),
            bytes_sent: load(&self.bytes_sent),
        }
    }
}

impl Default for ModbusStatistics {
    fn default() -> Self {
        Self::new()
    }
}
