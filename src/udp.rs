//! MODBUS/UDP server
//!
//! One datagram is one request. Datagrams are served strictly one after the
//! other from a single loop. Malformed datagrams are dropped without any
//! reply, unlike TCP where an incomplete body is answered with an exception.

use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::constants::*;
use crate::dispatch::FunctionTable;
use crate::error::{ModbusError, ModbusResult, ProtocolError};
use crate::frame::Frame;
use crate::logging::log_packet;
use crate::protocol::{validate_header_prefix, ExceptionCode};

/// Why a datagram was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Fewer than six bytes.
    TooShort(usize),
    /// Header failed validation.
    BadHeader(ProtocolError),
    /// Length field below unit id + function code.
    LengthTooSmall(u16),
    /// Datagram size disagrees with the length field.
    LengthMismatch { received: usize, declared: u16 },
}

/// Decide whether a received datagram is a complete request.
pub fn check_datagram(bytes: &[u8]) -> Result<(), DropReason> {
    let length = match validate_header_prefix(bytes) {
        None => return Err(DropReason::TooShort(bytes.len())),
        Some(Err(e)) => return Err(DropReason::BadHeader(e)),
        Some(Ok(length)) => length,
    };
    if length < MIN_LENGTH_FIELD {
        return Err(DropReason::LengthTooSmall(length));
    }
    if bytes.len() != LENGTH_TO_UNIT_ID + length as usize {
        return Err(DropReason::LengthMismatch {
            received: bytes.len(),
            declared: length,
        });
    }
    Ok(())
}

/// Bound MODBUS/UDP server.
pub struct ModbusUdpServer {
    socket: UdpSocket,
    table: FunctionTable,
    buffer_size: usize,
    packet_logging: bool,
}

impl ModbusUdpServer {
    /// Bind the datagram socket.
    pub async fn bind(config: &ServerConfig, table: FunctionTable) -> ModbusResult<Self> {
        let addr = config.socket_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| ModbusError::io(format!("binding UDP {}", addr), e))?;
        info!("Modbus UDP server listening on {}", addr);

        Ok(Self {
            socket,
            table,
            buffer_size: config.udp_buffer_size.min(MAX_MB_BUFFER_SIZE),
            packet_logging: config.packet_logging,
        })
    }

    /// Address actually bound.
    pub fn local_addr(&self) -> ModbusResult<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|e| ModbusError::io("reading UDP local address", e))
    }

    /// Serve datagrams until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> ModbusResult<()> {
        let mut frame = Frame::new();

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = self.socket.recv_from(&mut frame.buffer_mut()[..self.buffer_size]) => received,
            };

            let (n, peer) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    // e.g. ICMP port unreachable from an earlier reply
                    warn!("UDP receive failed: {}", e);
                    continue;
                }
            };

            frame.set_len(n)?;
            let (returned, reply) = self.handle_datagram(frame, peer).await;
            frame = returned;

            if let Some(len) = reply {
                self.reply(&frame, len, peer).await;
            }
        }

        info!("Modbus UDP server stopped");
        Ok(())
    }

    /// Validate and dispatch one datagram already loaded into `frame`.
    ///
    /// Returns the frame and the response length, or `None` when the datagram
    /// is dropped.
    async fn handle_datagram(&self, mut frame: Frame, peer: SocketAddr) -> (Frame, Option<usize>) {
        let stats = self.table.stats();
        stats.datagram_received();
        stats.add_bytes_received(frame.len());
        if self.packet_logging {
            log_packet("RX", "UDP", frame.as_slice());
        }

        if let Err(reason) = check_datagram(frame.as_slice()) {
            match reason {
                DropReason::BadHeader(_) | DropReason::LengthTooSmall(_) => {
                    stats.record_bad_protocol()
                }
                DropReason::LengthMismatch { .. } => stats.record_bad_length(),
                DropReason::TooShort(_) => {}
            }
            debug!("Dropping datagram from {}: {:?}", peer, reason);
            stats.datagram_dropped();
            return (frame, None);
        }

        let mut request_header = [0u8; MODBUS_HEADER_LENGTH];
        request_header.copy_from_slice(&frame.as_slice()[..MODBUS_HEADER_LENGTH]);

        let table = self.table.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = table.dispatch(&mut frame);
            (frame, result)
        })
        .await;

        let (mut frame, failure) = match joined {
            Ok((frame, Ok(len))) => return (frame, Some(len)),
            Ok((frame, Err(e))) => (frame, e.to_string()),
            Err(join_error) => (Frame::new(), join_error.to_string()),
        };

        error!("Dispatch failed for datagram from {}: {}", peer, failure);
        if frame.load(&request_header).is_err() {
            return (frame, None);
        }
        stats.record_exception(ExceptionCode::ServerFailure);
        let len = frame.set_exception(ExceptionCode::ServerFailure);
        (frame, Some(len))
    }

    async fn reply(&self, frame: &Frame, len: usize, peer: SocketAddr) {
        let bytes = &frame.as_slice()[..len.min(frame.len())];
        if self.packet_logging {
            log_packet("TX", "UDP", bytes);
        }
        match self.socket.send_to(bytes, peer).await {
            Ok(sent) => self.table.stats().add_bytes_sent(sent),
            Err(e) => warn!("UDP send to {} failed: {}", peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_datagram_accepts_complete_request() {
        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        assert_eq!(check_datagram(&request), Ok(()));
    }

    #[test]
    fn test_check_datagram_too_short() {
        assert_eq!(
            check_datagram(&[0x00, 0x01, 0x00, 0x00]),
            Err(DropReason::TooShort(4))
        );
    }

    #[test]
    fn test_check_datagram_length_mismatch() {
        // Header says 6, only 5 follow
        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00];
        assert_eq!(
            check_datagram(&request),
            Err(DropReason::LengthMismatch {
                received: 11,
                declared: 6
            })
        );
    }

    #[test]
    fn test_check_datagram_bad_header() {
        let request = [0x00, 0x01, 0xAB, 0xCD, 0x00, 0x02, 0x01, 0x07];
        assert_eq!(
            check_datagram(&request),
            Err(DropReason::BadHeader(ProtocolError::NonZeroProtocolId(0xABCD)))
        );
        assert_eq!(
            check_datagram(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01]),
            Err(DropReason::LengthTooSmall(1))
        );
    }
}
