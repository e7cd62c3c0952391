//! TCP connection worker
//!
//! One worker owns one accepted stream and serves requests on it strictly in
//! order:
//!
//! ```text
//! AwaitHeader -> AwaitBody -> Dispatch -> Respond -> AwaitHeader
//!      |             |           |           |
//!      +-------------+-----------+-----------+----> Closed
//! ```
//!
//! A short header read is tolerated up to `max_invalid_headers` times in a row.
//! A structurally bad header (protocol id, length) closes the connection
//! without a reply. An incomplete body gets an ILLEGAL_DATA_VALUE exception
//! before the close.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::constants::*;
use crate::dispatch::FunctionTable;
use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::logging::log_packet;
use crate::protocol::{validate_header, ExceptionCode};

/// Per-connection limits, taken from [`ServerConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub idle_timeout: Duration,
    pub body_timeout: Duration,
    pub max_invalid_headers: u32,
    pub packet_logging: bool,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            body_timeout: DEFAULT_BODY_TIMEOUT,
            max_invalid_headers: MAX_INVALID_HEADERS,
            packet_logging: false,
        }
    }
}

impl From<&ServerConfig> for WorkerSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            body_timeout: config.body_timeout(),
            max_invalid_headers: config.max_invalid_headers,
            packet_logging: config.packet_logging,
        }
    }
}

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its side.
    PeerClosed,
    /// No request started within the idle timeout.
    IdleTimeout,
    /// Too many short header reads in a row.
    TooManyInvalidHeaders,
    /// Header failed validation.
    BadHeader(ProtocolError),
    /// Length field too small to hold unit id and function code.
    LengthTooSmall(u16),
    /// Body did not arrive in full before the timeout or EOF.
    IncompleteBody,
    /// The dispatch table could not build a response.
    DispatchFailed,
    /// Socket read failure.
    ReadFailed(String),
    /// Socket write failure.
    WriteFailed(String),
    /// Server is shutting down.
    Shutdown,
}

/// Worker state.
#[derive(Debug)]
enum State {
    AwaitHeader,
    AwaitBody { length: u16 },
    Dispatch,
    Respond { len: usize },
    /// Best-effort reply (an exception already in the frame), then close.
    RespondAndClose { len: usize, reason: CloseReason },
    Closed(CloseReason),
}

/// Serves Modbus requests on one stream until it closes.
pub struct ConnectionWorker<S> {
    stream: S,
    peer: SocketAddr,
    table: FunctionTable,
    settings: WorkerSettings,
    cancel: CancellationToken,
    invalid_headers: u32,
}

impl<S> ConnectionWorker<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: S,
        peer: SocketAddr,
        table: FunctionTable,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            peer,
            table,
            settings,
            cancel,
            invalid_headers: 0,
        }
    }

    /// Run the request loop; returns once the connection is closed.
    pub async fn run(mut self) -> CloseReason {
        debug!("Worker started for {}", self.peer);
        let mut frame = Frame::new();
        let mut state = State::AwaitHeader;

        loop {
            state = match state {
                State::AwaitHeader => self.await_header(&mut frame).await,
                State::AwaitBody { length } => self.await_body(&mut frame, length).await,
                State::Dispatch => {
                    let (returned, next) = self.dispatch(frame).await;
                    frame = returned;
                    next
                }
                State::Respond { len } => match self.send(&frame, len).await {
                    Ok(()) => State::AwaitHeader,
                    Err(reason) => State::Closed(reason),
                },
                State::RespondAndClose { len, reason } => {
                    if let Err(write_error) = self.send(&frame, len).await {
                        debug!("Final reply to {} not delivered: {:?}", self.peer, write_error);
                    }
                    State::Closed(reason)
                }
                State::Closed(reason) => {
                    let _ = self.stream.shutdown().await;
                    match &reason {
                        CloseReason::PeerClosed | CloseReason::Shutdown => {
                            debug!("Connection {} closed: {:?}", self.peer, reason)
                        }
                        _ => info!("Connection {} closed: {:?}", self.peer, reason),
                    }
                    return reason;
                }
            };
        }
    }

    async fn await_header(&mut self, frame: &mut Frame) -> State {
        frame.clear();
        let idle = self.settings.idle_timeout;
        let read = tokio::select! {
            _ = self.cancel.cancelled() => return State::Closed(CloseReason::Shutdown),
            read = timeout(idle, self.stream.read(&mut frame.buffer_mut()[..LENGTH_TO_UNIT_ID])) => read,
        };

        let n = match read {
            Err(_) => {
                debug!("No request from {} within {:?}", self.peer, idle);
                return State::Closed(CloseReason::IdleTimeout);
            }
            Ok(Err(e)) => return State::Closed(CloseReason::ReadFailed(e.to_string())),
            Ok(Ok(0)) => return State::Closed(CloseReason::PeerClosed),
            Ok(Ok(n)) => n,
        };

        if n < LENGTH_TO_UNIT_ID {
            self.invalid_headers += 1;
            warn!(
                "Short header from {} ({} bytes, {} in a row)",
                self.peer, n, self.invalid_headers
            );
            if self.invalid_headers > self.settings.max_invalid_headers {
                return State::Closed(CloseReason::TooManyInvalidHeaders);
            }
            return State::AwaitHeader;
        }
        self.invalid_headers = 0;

        let mut prefix = [0u8; LENGTH_TO_UNIT_ID];
        prefix.copy_from_slice(&frame.buffer_mut()[..LENGTH_TO_UNIT_ID]);
        match validate_header(&prefix) {
            Ok(length) if length < MIN_LENGTH_FIELD => {
                self.table.stats().record_bad_protocol();
                warn!("Length field {} from {} too small", length, self.peer);
                State::Closed(CloseReason::LengthTooSmall(length))
            }
            Ok(length) => {
                // Record the six bytes read so far; the body is appended after them
                if frame.set_len(LENGTH_TO_UNIT_ID).is_err() {
                    return State::Closed(CloseReason::DispatchFailed);
                }
                State::AwaitBody { length }
            }
            Err(e) => {
                self.table.stats().record_bad_protocol();
                warn!("Invalid Modbus header from {}: {}", self.peer, e);
                State::Closed(CloseReason::BadHeader(e))
            }
        }
    }

    async fn await_body(&mut self, frame: &mut Frame, length: u16) -> State {
        let wanted = length as usize;
        let mut filled = 0usize;
        let body_timeout = self.settings.body_timeout;

        let read = {
            let buffer = &mut frame.buffer_mut()[LENGTH_TO_UNIT_ID..LENGTH_TO_UNIT_ID + wanted];
            let stream = &mut self.stream;
            let filled = &mut filled;
            timeout(body_timeout, async move {
                while *filled < buffer.len() {
                    let n = stream.read(&mut buffer[*filled..]).await?;
                    if n == 0 {
                        break;
                    }
                    *filled += n;
                }
                Ok::<(), std::io::Error>(())
            })
            .await
        };

        let total = LENGTH_TO_UNIT_ID + filled;
        if frame.set_len(total).is_err() {
            return State::Closed(CloseReason::DispatchFailed);
        }
        self.table.stats().add_bytes_received(total);

        match read {
            Ok(Ok(())) if filled == wanted => {
                if self.settings.packet_logging {
                    log_packet("RX", "TCP", frame.as_slice());
                }
                State::Dispatch
            }
            Ok(Err(e)) => State::Closed(CloseReason::ReadFailed(e.to_string())),
            outcome => {
                if outcome.is_err() {
                    warn!(
                        "Body from {} incomplete after {:?}: {} of {} bytes",
                        self.peer, body_timeout, filled, wanted
                    );
                } else {
                    warn!(
                        "Body from {} cut short: {} of {} bytes",
                        self.peer, filled, wanted
                    );
                }
                self.table
                    .stats()
                    .record_exception(ExceptionCode::IllegalDataValue);
                let len = frame.set_exception(ExceptionCode::IllegalDataValue);
                State::RespondAndClose {
                    len,
                    reason: CloseReason::IncompleteBody,
                }
            }
        }
    }

    /// Run the handler on a blocking thread; the frame travels there and back.
    async fn dispatch(&mut self, mut frame: Frame) -> (Frame, State) {
        let mut request_header = [0u8; MODBUS_HEADER_LENGTH];
        request_header.copy_from_slice(&frame.as_slice()[..MODBUS_HEADER_LENGTH]);

        let table = self.table.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let result = table.dispatch(&mut frame);
            (frame, result)
        })
        .await;

        match joined {
            Ok((frame, Ok(len))) => (frame, State::Respond { len }),
            Ok((mut frame, Err(e))) => {
                error!("Dispatch failed for {}: {}", self.peer, e);
                if frame.load(&request_header).is_err() {
                    return (frame, State::Closed(CloseReason::DispatchFailed));
                }
                let len = self.server_failure(&mut frame);
                (
                    frame,
                    State::RespondAndClose {
                        len,
                        reason: CloseReason::DispatchFailed,
                    },
                )
            }
            Err(join_error) => {
                error!("Handler for {} panicked: {}", self.peer, join_error);
                match Frame::from_slice(&request_header) {
                    Ok(mut frame) => {
                        let len = self.server_failure(&mut frame);
                        (
                            frame,
                            State::RespondAndClose {
                                len,
                                reason: CloseReason::DispatchFailed,
                            },
                        )
                    }
                    Err(_) => (Frame::new(), State::Closed(CloseReason::DispatchFailed)),
                }
            }
        }
    }

    fn server_failure(&self, frame: &mut Frame) -> usize {
        self.table
            .stats()
            .record_exception(ExceptionCode::ServerFailure);
        frame.set_exception(ExceptionCode::ServerFailure)
    }

    async fn send(&mut self, frame: &Frame, len: usize) -> Result<(), CloseReason> {
        let bytes = &frame.as_slice()[..len.min(frame.len())];
        if self.settings.packet_logging {
            log_packet("TX", "TCP", bytes);
        }
        if let Err(e) = self.stream.write_all(bytes).await {
            warn!("Write to {} failed: {}", self.peer, e);
            return Err(CloseReason::WriteFailed(e.to_string()));
        }
        if let Err(e) = self.stream.flush().await {
            return Err(CloseReason::WriteFailed(e.to_string()));
        }
        self.table.stats().add_bytes_sent(bytes.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_plane::{MemoryDataPlane, SharedDataPlane};
    use crate::stats::ModbusStatistics;
    use std::sync::Arc;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    fn peer() -> SocketAddr {
        "127.0.0.1:50200".parse().unwrap()
    }

    fn table() -> FunctionTable {
        let mut image = MemoryDataPlane::default();
        image.set_input_registers(0, &[0x1234, 0x5678]).unwrap();
        FunctionTable::new(
            SharedDataPlane::new(image),
            Arc::new(ModbusStatistics::new()),
        )
    }

    fn spawn_worker(
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> (DuplexStream, JoinHandle<CloseReason>, FunctionTable) {
        let (client, server) = duplex(4096);
        let table = table();
        let worker = ConnectionWorker::new(server, peer(), table.clone(), settings, cancel);
        (client, tokio::spawn(worker.run()), table)
    }

    const READ_INPUTS: [u8; 12] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x04, 0x00, 0x00, 0x00, 0x02];

    #[tokio::test]
    async fn test_serves_sequential_requests() {
        let (mut client, handle, table) =
            spawn_worker(WorkerSettings::default(), CancellationToken::new());

        for _ in 0..3 {
            client.write_all(&READ_INPUTS).await.unwrap();
            let mut response = [0u8; 13];
            client.read_exact(&mut response).await.unwrap();
            assert_eq!(
                response,
                [0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x04, 0x04, 0x12, 0x34, 0x56, 0x78]
            );
        }

        drop(client);
        assert_eq!(handle.await.unwrap(), CloseReason::PeerClosed);
        assert_eq!(table.stats().snapshot().message_counter, 3);
    }

    #[tokio::test]
    async fn test_scripted_exchange() {
        let stream = tokio_test::io::Builder::new()
            .read(&READ_INPUTS)
            .write(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x04, 0x04, 0x12, 0x34, 0x56, 0x78])
            .read(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x02, 0x01, 0x07])
            .write(&[0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x01, 0x07, 0x00])
            .build();

        let worker = ConnectionWorker::new(
            stream,
            peer(),
            table(),
            WorkerSettings::default(),
            CancellationToken::new(),
        );
        assert_eq!(worker.run().await, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_bad_protocol_id_closes_without_reply() {
        let (mut client, handle, table) =
            spawn_worker(WorkerSettings::default(), CancellationToken::new());

        client
            .write_all(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
            .await
            .unwrap();

        assert_eq!(
            handle.await.unwrap(),
            CloseReason::BadHeader(ProtocolError::NonZeroProtocolId(1))
        );
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(table.stats().snapshot().bad_protocol, 1);
    }

    #[tokio::test]
    async fn test_length_too_large_closes() {
        let (mut client, handle, _table) =
            spawn_worker(WorkerSettings::default(), CancellationToken::new());
        client
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x01, 0x00])
            .await
            .unwrap();
        assert_eq!(
            handle.await.unwrap(),
            CloseReason::BadHeader(ProtocolError::LengthTooLarge(256))
        );
    }

    #[tokio::test]
    async fn test_length_too_small_closes() {
        let (mut client, handle, _table) =
            spawn_worker(WorkerSettings::default(), CancellationToken::new());
        client
            .write_all(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01])
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), CloseReason::LengthTooSmall(1));
    }

    #[tokio::test]
    async fn test_incomplete_body_gets_exception() {
        let settings = WorkerSettings {
            body_timeout: Duration::from_millis(50),
            ..WorkerSettings::default()
        };
        let (mut client, handle, _table) = spawn_worker(settings, CancellationToken::new());

        // Header announces 6 bytes, only unit id and function code follow
        client
            .write_all(&[0x00, 0x2A, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03])
            .await
            .unwrap();

        let mut response = [0u8; 9];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(
            response,
            [0x00, 0x2A, 0x00, 0x00, 0x00, 0x03, 0x11, 0x83, 0x03]
        );
        assert_eq!(handle.await.unwrap(), CloseReason::IncompleteBody);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let settings = WorkerSettings {
            idle_timeout: Duration::from_millis(50),
            ..WorkerSettings::default()
        };
        let (mut client, handle, _table) = spawn_worker(settings, CancellationToken::new());

        assert_eq!(handle.await.unwrap(), CloseReason::IdleTimeout);
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_short_headers_tolerated_until_limit() {
        let settings = WorkerSettings {
            max_invalid_headers: 2,
            ..WorkerSettings::default()
        };
        let (mut client, handle, _table) = spawn_worker(settings, CancellationToken::new());

        for _ in 0..3 {
            client.write_all(&[0x00, 0x01, 0x00]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.await.unwrap(), CloseReason::TooManyInvalidHeaders);
    }

    #[tokio::test]
    async fn test_short_header_then_valid_request() {
        let (mut client, handle, _table) =
            spawn_worker(WorkerSettings::default(), CancellationToken::new());

        client.write_all(&[0x00, 0x01]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(&READ_INPUTS).await.unwrap();

        let mut response = [0u8; 13];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[7], 0x04);

        drop(client);
        assert_eq!(handle.await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_cancellation_closes_idle_worker() {
        let cancel = CancellationToken::new();
        let (_client, handle, _table) = spawn_worker(WorkerSettings::default(), cancel.clone());

        cancel.cancel();
        assert_eq!(handle.await.unwrap(), CloseReason::Shutdown);
    }
}
