//! MODBUS/UDP end-to-end tests over loopback sockets.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use mbserver::{
    Area, DataPlane, Fault, MemoryDataPlane, ModbusServer, ModbusStatistics, ServerConfig,
    SharedDataPlane,
};

async fn start() -> (
    SocketAddr,
    SharedDataPlane,
    Arc<ModbusStatistics>,
    tokio_util::sync::CancellationToken,
) {
    start_with(SharedDataPlane::new(MemoryDataPlane::default())).await
}

async fn start_with(
    plane: SharedDataPlane,
) -> (
    SocketAddr,
    SharedDataPlane,
    Arc<ModbusStatistics>,
    tokio_util::sync::CancellationToken,
) {
    let config = ServerConfig {
        bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        tcp_enabled: false,
        ..ServerConfig::default()
    };
    let server = ModbusServer::bind(&config, plane.clone()).await.unwrap();
    let addr = server.udp_local_addr().unwrap();
    let stats = server.stats();
    let shutdown = server.shutdown_token();
    tokio::spawn(server.run());
    (addr, plane, stats, shutdown)
}

/// Memory image whose register reads blow up at address 7.
struct FaultyPlane(MemoryDataPlane);

impl DataPlane for FaultyPlane {
    fn capacity(&self, area: Area) -> usize {
        self.0.capacity(area)
    }

    fn read_bits(&mut self, area: Area, start: u16, count: u16) -> Result<Vec<bool>, Fault> {
        self.0.read_bits(area, start, count)
    }

    fn read_registers(&mut self, area: Area, start: u16, count: u16) -> Result<Vec<u16>, Fault> {
        if start == 7 {
            panic!("register backend crashed");
        }
        self.0.read_registers(area, start, count)
    }

    fn write_coil(&mut self, address: u16, value: bool) -> Result<(), Fault> {
        self.0.write_coil(address, value)
    }

    fn write_coils(&mut self, start: u16, values: &[bool]) -> Result<(), Fault> {
        self.0.write_coils(start, values)
    }

    fn write_registers(&mut self, start: u16, values: &[u16]) -> Result<(), Fault> {
        self.0.write_registers(start, values)
    }

    fn comm_event_counter(&mut self) -> Result<(u16, u16), Fault> {
        self.0.comm_event_counter()
    }
}

async fn client(server: SocketAddr) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.connect(server).await.unwrap();
    socket
}

/// Receive one datagram, or `None` if nothing arrives within `wait`.
async fn recv(socket: &UdpSocket, wait: Duration) -> Option<Vec<u8>> {
    let mut buf = [0u8; 1500];
    match timeout(wait, socket.recv(&mut buf)).await {
        Ok(Ok(n)) => Some(buf[..n].to_vec()),
        _ => None,
    }
}

const READ_TWO: [u8; 12] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x02];

#[tokio::test]
async fn test_read_over_udp() {
    let (addr, plane, _stats, shutdown) = start().await;
    plane.lock().write_registers(0, &[0x1234, 0x5678]).unwrap();

    let socket = client(addr).await;
    socket.send(&READ_TWO).await.unwrap();
    let response = recv(&socket, Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        response,
        [0x00, 0x01, 0x00, 0x00, 0x00, 0x07, 0x01, 0x03, 0x04, 0x12, 0x34, 0x56, 0x78]
    );

    shutdown.cancel();
}

#[tokio::test]
async fn test_short_datagram_dropped_then_served() {
    let (addr, _plane, stats, shutdown) = start().await;
    let socket = client(addr).await;

    socket.send(&[0x00, 0x01, 0x00, 0x00]).await.unwrap();
    assert!(recv(&socket, Duration::from_millis(200)).await.is_none());

    socket.send(&READ_TWO).await.unwrap();
    let response = recv(&socket, Duration::from_secs(5)).await.unwrap();
    assert_eq!(response.len(), 13);
    assert_eq!(&response[..2], &[0x00, 0x01]);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.udp_datagrams_received, 2);
    assert_eq!(snapshot.udp_datagrams_dropped, 1);
    shutdown.cancel();
}

#[tokio::test]
async fn test_length_mismatch_dropped() {
    let (addr, _plane, stats, shutdown) = start().await;
    let socket = client(addr).await;

    // Length says 6 but one byte is missing
    socket.send(&READ_TWO[..11]).await.unwrap();
    assert!(recv(&socket, Duration::from_millis(200)).await.is_none());

    // Trailing garbage is dropped too
    let mut padded = READ_TWO.to_vec();
    padded.push(0xFF);
    socket.send(&padded).await.unwrap();
    assert!(recv(&socket, Duration::from_millis(200)).await.is_none());

    assert_eq!(stats.snapshot().bad_length, 2);
    shutdown.cancel();
}

#[tokio::test]
async fn test_bad_protocol_id_dropped() {
    let (addr, _plane, stats, shutdown) = start().await;
    let socket = client(addr).await;

    let mut request = READ_TWO;
    request[3] = 0x01;
    socket.send(&request).await.unwrap();
    assert!(recv(&socket, Duration::from_millis(200)).await.is_none());
    assert_eq!(stats.snapshot().bad_protocol, 1);

    shutdown.cancel();
}

#[tokio::test]
async fn test_exception_over_udp() {
    let (addr, _plane, _stats, shutdown) = start().await;
    let socket = client(addr).await;

    socket
        .send(&[0x12, 0x34, 0x00, 0x00, 0x00, 0x02, 0x09, 0x99])
        .await
        .unwrap();
    let response = recv(&socket, Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        response,
        [0x12, 0x34, 0x00, 0x00, 0x00, 0x03, 0x09, 0xD9, 0x01]
    );

    // The next reply is sized for its own request
    socket.send(&READ_TWO).await.unwrap();
    let response = recv(&socket, Duration::from_secs(5)).await.unwrap();
    assert_eq!(response.len(), 13);

    shutdown.cancel();
}

#[tokio::test]
async fn test_handler_panic_answers_server_failure() {
    let mut image = MemoryDataPlane::default();
    image.write_registers(0, &[0x2222]).unwrap();
    let (addr, _plane, stats, shutdown) =
        start_with(SharedDataPlane::new(FaultyPlane(image))).await;
    let socket = client(addr).await;

    socket
        .send(&[0x00, 0x09, 0x00, 0x00, 0x00, 0x06, 0x05, 0x03, 0x00, 0x07, 0x00, 0x01])
        .await
        .unwrap();
    let response = recv(&socket, Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        response,
        [0x00, 0x09, 0x00, 0x00, 0x00, 0x03, 0x05, 0x83, 0x04]
    );
    assert_eq!(stats.snapshot().slave_device_failure, 1);

    // The loop keeps serving after the crash
    socket
        .send(&[0x00, 0x0A, 0x00, 0x00, 0x00, 0x06, 0x05, 0x03, 0x00, 0x00, 0x00, 0x01])
        .await
        .unwrap();
    let response = recv(&socket, Duration::from_secs(5)).await.unwrap();
    assert_eq!(
        response,
        [0x00, 0x0A, 0x00, 0x00, 0x00, 0x05, 0x05, 0x03, 0x02, 0x22, 0x22]
    );

    shutdown.cancel();
}
