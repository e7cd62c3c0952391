//! MODBUS/TCP server
//!
//! The accept loop never waits on a connection: each accepted stream gets its
//! own [`ConnectionWorker`] task in a `JoinSet`, and finished workers are
//! reaped as the loop goes. Beyond `max_connections` live workers, new
//! connections are accepted and closed straight away.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::connection::{CloseReason, ConnectionWorker, WorkerSettings};
use crate::constants::ACCEPT_ERROR_BACKOFF;
use crate::dispatch::FunctionTable;
use crate::error::{ModbusError, ModbusResult};
use crate::stats::ModbusStatistics;

/// Keeps the active-connection gauge right even if a worker is aborted.
struct ActiveConnection(Arc<ModbusStatistics>);

impl ActiveConnection {
    fn open(stats: Arc<ModbusStatistics>) -> Self {
        stats.connection_opened();
        Self(stats)
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

/// Listening MODBUS/TCP server.
pub struct ModbusTcpServer {
    listener: TcpListener,
    table: FunctionTable,
    settings: WorkerSettings,
    max_connections: usize,
    shutdown_grace: Duration,
}

impl ModbusTcpServer {
    /// Bind and listen with `SO_REUSEADDR` and the configured backlog.
    pub fn bind(config: &ServerConfig, table: FunctionTable) -> ModbusResult<Self> {
        let addr = config.socket_addr();
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|e| ModbusError::io("creating TCP socket", e))?;

        socket
            .set_reuseaddr(true)
            .map_err(|e| ModbusError::io("setting SO_REUSEADDR", e))?;
        socket
            .bind(addr)
            .map_err(|e| ModbusError::io(format!("binding TCP {}", addr), e))?;
        let listener = socket
            .listen(config.backlog)
            .map_err(|e| ModbusError::io(format!("listening on TCP {}", addr), e))?;

        info!(
            "Modbus TCP server listening on {} (backlog {}, max {} connections)",
            addr, config.backlog, config.max_connections
        );

        Ok(Self {
            listener,
            table,
            settings: WorkerSettings::from(config),
            max_connections: config.max_connections,
            shutdown_grace: config.shutdown_grace(),
        })
    }

    /// Address actually bound, useful with port 0.
    pub fn local_addr(&self) -> ModbusResult<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ModbusError::io("reading TCP local address", e))
    }

    /// Accept connections until `cancel` fires, then drain workers.
    pub async fn run(self, cancel: CancellationToken) -> ModbusResult<()> {
        let stats = Arc::clone(self.table.stats());
        let mut workers: JoinSet<CloseReason> = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Shutdown signal received, stopping TCP accept loop");
                    break;
                }
                Some(finished) = workers.join_next(), if !workers.is_empty() => {
                    reap(finished);
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(
                                "Failed to accept connection: {}, retrying in {:?}",
                                e, ACCEPT_ERROR_BACKOFF
                            );
                            back_off(&cancel).await;
                            continue;
                        }
                    };

                    while let Some(finished) = workers.try_join_next() {
                        reap(finished);
                    }
                    if workers.len() >= self.max_connections {
                        stats.connection_rejected();
                        warn!(
                            "Rejecting connection from {}: {} connections active",
                            peer,
                            workers.len()
                        );
                        drop(stream);
                        continue;
                    }

                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                    }
                    info!("New client connected: {}", peer);

                    let active = ActiveConnection::open(Arc::clone(&stats));
                    let worker = ConnectionWorker::new(
                        stream,
                        peer,
                        self.table.clone(),
                        self.settings,
                        cancel.child_token(),
                    );
                    workers.spawn(async move {
                        let _active = active;
                        worker.run().await
                    });
                }
            }
        }

        drop(self.listener);
        drain(workers, self.shutdown_grace).await;
        Ok(())
    }
}

/// Sleep before the next `accept()`, cut short by shutdown.
async fn back_off(cancel: &CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
    }
}

fn reap(finished: Result<CloseReason, JoinError>) {
    match finished {
        Ok(reason) => debug!("Worker finished: {:?}", reason),
        Err(e) if e.is_panic() => error!("Worker panicked: {}", e),
        Err(_) => {}
    }
}

/// Wait up to `grace` for in-flight requests, then abort what is left.
async fn drain(mut workers: JoinSet<CloseReason>, grace: Duration) {
    if workers.is_empty() {
        return;
    }
    info!(
        "Waiting up to {:?} for {} connection(s) to finish",
        grace,
        workers.len()
    );

    let waited = tokio::time::timeout(grace, async {
        while let Some(finished) = workers.join_next().await {
            reap(finished);
        }
    })
    .await;

    if waited.is_err() {
        warn!("Aborting {} connection(s) after shutdown grace", workers.len());
        workers.abort_all();
        while let Some(finished) = workers.join_next().await {
            reap(finished);
        }
    }
    info!("Modbus TCP server stopped");
}
