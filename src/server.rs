//! Combined TCP + UDP server
//!
//! Both transports share one [`FunctionTable`], so they see the same data
//! plane and count into the same statistics.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::data_plane::SharedDataPlane;
use crate::dispatch::FunctionTable;
use crate::error::{ModbusError, ModbusResult};
use crate::stats::ModbusStatistics;
use crate::tcp::ModbusTcpServer;
use crate::udp::ModbusUdpServer;

/// MODBUS/TCP and MODBUS/UDP served side by side.
pub struct ModbusServer {
    table: FunctionTable,
    tcp: Option<ModbusTcpServer>,
    udp: Option<ModbusUdpServer>,
    cancel: CancellationToken,
}

impl ModbusServer {
    /// Validate `config` and bind every enabled transport.
    ///
    /// Any bind failure is returned; nothing is retried.
    pub async fn bind(config: &ServerConfig, data_plane: SharedDataPlane) -> ModbusResult<Self> {
        config.validate()?;
        let table = FunctionTable::new(data_plane, Arc::new(ModbusStatistics::new()));

        let tcp = if config.tcp_enabled {
            Some(ModbusTcpServer::bind(config, table.clone())?)
        } else {
            None
        };
        let udp = if config.udp_enabled {
            Some(ModbusUdpServer::bind(config, table.clone()).await?)
        } else {
            None
        };

        Ok(Self {
            table,
            tcp,
            udp,
            cancel: CancellationToken::new(),
        })
    }

    /// Bound TCP address, if TCP is enabled.
    pub fn tcp_local_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|tcp| tcp.local_addr().ok())
    }

    /// Bound UDP address, if UDP is enabled.
    pub fn udp_local_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|udp| udp.local_addr().ok())
    }

    /// Statistics shared by both transports.
    pub fn stats(&self) -> Arc<ModbusStatistics> {
        Arc::clone(self.table.stats())
    }

    /// Token that stops the server when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Serve until the shutdown token is cancelled.
    ///
    /// If one transport fails, the other is stopped and the error returned.
    pub async fn run(self) -> ModbusResult<()> {
        let mut transports: JoinSet<(&'static str, ModbusResult<()>)> = JoinSet::new();
        if let Some(tcp) = self.tcp {
            let cancel = self.cancel.clone();
            transports.spawn(async move { ("TCP", tcp.run(cancel).await) });
        }
        if let Some(udp) = self.udp {
            let cancel = self.cancel.clone();
            transports.spawn(async move { ("UDP", udp.run(cancel).await) });
        }
        info!("Modbus server running");

        let mut outcome = Ok(());
        while let Some(joined) = transports.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((name, Err(e))) => {
                    error!("{} server failed: {}", name, e);
                    e
                }
                Err(e) => {
                    error!("Transport task failed: {}", e);
                    ModbusError::processing(format!("transport task failed: {}", e))
                }
            };
            self.cancel.cancel();
            if outcome.is_ok() {
                outcome = Err(failure);
            }
        }

        info!("Modbus server stopped");
        outcome
    }
}
