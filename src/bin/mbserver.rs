//! Standalone Modbus TCP/UDP slave
//!
//! Serves an in-memory process image until Ctrl+C or SIGTERM.
//!
//! Usage: mbserver [--config mbserver.yaml] [--port 5020] [--no-udp]

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};

use mbserver::{
    init_logging, ImageSize, LogFormat, MemoryDataPlane, ModbusServer, ServerConfig,
    SharedDataPlane,
};

/// Modbus TCP/UDP slave server
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short = 'c', long, env = "MBSERVER_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind (overrides the file)
    #[arg(short = 'b', long, env = "MBSERVER_BIND")]
    bind: Option<IpAddr>,

    /// Port for both TCP and UDP (overrides the file)
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long)]
    log_format: Option<LogFormat>,

    /// Disable MODBUS/TCP
    #[arg(long)]
    no_tcp: bool,

    /// Disable MODBUS/UDP
    #[arg(long)]
    no_udp: bool,

    /// Maximum concurrent TCP connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Trace every frame as hex
    #[arg(long)]
    packet_logging: bool,

    /// Only validate the configuration, then exit
    #[arg(long)]
    validate: bool,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        if self.no_tcp {
            config.tcp_enabled = false;
        }
        if self.no_udp {
            config.udp_enabled = false;
        }
        if let Some(max) = self.max_connections {
            config.max_connections = max;
        }
        if self.packet_logging {
            config.packet_logging = true;
        }
    }
}

/// Wait for Ctrl+C, or SIGTERM on Unix.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let term_signal = match signal(SignalKind::terminate()) {
            Ok(sig) => Some(sig),
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}. Only Ctrl+C will stop the server", e);
                None
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match term_signal {
                    Some(mut sig) => {
                        sig.recv().await;
                    }
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    args.apply(&mut config);
    config.validate().context("invalid configuration")?;

    if args.validate {
        println!("Configuration OK");
        return Ok(());
    }

    init_logging(&config.log_level, config.log_format)?;
    info!("{}", mbserver::info());

    let image = MemoryDataPlane::new(ImageSize::from(config.data_plane));
    let server = match ModbusServer::bind(&config, SharedDataPlane::new(image)).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start Modbus server on {}: {}", config.socket_addr(), e);
            std::process::exit(1);
        }
    };

    let stats = server.stats();
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("Shutdown signal received");
        shutdown.cancel();
    });

    let result = server.run().await;

    let snapshot = stats.snapshot();
    info!(
        "Served {} requests ({} TCP connections, {} UDP datagrams, {} exceptions)",
        snapshot.message_counter,
        snapshot.tcp_connections_accepted,
        snapshot.udp_datagrams_received,
        snapshot.bad_function
            + snapshot.bad_address
            + snapshot.bad_data
            + snapshot.slave_device_failure
            + snapshot.slave_device_busy
    );

    result.context("Modbus server failed")
}
