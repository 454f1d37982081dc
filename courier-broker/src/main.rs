//! `courierd`: the Courier broker daemon.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use courier_broker::directory::directory_loop;
use courier_broker::{http, server, Broker, BrokerConfig, Result};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "courierd", version, about = "Courier broker daemon")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind for client connections.
    #[arg(long)]
    tcp_address: Option<SocketAddr>,

    /// Address to bind for the HTTP surface.
    #[arg(long)]
    http_address: Option<SocketAddr>,

    /// Address announced to directories for consumers to connect to.
    #[arg(long)]
    broadcast_address: Option<String>,

    /// Directory TCP address to peer with (repeatable).
    #[arg(long = "directory-tcp-address")]
    directory_tcp_addresses: Vec<String>,

    /// Directory for backend queue files.
    #[arg(long)]
    data_path: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<BrokerConfig> {
        let mut config = match &self.config {
            Some(path) => BrokerConfig::load(path)?,
            None => BrokerConfig::default(),
        };
        if let Some(addr) = self.tcp_address {
            config.tcp_address = addr;
        }
        if let Some(addr) = self.http_address {
            config.http_address = addr;
        }
        if let Some(addr) = self.broadcast_address {
            config.broadcast_address = addr;
        }
        if !self.directory_tcp_addresses.is_empty() {
            config.directory_tcp_addresses = self.directory_tcp_addresses;
        }
        if let Some(path) = self.data_path {
            config.data_path = path;
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Args::parse().into_config()?;
    info!(version = env!("CARGO_PKG_VERSION"), "courierd starting");

    let tcp_listener = TcpListener::bind(config.tcp_address).await?;
    let http_listener = TcpListener::bind(config.http_address).await?;

    let (broker, notify_rx) = Broker::new(config);
    let directory = tokio::spawn(directory_loop(Arc::clone(&broker), notify_rx));
    let tcp = tokio::spawn(server::serve(Arc::clone(&broker), tcp_listener));
    let http = tokio::spawn(http::serve(Arc::clone(&broker), http_listener));

    tokio::signal::ctrl_c().await?;
    info!("signal received, shutting down");
    broker.close().await;

    for (name, task) in [("tcp", tcp), ("http", http)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(listener = name, %err, "listener failed"),
            Err(err) => error!(listener = name, %err, "listener task panicked"),
        }
    }
    let _ = directory.await;
    info!("bye");
    Ok(())
}
