//! `courier-directory`: the Courier discovery server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use courier_directory::{http, protocol, Directory, DirectoryConfig, Result};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "courier-directory", version, about = "Courier discovery server")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind for broker connections.
    #[arg(long)]
    tcp_address: Option<SocketAddr>,

    /// Address to bind for the HTTP query surface.
    #[arg(long)]
    http_address: Option<SocketAddr>,

    /// Address reported to identifying brokers.
    #[arg(long)]
    broadcast_address: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<DirectoryConfig> {
        let mut config = match &self.config {
            Some(path) => DirectoryConfig::load(path)?,
            None => DirectoryConfig::default(),
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
    info!(version = env!("CARGO_PKG_VERSION"), "courier-directory starting");

    let tcp_listener = TcpListener::bind(config.tcp_address).await?;
    let http_listener = TcpListener::bind(config.http_address).await?;

    let dir = Directory::new(config);
    let tcp = tokio::spawn(protocol::serve(Arc::clone(&dir), tcp_listener));
    let http = tokio::spawn(http::serve(Arc::clone(&dir), http_listener));

    tokio::signal::ctrl_c().await?;
    info!("signal received, shutting down");
    dir.close();

    for (name, task) in [("tcp", tcp), ("http", http)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(listener = name, %err, "listener failed"),
            Err(err) => error!(listener = name, %err, "listener task panicked"),
        }
    }
    info!("bye");
    Ok(())
}
