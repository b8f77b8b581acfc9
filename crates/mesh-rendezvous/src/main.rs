//! mesh-rendezvous — membership registry and peer-list service for the mesh.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mesh_core::config::MeshConfig;
use mesh_services::{rendezvous, RendezvousService};

#[derive(Parser, Debug)]
#[command(name = "mesh-rendezvous", version, about = "Mesh rendezvous service")]
struct Args {
    /// Address to bind (overrides rendezvous.bind)
    #[arg(long)]
    bind: Option<String>,

    /// TCP port (overrides rendezvous.port)
    #[arg(long, short)]
    port: Option<u16>,

    /// Seconds without a heartbeat before a peer is dropped
    #[arg(long)]
    peer_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    if let Err(e) = MeshConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = MeshConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        MeshConfig::default()
    });
    if let Some(bind) = args.bind {
        config.rendezvous.bind = bind;
    }
    if let Some(port) = args.port {
        config.rendezvous.port = port;
    }
    if let Some(secs) = args.peer_timeout {
        config.timing.peer_timeout_secs = secs;
    }

    let addr: SocketAddr = format!("{}:{}", config.rendezvous.bind, config.rendezvous.port)
        .parse()
        .context("invalid rendezvous bind address")?;
    tracing::info!(
        %addr,
        peer_timeout_secs = config.timing.peer_timeout_secs,
        sweep_interval_secs = config.timing.sweep_interval_secs,
        "mesh-rendezvous starting"
    );

    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    let service = Arc::new(RendezvousService::new(&config.timing));
    rendezvous::run(service, addr, shutdown_tx).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
