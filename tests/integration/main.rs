//! Mesh integration test harness.
//!
//! Each test runs its own rendezvous service and nodes in-process on
//! loopback, every socket on an OS-assigned port and every workspace under
//! a fresh temp directory, so tests run in parallel without stepping on
//! each other.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::broadcast;

use mesh_core::config::{MeshConfig, TimingConfig};
use mesh_services::{net, Node, RendezvousService};

mod gossip;
mod membership;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

/// How long any eventual condition may take before a test fails.
pub const SETTLE: Duration = Duration::from_secs(10);

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// A fresh directory under the system temp dir.
pub fn temp_dir(tag: &str) -> PathBuf {
    let id = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("mesh-it-{tag}-{}-{id}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

/// A rendezvous service on 127.0.0.1. Stops when dropped.
pub struct Rendezvous {
    pub service: Arc<RendezvousService>,
    pub port: u16,
    shutdown: broadcast::Sender<()>,
}

impl Drop for Rendezvous {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

pub async fn start_rendezvous(timing: TimingConfig) -> Rendezvous {
    let service = Arc::new(RendezvousService::new(&timing));
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let listener = net::bind_listener(addr).expect("bind rendezvous");
    let port = listener.local_addr().unwrap().port();
    let (shutdown, _) = broadcast::channel(1);

    tokio::spawn(service.clone().serve(listener, shutdown.subscribe()));
    tokio::spawn(service.clone().sweep_loop(shutdown.subscribe()));

    Rendezvous {
        service,
        port,
        shutdown,
    }
}

/// Node config pointing at `rendezvous_port`, advertising 127.0.0.1.
pub fn node_config(rendezvous_port: u16) -> MeshConfig {
    let mut config = MeshConfig::default();
    config.rendezvous.host = "127.0.0.1".into();
    config.rendezvous.port = rendezvous_port;
    config.node.advertise_host = "127.0.0.1".into();
    config.node.workspace_root = temp_dir("node");
    config.timing.ready_timeout_ms = 2_000;
    config
}

/// A node that joins through `rendezvous`.
pub async fn start_node(rendezvous: &Rendezvous) -> Arc<Node> {
    Node::start(node_config(rendezvous.port))
        .await
        .expect("node start")
}

/// A node that only listens. Wire it up with `connect`.
pub async fn lone_node() -> Arc<Node> {
    // No rendezvous is ever contacted, so the port is irrelevant.
    Node::listen(node_config(1)).await.expect("node listen")
}

/// `from` dials `to`; returns once `to` has adopted the connection.
pub async fn connect(from: &Arc<Node>, to: &Arc<Node>) {
    let before = to.connections().len();
    from.dial(to.me()).await.expect("dial");
    wait_until("inbound connection adopted", || to.connections().len() > before)
        .await
        .unwrap();
}

/// Poll `condition` until it holds or `SETTLE` passes.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + SETTLE;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if condition() {
        return Ok(());
    }
    bail!("timed out waiting for: {what}")
}

pub fn shutdown_all(nodes: &[Arc<Node>]) {
    for node in nodes {
        node.shutdown();
    }
}
