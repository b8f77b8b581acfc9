//! Rendezvous service — the well-known endpoint where nodes register,
//! heartbeat, and fetch the live peer list.
//!
//! Each accepted connection carries any number of `Command` frames. Only
//! `request_nodes` gets a reply. A malformed command closes that connection
//! and nothing else.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

use mesh_core::config::TimingConfig;
use mesh_core::protocol::{format_peer_list, parse_peer_list};
use mesh_core::{Command, Frame, FrameCodec, FrameKind, PeerIdentity, ProtocolError};

use crate::net;
use crate::registry::MembershipRegistry;

pub struct RendezvousService {
    registry: Arc<MembershipRegistry>,
    sweep_interval: Duration,
}

impl RendezvousService {
    pub fn new(timing: &TimingConfig) -> Self {
        Self {
            registry: Arc::new(MembershipRegistry::new(timing.peer_timeout())),
            sweep_interval: timing.sweep_interval(),
        }
    }

    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        &self.registry
    }

    /// Apply one command to the registry. Returns the reply text, if the
    /// command has one.
    pub fn handle_command(&self, command: Command) -> Option<String> {
        match command {
            Command::Register(peer) => {
                if self.registry.register(peer.clone()) {
                    tracing::info!(peer = %peer, "peer registered");
                } else {
                    tracing::debug!(peer = %peer, "peer re-registered");
                }
                None
            }
            Command::Heartbeat(peer) => {
                if !self.registry.heartbeat(&peer) {
                    tracing::debug!(peer = %peer, "heartbeat from unregistered peer ignored");
                }
                None
            }
            Command::Leave(peer) => {
                if self.registry.leave(&peer) {
                    tracing::info!(peer = %peer, "peer left");
                }
                None
            }
            Command::RequestNodes => Some(format_peer_list(&self.registry.snapshot())),
        }
    }

    /// Accept control connections until shutdown.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let local = listener.local_addr().context("listener has no local address")?;
        tracing::info!(addr = %local, "rendezvous listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("rendezvous shutting down");
                    return Ok(());
                }

                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    net::tune(&stream);

                    let service = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = service.handle_connection(stream, remote).await {
                            tracing::warn!(remote = %remote, error = %e, "control connection dropped");
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        tracing::debug!(remote = %remote, "control connection opened");
        let mut framed = Framed::new(stream, FrameCodec);

        while let Some(frame) = framed.next().await {
            let frame = frame?;
            if frame.kind != FrameKind::Command {
                return Err(ProtocolError::UnexpectedFrame("non-command").into());
            }
            let command: Command = frame.text()?.parse()?;
            if let Some(reply) = self.handle_command(command) {
                framed.send(Frame::reply(reply)).await?;
            }
        }

        tracing::debug!(remote = %remote, "control connection closed");
        Ok(())
    }

    /// Periodically evict registrations older than the peer timeout.
    pub async fn sweep_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.sweep_interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => {
                    let expired = self.registry.sweep();
                    for peer in &expired {
                        tracing::info!(peer = %peer, "peer expired");
                    }
                    if !expired.is_empty() {
                        tracing::debug!(
                            removed = expired.len(),
                            remaining = self.registry.len(),
                            "expired registry entries"
                        );
                    }
                }
            }
        }
    }
}

// ── Client ───────────────────────────────────────────────────────────────────

/// A node's control connection to the rendezvous service.
pub struct RendezvousClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl RendezvousClient {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let stream = net::dial(host, port, timeout).await?;
        Ok(Self {
            framed: Framed::new(stream, FrameCodec),
        })
    }

    pub async fn send(&mut self, command: &Command) -> Result<()> {
        self.framed
            .send(Frame::command(command))
            .await
            .with_context(|| format!("failed to send {command}"))
    }

    /// Ask for the live peer list, waiting at most `timeout` for the reply.
    pub async fn request_nodes(&mut self, timeout: Duration) -> Result<Vec<PeerIdentity>> {
        self.send(&Command::RequestNodes).await?;

        let frame = tokio::time::timeout(timeout, self.framed.next())
            .await
            .context("no peer list from rendezvous")?
            .context("rendezvous closed the connection")??;
        if frame.kind != FrameKind::Reply {
            return Err(ProtocolError::UnexpectedFrame("non-reply").into());
        }
        Ok(parse_peer_list(frame.text()?)?)
    }
}

/// Bind `addr` and run the service with its sweep until shutdown.
pub async fn run(
    service: Arc<RendezvousService>,
    addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
) -> Result<()> {
    let listener = net::bind_listener(addr)?;
    let sweep = tokio::spawn(service.clone().sweep_loop(shutdown.subscribe()));
    let served = service.serve(listener, shutdown.subscribe()).await;
    sweep.abort();
    served
}
