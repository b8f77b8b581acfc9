//! Peer connection manager — one mesh node.
//!
//! Owns the listening socket, the set of live mesh connections, and one
//! receive task per connection that routes frames to the gossip and
//! transfer engines. Joins the mesh through the rendezvous service and,
//! while joined, keeps its registration alive with heartbeats.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use futures::future::join_all;
use futures::StreamExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::FramedRead;

use mesh_core::config::MeshConfig;
use mesh_core::message::mint_file_id;
use mesh_core::{Command, Frame, FrameCodec, FrameKind, GossipMessage, PeerIdentity, ProtocolError};

use crate::connection::{ConnectionSet, Direction, MeshConnection};
use crate::file_store::FileStore;
use crate::gossip::GossipEngine;
use crate::inbox::Inbox;
use crate::net;
use crate::rendezvous::RendezvousClient;
use crate::transfer::{InboundSession, TargetReport, TransferEngine};

pub struct Node {
    me: PeerIdentity,
    config: MeshConfig,
    connections: ConnectionSet,
    gossip: GossipEngine,
    transfer: Arc<TransferEngine>,
    inbox: Inbox,
    shutdown: broadcast::Sender<()>,
}

impl Node {
    /// Bind the mesh listener and start accepting. Does not contact the
    /// rendezvous service.
    pub async fn listen(config: MeshConfig) -> Result<Arc<Self>> {
        let bind = SocketAddr::from(([0, 0, 0, 0], config.node.listen_port));
        let listener = net::bind_listener(bind).context("failed to bind mesh listener")?;
        let port = listener.local_addr()?.port();

        let me = PeerIdentity::new(config.node.resolved_host(), port);
        let store = FileStore::new(config.node.workspace_dir(&me))?;
        tracing::info!(identity = %me, workspace = %store.root().display(), "node listening");

        let connections = ConnectionSet::new();
        let inbox = Inbox::with_history(config.gossip.inbox_history);
        let gossip = GossipEngine::new(me.clone(), connections.clone(), inbox.clone(), &config.gossip);
        let transfer = Arc::new(TransferEngine::new(
            me.clone(),
            connections.clone(),
            store,
            &config,
        ));
        let (shutdown, _) = broadcast::channel(1);

        let node = Arc::new(Self {
            me,
            config,
            connections,
            gossip,
            transfer,
            inbox,
            shutdown,
        });
        tokio::spawn(node.clone().accept_loop(listener, node.shutdown.subscribe()));
        Ok(node)
    }

    /// Listen, register with the rendezvous service, dial the returned
    /// peers, and start heartbeating if joining.
    pub async fn start(config: MeshConfig) -> Result<Arc<Self>> {
        let node = Self::listen(config).await?;
        let (control, peers) = node.discover().await.context("rendezvous discovery failed")?;
        let connected = node.connect_to_peers(&peers).await;
        tracing::info!(
            discovered = peers.len(),
            connected,
            joined = node.config.node.join_bootstrap,
            "mesh joined"
        );

        if let Some(control) = control {
            tokio::spawn(
                node.clone()
                    .heartbeat_loop(Some(control), node.shutdown.subscribe()),
            );
        }
        Ok(node)
    }

    pub fn me(&self) -> &PeerIdentity {
        &self.me
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn gossip(&self) -> &GossipEngine {
        &self.gossip
    }

    pub fn transfer(&self) -> &Arc<TransferEngine> {
        &self.transfer
    }

    // ── Rendezvous ───────────────────────────────────────────────────────────

    async fn rendezvous(&self) -> Result<RendezvousClient> {
        let r = &self.config.rendezvous;
        RendezvousClient::connect(&r.host, r.port, self.config.timing.ready_timeout()).await
    }

    /// Register, fetch the peer list, and leave again unless joining.
    ///
    /// Returns the control connection to heartbeat on (only when joining)
    /// and every listed peer except this node.
    pub async fn discover(&self) -> Result<(Option<RendezvousClient>, Vec<PeerIdentity>)> {
        let mut client = self.rendezvous().await?;
        client.send(&Command::Register(self.me.clone())).await?;
        let mut peers = client.request_nodes(self.config.timing.ready_timeout()).await?;
        peers.retain(|p| p != &self.me);

        if self.config.node.join_bootstrap {
            Ok((Some(client), peers))
        } else {
            client.send(&Command::Leave(self.me.clone())).await?;
            Ok((None, peers))
        }
    }

    /// Ask the rendezvous service to drop this node.
    pub async fn leave(&self) -> Result<()> {
        let mut client = self.rendezvous().await?;
        client.send(&Command::Leave(self.me.clone())).await
    }

    /// Keep the registration fresh until shutdown.
    pub async fn heartbeat_loop(
        self: Arc<Self>,
        mut control: Option<RendezvousClient>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let period = self.config.timing.heartbeat_interval();
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = interval.tick() => self.heartbeat_once(&mut control).await,
            }
        }
    }

    /// One heartbeat tick. A dropped control connection is redialed and the
    /// node registers afresh, since its entry has likely expired.
    pub async fn heartbeat_once(&self, control: &mut Option<RendezvousClient>) {
        let redialed = control.is_none();
        if redialed {
            match self.rendezvous().await {
                Ok(client) => *control = Some(client),
                Err(e) => {
                    tracing::warn!(error = %e, "rendezvous unreachable, heartbeat skipped");
                    return;
                }
            }
        }
        let Some(client) = control.as_mut() else {
            return;
        };

        let command = if redialed {
            Command::Register(self.me.clone())
        } else {
            Command::Heartbeat(self.me.clone())
        };
        match client.send(&command).await {
            Ok(()) if redialed => tracing::info!(identity = %self.me, "re-registered with rendezvous"),
            Ok(()) => tracing::trace!("heartbeat sent"),
            Err(e) => {
                tracing::warn!(error = %e, "heartbeat failed, will redial");
                *control = None;
            }
        }
    }

    // ── Connections ──────────────────────────────────────────────────────────

    /// Dial every peer not already connected. Failures are logged and
    /// skipped. Returns how many dials succeeded.
    pub async fn connect_to_peers(self: &Arc<Self>, peers: &[PeerIdentity]) -> usize {
        let targets: Vec<_> = peers
            .iter()
            .filter(|p| **p != self.me && !self.connections.is_connected_to(p))
            .collect();

        let results = join_all(targets.iter().map(|peer| self.dial(peer))).await;

        let mut connected = 0;
        for (peer, result) in targets.iter().zip(results) {
            match result {
                Ok(_) => connected += 1,
                Err(e) => tracing::warn!(peer = %peer, error = %e, "dial failed"),
            }
        }
        connected
    }

    /// Open an outbound mesh connection to `peer`.
    pub async fn dial(self: &Arc<Self>, peer: &PeerIdentity) -> Result<Arc<MeshConnection>> {
        let stream = net::dial(&peer.host, peer.port, self.config.timing.ready_timeout()).await?;
        let (read, write) = stream.into_split();
        let conn = self.connections.insert(Direction::Outbound, peer.clone(), write);

        if let Err(e) = conn.send(Frame::hello(self.me.port)).await {
            self.connections.discard(conn.id());
            return Err(e).context("failed to send hello");
        }
        tracing::info!(peer = %peer, conn = conn.id(), "connected to peer");

        tokio::spawn(
            self.clone()
                .receive_loop(conn.clone(), FramedRead::new(read, FrameCodec)),
        );
        Ok(conn)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!(identity = %self.me, "acceptor shutting down");
                    return;
                }

                accepted = listener.accept() => {
                    let (stream, remote) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let node = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = node.handle_inbound(stream, remote).await {
                            tracing::warn!(remote = %remote, error = %e, "inbound connection rejected");
                        }
                    });
                }
            }
        }
    }

    /// Read the dialer's hello, then run its receive loop.
    async fn handle_inbound(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        net::tune(&stream);
        let (read, write) = stream.into_split();
        let mut reader = FramedRead::new(read, FrameCodec);

        let hello = tokio::time::timeout(self.config.timing.ready_timeout(), reader.next())
            .await
            .context("no hello from dialer")?
            .ok_or_else(|| anyhow!("closed before hello"))??;
        let port = parse_hello(&hello)?;

        let peer = PeerIdentity::new(remote.ip().to_string(), port);
        let conn = self.connections.insert(Direction::Inbound, peer, write);
        tracing::info!(peer = %conn.peer(), conn = conn.id(), "peer connected");

        self.receive_loop(conn, reader).await;
        Ok(())
    }

    /// Route frames from one connection until it closes or misbehaves.
    async fn receive_loop(
        self: Arc<Self>,
        conn: Arc<MeshConnection>,
        mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
    ) {
        let stall = self.config.timing.transfer_stall();
        let mut session = InboundSession::Idle;

        let result: Result<()> = loop {
            let limit = session.is_active().then_some(stall);
            let next = tokio::select! {
                _ = conn.closed().cancelled() => break Ok(()),
                next = within(limit, reader.next()) => next,
            };

            let frame = match next {
                None => {
                    self.transfer.abandon(&conn, &mut session);
                    continue;
                }
                Some(None) => break Ok(()),
                Some(Some(Err(e))) => break Err(e.into()),
                Some(Some(Ok(frame))) => frame,
            };

            if let Err(e) = self.dispatch(&conn, frame, &mut session).await {
                break Err(e);
            }
        };

        if let Err(e) = result {
            tracing::warn!(peer = %conn.peer(), error = %e, "dropping connection");
        }
        self.connections.discard(conn.id());
        self.transfer.connection_closed(conn.id(), session);
    }

    async fn dispatch(
        &self,
        conn: &MeshConnection,
        frame: Frame,
        session: &mut InboundSession,
    ) -> Result<()> {
        match frame.kind {
            FrameKind::Gossip => {
                self.gossip.handle_incoming(conn, &frame.payload).await?;
            }
            FrameKind::Control => {
                let token = frame.text()?.parse()?;
                self.transfer.on_control(conn, token, session).await?;
            }
            FrameKind::Data => self.transfer.on_data(conn, frame.payload, session)?,
            FrameKind::Hello => return Err(ProtocolError::UnexpectedFrame("repeated hello").into()),
            FrameKind::Command | FrameKind::Reply => {
                return Err(ProtocolError::UnexpectedFrame("rendezvous").into())
            }
        }
        Ok(())
    }

    // ── Broadcast ────────────────────────────────────────────────────────────

    /// Flood a text message to the mesh.
    pub async fn broadcast_message(&self, text: &str) -> Result<GossipMessage> {
        Ok(self.gossip.broadcast(text).await?)
    }

    /// Read `path` and push it to every connected peer. Returns the minted
    /// file id and one report per peer.
    pub async fn broadcast_file(&self, path: &Path) -> Result<(String, Vec<TargetReport>)> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file_id = mint_file_id(&path.display().to_string());
        let reports = self.transfer.broadcast_file(&file_id, Bytes::from(data)).await;
        Ok((file_id, reports))
    }

    /// Broadcast an in-memory payload under a caller-chosen file id.
    pub async fn broadcast_bytes(&self, file_id: &str, payload: Bytes) -> Vec<TargetReport> {
        self.transfer.broadcast_file(file_id, payload).await
    }

    /// Stop accepting, stop heartbeating, close every connection.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
        self.connections.clear();
        tracing::info!(identity = %self.me, "node stopped");
    }
}

/// The hello payload is the dialer's listening port.
fn parse_hello(frame: &Frame) -> Result<u16, ProtocolError> {
    if frame.kind != FrameKind::Hello {
        return Err(ProtocolError::UnexpectedFrame("non-hello"));
    }
    let text = std::str::from_utf8(&frame.payload)
        .map_err(|_| ProtocolError::BadHello("not UTF-8".into()))?;
    text.trim()
        .parse()
        .map_err(|_| ProtocolError::BadHello(text.to_string()))
}

/// Await `fut`, bounded by `limit` when set. `None` means the limit passed.
async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
