//! Live mesh connections and the per-connection state the engines share.
//!
//! A connection's read half is owned by its receive loop in `node`; the
//! write half lives here behind a lock so gossip relays, transfer tokens and
//! data chunks from different tasks never interleave inside a frame.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use dashmap::DashMap;
use futures::SinkExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use mesh_core::{Frame, FrameCodec, PeerIdentity, TransferToken, WireError};

pub type ConnId = u64;

/// Which side dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => f.write_str("inbound"),
            Direction::Outbound => f.write_str("outbound"),
        }
    }
}

/// Where a `ready`/`busy` reply goes. The remote answers every
/// `check_ready` exactly once and in order, so each abandoned wait leaves
/// one reply owed that must not reach a later waiter.
#[derive(Default)]
struct ReadySlot {
    waiter: Option<oneshot::Sender<TransferToken>>,
    owed: u32,
}

pub struct MeshConnection {
    id: ConnId,
    direction: Direction,
    /// Remote node's advertised identity.
    peer: PeerIdentity,
    writer: Mutex<FramedWrite<OwnedWriteHalf, FrameCodec>>,
    /// Held by an outbound transfer for its whole handshake so replies on
    /// this connection belong to exactly one transfer.
    transfer_lock: Mutex<()>,
    pending_ready: std::sync::Mutex<ReadySlot>,
    /// Set when the remote answers `ignored` to our `start`.
    ignored: AtomicBool,
    closed: CancellationToken,
}

impl MeshConnection {
    fn new(id: ConnId, direction: Direction, peer: PeerIdentity, write: OwnedWriteHalf) -> Self {
        Self {
            id,
            direction,
            peer,
            writer: Mutex::new(FramedWrite::new(write, FrameCodec)),
            transfer_lock: Mutex::new(()),
            pending_ready: std::sync::Mutex::new(ReadySlot::default()),
            ignored: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Write one whole frame.
    pub async fn send(&self, frame: Frame) -> Result<(), WireError> {
        if self.closed.is_cancelled() {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into());
        }
        self.writer.lock().await.send(frame).await
    }

    pub async fn lock_transfer(&self) -> MutexGuard<'_, ()> {
        self.transfer_lock.lock().await
    }

    /// Register interest in the next readiness reply. Replaces any stale
    /// waiter.
    pub fn expect_readiness(&self) -> oneshot::Receiver<TransferToken> {
        let (tx, rx) = oneshot::channel();
        self.pending_ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .waiter = Some(tx);
        rx
    }

    /// Hand a `ready`/`busy` reply to the waiting sender. Returns false if
    /// nobody was waiting or the reply answers an abandoned wait.
    pub fn deliver_readiness(&self, token: TransferToken) -> bool {
        let mut slot = self.pending_ready.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.owed > 0 {
            slot.owed -= 1;
            tracing::debug!(peer = %self.peer, reply = %token, "late readiness reply dropped");
            return false;
        }
        match slot.waiter.take() {
            Some(tx) => tx.send(token).is_ok(),
            None => false,
        }
    }

    /// Stop waiting for the pending reply. If it has not arrived yet, it is
    /// dropped when it does.
    pub fn cancel_readiness(&self) {
        let mut slot = self.pending_ready.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.waiter.take().is_some() {
            slot.owed += 1;
        }
    }

    pub fn mark_ignored(&self) {
        self.ignored.store(true, Ordering::SeqCst);
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored.load(Ordering::SeqCst)
    }

    pub fn reset_ignored(&self) {
        self.ignored.store(false, Ordering::SeqCst);
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Every live mesh connection, keyed by a locally unique id.
#[derive(Clone, Default)]
pub struct ConnectionSet {
    conns: Arc<DashMap<ConnId, Arc<MeshConnection>>>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adopt a connection's write half. The caller owns the read half.
    pub fn insert(
        &self,
        direction: Direction,
        peer: PeerIdentity,
        write: OwnedWriteHalf,
    ) -> Arc<MeshConnection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let conn = Arc::new(MeshConnection::new(id, direction, peer, write));
        self.conns.insert(id, conn.clone());
        conn
    }

    /// Remove a connection and signal its receive loop to stop. Idempotent.
    pub fn discard(&self, id: ConnId) -> Option<Arc<MeshConnection>> {
        let (_, conn) = self.conns.remove(&id)?;
        conn.closed.cancel();
        conn.cancel_readiness();
        tracing::info!(
            peer = %conn.peer,
            conn = id,
            direction = %conn.direction,
            "connection closed"
        );
        Some(conn)
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<MeshConnection>> {
        self.conns.get(&id).map(|c| c.clone())
    }

    pub fn snapshot(&self) -> Vec<Arc<MeshConnection>> {
        self.snapshot_except(None)
    }

    /// All connections except `exclude`.
    pub fn snapshot_except(&self, exclude: Option<ConnId>) -> Vec<Arc<MeshConnection>> {
        let mut conns: Vec<_> = self
            .conns
            .iter()
            .filter(|c| Some(*c.key()) != exclude)
            .map(|c| c.value().clone())
            .collect();
        conns.sort_by_key(|c| c.id);
        conns
    }

    pub fn is_connected_to(&self, peer: &PeerIdentity) -> bool {
        self.conns.iter().any(|c| &c.peer == peer)
    }

    /// Identities of connected peers, deduplicated and sorted.
    pub fn peers(&self) -> Vec<PeerIdentity> {
        let mut peers: Vec<_> = self.conns.iter().map(|c| c.peer.clone()).collect();
        peers.sort();
        peers.dedup();
        peers
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Close everything.
    pub fn clear(&self) {
        let ids: Vec<ConnId> = self.conns.iter().map(|c| *c.key()).collect();
        for id in ids {
            self.discard(id);
        }
    }
}
