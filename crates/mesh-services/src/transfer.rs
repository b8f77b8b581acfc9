//! Transfer engine — push a file to every connected peer, one readiness
//! handshake per connection, with file-id duplicate suppression so a file
//! floods the mesh without loops.
//!
//! Sender, per target connection:
//!   check_ready → wait (bounded) for ready|busy → start:<file_id>
//!   → data chunks → finished
//!
//! Receiver, per connection:
//!   Idle ─check_ready→ AwaitingHeader ─start(new id)→ Receiving ─finished→ Idle
//!                                     ─start(seen id)→ Discarding ─finished→ Idle
//!
//! A node takes at most one inbound transfer at a time. The readiness slot
//! is held from `ready` until `finished`, the connection closing, or the
//! session stalling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::future::join_all;

use mesh_core::config::MeshConfig;
use mesh_core::wire::MAX_FRAME_PAYLOAD;
use mesh_core::{Frame, PeerIdentity, ProtocolError, TransferToken, WireError};

use crate::connection::{ConnId, ConnectionSet, MeshConnection};
use crate::file_store::FileStore;
use crate::seen::SeenCache;

// ── Readiness ────────────────────────────────────────────────────────────────

/// The node-wide "one inbound transfer at a time" slot.
#[derive(Default)]
pub struct Readiness {
    holder: Mutex<Option<ConnId>>,
}

impl Readiness {
    /// Claim the slot for `conn`. False if anyone already holds it.
    pub fn try_acquire(&self, conn: ConnId) -> bool {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if holder.is_some() {
            return false;
        }
        *holder = Some(conn);
        true
    }

    /// Free the slot if `conn` holds it.
    pub fn release(&self, conn: ConnId) -> bool {
        let mut holder = self.holder.lock().unwrap_or_else(PoisonError::into_inner);
        if *holder == Some(conn) {
            *holder = None;
            true
        } else {
            false
        }
    }

    pub fn holder(&self) -> Option<ConnId> {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_busy(&self) -> bool {
        self.holder().is_some()
    }
}

// ── Outcomes & Errors ────────────────────────────────────────────────────────

/// How a push to one peer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every chunk and `finished` were written.
    Delivered,
    /// The peer was taking another transfer.
    Busy,
    /// The peer had already seen this file id.
    Ignored,
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("no readiness reply within {0:?}")]
    ReadyTimeout(Duration),

    #[error("unexpected reply to check_ready: {0}")]
    UnexpectedReply(TransferToken),

    #[error("connection closed during transfer")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Result of pushing to one connection.
#[derive(Debug)]
pub struct TargetReport {
    pub peer: PeerIdentity,
    pub result: Result<TransferOutcome, TransferError>,
}

/// Counters exposed for the console and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Transfers written to the workspace.
    pub received: u64,
    /// `start` headers answered with `ignored`.
    pub ignored: u64,
    /// `check_ready` requests answered with `busy`.
    pub busy_rejections: u64,
    /// Sessions abandoned after stalling.
    pub abandoned: u64,
}

// ── Inbound Session ──────────────────────────────────────────────────────────

/// Receiver-side state of one connection. Owned by that connection's
/// receive loop.
#[derive(Debug, Default)]
pub enum InboundSession {
    #[default]
    Idle,
    /// Answered `ready`; waiting for `start`.
    AwaitingHeader,
    Receiving {
        file_id: String,
        buf: BytesMut,
    },
    /// Answered `ignored`; swallowing chunks until `finished`.
    Discarding,
}

impl InboundSession {
    /// True while this connection holds the readiness slot.
    pub fn is_active(&self) -> bool {
        !matches!(self, InboundSession::Idle)
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct TransferEngine {
    me: PeerIdentity,
    connections: ConnectionSet,
    readiness: Readiness,
    seen_files: SeenCache,
    store: FileStore,
    chunk_size: usize,
    ready_timeout: Duration,
    received: AtomicU64,
    ignored: AtomicU64,
    busy_rejections: AtomicU64,
    abandoned: AtomicU64,
}

impl TransferEngine {
    pub fn new(
        me: PeerIdentity,
        connections: ConnectionSet,
        store: FileStore,
        config: &MeshConfig,
    ) -> Self {
        Self {
            me,
            connections,
            readiness: Readiness::default(),
            seen_files: SeenCache::new(config.gossip.seen_capacity, config.gossip.seen_window()),
            store,
            chunk_size: config.transfer.chunk_size.clamp(1, MAX_FRAME_PAYLOAD),
            ready_timeout: config.timing.ready_timeout(),
            received: AtomicU64::new(0),
            ignored: AtomicU64::new(0),
            busy_rejections: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        }
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    pub fn has_seen(&self, file_id: &str) -> bool {
        self.seen_files.contains(file_id)
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            received: self.received.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    // ── Sending ──────────────────────────────────────────────────────────────

    /// Originate a transfer: record the id so it is never accepted back,
    /// then push to every connected peer.
    pub async fn broadcast_file(&self, file_id: &str, payload: Bytes) -> Vec<TargetReport> {
        self.seen_files.check_and_insert(file_id);
        tracing::info!(
            file_id,
            bytes = payload.len(),
            peers = self.connections.len(),
            "file broadcast"
        );
        self.push_to_peers(file_id, payload, None).await
    }

    /// Push to every connection except `exclude`, concurrently.
    pub async fn push_to_peers(
        &self,
        file_id: &str,
        payload: Bytes,
        exclude: Option<ConnId>,
    ) -> Vec<TargetReport> {
        let targets = self.connections.snapshot_except(exclude);

        let reports = join_all(targets.iter().map(|conn| {
            let payload = payload.clone();
            async move {
                let result = self.send_to(conn, file_id, payload).await;
                if matches!(result, Err(TransferError::Wire(WireError::Io(_)))) {
                    self.connections.discard(conn.id());
                }
                TargetReport {
                    peer: conn.peer().clone(),
                    result,
                }
            }
        }))
        .await;

        for report in &reports {
            match &report.result {
                Ok(outcome) => {
                    tracing::debug!(peer = %report.peer, file_id, ?outcome, "transfer finished")
                }
                Err(e) => {
                    tracing::warn!(peer = %report.peer, file_id, error = %e, "transfer failed")
                }
            }
        }
        reports
    }

    /// Run the sender side of one transfer on `conn`.
    pub async fn send_to(
        &self,
        conn: &MeshConnection,
        file_id: &str,
        payload: Bytes,
    ) -> Result<TransferOutcome, TransferError> {
        // One handshake per connection at a time.
        let _guard = conn.lock_transfer().await;
        conn.reset_ignored();

        let reply = conn.expect_readiness();
        conn.send(Frame::control(&TransferToken::CheckReady)).await?;

        let token = match tokio::time::timeout(self.ready_timeout, reply).await {
            Ok(Ok(token)) => token,
            Ok(Err(_)) => return Err(TransferError::Closed),
            Err(_) => {
                conn.cancel_readiness();
                // Releases the receiver if it answered `ready` too late.
                let _ = conn.send(Frame::control(&TransferToken::Finished)).await;
                return Err(TransferError::ReadyTimeout(self.ready_timeout));
            }
        };

        match token {
            TransferToken::Ready => {}
            TransferToken::Busy => return Ok(TransferOutcome::Busy),
            other => return Err(TransferError::UnexpectedReply(other)),
        }

        conn.send(Frame::control(&TransferToken::Start(file_id.to_string())))
            .await?;

        let mut offset = 0;
        while offset < payload.len() {
            if conn.is_ignored() {
                break;
            }
            let end = (offset + self.chunk_size).min(payload.len());
            conn.send(Frame::data(payload.slice(offset..end))).await?;
            offset = end;
        }

        conn.send(Frame::control(&TransferToken::Finished)).await?;

        if conn.is_ignored() {
            Ok(TransferOutcome::Ignored)
        } else {
            Ok(TransferOutcome::Delivered)
        }
    }

    // ── Receiving ────────────────────────────────────────────────────────────

    /// Handle a control token that arrived on `conn`.
    pub async fn on_control(
        self: &Arc<Self>,
        conn: &MeshConnection,
        token: TransferToken,
        session: &mut InboundSession,
    ) -> Result<(), TransferError> {
        match token {
            TransferToken::CheckReady => {
                let reply = if !session.is_active() && self.readiness.try_acquire(conn.id()) {
                    *session = InboundSession::AwaitingHeader;
                    TransferToken::Ready
                } else {
                    self.busy_rejections.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(peer = %conn.peer(), "busy, transfer refused");
                    TransferToken::Busy
                };
                conn.send(Frame::control(&reply)).await?;
            }

            TransferToken::Ready | TransferToken::Busy => {
                if !conn.deliver_readiness(token) {
                    tracing::debug!(peer = %conn.peer(), "readiness reply with no waiter");
                }
            }

            TransferToken::Ignored => conn.mark_ignored(),

            TransferToken::Start(file_id) => {
                if !matches!(session, InboundSession::AwaitingHeader) {
                    return Err(ProtocolError::UnexpectedFrame("start").into());
                }
                if self.seen_files.check_and_insert(&file_id) {
                    tracing::debug!(peer = %conn.peer(), file_id = %file_id, "receiving file");
                    *session = InboundSession::Receiving {
                        file_id,
                        buf: BytesMut::new(),
                    };
                } else {
                    self.ignored.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(peer = %conn.peer(), file_id = %file_id, "file already seen");
                    *session = InboundSession::Discarding;
                    conn.send(Frame::control(&TransferToken::Ignored)).await?;
                }
            }

            TransferToken::Finished => match std::mem::take(session) {
                InboundSession::Receiving { file_id, buf } => {
                    self.readiness.release(conn.id());
                    self.complete(conn, file_id, buf.freeze()).await;
                }
                InboundSession::AwaitingHeader | InboundSession::Discarding => {
                    self.readiness.release(conn.id());
                }
                InboundSession::Idle => {
                    tracing::debug!(peer = %conn.peer(), "finished with no open session");
                }
            },
        }
        Ok(())
    }

    /// Handle a data chunk that arrived on `conn`.
    pub fn on_data(
        &self,
        conn: &MeshConnection,
        chunk: Bytes,
        session: &mut InboundSession,
    ) -> Result<(), ProtocolError> {
        match session {
            InboundSession::Receiving { buf, .. } => {
                buf.extend_from_slice(&chunk);
                Ok(())
            }
            InboundSession::Discarding => Ok(()),
            InboundSession::Idle | InboundSession::AwaitingHeader => {
                tracing::debug!(peer = %conn.peer(), "data outside a transfer");
                Err(ProtocolError::UnexpectedFrame("data"))
            }
        }
    }

    /// Drop a session whose sender went silent.
    pub fn abandon(&self, conn: &MeshConnection, session: &mut InboundSession) {
        if let InboundSession::Receiving { file_id, .. } = &*session {
            tracing::warn!(peer = %conn.peer(), file_id = %file_id, "transfer stalled, abandoned");
        } else {
            tracing::warn!(peer = %conn.peer(), "transfer handshake stalled, abandoned");
        }
        self.abandoned.fetch_add(1, Ordering::Relaxed);
        *session = InboundSession::Idle;
        self.readiness.release(conn.id());
    }

    /// The connection went away; free readiness if it held it.
    pub fn connection_closed(&self, conn: ConnId, session: InboundSession) {
        if session.is_active() && self.readiness.release(conn) {
            tracing::debug!(conn, "readiness released by closed connection");
        }
    }

    /// Persist a completed file and relay it to everyone but its sender.
    async fn complete(self: &Arc<Self>, conn: &MeshConnection, file_id: String, payload: Bytes) {
        let store = self.store.clone();
        let (id, data) = (file_id.clone(), payload.clone());
        let saved = tokio::task::spawn_blocking(move || store.save(&id, &data))
            .await
            .unwrap_or_else(|e| Err(anyhow::anyhow!("store task failed: {e}")));

        match saved {
            Ok(path) => {
                self.received.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    from = %conn.peer(),
                    file_id = %file_id,
                    bytes = payload.len(),
                    path = %path.display(),
                    "file received"
                );
            }
            Err(e) => {
                tracing::error!(file_id = %file_id, error = %e, "failed to store received file");
            }
        }

        let engine = self.clone();
        let exclude = conn.id();
        tokio::spawn(async move {
            engine.push_to_peers(&file_id, payload, Some(exclude)).await;
        });
    }

    pub fn me(&self) -> &PeerIdentity {
        &self.me
    }
}
