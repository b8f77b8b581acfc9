//! Gossip broadcast engine — flood text messages across the mesh with
//! per-node duplicate suppression.
//!
//! A node forwards a message the first time it sees its id, to every
//! connection except the one it arrived on. Later copies are dropped. On any
//! connected topology this delivers each message exactly once per node.

use std::sync::Arc;

use futures::future::join_all;

use mesh_core::config::GossipConfig;
use mesh_core::wire::MAX_FRAME_PAYLOAD;
use mesh_core::{Frame, GossipMessage, PeerIdentity, ProtocolError, WireError};

use crate::connection::{ConnId, ConnectionSet, MeshConnection};
use crate::inbox::Inbox;
use crate::seen::SeenCache;

/// What happened to an incoming envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// First sighting: delivered locally and relayed to `relayed` peers.
    Delivered { relayed: usize },
    /// Already seen; dropped.
    Duplicate,
}

#[derive(Debug, thiserror::Error)]
pub enum GossipError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("envelope of {0} bytes exceeds the {}-byte frame limit", MAX_FRAME_PAYLOAD)]
    TooLarge(usize),
}

pub struct GossipEngine {
    me: PeerIdentity,
    connections: ConnectionSet,
    seen: SeenCache,
    inbox: Inbox,
}

impl GossipEngine {
    pub fn new(
        me: PeerIdentity,
        connections: ConnectionSet,
        inbox: Inbox,
        config: &GossipConfig,
    ) -> Self {
        Self {
            me,
            connections,
            seen: SeenCache::new(config.seen_capacity, config.seen_window()),
            inbox,
        }
    }

    pub fn seen(&self) -> &SeenCache {
        &self.seen
    }

    /// Originate a message and send it to every connected peer.
    ///
    /// The id is recorded first so copies echoed back are dropped.
    pub async fn broadcast(&self, content: impl Into<String>) -> Result<GossipMessage, GossipError> {
        let message = GossipMessage::originate(&self.me, content);
        let envelope = encode(&message)?;
        self.seen.check_and_insert(&message.message_id);

        let sent = self.fan_out(&envelope, None).await;
        tracing::info!(
            message_id = %message.message_id,
            peers = sent,
            "message broadcast"
        );
        Ok(message)
    }

    /// Handle a gossip frame that arrived on `from`.
    pub async fn handle_incoming(
        &self,
        from: &MeshConnection,
        payload: &[u8],
    ) -> Result<Disposition, ProtocolError> {
        let message = GossipMessage::from_bytes(payload)?;

        if !self.seen.check_and_insert(&message.message_id) {
            tracing::trace!(
                message_id = %message.message_id,
                from = %from.peer(),
                "duplicate message dropped"
            );
            return Ok(Disposition::Duplicate);
        }

        tracing::debug!(
            message_id = %message.message_id,
            originator = %message.originator,
            from = %from.peer(),
            "message delivered"
        );
        self.inbox.deliver(message.clone());

        let relayed = match encode(&message.relayed_by(&self.me)) {
            Ok(envelope) => self.fan_out(&envelope, Some(from.id())).await,
            Err(e) => {
                tracing::warn!(message_id = %message.message_id, error = %e, "message not relayed");
                0
            }
        };
        Ok(Disposition::Delivered { relayed })
    }

    /// Send `envelope` to every connection except `exclude`, concurrently.
    /// A socket failure drops that connection. Returns how many writes
    /// succeeded.
    async fn fan_out(&self, envelope: &[u8], exclude: Option<ConnId>) -> usize {
        let targets = self.connections.snapshot_except(exclude);
        let frame = Frame::gossip(envelope.to_vec());

        let results = join_all(targets.iter().map(|conn| {
            let frame = frame.clone();
            async move { (conn, conn.send(frame).await) }
        }))
        .await;

        let mut sent = 0;
        for (conn, result) in results {
            match result {
                Ok(()) => sent += 1,
                Err(e @ WireError::Io(_)) => {
                    tracing::warn!(peer = %conn.peer(), error = %e, "gossip send failed");
                    self.discard(conn);
                }
                Err(e) => tracing::warn!(peer = %conn.peer(), error = %e, "gossip frame rejected"),
            }
        }
        sent
    }

    fn discard(&self, conn: &Arc<MeshConnection>) {
        self.connections.discard(conn.id());
    }
}

/// Serialize `message`, refusing envelopes no frame can carry.
fn encode(message: &GossipMessage) -> Result<Vec<u8>, GossipError> {
    let envelope = message.to_bytes()?;
    if envelope.len() > MAX_FRAME_PAYLOAD {
        return Err(GossipError::TooLarge(envelope.len()));
    }
    Ok(envelope)
}
