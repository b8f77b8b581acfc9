//! Gossip envelope and the identifiers minted at origination.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::protocol::{PeerIdentity, ProtocolError};

/// The envelope relayed across the mesh for every text broadcast.
///
/// `message_id` is fixed at origination. `last_sender` is rewritten by each
/// relaying node to its own identity before forwarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub originator: String,
    pub last_sender: String,
    pub message_id: String,
    pub content: String,
}

impl GossipMessage {
    /// Build a fresh message originated by `me`.
    pub fn originate(me: &PeerIdentity, content: impl Into<String>) -> Self {
        let me = me.to_string();
        Self {
            originator: me.clone(),
            last_sender: me,
            message_id: mint_message_id(),
            content: content.into(),
        }
    }

    /// Copy of this message as forwarded by `me`.
    pub fn relayed_by(&self, me: &PeerIdentity) -> Self {
        Self {
            last_sender: me.to_string(),
            ..self.clone()
        }
    }

    /// Serialize to the JSON envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse either the JSON envelope or a bare `message_id:content` pair.
    ///
    /// A bare pair has no routing metadata; originator and last sender are
    /// left empty.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ProtocolError::BadEnvelope("not UTF-8".into()))?;

        if text.trim_start().starts_with('{') {
            return serde_json::from_str(text)
                .map_err(|e| ProtocolError::BadEnvelope(e.to_string()));
        }

        match text.split_once(':') {
            Some((id, content)) if !id.is_empty() => Ok(Self {
                originator: String::new(),
                last_sender: String::new(),
                message_id: id.to_string(),
                content: content.to_string(),
            }),
            _ => Err(ProtocolError::BadEnvelope(
                "expected JSON envelope or message_id:content".into(),
            )),
        }
    }
}

/// Nanoseconds since the Unix epoch.
pub fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// Message id: high-resolution timestamp plus a random suffix so two nodes
/// originating in the same nanosecond still differ. Uniqueness is
/// probabilistic.
pub fn mint_message_id() -> String {
    format!("{}.{:08x}", unix_nanos(), rand::random::<u32>())
}

/// Transfer identity: `<source>_<unix nanos>`.
pub fn mint_file_id(source: &str) -> String {
    format!("{}_{}", source, unix_nanos())
}
