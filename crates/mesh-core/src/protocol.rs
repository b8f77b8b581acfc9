//! Text protocols carried inside frames.
//!
//! - Rendezvous commands (`Command`), sent in `FrameKind::Command` frames.
//! - Transfer control tokens (`TransferToken`), sent in `FrameKind::Control`
//!   frames.
//! - Peer identities and the comma-joined peer list returned by
//!   `request_nodes`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Peer Identity ─────────────────────────────────────────────────────────────

/// A node's advertised endpoint. Textual form is `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub host: String,
    pub port: u16,
}

impl PeerIdentity {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for PeerIdentity {
    type Err = ProtocolError;

    /// Splits on the last `:` so bracket-less IPv6 hosts still parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::BadIdentity(s.to_string()))?;
        if host.is_empty() {
            return Err(ProtocolError::BadIdentity(s.to_string()));
        }
        let port = port
            .parse()
            .map_err(|_| ProtocolError::BadIdentity(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

/// Render a `request_nodes` reply.
pub fn format_peer_list<'a>(peers: impl IntoIterator<Item = &'a PeerIdentity>) -> String {
    peers
        .into_iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a `request_nodes` reply. Empty segments are skipped; an empty reply
/// is an empty list.
pub fn parse_peer_list(text: &str) -> Result<Vec<PeerIdentity>, ProtocolError> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

// ── Rendezvous Commands ───────────────────────────────────────────────────────

const REGISTER: &str = "register";
const HEARTBEAT: &str = "heartbeat";
const LEAVE: &str = "do_not_join";
const REQUEST_NODES: &str = "request_nodes";

/// A command on a rendezvous control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `register:<host>:<port>` — upsert the caller's entry.
    Register(PeerIdentity),
    /// `heartbeat:<host>:<port>` — refresh the entry if it still exists.
    Heartbeat(PeerIdentity),
    /// `do_not_join:<host>:<port>` — drop the entry now.
    Leave(PeerIdentity),
    /// `request_nodes` — reply with the live peer list.
    RequestNodes,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Register(id) => write!(f, "{REGISTER}:{id}"),
            Command::Heartbeat(id) => write!(f, "{HEARTBEAT}:{id}"),
            Command::Leave(id) => write!(f, "{LEAVE}:{id}"),
            Command::RequestNodes => f.write_str(REQUEST_NODES),
        }
    }
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text == REQUEST_NODES {
            return Ok(Command::RequestNodes);
        }

        let (verb, rest) = text
            .split_once(':')
            .ok_or_else(|| ProtocolError::UnknownCommand(text.to_string()))?;
        match verb {
            REGISTER => Ok(Command::Register(rest.parse()?)),
            HEARTBEAT => Ok(Command::Heartbeat(rest.parse()?)),
            LEAVE => Ok(Command::Leave(rest.parse()?)),
            _ => Err(ProtocolError::UnknownCommand(text.to_string())),
        }
    }
}

// ── Transfer Tokens ───────────────────────────────────────────────────────────

const CHECK_READY: &str = "check_ready";
const READY: &str = "ready";
const BUSY: &str = "busy";
const START_PREFIX: &str = "start:";
const IGNORED: &str = "ignored";
const FINISHED: &str = "finished";

/// Control token of the file transfer handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferToken {
    /// Sender asks whether the receiver can take a transfer.
    CheckReady,
    /// Receiver accepts; it is now busy until `Finished`.
    Ready,
    /// Receiver is already taking another transfer.
    Busy,
    /// Sender announces the transfer identity. Payload chunks follow.
    Start(String),
    /// Receiver has already seen this transfer identity.
    Ignored,
    /// Sender has sent the last chunk.
    Finished,
}

impl fmt::Display for TransferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferToken::CheckReady => f.write_str(CHECK_READY),
            TransferToken::Ready => f.write_str(READY),
            TransferToken::Busy => f.write_str(BUSY),
            TransferToken::Start(file_id) => write!(f, "{START_PREFIX}{file_id}"),
            TransferToken::Ignored => f.write_str(IGNORED),
            TransferToken::Finished => f.write_str(FINISHED),
        }
    }
}

impl FromStr for TransferToken {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            CHECK_READY => Ok(TransferToken::CheckReady),
            READY => Ok(TransferToken::Ready),
            BUSY => Ok(TransferToken::Busy),
            IGNORED => Ok(TransferToken::Ignored),
            FINISHED => Ok(TransferToken::Finished),
            other => match other.strip_prefix(START_PREFIX) {
                Some(file_id) if !file_id.is_empty() => {
                    Ok(TransferToken::Start(file_id.to_string()))
                }
                _ => Err(ProtocolError::UnknownToken(other.to_string())),
            },
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Malformed protocol text. Always fatal to the connection that sent it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed peer identity: {0:?}")]
    BadIdentity(String),

    #[error("unknown rendezvous command: {0:?}")]
    UnknownCommand(String),

    #[error("unknown transfer token: {0:?}")]
    UnknownToken(String),

    #[error("malformed gossip envelope: {0}")]
    BadEnvelope(String),

    #[error("malformed hello: {0:?}")]
    BadHello(String),

    #[error("unexpected {0} frame")]
    UnexpectedFrame(&'static str),
}
