//! mesh-core — shared types, wire framing, and the text protocols spoken
//! between nodes and the rendezvous service. All other mesh crates depend
//! on this one.

pub mod config;
pub mod message;
pub mod protocol;
pub mod wire;

pub use message::GossipMessage;
pub use protocol::{Command, PeerIdentity, ProtocolError, TransferToken};
pub use wire::{Frame, FrameCodec, FrameKind, WireError};
