//! mesh-services — the moving parts of a mesh node and of the rendezvous
//! service. Binaries wire these together; integration tests drive them
//! in-process.

pub mod connection;
pub mod file_store;
pub mod gossip;
pub mod inbox;
pub mod net;
pub mod node;
pub mod registry;
pub mod rendezvous;
pub mod seen;
pub mod transfer;

pub use connection::{ConnId, ConnectionSet, Direction, MeshConnection};
pub use file_store::FileStore;
pub use gossip::{Disposition, GossipEngine, GossipError};
pub use inbox::Inbox;
pub use node::Node;
pub use registry::MembershipRegistry;
pub use rendezvous::{RendezvousClient, RendezvousService};
pub use seen::SeenCache;
pub use transfer::{
    InboundSession, Readiness, TargetReport, TransferEngine, TransferError, TransferOutcome,
    TransferStats,
};
