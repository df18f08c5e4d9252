//! Gossipnet: peer-to-peer gossip transport core for a validator node.
//!
//! Each node is simultaneously a server (accepting framed links from
//! peers) and a client (dialing a configured peer list). The transport
//! delivers correlated request/response traffic, routes unsolicited
//! messages through typed handlers, fans broadcasts out to every known
//! peer, and feeds verified gossip payloads into a downstream dispatcher.

pub mod connection;
pub mod endpoint;
pub mod future;
pub mod handler;
pub mod link;
pub mod peers;
pub mod queue;
pub mod serde_safe;
pub mod service;
pub mod types;
pub mod verifier;
pub mod wire;

// Re-exports
pub use connection::PeerConnection;
pub use endpoint::ServerEndpoint;
pub use future::{FutureRegistry, FutureResult, PendingReply, RegistryError, ReplyError};
pub use handler::{Handler, HandlerContext, HandlerTable, Responder};
pub use link::{FramedLink, LinkError, LinkSender, ReceiveContext};
pub use peers::{PeerRegistry, RegistrationRecord};
pub use queue::{NotifyQueue, ReadySignal, Readiness, readiness};
pub use serde_safe::{BoundedBytes, BoundedVec, from_bytes, to_bytes};
pub use service::{
    AppMessage, BatchList, Dispatcher, LoopbackNetwork, NetConfig, NetError, NetworkService,
};
pub use types::*;
pub use verifier::{AcceptAll, PayloadVerifier, VerificationStage};
pub use wire::{LinkHello, WireError};
