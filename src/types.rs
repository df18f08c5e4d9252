//! Wire envelope, message-type tags, and typed gossip payloads.
//!
//! Everything the transport exchanges is an [`Envelope`] carried inside an
//! [`EnvelopeList`]. Envelope content is opaque to the transport; the typed
//! payloads in this module are the schemas of the built-in `gossip/*`
//! messages and are decoded only by their handlers.

use crate::serde_safe::{BoundedBytes, BoundedVec};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_512};

// =============================================================================
// LIMITS
// =============================================================================

/// Maximum serialized frame size (2 MB). Outer bound for a whole
/// [`EnvelopeList`]; a peer exceeding it is speaking another protocol.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Maximum opaque payload bytes per envelope.
pub const MAX_CONTENT_SIZE: usize = 256 * 1024;

/// Maximum envelopes a single list may coalesce.
pub const MAX_ENVELOPES_PER_LIST: usize = 64;

/// Maximum peer identity bytes announced at link start.
pub const MAX_IDENTITY_SIZE: usize = 256;

/// Correlation ids are 128 lowercase hex chars (SHA3-512 digest).
pub const CORRELATION_ID_LEN: usize = 128;

// =============================================================================
// MESSAGE TYPES
// =============================================================================

/// Wire tags for the built-in gossip message family.
pub mod message_type {
    pub const REGISTER: &str = "gossip/register";
    pub const UNREGISTER: &str = "gossip/unregister";
    pub const GOSSIP: &str = "gossip/msg";
    pub const PING: &str = "gossip/ping";
    pub const ACK: &str = "gossip/ack";
}

// =============================================================================
// PEER IDENTITY
// =============================================================================

/// Opaque peer identity bytes. Clients announce theirs at link start; the
/// server stamps it onto every envelope received on that link.
pub type PeerIdentity = Vec<u8>;

/// Default identity for an outbound link: `"<hostname>-<pid>"`.
pub fn local_identity() -> PeerIdentity {
    let host = gethostname::gethostname();
    format!("{}-{}", host.to_string_lossy(), std::process::id()).into_bytes()
}

// =============================================================================
// CORRELATION IDS
// =============================================================================

/// Generate a fresh correlation id: SHA3-512 over 64 CSPRNG bytes,
/// hex-encoded to 128 lowercase chars. Collision probability is negligible,
/// so ids are unique across links and across nodes without coordination.
pub fn generate_correlation_id() -> String {
    let mut seed = [0u8; 64];
    OsRng.fill_bytes(&mut seed);
    hex::encode(Sha3_512::digest(seed))
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// The sole wire unit: a typed, correlated, opaque payload.
///
/// `sender` is empty on the wire from clients; the server fills it in on
/// receive from the link's announced identity, and on the send path it
/// selects the route back to that peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_type: String,
    pub correlation_id: String,
    pub content: BoundedBytes<MAX_CONTENT_SIZE>,
    pub sender: PeerIdentity,
}

impl Envelope {
    pub fn new(message_type: &str, correlation_id: String, content: Vec<u8>) -> Self {
        Self {
            message_type: message_type.to_string(),
            correlation_id,
            content: BoundedBytes::new_unchecked(content),
            sender: Vec::new(),
        }
    }

    /// Reply envelope: echoes the originator's correlation id and routes
    /// back to its sender.
    pub fn reply_to(original: &Envelope, message_type: &str, content: Vec<u8>) -> Self {
        Self {
            message_type: message_type.to_string(),
            correlation_id: original.correlation_id.clone(),
            content: BoundedBytes::new_unchecked(content),
            sender: original.sender.clone(),
        }
    }
}

/// Batch container; the wire always carries a list so a peer may coalesce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeList(pub BoundedVec<Envelope, MAX_ENVELOPES_PER_LIST>);

impl EnvelopeList {
    pub fn single(envelope: Envelope) -> Self {
        Self(BoundedVec::new_unchecked(vec![envelope]))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for EnvelopeList {
    type Item = Envelope;
    type IntoIter = std::vec::IntoIter<Envelope>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_inner().into_iter()
    }
}

// =============================================================================
// TYPED PAYLOADS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRegisterRequest {
    pub identity: PeerIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerUnregisterRequest {
    pub identity: PeerIdentity,
}

/// Application-level gossip payload awaiting verification and dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipMessage {
    pub content: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest;

/// Reply status carried by `gossip/ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAcknowledgement {
    pub status: AckStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_id_shape() {
        let id = generate_correlation_id();
        assert_eq!(id.len(), CORRELATION_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn correlation_ids_distinct() {
        let a = generate_correlation_id();
        let b = generate_correlation_id();
        assert_ne!(a, b);
    }

    #[test]
    fn reply_echoes_correlation_and_sender() {
        let mut original = Envelope::new(message_type::PING, generate_correlation_id(), vec![]);
        original.sender = b"peer-A".to_vec();

        let reply = Envelope::reply_to(&original, message_type::ACK, vec![1, 2]);
        assert_eq!(reply.correlation_id, original.correlation_id);
        assert_eq!(reply.sender, original.sender);
        assert_eq!(reply.message_type, message_type::ACK);
    }

    #[test]
    fn local_identity_has_pid_suffix() {
        let identity = String::from_utf8(local_identity()).unwrap();
        assert!(identity.ends_with(&std::process::id().to_string()));
    }
}
