//! Registry of peers that have registered with us.

use crate::types::PeerIdentity;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

/// One `gossip/register` exchange: the registering peer and the identity it
/// presented in its request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub peer: PeerIdentity,
    pub identity: PeerIdentity,
}

/// Peer identity → registration records, mutated by the register and
/// unregister handlers and by link teardown.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerIdentity, Vec<RegistrationRecord>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a registration. Re-registration by the same sender is
    /// idempotent: records are deduplicated by identity value.
    pub fn register(&self, sender: &[u8], identity: &[u8]) {
        debug!(
            sender = %String::from_utf8_lossy(sender),
            identity = %String::from_utf8_lossy(identity),
            "registering peer"
        );
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        let records = peers.entry(sender.to_vec()).or_default();
        if !records.iter().any(|r| r.identity == identity) {
            records.push(RegistrationRecord {
                peer: sender.to_vec(),
                identity: identity.to_vec(),
            });
        }
    }

    /// Remove a peer by its key. The identity in the unregister payload is
    /// not discriminated: all records for the sender go at once.
    pub fn unregister(&self, sender: &[u8], identity: &[u8]) -> bool {
        debug!(
            sender = %String::from_utf8_lossy(sender),
            identity = %String::from_utf8_lossy(identity),
            "unregistering peer"
        );
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sender)
            .is_some()
    }

    pub fn contains(&self, sender: &[u8]) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(sender)
    }

    /// Number of distinct registered peers.
    pub fn len(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self, sender: &[u8]) -> Vec<RegistrationRecord> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(sender)
            .cloned()
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> Vec<RegistrationRecord> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .flatten()
            .cloned()
            .collect()
    }
}
