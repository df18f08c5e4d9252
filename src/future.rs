//! Correlation-id keyed table of pending request futures.
//!
//! Every request registers a one-shot slot under its correlation id before
//! the envelope leaves the process. The receive loop resolves replies
//! through [`FutureRegistry::complete`]; a miss there is the signal that an
//! envelope is an initial message for the handler table, not a reply.
//!
//! The registry lock is held only for map operations. Waiting happens on
//! the oneshot channel outside the registry, so a slow caller can never
//! stall the receive loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Payload delivered into a pending future, exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FutureResult {
    pub message_type: String,
    pub content: Vec<u8>,
}

/// Terminal states a waiter can observe instead of a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReplyError {
    #[error("timed out waiting for reply")]
    Timeout,
    #[error("request cancelled by shutdown")]
    Cancelled,
    #[error("pending reply abandoned")]
    Abandoned,
    #[error("peer unreachable")]
    PeerUnreachable,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Programmer error; fatal to the operation, not to the service.
    #[error("correlation id {0} already in flight")]
    DuplicateCorrelation(String),

    /// Not an error in the receive loop: the envelope is an initial
    /// message, to be routed through the handler table.
    #[error("no pending future for correlation id {0}")]
    UnknownCorrelation(String),
}

struct Pending {
    slot: oneshot::Sender<Result<FutureResult, ReplyError>>,
    created_at: Instant,
}

type Table = Mutex<HashMap<String, Pending>>;

/// Pending request table for one link owner. Each link owner (the server
/// endpoint, each outbound connection) keeps its own registry so link
/// teardown fails exactly the futures that were sent through that link.
#[derive(Default)]
pub struct FutureRegistry {
    table: Arc<Table>,
}

impl FutureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a future under `correlation_id`.
    pub fn insert(&self, correlation_id: String) -> Result<PendingReply, RegistryError> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.contains_key(&correlation_id) {
            return Err(RegistryError::DuplicateCorrelation(correlation_id));
        }
        let (slot, rx) = oneshot::channel();
        table.insert(correlation_id.clone(), Pending { slot, created_at: Instant::now() });
        Ok(PendingReply {
            correlation_id,
            table: Arc::downgrade(&self.table),
            rx: Some(rx),
        })
    }

    /// Resolve the future registered under `correlation_id` and return the
    /// request round-trip time for logging. `UnknownCorrelation` means the
    /// envelope was not a reply.
    pub fn complete(&self, correlation_id: &str, result: FutureResult) -> Result<Duration, RegistryError> {
        let pending = self
            .remove(correlation_id)
            .ok_or_else(|| RegistryError::UnknownCorrelation(correlation_id.to_string()))?;
        let elapsed = pending.created_at.elapsed();
        // Waiter may already be gone; resolution is still consumed.
        let _ = pending.slot.send(Ok(result));
        Ok(elapsed)
    }

    /// Resolve one future with a terminal error.
    pub fn fail(&self, correlation_id: &str, error: ReplyError) -> Result<(), RegistryError> {
        let pending = self
            .remove(correlation_id)
            .ok_or_else(|| RegistryError::UnknownCorrelation(correlation_id.to_string()))?;
        let _ = pending.slot.send(Err(error));
        Ok(())
    }

    /// Remove without completing; the waiter observes `Abandoned`.
    pub fn abandon(&self, correlation_id: &str) -> bool {
        self.remove(correlation_id).is_some()
    }

    /// Resolve every pending future with the same terminal error.
    /// Used at shutdown (`Cancelled`) and link teardown (`PeerUnreachable`).
    pub fn fail_all(&self, error: ReplyError) {
        let drained: Vec<Pending> = {
            let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
            table.drain().map(|(_, p)| p).collect()
        };
        for pending in drained {
            let _ = pending.slot.send(Err(error));
        }
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, correlation_id: &str) -> Option<Pending> {
        self.table
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(correlation_id)
    }
}

/// Caller-held half of a registered future. Dropping it unregisters the
/// entry, so discarded broadcast acks do not accumulate in the table.
pub struct PendingReply {
    correlation_id: String,
    table: Weak<Table>,
    rx: Option<oneshot::Receiver<Result<FutureResult, ReplyError>>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Block until resolution or deadline.
    pub async fn wait(mut self, deadline: Duration) -> Result<FutureResult, ReplyError> {
        let Some(rx) = self.rx.take() else {
            return Err(ReplyError::Abandoned);
        };
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without resolving: abandoned.
            Ok(Err(_)) => Err(ReplyError::Abandoned),
            Err(_) => Err(ReplyError::Timeout),
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.correlation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::generate_correlation_id;

    fn result() -> FutureResult {
        FutureResult { message_type: "gossip/ack".into(), content: vec![1] }
    }

    #[tokio::test]
    async fn complete_resolves_waiter() {
        let registry = FutureRegistry::new();
        let id = generate_correlation_id();
        let reply = registry.insert(id.clone()).unwrap();

        let elapsed = registry.complete(&id, result()).unwrap();
        assert!(elapsed >= Duration::ZERO);

        let got = reply.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(got, result());
        assert!(registry.is_empty());
    }

    #[test]
    fn duplicate_correlation_refused() {
        let registry = FutureRegistry::new();
        let id = generate_correlation_id();
        let _reply = registry.insert(id.clone()).unwrap();
        assert!(matches!(
            registry.insert(id),
            Err(RegistryError::DuplicateCorrelation(_))
        ));
    }

    #[test]
    fn unknown_correlation_signals_initial_message() {
        let registry = FutureRegistry::new();
        assert!(matches!(
            registry.complete("nope", result()),
            Err(RegistryError::UnknownCorrelation(_))
        ));
    }

    #[tokio::test]
    async fn abandon_surfaces_to_waiter() {
        let registry = FutureRegistry::new();
        let id = generate_correlation_id();
        let reply = registry.insert(id.clone()).unwrap();

        assert!(registry.abandon(&id));
        assert_eq!(
            reply.wait(Duration::from_secs(1)).await,
            Err(ReplyError::Abandoned)
        );
    }

    #[tokio::test]
    async fn fail_all_cancels_everything() {
        let registry = FutureRegistry::new();
        let replies: Vec<_> = (0..5)
            .map(|_| registry.insert(generate_correlation_id()).unwrap())
            .collect();

        registry.fail_all(ReplyError::Cancelled);
        assert!(registry.is_empty());
        for reply in replies {
            assert_eq!(
                reply.wait(Duration::from_secs(1)).await,
                Err(ReplyError::Cancelled)
            );
        }
    }

    #[tokio::test]
    async fn wait_times_out() {
        let registry = FutureRegistry::new();
        let reply = registry.insert(generate_correlation_id()).unwrap();
        assert_eq!(
            reply.wait(Duration::from_millis(10)).await,
            Err(ReplyError::Timeout)
        );
    }

    #[test]
    fn dropping_reply_unregisters() {
        let registry = FutureRegistry::new();
        let id = generate_correlation_id();
        let reply = registry.insert(id.clone()).unwrap();
        assert_eq!(registry.len(), 1);
        drop(reply);
        assert!(registry.is_empty());
    }
}
