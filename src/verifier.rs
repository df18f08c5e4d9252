//! Signature-verification stage between the inbound and outbound queues.
//!
//! The stage is specified here; the cryptography is not. A
//! [`PayloadVerifier`] implementation is injected and the stage only
//! enforces the pipeline contract: accepted items move to the outbound
//! queue in arrival order, rejected items are dropped with a log line and
//! never perturb downstream order.

use crate::queue::NotifyQueue;
use crate::types::GossipMessage;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Validates one gossip payload. Implementations live outside this crate;
/// the transport only routes their verdicts.
pub trait PayloadVerifier: Send + Sync {
    fn verify(&self, message: &GossipMessage) -> bool;
}

/// Verifier that accepts everything. For wiring tests and local bring-up.
pub struct AcceptAll;

impl PayloadVerifier for AcceptAll {
    fn verify(&self, _message: &GossipMessage) -> bool {
        true
    }
}

/// Worker consuming the inbound queue and producing onto the outbound
/// queue. Each `put` on the inbound queue wakes it; posting to outbound
/// wakes the dispatcher the same way.
pub struct VerificationStage {
    stop_tx: watch::Sender<bool>,
    worker: JoinHandle<()>,
}

impl VerificationStage {
    pub fn start(
        inbound: Arc<NotifyQueue<GossipMessage>>,
        outbound: Arc<NotifyQueue<GossipMessage>>,
        verifier: Arc<dyn PayloadVerifier>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let worker = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = inbound.pop() => message,
                    _ = stop_rx.changed() => break,
                };
                if verifier.verify(&message) {
                    outbound.put(message);
                } else {
                    warn!(
                        content_type = %message.content_type,
                        "dropping gossip message that failed verification"
                    );
                }
            }
            debug!("verification stage stopped");
        });
        Self { stop_tx, worker }
    }

    /// Cooperative stop: the worker finishes its current item and exits.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.worker.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct RejectOdd;

    impl PayloadVerifier for RejectOdd {
        fn verify(&self, message: &GossipMessage) -> bool {
            message.content.first().is_some_and(|b| b % 2 == 0)
        }
    }

    fn message(byte: u8) -> GossipMessage {
        GossipMessage { content: vec![byte], content_type: "test".into() }
    }

    #[tokio::test]
    async fn verified_items_flow_in_order() {
        let inbound = Arc::new(NotifyQueue::new());
        let outbound = Arc::new(NotifyQueue::new());
        let stage = VerificationStage::start(inbound.clone(), outbound.clone(), Arc::new(AcceptAll));

        for byte in 0..20 {
            inbound.put(message(byte));
        }
        for byte in 0..20 {
            let got = tokio::time::timeout(Duration::from_secs(1), outbound.pop())
                .await
                .expect("pipeline stalled");
            assert_eq!(got.content, vec![byte]);
        }
        stage.stop().await;
    }

    #[tokio::test]
    async fn rejected_items_skipped_without_reordering() {
        let inbound = Arc::new(NotifyQueue::new());
        let outbound = Arc::new(NotifyQueue::new());
        let stage = VerificationStage::start(inbound.clone(), outbound.clone(), Arc::new(RejectOdd));

        for byte in 0..10 {
            inbound.put(message(byte));
        }
        for byte in [0u8, 2, 4, 6, 8] {
            let got = tokio::time::timeout(Duration::from_secs(1), outbound.pop())
                .await
                .expect("pipeline stalled");
            assert_eq!(got.content, vec![byte]);
        }
        stage.stop().await;
        assert!(outbound.is_empty());
    }

    #[tokio::test]
    async fn stop_returns_with_items_queued() {
        let inbound = Arc::new(NotifyQueue::new());
        let outbound = Arc::new(NotifyQueue::new());
        let stage = VerificationStage::start(inbound.clone(), outbound.clone(), Arc::new(AcceptAll));

        inbound.put(message(1));
        tokio::time::timeout(Duration::from_secs(1), stage.stop())
            .await
            .expect("stop did not complete");
    }
}
