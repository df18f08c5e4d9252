//! A single bidirectional framed link.
//!
//! Each established socket gets a writer task draining an ordered queue
//! (send order on one link is wire order) and a reader loop running the
//! shared receive discipline: stamp the sender, try reply correlation,
//! fall through to the handler table. Both the server endpoint and
//! outbound peer connections are built on this module.

use crate::future::{FutureRegistry, FutureResult};
use crate::handler::{HandlerTable, Responder};
use crate::serde_safe::BoundedVec;
use crate::types::{Envelope, EnvelopeList, MAX_ENVELOPES_PER_LIST, PeerIdentity};
use crate::wire::{self, WireError};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Registry(#[from] crate::future::RegistryError),

    /// The link's writer is gone; nothing more can be sent on it.
    #[error("link broken")]
    LinkBroken,
}

enum WriteCmd {
    Envelope(Envelope),
    /// Flush everything queued before this command, then stop the writer.
    Shutdown,
}

/// Cloneable enqueue handle for one link's ordered send queue.
#[derive(Clone)]
pub struct LinkSender {
    tx: mpsc::UnboundedSender<WriteCmd>,
}

impl LinkSender {
    /// Enqueue for asynchronous transmission; returns promptly.
    pub fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.tx
            .send(WriteCmd::Envelope(envelope))
            .map_err(|_| LinkError::LinkBroken)
    }

    /// Responder writing back along this link.
    pub fn responder(&self) -> Responder {
        let tx = self.tx.clone();
        Responder::new(move |envelope| {
            if tx.send(WriteCmd::Envelope(envelope)).is_err() {
                warn!("response dropped, link already closed");
            }
        })
    }

    pub fn same_channel(&self, other: &LinkSender) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Writer half of an established link. [`FramedLink::close`] flushes every
/// envelope enqueued before it, so graceful teardown never truncates the
/// send queue.
pub struct FramedLink {
    sender: LinkSender,
    writer: JoinHandle<()>,
}

impl FramedLink {
    /// Spawn the writer task over the socket's write half.
    pub fn start<W>(mut write_half: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteCmd>();
        let writer = tokio::spawn(async move {
            'outer: while let Some(cmd) = rx.recv().await {
                let first = match cmd {
                    WriteCmd::Envelope(envelope) => envelope,
                    WriteCmd::Shutdown => break,
                };
                // Coalesce whatever is already queued into one list.
                let mut batch = vec![first];
                let mut shutdown = false;
                while batch.len() < MAX_ENVELOPES_PER_LIST {
                    match rx.try_recv() {
                        Ok(WriteCmd::Envelope(envelope)) => batch.push(envelope),
                        Ok(WriteCmd::Shutdown) => {
                            shutdown = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }
                let list = EnvelopeList(BoundedVec::new_unchecked(batch));
                if let Err(e) = wire::write_envelopes(&mut write_half, &list).await {
                    warn!(error = %e, "link write failed, dropping link");
                    break 'outer;
                }
                if shutdown {
                    break 'outer;
                }
            }
        });
        Self { sender: LinkSender { tx }, writer }
    }

    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    /// Drain the send queue, then stop the writer.
    pub async fn close(self) {
        let _ = self.sender.tx.send(WriteCmd::Shutdown);
        let _ = self.writer.await;
    }
}

/// The receive discipline shared by server-side and client-side links.
pub struct ReceiveContext {
    pub futures: Arc<FutureRegistry>,
    pub handlers: Arc<HandlerTable>,
}

impl ReceiveContext {
    /// Read envelopes until the link dies. `stamp` is the announced peer
    /// identity on server-side links; client-side links leave the sender
    /// as the remote wrote it.
    ///
    /// A frame that decodes but carries garbage is dropped with a log line
    /// and the link survives; transport errors and oversized frames end
    /// the loop.
    pub async fn run<R>(
        &self,
        reader: &mut R,
        stamp: Option<&PeerIdentity>,
        responder: &Responder,
    ) -> Result<(), WireError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            let list = match wire::read_envelopes(reader).await {
                Ok(list) => list,
                Err(WireError::Malformed(e)) => {
                    warn!(error = %e, "dropping malformed envelope list");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for mut envelope in list {
                if let Some(identity) = stamp {
                    envelope.sender = identity.clone();
                }
                self.dispatch(envelope, responder);
            }
        }
    }

    /// Reply-vs-initial decision for one envelope: a live future under the
    /// correlation id makes it a reply; anything else goes to a handler.
    pub fn dispatch(&self, envelope: Envelope, responder: &Responder) {
        let result = FutureResult {
            message_type: envelope.message_type.clone(),
            content: envelope.content.to_vec(),
        };
        match self.futures.complete(&envelope.correlation_id, result) {
            Ok(elapsed) => {
                debug!(
                    message_type = %envelope.message_type,
                    round_trip_ms = elapsed.as_millis() as u64,
                    "reply matched"
                );
            }
            Err(_) => {
                self.handlers.get(&envelope.message_type).handle(envelope, responder);
            }
        }
    }
}
