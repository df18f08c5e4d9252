//! Client-initiated connection to a remote peer.
//!
//! Dials the peer's endpoint, announces the local identity, then runs the
//! register/unregister lifecycle: `gossip/register` with the identity as
//! payload on construction, best-effort `gossip/unregister` on stop.
//! The connection keeps its own [`FutureRegistry`] so a broken link fails
//! exactly the requests that were sent through it.

use crate::future::{FutureRegistry, PendingReply, RegistryError, ReplyError};
use crate::handler::HandlerTable;
use crate::link::{FramedLink, LinkError, LinkSender, ReceiveContext};
use crate::serde_safe;
use crate::types::{
    Envelope, PeerIdentity, PeerRegisterRequest, PeerUnregisterRequest, generate_correlation_id,
    message_type,
};
use crate::wire::{self, WireError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How long the background task waits for the register ack before logging.
const REGISTER_ACK_TIMEOUT: Duration = Duration::from_secs(10);

struct Teardown {
    link: FramedLink,
    reader: JoinHandle<()>,
}

/// An outbound framed link plus its registration lifecycle.
pub struct PeerConnection {
    url: String,
    identity: PeerIdentity,
    futures: Arc<FutureRegistry>,
    sender: LinkSender,
    teardown: Mutex<Option<Teardown>>,
}

impl PeerConnection {
    /// Dial `url`, announce `identity`, and send `gossip/register`.
    /// Unsolicited messages arriving on this link are routed through the
    /// shared `handlers` table, same as server-side links.
    pub async fn connect(
        url: &str,
        identity: PeerIdentity,
        handlers: Arc<HandlerTable>,
    ) -> Result<Self, LinkError> {
        debug!(peer = url, "initiating connection");
        let stream = TcpStream::connect(url).await?;
        let (mut read_half, mut write_half) = stream.into_split();
        wire::write_hello(&mut write_half, &identity).await?;

        let link = FramedLink::start(write_half);
        let futures = Arc::new(FutureRegistry::new());

        let reader = {
            let ctx = ReceiveContext { futures: futures.clone(), handlers };
            let responder = link.sender().responder();
            let futures = futures.clone();
            let peer = url.to_string();
            tokio::spawn(async move {
                match ctx.run(&mut read_half, None, &responder).await {
                    Ok(()) => debug!(peer = %peer, "link closed by remote"),
                    Err(e) => warn!(peer = %peer, error = %e, "link broken"),
                }
                futures.fail_all(ReplyError::PeerUnreachable);
            })
        };

        let connection = Self {
            url: url.to_string(),
            identity: identity.clone(),
            futures,
            sender: link.sender(),
            teardown: Mutex::new(Some(Teardown { link, reader })),
        };

        let payload = serde_safe::to_bytes(&PeerRegisterRequest { identity })
            .map_err(WireError::Malformed)?;
        let ack = connection.send(Envelope::new(
            message_type::REGISTER,
            String::new(),
            payload,
        ))?;
        let peer = connection.url.clone();
        tokio::spawn(async move {
            match ack.wait(REGISTER_ACK_TIMEOUT).await {
                Ok(_) => debug!(peer = %peer, "peer registration acknowledged"),
                Err(e) => warn!(peer = %peer, error = %e, "peer registration not acknowledged"),
            }
        });

        Ok(connection)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Enqueue an envelope and return the future for its reply. A missing
    /// correlation id is assigned here.
    pub fn send(&self, mut envelope: Envelope) -> Result<PendingReply, LinkError> {
        if envelope.correlation_id.is_empty() {
            envelope.correlation_id = generate_correlation_id();
        }
        let reply = self.futures.insert(envelope.correlation_id.clone())?;
        self.sender.send(envelope)?;
        Ok(reply)
    }

    /// Fire-and-forget enqueue. A correlation id is still assigned so the
    /// peer's ack is well-formed, but the future is discarded here.
    pub fn broadcast_send(&self, envelope: Envelope) -> Result<(), LinkError> {
        let _reply = self.send(envelope)?;
        Ok(())
    }

    /// Register a future under a caller-chosen correlation id without
    /// sending anything. The broadcast path uses this to hand futures back
    /// before the fan-out drainer runs.
    pub(crate) fn register_future(&self, correlation_id: String) -> Result<PendingReply, RegistryError> {
        self.futures.insert(correlation_id)
    }

    /// Enqueue an envelope whose future was registered separately.
    pub(crate) fn send_raw(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.sender.send(envelope)
    }

    pub(crate) fn fail_future(&self, correlation_id: &str, error: ReplyError) {
        let _ = self.futures.fail(correlation_id, error);
    }

    /// Best-effort `gossip/unregister`, drain the send queue, tear down.
    /// Remaining futures resolve as `Cancelled`. Idempotent.
    pub async fn stop(&self) {
        let teardown = self.teardown.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(Teardown { link, reader }) = teardown else {
            return;
        };
        debug!(peer = %self.url, "closing peer connection");

        let payload = serde_safe::to_bytes(&PeerUnregisterRequest {
            identity: self.identity.clone(),
        })
        .unwrap_or_default();
        let _ = self.sender.send(Envelope::new(
            message_type::UNREGISTER,
            generate_correlation_id(),
            payload,
        ));

        self.futures.fail_all(ReplyError::Cancelled);
        reader.abort();
        link.close().await;
    }
}
